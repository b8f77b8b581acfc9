use crate::*;

use mesh_core::config::TimingConfig;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_discovery_lists_earlier_nodes() {
    let rendezvous = start_rendezvous(TimingConfig::default()).await;
    let a = start_node(&rendezvous).await;
    let b = start_node(&rendezvous).await;
    let c = start_node(&rendezvous).await;

    let registry = rendezvous.service.registry();
    assert_eq!(registry.len(), 3);
    for node in [&a, &b, &c] {
        assert!(registry.contains(node.me()));
    }

    // C dialed both earlier nodes at startup.
    assert!(c.connections().is_connected_to(a.me()));
    assert!(c.connections().is_connected_to(b.me()));
    shutdown_all(&[a, b, c]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_non_joining_node_connects_but_stays_unlisted() {
    let rendezvous = start_rendezvous(TimingConfig::default()).await;
    let a = start_node(&rendezvous).await;

    let mut config = node_config(rendezvous.port);
    config.node.join_bootstrap = false;
    let observer = Node::start(config).await.unwrap();

    assert!(observer.connections().is_connected_to(a.me()));

    // `do_not_join` follows the list request on the same control connection.
    let registry = rendezvous.service.registry().clone();
    let observer_id = observer.me().clone();
    wait_until("observer unlisted", move || !registry.contains(&observer_id))
        .await
        .unwrap();
    assert_eq!(rendezvous.service.registry().snapshot(), vec![a.me().clone()]);

    let a2 = a.clone();
    wait_until("A adopts the observer", move || a2.connections().len() == 1)
        .await
        .unwrap();
    shutdown_all(&[a, observer]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_silent_peer_expires_heartbeating_peer_stays() {
    let timing = TimingConfig {
        peer_timeout_secs: 2,
        sweep_interval_secs: 1,
        ..TimingConfig::default()
    };
    let rendezvous = start_rendezvous(timing).await;

    let mut config = node_config(rendezvous.port);
    config.timing.heartbeat_interval_secs = 1;
    let lively = Node::start(config).await.unwrap();

    // Registers, keeps the control connection open, never heartbeats.
    let silent = Node::listen(node_config(rendezvous.port)).await.unwrap();
    let (_control, _) = silent.discover().await.unwrap();
    assert_eq!(rendezvous.service.registry().len(), 2);

    let registry = rendezvous.service.registry().clone();
    let silent_id = silent.me().clone();
    wait_until("silent peer expires", move || !registry.contains(&silent_id))
        .await
        .unwrap();

    // Outlive a few more timeouts to be sure heartbeats keep it fresh.
    tokio::time::sleep(Duration::from_secs(3)).await;
    assert!(rendezvous.service.registry().contains(lively.me()));
    assert_eq!(rendezvous.service.registry().len(), 1);
    shutdown_all(&[lively, silent]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_leave_removes_registration() {
    let rendezvous = start_rendezvous(TimingConfig::default()).await;
    let a = start_node(&rendezvous).await;
    let b = start_node(&rendezvous).await;
    assert_eq!(rendezvous.service.registry().len(), 2);

    a.leave().await.unwrap();
    let registry = rendezvous.service.registry().clone();
    wait_until("leave applied", move || registry.len() == 1)
        .await
        .unwrap();
    assert!(rendezvous.service.registry().contains(b.me()));

    // A later joiner no longer discovers A.
    let late = Node::listen(node_config(rendezvous.port)).await.unwrap();
    let (_control, peers) = late.discover().await.unwrap();
    assert_eq!(peers, vec![b.me().clone()]);
    shutdown_all(&[a, b, late]);
}

use crate::*;

use mesh_core::config::TimingConfig;
use mesh_core::GossipMessage;

/// Let in-flight relays land before asserting nothing more arrives.
const QUIET: Duration = Duration::from_millis(300);

async fn wait_delivered(nodes: &[Arc<Node>], message: &GossipMessage) {
    for node in nodes {
        let id = message.message_id.clone();
        let node = node.clone();
        wait_until("message delivered", move || node.inbox().deliveries_of(&id) >= 1)
            .await
            .unwrap();
    }
}

fn assert_exactly_once(nodes: &[Arc<Node>], message: &GossipMessage) {
    for node in nodes {
        assert_eq!(
            node.inbox().deliveries_of(&message.message_id),
            1,
            "{} delivered {:?} more than once",
            node.me(),
            message.content
        );
    }
}

/// Every node joins through the rendezvous, so each dials all earlier ones.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_full_mesh_delivers_exactly_once() {
    let rendezvous = start_rendezvous(TimingConfig::default()).await;
    let mut nodes = Vec::new();
    for _ in 0..4 {
        nodes.push(start_node(&rendezvous).await);
    }
    for node in &nodes {
        let node = node.clone();
        wait_until("full mesh", move || node.connections().len() == 3)
            .await
            .unwrap();
    }

    let message = nodes[0].broadcast_message("full mesh hello").await.unwrap();
    wait_delivered(&nodes[1..], &message).await;
    tokio::time::sleep(QUIET).await;

    assert_exactly_once(&nodes[1..], &message);
    assert_eq!(nodes[0].inbox().total(), 0, "originator must not deliver to itself");
    shutdown_all(&nodes);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_ring_delivers_exactly_once() {
    let mut nodes = Vec::new();
    for _ in 0..5 {
        nodes.push(lone_node().await);
    }
    for i in 0..nodes.len() {
        connect(&nodes[i], &nodes[(i + 1) % nodes.len()]).await;
    }
    for node in &nodes {
        assert_eq!(node.connections().len(), 2);
    }

    let message = nodes[2].broadcast_message("around the ring").await.unwrap();
    let others: Vec<_> = nodes
        .iter()
        .enumerate()
        .filter(|(i, _)| *i != 2)
        .map(|(_, n)| n.clone())
        .collect();
    wait_delivered(&others, &message).await;
    tokio::time::sleep(QUIET).await;

    assert_exactly_once(&others, &message);
    assert_eq!(nodes[2].inbox().total(), 0);
    shutdown_all(&nodes);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_broadcasts_are_not_conflated() {
    let rendezvous = start_rendezvous(TimingConfig::default()).await;
    let a = start_node(&rendezvous).await;
    let b = start_node(&rendezvous).await;
    let c = start_node(&rendezvous).await;
    for node in [&a, &b, &c] {
        let node = node.clone();
        wait_until("triangle", move || node.connections().len() == 2)
            .await
            .unwrap();
    }

    let (from_a, from_b) = tokio::join!(a.broadcast_message("one"), b.broadcast_message("two"));
    let (from_a, from_b) = (from_a.unwrap(), from_b.unwrap());
    assert_ne!(from_a.message_id, from_b.message_id);

    wait_delivered(&[b.clone(), c.clone()], &from_a).await;
    wait_delivered(&[a.clone(), c.clone()], &from_b).await;
    tokio::time::sleep(QUIET).await;

    assert_exactly_once(&[b.clone(), c.clone()], &from_a);
    assert_exactly_once(&[a.clone(), c.clone()], &from_b);

    let at_c: Vec<_> = [a.me(), b.me()]
        .iter()
        .flat_map(|id| c.inbox().get(&id.to_string()))
        .map(|m| m.content)
        .collect();
    assert_eq!(at_c.len(), 2);
    assert!(at_c.contains(&"one".to_string()));
    assert!(at_c.contains(&"two".to_string()));
    shutdown_all(&[a, b, c]);
}

/// A discovers nobody, B discovers A, C discovers A and B but only dials A.
/// A's "hello" reaches B and C once each, with no B–C edge to echo it.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_star_scenario() {
    let rendezvous = start_rendezvous(TimingConfig::default()).await;

    let a = Node::listen(node_config(rendezvous.port)).await.unwrap();
    let (_a_ctl, seen_by_a) = a.discover().await.unwrap();
    assert!(seen_by_a.is_empty());

    let b = Node::listen(node_config(rendezvous.port)).await.unwrap();
    let (_b_ctl, seen_by_b) = b.discover().await.unwrap();
    assert_eq!(seen_by_b, vec![a.me().clone()]);
    assert_eq!(b.connect_to_peers(&seen_by_b).await, 1);

    let c = Node::listen(node_config(rendezvous.port)).await.unwrap();
    let (_c_ctl, seen_by_c) = c.discover().await.unwrap();
    assert_eq!(seen_by_c.len(), 2);
    assert!(seen_by_c.contains(a.me()) && seen_by_c.contains(b.me()));
    c.dial(a.me()).await.unwrap();

    {
        let a = a.clone();
        wait_until("A is the hub", move || a.connections().len() == 2)
            .await
            .unwrap();
    }
    assert_eq!(b.connections().len(), 1);
    assert_eq!(c.connections().len(), 1);

    let hello = a.broadcast_message("hello").await.unwrap();
    wait_delivered(&[b.clone(), c.clone()], &hello).await;
    tokio::time::sleep(QUIET).await;

    assert_exactly_once(&[b.clone(), c.clone()], &hello);
    let at_b = b.inbox().get(&a.me().to_string());
    assert_eq!(at_b.len(), 1);
    assert_eq!(at_b[0].content, "hello");
    shutdown_all(&[a, b, c]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_relay_rewrites_last_sender_only() {
    let a = lone_node().await;
    let b = lone_node().await;
    let c = lone_node().await;
    connect(&a, &b).await;
    connect(&b, &c).await;

    let message = a.broadcast_message("via b").await.unwrap();
    wait_delivered(&[c.clone()], &message).await;

    let at_c = c.inbox().get(&a.me().to_string());
    assert_eq!(at_c.len(), 1);
    assert_eq!(at_c[0].originator, a.me().to_string());
    assert_eq!(at_c[0].last_sender, b.me().to_string());
    assert_eq!(at_c[0].message_id, message.message_id);
    shutdown_all(&[a, b, c]);
}

/// A dropped edge only loses that edge: the rest of the mesh keeps working.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_closed_connection_is_discarded() {
    let a = lone_node().await;
    let b = lone_node().await;
    let c = lone_node().await;
    connect(&a, &b).await;
    connect(&a, &c).await;

    b.shutdown();
    {
        let a = a.clone();
        wait_until("A notices B left", move || a.connections().len() == 1)
            .await
            .unwrap();
    }

    let message = a.broadcast_message("still here").await.unwrap();
    wait_delivered(&[c.clone()], &message).await;
    assert_eq!(b.inbox().total(), 0);
    shutdown_all(&[a, c]);
}

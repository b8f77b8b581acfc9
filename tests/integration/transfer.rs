use crate::*;

use bytes::Bytes;
use mesh_core::config::TimingConfig;
use mesh_services::TransferOutcome;

fn patterned(len: usize) -> Bytes {
    (0..len).map(|i| (i % 256) as u8).collect::<Vec<u8>>().into()
}

async fn wait_received(node: &Arc<Node>, count: u64) {
    let node = node.clone();
    wait_until("file received", move || node.transfer().stats().received >= count)
        .await
        .unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_file_arrives_byte_for_byte() {
    let a = lone_node().await;
    let b = lone_node().await;
    connect(&a, &b).await;

    let payload = patterned(1024);
    let reports = a.broadcast_bytes("a-1024.bin", payload.clone()).await;
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].peer, *b.me());
    assert_eq!(*reports[0].result.as_ref().unwrap(), TransferOutcome::Delivered);

    wait_received(&b, 1).await;
    let stored = b.transfer().store().read("a-1024.bin").unwrap().unwrap();
    assert_eq!(stored, payload.to_vec());
    assert!(!b.transfer().readiness().is_busy());
    shutdown_all(&[a, b]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_file_from_disk_via_rendezvous_mesh() {
    let rendezvous = start_rendezvous(TimingConfig::default()).await;
    let a = start_node(&rendezvous).await;
    let b = start_node(&rendezvous).await;
    {
        let a = a.clone();
        wait_until("A adopts B", move || a.connections().len() == 1)
            .await
            .unwrap();
    }

    let source = temp_dir("source");
    std::fs::create_dir_all(&source).unwrap();
    let path = source.join("notes.txt");
    std::fs::write(&path, b"meeting at noon\n").unwrap();

    let (file_id, reports) = a.broadcast_file(&path).await.unwrap();
    assert!(reports.iter().all(|r| r.result.is_ok()));

    wait_received(&b, 1).await;
    let stored = b.transfer().store().read(&file_id).unwrap().unwrap();
    assert_eq!(stored, b"meeting at noon\n");
    shutdown_all(&[a, b]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_busy_receiver_rejects_second_transfer() {
    let a = lone_node().await;
    let b = lone_node().await;
    connect(&a, &b).await;

    // Someone else holds B's readiness.
    assert!(b.transfer().readiness().try_acquire(u64::MAX));

    let reports = a.broadcast_bytes("while-busy", patterned(64)).await;
    assert_eq!(*reports[0].result.as_ref().unwrap(), TransferOutcome::Busy);
    assert_eq!(b.transfer().stats().busy_rejections, 1);
    assert_eq!(b.transfer().store().count(), 0);

    assert!(b.transfer().readiness().release(u64::MAX));
    let retry = a.broadcast_bytes("after-busy", patterned(64)).await;
    assert!(retry[0].result.is_ok());
    wait_received(&b, 1).await;
    shutdown_all(&[a, b]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_repeated_file_id_is_ignored() {
    let a = lone_node().await;
    let b = lone_node().await;
    connect(&a, &b).await;

    a.broadcast_bytes("twice", patterned(300)).await;
    wait_received(&b, 1).await;

    a.broadcast_bytes("twice", patterned(300)).await;
    {
        let b = b.clone();
        wait_until("second copy ignored", move || b.transfer().stats().ignored == 1)
            .await
            .unwrap();
    }
    {
        let b = b.clone();
        wait_until("readiness freed", move || !b.transfer().readiness().is_busy())
            .await
            .unwrap();
    }

    let stats = b.transfer().stats();
    assert_eq!(stats.received, 1);
    assert_eq!(b.transfer().store().count(), 1);
    shutdown_all(&[a, b]);
}

/// A pushes to B and C; each relays to the other, which has either seen the
/// file or is busy with it. Every node ends with exactly one copy, and the
/// originator never stores its own file.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_triangle_relay_stores_once_per_node() {
    let a = lone_node().await;
    let b = lone_node().await;
    let c = lone_node().await;
    connect(&a, &b).await;
    connect(&a, &c).await;
    connect(&b, &c).await;

    let payload = patterned(4096);
    a.broadcast_bytes("triangle.bin", payload.clone()).await;

    wait_received(&b, 1).await;
    wait_received(&c, 1).await;
    // Give relays time to settle.
    tokio::time::sleep(Duration::from_millis(500)).await;

    for node in [&b, &c] {
        assert_eq!(node.transfer().stats().received, 1);
        assert_eq!(node.transfer().store().count(), 1);
        let stored = node.transfer().store().read("triangle.bin").unwrap().unwrap();
        assert_eq!(stored, payload.to_vec());
    }
    assert_eq!(a.transfer().stats().received, 0);
    assert_eq!(a.transfer().store().count(), 0);
    shutdown_all(&[a, b, c]);
}

/// Relaying reaches peers the originator is not connected to.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_line_relay_reaches_far_end() {
    let a = lone_node().await;
    let b = lone_node().await;
    let c = lone_node().await;
    connect(&a, &b).await;
    connect(&b, &c).await;

    a.broadcast_bytes("line.bin", patterned(2048)).await;
    wait_received(&c, 1).await;
    assert!(c.transfer().has_seen("line.bin"));
    shutdown_all(&[a, b, c]);
}

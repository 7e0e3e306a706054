//! Smoke tests for the async shell: NodeRunner + NodeHandle over the
//! in-process transport, including the reliable overlay glue.

use bytes::Bytes;
use std::time::Duration;
use weft::prelude::*;
use weft::reliable::HeartbeatPolicy;

async fn spawn_node(name: &str) -> NodeHandle {
    let (transport, rx) = InprocTransport::bind(name).unwrap();
    let cfg = NodeConfig::default().with_subs_rate(Duration::from_millis(20));
    let node = Node::new(cfg, Box::new(transport)).unwrap();
    let (runner, handle) = NodeRunner::new(node, rx);
    compio::runtime::spawn(runner.run()).detach();
    handle
}

#[compio::test]
async fn publish_subscribe_roundtrip() {
    let a = spawn_node("smoke-a").await;
    let b = spawn_node("smoke-b").await;

    b.link(NodeAddr::Inproc("smoke-a".into())).await.unwrap();

    let (tx, rx) = flume::unbounded::<Vec<u8>>();
    a.subscribe(
        vec!["k/v".into()],
        Box::new(move |_view: &PublicationView, payload: &[u8]| {
            let _ = tx.send(payload.to_vec());
        }),
    )
    .await
    .unwrap();

    // Let the subscription update reach B
    compio::time::sleep(Duration::from_millis(100)).await;

    let publication = b.create_publication().await.unwrap();
    b.init_publication(publication, vec!["k/v".into()], false, vec![], None)
        .await
        .unwrap();
    let seq = b
        .publish(publication, Bytes::from_static(b"value"), 0)
        .await
        .unwrap();
    assert_eq!(seq, 1);

    let got = compio::time::timeout(Duration::from_secs(5), rx.recv_async())
        .await
        .expect("delivery within deadline")
        .unwrap();
    assert_eq!(got, b"value".to_vec());

    a.destroy().await.unwrap();
    b.destroy().await.unwrap();
}

#[compio::test]
async fn destroyed_node_rejects_calls() {
    let a = spawn_node("smoke-destroy").await;
    a.destroy().await.unwrap();
    let err = a.create_publication().await.unwrap_err();
    assert_eq!(err, WeftError::NodeDestroyed);
}

#[compio::test]
async fn reliable_overlay_end_to_end() {
    let a = spawn_node("smoke-rel-a").await;
    let b = spawn_node("smoke-rel-b").await;
    b.link(NodeAddr::Inproc("smoke-rel-a".into())).await.unwrap();

    let policy = QosPolicy {
        depth: 8,
        heartbeat: HeartbeatPolicy::Always,
        heartbeat_period: Duration::from_millis(50),
    };
    let subscriber = ReliableSubscriber::new(&a, vec!["rel/stream".into()], policy.clone())
        .await
        .unwrap();
    compio::time::sleep(Duration::from_millis(100)).await;

    let publisher = ReliablePublisher::new(&b, vec!["rel/stream".into()], policy)
        .await
        .unwrap();

    // The first heartbeat triggers registration; give the exchange a few
    // rounds so delivery starts from the beginning of the stream.
    compio::time::sleep(Duration::from_millis(300)).await;

    for i in 1..=3u8 {
        publisher.publish(Bytes::from(vec![i])).await.unwrap();
        compio::time::sleep(Duration::from_millis(30)).await;
    }

    let mut got = Vec::new();
    let deadline = Duration::from_secs(10);
    while got.len() < 2 {
        let d = compio::time::timeout(deadline, subscriber.recv())
            .await
            .expect("reliable delivery within deadline")
            .unwrap();
        got.push(d.payload[0]);
    }
    // Registration is volatile, so delivery starts at or after the first
    // message sent post-registration and is strictly in order.
    for pair in got.windows(2) {
        assert!(pair[0] < pair[1]);
    }

    publisher.close().await.unwrap();
    subscriber.close().await.unwrap();
    a.destroy().await.unwrap();
    b.destroy().await.unwrap();
}

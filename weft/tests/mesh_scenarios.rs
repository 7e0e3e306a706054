//! End-to-end mesh scenarios over the in-process transport.
//!
//! These tests drive sans-IO `Node`s directly: every transport event is
//! pumped by hand, so multi-node meshes run deterministically with no
//! runtime, no timers and no sleeps.

use flume::Receiver;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;
use weft::prelude::*;
use weft::transport::NetEvent;

/// A delivery observed by a test subscription.
#[derive(Debug, Clone)]
struct Seen {
    pub_id: Uuid,
    seq_num: u32,
    payload: Vec<u8>,
    ticket: AckTicket,
}

type Log = Arc<Mutex<Vec<Seen>>>;

fn log_handler(log: &Log) -> Box<dyn PublicationHandler> {
    let log = log.clone();
    Box::new(move |view: &PublicationView, payload: &[u8]| {
        log.lock().push(Seen {
            pub_id: view.pub_id,
            seq_num: view.seq_num,
            payload: payload.to_vec(),
            ticket: view.ack_ticket(),
        });
    })
}

struct TestNet {
    cells: Vec<(Node, Receiver<NetEvent>)>,
}

impl TestNet {
    /// Spin up `n` nodes named `prefix-0..n`, all with instant
    /// subscription updates.
    fn new(prefix: &str, n: usize) -> Self {
        Self::with_config(prefix, n, |_| {
            NodeConfig::default().with_subs_rate(Duration::ZERO)
        })
    }

    fn with_config(prefix: &str, n: usize, cfg: impl Fn(usize) -> NodeConfig) -> Self {
        let cells = (0..n)
            .map(|i| {
                let (transport, rx) = InprocTransport::bind(&format!("{prefix}-{i}")).unwrap();
                let node = Node::new(cfg(i), Box::new(transport)).unwrap();
                (node, rx)
            })
            .collect();
        Self { cells }
    }

    fn addr(prefix: &str, i: usize) -> NodeAddr {
        NodeAddr::Inproc(format!("{prefix}-{i}"))
    }

    fn node(&mut self, i: usize) -> &mut Node {
        &mut self.cells[i].0
    }

    /// Deliver queued events and run ticks until the mesh quiesces.
    fn pump(&mut self) {
        self.pump_at(Instant::now());
    }

    fn pump_at(&mut self, now: Instant) {
        let mut quiet_rounds = 0;
        for _ in 0..100 {
            let mut activity = false;
            for (node, rx) in &mut self.cells {
                node.on_tick(now);
                while let Ok(ev) = rx.try_recv() {
                    activity = true;
                    node.handle_net(ev);
                }
            }
            if activity {
                quiet_rounds = 0;
            } else {
                quiet_rounds += 1;
                if quiet_rounds >= 3 {
                    return;
                }
            }
        }
        panic!("mesh did not quiesce");
    }
}

fn topics(v: &[&str]) -> Vec<String> {
    v.iter().map(|s| (*s).to_owned()).collect()
}

#[test]
fn publish_reaches_linked_subscriber_once() {
    let mut net = TestNet::new("basic", 2);
    let log: Log = Log::default();

    // B (node 1) links to A (node 0); A subscribes
    net.node(1).link(&TestNet::addr("basic", 0), None).unwrap();
    net.pump();
    net.node(0).subscribe(topics(&["a/b/c"]), log_handler(&log)).unwrap();
    net.pump();

    let publication = net.node(1).create_publication().unwrap();
    let pub_id = net
        .node(1)
        .init_publication(publication, topics(&["a/b/c"]), false, vec![], None)
        .unwrap();
    let seq = net.node(1).publish(publication, &[0xca, 0xfe], 0).unwrap();
    assert_eq!(seq, 1);
    net.pump();

    let seen = log.lock();
    assert_eq!(seen.len(), 1, "exactly one delivery");
    assert_eq!(seen[0].pub_id, pub_id);
    assert_eq!(seen[0].seq_num, 1);
    assert_eq!(seen[0].payload, vec![0xca, 0xfe]);
}

#[test]
fn sequence_numbers_are_monotone_without_gaps() {
    let mut net = TestNet::new("monotone", 2);
    let log: Log = Log::default();

    net.node(1).link(&TestNet::addr("monotone", 0), None).unwrap();
    net.pump();
    net.node(0).subscribe(topics(&["m"]), log_handler(&log)).unwrap();
    net.pump();

    let publication = net.node(1).create_publication().unwrap();
    net.node(1)
        .init_publication(publication, topics(&["m"]), false, vec![], None)
        .unwrap();
    for expected in 1..=5u32 {
        let seq = net.node(1).publish(publication, &[], 0).unwrap();
        assert_eq!(seq, expected);
    }
    net.pump();

    let seqs: Vec<u32> = log.lock().iter().map(|s| s.seq_num).collect();
    assert_eq!(seqs, vec![1, 2, 3, 4, 5]);
}

#[test]
fn wildcards_are_subscription_side_syntax() {
    let mut net = TestNet::new("wildpub", 1);
    let publication = net.node(0).create_publication().unwrap();
    let err = net
        .node(0)
        .init_publication(publication, topics(&["a/+/c"]), false, vec![], None)
        .unwrap_err();
    assert_eq!(err, WeftError::Invalid);

    let publication = net.node(0).create_publication().unwrap();
    let err = net
        .node(0)
        .init_publication(publication, topics(&["a/#"]), false, vec![], None)
        .unwrap_err();
    assert_eq!(err, WeftError::Invalid);

    // Separator-only topics are just as invalid
    let publication = net.node(0).create_publication().unwrap();
    let err = net
        .node(0)
        .init_publication(publication, topics(&["///"]), false, vec![], None)
        .unwrap_err();
    assert_eq!(err, WeftError::Invalid);
}

#[test]
fn chain_forwards_to_the_far_subscriber_exactly_once() {
    let mut net = TestNet::new("chain", 3);
    let c_log: Log = Log::default();
    let b_log: Log = Log::default();

    // A -> B -> C linked chain
    net.node(0).link(&TestNet::addr("chain", 1), None).unwrap();
    net.node(1).link(&TestNet::addr("chain", 2), None).unwrap();
    net.pump();

    // C subscribes; B has no local subscription of its own
    net.node(2).subscribe(topics(&["x"]), log_handler(&c_log)).unwrap();
    net.pump();

    let publication = net.node(0).create_publication().unwrap();
    net.node(0)
        .init_publication(publication, topics(&["x"]), false, vec![], None)
        .unwrap();
    net.node(0).publish(publication, b"P", 0).unwrap();
    net.pump();

    assert_eq!(c_log.lock().len(), 1, "C delivers exactly once");
    assert_eq!(c_log.lock()[0].payload, b"P".to_vec());
    assert!(b_log.lock().is_empty(), "B forwards but does not deliver");
}

#[test]
fn ring_delivers_exactly_once_per_subscriber() {
    let mut net = TestNet::new("ring", 3);
    let logs: Vec<Log> = (0..3).map(|_| Log::default()).collect();

    // Full ring: 0 -> 1 -> 2 -> 0
    net.node(0).link(&TestNet::addr("ring", 1), None).unwrap();
    net.node(1).link(&TestNet::addr("ring", 2), None).unwrap();
    net.node(2).link(&TestNet::addr("ring", 0), None).unwrap();
    net.pump();

    for (i, log) in logs.iter().enumerate() {
        net.node(i).subscribe(topics(&["t"]), log_handler(log)).unwrap();
    }
    net.pump();

    let publication = net.node(0).create_publication().unwrap();
    net.node(0)
        .init_publication(publication, topics(&["t"]), false, vec![], None)
        .unwrap();
    net.node(0).publish(publication, b"ring", 0).unwrap();
    net.pump();

    for (i, log) in logs.iter().enumerate() {
        assert_eq!(
            log.lock().len(),
            1,
            "subscriber {i} must deliver exactly once"
        );
    }
}

#[test]
fn retained_publication_replays_to_late_subscriber() {
    let mut net = TestNet::new("retained", 2);
    let log: Log = Log::default();

    // A publishes retained before anyone is interested
    let publication = net.node(0).create_publication().unwrap();
    let pub_id = net
        .node(0)
        .init_publication(publication, topics(&["news/today"]), false, vec![], None)
        .unwrap();
    net.node(0).publish(publication, b"headline", 60).unwrap();
    net.pump();

    // A late subscriber links in and receives the original send
    net.node(1).link(&TestNet::addr("retained", 0), None).unwrap();
    net.pump();
    net.node(1)
        .subscribe(topics(&["news/today"]), log_handler(&log))
        .unwrap();
    net.pump();

    let seen = log.lock();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].pub_id, pub_id, "original publication identity");
    assert_eq!(seen[0].seq_num, 1, "original sequence number");
    assert_eq!(seen[0].payload, b"headline".to_vec());
}

#[test]
fn expired_retained_publication_does_not_replay() {
    let mut net = TestNet::new("expired", 2);
    let log: Log = Log::default();

    let publication = net.node(0).create_publication().unwrap();
    net.node(0)
        .init_publication(publication, topics(&["news/today"]), false, vec![], None)
        .unwrap();
    net.node(0).publish(publication, b"old", 2).unwrap();

    // Three seconds pass; the retained entry is garbage-collected
    net.pump_at(Instant::now() + Duration::from_secs(3));

    net.node(1).link(&TestNet::addr("expired", 0), None).unwrap();
    net.pump();
    net.node(1)
        .subscribe(topics(&["news/today"]), log_handler(&log))
        .unwrap();
    net.pump();

    assert!(log.lock().is_empty(), "no replay after expiry");
}

#[test]
fn unlink_sends_terminal_interest_clear() {
    let mut net = TestNet::new("unlink", 2);
    let log: Log = Log::default();

    net.node(0).link(&TestNet::addr("unlink", 1), None).unwrap();
    net.pump();
    net.node(0).subscribe(topics(&["u"]), log_handler(&log)).unwrap();
    net.pump();

    let publication = net.node(1).create_publication().unwrap();
    net.node(1)
        .init_publication(publication, topics(&["u"]), false, vec![], None)
        .unwrap();
    net.node(1).publish(publication, b"one", 0).unwrap();
    net.pump();
    assert_eq!(log.lock().len(), 1);

    // After unlink the peer's interest in us is cleared
    net.node(0).unlink(&TestNet::addr("unlink", 1), None).unwrap();
    net.pump();
    net.node(1).publish(publication, b"two", 0).unwrap();
    net.pump();
    assert_eq!(log.lock().len(), 1, "no delivery after unlink");
}

#[test]
fn acknowledgement_routes_back_along_the_chain() {
    let mut net = TestNet::new("ackchain", 3);
    let c_log: Log = Log::default();
    let acks: Arc<Mutex<Vec<(u32, Vec<u8>)>>> = Arc::default();

    net.node(0).link(&TestNet::addr("ackchain", 1), None).unwrap();
    net.node(1).link(&TestNet::addr("ackchain", 2), None).unwrap();
    net.pump();
    net.node(2).subscribe(topics(&["q"]), log_handler(&c_log)).unwrap();
    net.pump();

    let ack_log = acks.clone();
    let ack_handler: Box<dyn AckHandler> = Box::new(
        move |view: &PublicationView, status: Result<()>, payload: &[u8]| {
            assert!(status.is_ok());
            ack_log.lock().push((view.seq_num, payload.to_vec()));
        },
    );
    let publication = net.node(0).create_publication().unwrap();
    net.node(0)
        .init_publication(publication, topics(&["q"]), false, vec![], Some(ack_handler))
        .unwrap();
    net.node(0).publish(publication, b"ping", 0).unwrap();
    net.pump();

    // C acknowledges via the ticket captured at delivery
    let ticket = c_log.lock()[0].ticket.clone();
    net.node(2).ack_publication(&ticket, b"pong").unwrap();
    net.pump();

    let acks = acks.lock();
    assert_eq!(acks.len(), 1, "publisher saw exactly one ack");
    assert_eq!(acks[0], (1, b"pong".to_vec()));
}

#[test]
fn sealed_delivery_respects_per_subscription_permissions() {
    let key = KeyId::from("content-key");
    let key_bytes = vec![0x42u8; 32];

    // Subscriber node: holds the key, and a permission store that only
    // grants SUB for the exact topic set ["t"]
    let keystore = Arc::new(MemoryKeyStore::new());
    keystore.set_content_key(&key, Some(Key::Symmetric(key_bytes.clone())));
    let perms = Arc::new(MemoryPermissionStore::new());
    perms.set_permission(Some(&topics(&["t"])), Some(&key), &[Permission::Sub]);

    let pub_keystore = Arc::new(MemoryKeyStore::new());
    pub_keystore.set_content_key(&key, Some(Key::Symmetric(key_bytes)));

    let perms_cfg = perms.clone();
    let sub_keystore = keystore.clone();
    let mut net = TestNet::with_config("sealed", 2, move |i| {
        let cfg = NodeConfig::default().with_subs_rate(Duration::ZERO);
        if i == 0 {
            cfg.with_keystore(sub_keystore.clone())
                .with_permissions(perms_cfg.clone())
        } else {
            cfg.with_keystore(pub_keystore.clone())
        }
    });

    let allowed_log: Log = Log::default();
    let denied_log: Log = Log::default();

    net.node(1).link(&TestNet::addr("sealed", 0), None).unwrap();
    net.pump();
    // S1 matches and is granted; S2 also matches "t" but its topic set
    // is not covered by the permission entry
    net.node(0).subscribe(topics(&["t"]), log_handler(&allowed_log)).unwrap();
    net.node(0)
        .subscribe(topics(&["t", "u"]), log_handler(&denied_log))
        .unwrap();
    net.pump();

    let publication = net.node(1).create_publication().unwrap();
    net.node(1)
        .init_publication(publication, topics(&["t", "u"]), false, vec![key], None)
        .unwrap();
    net.node(1).publish(publication, b"secret", 0).unwrap();
    net.pump();

    assert_eq!(allowed_log.lock().len(), 1, "granted subscription delivers");
    assert_eq!(allowed_log.lock()[0].payload, b"secret".to_vec());
    assert!(denied_log.lock().is_empty(), "denied subscription does not");
}

#[test]
fn relay_without_key_still_forwards() {
    let key = KeyId::from("e2e");
    let key_bytes = vec![7u8; 32];

    let end_keystore = Arc::new(MemoryKeyStore::new());
    end_keystore.set_content_key(&key, Some(Key::Symmetric(key_bytes)));

    // Node 1 is a pure relay with no key store at all
    let ks = end_keystore.clone();
    let mut net = TestNet::with_config("relay", 3, move |i| {
        let cfg = NodeConfig::default().with_subs_rate(Duration::ZERO);
        if i == 1 {
            cfg
        } else {
            cfg.with_keystore(ks.clone())
        }
    });

    let log: Log = Log::default();
    net.node(0).link(&TestNet::addr("relay", 1), None).unwrap();
    net.node(1).link(&TestNet::addr("relay", 2), None).unwrap();
    net.pump();
    net.node(2).subscribe(topics(&["s"]), log_handler(&log)).unwrap();
    net.pump();

    let publication = net.node(0).create_publication().unwrap();
    net.node(0)
        .init_publication(publication, topics(&["s"]), false, vec![key], None)
        .unwrap();
    net.node(0).publish(publication, b"through", 0).unwrap();
    net.pump();

    let seen = log.lock();
    assert_eq!(seen.len(), 1, "sealed payload crossed the keyless relay");
    assert_eq!(seen[0].payload, b"through".to_vec());
}

//! Reliable-QoS overlay.
//!
//! Rides on top of ordinary publications: a QoS header travels at the
//! front of every payload, acknowledgements carry a missing-set bitmap
//! back, and the publisher re-sends exactly what was lost from a bounded
//! send cache. Delivery to the application is in order: gaps buffer until
//! they close or the publisher gives up (its announced range moving past
//! a sequence number is the give-up signal).
//!
//! The protocol logic lives in two sans-IO state machines, `ReliableTx`
//! and `ReliableRx`; `ReliablePublisher` and `ReliableSubscriber` are thin
//! async shells wiring them to a [`NodeHandle`].
//!
//! Registration runs over the same channel: a subscriber's first contact
//! asks for registration in its acknowledgement; the publisher answers
//! with a `Register` frame naming its current range, and the subscriber
//! starts volatile (new messages only) from there.

use crate::handler::{AckHandler, PublicationHandler};
use crate::publication::{AckTicket, PubHandle, PublicationView};
use crate::runner::NodeHandle;
use crate::subscription::SubHandle;
use bytes::Bytes;
use flume::Receiver;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace, warn};
use uuid::Uuid;
use weft_core::cache::PubCache;
use weft_core::error::{Result, WeftError};
use weft_core::snset::SnSet;
use weft_wire::cbor::{Decoder, Encoder};

/// Default send-cache depth.
pub const DEFAULT_QOS_DEPTH: usize = 8;

/// When a publisher heartbeats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatPolicy {
    /// Heartbeat on every period.
    Always,
    /// Heartbeat only while some message is unacknowledged.
    Unacknowledged,
}

/// Reliability tuning for one publisher or subscriber.
#[derive(Debug, Clone)]
pub struct QosPolicy {
    /// Messages kept for retransmission (and receive buffering).
    pub depth: usize,
    pub heartbeat: HeartbeatPolicy,
    pub heartbeat_period: Duration,
}

impl Default for QosPolicy {
    fn default() -> Self {
        Self {
            depth: DEFAULT_QOS_DEPTH,
            heartbeat: HeartbeatPolicy::Always,
            heartbeat_period: Duration::from_secs(1),
        }
    }
}

/// QoS frame kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum QosKind {
    /// Application data with a sequence number.
    Data = 1,
    /// Range announcement with no data.
    Heartbeat = 2,
    /// Registration answer carrying the range a subscriber starts from.
    Register = 3,
}

impl TryFrom<u8> for QosKind {
    type Error = WeftError;

    fn try_from(v: u8) -> Result<Self> {
        match v {
            1 => Ok(Self::Data),
            2 => Ok(Self::Heartbeat),
            3 => Ok(Self::Register),
            _ => Err(WeftError::Invalid),
        }
    }
}

/// Header prepended to every QoS payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QosHeader {
    pub kind: QosKind,
    /// The publisher's `[min, max]` cached sequence numbers.
    pub range: (u32, u32),
    /// Sequence number; zero for non-data frames.
    pub sn: u32,
}

impl QosHeader {
    /// Encode the header followed by the raw payload bytes.
    #[must_use]
    pub fn encode(&self, payload: &[u8]) -> Bytes {
        let mut e = Encoder::with_capacity(24 + payload.len());
        e.array(4);
        e.uint(self.kind as u64);
        e.uint(u64::from(self.range.0));
        e.uint(u64::from(self.range.1));
        e.uint(u64::from(self.sn));
        e.raw(payload);
        e.finish()
    }

    /// Decode a header, returning it and the trailing payload.
    pub fn decode(buf: &[u8]) -> Result<(Self, Bytes)> {
        let mut d = Decoder::new(buf);
        if d.array()? != 4 {
            return Err(WeftError::Invalid);
        }
        let kind = QosKind::try_from(d.uint8()?)?;
        let range = (d.uint32()?, d.uint32()?);
        let sn = d.uint32()?;
        let payload = Bytes::copy_from_slice(&buf[d.position()..]);
        Ok((Self { kind, range, sn }, payload))
    }
}

/// Acknowledgement body: who is acking plus the missing-set bitmap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QosAck {
    pub subscriber: Uuid,
    pub missing: SnSet,
    /// True when the subscriber asks to be registered.
    pub register: bool,
    pub payload: Bytes,
}

impl QosAck {
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut e = Encoder::with_capacity(40 + self.payload.len());
        e.array(5);
        e.bytes(self.subscriber.as_bytes());
        e.uint(u64::from(self.missing.base()));
        e.uint(self.missing.mask());
        e.boolean(self.register);
        e.bytes(&self.payload);
        e.finish()
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        let mut d = Decoder::new(buf);
        if d.array()? != 5 {
            return Err(WeftError::Invalid);
        }
        let subscriber =
            Uuid::from_slice(d.bytes()?).map_err(|_| WeftError::Invalid)?;
        let base = d.uint32()?;
        let mask = d.uint()?;
        let register = d.boolean()?;
        let payload = Bytes::copy_from_slice(d.bytes()?);
        Ok(Self {
            subscriber,
            missing: SnSet::from_parts(base, mask),
            register,
            payload,
        })
    }
}

/// Publisher-side reliability state machine.
pub struct ReliableTx {
    cache: PubCache<Bytes>,
    policy: QosPolicy,
    sn: u32,
    all_acked: bool,
}

impl ReliableTx {
    #[must_use]
    pub fn new(policy: QosPolicy) -> Self {
        Self {
            cache: PubCache::new(policy.depth),
            policy,
            sn: 0,
            all_acked: true,
        }
    }

    /// Last assigned sequence number.
    #[must_use]
    pub const fn sn(&self) -> u32 {
        self.sn
    }

    /// The advertised `[min, max]` range.
    #[must_use]
    pub fn range(&self) -> (u32, u32) {
        match (self.cache.min_sn(), self.cache.max_sn()) {
            (Some(min), Some(max)) => (min, max),
            _ => (self.sn, self.sn),
        }
    }

    /// Frame a payload for sending; assigns the next sequence number and
    /// caches the payload, evicting the oldest when full.
    pub fn publish(&mut self, payload: Bytes) -> (u32, Bytes) {
        self.sn += 1;
        if self.cache.is_full() {
            self.cache.pop_front();
        }
        self.cache.insert(self.sn, payload.clone());
        self.all_acked = false;
        let header = QosHeader {
            kind: QosKind::Data,
            range: self.range(),
            sn: self.sn,
        };
        (self.sn, header.encode(&payload))
    }

    /// The periodic heartbeat frame, if policy says one is due.
    #[must_use]
    pub fn heartbeat(&self) -> Option<Bytes> {
        if self.policy.heartbeat == HeartbeatPolicy::Unacknowledged && self.all_acked {
            return None;
        }
        let header = QosHeader {
            kind: QosKind::Heartbeat,
            range: self.range(),
            sn: 0,
        };
        Some(header.encode(&[]))
    }

    /// The registration answer for a new subscriber.
    #[must_use]
    pub fn register_ack(&self) -> Bytes {
        QosHeader {
            kind: QosKind::Register,
            range: self.range(),
            sn: 0,
        }
        .encode(&[])
    }

    /// Apply an acknowledgement: returns the frames to re-send, exactly
    /// the cached members of the missing set. Missing sequence numbers
    /// below the cache minimum are gone; the advancing announced range
    /// tells the subscriber to give up on them.
    pub fn on_ack(&mut self, ack: &QosAck) -> Vec<(u32, Bytes)> {
        let range = self.range();
        let resend: Vec<(u32, Bytes)> = ack
            .missing
            .iter_window()
            .filter_map(|sn| {
                self.cache.get(sn).map(|payload| {
                    let header = QosHeader {
                        kind: QosKind::Data,
                        range,
                        sn,
                    };
                    (sn, header.encode(payload))
                })
            })
            .collect();
        self.all_acked = ack.missing.window_is_empty() && ack.missing.base() > self.sn;
        resend
    }

    /// True when the last acknowledgement covered everything sent.
    #[must_use]
    pub const fn all_acked(&self) -> bool {
        self.all_acked
    }
}

/// What a subscriber-side frame produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RxEvent {
    /// In-order delivery to the application.
    Deliver { sn: u32, payload: Bytes },
    /// The publisher gave up on a sequence number; it will never arrive.
    Lost { sn: u32 },
    /// Registration with the publisher is needed.
    RegisterNeeded,
}

/// Registration states of a subscriber's view of one publisher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    Unregistered,
    Registering,
    Registered,
}

/// Subscriber-side reliability state machine (one per publisher).
pub struct ReliableRx {
    subscriber: Uuid,
    cache: PubCache<Bytes>,
    received: SnSet,
    range: (u32, u32),
    next_deliver: u32,
    state: Registration,
}

impl ReliableRx {
    #[must_use]
    pub fn new(subscriber: Uuid, depth: usize) -> Self {
        Self {
            subscriber,
            cache: PubCache::new(depth),
            received: SnSet::with_base(1),
            range: (0, 0),
            next_deliver: 1,
            state: Registration::Unregistered,
        }
    }

    #[must_use]
    pub const fn state(&self) -> Registration {
        self.state
    }

    #[must_use]
    pub const fn subscriber(&self) -> Uuid {
        self.subscriber
    }

    /// Feed one QoS frame; returns events for the application plus the
    /// acknowledgement to send back, if any.
    pub fn on_frame(&mut self, header: QosHeader, payload: Bytes) -> (Vec<RxEvent>, Option<QosAck>) {
        match header.kind {
            QosKind::Register => {
                self.on_register_ack(header.range);
                (Vec::new(), None)
            }
            QosKind::Heartbeat => self.on_range(header.range, None),
            QosKind::Data => self.on_range(header.range, Some((header.sn, payload))),
        }
    }

    /// Registration answer: start volatile just past the publisher's
    /// announced history.
    fn on_register_ack(&mut self, range: (u32, u32)) {
        self.range = range;
        self.received = SnSet::with_base(range.1 + 1);
        self.next_deliver = range.1 + 1;
        self.state = Registration::Registered;
        trace!("[QOS] registered at range [{},{}]", range.0, range.1);
    }

    fn on_range(
        &mut self,
        range: (u32, u32),
        data: Option<(u32, Bytes)>,
    ) -> (Vec<RxEvent>, Option<QosAck>) {
        let mut events = Vec::new();
        match self.state {
            Registration::Unregistered => {
                self.state = Registration::Registering;
                events.push(RxEvent::RegisterNeeded);
                let ack = QosAck {
                    subscriber: self.subscriber,
                    missing: SnSet::with_base(0),
                    register: true,
                    payload: Bytes::new(),
                };
                return (events, Some(ack));
            }
            Registration::Registering => {
                // Waiting for the registration answer
                return (events, None);
            }
            Registration::Registered => {}
        }

        self.range = range;

        // Everything below the announced minimum is settled: deliver what
        // we buffered, surface the rest as lost.
        while self.next_deliver < range.0 {
            let sn = self.next_deliver;
            match self.cache.take_if_front(sn) {
                Some(entry) => events.push(RxEvent::Deliver {
                    sn,
                    payload: entry.data,
                }),
                None => {
                    if !self.received.test(sn) {
                        events.push(RxEvent::Lost { sn });
                    }
                }
            }
            self.next_deliver += 1;
        }
        self.received.shrink(range.0);

        if let Some((sn, payload)) = data {
            if sn == self.next_deliver && !self.received.test(sn) {
                // The head of the window never needs buffer space
                let _ = self.received.set(sn);
                events.push(RxEvent::Deliver { sn, payload });
                self.next_deliver += 1;
            } else if !self.received.test(sn) && sn > self.next_deliver {
                // Hold space for every missing message below this one so
                // a recovered gap can still be buffered
                let mut need = 1usize;
                for n in range.0..sn {
                    if !self.received.test(n) {
                        need += 1;
                    }
                }
                if need <= self.cache.avail() && self.received.set(sn).is_ok() {
                    self.cache.insert(sn, payload);
                } else {
                    // Dropped unrecorded: the publisher will re-send
                    trace!("[QOS] no room for sn {}; dropping", sn);
                }
            }
        }

        // In-order drain
        while let Some(entry) = self.cache.take_if_front(self.next_deliver) {
            events.push(RxEvent::Deliver {
                sn: entry.sn,
                payload: entry.data,
            });
            self.next_deliver += 1;
        }

        let missing = self.received.complement(self.range, self.cache.avail().max(1));
        let ack = QosAck {
            subscriber: self.subscriber,
            missing,
            register: false,
            payload: Bytes::new(),
        };
        (events, Some(ack))
    }
}

/// A publisher with reliable delivery.
pub struct ReliablePublisher {
    node: NodeHandle,
    handle: PubHandle,
    tx: Arc<Mutex<ReliableTx>>,
    _tasks: Vec<compio::runtime::Task<()>>,
}

impl ReliablePublisher {
    /// Create and initialize a reliable publisher on `topics`.
    pub async fn new(node: &NodeHandle, topics: Vec<String>, policy: QosPolicy) -> Result<Self> {
        let handle = node.create_publication().await?;
        let tx = Arc::new(Mutex::new(ReliableTx::new(policy.clone())));
        let (ack_tx, ack_rx) = flume::unbounded::<Bytes>();
        let ack_handler: Box<dyn AckHandler> = Box::new(
            move |_view: &PublicationView, status: Result<()>, payload: &[u8]| {
                if status.is_ok() {
                    let _ = ack_tx.send(Bytes::copy_from_slice(payload));
                } else if let Err(e) = status {
                    debug!("[QOS] negative ack: {}", e);
                }
            },
        );
        node.init_publication(handle, topics, false, Vec::new(), Some(ack_handler))
            .await?;

        let mut tasks = Vec::new();
        tasks.push(compio::runtime::spawn(ack_pump(
            node.clone(),
            handle,
            tx.clone(),
            ack_rx,
        )));
        tasks.push(compio::runtime::spawn(heartbeat_pump(
            node.clone(),
            handle,
            tx.clone(),
            policy.heartbeat_period,
        )));

        Ok(Self {
            node: node.clone(),
            handle,
            tx,
            _tasks: tasks,
        })
    }

    /// Publish one payload reliably; resolves to its QoS sequence number.
    pub async fn publish(&self, payload: Bytes) -> Result<u32> {
        let (sn, frame) = self.tx.lock().publish(payload);
        self.node.publish(self.handle, frame, 0).await?;
        Ok(sn)
    }

    /// True when every sent message has been acknowledged.
    #[must_use]
    pub fn all_acked(&self) -> bool {
        self.tx.lock().all_acked()
    }

    /// Tear the publisher down.
    pub async fn close(self) -> Result<()> {
        self.node.destroy_publication(self.handle).await
    }
}

async fn ack_pump(
    node: NodeHandle,
    handle: PubHandle,
    tx: Arc<Mutex<ReliableTx>>,
    ack_rx: Receiver<Bytes>,
) {
    while let Ok(bytes) = ack_rx.recv_async().await {
        let ack = match QosAck::decode(&bytes) {
            Ok(ack) => ack,
            Err(e) => {
                warn!("[QOS] bad ack: {}", e);
                continue;
            }
        };
        let (register_frame, resend) = {
            let mut guard = tx.lock();
            let register = ack.register.then(|| guard.register_ack());
            let resend = if ack.register {
                Vec::new()
            } else {
                guard.on_ack(&ack)
            };
            (register, resend)
        };
        if let Some(frame) = register_frame {
            trace!("[QOS] registering subscriber {}", ack.subscriber);
            if node.publish(handle, frame, 0).await.is_err() {
                break;
            }
        }
        for (sn, frame) in resend {
            trace!("[QOS] retransmit sn {}", sn);
            if node.publish(handle, frame, 0).await.is_err() {
                break;
            }
        }
    }
}

async fn heartbeat_pump(
    node: NodeHandle,
    handle: PubHandle,
    tx: Arc<Mutex<ReliableTx>>,
    period: Duration,
) {
    loop {
        compio::time::sleep(period).await;
        let frame = tx.lock().heartbeat();
        if let Some(frame) = frame {
            if node.publish(handle, frame, 0).await.is_err() {
                break;
            }
        }
    }
}

/// One delivered (in-order) reliable message.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub sn: u32,
    pub payload: Bytes,
}

/// A subscriber with reliable in-order delivery.
pub struct ReliableSubscriber {
    node: NodeHandle,
    handle: SubHandle,
    deliveries: Receiver<Delivery>,
    losses: Receiver<u32>,
    _tasks: Vec<compio::runtime::Task<()>>,
}

impl ReliableSubscriber {
    /// Create a reliable subscriber on `topics`.
    ///
    /// Start subscribers before their publishers publish: registration is
    /// volatile, so history from before the first contact is skipped.
    pub async fn new(node: &NodeHandle, topics: Vec<String>, policy: QosPolicy) -> Result<Self> {
        let uuid = Uuid::new_v4();
        let rx = Arc::new(Mutex::new(ReliableRx::new(uuid, policy.depth)));
        let (deliver_tx, deliver_rx) = flume::unbounded();
        let (loss_tx, loss_rx) = flume::unbounded();
        let (ack_req_tx, ack_req_rx) = flume::unbounded::<(AckTicket, Bytes)>();

        let handler_rx = rx.clone();
        let handler: Box<dyn PublicationHandler> = Box::new(
            move |view: &PublicationView, payload: &[u8]| {
                let Ok((header, body)) = QosHeader::decode(payload) else {
                    warn!("[QOS] non-QoS payload on reliable subscription");
                    return;
                };
                let (events, ack) = handler_rx.lock().on_frame(header, body);
                for ev in events {
                    match ev {
                        RxEvent::Deliver { sn, payload } => {
                            let _ = deliver_tx.send(Delivery { sn, payload });
                        }
                        RxEvent::Lost { sn } => {
                            let _ = loss_tx.send(sn);
                        }
                        RxEvent::RegisterNeeded => {
                            trace!("[QOS] requesting registration");
                        }
                    }
                }
                if let Some(ack) = ack {
                    let _ = ack_req_tx.send((view.ack_ticket(), ack.encode()));
                }
            },
        );
        let handle = node.subscribe(topics, handler).await?;

        let tasks = vec![compio::runtime::spawn(ack_sender(
            node.clone(),
            ack_req_rx,
        ))];

        Ok(Self {
            node: node.clone(),
            handle,
            deliveries: deliver_rx,
            losses: loss_rx,
            _tasks: tasks,
        })
    }

    /// Await the next in-order delivery.
    pub async fn recv(&self) -> Result<Delivery> {
        self.deliveries
            .recv_async()
            .await
            .map_err(|_| WeftError::NodeDestroyed)
    }

    /// Take a delivery if one is ready.
    #[must_use]
    pub fn try_recv(&self) -> Option<Delivery> {
        self.deliveries.try_recv().ok()
    }

    /// Take a surfaced loss if one is ready.
    #[must_use]
    pub fn try_recv_loss(&self) -> Option<u32> {
        self.losses.try_recv().ok()
    }

    /// Tear the subscriber down.
    pub async fn close(self) -> Result<()> {
        self.node.unsubscribe(self.handle).await
    }
}

async fn ack_sender(node: NodeHandle, ack_req_rx: Receiver<(AckTicket, Bytes)>) {
    while let Ok((ticket, bytes)) = ack_req_rx.recv_async().await {
        if let Err(e) = node.ack_publication(ticket, bytes).await {
            debug!("[QOS] ack send failed: {}", e);
        }
    }
}

//! The node: single writer of all pub/sub mesh state.
//!
//! `Node` is a sans-IO state machine in the same spirit as the wire
//! decoders: the runner (or a test pump) feeds it commands, network events
//! and clock ticks, and it mutates its tables and calls into the transport.
//! Every publication, subscription, remote and aggregate vector lives here,
//! so there is exactly one mutating task per node and no locks on the
//! message path.
//!
//! Responsibilities:
//! - Own the publication/subscription slabs, remote ring, `CountVector`
//!   aggregates and history
//! - Decode inbound envelopes and dispatch by message type
//! - Drive timer work (subscription updates, expiries, relinks) from
//!   `on_tick`
//!
//! The publication engine, subscription engine and mesh router are
//! implemented as `impl Node` blocks in their own modules.

use crate::addr::NodeAddr;
use crate::keystore::KeyStore;
use crate::mesh::RemoteTable;
use crate::permission::{Permission, PermissionStore};
use crate::publication::PublicationState;
use crate::subscription::SubscriptionState;
use crate::transport::{NetEvent, Transport};
use hashbrown::HashMap;
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};
use uuid::Uuid;
use weft_core::countvec::CountVector;
use weft_core::error::{Result, WeftError};
use weft_core::history::History;
use weft_core::keyid::KeyId;
use weft_core::topic::TopicSpace;
use weft_wire::frame::{Envelope, MsgType};
use weft_wire::seal::{ChaChaSeal, SealCodec};

/// Default maximum rate (in ms) of outbound subscription updates.
pub const SUBSCRIPTION_UPDATE_RATE_MS: u64 = 1000;

/// Node configuration.
///
/// Vector shapes and separators must agree across a mesh; the rest is
/// per-node tuning.
#[derive(Clone)]
pub struct NodeConfig {
    /// Topic separator characters.
    pub separators: String,
    /// Interest vector bit length.
    pub bit_len: usize,
    /// Hash positions per entry.
    pub hashes: usize,
    /// Needs vector bit length.
    pub needs_len: usize,
    /// Minimum delay between subscription updates to one peer.
    pub subs_rate: Duration,
    /// Publications remembered for dedup and ack routing.
    pub history_capacity: usize,
    /// How long a history entry stays alive.
    pub history_hold: Duration,
    /// Idle lifetime of remotes we did not explicitly link.
    pub remote_expiry: Duration,
    /// First relink delay after a linked peer drops.
    pub relink_base: Duration,
    /// Relink backoff ceiling.
    pub relink_max: Duration,
    /// Key store for sealed payloads, if any.
    pub keystore: Option<Arc<dyn KeyStore>>,
    /// Permission store; absent means allow-all.
    pub permissions: Option<Arc<dyn PermissionStore>>,
    /// Seal codec for encrypted publications.
    pub seal: Arc<dyn SealCodec>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            separators: "/".to_owned(),
            bit_len: weft_core::bitvec::DEFAULT_BIT_LEN,
            hashes: weft_core::bitvec::DEFAULT_HASHES,
            needs_len: weft_core::topic::DEFAULT_NEEDS_BIT_LEN,
            subs_rate: Duration::from_millis(SUBSCRIPTION_UPDATE_RATE_MS),
            history_capacity: weft_core::history::DEFAULT_HISTORY_CAPACITY,
            history_hold: Duration::from_secs(10),
            remote_expiry: Duration::from_secs(300),
            relink_base: Duration::from_millis(200),
            relink_max: Duration::from_secs(30),
            keystore: None,
            permissions: None,
            seal: Arc::new(ChaChaSeal),
        }
    }
}

impl NodeConfig {
    #[must_use]
    pub fn with_separators(mut self, separators: &str) -> Self {
        self.separators = separators.to_owned();
        self
    }

    #[must_use]
    pub fn with_subs_rate(mut self, rate: Duration) -> Self {
        self.subs_rate = rate;
        self
    }

    #[must_use]
    pub fn with_keystore(mut self, keystore: Arc<dyn KeyStore>) -> Self {
        self.keystore = Some(keystore);
        self
    }

    #[must_use]
    pub fn with_permissions(mut self, permissions: Arc<dyn PermissionStore>) -> Self {
        self.permissions = Some(permissions);
        self
    }

    #[must_use]
    pub fn with_seal(mut self, seal: Arc<dyn SealCodec>) -> Self {
        self.seal = seal;
        self
    }
}

/// A local pub/sub mesh node.
pub struct Node {
    pub(crate) cfg: NodeConfig,
    pub(crate) space: TopicSpace,
    pub(crate) mesh_id: Uuid,
    pub(crate) rng: StdRng,
    pub(crate) transport: Box<dyn Transport>,
    pub(crate) interests: CountVector,
    pub(crate) needs: CountVector,
    pub(crate) history: History<NodeAddr>,
    pub(crate) pubs: HashMap<u32, PublicationState>,
    pub(crate) next_pub: u32,
    pub(crate) subs: HashMap<u32, SubscriptionState>,
    pub(crate) next_sub: u32,
    pub(crate) remotes: RemoteTable,
    pub(crate) destroying: bool,
    pub(crate) next_sweep: Instant,
}

impl Node {
    /// Create a node over a started transport.
    pub fn new(cfg: NodeConfig, transport: Box<dyn Transport>) -> Result<Self> {
        let space = TopicSpace::with_params(&cfg.separators, cfg.bit_len, cfg.hashes, cfg.needs_len)?;
        let interests = CountVector::with_params(cfg.bit_len, cfg.hashes)?;
        let needs = CountVector::with_params(cfg.needs_len, cfg.hashes)?;
        let history = History::new(cfg.history_capacity);
        let mut rng = StdRng::from_entropy();
        let mesh_id = random_uuid(&mut rng);
        debug!("[NODE] created, mesh id {}", mesh_id);
        Ok(Self {
            cfg,
            space,
            mesh_id,
            rng,
            transport,
            interests,
            needs,
            history,
            pubs: HashMap::new(),
            next_pub: 1,
            subs: HashMap::new(),
            next_sub: 1,
            remotes: RemoteTable::new(),
            destroying: false,
            next_sweep: Instant::now(),
        })
    }

    /// The address peers can reach this node at.
    #[must_use]
    pub fn local_addr(&self) -> NodeAddr {
        self.transport.local_addr()
    }

    /// The current mesh identity.
    #[must_use]
    pub const fn mesh_id(&self) -> Uuid {
        self.mesh_id
    }

    /// Listen port advertised in outgoing headers.
    pub(crate) fn listen_port(&self) -> u16 {
        self.transport.local_addr().port()
    }

    /// Generate a UUID from this node's own entropy stream.
    pub(crate) fn generate_uuid(&mut self) -> Uuid {
        random_uuid(&mut self.rng)
    }

    /// Permission gate; a node without a store allows everything.
    pub(crate) fn allowed(
        &self,
        perm: Permission,
        topics: &[String],
        end_to_end: Option<&KeyId>,
    ) -> bool {
        match &self.cfg.permissions {
            None => true,
            Some(store) => store.allow(None, end_to_end, perm, topics),
        }
    }

    /// Feed one transport event.
    pub fn handle_net(&mut self, ev: NetEvent) {
        match ev {
            NetEvent::Received { from, bytes } => {
                if self.destroying {
                    return;
                }
                match self.dispatch_message(&from, &bytes) {
                    Ok(()) => {}
                    Err(e) if e.is_recoverable() => {
                        // Stale publications and short reads are normal
                        trace!("[NODE] recovered {} from {}", e, from);
                    }
                    Err(e) => {
                        warn!("[NODE] dropped message from {}: {}", from, e);
                    }
                }
            }
            NetEvent::SendComplete { to, status } => {
                if let Err(e) = status {
                    debug!("[NODE] send to {} completed with {}", to, e);
                }
            }
            NetEvent::Connected { addr } => self.on_connected(&addr),
            NetEvent::ConnectFailed { addr, error } => self.on_connect_failed(&addr, error),
            NetEvent::PeerClosed { addr, error } => self.on_peer_closed(&addr, error),
        }
    }

    fn dispatch_message(&mut self, from: &NodeAddr, bytes: &[u8]) -> Result<()> {
        let env = Envelope::decode(bytes)?;
        match env.msg_type {
            MsgType::Pub => self.on_pub(from, bytes, &env),
            MsgType::Sub => self.on_sub(from, &env),
            MsgType::Sak => self.on_sak(from, &env),
            MsgType::Ack => self.on_ack(from, bytes, &env),
        }
    }

    /// Run all due timer work.
    pub fn on_tick(&mut self, now: Instant) {
        if self.destroying {
            return;
        }
        self.mesh_tick(now);
        if now >= self.next_sweep {
            self.history.sweep(now);
            self.expire_publications(now);
            self.next_sweep = now + Duration::from_millis(500);
        }
    }

    /// The next instant timer work comes due.
    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        let mut deadline = Some(self.next_sweep);
        if let Some(mesh) = self.mesh_deadline() {
            deadline = Some(deadline.map_or(mesh, |d| d.min(mesh)));
        }
        deadline
    }

    /// Begin asynchronous destruction: stop accepting work, fail pending
    /// completions, close transports and free the tables.
    pub fn destroy(&mut self) {
        if self.destroying {
            return;
        }
        self.destroying = true;
        debug!("[NODE] destroying");
        self.fail_pending_completions(WeftError::NodeDestroyed);
        self.transport.shutdown();
        self.pubs.clear();
        self.subs.clear();
        self.remotes.clear();
    }

    /// True once `destroy` ran.
    #[must_use]
    pub const fn is_destroying(&self) -> bool {
        self.destroying
    }
}

pub(crate) fn random_uuid(rng: &mut StdRng) -> Uuid {
    let mut bytes = [0u8; 16];
    rng.fill_bytes(&mut bytes);
    uuid::Builder::from_random_bytes(bytes).into_uuid()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::InprocTransport;

    #[test]
    fn independent_uuid_streams() {
        let (ta, _ra) = InprocTransport::bind("node-uuid-a").unwrap();
        let (tb, _rb) = InprocTransport::bind("node-uuid-b").unwrap();
        let mut a = Node::new(NodeConfig::default(), Box::new(ta)).unwrap();
        let mut b = Node::new(NodeConfig::default(), Box::new(tb)).unwrap();
        assert_ne!(a.mesh_id(), b.mesh_id());
        assert_ne!(a.generate_uuid(), b.generate_uuid());
    }

    #[test]
    fn destroy_is_idempotent_and_stops_intake() {
        let (t, _rx) = InprocTransport::bind("node-destroy").unwrap();
        let mut n = Node::new(NodeConfig::default(), Box::new(t)).unwrap();
        n.destroy();
        assert!(n.is_destroying());
        n.destroy();
        // Events after destroy are ignored
        n.handle_net(NetEvent::Received {
            from: NodeAddr::Inproc("x".into()),
            bytes: bytes::Bytes::from_static(b"junk"),
        });
    }
}

//! Mesh router: remote-node ring, interest propagation, link lifecycle.
//!
//! Remotes live in an arena; the ring is a pair of `(prev, next)` index
//! fields, so no remote owns a reference to another. The router is the
//! single writer of the node's outbound subscription state:
//! - inbound SUBs replace or delta-patch a remote's advertised vectors and
//!   re-balance the node's `CountVector` aggregates
//! - outbound summaries are recomputed per peer as
//!   `union(all interests) AND NOT peer's own`, coalesced, and sent at
//!   most once per `subs_rate` per peer
//! - a SUB carrying our own mesh id is a loop: the remote is muted and the
//!   mesh id is regenerated on the next topology change so stale mute
//!   entries age out
//! - linked peers that drop are re-dialed with exponential backoff

use crate::addr::NodeAddr;
use crate::node::Node;
use crate::transport::NetEvent;
use smallvec::SmallVec;
use std::time::Instant;
use tracing::{debug, trace, warn};
use uuid::Uuid;
use weft_core::bitvec::BitVector;
use weft_core::error::{Result, WeftError};
use weft_wire::frame::{Envelope, MsgType, UnprotectedHeader};
use weft_wire::msg::{SakMessage, SubMessage};

/// Index of a remote in the arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RemoteId(pub u32);

const NO_SLOT: u32 = u32::MAX;

/// State received from a remote.
#[derive(Debug, Clone)]
pub(crate) struct InboundState {
    /// Next receive must be a full vector, not a delta.
    pub sync_requested: bool,
    pub interests: BitVector,
    pub needs: BitVector,
    /// Last SUB sequence number accepted.
    pub seq: u32,
}

/// State sent toward a remote.
#[derive(Debug, Clone)]
pub(crate) struct OutboundState {
    /// Next send must be a full vector.
    pub sync: bool,
    /// There may be updated interests to send.
    pub check_for_updates: bool,
    pub interests: BitVector,
    pub needs: BitVector,
    pub seq: u32,
    pub acked_seq: u32,
    pub last_update: Option<Instant>,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct Relink {
    pub attempt: u32,
    pub due: Instant,
}

/// A peer known to this node.
pub(crate) struct Remote {
    pub addr: NodeAddr,
    /// True when this node explicitly linked to the peer.
    pub linked: bool,
    /// True when the peer was identified as a mesh loop.
    pub muted: bool,
    /// True while this remote's inbound vectors are counted in the
    /// node aggregates.
    pub contributed: bool,
    pub mesh_id: Option<Uuid>,
    pub inbound: InboundState,
    pub outbound: OutboundState,
    /// Expiry for remotes learned from traffic rather than linked.
    pub expires: Option<Instant>,
    /// Pending link/unlink completion.
    pub completion: Option<flume::Sender<Result<()>>>,
    pub relink: Option<Relink>,
    prev: u32,
    next: u32,
}

impl Remote {
    fn new(addr: NodeAddr, linked: bool, interests: BitVector, needs: BitVector) -> Self {
        Self {
            addr,
            linked,
            muted: false,
            contributed: false,
            mesh_id: None,
            inbound: InboundState {
                sync_requested: true,
                interests: interests.clone(),
                needs: needs.clone(),
                seq: 0,
            },
            outbound: OutboundState {
                sync: true,
                check_for_updates: true,
                interests,
                needs,
                seq: 0,
                acked_seq: 0,
                last_update: None,
            },
            expires: None,
            completion: None,
            relink: None,
            prev: NO_SLOT,
            next: NO_SLOT,
        }
    }
}

/// Arena of remotes threaded into a doubly-linked ring.
#[derive(Default)]
pub(crate) struct RemoteTable {
    slots: Vec<Option<Remote>>,
    free: Vec<u32>,
    head: Option<u32>,
    count: usize,
}

impl RemoteTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn get(&self, id: RemoteId) -> Option<&Remote> {
        self.slots.get(id.0 as usize).and_then(Option::as_ref)
    }

    pub fn get_mut(&mut self, id: RemoteId) -> Option<&mut Remote> {
        self.slots.get_mut(id.0 as usize).and_then(Option::as_mut)
    }

    pub fn find_addr(&self, addr: &NodeAddr) -> Option<RemoteId> {
        self.iter_ids()
            .into_iter()
            .find(|id| self.get(*id).is_some_and(|r| &r.addr == addr))
    }

    /// Splice a remote into the ring (at the tail, before the head).
    pub fn insert(&mut self, mut remote: Remote) -> RemoteId {
        let idx = match self.free.pop() {
            Some(idx) => idx,
            None => {
                self.slots.push(None);
                (self.slots.len() - 1) as u32
            }
        };
        match self.head {
            None => {
                remote.prev = idx;
                remote.next = idx;
                self.head = Some(idx);
            }
            Some(head) => {
                let tail = self.slots[head as usize]
                    .as_ref()
                    .expect("head slot occupied")
                    .prev;
                remote.prev = tail;
                remote.next = head;
                self.slots[tail as usize]
                    .as_mut()
                    .expect("tail slot occupied")
                    .next = idx;
                self.slots[head as usize]
                    .as_mut()
                    .expect("head slot occupied")
                    .prev = idx;
            }
        }
        self.slots[idx as usize] = Some(remote);
        self.count += 1;
        RemoteId(idx)
    }

    /// Unsplice and return a remote.
    pub fn remove(&mut self, id: RemoteId) -> Option<Remote> {
        let remote = self.slots.get_mut(id.0 as usize)?.take()?;
        self.count -= 1;
        self.free.push(id.0);
        if remote.next == id.0 {
            self.head = None;
        } else {
            self.slots[remote.prev as usize]
                .as_mut()
                .expect("prev slot occupied")
                .next = remote.next;
            self.slots[remote.next as usize]
                .as_mut()
                .expect("next slot occupied")
                .prev = remote.prev;
            if self.head == Some(id.0) {
                self.head = Some(remote.next);
            }
        }
        Some(remote)
    }

    /// Ids in ring order starting at the head.
    pub fn iter_ids(&self) -> SmallVec<[RemoteId; 8]> {
        let mut out = SmallVec::new();
        let Some(head) = self.head else {
            return out;
        };
        let mut idx = head;
        loop {
            out.push(RemoteId(idx));
            idx = self.slots[idx as usize]
                .as_ref()
                .expect("ring slot occupied")
                .next;
            if idx == head {
                break;
            }
        }
        out
    }

    pub fn clear(&mut self) {
        self.slots.clear();
        self.free.clear();
        self.head = None;
        self.count = 0;
    }
}

impl Node {
    /// Decode an interest vector against this node's shape.
    pub(crate) fn decode_interests(&self, buf: &[u8]) -> Result<BitVector> {
        let v = BitVector::decode_with_hashes(buf, self.cfg.hashes)?;
        if v.bit_len() != self.cfg.bit_len {
            return Err(WeftError::Invalid);
        }
        Ok(v)
    }

    /// Decode a needs vector against this node's shape.
    pub(crate) fn decode_needs_vec(&self, buf: &[u8]) -> Result<BitVector> {
        let v = BitVector::decode_with_hashes(buf, self.cfg.hashes)?;
        if v.bit_len() != self.cfg.needs_len {
            return Err(WeftError::Invalid);
        }
        Ok(v)
    }

    /// Link this node to a remote peer.
    ///
    /// Completes (through `completion`) when the transport reports the
    /// connection established.
    pub fn link(
        &mut self,
        addr: &NodeAddr,
        completion: Option<flume::Sender<Result<()>>>,
    ) -> Result<()> {
        if self.destroying {
            return Err(WeftError::NodeDestroyed);
        }
        let (id, created) = match self.remotes.find_addr(addr) {
            Some(id) => {
                let remote = self.remotes.get_mut(id).expect("remote exists");
                if remote.linked {
                    return Err(WeftError::Exists);
                }
                // Upgrade a learned remote to a linked one
                remote.linked = true;
                remote.expires = None;
                remote.outbound.sync = true;
                remote.completion = completion;
                (id, false)
            }
            None => {
                let mut remote = Remote::new(
                    addr.clone(),
                    true,
                    self.space.interest_vector(),
                    self.space.needs_vector(),
                );
                remote.completion = completion;
                (self.remotes.insert(remote), true)
            }
        };
        debug!("[MESH] linking {}", addr);
        if let Err(e) = self.transport.connect(addr) {
            // The completion will never fire; undo and report now
            if created {
                self.remotes.remove(id);
            } else if let Some(remote) = self.remotes.get_mut(id) {
                remote.completion = None;
                remote.linked = false;
            }
            return Err(e);
        }
        self.regenerate_mesh_id();
        Ok(())
    }

    /// Unlink from a remote peer.
    ///
    /// Sends a terminal SUB with an empty interest vector so the peer
    /// stops forwarding immediately, then releases the connection.
    pub fn unlink(
        &mut self,
        addr: &NodeAddr,
        completion: Option<flume::Sender<Result<()>>>,
    ) -> Result<()> {
        if self.destroying {
            return Err(WeftError::NodeDestroyed);
        }
        let id = self.remotes.find_addr(addr).ok_or(WeftError::Missing)?;
        self.subtract_contribution(id);
        let seq = {
            let remote = self.remotes.get_mut(id).expect("remote exists");
            remote.outbound.seq += 1;
            remote.outbound.seq
        };
        let msg = SubMessage {
            mesh_id: self.mesh_id,
            seq,
            sync: true,
            delta: false,
            interests: self.space.interest_vector().encode(),
            needs: self.space.needs_vector().encode(),
            muted: Vec::new(),
        };
        let frame = self.sub_envelope(&msg);
        let _ = self.transport.send(addr, frame);
        self.remotes.remove(id);
        self.transport.disconnect(addr);
        self.regenerate_mesh_id();
        debug!("[MESH] unlinked {}", addr);
        if let Some(c) = completion {
            let _ = c.send(Ok(()));
        }
        Ok(())
    }

    pub(crate) fn on_connected(&mut self, addr: &NodeAddr) {
        let Some(id) = self.remotes.find_addr(addr) else {
            return;
        };
        let completion = {
            let remote = self.remotes.get_mut(id).expect("remote exists");
            remote.relink = None;
            remote.outbound.sync = true;
            remote.completion.take()
        };
        if let Some(c) = completion {
            let _ = c.send(Ok(()));
        }
        debug!("[MESH] connected to {}", addr);
        // First exchange is a full summary, sent immediately
        self.send_sub_update(id, Instant::now(), true);
    }

    pub(crate) fn on_connect_failed(&mut self, addr: &NodeAddr, error: WeftError) {
        let Some(id) = self.remotes.find_addr(addr) else {
            return;
        };
        let (completion, relinking, linked) = {
            let remote = self.remotes.get_mut(id).expect("remote exists");
            (remote.completion.take(), remote.relink.is_some(), remote.linked)
        };
        if let Some(c) = completion {
            let _ = c.send(Err(error));
        }
        if linked && relinking {
            self.schedule_relink(id);
        } else {
            warn!("[MESH] link {} failed: {}", addr, error);
            self.subtract_contribution(id);
            self.remotes.remove(id);
        }
    }

    pub(crate) fn on_peer_closed(&mut self, addr: &NodeAddr, error: WeftError) {
        let Some(id) = self.remotes.find_addr(addr) else {
            return;
        };
        self.subtract_contribution(id);
        let linked = self.remotes.get(id).expect("remote exists").linked;
        if linked {
            debug!("[MESH] linked peer {} closed ({}); scheduling relink", addr, error);
            {
                let remote = self.remotes.get_mut(id).expect("remote exists");
                remote.outbound.sync = true;
                remote.inbound.sync_requested = true;
            }
            self.schedule_relink(id);
        } else {
            trace!("[MESH] peer {} closed ({})", addr, error);
            self.remotes.remove(id);
            self.regenerate_mesh_id();
        }
    }

    fn schedule_relink(&mut self, id: RemoteId) {
        let base = self.cfg.relink_base;
        let max = self.cfg.relink_max;
        let remote = self.remotes.get_mut(id).expect("remote exists");
        let attempt = remote.relink.map_or(0, |r| r.attempt + 1);
        let backoff = base * (1u32 << attempt.min(10));
        let delay = backoff.min(max);
        remote.relink = Some(Relink {
            attempt,
            due: Instant::now() + delay,
        });
    }

    /// Handle an inbound SUB.
    pub(crate) fn on_sub(&mut self, from: &NodeAddr, env: &Envelope) -> Result<()> {
        let body = env.body.as_ref().ok_or(WeftError::Invalid)?;
        let msg = SubMessage::decode_body(body)?;
        let now = Instant::now();
        let id = self.ensure_remote(from, now);

        // Loop detection: a peer advertising our own mesh id, or telling
        // us it muted us, closes a cycle in the overlay.
        let looped = msg.mesh_id == self.mesh_id || msg.muted.contains(&self.mesh_id);
        {
            let remote = self.remotes.get_mut(id).expect("remote exists");
            remote.mesh_id = Some(msg.mesh_id);
            if !remote.linked {
                remote.expires = Some(now + self.cfg.remote_expiry);
            }
            if looped && !remote.muted {
                warn!("[MESH] loop detected via {}; muting", from);
                remote.muted = true;
            }
        }
        if looped {
            self.subtract_contribution(id);
        }

        let needs_in = self.decode_needs_vec(&msg.needs)?;
        let mut sync_requested_reply = false;
        let new_interests = if msg.delta {
            let remote = self.remotes.get(id).expect("remote exists");
            if remote.inbound.sync_requested {
                // We lost the delta base (fresh remote or regenerated
                // state); ask for a full vector instead of guessing.
                sync_requested_reply = true;
                None
            } else {
                let delta = self.decode_interests(&msg.interests)?;
                let mut v = remote.inbound.interests.clone();
                v.apply_delta(&delta)?;
                Some(v)
            }
        } else {
            Some(self.decode_interests(&msg.interests)?)
        };

        if let Some(new_in) = new_interests {
            self.apply_inbound(id, new_in, needs_in, msg.seq)?;
            self.schedule_updates_all(Some(id));
            self.replay_retained(id);
        }

        let sak = SakMessage {
            mesh_id: self.mesh_id,
            ack_seq: msg.seq,
            sync_requested: sync_requested_reply,
        };
        let frame = Envelope {
            msg_type: MsgType::Sak,
            header: UnprotectedHeader {
                port: self.listen_port(),
                path: None,
            },
            protected: None,
            body: Some(sak.encode_body()),
        }
        .encode();
        self.transport.send(from, frame)
    }

    fn apply_inbound(
        &mut self,
        id: RemoteId,
        new_interests: BitVector,
        new_needs: BitVector,
        seq: u32,
    ) -> Result<()> {
        let (old_interests, old_needs, contributed, muted) = {
            let remote = self.remotes.get(id).expect("remote exists");
            (
                remote.inbound.interests.clone(),
                remote.inbound.needs.clone(),
                remote.contributed,
                remote.muted,
            )
        };
        if contributed {
            self.interests.sub(&old_interests)?;
            self.needs.sub(&old_needs)?;
        }
        let contribute = !muted;
        if contribute {
            self.interests.add(&new_interests)?;
            self.needs.add(&new_needs)?;
        }
        let remote = self.remotes.get_mut(id).expect("remote exists");
        remote.inbound.interests = new_interests;
        remote.inbound.needs = new_needs;
        remote.inbound.seq = seq;
        remote.inbound.sync_requested = false;
        remote.contributed = contribute;
        Ok(())
    }

    /// Handle an inbound SAK.
    pub(crate) fn on_sak(&mut self, from: &NodeAddr, env: &Envelope) -> Result<()> {
        let body = env.body.as_ref().ok_or(WeftError::Invalid)?;
        let msg = SakMessage::decode_body(body)?;
        let Some(id) = self.remotes.find_addr(from) else {
            return Err(WeftError::Missing);
        };
        let remote = self.remotes.get_mut(id).expect("remote exists");
        remote.outbound.acked_seq = msg.ack_seq;
        if msg.sync_requested {
            trace!("[MESH] {} requested full sync", from);
            remote.outbound.sync = true;
            remote.outbound.check_for_updates = true;
        }
        Ok(())
    }

    /// Find a remote by address or learn a new one from traffic.
    pub(crate) fn ensure_remote(&mut self, addr: &NodeAddr, now: Instant) -> RemoteId {
        if let Some(id) = self.remotes.find_addr(addr) {
            return id;
        }
        let mut remote = Remote::new(
            addr.clone(),
            false,
            self.space.interest_vector(),
            self.space.needs_vector(),
        );
        remote.expires = Some(now + self.cfg.remote_expiry);
        trace!("[MESH] learned remote {}", addr);
        self.remotes.insert(remote)
    }

    /// Remove a remote's vectors from the node aggregates.
    pub(crate) fn subtract_contribution(&mut self, id: RemoteId) {
        let (interests, needs, contributed) = {
            let remote = self.remotes.get(id).expect("remote exists");
            (
                remote.inbound.interests.clone(),
                remote.inbound.needs.clone(),
                remote.contributed,
            )
        };
        if contributed {
            // Unbalanced subtraction is a programming error upstream
            let _ = self.interests.sub(&interests);
            let _ = self.needs.sub(&needs);
            self.remotes
                .get_mut(id)
                .expect("remote exists")
                .contributed = false;
        }
    }

    /// Mark every remote (except one) as possibly needing an update.
    pub(crate) fn schedule_updates_all(&mut self, except: Option<RemoteId>) {
        for id in self.remotes.iter_ids() {
            if Some(id) == except {
                continue;
            }
            if let Some(remote) = self.remotes.get_mut(id) {
                remote.outbound.check_for_updates = true;
            }
        }
    }

    /// Compute the outbound summary for one remote by excluding the
    /// remote's own contribution from the aggregates: a node never echoes
    /// a remote's interests back to it, and excluding the whole
    /// contribution (rather than bit-subtracting the aggregate) keeps the
    /// exchange stable when two peers share an interest.
    fn compute_outbound(&mut self, id: RemoteId) -> (BitVector, BitVector) {
        let (in_interests, in_needs, contributed) = {
            let remote = self.remotes.get(id).expect("remote exists");
            (
                remote.inbound.interests.clone(),
                remote.inbound.needs.clone(),
                remote.contributed,
            )
        };
        if !contributed {
            return (self.interests.to_union(), self.needs.to_intersection());
        }
        self.interests
            .sub(&in_interests)
            .expect("balanced aggregate");
        self.needs.sub(&in_needs).expect("balanced aggregate");
        let out_interests = self.interests.to_union();
        let out_needs = self.needs.to_intersection();
        self.interests.add(&in_interests).expect("counter width");
        self.needs.add(&in_needs).expect("counter width");
        (out_interests, out_needs)
    }

    fn muted_list(&self) -> Vec<Uuid> {
        self.remotes
            .iter_ids()
            .into_iter()
            .filter_map(|id| self.remotes.get(id))
            .filter(|r| r.muted)
            .filter_map(|r| r.mesh_id)
            .collect()
    }

    fn sub_envelope(&self, msg: &SubMessage) -> bytes::Bytes {
        Envelope {
            msg_type: MsgType::Sub,
            header: UnprotectedHeader {
                port: self.listen_port(),
                path: None,
            },
            protected: None,
            body: Some(msg.encode_body()),
        }
        .encode()
    }

    /// Send a (possibly delta) subscription update to one remote if due.
    pub(crate) fn send_sub_update(&mut self, id: RemoteId, now: Instant, force: bool) {
        let due = {
            let Some(remote) = self.remotes.get(id) else {
                return;
            };
            force
                || remote
                    .outbound
                    .last_update
                    .map_or(true, |t| now >= t + self.cfg.subs_rate)
        };
        if !due {
            return;
        }
        let (out_interests, out_needs) = self.compute_outbound(id);
        let muted = self.muted_list();
        let mesh_id = self.mesh_id;
        let (msg, addr) = {
            let remote = self.remotes.get_mut(id).expect("remote exists");
            let send_full = remote.outbound.sync || remote.outbound.last_update.is_none();
            let changed = out_interests != remote.outbound.interests
                || out_needs != remote.outbound.needs;
            if !send_full && !changed {
                remote.outbound.check_for_updates = false;
                return;
            }
            remote.outbound.seq += 1;
            let msg = if send_full {
                SubMessage {
                    mesh_id,
                    seq: remote.outbound.seq,
                    sync: true,
                    delta: false,
                    interests: out_interests.encode(),
                    needs: out_needs.encode(),
                    muted,
                }
            } else {
                let delta = out_interests
                    .xor_delta(&remote.outbound.interests)
                    .expect("same vector shape");
                SubMessage {
                    mesh_id,
                    seq: remote.outbound.seq,
                    sync: false,
                    delta: true,
                    interests: delta.encode(),
                    needs: out_needs.encode(),
                    muted,
                }
            };
            remote.outbound.interests = out_interests;
            remote.outbound.needs = out_needs;
            remote.outbound.sync = false;
            remote.outbound.check_for_updates = false;
            remote.outbound.last_update = Some(now);
            (msg, remote.addr.clone())
        };
        trace!("[MESH] SUB update to {} (seq {})", addr, msg.seq);
        let frame = self.sub_envelope(&msg);
        let _ = self.transport.send(&addr, frame);
    }

    /// Mesh timer work: due updates, relinks, remote expiry.
    pub(crate) fn mesh_tick(&mut self, now: Instant) {
        for id in self.remotes.iter_ids() {
            let Some(remote) = self.remotes.get(id) else {
                continue;
            };
            if remote.expires.is_some_and(|t| now >= t) {
                debug!("[MESH] remote {} expired", remote.addr);
                self.subtract_contribution(id);
                self.remotes.remove(id);
                continue;
            }
            if let Some(relink) = remote.relink {
                if now >= relink.due {
                    let addr = remote.addr.clone();
                    debug!("[MESH] relinking {} (attempt {})", addr, relink.attempt + 1);
                    // Re-arm the backoff before dialing so a synchronous
                    // failure cannot spin the loop
                    self.schedule_relink(id);
                    if self.transport.connect(&addr).is_err() {
                        self.handle_net(NetEvent::ConnectFailed {
                            addr,
                            error: WeftError::Network,
                        });
                    }
                    continue;
                }
            }
            if remote.outbound.check_for_updates || remote.outbound.sync {
                self.send_sub_update(id, now, false);
            }
        }
    }

    /// Earliest instant any mesh timer comes due.
    pub(crate) fn mesh_deadline(&self) -> Option<Instant> {
        let mut deadline: Option<Instant> = None;
        let mut fold = |t: Instant| {
            deadline = Some(deadline.map_or(t, |d| d.min(t)));
        };
        for id in self.remotes.iter_ids() {
            let Some(remote) = self.remotes.get(id) else {
                continue;
            };
            if let Some(t) = remote.expires {
                fold(t);
            }
            if let Some(relink) = remote.relink {
                fold(relink.due);
            }
            if remote.outbound.check_for_updates || remote.outbound.sync {
                match remote.outbound.last_update {
                    Some(t) => fold(t + self.cfg.subs_rate),
                    None => fold(Instant::now()),
                }
            }
        }
        deadline
    }

    /// Regenerate the mesh identity after a topology change and lift all
    /// mutes; genuinely looped peers will be re-muted by the next SUB
    /// exchange.
    pub(crate) fn regenerate_mesh_id(&mut self) {
        self.mesh_id = self.generate_uuid();
        trace!("[MESH] new mesh id {}", self.mesh_id);
        for id in self.remotes.iter_ids() {
            let Some(remote) = self.remotes.get(id) else {
                continue;
            };
            if remote.muted {
                let re_add = !remote.contributed && !remote.inbound.interests.is_clear();
                let (interests, needs) = (
                    remote.inbound.interests.clone(),
                    remote.inbound.needs.clone(),
                );
                let remote = self.remotes.get_mut(id).expect("remote exists");
                remote.muted = false;
                if re_add {
                    remote.contributed = true;
                    let _ = self.interests.add(&interests);
                    let _ = self.needs.add(&needs);
                }
            }
            if let Some(remote) = self.remotes.get_mut(id) {
                remote.outbound.check_for_updates = true;
            }
        }
    }

    pub(crate) fn fail_pending_completions(&mut self, error: WeftError) {
        for id in self.remotes.iter_ids() {
            if let Some(remote) = self.remotes.get_mut(id) {
                if let Some(c) = remote.completion.take() {
                    let _ = c.send(Err(error));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn remote(addr: &str) -> Remote {
        Remote::new(
            NodeAddr::Inproc(addr.into()),
            false,
            BitVector::with_params(128, 4).unwrap(),
            BitVector::with_params(128, 4).unwrap(),
        )
    }

    #[test]
    fn ring_insert_and_iterate() {
        let mut table = RemoteTable::new();
        let a = table.insert(remote("a"));
        let b = table.insert(remote("b"));
        let c = table.insert(remote("c"));
        assert_eq!(table.len(), 3);
        let order: Vec<u32> = table.iter_ids().into_iter().map(|id| id.0).collect();
        assert_eq!(order, vec![a.0, b.0, c.0]);
    }

    #[test]
    fn ring_remove_middle_and_head() {
        let mut table = RemoteTable::new();
        let a = table.insert(remote("a"));
        let b = table.insert(remote("b"));
        let c = table.insert(remote("c"));
        table.remove(b).unwrap();
        let order: Vec<u32> = table.iter_ids().into_iter().map(|id| id.0).collect();
        assert_eq!(order, vec![a.0, c.0]);
        table.remove(a).unwrap();
        let order: Vec<u32> = table.iter_ids().into_iter().map(|id| id.0).collect();
        assert_eq!(order, vec![c.0]);
        table.remove(c).unwrap();
        assert!(table.iter_ids().is_empty());
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn slots_are_reused() {
        let mut table = RemoteTable::new();
        let a = table.insert(remote("a"));
        table.remove(a).unwrap();
        let b = table.insert(remote("b"));
        assert_eq!(a.0, b.0);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn find_by_addr() {
        let mut table = RemoteTable::new();
        table.insert(remote("a"));
        let b = table.insert(remote("b"));
        assert_eq!(table.find_addr(&NodeAddr::Inproc("b".into())), Some(b));
        assert_eq!(table.find_addr(&NodeAddr::Inproc("zz".into())), None);
    }
}

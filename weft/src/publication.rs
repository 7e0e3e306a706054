//! Publication engine.
//!
//! Owns the create → init → publish → destroy lifecycle, payload sealing,
//! the routing-set computation for each send, retained publications, and
//! acknowledgement plumbing in both directions.
//!
//! Forwarding works on the original envelope bytes: a relay re-sends what
//! it received (sequence numbers and seals intact) and only reads the
//! protected headers to route. A relay without the content key still
//! forwards; only local delivery needs the plaintext.

use crate::addr::NodeAddr;
use crate::handler::AckHandler;
use crate::mesh::RemoteId;
use crate::node::Node;
use crate::permission::Permission;
use bytes::Bytes;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};
use uuid::Uuid;
use weft_core::bitvec::BitVector;
use weft_core::error::{Result, WeftError};
use weft_core::keyid::KeyId;
use weft_wire::frame::{Envelope, MsgType, UnprotectedHeader};
use weft_wire::msg::{AckBody, AckHeaders, PubBody, PubHeaders};
use weft_wire::seal::{derive_nonce, peek_alg, NonceKind, PlainSeal, SealCodec, ALG_NONE, NONCE_LEN};

/// Handle to a publication owned by a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PubHandle(pub(crate) u32);

/// Read-only description of a publication as seen by handlers.
#[derive(Debug, Clone)]
pub struct PublicationView {
    pub pub_id: Uuid,
    pub seq_num: u32,
    pub topics: Vec<String>,
    pub ack_requested: bool,
    /// Key the payload was sealed under, if any.
    pub key_id: Option<KeyId>,
}

impl PublicationView {
    /// A partial copy usable to acknowledge after the handler returns.
    #[must_use]
    pub fn ack_ticket(&self) -> AckTicket {
        AckTicket {
            pub_id: self.pub_id,
            seq_num: self.seq_num,
            key_id: self.key_id.clone(),
        }
    }
}

/// The minimum state needed to acknowledge a received publication later.
#[derive(Debug, Clone)]
pub struct AckTicket {
    pub pub_id: Uuid,
    pub seq_num: u32,
    pub key_id: Option<KeyId>,
}

pub(crate) struct PublicationState {
    pub pub_id: Uuid,
    pub seq: u32,
    pub topics: Vec<String>,
    pub no_wild_card: bool,
    pub interests: BitVector,
    pub needs_cover: BitVector,
    pub key_ids: Vec<KeyId>,
    pub ack_handler: Option<Box<dyn AckHandler>>,
    pub initialized: bool,
    /// Expiry of the retained copy, when retained.
    pub expires: Option<Instant>,
    /// Encoded envelope of the last send, kept for retained replay.
    pub retained_frame: Option<Bytes>,
    /// The application destroyed its handle; state lives on only until
    /// the retained copy expires.
    pub app_released: bool,
}

impl Node {
    /// Allocate an uninitialized publication.
    pub fn create_publication(&mut self) -> Result<PubHandle> {
        if self.destroying {
            return Err(WeftError::NodeDestroyed);
        }
        let handle = PubHandle(self.next_pub);
        self.next_pub += 1;
        self.pubs.insert(
            handle.0,
            PublicationState {
                pub_id: Uuid::nil(),
                seq: 0,
                topics: Vec::new(),
                no_wild_card: false,
                interests: self.space.interest_vector(),
                needs_cover: self.space.needs_vector(),
                key_ids: Vec::new(),
                ack_handler: None,
                initialized: false,
                expires: None,
                retained_frame: None,
                app_released: false,
            },
        );
        Ok(handle)
    }

    /// Initialize a publication with its topics.
    ///
    /// Fails with `Invalid` when `topics` is empty, a topic is only
    /// separators, or a topic carries wildcard tokens (wildcards are a
    /// subscription-side syntax).
    pub fn init_publication(
        &mut self,
        handle: PubHandle,
        topics: Vec<String>,
        no_wild_card: bool,
        key_ids: Vec<KeyId>,
        ack_handler: Option<Box<dyn AckHandler>>,
    ) -> Result<Uuid> {
        if self.destroying {
            return Err(WeftError::NodeDestroyed);
        }
        if topics.is_empty() {
            return Err(WeftError::Invalid);
        }
        let (interests, needs_cover) = self.space.publication_vectors(&topics, no_wild_card)?;
        let pub_id = self.generate_uuid();
        let state = self.pubs.get_mut(&handle.0).ok_or(WeftError::Missing)?;
        if state.initialized {
            return Err(WeftError::Exists);
        }
        state.pub_id = pub_id;
        state.topics = topics;
        state.no_wild_card = no_wild_card;
        state.interests = interests;
        state.needs_cover = needs_cover;
        state.key_ids = key_ids;
        state.ack_handler = ack_handler;
        state.initialized = true;
        Ok(pub_id)
    }

    /// Publish a payload.
    ///
    /// Increments the sequence number, delivers to matching local
    /// subscriptions, and forwards toward every interested peer. A
    /// positive `ttl` retains the publication for late subscribers; a
    /// zero `ttl` expires a previously retained one; negative is `Args`.
    pub fn publish(&mut self, handle: PubHandle, payload: &[u8], ttl: i16) -> Result<u32> {
        if self.destroying {
            return Err(WeftError::NodeDestroyed);
        }
        if ttl < 0 {
            return Err(WeftError::Args);
        }
        let (pub_id, seq, topics, no_wild, bf, needs, key_ids, ack_requested) = {
            let state = self.pubs.get_mut(&handle.0).ok_or(WeftError::Missing)?;
            if !state.initialized {
                return Err(WeftError::NotInitialized);
            }
            state.seq += 1;
            (
                state.pub_id,
                state.seq,
                state.topics.clone(),
                state.no_wild_card,
                state.interests.clone(),
                state.needs_cover.clone(),
                state.key_ids.clone(),
                state.ack_handler.is_some(),
            )
        };

        let hdrs = PubHeaders {
            ttl,
            pub_id,
            seq_num: seq,
            ack_requested,
            interests: bf.encode(),
            needs: needs.encode(),
            no_wild_card: no_wild,
        };
        let protected = hdrs.encode();
        let plain = PubBody {
            topics: topics.clone(),
            payload: Bytes::copy_from_slice(payload),
        }
        .encode();
        let nonce = derive_nonce(&pub_id, seq, NonceKind::Pub);
        let (body, used_kid) = match self.seal_payload(&key_ids, &nonce, &protected, &plain) {
            Ok(sealed) => sealed,
            Err(e) => {
                // Sealed delivery cannot proceed; surface as a negative ack
                self.notify_ack(handle, seq, Err(e), &[]);
                return Err(e);
            }
        };
        let frame = Envelope {
            msg_type: MsgType::Pub,
            header: UnprotectedHeader {
                port: self.listen_port(),
                path: None,
            },
            protected: Some(protected),
            body: Some(body),
        }
        .encode();

        let now = Instant::now();
        // Our own send goes into history so a copy routed back through the
        // mesh is recognized as stale.
        let _ = self
            .history
            .record(pub_id, seq, self.cfg.history_hold, now, None, ack_requested);

        {
            let state = self.pubs.get_mut(&handle.0).expect("publication exists");
            if ttl > 0 {
                state.expires = Some(now + Duration::from_secs(ttl as u64));
                state.retained_frame = Some(frame.clone());
            } else if state.retained_frame.is_some() {
                state.retained_frame = None;
                state.expires = None;
            }
        }

        // Local subscriptions see the publication before any peer does
        self.deliver_local(
            pub_id,
            seq,
            &topics,
            payload,
            used_kid.as_ref(),
            no_wild,
            &bf,
            ack_requested,
        );
        let sent = self.fanout(&frame, &bf, &needs, &topics, used_kid.as_ref(), None);
        trace!("[PUB] {} seq {} fanned out to {} peers", pub_id, seq, sent);
        Ok(seq)
    }

    /// Destroy a publication handle.
    ///
    /// A retained copy with an unexpired ttl stays in the node until it
    /// expires; everything else is freed immediately.
    pub fn destroy_publication(&mut self, handle: PubHandle) -> Result<()> {
        let state = self.pubs.get_mut(&handle.0).ok_or(WeftError::Missing)?;
        let retained_alive = state
            .expires
            .is_some_and(|t| t > Instant::now() && state.retained_frame.is_some());
        if retained_alive {
            state.app_released = true;
            state.ack_handler = None;
        } else {
            self.pubs.remove(&handle.0);
        }
        Ok(())
    }

    /// Acknowledge a received publication toward its publisher.
    pub fn ack_publication(&mut self, ticket: &AckTicket, payload: &[u8]) -> Result<()> {
        if self.destroying {
            return Err(WeftError::NodeDestroyed);
        }
        if !self.allowed(Permission::Ack, &[], ticket.key_id.as_ref()) {
            return Err(WeftError::Failure);
        }
        // A publication of our own node never crosses the wire
        let local = self
            .pubs
            .iter()
            .find(|(_, st)| st.initialized && st.pub_id == ticket.pub_id)
            .map(|(h, _)| PubHandle(*h));
        if let Some(handle) = local {
            self.notify_ack(handle, ticket.seq_num, Ok(()), payload);
            return Ok(());
        }
        let route = self.history.ack_route(&ticket.pub_id)?.clone();
        let hdrs = AckHeaders {
            pub_id: ticket.pub_id,
            seq_num: ticket.seq_num,
        };
        let protected = hdrs.encode();
        let plain = AckBody {
            payload: Bytes::copy_from_slice(payload),
        }
        .encode();
        let nonce = derive_nonce(&ticket.pub_id, ticket.seq_num, NonceKind::Ack);
        let key_ids: Vec<KeyId> = ticket.key_id.iter().cloned().collect();
        let (body, _) = self.seal_payload(&key_ids, &nonce, &protected, &plain)?;
        let frame = Envelope {
            msg_type: MsgType::Ack,
            header: UnprotectedHeader {
                port: self.listen_port(),
                path: None,
            },
            protected: Some(protected),
            body: Some(body),
        }
        .encode();
        self.transport.send(&route, frame)
    }

    /// Seal a payload under the first resolvable key, or wrap it in the
    /// pass-through seal when no keys are configured.
    fn seal_payload(
        &self,
        key_ids: &[KeyId],
        nonce: &[u8; NONCE_LEN],
        aad: &Bytes,
        plain: &Bytes,
    ) -> Result<(Bytes, Option<KeyId>)> {
        if key_ids.is_empty() {
            let body = PlainSeal.seal(&KeyId::default(), &[], nonce, aad, plain)?;
            return Ok((body, None));
        }
        let keystore = self.cfg.keystore.as_ref().ok_or(WeftError::Missing)?;
        for kid in key_ids {
            let Ok(key) = keystore.key(kid) else {
                continue;
            };
            let Ok(key_bytes) = crate::keystore::symmetric_bytes(&key) else {
                continue;
            };
            let body = self.cfg.seal.seal(kid, &key_bytes, nonce, aad, plain)?;
            return Ok((body, Some(kid.clone())));
        }
        Err(WeftError::Missing)
    }

    /// Open a sealed body, resolving keys through the key store.
    pub(crate) fn open_body(
        &self,
        nonce: &[u8; NONCE_LEN],
        aad: &[u8],
        body: &[u8],
    ) -> Result<(Option<KeyId>, Bytes)> {
        let alg = peek_alg(body)?;
        if alg == ALG_NONE {
            let (kid, plain) =
                PlainSeal.open(nonce, aad, body, &mut |_: &KeyId| Err(WeftError::Missing))?;
            let kid = (!kid.is_empty()).then_some(kid);
            return Ok((kid, plain));
        }
        if alg != self.cfg.seal.alg() {
            return Err(WeftError::Invalid);
        }
        let keystore = self.cfg.keystore.as_ref().ok_or(WeftError::Missing)?;
        let (kid, plain) = self.cfg.seal.open(nonce, aad, body, &mut |kid| {
            keystore
                .key(kid)
                .and_then(|k| crate::keystore::symmetric_bytes(&k))
        })?;
        Ok((Some(kid), plain))
    }

    /// Handle an inbound PUB.
    pub(crate) fn on_pub(&mut self, from: &NodeAddr, raw: &[u8], env: &Envelope) -> Result<()> {
        let protected = env.protected.as_ref().ok_or(WeftError::Invalid)?;
        let hdrs = PubHeaders::decode(protected)?;
        let now = Instant::now();
        if self.history.is_stale(&hdrs.pub_id, hdrs.seq_num) {
            // Already seen: loop suppressed, recovered locally
            return Err(WeftError::Stale);
        }
        self.history.record(
            hdrs.pub_id,
            hdrs.seq_num,
            self.cfg.history_hold,
            now,
            Some(from.clone()),
            hdrs.ack_requested,
        )?;
        let bf = self.decode_interests(&hdrs.interests)?;
        let needs = self.decode_needs_vec(&hdrs.needs)?;
        self.ensure_remote(from, now);

        let body = env.body.as_ref().ok_or(WeftError::Invalid)?;
        let nonce = derive_nonce(&hdrs.pub_id, hdrs.seq_num, NonceKind::Pub);
        match self.open_body(&nonce, protected, body) {
            Ok((kid, plain)) => {
                let pub_body = PubBody::decode(&plain)?;
                self.deliver_local(
                    hdrs.pub_id,
                    hdrs.seq_num,
                    &pub_body.topics,
                    &pub_body.payload,
                    kid.as_ref(),
                    hdrs.no_wild_card,
                    &bf,
                    hdrs.ack_requested,
                );
                let frame = Bytes::copy_from_slice(raw);
                self.fanout(&frame, &bf, &needs, &pub_body.topics, kid.as_ref(), Some(from));
            }
            Err(WeftError::Missing) => {
                // No key for this payload: we are a pure relay
                debug!("[PUB] no key for {}; forwarding sealed", hdrs.pub_id);
                let frame = Bytes::copy_from_slice(raw);
                self.fanout(&frame, &bf, &needs, &[], None, Some(from));
            }
            Err(e) => return Err(e),
        }
        Ok(())
    }

    /// Handle an inbound ACK: consume it if we published the publication,
    /// otherwise route it one hop back along the publication's path.
    pub(crate) fn on_ack(&mut self, from: &NodeAddr, raw: &[u8], env: &Envelope) -> Result<()> {
        let protected = env.protected.as_ref().ok_or(WeftError::Invalid)?;
        let hdrs = AckHeaders::decode(protected)?;
        let local = self
            .pubs
            .iter()
            .find(|(_, st)| st.initialized && st.pub_id == hdrs.pub_id)
            .map(|(h, _)| PubHandle(*h));
        if let Some(handle) = local {
            let body = env.body.as_ref().ok_or(WeftError::Invalid)?;
            let nonce = derive_nonce(&hdrs.pub_id, hdrs.seq_num, NonceKind::Ack);
            match self.open_body(&nonce, protected, body) {
                Ok((_, plain)) => {
                    let ack = AckBody::decode(&plain)?;
                    self.notify_ack(handle, hdrs.seq_num, Ok(()), &ack.payload);
                }
                Err(e) => {
                    self.notify_ack(handle, hdrs.seq_num, Err(e), &[]);
                }
            }
            return Ok(());
        }
        match self.history.ack_route(&hdrs.pub_id) {
            Ok(route) => {
                let route = route.clone();
                if route == *from {
                    // Never bounce an ack back where it came from
                    return Err(WeftError::NoRoute);
                }
                self.transport.send(&route, Bytes::copy_from_slice(raw))
            }
            Err(e) => {
                warn!("[ACK] no route for {}; dropping", hdrs.pub_id);
                Err(e)
            }
        }
    }

    /// Invoke a publication's ack handler.
    pub(crate) fn notify_ack(
        &mut self,
        handle: PubHandle,
        seq_num: u32,
        status: Result<()>,
        payload: &[u8],
    ) {
        if let Some(state) = self.pubs.get_mut(&handle.0) {
            let view = PublicationView {
                pub_id: state.pub_id,
                seq_num,
                topics: state.topics.clone(),
                ack_requested: true,
                key_id: state.key_ids.first().cloned(),
            };
            if let Some(handler) = state.ack_handler.as_mut() {
                handler.on_ack(&view, status, payload);
            }
        }
    }

    /// Compute the fanout for one send and queue the frames.
    ///
    /// A remote is a candidate when its advertised interests intersect the
    /// publication's topic vector and its needs are covered; the ingress
    /// (for forwarded publications) and muted loops are excluded.
    pub(crate) fn fanout(
        &mut self,
        frame: &Bytes,
        bf: &BitVector,
        needs: &BitVector,
        topics: &[String],
        key_id: Option<&KeyId>,
        exclude: Option<&NodeAddr>,
    ) -> usize {
        if !self.allowed(Permission::Pub, topics, key_id) {
            debug!("[PUB] send denied by permission store");
            return 0;
        }
        let mut sent = 0;
        for id in self.remotes.iter_ids() {
            let Some(remote) = self.remotes.get(id) else {
                continue;
            };
            if remote.muted {
                continue;
            }
            if exclude == Some(&remote.addr) {
                continue;
            }
            if !bf.intersects(&remote.inbound.interests) {
                continue;
            }
            if !needs.includes(&remote.inbound.needs) {
                continue;
            }
            let addr = remote.addr.clone();
            match self.transport.send(&addr, frame.clone()) {
                Ok(()) => sent += 1,
                Err(e) => debug!("[PUB] send to {} failed: {}", addr, e),
            }
        }
        sent
    }

    /// Re-send retained publications toward a remote whose interests just
    /// changed. The receiver's history suppresses copies it already has.
    pub(crate) fn replay_retained(&mut self, id: RemoteId) {
        let Some(remote) = self.remotes.get(id) else {
            return;
        };
        if remote.muted {
            return;
        }
        let addr = remote.addr.clone();
        let in_interests = remote.inbound.interests.clone();
        let in_needs = remote.inbound.needs.clone();
        let frames: Vec<Bytes> = self
            .pubs
            .values()
            .filter(|st| {
                st.retained_frame.is_some()
                    && st.interests.intersects(&in_interests)
                    && st.needs_cover.includes(&in_needs)
            })
            .filter_map(|st| st.retained_frame.clone())
            .collect();
        for frame in frames {
            trace!("[PUB] retained replay to {}", addr);
            let _ = self.transport.send(&addr, frame);
        }
    }

    /// Garbage-collect expired retained publications.
    pub(crate) fn expire_publications(&mut self, now: Instant) {
        let expired: Vec<u32> = self
            .pubs
            .iter()
            .filter(|(_, st)| st.expires.is_some_and(|t| now >= t))
            .map(|(h, _)| *h)
            .collect();
        for h in expired {
            let remove = {
                let state = self.pubs.get_mut(&h).expect("publication exists");
                trace!("[PUB] retained {} expired", state.pub_id);
                state.retained_frame = None;
                state.expires = None;
                state.app_released
            };
            if remove {
                self.pubs.remove(&h);
            }
        }
    }
}

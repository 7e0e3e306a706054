//! Typed message bodies.
//!
//! Every body is a fixed-size CBOR array (or, for protected headers, a
//! canonical integer-keyed map) so the wire form is deterministic. The
//! interest and needs vectors travel as opaque byte strings here; the node
//! layer owns their Bloom parameters and decodes them against its own
//! configuration.

use crate::cbor::{Decoder, Encoder};
use bytes::Bytes;
use uuid::Uuid;
use weft_core::error::{Result, WeftError};

/// Upper bound on list lengths accepted from the wire.
const MAX_LIST_LEN: usize = 64;

/// Protected-header map keys (shared by PUB and ACK).
const KEY_TTL: u64 = 1;
const KEY_PUB_ID: u64 = 2;
const KEY_SEQ_NUM: u64 = 3;
const KEY_ACK_REQUESTED: u64 = 4;
const KEY_INTERESTS: u64 = 5;
const KEY_NEEDS: u64 = 6;
const KEY_NO_WILD_CARD: u64 = 7;

fn encode_uuid(e: &mut Encoder, id: &Uuid) {
    e.bytes(id.as_bytes());
}

fn decode_uuid(d: &mut Decoder<'_>) -> Result<Uuid> {
    let b = d.bytes()?;
    Uuid::from_slice(b).map_err(|_| WeftError::Invalid)
}

/// Subscription update: the sender's aggregated interest summary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubMessage {
    /// Sender's mesh identity, used for loop detection.
    pub mesh_id: Uuid,
    /// Sender-side update sequence number, acknowledged by SAK.
    pub seq: u32,
    /// True when the vectors replace the receiver's inbound state.
    pub sync: bool,
    /// True when `interests` is an xor delta against the last
    /// acknowledged vector. Mutually exclusive with `sync`.
    pub delta: bool,
    /// Serialized interest vector or delta.
    pub interests: Bytes,
    /// Serialized needs vector (always full).
    pub needs: Bytes,
    /// Mesh identities this sender has muted (loop hints).
    pub muted: Vec<Uuid>,
}

impl SubMessage {
    #[must_use]
    pub fn encode_body(&self) -> Bytes {
        let mut e = Encoder::with_capacity(32 + self.interests.len() + self.needs.len());
        e.array(7);
        encode_uuid(&mut e, &self.mesh_id);
        e.uint(u64::from(self.seq));
        e.boolean(self.sync);
        e.boolean(self.delta);
        e.bytes(&self.interests);
        e.bytes(&self.needs);
        e.array(self.muted.len());
        for m in &self.muted {
            encode_uuid(&mut e, m);
        }
        e.finish()
    }

    pub fn decode_body(buf: &[u8]) -> Result<Self> {
        let mut d = Decoder::new(buf);
        if d.array()? != 7 {
            return Err(WeftError::Invalid);
        }
        let mesh_id = decode_uuid(&mut d)?;
        let seq = d.uint32()?;
        let sync = d.boolean()?;
        let delta = d.boolean()?;
        if sync && delta {
            return Err(WeftError::Invalid);
        }
        let interests = Bytes::copy_from_slice(d.bytes()?);
        let needs = Bytes::copy_from_slice(d.bytes()?);
        let n = d.array()?;
        if n > MAX_LIST_LEN {
            return Err(WeftError::Invalid);
        }
        let mut muted = Vec::with_capacity(n);
        for _ in 0..n {
            muted.push(decode_uuid(&mut d)?);
        }
        Ok(Self {
            mesh_id,
            seq,
            sync,
            delta,
            interests,
            needs,
            muted,
        })
    }
}

/// Subscription acknowledgement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SakMessage {
    /// Acknowledging node's mesh identity.
    pub mesh_id: Uuid,
    /// The SUB sequence number being acknowledged.
    pub ack_seq: u32,
    /// True when the receiver could not use a delta (lost base) and wants
    /// the next update as a full vector.
    pub sync_requested: bool,
}

impl SakMessage {
    #[must_use]
    pub fn encode_body(&self) -> Bytes {
        let mut e = Encoder::with_capacity(32);
        e.array(3);
        encode_uuid(&mut e, &self.mesh_id);
        e.uint(u64::from(self.ack_seq));
        e.boolean(self.sync_requested);
        e.finish()
    }

    pub fn decode_body(buf: &[u8]) -> Result<Self> {
        let mut d = Decoder::new(buf);
        if d.array()? != 3 {
            return Err(WeftError::Invalid);
        }
        Ok(Self {
            mesh_id: decode_uuid(&mut d)?,
            ack_seq: d.uint32()?,
            sync_requested: d.boolean()?,
        })
    }
}

/// Integrity-protected publication headers.
///
/// These are serialized into the envelope's `protected` byte string and
/// fed to the seal as AAD, so a relay can route on them but cannot forge
/// them when the body is sealed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PubHeaders {
    /// Remaining time to live in seconds; positive means retained.
    pub ttl: i16,
    /// Stable publication identity.
    pub pub_id: Uuid,
    /// Sequence number of this send.
    pub seq_num: u32,
    /// True when the publisher wants end-to-end acknowledgements.
    pub ack_requested: bool,
    /// Serialized topic interest vector.
    pub interests: Bytes,
    /// Serialized needs-cover vector.
    pub needs: Bytes,
    /// True when the publication refuses wildcard subscription matches.
    pub no_wild_card: bool,
}

impl PubHeaders {
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut e = Encoder::with_capacity(32 + self.interests.len() + self.needs.len());
        e.map(7);
        e.uint(KEY_TTL);
        e.int(i64::from(self.ttl));
        e.uint(KEY_PUB_ID);
        encode_uuid(&mut e, &self.pub_id);
        e.uint(KEY_SEQ_NUM);
        e.uint(u64::from(self.seq_num));
        e.uint(KEY_ACK_REQUESTED);
        e.boolean(self.ack_requested);
        e.uint(KEY_INTERESTS);
        e.bytes(&self.interests);
        e.uint(KEY_NEEDS);
        e.bytes(&self.needs);
        e.uint(KEY_NO_WILD_CARD);
        e.boolean(self.no_wild_card);
        e.finish()
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        let mut d = Decoder::new(buf);
        let pairs = d.map()?;
        let mut ttl = None;
        let mut pub_id = None;
        let mut seq_num = None;
        let mut ack_requested = None;
        let mut interests = None;
        let mut needs = None;
        let mut no_wild_card = false;
        let mut last_key = None;
        for _ in 0..pairs {
            let key = d.uint()?;
            if last_key.is_some_and(|k| key <= k) {
                return Err(WeftError::Invalid);
            }
            last_key = Some(key);
            match key {
                KEY_TTL => ttl = Some(d.int16()?),
                KEY_PUB_ID => pub_id = Some(decode_uuid(&mut d)?),
                KEY_SEQ_NUM => seq_num = Some(d.uint32()?),
                KEY_ACK_REQUESTED => ack_requested = Some(d.boolean()?),
                KEY_INTERESTS => interests = Some(Bytes::copy_from_slice(d.bytes()?)),
                KEY_NEEDS => needs = Some(Bytes::copy_from_slice(d.bytes()?)),
                KEY_NO_WILD_CARD => no_wild_card = d.boolean()?,
                _ => d.skip()?,
            }
        }
        Ok(Self {
            ttl: ttl.ok_or(WeftError::Invalid)?,
            pub_id: pub_id.ok_or(WeftError::Invalid)?,
            seq_num: seq_num.ok_or(WeftError::Invalid)?,
            ack_requested: ack_requested.ok_or(WeftError::Invalid)?,
            interests: interests.ok_or(WeftError::Invalid)?,
            needs: needs.ok_or(WeftError::Invalid)?,
            no_wild_card,
        })
    }
}

/// Publication plaintext body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PubBody {
    pub topics: Vec<String>,
    pub payload: Bytes,
}

impl PubBody {
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let cap = self.payload.len() + self.topics.iter().map(|t| t.len() + 2).sum::<usize>() + 8;
        let mut e = Encoder::with_capacity(cap);
        e.array(2);
        e.array(self.topics.len());
        for t in &self.topics {
            e.text(t);
        }
        e.bytes(&self.payload);
        e.finish()
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        let mut d = Decoder::new(buf);
        if d.array()? != 2 {
            return Err(WeftError::Invalid);
        }
        let n = d.array()?;
        if n == 0 || n > MAX_LIST_LEN {
            return Err(WeftError::Invalid);
        }
        let mut topics = Vec::with_capacity(n);
        for _ in 0..n {
            topics.push(d.text()?.to_owned());
        }
        let payload = Bytes::copy_from_slice(d.bytes()?);
        Ok(Self { topics, payload })
    }
}

/// Integrity-protected acknowledgement headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckHeaders {
    pub pub_id: Uuid,
    pub seq_num: u32,
}

impl AckHeaders {
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut e = Encoder::with_capacity(32);
        e.map(2);
        e.uint(KEY_PUB_ID);
        encode_uuid(&mut e, &self.pub_id);
        e.uint(KEY_SEQ_NUM);
        e.uint(u64::from(self.seq_num));
        e.finish()
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        let mut d = Decoder::new(buf);
        let pairs = d.map()?;
        let mut pub_id = None;
        let mut seq_num = None;
        let mut last_key = None;
        for _ in 0..pairs {
            let key = d.uint()?;
            if last_key.is_some_and(|k| key <= k) {
                return Err(WeftError::Invalid);
            }
            last_key = Some(key);
            match key {
                KEY_PUB_ID => pub_id = Some(decode_uuid(&mut d)?),
                KEY_SEQ_NUM => seq_num = Some(d.uint32()?),
                _ => d.skip()?,
            }
        }
        Ok(Self {
            pub_id: pub_id.ok_or(WeftError::Invalid)?,
            seq_num: seq_num.ok_or(WeftError::Invalid)?,
        })
    }
}

/// Acknowledgement plaintext body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckBody {
    pub payload: Bytes,
}

impl AckBody {
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut e = Encoder::with_capacity(8 + self.payload.len());
        e.array(1);
        e.bytes(&self.payload);
        e.finish()
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        let mut d = Decoder::new(buf);
        if d.array()? != 1 {
            return Err(WeftError::Invalid);
        }
        Ok(Self {
            payload: Bytes::copy_from_slice(d.bytes()?),
        })
    }
}

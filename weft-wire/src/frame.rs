//! Message envelope and framing.
//!
//! One logical Weft message is a CBOR array of exactly five elements:
//!
//! ```text
//! [ version:u8, type:u8, unprotected:map, protected:bstr|nil, body:bstr|nil ]
//! ```
//!
//! Fixed element counts make forward compatibility explicit: a version bump
//! changes the count. The same array rides either a datagram (one packet =
//! one array) or a framed stream:
//!
//! ```text
//! len:u32(BE) ∥ sender_path:tstr ∥ array bytes      (len covers the rest)
//! ```
//!
//! `StreamDecoder` reassembles stream frames sans-IO:
//! - `Ok(Some(frame))` → one complete message
//! - `Ok(None)` → need more bytes
//! - `Err(..)` → framing violation; the connection must be closed

use crate::cbor::{Decoder, Encoder};
use bytes::{Buf, Bytes, BytesMut};
use weft_core::error::{Result, WeftError};

/// Protocol version carried in every envelope.
pub const MSG_VERSION: u8 = 1;

/// Largest frame accepted from a stream.
pub const MAX_FRAME_LEN: usize = 1 << 20;

/// Unprotected-header map keys.
const HDR_PORT: u64 = 1;
const HDR_PATH: u64 = 2;

/// Message types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MsgType {
    /// Publication
    Pub = 1,
    /// Subscription update
    Sub = 2,
    /// Subscription acknowledgement
    Sak = 3,
    /// End-to-end publication acknowledgement
    Ack = 4,
}

impl TryFrom<u8> for MsgType {
    type Error = WeftError;

    fn try_from(v: u8) -> Result<Self> {
        match v {
            1 => Ok(Self::Pub),
            2 => Ok(Self::Sub),
            3 => Ok(Self::Sak),
            4 => Ok(Self::Ack),
            _ => Err(WeftError::Invalid),
        }
    }
}

/// The unprotected (hop-by-hop) header map.
///
/// Carries the sender's listen port so a receiver can turn the ephemeral
/// source endpoint into a linkable address, and an optional sender path
/// hint used by path-addressed transports.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UnprotectedHeader {
    /// Listen port of the sending node, zero when not listening.
    pub port: u16,
    /// Optional sender path hint.
    pub path: Option<String>,
}

impl UnprotectedHeader {
    fn encode(&self, e: &mut Encoder) {
        let pairs = 1 + usize::from(self.path.is_some());
        e.map(pairs);
        e.uint(HDR_PORT);
        e.uint(u64::from(self.port));
        if let Some(path) = &self.path {
            e.uint(HDR_PATH);
            e.text(path);
        }
    }

    fn decode(d: &mut Decoder<'_>) -> Result<Self> {
        let pairs = d.map()?;
        let mut hdr = Self::default();
        let mut last_key = None;
        for _ in 0..pairs {
            let key = d.uint()?;
            // Canonical maps carry strictly ascending keys
            if last_key.is_some_and(|k| key <= k) {
                return Err(WeftError::Invalid);
            }
            last_key = Some(key);
            match key {
                HDR_PORT => hdr.port = d.uint16()?,
                HDR_PATH => hdr.path = Some(d.text()?.to_owned()),
                // Unknown keys are skipped for forward compatibility
                _ => d.skip()?,
            }
        }
        Ok(hdr)
    }
}

/// One complete protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub msg_type: MsgType,
    pub header: UnprotectedHeader,
    /// Integrity-protected headers (AAD for sealed bodies).
    pub protected: Option<Bytes>,
    /// Message body, possibly sealed.
    pub body: Option<Bytes>,
}

impl Envelope {
    /// Encode to the five-element wire array.
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let cap = 16
            + self.protected.as_ref().map_or(0, Bytes::len)
            + self.body.as_ref().map_or(0, Bytes::len);
        let mut e = Encoder::with_capacity(cap);
        e.array(5);
        e.uint(u64::from(MSG_VERSION));
        e.uint(self.msg_type as u64);
        self.header.encode(&mut e);
        match &self.protected {
            Some(p) => e.bytes(p),
            None => e.null(),
        };
        match &self.body {
            Some(b) => e.bytes(b),
            None => e.null(),
        };
        e.finish()
    }

    /// Decode one wire array. Trailing bytes are a framing violation.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        let mut d = Decoder::new(buf);
        let n = d.array()?;
        if n != 5 {
            return Err(WeftError::Invalid);
        }
        let version = d.uint8()?;
        if version != MSG_VERSION {
            return Err(WeftError::Invalid);
        }
        let msg_type = MsgType::try_from(d.uint8()?)?;
        let header = UnprotectedHeader::decode(&mut d)?;
        let protected = d.bytes_or_null()?.map(Bytes::copy_from_slice);
        let body = d.bytes_or_null()?.map(Bytes::copy_from_slice);
        if !d.is_empty() {
            return Err(WeftError::Invalid);
        }
        Ok(Self {
            msg_type,
            header,
            protected,
            body,
        })
    }
}

/// One reassembled stream frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamFrame {
    /// Sender path hint from the frame prefix (may be empty).
    pub sender_path: String,
    /// The envelope bytes, ready for [`Envelope::decode`].
    pub envelope: Bytes,
}

/// Encode a stream frame around envelope bytes.
#[must_use]
pub fn encode_stream_frame(sender_path: &str, envelope: &[u8]) -> Bytes {
    let mut prefix = Encoder::with_capacity(sender_path.len() + 8);
    prefix.text(sender_path);
    let prefix = prefix.finish();
    let len = prefix.len() + envelope.len();
    let mut out = BytesMut::with_capacity(4 + len);
    out.extend_from_slice(&(len as u32).to_be_bytes());
    out.extend_from_slice(&prefix);
    out.extend_from_slice(envelope);
    out.freeze()
}

/// Stateful stream reassembler.
///
/// Fast path: the whole frame is in the accumulation buffer and splits off
/// zero-copy. Slow path: bytes accumulate across reads until `len` is in
/// hand; one frame dispatches at a time.
#[derive(Debug, Default)]
pub struct StreamDecoder {
    buf: BytesMut,
}

impl StreamDecoder {
    #[must_use]
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(4096),
        }
    }

    /// Feed incoming bytes.
    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Bytes currently buffered.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Try to take one complete frame.
    pub fn next_frame(&mut self) -> Result<Option<StreamFrame>> {
        if self.buf.len() < 4 {
            return Ok(None);
        }
        let len = u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]) as usize;
        if len == 0 || len > MAX_FRAME_LEN {
            return Err(WeftError::Invalid);
        }
        if self.buf.len() < 4 + len {
            return Ok(None);
        }
        let mut frame = self.buf.split_to(4 + len);
        frame.advance(4);
        let frame = frame.freeze();
        let mut d = Decoder::new(&frame);
        let sender_path = d.text().map_err(|_| WeftError::Invalid)?.to_owned();
        let envelope = frame.slice(d.position()..);
        if envelope.is_empty() {
            return Err(WeftError::Invalid);
        }
        Ok(Some(StreamFrame {
            sender_path,
            envelope,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Envelope {
        Envelope {
            msg_type: MsgType::Pub,
            header: UnprotectedHeader {
                port: 7000,
                path: None,
            },
            protected: Some(Bytes::from_static(b"hdrs")),
            body: Some(Bytes::from_static(b"body")),
        }
    }

    #[test]
    fn envelope_roundtrip() {
        let env = sample();
        let enc = env.encode();
        let back = Envelope::decode(&enc).unwrap();
        assert_eq!(back.msg_type, MsgType::Pub);
        assert_eq!(back.header, env.header);
        assert_eq!(back.protected.as_deref(), Some(&b"hdrs"[..]));
        assert_eq!(back.body.as_deref(), Some(&b"body"[..]));
    }

    #[test]
    fn envelope_with_nils() {
        let env = Envelope {
            msg_type: MsgType::Sak,
            header: UnprotectedHeader::default(),
            protected: None,
            body: None,
        };
        let back = Envelope::decode(&env.encode()).unwrap();
        assert_eq!(back.msg_type, MsgType::Sak);
        assert!(back.protected.is_none());
        assert!(back.body.is_none());
    }

    #[test]
    fn bad_version_and_type() {
        let mut env = sample().encode().to_vec();
        // Element 0 is the version byte right after the array head
        env[1] = 0x02;
        assert_eq!(Envelope::decode(&env), Err(WeftError::Invalid));

        let mut env = sample().encode().to_vec();
        env[2] = 0x09; // unknown message type
        assert_eq!(Envelope::decode(&env), Err(WeftError::Invalid));
    }

    #[test]
    fn trailing_garbage_rejected() {
        let mut enc = sample().encode().to_vec();
        enc.push(0x00);
        assert_eq!(Envelope::decode(&enc), Err(WeftError::Invalid));
    }

    #[test]
    fn truncated_envelope_is_eod() {
        let enc = sample().encode();
        assert_eq!(Envelope::decode(&enc[..enc.len() - 2]), Err(WeftError::Eod));
    }

    #[test]
    fn stream_reassembly_across_reads() {
        let env = sample().encode();
        let framed = encode_stream_frame("/tmp/weft.sock", &env);

        let mut dec = StreamDecoder::new();
        // Feed in three fragments
        dec.push(&framed[..3]);
        assert!(dec.next_frame().unwrap().is_none());
        dec.push(&framed[3..10]);
        assert!(dec.next_frame().unwrap().is_none());
        dec.push(&framed[10..]);
        let frame = dec.next_frame().unwrap().unwrap();
        assert_eq!(frame.sender_path, "/tmp/weft.sock");
        assert_eq!(frame.envelope, env);
        assert!(dec.next_frame().unwrap().is_none());
    }

    #[test]
    fn stream_back_to_back_frames() {
        let env = sample().encode();
        let f1 = encode_stream_frame("", &env);
        let f2 = encode_stream_frame("", &env);
        let mut both = f1.to_vec();
        both.extend_from_slice(&f2);

        let mut dec = StreamDecoder::new();
        dec.push(&both);
        assert!(dec.next_frame().unwrap().is_some());
        assert!(dec.next_frame().unwrap().is_some());
        assert!(dec.next_frame().unwrap().is_none());
    }

    #[test]
    fn oversized_frame_is_a_violation() {
        let mut dec = StreamDecoder::new();
        dec.push(&((MAX_FRAME_LEN as u32 + 1).to_be_bytes()));
        assert_eq!(dec.next_frame(), Err(WeftError::Invalid));
    }
}

//! Deterministic CBOR codec.
//!
//! Weft speaks a strict CBOR subset: unsigned and negative integers, byte
//! strings, text strings, definite-length arrays and maps, booleans and
//! null. Encoding is canonical (shortest-length heads, bytewise-ordered map
//! keys) and the decoder *rejects* non-canonical input so that a message
//! has exactly one wire form.
//!
//! Decoder error contract:
//! - `Eod`: more input would be needed (stream reassembly reads more)
//! - `Invalid`: wrong major type, malformed or non-canonical head
//! - `Overflow`: integer does not fit the requested width

use bytes::{BufMut, Bytes, BytesMut};
use weft_core::error::{Result, WeftError};

const MAJOR_UINT: u8 = 0;
const MAJOR_NINT: u8 = 1;
const MAJOR_BYTES: u8 = 2;
const MAJOR_TEXT: u8 = 3;
const MAJOR_ARRAY: u8 = 4;
const MAJOR_MAP: u8 = 5;
const MAJOR_SIMPLE: u8 = 7;

const SIMPLE_FALSE: u64 = 20;
const SIMPLE_TRUE: u64 = 21;
const SIMPLE_NULL: u64 = 22;

/// Canonical CBOR encoder.
#[derive(Debug, Default)]
pub struct Encoder {
    buf: BytesMut,
}

impl Encoder {
    #[must_use]
    pub fn new() -> Self {
        Self { buf: BytesMut::new() }
    }

    #[must_use]
    pub fn with_capacity(cap: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(cap),
        }
    }

    fn head(&mut self, major: u8, value: u64) -> &mut Self {
        let mt = major << 5;
        if value < 24 {
            self.buf.put_u8(mt | value as u8);
        } else if value <= u64::from(u8::MAX) {
            self.buf.put_u8(mt | 24);
            self.buf.put_u8(value as u8);
        } else if value <= u64::from(u16::MAX) {
            self.buf.put_u8(mt | 25);
            self.buf.put_u16(value as u16);
        } else if value <= u64::from(u32::MAX) {
            self.buf.put_u8(mt | 26);
            self.buf.put_u32(value as u32);
        } else {
            self.buf.put_u8(mt | 27);
            self.buf.put_u64(value);
        }
        self
    }

    /// Encode an unsigned integer.
    pub fn uint(&mut self, v: u64) -> &mut Self {
        self.head(MAJOR_UINT, v)
    }

    /// Encode a signed integer.
    pub fn int(&mut self, v: i64) -> &mut Self {
        if v >= 0 {
            self.head(MAJOR_UINT, v as u64)
        } else {
            self.head(MAJOR_NINT, !(v as u64))
        }
    }

    /// Encode a byte string.
    pub fn bytes(&mut self, v: &[u8]) -> &mut Self {
        self.head(MAJOR_BYTES, v.len() as u64);
        self.buf.put_slice(v);
        self
    }

    /// Encode a text string.
    pub fn text(&mut self, v: &str) -> &mut Self {
        self.head(MAJOR_TEXT, v.len() as u64);
        self.buf.put_slice(v.as_bytes());
        self
    }

    /// Start a definite-length array of `len` elements.
    pub fn array(&mut self, len: usize) -> &mut Self {
        self.head(MAJOR_ARRAY, len as u64)
    }

    /// Start a definite-length map of `len` pairs. Keys must be written in
    /// bytewise order; the decoder enforces it.
    pub fn map(&mut self, len: usize) -> &mut Self {
        self.head(MAJOR_MAP, len as u64)
    }

    /// Encode a boolean.
    pub fn boolean(&mut self, v: bool) -> &mut Self {
        self.head(MAJOR_SIMPLE, if v { SIMPLE_TRUE } else { SIMPLE_FALSE })
    }

    /// Encode null.
    pub fn null(&mut self) -> &mut Self {
        self.head(MAJOR_SIMPLE, SIMPLE_NULL)
    }

    /// Splice pre-encoded CBOR verbatim.
    pub fn raw(&mut self, v: &[u8]) -> &mut Self {
        self.buf.put_slice(v);
        self
    }

    /// Bytes written so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Finish and take the encoded bytes.
    #[must_use]
    pub fn finish(self) -> Bytes {
        self.buf.freeze()
    }
}

/// Incremental CBOR decoder over a byte slice.
#[derive(Debug)]
pub struct Decoder<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    #[must_use]
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Bytes not yet consumed.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    /// Current offset into the input.
    #[must_use]
    pub const fn position(&self) -> usize {
        self.pos
    }

    /// Major type of the next item without consuming it.
    pub fn peek_major(&self) -> Result<u8> {
        if self.is_empty() {
            return Err(WeftError::Eod);
        }
        Ok(self.buf[self.pos] >> 5)
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.remaining() < n {
            return Err(WeftError::Eod);
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    /// Read one head, enforcing canonical (shortest) length encoding.
    fn head(&mut self) -> Result<(u8, u64)> {
        let ib = self.take(1)?[0];
        let major = ib >> 5;
        let ai = ib & 0x1f;
        let value = match ai {
            0..=23 => u64::from(ai),
            24 => {
                let v = u64::from(self.take(1)?[0]);
                if v < 24 {
                    return Err(WeftError::Invalid);
                }
                v
            }
            25 => {
                let b = self.take(2)?;
                let v = u64::from(u16::from_be_bytes([b[0], b[1]]));
                if v <= u64::from(u8::MAX) {
                    return Err(WeftError::Invalid);
                }
                v
            }
            26 => {
                let b = self.take(4)?;
                let v = u64::from(u32::from_be_bytes([b[0], b[1], b[2], b[3]]));
                if v <= u64::from(u16::MAX) {
                    return Err(WeftError::Invalid);
                }
                v
            }
            27 => {
                let b = self.take(8)?;
                let v = u64::from_be_bytes(b.try_into().expect("8-byte slice"));
                if v <= u64::from(u32::MAX) {
                    return Err(WeftError::Invalid);
                }
                v
            }
            // Reserved and indefinite-length heads are outside the subset
            _ => return Err(WeftError::Invalid),
        };
        Ok((major, value))
    }

    fn expect(&mut self, major: u8) -> Result<u64> {
        let start = self.pos;
        let (m, v) = self.head()?;
        if m != major {
            self.pos = start;
            return Err(WeftError::Invalid);
        }
        Ok(v)
    }

    /// Decode an unsigned integer.
    pub fn uint(&mut self) -> Result<u64> {
        self.expect(MAJOR_UINT)
    }

    /// Decode an unsigned integer that must fit in 32 bits.
    pub fn uint32(&mut self) -> Result<u32> {
        let v = self.uint()?;
        u32::try_from(v).map_err(|_| WeftError::Overflow)
    }

    /// Decode an unsigned integer that must fit in 16 bits.
    pub fn uint16(&mut self) -> Result<u16> {
        let v = self.uint()?;
        u16::try_from(v).map_err(|_| WeftError::Overflow)
    }

    /// Decode an unsigned integer that must fit in 8 bits.
    pub fn uint8(&mut self) -> Result<u8> {
        let v = self.uint()?;
        u8::try_from(v).map_err(|_| WeftError::Overflow)
    }

    /// Decode a signed integer.
    pub fn int(&mut self) -> Result<i64> {
        let start = self.pos;
        let (m, v) = self.head()?;
        match m {
            MAJOR_UINT => i64::try_from(v).map_err(|_| WeftError::Overflow),
            MAJOR_NINT => {
                if v > i64::MAX as u64 {
                    return Err(WeftError::Overflow);
                }
                Ok(-1 - v as i64)
            }
            _ => {
                self.pos = start;
                Err(WeftError::Invalid)
            }
        }
    }

    /// Decode a signed integer that must fit in 16 bits.
    pub fn int16(&mut self) -> Result<i16> {
        let v = self.int()?;
        i16::try_from(v).map_err(|_| WeftError::Overflow)
    }

    /// Decode a byte string, borrowing from the input.
    pub fn bytes(&mut self) -> Result<&'a [u8]> {
        let len = self.expect(MAJOR_BYTES)?;
        let len = usize::try_from(len).map_err(|_| WeftError::Overflow)?;
        self.take(len)
    }

    /// Decode a text string, borrowing from the input.
    pub fn text(&mut self) -> Result<&'a str> {
        let len = self.expect(MAJOR_TEXT)?;
        let len = usize::try_from(len).map_err(|_| WeftError::Overflow)?;
        std::str::from_utf8(self.take(len)?).map_err(|_| WeftError::Invalid)
    }

    /// Decode an array head, returning the element count.
    pub fn array(&mut self) -> Result<usize> {
        let len = self.expect(MAJOR_ARRAY)?;
        usize::try_from(len).map_err(|_| WeftError::Overflow)
    }

    /// Decode a map head, returning the pair count.
    pub fn map(&mut self) -> Result<usize> {
        let len = self.expect(MAJOR_MAP)?;
        usize::try_from(len).map_err(|_| WeftError::Overflow)
    }

    /// Decode a boolean.
    pub fn boolean(&mut self) -> Result<bool> {
        let start = self.pos;
        let (m, v) = self.head()?;
        match (m, v) {
            (MAJOR_SIMPLE, SIMPLE_TRUE) => Ok(true),
            (MAJOR_SIMPLE, SIMPLE_FALSE) => Ok(false),
            _ => {
                self.pos = start;
                Err(WeftError::Invalid)
            }
        }
    }

    /// Decode a null.
    pub fn null(&mut self) -> Result<()> {
        let start = self.pos;
        let (m, v) = self.head()?;
        if m == MAJOR_SIMPLE && v == SIMPLE_NULL {
            Ok(())
        } else {
            self.pos = start;
            Err(WeftError::Invalid)
        }
    }

    /// Decode either a byte string or null.
    pub fn bytes_or_null(&mut self) -> Result<Option<&'a [u8]>> {
        if self.peek_major()? == MAJOR_SIMPLE {
            self.null()?;
            Ok(None)
        } else {
            self.bytes().map(Some)
        }
    }

    /// Skip one complete item (head plus content, recursively).
    pub fn skip(&mut self) -> Result<()> {
        let (major, value) = self.head()?;
        match major {
            MAJOR_UINT | MAJOR_NINT | MAJOR_SIMPLE => Ok(()),
            MAJOR_BYTES | MAJOR_TEXT => {
                let len = usize::try_from(value).map_err(|_| WeftError::Overflow)?;
                self.take(len)?;
                Ok(())
            }
            MAJOR_ARRAY => {
                for _ in 0..value {
                    self.skip()?;
                }
                Ok(())
            }
            MAJOR_MAP => {
                for _ in 0..value {
                    self.skip()?;
                    self.skip()?;
                }
                Ok(())
            }
            _ => Err(WeftError::Invalid),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn enc(f: impl FnOnce(&mut Encoder)) -> Bytes {
        let mut e = Encoder::new();
        f(&mut e);
        e.finish()
    }

    #[test]
    fn shortest_length_heads() {
        assert_eq!(enc(|e| { e.uint(0); }).as_ref(), &[0x00]);
        assert_eq!(enc(|e| { e.uint(23); }).as_ref(), &[0x17]);
        assert_eq!(enc(|e| { e.uint(24); }).as_ref(), &[0x18, 24]);
        assert_eq!(enc(|e| { e.uint(255); }).as_ref(), &[0x18, 0xff]);
        assert_eq!(enc(|e| { e.uint(256); }).as_ref(), &[0x19, 0x01, 0x00]);
        assert_eq!(
            enc(|e| { e.uint(65536); }).as_ref(),
            &[0x1a, 0x00, 0x01, 0x00, 0x00]
        );
    }

    #[test]
    fn negative_integers() {
        assert_eq!(enc(|e| { e.int(-1); }).as_ref(), &[0x20]);
        assert_eq!(enc(|e| { e.int(-500); }).as_ref(), &[0x39, 0x01, 0xf3]);
        let b = enc(|e| { e.int(-500); });
        assert_eq!(Decoder::new(&b).int().unwrap(), -500);
        assert_eq!(Decoder::new(&b).int16().unwrap(), -500i16);
    }

    #[test]
    fn non_canonical_heads_rejected() {
        // 24 with a value below 24 must have used the immediate form
        assert_eq!(Decoder::new(&[0x18, 0x05]).uint(), Err(WeftError::Invalid));
        // Two-byte length for a value that fits one byte
        assert_eq!(Decoder::new(&[0x19, 0x00, 0x30]).uint(), Err(WeftError::Invalid));
        // Indefinite length is outside the subset
        assert_eq!(Decoder::new(&[0x5f]).bytes(), Err(WeftError::Invalid));
    }

    #[test]
    fn eod_vs_invalid() {
        // Empty input: need more bytes
        assert_eq!(Decoder::new(&[]).uint(), Err(WeftError::Eod));
        // Truncated payload: need more bytes
        let mut partial = enc(|e| { e.bytes(&[1, 2, 3, 4]); }).to_vec();
        partial.truncate(3);
        assert_eq!(Decoder::new(&partial).bytes(), Err(WeftError::Eod));
        // Wrong major type: invalid, and the position is not consumed
        let b = enc(|e| { e.text("hi"); });
        let mut d = Decoder::new(&b);
        assert_eq!(d.bytes(), Err(WeftError::Invalid));
        assert_eq!(d.text().unwrap(), "hi");
    }

    #[test]
    fn width_overflow() {
        let b = enc(|e| { e.uint(u64::from(u32::MAX) + 1); });
        assert_eq!(Decoder::new(&b).uint32(), Err(WeftError::Overflow));
        let b = enc(|e| { e.uint(300); });
        assert_eq!(Decoder::new(&b).uint8(), Err(WeftError::Overflow));
    }

    #[test]
    fn arrays_and_maps() {
        let b = enc(|e| {
            e.array(3);
            e.uint(1);
            e.text("x");
            e.map(1);
            e.uint(1);
            e.boolean(true);
        });
        let mut d = Decoder::new(&b);
        assert_eq!(d.array().unwrap(), 3);
        assert_eq!(d.uint().unwrap(), 1);
        assert_eq!(d.text().unwrap(), "x");
        assert_eq!(d.map().unwrap(), 1);
        assert_eq!(d.uint().unwrap(), 1);
        assert!(d.boolean().unwrap());
        assert!(d.is_empty());
    }

    #[test]
    fn skip_whole_items() {
        let b = enc(|e| {
            e.array(2);
            e.map(1);
            e.uint(9);
            e.bytes(&[1, 2, 3]);
            e.uint(7);
        });
        let mut d = Decoder::new(&b);
        assert_eq!(d.array().unwrap(), 2);
        d.skip().unwrap(); // the whole map
        assert_eq!(d.uint().unwrap(), 7);
        assert!(d.is_empty());
    }

    #[test]
    fn null_and_option() {
        let b = enc(|e| {
            e.null();
            e.bytes(&[9]);
        });
        let mut d = Decoder::new(&b);
        assert_eq!(d.bytes_or_null().unwrap(), None);
        assert_eq!(d.bytes_or_null().unwrap(), Some(&[9u8][..]));
    }
}

//! Interest summary Bloom filter.
//!
//! Design:
//! - Fixed bit length (multiple of 64, default 8192) shared across a mesh.
//! - `set`/`test` derive k positions from a 64-bit input via double hashing
//!   (`base + i*step mod m`, step forced odd), default k = 4.
//! - Serialization picks the shorter of a raw bitmap and a run-length
//!   encoding; a leading discriminator byte tells the decoder which form
//!   it is looking at.
//! - Subscription updates may travel as xor deltas against the last vector
//!   the peer acknowledged (`xor_delta` / `apply_delta`).

use crate::error::{Result, WeftError};
use bytes::{BufMut, Bytes, BytesMut};

/// Default bit length of interest vectors.
pub const DEFAULT_BIT_LEN: usize = 8192;

/// Default number of hash positions per entry.
pub const DEFAULT_HASHES: usize = 4;

/// Upper bound accepted from the wire; anything bigger is a framing attack.
const MAX_BIT_LEN: usize = 1 << 20;

const FORM_RAW: u8 = 0x00;
const FORM_RLE: u8 = 0x01;

/// Fixed-size Bloom filter over hashed topic tokens.
#[derive(Clone, PartialEq, Eq)]
pub struct BitVector {
    words: Vec<u64>,
    bit_len: usize,
    hashes: usize,
}

impl std::fmt::Debug for BitVector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BitVector")
            .field("bit_len", &self.bit_len)
            .field("hashes", &self.hashes)
            .field("population", &self.population())
            .finish()
    }
}

#[inline]
const fn mix64(mut x: u64) -> u64 {
    // splitmix64 finalizer
    x = x.wrapping_add(0x9e37_79b9_7f4a_7c15);
    x = (x ^ (x >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    x = (x ^ (x >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    x ^ (x >> 31)
}

impl BitVector {
    /// Create an all-clear vector with the default parameters.
    #[must_use]
    pub fn new() -> Self {
        Self::with_params(DEFAULT_BIT_LEN, DEFAULT_HASHES).expect("default params are valid")
    }

    /// Create an all-clear vector with explicit parameters.
    ///
    /// `bit_len` must be a nonzero multiple of 64 and `hashes` nonzero,
    /// otherwise `Args` is returned.
    pub fn with_params(bit_len: usize, hashes: usize) -> Result<Self> {
        if bit_len == 0 || bit_len % 64 != 0 || bit_len > MAX_BIT_LEN || hashes == 0 {
            return Err(WeftError::Args);
        }
        Ok(Self {
            words: vec![0; bit_len / 64],
            bit_len,
            hashes,
        })
    }

    /// Bit length of this vector.
    #[must_use]
    pub const fn bit_len(&self) -> usize {
        self.bit_len
    }

    /// Number of hash positions per entry.
    #[must_use]
    pub const fn hashes(&self) -> usize {
        self.hashes
    }

    /// True when the two vectors have identical parameters.
    #[must_use]
    pub const fn same_shape(&self, other: &Self) -> bool {
        self.bit_len == other.bit_len && self.hashes == other.hashes
    }

    #[inline]
    fn positions(&self, x: u64) -> impl Iterator<Item = usize> + '_ {
        let m = self.bit_len as u64;
        let base = mix64(x);
        let step = mix64(x ^ 0x9e37_79b9_7f4a_7c15) | 1;
        (0..self.hashes as u64).map(move |i| (base.wrapping_add(i.wrapping_mul(step)) % m) as usize)
    }

    #[inline]
    pub(crate) fn set_bit(&mut self, idx: usize) {
        self.words[idx / 64] |= 1u64 << (idx % 64);
    }

    #[inline]
    pub(crate) fn test_bit(&self, idx: usize) -> bool {
        (self.words[idx / 64] >> (idx % 64)) & 1 != 0
    }

    /// Add an entry to the filter.
    pub fn set(&mut self, x: u64) {
        for idx in self.positions(x).collect::<smallvec::SmallVec<[usize; 8]>>() {
            self.set_bit(idx);
        }
    }

    /// Test whether an entry may be present (false positives possible).
    #[must_use]
    pub fn test(&self, x: u64) -> bool {
        self.positions(x).collect::<smallvec::SmallVec<[usize; 8]>>()
            .iter()
            .all(|&idx| self.test_bit(idx))
    }

    /// OR another vector into this one.
    pub fn union_with(&mut self, other: &Self) -> Result<()> {
        if !self.same_shape(other) {
            return Err(WeftError::Args);
        }
        for (w, o) in self.words.iter_mut().zip(&other.words) {
            *w |= o;
        }
        Ok(())
    }

    /// Clear every position that is set in `other` ("LHS and not RHS").
    pub fn subtract(&mut self, other: &Self) -> Result<()> {
        if !self.same_shape(other) {
            return Err(WeftError::Args);
        }
        for (w, o) in self.words.iter_mut().zip(&other.words) {
            *w &= !o;
        }
        Ok(())
    }

    /// True when the two vectors share at least one set position.
    #[must_use]
    pub fn intersects(&self, other: &Self) -> bool {
        self.words.iter().zip(&other.words).any(|(w, o)| w & o != 0)
    }

    /// Number of positions set in both vectors.
    #[must_use]
    pub fn intersection_count(&self, other: &Self) -> usize {
        self.words
            .iter()
            .zip(&other.words)
            .map(|(w, o)| (w & o).count_ones() as usize)
            .sum()
    }

    /// True when every position set in `other` is also set in `self`.
    #[must_use]
    pub fn includes(&self, other: &Self) -> bool {
        self.words.iter().zip(&other.words).all(|(w, o)| o & !w == 0)
    }

    /// Number of set positions.
    #[must_use]
    pub fn population(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// Set every position. Used for interest-in-everything subscriptions.
    pub fn fill(&mut self) {
        self.words.fill(u64::MAX);
    }

    /// Clear every position.
    pub fn clear(&mut self) {
        self.words.fill(0);
    }

    /// True when no position is set.
    #[must_use]
    pub fn is_clear(&self) -> bool {
        self.words.iter().all(|w| *w == 0)
    }

    /// The xor of this vector against a previous version.
    ///
    /// Applying the result to `prev` with [`apply_delta`](Self::apply_delta)
    /// reproduces `self`.
    pub fn xor_delta(&self, prev: &Self) -> Result<Self> {
        if !self.same_shape(prev) {
            return Err(WeftError::Args);
        }
        let mut out = self.clone();
        for (w, p) in out.words.iter_mut().zip(&prev.words) {
            *w ^= p;
        }
        Ok(out)
    }

    /// Apply an xor delta in place.
    pub fn apply_delta(&mut self, delta: &Self) -> Result<()> {
        if !self.same_shape(delta) {
            return Err(WeftError::Args);
        }
        for (w, d) in self.words.iter_mut().zip(&delta.words) {
            *w ^= d;
        }
        Ok(())
    }

    /// Serialize to the compressed wire form.
    ///
    /// Layout: `form:u8 ∥ bit_len:u32(BE) ∥ payload`. The payload is either
    /// the raw little-endian bitmap or alternating-run lengths (LEB128
    /// varints, zeros first), whichever is shorter.
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let raw_len = self.bit_len / 8;
        let mut out = BytesMut::with_capacity(5 + raw_len);
        match self.encode_rle(raw_len) {
            Some(rle) => {
                out.put_u8(FORM_RLE);
                out.put_u32(self.bit_len as u32);
                out.extend_from_slice(&rle);
            }
            None => {
                out.put_u8(FORM_RAW);
                out.put_u32(self.bit_len as u32);
                for w in &self.words {
                    out.put_u64_le(*w);
                }
            }
        }
        out.freeze()
    }

    /// Run-length encode the bit stream; `None` when raw is no longer.
    fn encode_rle(&self, raw_len: usize) -> Option<Vec<u8>> {
        let mut out = Vec::with_capacity(raw_len);
        let mut run_value = false;
        let mut run_len: u32 = 0;
        for idx in 0..self.bit_len {
            let bit = self.test_bit(idx);
            if bit == run_value {
                run_len += 1;
            } else {
                put_varint(&mut out, run_len);
                run_value = bit;
                run_len = 1;
            }
            if out.len() >= raw_len {
                return None;
            }
        }
        put_varint(&mut out, run_len);
        (out.len() < raw_len).then_some(out)
    }

    /// Deserialize a vector encoded by [`encode`](Self::encode).
    ///
    /// The hash count is not carried on the wire (it is a mesh-wide
    /// constant); the default applies unless
    /// [`decode_with_hashes`](Self::decode_with_hashes) is used.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        Self::decode_with_hashes(buf, DEFAULT_HASHES)
    }

    /// Deserialize with an explicit hash count.
    pub fn decode_with_hashes(buf: &[u8], hashes: usize) -> Result<Self> {
        if buf.len() < 5 {
            return Err(WeftError::Eod);
        }
        let form = buf[0];
        let bit_len = u32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]) as usize;
        let mut bv = Self::with_params(bit_len, hashes).map_err(|_| WeftError::Invalid)?;
        let payload = &buf[5..];
        match form {
            FORM_RAW => {
                let raw_len = bit_len / 8;
                if payload.len() < raw_len {
                    return Err(WeftError::Eod);
                }
                if payload.len() > raw_len {
                    return Err(WeftError::Invalid);
                }
                for (i, w) in bv.words.iter_mut().enumerate() {
                    let off = i * 8;
                    *w = u64::from_le_bytes(
                        payload[off..off + 8].try_into().expect("8-byte chunk"),
                    );
                }
                Ok(bv)
            }
            FORM_RLE => {
                let mut pos = 0usize;
                let mut idx = 0usize;
                let mut value = false;
                while pos < payload.len() {
                    let (run, used) = get_varint(&payload[pos..])?;
                    pos += used;
                    let run = run as usize;
                    if run > bit_len - idx {
                        return Err(WeftError::Invalid);
                    }
                    if value {
                        for i in idx..idx + run {
                            bv.set_bit(i);
                        }
                    }
                    idx += run;
                    value = !value;
                }
                if idx != bit_len {
                    return Err(WeftError::Invalid);
                }
                Ok(bv)
            }
            _ => Err(WeftError::Invalid),
        }
    }
}

impl Default for BitVector {
    fn default() -> Self {
        Self::new()
    }
}

fn put_varint(out: &mut Vec<u8>, mut v: u32) {
    while v >= 0x80 {
        out.push((v as u8 & 0x7f) | 0x80);
        v >>= 7;
    }
    out.push(v as u8);
}

fn get_varint(buf: &[u8]) -> Result<(u32, usize)> {
    let mut v: u32 = 0;
    for (i, b) in buf.iter().enumerate() {
        if i >= 5 {
            return Err(WeftError::Invalid);
        }
        v = u32::from(b & 0x7f)
            .checked_shl(7 * i as u32)
            .and_then(|shifted| v.checked_add(shifted))
            .ok_or(WeftError::Overflow)?;
        if b & 0x80 == 0 {
            return Ok((v, i + 1));
        }
    }
    Err(WeftError::Eod)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_and_test() {
        let mut bv = BitVector::new();
        bv.set(17);
        bv.set(42);
        assert!(bv.test(17));
        assert!(bv.test(42));
        assert!(!bv.test(43));
        // k=4 positions per entry, minus possible collisions
        assert!(bv.population() > 0 && bv.population() <= 8);
    }

    #[test]
    fn sparse_roundtrip_is_compressed() {
        let mut bv = BitVector::new();
        bv.set(1);
        bv.set(99);
        let enc = bv.encode();
        assert_eq!(enc[0], FORM_RLE);
        assert!(enc.len() <= 5 + DEFAULT_BIT_LEN / 8);
        let back = BitVector::decode(&enc).unwrap();
        assert_eq!(back, bv);
    }

    #[test]
    fn dense_roundtrip_falls_back_to_raw() {
        let mut bv = BitVector::with_params(256, 4).unwrap();
        // Alternate bits: worst case for RLE
        for i in (0..256).step_by(2) {
            bv.set_bit(i);
        }
        let enc = bv.encode();
        assert_eq!(enc[0], FORM_RAW);
        assert_eq!(enc.len(), 5 + 256 / 8);
        let back = BitVector::decode(&enc).unwrap();
        assert_eq!(back, bv);
    }

    #[test]
    fn filled_and_empty_roundtrip() {
        let mut bv = BitVector::new();
        assert_eq!(BitVector::decode(&bv.encode()).unwrap(), bv);
        bv.fill();
        assert_eq!(BitVector::decode(&bv.encode()).unwrap(), bv);
    }

    #[test]
    fn delta_identity() {
        let mut prev = BitVector::new();
        prev.set(7);
        let mut next = prev.clone();
        next.set(1234);
        let delta = next.xor_delta(&prev).unwrap();
        let mut rebuilt = prev.clone();
        rebuilt.apply_delta(&delta).unwrap();
        assert_eq!(rebuilt, next);
    }

    #[test]
    fn subtract_removes_overlap() {
        let mut a = BitVector::new();
        a.set(1);
        a.set(2);
        let mut b = BitVector::new();
        b.set(2);
        a.subtract(&b).unwrap();
        assert!(a.test(1));
        assert!(!a.test(2));
    }

    #[test]
    fn includes_is_superset() {
        let mut a = BitVector::new();
        a.set(5);
        a.set(6);
        let mut b = BitVector::new();
        b.set(5);
        assert!(a.includes(&b));
        assert!(!b.includes(&a));
        let empty = BitVector::new();
        assert!(b.includes(&empty));
    }

    #[test]
    fn decode_rejects_garbage() {
        assert_eq!(BitVector::decode(&[0x02, 0, 0, 32, 0]), Err(WeftError::Invalid));
        assert_eq!(BitVector::decode(&[0x00, 0, 0]), Err(WeftError::Eod));
        // Raw form with too few payload bytes
        let mut short = vec![0x00, 0x00, 0x00, 0x00, 0x40];
        short.extend_from_slice(&[0u8; 4]);
        assert_eq!(BitVector::decode(&short), Err(WeftError::Eod));
        // RLE runs that do not add up to the bit length
        let bad = vec![0x01, 0x00, 0x00, 0x00, 0x40, 0x07];
        assert_eq!(BitVector::decode(&bad), Err(WeftError::Invalid));
    }

    #[test]
    fn shape_mismatch_is_args() {
        let mut a = BitVector::with_params(128, 4).unwrap();
        let b = BitVector::with_params(256, 4).unwrap();
        assert_eq!(a.union_with(&b), Err(WeftError::Args));
    }
}

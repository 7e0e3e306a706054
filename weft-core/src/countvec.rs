//! Counter-vector aggregation of interest summaries.
//!
//! A node's advertised interests are the union of many contributors (local
//! subscriptions plus every forwarding remote); its advertised needs are the
//! intersection. Contributors come and go, so each position carries a small
//! counter instead of a single bit:
//! - `add`/`sub` track one contributor's [`BitVector`] joining or leaving
//! - `to_union` reads the aggregate as "any contributor set this"
//! - `to_intersection` reads it as "every contributor set this"
//!
//! Counters never go negative; an unbalanced `sub` is a programming error
//! and fails with `Invalid`.

use crate::bitvec::BitVector;
use crate::error::{Result, WeftError};

/// Vector of per-position contributor counters.
#[derive(Clone)]
pub struct CountVector {
    counts: Vec<u8>,
    bit_len: usize,
    hashes: usize,
    contributors: u32,
}

impl std::fmt::Debug for CountVector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CountVector")
            .field("bit_len", &self.bit_len)
            .field("contributors", &self.contributors)
            .finish()
    }
}

impl CountVector {
    /// Create an empty aggregate with the given vector parameters.
    pub fn with_params(bit_len: usize, hashes: usize) -> Result<Self> {
        // Parameter validation is shared with BitVector
        let probe = BitVector::with_params(bit_len, hashes)?;
        Ok(Self {
            counts: vec![0; probe.bit_len()],
            bit_len,
            hashes,
            contributors: 0,
        })
    }

    /// Number of contributors currently aggregated.
    #[must_use]
    pub const fn contributors(&self) -> u32 {
        self.contributors
    }

    /// True when nothing has been aggregated.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.contributors == 0
    }

    fn check_shape(&self, bv: &BitVector) -> Result<()> {
        if bv.bit_len() != self.bit_len || bv.hashes() != self.hashes {
            return Err(WeftError::Args);
        }
        Ok(())
    }

    /// Add one contributor's vector to the aggregate.
    pub fn add(&mut self, bv: &BitVector) -> Result<()> {
        self.check_shape(bv)?;
        // Pre-check so a failed add leaves the aggregate untouched
        for idx in 0..self.bit_len {
            if bv.test_bit(idx) && self.counts[idx] == u8::MAX {
                return Err(WeftError::Overflow);
            }
        }
        for idx in 0..self.bit_len {
            if bv.test_bit(idx) {
                self.counts[idx] += 1;
            }
        }
        self.contributors = self.contributors.checked_add(1).ok_or(WeftError::Overflow)?;
        Ok(())
    }

    /// Remove one contributor's vector from the aggregate.
    ///
    /// The vector must be identical to the one that was added; decrementing
    /// a zero counter fails with `Invalid` and leaves the aggregate
    /// untouched.
    pub fn sub(&mut self, bv: &BitVector) -> Result<()> {
        self.check_shape(bv)?;
        if self.contributors == 0 {
            return Err(WeftError::Invalid);
        }
        for idx in 0..self.bit_len {
            if bv.test_bit(idx) && self.counts[idx] == 0 {
                return Err(WeftError::Invalid);
            }
        }
        for idx in 0..self.bit_len {
            if bv.test_bit(idx) {
                self.counts[idx] -= 1;
            }
        }
        self.contributors -= 1;
        Ok(())
    }

    /// The OR of all contributors: any nonzero counter reads as set.
    #[must_use]
    pub fn to_union(&self) -> BitVector {
        let mut out = BitVector::with_params(self.bit_len, self.hashes).expect("params validated");
        for (idx, c) in self.counts.iter().enumerate() {
            if *c > 0 {
                out.set_bit(idx);
            }
        }
        out
    }

    /// The AND of all contributors: a counter equal to the contributor
    /// count reads as set. With no contributors the result is all-clear,
    /// which downstream consumers treat as "no requirement".
    #[must_use]
    pub fn to_intersection(&self) -> BitVector {
        let mut out = BitVector::with_params(self.bit_len, self.hashes).expect("params validated");
        if self.contributors == 0 {
            return out;
        }
        let full = self.contributors.min(u32::from(u8::MAX)) as u8;
        for (idx, c) in self.counts.iter().enumerate() {
            if *c == full {
                out.set_bit(idx);
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bv(entries: &[u64]) -> BitVector {
        let mut v = BitVector::with_params(256, 4).unwrap();
        for e in entries {
            v.set(*e);
        }
        v
    }

    #[test]
    fn add_then_sub_returns_to_zero() {
        let mut cv = CountVector::with_params(256, 4).unwrap();
        let a = bv(&[1, 2]);
        let b = bv(&[2, 3]);
        cv.add(&a).unwrap();
        cv.add(&b).unwrap();
        cv.sub(&a).unwrap();
        cv.sub(&b).unwrap();
        assert!(cv.to_union().is_clear());
        assert!(cv.is_empty());
    }

    #[test]
    fn union_covers_all_contributors() {
        let mut cv = CountVector::with_params(256, 4).unwrap();
        let a = bv(&[10]);
        let b = bv(&[20]);
        cv.add(&a).unwrap();
        cv.add(&b).unwrap();
        let u = cv.to_union();
        assert!(u.includes(&a));
        assert!(u.includes(&b));
    }

    #[test]
    fn intersection_is_common_bits_only() {
        let mut cv = CountVector::with_params(256, 4).unwrap();
        let a = bv(&[7, 8]);
        let b = bv(&[7, 9]);
        cv.add(&a).unwrap();
        cv.add(&b).unwrap();
        let i = cv.to_intersection();
        assert!(i.test(7));
        // Entry 8 is only in one contributor so it cannot survive the AND
        assert!(!i.test(8) || a.intersects(&b));
        // Single contributor: intersection equals that contributor
        cv.sub(&b).unwrap();
        assert_eq!(cv.to_intersection(), a);
    }

    #[test]
    fn empty_intersection_is_clear() {
        let cv = CountVector::with_params(256, 4).unwrap();
        assert!(cv.to_intersection().is_clear());
    }

    #[test]
    fn unbalanced_sub_is_invalid() {
        let mut cv = CountVector::with_params(256, 4).unwrap();
        let a = bv(&[1]);
        assert_eq!(cv.sub(&a), Err(WeftError::Invalid));
        cv.add(&bv(&[2])).unwrap();
        assert_eq!(cv.sub(&a), Err(WeftError::Invalid));
        // Aggregate unchanged after the failed sub
        assert_eq!(cv.contributors(), 1);
        assert!(cv.to_union().test(2));
    }
}

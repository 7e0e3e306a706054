//! Topic tokenization, hashing and wildcard matching.
//!
//! Topics are strings tokenized on a per-node separator set (default `/`).
//! Two derived summaries exist per topic list:
//! - the **interest** vector: hashed token-prefix chains in the main Bloom
//!   space, used for the cheap may-match routing test
//! - the **needs** vector: hashes in a second, smaller space that narrow
//!   interest false positives on upstream peers
//!
//! The Bloom vectors are filters only; final delivery always re-checks the
//! full topic strings with the wildcard rules below:
//! - `+` matches exactly one publication token
//! - `#` matches the remaining tokens and is only legal as the last token
//! - wildcards never match a publication that set `no_wild_card`
//! - anything else must be byte-equal

use crate::bitvec::{BitVector, DEFAULT_BIT_LEN, DEFAULT_HASHES};
use crate::error::{Result, WeftError};
use smallvec::SmallVec;

/// Default bit length of the needs space.
pub const DEFAULT_NEEDS_BIT_LEN: usize = 1024;

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// Seed that keeps needs-space hashes independent of interest hashes.
const NEEDS_SEED: u64 = 0x7ee0_51a6_0c4f_b7d1;

fn fnv1a(seed: u64, bytes: &[u8]) -> u64 {
    let mut h = FNV_OFFSET ^ seed;
    for b in bytes {
        h ^= u64::from(*b);
        h = h.wrapping_mul(FNV_PRIME);
    }
    h
}

/// Hashing configuration for one mesh: separator set plus the shapes of the
/// interest and needs spaces. All nodes in a mesh must agree on these.
#[derive(Debug, Clone)]
pub struct TopicSpace {
    separators: String,
    bit_len: usize,
    hashes: usize,
    needs_len: usize,
}

impl TopicSpace {
    /// Create a space with the default vector shapes.
    pub fn new(separators: &str) -> Result<Self> {
        Self::with_params(separators, DEFAULT_BIT_LEN, DEFAULT_HASHES, DEFAULT_NEEDS_BIT_LEN)
    }

    /// Create a space with explicit vector shapes.
    pub fn with_params(
        separators: &str,
        bit_len: usize,
        hashes: usize,
        needs_len: usize,
    ) -> Result<Self> {
        if separators.is_empty() || separators.contains(['+', '#']) {
            return Err(WeftError::Args);
        }
        // Validate shapes once here so vector constructors cannot fail later
        BitVector::with_params(bit_len, hashes)?;
        BitVector::with_params(needs_len, hashes)?;
        Ok(Self {
            separators: separators.to_owned(),
            bit_len,
            hashes,
            needs_len,
        })
    }

    /// The separator characters.
    #[must_use]
    pub fn separators(&self) -> &str {
        &self.separators
    }

    /// An all-clear vector shaped for the interest space.
    #[must_use]
    pub fn interest_vector(&self) -> BitVector {
        BitVector::with_params(self.bit_len, self.hashes).expect("shape validated")
    }

    /// An all-clear vector shaped for the needs space.
    #[must_use]
    pub fn needs_vector(&self) -> BitVector {
        BitVector::with_params(self.needs_len, self.hashes).expect("shape validated")
    }

    fn is_separator(&self, c: char) -> bool {
        self.separators.contains(c)
    }

    fn tokens<'a>(&self, topic: &'a str) -> SmallVec<[&'a str; 8]> {
        topic
            .split(|c| self.is_separator(c))
            .filter(|t| !t.is_empty())
            .collect()
    }

    /// Validate a topic string.
    ///
    /// A topic must contain at least one non-separator token. When
    /// `wildcards_allowed` is false (publication side) any `+` or `#` token
    /// is rejected; otherwise `#` must be the last token.
    pub fn validate_topic(&self, topic: &str, wildcards_allowed: bool) -> Result<()> {
        let toks = self.tokens(topic);
        if toks.is_empty() {
            return Err(WeftError::Invalid);
        }
        for (i, t) in toks.iter().enumerate() {
            match *t {
                "#" => {
                    if !wildcards_allowed || i + 1 != toks.len() {
                        return Err(WeftError::Invalid);
                    }
                }
                "+" => {
                    if !wildcards_allowed {
                        return Err(WeftError::Invalid);
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn primary_separator(&self) -> char {
        self.separators.chars().next().expect("non-empty separator set")
    }

    /// Canonical prefix string of the first `n` tokens.
    fn prefix(&self, toks: &[&str], n: usize) -> String {
        let sep = self.primary_separator();
        let mut out = String::new();
        for t in &toks[..n] {
            if !out.is_empty() {
                out.push(sep);
            }
            out.push_str(t);
        }
        out
    }

    /// Build the interest and needs-cover vectors for a publication's
    /// topic list.
    ///
    /// Every token-prefix chain is hashed so wildcard subscriptions can
    /// intersect on a leading prefix, unless `no_wild_card` is set, in
    /// which case only the full topic string is hashed and wildcard
    /// subscriptions cannot see the publication even at the filter level.
    pub fn publication_vectors(
        &self,
        topics: &[String],
        no_wild_card: bool,
    ) -> Result<(BitVector, BitVector)> {
        let mut interests = self.interest_vector();
        let mut needs = self.needs_vector();
        for topic in topics {
            self.validate_topic(topic, false)?;
            let toks = self.tokens(topic);
            for n in 1..=toks.len() {
                let chain = self.prefix(&toks, n);
                if !no_wild_card || n == toks.len() {
                    interests.set(fnv1a(0, chain.as_bytes()));
                }
                needs.set(fnv1a(NEEDS_SEED, chain.as_bytes()));
            }
        }
        Ok((interests, needs))
    }

    /// Build the interest and needs vectors for a subscription's topic
    /// list.
    ///
    /// Each topic contributes its longest wildcard-free prefix chain. A
    /// topic led by a wildcard has no usable prefix: it fills the interest
    /// vector (interest in everything) and contributes nothing to needs.
    pub fn subscription_vectors(&self, topics: &[String]) -> Result<(BitVector, BitVector)> {
        let mut interests = self.interest_vector();
        let mut needs = self.needs_vector();
        for topic in topics {
            self.validate_topic(topic, true)?;
            let toks = self.tokens(topic);
            let concrete = toks.iter().take_while(|t| **t != "+" && **t != "#").count();
            if concrete == 0 {
                interests.fill();
                continue;
            }
            let chain = self.prefix(&toks, concrete);
            interests.set(fnv1a(0, chain.as_bytes()));
            needs.set(fnv1a(NEEDS_SEED, chain.as_bytes()));
        }
        Ok((interests, needs))
    }

    /// Match one subscription topic against one publication topic.
    #[must_use]
    pub fn match_topic(&self, sub_topic: &str, pub_topic: &str, no_wild_card: bool) -> bool {
        let st = self.tokens(sub_topic);
        let pt = self.tokens(pub_topic);
        let mut i = 0usize;
        for s in &st {
            match *s {
                "#" => return !no_wild_card,
                "+" => {
                    if no_wild_card || i >= pt.len() {
                        return false;
                    }
                    i += 1;
                }
                tok => {
                    if i >= pt.len() || pt[i] != tok {
                        return false;
                    }
                    i += 1;
                }
            }
        }
        i == pt.len()
    }

    /// Match a subscription's topic list against a publication's.
    ///
    /// Multi-topic subscriptions use AND semantics: every subscription
    /// topic must match at least one publication topic.
    #[must_use]
    pub fn match_publication(
        &self,
        sub_topics: &[String],
        pub_topics: &[String],
        no_wild_card: bool,
    ) -> bool {
        !sub_topics.is_empty()
            && sub_topics.iter().all(|s| {
                pub_topics
                    .iter()
                    .any(|p| self.match_topic(s, p, no_wild_card))
            })
    }
}

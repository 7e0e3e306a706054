//! Recently-seen publication history.
//!
//! A short bounded map of `(publisher UUID, sequence number)` pairs with two
//! jobs:
//! - **dedup / loop suppression**: an inbound publication whose sequence
//!   number is at or below the recorded one is stale and must not be
//!   delivered or forwarded again
//! - **ack routing**: the entry remembers the ingress the publication
//!   arrived on, so a later acknowledgement for the same publication can be
//!   routed back along the path the publication took
//!
//! The route type is generic; the node layer instantiates it with its
//! address type.

use crate::error::{Result, WeftError};
use hashbrown::HashMap;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Default number of publications remembered.
pub const DEFAULT_HISTORY_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
struct Entry<A> {
    sn: u32,
    expires: Instant,
    route: Option<A>,
    ack_requested: bool,
}

/// Bounded history of recently seen publications.
#[derive(Debug)]
pub struct History<A> {
    entries: HashMap<Uuid, Entry<A>>,
    capacity: usize,
}

impl<A: Clone> History<A> {
    /// Create a history bounded to `capacity` publications.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::with_capacity(capacity.min(64)),
            capacity: capacity.max(1),
        }
    }

    /// Number of publications currently remembered.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when nothing is remembered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// True when `(pub_id, sn)` has already been seen.
    #[must_use]
    pub fn is_stale(&self, pub_id: &Uuid, sn: u32) -> bool {
        self.entries.get(pub_id).is_some_and(|e| sn <= e.sn)
    }

    /// The recorded sequence number for a publication, if any.
    #[must_use]
    pub fn sequence_num(&self, pub_id: &Uuid) -> Option<u32> {
        self.entries.get(pub_id).map(|e| e.sn)
    }

    /// Record a publication sighting.
    ///
    /// Stale sightings fail with `Stale` and leave the entry untouched.
    /// When the history is full the entry closest to expiry is evicted.
    pub fn record(
        &mut self,
        pub_id: Uuid,
        sn: u32,
        hold: Duration,
        now: Instant,
        route: Option<A>,
        ack_requested: bool,
    ) -> Result<()> {
        if self.is_stale(&pub_id, sn) {
            return Err(WeftError::Stale);
        }
        if !self.entries.contains_key(&pub_id) && self.entries.len() >= self.capacity {
            self.evict_soonest();
        }
        self.entries.insert(
            pub_id,
            Entry {
                sn,
                expires: now + hold,
                route,
                ack_requested,
            },
        );
        Ok(())
    }

    /// The ingress an acknowledgement for `pub_id` should be routed to.
    ///
    /// Only publications that asked for an acknowledgement keep a usable
    /// route; everything else reports `NoRoute`.
    pub fn ack_route(&self, pub_id: &Uuid) -> Result<&A> {
        self.entries
            .get(pub_id)
            .filter(|e| e.ack_requested)
            .and_then(|e| e.route.as_ref())
            .ok_or(WeftError::NoRoute)
    }

    /// The ingress the latest sighting of `pub_id` arrived on.
    #[must_use]
    pub fn ingress(&self, pub_id: &Uuid) -> Option<&A> {
        self.entries.get(pub_id).and_then(|e| e.route.as_ref())
    }

    /// Drop expired entries.
    pub fn sweep(&mut self, now: Instant) {
        self.entries.retain(|_, e| e.expires > now);
    }

    /// Forget one publication outright.
    pub fn forget(&mut self, pub_id: &Uuid) {
        self.entries.remove(pub_id);
    }

    fn evict_soonest(&mut self) {
        if let Some(id) = self
            .entries
            .iter()
            .min_by_key(|(_, e)| e.expires)
            .map(|(id, _)| *id)
        {
            self.entries.remove(&id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOLD: Duration = Duration::from_secs(10);

    #[test]
    fn duplicate_is_stale() {
        let mut h: History<&'static str> = History::new(8);
        let id = Uuid::from_u128(1);
        let now = Instant::now();
        h.record(id, 1, HOLD, now, None, false).unwrap();
        assert!(h.is_stale(&id, 1));
        assert!(!h.is_stale(&id, 2));
        assert_eq!(h.record(id, 1, HOLD, now, None, false), Err(WeftError::Stale));
        h.record(id, 2, HOLD, now, None, false).unwrap();
        assert_eq!(h.sequence_num(&id), Some(2));
    }

    #[test]
    fn ack_route_needs_request_flag() {
        let mut h: History<&'static str> = History::new(8);
        let now = Instant::now();
        let with_ack = Uuid::from_u128(1);
        let without = Uuid::from_u128(2);
        h.record(with_ack, 1, HOLD, now, Some("peer-a"), true).unwrap();
        h.record(without, 1, HOLD, now, Some("peer-b"), false).unwrap();
        assert_eq!(h.ack_route(&with_ack), Ok(&"peer-a"));
        assert_eq!(h.ack_route(&without), Err(WeftError::NoRoute));
        assert_eq!(h.ack_route(&Uuid::from_u128(3)), Err(WeftError::NoRoute));
    }

    #[test]
    fn sweep_drops_expired() {
        let mut h: History<()> = History::new(8);
        let now = Instant::now();
        h.record(Uuid::from_u128(1), 1, Duration::from_secs(1), now, None, false)
            .unwrap();
        h.record(Uuid::from_u128(2), 1, Duration::from_secs(60), now, None, false)
            .unwrap();
        h.sweep(now + Duration::from_secs(2));
        assert_eq!(h.len(), 1);
        assert!(h.is_stale(&Uuid::from_u128(2), 1));
    }

    #[test]
    fn capacity_evicts_soonest_expiring() {
        let mut h: History<()> = History::new(2);
        let now = Instant::now();
        h.record(Uuid::from_u128(1), 1, Duration::from_secs(1), now, None, false)
            .unwrap();
        h.record(Uuid::from_u128(2), 1, Duration::from_secs(60), now, None, false)
            .unwrap();
        h.record(Uuid::from_u128(3), 1, Duration::from_secs(30), now, None, false)
            .unwrap();
        assert_eq!(h.len(), 2);
        // The shortest-lived entry was evicted to make room
        assert!(!h.is_stale(&Uuid::from_u128(1), 1));
        assert!(h.is_stale(&Uuid::from_u128(2), 1));
        assert!(h.is_stale(&Uuid::from_u128(3), 1));
    }
}

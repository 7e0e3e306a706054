//! Subscription engine.
//!
//! Subscribing derives the topic and needs vectors, folds them into the
//! node's aggregates and nudges every peer's outbound summary. Delivery of
//! an inbound publication is two-stage: the Bloom intersection is only a
//! may-match filter, so the full topic strings are re-checked (wildcards
//! included) before a handler runs, and each subscription passes its own
//! permission gate.

use crate::handler::PublicationHandler;
use crate::node::Node;
use crate::permission::Permission;
use crate::publication::PublicationView;
use tracing::{debug, trace};
use uuid::Uuid;
use weft_core::bitvec::BitVector;
use weft_core::error::{Result, WeftError};
use weft_core::keyid::KeyId;

/// Handle to a subscription owned by a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubHandle(pub(crate) u32);

pub(crate) struct SubscriptionState {
    pub topics: Vec<String>,
    pub interests: BitVector,
    pub needs: BitVector,
    pub handler: Box<dyn PublicationHandler>,
}

impl Node {
    /// Start subscribing to a set of topics.
    ///
    /// The handler is called once per matching publication delivery, on
    /// the node's event loop.
    pub fn subscribe(
        &mut self,
        topics: Vec<String>,
        handler: Box<dyn PublicationHandler>,
    ) -> Result<SubHandle> {
        if self.destroying {
            return Err(WeftError::NodeDestroyed);
        }
        if topics.is_empty() {
            return Err(WeftError::Invalid);
        }
        let (interests, needs) = self.space.subscription_vectors(&topics)?;
        self.interests.add(&interests)?;
        self.needs.add(&needs)?;
        let handle = SubHandle(self.next_sub);
        self.next_sub += 1;
        self.subs.insert(
            handle.0,
            SubscriptionState {
                topics,
                interests,
                needs,
                handler,
            },
        );
        // Peers need to learn the widened interest set
        self.schedule_updates_all(None);
        trace!("[SUB] subscription {} added", handle.0);
        Ok(handle)
    }

    /// Stop subscribing and free the subscription.
    pub fn unsubscribe(&mut self, handle: SubHandle) -> Result<()> {
        let state = self.subs.remove(&handle.0).ok_or(WeftError::Missing)?;
        self.interests.sub(&state.interests)?;
        self.needs.sub(&state.needs)?;
        self.schedule_updates_all(None);
        trace!("[SUB] subscription {} removed", handle.0);
        Ok(())
    }

    /// Number of live subscriptions.
    #[must_use]
    pub fn subscription_count(&self) -> usize {
        self.subs.len()
    }

    /// Dispatch one publication to every matching local subscription.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn deliver_local(
        &mut self,
        pub_id: Uuid,
        seq_num: u32,
        topics: &[String],
        payload: &[u8],
        key_id: Option<&KeyId>,
        no_wild_card: bool,
        bf: &BitVector,
        ack_requested: bool,
    ) {
        if self.subs.is_empty() {
            return;
        }
        let view = PublicationView {
            pub_id,
            seq_num,
            topics: topics.to_vec(),
            ack_requested,
            key_id: key_id.cloned(),
        };
        let matching: Vec<u32> = self
            .subs
            .iter()
            .filter(|(_, s)| {
                // Bloom filter first, then the authoritative string match
                s.interests.intersects(bf)
                    && self.space.match_publication(&s.topics, topics, no_wild_card)
            })
            .map(|(id, _)| *id)
            .collect();
        for id in matching {
            let allowed = self
                .subs
                .get(&id)
                .is_some_and(|s| self.allowed(Permission::Sub, &s.topics, key_id));
            if !allowed {
                debug!("[SUB] delivery of {} denied for subscription {}", pub_id, id);
                continue;
            }
            if let Some(s) = self.subs.get_mut(&id) {
                s.handler.on_publication(&view, payload);
            }
        }
    }
}

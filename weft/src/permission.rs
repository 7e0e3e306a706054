//! Permission store contract and the in-memory implementation.
//!
//! The routing and delivery paths ask the permission store before
//! forwarding a publication to a peer, delivering to a local subscription,
//! or accepting an acknowledgement. A node configured without a store
//! allows everything; a configured store must match explicitly.

use parking_lot::RwLock;
use weft_core::keyid::KeyId;

/// The operation a permission request is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permission {
    /// Publishing (and forwarding a publication toward a peer).
    Pub,
    /// Delivering a publication to a subscription.
    Sub,
    /// Accepting an end-to-end acknowledgement.
    Ack,
    /// Forwarding on behalf of others. Never requested by the core itself
    /// but available to applications that distinguish relay rights.
    Forward,
}

impl Permission {
    const fn bit(self) -> u8 {
        match self {
            Self::Pub => 1 << 0,
            Self::Sub => 1 << 1,
            Self::Ack => 1 << 2,
            Self::Forward => 1 << 3,
        }
    }
}

/// Application-supplied access control consumed by the core.
pub trait PermissionStore: Send + Sync {
    /// Decide whether `perm` is allowed for the given identities and
    /// topics. `network_id` identifies the transport peer, `end_to_end_id`
    /// the payload key; either may be unknown.
    fn allow(
        &self,
        network_id: Option<&KeyId>,
        end_to_end_id: Option<&KeyId>,
        perm: Permission,
        topics: &[String],
    ) -> bool;
}

#[derive(Debug, Clone)]
struct Entry {
    /// `None` matches any topic set.
    topics: Option<Vec<String>>,
    /// `None` matches any key identifier.
    key_id: Option<KeyId>,
    perms: u8,
}

/// In-memory permission store with wildcard entries.
#[derive(Default)]
pub struct MemoryPermissionStore {
    entries: RwLock<Vec<Entry>>,
}

impl MemoryPermissionStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create or replace a permission entry.
    ///
    /// `topics = None` and/or `key_id = None` are wildcards. An empty
    /// permission list removes a matching entry.
    pub fn set_permission(
        &self,
        topics: Option<&[String]>,
        key_id: Option<&KeyId>,
        perms: &[Permission],
    ) {
        let mut entries = self.entries.write();
        let topics = topics.map(<[String]>::to_vec);
        let key_id = key_id.cloned();
        entries.retain(|e| !(e.topics == topics && e.key_id == key_id));
        if !perms.is_empty() {
            let mut bits = 0u8;
            for p in perms {
                bits |= p.bit();
            }
            entries.push(Entry {
                topics,
                key_id,
                perms: bits,
            });
        }
    }
}

impl PermissionStore for MemoryPermissionStore {
    fn allow(
        &self,
        network_id: Option<&KeyId>,
        end_to_end_id: Option<&KeyId>,
        perm: Permission,
        topics: &[String],
    ) -> bool {
        let entries = self.entries.read();
        entries.iter().any(|e| {
            if e.perms & perm.bit() == 0 {
                return false;
            }
            if let Some(entry_key) = &e.key_id {
                let matches_net = network_id == Some(entry_key);
                let matches_e2e = end_to_end_id == Some(entry_key);
                if !matches_net && !matches_e2e {
                    return false;
                }
            }
            match &e.topics {
                None => true,
                // Every requested topic must be covered by the entry
                Some(granted) => topics.iter().all(|t| granted.contains(t)),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn topics(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| (*s).to_owned()).collect()
    }

    #[test]
    fn wildcard_entry_allows_everything_listed() {
        let store = MemoryPermissionStore::new();
        store.set_permission(None, None, &[Permission::Pub, Permission::Sub]);
        assert!(store.allow(None, None, Permission::Pub, &topics(&["a"])));
        assert!(store.allow(None, None, Permission::Sub, &topics(&["a"])));
        assert!(!store.allow(None, None, Permission::Ack, &topics(&["a"])));
    }

    #[test]
    fn key_scoped_entry() {
        let store = MemoryPermissionStore::new();
        let k1 = KeyId::from("alice");
        store.set_permission(None, Some(&k1), &[Permission::Sub]);
        assert!(store.allow(None, Some(&k1), Permission::Sub, &topics(&["t"])));
        assert!(!store.allow(None, Some(&KeyId::from("bob")), Permission::Sub, &topics(&["t"])));
        assert!(!store.allow(None, None, Permission::Sub, &topics(&["t"])));
    }

    #[test]
    fn topic_scoped_entry() {
        let store = MemoryPermissionStore::new();
        store.set_permission(Some(&topics(&["t", "u"])), None, &[Permission::Sub]);
        assert!(store.allow(None, None, Permission::Sub, &topics(&["t"])));
        assert!(store.allow(None, None, Permission::Sub, &topics(&["t", "u"])));
        assert!(!store.allow(None, None, Permission::Sub, &topics(&["t", "x"])));
    }

    #[test]
    fn empty_perms_removes_entry() {
        let store = MemoryPermissionStore::new();
        store.set_permission(None, None, &[Permission::Pub]);
        store.set_permission(None, None, &[]);
        assert!(!store.allow(None, None, Permission::Pub, &topics(&["a"])));
    }
}

//! Key identifiers.
//!
//! A `KeyId` names a key inside a key store without saying anything about
//! the key material itself. It travels on the wire (inside sealed-payload
//! headers) so it is a refcounted byte string rather than an owned vector.

use bytes::Bytes;
use std::fmt;

/// Identifier of a key in a key store.
#[derive(Clone, PartialEq, Eq, Hash, Default)]
pub struct KeyId(Bytes);

impl KeyId {
    /// Create a key identifier from raw bytes.
    #[must_use]
    pub fn new(id: impl Into<Bytes>) -> Self {
        Self(id.into())
    }

    /// The raw identifier bytes.
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }

    /// Length of the identifier in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True if the identifier is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyId(")?;
        for b in self.0.iter() {
            write!(f, "{b:02x}")?;
        }
        write!(f, ")")
    }
}

impl From<&[u8]> for KeyId {
    fn from(id: &[u8]) -> Self {
        Self(Bytes::copy_from_slice(id))
    }
}

impl From<&str> for KeyId {
    fn from(id: &str) -> Self {
        Self(Bytes::copy_from_slice(id.as_bytes()))
    }
}

impl AsRef<[u8]> for KeyId {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_is_hex() {
        let id = KeyId::from(&b"\x01\xab"[..]);
        assert_eq!(format!("{id:?}"), "KeyId(01ab)");
    }
}

/// Weft Error Types
///
/// Comprehensive error handling for all Weft operations.
///
/// Every public call in the stack returns one of these kinds; asynchronous
/// completions carry them as well. The set is deliberately flat so a status
/// can cross the wire-codec, routing and application layers unchanged.

use std::io;
use thiserror::Error;

/// Main error type for Weft operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum WeftError {
    /// Non-specific failure
    #[error("non-specific failure")]
    Failure,

    /// Invalid null argument or handle
    #[error("invalid null argument")]
    Null,

    /// Invalid argument(s)
    #[error("invalid argument")]
    Args,

    /// Resource exhaustion, typically allocation or queue capacity
    #[error("out of resources")]
    Resources,

    /// Read operation failed
    #[error("read failed")]
    Read,

    /// Write operation failed
    #[error("write failed")]
    Write,

    /// Operation timed out
    #[error("timed out")]
    Timeout,

    /// Unexpected end of data; the decoder needs more input
    #[error("unexpected end of data")]
    Eod,

    /// An integer or buffer exceeded its target width
    #[error("overflow")]
    Overflow,

    /// Network or socket error
    #[error("network error")]
    Network,

    /// A value was invalid
    #[error("invalid value")]
    Invalid,

    /// Operation cannot be performed right now
    #[error("busy")]
    Busy,

    /// Something not expected was present
    #[error("already exists")]
    Exists,

    /// Something expected was missing
    #[error("missing")]
    Missing,

    /// A publication was stale (already seen)
    #[error("stale publication")]
    Stale,

    /// There is no route to the requested destination
    #[error("no route")]
    NoRoute,

    /// Node has not yet been started
    #[error("not started")]
    NotStarted,

    /// Object has not yet been initialized
    #[error("not initialized")]
    NotInitialized,

    /// A remote node or retained publication has expired
    #[error("expired")]
    Expired,

    /// Name resolution failed
    #[error("unresolved address")]
    Unresolved,

    /// Node has already been destroyed
    #[error("node destroyed")]
    NodeDestroyed,

    /// End of file or socket closed
    #[error("end of file")]
    Eof,

    /// Not implemented
    #[error("not implemented")]
    NotImplemented,
}

/// Result type alias for Weft operations
pub type Result<T> = std::result::Result<T, WeftError>;

impl WeftError {
    /// Check if this error is recovered locally without tearing anything down.
    ///
    /// `Stale` and `Eod` in particular must never be allowed to close a
    /// connection: a stale publication is normal mesh behaviour and `Eod`
    /// just means the stream reassembler wants more bytes.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(self, Self::Stale | Self::Eod | Self::Busy | Self::Timeout)
    }

    /// Check if this error ends the life of a connection
    #[must_use]
    pub const fn is_connection_error(&self) -> bool {
        matches!(self, Self::Network | Self::Eof | Self::NodeDestroyed)
    }
}

impl From<io::Error> for WeftError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => Self::Timeout,
            io::ErrorKind::UnexpectedEof => Self::Eof,
            io::ErrorKind::NotFound => Self::Missing,
            io::ErrorKind::InvalidData | io::ErrorKind::InvalidInput => Self::Invalid,
            io::ErrorKind::OutOfMemory => Self::Resources,
            _ => Self::Network,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stale_and_eod_are_recoverable() {
        assert!(WeftError::Stale.is_recoverable());
        assert!(WeftError::Eod.is_recoverable());
        assert!(!WeftError::Network.is_recoverable());
    }

    #[test]
    fn connection_errors() {
        assert!(WeftError::Eof.is_connection_error());
        assert!(WeftError::Network.is_connection_error());
        assert!(!WeftError::Stale.is_connection_error());
    }
}

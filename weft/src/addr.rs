//! Node addressing.
//!
//! Provides unified addressing for TCP and in-process transports with
//! parsing support. Bare `host:port` strings are accepted as TCP for CLI
//! convenience.

use std::fmt;
use std::net::{SocketAddr, ToSocketAddrs};
use std::str::FromStr;
use weft_core::error::{Result, WeftError};

/// Transport endpoint address of a node.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum NodeAddr {
    /// TCP transport: `tcp://host:port`
    Tcp(SocketAddr),
    /// In-process transport: `inproc://name`
    Inproc(String),
}

impl NodeAddr {
    /// Parse an address from a string.
    ///
    /// Supported formats:
    /// - `tcp://127.0.0.1:7000`
    /// - `tcp://[::1]:7000` (IPv6)
    /// - `inproc://name`
    /// - `127.0.0.1:7000` (bare TCP)
    pub fn parse(s: &str) -> Result<Self> {
        s.parse()
    }

    /// Resolve a host and service to a TCP address.
    ///
    /// Uses the platform resolver; failure maps to `Unresolved`.
    pub fn resolve(host: &str, service: &str) -> Result<Self> {
        let mut addrs = (host, parse_port(service)?)
            .to_socket_addrs()
            .map_err(|_| WeftError::Unresolved)?;
        addrs
            .next()
            .map(NodeAddr::Tcp)
            .ok_or(WeftError::Unresolved)
    }

    /// Returns true if this is a TCP address.
    #[must_use]
    pub const fn is_tcp(&self) -> bool {
        matches!(self, Self::Tcp(_))
    }

    /// Returns true if this is an in-process address.
    #[must_use]
    pub const fn is_inproc(&self) -> bool {
        matches!(self, Self::Inproc(_))
    }

    /// The listen port, zero for portless transports.
    #[must_use]
    pub const fn port(&self) -> u16 {
        match self {
            Self::Tcp(sa) => sa.port(),
            Self::Inproc(_) => 0,
        }
    }
}

fn parse_port(service: &str) -> Result<u16> {
    service.parse::<u16>().map_err(|_| WeftError::Unresolved)
}

impl fmt::Display for NodeAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp(sa) => write!(f, "tcp://{sa}"),
            Self::Inproc(name) => write!(f, "inproc://{name}"),
        }
    }
}

impl FromStr for NodeAddr {
    type Err = WeftError;

    fn from_str(s: &str) -> Result<Self> {
        if let Some(rest) = s.strip_prefix("tcp://") {
            return rest
                .parse::<SocketAddr>()
                .map(NodeAddr::Tcp)
                .map_err(|_| WeftError::Args);
        }
        if let Some(rest) = s.strip_prefix("inproc://") {
            if rest.is_empty() {
                return Err(WeftError::Args);
            }
            return Ok(NodeAddr::Inproc(rest.to_owned()));
        }
        s.parse::<SocketAddr>()
            .map(NodeAddr::Tcp)
            .map_err(|_| WeftError::Args)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_tcp() {
        let a = NodeAddr::parse("tcp://127.0.0.1:7000").unwrap();
        assert!(a.is_tcp());
        assert_eq!(a.port(), 7000);
        assert_eq!(a.to_string(), "tcp://127.0.0.1:7000");
    }

    #[test]
    fn parse_bare_and_v6() {
        assert!(NodeAddr::parse("127.0.0.1:7000").unwrap().is_tcp());
        assert!(NodeAddr::parse("tcp://[::1]:7000").unwrap().is_tcp());
    }

    #[test]
    fn parse_inproc() {
        let a = NodeAddr::parse("inproc://alpha").unwrap();
        assert!(a.is_inproc());
        assert_eq!(a.port(), 0);
        assert_eq!(NodeAddr::parse("inproc://"), Err(WeftError::Args));
    }

    #[test]
    fn parse_garbage() {
        assert_eq!(NodeAddr::parse("what"), Err(WeftError::Args));
    }

    #[test]
    fn resolve_localhost() {
        let a = NodeAddr::resolve("127.0.0.1", "9000").unwrap();
        assert_eq!(a.port(), 9000);
        assert_eq!(NodeAddr::resolve("127.0.0.1", "nope"), Err(WeftError::Unresolved));
    }
}

//! Transport contract and the in-process transport.
//!
//! The node core is sans-IO: it calls [`Transport::send`] with finished
//! frame bytes and consumes a queue of [`NetEvent`]s. Concrete transports
//! move the bytes and post events; they never interpret them.
//!
//! Endpoint lifetimes for connection-oriented transports are
//! reference-counted: `connect` takes a reference, `disconnect` releases
//! one, and a connection reaching zero references shuts down gracefully.
//!
//! The in-process transport here pairs nodes through a process-global
//! registry; it exists for tests, demos and single-process meshes. TCP
//! lives in [`tcp`].

pub mod tcp;

use crate::addr::NodeAddr;
use bytes::Bytes;
use dashmap::DashMap;
use flume::{Receiver, Sender};
use weft_core::error::{Result, WeftError};

/// Events a transport posts toward its node.
#[derive(Debug, Clone)]
pub enum NetEvent {
    /// One decoded datagram or stream frame worth of message bytes.
    Received { from: NodeAddr, bytes: Bytes },
    /// A send handed to [`Transport::send`] finished.
    SendComplete { to: NodeAddr, status: Result<()> },
    /// An outbound connection is established and writable.
    Connected { addr: NodeAddr },
    /// An outbound connection attempt failed.
    ConnectFailed { addr: NodeAddr, error: WeftError },
    /// An established peer connection closed.
    PeerClosed { addr: NodeAddr, error: WeftError },
}

/// Byte mover consumed by the node core.
///
/// A transport lives on its node's thread; only the event queue crosses
/// thread boundaries.
pub trait Transport {
    /// The address peers can reach this node at.
    fn local_addr(&self) -> NodeAddr;

    /// Open (or take another reference on) a connection to `to`.
    /// Completion is posted as `Connected` / `ConnectFailed`.
    fn connect(&mut self, to: &NodeAddr) -> Result<()>;

    /// Queue one message frame toward `to`. Completion is posted as
    /// `SendComplete`; an immediate error means nothing was queued.
    fn send(&mut self, to: &NodeAddr, frame: Bytes) -> Result<()>;

    /// Release one reference on the connection to `to`.
    fn disconnect(&mut self, to: &NodeAddr);

    /// Close every connection and stop listening.
    fn shutdown(&mut self);
}

/// Global registry of in-process endpoints.
static INPROC_REGISTRY: once_cell::sync::Lazy<DashMap<String, Sender<NetEvent>>> =
    once_cell::sync::Lazy::new(DashMap::new);

/// In-process transport endpoint.
///
/// Delivery is a direct queue push into the peer's event channel, so a
/// single-process mesh runs deterministically with no runtime at all:
/// tests pump the event receivers by hand.
pub struct InprocTransport {
    name: String,
    addr: NodeAddr,
    events: Sender<NetEvent>,
}

impl InprocTransport {
    /// Bind a named in-process endpoint.
    ///
    /// Returns the transport plus the event receiver the node runner (or a
    /// test pump) drains. Fails with `Exists` when the name is taken.
    pub fn bind(name: &str) -> Result<(Self, Receiver<NetEvent>)> {
        if name.is_empty() {
            return Err(WeftError::Args);
        }
        let (tx, rx) = flume::unbounded();
        if INPROC_REGISTRY.contains_key(name) {
            return Err(WeftError::Exists);
        }
        INPROC_REGISTRY.insert(name.to_owned(), tx.clone());
        Ok((
            Self {
                name: name.to_owned(),
                addr: NodeAddr::Inproc(name.to_owned()),
                events: tx,
            },
            rx,
        ))
    }

    fn peer(&self, to: &NodeAddr) -> Result<Sender<NetEvent>> {
        let NodeAddr::Inproc(name) = to else {
            return Err(WeftError::Args);
        };
        INPROC_REGISTRY
            .get(name)
            .map(|s| s.clone())
            .ok_or(WeftError::NoRoute)
    }
}

impl Transport for InprocTransport {
    fn local_addr(&self) -> NodeAddr {
        self.addr.clone()
    }

    fn connect(&mut self, to: &NodeAddr) -> Result<()> {
        let ev = match self.peer(to) {
            Ok(_) => NetEvent::Connected { addr: to.clone() },
            Err(e) => NetEvent::ConnectFailed {
                addr: to.clone(),
                error: e,
            },
        };
        self.events.send(ev).map_err(|_| WeftError::NodeDestroyed)
    }

    fn send(&mut self, to: &NodeAddr, frame: Bytes) -> Result<()> {
        let status = match self.peer(to) {
            Ok(peer) => peer
                .send(NetEvent::Received {
                    from: self.addr.clone(),
                    bytes: frame,
                })
                .map_err(|_| WeftError::Network),
            Err(e) => Err(e),
        };
        self.events
            .send(NetEvent::SendComplete {
                to: to.clone(),
                status,
            })
            .map_err(|_| WeftError::NodeDestroyed)
    }

    fn disconnect(&mut self, _to: &NodeAddr) {
        // Queue pairs have no per-connection state to release
    }

    fn shutdown(&mut self) {
        INPROC_REGISTRY.remove(&self.name);
    }
}

impl Drop for InprocTransport {
    fn drop(&mut self) {
        INPROC_REGISTRY.remove(&self.name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_send_receive() {
        let (mut a, _a_rx) = InprocTransport::bind("t-bind-a").unwrap();
        let (_b, b_rx) = InprocTransport::bind("t-bind-b").unwrap();

        a.send(&NodeAddr::Inproc("t-bind-b".into()), Bytes::from_static(b"hi"))
            .unwrap();
        match b_rx.try_recv().unwrap() {
            NetEvent::Received { from, bytes } => {
                assert_eq!(from, NodeAddr::Inproc("t-bind-a".into()));
                assert_eq!(bytes.as_ref(), b"hi");
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn duplicate_name_rejected() {
        let (_a, _rx) = InprocTransport::bind("t-dup").unwrap();
        assert!(matches!(InprocTransport::bind("t-dup"), Err(WeftError::Exists)));
    }

    #[test]
    fn send_to_missing_peer_completes_with_no_route() {
        let (mut a, a_rx) = InprocTransport::bind("t-missing").unwrap();
        a.send(&NodeAddr::Inproc("nobody".into()), Bytes::new()).unwrap();
        match a_rx.try_recv().unwrap() {
            NetEvent::SendComplete { status, .. } => {
                assert_eq!(status, Err(WeftError::NoRoute));
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn name_released_on_drop() {
        {
            let (_a, _rx) = InprocTransport::bind("t-release").unwrap();
        }
        let again = InprocTransport::bind("t-release");
        assert!(again.is_ok());
    }
}

//! Node actor shell.
//!
//! `NodeRunner` owns the sans-IO [`Node`] and is its only driver: one
//! single-threaded task multiplexing the command channel, the transport
//! event channel and a deadline timer. `NodeHandle` is the clonable public
//! API; every call marshals onto the loop as a command carrying a
//! bounded(1) reply channel, so off-loop application code never touches
//! node state directly.

use crate::addr::NodeAddr;
use crate::handler::{AckHandler, PublicationHandler};
use crate::node::Node;
use crate::publication::{AckTicket, PubHandle};
use crate::subscription::SubHandle;
use crate::transport::NetEvent;
use bytes::Bytes;
use flume::{Receiver, Sender};
use std::time::{Duration, Instant};
use tracing::debug;
use uuid::Uuid;
use weft_core::error::{Result, WeftError};
use weft_core::keyid::KeyId;

/// Commands marshalled onto the node loop.
pub enum NodeCmd {
    CreatePublication {
        reply: Sender<Result<PubHandle>>,
    },
    InitPublication {
        handle: PubHandle,
        topics: Vec<String>,
        no_wild_card: bool,
        key_ids: Vec<KeyId>,
        ack_handler: Option<Box<dyn AckHandler>>,
        reply: Sender<Result<Uuid>>,
    },
    Publish {
        handle: PubHandle,
        payload: Bytes,
        ttl: i16,
        reply: Sender<Result<u32>>,
    },
    DestroyPublication {
        handle: PubHandle,
        reply: Sender<Result<()>>,
    },
    AckPublication {
        ticket: AckTicket,
        payload: Bytes,
        reply: Sender<Result<()>>,
    },
    Subscribe {
        topics: Vec<String>,
        handler: Box<dyn PublicationHandler>,
        reply: Sender<Result<SubHandle>>,
    },
    Unsubscribe {
        handle: SubHandle,
        reply: Sender<Result<()>>,
    },
    Link {
        addr: NodeAddr,
        reply: Sender<Result<()>>,
    },
    Unlink {
        addr: NodeAddr,
        reply: Sender<Result<()>>,
    },
    LocalAddr {
        reply: Sender<NodeAddr>,
    },
    Destroy {
        reply: Sender<()>,
    },
}

/// Clonable handle to a running node.
#[derive(Clone)]
pub struct NodeHandle {
    tx: Sender<NodeCmd>,
}

impl NodeHandle {
    fn post(&self, cmd: NodeCmd) -> Result<()> {
        self.tx.send(cmd).map_err(|_| WeftError::NodeDestroyed)
    }

    async fn wait<T>(rx: Receiver<T>) -> Result<T> {
        rx.recv_async().await.map_err(|_| WeftError::NodeDestroyed)
    }

    /// Allocate an uninitialized publication.
    pub async fn create_publication(&self) -> Result<PubHandle> {
        let (reply, rx) = flume::bounded(1);
        self.post(NodeCmd::CreatePublication { reply })?;
        Self::wait(rx).await?
    }

    /// Initialize a publication with topics and options.
    pub async fn init_publication(
        &self,
        handle: PubHandle,
        topics: Vec<String>,
        no_wild_card: bool,
        key_ids: Vec<KeyId>,
        ack_handler: Option<Box<dyn AckHandler>>,
    ) -> Result<Uuid> {
        let (reply, rx) = flume::bounded(1);
        self.post(NodeCmd::InitPublication {
            handle,
            topics,
            no_wild_card,
            key_ids,
            ack_handler,
            reply,
        })?;
        Self::wait(rx).await?
    }

    /// Publish a payload; resolves to the assigned sequence number.
    pub async fn publish(&self, handle: PubHandle, payload: Bytes, ttl: i16) -> Result<u32> {
        let (reply, rx) = flume::bounded(1);
        self.post(NodeCmd::Publish {
            handle,
            payload,
            ttl,
            reply,
        })?;
        Self::wait(rx).await?
    }

    /// Destroy a publication handle.
    pub async fn destroy_publication(&self, handle: PubHandle) -> Result<()> {
        let (reply, rx) = flume::bounded(1);
        self.post(NodeCmd::DestroyPublication { handle, reply })?;
        Self::wait(rx).await?
    }

    /// Acknowledge a received publication toward its publisher.
    pub async fn ack_publication(&self, ticket: AckTicket, payload: Bytes) -> Result<()> {
        let (reply, rx) = flume::bounded(1);
        self.post(NodeCmd::AckPublication {
            ticket,
            payload,
            reply,
        })?;
        Self::wait(rx).await?
    }

    /// Start subscribing to a set of topics.
    pub async fn subscribe(
        &self,
        topics: Vec<String>,
        handler: Box<dyn PublicationHandler>,
    ) -> Result<SubHandle> {
        let (reply, rx) = flume::bounded(1);
        self.post(NodeCmd::Subscribe {
            topics,
            handler,
            reply,
        })?;
        Self::wait(rx).await?
    }

    /// Stop subscribing.
    pub async fn unsubscribe(&self, handle: SubHandle) -> Result<()> {
        let (reply, rx) = flume::bounded(1);
        self.post(NodeCmd::Unsubscribe { handle, reply })?;
        Self::wait(rx).await?
    }

    /// Link to a remote peer. Resolves once the connection is established.
    pub async fn link(&self, addr: NodeAddr) -> Result<()> {
        let (reply, rx) = flume::bounded(1);
        self.post(NodeCmd::Link { addr, reply })?;
        Self::wait(rx).await?
    }

    /// Unlink from a remote peer.
    pub async fn unlink(&self, addr: NodeAddr) -> Result<()> {
        let (reply, rx) = flume::bounded(1);
        self.post(NodeCmd::Unlink { addr, reply })?;
        Self::wait(rx).await?
    }

    /// The address peers can reach this node at.
    pub async fn local_addr(&self) -> Result<NodeAddr> {
        let (reply, rx) = flume::bounded(1);
        self.post(NodeCmd::LocalAddr { reply })?;
        Self::wait(rx).await
    }

    /// Destroy the node: drain, close transports, free state. Resolves
    /// when teardown finished; later calls fail with `NodeDestroyed`.
    pub async fn destroy(&self) -> Result<()> {
        let (reply, rx) = flume::bounded(1);
        self.post(NodeCmd::Destroy { reply })?;
        Self::wait(rx).await
    }
}

/// The node's event loop.
pub struct NodeRunner {
    node: Node,
    cmd_rx: Receiver<NodeCmd>,
    net_rx: Receiver<NetEvent>,
}

impl NodeRunner {
    /// Wrap a node and its transport event queue; returns the runner and
    /// the public handle.
    #[must_use]
    pub fn new(node: Node, net_rx: Receiver<NetEvent>) -> (Self, NodeHandle) {
        let (tx, cmd_rx) = flume::unbounded();
        (
            Self {
                node,
                cmd_rx,
                net_rx,
            },
            NodeHandle { tx },
        )
    }

    /// Run the event loop until the node is destroyed.
    pub async fn run(mut self) {
        use futures::{pin_mut, select, FutureExt};

        loop {
            let sleep_for = self
                .node
                .next_deadline()
                .map_or(Duration::from_millis(250), |d| {
                    d.saturating_duration_since(Instant::now())
                })
                .max(Duration::from_millis(1));
            let tick = compio::time::sleep(sleep_for).fuse();
            pin_mut!(tick);

            select! {
                cmd = self.cmd_rx.recv_async().fuse() => match cmd {
                    Ok(cmd) => {
                        if self.handle_cmd(cmd) {
                            break;
                        }
                    }
                    Err(_) => {
                        // Every handle dropped: tear down
                        self.node.destroy();
                        break;
                    }
                },
                ev = self.net_rx.recv_async().fuse() => {
                    if let Ok(ev) = ev {
                        self.node.handle_net(ev);
                    }
                },
                () = tick => {
                    self.node.on_tick(Instant::now());
                },
            }
        }
        debug!("[NODE] runner exited");
    }

    /// Apply one command; returns true when the loop must stop.
    fn handle_cmd(&mut self, cmd: NodeCmd) -> bool {
        match cmd {
            NodeCmd::CreatePublication { reply } => {
                let _ = reply.send(self.node.create_publication());
            }
            NodeCmd::InitPublication {
                handle,
                topics,
                no_wild_card,
                key_ids,
                ack_handler,
                reply,
            } => {
                let _ = reply.send(self.node.init_publication(
                    handle,
                    topics,
                    no_wild_card,
                    key_ids,
                    ack_handler,
                ));
            }
            NodeCmd::Publish {
                handle,
                payload,
                ttl,
                reply,
            } => {
                let _ = reply.send(self.node.publish(handle, &payload, ttl));
            }
            NodeCmd::DestroyPublication { handle, reply } => {
                let _ = reply.send(self.node.destroy_publication(handle));
            }
            NodeCmd::AckPublication {
                ticket,
                payload,
                reply,
            } => {
                let _ = reply.send(self.node.ack_publication(&ticket, &payload));
            }
            NodeCmd::Subscribe {
                topics,
                handler,
                reply,
            } => {
                let _ = reply.send(self.node.subscribe(topics, handler));
            }
            NodeCmd::Unsubscribe { handle, reply } => {
                let _ = reply.send(self.node.unsubscribe(handle));
            }
            NodeCmd::Link { addr, reply } => {
                // The reply doubles as the link completion; on immediate
                // failure nothing was stored, so answer here.
                if let Err(e) = self.node.link(&addr, Some(reply.clone())) {
                    let _ = reply.send(Err(e));
                }
            }
            NodeCmd::Unlink { addr, reply } => {
                if let Err(e) = self.node.unlink(&addr, Some(reply.clone())) {
                    let _ = reply.send(Err(e));
                }
            }
            NodeCmd::LocalAddr { reply } => {
                let _ = reply.send(self.node.local_addr());
            }
            NodeCmd::Destroy { reply } => {
                self.node.destroy();
                let _ = reply.send(());
                return true;
            }
        }
        false
    }
}

//! # Weft
//!
//! A distributed publish/subscribe mesh: peer-to-peer, topic-routed,
//! content-filtering, with optional end-to-end sealed payloads,
//! authenticated acknowledgements and a reliable-delivery overlay.
//!
//! ## Architecture
//!
//! Weft is structured as a messaging kernel with clean layering:
//!
//! - **`weft-core`**: Bloom-filter interest summaries, counter-vector
//!   aggregation, history, caches, sequence-number sets
//! - **`weft-wire`**: deterministic CBOR, message framing, sealed payloads
//!   (pure state machines, sans-IO)
//! - **`weft`**: the node, routing fabric, reliability overlay and
//!   transports (this crate)
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use weft::prelude::*;
//! use bytes::Bytes;
//!
//! # async fn example() -> weft::Result<()> {
//! // Two nodes wired through the in-process transport
//! let (ta, ra) = InprocTransport::bind("a")?;
//! let (tb, rb) = InprocTransport::bind("b")?;
//! let a = Node::new(NodeConfig::default(), Box::new(ta))?;
//! let b = Node::new(NodeConfig::default(), Box::new(tb))?;
//!
//! let (runner_a, node_a) = NodeRunner::new(a, ra);
//! let (runner_b, node_b) = NodeRunner::new(b, rb);
//! compio::runtime::spawn(runner_a.run()).detach();
//! compio::runtime::spawn(runner_b.run()).detach();
//!
//! node_b.link(NodeAddr::Inproc("a".into())).await?;
//! node_a
//!     .subscribe(vec!["sensor/+/temp".into()], Box::new(
//!         |view: &PublicationView, payload: &[u8]| {
//!             println!("{}: {:?}", view.topics[0], payload);
//!         },
//!     ))
//!     .await?;
//!
//! let publication = node_b.create_publication().await?;
//! node_b
//!     .init_publication(publication, vec!["sensor/kitchen/temp".into()], false, vec![], None)
//!     .await?;
//! node_b.publish(publication, Bytes::from_static(b"21.5"), 0).await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Concurrency model
//!
//! One single-threaded cooperative loop per node. All node state mutates
//! on that loop; the public [`NodeHandle`] marshals calls onto it, and
//! handlers run on it (so they must not block).

#![deny(unsafe_code)]
#![allow(clippy::module_name_repetitions)]

pub mod addr;
pub mod dev_tracing;
pub mod handler;
pub mod keystore;
pub mod mesh;
pub mod node;
pub mod permission;
pub mod publication;
pub mod reliable;
pub mod runner;
pub mod subscription;
pub mod transport;

pub use weft_core::error::{Result, WeftError};

pub mod prelude {
    pub use crate::addr::NodeAddr;
    pub use crate::handler::{AckHandler, PublicationHandler};
    pub use crate::keystore::{Key, KeyRequest, KeyStore, MemoryKeyStore};
    pub use crate::node::{Node, NodeConfig};
    pub use crate::permission::{MemoryPermissionStore, Permission, PermissionStore};
    pub use crate::publication::{AckTicket, PubHandle, PublicationView};
    pub use crate::reliable::{
        QosPolicy, ReliablePublisher, ReliableSubscriber, DEFAULT_QOS_DEPTH,
    };
    pub use crate::runner::{NodeHandle, NodeRunner};
    pub use crate::subscription::SubHandle;
    pub use crate::transport::{InprocTransport, NetEvent, Transport};
    pub use weft_core::error::{Result, WeftError};
    pub use weft_core::keyid::KeyId;
}

//! Weft Wire Protocol
//!
//! Sans-IO implementation of the Weft wire format:
//! - Deterministic CBOR encoder/decoder (`cbor`)
//! - Message envelope plus datagram/stream framing (`frame`)
//! - Typed SUB / SAK / PUB / ACK message bodies (`msg`)
//! - Sealed (end-to-end encrypted) payloads and nonce derivation (`seal`)
//!
//! Nothing here touches a socket. Transports feed bytes in, the node layer
//! reads typed messages out, and every error is a `weft_core` status so the
//! propagation policy (drop vs close vs read-more) is decided upstream.

#![deny(unsafe_code)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::module_name_repetitions)]
pub mod cbor;
pub mod frame;
pub mod msg;
pub mod seal;

pub mod prelude {
    pub use crate::cbor::{Decoder, Encoder};
    pub use crate::frame::{Envelope, MsgType, StreamDecoder, MSG_VERSION};
    pub use crate::msg::{AckHeaders, PubBody, PubHeaders, SakMessage, SubMessage};
    pub use crate::seal::{derive_nonce, NonceKind, SealCodec, NONCE_LEN};
}

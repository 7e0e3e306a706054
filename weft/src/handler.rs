//! Application callback capabilities.
//!
//! Handlers are capability objects with lifetimes tied to the node that
//! registered them; closures get blanket implementations so simple
//! applications never name the traits. All handlers run on the node's
//! event loop, so they must not block.

use crate::publication::PublicationView;
use weft_core::error::Result;

/// Called when a publication matching a subscription is delivered.
pub trait PublicationHandler: Send {
    /// `view` describes the publication; `payload` is the decrypted
    /// payload bytes.
    fn on_publication(&mut self, view: &PublicationView, payload: &[u8]);
}

impl<F> PublicationHandler for F
where
    F: FnMut(&PublicationView, &[u8]) + Send,
{
    fn on_publication(&mut self, view: &PublicationView, payload: &[u8]) {
        self(view, payload);
    }
}

/// Called when an end-to-end acknowledgement for a publication arrives,
/// or when delivery failed and a negative acknowledgement is synthesized.
///
/// The handler is invoked once per acknowledging subscriber, so it may run
/// several times for the same sequence number.
pub trait AckHandler: Send {
    fn on_ack(&mut self, view: &PublicationView, status: Result<()>, payload: &[u8]);
}

impl<F> AckHandler for F
where
    F: FnMut(&PublicationView, Result<()>, &[u8]) + Send,
{
    fn on_ack(&mut self, view: &PublicationView, status: Result<()>, payload: &[u8]) {
        self(view, status, payload);
    }
}

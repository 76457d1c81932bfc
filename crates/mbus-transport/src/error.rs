//! Transport error types

use mbus_link::LinkError;
use thiserror::Error;

/// Result type alias for transport operations
pub type Result<T> = std::result::Result<T, TransportError>;

/// Transport error types
#[derive(Error, Debug)]
pub enum TransportError {
    /// A reliable message exhausted its retries without an ack.
    /// Delivery is attempted, not guaranteed; the message is dropped.
    #[error("reliable delivery failed: no acknowledgement for sequence {0}")]
    ReliableDeliveryFailed(u64),

    /// Link-layer failure
    #[error("link error: {0}")]
    Link(#[from] LinkError),

    /// A received datagram could not be authenticated or parsed
    #[error("codec error: {0}")]
    Codec(#[from] mbus_core::Error),

    /// The transport failed to set up its link and cannot operate
    #[error("transport is not operational: {0}")]
    NotOperational(String),

    /// The engine task is gone
    #[error("transport engine stopped")]
    Stopped,
}

//! Link error types

use thiserror::Error;

/// Result type alias for link operations
pub type Result<T> = std::result::Result<T, LinkError>;

/// Link-layer error types
#[derive(Error, Debug)]
pub enum LinkError {
    /// Could not join the multicast group
    #[error("failed to join group: {0}")]
    JoinFailed(String),

    /// Could not bind a local socket
    #[error("failed to bind socket: {0}")]
    BindFailed(String),

    /// A datagram could not be sent
    #[error("send failed: {0}")]
    SendFailed(String),

    /// A datagram could not be received
    #[error("receive failed: {0}")]
    ReceiveFailed(String),

    /// The link has been closed
    #[error("link closed")]
    Closed,

    /// Underlying socket error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

//! Error types for mbus-core

use thiserror::Error;

/// Result type alias for mbus-core operations
pub type Result<T> = std::result::Result<T, Error>;

/// mbus-core error types
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed wire text
    #[error("parse error: {0}")]
    Parse(String),

    /// Symbol constructed from characters outside its alphabet
    #[error("invalid symbol: {0:?}")]
    InvalidSymbol(String),

    /// Malformed address text
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    /// Header version tag did not match the supported protocol version
    #[error("unsupported protocol version: {0:?}")]
    VersionMismatch(String),

    /// Wire frame contained no digest line
    #[error("no digest found in wire frame")]
    NoDigestFound,

    /// Recomputed digest did not match the claimed digest
    #[error("message authentication failed")]
    AuthenticationFailed,

    /// Invalid base64 in a data value
    #[error("base64 error: {0}")]
    Base64(#[from] base64::DecodeError),
}

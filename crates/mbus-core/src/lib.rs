//! mbus Core
//!
//! Core types and wire encoding for the mbus protocol, an
//! attribute-addressed message bus for loosely coupled session
//! participants on a shared network segment.
//!
//! This crate provides:
//! - Typed wire values and the S-expression codec ([`Value`], [`value`])
//! - Attribute addresses and destination matching ([`Address`])
//! - Message framing ([`Command`], [`Payload`], [`Header`], [`Message`])
//! - Authenticated framing with pluggable digest and cipher ([`Coder`])
//! - Wall-clock helpers ([`time`])

pub mod address;
pub mod coder;
pub mod error;
pub mod message;
pub mod time;
pub mod value;

pub use address::{Address, AddressElement};
pub use coder::{Cipher, CipherAlgo, Coder, DigestAlgo, Digestor};
pub use error::{Error, Result};
pub use message::{
    Command, DeliveryType, Header, Message, Payload, BYE_COMMAND, HELLO_COMMAND,
    PROTOCOL_VERSION,
};
pub use value::{parse_value, Symbol, Value};

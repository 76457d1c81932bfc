//! Session configuration
//!
//! The configuration is consumed, not produced, here: loading it from
//! files or the environment is the caller's business. Two transports
//! whose configurations agree on group endpoint and keys share one
//! link socket pair.

use mbus_core::{CipherAlgo, Coder, DigestAlgo};
use std::net::SocketAddr;

/// Default mbus group port
pub const DEFAULT_GROUP_PORT: u16 = 47000;

/// Configuration of one bus session
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionConfig {
    /// Digest algorithm for message authentication
    pub digest: DigestAlgo,
    /// Shared digest key
    pub digest_key: Vec<u8>,
    /// Cipher algorithm for (optional) confidentiality
    pub cipher: CipherAlgo,
    /// Shared cipher key
    pub cipher_key: Vec<u8>,
    /// Group endpoint all entities of the session listen on
    pub group: SocketAddr,
    /// Local interface to bind and join on
    pub bind: SocketAddr,
    /// Prefer unicast to known entities over group sends
    pub prefer_unicast: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            digest: DigestAlgo::HmacMd5,
            digest_key: Vec::new(),
            cipher: CipherAlgo::Identity,
            cipher_key: Vec::new(),
            group: SocketAddr::from(([224, 255, 222, 239], DEFAULT_GROUP_PORT)),
            bind: SocketAddr::from(([0, 0, 0, 0], 0)),
            prefer_unicast: true,
        }
    }
}

impl SessionConfig {
    /// Build the authenticated-framing coder for this session
    pub fn coder(&self) -> Coder {
        Coder::new(
            self.digest,
            self.digest_key.clone(),
            self.cipher,
            self.cipher_key.clone(),
        )
    }
}

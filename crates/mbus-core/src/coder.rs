//! Authenticated message framing
//!
//! Every serialized message is wrapped before it reaches the wire:
//!
//! ```text
//! base64(digest(plaintext)) "\n" plaintext
//! ```
//!
//! and the combined buffer is then run through the session cipher. The
//! default digest is HMAC-MD5 truncated to 96 bits, so the encoded
//! digest line is always exactly 16 base64 characters. The default
//! cipher is the identity transform; real ciphers are an extension
//! point, not part of the protocol core.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use hmac::{Hmac, Mac};
use md5::Md5;

use crate::{Error, Result};

/// Truncated digest length in bytes (96 bits)
pub const DIGEST_LEN: usize = 12;

/// Length of the base64-encoded digest line
pub const DIGEST_LEN_B64: usize = 16;

/// Keyed digest algorithm
pub trait Digestor: Send + Sync {
    /// Compute the (already truncated) digest of `plaintext` under `key`
    fn calculate(&self, key: &[u8], plaintext: &[u8]) -> Vec<u8>;
}

/// HMAC-MD5 truncated to [`DIGEST_LEN`] bytes
pub struct HmacMd5;

impl Digestor for HmacMd5 {
    fn calculate(&self, key: &[u8], plaintext: &[u8]) -> Vec<u8> {
        let mut mac =
            Hmac::<Md5>::new_from_slice(key).expect("HMAC accepts keys of any length");
        mac.update(plaintext);
        let mut digest = mac.finalize().into_bytes().to_vec();
        digest.truncate(DIGEST_LEN);
        digest
    }
}

/// Symmetric cipher applied to the framed buffer
pub trait Cipher: Send + Sync {
    fn encrypt(&self, key: &[u8], plaintext: &[u8]) -> Vec<u8>;
    fn decrypt(&self, key: &[u8], wire: &[u8]) -> Vec<u8>;
}

/// The identity cipher: no transformation
pub struct IdentityCipher;

impl Cipher for IdentityCipher {
    fn encrypt(&self, _key: &[u8], plaintext: &[u8]) -> Vec<u8> {
        plaintext.to_vec()
    }

    fn decrypt(&self, _key: &[u8], wire: &[u8]) -> Vec<u8> {
        wire.to_vec()
    }
}

/// Digest algorithm selector, part of the session configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DigestAlgo {
    #[default]
    HmacMd5,
}

impl DigestAlgo {
    fn digestor(self) -> Box<dyn Digestor> {
        match self {
            DigestAlgo::HmacMd5 => Box::new(HmacMd5),
        }
    }
}

/// Cipher algorithm selector, part of the session configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CipherAlgo {
    #[default]
    Identity,
}

impl CipherAlgo {
    fn cipher(self) -> Box<dyn Cipher> {
        match self {
            CipherAlgo::Identity => Box::new(IdentityCipher),
        }
    }
}

/// Wraps serialized messages with an authentication digest and runs the
/// session cipher over the framed buffer
pub struct Coder {
    digestor: Box<dyn Digestor>,
    cipher: Box<dyn Cipher>,
    digest_key: Vec<u8>,
    cipher_key: Vec<u8>,
}

impl Coder {
    /// Build a coder from the configured algorithm selectors
    pub fn new(
        digest: DigestAlgo,
        digest_key: impl Into<Vec<u8>>,
        cipher: CipherAlgo,
        cipher_key: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            digestor: digest.digestor(),
            cipher: cipher.cipher(),
            digest_key: digest_key.into(),
            cipher_key: cipher_key.into(),
        }
    }

    /// Build a coder from externally supplied algorithm implementations
    pub fn with_parts(
        digestor: Box<dyn Digestor>,
        cipher: Box<dyn Cipher>,
        digest_key: impl Into<Vec<u8>>,
        cipher_key: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            digestor,
            cipher,
            digest_key: digest_key.into(),
            cipher_key: cipher_key.into(),
        }
    }

    fn encoded_digest(&self, plaintext: &[u8]) -> String {
        BASE64.encode(self.digestor.calculate(&self.digest_key, plaintext))
    }

    /// Frame `plaintext` for transmission
    pub fn encode(&self, plaintext: &str) -> Vec<u8> {
        let mut framed =
            Vec::with_capacity(DIGEST_LEN_B64 + 1 + plaintext.len());
        framed.extend_from_slice(self.encoded_digest(plaintext.as_bytes()).as_bytes());
        framed.push(b'\n');
        framed.extend_from_slice(plaintext.as_bytes());
        self.cipher.encrypt(&self.cipher_key, &framed)
    }

    /// Verify and unwrap a wire frame.
    ///
    /// The body is never returned unless the digest check passed.
    pub fn decode(&self, wire: &[u8]) -> Result<String> {
        let framed = self.cipher.decrypt(&self.cipher_key, wire);

        let newline = framed
            .iter()
            .position(|&b| b == b'\n')
            .ok_or(Error::NoDigestFound)?;
        let (claimed, rest) = framed.split_at(newline);
        let rest = &rest[1..];

        let expected = self.encoded_digest(rest);
        if claimed != expected.as_bytes() {
            tracing::warn!(
                "digest mismatch: {:?} vs. {:?}",
                String::from_utf8_lossy(claimed),
                expected
            );
            return Err(Error::AuthenticationFailed);
        }

        String::from_utf8(rest.to_vec())
            .map_err(|_| Error::Parse("message text is not valid UTF-8".to_string()))
    }
}

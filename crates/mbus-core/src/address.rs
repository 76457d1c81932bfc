//! Entity addresses and destination matching
//!
//! An address is a set of `key:value` attribute pairs:
//!
//! ```text
//! (app:mixer module:audio id:4711-0@192.168.1.4 )
//! ```
//!
//! Addresses double as entity identities and as destination filters. A
//! message is accepted by an entity when the entity's own address
//! *satisfies* the message's destination constraint: every destination
//! pair must match one of the entity's pairs, where a pair matches if
//! the keys are equal and either value is `*` or both values are equal.
//!
//! Elements are kept sorted by key, so two semantically equal addresses
//! render to the same canonical string.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::value::skip_blank;
use crate::{Error, Result};

/// The attribute key that makes an address unique
pub const ID_KEY: &str = "id";

/// The wildcard value
pub const WILDCARD: &str = "*";

/// One `key:value` attribute pair
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressElement {
    key: String,
    value: String,
}

impl AddressElement {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    /// Wildcard-aware match: keys equal, values equal or either is `*`
    pub fn matches(&self, other: &AddressElement) -> bool {
        self.key == other.key
            && (self.value == WILDCARD || other.value == WILDCARD || self.value == other.value)
    }
}

impl fmt::Display for AddressElement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.key, self.value)
    }
}

/// An entity address: uniquely-keyed attribute pairs, sorted by key
///
/// `==` is strict structural equality; [`Address::matches`] is the
/// wildcard-aware comparison.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Address {
    elements: Vec<AddressElement>,
}

impl Address {
    /// The empty address; as a destination it matches every entity
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse an address string; the whole input must be consumed
    pub fn parse(text: &str) -> Result<Self> {
        let (addr, used) = Self::parse_prefix(text)?;
        if !text[used..].trim().is_empty() {
            return Err(Error::InvalidAddress(format!(
                "trailing characters after address: {:?}",
                &text[used..]
            )));
        }
        Ok(addr)
    }

    /// Parse an address from the front of `text`, returning the bytes
    /// consumed. Used by the header parser.
    pub(crate) fn parse_prefix(text: &str) -> Result<(Self, usize)> {
        let bytes = text.as_bytes();
        let mut pos = skip_blank(bytes, 0);
        if pos >= bytes.len() || bytes[pos] != b'(' {
            return Err(Error::InvalidAddress("expected '('".to_string()));
        }
        pos += 1;

        let mut elements = Vec::new();
        loop {
            pos = skip_blank(bytes, pos);
            if pos >= bytes.len() {
                return Err(Error::InvalidAddress("unterminated address".to_string()));
            }
            if bytes[pos] == b')' {
                pos += 1;
                break;
            }

            let key_start = pos;
            while pos < bytes.len() && bytes[pos].is_ascii_alphanumeric() {
                pos += 1;
            }
            if pos >= bytes.len() || bytes[pos] != b':' {
                return Err(Error::InvalidAddress(format!(
                    "expected ':' after key in {:?}",
                    text
                )));
            }
            let key = text[key_start..pos].to_string();
            pos += 1;

            let value_start = pos;
            while pos < bytes.len()
                && !bytes[pos].is_ascii_control()
                && bytes[pos] != b' '
                && bytes[pos] != b')'
            {
                pos += 1;
            }
            let value = text[value_start..pos].to_string();
            elements.push(AddressElement::new(key, value));
        }

        let mut addr = Self { elements };
        addr.sort();
        Ok((addr, pos))
    }

    fn sort(&mut self) {
        self.elements.sort_by(|a, b| a.key.cmp(&b.key));
    }

    pub fn elements(&self) -> &[AddressElement] {
        &self.elements
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    /// Look up an element by key
    pub fn get(&self, key: &str) -> Option<&AddressElement> {
        self.elements.iter().find(|e| e.key == key)
    }

    /// Insert or replace an attribute, keeping the elements sorted
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let element = AddressElement::new(key, value);
        match self.elements.iter_mut().find(|e| e.key == element.key) {
            Some(existing) => *existing = element,
            None => {
                self.elements.push(element);
                self.sort();
            }
        }
    }

    /// The value of the `id` attribute, if present
    pub fn identity(&self) -> Option<&str> {
        self.get(ID_KEY).map(|e| e.value())
    }

    /// An address is unique when it carries an `id` attribute
    pub fn is_unique(&self) -> bool {
        self.identity().is_some()
    }

    /// Wildcard-aware whole-address comparison: elementwise match of
    /// the sorted pair lists. Addresses with different element counts
    /// never match.
    pub fn matches(&self, other: &Address) -> bool {
        self.elements.len() == other.elements.len()
            && self
                .elements
                .iter()
                .zip(&other.elements)
                .all(|(a, b)| a.matches(b))
    }

    /// Check whether this address satisfies the constraint `other`:
    /// every element of `other` must match some element of `self`.
    ///
    /// An empty `other` is satisfied by any address.
    pub fn is_subset_of(&self, other: &Address) -> bool {
        other
            .elements
            .iter()
            .all(|theirs| self.elements.iter().any(|ours| ours.matches(theirs)))
    }

    /// Make the address unique: a no-op when an `id` attribute already
    /// exists, otherwise one is synthesized from the process id, a
    /// process-wide counter and the local IPv4 address.
    pub fn disambiguate(&mut self) {
        if self.is_unique() {
            return;
        }
        self.elements.push(AddressElement::new(ID_KEY, generate_id()));
        self.sort();
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for element in &self.elements {
            write!(f, "{} ", element)?;
        }
        write!(f, ")")
    }
}

impl FromStr for Address {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Address::parse(s)
    }
}

impl TryFrom<&str> for Address {
    type Error = Error;

    fn try_from(s: &str) -> Result<Self> {
        Address::parse(s)
    }
}

fn generate_id() -> String {
    static COUNTER: AtomicU32 = AtomicU32::new(0);

    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{}-{}@{}", std::process::id(), n, local_ipv4())
}

/// Learn the outbound interface address by connecting a throwaway
/// datagram socket toward a multicast group; nothing is sent.
fn local_ipv4() -> String {
    std::net::UdpSocket::bind(("0.0.0.0", 0))
        .and_then(|socket| {
            socket.connect(("224.224.224.224", 44444))?;
            socket.local_addr()
        })
        .map(|addr| addr.ip().to_string())
        .unwrap_or_else(|_| "127.0.0.1".to_string())
}

//! Link sharing by configuration equality
//!
//! Several transports (distinct local entities) in one process can sit
//! on the same session; they then share a single socket pair. The
//! registry hands out `Arc` links keyed by the parts of the
//! configuration that define a session: group endpoint, bind address
//! and keys. The socket pair closes when the last transport holding
//! the `Arc` goes away.

use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};

use crate::config::SessionConfig;
use mbus_link::UdpLink;

#[derive(Clone, PartialEq, Eq)]
struct LinkKey {
    group: SocketAddr,
    bind: SocketAddr,
    digest_key: Vec<u8>,
    cipher_key: Vec<u8>,
}

impl LinkKey {
    fn of(config: &SessionConfig) -> Self {
        Self {
            group: config.group,
            bind: config.bind,
            digest_key: config.digest_key.clone(),
            cipher_key: config.cipher_key.clone(),
        }
    }
}

/// An explicit registry of live links, owned by whichever context
/// constructs transports
#[derive(Default)]
pub struct LinkRegistry {
    links: Mutex<Vec<(LinkKey, Weak<UdpLink>)>>,
}

impl LinkRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the shared link for `config`, opening one if no live
    /// link with an equal session key exists.
    ///
    /// Must be called from within a tokio runtime.
    pub fn acquire(&self, config: &SessionConfig) -> mbus_link::Result<Arc<UdpLink>> {
        let key = LinkKey::of(config);
        let mut links = self.links.lock();
        links.retain(|(_, link)| link.strong_count() > 0);

        if let Some(link) = links
            .iter()
            .find(|(existing, _)| *existing == key)
            .and_then(|(_, link)| link.upgrade())
        {
            return Ok(link);
        }

        let link = Arc::new(UdpLink::open(config.bind, config.group)?);
        links.push((key, Arc::downgrade(&link)));
        Ok(link)
    }

    /// Number of live shared links
    pub fn len(&self) -> usize {
        self.links
            .lock()
            .iter()
            .filter(|(_, link)| link.strong_count() > 0)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

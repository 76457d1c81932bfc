//! Peer entity table
//!
//! One record per peer seen on the bus: its address, the datagram
//! endpoint it sends from, and the time of its last hello. Records are
//! keyed by the address's `id` attribute; lookups verify the full
//! (wildcard-aware) address match, so a stale id collision cannot
//! alias two different entities.

use mbus_core::Address;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::time::Instant;

/// A peer entity on the bus
#[derive(Debug, Clone)]
pub struct Entity {
    pub address: Address,
    pub endpoint: SocketAddr,
    pub last_hello: Instant,
}

#[derive(Default)]
pub(crate) struct EntityTable {
    entries: HashMap<String, Entity>,
}

impl EntityTable {
    /// Map key for an address: its identity, or the canonical string
    /// for the unusual case of a source without an `id` attribute
    pub fn key(address: &Address) -> String {
        address
            .identity()
            .map(str::to_string)
            .unwrap_or_else(|| address.to_string())
    }

    pub fn lookup(&self, address: &Address) -> Option<&Entity> {
        self.entries
            .get(&Self::key(address))
            .filter(|entity| entity.address.matches(address))
    }

    pub fn insert(&mut self, address: Address, endpoint: SocketAddr) {
        let key = Self::key(&address);
        self.entries.insert(
            key,
            Entity {
                address,
                endpoint,
                last_hello: Instant::now(),
            },
        );
    }

    pub fn refresh(&mut self, address: &Address) {
        if let Some(entity) = self.entries.get_mut(&Self::key(address)) {
            if entity.address.matches(address) {
                entity.last_hello = Instant::now();
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn addresses(&self) -> Vec<Address> {
        self.entries.values().map(|e| e.address.clone()).collect()
    }

    /// Remove every entity whose last hello is older than `deadline`
    /// and return their addresses
    pub fn evict_stale(&mut self, deadline: Duration) -> Vec<Address> {
        let now = Instant::now();
        let stale: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, entity)| now.duration_since(entity.last_hello) > deadline)
            .map(|(key, _)| key.clone())
            .collect();
        stale
            .into_iter()
            .filter_map(|key| self.entries.remove(&key))
            .map(|entity| entity.address)
            .collect()
    }
}

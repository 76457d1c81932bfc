//! Link trait definitions
//!
//! A link is an opaque byte-oriented datagram channel. The transport
//! layer above knows nothing about multicast joins or socket options;
//! it only sends byte buffers to the group or to a specific endpoint
//! and subscribes to incoming datagrams.

use async_trait::async_trait;
use bytes::Bytes;
use std::net::SocketAddr;
use tokio::sync::broadcast;

use crate::error::Result;

/// Events delivered by a link
#[derive(Debug, Clone)]
pub enum LinkEvent {
    /// A datagram arrived from the given endpoint
    Data(Bytes, SocketAddr),
    /// A receive error occurred
    Error(String),
}

/// An opaque datagram channel shared by one or more transports
#[async_trait]
pub trait Link: Send + Sync {
    /// Send a datagram to the whole group
    async fn send_group(&self, data: Bytes) -> Result<()>;

    /// Send a datagram to a single endpoint
    async fn send_to(&self, data: Bytes, dest: SocketAddr) -> Result<()>;

    /// Subscribe to incoming datagrams. Every subscriber sees every
    /// datagram, which is what lets several transports share one link.
    fn subscribe(&self) -> broadcast::Receiver<LinkEvent>;

    /// The local endpoint peers will see as the datagram source
    fn local_endpoint(&self) -> Option<SocketAddr>;

    /// Stop receiving; idempotent
    fn close(&self);
}

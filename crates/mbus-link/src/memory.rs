//! In-process link hub
//!
//! A `MemoryHub` stands in for a shared network segment: every link
//! created from the same hub sees every group datagram, including its
//! own (mirroring multicast loopback). Used by the transport test
//! suite and by examples that run several entities in one process.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::error::{LinkError, Result};
use crate::traits::{Link, LinkEvent};

const EVENT_CHANNEL_SIZE: usize = 256;

#[derive(Default)]
struct HubInner {
    links: Mutex<Vec<(SocketAddr, broadcast::Sender<LinkEvent>)>>,
    next_port: AtomicU16,
}

/// A simulated network segment
#[derive(Clone, Default)]
pub struct MemoryHub {
    inner: Arc<HubInner>,
}

impl MemoryHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a new link to the segment; each link gets a distinct
    /// loopback endpoint
    pub fn link(&self) -> MemoryLink {
        let port = 40000 + self.inner.next_port.fetch_add(1, Ordering::Relaxed);
        let endpoint = SocketAddr::from(([127, 0, 0, 1], port));
        let (events, _) = broadcast::channel(EVENT_CHANNEL_SIZE);
        self.inner
            .links
            .lock()
            .push((endpoint, events.clone()));
        MemoryLink {
            hub: self.inner.clone(),
            endpoint,
            events,
        }
    }
}

/// One endpoint on a [`MemoryHub`]
pub struct MemoryLink {
    hub: Arc<HubInner>,
    endpoint: SocketAddr,
    events: broadcast::Sender<LinkEvent>,
}

#[async_trait]
impl Link for MemoryLink {
    async fn send_group(&self, data: Bytes) -> Result<()> {
        for (_, events) in self.hub.links.lock().iter() {
            let _ = events.send(LinkEvent::Data(data.clone(), self.endpoint));
        }
        Ok(())
    }

    async fn send_to(&self, data: Bytes, dest: SocketAddr) -> Result<()> {
        let links = self.hub.links.lock();
        let (_, events) = links
            .iter()
            .find(|(endpoint, _)| *endpoint == dest)
            .ok_or_else(|| LinkError::SendFailed(format!("unknown endpoint {}", dest)))?;
        let _ = events.send(LinkEvent::Data(data, self.endpoint));
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<LinkEvent> {
        self.events.subscribe()
    }

    fn local_endpoint(&self) -> Option<SocketAddr> {
        Some(self.endpoint)
    }

    fn close(&self) {
        self.hub
            .links
            .lock()
            .retain(|(endpoint, _)| *endpoint != self.endpoint);
    }
}

impl Drop for MemoryLink {
    fn drop(&mut self) {
        self.close();
    }
}

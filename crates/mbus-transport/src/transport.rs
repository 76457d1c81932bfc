//! The public transport handle
//!
//! All protocol state lives in the engine task; the handle is a thin
//! command channel plus the health flag. Dropping the handle aborts the
//! engine, which deterministically cancels every outstanding hello,
//! sweep, retry and ack-flush deadline with it.

use mbus_core::{Address, Message};
use mbus_link::Link;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::warn;

use crate::config::SessionConfig;
use crate::engine::{Engine, EngineCommand, Observe};
use crate::error::{Result, TransportError};
use crate::observer::{EventKind, ObserverId};
use crate::registry::LinkRegistry;

/// One local entity on the bus
pub struct Transport {
    address: Address,
    commands: mpsc::UnboundedSender<EngineCommand>,
    next_observer_id: AtomicU64,
    setup_error: Option<TransportError>,
    engine: Option<JoinHandle<()>>,
}

impl Transport {
    /// Open a transport on the shared UDP link for `config`.
    ///
    /// Link setup failure does not panic or return an error: it leaves
    /// the transport in a non-operational state that
    /// [`Transport::is_operational`] reports and every send refuses.
    pub fn open(config: SessionConfig, address: Address, registry: &LinkRegistry) -> Self {
        match registry.acquire(&config) {
            Ok(link) => Self::open_with_link(config, address, link),
            Err(e) => Self::broken(address, e.into()),
        }
    }

    /// Open a transport over an externally supplied link (an in-process
    /// hub, for instance)
    pub fn open_with_link(
        config: SessionConfig,
        mut address: Address,
        link: Arc<dyn Link>,
    ) -> Self {
        address.disambiguate();

        let (commands, command_rx) = mpsc::unbounded_channel();
        let link_rx = link.subscribe();
        let engine = Engine::new(
            address.clone(),
            config.prefer_unicast,
            config.coder(),
            link,
        );
        let engine = tokio::spawn(engine.run(command_rx, link_rx));

        Self {
            address,
            commands,
            next_observer_id: AtomicU64::new(1),
            setup_error: None,
            engine: Some(engine),
        }
    }

    fn broken(mut address: Address, error: TransportError) -> Self {
        address.disambiguate();
        warn!("transport for {} is not operational: {}", address, error);
        // a dropped receiver makes every later command fail cleanly
        let (commands, _) = mpsc::unbounded_channel();
        Self {
            address,
            commands,
            next_observer_id: AtomicU64::new(1),
            setup_error: Some(error),
            engine: None,
        }
    }

    /// The disambiguated address of this entity
    pub fn local_address(&self) -> &Address {
        &self.address
    }

    /// Health predicate: check before use. A transport that failed to
    /// set up its link never becomes operational.
    pub fn is_operational(&self) -> bool {
        self.setup_error.is_none()
            && self
                .engine
                .as_ref()
                .map(|task| !task.is_finished())
                .unwrap_or(false)
    }

    /// The error that left the transport non-operational, if any
    pub fn setup_error(&self) -> Option<&TransportError> {
        self.setup_error.as_ref()
    }

    /// Queue a message for sending. The engine stamps the source
    /// address and sequence number and handles acknowledgement
    /// piggybacking and reliable retries.
    pub fn send(&self, msg: Message) -> Result<()> {
        if let Some(error) = &self.setup_error {
            return Err(TransportError::NotOperational(error.to_string()));
        }
        self.commands
            .send(EngineCommand::Send(msg))
            .map_err(|_| TransportError::Stopped)
    }

    fn observe(&self, observe: Observe) {
        let _ = self.commands.send(EngineCommand::Observe(observe));
    }

    fn next_id(&self) -> ObserverId {
        self.next_observer_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Observe newly discovered entities
    pub fn on_new_entity<F>(&self, callback: F) -> ObserverId
    where
        F: Fn(&Address) + Send + Sync + 'static,
    {
        let id = self.next_id();
        self.observe(Observe::NewEntity(id, Box::new(callback)));
        id
    }

    /// Observe entities evicted by the liveness timeout
    pub fn on_lost_entity<F>(&self, callback: F) -> ObserverId
    where
        F: Fn(&Address) + Send + Sync + 'static,
    {
        let id = self.next_id();
        self.observe(Observe::LostEntity(id, Box::new(callback)));
        id
    }

    /// Observe messages addressed to this entity
    pub fn on_incoming_message<F>(&self, callback: F) -> ObserverId
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        let id = self.next_id();
        self.observe(Observe::IncomingMessage(id, Box::new(callback)));
        id
    }

    /// Observe transport errors (failed sends, authentication and
    /// parse failures, exhausted reliable retries)
    pub fn on_transport_error<F>(&self, callback: F) -> ObserverId
    where
        F: Fn(&TransportError) + Send + Sync + 'static,
    {
        let id = self.next_id();
        self.observe(Observe::TransportError(id, Box::new(callback)));
        id
    }

    /// Remove an observer by the identity returned at registration
    pub fn remove_observer(&self, kind: EventKind, id: ObserverId) {
        let _ = self.commands.send(EngineCommand::Unobserve(kind, id));
    }

    /// Check whether an entity with the given address is currently
    /// known to be alive
    pub async fn entity_available(&self, address: &Address) -> bool {
        let (reply, answer) = oneshot::channel();
        if self
            .commands
            .send(EngineCommand::EntityAvailable(address.clone(), reply))
            .is_err()
        {
            return false;
        }
        answer.await.unwrap_or(false)
    }

    /// Addresses of all currently known entities
    pub async fn entities(&self) -> Vec<Address> {
        let (reply, answer) = oneshot::channel();
        if self.commands.send(EngineCommand::Entities(reply)).is_err() {
            return Vec::new();
        }
        answer.await.unwrap_or_default()
    }

    /// Ask the engine to stop. Pending deadlines die with it.
    pub fn close(&self) {
        let _ = self.commands.send(EngineCommand::Close);
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        if let Some(task) = self.engine.take() {
            task.abort();
        }
    }
}

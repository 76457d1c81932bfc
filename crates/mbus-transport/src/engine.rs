//! The transport engine
//!
//! A single task owns the entity table, the pending reliable sends,
//! the acknowledgement batches and the sequence counter. Everything is
//! driven by one `select!` loop over incoming datagrams, handle
//! commands and timer deadlines; no state is touched from anywhere
//! else, so no locking is needed and aborting the task cancels every
//! outstanding timer at once.

use bytes::Bytes;
use mbus_core::{Address, Coder, DeliveryType, Message, BYE_COMMAND, HELLO_COMMAND};
use mbus_link::{Link, LinkError, LinkEvent};
use rand::Rng;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::entity::EntityTable;
use crate::error::TransportError;
use crate::observer::{EventKind, ObserverId, Observers};

/// Delay before the first retry of a reliable send; the n-th retry
/// waits n times this long
pub const RETRY_INTERVAL: Duration = Duration::from_millis(100);

/// Number of transmission attempts for a reliable send (the initial
/// send plus `RETRY_LIMIT - 1` retransmissions)
pub const RETRY_LIMIT: u32 = 3;

/// How long received sequence numbers are held back for piggybacking
/// before a dedicated ack message is sent
pub const ACK_FLUSH_DELAY: Duration = Duration::from_millis(70);

/// Hello interval contribution per known entity
pub const HELLO_FACTOR: Duration = Duration::from_millis(200);

/// Lower bound of the hello interval
pub const HELLO_FLOOR: Duration = Duration::from_millis(1000);

/// Period of the liveness sweep over the entity table
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

const HELLO_DITHER_MIN: f64 = 0.9;
const HELLO_DITHER_MAX: f64 = 1.1;
const HELLO_DEAD_FACTOR: f64 = 5.0;

/// An instant far enough in the future that a `sleep_until` on it never
/// fires in practice; used as the deadline when no timer is armed.
/// Mirrors tokio's internal `Instant::far_future`.
fn far_future() -> Instant {
    Instant::now() + Duration::from_secs(86_400 * 365 * 30)
}

pub(crate) type AddressCallback = Box<dyn Fn(&Address) + Send + Sync>;
pub(crate) type MessageCallback = Box<dyn Fn(&Message) + Send + Sync>;
pub(crate) type ErrorCallback = Box<dyn Fn(&TransportError) + Send + Sync>;

/// Observer registration payloads
pub(crate) enum Observe {
    NewEntity(ObserverId, AddressCallback),
    LostEntity(ObserverId, AddressCallback),
    IncomingMessage(ObserverId, MessageCallback),
    TransportError(ObserverId, ErrorCallback),
}

/// Commands from the handle to the engine task
pub(crate) enum EngineCommand {
    Send(Message),
    Observe(Observe),
    Unobserve(EventKind, ObserverId),
    EntityAvailable(Address, oneshot::Sender<bool>),
    Entities(oneshot::Sender<Vec<Address>>),
    Close,
}

#[derive(Clone, Copy)]
enum SendTarget {
    Group,
    Unicast(SocketAddr),
}

struct PendingSend {
    retries: u32,
    wire: Bytes,
    target: SendTarget,
    deadline: Instant,
}

struct AckBatch {
    source: Address,
    seqs: Vec<u64>,
    deadline: Instant,
}

pub(crate) struct Engine {
    address: Address,
    prefer_unicast: bool,
    coder: Coder,
    link: Arc<dyn Link>,
    entities: EntityTable,
    sequence_no: u64,
    pending_sends: HashMap<u64, PendingSend>,
    ack_batches: HashMap<String, AckBatch>,
    next_hello: Instant,
    new_entity: Observers<Address>,
    lost_entity: Observers<Address>,
    incoming: Observers<Message>,
    errors: Observers<TransportError>,
}

impl Engine {
    pub fn new(
        address: Address,
        prefer_unicast: bool,
        coder: Coder,
        link: Arc<dyn Link>,
    ) -> Self {
        Self {
            address,
            prefer_unicast,
            coder,
            link,
            entities: EntityTable::default(),
            sequence_no: 0,
            pending_sends: HashMap::new(),
            ack_batches: HashMap::new(),
            next_hello: Instant::now(),
            new_entity: Observers::new(),
            lost_entity: Observers::new(),
            incoming: Observers::new(),
            errors: Observers::new(),
        }
    }

    pub async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<EngineCommand>,
        mut link_rx: broadcast::Receiver<LinkEvent>,
    ) {
        // the first hello goes out immediately; the sweep waits a full period
        self.next_hello = Instant::now();
        let mut sweep =
            tokio::time::interval_at(Instant::now() + SWEEP_INTERVAL, SWEEP_INTERVAL);

        loop {
            let retry_at = self
                .pending_sends
                .values()
                .map(|p| p.deadline)
                .min()
                .unwrap_or_else(far_future);
            let ack_at = self
                .ack_batches
                .values()
                .map(|b| b.deadline)
                .min()
                .unwrap_or_else(far_future);

            tokio::select! {
                cmd = commands.recv() => match cmd {
                    Some(EngineCommand::Send(msg)) => self.dispatch_send(msg).await,
                    Some(EngineCommand::Observe(observe)) => self.observe(observe),
                    Some(EngineCommand::Unobserve(kind, id)) => self.unobserve(kind, id),
                    Some(EngineCommand::EntityAvailable(address, reply)) => {
                        let _ = reply.send(self.entities.lookup(&address).is_some());
                    }
                    Some(EngineCommand::Entities(reply)) => {
                        let _ = reply.send(self.entities.addresses());
                    }
                    Some(EngineCommand::Close) | None => break,
                },
                event = link_rx.recv() => match event {
                    Ok(LinkEvent::Data(data, sender)) => {
                        self.handle_datagram(&data, sender).await;
                    }
                    Ok(LinkEvent::Error(e)) => {
                        warn!("link receive error: {}", e);
                        self.report(TransportError::Link(LinkError::ReceiveFailed(e)));
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("receiver lagged, {} datagrams dropped", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        warn!("link closed, stopping engine");
                        self.report(TransportError::Link(LinkError::Closed));
                        break;
                    }
                },
                _ = tokio::time::sleep_until(self.next_hello) => {
                    self.send_hello().await;
                }
                _ = sweep.tick() => {
                    self.sweep_entities();
                }
                _ = tokio::time::sleep_until(retry_at) => {
                    self.fire_retries().await;
                }
                _ = tokio::time::sleep_until(ack_at) => {
                    self.flush_due_acks().await;
                }
            }
        }
    }

    fn observe(&mut self, observe: Observe) {
        match observe {
            Observe::NewEntity(id, cb) => self.new_entity.insert(id, cb),
            Observe::LostEntity(id, cb) => self.lost_entity.insert(id, cb),
            Observe::IncomingMessage(id, cb) => self.incoming.insert(id, cb),
            Observe::TransportError(id, cb) => self.errors.insert(id, cb),
        }
    }

    fn unobserve(&mut self, kind: EventKind, id: ObserverId) {
        match kind {
            EventKind::NewEntity => self.new_entity.remove(id),
            EventKind::LostEntity => self.lost_entity.remove(id),
            EventKind::IncomingMessage => self.incoming.remove(id),
            EventKind::TransportError => self.errors.remove(id),
        };
    }

    fn report(&self, error: TransportError) {
        self.errors.emit(&error);
    }

    /// Stamp, frame and transmit an outgoing message, registering
    /// reliable sends for retry
    async fn dispatch_send(&mut self, mut msg: Message) {
        msg.header.sequence_no = self.sequence_no;
        self.sequence_no += 1;
        msg.header.source = self.address.clone();

        // piggyback: a pending ack batch for a unique destination rides
        // along instead of waiting for its own datagram
        if msg.header.destination.is_unique() {
            let key = EntityTable::key(&msg.header.destination);
            if let Some(batch) = self.ack_batches.remove(&key) {
                if batch.source.matches(&msg.header.destination) {
                    debug!(
                        "piggybacking {} acks onto sequence {}",
                        batch.seqs.len(),
                        msg.header.sequence_no
                    );
                    msg.header.acks.extend(batch.seqs);
                } else {
                    self.ack_batches.insert(key, batch);
                }
            }
        }

        let target = self.pick_target(&msg.header.destination);
        let wire = Bytes::from(self.coder.encode(&msg.to_string()));

        if msg.header.delivery == DeliveryType::Reliable {
            self.pending_sends.insert(
                msg.header.sequence_no,
                PendingSend {
                    retries: 1,
                    wire: wire.clone(),
                    target,
                    deadline: Instant::now() + RETRY_INTERVAL,
                },
            );
        }

        if let Err(e) = self.transmit(wire, target).await {
            warn!("send failed: {}", e);
            self.report(TransportError::Link(e));
        }
    }

    async fn transmit(&self, wire: Bytes, target: SendTarget) -> mbus_link::Result<()> {
        match target {
            SendTarget::Group => self.link.send_group(wire).await,
            SendTarget::Unicast(endpoint) => self.link.send_to(wire, endpoint).await,
        }
    }

    fn pick_target(&self, destination: &Address) -> SendTarget {
        if self.prefer_unicast && destination.is_unique() {
            if let Some(entity) = self.entities.lookup(destination) {
                return SendTarget::Unicast(entity.endpoint);
            }
        }
        SendTarget::Group
    }

    async fn send_hello(&mut self) {
        let mut hello = Message::new();
        hello.add_command(HELLO_COMMAND);
        self.dispatch_send(hello).await;
        self.next_hello = Instant::now() + self.hello_interval();
    }

    /// The hello rate scales down with session size, dithered to avoid
    /// synchronized bursts
    fn hello_interval(&self) -> Duration {
        let base = (HELLO_FACTOR * self.entities.len() as u32).max(HELLO_FLOOR);
        let dither = rand::thread_rng().gen_range(HELLO_DITHER_MIN..HELLO_DITHER_MAX);
        base.mul_f64(dither)
    }

    fn liveness_deadline(&self) -> Duration {
        let base = (HELLO_FACTOR * self.entities.len() as u32).max(HELLO_FLOOR);
        base.mul_f64(HELLO_DEAD_FACTOR * HELLO_DITHER_MAX)
    }

    fn sweep_entities(&mut self) {
        let deadline = self.liveness_deadline();
        for address in self.entities.evict_stale(deadline) {
            info!("entity lost: {}", address);
            self.lost_entity.emit(&address);
        }
    }

    async fn handle_datagram(&mut self, data: &[u8], sender: SocketAddr) {
        let plaintext = match self.coder.decode(data) {
            Ok(plaintext) => plaintext,
            Err(e) => {
                warn!("dropping datagram from {}: {}", sender, e);
                self.report(TransportError::Codec(e));
                return;
            }
        };

        let msg = match Message::parse(&plaintext) {
            Ok(msg) => msg,
            Err(e) => {
                warn!("dropping unparsable message from {}: {}", sender, e);
                self.report(TransportError::Codec(e));
                return;
            }
        };

        self.handle_message(msg, sender);
    }

    fn handle_message(&mut self, msg: Message, sender: SocketAddr) {
        // loop-back suppression; exact because addresses carry an id
        if self.address.matches(&msg.header.source) {
            return;
        }

        // acknowledgements cancel pending reliable sends
        for seq in &msg.header.acks {
            if self.pending_sends.remove(seq).is_some() {
                debug!("sequence {} acknowledged", seq);
            }
        }

        // entity discovery
        if self.entities.lookup(&msg.header.source).is_none() {
            info!("new entity: {}", msg.header.source);
            self.entities.insert(msg.header.source.clone(), sender);
            let address = msg.header.source.clone();
            self.new_entity.emit(&address);
        }

        // a reliable receipt owes the sender an acknowledgement
        if msg.header.delivery == DeliveryType::Reliable {
            self.queue_ack(&msg.header.source, msg.header.sequence_no);
        }

        if msg.contains(HELLO_COMMAND) {
            self.entities.refresh(&msg.header.source);
            return;
        }
        if msg.contains(BYE_COMMAND) {
            // no eviction here; departure is handled by the liveness
            // timeout, and callers rely on that
            return;
        }

        // destination filter
        if !self.address.is_subset_of(&msg.header.destination) {
            return;
        }

        if !msg.payload.is_empty() {
            self.incoming.emit(&msg);
        }
    }

    fn queue_ack(&mut self, source: &Address, seq: u64) {
        let key = EntityTable::key(source);
        match self.ack_batches.get_mut(&key) {
            Some(batch) => batch.seqs.push(seq),
            None => {
                self.ack_batches.insert(
                    key,
                    AckBatch {
                        source: source.clone(),
                        seqs: vec![seq],
                        deadline: Instant::now() + ACK_FLUSH_DELAY,
                    },
                );
            }
        }
    }

    async fn fire_retries(&mut self) {
        let now = Instant::now();
        let due: Vec<u64> = self
            .pending_sends
            .iter()
            .filter(|(_, p)| p.deadline <= now)
            .map(|(seq, _)| *seq)
            .collect();

        for seq in due {
            let resend = match self.pending_sends.get_mut(&seq) {
                Some(pending) if pending.retries < RETRY_LIMIT => {
                    pending.retries += 1;
                    pending.deadline = now + RETRY_INTERVAL * pending.retries;
                    Some((pending.wire.clone(), pending.target))
                }
                Some(_) => {
                    self.pending_sends.remove(&seq);
                    warn!(
                        "sending message reliably failed: never received an ack ({})",
                        seq
                    );
                    self.report(TransportError::ReliableDeliveryFailed(seq));
                    None
                }
                None => None,
            };

            if let Some((wire, target)) = resend {
                debug!("retransmitting sequence {}", seq);
                if let Err(e) = self.transmit(wire, target).await {
                    warn!("retransmission failed: {}", e);
                    self.report(TransportError::Link(e));
                }
            }
        }
    }

    async fn flush_due_acks(&mut self) {
        let now = Instant::now();
        let due: Vec<String> = self
            .ack_batches
            .iter()
            .filter(|(_, batch)| batch.deadline <= now)
            .map(|(key, _)| key.clone())
            .collect();

        for key in due {
            if let Some(batch) = self.ack_batches.remove(&key) {
                debug!("flushing {} acks to {}", batch.seqs.len(), batch.source);
                let mut msg = Message::to(batch.source);
                msg.header.acks = batch.seqs;
                self.dispatch_send(msg).await;
            }
        }
    }
}

//! mbus Transport
//!
//! The protocol engine of the mbus message bus:
//! - Entity discovery and liveness tracking with self-scaling hello
//!   timers
//! - Reliable delivery with scheduled retransmission
//! - Acknowledgement batching with piggybacking
//! - Destination filtering and message dispatch to observers
//!
//! # Example
//!
//! ```no_run
//! use mbus_core::{Address, Command, Message, Value};
//! use mbus_transport::{LinkRegistry, SessionConfig, Transport};
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() {
//!     let registry = LinkRegistry::new();
//!     let address = Address::parse("(app:example)").unwrap();
//!     let bus = Transport::open(SessionConfig::default(), address, &registry);
//!     assert!(bus.is_operational());
//!
//!     bus.on_incoming_message(|msg| {
//!         println!("got {} commands", msg.payload.len());
//!     });
//!
//!     let mut msg = Message::to(Address::parse("(app:peer)").unwrap()).reliable();
//!     msg.add(Command::with_args("example.ping", vec![Value::from(1)]));
//!     bus.send(msg).unwrap();
//! }
//! ```

pub mod config;
pub mod engine;
pub mod entity;
pub mod error;
pub mod observer;
pub mod registry;
pub mod transport;

pub use config::{SessionConfig, DEFAULT_GROUP_PORT};
pub use engine::{
    ACK_FLUSH_DELAY, HELLO_FACTOR, HELLO_FLOOR, RETRY_INTERVAL, RETRY_LIMIT, SWEEP_INTERVAL,
};
pub use entity::Entity;
pub use error::{Result, TransportError};
pub use observer::{EventKind, ObserverId};
pub use registry::LinkRegistry;
pub use transport::Transport;

//! mbus Link
//!
//! Datagram link layer for the mbus protocol:
//! - The [`Link`] trait: an opaque byte channel with group and unicast
//!   sends and a broadcast subscription for incoming datagrams
//! - [`UdpLink`]: IPv4 multicast group socket plus a unicast socket
//! - [`MemoryHub`]/[`MemoryLink`]: an in-process segment for tests and
//!   multi-entity examples

pub mod error;
pub mod memory;
pub mod traits;
pub mod udp;

pub use error::{LinkError, Result};
pub use memory::{MemoryHub, MemoryLink};
pub use traits::{Link, LinkEvent};
pub use udp::UdpLink;

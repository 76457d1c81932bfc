//! UDP multicast/unicast link implementation
//!
//! One socket is bound to the group port and joined to the multicast
//! group; a second, ephemeral socket is used for sending and for
//! receiving unicast replies. Peers see the ephemeral socket's address
//! as the datagram source, so unicast traffic comes straight back to
//! it.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::error::{LinkError, Result};
use crate::traits::{Link, LinkEvent};

/// Receive buffer size; comfortably larger than any mbus datagram
const RECV_BUFFER_SIZE: usize = 65536;

/// Event channel depth per link
const EVENT_CHANNEL_SIZE: usize = 256;

/// UDP link: a shared multicast receive socket plus a unicast
/// send/receive socket
pub struct UdpLink {
    group: SocketAddr,
    send_socket: Arc<UdpSocket>,
    events: broadcast::Sender<LinkEvent>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl UdpLink {
    /// Open a link: bind to the group port, join the group on the
    /// interface given by `bind`, and set up the unicast socket.
    ///
    /// Must be called from within a tokio runtime.
    pub fn open(bind: SocketAddr, group: SocketAddr) -> Result<Self> {
        let group_ip = match group.ip() {
            IpAddr::V4(ip) if ip.is_multicast() => ip,
            other => {
                return Err(LinkError::JoinFailed(format!(
                    "{} is not an IPv4 multicast group",
                    other
                )))
            }
        };
        let bind_ip = match bind.ip() {
            IpAddr::V4(ip) => ip,
            other => {
                return Err(LinkError::BindFailed(format!(
                    "{} is not an IPv4 interface address",
                    other
                )))
            }
        };

        let group_socket = open_group_socket(group_ip, group.port(), bind_ip)?;
        let send_socket = open_send_socket(bind_ip)?;

        let (events, _) = broadcast::channel(EVENT_CHANNEL_SIZE);

        let link = Self {
            group,
            send_socket: Arc::new(send_socket),
            events,
            tasks: Mutex::new(Vec::new()),
        };

        let mut tasks = link.tasks.lock();
        tasks.push(spawn_receiver(Arc::new(group_socket), link.events.clone()));
        tasks.push(spawn_receiver(link.send_socket.clone(), link.events.clone()));
        drop(tasks);

        info!(
            "link open: group {}, local endpoint {:?}",
            group,
            link.local_endpoint()
        );

        Ok(link)
    }

    /// The group endpoint this link is joined to
    pub fn group(&self) -> SocketAddr {
        self.group
    }
}

fn open_group_socket(group_ip: Ipv4Addr, port: u16, bind_ip: Ipv4Addr) -> Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
        .map_err(|e| LinkError::BindFailed(e.to_string()))?;
    socket
        .set_reuse_address(true)
        .map_err(|e| LinkError::BindFailed(e.to_string()))?;
    #[cfg(unix)]
    socket
        .set_reuse_port(true)
        .map_err(|e| LinkError::BindFailed(e.to_string()))?;

    let bind_addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port);
    socket
        .bind(&bind_addr.into())
        .map_err(|e| LinkError::BindFailed(e.to_string()))?;
    socket
        .join_multicast_v4(&group_ip, &bind_ip)
        .map_err(|e| LinkError::JoinFailed(e.to_string()))?;
    socket
        .set_multicast_loop_v4(true)
        .map_err(|e| LinkError::JoinFailed(e.to_string()))?;
    socket
        .set_nonblocking(true)
        .map_err(|e| LinkError::BindFailed(e.to_string()))?;

    UdpSocket::from_std(socket.into()).map_err(LinkError::Io)
}

fn open_send_socket(bind_ip: Ipv4Addr) -> Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
        .map_err(|e| LinkError::BindFailed(e.to_string()))?;
    let bind_addr = SocketAddr::new(IpAddr::V4(bind_ip), 0);
    socket
        .bind(&bind_addr.into())
        .map_err(|e| LinkError::BindFailed(e.to_string()))?;

    // multicast sends leave through this socket as well
    socket
        .set_multicast_if_v4(&bind_ip)
        .map_err(|e| LinkError::JoinFailed(e.to_string()))?;
    socket
        .set_multicast_loop_v4(true)
        .map_err(|e| LinkError::JoinFailed(e.to_string()))?;
    socket
        .set_multicast_ttl_v4(1)
        .map_err(|e| LinkError::JoinFailed(e.to_string()))?;
    socket
        .set_nonblocking(true)
        .map_err(|e| LinkError::BindFailed(e.to_string()))?;

    UdpSocket::from_std(socket.into()).map_err(LinkError::Io)
}

fn spawn_receiver(
    socket: Arc<UdpSocket>,
    events: broadcast::Sender<LinkEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut buf = vec![0u8; RECV_BUFFER_SIZE];
        loop {
            match socket.recv_from(&mut buf).await {
                Ok((len, from)) => {
                    debug!("received {} bytes from {}", len, from);
                    let data = Bytes::copy_from_slice(&buf[..len]);
                    // no subscribers yet is fine; the datagram is simply dropped
                    let _ = events.send(LinkEvent::Data(data, from));
                }
                Err(e) => {
                    error!("receive error: {}", e);
                    let _ = events.send(LinkEvent::Error(e.to_string()));
                }
            }
        }
    })
}

#[async_trait]
impl Link for UdpLink {
    async fn send_group(&self, data: Bytes) -> Result<()> {
        self.send_socket
            .send_to(&data, self.group)
            .await
            .map_err(|e| LinkError::SendFailed(e.to_string()))?;
        Ok(())
    }

    async fn send_to(&self, data: Bytes, dest: SocketAddr) -> Result<()> {
        self.send_socket
            .send_to(&data, dest)
            .await
            .map_err(|e| LinkError::SendFailed(e.to_string()))?;
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<LinkEvent> {
        self.events.subscribe()
    }

    fn local_endpoint(&self) -> Option<SocketAddr> {
        self.send_socket.local_addr().ok()
    }

    fn close(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

impl Drop for UdpLink {
    fn drop(&mut self) {
        self.close();
    }
}

//! tokio sockets behind [`LinkInterface`]
//!
//! Each link spawns a reader and a writer task. Inbound packets and
//! failures are reported on the [`LinkEvent`] channel returned by
//! [`SocketLink::connect`]; outbound packets are queued without blocking
//! the session.

use super::packet_framing::StreamFramer;
use super::{LinkInterface, TunnelInterface};
use crate::error::{IntoVpnError, Result, VpnError};
use crate::options::{Endpoint, SocketType};
use bytes::Bytes;
use log::{debug, info, warn};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Control fragment size when the profile does not say otherwise
pub const DEFAULT_LINK_MTU: usize = 1000;

const READ_BUFFER_SIZE: usize = 65536;

/// Something happened on a link
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    Packets(Vec<Bytes>),
    /// Reading or writing failed
    Failed(String),
    /// The server closed the stream
    Closed,
}

/// UDP or TCP connection to an OpenVPN server
pub struct SocketLink {
    socket_type: SocketType,
    remote: SocketAddr,
    mtu: usize,
    writer: mpsc::UnboundedSender<Vec<Bytes>>,
    reader_task: JoinHandle<()>,
}

impl SocketLink {
    /// Resolve and connect to `endpoint`
    pub async fn connect(
        endpoint: &Endpoint,
        connect_timeout: Duration,
        mtu: usize,
    ) -> Result<(Self, mpsc::UnboundedReceiver<LinkEvent>)> {
        let remote = resolve(endpoint).await?;
        info!("Connecting to {remote} over {}", endpoint.socket_type);

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (writer, writer_rx) = mpsc::unbounded_channel();
        let reader_task = match endpoint.socket_type {
            SocketType::Udp => {
                let local: SocketAddr = if remote.is_ipv4() {
                    ([0, 0, 0, 0], 0).into()
                } else {
                    ([0u16; 8], 0).into()
                };
                let socket = UdpSocket::bind(local).await?;
                socket.connect(remote).await?;
                let socket = Arc::new(socket);
                tokio::spawn(udp_writer(socket.clone(), writer_rx, events_tx.clone()));
                tokio::spawn(udp_reader(socket, events_tx))
            }
            SocketType::Tcp => {
                let stream = tokio::time::timeout(connect_timeout, TcpStream::connect(remote))
                    .await
                    .map_err(|_| VpnError::Network(format!("Connection to {remote} timed out")))?
                    .into_vpn_error(&format!("Connection to {remote} failed"))?;
                stream.set_nodelay(true)?;
                let (read_half, write_half) = stream.into_split();
                tokio::spawn(tcp_writer(write_half, writer_rx, events_tx.clone()));
                tokio::spawn(tcp_reader(read_half, events_tx))
            }
        };

        Ok((
            Self {
                socket_type: endpoint.socket_type,
                remote,
                mtu,
                writer,
                reader_task,
            },
            events_rx,
        ))
    }
}

impl Drop for SocketLink {
    fn drop(&mut self) {
        self.reader_task.abort();
    }
}

impl LinkInterface for SocketLink {
    fn is_reliable(&self) -> bool {
        self.socket_type == SocketType::Tcp
    }

    fn mtu(&self) -> usize {
        self.mtu
    }

    fn remote_address(&self) -> Option<String> {
        Some(self.remote.ip().to_string())
    }

    fn write_packets(&mut self, packets: Vec<Bytes>) -> Result<()> {
        self.writer
            .send(packets)
            .map_err(|_| VpnError::Network("Link writer closed".into()))
    }
}

async fn resolve(endpoint: &Endpoint) -> Result<SocketAddr> {
    let addresses: Vec<SocketAddr> =
        tokio::net::lookup_host((endpoint.hostname.as_str(), endpoint.port))
            .await
            .into_vpn_error(&format!("Cannot resolve {}", endpoint.hostname))?
            .collect();
    addresses
        .iter()
        .find(|a| a.is_ipv4())
        .or_else(|| addresses.first())
        .copied()
        .ok_or_else(|| VpnError::Network(format!("No address for {}", endpoint.hostname)))
}

async fn udp_reader(socket: Arc<UdpSocket>, events: mpsc::UnboundedSender<LinkEvent>) {
    let mut buffer = vec![0u8; READ_BUFFER_SIZE];
    loop {
        match socket.recv(&mut buffer).await {
            Ok(n) => {
                let packet = Bytes::copy_from_slice(&buffer[..n]);
                if events.send(LinkEvent::Packets(vec![packet])).is_err() {
                    break;
                }
            }
            Err(e) => {
                warn!("UDP read failed: {e}");
                let _ = events.send(LinkEvent::Failed(e.to_string()));
                break;
            }
        }
    }
}

async fn udp_writer(
    socket: Arc<UdpSocket>,
    mut packets: mpsc::UnboundedReceiver<Vec<Bytes>>,
    events: mpsc::UnboundedSender<LinkEvent>,
) {
    while let Some(batch) = packets.recv().await {
        for packet in batch {
            if let Err(e) = socket.send(&packet).await {
                warn!("UDP write failed: {e}");
                let _ = events.send(LinkEvent::Failed(e.to_string()));
                return;
            }
        }
    }
    debug!("UDP writer finished");
}

async fn tcp_reader(
    mut stream: tokio::net::tcp::OwnedReadHalf,
    events: mpsc::UnboundedSender<LinkEvent>,
) {
    let mut framer = StreamFramer::new();
    let mut buffer = vec![0u8; READ_BUFFER_SIZE];
    loop {
        match stream.read(&mut buffer).await {
            Ok(0) => {
                debug!("TCP stream closed by server");
                let _ = events.send(LinkEvent::Closed);
                break;
            }
            Ok(n) => {
                let packets = framer.decode_packets(&buffer[..n]);
                if !packets.is_empty() && events.send(LinkEvent::Packets(packets)).is_err() {
                    break;
                }
            }
            Err(e) => {
                warn!("TCP read failed: {e}");
                let _ = events.send(LinkEvent::Failed(e.to_string()));
                break;
            }
        }
    }
}

async fn tcp_writer(
    mut stream: tokio::net::tcp::OwnedWriteHalf,
    mut packets: mpsc::UnboundedReceiver<Vec<Bytes>>,
    events: mpsc::UnboundedSender<LinkEvent>,
) {
    let mut framer = StreamFramer::new();
    while let Some(batch) = packets.recv().await {
        let result = match framer.frame_packets(&batch) {
            Ok(framed) => stream.write_all(&framed).await.map_err(VpnError::from),
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            warn!("TCP write failed: {e}");
            let _ = events.send(LinkEvent::Failed(e.to_string()));
            return;
        }
    }
    let _ = stream.shutdown().await;
}

/// Hands decrypted packets to a channel, e.g. for a TUN device driver
pub struct ChannelTunnel {
    sender: mpsc::UnboundedSender<Vec<Bytes>>,
    persistent: bool,
}

impl ChannelTunnel {
    pub fn new(persistent: bool) -> (Self, mpsc::UnboundedReceiver<Vec<Bytes>>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender, persistent }, receiver)
    }
}

impl TunnelInterface for ChannelTunnel {
    fn write_packets(&mut self, packets: Vec<Bytes>) -> Result<()> {
        self.sender
            .send(packets)
            .map_err(|_| VpnError::Network("Tunnel receiver closed".into()))
    }

    fn is_persistent(&self) -> bool {
        self.persistent
    }
}

//! Link and tunnel seams
//!
//! A session reads and writes raw OpenVPN packets through a
//! [`LinkInterface`] and delivers decrypted IP packets to a
//! [`TunnelInterface`]. Neither trait knows about sockets or TUN devices,
//! so the session can be driven entirely from memory.

use crate::error::Result;
use crate::options::PushReply;
use crate::protocol::constants::HARD_RESET_TIMEOUT;
use bytes::Bytes;
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

pub mod packet_framing;
#[cfg(feature = "tokio-runtime")]
pub mod socket;

/// Transport carrying OpenVPN packets to and from the server
pub trait LinkInterface: Send {
    /// Whether the transport retransmits on its own (TCP)
    fn is_reliable(&self) -> bool;

    /// Largest control fragment to put on the wire
    fn mtu(&self) -> usize;

    /// Address of the server, for reporting
    fn remote_address(&self) -> Option<String>;

    /// How long to wait for the server's hard reset
    fn hard_reset_timeout(&self) -> Duration {
        HARD_RESET_TIMEOUT
    }

    /// Send packets in order; an error means the link is unusable
    fn write_packets(&mut self, packets: Vec<Bytes>) -> Result<()>;
}

/// Destination of decrypted IP packets
pub trait TunnelInterface: Send {
    fn write_packets(&mut self, packets: Vec<Bytes>) -> Result<()>;

    /// A persistent tunnel survives session cleanup
    fn is_persistent(&self) -> bool {
        false
    }
}

/// Interface settings derived from a push reply
#[derive(Debug, Clone, PartialEq)]
pub struct TunnelConfig {
    pub interface_name: String,
    pub local_ip: Ipv4Addr,
    pub remote_ip: Ipv4Addr,
    pub netmask: Ipv4Addr,
    pub mtu: u16,
    pub dns_servers: Vec<IpAddr>,
}

impl TunnelConfig {
    pub fn from_reply(interface_name: impl Into<String>, reply: &PushReply, mtu: u16) -> Self {
        Self {
            interface_name: interface_name.into(),
            local_ip: reply.ipv4.address,
            remote_ip: reply.ipv4.default_gateway,
            netmask: reply.ipv4.address_mask,
            mtu,
            dns_servers: reply.dns_servers.clone(),
        }
    }
}

impl std::fmt::Display for TunnelConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} {}/{} via {} mtu {}",
            self.interface_name, self.local_ip, self.netmask, self.remote_ip, self.mtu
        )?;
        if !self.dns_servers.is_empty() {
            let dns: Vec<String> = self.dns_servers.iter().map(|d| d.to_string()).collect();
            write!(f, " dns {}", dns.join(","))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_from_reply() {
        let reply = PushReply::parse(
            "PUSH_REPLY,topology subnet,route-gateway 10.8.0.1,ifconfig 10.8.0.2 255.255.255.0,dhcp-option DNS 1.1.1.1",
        )
        .unwrap()
        .unwrap();
        let config = TunnelConfig::from_reply("tun0", &reply, 1500);
        assert_eq!(config.local_ip, Ipv4Addr::new(10, 8, 0, 2));
        assert_eq!(config.remote_ip, Ipv4Addr::new(10, 8, 0, 1));
        assert_eq!(config.netmask, Ipv4Addr::new(255, 255, 255, 0));
        assert_eq!(
            config.to_string(),
            "tun0 10.8.0.2/255.255.255.0 via 10.8.0.1 mtu 1500 dns 1.1.1.1"
        );
    }
}

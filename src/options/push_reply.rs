//! Server `PUSH_REPLY` messages

use super::{
    Capabilities, Ipv4Settings, Ipv6Settings, OptionsBundle, ProxySettings, RoutingPolicy,
};
use crate::crypto::Cipher;
use crate::error::{OptionsError, Result, SessionError, VpnError};
use crate::proxy::configuration::{CompressionAlgorithm, CompressionFraming};
use std::fmt;
use std::net::IpAddr;

const MARKER: &str = "PUSH_REPLY";

/// Network settings and overrides pushed by the server
#[derive(Debug, Clone, PartialEq)]
pub struct PushReply {
    pub ipv4: Ipv4Settings,
    pub ipv6: Option<Ipv6Settings>,
    pub dns_servers: Vec<IpAddr>,
    pub search_domain: Option<String>,
    pub routing_policies: Vec<RoutingPolicy>,
    pub http_proxy: Option<ProxySettings>,
    pub https_proxy: Option<ProxySettings>,
    pub proxy_bypass_domains: Vec<String>,
    pub auth_token: Option<String>,
    pub peer_id: Option<u32>,
    pub cipher: Option<Cipher>,
    pub compression_framing: Option<CompressionFraming>,
    pub compression_algorithm: Option<CompressionAlgorithm>,
    pub keep_alive_seconds: Option<u64>,
    pub keep_alive_timeout_seconds: Option<u64>,
}

impl PushReply {
    /// Parse a control message, returning `None` if it is not a push reply
    pub fn parse(message: &str) -> Result<Option<Self>> {
        Self::parse_with(message, Capabilities::default())
    }

    pub fn parse_with(message: &str, capabilities: Capabilities) -> Result<Option<Self>> {
        let Some(body) = message.strip_prefix(MARKER) else {
            return Ok(None);
        };
        let lines: Vec<&str> = body
            .split(',')
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .collect();
        let bundle =
            OptionsBundle::parse_with(&lines, false, capabilities).map_err(|e| match e {
                OptionsError::Malformed(message) => {
                    VpnError::from(SessionError::MalformedPushReply(message))
                }
                other => VpnError::from(other),
            })?;

        if bundle.topology.is_none() {
            return Err(SessionError::MalformedPushReply("missing topology".into()).into());
        }
        let ipv4 = bundle
            .ipv4
            .ok_or_else(|| SessionError::MalformedPushReply("missing ifconfig".into()))?;

        Ok(Some(Self {
            ipv4,
            ipv6: bundle.ipv6,
            dns_servers: bundle.dns_servers,
            search_domain: bundle.search_domain,
            routing_policies: bundle.routing_policies,
            http_proxy: bundle.http_proxy,
            https_proxy: bundle.https_proxy,
            proxy_bypass_domains: bundle.proxy_bypass_domains,
            auth_token: bundle.auth_token,
            peer_id: bundle.peer_id,
            cipher: bundle.cipher,
            compression_framing: bundle.compression_framing,
            compression_algorithm: bundle.compression_algorithm,
            keep_alive_seconds: bundle.keep_alive_seconds,
            keep_alive_timeout_seconds: bundle.keep_alive_timeout_seconds,
        }))
    }

    /// Whether the server expects compressed payloads
    pub fn uses_compression(&self) -> bool {
        matches!(
            self.compression_algorithm,
            Some(CompressionAlgorithm::Lzo | CompressionAlgorithm::Other)
        )
    }
}

impl fmt::Display for PushReply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "addr {} netmask {} gw {} ({} routes)",
            self.ipv4.address,
            self.ipv4.address_mask,
            self.ipv4.default_gateway,
            self.ipv4.routes.len()
        )?;
        if let Some(ipv6) = &self.ipv6 {
            write!(
                f,
                ", addr6 {}/{} gw6 {}",
                ipv6.address, ipv6.address_prefix_length, ipv6.default_gateway
            )?;
        }
        write!(f, ", dns {:?}", self.dns_servers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    const COMMON: &str = "PUSH_REPLY,dhcp-option DNS 8.8.8.8,dhcp-option DNS 4.4.4.4,route 10.8.0.1,topology net30,ping 10,ping-restart 120,ifconfig 10.8.0.6 10.8.0.5,peer-id 0,cipher AES-256-CBC";

    fn parse(message: &str) -> PushReply {
        PushReply::parse(message).unwrap().unwrap()
    }

    #[test]
    fn test_not_a_push_reply() {
        assert_eq!(PushReply::parse("AUTH_FAILED").unwrap(), None);
        assert_eq!(PushReply::parse("").unwrap(), None);
    }

    #[test]
    fn test_net30() {
        let reply = parse("PUSH_REPLY,redirect-gateway def1,dhcp-option DNS 209.222.18.222,dhcp-option DNS 209.222.18.218,ping 10,comp-lzo no,route 10.5.10.1,topology net30,ifconfig 10.5.10.6 10.5.10.5,auth-token AUkQf/b3nj3L+CH4RJPP0Vuq8/gpntr7uPqzjQhncig=");
        assert_eq!(reply.ipv4.address, Ipv4Addr::new(10, 5, 10, 6));
        assert_eq!(reply.ipv4.address_mask, Ipv4Addr::BROADCAST);
        assert_eq!(reply.ipv4.default_gateway, Ipv4Addr::new(10, 5, 10, 5));
        assert_eq!(
            reply.dns_servers,
            vec![
                IpAddr::V4(Ipv4Addr::new(209, 222, 18, 222)),
                IpAddr::V4(Ipv4Addr::new(209, 222, 18, 218)),
            ]
        );
        assert_eq!(
            reply.auth_token.as_deref(),
            Some("AUkQf/b3nj3L+CH4RJPP0Vuq8/gpntr7uPqzjQhncig=")
        );
        assert_eq!(reply.routing_policies, vec![RoutingPolicy::Ipv4]);
    }

    #[test]
    fn test_subnet() {
        let reply = parse("PUSH_REPLY,dhcp-option DNS 8.8.8.8,dhcp-option DNS 4.4.4.4,route-gateway 10.8.0.1,topology subnet,ping 10,ping-restart 120,ifconfig 10.8.0.2 255.255.255.0,peer-id 0");
        assert_eq!(reply.ipv4.address, Ipv4Addr::new(10, 8, 0, 2));
        assert_eq!(reply.ipv4.address_mask, Ipv4Addr::new(255, 255, 255, 0));
        assert_eq!(reply.ipv4.default_gateway, Ipv4Addr::new(10, 8, 0, 1));
        assert_eq!(
            reply.dns_servers,
            vec![
                IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)),
                IpAddr::V4(Ipv4Addr::new(4, 4, 4, 4)),
            ]
        );
        assert_eq!(reply.peer_id, Some(0));
        assert_eq!(reply.keep_alive_timeout_seconds, Some(120));
    }

    #[test]
    fn test_route_with_gateway() {
        let reply = parse("PUSH_REPLY,dhcp-option DNS 8.8.8.8,route-gateway 10.8.0.1,route 192.168.0.0 255.255.255.0 10.8.0.12,topology subnet,ifconfig 10.8.0.2 255.255.255.0,peer-id 0");
        let route = &reply.ipv4.routes[0];
        assert_eq!(route.destination, Ipv4Addr::new(192, 168, 0, 0));
        assert_eq!(route.mask, Ipv4Addr::new(255, 255, 255, 0));
        assert_eq!(route.gateway, Ipv4Addr::new(10, 8, 0, 12));
    }

    #[test]
    fn test_ipv6() {
        let reply = parse("PUSH_REPLY,dhcp-option DNS6 2001:4860:4860::8888,dhcp-option DNS6 2001:4860:4860::8844,tun-ipv6,route-gateway 10.8.0.1,topology subnet,ping 10,ping-restart 120,ifconfig-ipv6 fe80::601:30ff:feb7:ec01/64 fe80::601:30ff:feb7:dc02,ifconfig 10.8.0.2 255.255.255.0,peer-id 0");
        let ipv6 = reply.ipv6.unwrap();
        assert_eq!(
            ipv6.address,
            "fe80::601:30ff:feb7:ec01".parse::<Ipv6Addr>().unwrap()
        );
        assert_eq!(ipv6.address_prefix_length, 64);
        assert_eq!(
            ipv6.default_gateway,
            "fe80::601:30ff:feb7:dc02".parse::<Ipv6Addr>().unwrap()
        );
        assert_eq!(reply.dns_servers.len(), 2);
        assert!(reply.dns_servers.iter().all(IpAddr::is_ipv6));
    }

    #[test]
    fn test_compression_framing() {
        let reply = parse(&format!("{COMMON},comp-lzo no"));
        assert_eq!(reply.compression_framing, Some(CompressionFraming::CompLzo));
        assert!(!reply.uses_compression());

        let reply = parse(&format!("{COMMON},compress"));
        assert_eq!(reply.compression_framing, Some(CompressionFraming::Compress));
        assert!(!reply.uses_compression());

        assert!(PushReply::parse(&format!("{COMMON},compress lz4")).is_err());
    }

    #[test]
    fn test_compression_with_lzo() {
        let lzo = Capabilities { lzo: true };
        let parse = |suffix: &str| {
            PushReply::parse_with(&format!("{COMMON},{suffix}"), lzo)
                .unwrap()
                .unwrap()
        };
        assert!(!parse("comp-lzo no").uses_compression());
        assert!(parse("comp-lzo").uses_compression());
        assert!(parse("comp-lzo yes").uses_compression());
        assert!(!parse("compress").uses_compression());
        let reply = parse("compress lz4");
        assert_eq!(reply.compression_framing, Some(CompressionFraming::Compress));
        assert!(reply.uses_compression());
    }

    #[test]
    fn test_ncp_cipher() {
        let reply = parse("PUSH_REPLY,dhcp-option DNS 8.8.8.8,comp-lzo no,route 10.8.0.1,topology net30,ifconfig 10.8.0.6 10.8.0.5,peer-id 0,cipher AES-256-GCM");
        assert_eq!(reply.cipher, Some(Cipher::Aes256Gcm));

        let reply = parse("PUSH_REPLY,dhcp-option DNS 8.8.8.8,comp-lzo no,route 10.8.0.1,topology net30,ifconfig 10.8.0.18 10.8.0.17,peer-id 3,cipher AES-256-GCM,auth-token");
        assert_eq!(reply.cipher, Some(Cipher::Aes256Gcm));
        assert_eq!(reply.peer_id, Some(3));
        assert_eq!(reply.auth_token, None);
    }

    #[test]
    fn test_ping() {
        let reply = parse("PUSH_REPLY,route 192.168.1.0 255.255.255.0,route 10.0.2.0 255.255.255.0,dhcp-option DNS 192.168.1.99,dhcp-option DNS 176.103.130.130,route 10.0.2.1,topology net30,ping 10,ping-restart 60,ifconfig 10.0.2.14 10.0.2.13");
        assert_eq!(reply.keep_alive_seconds, Some(10));
        assert_eq!(reply.ipv4.routes.len(), 3);
        assert_eq!(reply.ipv4.routes[2].gateway, Ipv4Addr::new(10, 0, 2, 13));
    }

    #[test]
    fn test_malformed() {
        let missing_ifconfig = PushReply::parse("PUSH_REPLY,topology net30,ping 10");
        assert!(matches!(
            missing_ifconfig,
            Err(VpnError::Session(SessionError::MalformedPushReply(_)))
        ));
        let missing_topology = PushReply::parse("PUSH_REPLY,ifconfig 10.8.0.6 10.8.0.5");
        assert!(matches!(
            missing_topology,
            Err(VpnError::Session(SessionError::MalformedPushReply(_)))
        ));
    }

    #[test]
    fn test_subnet_without_gateway_is_malformed_reply() {
        let missing_gateway =
            PushReply::parse("PUSH_REPLY,topology subnet,ifconfig 10.8.0.2 255.255.255.0");
        assert!(matches!(
            missing_gateway,
            Err(VpnError::Session(SessionError::MalformedPushReply(_)))
        ));
        let bad_address = PushReply::parse("PUSH_REPLY,topology net30,ifconfig 10.8.0 10.8.0.5");
        assert!(matches!(
            bad_address,
            Err(VpnError::Session(SessionError::MalformedPushReply(_)))
        ));
        let unsupported = PushReply::parse("PUSH_REPLY,topology net30,ifconfig 10.8.0.6 10.8.0.5,fragment 1300");
        assert!(matches!(
            unsupported,
            Err(VpnError::Options(OptionsError::UnsupportedConfiguration(_)))
        ));
    }
}

//! OpenVPN option parsing
//!
//! Configuration files and `PUSH_REPLY` messages share one line grammar. Each
//! line is tokenized on whitespace and matched against a fixed set of
//! directives; unknown directives are ignored, while a handful that this
//! client cannot honor abort parsing.

use crate::crypto::{Cipher, Digest, KeyDirection, StaticKey, TlsWrap, TlsWrapStrategy};
use crate::error::OptionsError;
use crate::proxy::configuration::{CompressionAlgorithm, CompressionFraming};
use log::{debug, trace};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

pub mod parser;
pub mod push_reply;

pub use parser::{ConfigurationParser, Endpoint, ParsingResult};
pub use push_reply::PushReply;

type Result<T> = std::result::Result<T, OptionsError>;

/// Transport socket type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SocketType {
    Udp,
    Tcp,
}

impl FromStr for SocketType {
    type Err = OptionsError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "udp" | "udp4" | "udp6" => Ok(SocketType::Udp),
            "tcp" | "tcp4" | "tcp6" | "tcp-client" => Ok(SocketType::Tcp),
            other => Err(OptionsError::UnsupportedConfiguration(format!(
                "proto {other}"
            ))),
        }
    }
}

impl fmt::Display for SocketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SocketType::Udp => f.write_str("UDP"),
            SocketType::Tcp => f.write_str("TCP"),
        }
    }
}

/// Optional features compiled into the data path
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    /// LZO (de)compression is available
    pub lzo: bool,
}

/// Meaning of the `ifconfig` arguments
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Topology {
    #[default]
    Net30,
    P2p,
    Subnet,
}

/// One `remote` directive
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Remote {
    pub hostname: String,
    pub port: Option<u16>,
    pub socket_type: Option<SocketType>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ipv4Route {
    pub destination: Ipv4Addr,
    pub mask: Ipv4Addr,
    pub gateway: Ipv4Addr,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ipv4Settings {
    pub address: Ipv4Addr,
    pub address_mask: Ipv4Addr,
    pub default_gateway: Ipv4Addr,
    pub routes: Vec<Ipv4Route>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ipv6Route {
    pub destination: Ipv6Addr,
    pub prefix_length: u8,
    pub gateway: Ipv6Addr,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ipv6Settings {
    pub address: Ipv6Addr,
    pub address_prefix_length: u8,
    pub default_gateway: Ipv6Addr,
    pub routes: Vec<Ipv6Route>,
}

/// Traffic the server wants routed through the tunnel (`redirect-gateway`)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoutingPolicy {
    Ipv4,
    Ipv6,
    BlockLocal,
}

/// An HTTP(S) proxy pushed through `dhcp-option`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxySettings {
    pub address: String,
    pub port: u16,
}

/// Typed result of parsing option lines
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OptionsBundle {
    pub cipher: Option<Cipher>,
    pub digest: Option<Digest>,
    pub compression_framing: Option<CompressionFraming>,
    pub compression_algorithm: Option<CompressionAlgorithm>,
    pub ca: Option<String>,
    pub client_certificate: Option<String>,
    pub client_key: Option<String>,
    pub tls_wrap: Option<TlsWrap>,
    pub keep_alive_seconds: Option<u64>,
    pub keep_alive_timeout_seconds: Option<u64>,
    pub renegotiates_after_seconds: Option<u64>,

    pub socket_type: Option<SocketType>,
    pub port: Option<u16>,
    pub remotes: Vec<Remote>,
    pub checks_eku: bool,
    pub randomize_endpoint: bool,

    pub auth_token: Option<String>,
    pub peer_id: Option<u32>,

    pub topology: Option<Topology>,
    pub ipv4: Option<Ipv4Settings>,
    pub ipv6: Option<Ipv6Settings>,
    pub routing_policies: Vec<RoutingPolicy>,
    pub dns_servers: Vec<IpAddr>,
    pub search_domain: Option<String>,
    pub http_proxy: Option<ProxySettings>,
    pub https_proxy: Option<ProxySettings>,
    pub proxy_bypass_domains: Vec<String>,

    /// Handled lines with private data masked, when requested
    pub stripped_lines: Option<Vec<String>>,
    /// First non-fatal problem found
    pub warning: Option<OptionsError>,
}

impl OptionsBundle {
    /// Parse option lines with the default capabilities
    pub fn parse<S: AsRef<str>>(lines: &[S], returns_stripped: bool) -> Result<Self> {
        Self::parse_with(lines, returns_stripped, Capabilities::default())
    }

    pub fn parse_with<S: AsRef<str>>(
        lines: &[S],
        returns_stripped: bool,
        capabilities: Capabilities,
    ) -> Result<Self> {
        let mut scanner = Scanner::new(capabilities, returns_stripped);
        for line in lines {
            scanner.scan(line.as_ref())?;
        }
        scanner.finish()
    }
}

fn malformed(message: impl Into<String>) -> OptionsError {
    OptionsError::Malformed(message.into())
}

fn unsupported(message: impl Into<String>) -> OptionsError {
    OptionsError::UnsupportedConfiguration(message.into())
}

fn parse_arg<T: FromStr>(directive: &str, args: &[&str], index: usize) -> Result<T> {
    let raw = args
        .get(index)
        .ok_or_else(|| malformed(format!("{directive} takes at least {} argument(s)", index + 1)))?;
    raw.parse()
        .map_err(|_| malformed(format!("{directive}: invalid argument \"{raw}\"")))
}

fn parse_prefixed_ipv6(directive: &str, raw: &str) -> Result<(Ipv6Addr, Option<u8>)> {
    let (address, prefix) = match raw.split_once('/') {
        Some((address, prefix)) => (address, Some(prefix)),
        None => (raw, None),
    };
    let address = address
        .parse()
        .map_err(|_| malformed(format!("{directive}: invalid address \"{raw}\"")))?;
    let prefix = prefix
        .map(|p| {
            p.parse::<u8>()
                .ok()
                .filter(|p| *p <= 128)
                .ok_or_else(|| malformed(format!("{directive}: prefix must be 0-128")))
        })
        .transpose()?;
    Ok((address, prefix))
}

fn is_proxy_directive(directive: &str) -> bool {
    directive.find("-proxy").is_some_and(|i| {
        i > 0
            && directive[..i]
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_')
    })
}

fn unquote(arg: &str) -> &str {
    arg.strip_prefix('"')
        .and_then(|a| a.strip_suffix('"'))
        .unwrap_or(arg)
}

struct Block {
    name: String,
    lines: Vec<String>,
}

/// Line-by-line accumulator behind [`OptionsBundle::parse_with`]
struct Scanner {
    capabilities: Capabilities,
    bundle: OptionsBundle,
    stripped: Option<Vec<String>>,
    block: Option<Block>,
    key_direction: Option<KeyDirection>,
    tls_key: Option<(TlsWrapStrategy, Vec<String>)>,
    ifconfig4: Option<(Ipv4Addr, Ipv4Addr)>,
    ifconfig6: Option<(Ipv6Addr, u8, Ipv6Addr)>,
    route_gateway4: Option<Ipv4Addr>,
    routes4: Vec<(Ipv4Addr, Ipv4Addr, Option<Ipv4Addr>)>,
    routes6: Vec<(Ipv6Addr, u8, Option<Ipv6Addr>)>,
}

impl Scanner {
    fn new(capabilities: Capabilities, returns_stripped: bool) -> Self {
        Self {
            capabilities,
            bundle: OptionsBundle::default(),
            stripped: returns_stripped.then(Vec::new),
            block: None,
            key_direction: None,
            tls_key: None,
            ifconfig4: None,
            ifconfig6: None,
            route_gateway4: None,
            routes4: Vec::new(),
            routes6: Vec::new(),
        }
    }

    fn warn(&mut self, warning: OptionsError) {
        debug!("Options warning: {warning}");
        self.bundle.warning.get_or_insert(warning);
    }

    fn keep(&mut self, line: impl Into<String>) {
        if let Some(stripped) = self.stripped.as_mut() {
            stripped.push(line.into());
        }
    }

    fn scan(&mut self, raw: &str) -> Result<()> {
        let line = raw.trim();
        trace!("Options: {line}");

        if let Some(block) = self.block.as_mut() {
            if line.strip_prefix("</").and_then(|l| l.strip_suffix('>')) == Some(block.name.as_str()) {
                if let Some(block) = self.block.take() {
                    self.close_block(block)?;
                }
                self.keep(line);
            } else {
                block.lines.push(line.to_string());
            }
            return Ok(());
        }

        if let Some(tag) = line.strip_prefix('<').and_then(|l| l.strip_suffix('>')) {
            if tag == "connection" {
                return Err(unsupported("<connection> blocks"));
            }
            if !tag.starts_with('/') {
                self.block = Some(Block {
                    name: tag.to_string(),
                    lines: Vec::new(),
                });
                self.keep(line);
            }
            return Ok(());
        }

        let mut tokens = line.split_whitespace();
        let Some(directive) = tokens.next() else {
            return Ok(());
        };
        let args: Vec<&str> = tokens.map(unquote).collect();

        if directive == "fragment" {
            return Err(unsupported("fragment"));
        }
        if is_proxy_directive(directive) {
            return Err(unsupported(format!("proxy: \"{line}\"")));
        }
        if matches!(directive, "ca" | "cert" | "key" | "tls-auth" | "tls-crypt") && !args.is_empty()
        {
            return Err(unsupported(format!("external file: \"{line}\"")));
        }

        if self.directive(directive, &args)? {
            if directive == "remote" {
                let rest = args.get(1..).unwrap_or_default().join(" ");
                self.keep(format!("remote <hostname> {rest}").trim_end().to_string());
            } else {
                self.keep(line);
            }
        } else {
            trace!("Options: ignored \"{directive}\"");
        }
        Ok(())
    }

    fn close_block(&mut self, block: Block) -> Result<()> {
        let pem = || block.lines.join("\n");
        match block.name.as_str() {
            "ca" => self.bundle.ca = Some(pem()),
            "cert" => self.bundle.client_certificate = Some(pem()),
            "key" => self.bundle.client_key = Some(pem()),
            "tls-auth" => self.tls_key = Some((TlsWrapStrategy::Auth, block.lines)),
            "tls-crypt" => self.tls_key = Some((TlsWrapStrategy::Crypt, block.lines)),
            other => debug!("Options: ignored <{other}> block"),
        }
        Ok(())
    }

    /// Apply one directive, returning whether it was recognized
    fn directive(&mut self, directive: &str, args: &[&str]) -> Result<bool> {
        let first = args.first().copied();
        match directive {
            "cipher" => {
                if let Some(raw) = first {
                    let cipher = raw
                        .parse::<Cipher>()
                        .map_err(|_| unsupported(format!("cipher {raw}")))?;
                    self.bundle.cipher = Some(cipher);
                }
            }
            "auth" => {
                if let Some(raw) = first {
                    let digest = raw
                        .parse::<Digest>()
                        .map_err(|_| unsupported(format!("auth {raw}")))?;
                    self.bundle.digest = Some(digest);
                }
            }
            "comp-lzo" => self.comp_lzo(first)?,
            "compress" => self.compress(first)?,
            "key-direction" => {
                let value: u8 = parse_arg(directive, args, 0)?;
                self.key_direction = Some(KeyDirection::try_from(value)?);
            }
            "ping" => self.bundle.keep_alive_seconds = Some(parse_arg(directive, args, 0)?),
            "ping-restart" => {
                self.bundle.keep_alive_timeout_seconds = Some(parse_arg(directive, args, 0)?)
            }
            "reneg-sec" => {
                self.bundle.renegotiates_after_seconds = Some(parse_arg(directive, args, 0)?)
            }
            "proto" => self.bundle.socket_type = Some(parse_arg(directive, args, 0).map_err(
                |_| unsupported(format!("proto {}", first.unwrap_or_default())),
            )?),
            "port" => self.bundle.port = Some(parse_arg(directive, args, 0)?),
            "remote" => {
                let Some(hostname) = first else {
                    return Ok(false);
                };
                let port = match args.get(1) {
                    Some(_) => Some(parse_arg(directive, args, 1)?),
                    None => None,
                };
                let socket_type = match args.get(2) {
                    Some(raw) => Some(raw.parse::<SocketType>()?),
                    None => None,
                };
                self.bundle.remotes.push(Remote {
                    hostname: hostname.to_string(),
                    port,
                    socket_type,
                });
            }
            "remote-cert-tls" => {
                if first != Some("server") {
                    return Ok(false);
                }
                self.bundle.checks_eku = true;
            }
            "remote-random" => self.bundle.randomize_endpoint = true,
            "auth-token" => {
                let Some(token) = first else {
                    return Ok(false);
                };
                self.bundle.auth_token = Some(token.to_string());
            }
            "peer-id" => self.bundle.peer_id = Some(parse_arg(directive, args, 0)?),
            "topology" => {
                self.bundle.topology = Some(match first {
                    Some("net30") => Topology::Net30,
                    Some("p2p") => Topology::P2p,
                    Some("subnet") => Topology::Subnet,
                    other => {
                        return Err(unsupported(format!(
                            "topology {}",
                            other.unwrap_or_default()
                        )))
                    }
                });
            }
            "ifconfig" => {
                if args.len() != 2 {
                    return Err(malformed("ifconfig takes 2 arguments"));
                }
                self.ifconfig4 = Some((parse_arg(directive, args, 0)?, parse_arg(directive, args, 1)?));
            }
            "ifconfig-ipv6" => {
                if args.len() != 2 {
                    return Err(malformed("ifconfig-ipv6 takes 2 arguments"));
                }
                let (address, prefix) = parse_prefixed_ipv6(directive, args[0])?;
                let prefix =
                    prefix.ok_or_else(|| malformed("ifconfig-ipv6 address must have a /prefix"))?;
                self.ifconfig6 = Some((address, prefix, parse_arg(directive, args, 1)?));
            }
            "route" => {
                let Some(Ok(destination)) = first.map(str::parse::<Ipv4Addr>) else {
                    return Ok(false);
                };
                let mask = args
                    .get(1)
                    .and_then(|m| m.parse().ok())
                    .unwrap_or(Ipv4Addr::BROADCAST);
                let gateway = args.get(2).and_then(|g| g.parse().ok());
                self.routes4.push((destination, mask, gateway));
            }
            "route-ipv6" => {
                let Some(raw) = first else {
                    return Ok(false);
                };
                let (destination, prefix) = parse_prefixed_ipv6(directive, raw)?;
                let gateway = args.get(1).and_then(|g| g.parse().ok());
                self.routes6.push((destination, prefix.unwrap_or(128), gateway));
            }
            "route-gateway" => self.route_gateway4 = Some(parse_arg(directive, args, 0)?),
            "redirect-gateway" => {
                let mut policies = Vec::new();
                if !args.contains(&"!ipv4") {
                    policies.push(RoutingPolicy::Ipv4);
                }
                if args.contains(&"ipv6") {
                    policies.push(RoutingPolicy::Ipv6);
                }
                if args.contains(&"block-local") {
                    policies.push(RoutingPolicy::BlockLocal);
                }
                self.bundle.routing_policies = policies;
            }
            "dhcp-option" => return self.dhcp_option(args),
            _ if directive.contains("mtu") || directive == "mssfix" => {}
            _ => return Ok(false),
        }
        Ok(true)
    }

    fn comp_lzo(&mut self, arg: Option<&str>) -> Result<()> {
        self.bundle.compression_framing = Some(CompressionFraming::CompLzo);
        if self.capabilities.lzo {
            self.bundle.compression_algorithm = Some(if arg == Some("no") {
                CompressionAlgorithm::Disabled
            } else {
                CompressionAlgorithm::Lzo
            });
            return Ok(());
        }
        match arg {
            None => self.warn(unsupported("comp-lzo (LZO is not available)")),
            Some("no") => {
                self.bundle.compression_algorithm = Some(CompressionAlgorithm::Disabled)
            }
            Some(other) => return Err(unsupported(format!("comp-lzo {other}"))),
        }
        Ok(())
    }

    fn compress(&mut self, arg: Option<&str>) -> Result<()> {
        self.bundle.compression_framing = Some(CompressionFraming::Compress);
        let algorithm = match (arg, self.capabilities.lzo) {
            (None, _) => CompressionAlgorithm::Disabled,
            (Some("lzo"), true) => CompressionAlgorithm::Lzo,
            (Some(_), true) => CompressionAlgorithm::Other,
            (Some(other), false) => return Err(unsupported(format!("compress {other}"))),
        };
        self.bundle.compression_algorithm = Some(algorithm);
        Ok(())
    }

    fn dhcp_option(&mut self, args: &[&str]) -> Result<bool> {
        let Some(kind) = args.first() else {
            return Ok(false);
        };
        match *kind {
            "DNS" | "DNS6" => {
                let address: IpAddr = parse_arg("dhcp-option DNS", args, 1)?;
                self.bundle.dns_servers.push(address);
            }
            "DOMAIN" | "DOMAIN-SEARCH" => {
                let domain: String = parse_arg("dhcp-option DOMAIN", args, 1)?;
                self.bundle.search_domain = Some(domain);
            }
            "PROXY_HTTP" | "PROXY_HTTPS" => {
                let proxy = ProxySettings {
                    address: parse_arg("dhcp-option PROXY", args, 1)?,
                    port: parse_arg("dhcp-option PROXY", args, 2)?,
                };
                if *kind == "PROXY_HTTP" {
                    self.bundle.http_proxy = Some(proxy);
                } else {
                    self.bundle.https_proxy = Some(proxy);
                }
            }
            "PROXY_BYPASS" => {
                self.bundle
                    .proxy_bypass_domains
                    .extend(args[1..].iter().map(|d| d.to_string()));
            }
            _ => return Ok(false),
        }
        Ok(true)
    }

    fn finish(mut self) -> Result<OptionsBundle> {
        if let Some(block) = &self.block {
            return Err(malformed(format!("unterminated <{}> block", block.name)));
        }
        if let Some((strategy, lines)) = self.tls_key.take() {
            let key = StaticKey::from_pem_lines(&lines, self.key_direction)?;
            self.bundle.tls_wrap = Some(TlsWrap { strategy, key });
        }

        if let Some((first, second)) = self.ifconfig4 {
            let (address_mask, default_gateway) = match self.bundle.topology.unwrap_or_default() {
                Topology::Subnet => {
                    let gateway = self
                        .route_gateway4
                        .ok_or_else(|| malformed("route-gateway is required with topology subnet"))?;
                    (second, gateway)
                }
                Topology::Net30 | Topology::P2p => (Ipv4Addr::BROADCAST, second),
            };
            let routes = self
                .routes4
                .iter()
                .map(|(destination, mask, gateway)| Ipv4Route {
                    destination: *destination,
                    mask: *mask,
                    gateway: gateway.unwrap_or(default_gateway),
                })
                .collect();
            self.bundle.ipv4 = Some(Ipv4Settings {
                address: first,
                address_mask,
                default_gateway,
                routes,
            });
        }

        if let Some((address, address_prefix_length, default_gateway)) = self.ifconfig6 {
            let routes = self
                .routes6
                .iter()
                .map(|(destination, prefix_length, gateway)| Ipv6Route {
                    destination: *destination,
                    prefix_length: *prefix_length,
                    gateway: gateway.unwrap_or(default_gateway),
                })
                .collect();
            self.bundle.ipv6 = Some(Ipv6Settings {
                address,
                address_prefix_length,
                default_gateway,
                routes,
            });
        }

        self.bundle.stripped_lines = self.stripped;
        Ok(self.bundle)
    }
}

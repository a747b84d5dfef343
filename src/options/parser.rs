//! `.ovpn` profile loading

use super::{OptionsBundle, SocketType};
use crate::error::{OptionsError, Result};
use crate::protocol::constants::DEFAULT_PORT;
use crate::protocol::seconds;
use crate::proxy::configuration::{CompressionAlgorithm, CompressionFraming, SessionConfiguration};
use log::{debug, warn};
use std::fs;
use std::path::Path;

/// A remote address and transport to try
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub hostname: String,
    pub port: u16,
    pub socket_type: SocketType,
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}/{}", self.hostname, self.port, self.socket_type)
    }
}

/// Outcome of loading a profile
#[derive(Debug, Clone)]
pub struct ParsingResult {
    /// Hostname of the first `remote`
    pub hostname: String,
    /// Ports and transports announced for `hostname`
    pub endpoints: Vec<Endpoint>,
    pub configuration: SessionConfiguration,
    pub stripped_lines: Option<Vec<String>>,
    pub warning: Option<OptionsError>,
}

/// Turns a client profile into a [`SessionConfiguration`]
pub struct ConfigurationParser;

impl ConfigurationParser {
    pub fn parse_file<P: AsRef<Path>>(path: P, returns_stripped: bool) -> Result<ParsingResult> {
        let path = path.as_ref();
        debug!("Loading profile {}", path.display());
        let content = fs::read_to_string(path)?;
        Ok(Self::parse_str(&content, returns_stripped)?)
    }

    pub fn parse_str(
        content: &str,
        returns_stripped: bool,
    ) -> std::result::Result<ParsingResult, OptionsError> {
        let lines: Vec<&str> = content
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty() && !l.starts_with('#') && !l.starts_with(';'))
            .collect();
        Self::parse_lines(&lines, returns_stripped)
    }

    pub fn parse_lines<S: AsRef<str>>(
        lines: &[S],
        returns_stripped: bool,
    ) -> std::result::Result<ParsingResult, OptionsError> {
        let bundle = OptionsBundle::parse(lines, returns_stripped)?;
        if let Some(warning) = &bundle.warning {
            warn!("Profile warning: {warning}");
        }

        let ca = bundle
            .ca
            .clone()
            .ok_or_else(|| OptionsError::MissingConfiguration("ca".into()))?;
        let first = bundle
            .remotes
            .first()
            .ok_or_else(|| OptionsError::MissingConfiguration("remote".into()))?;
        let hostname = first.hostname.clone();

        let default_port = bundle.port.unwrap_or(DEFAULT_PORT);
        let default_socket_type = bundle.socket_type.unwrap_or(SocketType::Udp);
        let mut endpoints: Vec<Endpoint> = Vec::new();
        for remote in bundle.remotes.iter().filter(|r| r.hostname == hostname) {
            let endpoint = Endpoint {
                hostname: hostname.clone(),
                port: remote.port.unwrap_or(default_port),
                socket_type: remote.socket_type.unwrap_or(default_socket_type),
            };
            if !endpoints.contains(&endpoint) {
                endpoints.push(endpoint);
            }
        }

        let mut builder = SessionConfiguration::builder(ca)
            .tls_wrap(bundle.tls_wrap.clone())
            .compression(
                bundle.compression_framing.unwrap_or(CompressionFraming::Disabled),
                bundle
                    .compression_algorithm
                    .unwrap_or(CompressionAlgorithm::Disabled),
            )
            .keep_alive_interval(bundle.keep_alive_seconds.and_then(seconds))
            .keep_alive_timeout(bundle.keep_alive_timeout_seconds.and_then(seconds))
            .renegotiates_after(bundle.renegotiates_after_seconds.and_then(seconds))
            .checks_eku(bundle.checks_eku)
            .randomize_endpoint(bundle.randomize_endpoint);
        if let Some(cipher) = bundle.cipher {
            builder = builder.cipher(cipher);
        }
        if let Some(digest) = bundle.digest {
            builder = builder.digest(digest);
        }

        match (&bundle.client_certificate, &bundle.client_key) {
            (Some(certificate), Some(key)) => {
                if key.contains("ENCRYPTED") {
                    return Err(OptionsError::UnsupportedConfiguration(
                        "encrypted client key".into(),
                    ));
                }
                builder = builder.client_identity(certificate.clone(), key.clone());
            }
            (None, None) => {}
            _ => {
                return Err(OptionsError::MissingConfiguration(
                    "cert and key must be provided together".into(),
                ))
            }
        }

        Ok(ParsingResult {
            hostname,
            endpoints,
            configuration: builder.build()?,
            stripped_lines: bundle.stripped_lines,
            warning: bundle.warning,
        })
    }
}

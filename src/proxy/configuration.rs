//! Negotiation parameters of a session

use crate::crypto::TlsWrap;
use crate::error::OptionsError;
use std::fmt;
use std::time::Duration;

pub use crate::crypto::{Cipher, Digest};

/// Byte-level envelope around data channel payloads
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompressionFraming {
    #[default]
    Disabled,
    /// Legacy `comp-lzo` framing
    CompLzo,
    /// `compress` framing
    Compress,
}

impl CompressionFraming {
    pub fn is_enabled(&self) -> bool {
        !matches!(self, CompressionFraming::Disabled)
    }
}

/// Algorithm announced inside the compression framing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompressionAlgorithm {
    #[default]
    Disabled,
    Lzo,
    Other,
}

/// Username and password sent during authentication
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Immutable parameters of a session, see [`SessionConfigurationBuilder`]
#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfiguration {
    pub ca: String,
    pub client_certificate: Option<String>,
    pub client_key: Option<String>,
    pub cipher: Cipher,
    pub digest: Digest,
    pub compression_framing: CompressionFraming,
    pub compression_algorithm: CompressionAlgorithm,
    pub tls_wrap: Option<TlsWrap>,
    pub keep_alive_interval: Option<Duration>,
    pub keep_alive_timeout: Option<Duration>,
    pub renegotiates_after: Option<Duration>,
    pub checks_eku: bool,
    pub randomize_endpoint: bool,
}

impl SessionConfiguration {
    pub fn builder(ca: impl Into<String>) -> SessionConfigurationBuilder {
        SessionConfigurationBuilder::new(ca)
    }
}

/// Builder for [`SessionConfiguration`]
#[derive(Debug, Clone)]
pub struct SessionConfigurationBuilder {
    ca: String,
    client_certificate: Option<String>,
    client_key: Option<String>,
    cipher: Cipher,
    digest: Digest,
    compression_framing: CompressionFraming,
    compression_algorithm: CompressionAlgorithm,
    tls_wrap: Option<TlsWrap>,
    keep_alive_interval: Option<Duration>,
    keep_alive_timeout: Option<Duration>,
    renegotiates_after: Option<Duration>,
    checks_eku: bool,
    randomize_endpoint: bool,
}

impl SessionConfigurationBuilder {
    pub fn new(ca: impl Into<String>) -> Self {
        Self {
            ca: ca.into(),
            client_certificate: None,
            client_key: None,
            cipher: Cipher::Aes128Cbc,
            digest: Digest::Sha1,
            compression_framing: CompressionFraming::Disabled,
            compression_algorithm: CompressionAlgorithm::Disabled,
            tls_wrap: None,
            keep_alive_interval: None,
            keep_alive_timeout: None,
            renegotiates_after: None,
            checks_eku: false,
            randomize_endpoint: false,
        }
    }

    pub fn client_identity(mut self, certificate: String, key: String) -> Self {
        self.client_certificate = Some(certificate);
        self.client_key = Some(key);
        self
    }

    pub fn cipher(mut self, cipher: Cipher) -> Self {
        self.cipher = cipher;
        self
    }

    pub fn digest(mut self, digest: Digest) -> Self {
        self.digest = digest;
        self
    }

    pub fn compression(mut self, framing: CompressionFraming, algorithm: CompressionAlgorithm) -> Self {
        self.compression_framing = framing;
        self.compression_algorithm = algorithm;
        self
    }

    pub fn tls_wrap(mut self, tls_wrap: Option<TlsWrap>) -> Self {
        self.tls_wrap = tls_wrap;
        self
    }

    pub fn keep_alive_interval(mut self, interval: Option<Duration>) -> Self {
        self.keep_alive_interval = interval;
        self
    }

    pub fn keep_alive_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.keep_alive_timeout = timeout;
        self
    }

    pub fn renegotiates_after(mut self, interval: Option<Duration>) -> Self {
        self.renegotiates_after = interval;
        self
    }

    pub fn checks_eku(mut self, checks_eku: bool) -> Self {
        self.checks_eku = checks_eku;
        self
    }

    pub fn randomize_endpoint(mut self, randomize: bool) -> Self {
        self.randomize_endpoint = randomize;
        self
    }

    pub fn build(self) -> Result<SessionConfiguration, OptionsError> {
        if self.ca.trim().is_empty() {
            return Err(OptionsError::MissingConfiguration("ca".into()));
        }
        if self.client_certificate.is_some() != self.client_key.is_some() {
            return Err(OptionsError::MissingConfiguration(
                "cert and key must be provided together".into(),
            ));
        }
        if self.compression_algorithm != CompressionAlgorithm::Disabled {
            return Err(OptionsError::UnsupportedConfiguration(
                "compression algorithms are not supported".into(),
            ));
        }
        Ok(SessionConfiguration {
            ca: self.ca,
            client_certificate: self.client_certificate,
            client_key: self.client_key,
            cipher: self.cipher,
            digest: self.digest,
            compression_framing: self.compression_framing,
            compression_algorithm: self.compression_algorithm,
            tls_wrap: self.tls_wrap,
            keep_alive_interval: self.keep_alive_interval,
            keep_alive_timeout: self.keep_alive_timeout,
            renegotiates_after: self.renegotiates_after,
            checks_eku: self.checks_eku,
            randomize_endpoint: self.randomize_endpoint,
        })
    }
}

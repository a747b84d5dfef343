//! Error types and handling for the OpenVPN client engine
//!
//! Configuration problems surface synchronously from the parsers as
//! [`OptionsError`]. Failures detected while a session is live are reported
//! to the owner as [`SessionError`] or [`DataPathError`], wrapped in
//! [`VpnError`].

use thiserror::Error;

/// Main error type for VPN operations
#[derive(Error, Debug)]
pub enum VpnError {
    /// Client profile errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Errors raised while parsing OpenVPN options
    #[error(transparent)]
    Options(#[from] OptionsError),

    /// Errors raised by the session state machine
    #[error(transparent)]
    Session(#[from] SessionError),

    /// Errors raised by the data channel
    #[error(transparent)]
    DataPath(#[from] DataPathError),

    /// Malformed wire data
    #[error("Framing error: {0}")]
    Framing(String),

    /// Cryptographic errors
    #[error("Cryptographic error: {0}")]
    Crypto(String),

    /// TLS errors
    #[error("TLS error: {0}")]
    Tls(String),

    /// Network connectivity errors
    #[error("Network error: {0}")]
    Network(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors produced while parsing configuration text or a server push
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OptionsError {
    /// A recognized directive has unusable arguments
    #[error("Malformed option: {0}")]
    Malformed(String),

    /// A mandatory directive is missing
    #[error("Missing configuration: {0}")]
    MissingConfiguration(String),

    /// A directive that this client refuses to honor
    #[error("Unsupported configuration: {0}")]
    UnsupportedConfiguration(String),
}

/// Errors that terminate or restart a live session
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("Negotiation timed out")]
    NegotiationTimeout,

    #[error("Peer verification failed")]
    PeerVerification,

    #[error("Missing session id")]
    MissingSessionId,

    #[error("Session id mismatch")]
    SessionMismatch,

    #[error("Data received for unknown key")]
    BadKey,

    #[error("TLS handshake failed: {0}")]
    Tls(String),

    #[error("Control data has wrong prefix")]
    WrongControlDataPrefix,

    #[error("Authentication failed: bad credentials")]
    BadCredentials,

    #[error("Malformed PUSH_REPLY: {0}")]
    MalformedPushReply(String),

    #[error("Link write failed")]
    FailedLinkWrite,

    #[error("Ping timed out")]
    PingTimeout,

    /// The server asked the client to restart
    #[error("Server requested restart")]
    ServerRestart,
}

/// Errors raised while encrypting or decrypting tunnel packets
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DataPathError {
    /// The outbound packet id is about to wrap
    #[error("Data path packet id overflow")]
    Overflow,

    #[error("Peer id mismatch: {0:#08x}")]
    PeerIdMismatch(u32),

    #[error("Malformed data packet: {0}")]
    Malformed(String),

    /// HMAC or AEAD tag did not verify
    #[error("Data packet failed integrity check")]
    Integrity,

    #[error("Data path crypto error: {0}")]
    Crypto(String),
}

/// Result type alias for VPN operations
pub type Result<T> = std::result::Result<T, VpnError>;

/// Helper trait for converting errors to VpnError
pub trait IntoVpnError<T> {
    fn into_vpn_error(self, context: &str) -> Result<T>;
}

impl<T, E> IntoVpnError<T> for std::result::Result<T, E>
where
    E: std::fmt::Display,
{
    fn into_vpn_error(self, context: &str) -> Result<T> {
        self.map_err(|e| VpnError::Network(format!("{context}: {e}")))
    }
}

impl From<toml::de::Error> for VpnError {
    fn from(err: toml::de::Error) -> Self {
        VpnError::Config(format!("TOML parsing error: {err}"))
    }
}

impl From<rustls::Error> for VpnError {
    fn from(err: rustls::Error) -> Self {
        match err {
            rustls::Error::InvalidCertificate(_) => SessionError::PeerVerification.into(),
            other => SessionError::Tls(other.to_string()).into(),
        }
    }
}

impl VpnError {
    /// The live-session cause, if any
    pub fn session_error(&self) -> Option<&SessionError> {
        match self {
            VpnError::Session(e) => Some(e),
            _ => None,
        }
    }
}

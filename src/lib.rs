//! rovpn - OpenVPN client protocol engine
//!
//! The core of the crate is [`SessionProxy`], a sans-IO state machine for
//! one OpenVPN client session: control channel reliability, the TLS
//! handshake, key method 2 authentication, PUSH_REPLY handling, key
//! renegotiation and the encrypted data channel.
//!
//! ## Layers
//! - [`options`]: `.ovpn` profile parsing and PUSH_REPLY decoding
//! - [`protocol`]: packet codecs, the reliable control channel and key slots
//! - [`crypto`]: TLS engine seam, data channel ciphers and static keys
//! - [`proxy`]: the session state machine
//! - [`tunnel`]: link and tunnel traits, TCP stream framing and tokio sockets
//! - `client`: a tokio runner and reconnecting client (feature `tokio-runtime`)
//!
//! The proxy performs no I/O and reads no clock, so embedders can drive it
//! from any event loop by calling [`SessionProxy::receive_link`],
//! [`SessionProxy::receive_tunnel`] and [`SessionProxy::tick`].

#[cfg(feature = "tokio-runtime")]
pub mod client;
pub mod config;
pub mod crypto;
pub mod error;
pub mod options;
pub mod protocol;
pub mod proxy;
pub mod tunnel;

pub use config::ClientProfile;
pub use error::{Result, VpnError};
pub use proxy::{SessionConfiguration, SessionEvent, SessionProxy, StopAction};

#[cfg(feature = "tokio-runtime")]
pub use client::{ConnectionStatus, VpnClient};

/// Library version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const NAME: &str = env!("CARGO_PKG_NAME");

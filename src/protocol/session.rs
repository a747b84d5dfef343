//! Key negotiation slots

use super::constants::NEGOTIATION_TIMEOUT;
use crate::crypto::tls::TlsEngine;
use crate::crypto::DataPath;
use crate::error::{DataPathError, Result, SessionError};
use bytes::Bytes;
use std::fmt;
use std::time::{Duration, Instant};

/// Negotiation progress of one key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyState {
    /// Waiting for the server's hard reset
    HardReset,
    /// Waiting for the server's soft reset
    SoftReset,
    /// TLS handshake in progress
    Tls,
    /// Waiting for the server's key method reply
    PreAuth,
    /// Waiting for `PUSH_REPLY`
    PreIfConfig,
    Connected,
}

/// One of the eight key slots of a session
pub struct SessionKey {
    id: u8,
    state: KeyState,
    soft_reset: bool,
    started_at: Instant,
    tls: Option<Box<dyn TlsEngine>>,
    data_path: Option<DataPath>,
}

impl fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionKey")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("soft_reset", &self.soft_reset)
            .field("has_data_path", &self.data_path.is_some())
            .finish()
    }
}

impl SessionKey {
    pub fn new(id: u8, soft_reset: bool, now: Instant) -> Self {
        Self {
            id,
            state: if soft_reset {
                KeyState::SoftReset
            } else {
                KeyState::HardReset
            },
            soft_reset,
            started_at: now,
            tls: None,
            data_path: None,
        }
    }

    pub fn id(&self) -> u8 {
        self.id
    }

    pub fn state(&self) -> KeyState {
        self.state
    }

    pub fn set_state(&mut self, state: KeyState) {
        self.state = state;
    }

    pub fn is_soft_reset(&self) -> bool {
        self.soft_reset
    }

    pub fn is_connected(&self) -> bool {
        self.state == KeyState::Connected
    }

    /// Time since negotiation began
    pub fn elapsed(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.started_at)
    }

    /// The server never answered the hard reset
    pub fn did_hard_reset_time_out(&self, timeout: Duration, now: Instant) -> bool {
        self.state == KeyState::HardReset && self.elapsed(now) > timeout
    }

    /// The key failed to connect in time
    pub fn did_negotiation_time_out(&self, now: Instant) -> bool {
        !self.is_connected() && self.elapsed(now) > NEGOTIATION_TIMEOUT
    }

    pub fn set_tls(&mut self, tls: Box<dyn TlsEngine>) {
        self.tls = Some(tls);
    }

    pub fn tls(&mut self) -> Result<&mut dyn TlsEngine> {
        match self.tls.as_deref_mut() {
            Some(tls) => Ok(tls),
            None => Err(SessionError::Tls("no TLS engine for this key".into()).into()),
        }
    }

    /// The handshake just finished and authentication has not started
    pub fn should_on_tls_connect(&self) -> bool {
        self.state == KeyState::Tls && self.tls.as_ref().is_some_and(|tls| tls.is_connected())
    }

    pub fn set_data_path(&mut self, data_path: DataPath) {
        self.data_path = Some(data_path);
    }

    pub fn data_path(&self) -> Option<&DataPath> {
        self.data_path.as_ref()
    }

    pub fn data_path_mut(&mut self) -> Option<&mut DataPath> {
        self.data_path.as_mut()
    }

    /// Encrypt with this key; `Ok(false)` if the key has no data path yet
    pub fn encrypt(
        &mut self,
        packets: &[Bytes],
        out: &mut Vec<Bytes>,
    ) -> std::result::Result<bool, DataPathError> {
        match self.data_path.as_mut() {
            Some(data_path) => data_path.encrypt_packets(packets, out).map(|_| true),
            None => Ok(false),
        }
    }

    /// Decrypt with this key; `Ok(false)` if the key has no data path yet
    pub fn decrypt(
        &mut self,
        packets: &[Bytes],
        out: &mut Vec<Bytes>,
    ) -> std::result::Result<bool, DataPathError> {
        match self.data_path.as_mut() {
            Some(data_path) => data_path.decrypt_packets(packets, out).map(|_| true),
            None => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::constants::HARD_RESET_TIMEOUT;

    #[test]
    fn test_initial_state() {
        let now = Instant::now();
        let hard = SessionKey::new(0, false, now);
        assert_eq!(hard.state(), KeyState::HardReset);
        assert!(!hard.is_soft_reset());

        let soft = SessionKey::new(1, true, now);
        assert_eq!(soft.state(), KeyState::SoftReset);
        assert_eq!(soft.id(), 1);
    }

    #[test]
    fn test_timeouts() {
        let start = Instant::now();
        let mut key = SessionKey::new(0, false, start);

        let later = start + HARD_RESET_TIMEOUT + Duration::from_millis(1);
        assert!(!key.did_hard_reset_time_out(HARD_RESET_TIMEOUT, start));
        assert!(key.did_hard_reset_time_out(HARD_RESET_TIMEOUT, later));
        assert!(!key.did_negotiation_time_out(later));

        key.set_state(KeyState::Tls);
        assert!(!key.did_hard_reset_time_out(HARD_RESET_TIMEOUT, later));

        let much_later = start + NEGOTIATION_TIMEOUT + Duration::from_secs(1);
        assert!(key.did_negotiation_time_out(much_later));
        key.set_state(KeyState::Connected);
        assert!(!key.did_negotiation_time_out(much_later));
    }

    #[test]
    fn test_missing_engines() {
        let mut key = SessionKey::new(0, false, Instant::now());
        assert!(key.tls().is_err());
        assert!(!key.should_on_tls_connect());

        let mut out = Vec::new();
        assert!(!key.encrypt(&[Bytes::from_static(b"x")], &mut out).unwrap());
        assert!(!key.decrypt(&[Bytes::from_static(b"x")], &mut out).unwrap());
        assert!(out.is_empty());
    }
}

//! OpenVPN static keys, as used by tls-auth and tls-crypt

use super::KEY_SLOT_LENGTH;
use crate::error::OptionsError;
use std::fmt;

/// `key-direction` of a static key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyDirection {
    Server = 0,
    Client = 1,
}

impl TryFrom<u8> for KeyDirection {
    type Error = OptionsError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(KeyDirection::Server),
            1 => Ok(KeyDirection::Client),
            _ => Err(OptionsError::Malformed(format!("key-direction {value}"))),
        }
    }
}

/// A 2048-bit pre-shared key split into four 64-byte slots
#[derive(Clone, PartialEq, Eq)]
pub struct StaticKey {
    data: Vec<u8>,
    direction: Option<KeyDirection>,
}

impl fmt::Debug for StaticKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StaticKey")
            .field("direction", &self.direction)
            .finish_non_exhaustive()
    }
}

const BEGIN_MARKER: &str = "-----BEGIN OpenVPN Static key V1-----";
const END_MARKER: &str = "-----END OpenVPN Static key V1-----";

impl StaticKey {
    pub const LENGTH: usize = 4 * KEY_SLOT_LENGTH;

    pub fn new(data: Vec<u8>, direction: Option<KeyDirection>) -> Result<Self, OptionsError> {
        if data.len() != Self::LENGTH {
            return Err(OptionsError::Malformed(format!(
                "static key must be {} bytes, got {}",
                Self::LENGTH,
                data.len()
            )));
        }
        Ok(Self { data, direction })
    }

    /// Parse the hex body of an inline static key block
    pub fn from_pem_lines<S: AsRef<str>>(
        lines: &[S],
        direction: Option<KeyDirection>,
    ) -> Result<Self, OptionsError> {
        let hex_body: String = lines
            .iter()
            .map(|l| l.as_ref().trim())
            .filter(|l| !l.is_empty() && !l.starts_with("-----") && !l.starts_with('#'))
            .collect();
        let data = hex::decode(&hex_body)
            .map_err(|e| OptionsError::Malformed(format!("static key: {e}")))?;
        Self::new(data, direction)
    }

    /// Render back to the inline block format
    pub fn to_pem(&self) -> String {
        let mut out = String::from(BEGIN_MARKER);
        out.push('\n');
        for chunk in self.data.chunks(16) {
            out.push_str(&hex::encode(chunk));
            out.push('\n');
        }
        out.push_str(END_MARKER);
        out
    }

    pub fn direction(&self) -> Option<KeyDirection> {
        self.direction
    }

    pub fn with_direction(&self, direction: Option<KeyDirection>) -> Self {
        Self {
            data: self.data.clone(),
            direction,
        }
    }

    fn slot(&self, index: usize) -> &[u8] {
        &self.data[index * KEY_SLOT_LENGTH..(index + 1) * KEY_SLOT_LENGTH]
    }

    pub fn cipher_encrypt_key(&self) -> &[u8] {
        match self.direction {
            None | Some(KeyDirection::Server) => self.slot(0),
            Some(KeyDirection::Client) => self.slot(2),
        }
    }

    pub fn cipher_decrypt_key(&self) -> &[u8] {
        match self.direction {
            None | Some(KeyDirection::Client) => self.slot(0),
            Some(KeyDirection::Server) => self.slot(2),
        }
    }

    pub fn hmac_send_key(&self) -> &[u8] {
        match self.direction {
            None | Some(KeyDirection::Server) => self.slot(1),
            Some(KeyDirection::Client) => self.slot(3),
        }
    }

    pub fn hmac_receive_key(&self) -> &[u8] {
        match self.direction {
            None | Some(KeyDirection::Client) => self.slot(1),
            Some(KeyDirection::Server) => self.slot(3),
        }
    }
}

/// How control packets are wrapped with a static key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsWrapStrategy {
    /// HMAC authentication (`tls-auth`)
    Auth,
    /// Authentication and encryption (`tls-crypt`)
    Crypt,
}

/// Static key protection of the control channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsWrap {
    pub strategy: TlsWrapStrategy,
    pub key: StaticKey,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_key(direction: Option<KeyDirection>) -> StaticKey {
        StaticKey::new((0..=255).collect(), direction).unwrap()
    }

    #[test]
    fn test_pem_round_trip() {
        let key = sample_key(Some(KeyDirection::Client));
        let pem = key.to_pem();
        let lines: Vec<&str> = pem.lines().collect();
        assert_eq!(lines.len(), 18);
        assert_eq!(lines[0], BEGIN_MARKER);

        let parsed = StaticKey::from_pem_lines(&lines, Some(KeyDirection::Client)).unwrap();
        assert_eq!(parsed, key);
    }

    #[test]
    fn test_rejects_short_or_invalid_keys() {
        assert!(StaticKey::from_pem_lines(&["abcd"], None).is_err());
        assert!(StaticKey::from_pem_lines(&["zz"], None).is_err());
        assert!(KeyDirection::try_from(2).is_err());
    }

    #[test]
    fn test_directional_slots() {
        let client = sample_key(Some(KeyDirection::Client));
        let server = sample_key(Some(KeyDirection::Server));

        // What one side sends, the other receives
        assert_eq!(client.hmac_send_key(), server.hmac_receive_key());
        assert_eq!(client.cipher_encrypt_key(), server.cipher_decrypt_key());
        assert_eq!(client.hmac_send_key()[0], 192);
        assert_eq!(client.cipher_encrypt_key()[0], 128);

        let bidi = sample_key(None);
        assert_eq!(bidi.hmac_send_key(), bidi.hmac_receive_key());
        assert_eq!(bidi.hmac_send_key()[0], 64);
    }
}

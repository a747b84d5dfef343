//! Key method 2 authentication carried inside the TLS tunnel

use crate::crypto::{prf, CryptoEngine, DataChannelKeys, KEY_SLOT_LENGTH};
use crate::error::{Result, SessionError, VpnError};
use crate::protocol::SessionId;
use crate::proxy::configuration::{Cipher, CompressionFraming, Credentials};
use bytes::{Buf, BufMut, BytesMut};
use log::debug;

const PRE_MASTER_LENGTH: usize = 48;
const RANDOM_LENGTH: usize = 32;

/// Plaintext prefix of both the client and server key method 2 messages
const KEY_METHOD_PREFIX: [u8; 5] = [0x00, 0x00, 0x00, 0x00, 0x02];

const CLIENT_OPTIONS: &str = "V4,dev-type tun";

/// Client side of the key exchange
pub struct Authenticator {
    pre_master: Vec<u8>,
    random1: Vec<u8>,
    random2: Vec<u8>,
    server_random1: Option<Vec<u8>>,
    server_random2: Option<Vec<u8>>,
    server_options: Option<String>,
    control_buffer: BytesMut,
}

impl Authenticator {
    /// Generate fresh key material
    pub fn new(engine: &CryptoEngine) -> Result<Self> {
        Ok(Self::with_key_material(
            engine.random_bytes(PRE_MASTER_LENGTH)?,
            engine.random_bytes(RANDOM_LENGTH)?,
            engine.random_bytes(RANDOM_LENGTH)?,
        ))
    }

    pub(crate) fn with_key_material(pre_master: Vec<u8>, random1: Vec<u8>, random2: Vec<u8>) -> Self {
        Self {
            pre_master,
            random1,
            random2,
            server_random1: None,
            server_random2: None,
            server_options: None,
            control_buffer: BytesMut::new(),
        }
    }

    /// Build the client message; an auth token, when known, replaces the password
    pub fn request(
        &self,
        credentials: Option<&Credentials>,
        auth_token: Option<&str>,
        peer_info: &str,
    ) -> Result<Vec<u8>> {
        let mut buf = BytesMut::with_capacity(256);
        buf.put_slice(&KEY_METHOD_PREFIX);
        buf.put_slice(&self.pre_master);
        buf.put_slice(&self.random1);
        buf.put_slice(&self.random2);
        put_string(&mut buf, CLIENT_OPTIONS)?;
        match credentials {
            Some(credentials) => {
                put_string(&mut buf, &credentials.username)?;
                put_string(&mut buf, auth_token.unwrap_or(&credentials.password))?;
            }
            None => {
                buf.put_u16(0);
                buf.put_u16(0);
            }
        }
        put_string(&mut buf, peer_info)?;
        Ok(buf.to_vec())
    }

    /// Accumulate decrypted control channel data
    pub fn append_control_data(&mut self, data: &[u8]) {
        self.control_buffer.extend_from_slice(data);
    }

    /// Consume the server reply once complete, returning `false` if more data is needed
    pub fn parse_auth_reply(&mut self) -> Result<bool> {
        let header_len = KEY_METHOD_PREFIX.len() + 2 * RANDOM_LENGTH + 2;
        if self.control_buffer.len() < KEY_METHOD_PREFIX.len() {
            return Ok(false);
        }
        if self.control_buffer[..KEY_METHOD_PREFIX.len()] != KEY_METHOD_PREFIX {
            return Err(SessionError::WrongControlDataPrefix.into());
        }
        if self.control_buffer.len() < header_len {
            return Ok(false);
        }
        let options_len = u16::from_be_bytes([
            self.control_buffer[header_len - 2],
            self.control_buffer[header_len - 1],
        ]) as usize;
        if self.control_buffer.len() < header_len + options_len {
            return Ok(false);
        }

        self.control_buffer.advance(KEY_METHOD_PREFIX.len());
        self.server_random1 = Some(self.control_buffer.split_to(RANDOM_LENGTH).to_vec());
        self.server_random2 = Some(self.control_buffer.split_to(RANDOM_LENGTH).to_vec());
        self.control_buffer.advance(2);
        let options = self.control_buffer.split_to(options_len);
        let options = String::from_utf8_lossy(&options)
            .trim_end_matches('\0')
            .to_string();
        debug!("Auth: server options \"{options}\"");
        self.server_options = Some(options);
        Ok(true)
    }

    /// Drain complete NUL-terminated messages
    pub fn parse_messages(&mut self) -> Vec<String> {
        let mut messages = Vec::new();
        while let Some(end) = self.control_buffer.iter().position(|b| *b == 0) {
            let message = self.control_buffer.split_to(end + 1);
            let text = String::from_utf8_lossy(&message[..end]).to_string();
            if !text.is_empty() {
                messages.push(text);
            }
        }
        messages
    }

    pub fn server_options(&self) -> Option<&str> {
        self.server_options.as_deref()
    }

    /// Derive the data channel keys of this negotiation
    pub fn derive_keys(
        &self,
        session_id: &SessionId,
        remote_session_id: &SessionId,
    ) -> Result<DataChannelKeys> {
        let (Some(server_random1), Some(server_random2)) =
            (&self.server_random1, &self.server_random2)
        else {
            return Err(VpnError::Crypto(
                "deriving keys before the server reply".into(),
            ));
        };
        let master = prf(
            &self.pre_master,
            "OpenVPN master secret",
            &[self.random1.as_slice(), server_random1.as_slice()],
            PRE_MASTER_LENGTH,
        )?;
        let block = prf(
            &master,
            "OpenVPN key expansion",
            &[
                self.random2.as_slice(),
                server_random2.as_slice(),
                session_id.as_slice(),
                remote_session_id.as_slice(),
            ],
            4 * KEY_SLOT_LENGTH,
        )?;
        DataChannelKeys::from_key_block(&block)
    }
}

/// Length-prefixed, NUL-terminated string
fn put_string(buf: &mut BytesMut, value: &str) -> Result<()> {
    let len = u16::try_from(value.len() + 1).map_err(|_| {
        VpnError::Config(format!(
            "auth string of {} bytes exceeds the 16-bit length prefix",
            value.len()
        ))
    })?;
    buf.put_u16(len);
    buf.put_slice(value.as_bytes());
    buf.put_u8(0);
    Ok(())
}

/// `IV_*` lines announcing client capabilities
pub fn peer_info(framing: CompressionFraming) -> String {
    let ciphers: Vec<&str> = Cipher::ALL.iter().map(|c| c.name()).collect();
    let mut lines = vec![
        "IV_VER=2.4".to_string(),
        format!("IV_PLAT={}", std::env::consts::OS),
        format!("IV_UI_VER=rovpn {}", env!("CARGO_PKG_VERSION")),
        "IV_PROTO=2".to_string(),
        "IV_NCP=2".to_string(),
        format!("IV_CIPHERS={}", ciphers.join(":")),
    ];
    if framing.is_enabled() {
        lines.push("IV_LZO_STUB=1".to_string());
        lines.push("IV_COMP_STUB=1".to_string());
    }
    let mut info = lines.join("\n");
    info.push('\n');
    info
}

#[cfg(test)]
mod tests {
    use super::*;

    fn authenticator() -> Authenticator {
        Authenticator::with_key_material(vec![1; 48], vec![2; 32], vec![3; 32])
    }

    fn server_reply(options: &str) -> Vec<u8> {
        let mut reply = KEY_METHOD_PREFIX.to_vec();
        reply.extend_from_slice(&[4; 32]);
        reply.extend_from_slice(&[5; 32]);
        reply.extend_from_slice(&((options.len() + 1) as u16).to_be_bytes());
        reply.extend_from_slice(options.as_bytes());
        reply.push(0);
        reply
    }

    #[test]
    fn test_request_layout() {
        let auth = authenticator();
        let credentials = Credentials::new("user", "pass");
        let request = auth
            .request(Some(&credentials), None, "IV_VER=2.4\n")
            .unwrap();

        assert_eq!(&request[..5], &KEY_METHOD_PREFIX);
        assert_eq!(&request[5..53], &[1; 48]);
        assert_eq!(&request[53..85], &[2; 32]);
        assert_eq!(&request[85..117], &[3; 32]);

        let mut rest = &request[117..];
        let mut strings = Vec::new();
        while !rest.is_empty() {
            let len = u16::from_be_bytes([rest[0], rest[1]]) as usize;
            strings.push(String::from_utf8(rest[2..2 + len - 1].to_vec()).unwrap());
            assert_eq!(rest[2 + len - 1], 0);
            rest = &rest[2 + len..];
        }
        assert_eq!(strings, vec![CLIENT_OPTIONS, "user", "pass", "IV_VER=2.4\n"]);
    }

    #[test]
    fn test_request_prefers_auth_token() {
        let auth = authenticator();
        let credentials = Credentials::new("user", "pass");
        let request = auth.request(Some(&credentials), Some("token"), "").unwrap();
        let text = String::from_utf8_lossy(&request);
        assert!(text.contains("token"));
        assert!(!text.contains("pass"));

        let anonymous = auth.request(None, None, "").unwrap();
        let options_end = 117 + 2 + CLIENT_OPTIONS.len() + 1;
        assert_eq!(&anonymous[options_end..options_end + 4], &[0, 0, 0, 0]);
    }

    #[test]
    fn test_request_rejects_oversized_strings() {
        let auth = authenticator();
        let credentials = Credentials::new("u".repeat(70_000), "pass");
        assert!(matches!(
            auth.request(Some(&credentials), None, ""),
            Err(VpnError::Config(_))
        ));

        // 65534 bytes plus the NUL still fit the prefix
        let credentials = Credentials::new("u".repeat(u16::MAX as usize - 1), "pass");
        let request = auth.request(Some(&credentials), None, "").unwrap();
        let at = 117 + 2 + CLIENT_OPTIONS.len() + 1;
        assert_eq!(&request[at..at + 2], &u16::MAX.to_be_bytes());
    }

    #[test]
    fn test_parse_reply_in_pieces() {
        let mut auth = authenticator();
        let mut data = server_reply("V4,dev-type tun,cipher AES-256-GCM");
        data.extend_from_slice(b"PUSH_REPLY,ping 10\0AUTH_");

        let (first, second) = data.split_at(40);
        auth.append_control_data(first);
        assert!(!auth.parse_auth_reply().unwrap());
        auth.append_control_data(second);
        assert!(auth.parse_auth_reply().unwrap());
        assert_eq!(
            auth.server_options(),
            Some("V4,dev-type tun,cipher AES-256-GCM")
        );

        assert_eq!(auth.parse_messages(), vec!["PUSH_REPLY,ping 10"]);
        auth.append_control_data(b"FAILED\0");
        assert_eq!(auth.parse_messages(), vec!["AUTH_FAILED"]);
        assert!(auth.parse_messages().is_empty());
    }

    #[test]
    fn test_wrong_prefix() {
        let mut auth = authenticator();
        auth.append_control_data(&[0, 0, 0, 1, 2, 3, 4]);
        assert!(matches!(
            auth.parse_auth_reply(),
            Err(VpnError::Session(SessionError::WrongControlDataPrefix))
        ));
    }

    #[test]
    fn test_key_derivation() {
        let mut auth = authenticator();
        assert!(auth.derive_keys(&[1; 8], &[2; 8]).is_err());

        auth.append_control_data(&server_reply("V4"));
        assert!(auth.parse_auth_reply().unwrap());
        let keys = auth.derive_keys(&[1; 8], &[2; 8]).unwrap();
        assert_eq!(keys, auth.derive_keys(&[1; 8], &[2; 8]).unwrap());
        assert_ne!(keys, auth.derive_keys(&[2; 8], &[1; 8]).unwrap());
        assert_eq!(keys.cipher_encrypt.len(), KEY_SLOT_LENGTH);
        assert_ne!(keys.cipher_encrypt, keys.cipher_decrypt);
    }

    #[test]
    fn test_key_derivation_known_answer() {
        let mut auth = authenticator();
        auth.append_control_data(&server_reply("V4"));
        assert!(auth.parse_auth_reply().unwrap());
        let keys = auth.derive_keys(&[1; 8], &[2; 8]).unwrap();

        assert_eq!(
            hex::encode(&keys.cipher_encrypt),
            "342cf4979f88a9007fbe96469137b618ba55575b14ae7d230d679dddf28ee6e3\
             503eec7391545875d97511713cdc75b5923812368102731280dd2fa21a105d86"
        );
        assert_eq!(
            hex::encode(&keys.hmac_encrypt),
            "53da2e96e3bea1b3099a9173436bab89d6ea34aed437989459af4d3f405da9a9\
             23e524a0e2f5fe57241efe7ff9eff5cd6c7dcaa4bb0b347da1cbfca41d9bb3ef"
        );
        assert_eq!(
            hex::encode(&keys.cipher_decrypt),
            "7e5a1e0244c60e0eaa5c433061f59c90a2b2a7b7e038aa6e1169babf164b2ace\
             79ec9fc75e29cdac0b054c0932fd67a51f2b85f43c7edae5a462db9907c1ae7e"
        );
        assert_eq!(
            hex::encode(&keys.hmac_decrypt),
            "786e45e34e3683f24c027899793572db9034a178930bac4d00100b88a1a7f53a\
             a27bdef2c2d609ca4a942bcbb91e53703e58292cc78b68d942dc84e3ea6031d6"
        );
    }

    #[test]
    fn test_peer_info() {
        let info = peer_info(CompressionFraming::Disabled);
        assert!(info.starts_with("IV_VER=2.4\n"));
        assert!(info.contains("IV_NCP=2\n"));
        assert!(info.contains("AES-256-GCM"));
        assert!(!info.contains("IV_LZO_STUB"));

        let info = peer_info(CompressionFraming::CompLzo);
        assert!(info.contains("IV_LZO_STUB=1\n"));
        assert!(info.contains("IV_COMP_STUB=1\n"));
    }
}

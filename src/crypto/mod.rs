//! Cryptographic operations and abstractions
//!
//! The data channel is driven through the [`CryptoProvider`] capability so
//! the session engine never touches cipher primitives directly. The default
//! provider lives in [`native`].

use crate::error::{DataPathError, Result, VpnError};
use hmac::{Hmac, Mac};
use ring::rand::{SecureRandom, SystemRandom};
use std::fmt;
use std::str::FromStr;

pub mod data_path;
pub mod native;
pub mod static_key;
pub mod tls;

pub use data_path::DataPath;
pub use native::NativeCryptoProvider;
pub use static_key::{KeyDirection, StaticKey, TlsWrap, TlsWrapStrategy};

/// Length of one key slot in derived or static key material
pub const KEY_SLOT_LENGTH: usize = 64;

/// Cryptographic engine for random material
pub struct CryptoEngine {
    rng: SystemRandom,
}

impl CryptoEngine {
    /// Create a new crypto engine
    pub fn new() -> Self {
        Self {
            rng: SystemRandom::new(),
        }
    }

    /// Fill a buffer with random bytes
    pub fn fill(&self, buf: &mut [u8]) -> Result<()> {
        self.rng
            .fill(buf)
            .map_err(|e| VpnError::Crypto(format!("Random generation failed: {e:?}")))
    }

    /// Generate random bytes
    pub fn random_bytes(&self, length: usize) -> Result<Vec<u8>> {
        let mut bytes = vec![0u8; length];
        self.fill(&mut bytes)?;
        Ok(bytes)
    }
}

impl Default for CryptoEngine {
    fn default() -> Self {
        Self::new()
    }
}

/// Data channel cipher
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Cipher {
    Aes128Cbc,
    Aes192Cbc,
    Aes256Cbc,
    Aes128Gcm,
    Aes256Gcm,
}

impl Cipher {
    pub const ALL: [Cipher; 5] = [
        Cipher::Aes128Gcm,
        Cipher::Aes256Gcm,
        Cipher::Aes128Cbc,
        Cipher::Aes192Cbc,
        Cipher::Aes256Cbc,
    ];

    /// OpenVPN name of the cipher
    pub fn name(self) -> &'static str {
        match self {
            Cipher::Aes128Cbc => "AES-128-CBC",
            Cipher::Aes192Cbc => "AES-192-CBC",
            Cipher::Aes256Cbc => "AES-256-CBC",
            Cipher::Aes128Gcm => "AES-128-GCM",
            Cipher::Aes256Gcm => "AES-256-GCM",
        }
    }

    pub fn key_len(self) -> usize {
        match self {
            Cipher::Aes128Cbc | Cipher::Aes128Gcm => 16,
            Cipher::Aes192Cbc => 24,
            Cipher::Aes256Cbc | Cipher::Aes256Gcm => 32,
        }
    }

    /// AEAD ciphers carry their own tag and ignore the HMAC digest
    pub fn is_aead(self) -> bool {
        matches!(self, Cipher::Aes128Gcm | Cipher::Aes256Gcm)
    }
}

impl fmt::Display for Cipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Cipher {
    type Err = VpnError;

    fn from_str(s: &str) -> Result<Self> {
        let upper = s.to_ascii_uppercase();
        Cipher::ALL
            .into_iter()
            .find(|c| c.name() == upper)
            .ok_or_else(|| VpnError::Crypto(format!("Unsupported cipher: {s}")))
    }
}

/// HMAC digest
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Digest {
    Sha1,
    Sha224,
    Sha256,
    Sha384,
    Sha512,
}

impl Digest {
    pub const ALL: [Digest; 5] = [
        Digest::Sha1,
        Digest::Sha224,
        Digest::Sha256,
        Digest::Sha384,
        Digest::Sha512,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Digest::Sha1 => "SHA1",
            Digest::Sha224 => "SHA224",
            Digest::Sha256 => "SHA256",
            Digest::Sha384 => "SHA384",
            Digest::Sha512 => "SHA512",
        }
    }

    /// Output (and HMAC key) length in bytes
    pub fn output_len(self) -> usize {
        match self {
            Digest::Sha1 => 20,
            Digest::Sha224 => 28,
            Digest::Sha256 => 32,
            Digest::Sha384 => 48,
            Digest::Sha512 => 64,
        }
    }

    /// Compute an HMAC over the concatenation of `parts`
    pub fn hmac(self, key: &[u8], parts: &[&[u8]]) -> Result<Vec<u8>> {
        macro_rules! compute {
            ($hash:ty) => {{
                let mut mac = <Hmac<$hash> as Mac>::new_from_slice(key)
                    .map_err(|e| VpnError::Crypto(format!("HMAC key rejected: {e}")))?;
                for part in parts {
                    mac.update(part);
                }
                Ok(mac.finalize().into_bytes().to_vec())
            }};
        }
        match self {
            Digest::Sha1 => compute!(sha1::Sha1),
            Digest::Sha224 => compute!(sha2::Sha224),
            Digest::Sha256 => compute!(sha2::Sha256),
            Digest::Sha384 => compute!(sha2::Sha384),
            Digest::Sha512 => compute!(sha2::Sha512),
        }
    }

    /// Constant-time check of an HMAC over the concatenation of `parts`
    pub fn verify(self, key: &[u8], parts: &[&[u8]], expected: &[u8]) -> bool {
        macro_rules! check {
            ($hash:ty) => {{
                match <Hmac<$hash> as Mac>::new_from_slice(key) {
                    Ok(mut mac) => {
                        for part in parts {
                            mac.update(part);
                        }
                        mac.verify_slice(expected).is_ok()
                    }
                    Err(_) => false,
                }
            }};
        }
        match self {
            Digest::Sha1 => check!(sha1::Sha1),
            Digest::Sha224 => check!(sha2::Sha224),
            Digest::Sha256 => check!(sha2::Sha256),
            Digest::Sha384 => check!(sha2::Sha384),
            Digest::Sha512 => check!(sha2::Sha512),
        }
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Digest {
    type Err = VpnError;

    fn from_str(s: &str) -> Result<Self> {
        let upper = s.to_ascii_uppercase();
        Digest::ALL
            .into_iter()
            .find(|d| d.name() == upper)
            .ok_or_else(|| VpnError::Crypto(format!("Unsupported digest: {s}")))
    }
}

fn hmac_md5(key: &[u8], parts: &[&[u8]]) -> Result<Vec<u8>> {
    let mut mac = <Hmac<md5::Md5> as Mac>::new_from_slice(key)
        .map_err(|e| VpnError::Crypto(format!("HMAC key rejected: {e}")))?;
    for part in parts {
        mac.update(part);
    }
    Ok(mac.finalize().into_bytes().to_vec())
}

/// XOR the TLS `P_hash` expansion of `seed` into `out`
fn p_hash<F>(mac: F, seed: &[u8], out: &mut [u8]) -> Result<()>
where
    F: Fn(&[&[u8]]) -> Result<Vec<u8>>,
{
    let mut a = mac(&[seed])?;
    let mut offset = 0;
    while offset < out.len() {
        let chunk = mac(&[&a, seed])?;
        for (dst, src) in out[offset..].iter_mut().zip(chunk.iter()) {
            *dst ^= src;
        }
        offset += chunk.len();
        a = mac(&[&a])?;
    }
    Ok(())
}

/// TLS 1.0 PRF: `P_MD5(S1, label + seed) XOR P_SHA1(S2, label + seed)`
pub fn prf(secret: &[u8], label: &str, seeds: &[&[u8]], length: usize) -> Result<Vec<u8>> {
    let half = secret.len().div_ceil(2);
    let s1 = &secret[..half];
    let s2 = &secret[secret.len() - half..];

    let mut seed = label.as_bytes().to_vec();
    for part in seeds {
        seed.extend_from_slice(part);
    }

    let mut out = vec![0u8; length];
    p_hash(|parts| hmac_md5(s1, parts), &seed, &mut out)?;
    p_hash(|parts| Digest::Sha1.hmac(s2, parts), &seed, &mut out)?;
    Ok(out)
}

/// Data channel key material, one 64-byte slot per direction and purpose
#[derive(Clone, PartialEq, Eq)]
pub struct DataChannelKeys {
    pub cipher_encrypt: Vec<u8>,
    pub hmac_encrypt: Vec<u8>,
    pub cipher_decrypt: Vec<u8>,
    pub hmac_decrypt: Vec<u8>,
}

impl fmt::Debug for DataChannelKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("DataChannelKeys(..)")
    }
}

impl DataChannelKeys {
    /// Split a 256-byte key block into its four slots
    pub fn from_key_block(block: &[u8]) -> Result<Self> {
        if block.len() != 4 * KEY_SLOT_LENGTH {
            return Err(VpnError::Crypto(format!(
                "Key block must be {} bytes, got {}",
                4 * KEY_SLOT_LENGTH,
                block.len()
            )));
        }
        let slot = |i: usize| block[i * KEY_SLOT_LENGTH..(i + 1) * KEY_SLOT_LENGTH].to_vec();
        Ok(Self {
            cipher_encrypt: slot(0),
            hmac_encrypt: slot(1),
            cipher_decrypt: slot(2),
            hmac_decrypt: slot(3),
        })
    }

    /// The same keys as seen from the peer
    pub fn mirrored(&self) -> Self {
        Self {
            cipher_encrypt: self.cipher_decrypt.clone(),
            hmac_encrypt: self.hmac_decrypt.clone(),
            cipher_decrypt: self.cipher_encrypt.clone(),
            hmac_decrypt: self.hmac_encrypt.clone(),
        }
    }
}

/// Creates data channel cipher contexts for a negotiated key
pub trait CryptoProvider: Send + Sync {
    fn data_channel(
        &self,
        cipher: Cipher,
        digest: Digest,
        keys: &DataChannelKeys,
    ) -> Result<Box<dyn DataChannelCrypto>>;
}

/// Per-key symmetric cipher context of the data channel
pub trait DataChannelCrypto: Send {
    /// Bytes added to every payload on the wire
    fn overhead(&self) -> usize;

    /// Encrypt one payload; `header` is authenticated when the cipher supports AD
    fn seal(
        &mut self,
        header: &[u8],
        packet_id: u32,
        payload: &[u8],
    ) -> std::result::Result<Vec<u8>, DataPathError>;

    /// Decrypt one frame body, returning its packet id and payload
    fn open(
        &mut self,
        header: &[u8],
        body: &[u8],
    ) -> std::result::Result<(u32, Vec<u8>), DataPathError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_bytes() {
        let engine = CryptoEngine::new();
        let a = engine.random_bytes(32).unwrap();
        let b = engine.random_bytes(32).unwrap();
        assert_eq!(a.len(), 32);
        assert_ne!(a, b);
    }

    #[test]
    fn test_cipher_names() {
        assert_eq!("aes-256-gcm".parse::<Cipher>().unwrap(), Cipher::Aes256Gcm);
        assert_eq!("AES-192-CBC".parse::<Cipher>().unwrap(), Cipher::Aes192Cbc);
        assert!("AES-192-GCM".parse::<Cipher>().is_err());
        assert!("BF-CBC".parse::<Cipher>().is_err());
        assert_eq!(Cipher::Aes128Cbc.to_string(), "AES-128-CBC");
        assert!(Cipher::Aes128Gcm.is_aead());
        assert_eq!(Cipher::Aes192Cbc.key_len(), 24);
    }

    #[test]
    fn test_digest_names() {
        assert_eq!("sha256".parse::<Digest>().unwrap(), Digest::Sha256);
        assert!("MD5".parse::<Digest>().is_err());
        assert_eq!(Digest::Sha512.output_len(), 64);
    }

    #[test]
    fn test_hmac_known_answer() {
        // RFC 2202 test case 2
        let mac = Digest::Sha1
            .hmac(b"Jefe", &[b"what do ya want ", b"for nothing?"])
            .unwrap();
        assert_eq!(hex::encode(&mac), "effcdf6ae5eb2fa2d27416d5f184df9c259a7c79");
        assert!(Digest::Sha1.verify(b"Jefe", &[b"what do ya want for nothing?"], &mac));
        assert!(!Digest::Sha1.verify(b"Jefe", &[b"what do ya want for nothing!"], &mac));

        for digest in Digest::ALL {
            assert_eq!(digest.hmac(b"k", &[b"data"]).unwrap().len(), digest.output_len());
        }
    }

    #[test]
    fn test_prf_properties() {
        let secret = [7u8; 48];
        let a = prf(&secret, "OpenVPN master secret", &[b"one", b"two"], 48).unwrap();
        let b = prf(&secret, "OpenVPN master secret", &[b"onetwo"], 48).unwrap();
        assert_eq!(a.len(), 48);
        assert_eq!(a, b);

        let c = prf(&secret, "OpenVPN key expansion", &[b"onetwo"], 48).unwrap();
        assert_ne!(a, c);

        // Longer output extends the shorter one
        let long = prf(&secret, "OpenVPN master secret", &[b"onetwo"], 256).unwrap();
        assert_eq!(&long[..48], &a[..]);
    }

    #[test]
    fn test_prf_known_answer() {
        let master = prf(&[7u8; 48], "OpenVPN master secret", &[b"one", b"two"], 48).unwrap();
        assert_eq!(
            hex::encode(master),
            "c5e420ffe0c6175376e18f60fc1eca512760b6d88c7ea3b12757ffdbec3ece4a\
             8c710f18895deb0745138fdcdcee70c4"
        );

        // Odd-length secrets share their middle byte between both halves
        let secret: Vec<u8> = (1..=49).collect();
        let expanded = prf(&secret, "OpenVPN key expansion", &[b"seed"], 32).unwrap();
        assert_eq!(
            hex::encode(expanded),
            "f11346a9622110b755b2f62e032e353d6411669ca525e49f4045f4da27adc4ea"
        );
    }

    #[test]
    fn test_key_block_split() {
        let block: Vec<u8> = (0..=255).collect();
        let keys = DataChannelKeys::from_key_block(&block).unwrap();
        assert_eq!(keys.cipher_encrypt[0], 0);
        assert_eq!(keys.hmac_encrypt[0], 64);
        assert_eq!(keys.cipher_decrypt[0], 128);
        assert_eq!(keys.hmac_decrypt[0], 192);

        let peer = keys.mirrored();
        assert_eq!(peer.cipher_encrypt, keys.cipher_decrypt);
        assert_eq!(peer.mirrored(), keys);

        assert!(DataChannelKeys::from_key_block(&block[..200]).is_err());
    }
}

//! Default data channel crypto: AES-GCM through ring, AES-CBC with HMAC
//! through the RustCrypto block cipher crates

use super::{Cipher, CryptoEngine, CryptoProvider, DataChannelCrypto, DataChannelKeys, Digest};
use crate::error::{DataPathError, Result, VpnError};
use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockEncrypt, KeyInit};
use cbc::cipher::block_padding::Pkcs7;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use ring::aead;

const AES_BLOCK: usize = 16;
const GCM_TAG: usize = 16;
const IMPLICIT_IV_LENGTH: usize = 8;
const PACKET_ID: usize = 4;

/// Provider backed by ring and the RustCrypto AES crates
#[derive(Debug, Default, Clone, Copy)]
pub struct NativeCryptoProvider;

impl CryptoProvider for NativeCryptoProvider {
    fn data_channel(
        &self,
        cipher: Cipher,
        digest: Digest,
        keys: &DataChannelKeys,
    ) -> Result<Box<dyn DataChannelCrypto>> {
        if cipher.is_aead() {
            Ok(Box::new(GcmCrypto::new(cipher, keys)?))
        } else {
            Ok(Box::new(CbcHmacCrypto::new(cipher, digest, keys)))
        }
    }
}

/// AES-CBC with encrypt-then-MAC
struct CbcHmacCrypto {
    cipher: Cipher,
    digest: Digest,
    encrypt_key: Vec<u8>,
    decrypt_key: Vec<u8>,
    hmac_encrypt: Vec<u8>,
    hmac_decrypt: Vec<u8>,
    rng: CryptoEngine,
}

impl CbcHmacCrypto {
    fn new(cipher: Cipher, digest: Digest, keys: &DataChannelKeys) -> Self {
        Self {
            cipher,
            digest,
            encrypt_key: keys.cipher_encrypt[..cipher.key_len()].to_vec(),
            decrypt_key: keys.cipher_decrypt[..cipher.key_len()].to_vec(),
            hmac_encrypt: keys.hmac_encrypt[..digest.output_len()].to_vec(),
            hmac_decrypt: keys.hmac_decrypt[..digest.output_len()].to_vec(),
            rng: CryptoEngine::new(),
        }
    }
}

impl DataChannelCrypto for CbcHmacCrypto {
    fn overhead(&self) -> usize {
        self.digest.output_len() + AES_BLOCK + PACKET_ID + AES_BLOCK
    }

    fn seal(
        &mut self,
        _header: &[u8],
        packet_id: u32,
        payload: &[u8],
    ) -> std::result::Result<Vec<u8>, DataPathError> {
        let mut plaintext = Vec::with_capacity(PACKET_ID + payload.len());
        plaintext.extend_from_slice(&packet_id.to_be_bytes());
        plaintext.extend_from_slice(payload);

        let mut iv = [0u8; AES_BLOCK];
        self.rng
            .fill(&mut iv)
            .map_err(|e| DataPathError::Crypto(e.to_string()))?;
        let ciphertext = cbc_encrypt(self.cipher, &self.encrypt_key, &iv, &plaintext)?;
        let mac = self
            .digest
            .hmac(&self.hmac_encrypt, &[&iv, &ciphertext])
            .map_err(|e| DataPathError::Crypto(e.to_string()))?;

        let mut out = Vec::with_capacity(mac.len() + iv.len() + ciphertext.len());
        out.extend_from_slice(&mac);
        out.extend_from_slice(&iv);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    fn open(
        &mut self,
        _header: &[u8],
        body: &[u8],
    ) -> std::result::Result<(u32, Vec<u8>), DataPathError> {
        let mac_len = self.digest.output_len();
        if body.len() < mac_len + 2 * AES_BLOCK {
            return Err(DataPathError::Malformed(format!(
                "CBC frame too short: {} bytes",
                body.len()
            )));
        }
        let (mac, rest) = body.split_at(mac_len);
        let (iv, ciphertext) = rest.split_at(AES_BLOCK);
        if ciphertext.len() % AES_BLOCK != 0 {
            return Err(DataPathError::Malformed(
                "CBC ciphertext is not block aligned".into(),
            ));
        }
        if !self.digest.verify(&self.hmac_decrypt, &[iv, ciphertext], mac) {
            return Err(DataPathError::Integrity);
        }

        let plaintext = cbc_decrypt(self.cipher, &self.decrypt_key, iv, ciphertext)?;
        if plaintext.len() < PACKET_ID {
            return Err(DataPathError::Malformed("missing packet id".into()));
        }
        let packet_id = u32::from_be_bytes([plaintext[0], plaintext[1], plaintext[2], plaintext[3]]);
        Ok((packet_id, plaintext[PACKET_ID..].to_vec()))
    }
}

fn cbc_encrypt(
    cipher: Cipher,
    key: &[u8],
    iv: &[u8],
    plaintext: &[u8],
) -> std::result::Result<Vec<u8>, DataPathError> {
    macro_rules! encrypt {
        ($aes:ty) => {
            cbc::Encryptor::<$aes>::new_from_slices(key, iv)
                .map(|enc| enc.encrypt_padded_vec_mut::<Pkcs7>(plaintext))
                .map_err(|e| DataPathError::Crypto(format!("CBC key setup failed: {e}")))
        };
    }
    match cipher {
        Cipher::Aes128Cbc => encrypt!(aes::Aes128),
        Cipher::Aes192Cbc => encrypt!(aes::Aes192),
        Cipher::Aes256Cbc => encrypt!(aes::Aes256),
        other => Err(DataPathError::Crypto(format!("{other} is not a CBC cipher"))),
    }
}

fn cbc_decrypt(
    cipher: Cipher,
    key: &[u8],
    iv: &[u8],
    ciphertext: &[u8],
) -> std::result::Result<Vec<u8>, DataPathError> {
    macro_rules! decrypt {
        ($aes:ty) => {
            cbc::Decryptor::<$aes>::new_from_slices(key, iv)
                .map_err(|e| DataPathError::Crypto(format!("CBC key setup failed: {e}")))?
                .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
                .map_err(|_| DataPathError::Integrity)
        };
    }
    match cipher {
        Cipher::Aes128Cbc => decrypt!(aes::Aes128),
        Cipher::Aes192Cbc => decrypt!(aes::Aes192),
        Cipher::Aes256Cbc => decrypt!(aes::Aes256),
        other => Err(DataPathError::Crypto(format!("{other} is not a CBC cipher"))),
    }
}

/// AES-GCM with an implicit IV taken from the HMAC key slot
struct GcmCrypto {
    seal_key: aead::LessSafeKey,
    open_key: aead::LessSafeKey,
    seal_iv: [u8; IMPLICIT_IV_LENGTH],
    open_iv: [u8; IMPLICIT_IV_LENGTH],
}

impl GcmCrypto {
    fn new(cipher: Cipher, keys: &DataChannelKeys) -> Result<Self> {
        let algorithm = match cipher {
            Cipher::Aes128Gcm => &aead::AES_128_GCM,
            Cipher::Aes256Gcm => &aead::AES_256_GCM,
            other => return Err(VpnError::Crypto(format!("{other} is not an AEAD cipher"))),
        };
        let key = |material: &[u8]| -> Result<aead::LessSafeKey> {
            let unbound = aead::UnboundKey::new(algorithm, &material[..cipher.key_len()])
                .map_err(|e| VpnError::Crypto(format!("Key creation failed: {e:?}")))?;
            Ok(aead::LessSafeKey::new(unbound))
        };
        let iv = |material: &[u8]| {
            let mut iv = [0u8; IMPLICIT_IV_LENGTH];
            iv.copy_from_slice(&material[..IMPLICIT_IV_LENGTH]);
            iv
        };
        Ok(Self {
            seal_key: key(&keys.cipher_encrypt)?,
            open_key: key(&keys.cipher_decrypt)?,
            seal_iv: iv(&keys.hmac_encrypt),
            open_iv: iv(&keys.hmac_decrypt),
        })
    }
}

fn gcm_nonce(packet_id: u32, implicit: &[u8; IMPLICIT_IV_LENGTH]) -> aead::Nonce {
    let mut nonce = [0u8; aead::NONCE_LEN];
    nonce[..PACKET_ID].copy_from_slice(&packet_id.to_be_bytes());
    nonce[PACKET_ID..].copy_from_slice(implicit);
    aead::Nonce::assume_unique_for_key(nonce)
}

fn gcm_ad(header: &[u8], packet_id: u32) -> Vec<u8> {
    let mut ad = Vec::with_capacity(header.len() + PACKET_ID);
    ad.extend_from_slice(header);
    ad.extend_from_slice(&packet_id.to_be_bytes());
    ad
}

impl DataChannelCrypto for GcmCrypto {
    fn overhead(&self) -> usize {
        PACKET_ID + GCM_TAG
    }

    fn seal(
        &mut self,
        header: &[u8],
        packet_id: u32,
        payload: &[u8],
    ) -> std::result::Result<Vec<u8>, DataPathError> {
        let ad = gcm_ad(header, packet_id);
        let mut in_out = payload.to_vec();
        let tag = self
            .seal_key
            .seal_in_place_separate_tag(
                gcm_nonce(packet_id, &self.seal_iv),
                aead::Aad::from(ad.as_slice()),
                &mut in_out,
            )
            .map_err(|_| DataPathError::Crypto("AEAD seal failed".into()))?;

        let mut out = Vec::with_capacity(PACKET_ID + GCM_TAG + in_out.len());
        out.extend_from_slice(&packet_id.to_be_bytes());
        out.extend_from_slice(tag.as_ref());
        out.extend_from_slice(&in_out);
        Ok(out)
    }

    fn open(
        &mut self,
        header: &[u8],
        body: &[u8],
    ) -> std::result::Result<(u32, Vec<u8>), DataPathError> {
        if body.len() < PACKET_ID + GCM_TAG {
            return Err(DataPathError::Malformed(format!(
                "GCM frame too short: {} bytes",
                body.len()
            )));
        }
        let packet_id = u32::from_be_bytes([body[0], body[1], body[2], body[3]]);
        let tag = &body[PACKET_ID..PACKET_ID + GCM_TAG];
        let mut in_out = body[PACKET_ID + GCM_TAG..].to_vec();
        in_out.extend_from_slice(tag);

        let ad = gcm_ad(header, packet_id);
        let plaintext = self
            .open_key
            .open_in_place(
                gcm_nonce(packet_id, &self.open_iv),
                aead::Aad::from(ad.as_slice()),
                &mut in_out,
            )
            .map_err(|_| DataPathError::Integrity)?;
        Ok((packet_id, plaintext.to_vec()))
    }
}

/// AES-256 in counter mode with a 128-bit big-endian counter
pub(crate) fn aes256_ctr(key: &[u8], iv: &[u8], data: &mut [u8]) -> Result<()> {
    let cipher = aes::Aes256::new_from_slice(key)
        .map_err(|e| VpnError::Crypto(format!("AES-256 key rejected: {e}")))?;
    let iv: [u8; AES_BLOCK] = iv
        .get(..AES_BLOCK)
        .and_then(|s| s.try_into().ok())
        .ok_or_else(|| VpnError::Crypto("CTR IV too short".into()))?;

    let mut counter = u128::from_be_bytes(iv);
    for chunk in data.chunks_mut(AES_BLOCK) {
        let mut block = GenericArray::from(counter.to_be_bytes());
        cipher.encrypt_block(&mut block);
        for (byte, pad) in chunk.iter_mut().zip(block.iter()) {
            *byte ^= pad;
        }
        counter = counter.wrapping_add(1);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys() -> DataChannelKeys {
        let block: Vec<u8> = (0..=255u8).map(|b| b.wrapping_mul(31)).collect();
        DataChannelKeys::from_key_block(&block).unwrap()
    }

    #[test]
    fn test_cbc_round_trip() {
        let keys = keys();
        for cipher in [Cipher::Aes128Cbc, Cipher::Aes192Cbc, Cipher::Aes256Cbc] {
            let mut client = NativeCryptoProvider
                .data_channel(cipher, Digest::Sha256, &keys)
                .unwrap();
            let mut server = NativeCryptoProvider
                .data_channel(cipher, Digest::Sha256, &keys.mirrored())
                .unwrap();

            let frame = client.seal(&[0x30], 9, b"hello world").unwrap();
            assert_eq!((frame.len() - 32 - 16) % 16, 0);
            let (packet_id, payload) = server.open(&[0x30], &frame).unwrap();
            assert_eq!(packet_id, 9);
            assert_eq!(payload, b"hello world");
        }
    }

    #[test]
    fn test_cbc_tamper_is_detected() {
        let keys = keys();
        let mut client = NativeCryptoProvider
            .data_channel(Cipher::Aes128Cbc, Digest::Sha1, &keys)
            .unwrap();
        let mut server = NativeCryptoProvider
            .data_channel(Cipher::Aes128Cbc, Digest::Sha1, &keys.mirrored())
            .unwrap();

        let mut frame = client.seal(&[], 1, b"payload").unwrap();
        let last = frame.len() - 1;
        frame[last] ^= 0x01;
        assert_eq!(server.open(&[], &frame), Err(DataPathError::Integrity));
        assert!(matches!(
            server.open(&[], &frame[..10]),
            Err(DataPathError::Malformed(_))
        ));
    }

    #[test]
    fn test_gcm_round_trip_and_ad() {
        let keys = keys();
        for cipher in [Cipher::Aes128Gcm, Cipher::Aes256Gcm] {
            let mut client = NativeCryptoProvider
                .data_channel(cipher, Digest::Sha1, &keys)
                .unwrap();
            let mut server = NativeCryptoProvider
                .data_channel(cipher, Digest::Sha1, &keys.mirrored())
                .unwrap();

            let header = [0x48, 0x00, 0x00, 0x07];
            let frame = client.seal(&header, 3, b"tunnel packet").unwrap();
            assert_eq!(&frame[..4], &3u32.to_be_bytes());
            assert_eq!(frame.len(), 4 + 16 + 13);

            let (packet_id, payload) = server.open(&header, &frame).unwrap();
            assert_eq!(packet_id, 3);
            assert_eq!(payload, b"tunnel packet");

            // Associated data must match
            assert_eq!(
                server.open(&[0x48, 0x00, 0x00, 0x08], &frame),
                Err(DataPathError::Integrity)
            );
        }
    }

    #[test]
    fn test_ctr_is_symmetric() {
        let key = [3u8; 32];
        let iv = [0xFFu8; 16];
        let mut data = b"spans more than one block of keystream".to_vec();
        aes256_ctr(&key, &iv, &mut data).unwrap();
        assert_ne!(&data[..], b"spans more than one block of keystream");
        aes256_ctr(&key, &iv, &mut data).unwrap();
        assert_eq!(&data[..], b"spans more than one block of keystream");
        assert!(aes256_ctr(&key[..16], &iv, &mut data).is_err());
    }
}

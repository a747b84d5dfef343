//! Data channel: turns tunnel packets into wire frames and back

use super::DataChannelCrypto;
use crate::error::DataPathError;
use crate::protocol::constants::{PEER_ID_DISABLED, PING_STRING};
use crate::protocol::PacketCode;
use crate::proxy::configuration::CompressionFraming;
use bytes::Bytes;
use log::{debug, warn};

/// Highest outbound packet id before the key must be retired
pub const MAX_PACKET_ID: u32 = 0xFFFF_FF00;

const REPLAY_WINDOW_SIZE: u32 = 64;

/// Compression framing bytes
mod framing {
    pub const NO_COMPRESS: u8 = 0xFA;
    pub const NO_COMPRESS_SWAP: u8 = 0xFB;
    pub const LZO_COMPRESS: u8 = 0x66;
    pub const LZ4_COMPRESS: u8 = 0x69;
}

/// Sliding window over the last 64 inbound packet ids
#[derive(Debug, Default, Clone)]
pub struct ReplayWindow {
    highest: u32,
    bitmap: u64,
}

impl ReplayWindow {
    /// Record `packet_id`, returning false if it is a replay or too old
    pub fn check_and_update(&mut self, packet_id: u32) -> bool {
        if packet_id == 0 {
            return false;
        }
        if packet_id > self.highest {
            let shift = packet_id - self.highest;
            self.bitmap = if shift >= REPLAY_WINDOW_SIZE {
                0
            } else {
                self.bitmap << shift
            };
            self.bitmap |= 1;
            self.highest = packet_id;
            return true;
        }
        let offset = self.highest - packet_id;
        if offset >= REPLAY_WINDOW_SIZE {
            return false;
        }
        let bit = 1u64 << offset;
        if self.bitmap & bit != 0 {
            return false;
        }
        self.bitmap |= bit;
        true
    }
}

/// Per-key encryption state of the data channel
pub struct DataPath {
    crypto: Box<dyn DataChannelCrypto>,
    key_id: u8,
    peer_id: u32,
    compression_framing: CompressionFraming,
    outbound_packet_id: u32,
    replay: ReplayWindow,
}

impl DataPath {
    pub fn new(
        crypto: Box<dyn DataChannelCrypto>,
        key_id: u8,
        peer_id: Option<u32>,
        compression_framing: CompressionFraming,
    ) -> Self {
        Self {
            crypto,
            key_id,
            peer_id: peer_id.map_or(PEER_ID_DISABLED, |id| id & PEER_ID_DISABLED),
            compression_framing,
            outbound_packet_id: 0,
            replay: ReplayWindow::default(),
        }
    }

    pub fn key_id(&self) -> u8 {
        self.key_id
    }

    /// Peer id in use, if any
    pub fn peer_id(&self) -> Option<u32> {
        (self.peer_id != PEER_ID_DISABLED).then_some(self.peer_id)
    }

    /// Change the peer id, e.g. after a link rebind
    pub fn set_peer_id(&mut self, peer_id: Option<u32>) {
        self.peer_id = peer_id.map_or(PEER_ID_DISABLED, |id| id & PEER_ID_DISABLED);
    }

    /// Largest per-packet expansion on the wire
    pub fn overhead(&self) -> usize {
        self.header().len() + 1 + self.crypto.overhead()
    }

    fn header(&self) -> Vec<u8> {
        if self.peer_id == PEER_ID_DISABLED {
            vec![PacketCode::DataV1.header(self.key_id)]
        } else {
            let id = self.peer_id.to_be_bytes();
            vec![PacketCode::DataV2.header(self.key_id), id[1], id[2], id[3]]
        }
    }

    fn frame_payload(&self, payload: &[u8]) -> Vec<u8> {
        match self.compression_framing {
            CompressionFraming::Disabled => payload.to_vec(),
            CompressionFraming::CompLzo => {
                let mut out = Vec::with_capacity(payload.len() + 1);
                out.push(framing::NO_COMPRESS);
                out.extend_from_slice(payload);
                out
            }
            CompressionFraming::Compress => match payload.split_first() {
                None => vec![framing::NO_COMPRESS],
                Some((first, rest)) => {
                    let mut out = Vec::with_capacity(payload.len() + 1);
                    out.push(framing::NO_COMPRESS_SWAP);
                    out.extend_from_slice(rest);
                    out.push(*first);
                    out
                }
            },
        }
    }

    /// Undo compression framing; `None` means the packet must be dropped
    fn unframe_payload(
        &self,
        mut payload: Vec<u8>,
    ) -> Result<Option<Vec<u8>>, DataPathError> {
        if self.compression_framing == CompressionFraming::Disabled {
            return Ok(Some(payload));
        }
        let Some(&marker) = payload.first() else {
            return Err(DataPathError::Malformed("missing compression byte".into()));
        };
        match marker {
            framing::NO_COMPRESS => {
                payload.remove(0);
                Ok(Some(payload))
            }
            framing::NO_COMPRESS_SWAP
                if self.compression_framing == CompressionFraming::Compress =>
            {
                // The swapped byte sits at the end
                payload.remove(0);
                if let Some(last) = payload.pop() {
                    payload.insert(0, last);
                }
                Ok(Some(payload))
            }
            framing::LZO_COMPRESS | framing::LZ4_COMPRESS => {
                warn!("Dropping compressed data packet (marker {marker:#04x})");
                Ok(None)
            }
            other => Err(DataPathError::Malformed(format!(
                "unknown compression byte {other:#04x}"
            ))),
        }
    }

    /// Encrypt a batch of tunnel packets, appending frames to `out`
    ///
    /// Frames appended before an error remain valid.
    pub fn encrypt_packets(
        &mut self,
        packets: &[Bytes],
        out: &mut Vec<Bytes>,
    ) -> Result<(), DataPathError> {
        let header = self.header();
        let ad_header: &[u8] = if header.len() > 1 { &header } else { &[] };
        for packet in packets {
            if self.outbound_packet_id >= MAX_PACKET_ID {
                return Err(DataPathError::Overflow);
            }
            self.outbound_packet_id += 1;

            let framed = self.frame_payload(packet);
            let body = self
                .crypto
                .seal(ad_header, self.outbound_packet_id, &framed)?;
            let mut frame = Vec::with_capacity(header.len() + body.len());
            frame.extend_from_slice(&header);
            frame.extend_from_slice(&body);
            out.push(Bytes::from(frame));
        }
        Ok(())
    }

    /// Decrypt a batch of wire frames, appending tunnel packets to `out`
    ///
    /// Keep-alive pings, replays and compressed packets are dropped. Packets
    /// appended before an error remain valid.
    pub fn decrypt_packets(
        &mut self,
        packets: &[Bytes],
        out: &mut Vec<Bytes>,
    ) -> Result<(), DataPathError> {
        for packet in packets {
            let Some(&first) = packet.first() else {
                return Err(DataPathError::Malformed("empty data packet".into()));
            };
            let header_len = match PacketCode::parse_header(first) {
                Ok((PacketCode::DataV1, _)) => 1,
                Ok((PacketCode::DataV2, _)) => 4,
                _ => {
                    return Err(DataPathError::Malformed(format!(
                        "not a data packet: {first:#04x}"
                    )))
                }
            };
            if packet.len() < header_len {
                return Err(DataPathError::Malformed("truncated data header".into()));
            }
            let (header, body) = packet.split_at(header_len);

            if header_len == 4 {
                let peer_id = u32::from_be_bytes([0, header[1], header[2], header[3]]);
                if self.peer_id != PEER_ID_DISABLED && peer_id != self.peer_id {
                    return Err(DataPathError::PeerIdMismatch(peer_id));
                }
            }

            let ad_header: &[u8] = if header_len > 1 { header } else { &[] };
            let (packet_id, payload) = self.crypto.open(ad_header, body)?;
            if !self.replay.check_and_update(packet_id) {
                debug!("Dropping replayed data packet {packet_id}");
                continue;
            }

            let Some(payload) = self.unframe_payload(payload)? else {
                continue;
            };
            if payload == PING_STRING {
                debug!("Received ping");
                continue;
            }
            out.push(Bytes::from(payload));
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn set_outbound_packet_id(&mut self, id: u32) {
        self.outbound_packet_id = id;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{Cipher, CryptoProvider, DataChannelKeys, Digest, NativeCryptoProvider};

    fn pair(
        cipher: Cipher,
        peer_id: Option<u32>,
        framing: CompressionFraming,
    ) -> (DataPath, DataPath) {
        let block: Vec<u8> = (0..=255u8).rev().collect();
        let keys = DataChannelKeys::from_key_block(&block).unwrap();
        let client = NativeCryptoProvider
            .data_channel(cipher, Digest::Sha1, &keys)
            .unwrap();
        let server = NativeCryptoProvider
            .data_channel(cipher, Digest::Sha1, &keys.mirrored())
            .unwrap();
        (
            DataPath::new(client, 1, peer_id, framing),
            DataPath::new(server, 1, peer_id, framing),
        )
    }

    fn packets() -> Vec<Bytes> {
        vec![
            Bytes::from_static(b"\x45\x00first ip packet"),
            Bytes::from_static(b"\x45\x00second"),
            Bytes::from_static(b"x"),
        ]
    }

    #[test]
    fn test_round_trip_all_modes() {
        for cipher in [Cipher::Aes128Cbc, Cipher::Aes256Gcm] {
            for peer_id in [None, Some(0x6438_5837)] {
                for framing in [
                    CompressionFraming::Disabled,
                    CompressionFraming::CompLzo,
                    CompressionFraming::Compress,
                ] {
                    let (mut client, mut server) = pair(cipher, peer_id, framing);
                    let mut wire = Vec::new();
                    client.encrypt_packets(&packets(), &mut wire).unwrap();
                    assert_eq!(wire.len(), 3);

                    let mut plain = Vec::new();
                    server.decrypt_packets(&wire, &mut plain).unwrap();
                    assert_eq!(plain, packets(), "{cipher} {peer_id:?} {framing:?}");
                }
            }
        }
    }

    #[test]
    fn test_peer_id_header() {
        let (mut client, _) = pair(Cipher::Aes128Gcm, Some(0x6438_5837), CompressionFraming::Disabled);
        assert_eq!(client.peer_id(), Some(0x38_5837));

        let mut wire = Vec::new();
        client.encrypt_packets(&packets()[..1], &mut wire).unwrap();
        assert_eq!(wire[0][0], PacketCode::DataV2.header(1));
        assert_eq!(&wire[0][1..4], &[0x38, 0x58, 0x37]);

        let (mut v1, _) = pair(Cipher::Aes128Gcm, None, CompressionFraming::Disabled);
        assert_eq!(v1.peer_id(), None);
        wire.clear();
        v1.encrypt_packets(&packets()[..1], &mut wire).unwrap();
        assert_eq!(wire[0][0], PacketCode::DataV1.header(1));
    }

    #[test]
    fn test_peer_id_mismatch() {
        let (mut client, mut server) =
            pair(Cipher::Aes128Gcm, Some(7), CompressionFraming::Disabled);
        server.set_peer_id(Some(8));
        let mut wire = Vec::new();
        client.encrypt_packets(&packets(), &mut wire).unwrap();
        let mut plain = Vec::new();
        assert_eq!(
            server.decrypt_packets(&wire, &mut plain),
            Err(DataPathError::PeerIdMismatch(7))
        );
    }

    #[test]
    fn test_compress_swap_framing() {
        let (client, _) = pair(Cipher::Aes128Gcm, None, CompressionFraming::Compress);
        assert_eq!(client.frame_payload(b"abc"), vec![0xFB, b'b', b'c', b'a']);
        assert_eq!(client.frame_payload(b""), vec![0xFA]);
        assert_eq!(
            client.unframe_payload(vec![0xFB, b'b', b'c', b'a']).unwrap(),
            Some(b"abc".to_vec())
        );
        assert_eq!(client.unframe_payload(vec![0x66, 1, 2]).unwrap(), None);
        assert!(client.unframe_payload(vec![0x10]).is_err());

        let (lzo, _) = pair(Cipher::Aes128Gcm, None, CompressionFraming::CompLzo);
        assert_eq!(lzo.frame_payload(b"abc"), vec![0xFA, b'a', b'b', b'c']);
    }

    #[test]
    fn test_replays_and_pings_are_dropped() {
        let (mut client, mut server) =
            pair(Cipher::Aes256Cbc, None, CompressionFraming::CompLzo);
        let mut wire = Vec::new();
        client
            .encrypt_packets(&[Bytes::from_static(&PING_STRING)], &mut wire)
            .unwrap();
        client.encrypt_packets(&packets()[..1], &mut wire).unwrap();

        let mut plain = Vec::new();
        server.decrypt_packets(&wire, &mut plain).unwrap();
        assert_eq!(plain, packets()[..1].to_vec());

        // Same frames again are replays
        plain.clear();
        server.decrypt_packets(&wire, &mut plain).unwrap();
        assert!(plain.is_empty());
    }

    #[test]
    fn test_partial_batch_failure_keeps_processed_packets() {
        let (mut client, mut server) =
            pair(Cipher::Aes128Gcm, None, CompressionFraming::Disabled);
        let mut wire = Vec::new();
        client.encrypt_packets(&packets(), &mut wire).unwrap();
        let mut corrupted = wire[1].to_vec();
        let last = corrupted.len() - 1;
        corrupted[last] ^= 0xFF;
        wire[1] = Bytes::from(corrupted);

        let mut plain = Vec::new();
        assert_eq!(
            server.decrypt_packets(&wire, &mut plain),
            Err(DataPathError::Integrity)
        );
        assert_eq!(plain, packets()[..1].to_vec());
    }

    #[test]
    fn test_overflow() {
        let (mut client, _) = pair(Cipher::Aes128Gcm, None, CompressionFraming::Disabled);
        client.set_outbound_packet_id(MAX_PACKET_ID - 1);
        let mut wire = Vec::new();
        assert_eq!(
            client.encrypt_packets(&packets(), &mut wire),
            Err(DataPathError::Overflow)
        );
        assert_eq!(wire.len(), 1);
    }

    #[test]
    fn test_replay_window() {
        let mut window = ReplayWindow::default();
        assert!(!window.check_and_update(0));
        assert!(window.check_and_update(1));
        assert!(window.check_and_update(3));
        assert!(window.check_and_update(2));
        assert!(!window.check_and_update(2));
        assert!(window.check_and_update(100));
        assert!(!window.check_and_update(3));
        assert!(window.check_and_update(40));
        assert!(!window.check_and_update(40));
    }
}

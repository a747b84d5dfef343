//! Reliable control channel: fragmentation, retransmission, reordering and
//! acknowledgement of control packets

use super::constants::{INBOUND_WINDOW, RETRANSMISSION_LIMIT, SESSION_ID_LENGTH};
use super::packets::{take_session_id, ControlPacket};
use super::{PacketCode, SessionId};
use crate::crypto::native::aes256_ctr;
use crate::crypto::{Digest, KeyDirection, StaticKey, TlsWrap, TlsWrapStrategy};
use crate::error::{Result, SessionError, VpnError};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use log::{debug, trace};
use std::collections::BTreeSet;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// A value kept separately for each direction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BidirectionalState<T: Clone> {
    pub inbound: T,
    pub outbound: T,
    reset_value: T,
}

impl<T: Clone> BidirectionalState<T> {
    pub fn new(value: T) -> Self {
        Self {
            inbound: value.clone(),
            outbound: value.clone(),
            reset_value: value,
        }
    }

    /// Restore both directions to the initial value
    pub fn reset(&mut self) {
        self.inbound = self.reset_value.clone();
        self.outbound = self.reset_value.clone();
    }

    pub fn pair(&self) -> (T, T) {
        (self.inbound.clone(), self.outbound.clone())
    }
}

/// Wire encoding of control packets
pub trait ControlChannelSerializer: Send {
    fn reset(&mut self);

    fn serialize(&mut self, packet: &ControlPacket) -> Result<Bytes>;

    fn deserialize(&mut self, data: &[u8]) -> Result<ControlPacket>;
}

/// Control packets without static key protection
#[derive(Debug, Default)]
pub struct PlainSerializer;

impl ControlChannelSerializer for PlainSerializer {
    fn reset(&mut self) {}

    fn serialize(&mut self, packet: &ControlPacket) -> Result<Bytes> {
        packet.serialize()
    }

    fn deserialize(&mut self, data: &[u8]) -> Result<ControlPacket> {
        ControlPacket::deserialize(data)
    }
}

fn unix_time() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u32::try_from(d.as_secs()).unwrap_or(u32::MAX))
        .unwrap_or(0)
}

fn split_header(data: &[u8], extra: usize) -> Result<(PacketCode, u8, SessionId, &[u8])> {
    if data.len() < 1 + SESSION_ID_LENGTH + extra {
        return Err(VpnError::Framing("Wrapped control packet truncated".into()));
    }
    let mut buf = data;
    let (code, key) = PacketCode::parse_header(buf.get_u8())?;
    let session_id = take_session_id(&mut buf);
    Ok((code, key, session_id, buf))
}

/// HMAC-authenticated control packets (`tls-auth`)
pub struct AuthSerializer {
    digest: Digest,
    send_key: Vec<u8>,
    receive_key: Vec<u8>,
    replay_id: u32,
}

impl AuthSerializer {
    pub fn new(key: &StaticKey, digest: Digest) -> Self {
        let len = digest.output_len();
        Self {
            digest,
            send_key: key.hmac_send_key()[..len].to_vec(),
            receive_key: key.hmac_receive_key()[..len].to_vec(),
            replay_id: 0,
        }
    }
}

impl ControlChannelSerializer for AuthSerializer {
    fn reset(&mut self) {
        self.replay_id = 0;
    }

    fn serialize(&mut self, packet: &ControlPacket) -> Result<Bytes> {
        let mut body = BytesMut::new();
        packet.put_body(&mut body)?;
        self.replay_id = self.replay_id.wrapping_add(1);

        let mut replay = [0u8; 8];
        replay[..4].copy_from_slice(&self.replay_id.to_be_bytes());
        replay[4..].copy_from_slice(&unix_time().to_be_bytes());
        let header = [packet.code.header(packet.key)];

        let mac = self.digest.hmac(
            &self.send_key,
            &[&replay, &header, &packet.session_id, &body],
        )?;

        let mut out = BytesMut::with_capacity(1 + SESSION_ID_LENGTH + mac.len() + 8 + body.len());
        out.put_slice(&header);
        out.put_slice(&packet.session_id);
        out.put_slice(&mac);
        out.put_slice(&replay);
        out.put_slice(&body);
        Ok(out.freeze())
    }

    fn deserialize(&mut self, data: &[u8]) -> Result<ControlPacket> {
        let mac_len = self.digest.output_len();
        let (code, key, session_id, rest) = split_header(data, mac_len + 8)?;
        let (mac, rest) = rest.split_at(mac_len);
        let (replay, body) = rest.split_at(8);

        if !self.digest.verify(
            &self.receive_key,
            &[replay, &data[..1], &session_id, body],
            mac,
        ) {
            return Err(VpnError::Framing("tls-auth HMAC mismatch".into()));
        }
        ControlPacket::deserialize_body(code, key, session_id, body)
    }
}

const CRYPT_TAG_LENGTH: usize = 32;
const CRYPT_KEY_LENGTH: usize = 32;

/// Authenticated and encrypted control packets (`tls-crypt`)
pub struct CryptSerializer {
    encrypt_key: Vec<u8>,
    decrypt_key: Vec<u8>,
    send_key: Vec<u8>,
    receive_key: Vec<u8>,
    replay_id: u32,
}

impl CryptSerializer {
    /// Keys are always used in the client direction
    pub fn new(key: &StaticKey) -> Self {
        let key = key.with_direction(Some(KeyDirection::Client));
        Self {
            encrypt_key: key.cipher_encrypt_key()[..CRYPT_KEY_LENGTH].to_vec(),
            decrypt_key: key.cipher_decrypt_key()[..CRYPT_KEY_LENGTH].to_vec(),
            send_key: key.hmac_send_key()[..CRYPT_TAG_LENGTH].to_vec(),
            receive_key: key.hmac_receive_key()[..CRYPT_TAG_LENGTH].to_vec(),
            replay_id: 0,
        }
    }
}

impl ControlChannelSerializer for CryptSerializer {
    fn reset(&mut self) {
        self.replay_id = 0;
    }

    fn serialize(&mut self, packet: &ControlPacket) -> Result<Bytes> {
        let mut body = BytesMut::new();
        packet.put_body(&mut body)?;
        self.replay_id = self.replay_id.wrapping_add(1);

        let mut header = BytesMut::with_capacity(1 + SESSION_ID_LENGTH + 8);
        packet.put_header(&mut header);
        header.put_u32(self.replay_id);
        header.put_u32(unix_time());

        let tag = Digest::Sha256.hmac(&self.send_key, &[&header, &body])?;
        let mut encrypted = body.to_vec();
        aes256_ctr(&self.encrypt_key, &tag, &mut encrypted)?;

        let mut out = BytesMut::with_capacity(header.len() + tag.len() + encrypted.len());
        out.put_slice(&header);
        out.put_slice(&tag);
        out.put_slice(&encrypted);
        Ok(out.freeze())
    }

    fn deserialize(&mut self, data: &[u8]) -> Result<ControlPacket> {
        let (code, key, session_id, rest) = split_header(data, 8 + CRYPT_TAG_LENGTH)?;
        let header_len = data.len() - rest.len() + 8;
        let header = &data[..header_len];
        let tag = &data[header_len..header_len + CRYPT_TAG_LENGTH];

        let mut body = data[header_len + CRYPT_TAG_LENGTH..].to_vec();
        aes256_ctr(&self.decrypt_key, tag, &mut body)?;
        if !Digest::Sha256.verify(&self.receive_key, &[header, &body], tag) {
            return Err(VpnError::Framing("tls-crypt tag mismatch".into()));
        }
        ControlPacket::deserialize_body(code, key, session_id, &body)
    }
}

/// Reliability layer of the control channel
pub struct ControlChannel {
    serializer: Box<dyn ControlChannelSerializer>,
    session_id: Option<SessionId>,
    remote_session_id: Option<SessionId>,
    queue: BidirectionalState<Vec<ControlPacket>>,
    current_packet_id: BidirectionalState<u32>,
    pending_acks: BTreeSet<u32>,
    data_count: BidirectionalState<u64>,
}

impl Default for ControlChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl ControlChannel {
    /// Channel with plain control packets
    pub fn new() -> Self {
        Self::with_serializer(Box::new(PlainSerializer))
    }

    pub fn with_serializer(serializer: Box<dyn ControlChannelSerializer>) -> Self {
        Self {
            serializer,
            session_id: None,
            remote_session_id: None,
            queue: BidirectionalState::new(Vec::new()),
            current_packet_id: BidirectionalState::new(0),
            pending_acks: BTreeSet::new(),
            data_count: BidirectionalState::new(0),
        }
    }

    /// Channel protected according to the configured TLS wrapping
    pub fn with_tls_wrap(wrap: Option<&TlsWrap>, digest: Digest) -> Self {
        match wrap {
            None => Self::new(),
            Some(TlsWrap {
                strategy: TlsWrapStrategy::Auth,
                key,
            }) => Self::with_serializer(Box::new(AuthSerializer::new(key, digest))),
            Some(TlsWrap {
                strategy: TlsWrapStrategy::Crypt,
                key,
            }) => Self::with_serializer(Box::new(CryptSerializer::new(key))),
        }
    }

    pub fn session_id(&self) -> Option<SessionId> {
        self.session_id
    }

    pub fn remote_session_id(&self) -> Option<SessionId> {
        self.remote_session_id
    }

    pub fn set_remote_session_id(&mut self, id: SessionId) {
        self.remote_session_id = Some(id);
    }

    /// Clear queues and counters; a new session also gets a fresh session id
    pub fn reset(&mut self, for_new_session: bool) {
        if for_new_session {
            self.session_id = Some(rand::random());
            self.remote_session_id = None;
            self.serializer.reset();
        }
        self.queue.reset();
        self.current_packet_id.reset();
        self.pending_acks.clear();
        self.data_count.reset();
    }

    /// Decode one packet received from the link
    pub fn read_inbound_packet(&mut self, data: &[u8]) -> Result<ControlPacket> {
        let packet = self.serializer.deserialize(data)?;
        trace!(
            "Control: received {:?} key {} id {}",
            packet.code,
            packet.key,
            packet.packet_id
        );
        Ok(packet)
    }

    /// Whether `packet_id` fits the receive window; ids already delivered do
    pub fn accepts_inbound(&self, packet_id: u32) -> bool {
        packet_id.saturating_sub(self.current_packet_id.inbound) < INBOUND_WINDOW
    }

    /// Buffer an inbound packet, returning the packets now deliverable in order
    pub fn enqueue_inbound(&mut self, packet: ControlPacket) -> Vec<ControlPacket> {
        if !self.accepts_inbound(packet.packet_id) {
            debug!(
                "Control: dropping packet {} beyond the receive window (expected {})",
                packet.packet_id, self.current_packet_id.inbound
            );
            return Vec::new();
        }
        if self
            .queue
            .inbound
            .iter()
            .any(|p| p.packet_id == packet.packet_id)
        {
            debug!("Control: dropping duplicate packet {}", packet.packet_id);
            return Vec::new();
        }
        self.queue.inbound.push(packet);
        self.queue.inbound.sort_by_key(|p| p.packet_id);

        let mut delivered = Vec::new();
        while let Some(first) = self.queue.inbound.first() {
            if first.packet_id < self.current_packet_id.inbound {
                debug!("Control: dropping duplicate packet {}", first.packet_id);
                self.queue.inbound.remove(0);
            } else if first.packet_id == self.current_packet_id.inbound {
                delivered.push(self.queue.inbound.remove(0));
                self.current_packet_id.inbound += 1;
            } else {
                break;
            }
        }
        delivered
    }

    /// Split `payload` into fragments of at most `max_fragment` bytes and queue them
    ///
    /// # Panics
    ///
    /// Panics if called before [`ControlChannel::reset`] created a session id.
    pub fn enqueue_outbound(
        &mut self,
        code: PacketCode,
        key: u8,
        payload: &[u8],
        max_fragment: usize,
    ) -> usize {
        let Some(session_id) = self.session_id else {
            panic!("control packets enqueued before the session id was set");
        };
        let max_fragment = max_fragment.max(1);

        let fragments: Vec<&[u8]> = if payload.is_empty() {
            vec![payload]
        } else {
            payload.chunks(max_fragment).collect()
        };
        for fragment in &fragments {
            let packet = ControlPacket::new(
                code,
                key,
                session_id,
                self.current_packet_id.outbound,
                Some(Bytes::copy_from_slice(fragment)),
            );
            self.current_packet_id.outbound += 1;
            self.queue.outbound.push(packet);
        }
        debug!(
            "Control: enqueued {} fragment(s) of {:?} ({} bytes)",
            fragments.len(),
            code,
            payload.len()
        );
        fragments.len()
    }

    /// Serialize queued packets that were never sent or whose ack is overdue
    pub fn writable_packets(&mut self, now: Instant) -> Result<Vec<Bytes>> {
        let mut out = Vec::new();
        for packet in self.queue.outbound.iter_mut() {
            if let Some(sent_at) = packet.sent_at {
                if now.saturating_duration_since(sent_at) < RETRANSMISSION_LIMIT {
                    continue;
                }
                trace!("Control: retransmitting packet {}", packet.packet_id);
            }
            packet.sent_at = Some(now);
            self.pending_acks.insert(packet.packet_id);
            out.push(self.serializer.serialize(packet)?);
        }
        Ok(out)
    }

    pub fn has_pending_acks(&self) -> bool {
        !self.pending_acks.is_empty()
    }

    /// Drop acknowledged packets from the outbound queue
    pub fn read_acks(&mut self, ids: &[u32], acked_session_id: SessionId) -> Result<()> {
        if self.session_id != Some(acked_session_id) {
            return Err(SessionError::SessionMismatch.into());
        }
        self.queue.outbound.retain(|p| !ids.contains(&p.packet_id));
        for id in ids {
            self.pending_acks.remove(id);
        }
        Ok(())
    }

    /// Serialize an ack for one received packet
    pub fn write_ack(
        &mut self,
        key: u8,
        packet_id: u32,
        remote_session_id: SessionId,
    ) -> Result<Bytes> {
        let session_id = self.session_id.ok_or(SessionError::MissingSessionId)?;
        let ack = ControlPacket::ack(key, session_id, vec![packet_id], remote_session_id);
        self.serializer.serialize(&ack)
    }

    pub fn add_received_data_count(&mut self, count: usize) {
        self.data_count.inbound += count as u64;
    }

    pub fn add_sent_data_count(&mut self, count: usize) {
        self.data_count.outbound += count as u64;
    }

    /// Bytes (received, sent) since the last reset
    pub fn current_data_count(&self) -> (u64, u64) {
        self.data_count.pair()
    }

    /// Packets waiting for an ack or first transmission
    pub fn outbound_len(&self) -> usize {
        self.queue.outbound.len()
    }

    /// Next packet id expected from the peer
    pub fn expected_inbound_packet_id(&self) -> u32 {
        self.current_packet_id.inbound
    }

    /// Packet id the next outbound fragment will carry
    pub fn next_outbound_packet_id(&self) -> u32 {
        self.current_packet_id.outbound
    }
}

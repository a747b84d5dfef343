//! Control packet model and its plain wire encoding

use super::constants::{PACKET_ID_LENGTH, SESSION_ID_LENGTH};
use super::{PacketCode, SessionId};
use crate::error::{Result, VpnError};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::time::Instant;

/// One fragment of a control-channel message, or a bare ack
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlPacket {
    pub code: PacketCode,
    pub key: u8,
    pub session_id: SessionId,
    /// Unused (zero) for [`PacketCode::AckV1`]
    pub packet_id: u32,
    pub payload: Option<Bytes>,
    pub ack_ids: Vec<u32>,
    pub ack_remote_session_id: Option<SessionId>,
    /// Last transmission time, `None` until first sent
    pub sent_at: Option<Instant>,
}

impl ControlPacket {
    /// Create a packet carrying (part of) a control message
    pub fn new(
        code: PacketCode,
        key: u8,
        session_id: SessionId,
        packet_id: u32,
        payload: Option<Bytes>,
    ) -> Self {
        Self {
            code,
            key,
            session_id,
            packet_id,
            payload: payload.filter(|p| !p.is_empty()),
            ack_ids: Vec::new(),
            ack_remote_session_id: None,
            sent_at: None,
        }
    }

    /// Create an ack-only packet
    pub fn ack(key: u8, session_id: SessionId, ack_ids: Vec<u32>, remote: SessionId) -> Self {
        Self {
            code: PacketCode::AckV1,
            key,
            session_id,
            packet_id: 0,
            payload: None,
            ack_ids,
            ack_remote_session_id: Some(remote),
            sent_at: None,
        }
    }

    pub fn is_ack(&self) -> bool {
        self.code == PacketCode::AckV1
    }

    pub fn payload_len(&self) -> usize {
        self.payload.as_ref().map_or(0, Bytes::len)
    }

    /// Serialize the header byte and session id
    pub(crate) fn put_header(&self, buf: &mut BytesMut) {
        buf.put_u8(self.code.header(self.key));
        buf.put_slice(&self.session_id);
    }

    /// Serialize everything after the session id: acks, packet id, payload
    pub(crate) fn put_body(&self, buf: &mut BytesMut) -> Result<()> {
        let count = u8::try_from(self.ack_ids.len())
            .map_err(|_| VpnError::Framing("Too many acks in one packet".into()))?;
        buf.put_u8(count);
        for id in &self.ack_ids {
            buf.put_u32(*id);
        }
        if count > 0 {
            let remote = self
                .ack_remote_session_id
                .ok_or_else(|| VpnError::Framing("Acks without remote session id".into()))?;
            buf.put_slice(&remote);
        }
        if !self.is_ack() {
            buf.put_u32(self.packet_id);
            if let Some(payload) = &self.payload {
                buf.put_slice(payload);
            }
        }
        Ok(())
    }

    /// Serialize to the plain wire layout
    pub fn serialize(&self) -> Result<Bytes> {
        let mut buf = BytesMut::with_capacity(self.wire_len());
        self.put_header(&mut buf);
        self.put_body(&mut buf)?;
        Ok(buf.freeze())
    }

    /// Deserialize a plain wire packet
    pub fn deserialize(data: &[u8]) -> Result<Self> {
        let mut buf = data;
        need(buf, 1 + SESSION_ID_LENGTH, "header")?;
        let (code, key) = PacketCode::parse_header(buf.get_u8())?;
        let session_id = take_session_id(&mut buf);
        Self::deserialize_body(code, key, session_id, buf)
    }

    /// Parse the body that follows the header byte and session id
    pub(crate) fn deserialize_body(
        code: PacketCode,
        key: u8,
        session_id: SessionId,
        mut buf: &[u8],
    ) -> Result<Self> {
        if code.is_data() {
            return Err(VpnError::Framing(format!(
                "Data opcode {code:?} in control packet"
            )));
        }

        need(buf, 1, "ack count")?;
        let count = usize::from(buf.get_u8());
        need(buf, count * 4, "ack ids")?;
        let ack_ids: Vec<u32> = (0..count).map(|_| buf.get_u32()).collect();
        let ack_remote_session_id = if count > 0 {
            need(buf, SESSION_ID_LENGTH, "acked session id")?;
            Some(take_session_id(&mut buf))
        } else {
            None
        };

        let (packet_id, payload) = if code == PacketCode::AckV1 {
            (0, None)
        } else {
            need(buf, PACKET_ID_LENGTH, "packet id")?;
            let packet_id = buf.get_u32();
            let payload = (!buf.is_empty()).then(|| Bytes::copy_from_slice(buf));
            (packet_id, payload)
        };

        Ok(Self {
            code,
            key,
            session_id,
            packet_id,
            payload,
            ack_ids,
            ack_remote_session_id,
            sent_at: None,
        })
    }

    /// Plain wire size of this packet
    pub fn wire_len(&self) -> usize {
        let mut len = 1 + SESSION_ID_LENGTH + 1 + self.ack_ids.len() * 4;
        if !self.ack_ids.is_empty() {
            len += SESSION_ID_LENGTH;
        }
        if !self.is_ack() {
            len += PACKET_ID_LENGTH + self.payload_len();
        }
        len
    }
}

fn need(buf: &[u8], len: usize, field: &str) -> Result<()> {
    if buf.len() < len {
        return Err(VpnError::Framing(format!("Packet truncated at {field}")));
    }
    Ok(())
}

pub(crate) fn take_session_id(buf: &mut &[u8]) -> SessionId {
    let mut id = [0u8; SESSION_ID_LENGTH];
    buf.copy_to_slice(&mut id);
    id
}

#[cfg(test)]
mod tests {
    use super::*;

    const SID: SessionId = [1, 2, 3, 4, 5, 6, 7, 8];
    const REMOTE: SessionId = [9, 9, 9, 9, 9, 9, 9, 9];

    #[test]
    fn test_control_packet_serialization() {
        let packet = ControlPacket::new(
            PacketCode::ControlV1,
            2,
            SID,
            7,
            Some(Bytes::from_static(b"tls bytes")),
        );
        let wire = packet.serialize().unwrap();
        assert_eq!(wire[0], (0x04 << 3) | 2);
        assert_eq!(&wire[1..9], &SID);
        assert_eq!(wire[9], 0);
        assert_eq!(&wire[10..14], &7u32.to_be_bytes());
        assert_eq!(&wire[14..], b"tls bytes");
        assert_eq!(wire.len(), packet.wire_len());

        assert_eq!(ControlPacket::deserialize(&wire).unwrap(), packet);
    }

    #[test]
    fn test_packet_with_acks_round_trip() {
        let mut packet = ControlPacket::new(PacketCode::HardResetServerV2, 0, SID, 0, None);
        packet.ack_ids = vec![0, 1];
        packet.ack_remote_session_id = Some(REMOTE);
        let wire = packet.serialize().unwrap();
        assert_eq!(wire.len(), 1 + 8 + 1 + 8 + 8 + 4);
        assert_eq!(ControlPacket::deserialize(&wire).unwrap(), packet);
    }

    #[test]
    fn test_ack_packet_has_no_packet_id() {
        let ack = ControlPacket::ack(1, SID, vec![42], REMOTE);
        let wire = ack.serialize().unwrap();
        assert_eq!(wire.len(), 1 + 8 + 1 + 4 + 8);
        let parsed = ControlPacket::deserialize(&wire).unwrap();
        assert!(parsed.is_ack());
        assert_eq!(parsed.payload, None);
        assert_eq!(parsed, ack);
    }

    #[test]
    fn test_truncated_packets_are_rejected() {
        let mut packet = ControlPacket::new(
            PacketCode::ControlV1,
            0,
            SID,
            3,
            Some(Bytes::from_static(b"x")),
        );
        packet.ack_ids = vec![5];
        packet.ack_remote_session_id = Some(REMOTE);
        let wire = packet.serialize().unwrap();

        // Every cut before the packet id must fail cleanly
        for cut in 0..wire.len() - 1 - 4 {
            assert!(ControlPacket::deserialize(&wire[..cut]).is_err(), "cut {cut}");
        }
        // Cutting only the payload leaves a valid empty packet
        let shorter = ControlPacket::deserialize(&wire[..wire.len() - 1]).unwrap();
        assert_eq!(shorter.payload, None);
    }

    #[test]
    fn test_unknown_and_data_opcodes_are_rejected() {
        let mut wire = vec![0x1F << 3];
        wire.extend_from_slice(&SID);
        wire.push(0);
        wire.extend_from_slice(&[0, 0, 0, 0]);
        assert!(ControlPacket::deserialize(&wire).is_err());

        wire[0] = PacketCode::DataV1.header(0);
        assert!(ControlPacket::deserialize(&wire).is_err());
    }

    #[test]
    fn test_empty_payload_is_normalized() {
        let packet = ControlPacket::new(
            PacketCode::HardResetClientV2,
            0,
            SID,
            0,
            Some(Bytes::new()),
        );
        assert_eq!(packet.payload, None);
        let parsed = ControlPacket::deserialize(&packet.serialize().unwrap()).unwrap();
        assert_eq!(parsed, packet);
    }
}

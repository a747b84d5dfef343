// Stream framing for OpenVPN over TCP
// Every packet is prefixed with its length as a big-endian u16.

use crate::error::{Result, VpnError};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Length prefix size
pub const HEADER_SIZE: usize = 2;

/// Largest packet a 2-byte prefix can describe
pub const MAX_PACKET_SIZE: usize = u16::MAX as usize;

/// StreamFramer - frames outbound packets and re-assembles inbound ones
pub struct StreamFramer {
    buffer: BytesMut,
    // Stats for debugging
    sent_packets: u64,
    received_packets: u64,
    errors: u64,
}

impl Default for StreamFramer {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamFramer {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(4096),
            sent_packets: 0,
            received_packets: 0,
            errors: 0,
        }
    }

    /// Frame a packet for sending over the stream
    pub fn frame_packet(&mut self, data: &[u8], out: &mut BytesMut) -> Result<()> {
        if data.len() > MAX_PACKET_SIZE {
            self.errors += 1;
            return Err(VpnError::Framing(format!(
                "Packet too large for stream framing: {} bytes",
                data.len()
            )));
        }
        out.reserve(HEADER_SIZE + data.len());
        out.put_u16(data.len() as u16);
        out.put_slice(data);
        self.sent_packets += 1;
        Ok(())
    }

    /// Frame a batch of packets into one contiguous write
    pub fn frame_packets(&mut self, packets: &[Bytes]) -> Result<Bytes> {
        let mut out = BytesMut::with_capacity(packets.iter().map(|p| p.len() + HEADER_SIZE).sum());
        for packet in packets {
            self.frame_packet(packet, &mut out)?;
        }
        Ok(out.freeze())
    }

    /// Append bytes read from the stream and return the packets now complete
    pub fn decode_packets(&mut self, data: &[u8]) -> Vec<Bytes> {
        self.buffer.extend_from_slice(data);

        let mut packets = Vec::new();
        while self.buffer.len() >= HEADER_SIZE {
            let length = u16::from_be_bytes([self.buffer[0], self.buffer[1]]) as usize;
            if self.buffer.len() < HEADER_SIZE + length {
                break;
            }
            self.buffer.advance(HEADER_SIZE);
            packets.push(self.buffer.split_to(length).freeze());
        }
        self.received_packets += packets.len() as u64;
        packets
    }

    /// Bytes held back waiting for the rest of a packet
    pub fn pending_len(&self) -> usize {
        self.buffer.len()
    }

    /// Get current statistics
    pub fn get_stats(&self) -> (u64, u64, u64) {
        (self.sent_packets, self.received_packets, self.errors)
    }
}

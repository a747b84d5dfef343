//! OpenVPN wire protocol: opcodes, control packets, control channel and
//! key-method-2 authentication

use crate::error::{Result, VpnError};
use std::time::Duration;

pub mod auth;
pub mod control;
pub mod packets;
pub mod session;

pub use control::{BidirectionalState, ControlChannel};
pub use packets::ControlPacket;

// Protocol constants
pub mod constants {
    use std::time::Duration;

    /// Length of a session id on the wire
    pub const SESSION_ID_LENGTH: usize = 8;

    /// Length of a packet id on the wire
    pub const PACKET_ID_LENGTH: usize = 4;

    /// Number of key slots (key ids are 3 bits)
    pub const KEY_COUNT: u8 = 8;

    /// Peer id value meaning "no peer id"
    pub const PEER_ID_DISABLED: u32 = 0x00FF_FFFF;

    /// Default OpenVPN port
    pub const DEFAULT_PORT: u16 = 1194;

    /// Keep-alive marker sent through the data channel
    pub const PING_STRING: [u8; 16] = [
        0x2a, 0x18, 0x7b, 0xf3, 0x64, 0x1e, 0xb4, 0xcb, 0x07, 0xed, 0x2d, 0x0a, 0x98, 0x1f, 0xc7,
        0x48,
    ];

    /// Interval between timer checks
    pub const TICK_INTERVAL: Duration = Duration::from_millis(200);

    /// Inbound control packets further than this ahead of the expected id are dropped
    pub const INBOUND_WINDOW: u32 = 64;

    /// Unacknowledged control packets are resent after this long
    pub const RETRANSMISSION_LIMIT: Duration = Duration::from_millis(100);

    /// Interval between PUSH_REQUEST messages while waiting for PUSH_REPLY
    pub const PUSH_REQUEST_INTERVAL: Duration = Duration::from_secs(1);

    /// Delay before the first PUSH_REQUEST of a soft reset
    pub const SOFT_RESET_DELAY: Duration = Duration::from_secs(5);

    /// Time allowed for a key to reach the connected state
    pub const NEGOTIATION_TIMEOUT: Duration = Duration::from_secs(30);

    /// Time allowed for the server to answer a hard reset
    pub const HARD_RESET_TIMEOUT: Duration = Duration::from_secs(10);

    /// Default inbound silence tolerated before reconnecting
    pub const PING_TIMEOUT: Duration = Duration::from_secs(120);
}

/// Random identifier of one side of a session
pub type SessionId = [u8; constants::SESSION_ID_LENGTH];

/// OpenVPN opcode, the high five bits of the first packet byte
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketCode {
    SoftResetV1 = 0x03,
    ControlV1 = 0x04,
    AckV1 = 0x05,
    DataV1 = 0x06,
    HardResetClientV2 = 0x07,
    HardResetServerV2 = 0x08,
    DataV2 = 0x09,
}

impl TryFrom<u8> for PacketCode {
    type Error = VpnError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x03 => Ok(PacketCode::SoftResetV1),
            0x04 => Ok(PacketCode::ControlV1),
            0x05 => Ok(PacketCode::AckV1),
            0x06 => Ok(PacketCode::DataV1),
            0x07 => Ok(PacketCode::HardResetClientV2),
            0x08 => Ok(PacketCode::HardResetServerV2),
            0x09 => Ok(PacketCode::DataV2),
            _ => Err(VpnError::Framing(format!("Unknown opcode: {value:#x}"))),
        }
    }
}

impl PacketCode {
    /// True for the two data-channel opcodes
    pub fn is_data(self) -> bool {
        matches!(self, PacketCode::DataV1 | PacketCode::DataV2)
    }

    /// Pack this opcode with a key id into a header byte
    pub fn header(self, key: u8) -> u8 {
        ((self as u8) << 3) | (key & 0x07)
    }

    /// Split a header byte into opcode and key id
    pub fn parse_header(byte: u8) -> Result<(Self, u8)> {
        Ok((Self::try_from(byte >> 3)?, byte & 0x07))
    }
}

/// Seconds as a duration, treating zero as "not set"
pub(crate) fn seconds(value: u64) -> Option<Duration> {
    (value > 0).then(|| Duration::from_secs(value))
}

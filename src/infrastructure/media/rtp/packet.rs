//! RTP Packet Implementation (RFC 3550)

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;
use thiserror::Error;

/// RTP Packet Structure
///
/// ```text
///  0                   1                   2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |V=2|P|X|  CC   |M|     PT      |       sequence number         |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                           timestamp                           |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |           synchronization source (SSRC) identifier            |
/// +=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+
/// ```
///
/// Outgoing packets never carry CSRCs, extensions or padding. Incoming
/// packets may; those parts are skipped on parse.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpPacket {
    /// Marker bit, set on the first packet of a talkspurt
    pub marker: bool,
    pub payload_type: u8,
    pub sequence: u16,
    pub timestamp: u32,
    /// Synchronization source identifier
    pub ssrc: u32,
    pub payload: Bytes,
}

impl RtpPacket {
    /// Fixed RTP header size
    pub const HEADER_SIZE: usize = 12;

    pub const VERSION: u8 = 2;

    /// Create a new RTP packet
    pub fn new(payload_type: u8, sequence: u16, timestamp: u32, ssrc: u32, payload: Bytes) -> Self {
        Self {
            marker: false,
            payload_type,
            sequence,
            timestamp,
            ssrc,
            payload,
        }
    }

    /// Parse RTP packet from bytes
    pub fn parse(data: &[u8]) -> Result<Self, RtpError> {
        if data.len() < Self::HEADER_SIZE {
            return Err(RtpError::PacketTooShort(data.len()));
        }

        let mut buf = data;

        // Byte 0: V(2), P(1), X(1), CC(4)
        let byte0 = buf.get_u8();
        let version = byte0 >> 6;
        if version != Self::VERSION {
            return Err(RtpError::InvalidVersion(version));
        }
        let padding = byte0 & 0x20 != 0;
        let extension = byte0 & 0x10 != 0;
        let csrc_count = (byte0 & 0x0F) as usize;

        // Byte 1: M(1), PT(7)
        let byte1 = buf.get_u8();
        let marker = byte1 & 0x80 != 0;
        let payload_type = byte1 & 0x7F;

        let sequence = buf.get_u16();
        let timestamp = buf.get_u32();
        let ssrc = buf.get_u32();

        if buf.remaining() < csrc_count * 4 {
            return Err(RtpError::PacketTooShort(data.len()));
        }
        buf.advance(csrc_count * 4);

        if extension {
            if buf.remaining() < 4 {
                return Err(RtpError::PacketTooShort(data.len()));
            }
            let _profile = buf.get_u16();
            let length = buf.get_u16() as usize * 4;
            if buf.remaining() < length {
                return Err(RtpError::PacketTooShort(data.len()));
            }
            buf.advance(length);
        }

        let mut payload_len = buf.remaining();
        if padding {
            let padding_len = buf.last().copied().unwrap_or(0) as usize;
            if padding_len == 0 || padding_len > payload_len {
                return Err(RtpError::InvalidPadding);
            }
            payload_len -= padding_len;
        }

        Ok(Self {
            marker,
            payload_type,
            sequence,
            timestamp,
            ssrc,
            payload: Bytes::copy_from_slice(&buf[..payload_len]),
        })
    }

    /// Serialize RTP packet to bytes
    pub fn serialize(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::HEADER_SIZE + self.payload.len());

        buf.put_u8(Self::VERSION << 6);
        buf.put_u8(((self.marker as u8) << 7) | (self.payload_type & 0x7F));
        buf.put_u16(self.sequence);
        buf.put_u32(self.timestamp);
        buf.put_u32(self.ssrc);
        buf.put_slice(&self.payload);

        buf.freeze()
    }
}

impl fmt::Display for RtpPacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "RTP(PT={}, seq={}, ts={}, ssrc={:08x}, {} bytes)",
            self.payload_type,
            self.sequence,
            self.timestamp,
            self.ssrc,
            self.payload.len()
        )
    }
}

/// RTP Errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RtpError {
    #[error("Packet too short: {0} bytes")]
    PacketTooShort(usize),

    #[error("Invalid RTP version: {0}")]
    InvalidVersion(u8),

    #[error("Invalid padding")]
    InvalidPadding,

    #[error("Unknown payload type: {0}")]
    UnknownPayloadType(u8),
}

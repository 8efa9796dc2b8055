//! RTP stream context
//!
//! Per-call packetization state: SSRC, outbound sequence and timestamp
//! counters, the selected codec and its transcoders.

use super::packet::{RtpError, RtpPacket};
use crate::infrastructure::media::codec::{Codec, CodecError, Transcoder};
use rand::Rng;
use std::collections::HashMap;
use std::net::SocketAddr;
use thiserror::Error;
use tracing::debug;

/// Payload type conventionally used for RFC 4733 telephone events
pub const TELEPHONE_EVENT_PAYLOAD_TYPE: u8 = 101;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MediaError {
    #[error(transparent)]
    Rtp(#[from] RtpError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("Media transport error: {0}")]
    Transport(String),
}

/// RTP Statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RtpStats {
    pub packets_sent: u64,
    pub packets_received: u64,
    pub packets_dropped: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

/// Send and receive state for one call's audio stream
pub struct RtpStreamContext {
    remote: SocketAddr,
    codec: Codec,
    payload_type: u8,
    ssrc: u32,
    sequence: u16,
    timestamp: u32,
    first_packet: bool,
    encoder: Box<dyn Transcoder>,
    decoders: HashMap<u8, Box<dyn Transcoder>>,
    stats: RtpStats,
}

impl RtpStreamContext {
    /// Create a context with a random SSRC, sequence and timestamp base (RFC 3550 §5.1)
    pub fn new(remote: SocketAddr, codec: Codec, payload_type: u8) -> Self {
        let mut rng = rand::thread_rng();
        Self::with_counters(remote, codec, payload_type, rng.gen(), rng.gen(), rng.gen())
    }

    /// Create with explicit starting counters
    pub fn with_counters(
        remote: SocketAddr,
        codec: Codec,
        payload_type: u8,
        ssrc: u32,
        sequence: u16,
        timestamp: u32,
    ) -> Self {
        let mut decoders = HashMap::new();
        decoders.insert(payload_type, codec.transcoder());

        Self {
            remote,
            codec,
            payload_type,
            ssrc,
            sequence,
            timestamp,
            first_packet: true,
            encoder: codec.transcoder(),
            decoders,
            stats: RtpStats::default(),
        }
    }

    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    pub fn codec(&self) -> Codec {
        self.codec
    }

    pub fn payload_type(&self) -> u8 {
        self.payload_type
    }

    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }

    /// Sequence number the next packet will carry
    pub fn next_sequence(&self) -> u16 {
        self.sequence
    }

    /// Timestamp the next packet will carry
    pub fn next_timestamp(&self) -> u32 {
        self.timestamp
    }

    pub fn stats(&self) -> &RtpStats {
        &self.stats
    }

    /// Encode one PCM frame and wrap it in the next RTP packet.
    ///
    /// Counters only advance when encoding succeeds.
    pub fn packetize(&mut self, pcm: &[i16]) -> Result<RtpPacket, CodecError> {
        let payload = self.encoder.encode(pcm)?;

        let mut packet = RtpPacket::new(
            self.payload_type,
            self.sequence,
            self.timestamp,
            self.ssrc,
            payload,
        );
        packet.marker = self.first_packet;
        self.first_packet = false;

        self.sequence = self.sequence.wrapping_add(1);
        self.timestamp = self
            .timestamp
            .wrapping_add(self.codec.timestamp_increment());

        self.stats.packets_sent += 1;
        self.stats.bytes_sent += packet.payload.len() as u64;

        Ok(packet)
    }

    /// Parse a datagram and decode its payload with the transcoder for its payload type
    pub fn depacketize(&mut self, datagram: &[u8]) -> Result<Vec<i16>, MediaError> {
        let packet = match RtpPacket::parse(datagram) {
            Ok(packet) => packet,
            Err(e) => {
                self.stats.packets_dropped += 1;
                return Err(e.into());
            }
        };

        let decoder = match self.decoders.entry(packet.payload_type) {
            std::collections::hash_map::Entry::Occupied(entry) => entry.into_mut(),
            std::collections::hash_map::Entry::Vacant(entry) => {
                match Codec::from_payload_type(packet.payload_type) {
                    Some(codec) => {
                        debug!(
                            "Remote switched payload type to {} ({})",
                            packet.payload_type, codec
                        );
                        entry.insert(codec.transcoder())
                    }
                    None => {
                        self.stats.packets_dropped += 1;
                        return Err(RtpError::UnknownPayloadType(packet.payload_type).into());
                    }
                }
            }
        };

        let pcm = decoder.decode(&packet.payload);
        self.stats.packets_received += 1;
        self.stats.bytes_received += packet.payload.len() as u64;
        Ok(pcm)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn remote() -> SocketAddr {
        "127.0.0.1:40000".parse().unwrap()
    }

    #[test]
    fn test_counters_advance_per_frame() {
        let mut ctx = RtpStreamContext::with_counters(remote(), Codec::Pcmu, 0, 7, 100, 1000);

        let first = ctx.packetize(&[0i16; 160]).unwrap();
        let second = ctx.packetize(&[0i16; 160]).unwrap();

        assert_eq!(first.sequence, 100);
        assert_eq!(second.sequence, 101);
        assert_eq!(first.timestamp, 1000);
        assert_eq!(second.timestamp, 1160);
        assert_eq!(first.ssrc, 7);
        assert!(first.marker);
        assert!(!second.marker);
        assert_eq!(ctx.stats().packets_sent, 2);
    }

    #[test]
    fn test_sequence_and_timestamp_wrap() {
        let mut ctx =
            RtpStreamContext::with_counters(remote(), Codec::Pcma, 8, 1, 65535, u32::MAX - 100);

        let before = ctx.packetize(&[0i16; 160]).unwrap();
        let after = ctx.packetize(&[0i16; 160]).unwrap();

        assert_eq!(before.sequence, 65535);
        assert_eq!(after.sequence, 0);
        assert_eq!(after.timestamp, 59);
    }

    #[test]
    fn test_failed_encode_does_not_advance() {
        let mut ctx = RtpStreamContext::with_counters(remote(), Codec::Pcmu, 0, 1, 10, 0);

        assert!(ctx.packetize(&[0i16; 80]).is_err());
        assert_eq!(ctx.next_sequence(), 10);
        assert_eq!(ctx.next_timestamp(), 0);
    }

    #[test]
    fn test_g722_timestamp_uses_rtp_clock() {
        let mut ctx = RtpStreamContext::with_counters(remote(), Codec::G722, 9, 1, 0, 0);

        let packet = ctx.packetize(&[0i16; 320]).unwrap();
        assert_eq!(packet.payload.len(), 160);
        assert_eq!(ctx.next_timestamp(), 160);
    }

    #[test]
    fn test_depacketize_by_payload_type() {
        let mut sender = RtpStreamContext::with_counters(remote(), Codec::Pcma, 8, 1, 0, 0);
        let mut receiver = RtpStreamContext::with_counters(remote(), Codec::Pcmu, 0, 2, 0, 0);

        let packet = sender.packetize(&[1000i16; 160]).unwrap();
        let pcm = receiver.depacketize(&packet.serialize()).unwrap();

        assert_eq!(pcm.len(), 160);
        assert!((pcm[0] - 1000).abs() < 64);
        assert_eq!(receiver.stats().packets_received, 1);
    }

    #[test]
    fn test_depacketize_drops_unknown_payload() {
        let mut ctx = RtpStreamContext::with_counters(remote(), Codec::Pcmu, 0, 1, 0, 0);
        let packet = RtpPacket::new(TELEPHONE_EVENT_PAYLOAD_TYPE, 1, 0, 9, bytes::Bytes::from_static(&[0; 4]));

        let err = ctx.depacketize(&packet.serialize()).unwrap_err();
        assert_eq!(err, MediaError::Rtp(RtpError::UnknownPayloadType(101)));
        assert_eq!(ctx.stats().packets_dropped, 1);

        assert!(ctx.depacketize(&[0x80, 0x00]).is_err());
        assert_eq!(ctx.stats().packets_dropped, 2);
    }
}

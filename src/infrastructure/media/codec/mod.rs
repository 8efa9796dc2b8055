//! Audio Codec Implementations
//!
//! Every codec is reached through the [`Transcoder`] trait; the RTP layer
//! picks the implementation from the negotiated payload type.

pub mod g711;
pub mod g722;
pub mod negotiator;

pub use g711::{G711Type, PcmaCodec, PcmuCodec};
pub use g722::{G722Decoder, G722Encoder};
pub use negotiator::{CodecInfo, CodecNegotiator};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Frame duration used for every codec
pub const FRAME_DURATION_MS: u32 = 20;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("Frame size mismatch: expected {expected} samples, got {actual}")]
    FrameSize { expected: usize, actual: usize },

    #[error("Unsupported payload type: {0}")]
    UnsupportedPayloadType(u8),
}

/// Audio codecs this agent can offer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Codec {
    /// G.711 μ-law
    Pcmu,
    /// G.711 A-law
    Pcma,
    /// G.722 wideband
    G722,
}

impl Codec {
    /// All codecs in default preference order
    pub const ALL: [Codec; 3] = [Codec::Pcmu, Codec::Pcma, Codec::G722];

    /// Static RTP payload type (RFC 3551)
    pub fn payload_type(&self) -> u8 {
        match self {
            Codec::Pcmu => 0,
            Codec::Pcma => 8,
            Codec::G722 => 9,
        }
    }

    /// Encoding name as used in `a=rtpmap`
    pub fn name(&self) -> &'static str {
        match self {
            Codec::Pcmu => "PCMU",
            Codec::Pcma => "PCMA",
            Codec::G722 => "G722",
        }
    }

    /// Audio sample rate of the PCM side
    pub fn sample_rate(&self) -> u32 {
        match self {
            Codec::Pcmu | Codec::Pcma => 8000,
            Codec::G722 => 16000,
        }
    }

    /// RTP clock rate. G.722 keeps an 8 kHz clock for historical reasons (RFC 3551 §4.5.2).
    pub fn clock_rate(&self) -> u32 {
        8000
    }

    /// Bit rate of the encoded stream
    pub fn bitrate(&self) -> u32 {
        64000
    }

    /// PCM samples in one 20 ms frame
    pub fn samples_per_frame(&self) -> usize {
        (self.sample_rate() * FRAME_DURATION_MS / 1000) as usize
    }

    /// RTP timestamp advance for one frame
    pub fn timestamp_increment(&self) -> u32 {
        self.clock_rate() * FRAME_DURATION_MS / 1000
    }

    /// Look up a codec by its static payload type
    pub fn from_payload_type(payload_type: u8) -> Option<Codec> {
        match payload_type {
            0 => Some(Codec::Pcmu),
            8 => Some(Codec::Pcma),
            9 => Some(Codec::G722),
            _ => None,
        }
    }

    /// Look up a codec by rtpmap encoding name (case-insensitive)
    pub fn from_name(name: &str) -> Option<Codec> {
        Codec::ALL
            .into_iter()
            .find(|c| c.name().eq_ignore_ascii_case(name))
    }

    /// Create a fresh stateful transcoder for this codec
    pub fn transcoder(&self) -> Box<dyn Transcoder> {
        match self {
            Codec::Pcmu => Box::new(G711Transcoder::new(G711Type::PCMU)),
            Codec::Pcma => Box::new(G711Transcoder::new(G711Type::PCMA)),
            Codec::G722 => Box::new(G722Transcoder::new()),
        }
    }
}

impl fmt::Display for Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Converts between 16-bit PCM frames and encoded payloads.
///
/// Implementations may carry state across frames; one instance serves one
/// direction of one stream.
pub trait Transcoder: Send {
    fn codec(&self) -> Codec;

    /// Encode exactly one frame of PCM
    fn encode(&mut self, pcm: &[i16]) -> Result<Bytes, CodecError>;

    /// Decode one payload into PCM
    fn decode(&mut self, payload: &[u8]) -> Vec<i16>;
}

fn check_frame(codec: Codec, pcm: &[i16]) -> Result<(), CodecError> {
    let expected = codec.samples_per_frame();
    if pcm.len() != expected {
        return Err(CodecError::FrameSize {
            expected,
            actual: pcm.len(),
        });
    }
    Ok(())
}

/// G.711 strategy (stateless)
pub struct G711Transcoder {
    kind: G711Type,
}

impl G711Transcoder {
    pub fn new(kind: G711Type) -> Self {
        Self { kind }
    }
}

impl Transcoder for G711Transcoder {
    fn codec(&self) -> Codec {
        match self.kind {
            G711Type::PCMU => Codec::Pcmu,
            G711Type::PCMA => Codec::Pcma,
        }
    }

    fn encode(&mut self, pcm: &[i16]) -> Result<Bytes, CodecError> {
        check_frame(self.codec(), pcm)?;
        Ok(match self.kind {
            G711Type::PCMU => PcmuCodec::encode(pcm),
            G711Type::PCMA => PcmaCodec::encode(pcm),
        })
    }

    fn decode(&mut self, payload: &[u8]) -> Vec<i16> {
        match self.kind {
            G711Type::PCMU => PcmuCodec::decode(payload),
            G711Type::PCMA => PcmaCodec::decode(payload),
        }
    }
}

/// G.722 strategy. Encoder and decoder state persist for the life of the stream.
pub struct G722Transcoder {
    encoder: G722Encoder,
    decoder: G722Decoder,
}

impl G722Transcoder {
    pub fn new() -> Self {
        Self {
            encoder: G722Encoder::new(),
            decoder: G722Decoder::new(),
        }
    }
}

impl Default for G722Transcoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Transcoder for G722Transcoder {
    fn codec(&self) -> Codec {
        Codec::G722
    }

    fn encode(&mut self, pcm: &[i16]) -> Result<Bytes, CodecError> {
        check_frame(Codec::G722, pcm)?;
        Ok(self.encoder.encode(pcm))
    }

    fn decode(&mut self, payload: &[u8]) -> Vec<i16> {
        self.decoder.decode(payload)
    }
}

//! Codec Negotiation
//!
//! Picks the codec for a call from the remote's offered list. The remote's
//! order wins: the first offered codec we support is selected.

use super::Codec;

/// One payload format as described by the remote `m=` / `a=rtpmap` lines
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodecInfo {
    pub payload_type: u8,
    pub name: String,
    pub clock_rate: u32,
    pub channels: u8,
}

impl CodecInfo {
    pub fn new(payload_type: u8, name: String, clock_rate: u32) -> Self {
        Self {
            payload_type,
            name,
            clock_rate,
            channels: 1,
        }
    }

    /// Describe a codec by its static payload type, when the remote sent no rtpmap
    pub fn from_static(payload_type: u8) -> Option<Self> {
        Codec::from_payload_type(payload_type)
            .map(|c| Self::new(payload_type, c.name().to_string(), c.clock_rate()))
    }

    /// Get encoding name for rtpmap
    pub fn encoding(&self) -> String {
        format!("{}/{}", self.name, self.clock_rate)
    }

    /// The local codec this format maps to, if any
    pub fn codec(&self) -> Option<Codec> {
        Codec::from_name(&self.name).filter(|c| c.clock_rate() == self.clock_rate)
    }
}

/// Outcome of a successful negotiation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NegotiatedCodec {
    pub codec: Codec,
    /// Payload type number the remote uses for it
    pub payload_type: u8,
}

/// Codec Negotiator
#[derive(Debug, Clone)]
pub struct CodecNegotiator {
    supported_codecs: Vec<Codec>,
}

impl CodecNegotiator {
    pub fn new(supported_codecs: Vec<Codec>) -> Self {
        Self { supported_codecs }
    }

    /// Codecs we offer, in local preference order
    pub fn supported(&self) -> &[Codec] {
        &self.supported_codecs
    }

    pub fn supports(&self, codec: Codec) -> bool {
        self.supported_codecs.contains(&codec)
    }

    /// Negotiate codecs based on offer
    ///
    /// Returns every offered codec we also support, in the remote's order
    pub fn negotiate(&self, offered: &[CodecInfo]) -> Vec<NegotiatedCodec> {
        offered
            .iter()
            .filter_map(|info| {
                info.codec()
                    .filter(|c| self.supports(*c))
                    .map(|codec| NegotiatedCodec {
                        codec,
                        payload_type: info.payload_type,
                    })
            })
            .collect()
    }

    /// Select the codec for the call
    pub fn select_best(&self, offered: &[CodecInfo]) -> Option<NegotiatedCodec> {
        self.negotiate(offered).into_iter().next()
    }

    /// Get all supported payload types
    pub fn supported_payload_types(&self) -> Vec<u8> {
        self.supported_codecs
            .iter()
            .map(|c| c.payload_type())
            .collect()
    }
}

impl Default for CodecNegotiator {
    fn default() -> Self {
        Self::new(Codec::ALL.to_vec())
    }
}

//! G.711 Audio Codec Implementation
//!
//! G.711 is a narrowband audio codec that provides toll-quality audio at 64 kbit/s.
//! It includes two companding algorithms:
//! - μ-law (PCMU): Used primarily in North America and Japan
//! - A-law (PCMA): Used in Europe and rest of the world
//!
//! Both directions are computed bit-exactly against the ITU-T G.711 tables.

use bytes::{BufMut, Bytes, BytesMut};

/// G.711 Codec Type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum G711Type {
    /// μ-law (PCMU) - Payload Type 0
    PCMU,
    /// A-law (PCMA) - Payload Type 8
    PCMA,
}

impl G711Type {
    /// Get RTP payload type
    pub fn payload_type(&self) -> u8 {
        match self {
            G711Type::PCMU => 0,
            G711Type::PCMA => 8,
        }
    }

    /// Get clock rate (always 8000 Hz for G.711)
    pub fn clock_rate(&self) -> u32 {
        8000
    }

    /// Get codec name
    pub fn name(&self) -> &str {
        match self {
            G711Type::PCMU => "PCMU",
            G711Type::PCMA => "PCMA",
        }
    }
}

/// G.711 μ-law (PCMU) Codec
pub struct PcmuCodec;

impl PcmuCodec {
    const BIAS: i32 = 0x84;
    const CLIP: i32 = 32635;

    /// Compress one linear sample
    pub fn encode_sample(sample: i16) -> u8 {
        let sample = sample as i32;
        let sign: u8 = if sample < 0 { 0x80 } else { 0x00 };
        let magnitude = sample.abs().min(Self::CLIP) + Self::BIAS;

        let mut exponent: u8 = 7;
        while exponent > 0 && magnitude < (1 << (exponent + 7)) {
            exponent -= 1;
        }
        let mantissa = ((magnitude >> (exponent + 3)) & 0x0F) as u8;

        !(sign | (exponent << 4) | mantissa)
    }

    /// Expand one μ-law byte
    pub fn decode_sample(ulaw: u8) -> i16 {
        let byte = !ulaw;
        let sign = byte & 0x80;
        let exponent = ((byte >> 4) & 0x07) as i32;
        let mantissa = (byte & 0x0F) as i32;

        let magnitude = ((mantissa << 3) + Self::BIAS) << exponent;
        let linear = if sign != 0 { -magnitude } else { magnitude };
        linear.clamp(i16::MIN as i32, i16::MAX as i32) as i16
    }

    /// Encode PCM samples to μ-law
    pub fn encode(pcm: &[i16]) -> Bytes {
        let mut output = BytesMut::with_capacity(pcm.len());
        for &sample in pcm {
            output.put_u8(Self::encode_sample(sample));
        }
        output.freeze()
    }

    /// Decode μ-law to PCM samples
    pub fn decode(ulaw: &[u8]) -> Vec<i16> {
        ulaw.iter().map(|&byte| Self::decode_sample(byte)).collect()
    }
}

/// G.711 A-law (PCMA) Codec
pub struct PcmaCodec;

impl PcmaCodec {
    /// Upper bound of each segment, on the 13-bit magnitude
    const SEGMENT_END: [i32; 8] = [0x1F, 0x3F, 0x7F, 0xFF, 0x1FF, 0x3FF, 0x7FF, 0xFFF];

    /// Compress one linear sample
    pub fn encode_sample(sample: i16) -> u8 {
        let mut value = (sample as i32) >> 3;
        let mask: u8 = if value >= 0 {
            0xD5
        } else {
            value = -value - 1;
            0x55
        };

        let segment = Self::SEGMENT_END
            .iter()
            .position(|&end| value <= end)
            .unwrap_or(Self::SEGMENT_END.len());

        if segment >= Self::SEGMENT_END.len() {
            return 0x7F ^ mask;
        }

        let quant = if segment < 2 {
            (value >> 1) & 0x0F
        } else {
            (value >> segment) & 0x0F
        };
        (((segment as u8) << 4) | quant as u8) ^ mask
    }

    /// Expand one A-law byte
    pub fn decode_sample(alaw: u8) -> i16 {
        let byte = alaw ^ 0x55;
        let mut magnitude = ((byte & 0x0F) as i32) << 4;
        let segment = ((byte & 0x70) >> 4) as i32;

        match segment {
            0 => magnitude += 8,
            1 => magnitude += 0x108,
            _ => {
                magnitude += 0x108;
                magnitude <<= segment - 1;
            }
        }

        if byte & 0x80 != 0 {
            magnitude as i16
        } else {
            -magnitude as i16
        }
    }

    /// Encode PCM samples to A-law
    pub fn encode(pcm: &[i16]) -> Bytes {
        let mut output = BytesMut::with_capacity(pcm.len());
        for &sample in pcm {
            output.put_u8(Self::encode_sample(sample));
        }
        output.freeze()
    }

    /// Decode A-law to PCM samples
    pub fn decode(alaw: &[u8]) -> Vec<i16> {
        alaw.iter().map(|&byte| Self::decode_sample(byte)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_g711_type_payload() {
        assert_eq!(G711Type::PCMU.payload_type(), 0);
        assert_eq!(G711Type::PCMA.payload_type(), 8);
        assert_eq!(G711Type::PCMA.clock_rate(), 8000);
    }

    #[test]
    fn test_pcmu_reference_bytes() {
        assert_eq!(PcmuCodec::encode_sample(0), 0xFF);
        assert_eq!(PcmuCodec::encode_sample(1), 0xFF);
        assert_eq!(PcmuCodec::encode_sample(-1), 0x7F);
        assert_eq!(PcmuCodec::encode_sample(32767), 0x80);
        assert_eq!(PcmuCodec::encode_sample(32635), 0x80);
        assert_eq!(PcmuCodec::encode_sample(-32635), 0x00);
        assert_eq!(PcmuCodec::encode_sample(-32768), 0x00);
        assert_eq!(PcmuCodec::encode_sample(1000), 0xCE);
        assert_eq!(PcmuCodec::encode_sample(-1000), 0x4E);
    }

    #[test]
    fn test_pcmu_reference_expansion() {
        // ((mantissa << 3) + 0x84) << exponent, bias left in
        assert_eq!(PcmuCodec::decode_sample(0xFF), 132);
        assert_eq!(PcmuCodec::decode_sample(0x7F), -132);
        assert_eq!(PcmuCodec::decode_sample(0x80), 32256);
        assert_eq!(PcmuCodec::decode_sample(0x00), -32256);
        assert_eq!(PcmuCodec::decode_sample(0xCE), 1120);
        assert_eq!(PcmuCodec::decode_sample(0xF0), 252);
    }

    #[test]
    fn test_pcmu_encode_decode() {
        let original: Vec<i16> = vec![0, 1000, -1000, 5000, -5000, 10000, -10000];
        let encoded = PcmuCodec::encode(&original);
        let decoded = PcmuCodec::decode(&encoded);

        // Lossy, but within one quantization step
        assert_eq!(original.len(), decoded.len());
        for (orig, dec) in original.iter().zip(decoded.iter()) {
            let diff = (orig - dec).abs();
            assert!(diff < 500, "Difference too large: {} vs {}", orig, dec);
        }
    }

    #[test]
    fn test_pcmu_every_code_is_a_fixed_point() {
        // Expansion keeps the bias; taking it off and compressing again must
        // give the same code back (0x7F is negative zero and compresses to 0xFF)
        for byte in 0u8..=255 {
            if byte == 0x7F {
                continue;
            }
            let linear = PcmuCodec::decode_sample(byte) as i32;
            let unbiased = linear.signum() * (linear.abs() - 0x84);
            assert_eq!(
                PcmuCodec::encode_sample(unbiased as i16),
                byte,
                "code {:#04x}",
                byte
            );
        }
    }

    #[test]
    fn test_pcma_reference_bytes() {
        assert_eq!(PcmaCodec::encode_sample(0), 0xD5);
        assert_eq!(PcmaCodec::encode_sample(-1), 0x55);
        assert_eq!(PcmaCodec::encode_sample(32767), 0xAA);
        assert_eq!(PcmaCodec::encode_sample(-32768), 0x2A);

        assert_eq!(PcmaCodec::decode_sample(0xD5), 8);
        assert_eq!(PcmaCodec::decode_sample(0x55), -8);
        assert_eq!(PcmaCodec::decode_sample(0xAA), 32256);
        assert_eq!(PcmaCodec::decode_sample(0x2A), -32256);
    }

    #[test]
    fn test_pcma_encode_decode() {
        let original: Vec<i16> = vec![0, 5000, -5000, 10000, -10000, 20000, -20000];
        let encoded = PcmaCodec::encode(&original);
        let decoded = PcmaCodec::decode(&encoded);

        assert_eq!(original.len(), decoded.len());
        assert!(decoded[0].abs() < 500, "Silence decode error");

        for i in 1..original.len() {
            let orig = original[i];
            let dec = decoded[i];
            assert_eq!(orig.signum(), dec.signum(), "Sign mismatch at sample {}", i);

            let ratio = dec.abs() as f64 / orig.abs() as f64;
            assert!(
                ratio > 0.9 && ratio < 1.1,
                "Sample {}: {} -> {} (ratio: {})",
                i,
                orig,
                dec,
                ratio
            );
        }
    }

    #[test]
    fn test_pcmu_silence() {
        let silence: Vec<i16> = vec![0; 160]; // 20ms at 8kHz
        let encoded = PcmuCodec::encode(&silence);
        assert_eq!(encoded.len(), 160);
        assert!(encoded.iter().all(|&b| b == 0xFF));
        assert!(PcmuCodec::decode(&encoded).iter().all(|&s| s == 132));
    }
}

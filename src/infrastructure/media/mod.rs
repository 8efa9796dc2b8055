//! Media processing: codecs, RTP and the media engine

pub mod codec;
pub mod rtp;
pub mod stream;

pub use codec::{Codec, CodecError, CodecNegotiator, Transcoder};
pub use rtp::{MediaError, RtpError, RtpPacket, RtpStreamContext};
pub use stream::{AudioCallback, MediaEngine, StreamInfo, INBOUND_QUEUE_CAPACITY};

//! Infrastructure layer - Technical implementations
//!
//! This layer contains:
//! - SIP signaling (message codec, digest auth, transactions, UDP transport)
//! - Media processing (codecs, RTP, the media engine)

pub mod media;
pub mod protocols;

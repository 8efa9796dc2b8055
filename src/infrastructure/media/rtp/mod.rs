//! RTP (Real-time Transport Protocol) Implementation
//!
//! This module implements the parts of RFC 3550 a single audio stream needs.

pub mod packet;
pub mod session;

pub use packet::{RtpError, RtpPacket};
pub use session::{MediaError, RtpStats, RtpStreamContext, TELEPHONE_EVENT_PAYLOAD_TYPE};

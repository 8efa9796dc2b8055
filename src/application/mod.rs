//! Application layer - the user agent
//!
//! [`UserAgentCore`] holds the signaling state and decides what to send;
//! [`SipClient`] owns the sockets and background tasks and performs those
//! decisions.

pub mod client;
pub mod core;
pub mod error;

pub use self::core::{Action, UserAgentCore};
pub use client::{CallStatus, SipClient};
pub use error::{Result, SipClientError};

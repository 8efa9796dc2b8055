//! SIP protocol implementation
//!
//! The user-agent side of RFC 3261 over UDP:
//! ```text
//! ┌─────────────────────────┐
//! │   Application Layer     │
//! │   (UserAgentCore)       │
//! └───────────┬─────────────┘
//!             │
//! ┌───────────▼─────────────┐
//! │   Transaction Store     │
//! │  (retry / timeout)      │
//! └───────────┬─────────────┘
//!             │
//! ┌───────────▼─────────────┐
//! │   Transport Layer       │
//! │        (UDP)            │
//! └─────────────────────────┘
//! ```

pub mod auth;
pub mod builder;
pub mod message;
pub mod sdp;
pub mod transaction;
pub mod transport;

pub use auth::{AuthChallenge, AuthError, ChallengeOrigin, DigestAlgorithm};
pub use builder::{build_request, RequestHeaders, ResponseBuilder, ALLOWED_METHODS};
pub use message::{parse_message, MessageKind, ParsedMessage, SipError, SipMethod};
pub use sdp::{
    generate_answer, generate_session_description, parse_session_description, NegotiatedMedia,
    SdpSession, SDP_CONTENT_TYPE,
};
pub use transaction::{
    generate_branch, CorrelationId, RequestTemplate, RetryPolicy, SweepAction, Transaction,
    TransactionKind, TransactionStore,
};
pub use transport::{IncomingMessage, OutgoingMessage, Transport, UdpTransport};

//! Client-level error type

use crate::domain::shared::DomainError;
use crate::infrastructure::media::{CodecError, MediaError, RtpError};
use crate::infrastructure::protocols::sip::{AuthError, SipError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SipClientError {
    #[error(transparent)]
    Sip(#[from] SipError),

    #[error("Authentication error: {0}")]
    Auth(#[from] AuthError),

    #[error("RTP error: {0}")]
    Rtp(#[from] RtpError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Media error: {0}")]
    Media(#[from] MediaError),

    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),
}

pub type Result<T> = std::result::Result<T, SipClientError>;

//! Configuration management
//!
//! Settings come from an optional file (format picked by extension) with
//! `SIMPLESIP_*` environment variables layered on top. Nested keys use a
//! double underscore, e.g. `SIMPLESIP_TIMERS__MAX_RETRIES=5`.

use crate::infrastructure::media::Codec;
use crate::infrastructure::protocols::sip::{RetryPolicy, SipError};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

pub const ENV_PREFIX: &str = "SIMPLESIP";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ClientConfig {
    pub username: String,
    pub password: String,
    /// Registrar host name or IP
    pub server: String,
    pub server_port: u16,
    /// Advertised IP override; detected from the route to the server when unset
    pub local_address: Option<String>,
    pub local_port: u16,
    /// RTP port, 0 for ephemeral
    pub media_port: u16,
    pub user_agent: String,
    pub expires: u32,
    /// Codecs offered, in priority order
    pub codecs: Vec<Codec>,
    /// Offer every known codec plus telephone-event
    pub diagnostic_offer: bool,
    pub timers: TimerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TimerConfig {
    pub retry_interval_ms: u64,
    pub transaction_timeout_ms: u64,
    pub max_retries: u32,
    pub poll_interval_ms: u64,
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            retry_interval_ms: 2000,
            transaction_timeout_ms: 30000,
            max_retries: 3,
            poll_interval_ms: 1000,
        }
    }
}

impl TimerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            username: String::new(),
            password: String::new(),
            server: String::new(),
            server_port: 5060,
            local_address: None,
            local_port: 5060,
            media_port: 10000,
            user_agent: format!("simplesip/{}", env!("CARGO_PKG_VERSION")),
            expires: 3600,
            codecs: Codec::ALL.to_vec(),
            diagnostic_offer: false,
            timers: TimerConfig::default(),
        }
    }
}

impl ClientConfig {
    pub fn new(
        username: impl Into<String>,
        password: impl Into<String>,
        server: impl Into<String>,
    ) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            server: server.into(),
            ..Default::default()
        }
    }

    /// Load from an optional file, then the environment
    pub fn load(path: Option<&Path>) -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(false));
        }
        builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }

    pub fn validate(&self) -> Result<(), SipError> {
        if self.username.is_empty() {
            return Err(SipError::Encoding("username is empty".to_string()));
        }
        if self.server.is_empty() {
            return Err(SipError::Encoding("server is empty".to_string()));
        }
        if self.codecs.is_empty() {
            return Err(SipError::Encoding("no codecs configured".to_string()));
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            retry_interval: Duration::from_millis(self.timers.retry_interval_ms),
            transaction_timeout: Duration::from_millis(self.timers.transaction_timeout_ms),
            max_retries: self.timers.max_retries,
        }
    }
}

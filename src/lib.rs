//! simplesip - a SIP user agent SDK
//!
//! Registers with a SIP registrar, answers digest challenges, places and
//! receives calls and carries their audio over RTP with G.711 and G.722.
//! Applications hand in PCM frames and get decoded PCM back; everything in
//! between is handled here.
//!
//! ```no_run
//! use simplesip::{ClientConfig, SipClient};
//!
//! # async fn demo() -> simplesip::Result<()> {
//! let client = SipClient::connect(ClientConfig::new("1001", "secret", "pbx.example.com")).await?;
//! client.register().await?;
//! let _call_id = client.make_call("1002").await?;
//! client.send_audio(&[0i16; 160]).await?;
//! client.hangup().await?;
//! client.disconnect().await?;
//! # Ok(())
//! # }
//! ```

pub mod application;
pub mod config;
pub mod domain;
pub mod infrastructure;

// Re-export commonly used types
pub use application::{CallStatus, Result, SipClient, SipClientError};
pub use config::ClientConfig;
pub use domain::call::CallState;
pub use domain::shared::{ClientEvent, ClientNotification};
pub use infrastructure::media::{AudioCallback, Codec};

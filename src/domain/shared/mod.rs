//! Shared kernel - types used by the call domain and the application layer

pub mod error;
pub mod events;
pub mod result;

pub use error::DomainError;
pub use events::{ClientEvent, ClientNotification, DomainEvent, EventMetadata};
pub use result::Result;

//! Client events delivered to the embedding application

use crate::domain::call::CallState;
use crate::infrastructure::media::codec::Codec;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use uuid::Uuid;

/// Base trait for all domain events
pub trait DomainEvent: Send + Sync {
    /// Returns the event type name
    fn event_type(&self) -> &'static str;

    /// Returns when the event occurred
    fn occurred_at(&self) -> DateTime<Utc>;
}

/// Event metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventMetadata {
    pub event_id: Uuid,
    pub occurred_at: DateTime<Utc>,
    pub event_type: String,
}

impl EventMetadata {
    pub fn new(event_type: String) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            occurred_at: Utc::now(),
            event_type,
        }
    }
}

/// Something observable happened inside the user agent
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    StateChanged { from: CallState, to: CallState },
    Registered { expires: u32 },
    RegistrationFailed { reason: String },
    IncomingCall { call_id: String, from: String },
    MediaStarted { codec: Codec, remote: SocketAddr },
    CallFailed { call_id: String, reason: String },
    CallEnded { call_id: String },
    CapabilitiesReceived { allow: Vec<String> },
}

impl ClientEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ClientEvent::StateChanged { .. } => "state_changed",
            ClientEvent::Registered { .. } => "registered",
            ClientEvent::RegistrationFailed { .. } => "registration_failed",
            ClientEvent::IncomingCall { .. } => "incoming_call",
            ClientEvent::MediaStarted { .. } => "media_started",
            ClientEvent::CallFailed { .. } => "call_failed",
            ClientEvent::CallEnded { .. } => "call_ended",
            ClientEvent::CapabilitiesReceived { .. } => "capabilities_received",
        }
    }
}

/// A [`ClientEvent`] stamped with an id and a wall-clock time
#[derive(Debug, Clone)]
pub struct ClientNotification {
    pub metadata: EventMetadata,
    pub event: ClientEvent,
}

impl ClientNotification {
    pub fn new(event: ClientEvent) -> Self {
        Self {
            metadata: EventMetadata::new(event.name().to_string()),
            event,
        }
    }
}

impl DomainEvent for ClientNotification {
    fn event_type(&self) -> &'static str {
        self.event.name()
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        self.metadata.occurred_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_notification_carries_event_type() {
        let notification = ClientNotification::new(ClientEvent::CallEnded {
            call_id: "abc@127.0.0.1".to_string(),
        });

        assert_eq!(notification.event_type(), "call_ended");
        assert_eq!(notification.metadata.event_type, "call_ended");
    }
}

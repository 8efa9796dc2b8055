//! Call State Machine
//!
//! One state machine per user agent. It tracks both the registration
//! exchange and the single call the agent may hold at a time.
//!
//! ```text
//! idle --register--> registering --2xx--> idle
//! registering --challenge--> registering
//! registering --failure | timeout exhausted--> idle
//! idle --make_call--> calling --challenge--> calling
//! calling --180/183--> ringing --2xx--> connected
//! calling --2xx--> connected --first media frame--> streaming
//! idle --inbound INVITE--> ringing --answer--> connected
//! any call state --BYE | error | timeout exhausted | hangup--> terminating --release--> idle
//! ```

use crate::domain::shared::{DomainError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Instant;

/// Call State
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallState {
    /// Nothing in flight
    Idle,
    /// REGISTER sent, waiting for a final response
    Registering,
    /// INVITE sent, no provisional response yet
    Calling,
    /// 180/183 received, or an inbound INVITE waiting to be answered
    Ringing,
    /// 2xx exchanged and media negotiated
    Connected,
    /// At least one media frame has flowed
    Streaming,
    /// Call is being torn down
    Terminating,
}

impl CallState {
    /// Get state name
    pub fn name(&self) -> &'static str {
        match self {
            CallState::Idle => "idle",
            CallState::Registering => "registering",
            CallState::Calling => "calling",
            CallState::Ringing => "ringing",
            CallState::Connected => "connected",
            CallState::Streaming => "streaming",
            CallState::Terminating => "terminating",
        }
    }

    /// A call exists in this state (registration does not count)
    pub fn in_call(&self) -> bool {
        matches!(
            self,
            CallState::Calling | CallState::Ringing | CallState::Connected | CallState::Streaming
        )
    }

    /// Media may flow in this state
    pub fn media_allowed(&self) -> bool {
        matches!(self, CallState::Connected | CallState::Streaming)
    }
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Call State Machine Event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallEvent {
    /// REGISTER sent
    Register,
    /// 2xx to REGISTER
    Registered,
    /// REGISTER rejected or timed out
    RegistrationFailed,
    /// INVITE sent
    Dial,
    /// 401/407 received, request re-sent with credentials
    Challenge,
    /// 180/183 received
    Ringing,
    /// 2xx to our INVITE
    Answered,
    /// Inbound INVITE received while idle
    Incoming,
    /// Local answer to an inbound INVITE
    Accept,
    /// First media frame sent or received
    MediaFlowing,
    /// BYE or CANCEL received
    Bye,
    /// Local hangup
    Hangup,
    /// Final failure response or negotiation error
    Failure,
    /// Transaction retries exhausted
    Timeout,
    /// Call resources released
    Release,
}

/// Call Statistics
#[derive(Debug, Clone)]
pub struct CallStats {
    /// When the call was created
    pub created_at: Instant,
    /// When the call was answered (if applicable)
    pub answered_at: Option<Instant>,
    /// When the call ended (if applicable)
    pub ended_at: Option<Instant>,
    /// Number of provisional responses received
    pub provisional_count: u32,
}

impl CallStats {
    pub fn new() -> Self {
        Self {
            created_at: Instant::now(),
            answered_at: None,
            ended_at: None,
            provisional_count: 0,
        }
    }

    /// Get call setup duration (time from created to answered)
    pub fn setup_duration(&self) -> Option<std::time::Duration> {
        self.answered_at.map(|t| t.duration_since(self.created_at))
    }

    /// Time since the call was answered, up to its end if it has ended
    pub fn call_duration(&self) -> Option<std::time::Duration> {
        let answered = self.answered_at?;
        Some(self.ended_at.unwrap_or_else(Instant::now).duration_since(answered))
    }
}

impl Default for CallStats {
    fn default() -> Self {
        Self::new()
    }
}

/// State Machine
#[derive(Debug)]
pub struct CallStateMachine {
    state: CallState,
    stats: CallStats,
}

impl CallStateMachine {
    pub fn new() -> Self {
        Self {
            state: CallState::Idle,
            stats: CallStats::new(),
        }
    }

    /// Get current state
    pub fn state(&self) -> CallState {
        self.state
    }

    /// Get statistics for the current (or last) call
    pub fn stats(&self) -> &CallStats {
        &self.stats
    }

    /// Process an event and transition state.
    ///
    /// Returns the new state. Inputs that make no sense in the current
    /// state are rejected and leave the state untouched.
    pub fn process_event(&mut self, event: CallEvent) -> Result<CallState> {
        use CallEvent as E;
        use CallState as S;

        let new_state = match (self.state, event) {
            (S::Idle, E::Register) => S::Registering,
            (S::Registering, E::Challenge) => S::Registering,
            (S::Registering, E::Registered) => S::Idle,
            (S::Registering, E::RegistrationFailed) => S::Idle,
            (S::Registering, E::Timeout) => S::Idle,

            (S::Idle, E::Dial) => S::Calling,
            (S::Calling, E::Challenge) => S::Calling,
            (S::Calling, E::Ringing) => S::Ringing,
            (S::Ringing, E::Ringing) => S::Ringing,
            (S::Calling, E::Answered) | (S::Ringing, E::Answered) => S::Connected,

            (S::Idle, E::Incoming) => S::Ringing,
            (S::Ringing, E::Accept) => S::Connected,

            (S::Connected, E::MediaFlowing) => S::Streaming,

            (s, E::Bye | E::Hangup | E::Failure | E::Timeout) if s.in_call() => S::Terminating,

            (S::Terminating, E::Release) => S::Idle,

            (state, event) => {
                return Err(DomainError::InvalidStateTransition(format!(
                    "{} + {:?}",
                    state, event
                )))
            }
        };

        match event {
            E::Dial | E::Incoming => {
                self.stats = CallStats::new();
            }
            E::Ringing => {
                self.stats.provisional_count += 1;
            }
            E::Answered | E::Accept => {
                self.stats.answered_at = Some(Instant::now());
            }
            E::Bye | E::Hangup | E::Failure | E::Timeout if new_state == S::Terminating => {
                self.stats.ended_at = Some(Instant::now());
            }
            _ => {}
        }

        self.state = new_state;
        Ok(new_state)
    }

    /// Check if an inbound call can be answered
    pub fn can_answer(&self) -> bool {
        self.state == CallState::Ringing
    }
}

impl Default for CallStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

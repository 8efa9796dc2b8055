//! Call bounded context - the state machine and the dialog it drives

pub mod session;
pub mod state;

pub use session::{CallDirection, CallSession, MediaParameters};
pub use state::{CallEvent, CallState, CallStateMachine, CallStats};

//! Domain layer - call lifecycle rules and the events they produce
//!
//! This layer contains:
//! - The call state machine and the dialog session it drives
//! - Domain errors and the client events surfaced to applications

pub mod call;
pub mod shared;

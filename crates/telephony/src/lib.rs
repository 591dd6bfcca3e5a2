//! Call orchestration.
//!
//! Classifies joining participants (SIP vs web), places outbound SIP
//! calls through the control plane, enforces the concurrent-call
//! admission cap, and owns the active-calls map. The orchestrator is the
//! only writer of that map; everyone else observes through events.

mod classify;
mod control;
mod orchestrator;
mod rooms;

pub use classify::{
    CallType, Classification, ParticipantInfo, TelephonyAttributes, classify_participant,
    greeting_for,
};
pub use control::{
    testing::ScriptedControlPlane, HttpSipControlPlane, OutboundSipRequest, SipControlPlane,
    SipParticipantHandle,
};
pub use orchestrator::{
    ActiveCallView, CallOrchestrator, CallState, OrchestratorConfig, OutboundCallRequest,
    OutboundCallResult,
};
pub use rooms::{parse_room_name, room_name};

use thiserror::Error;

/// Telephony errors.
#[derive(Error, Debug)]
pub enum TelephonyError {
    #[error("invalid input: {0}")]
    Validation(String),

    #[error("concurrent call limit reached ({0})")]
    Admission(usize),

    #[error("call not found: {0}")]
    NotFound(String),

    #[error("control plane error: {0}")]
    ControlPlane(String),
}

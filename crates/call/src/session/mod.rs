//! Call session types and the negotiation coordinator

mod coordinator;

pub use coordinator::{CallCoordinator, CallHandle};

use serde::{Deserialize, Serialize};
use std::time::Instant;

use crate::signaling::protocol::CandidateInit;

/// Which side of the call this endpoint is.
///
/// Fixed at session creation; determines who originates the offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallRole {
    /// Initiated the call; originates the offer
    Caller,
    /// Accepted the call; originates the answer
    Callee,
}

/// One negotiation attempt between two users.
#[derive(Debug, Clone)]
pub struct CallSession {
    /// Opaque unique call identifier, created by the caller side
    pub call_id: String,

    /// Local user identifier, stable for the duration of the call
    pub local_user_id: String,

    /// Remote user identifier. May be empty for a callee joining by call
    /// ID only; learned from the first `user-joined`/`offer` sender.
    pub remote_user_id: String,

    /// Caller or callee
    pub role: CallRole,
}

impl CallSession {
    /// Caller-side session with a freshly generated call ID
    pub fn outgoing(local_user_id: &str, remote_user_id: &str) -> Self {
        Self {
            call_id: uuid::Uuid::new_v4().to_string(),
            local_user_id: local_user_id.to_string(),
            remote_user_id: remote_user_id.to_string(),
            role: CallRole::Caller,
        }
    }

    /// Callee-side session joining an existing call ID
    pub fn incoming(call_id: &str, local_user_id: &str) -> Self {
        Self {
            call_id: call_id.to_string(),
            local_user_id: local_user_id.to_string(),
            remote_user_id: String::new(),
            role: CallRole::Callee,
        }
    }
}

/// Negotiation phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// No call in progress
    Idle,
    /// Acquiring local media
    AwaitingMedia,
    /// Joined the relay, waiting for the remote peer
    AwaitingPeerJoin,
    /// Caller: offer created and sent
    OfferSent,
    /// Callee: answer created and sent
    AnswerSent,
    /// Descriptions exchanged, transport connecting
    Connecting,
    /// Media flowing
    Active,
    /// Teardown in progress
    Ending,
    /// Terminal failure
    Failed,
}

impl Phase {
    /// Whether the call has reached a terminal state
    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Idle | Phase::Failed)
    }
}

/// Mutable negotiation state, exclusively owned by the coordinator.
#[derive(Debug)]
pub struct NegotiationState {
    /// Current phase
    pub phase: Phase,

    /// Guard against duplicate offer creation (duplicate `user-joined`
    /// deliveries are a real race)
    pub offer_sent: bool,

    /// Guard against duplicate answer creation
    pub answer_sent: bool,

    /// Candidates received before a remote description existed, in
    /// receipt order; replayed once and then cleared
    pub pending_remote_candidates: Vec<CandidateInit>,

    /// Set once on first transition into `Active`; cancels the
    /// connection watchdog exactly once
    pub connection_established_at: Option<Instant>,
}

impl NegotiationState {
    pub fn new() -> Self {
        Self {
            phase: Phase::Idle,
            offer_sent: false,
            answer_sent: false,
            pending_remote_candidates: Vec::new(),
            connection_established_at: None,
        }
    }
}

impl Default for NegotiationState {
    fn default() -> Self {
        Self::new()
    }
}

/// Why a call ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndReason {
    /// Local hang-up
    Hangup,
    /// Remote peer sent `end-call`/`call-ended` (graceful, not an error)
    RemoteHangup,
    /// Watchdog expired before the connection established
    ConnectionTimeout,
    /// Relay could not be reached
    SignalingUnavailable,
    /// Capture permission denied or hardware unavailable
    MediaAccess(String),
    /// Offer/answer negotiation failed
    Negotiation(String),
}

impl EndReason {
    /// Human-readable reason reported to the UI layer
    pub fn describe(&self) -> String {
        match self {
            EndReason::Hangup => "Call ended".to_string(),
            EndReason::RemoteHangup => "Call ended by remote peer".to_string(),
            EndReason::ConnectionTimeout => "Could not establish connection in time".to_string(),
            EndReason::SignalingUnavailable => {
                "Failed to connect to signaling server".to_string()
            }
            EndReason::MediaAccess(msg) => format!("Could not access camera/microphone: {msg}"),
            EndReason::Negotiation(msg) => format!("Call setup failed: {msg}"),
        }
    }

    /// Whether this termination is an error (vs. a normal hang-up)
    pub fn is_failure(&self) -> bool {
        !matches!(self, EndReason::Hangup | EndReason::RemoteHangup)
    }
}

/// Events reported to the UI layer.
///
/// Every path out of negotiation produces exactly one `Ended`.
#[derive(Debug, Clone)]
pub enum CallEvent {
    /// Negotiation phase changed
    StatusChanged(Phase),
    /// First remote media arrived
    RemoteStreamAvailable,
    /// Terminal notification with the final reason
    Ended(EndReason),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outgoing_session_generates_call_id() {
        let a = CallSession::outgoing("alice", "bob");
        let b = CallSession::outgoing("alice", "bob");
        assert_eq!(a.role, CallRole::Caller);
        assert!(!a.call_id.is_empty());
        assert_ne!(a.call_id, b.call_id);
    }

    #[test]
    fn test_incoming_session_has_unknown_remote() {
        let s = CallSession::incoming("c1", "bob");
        assert_eq!(s.role, CallRole::Callee);
        assert!(s.remote_user_id.is_empty());
    }

    #[test]
    fn test_phase_terminality() {
        assert!(Phase::Idle.is_terminal());
        assert!(Phase::Failed.is_terminal());
        assert!(!Phase::Active.is_terminal());
        assert!(!Phase::Ending.is_terminal());
    }

    #[test]
    fn test_end_reason_classification() {
        assert!(!EndReason::Hangup.is_failure());
        assert!(!EndReason::RemoteHangup.is_failure());
        assert!(EndReason::ConnectionTimeout.is_failure());
        assert!(EndReason::MediaAccess("denied".to_string()).is_failure());
    }

    #[test]
    fn test_fresh_negotiation_state() {
        let state = NegotiationState::new();
        assert_eq!(state.phase, Phase::Idle);
        assert!(!state.offer_sent);
        assert!(!state.answer_sent);
        assert!(state.pending_remote_candidates.is_empty());
        assert!(state.connection_established_at.is_none());
    }
}

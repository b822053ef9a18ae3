//! Signaling wire protocol
//!
//! Typed messages exchanged with the relay. Every message is addressed to a
//! specific `call_id`; directed messages additionally carry `to`. The
//! coordinator discards anything not matching its current call, and anything
//! whose sender matches its own user ID (relays may loop room-addressed
//! messages back to the sender).

use serde::{Deserialize, Serialize};

use crate::session::CallRole;

/// A session description as carried on the wire: `{type, sdp}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionDescription {
    /// "offer" or "answer"
    #[serde(rename = "type")]
    pub kind: SdpKind,

    /// SDP body
    pub sdp: String,
}

/// Session description kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

impl SessionDescription {
    pub fn offer(sdp: String) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp,
        }
    }

    pub fn answer(sdp: String) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp,
        }
    }
}

/// A trickled ICE candidate as carried on the wire.
///
/// Field names follow the RTCIceCandidateInit dictionary so browser peers
/// interoperate without translation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CandidateInit {
    /// Candidate attribute line
    pub candidate: String,

    /// Media stream identification tag
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,

    /// Media description index
    #[serde(
        rename = "sdpMLineIndex",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
}

/// Signaling message kinds
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum SignalMessage {
    /// Declare presence in a call room (client -> relay); re-emitted after
    /// every transport reconnect
    JoinCall {
        call_id: String,
        user_id: String,
        role: CallRole,
    },

    /// A peer joined the call room (relay -> client)
    UserJoined {
        user_id: String,
        role: CallRole,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        socket_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        total_users: Option<u32>,
    },

    /// SDP offer (peer -> relay -> peer)
    Offer {
        call_id: String,
        offer: SessionDescription,
        from: String,
        to: String,
    },

    /// SDP answer (peer -> relay -> peer)
    Answer {
        call_id: String,
        answer: SessionDescription,
        from: String,
        to: String,
    },

    /// Trickled ICE candidate (peer -> relay -> peer)
    IceCandidate {
        call_id: String,
        candidate: CandidateInit,
        from: String,
        to: String,
    },

    /// Local hang-up notification (peer -> relay -> peer)
    EndCall {
        call_id: String,
        from: String,
        to: String,
    },

    /// Remote hang-up delivered by the relay (relay -> client)
    CallEnded { call_id: String, from: String },

    /// Relay-side error (relay -> client)
    Error { message: String },

    /// Presence registration (client -> relay, pre-negotiation)
    Register { user_id: String },

    /// Invite a user to a call (pre-negotiation invite flow)
    CallRequest {
        call_id: String,
        from: String,
        to: String,
    },

    /// Accept/decline an invite (pre-negotiation invite flow)
    CallResponse {
        call_id: String,
        from: String,
        to: String,
        accepted: bool,
    },
}

impl SignalMessage {
    /// Convert message to JSON string
    pub fn to_json(&self) -> crate::Result<String> {
        serde_json::to_string(self).map_err(|e| {
            crate::Error::Serialization(format!("Failed to serialize signaling message: {}", e))
        })
    }

    /// Parse message from JSON string
    pub fn from_json(json: &str) -> crate::Result<Self> {
        serde_json::from_str(json).map_err(|e| {
            crate::Error::Serialization(format!("Failed to deserialize signaling message: {}", e))
        })
    }

    /// Call ID this message addresses, if it carries one
    pub fn call_id(&self) -> Option<&str> {
        match self {
            SignalMessage::JoinCall { call_id, .. }
            | SignalMessage::Offer { call_id, .. }
            | SignalMessage::Answer { call_id, .. }
            | SignalMessage::IceCandidate { call_id, .. }
            | SignalMessage::EndCall { call_id, .. }
            | SignalMessage::CallEnded { call_id, .. }
            | SignalMessage::CallRequest { call_id, .. }
            | SignalMessage::CallResponse { call_id, .. } => Some(call_id),
            SignalMessage::UserJoined { .. }
            | SignalMessage::Error { .. }
            | SignalMessage::Register { .. } => None,
        }
    }

    /// Sender identifier, if the message carries one
    pub fn sender(&self) -> Option<&str> {
        match self {
            SignalMessage::JoinCall { user_id, .. }
            | SignalMessage::UserJoined { user_id, .. }
            | SignalMessage::Register { user_id } => Some(user_id),
            SignalMessage::Offer { from, .. }
            | SignalMessage::Answer { from, .. }
            | SignalMessage::IceCandidate { from, .. }
            | SignalMessage::EndCall { from, .. }
            | SignalMessage::CallEnded { from, .. }
            | SignalMessage::CallRequest { from, .. }
            | SignalMessage::CallResponse { from, .. } => Some(from),
            SignalMessage::Error { .. } => None,
        }
    }

    /// Wire kind for logging
    pub fn kind_name(&self) -> &'static str {
        match self {
            SignalMessage::JoinCall { .. } => "join-call",
            SignalMessage::UserJoined { .. } => "user-joined",
            SignalMessage::Offer { .. } => "offer",
            SignalMessage::Answer { .. } => "answer",
            SignalMessage::IceCandidate { .. } => "ice-candidate",
            SignalMessage::EndCall { .. } => "end-call",
            SignalMessage::CallEnded { .. } => "call-ended",
            SignalMessage::Error { .. } => "error",
            SignalMessage::Register { .. } => "register",
            SignalMessage::CallRequest { .. } => "call-request",
            SignalMessage::CallResponse { .. } => "call-response",
        }
    }
}

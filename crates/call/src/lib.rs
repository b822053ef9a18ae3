//! Peer-to-peer audio/video call negotiation
//!
//! This crate sets up one-to-one calls over a WebSocket signaling relay:
//! offer/answer exchange, trickled ICE, and media track management on top
//! of `webrtc`.
//!
//! # Features
//!
//! - **Relay signaling**: typed JSON messages over WebSocket, bounded
//!   reconnection with join replay
//! - **Offer/answer negotiation**: caller offers, callee answers, duplicate
//!   event deliveries tolerated
//! - **Trickle ICE**: candidates forwarded as gathered, early remote
//!   candidates buffered until a remote description exists
//! - **Media controls**: mic/camera mute and camera switching without
//!   renegotiation
//! - **Pre-flight probe**: advisory TURN reachability check
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │  UI layer                                            │
//! │  ↓ (CallHandle / CallEvent stream)                   │
//! │  CallCoordinator (one task per call)                 │
//! │  ├─ MediaSource → MediaHandle (local tracks)         │
//! │  ├─ PeerConnectionAdapter (webrtc-rs)                │
//! │  ├─ SignalingChannel (WebSocket relay client)        │
//! │  └─ connection watchdog (45s)                        │
//! │     ↕                                                │
//! │  signaling relay ↔ remote peer                       │
//! └──────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use fieldlink_call::{
//!     CallConfig, CallCoordinator, CallEvent, CallSession, MediaConstraints,
//!     SampleMediaSource, WebSocketConnector,
//! };
//!
//! # async fn example() -> fieldlink_call::Result<()> {
//! let config = CallConfig::new("wss://relay.example.com/ws");
//! let session = CallSession::outgoing("alice", "bob");
//!
//! let media = Arc::new(SampleMediaSource::new("alice", &session.call_id));
//! let connector = Arc::new(WebSocketConnector::new(
//!     &config.signaling_url,
//!     config.reconnect.clone(),
//! ));
//!
//! let (handle, mut events) = CallCoordinator::start(
//!     config,
//!     session,
//!     MediaConstraints::audio_video(),
//!     media,
//!     connector,
//! )
//! .await?;
//!
//! while let Some(event) = events.recv().await {
//!     if let CallEvent::Ended(reason) = event {
//!         println!("call over: {}", reason.describe());
//!         break;
//!     }
//! }
//! # let _ = handle;
//! # Ok(())
//! # }
//! ```

#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod media;
pub mod peer;
pub mod probe;
pub mod session;
pub mod signaling;

// Re-exports for public API
pub use config::{CallConfig, IceServerConfig, IceTransportPolicy, ReconnectPolicy};
pub use error::{Error, Result};
pub use media::{
    AudioConstraints, CameraFacing, LocalTrack, MediaConstraints, MediaHandle, MediaSource,
    SampleMediaSource, VideoConstraints,
};
pub use peer::{PeerConnectionAdapter, PeerConnectionUpdate};
pub use probe::{probe_relay, ProbeOutcome};
pub use session::{
    CallCoordinator, CallEvent, CallHandle, CallRole, CallSession, EndReason, Phase,
};
pub use signaling::{
    CandidateInit, SdpKind, SessionDescription, SignalMessage, SignalReceiver, SignalingChannel,
    SignalingConnector, WebSocketConnector, WebSocketSignaling,
};

/// Get the version of this crate
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        let ver = version();
        assert!(!ver.is_empty());
    }
}

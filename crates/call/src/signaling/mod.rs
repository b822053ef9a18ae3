//! Signaling transport and wire protocol
//!
//! The relay does no call logic; it forwards messages between clients in the
//! same call room. [`SignalingChannel`] is the seam between the negotiation
//! coordinator and the transport, so tests can drive negotiation over an
//! in-memory relay while production uses [`WebSocketSignaling`].

pub mod client;
pub mod protocol;

pub use client::{WebSocketConnector, WebSocketSignaling};
pub use protocol::{CandidateInit, SdpKind, SessionDescription, SignalMessage};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::Result;

/// Outbound half of the relay connection.
///
/// Delivery is at-most-once and ordering is only guaranteed per sender;
/// consumers must tolerate duplicates and early candidates.
#[async_trait]
pub trait SignalingChannel: Send {
    /// Queue a message for the relay.
    ///
    /// Returns an error only when the channel is irrecoverably closed;
    /// messages queued during a transient reconnect are flushed after the
    /// transport recovers.
    async fn send(&self, message: SignalMessage) -> Result<()>;

    /// Close the channel. Idempotent.
    async fn close(&self);
}

/// Inbound relay messages. The stream ending means the channel is closed
/// and will deliver nothing further (reconnection attempts exhausted, or
/// closed locally).
pub type SignalReceiver = mpsc::UnboundedReceiver<SignalMessage>;

/// Opens a signaling connection on demand.
///
/// Call setup acquires local media before touching the relay; the
/// coordinator holds a connector and only connects once media is in hand.
/// The `join` message declares presence in the call room and is replayed by
/// the channel after every transport reconnect.
#[async_trait]
pub trait SignalingConnector: Send + Sync {
    async fn connect(
        &self,
        join: SignalMessage,
    ) -> Result<(Box<dyn SignalingChannel>, SignalReceiver)>;
}

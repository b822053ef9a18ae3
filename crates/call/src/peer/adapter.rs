//! WebRTC peer connection adapter
//!
//! Wraps a `webrtc::RTCPeerConnection` with the small surface the
//! negotiation coordinator needs: offer/answer creation, remote description
//! and candidate application, outbound track attachment, and callback wiring
//! for local candidates, connection state, and remote tracks.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::policy::ice_transport_policy::RTCIceTransportPolicy;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use crate::config::{CallConfig, IceTransportPolicy};
use crate::media::MediaHandle;
use crate::signaling::protocol::{CandidateInit, SdpKind, SessionDescription};
use crate::{Error, Result};

/// Simplified connection state updates delivered to the coordinator.
///
/// `Connected` is delivered at most once per adapter; the underlying
/// transport may flap through `Connected` more than once but the first
/// arrival is what cancels the connection watchdog.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerConnectionUpdate {
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// Peer connection wrapper for one call attempt.
///
/// One adapter per call; a new call gets a fresh adapter. There is no ICE
/// restart path: when the transport fails, the call ends and the user
/// redials.
pub struct PeerConnectionAdapter {
    peer_label: String,
    peer_connection: Arc<RTCPeerConnection>,
    connected_fired: Arc<AtomicBool>,
    closed: AtomicBool,
}

impl PeerConnectionAdapter {
    /// Build a peer connection from call configuration.
    ///
    /// `peer_label` tags log lines; it is the remote user ID when known.
    pub async fn new(config: &CallConfig, peer_label: &str) -> Result<Self> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| Error::WebRtc(format!("Failed to register codecs: {e}")))?;

        let interceptor_registry =
            register_default_interceptors(Default::default(), &mut media_engine)
                .map_err(|e| Error::WebRtc(format!("Failed to register interceptors: {e}")))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(interceptor_registry)
            .build();

        let ice_servers: Vec<RTCIceServer> = config
            .ice_servers
            .iter()
            .map(|server| RTCIceServer {
                urls: vec![server.url.clone()],
                username: server.username.clone().unwrap_or_default(),
                credential: server.credential.clone().unwrap_or_default(),
                ..Default::default()
            })
            .collect();

        let rtc_config = RTCConfiguration {
            ice_servers,
            ice_candidate_pool_size: config.candidate_pool_size,
            ice_transport_policy: match config.transport_policy {
                IceTransportPolicy::All => RTCIceTransportPolicy::All,
                IceTransportPolicy::Relay => RTCIceTransportPolicy::Relay,
            },
            ..Default::default()
        };

        let peer_connection = Arc::new(
            api.new_peer_connection(rtc_config)
                .await
                .map_err(|e| Error::WebRtc(format!("Failed to create peer connection: {e}")))?,
        );

        info!(peer = %peer_label, "created peer connection");

        Ok(Self {
            peer_label: peer_label.to_string(),
            peer_connection,
            connected_fired: Arc::new(AtomicBool::new(false)),
            closed: AtomicBool::new(false),
        })
    }

    /// Register a handler for locally gathered ICE candidates.
    ///
    /// Candidates are trickled as they arrive; the end-of-gathering marker
    /// (`None` from the stack) is not forwarded.
    pub fn on_local_ice_candidate<F>(&self, handler: F)
    where
        F: Fn(CandidateInit) + Send + Sync + 'static,
    {
        let peer_label = self.peer_label.clone();
        self.peer_connection
            .on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
                let init = candidate.and_then(|c| match c.to_json() {
                    Ok(json) => Some(CandidateInit {
                        candidate: json.candidate,
                        sdp_mid: json.sdp_mid,
                        sdp_mline_index: json.sdp_mline_index,
                    }),
                    Err(e) => {
                        warn!(peer = %peer_label, error = %e, "failed to serialize local candidate");
                        None
                    }
                });
                if let Some(init) = init {
                    debug!(peer = %peer_label, "local ICE candidate gathered");
                    handler(init);
                }
                Box::pin(async {})
            }));
    }

    /// Register a handler for connection state updates.
    pub fn on_connection_update<F>(&self, handler: F)
    where
        F: Fn(PeerConnectionUpdate) + Send + Sync + 'static,
    {
        let peer_label = self.peer_label.clone();
        let connected_fired = Arc::clone(&self.connected_fired);
        self.peer_connection
            .on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
                let update = match state {
                    RTCPeerConnectionState::Connected => {
                        // First connect only; the watchdog is cancelled once.
                        if connected_fired.swap(true, Ordering::SeqCst) {
                            None
                        } else {
                            Some(PeerConnectionUpdate::Connected)
                        }
                    }
                    RTCPeerConnectionState::Disconnected => {
                        Some(PeerConnectionUpdate::Disconnected)
                    }
                    RTCPeerConnectionState::Failed => Some(PeerConnectionUpdate::Failed),
                    RTCPeerConnectionState::Closed => Some(PeerConnectionUpdate::Closed),
                    _ => None,
                };
                if let Some(update) = update {
                    debug!(peer = %peer_label, state = ?state, "peer connection state change");
                    handler(update);
                }
                Box::pin(async {})
            }));
    }

    /// Register a handler for inbound remote tracks.
    pub fn on_remote_track<F>(&self, handler: F)
    where
        F: Fn(Arc<TrackRemote>) + Send + Sync + 'static,
    {
        let peer_label = self.peer_label.clone();
        self.peer_connection
            .on_track(Box::new(move |track, _receiver, _transceiver| {
                info!(
                    peer = %peer_label,
                    kind = %track.kind(),
                    ssrc = track.ssrc(),
                    "remote track arrived"
                );
                handler(track);
                Box::pin(async {})
            }));
    }

    /// Attach acquired local tracks so they are announced in the next
    /// offer/answer. Must happen before description creation.
    pub async fn attach_media(&self, media: &MediaHandle) -> Result<()> {
        if let Some(audio) = media.audio_track() {
            self.peer_connection
                .add_track(audio.sample_track() as Arc<dyn TrackLocal + Send + Sync>)
                .await
                .map_err(|e| Error::MediaTrack(format!("Failed to add audio track: {e}")))?;
        }
        if let Some(video) = media.video_track() {
            self.peer_connection
                .add_track(video.sample_track() as Arc<dyn TrackLocal + Send + Sync>)
                .await
                .map_err(|e| Error::MediaTrack(format!("Failed to add video track: {e}")))?;
        }
        debug!(peer = %self.peer_label, "local media attached");
        Ok(())
    }

    /// Fail once `close()` has run. Negotiation ops check this on entry
    /// and again after their awaits; teardown may race them.
    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Negotiation("peer connection closed".to_string()));
        }
        Ok(())
    }

    /// Create an offer and install it as the local description.
    pub async fn create_offer(&self) -> Result<SessionDescription> {
        self.ensure_open()?;
        let offer = self
            .peer_connection
            .create_offer(None)
            .await
            .map_err(|e| Error::Negotiation(format!("Failed to create offer: {e}")))?;

        self.peer_connection
            .set_local_description(offer)
            .await
            .map_err(|e| Error::Negotiation(format!("Failed to set local description: {e}")))?;

        let local_desc = self
            .peer_connection
            .local_description()
            .await
            .ok_or_else(|| {
                Error::Negotiation("No local description after setting offer".to_string())
            })?;
        self.ensure_open()?;

        debug!(peer = %self.peer_label, "created offer");
        Ok(SessionDescription::offer(local_desc.sdp))
    }

    /// Apply a remote offer and create the answer, installing it as the
    /// local description.
    pub async fn create_answer(&self, offer: &SessionDescription) -> Result<SessionDescription> {
        if offer.kind != SdpKind::Offer {
            return Err(Error::Negotiation(
                "create_answer requires an offer description".to_string(),
            ));
        }
        self.ensure_open()?;

        let remote = RTCSessionDescription::offer(offer.sdp.clone())
            .map_err(|e| Error::Negotiation(format!("Failed to parse offer: {e}")))?;
        self.peer_connection
            .set_remote_description(remote)
            .await
            .map_err(|e| Error::Negotiation(format!("Failed to set remote description: {e}")))?;

        let answer = self
            .peer_connection
            .create_answer(None)
            .await
            .map_err(|e| Error::Negotiation(format!("Failed to create answer: {e}")))?;
        self.peer_connection
            .set_local_description(answer)
            .await
            .map_err(|e| Error::Negotiation(format!("Failed to set local description: {e}")))?;

        let local_desc = self
            .peer_connection
            .local_description()
            .await
            .ok_or_else(|| {
                Error::Negotiation("No local description after setting answer".to_string())
            })?;
        self.ensure_open()?;

        debug!(peer = %self.peer_label, "created answer");
        Ok(SessionDescription::answer(local_desc.sdp))
    }

    /// Apply the remote answer to a previously sent offer.
    pub async fn apply_remote_answer(&self, answer: &SessionDescription) -> Result<()> {
        if answer.kind != SdpKind::Answer {
            return Err(Error::Negotiation(
                "apply_remote_answer requires an answer description".to_string(),
            ));
        }
        self.ensure_open()?;

        let remote = RTCSessionDescription::answer(answer.sdp.clone())
            .map_err(|e| Error::Negotiation(format!("Failed to parse answer: {e}")))?;
        self.peer_connection
            .set_remote_description(remote)
            .await
            .map_err(|e| Error::Negotiation(format!("Failed to set remote description: {e}")))?;

        debug!(peer = %self.peer_label, "applied remote answer");
        Ok(())
    }

    /// Whether a remote description has been applied. Candidates arriving
    /// before this point must be buffered by the caller.
    pub async fn has_remote_description(&self) -> bool {
        self.peer_connection.remote_description().await.is_some()
    }

    /// Apply a trickled remote candidate.
    ///
    /// Application failures are logged and swallowed: stale or malformed
    /// candidates are routine during trickling and never end a call.
    pub async fn add_remote_candidate(&self, candidate: &CandidateInit) {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate.clone(),
            sdp_mid: candidate.sdp_mid.clone(),
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: None,
        };

        if let Err(e) = self.peer_connection.add_ice_candidate(init).await {
            warn!(peer = %self.peer_label, error = %e, "failed to apply remote candidate");
        }
    }

    /// Current transport state
    pub fn connection_state(&self) -> RTCPeerConnectionState {
        self.peer_connection.connection_state()
    }

    /// Current ICE transport state
    pub fn ice_connection_state(&self) -> RTCIceConnectionState {
        self.peer_connection.ice_connection_state()
    }

    /// Log a snapshot of the connection's state machines.
    pub fn log_connection_stats(&self) {
        debug!(
            peer = %self.peer_label,
            connection = %self.peer_connection.connection_state(),
            ice = %self.peer_connection.ice_connection_state(),
            gathering = %self.peer_connection.ice_gathering_state(),
            signaling = %self.peer_connection.signaling_state(),
            "connection stats"
        );
    }

    /// Close the connection. Idempotent; concurrent calls race on a flag
    /// and only the winner drives the close.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        info!(peer = %self.peer_label, "closing peer connection");
        self.peer_connection
            .close()
            .await
            .map_err(|e| Error::WebRtc(format!("Failed to close connection: {e}")))?;
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{MediaConstraints, MediaSource, SampleMediaSource};

    async fn adapter() -> PeerConnectionAdapter {
        PeerConnectionAdapter::new(&CallConfig::default(), "remote")
            .await
            .unwrap()
    }

    /// Adapter with local media attached, satisfying the spec's
    /// precondition that `create_offer` runs with media already attached.
    async fn adapter_with_media(user_id: &str) -> PeerConnectionAdapter {
        let pc = adapter().await;
        let media = SampleMediaSource::new(user_id, "c1")
            .acquire(&MediaConstraints::audio_video())
            .await
            .unwrap();
        pc.attach_media(&media).await.unwrap();
        pc
    }

    #[tokio::test]
    async fn test_create_offer_produces_sdp() {
        let pc = adapter().await;
        let offer = pc.create_offer().await.unwrap();
        assert_eq!(offer.kind, SdpKind::Offer);
        assert!(offer.sdp.contains("v=0"));
        pc.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_offer_announces_attached_media() {
        let pc = adapter().await;
        let media = SampleMediaSource::new("alice", "c1")
            .acquire(&MediaConstraints::audio_video())
            .await
            .unwrap();
        pc.attach_media(&media).await.unwrap();

        let offer = pc.create_offer().await.unwrap();
        assert!(offer.sdp.contains("m=audio"));
        assert!(offer.sdp.contains("m=video"));
        pc.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_offer_answer_exchange() {
        let caller = adapter_with_media("alice").await;
        let callee = adapter_with_media("bob").await;

        let offer = caller.create_offer().await.unwrap();
        assert!(!callee.has_remote_description().await);

        let answer = callee.create_answer(&offer).await.unwrap();
        assert_eq!(answer.kind, SdpKind::Answer);
        assert!(callee.has_remote_description().await);

        caller.apply_remote_answer(&answer).await.unwrap();
        assert!(caller.has_remote_description().await);

        caller.close().await.unwrap();
        callee.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_create_answer_rejects_answer_description() {
        let pc = adapter().await;
        let not_an_offer = SessionDescription::answer("v=0".to_string());
        assert!(pc.create_answer(&not_an_offer).await.is_err());
        pc.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_bad_remote_candidate_is_swallowed() {
        let caller = adapter_with_media("alice").await;
        let callee = adapter_with_media("bob").await;
        let offer = caller.create_offer().await.unwrap();
        callee.create_answer(&offer).await.unwrap();

        // Garbage candidate: logged, not fatal
        callee
            .add_remote_candidate(&CandidateInit {
                candidate: "not a candidate".to_string(),
                sdp_mid: None,
                sdp_mline_index: None,
            })
            .await;

        caller.close().await.unwrap();
        callee.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let pc = adapter().await;
        pc.close().await.unwrap();
        assert!(pc.is_closed());
        pc.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_negotiation_rejected_after_close() {
        let pc = adapter().await;
        let offer = pc.create_offer().await.unwrap();
        pc.close().await.unwrap();

        assert!(pc.create_offer().await.is_err());
        assert!(pc.create_answer(&offer).await.is_err());
        assert!(pc
            .apply_remote_answer(&SessionDescription::answer("v=0".to_string()))
            .await
            .is_err());
    }
}

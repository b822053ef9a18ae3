//! Pre-flight relay connectivity probe
//!
//! Answers one question before a call starts: can this network produce a
//! relayed candidate from the configured TURN servers? The probe spins up a
//! throwaway peer connection with a data channel, starts gathering, and
//! watches for a `typ relay` candidate within a bounded window.
//!
//! The outcome is advisory. Calls proceed regardless; an unreachable relay
//! just predicts failure on symmetric-NAT paths.

use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate_type::RTCIceCandidateType;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;

use crate::config::CallConfig;

/// Probe verdict
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// A relayed candidate was gathered within the window
    RelayReachable,
    /// Gathering ran the full window without a relayed candidate
    RelayUnreachable,
    /// The probe could not run (no TURN servers configured, or setup
    /// failed); treat as unknown
    Inconclusive,
}

impl ProbeOutcome {
    pub fn is_reachable(&self) -> bool {
        matches!(self, ProbeOutcome::RelayReachable)
    }
}

/// Run the relay reachability probe.
///
/// Never returns an error; anything that prevents the probe from running
/// yields [`ProbeOutcome::Inconclusive`].
pub async fn probe_relay(config: &CallConfig) -> ProbeOutcome {
    if !config.ice_servers.iter().any(|s| s.is_relay()) {
        debug!("no TURN servers configured, skipping relay probe");
        return ProbeOutcome::Inconclusive;
    }

    let outcome = match run_probe(config).await {
        Ok(outcome) => outcome,
        Err(e) => {
            warn!(error = %e, "relay probe could not run");
            ProbeOutcome::Inconclusive
        }
    };

    match outcome {
        ProbeOutcome::RelayReachable => info!("relay probe: TURN reachable"),
        ProbeOutcome::RelayUnreachable => {
            warn!("relay probe: no relayed candidate, TURN may be unreachable")
        }
        ProbeOutcome::Inconclusive => {}
    }
    outcome
}

async fn run_probe(config: &CallConfig) -> crate::Result<ProbeOutcome> {
    let mut media_engine = MediaEngine::default();
    media_engine
        .register_default_codecs()
        .map_err(|e| crate::Error::WebRtc(format!("Failed to register codecs: {e}")))?;

    let api = APIBuilder::new().with_media_engine(media_engine).build();

    let ice_servers: Vec<RTCIceServer> = config
        .ice_servers
        .iter()
        .filter(|s| s.is_relay())
        .map(|server| RTCIceServer {
            urls: vec![server.url.clone()],
            username: server.username.clone().unwrap_or_default(),
            credential: server.credential.clone().unwrap_or_default(),
            ..Default::default()
        })
        .collect();

    let pc = api
        .new_peer_connection(RTCConfiguration {
            ice_servers,
            ..Default::default()
        })
        .await
        .map_err(|e| crate::Error::WebRtc(format!("Failed to create probe connection: {e}")))?;

    let (relay_tx, mut relay_rx) = mpsc::channel::<()>(1);
    pc.on_ice_candidate(Box::new(move |candidate| {
        if let Some(c) = candidate {
            if c.typ == RTCIceCandidateType::Relay {
                let _ = relay_tx.try_send(());
            }
        }
        Box::pin(async {})
    }));

    // A data channel gives the offer an m-line so gathering starts
    pc.create_data_channel("probe", None)
        .await
        .map_err(|e| crate::Error::WebRtc(format!("Failed to create probe channel: {e}")))?;

    let offer = pc
        .create_offer(None)
        .await
        .map_err(|e| crate::Error::Negotiation(format!("Failed to create probe offer: {e}")))?;
    pc.set_local_description(offer)
        .await
        .map_err(|e| crate::Error::Negotiation(format!("Failed to start probe gathering: {e}")))?;

    let outcome = match tokio::time::timeout(config.probe_timeout, relay_rx.recv()).await {
        Ok(Some(())) => ProbeOutcome::RelayReachable,
        Ok(None) | Err(_) => ProbeOutcome::RelayUnreachable,
    };

    if let Err(e) = pc.close().await {
        debug!(error = %e, "probe connection close failed");
    }

    Ok(outcome)
}

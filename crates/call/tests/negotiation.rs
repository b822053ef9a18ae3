//! Call negotiation integration tests
//!
//! Two coordinators negotiate over an in-memory relay implementing the
//! signaling seam. The relay broadcasts every message to all room members
//! including the sender, which exercises self-echo suppression the same way
//! a room-addressed production relay does.
//!
//! Peer connections are real `webrtc` objects; the two-sided test drives a
//! call all the way to `Active` over loopback host candidates, the rest
//! assert negotiation progress up to the phase they exercise.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;

use fieldlink_call::{
    CallConfig, CallCoordinator, CallEvent, CallHandle, CallRole, CallSession, CandidateInit,
    EndReason, Error, MediaConstraints, Phase, Result, SampleMediaSource, SignalMessage,
    SignalReceiver, SignalingChannel, SignalingConnector,
};

/// Initialize test logging (call once per test)
fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("info,fieldlink_call=debug")
        .try_init();
}

// ============================================================================
// In-memory relay
// ============================================================================

struct RelayClient {
    user_id: String,
    role: CallRole,
    tx: mpsc::UnboundedSender<SignalMessage>,
}

#[derive(Clone, Default)]
struct MemoryRelay {
    clients: Arc<parking_lot::Mutex<Vec<RelayClient>>>,
    log: Arc<parking_lot::Mutex<Vec<SignalMessage>>>,
}

impl MemoryRelay {
    fn new() -> Self {
        Self::default()
    }

    /// Deliver a message to every room member, sender included.
    fn broadcast(&self, message: SignalMessage) {
        self.log.lock().push(message.clone());
        for client in self.clients.lock().iter() {
            let _ = client.tx.send(message.clone());
        }
    }

    fn count_kind(&self, kind: &str) -> usize {
        self.log
            .lock()
            .iter()
            .filter(|m| m.kind_name() == kind)
            .count()
    }

    fn connector(&self) -> Arc<MemoryConnector> {
        Arc::new(MemoryConnector {
            relay: self.clone(),
            refuse: false,
        })
    }

    fn refusing_connector(&self) -> Arc<MemoryConnector> {
        Arc::new(MemoryConnector {
            relay: self.clone(),
            refuse: true,
        })
    }
}

struct MemoryConnector {
    relay: MemoryRelay,
    refuse: bool,
}

#[async_trait]
impl SignalingConnector for MemoryConnector {
    async fn connect(
        &self,
        join: SignalMessage,
    ) -> Result<(Box<dyn SignalingChannel>, SignalReceiver)> {
        if self.refuse {
            return Err(Error::SignalingUnavailable("relay refused".to_string()));
        }

        let (user_id, role) = match &join {
            SignalMessage::JoinCall { user_id, role, .. } => (user_id.clone(), *role),
            other => panic!("unexpected join message: {:?}", other),
        };

        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut clients = self.relay.clients.lock();
            // The newcomer learns about everyone already in the room
            for existing in clients.iter() {
                let _ = tx.send(SignalMessage::UserJoined {
                    user_id: existing.user_id.clone(),
                    role: existing.role,
                    socket_id: None,
                    total_users: None,
                });
            }
            clients.push(RelayClient {
                user_id: user_id.clone(),
                role,
                tx,
            });
        }
        // Everyone, newcomer included, hears about the join
        self.relay.broadcast(SignalMessage::UserJoined {
            user_id: user_id.clone(),
            role,
            socket_id: None,
            total_users: None,
        });

        let channel = MemoryChannel {
            relay: self.relay.clone(),
            user_id,
        };
        Ok((Box::new(channel), rx))
    }
}

struct MemoryChannel {
    relay: MemoryRelay,
    user_id: String,
}

#[async_trait]
impl SignalingChannel for MemoryChannel {
    async fn send(&self, message: SignalMessage) -> Result<()> {
        self.relay.broadcast(message);
        Ok(())
    }

    async fn close(&self) {
        self.relay
            .clients
            .lock()
            .retain(|c| c.user_id != self.user_id);
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn test_config() -> CallConfig {
    CallConfig::default().with_connect_timeout(Duration::from_secs(10))
}

async fn start_call(
    relay: &MemoryRelay,
    config: CallConfig,
    session: CallSession,
) -> (CallHandle, mpsc::UnboundedReceiver<CallEvent>) {
    let media = Arc::new(SampleMediaSource::new(
        &session.local_user_id,
        &session.call_id,
    ));
    CallCoordinator::start(
        config,
        session,
        MediaConstraints::audio_video(),
        media,
        relay.connector(),
    )
    .await
    .unwrap()
}

async fn next_event(events: &mut mpsc::UnboundedReceiver<CallEvent>) -> CallEvent {
    timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("timed out waiting for call event")
        .expect("event stream closed")
}

/// Wait until negotiation reaches `target` (or a later phase implied by
/// `Active`). Panics if the call ends first.
async fn wait_for_phase(events: &mut mpsc::UnboundedReceiver<CallEvent>, target: Phase) {
    loop {
        match next_event(events).await {
            CallEvent::StatusChanged(phase) if phase == target => return,
            CallEvent::StatusChanged(Phase::Active) if target == Phase::Connecting => return,
            CallEvent::Ended(reason) => {
                panic!("call ended ({:?}) before reaching {:?}", reason, target)
            }
            _ => {}
        }
    }
}

/// Wait for the terminal event, skipping intermediate status changes.
async fn wait_for_ended(events: &mut mpsc::UnboundedReceiver<CallEvent>) -> EndReason {
    loop {
        if let CallEvent::Ended(reason) = next_event(events).await {
            return reason;
        }
    }
}

// ============================================================================
// Two-sided negotiation
// ============================================================================

#[tokio::test]
async fn test_caller_and_callee_establish_call() {
    init_logging();
    let relay = MemoryRelay::new();

    let caller_session = CallSession::outgoing("alice", "bob");
    let callee_session = CallSession::incoming(&caller_session.call_id, "bob");

    let (caller, mut caller_events) = start_call(&relay, test_config(), caller_session).await;
    let (callee, mut callee_events) = start_call(&relay, test_config(), callee_session).await;

    // Host candidates over loopback carry the transports all the way up;
    // Active also covers the exactly-once connected dedup and the
    // watchdog-disarm path.
    wait_for_phase(&mut caller_events, Phase::Active).await;
    wait_for_phase(&mut callee_events, Phase::Active).await;

    // One offer and one answer, no matter the event interleaving
    assert_eq!(relay.count_kind("offer"), 1);
    assert_eq!(relay.count_kind("answer"), 1);

    caller.hang_up();
    assert_eq!(wait_for_ended(&mut caller_events).await, EndReason::Hangup);
    assert_eq!(
        wait_for_ended(&mut callee_events).await,
        EndReason::RemoteHangup
    );

    // The remote side never echoes end-call back
    assert_eq!(relay.count_kind("end-call"), 1);

    caller.join().await;
    callee.join().await;
}

#[tokio::test]
async fn test_duplicate_user_joined_creates_one_offer() {
    init_logging();
    let relay = MemoryRelay::new();

    let caller_session = CallSession::outgoing("alice", "bob");
    let call_id = caller_session.call_id.clone();
    let callee_session = CallSession::incoming(&call_id, "bob");

    let (caller, mut caller_events) = start_call(&relay, test_config(), caller_session).await;
    let (callee, mut callee_events) = start_call(&relay, test_config(), callee_session).await;

    wait_for_phase(&mut caller_events, Phase::OfferSent).await;

    // The observed production race: the same join delivered again
    relay.broadcast(SignalMessage::UserJoined {
        user_id: "bob".to_string(),
        role: CallRole::Callee,
        socket_id: None,
        total_users: Some(2),
    });
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert_eq!(relay.count_kind("offer"), 1);

    wait_for_phase(&mut callee_events, Phase::Connecting).await;
    caller.hang_up();
    wait_for_ended(&mut caller_events).await;
    wait_for_ended(&mut callee_events).await;
    caller.join().await;
    callee.join().await;
}

#[tokio::test]
async fn test_early_candidate_is_buffered_not_dropped() {
    init_logging();
    let relay = MemoryRelay::new();

    let caller_session = CallSession::outgoing("alice", "bob");
    let call_id = caller_session.call_id.clone();

    let (caller, mut caller_events) = start_call(&relay, test_config(), caller_session).await;
    wait_for_phase(&mut caller_events, Phase::AwaitingPeerJoin).await;

    // Candidate lands before any description exists on the caller side
    relay.broadcast(SignalMessage::IceCandidate {
        call_id: call_id.clone(),
        candidate: CandidateInit {
            candidate: "candidate:1 1 UDP 2122252543 192.0.2.1 50000 typ host".to_string(),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
        },
        from: "bob".to_string(),
        to: "alice".to_string(),
    });

    let callee_session = CallSession::incoming(&call_id, "bob");
    let (callee, mut callee_events) = start_call(&relay, test_config(), callee_session).await;

    wait_for_phase(&mut caller_events, Phase::Connecting).await;
    wait_for_phase(&mut callee_events, Phase::Connecting).await;

    caller.hang_up();
    wait_for_ended(&mut caller_events).await;
    wait_for_ended(&mut callee_events).await;
    caller.join().await;
    callee.join().await;
}

// ============================================================================
// Self-echo and cross-call filtering
// ============================================================================

#[tokio::test]
async fn test_self_echo_never_transitions_state() {
    init_logging();
    let relay = MemoryRelay::new();

    let session = CallSession::outgoing("alice", "bob");
    let (caller, mut events) = start_call(&relay, test_config(), session).await;
    wait_for_phase(&mut events, Phase::AwaitingPeerJoin).await;

    // A looped-back join from ourselves must not trigger an offer
    relay.broadcast(SignalMessage::UserJoined {
        user_id: "alice".to_string(),
        role: CallRole::Caller,
        socket_id: None,
        total_users: Some(1),
    });
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert_eq!(relay.count_kind("offer"), 0);
    assert!(events.try_recv().is_err(), "no phase change expected");

    caller.hang_up();
    wait_for_ended(&mut events).await;
    caller.join().await;
}

#[tokio::test]
async fn test_messages_for_other_calls_are_ignored() {
    init_logging();
    let relay = MemoryRelay::new();

    let session = CallSession::outgoing("alice", "bob");
    let (caller, mut events) = start_call(&relay, test_config(), session).await;
    wait_for_phase(&mut events, Phase::AwaitingPeerJoin).await;

    relay.broadcast(SignalMessage::CallEnded {
        call_id: "some-other-call".to_string(),
        from: "carol".to_string(),
    });
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert!(events.try_recv().is_err(), "foreign call-ended must be ignored");

    caller.hang_up();
    assert_eq!(wait_for_ended(&mut events).await, EndReason::Hangup);
    caller.join().await;
}

// ============================================================================
// Teardown properties
// ============================================================================

#[tokio::test]
async fn test_repeated_hang_up_sends_one_end_call() {
    init_logging();
    let relay = MemoryRelay::new();

    let session = CallSession::outgoing("alice", "bob");
    let (caller, mut events) = start_call(&relay, test_config(), session).await;
    wait_for_phase(&mut events, Phase::AwaitingPeerJoin).await;

    caller.hang_up();
    caller.hang_up();
    caller.hang_up();

    assert_eq!(wait_for_ended(&mut events).await, EndReason::Hangup);
    caller.join().await;

    assert_eq!(relay.count_kind("end-call"), 1);
    // Stream closed after the single terminal event
    assert!(timeout(Duration::from_secs(1), events.recv())
        .await
        .expect("stream should close")
        .is_none());
}

#[tokio::test]
async fn test_watchdog_fails_call_when_no_peer_joins() {
    init_logging();
    let relay = MemoryRelay::new();

    let config = test_config().with_connect_timeout(Duration::from_millis(500));
    let session = CallSession::outgoing("alice", "bob");
    let (caller, mut events) = start_call(&relay, config, session).await;

    wait_for_phase(&mut events, Phase::AwaitingPeerJoin).await;
    assert_eq!(
        wait_for_ended(&mut events).await,
        EndReason::ConnectionTimeout
    );
    caller.join().await;

    // One internal end(): one wire notification, one terminal event
    assert_eq!(relay.count_kind("end-call"), 1);
    assert!(timeout(Duration::from_secs(1), events.recv())
        .await
        .expect("stream should close")
        .is_none());
}

#[tokio::test]
async fn test_remote_end_call_terminates_without_resend() {
    init_logging();
    let relay = MemoryRelay::new();

    let session = CallSession::outgoing("alice", "bob");
    let call_id = session.call_id.clone();
    let (caller, mut events) = start_call(&relay, test_config(), session).await;
    wait_for_phase(&mut events, Phase::AwaitingPeerJoin).await;

    relay.broadcast(SignalMessage::EndCall {
        call_id,
        from: "bob".to_string(),
        to: "alice".to_string(),
    });

    assert_eq!(wait_for_ended(&mut events).await, EndReason::RemoteHangup);
    caller.join().await;

    // Only bob's message is in the log; alice did not answer it
    assert_eq!(relay.count_kind("end-call"), 1);
}

#[tokio::test]
async fn test_malformed_candidate_does_not_end_call() {
    init_logging();
    let relay = MemoryRelay::new();

    let caller_session = CallSession::outgoing("alice", "bob");
    let call_id = caller_session.call_id.clone();
    let callee_session = CallSession::incoming(&call_id, "bob");

    let (caller, mut caller_events) = start_call(&relay, test_config(), caller_session).await;
    let (callee, mut callee_events) = start_call(&relay, test_config(), callee_session).await;
    wait_for_phase(&mut caller_events, Phase::Connecting).await;

    relay.broadcast(SignalMessage::IceCandidate {
        call_id,
        candidate: CandidateInit {
            candidate: "definitely not a candidate line".to_string(),
            sdp_mid: None,
            sdp_mline_index: None,
        },
        from: "bob".to_string(),
        to: "alice".to_string(),
    });
    tokio::time::sleep(Duration::from_millis(300)).await;

    // Still mid-negotiation, no terminal transition
    while let Ok(event) = caller_events.try_recv() {
        assert!(
            !matches!(event, CallEvent::Ended(_)),
            "bad candidate must not end the call"
        );
    }

    caller.hang_up();
    wait_for_ended(&mut caller_events).await;
    wait_for_ended(&mut callee_events).await;
    caller.join().await;
    callee.join().await;
}

// ============================================================================
// Pre-signaling failures
// ============================================================================

#[tokio::test]
async fn test_denied_media_aborts_before_signaling() {
    init_logging();
    let relay = MemoryRelay::new();
    let session = CallSession::outgoing("alice", "bob");
    let media = Arc::new(SampleMediaSource::denied("alice", &session.call_id));

    let err = CallCoordinator::start(
        test_config(),
        session,
        MediaConstraints::audio_video(),
        media,
        relay.connector(),
    )
    .await
    .err()
    .expect("media denial must abort call setup");

    assert!(matches!(err, Error::MediaAccess(_)));
    // Never joined the room
    assert_eq!(relay.count_kind("user-joined"), 0);
}

#[tokio::test]
async fn test_unreachable_relay_surfaces_signaling_unavailable() {
    init_logging();
    let relay = MemoryRelay::new();
    let session = CallSession::outgoing("alice", "bob");
    let media = Arc::new(SampleMediaSource::new("alice", &session.call_id));

    let err = CallCoordinator::start(
        test_config(),
        session,
        MediaConstraints::audio_video(),
        media,
        relay.refusing_connector(),
    )
    .await
    .err()
    .expect("refused relay must abort call setup");

    assert!(matches!(err, Error::SignalingUnavailable(_)));
}

#[tokio::test]
async fn test_probe_timeout_does_not_block_call_setup() {
    init_logging();
    let relay = MemoryRelay::new();

    // TURN server that will never answer; the probe must time out and the
    // call proceed regardless
    let config = test_config()
        .with_turn_servers(vec![fieldlink_call::IceServerConfig::turn(
            "turn:127.0.0.1:1",
            "user",
            "pass",
        )])
        .with_probe_timeout(Duration::from_millis(200));

    let session = CallSession::outgoing("alice", "bob");
    let (caller, mut events) = start_call(&relay, config, session).await;

    wait_for_phase(&mut events, Phase::AwaitingPeerJoin).await;

    caller.hang_up();
    wait_for_ended(&mut events).await;
    caller.join().await;
}

// ============================================================================
// Media controls on a live call
// ============================================================================

#[tokio::test]
async fn test_toggles_on_live_call() {
    init_logging();
    let relay = MemoryRelay::new();

    let session = CallSession::outgoing("alice", "bob");
    let (caller, mut events) = start_call(&relay, test_config(), session).await;
    wait_for_phase(&mut events, Phase::AwaitingPeerJoin).await;

    // Tracks start enabled; first toggle mutes
    assert!(!caller.toggle_mic());
    assert!(caller.toggle_mic());
    assert!(!caller.toggle_camera());
    assert!(caller.switch_camera());

    caller.hang_up();
    wait_for_ended(&mut events).await;
    caller.join().await;
}

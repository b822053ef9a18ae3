//! Call negotiation coordinator
//!
//! Drives one call attempt end to end: probe, media acquisition, relay
//! join, offer/answer exchange, candidate trickling, and teardown. All
//! negotiation state lives on a single task; inbound signaling, peer
//! connection events, user commands, and the connection watchdog meet in
//! one `select!` loop, so no locking guards `NegotiationState`.
//!
//! Teardown is funnelled through one `end(reason)` path. It runs at most
//! once per call, sends `end-call` at most once, and always produces
//! exactly one terminal [`CallEvent::Ended`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::CallConfig;
use crate::media::{MediaConstraints, MediaHandle, MediaSource};
use crate::peer::{PeerConnectionAdapter, PeerConnectionUpdate};
use crate::probe::probe_relay;
use crate::session::{CallEvent, CallRole, CallSession, EndReason, NegotiationState, Phase};
use crate::signaling::protocol::{CandidateInit, SessionDescription};
use crate::signaling::{SignalMessage, SignalReceiver, SignalingChannel, SignalingConnector};
use crate::{Error, Result};

/// Commands from the UI layer into the call task
enum Command {
    HangUp,
}

/// Events from the peer connection into the call task
enum PeerEvent {
    LocalCandidate(CandidateInit),
    Update(PeerConnectionUpdate),
    RemoteTrack,
}

/// Entry point for running a call.
pub struct CallCoordinator;

impl CallCoordinator {
    /// Start a call attempt.
    ///
    /// Runs the advisory relay probe, acquires local media, connects
    /// signaling and joins the call room, then hands the negotiation to a
    /// background task. Returns the control handle and the event stream
    /// the UI layer subscribes to.
    ///
    /// # Errors
    ///
    /// Pre-signaling failures surface here: invalid configuration,
    /// [`Error::MediaAccess`] when capture fails, and
    /// [`Error::SignalingUnavailable`] when the relay cannot be reached.
    /// Everything after that is reported through [`CallEvent::Ended`].
    pub async fn start(
        config: CallConfig,
        session: CallSession,
        constraints: MediaConstraints,
        media_source: Arc<dyn MediaSource>,
        connector: Arc<dyn SignalingConnector>,
    ) -> Result<(CallHandle, mpsc::UnboundedReceiver<CallEvent>)> {
        config.validate()?;

        info!(
            call_id = %session.call_id,
            user_id = %session.local_user_id,
            role = ?session.role,
            "starting call"
        );

        // Advisory only; an unreachable relay never blocks the call.
        let _ = probe_relay(&config).await;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let _ = events_tx.send(CallEvent::StatusChanged(Phase::AwaitingMedia));

        let media = Arc::new(media_source.acquire(&constraints).await?);

        let peer_label = if session.remote_user_id.is_empty() {
            session.call_id.clone()
        } else {
            session.remote_user_id.clone()
        };
        let adapter = Arc::new(PeerConnectionAdapter::new(&config, &peer_label).await?);
        adapter.attach_media(&media).await?;

        let (peer_tx, peer_rx) = mpsc::unbounded_channel();

        let candidate_tx = peer_tx.clone();
        adapter.on_local_ice_candidate(move |candidate| {
            let _ = candidate_tx.send(PeerEvent::LocalCandidate(candidate));
        });

        let update_tx = peer_tx.clone();
        adapter.on_connection_update(move |update| {
            let _ = update_tx.send(PeerEvent::Update(update));
        });

        let track_tx = peer_tx;
        adapter.on_remote_track(move |_track| {
            let _ = track_tx.send(PeerEvent::RemoteTrack);
        });

        let join = SignalMessage::JoinCall {
            call_id: session.call_id.clone(),
            user_id: session.local_user_id.clone(),
            role: session.role,
        };
        let (signaling, signal_rx) = connector.connect(join).await?;

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();

        let runner = Runner {
            config,
            session,
            state: NegotiationState::new(),
            adapter: Arc::clone(&adapter),
            media: Arc::clone(&media),
            signaling,
            events_tx,
            remote_stream_reported: false,
            ended: false,
        };
        let task = tokio::spawn(runner.run(signal_rx, peer_rx, cmd_rx));

        let handle = CallHandle {
            cmd_tx,
            media,
            adapter,
            hung_up: AtomicBool::new(false),
            task,
        };
        Ok((handle, events_rx))
    }
}

/// Control surface for an in-progress call.
pub struct CallHandle {
    cmd_tx: mpsc::UnboundedSender<Command>,
    media: Arc<MediaHandle>,
    adapter: Arc<PeerConnectionAdapter>,
    hung_up: AtomicBool,
    task: tokio::task::JoinHandle<()>,
}

impl CallHandle {
    /// Flip the microphone mute flag; returns the new enabled state,
    /// `false` when no audio track exists.
    pub fn toggle_mic(&self) -> bool {
        self.media.toggle_audio()
    }

    /// Flip the camera mute flag; returns the new enabled state, `false`
    /// when no video track exists.
    pub fn toggle_camera(&self) -> bool {
        self.media.toggle_video()
    }

    /// Switch between front and back camera. Best effort.
    pub fn switch_camera(&self) -> bool {
        self.media.switch_camera()
    }

    /// Hang up. Safe to call repeatedly; only the first call reaches the
    /// negotiation task.
    pub fn hang_up(&self) {
        if self.hung_up.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.cmd_tx.send(Command::HangUp);
    }

    /// Current transport state of the underlying peer connection
    pub fn connection_state(&self) -> webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState {
        self.adapter.connection_state()
    }

    /// Wait for the negotiation task to finish. Used by tests and
    /// shutdown paths; the call itself ends via events.
    pub async fn join(self) {
        let _ = self.task.await;
    }
}

struct Runner {
    config: CallConfig,
    session: CallSession,
    state: NegotiationState,
    adapter: Arc<PeerConnectionAdapter>,
    media: Arc<MediaHandle>,
    signaling: Box<dyn SignalingChannel>,
    events_tx: mpsc::UnboundedSender<CallEvent>,
    remote_stream_reported: bool,
    ended: bool,
}

impl Runner {
    async fn run(
        mut self,
        mut signal_rx: SignalReceiver,
        mut peer_rx: mpsc::UnboundedReceiver<PeerEvent>,
        mut cmd_rx: mpsc::UnboundedReceiver<Command>,
    ) {
        self.set_phase(Phase::AwaitingPeerJoin);

        // Watchdog armed for the whole window from room join to an
        // established connection; disarmed exactly once on Active.
        let watchdog = tokio::time::sleep(self.config.connect_timeout);
        tokio::pin!(watchdog);
        let mut watchdog_armed = true;

        loop {
            tokio::select! {
                _ = &mut watchdog, if watchdog_armed => {
                    watchdog_armed = false;
                    warn!(call_id = %self.session.call_id, "connection watchdog expired");
                    self.end(EndReason::ConnectionTimeout, true).await;
                    return;
                }

                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(Command::HangUp) => {
                            self.end(EndReason::Hangup, true).await;
                            return;
                        }
                        // Handle dropped without a hang-up: tear down too.
                        None => {
                            self.end(EndReason::Hangup, true).await;
                            return;
                        }
                    }
                }

                event = peer_rx.recv() => {
                    let Some(event) = event else { continue };
                    match self.handle_peer_event(event, &mut watchdog_armed).await {
                        Flow::Continue => {}
                        Flow::Stop => return,
                    }
                }

                message = signal_rx.recv() => {
                    match message {
                        Some(message) => {
                            match self.handle_signal(message).await {
                                Flow::Continue => {}
                                Flow::Stop => return,
                            }
                        }
                        None => {
                            warn!(call_id = %self.session.call_id, "signaling channel lost");
                            self.end(EndReason::SignalingUnavailable, false).await;
                            return;
                        }
                    }
                }
            }
        }
    }

    async fn handle_peer_event(&mut self, event: PeerEvent, watchdog_armed: &mut bool) -> Flow {
        match event {
            PeerEvent::LocalCandidate(candidate) => {
                let message = SignalMessage::IceCandidate {
                    call_id: self.session.call_id.clone(),
                    candidate,
                    from: self.session.local_user_id.clone(),
                    to: self.session.remote_user_id.clone(),
                };
                if let Err(e) = self.signaling.send(message).await {
                    warn!(error = %e, "failed to trickle local candidate");
                }
                Flow::Continue
            }
            PeerEvent::Update(PeerConnectionUpdate::Connected) => {
                self.establish(watchdog_armed);
                Flow::Continue
            }
            PeerEvent::Update(PeerConnectionUpdate::Failed) => {
                self.end(
                    EndReason::Negotiation("peer connection failed".to_string()),
                    true,
                )
                .await;
                Flow::Stop
            }
            PeerEvent::Update(PeerConnectionUpdate::Disconnected) => {
                // Transient by definition; either it recovers or the
                // transport moves to Failed.
                warn!(call_id = %self.session.call_id, "peer connection disconnected");
                Flow::Continue
            }
            PeerEvent::Update(PeerConnectionUpdate::Closed) => Flow::Continue,
            PeerEvent::RemoteTrack => {
                if !self.remote_stream_reported {
                    self.remote_stream_reported = true;
                    let _ = self.events_tx.send(CallEvent::RemoteStreamAvailable);
                }
                self.establish(watchdog_armed);
                Flow::Continue
            }
        }
    }

    async fn handle_signal(&mut self, message: SignalMessage) -> Flow {
        // Self-echo: the relay may loop room-addressed messages back
        if message.sender() == Some(self.session.local_user_id.as_str()) {
            return Flow::Continue;
        }
        // Cross-call traffic
        if let Some(call_id) = message.call_id() {
            if call_id != self.session.call_id {
                debug!(call_id, kind = message.kind_name(), "ignoring message for another call");
                return Flow::Continue;
            }
        }

        match message {
            SignalMessage::UserJoined { user_id, .. } => {
                self.learn_remote(&user_id);
                if self.session.role == CallRole::Caller {
                    if self.state.offer_sent {
                        debug!("duplicate user-joined, offer already sent");
                        return Flow::Continue;
                    }
                    self.state.offer_sent = true;
                    match self.adapter.create_offer().await {
                        Ok(offer) => {
                            if self.send_description(offer).await.is_err() {
                                return Flow::Continue;
                            }
                            self.set_phase(Phase::OfferSent);
                        }
                        Err(e) => {
                            self.end(EndReason::Negotiation(e.to_string()), true).await;
                            return Flow::Stop;
                        }
                    }
                }
                Flow::Continue
            }

            SignalMessage::Offer { offer, from, .. } => {
                if self.session.role != CallRole::Caller {
                    if self.state.answer_sent {
                        debug!("duplicate offer, answer already sent");
                        return Flow::Continue;
                    }
                    self.state.answer_sent = true;
                    self.learn_remote(&from);
                    match self.adapter.create_answer(&offer).await {
                        Ok(answer) => {
                            self.replay_pending_candidates().await;
                            if self.send_description(answer).await.is_err() {
                                return Flow::Continue;
                            }
                            self.set_phase(Phase::AnswerSent);
                            // Offer already applied, nothing left to wait
                            // for before transport setup
                            self.set_phase(Phase::Connecting);
                        }
                        Err(e) => {
                            self.end(EndReason::Negotiation(e.to_string()), true).await;
                            return Flow::Stop;
                        }
                    }
                }
                Flow::Continue
            }

            SignalMessage::Answer { answer, .. } => {
                if self.session.role == CallRole::Caller && self.state.phase == Phase::OfferSent {
                    match self.adapter.apply_remote_answer(&answer).await {
                        Ok(()) => {
                            self.replay_pending_candidates().await;
                            self.set_phase(Phase::Connecting);
                        }
                        Err(e) => {
                            self.end(EndReason::Negotiation(e.to_string()), true).await;
                            return Flow::Stop;
                        }
                    }
                }
                Flow::Continue
            }

            SignalMessage::IceCandidate { candidate, .. } => {
                if self.adapter.has_remote_description().await {
                    self.adapter.add_remote_candidate(&candidate).await;
                } else {
                    debug!("buffering early remote candidate");
                    self.state.pending_remote_candidates.push(candidate);
                }
                Flow::Continue
            }

            SignalMessage::EndCall { from, .. } | SignalMessage::CallEnded { from, .. } => {
                info!(call_id = %self.session.call_id, from = %from, "remote peer ended call");
                self.end(EndReason::RemoteHangup, false).await;
                Flow::Stop
            }

            SignalMessage::Error { message } => {
                warn!(call_id = %self.session.call_id, message = %message, "relay reported error");
                Flow::Continue
            }

            // Pre-negotiation invite traffic; irrelevant once a call runs
            SignalMessage::JoinCall { .. }
            | SignalMessage::Register { .. }
            | SignalMessage::CallRequest { .. }
            | SignalMessage::CallResponse { .. } => Flow::Continue,
        }
    }

    /// First connection-established signal wins; later ones are no-ops.
    fn establish(&mut self, watchdog_armed: &mut bool) {
        if self.state.connection_established_at.is_some() {
            return;
        }
        self.state.connection_established_at = Some(std::time::Instant::now());
        *watchdog_armed = false;
        info!(call_id = %self.session.call_id, "call established");
        self.adapter.log_connection_stats();
        self.set_phase(Phase::Active);
    }

    /// Callee may start without knowing the remote user; the first
    /// message naming a peer fills it in.
    fn learn_remote(&mut self, user_id: &str) {
        if self.session.remote_user_id.is_empty() && user_id != self.session.local_user_id {
            debug!(remote = %user_id, "learned remote peer identity");
            self.session.remote_user_id = user_id.to_string();
        }
    }

    async fn send_description(&mut self, description: SessionDescription) -> Result<()> {
        let message = match description.kind {
            crate::signaling::SdpKind::Offer => SignalMessage::Offer {
                call_id: self.session.call_id.clone(),
                offer: description,
                from: self.session.local_user_id.clone(),
                to: self.session.remote_user_id.clone(),
            },
            crate::signaling::SdpKind::Answer => SignalMessage::Answer {
                call_id: self.session.call_id.clone(),
                answer: description,
                from: self.session.local_user_id.clone(),
                to: self.session.remote_user_id.clone(),
            },
        };
        self.signaling.send(message).await.map_err(|e| {
            warn!(error = %e, "failed to send session description");
            Error::Signaling(e.to_string())
        })
    }

    /// Apply buffered candidates in receipt order, then clear the buffer.
    async fn replay_pending_candidates(&mut self) {
        let pending = std::mem::take(&mut self.state.pending_remote_candidates);
        if pending.is_empty() {
            return;
        }
        debug!(count = pending.len(), "replaying buffered remote candidates");
        for candidate in &pending {
            self.adapter.add_remote_candidate(candidate).await;
        }
    }

    fn set_phase(&mut self, phase: Phase) {
        if self.state.phase == phase {
            return;
        }
        debug!(
            call_id = %self.session.call_id,
            from = ?self.state.phase,
            to = ?phase,
            "phase transition"
        );
        self.state.phase = phase;
        let _ = self.events_tx.send(CallEvent::StatusChanged(phase));
    }

    /// Single teardown path. `notify_peer` is false when the remote side
    /// initiated the hang-up; echoing `end-call` back would bounce the
    /// teardown between peers.
    async fn end(&mut self, reason: EndReason, notify_peer: bool) {
        if self.ended {
            return;
        }
        self.ended = true;

        info!(call_id = %self.session.call_id, reason = %reason.describe(), "ending call");
        self.set_phase(Phase::Ending);

        if notify_peer {
            let message = SignalMessage::EndCall {
                call_id: self.session.call_id.clone(),
                from: self.session.local_user_id.clone(),
                to: self.session.remote_user_id.clone(),
            };
            if let Err(e) = self.signaling.send(message).await {
                debug!(error = %e, "could not notify peer of hang-up");
            }
        }

        self.media.release();
        if let Err(e) = self.adapter.close().await {
            warn!(error = %e, "peer connection close failed during teardown");
        }
        self.signaling.close().await;

        let terminal = if reason.is_failure() {
            Phase::Failed
        } else {
            Phase::Idle
        };
        self.set_phase(terminal);
        let _ = self.events_tx.send(CallEvent::Ended(reason));
    }
}

enum Flow {
    Continue,
    Stop,
}

//! WebSocket signaling client
//!
//! Owns the relay connection on a single background task: one half of the
//! select loop drains the outgoing queue into the socket, the other parses
//! relay frames into [`SignalMessage`]s. A transport drop triggers a bounded
//! reconnect with exponential backoff; every successful reconnect replays
//! the join message so the relay re-registers this client in the call room.
//! When the retry budget is exhausted the incoming stream ends, which the
//! coordinator treats as signaling loss.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{error::ProtocolError, Error as WsError, Message},
    MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, warn};

use crate::config::ReconnectPolicy;
use crate::signaling::{SignalMessage, SignalReceiver, SignalingChannel, SignalingConnector};
use crate::{Error, Result};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Signaling channel over a WebSocket connection to the relay.
pub struct WebSocketSignaling {
    outgoing_tx: mpsc::UnboundedSender<SignalMessage>,
    shutdown_tx: watch::Sender<bool>,
    task: Option<tokio::task::JoinHandle<()>>,
}

impl WebSocketSignaling {
    /// Connect to the relay and announce presence with `join`.
    ///
    /// Returns the outbound channel and the inbound message stream. The
    /// same join message is replayed after every reconnect.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SignalingUnavailable`] if the initial connection
    /// cannot be established.
    pub async fn connect(
        url: &str,
        join: SignalMessage,
        policy: ReconnectPolicy,
    ) -> Result<(Self, SignalReceiver)> {
        let (ws, _) = connect_async(url)
            .await
            .map_err(|e| Error::SignalingUnavailable(format!("connect to {url} failed: {e}")))?;
        debug!(url = %url, "signaling websocket connected");

        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let task = tokio::spawn(run_socket(
            ws,
            url.to_string(),
            join,
            policy,
            outgoing_rx,
            incoming_tx,
            shutdown_rx,
        ));

        let channel = Self {
            outgoing_tx,
            shutdown_tx,
            task: Some(task),
        };
        Ok((channel, incoming_rx))
    }
}

/// Connector producing [`WebSocketSignaling`] channels for a fixed relay.
pub struct WebSocketConnector {
    url: String,
    policy: ReconnectPolicy,
}

impl WebSocketConnector {
    pub fn new(url: &str, policy: ReconnectPolicy) -> Self {
        Self {
            url: url.to_string(),
            policy,
        }
    }
}

#[async_trait]
impl SignalingConnector for WebSocketConnector {
    async fn connect(
        &self,
        join: SignalMessage,
    ) -> Result<(Box<dyn SignalingChannel>, SignalReceiver)> {
        let (channel, receiver) =
            WebSocketSignaling::connect(&self.url, join, self.policy.clone()).await?;
        Ok((Box::new(channel), receiver))
    }
}

#[async_trait]
impl SignalingChannel for WebSocketSignaling {
    async fn send(&self, message: SignalMessage) -> Result<()> {
        self.outgoing_tx
            .send(message)
            .map_err(|_| Error::Signaling("signaling channel closed".to_string()))
    }

    async fn close(&self) {
        // Repeated closes are no-ops; the socket task exits on first signal.
        let _ = self.shutdown_tx.send(true);
    }
}

impl Drop for WebSocketSignaling {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Socket supervisor: pump one connection until it drops, then reconnect
/// within the retry budget. Returning closes the incoming channel.
async fn run_socket(
    mut ws: WsStream,
    url: String,
    join: SignalMessage,
    policy: ReconnectPolicy,
    mut outgoing_rx: mpsc::UnboundedReceiver<SignalMessage>,
    incoming_tx: mpsc::UnboundedSender<SignalMessage>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        match pump_connection(
            &mut ws,
            &join,
            &mut outgoing_rx,
            &incoming_tx,
            &mut shutdown_rx,
        )
        .await
        {
            PumpExit::Shutdown => {
                let _ = ws.close(None).await;
                debug!("signaling websocket closed by local shutdown");
                return;
            }
            PumpExit::ConnectionLost => {
                match reconnect(&url, &policy, &mut shutdown_rx).await {
                    Some(next) => {
                        ws = next;
                        // Re-register in the call room; the relay forgot us
                        // when the old socket dropped.
                        debug!(url = %url, "signaling websocket reconnected");
                    }
                    None => {
                        warn!(url = %url, "signaling reconnection attempts exhausted");
                        return;
                    }
                }
            }
        }
    }
}

enum PumpExit {
    Shutdown,
    ConnectionLost,
}

async fn pump_connection(
    ws: &mut WsStream,
    join: &SignalMessage,
    outgoing_rx: &mut mpsc::UnboundedReceiver<SignalMessage>,
    incoming_tx: &mpsc::UnboundedSender<SignalMessage>,
    shutdown_rx: &mut watch::Receiver<bool>,
) -> PumpExit {
    match join.to_json() {
        Ok(text) => {
            if let Err(e) = ws.send(Message::Text(text)).await {
                warn!(error = %e, "failed to send join message");
                return PumpExit::ConnectionLost;
            }
            debug!(kind = join.kind_name(), "sent join message");
        }
        Err(e) => {
            warn!(error = %e, "failed to serialize join message");
            return PumpExit::Shutdown;
        }
    }

    loop {
        tokio::select! {
            biased;

            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    return PumpExit::Shutdown;
                }
            }

            outbound = outgoing_rx.recv() => {
                let Some(message) = outbound else {
                    // All senders dropped; nothing left to do on this socket.
                    return PumpExit::Shutdown;
                };
                let text = match message.to_json() {
                    Ok(text) => text,
                    Err(e) => {
                        warn!(error = %e, kind = message.kind_name(), "dropping unserializable message");
                        continue;
                    }
                };
                if let Err(e) = ws.send(Message::Text(text)).await {
                    warn!(error = %e, "signaling send failed");
                    return PumpExit::ConnectionLost;
                }
            }

            inbound = ws.next() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => {
                        forward_frame(&text, incoming_tx);
                    }
                    Some(Ok(Message::Binary(data))) => {
                        if let Ok(text) = String::from_utf8(data) {
                            forward_frame(&text, incoming_tx);
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        debug!("signaling websocket closed by relay");
                        return PumpExit::ConnectionLost;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        match &err {
                            WsError::ConnectionClosed
                            | WsError::AlreadyClosed
                            | WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake) => {
                                debug!("signaling websocket dropped: {err}");
                            }
                            _ => warn!("signaling websocket error: {err}"),
                        }
                        return PumpExit::ConnectionLost;
                    }
                }
            }
        }
    }
}

fn forward_frame(text: &str, incoming_tx: &mpsc::UnboundedSender<SignalMessage>) {
    match SignalMessage::from_json(text) {
        Ok(message) => {
            let _ = incoming_tx.send(message);
        }
        Err(e) => {
            // Unknown frames are skipped, not fatal; relays may speak a
            // superset of this protocol.
            warn!(error = %e, "ignoring unparseable signaling frame");
        }
    }
}

async fn reconnect(
    url: &str,
    policy: &ReconnectPolicy,
    shutdown_rx: &mut watch::Receiver<bool>,
) -> Option<WsStream> {
    let mut attempt = 0;
    while policy.should_retry(attempt) {
        let delay = policy.calculate_backoff(attempt);
        debug!(attempt, delay_ms = delay.as_millis() as u64, "signaling reconnect backoff");

        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    return None;
                }
            }
            _ = tokio::time::sleep(delay) => {}
        }

        match connect_async(url).await {
            Ok((ws, _)) => return Some(ws),
            Err(e) => {
                warn!(attempt, error = %e, "signaling reconnect attempt failed");
                attempt += 1;
            }
        }
    }
    None
}

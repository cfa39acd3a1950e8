//! WebSocket live feed.
//!
//! Connected UIs receive a mirrored stream of pipeline envelopes and log
//! events. The feed is advisory and lossy: a slow client skips messages
//! rather than slowing the pipeline down.

use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::debug;

use crate::events::Envelope;

/// How often to send WebSocket Ping frames.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// How long to wait for a Pong response before considering the connection dead.
const PONG_TIMEOUT: Duration = Duration::from_secs(60);

/// How long a single frame write may take before the client is dropped.
const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Buffered messages on the broadcast channel; older messages are skipped
/// by clients that lag past this.
const BROADCAST_CAPACITY: usize = 512;

/// Fan-out point for the live feed. Cloning shares the underlying channel.
#[derive(Clone)]
pub struct Hub {
    tx: broadcast::Sender<String>,
}

impl Default for Hub {
    fn default() -> Self {
        Self::new()
    }
}

impl Hub {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self { tx }
    }

    /// Forward a bus envelope to every connected client.
    pub fn broadcast_envelope(&self, envelope: &Envelope) {
        match serde_json::to_string(envelope) {
            Ok(json) => self.broadcast_raw(json),
            Err(err) => debug!(error = %err, "failed to serialize envelope for live feed"),
        }
    }

    /// Enqueue pre-serialized JSON. Never blocks; silently dropped when no
    /// client is connected.
    pub fn broadcast_raw(&self, json: String) {
        let _ = self.tx.send(json);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.tx.subscribe()
    }
}

// ── WebSocket handler ─────────────────────────────────────────────────

pub async fn ws_handler(ws: WebSocketUpgrade, hub: Hub) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, hub))
}

async fn handle_socket(socket: WebSocket, hub: Hub) {
    let (sender, receiver) = socket.split();
    run_socket_loop(sender, receiver, hub.subscribe()).await;
}

/// Core per-client loop with ping/pong keepalive.
///
/// Combines broadcast forwarding, client frame receiving, and periodic
/// ping/pong health checking into a single select loop. If no Pong arrives
/// within [`PONG_TIMEOUT`] after a Ping, or a write stalls past
/// [`WRITE_TIMEOUT`], the connection is considered dead and the loop exits.
async fn run_socket_loop(
    mut sender: SplitSink<WebSocket, Message>,
    mut receiver: SplitStream<WebSocket>,
    mut rx: broadcast::Receiver<String>,
) {
    let mut ping_interval = tokio::time::interval(PING_INTERVAL);
    // The first tick completes immediately; consume it so the first real
    // ping fires after PING_INTERVAL has elapsed.
    ping_interval.tick().await;

    let mut last_pong = Instant::now();
    let mut awaiting_pong = false;

    loop {
        tokio::select! {
            // ── Periodic ping ───────────────────────────────────────
            _ = ping_interval.tick() => {
                if awaiting_pong && last_pong.elapsed() > PONG_TIMEOUT {
                    break;
                }
                if sender.send(Message::Ping(vec![])).await.is_err() {
                    break;
                }
                awaiting_pong = true;
            }

            // ── Broadcast forwarding ────────────────────────────────
            result = rx.recv() => {
                match result {
                    Ok(msg) => {
                        match tokio::time::timeout(WRITE_TIMEOUT, sender.send(Message::Text(msg))).await {
                            Ok(Ok(())) => {}
                            // write error or deadline: client is gone
                            _ => break,
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        // Lossy by design; the client just misses some frames.
                        debug!(skipped, "live-feed client lagged");
                        continue;
                    }
                }
            }

            // ── Client frames (pong, close, etc.) ───────────────────
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Pong(_))) => {
                        last_pong = Instant::now();
                        awaiting_pong = false;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {
                        // The feed is one-way; ignore client text/binary.
                    }
                    Some(Err(_)) => break,
                }
            }
        }
    }

    // Best-effort close frame
    let _ = sender.send(Message::Close(None)).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{wrap, FigmaFailed, FIGMA_FAILED};

    #[tokio::test]
    async fn broadcast_delivers_to_every_subscriber() {
        let hub = Hub::new();
        let mut rx1 = hub.subscribe();
        let mut rx2 = hub.subscribe();

        hub.broadcast_raw("{\"step\":\"codegen_start\"}".to_string());

        let received1 = rx1.recv().await.unwrap();
        let received2 = rx2.recv().await.unwrap();
        assert_eq!(received1, received2);
        assert!(received1.contains("codegen_start"));
    }

    #[tokio::test]
    async fn broadcast_without_subscribers_does_not_panic() {
        let hub = Hub::new();
        hub.broadcast_raw("dropped on the floor".to_string());
    }

    #[tokio::test]
    async fn envelopes_arrive_as_their_wire_json() {
        let hub = Hub::new();
        let mut rx = hub.subscribe();

        let payload = FigmaFailed {
            job_id: "job-1".into(),
            error: "boom".into(),
        };
        let bytes = wrap(FIGMA_FAILED, &payload).unwrap();
        let envelope = crate::events::unwrap_envelope(&bytes).unwrap();
        hub.broadcast_envelope(&envelope);

        let received = rx.recv().await.unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&received).unwrap();
        assert_eq!(parsed["routing_key"], FIGMA_FAILED);
        assert_eq!(parsed["payload"]["job_id"], "job-1");
    }

    #[test]
    fn keepalive_timing_is_sensible() {
        // PONG_TIMEOUT must exceed PING_INTERVAL so a fresh connection is
        // not immediately considered dead.
        assert!(PONG_TIMEOUT > PING_INTERVAL);
        assert!(WRITE_TIMEOUT < PING_INTERVAL);
        assert_eq!(PING_INTERVAL, Duration::from_secs(30));
        assert_eq!(PONG_TIMEOUT, Duration::from_secs(60));
    }
}

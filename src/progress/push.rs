//! Push channel manager
//!
//! Owns one persistent WebSocket per watched session. The connection moves
//! `Connecting -> Open -> Closed`; `Closed` is reachable from either prior
//! state. While open, an owned keepalive timer sends an opaque text ping
//! and the server answers with a `keepalive-ack` envelope, which is
//! discarded here. The manager never retries on its own: any
//! transport-level failure stops it and is reported to the owner as
//! [`ChannelEvent::Unavailable`], leaving the fallback decision to the
//! reconciler.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::interval;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::envelope::{Envelope, EnvelopeKind};
use super::reconciler::ProgressChannel;
use super::ChannelEvent;
use crate::config::{Settings, KEEPALIVE_INTERVAL_SECS};

/// Client keepalive frame; opaque text, the server only has to answer it.
const KEEPALIVE_FRAME: &str = "ping";

/// Persistent-connection delivery of progress envelopes.
pub struct PushChannel {
    settings: Settings,
    keepalive_interval: Duration,
}

impl PushChannel {
    /// Create a push channel addressing the configured server.
    #[must_use]
    pub fn new(settings: &Settings) -> Self {
        Self {
            settings: settings.clone(),
            keepalive_interval: Duration::from_secs(KEEPALIVE_INTERVAL_SECS),
        }
    }

    /// Override the keepalive interval (tests use short intervals).
    #[must_use]
    pub fn with_keepalive_interval(mut self, interval: Duration) -> Self {
        self.keepalive_interval = interval;
        self
    }

    /// Connect and deliver envelopes for `session_id` until a terminal
    /// envelope, a transport failure, or cancellation.
    ///
    /// Emits each parsed non-keepalive envelope as [`ChannelEvent::Update`].
    /// After forwarding its first terminal envelope the channel closes the
    /// connection and returns without emitting anything further. A failure
    /// at any point (connect refused, stream error, server-side close
    /// before a terminal envelope) emits one [`ChannelEvent::Unavailable`].
    pub async fn run(
        &self,
        session_id: &str,
        events: mpsc::Sender<ChannelEvent>,
        cancel: CancellationToken,
    ) {
        let url = self.settings.ws_progress_url(session_id);
        debug!(%url, "push channel connecting");

        let connect = tokio::select! {
            () = cancel.cancelled() => return,
            res = connect_async(url.as_str()) => res,
        };

        let mut socket = match connect {
            Ok((socket, _response)) => socket,
            Err(e) => {
                debug!(error = %e, "push channel failed to connect");
                let _ = events
                    .send(ChannelEvent::Unavailable(format!("connect failed: {e}")))
                    .await;
                return;
            }
        };

        debug!(%session_id, "push channel open");

        // Keepalive runs only while the connection is open; dropping the
        // interval with the socket cancels it.
        let mut keepalive = interval(self.keepalive_interval);
        keepalive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // interval() fires immediately; the connection itself already
        // proves liveness at that point.
        keepalive.tick().await;

        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    let _ = socket.close(None).await;
                    return;
                }
                _ = keepalive.tick() => {
                    if let Err(e) = socket.send(Message::Text(KEEPALIVE_FRAME.to_string())).await {
                        warn!(error = %e, "push channel keepalive failed");
                        let _ = events
                            .send(ChannelEvent::Unavailable(format!("keepalive failed: {e}")))
                            .await;
                        return;
                    }
                }
                frame = socket.next() => {
                    match frame {
                        Some(Ok(Message::Text(text))) => {
                            let Some(envelope) = handle_frame(&text) else {
                                continue;
                            };
                            let terminal = envelope.is_terminal();
                            if events.send(ChannelEvent::Update(envelope)).await.is_err() {
                                // Owner went away; nothing left to deliver to.
                                let _ = socket.close(None).await;
                                return;
                            }
                            if terminal {
                                debug!(%session_id, "push channel observed terminal envelope");
                                let _ = socket.close(None).await;
                                return;
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            debug!(%session_id, "push channel closed by server");
                            let _ = events
                                .send(ChannelEvent::Unavailable(
                                    "connection closed before terminal envelope".to_string(),
                                ))
                                .await;
                            return;
                        }
                        Some(Ok(_)) => {
                            // Binary/ping/pong frames carry no envelopes.
                        }
                        Some(Err(e)) => {
                            warn!(error = %e, "push channel stream error");
                            let _ = events
                                .send(ChannelEvent::Unavailable(format!("stream error: {e}")))
                                .await;
                            return;
                        }
                    }
                }
            }
        }
    }
}

#[async_trait]
impl ProgressChannel for PushChannel {
    async fn run(
        self: Arc<Self>,
        session_id: String,
        events: mpsc::Sender<ChannelEvent>,
        cancel: CancellationToken,
    ) {
        Self::run(&self, &session_id, events, cancel).await;
    }
}

/// Parse one inbound text frame.
///
/// Returns `None` for keepalive acks and for malformed frames; a single
/// corrupt frame must not abort an otherwise healthy stream.
fn handle_frame(text: &str) -> Option<Envelope> {
    match Envelope::parse(text) {
        Ok(envelope) if envelope.kind == EnvelopeKind::KeepaliveAck => {
            debug!("discarding keepalive ack");
            None
        }
        Ok(envelope) => Some(envelope),
        Err(e) => {
            debug!(error = %e, "dropping malformed frame");
            None
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_handle_frame_forwards_progress() {
        let env = handle_frame(r#"{"status": "processing", "progress": 1, "total": 3}"#).unwrap();
        assert_eq!(env.kind, EnvelopeKind::Progress);
        assert_eq!(env.completed_count, 1);
    }

    #[test]
    fn test_handle_frame_discards_keepalive_ack() {
        assert!(handle_frame(r#"{"kind": "keepalive-ack"}"#).is_none());
    }

    #[test]
    fn test_handle_frame_drops_malformed() {
        assert!(handle_frame("{not json").is_none());
        assert!(handle_frame(r#"{"status": "???"}"#).is_none());
    }

    #[test]
    fn test_handle_frame_recognizes_terminal() {
        let env = handle_frame(r#"{"status": "completed", "progress": 3, "total": 3}"#).unwrap();
        assert!(env.is_terminal());

        let env = handle_frame(r#"{"status": "error", "error": "rate limited"}"#).unwrap();
        assert!(env.is_terminal());
    }
}

//! Read and write pumps for one extension socket.
//!
//! Each session runs exactly two long-lived tasks. The write pump drains the
//! bounded outbound queue into the socket under a per-write deadline and
//! drives periodic liveness pings. The read pump enforces the heartbeat
//! deadline and dispatches inbound frames by tag. Either pump exiting tears
//! the session down; the registry removal is identity-checked so a
//! superseded session cannot evict its takeover replacement.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use chrono::Utc;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tabrelay_core::protocol::{ExtensionMessage, ServerMessage, Tab};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{Hub, Session};

/// Runs both pumps for a freshly registered session until the socket dies,
/// the heartbeat deadline lapses, or the session is taken over. Unregisters
/// the session on the way out.
pub async fn run(
    hub: Arc<Hub>,
    session: Arc<Session>,
    socket: WebSocket,
    outbound_rx: mpsc::Receiver<String>,
) {
    let (sink, stream) = socket.split();

    let writer = tokio::spawn(write_pump(Arc::clone(&session), sink, outbound_rx, {
        let cfg = hub.config();
        (cfg.write_timeout(), cfg.ping_interval())
    }));

    read_pump(&hub, &session, stream).await;

    hub.unregister(&session);
    // The done signal above makes the write pump exit promptly.
    let _ = writer.await;
}

async fn write_pump(
    session: Arc<Session>,
    mut sink: SplitSink<WebSocket, Message>,
    mut outbound: mpsc::Receiver<String>,
    (write_timeout, ping_interval): (std::time::Duration, std::time::Duration),
) {
    let mut ping = tokio::time::interval(ping_interval);
    ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // An interval's first tick is immediate; the first ping should come one
    // interval after the handshake.
    ping.tick().await;

    loop {
        tokio::select! {
            () = session.done.cancelled() => {
                let _ = sink.send(Message::Close(None)).await;
                break;
            }
            frame = outbound.recv() => {
                let Some(frame) = frame else { break };
                if !write_with_deadline(&session, &mut sink, frame, write_timeout).await {
                    break;
                }
            }
            _ = ping.tick() => {
                let ping_frame = ServerMessage::Ping {
                    timestamp: Utc::now().timestamp_millis(),
                };
                let Ok(frame) = serde_json::to_string(&ping_frame) else {
                    continue;
                };
                if !write_with_deadline(&session, &mut sink, frame, write_timeout).await {
                    break;
                }
            }
        }
    }
}

async fn write_with_deadline(
    session: &Session,
    sink: &mut SplitSink<WebSocket, Message>,
    frame: String,
    write_timeout: std::time::Duration,
) -> bool {
    match tokio::time::timeout(write_timeout, sink.send(Message::Text(frame.into()))).await {
        Ok(Ok(())) => true,
        Ok(Err(err)) => {
            warn!(session_id = %session.id, error = %err, "socket write failed");
            false
        }
        Err(_) => {
            warn!(session_id = %session.id, "socket write deadline exceeded");
            false
        }
    }
}

async fn read_pump(hub: &Hub, session: &Arc<Session>, mut stream: SplitStream<WebSocket>) {
    let read_deadline = hub.config().read_deadline();
    let mut deadline = tokio::time::Instant::now() + read_deadline;

    loop {
        let next = tokio::select! {
            () = session.done.cancelled() => break,
            next = tokio::time::timeout_at(deadline, stream.next()) => next,
        };

        let message = match next {
            Err(_) => {
                warn!(session_id = %session.id, "heartbeat deadline expired");
                break;
            }
            Ok(None) => break,
            Ok(Some(Err(err))) => {
                warn!(session_id = %session.id, error = %err, "socket read error");
                break;
            }
            Ok(Some(Ok(message))) => message,
        };

        match message {
            Message::Text(text) => {
                let frame = match serde_json::from_str::<ExtensionMessage>(text.as_str()) {
                    Ok(frame) => frame,
                    Err(err) => {
                        debug!(
                            session_id = %session.id,
                            error = %err,
                            "ignoring unrecognized frame"
                        );
                        continue;
                    }
                };
                // Only heartbeats refresh the read deadline.
                if apply_frame(hub, session, frame) {
                    deadline = tokio::time::Instant::now() + read_deadline;
                }
            }
            Message::Close(_) => break,
            // Transport-level ping/pong is answered by the WebSocket layer.
            Message::Ping(_) | Message::Pong(_) => {}
            Message::Binary(_) => {
                debug!(session_id = %session.id, "ignoring binary frame");
            }
        }
    }
}

/// Applies one decoded extension frame to the session. Returns whether the
/// frame was a heartbeat.
pub(crate) fn apply_frame(hub: &Hub, session: &Session, frame: ExtensionMessage) -> bool {
    match frame {
        ExtensionMessage::TabAttach {
            tab_id,
            url,
            title,
            fav_icon_url,
        } => {
            debug!(session_id = %session.id, tab_id = %tab_id, url = %url, "tab attached");
            session.insert_tab(Tab {
                id: tab_id,
                url,
                title,
                fav_icon_url,
                attached_at: Utc::now(),
            });
            false
        }
        ExtensionMessage::TabDetach { tab_id } => {
            debug!(session_id = %session.id, tab_id = %tab_id, "tab detached");
            session.remove_tab(&tab_id);
            false
        }
        ExtensionMessage::TabUpdate { tab_id, url, title } => {
            session.update_tab(&tab_id, url, title);
            false
        }
        ExtensionMessage::Pong { tab_count, .. } => {
            debug!(session_id = %session.id, tab_count, "heartbeat");
            session.touch_heartbeat();
            true
        }
        ExtensionMessage::CommandResponse(resp) => {
            hub.handle_response(resp);
            false
        }
    }
}

#![forbid(unsafe_code)]

// WebSocket connection handler for individual clients

use super::protocol::{ClientMessage, ServerMessage};
use crate::error::{SignalError, SignalResult};
use crate::metrics::ServerMetrics;
use crate::room::RoomManager;
use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::OwnedSemaphorePermit;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Bounded channel capacity per client.
/// At the 30 msg/s refill rate, 64 slots buffer two seconds of backlog.
/// Messages queued beyond this are stale; drop them early.
const CHANNEL_CAPACITY: usize = 64;

/// Idle timeout; close the connection if no frame arrives within this window.
/// Prevents Slowloris-style clients from holding semaphore permits forever.
const IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// Token bucket rate limiter: max tokens (burst capacity).
const RATE_LIMIT_MAX_TOKENS: u64 = 60;
/// Token bucket: refill rate in tokens per second.
const RATE_LIMIT_REFILL_RATE: u64 = 30;
/// Internal: 1 token in microseconds (for integer math).
const TOKEN_US: u64 = 1_000_000;
/// Internal: max tokens in microseconds.
const MAX_TOKENS_US: u64 = RATE_LIMIT_MAX_TOKENS * TOKEN_US;

/// Serialize a ServerMessage and queue it on the client's channel. Overflow
/// and disconnect are logged and swallowed; the broadcast path already
/// tolerates lossy delivery.
fn send_json(sender: &mpsc::Sender<Arc<String>>, message: &ServerMessage) {
    let json = match serde_json::to_string(message) {
        Ok(j) => Arc::new(j),
        Err(e) => {
            warn!("failed to serialize server message: {e}");
            return;
        }
    };
    if let Err(e) = sender.try_send(json) {
        debug!("failed to queue server message: {e}");
    }
}

/// Handles a single WebSocket connection
pub async fn handle_connection(
    socket: WebSocket,
    manager: Arc<RoomManager>,
    metrics: ServerMetrics,
    _permit: OwnedSemaphorePermit,
) {
    let connection_id = Uuid::new_v4().to_string();
    info!(%connection_id, "new websocket connection");

    metrics.inc_connections_total();
    let _conn_guard = metrics.connection_active_guard();

    let (mut ws_sender, mut ws_receiver) = socket.split();

    // Bounded channel for sending messages to this client
    let (tx, mut rx) = mpsc::channel::<Arc<String>>(CHANNEL_CAPACITY);

    // Spawn task to forward queued messages to the client
    let send_task = tokio::spawn(async move {
        while let Some(json) = rx.recv().await {
            if ws_sender
                .send(Message::Text((*json).clone().into()))
                .await
                .is_err()
            {
                break;
            }
        }
    });

    // Which (room, peer) this socket is joined as, if any
    let mut membership: Option<(String, String)> = None;

    // Token bucket rate limiter state
    let mut tokens_us: u64 = MAX_TOKENS_US;
    let mut last_refill = Instant::now();
    let mut rate_limit_warned = false;

    loop {
        let msg = match tokio::time::timeout(IDLE_TIMEOUT, ws_receiver.next()).await {
            Ok(Some(Ok(message))) => message,
            Ok(Some(Err(_))) | Ok(None) => break,
            Err(_) => {
                warn!(%connection_id, "idle timeout, closing connection");
                break;
            }
        };

        match msg {
            Message::Text(text) => {
                metrics.inc_messages_received();

                // Token bucket rate limiting
                let now = Instant::now();
                let elapsed_us = now.duration_since(last_refill).as_micros() as u64;
                last_refill = now;
                tokens_us = (tokens_us + elapsed_us * RATE_LIMIT_REFILL_RATE).min(MAX_TOKENS_US);

                if tokens_us >= TOKEN_US {
                    tokens_us -= TOKEN_US;
                    rate_limit_warned = false;
                } else {
                    metrics.inc_rate_limited();
                    if !rate_limit_warned {
                        rate_limit_warned = true;
                        warn!(%connection_id, "rate limit exceeded");
                        send_json(
                            &tx,
                            &ServerMessage::Error {
                                message: format!(
                                    "rate limit exceeded: max {RATE_LIMIT_REFILL_RATE} messages/second"
                                ),
                            },
                        );
                    }
                    continue;
                }

                // Malformed JSON is logged and dropped, never answered.
                let client_msg = match serde_json::from_str::<ClientMessage>(&text) {
                    Ok(message) => message,
                    Err(e) => {
                        warn!(%connection_id, "invalid message format: {e}");
                        metrics.inc_protocol_errors();
                        continue;
                    }
                };

                let start = Instant::now();
                let result =
                    handle_client_message(client_msg, &mut membership, &tx, &manager).await;
                metrics.observe_message_handling(start.elapsed());

                if let Err(e) = result {
                    metrics.inc_signal_errors();
                    debug!(%connection_id, "signal error: {e}");
                    // If the channel is closed the send task has exited
                    if tx.is_closed() {
                        break;
                    }
                    send_json(
                        &tx,
                        &ServerMessage::Error {
                            message: e.to_string(),
                        },
                    );
                }
            }
            Message::Close(_) => {
                debug!(%connection_id, "client closed connection");
                break;
            }
            Message::Ping(_) | Message::Pong(_) => {
                // Handled by the websocket layer; counts as activity.
            }
            _ => {
                warn!(%connection_id, "unexpected message type from client");
            }
        }
    }

    // Disconnect is an implicit leave.
    if let Some((room_id, peer_id)) = membership.take() {
        if let Err(e) = manager.leave(&room_id, &peer_id).await {
            debug!(%room_id, %peer_id, "cleanup after disconnect: {e}");
        }
    }

    drop(tx);
    let _ = send_task.await;
    info!(%connection_id, "connection handler finished");
}

/// The session must be joined to exactly the room the message names.
fn scoped_peer(membership: &Option<(String, String)>, room_id: &str) -> SignalResult<String> {
    match membership {
        Some((joined_room, peer_id)) if joined_room == room_id => Ok(peer_id.clone()),
        Some(_) => Err(SignalError::Validation(format!(
            "not joined to room {room_id}"
        ))),
        None => Err(SignalError::Validation("not in a room".to_string())),
    }
}

/// Handle a single client message
async fn handle_client_message(
    message: ClientMessage,
    membership: &mut Option<(String, String)>,
    sender: &mpsc::Sender<Arc<String>>,
    manager: &Arc<RoomManager>,
) -> SignalResult<()> {
    match message {
        ClientMessage::JoinRoom {
            room_id,
            peer_id,
            name,
        } => {
            // A second join on the same socket moves it: leave the old room first.
            if let Some((old_room, old_peer)) = membership.take() {
                if let Err(e) = manager.leave(&old_room, &old_peer).await {
                    debug!(%old_room, %old_peer, "leave before rejoin: {e}");
                }
            }

            let snapshot = manager
                .join(&room_id, &peer_id, &name, sender.clone())
                .await?;
            *membership = Some((room_id.clone(), peer_id.clone()));

            send_json(
                sender,
                &ServerMessage::RoomJoined {
                    room_id,
                    peer_id,
                    existing_peers: snapshot.existing_peers,
                    chat_history: snapshot.chat_history,
                },
            );
        }

        ClientMessage::LeaveRoom => {
            let (room_id, peer_id) = membership
                .take()
                .ok_or_else(|| SignalError::Validation("not in a room".to_string()))?;
            manager.leave(&room_id, &peer_id).await?;
        }

        ClientMessage::ChatMessage { room_id, message } => {
            let peer_id = scoped_peer(membership, &room_id)?;
            manager.post_chat(&room_id, &peer_id, message).await?;
        }

        ClientMessage::ProducerPause {
            room_id,
            producer_id,
        } => {
            let peer_id = scoped_peer(membership, &room_id)?;
            manager.pause_producer(&room_id, &peer_id, producer_id).await?;
        }

        ClientMessage::ProducerResume {
            room_id,
            producer_id,
        } => {
            let peer_id = scoped_peer(membership, &room_id)?;
            manager
                .resume_producer(&room_id, &peer_id, producer_id)
                .await?;
        }

        ClientMessage::ProducerClose {
            room_id,
            producer_id,
        } => {
            let peer_id = scoped_peer(membership, &room_id)?;
            manager
                .close_producer(&room_id, &peer_id, producer_id)
                .await?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MediaConfig;
    use crate::engine::MediaEngine;
    use crate::engine::stub::StubEngine;
    use crate::engine::types::ProducerId;
    use crate::signaling::protocol::ChatDraft;
    use crate::worker_pool::WorkerPool;
    use serde_json::Value;

    async fn manager() -> Arc<RoomManager> {
        let engine: Arc<dyn MediaEngine> = Arc::new(StubEngine::new());
        let config = MediaConfig {
            num_workers: 1,
            ..MediaConfig::default()
        };
        let pool = Arc::new(
            WorkerPool::new(engine, &config)
                .await
                .expect("worker pool starts"),
        );
        Arc::new(RoomManager::new(pool, config, ServerMetrics::new()))
    }

    fn drain(rx: &mut mpsc::Receiver<Arc<String>>) -> Vec<Value> {
        let mut out = Vec::new();
        while let Ok(raw) = rx.try_recv() {
            out.push(serde_json::from_str(&raw).expect("valid json"));
        }
        out
    }

    #[tokio::test]
    async fn join_then_chat_dispatches_to_the_room() {
        let manager = manager().await;
        let (tx, mut rx) = mpsc::channel(CHANNEL_CAPACITY);
        let mut membership = None;

        handle_client_message(
            ClientMessage::JoinRoom {
                room_id: "ABCD".to_string(),
                peer_id: "p1".to_string(),
                name: "Ann".to_string(),
            },
            &mut membership,
            &tx,
            &manager,
        )
        .await
        .expect("join");
        assert_eq!(
            membership,
            Some(("ABCD".to_string(), "p1".to_string()))
        );

        handle_client_message(
            ClientMessage::ChatMessage {
                room_id: "ABCD".to_string(),
                message: ChatDraft {
                    id: None,
                    sender: None,
                    text: "hi".to_string(),
                },
            },
            &mut membership,
            &tx,
            &manager,
        )
        .await
        .expect("chat");

        let events = drain(&mut rx);
        assert_eq!(events[0]["type"], "room-joined");
        assert_eq!(events[0]["peerId"], "p1");
        assert!(events.iter().any(|e| e["type"] == "chat-message"));
    }

    #[tokio::test]
    async fn room_scoped_messages_must_name_the_joined_room() {
        let manager = manager().await;
        let (tx, _rx) = mpsc::channel(CHANNEL_CAPACITY);
        let mut membership = None;

        handle_client_message(
            ClientMessage::JoinRoom {
                room_id: "ABCD".to_string(),
                peer_id: "p1".to_string(),
                name: "Ann".to_string(),
            },
            &mut membership,
            &tx,
            &manager,
        )
        .await
        .expect("join");

        let err = handle_client_message(
            ClientMessage::ProducerPause {
                room_id: "OTHER".to_string(),
                producer_id: ProducerId::new(),
            },
            &mut membership,
            &tx,
            &manager,
        )
        .await
        .expect_err("wrong room");
        assert!(matches!(err, SignalError::Validation(_)));
    }

    #[tokio::test]
    async fn leave_without_join_is_an_error() {
        let manager = manager().await;
        let (tx, _rx) = mpsc::channel(CHANNEL_CAPACITY);
        let mut membership = None;

        let err = handle_client_message(ClientMessage::LeaveRoom, &mut membership, &tx, &manager)
            .await
            .expect_err("never joined");
        assert!(matches!(err, SignalError::Validation(_)));
    }

    #[tokio::test]
    async fn rejoining_moves_the_session_between_rooms() {
        let manager = manager().await;
        let (tx, mut rx) = mpsc::channel(CHANNEL_CAPACITY);
        let mut membership = None;

        handle_client_message(
            ClientMessage::JoinRoom {
                room_id: "FIRST".to_string(),
                peer_id: "p1".to_string(),
                name: "Ann".to_string(),
            },
            &mut membership,
            &tx,
            &manager,
        )
        .await
        .expect("first join");

        handle_client_message(
            ClientMessage::JoinRoom {
                room_id: "SECOND".to_string(),
                peer_id: "p1".to_string(),
                name: "Ann".to_string(),
            },
            &mut membership,
            &tx,
            &manager,
        )
        .await
        .expect("second join");

        assert_eq!(
            membership,
            Some(("SECOND".to_string(), "p1".to_string()))
        );
        assert!(!manager.has_room("FIRST"));
        assert!(manager.has_room("SECOND"));

        let events = drain(&mut rx);
        assert_eq!(
            events
                .iter()
                .filter(|e| e["type"] == "room-joined")
                .count(),
            2
        );
    }
}

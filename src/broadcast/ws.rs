//! WebSocket transport for the broadcaster.
//!
//! Clients send tagged JSON control messages; the server pushes
//! [`ServerEvent`]s they are entitled to.

use super::{ConnectionId, EventBroadcaster, ServerEvent};
use axum::extract::ws::{Message, WebSocket};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Authenticate { address: String },
    Subscribe { rooms: Vec<String> },
    Unsubscribe { rooms: Vec<String> },
    Ping {
        #[serde(default)]
        timestamp: Option<i64>,
    },
}

/// Direct replies to a single client
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlReply {
    Pong { timestamp: i64 },
    Authenticated { address: String },
    Subscribed { rooms: Vec<String> },
    Error { message: String },
}

/// Apply one client message to the registry and produce the reply, if any.
pub fn apply_client_message(
    broadcaster: &EventBroadcaster,
    id: ConnectionId,
    text: &str,
) -> Option<ControlReply> {
    let msg: ClientMessage = match serde_json::from_str(text) {
        Ok(m) => m,
        Err(e) => {
            return Some(ControlReply::Error {
                message: format!("invalid message: {e}"),
            })
        }
    };

    match msg {
        ClientMessage::Authenticate { address } => match broadcaster.authenticate(id, &address) {
            Some(address) => Some(ControlReply::Authenticated { address }),
            None => Some(ControlReply::Error {
                message: "invalid address".to_string(),
            }),
        },
        ClientMessage::Subscribe { rooms } => {
            let rooms: Vec<String> = rooms
                .into_iter()
                .filter(|r| !r.starts_with("user:"))
                .collect();
            broadcaster.subscribe_rooms(id, &rooms);
            Some(ControlReply::Subscribed { rooms })
        }
        ClientMessage::Unsubscribe { rooms } => {
            broadcaster.unsubscribe_rooms(id, &rooms);
            None
        }
        ClientMessage::Ping { timestamp } => Some(ControlReply::Pong {
            timestamp: timestamp.unwrap_or_else(|| Utc::now().timestamp_millis()),
        }),
    }
}

fn encode<T: Serialize>(value: &T) -> Option<Message> {
    match serde_json::to_string(value) {
        Ok(json) => Some(Message::Text(json)),
        Err(e) => {
            warn!("failed to encode outbound message: {}", e);
            None
        }
    }
}

/// Drive one socket until the client goes away.
pub async fn serve_socket(mut socket: WebSocket, broadcaster: Arc<EventBroadcaster>) {
    let mut handle = broadcaster.register();
    let id = handle.id;

    loop {
        tokio::select! {
            incoming = handle.rx.recv() => {
                match incoming {
                    Ok(envelope) => {
                        if !broadcaster.should_deliver(id, &envelope) {
                            continue;
                        }
                        let Some(msg) = encode::<ServerEvent>(&envelope.event) else {
                            continue;
                        };
                        if socket.send(msg).await.is_err() {
                            break;
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(connection = id, skipped, "client lagging, events dropped");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            msg = socket.recv() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if let Some(reply) = apply_client_message(&broadcaster, id, &text) {
                            let Some(msg) = encode(&reply) else { continue };
                            if socket.send(msg).await.is_err() {
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        if socket.send(Message::Pong(payload)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!(connection = id, "socket error: {}", e);
                        break;
                    }
                }
            }
        }
    }

    broadcaster.disconnect(id);
}

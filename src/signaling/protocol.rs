#![forbid(unsafe_code)]

// Signaling protocol - Message types for WebSocket communication

use serde::{Deserialize, Serialize};

use crate::engine::types::{MediaKind, ProducerId};
use crate::room::chat::ChatMessage;

/// Client-to-Server messages
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientMessage {
    /// Join a room, creating it if needed
    #[serde(rename_all = "camelCase")]
    JoinRoom {
        room_id: String,
        peer_id: String,
        name: String,
    },
    /// Leave the current room
    LeaveRoom,
    /// Send a chat message to the room
    #[serde(rename_all = "camelCase")]
    ChatMessage { room_id: String, message: ChatDraft },
    /// Pause a producer (mute)
    #[serde(rename_all = "camelCase")]
    ProducerPause {
        room_id: String,
        producer_id: ProducerId,
    },
    /// Resume a producer (unmute)
    #[serde(rename_all = "camelCase")]
    ProducerResume {
        room_id: String,
        producer_id: ProducerId,
    },
    /// Close a producer
    #[serde(rename_all = "camelCase")]
    ProducerClose {
        room_id: String,
        producer_id: ProducerId,
    },
}

/// Server-to-Client messages
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerMessage {
    /// Room joined successfully
    #[serde(rename_all = "camelCase")]
    RoomJoined {
        room_id: String,
        peer_id: String,
        existing_peers: Vec<PeerInfo>,
        chat_history: Vec<ChatMessage>,
    },
    /// New peer joined the room
    PeerJoined { peer: PeerInfo },
    /// Peer left the room
    #[serde(rename_all = "camelCase")]
    PeerLeft { peer_id: String },
    /// New producer available from another peer
    #[serde(rename_all = "camelCase")]
    NewProducer {
        peer_id: String,
        producer_id: ProducerId,
        kind: MediaKind,
    },
    /// Producer paused (muted) by its owner
    #[serde(rename_all = "camelCase")]
    ProducerPaused { producer_id: ProducerId },
    /// Producer resumed (unmuted) by its owner
    #[serde(rename_all = "camelCase")]
    ProducerResumed { producer_id: ProducerId },
    /// Producer closed, stop consuming it
    #[serde(rename_all = "camelCase")]
    ProducerClosed { producer_id: ProducerId },
    /// Chat message accepted into the room log
    ChatMessage { message: ChatMessage },
    /// Error response
    Error { message: String },
}

/// Peer entry in room snapshots and join notices
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerInfo {
    pub id: String,
    pub name: String,
    pub producers: Vec<ProducerDescriptor>,
}

/// Producer metadata a late joiner needs to start consuming
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProducerDescriptor {
    pub id: ProducerId,
    pub kind: MediaKind,
    pub paused: bool,
}

/// Client-supplied part of a chat message. The server fills in whatever is
/// missing and stamps the timestamp itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatDraft {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub sender: Option<String>,
    pub text: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    #[test]
    fn client_messages_use_kebab_case_tags() {
        let parsed: ClientMessage = serde_json::from_value(json!({
            "type": "join-room",
            "roomId": "ABCD",
            "peerId": "p1",
            "name": "Ann",
        }))
        .expect("join-room parses");
        assert!(matches!(parsed, ClientMessage::JoinRoom { .. }));

        let parsed: ClientMessage = serde_json::from_value(json!({
            "type": "chat-message",
            "roomId": "ABCD",
            "message": { "text": "hi" },
        }))
        .expect("chat-message parses with only text");
        match parsed {
            ClientMessage::ChatMessage { message, .. } => {
                assert_eq!(message.text, "hi");
                assert!(message.id.is_none());
                assert!(message.sender.is_none());
            }
            other => panic!("unexpected message: {other:?}"),
        }

        assert!(serde_json::from_value::<ClientMessage>(json!({"type": "nope"})).is_err());
    }

    #[test]
    fn server_messages_carry_camel_case_fields() {
        let message = ServerMessage::PeerLeft {
            peer_id: "p1".to_string(),
        };
        let value: Value = serde_json::to_value(&message).expect("serializes");
        assert_eq!(value["type"], "peer-left");
        assert_eq!(value["peerId"], "p1");

        let message = ServerMessage::RoomJoined {
            room_id: "ABCD".to_string(),
            peer_id: "p1".to_string(),
            existing_peers: Vec::new(),
            chat_history: Vec::new(),
        };
        let value: Value = serde_json::to_value(&message).expect("serializes");
        assert_eq!(value["type"], "room-joined");
        assert!(value["existingPeers"].as_array().is_some_and(Vec::is_empty));
        assert!(value["chatHistory"].as_array().is_some_and(Vec::is_empty));
    }
}

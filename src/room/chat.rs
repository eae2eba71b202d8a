#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::{SystemTime, UNIX_EPOCH};

/// Upper bound on retained chat messages per room; the oldest entry is
/// evicted first.
pub const CHAT_HISTORY_LIMIT: usize = 100;

/// An immutable chat entry. The id is client-supplied (or generated when
/// empty) and stays stable through the broadcast so senders can de-duplicate
/// their optimistic copy; the timestamp is stamped by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: String,
    pub sender: String,
    pub text: String,
    pub timestamp: u64,
}

/// Bounded FIFO chat history. Lives inside a room and dies with it.
#[derive(Debug, Default)]
pub struct ChatLog {
    messages: VecDeque<ChatMessage>,
}

impl ChatLog {
    pub fn new() -> Self {
        Self {
            messages: VecDeque::with_capacity(CHAT_HISTORY_LIMIT),
        }
    }

    pub fn append(&mut self, message: ChatMessage) {
        if self.messages.len() == CHAT_HISTORY_LIMIT {
            self.messages.pop_front();
        }
        self.messages.push_back(message);
    }

    pub fn snapshot(&self) -> Vec<ChatMessage> {
        self.messages.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

/// Milliseconds since the unix epoch, for message timestamps.
pub fn unix_timestamp_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(n: usize) -> ChatMessage {
        ChatMessage {
            id: format!("msg-{n}"),
            sender: "ripley".to_string(),
            text: format!("line {n}"),
            timestamp: n as u64,
        }
    }

    #[test]
    fn history_is_capped_with_fifo_eviction() {
        let mut log = ChatLog::new();
        for n in 0..CHAT_HISTORY_LIMIT + 1 {
            log.append(message(n));
        }

        assert_eq!(log.len(), CHAT_HISTORY_LIMIT);
        let snapshot = log.snapshot();
        // The oldest entry is gone and the rest keep relative order.
        assert_eq!(snapshot[0].id, "msg-1");
        assert_eq!(snapshot[CHAT_HISTORY_LIMIT - 1].id, format!("msg-{CHAT_HISTORY_LIMIT}"));
        for window in snapshot.windows(2) {
            assert!(window[0].timestamp < window[1].timestamp);
        }
    }

    #[test]
    fn snapshot_preserves_insertion_order_below_cap() {
        let mut log = ChatLog::new();
        for n in 0..5 {
            log.append(message(n));
        }
        let ids: Vec<_> = log.snapshot().into_iter().map(|m| m.id).collect();
        assert_eq!(ids, vec!["msg-0", "msg-1", "msg-2", "msg-3", "msg-4"]);
    }

    #[test]
    fn wire_format_is_camel_case_with_timestamp() {
        let json = serde_json::to_value(message(3)).expect("serialize");
        assert_eq!(json["id"], "msg-3");
        assert_eq!(json["sender"], "ripley");
        assert_eq!(json["timestamp"], 3);
    }
}

//! Wire frames exchanged with the broker, one JSON object per line

use serde::{Deserialize, Serialize};
use switchyard_core::Message;

/// Topic every broadcast message is published on
pub const BROADCAST_TOPIC: &str = "broadcast";

/// Longest line accepted on a broker connection
pub const MAX_FRAME_BYTES: usize = 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Frame {
    Subscribe { topic: String },
    Unsubscribe { topic: String },
    Publish { topic: String, message: Message },
    Deliver { topic: String, message: Message },
}

impl Frame {
    pub fn encode(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn decode(line: &str) -> serde_json::Result<Self> {
        serde_json::from_str(line)
    }
}

/// Topic a message is published on: its receiver, or the broadcast topic
pub fn topic_for(message: &Message) -> &str {
    if message.is_broadcast() {
        BROADCAST_TOPIC
    } else {
        &message.receiver_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use switchyard_core::MessageType;

    #[test]
    fn test_frame_tagging() {
        let line = Frame::Subscribe {
            topic: "expert_1".to_string(),
        }
        .encode()
        .unwrap();
        assert_eq!(line, r#"{"op":"subscribe","topic":"expert_1"}"#);
    }

    #[test]
    fn test_topic_for() {
        let direct = Message::new("router", MessageType::Query, json!({}));
        assert_eq!(topic_for(&direct), "router");
        let broadcast = Message::broadcast(MessageType::Heartbeat, json!({}));
        assert_eq!(topic_for(&broadcast), BROADCAST_TOPIC);
    }

    #[test]
    fn test_decode_rejects_unknown_op() {
        assert!(Frame::decode(r#"{"op":"shout","topic":"x"}"#).is_err());
    }
}

use serde::{Deserialize, Serialize};

use crate::model::event::Bookmark;
use crate::model::message::Message;

/// Point-in-time copy of an agent's conversation. Immutable once written;
/// saving again under the same id replaces it whole.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Snapshot {
    pub id: String,
    pub agent_id: String,
    pub messages: Vec<Message>,
    pub last_sfp_index: i64,
    pub last_bookmark: Option<Bookmark>,
    pub created_at: String,
    pub metadata: Option<serde_json::Value>,
}

impl Snapshot {
    pub fn message_count(&self) -> usize {
        self.messages.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_serde() {
        let snap = Snapshot {
            id: "sfp:1".to_string(),
            agent_id: "agent-1".to_string(),
            messages: vec![Message::user("hi"), Message::assistant("hello")],
            last_sfp_index: 1,
            last_bookmark: None,
            created_at: "2025-01-01T00:00:00Z".to_string(),
            metadata: Some(serde_json::json!({"label": "initial"})),
        };
        let json = serde_json::to_string(&snap).unwrap();
        let deserialized: Snapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(snap, deserialized);
        assert_eq!(deserialized.message_count(), 2);
    }
}

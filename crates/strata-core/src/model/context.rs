//! Context-management records kept alongside an agent: the todo list,
//! archived history windows, compression summaries and the media cache.
//! All of them are removed together with the agent.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::model::message::Message;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TodoSnapshot {
    pub todos: Vec<TodoItem>,
    pub version: u64,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TodoItem {
    pub id: String,
    pub title: String,
    pub status: TodoStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TodoStatus {
    Pending,
    InProgress,
    Completed,
}

/// Messages moved out of the live context by compression.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HistoryWindow {
    pub id: String,
    pub messages: Vec<Message>,
    pub created_at: String,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CompressionRecord {
    pub id: String,
    pub window_id: String,
    pub summary: String,
    pub original_message_count: u64,
    pub compressed_at: String,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

/// Maps uploaded content to the provider-side file it was stored as.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MediaCacheEntry {
    /// Hex SHA-256 of the content.
    pub content_hash: String,
    pub mime_type: String,
    pub size_bytes: u64,
    pub provider_file_id: Option<String>,
    pub created_at: String,
}

impl MediaCacheEntry {
    pub fn for_content(bytes: &[u8], mime_type: impl Into<String>) -> Self {
        Self {
            content_hash: content_hash(bytes),
            mime_type: mime_type.into(),
            size_bytes: bytes.len() as u64,
            provider_file_id: None,
            created_at: chrono::Utc::now().to_rfc3339(),
        }
    }
}

pub fn content_hash(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::model::snapshot::Snapshot;
use crate::query::StrataEngine;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotRequest {
    pub agent_id: String,
    /// Defaults to `sfp:<last_sfp_index>`.
    pub snapshot_id: Option<String>,
    pub metadata: Option<serde_json::Value>,
}

impl SnapshotRequest {
    pub fn new(agent_id: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            snapshot_id: None,
            metadata: None,
        }
    }

    pub fn with_id(mut self, snapshot_id: impl Into<String>) -> Self {
        self.snapshot_id = Some(snapshot_id.into());
        self
    }
}

#[non_exhaustive]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotResponse {
    pub snapshot: Snapshot,
    /// False when an identical snapshot already existed under the same id.
    pub written: bool,
}

pub async fn execute(engine: &StrataEngine, request: SnapshotRequest) -> Result<SnapshotResponse> {
    let agent_id = request.agent_id.as_str();
    engine
        .with_agent_lock(agent_id, async {
            let info = engine.require_info(agent_id).await?;
            let messages = engine.storage.load_messages(agent_id).await?;
            let id = request
                .snapshot_id
                .clone()
                .unwrap_or_else(|| format!("sfp:{}", info.last_sfp_index));

            // Same id, same content: keep the stored row and its timestamp.
            if let Some(existing) = engine.storage.load_snapshot(agent_id, &id).await? {
                let metadata_matches = request.metadata.is_none() || existing.metadata == request.metadata;
                if existing.messages == messages
                    && existing.last_sfp_index == info.last_sfp_index
                    && existing.last_bookmark == info.last_bookmark
                    && metadata_matches
                {
                    return Ok(SnapshotResponse {
                        snapshot: existing,
                        written: false,
                    });
                }
            }

            let snapshot = Snapshot {
                id,
                agent_id: agent_id.to_string(),
                messages,
                last_sfp_index: info.last_sfp_index,
                last_bookmark: info.last_bookmark.clone(),
                created_at: chrono::Utc::now().to_rfc3339(),
                metadata: request.metadata.clone(),
            };
            engine.storage.save_snapshot(&snapshot).await?;
            tracing::debug!(
                agent_id,
                snapshot_id = %snapshot.id,
                messages = snapshot.messages.len(),
                "snapshot written"
            );
            Ok(SnapshotResponse {
                snapshot,
                written: true,
            })
        })
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::model::agent::AgentInfo;
    use crate::model::message::Message;
    use crate::storage::duckdb::DuckDbStorage;
    use std::sync::Arc;

    async fn engine() -> StrataEngine {
        let engine = StrataEngine::with_query_backend(Arc::new(DuckDbStorage::open_in_memory().unwrap()));
        engine.create_agent(AgentInfo::new("a1", "tpl")).await.unwrap();
        engine
    }

    #[tokio::test]
    async fn test_default_id_follows_safe_fork_point() {
        let engine = engine().await;
        engine
            .save_messages("a1", &[Message::user("hi"), Message::assistant("hello")])
            .await
            .unwrap();
        let resp = engine.snapshot(SnapshotRequest::new("a1")).await.unwrap();
        assert_eq!(resp.snapshot.id, "sfp:1");
        assert_eq!(resp.snapshot.messages.len(), 2);
        assert!(resp.written);
    }

    #[tokio::test]
    async fn test_repeated_snapshot_is_not_rewritten() {
        let engine = engine().await;
        engine.save_messages("a1", &[Message::user("hi")]).await.unwrap();
        let first = engine.snapshot(SnapshotRequest::new("a1")).await.unwrap();
        let second = engine.snapshot(SnapshotRequest::new("a1")).await.unwrap();
        assert!(!second.written);
        assert_eq!(first.snapshot, second.snapshot);
        assert_eq!(engine.storage.list_snapshots("a1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_snapshot_does_not_touch_source() {
        let engine = engine().await;
        engine.save_messages("a1", &[Message::user("hi")]).await.unwrap();
        let before = engine.storage.load_info("a1").await.unwrap();
        engine
            .snapshot(SnapshotRequest::new("a1").with_id("snap:1"))
            .await
            .unwrap();
        assert_eq!(engine.storage.load_info("a1").await.unwrap(), before);
    }

    #[tokio::test]
    async fn test_snapshot_of_unknown_agent() {
        let engine = engine().await;
        let err = engine.snapshot(SnapshotRequest::new("ghost")).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }
}

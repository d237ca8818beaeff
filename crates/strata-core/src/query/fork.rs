use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::model::agent::AgentInfo;
use crate::query::StrataEngine;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForkRequest {
    pub agent_id: String,
    pub snapshot_id: String,
    /// Generated when absent.
    pub new_agent_id: Option<String>,
    pub metadata: Option<serde_json::Value>,
}

impl ForkRequest {
    pub fn new(agent_id: impl Into<String>, snapshot_id: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            snapshot_id: snapshot_id.into(),
            new_agent_id: None,
            metadata: None,
        }
    }

    pub fn with_new_agent_id(mut self, new_agent_id: impl Into<String>) -> Self {
        self.new_agent_id = Some(new_agent_id.into());
        self
    }
}

#[non_exhaustive]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForkResponse {
    pub agent_id: String,
    pub parent_id: String,
    pub snapshot_id: String,
    pub lineage: Vec<String>,
    pub message_count: u64,
}

pub async fn execute(engine: &StrataEngine, request: ForkRequest) -> Result<ForkResponse> {
    let parent_id = request.agent_id.as_str();

    // Read phase under the parent's lock; the lock is gone before the child
    // is created so no two agent locks are ever held together.
    let (parent, snapshot) = engine
        .with_agent_lock(parent_id, async {
            let parent = engine.require_info(parent_id).await?;
            let snapshot = engine
                .storage
                .load_snapshot(parent_id, &request.snapshot_id)
                .await?
                .ok_or_else(|| {
                    Error::NotFound(format!(
                        "snapshot {} of agent {parent_id}",
                        request.snapshot_id
                    ))
                })?;
            Ok((parent, snapshot))
        })
        .await?;

    let child_id = request
        .new_agent_id
        .clone()
        .unwrap_or_else(|| format!("{parent_id}-fork-{}", Uuid::now_v7()));
    if child_id == parent_id || parent.lineage.contains(&child_id) {
        return Err(Error::Validation(format!(
            "fork target {child_id} is already in the lineage of {parent_id}"
        )));
    }

    let mut lineage = parent.lineage.clone();
    lineage.push(parent_id.to_string());

    let mut metadata = request
        .metadata
        .clone()
        .unwrap_or_else(|| parent.metadata.clone());
    if let Some(map) = metadata.as_object_mut() {
        map.insert(
            "forked_from".to_string(),
            serde_json::json!({
                "agent_id": parent_id,
                "snapshot_id": snapshot.id,
            }),
        );
    }

    let child = AgentInfo {
        agent_id: child_id.clone(),
        template_id: parent.template_id.clone(),
        created_at: chrono::Utc::now().to_rfc3339(),
        config_version: parent.config_version.clone(),
        lineage: lineage.clone(),
        message_count: 0,
        last_sfp_index: snapshot.last_sfp_index,
        last_bookmark: snapshot.last_bookmark.clone(),
        breakpoint: None,
        metadata,
    };

    // A concurrent fork to the same target loses here with ConstraintViolation.
    engine.storage.create_info(&child).await?;
    if let Err(e) = engine.storage.save_messages(&child_id, &snapshot.messages).await {
        tracing::error!(agent_id = %child_id, error = %e, "fork copy failed, removing partial child");
        if let Err(cleanup) = engine.storage.delete(&child_id).await {
            tracing::error!(agent_id = %child_id, error = %cleanup, "failed to remove partial fork");
        }
        return Err(e);
    }

    if let Err(e) = engine
        .timeline
        .monitor(
            &child_id,
            "forked",
            serde_json::json!({
                "parent_id": parent_id,
                "snapshot_id": snapshot.id,
                "lineage": lineage,
            }),
        )
        .await
    {
        tracing::error!(agent_id = %child_id, error = %e, "failed to record fork event");
    }

    tracing::info!(
        agent_id = %child_id,
        parent_id,
        snapshot_id = %snapshot.id,
        "agent forked"
    );

    Ok(ForkResponse {
        agent_id: child_id,
        parent_id: parent_id.to_string(),
        snapshot_id: snapshot.id,
        lineage,
        message_count: snapshot.messages.len() as u64,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::message::Message;
    use crate::query::snapshot::SnapshotRequest;
    use crate::storage::duckdb::DuckDbStorage;
    use std::sync::Arc;

    async fn engine_with_snapshot() -> StrataEngine {
        let engine = StrataEngine::with_query_backend(Arc::new(DuckDbStorage::open_in_memory().unwrap()));
        engine.create_agent(AgentInfo::new("a1", "tpl")).await.unwrap();
        engine
            .save_messages(
                "a1",
                &[Message::user("one"), Message::assistant("two"), Message::user("three")],
            )
            .await
            .unwrap();
        engine
            .snapshot(SnapshotRequest::new("a1").with_id("snap:1"))
            .await
            .unwrap();
        engine
    }

    #[tokio::test]
    async fn test_fork_generates_child_id() {
        let engine = engine_with_snapshot().await;
        let resp = engine.fork(ForkRequest::new("a1", "snap:1")).await.unwrap();
        assert!(resp.agent_id.starts_with("a1-fork-"));
        assert_eq!(resp.lineage, vec!["a1".to_string()]);
        assert_eq!(resp.message_count, 3);

        let child = engine.storage.load_info(&resp.agent_id).await.unwrap().unwrap();
        assert_eq!(child.parent_id(), Some("a1"));
        assert_eq!(child.metadata["forked_from"]["snapshot_id"], "snap:1");
    }

    #[tokio::test]
    async fn test_fork_to_existing_agent_is_constraint_violation() {
        let engine = engine_with_snapshot().await;
        engine
            .fork(ForkRequest::new("a1", "snap:1").with_new_agent_id("a2"))
            .await
            .unwrap();
        let err = engine
            .fork(ForkRequest::new("a1", "snap:1").with_new_agent_id("a2"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ConstraintViolation(_)));
    }

    #[tokio::test]
    async fn test_fork_rejects_ancestor_target() {
        let engine = engine_with_snapshot().await;
        engine
            .fork(ForkRequest::new("a1", "snap:1").with_new_agent_id("a2"))
            .await
            .unwrap();
        engine
            .snapshot(SnapshotRequest::new("a2").with_id("snap:2"))
            .await
            .unwrap();
        let err = engine
            .fork(ForkRequest::new("a2", "snap:2").with_new_agent_id("a1"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[tokio::test]
    async fn test_fork_missing_snapshot() {
        let engine = engine_with_snapshot().await;
        let err = engine.fork(ForkRequest::new("a1", "nope")).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }
}

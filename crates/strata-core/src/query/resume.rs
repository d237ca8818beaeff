use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::model::agent::AgentInfo;
use crate::model::event::{Bookmark, Channel, TimelineEvent};
use crate::model::message::Message;
use crate::model::snapshot::Snapshot;
use crate::model::tool_call::ToolCallRecord;
use crate::query::StrataEngine;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResumeRequest {
    pub agent_id: String,
    /// Replay events after this position; `None` replays the whole timeline.
    pub since: Option<Bookmark>,
    pub channels: Option<Vec<Channel>>,
}

impl ResumeRequest {
    pub fn new(agent_id: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            ..Default::default()
        }
    }

    pub fn since(mut self, bookmark: Bookmark) -> Self {
        self.since = Some(bookmark);
        self
    }
}

/// Everything a worker needs to pick an agent back up.
#[non_exhaustive]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResumeState {
    pub info: AgentInfo,
    pub messages: Vec<Message>,
    pub tool_calls: Vec<ToolCallRecord>,
    pub latest_snapshot: Option<Snapshot>,
    pub events_since: Vec<TimelineEvent>,
    /// Position of the last replayed event, or the request's `since`.
    pub bookmark: Option<Bookmark>,
}

pub async fn execute(engine: &StrataEngine, request: ResumeRequest) -> Result<ResumeState> {
    let agent_id = request.agent_id.as_str();
    let info = engine.require_info(agent_id).await?;
    let messages = engine.storage.load_messages(agent_id).await?;
    let tool_calls = engine.storage.load_tool_call_records(agent_id).await?;
    let latest_snapshot = engine
        .storage
        .list_snapshots(agent_id)
        .await?
        .into_iter()
        .max_by(|a, b| a.created_at.cmp(&b.created_at));

    let mut stream = engine
        .timeline
        .stream(agent_id, request.since.clone(), request.channels.clone());
    let mut events_since = Vec::new();
    while let Some(event) = stream.next().await? {
        events_since.push(event);
    }
    let bookmark = stream.bookmark().cloned();

    tracing::debug!(
        agent_id,
        messages = messages.len(),
        events = events_since.len(),
        breakpoint = %info.breakpoint_state(),
        "agent state loaded for resume"
    );

    Ok(ResumeState {
        info,
        messages,
        tool_calls,
        latest_snapshot,
        events_since,
        bookmark,
    })
}

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::{Error, Result};
use crate::lock::{AgentLockGuard, LockTable};
use crate::metrics::HealthStatus;
use crate::model::agent::AgentInfo;
use crate::model::context::{CompressionRecord, HistoryWindow, MediaCacheEntry, TodoSnapshot};
use crate::model::event::{EventQuery, NewEvent, TimelineEvent};
use crate::model::message::Message;
use crate::model::snapshot::Snapshot;
use crate::model::tool_call::ToolCallRecord;
use crate::storage::file::FileStore;
use crate::storage::{
    AgentFilter, AgentStats, MessageFilter, Page, QueryBackend, SnapshotFilter, Sort,
    StorageBackend, StoredMessage, StoredToolCall, ToolCallFilter,
};

/// Composite store: agent info, messages, tool calls and snapshots go to a
/// query-capable backend; the timeline and context records go to files.
///
/// The structured backend owns agent existence and locking. Delete removes
/// the structured rows first and then the agent's files, so an interrupted
/// delete leaves only unreachable files that the next delete clears. File
/// writes check existence and write under the same per-agent gate as delete.
pub struct HybridStore {
    structured: Arc<dyn QueryBackend>,
    files: FileStore,
    gate: LockTable,
}

const GATE_TIMEOUT: Duration = Duration::from_secs(30);

impl HybridStore {
    pub fn new(structured: Arc<dyn QueryBackend>, files_root: impl Into<std::path::PathBuf>) -> Self {
        Self {
            structured,
            files: FileStore::auxiliary(files_root),
            gate: LockTable::new(),
        }
    }

    pub fn structured(&self) -> &Arc<dyn QueryBackend> {
        &self.structured
    }

    /// Enter the agent's gate and confirm the agent exists. Hold the guard
    /// until the file write is done.
    async fn require_agent(&self, agent_id: &str) -> Result<AgentLockGuard> {
        let guard = self.gate.acquire(agent_id, GATE_TIMEOUT).await?;
        if self.structured.exists(agent_id).await? {
            Ok(guard)
        } else {
            Err(Error::NotFound(format!("agent {agent_id}")))
        }
    }
}

#[async_trait::async_trait]
impl StorageBackend for HybridStore {
    fn backend_name(&self) -> &'static str {
        "hybrid"
    }

    async fn init(&self) -> Result<()> {
        self.structured.init().await?;
        self.files.init().await
    }

    async fn close(&self) -> Result<()> {
        let files = self.files.close().await;
        self.structured.close().await?;
        files
    }

    async fn create_info(&self, info: &AgentInfo) -> Result<()> {
        self.structured.create_info(info).await
    }

    async fn save_info(&self, info: &AgentInfo) -> Result<()> {
        self.structured.save_info(info).await
    }

    async fn load_info(&self, agent_id: &str) -> Result<Option<AgentInfo>> {
        self.structured.load_info(agent_id).await
    }

    async fn save_messages(&self, agent_id: &str, messages: &[Message]) -> Result<()> {
        self.structured.save_messages(agent_id, messages).await
    }

    async fn load_messages(&self, agent_id: &str) -> Result<Vec<Message>> {
        self.structured.load_messages(agent_id).await
    }

    async fn save_tool_call_records(&self, agent_id: &str, records: &[ToolCallRecord]) -> Result<()> {
        self.structured.save_tool_call_records(agent_id, records).await
    }

    async fn load_tool_call_records(&self, agent_id: &str) -> Result<Vec<ToolCallRecord>> {
        self.structured.load_tool_call_records(agent_id).await
    }

    async fn save_snapshot(&self, snapshot: &Snapshot) -> Result<()> {
        self.structured.save_snapshot(snapshot).await
    }

    async fn load_snapshot(&self, agent_id: &str, snapshot_id: &str) -> Result<Option<Snapshot>> {
        self.structured.load_snapshot(agent_id, snapshot_id).await
    }

    async fn list_snapshots(&self, agent_id: &str) -> Result<Vec<Snapshot>> {
        self.structured.list_snapshots(agent_id).await
    }

    async fn delete_snapshot(&self, agent_id: &str, snapshot_id: &str) -> Result<()> {
        self.structured.delete_snapshot(agent_id, snapshot_id).await
    }

    async fn append_event(&self, agent_id: &str, event: &NewEvent) -> Result<TimelineEvent> {
        let _gate = self.require_agent(agent_id).await?;
        self.files.append_event(agent_id, event).await
    }

    async fn read_events(&self, agent_id: &str, query: &EventQuery) -> Result<Vec<TimelineEvent>> {
        self.files.read_events(agent_id, query).await
    }

    async fn save_todos(&self, agent_id: &str, todos: &TodoSnapshot) -> Result<()> {
        let _gate = self.require_agent(agent_id).await?;
        self.files.save_todos(agent_id, todos).await
    }

    async fn load_todos(&self, agent_id: &str) -> Result<Option<TodoSnapshot>> {
        self.files.load_todos(agent_id).await
    }

    async fn append_history_window(&self, agent_id: &str, window: &HistoryWindow) -> Result<()> {
        let _gate = self.require_agent(agent_id).await?;
        self.files.append_history_window(agent_id, window).await
    }

    async fn list_history_windows(&self, agent_id: &str) -> Result<Vec<HistoryWindow>> {
        self.files.list_history_windows(agent_id).await
    }

    async fn append_compression_record(&self, agent_id: &str, record: &CompressionRecord) -> Result<()> {
        let _gate = self.require_agent(agent_id).await?;
        self.files.append_compression_record(agent_id, record).await
    }

    async fn list_compression_records(&self, agent_id: &str) -> Result<Vec<CompressionRecord>> {
        self.files.list_compression_records(agent_id).await
    }

    async fn save_media(&self, agent_id: &str, entry: &MediaCacheEntry) -> Result<()> {
        let _gate = self.require_agent(agent_id).await?;
        self.files.save_media(agent_id, entry).await
    }

    async fn load_media(&self, agent_id: &str, content_hash: &str) -> Result<Option<MediaCacheEntry>> {
        self.files.load_media(agent_id, content_hash).await
    }

    async fn exists(&self, agent_id: &str) -> Result<bool> {
        self.structured.exists(agent_id).await
    }

    async fn delete(&self, agent_id: &str) -> Result<()> {
        let _gate = self.gate.acquire(agent_id, GATE_TIMEOUT).await?;
        self.structured.delete(agent_id).await?;
        self.files.delete(agent_id).await
    }

    async fn list(&self, prefix: Option<&str>) -> Result<Vec<String>> {
        self.structured.list(prefix).await
    }

    async fn acquire_agent_lock(&self, agent_id: &str, timeout: Duration) -> Result<AgentLockGuard> {
        self.structured.acquire_agent_lock(agent_id, timeout).await
    }

    async fn health_check(&self) -> HealthStatus {
        let started = Instant::now();
        let structured = self.structured.health_check().await;
        let files = self.files.health_check().await;
        let probe = match (structured.healthy, files.healthy) {
            (true, true) => Ok(()),
            _ => Err(Error::Storage(
                [structured.detail, files.detail]
                    .into_iter()
                    .flatten()
                    .collect::<Vec<_>>()
                    .join("; "),
            )),
        };
        HealthStatus::from_probe(self.backend_name(), started, probe)
    }

    async fn storage_size(&self) -> Result<u64> {
        Ok(self.structured.storage_size().await? + self.files.storage_size().await?)
    }
}

#[async_trait::async_trait]
impl QueryBackend for HybridStore {
    async fn query_agents(&self, filter: &AgentFilter, page: &Page, sort: &Sort) -> Result<Vec<AgentInfo>> {
        self.structured.query_agents(filter, page, sort).await
    }

    async fn query_messages(&self, filter: &MessageFilter, page: &Page) -> Result<Vec<StoredMessage>> {
        self.structured.query_messages(filter, page).await
    }

    async fn query_tool_calls(&self, filter: &ToolCallFilter, page: &Page, sort: &Sort) -> Result<Vec<StoredToolCall>> {
        self.structured.query_tool_calls(filter, page, sort).await
    }

    async fn query_snapshots(&self, filter: &SnapshotFilter, page: &Page, sort: &Sort) -> Result<Vec<Snapshot>> {
        self.structured.query_snapshots(filter, page, sort).await
    }

    async fn aggregate_stats(&self, agent_id: &str) -> Result<AgentStats> {
        let mut stats = self.structured.aggregate_stats(agent_id).await?;
        let mut events = 0u64;
        let mut query = EventQuery::default();
        loop {
            let page = self.files.read_events(agent_id, &query).await?;
            let Some(last) = page.last() else { break };
            events += page.len() as u64;
            query.since = Some(last.bookmark());
        }
        stats.event_count = events;
        Ok(stats)
    }
}

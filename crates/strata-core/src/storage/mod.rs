pub mod duckdb;
pub mod file;
pub mod filter;
pub mod hybrid;
pub mod migrations;

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::lock::AgentLockGuard;
use crate::metrics::HealthStatus;
use crate::model::agent::{AgentInfo, BreakpointState};
use crate::model::context::{CompressionRecord, HistoryWindow, MediaCacheEntry, TodoSnapshot};
use crate::model::event::{EventQuery, NewEvent, TimelineEvent};
use crate::model::message::{Message, Role};
use crate::model::snapshot::Snapshot;
use crate::model::tool_call::{ToolCallRecord, ToolCallState};

/// Everything a caller may do to persisted agent state, independent of medium.
///
/// Writes fail with `NotInitialized` until [`StorageBackend::init`] has run,
/// and again after [`StorageBackend::close`].
#[async_trait::async_trait]
pub trait StorageBackend: Send + Sync {
    /// Short medium name used in logs and health reports.
    fn backend_name(&self) -> &'static str;

    // Lifecycle
    async fn init(&self) -> Result<()>;
    async fn close(&self) -> Result<()>;

    // Agent info
    /// Insert a brand-new agent. Fails with `ConstraintViolation` if the id is taken.
    async fn create_info(&self, info: &AgentInfo) -> Result<()>;
    /// Upsert. `message_count` is always derived from the persisted messages.
    async fn save_info(&self, info: &AgentInfo) -> Result<()>;
    async fn load_info(&self, agent_id: &str) -> Result<Option<AgentInfo>>;

    // Messages: the full list is replaced as a unit together with `message_count`.
    async fn save_messages(&self, agent_id: &str, messages: &[Message]) -> Result<()>;
    async fn load_messages(&self, agent_id: &str) -> Result<Vec<Message>>;

    // Tool calls: replaced as a unit.
    async fn save_tool_call_records(&self, agent_id: &str, records: &[ToolCallRecord]) -> Result<()>;
    async fn load_tool_call_records(&self, agent_id: &str) -> Result<Vec<ToolCallRecord>>;

    // Snapshots
    async fn save_snapshot(&self, snapshot: &Snapshot) -> Result<()>;
    async fn load_snapshot(&self, agent_id: &str, snapshot_id: &str) -> Result<Option<Snapshot>>;
    /// Oldest first.
    async fn list_snapshots(&self, agent_id: &str) -> Result<Vec<Snapshot>>;
    async fn delete_snapshot(&self, agent_id: &str, snapshot_id: &str) -> Result<()>;

    // Timeline
    /// Assigns the next per-agent sequence number and appends the event.
    async fn append_event(&self, agent_id: &str, event: &NewEvent) -> Result<TimelineEvent>;
    /// One page of events matching `query`, in ascending `seq`.
    async fn read_events(&self, agent_id: &str, query: &EventQuery) -> Result<Vec<TimelineEvent>>;

    // Context records
    async fn save_todos(&self, agent_id: &str, todos: &TodoSnapshot) -> Result<()>;
    async fn load_todos(&self, agent_id: &str) -> Result<Option<TodoSnapshot>>;
    async fn append_history_window(&self, agent_id: &str, window: &HistoryWindow) -> Result<()>;
    async fn list_history_windows(&self, agent_id: &str) -> Result<Vec<HistoryWindow>>;
    async fn append_compression_record(&self, agent_id: &str, record: &CompressionRecord) -> Result<()>;
    async fn list_compression_records(&self, agent_id: &str) -> Result<Vec<CompressionRecord>>;
    async fn save_media(&self, agent_id: &str, entry: &MediaCacheEntry) -> Result<()>;
    async fn load_media(&self, agent_id: &str, content_hash: &str) -> Result<Option<MediaCacheEntry>>;

    // Lifecycle of agents
    async fn exists(&self, agent_id: &str) -> Result<bool>;
    /// Removes the agent and every dependent entity. Deleting an absent agent is a no-op.
    async fn delete(&self, agent_id: &str) -> Result<()>;
    /// Agent ids starting with `prefix`, newest `created_at` first.
    async fn list(&self, prefix: Option<&str>) -> Result<Vec<String>>;

    // Coordination
    async fn acquire_agent_lock(&self, agent_id: &str, timeout: Duration) -> Result<AgentLockGuard>;

    // Operations surface
    async fn health_check(&self) -> HealthStatus;
    async fn storage_size(&self) -> Result<u64>;
}

/// Filtered, paginated reads over the canonical state.
#[async_trait::async_trait]
pub trait QueryBackend: StorageBackend {
    async fn query_agents(&self, filter: &AgentFilter, page: &Page, sort: &Sort) -> Result<Vec<AgentInfo>>;
    async fn query_messages(&self, filter: &MessageFilter, page: &Page) -> Result<Vec<StoredMessage>>;
    async fn query_tool_calls(&self, filter: &ToolCallFilter, page: &Page, sort: &Sort) -> Result<Vec<StoredToolCall>>;
    async fn query_snapshots(&self, filter: &SnapshotFilter, page: &Page, sort: &Sort) -> Result<Vec<Snapshot>>;
    async fn aggregate_stats(&self, agent_id: &str) -> Result<AgentStats>;
}

#[derive(Debug, Clone, Default)]
pub struct AgentFilter {
    pub agent_id_prefix: Option<String>,
    pub template_id: Option<String>,
    pub created_after: Option<String>,
    pub created_before: Option<String>,
    pub breakpoint: Option<BreakpointState>,
}

#[derive(Debug, Clone, Default)]
pub struct MessageFilter {
    pub agent_id: Option<String>,
    pub role: Option<Role>,
    pub seq_from: Option<u64>,
    pub seq_to: Option<u64>,
}

#[derive(Debug, Clone, Default)]
pub struct ToolCallFilter {
    pub agent_id: Option<String>,
    pub tool_name: Option<String>,
    pub state: Option<ToolCallState>,
    pub created_after: Option<String>,
    pub created_before: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct SnapshotFilter {
    pub agent_id: Option<String>,
    pub created_after: Option<String>,
    pub created_before: Option<String>,
}

/// Pagination window.
///
/// `offset` only applies together with `limit`; an offset without a limit is
/// ignored by every backend.
#[derive(Debug, Clone, Default)]
pub struct Page {
    pub limit: Option<usize>,
    pub offset: usize,
}

impl Page {
    pub fn new(limit: usize, offset: usize) -> Self {
        Self {
            limit: Some(limit),
            offset,
        }
    }

    pub fn sql_clause(&self) -> String {
        match self.limit {
            Some(limit) => format!("LIMIT {limit} OFFSET {}", self.offset),
            None => String::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SortKey {
    #[default]
    CreatedAt,
    Id,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SortDirection {
    Asc,
    #[default]
    Desc,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Sort {
    pub key: SortKey,
    pub direction: SortDirection,
}

impl Sort {
    pub fn sql_direction(&self) -> &'static str {
        match self.direction {
            SortDirection::Asc => "ASC",
            SortDirection::Desc => "DESC",
        }
    }
}

/// A message together with its agent and zero-based position.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StoredMessage {
    pub agent_id: String,
    pub seq: u64,
    pub message: Message,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StoredToolCall {
    pub agent_id: String,
    pub record: ToolCallRecord,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AgentStats {
    pub agent_id: String,
    pub message_count: u64,
    pub tool_call_count: u64,
    pub snapshot_count: u64,
    pub event_count: u64,
    pub tool_calls_by_name: BTreeMap<String, u64>,
    pub tool_calls_by_state: BTreeMap<String, u64>,
}

/// Discriminators for the `agent_documents` relation that the SQL backends
/// use to hold context records.
pub mod doc_kind {
    pub const TODOS: &str = "todos";
    pub const HISTORY_WINDOW: &str = "history_window";
    pub const COMPRESSION: &str = "compression";
    pub const MEDIA: &str = "media";
    pub const TODOS_KEY: &str = "current";
}

pub mod breakpoint;
pub mod consistency;
pub mod fork;
pub mod resume;
pub mod snapshot;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::config::StrataConfig;
use crate::error::{Error, Result};
use crate::lock::AgentLockGuard;
use crate::metrics::{HealthStatus, MetricsSnapshot, OperationMetrics};
use crate::model::agent::AgentInfo;
use crate::model::event::EventQuery;
use crate::model::message::{Message, safe_fork_point};
use crate::model::tool_call::ToolCallRecord;
use crate::storage::{AgentStats, QueryBackend, StorageBackend, filter};
use crate::timeline::TimelineRouter;

pub struct StrataEngine {
    pub storage: Arc<dyn StorageBackend>,
    pub query: Option<Arc<dyn QueryBackend>>,
    pub timeline: TimelineRouter,
    pub metrics: Arc<OperationMetrics>,
    pub lock_timeout: Duration,
    pub event_page_size: usize,
}

impl StrataEngine {
    pub fn new(storage: Arc<dyn StorageBackend>) -> Self {
        let defaults = StrataConfig::default();
        Self {
            timeline: TimelineRouter::new(
                storage.clone(),
                defaults.event_page_size,
                defaults.lock_timeout(),
            ),
            storage,
            query: None,
            metrics: Arc::new(OperationMetrics::new()),
            lock_timeout: defaults.lock_timeout(),
            event_page_size: defaults.event_page_size,
        }
    }

    /// Engine over a backend that also serves filtered queries.
    pub fn with_query_backend(backend: Arc<dyn QueryBackend>) -> Self {
        let storage: Arc<dyn StorageBackend> = backend.clone();
        Self {
            query: Some(backend),
            ..Self::new(storage)
        }
    }

    pub fn with_config(mut self, config: &StrataConfig) -> Self {
        self.lock_timeout = config.lock_timeout();
        self.event_page_size = config.event_page_size.max(1);
        self.timeline = TimelineRouter::new(
            self.storage.clone(),
            self.event_page_size,
            self.lock_timeout,
        );
        self
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self.timeline = TimelineRouter::new(self.storage.clone(), self.event_page_size, timeout);
        self
    }

    /// Run `fut` while holding the agent's lock. The lock is released on both
    /// success and failure; a failed release is logged, not returned.
    pub(crate) async fn with_agent_lock<T, F>(&self, agent_id: &str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let guard = self
            .storage
            .acquire_agent_lock(agent_id, self.lock_timeout)
            .await?;
        let result = fut.await;
        if let Err(e) = guard.release().await {
            tracing::warn!(agent_id, error = %e, "failed to release agent lock");
        }
        result
    }

    pub(crate) async fn require_info(&self, agent_id: &str) -> Result<AgentInfo> {
        self.storage
            .load_info(agent_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("agent {agent_id}")))
    }

    pub async fn acquire_agent_lock(&self, agent_id: &str, timeout: Duration) -> Result<AgentLockGuard> {
        self.storage.acquire_agent_lock(agent_id, timeout).await
    }

    /// Register a brand-new agent and announce it on the monitor channel.
    pub async fn create_agent(&self, info: AgentInfo) -> Result<AgentInfo> {
        self.metrics
            .observe("create_agent", async {
                self.storage.create_info(&info).await?;
                self.timeline
                    .monitor(
                        &info.agent_id,
                        "agent_created",
                        serde_json::json!({
                            "template_id": info.template_id,
                            "lineage": info.lineage,
                        }),
                    )
                    .await?;
                tracing::info!(agent_id = %info.agent_id, template_id = %info.template_id, "agent created");
                self.require_info(&info.agent_id).await
            })
            .await
    }

    /// Replace the agent's messages and recompute its safe-fork-point.
    ///
    /// Messages and info are two backend writes. If the info write fails the
    /// stored `last_sfp_index` trails the messages until the next successful
    /// save; `check_consistency` reports it as `SfpStale`.
    pub async fn save_messages(&self, agent_id: &str, messages: &[Message]) -> Result<AgentInfo> {
        self.metrics
            .observe(
                "save_messages",
                self.with_agent_lock(agent_id, async {
                    self.storage.save_messages(agent_id, messages).await?;
                    let mut info = self.require_info(agent_id).await?;
                    info.last_sfp_index = safe_fork_point(messages);
                    self.storage.save_info(&info).await?;
                    self.require_info(agent_id).await
                }),
            )
            .await
    }

    pub async fn delete_agent(&self, agent_id: &str) -> Result<()> {
        self.metrics
            .observe(
                "delete_agent",
                self.with_agent_lock(agent_id, async {
                    self.storage.delete(agent_id).await?;
                    tracing::info!(agent_id, "agent deleted");
                    Ok(())
                }),
            )
            .await
    }

    pub async fn snapshot(&self, request: snapshot::SnapshotRequest) -> Result<snapshot::SnapshotResponse> {
        self.metrics
            .observe("snapshot", snapshot::execute(self, request))
            .await
    }

    pub async fn fork(&self, request: fork::ForkRequest) -> Result<fork::ForkResponse> {
        self.metrics.observe("fork", fork::execute(self, request)).await
    }

    pub async fn resume(&self, request: resume::ResumeRequest) -> Result<resume::ResumeState> {
        self.metrics
            .observe("resume", resume::execute(self, request))
            .await
    }

    pub async fn register_tool_call(
        &self,
        agent_id: &str,
        record: ToolCallRecord,
    ) -> Result<breakpoint::BreakpointResponse> {
        self.metrics
            .observe(
                "register_tool_call",
                breakpoint::register_tool_call(self, agent_id, record),
            )
            .await
    }

    pub async fn require_approval(
        &self,
        agent_id: &str,
        call_id: &str,
        meta: serde_json::Value,
    ) -> Result<breakpoint::BreakpointResponse> {
        self.metrics
            .observe(
                "require_approval",
                breakpoint::require_approval(self, agent_id, call_id, meta),
            )
            .await
    }

    pub async fn decide(
        &self,
        agent_id: &str,
        call_id: &str,
        decision: breakpoint::Decision,
        decided_by: Option<String>,
    ) -> Result<breakpoint::BreakpointResponse> {
        self.metrics
            .observe(
                "decide",
                breakpoint::decide(self, agent_id, call_id, decision, decided_by),
            )
            .await
    }

    pub async fn start_tool(&self, agent_id: &str, call_id: &str) -> Result<breakpoint::BreakpointResponse> {
        self.metrics
            .observe("start_tool", breakpoint::start_tool(self, agent_id, call_id))
            .await
    }

    pub async fn complete_tool(
        &self,
        agent_id: &str,
        call_id: &str,
        result: serde_json::Value,
    ) -> Result<breakpoint::BreakpointResponse> {
        self.metrics
            .observe(
                "complete_tool",
                breakpoint::complete_tool(self, agent_id, call_id, result),
            )
            .await
    }

    pub async fn fail_tool(
        &self,
        agent_id: &str,
        call_id: &str,
        error: impl Into<String>,
    ) -> Result<breakpoint::BreakpointResponse> {
        self.metrics
            .observe(
                "fail_tool",
                breakpoint::fail_tool(self, agent_id, call_id, error.into()),
            )
            .await
    }

    pub async fn pause(&self, agent_id: &str, reason: Option<String>) -> Result<breakpoint::BreakpointResponse> {
        self.metrics
            .observe("pause", breakpoint::pause(self, agent_id, reason))
            .await
    }

    pub async fn resume_agent(&self, agent_id: &str) -> Result<breakpoint::BreakpointResponse> {
        self.metrics
            .observe("resume_agent", breakpoint::resume_agent(self, agent_id))
            .await
    }

    pub async fn finish_turn(&self, agent_id: &str) -> Result<breakpoint::BreakpointResponse> {
        self.metrics
            .observe("finish_turn", breakpoint::finish_turn(self, agent_id))
            .await
    }

    pub async fn check_consistency(&self, agent_id: &str) -> Result<consistency::ConsistencyReport> {
        self.metrics
            .observe("check_consistency", consistency::execute(self, agent_id))
            .await
    }

    /// Counts for one agent. Uses the query backend when present and
    /// otherwise derives them from the store contract.
    pub async fn stats(&self, agent_id: &str) -> Result<AgentStats> {
        self.metrics
            .observe("stats", async {
                if let Some(query) = &self.query {
                    return query.aggregate_stats(agent_id).await;
                }
                let messages = self.storage.load_messages(agent_id).await?;
                let records = self.storage.load_tool_call_records(agent_id).await?;
                let snapshots = self.storage.list_snapshots(agent_id).await?;
                let mut events = 0u64;
                let mut query = EventQuery {
                    limit: self.event_page_size,
                    ..Default::default()
                };
                loop {
                    let page = self.storage.read_events(agent_id, &query).await?;
                    let Some(last) = page.last() else { break };
                    events += page.len() as u64;
                    query.since = Some(last.bookmark());
                }
                Ok(filter::stats_from_records(
                    agent_id,
                    messages.len() as u64,
                    &records,
                    snapshots.len() as u64,
                    events,
                ))
            })
            .await
    }

    pub async fn health(&self) -> HealthStatus {
        self.storage.health_check().await
    }

    pub async fn metrics(&self) -> Result<MetricsSnapshot> {
        let storage_bytes = self.storage.storage_size().await?;
        Ok(self.metrics.snapshot(storage_bytes))
    }
}

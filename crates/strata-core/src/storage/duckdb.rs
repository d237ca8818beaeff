use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::de::DeserializeOwned;
use tokio::sync::Mutex;

use crate::error::{Error, Result};
use crate::lock::{AgentLockGuard, LockTable};
use crate::metrics::HealthStatus;
use crate::model::agent::AgentInfo;
use crate::model::context::{CompressionRecord, HistoryWindow, MediaCacheEntry, TodoSnapshot};
use crate::model::event::{EventQuery, NewEvent, TimelineEvent};
use crate::model::message::Message;
use crate::model::snapshot::Snapshot;
use crate::model::tool_call::ToolCallRecord;
use crate::storage::filter::{self, SqlParam, WhereBuilder};
use crate::storage::{
    doc_kind, AgentFilter, AgentStats, MessageFilter, Page, QueryBackend, SnapshotFilter, Sort,
    StorageBackend, StoredMessage, StoredToolCall, ToolCallFilter,
};

const AGENT_COLUMNS: &str = "agent_id, template_id, created_at, config_version, lineage, message_count, last_sfp_index, last_bookmark, breakpoint, metadata";
const TOOL_CALL_COLUMNS: &str = "id, name, input, state, approval, result, error, is_error, created_at, updated_at, started_at, completed_at, duration_ms, audit_trail, agent_id";
const SNAPSHOT_COLUMNS: &str = "id, agent_id, messages, last_sfp_index, last_bookmark, created_at, metadata";

/// Embedded DuckDB adapter.
///
/// One connection guarded by an async mutex; every multi-statement write runs
/// in a single DuckDB transaction while that mutex is held.
pub struct DuckDbStorage {
    path: Option<PathBuf>,
    conn: Arc<Mutex<Option<duckdb::Connection>>>,
    locks: LockTable,
}

impl DuckDbStorage {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = duckdb::Connection::open(path)?;
        super::migrations::run_migrations(&conn)?;
        Ok(Self {
            path: Some(path.to_path_buf()),
            conn: Arc::new(Mutex::new(Some(conn))),
            locks: LockTable::new(),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = duckdb::Connection::open_in_memory()?;
        super::migrations::run_migrations(&conn)?;
        Ok(Self {
            path: None,
            conn: Arc::new(Mutex::new(Some(conn))),
            locks: LockTable::new(),
        })
    }

    /// A handle that does not touch the medium until [`StorageBackend::init`].
    pub fn deferred(path: Option<PathBuf>) -> Self {
        Self {
            path,
            conn: Arc::new(Mutex::new(None)),
            locks: LockTable::new(),
        }
    }

    async fn with_conn<T>(&self, f: impl FnOnce(&mut duckdb::Connection) -> Result<T>) -> Result<T> {
        let mut guard = self.conn.lock().await;
        let conn = guard
            .as_mut()
            .ok_or_else(|| Error::NotInitialized("duckdb connection is not open".to_string()))?;
        f(conn)
    }
}

impl duckdb::ToSql for SqlParam {
    fn to_sql(&self) -> duckdb::Result<duckdb::types::ToSqlOutput<'_>> {
        match self {
            SqlParam::Text(s) => s.to_sql(),
            SqlParam::Int(v) => v.to_sql(),
        }
    }
}

fn param_refs(w: &WhereBuilder) -> Vec<&dyn duckdb::ToSql> {
    w.params().iter().map(|p| p as &dyn duckdb::ToSql).collect()
}

fn conversion_error(
    idx: usize,
    e: impl std::error::Error + Send + Sync + 'static,
) -> duckdb::Error {
    duckdb::Error::FromSqlConversionFailure(idx, duckdb::types::Type::Text, Box::new(e))
}

fn json_col<T: DeserializeOwned>(row: &duckdb::Row<'_>, idx: usize) -> duckdb::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw).map_err(|e| conversion_error(idx, e))
}

fn json_col_opt<T: DeserializeOwned>(row: &duckdb::Row<'_>, idx: usize) -> duckdb::Result<Option<T>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| serde_json::from_str(&s))
        .transpose()
        .map_err(|e| conversion_error(idx, e))
}

fn parsed_col<T>(row: &duckdb::Row<'_>, idx: usize) -> duckdb::Result<T>
where
    T: std::str::FromStr<Err = Error>,
{
    row.get::<_, String>(idx)?
        .parse()
        .map_err(|e| conversion_error(idx, e))
}

fn to_json_opt<T: serde::Serialize>(value: &Option<T>) -> Result<Option<String>> {
    value
        .as_ref()
        .map(serde_json::to_string)
        .transpose()
        .map_err(Error::from)
}

fn row_to_agent(row: &duckdb::Row<'_>) -> duckdb::Result<AgentInfo> {
    let breakpoint: Option<String> = row.get(8)?;
    Ok(AgentInfo {
        agent_id: row.get(0)?,
        template_id: row.get(1)?,
        created_at: row.get(2)?,
        config_version: row.get(3)?,
        lineage: json_col(row, 4)?,
        message_count: row.get::<_, i64>(5)? as u64,
        last_sfp_index: row.get(6)?,
        last_bookmark: json_col_opt(row, 7)?,
        breakpoint: breakpoint
            .map(|s| s.parse())
            .transpose()
            .map_err(|e| conversion_error(8, e))?,
        metadata: json_col_opt(row, 9)?.unwrap_or(serde_json::Value::Null),
    })
}

fn row_to_message(row: &duckdb::Row<'_>) -> duckdb::Result<Message> {
    Ok(Message {
        role: parsed_col(row, 0)?,
        content: json_col(row, 1)?,
        metadata: json_col_opt(row, 2)?,
    })
}

fn row_to_tool_call(row: &duckdb::Row<'_>) -> duckdb::Result<ToolCallRecord> {
    Ok(ToolCallRecord {
        id: row.get(0)?,
        name: row.get(1)?,
        input: json_col(row, 2)?,
        state: parsed_col(row, 3)?,
        approval: json_col(row, 4)?,
        result: json_col_opt(row, 5)?,
        error: row.get(6)?,
        is_error: row.get(7)?,
        created_at: row.get(8)?,
        updated_at: row.get(9)?,
        started_at: row.get(10)?,
        completed_at: row.get(11)?,
        duration_ms: row.get(12)?,
        audit_trail: json_col(row, 13)?,
    })
}

fn row_to_snapshot(row: &duckdb::Row<'_>) -> duckdb::Result<Snapshot> {
    Ok(Snapshot {
        id: row.get(0)?,
        agent_id: row.get(1)?,
        messages: json_col(row, 2)?,
        last_sfp_index: row.get(3)?,
        last_bookmark: json_col_opt(row, 4)?,
        created_at: row.get(5)?,
        metadata: json_col_opt(row, 6)?,
    })
}

fn row_to_event(row: &duckdb::Row<'_>) -> duckdb::Result<TimelineEvent> {
    Ok(TimelineEvent {
        agent_id: row.get(0)?,
        seq: row.get(1)?,
        channel: parsed_col(row, 2)?,
        kind: row.get(3)?,
        payload: json_col(row, 4)?,
        timestamp: row.get(5)?,
    })
}

fn agent_exists(conn: &duckdb::Connection, agent_id: &str) -> Result<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM agents WHERE agent_id = ?",
        [agent_id],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

fn require_agent(conn: &duckdb::Connection, agent_id: &str) -> Result<()> {
    if agent_exists(conn, agent_id)? {
        Ok(())
    } else {
        Err(Error::NotFound(format!("agent {agent_id}")))
    }
}

fn count_rows(conn: &duckdb::Connection, table: &str, agent_id: &str) -> Result<u64> {
    let count: i64 = conn.query_row(
        &format!("SELECT COUNT(*) FROM {table} WHERE agent_id = ?"),
        [agent_id],
        |row| row.get(0),
    )?;
    Ok(count as u64)
}

fn upsert_agent(conn: &duckdb::Connection, info: &AgentInfo, message_count: u64) -> Result<()> {
    conn.execute(
        &format!(
            "INSERT OR REPLACE INTO agents ({AGENT_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
        ),
        duckdb::params![
            info.agent_id,
            info.template_id,
            info.created_at,
            info.config_version,
            serde_json::to_string(&info.lineage)?,
            message_count as i64,
            info.last_sfp_index,
            to_json_opt(&info.last_bookmark)?,
            info.breakpoint.map(|b| b.to_string()),
            serde_json::to_string(&info.metadata)?,
        ],
    )?;
    Ok(())
}

fn load_documents<T: DeserializeOwned>(
    conn: &duckdb::Connection,
    agent_id: &str,
    kind: &str,
) -> Result<Vec<T>> {
    let mut stmt = conn.prepare(
        "SELECT body FROM agent_documents WHERE agent_id = ? AND kind = ? ORDER BY seq ASC",
    )?;
    let rows = stmt.query_map([agent_id, kind], |row| json_col(row, 0))?;
    Ok(rows.collect::<duckdb::Result<Vec<T>>>()?)
}

fn load_document<T: DeserializeOwned>(
    conn: &duckdb::Connection,
    agent_id: &str,
    kind: &str,
    key: &str,
) -> Result<Option<T>> {
    let result = conn.query_row(
        "SELECT body FROM agent_documents WHERE agent_id = ? AND kind = ? AND doc_key = ?",
        [agent_id, kind, key],
        |row| json_col(row, 0),
    );
    match result {
        Ok(doc) => Ok(Some(doc)),
        Err(duckdb::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Append a document, or replace the one with the same key when `replace` is set.
fn write_document(
    conn: &mut duckdb::Connection,
    agent_id: &str,
    kind: &str,
    key: &str,
    body: String,
    replace: bool,
) -> Result<()> {
    let tx = conn.transaction()?;
    require_agent(&tx, agent_id)?;
    if replace {
        tx.execute(
            "DELETE FROM agent_documents WHERE agent_id = ? AND kind = ? AND doc_key = ?",
            [agent_id, kind, key],
        )?;
    }
    let next: i64 = tx.query_row(
        "SELECT COALESCE(MAX(seq), 0) + 1 FROM agent_documents WHERE agent_id = ?",
        [agent_id],
        |row| row.get(0),
    )?;
    tx.execute(
        "INSERT INTO agent_documents (agent_id, kind, doc_key, seq, body, created_at) VALUES (?, ?, ?, ?, ?, ?)",
        duckdb::params![agent_id, kind, key, next, body, chrono::Utc::now().to_rfc3339()],
    )?;
    tx.commit()?;
    Ok(())
}

#[async_trait::async_trait]
impl StorageBackend for DuckDbStorage {
    fn backend_name(&self) -> &'static str {
        "duckdb"
    }

    async fn init(&self) -> Result<()> {
        let mut guard = self.conn.lock().await;
        if let Some(conn) = guard.as_ref() {
            super::migrations::run_migrations(conn)?;
        } else {
            let conn = match &self.path {
                Some(path) => duckdb::Connection::open(path)?,
                None => duckdb::Connection::open_in_memory()?,
            };
            super::migrations::run_migrations(&conn)?;
            *guard = Some(conn);
        }
        tracing::debug!(path = ?self.path, "duckdb storage initialized");
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let mut guard = self.conn.lock().await;
        if let Some(conn) = guard.take() {
            if let Err((_, e)) = conn.close() {
                tracing::warn!(error = %e, "duckdb close reported an error");
            }
        }
        Ok(())
    }

    async fn create_info(&self, info: &AgentInfo) -> Result<()> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            if agent_exists(&tx, &info.agent_id)? {
                return Err(Error::ConstraintViolation(format!(
                    "agent {} already exists",
                    info.agent_id
                )));
            }
            let count = count_rows(&tx, "messages", &info.agent_id)?;
            upsert_agent(&tx, info, count)?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn save_info(&self, info: &AgentInfo) -> Result<()> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            let count = count_rows(&tx, "messages", &info.agent_id)?;
            upsert_agent(&tx, info, count)?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn load_info(&self, agent_id: &str) -> Result<Option<AgentInfo>> {
        self.with_conn(|conn| {
            let result = conn.query_row(
                &format!("SELECT {AGENT_COLUMNS} FROM agents WHERE agent_id = ?"),
                [agent_id],
                row_to_agent,
            );
            match result {
                Ok(info) => Ok(Some(info)),
                Err(duckdb::Error::QueryReturnedNoRows) => Ok(None),
                Err(e) => Err(e.into()),
            }
        })
        .await
    }

    async fn save_messages(&self, agent_id: &str, messages: &[Message]) -> Result<()> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            require_agent(&tx, agent_id)?;
            tx.execute("DELETE FROM messages WHERE agent_id = ?", [agent_id])?;
            {
                let mut stmt = tx.prepare(
                    "INSERT INTO messages (agent_id, seq, role, content, metadata) VALUES (?, ?, ?, ?, ?)",
                )?;
                for (seq, message) in messages.iter().enumerate() {
                    stmt.execute(duckdb::params![
                        agent_id,
                        seq as i64,
                        message.role.to_string(),
                        serde_json::to_string(&message.content)?,
                        to_json_opt(&message.metadata)?,
                    ])?;
                }
            }
            tx.execute(
                "UPDATE agents SET message_count = ? WHERE agent_id = ?",
                duckdb::params![messages.len() as i64, agent_id],
            )?;
            tx.commit()?;
            Ok(())
        })
        .await
        .inspect_err(|e| tracing::error!(agent_id, error = %e, "save_messages rolled back"))
    }

    async fn load_messages(&self, agent_id: &str) -> Result<Vec<Message>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT role, content, metadata FROM messages WHERE agent_id = ? ORDER BY seq ASC",
            )?;
            let rows = stmt.query_map([agent_id], row_to_message)?;
            Ok(rows.collect::<duckdb::Result<Vec<_>>>()?)
        })
        .await
    }

    async fn save_tool_call_records(&self, agent_id: &str, records: &[ToolCallRecord]) -> Result<()> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            require_agent(&tx, agent_id)?;
            tx.execute("DELETE FROM tool_calls WHERE agent_id = ?", [agent_id])?;
            {
                let mut stmt = tx.prepare(
                    "INSERT INTO tool_calls (agent_id, id, position, name, input, state, approval, result, error, is_error, created_at, updated_at, started_at, completed_at, duration_ms, audit_trail) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                )?;
                for (position, record) in records.iter().enumerate() {
                    stmt.execute(duckdb::params![
                        agent_id,
                        record.id,
                        position as i64,
                        record.name,
                        serde_json::to_string(&record.input)?,
                        record.state.to_string(),
                        serde_json::to_string(&record.approval)?,
                        to_json_opt(&record.result)?,
                        record.error,
                        record.is_error,
                        record.created_at,
                        record.updated_at,
                        record.started_at,
                        record.completed_at,
                        record.duration_ms,
                        serde_json::to_string(&record.audit_trail)?,
                    ])?;
                }
            }
            tx.commit()?;
            Ok(())
        })
        .await
        .inspect_err(|e| tracing::error!(agent_id, error = %e, "save_tool_call_records rolled back"))
    }

    async fn load_tool_call_records(&self, agent_id: &str) -> Result<Vec<ToolCallRecord>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {TOOL_CALL_COLUMNS} FROM tool_calls WHERE agent_id = ? ORDER BY position ASC"
            ))?;
            let rows = stmt.query_map([agent_id], row_to_tool_call)?;
            Ok(rows.collect::<duckdb::Result<Vec<_>>>()?)
        })
        .await
    }

    async fn save_snapshot(&self, snapshot: &Snapshot) -> Result<()> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            require_agent(&tx, &snapshot.agent_id)?;
            tx.execute(
                "DELETE FROM snapshots WHERE agent_id = ? AND id = ?",
                [&snapshot.agent_id, &snapshot.id],
            )?;
            tx.execute(
                "INSERT INTO snapshots (id, agent_id, messages, message_count, last_sfp_index, last_bookmark, created_at, metadata) VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
                duckdb::params![
                    snapshot.id,
                    snapshot.agent_id,
                    serde_json::to_string(&snapshot.messages)?,
                    snapshot.messages.len() as i64,
                    snapshot.last_sfp_index,
                    to_json_opt(&snapshot.last_bookmark)?,
                    snapshot.created_at,
                    to_json_opt(&snapshot.metadata)?,
                ],
            )?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn load_snapshot(&self, agent_id: &str, snapshot_id: &str) -> Result<Option<Snapshot>> {
        self.with_conn(|conn| {
            let result = conn.query_row(
                &format!("SELECT {SNAPSHOT_COLUMNS} FROM snapshots WHERE agent_id = ? AND id = ?"),
                [agent_id, snapshot_id],
                row_to_snapshot,
            );
            match result {
                Ok(snapshot) => Ok(Some(snapshot)),
                Err(duckdb::Error::QueryReturnedNoRows) => Ok(None),
                Err(e) => Err(e.into()),
            }
        })
        .await
    }

    async fn list_snapshots(&self, agent_id: &str) -> Result<Vec<Snapshot>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {SNAPSHOT_COLUMNS} FROM snapshots WHERE agent_id = ? ORDER BY created_at ASC, id ASC"
            ))?;
            let rows = stmt.query_map([agent_id], row_to_snapshot)?;
            Ok(rows.collect::<duckdb::Result<Vec<_>>>()?)
        })
        .await
    }

    async fn delete_snapshot(&self, agent_id: &str, snapshot_id: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "DELETE FROM snapshots WHERE agent_id = ? AND id = ?",
                [agent_id, snapshot_id],
            )?;
            Ok(())
        })
        .await
    }

    async fn append_event(&self, agent_id: &str, event: &NewEvent) -> Result<TimelineEvent> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            require_agent(&tx, agent_id)?;
            let seq: i64 = tx.query_row(
                "SELECT COALESCE(MAX(seq), 0) + 1 FROM events WHERE agent_id = ?",
                [agent_id],
                |row| row.get(0),
            )?;
            let appended = TimelineEvent {
                agent_id: agent_id.to_string(),
                seq,
                channel: event.channel,
                kind: event.kind.clone(),
                payload: event.payload.clone(),
                timestamp: chrono::Utc::now().to_rfc3339(),
            };
            tx.execute(
                "INSERT INTO events (agent_id, seq, channel, kind, payload, timestamp) VALUES (?, ?, ?, ?, ?, ?)",
                duckdb::params![
                    appended.agent_id,
                    appended.seq,
                    appended.channel.to_string(),
                    appended.kind,
                    serde_json::to_string(&appended.payload)?,
                    appended.timestamp,
                ],
            )?;
            tx.commit()?;
            Ok(appended)
        })
        .await
    }

    async fn read_events(&self, agent_id: &str, query: &EventQuery) -> Result<Vec<TimelineEvent>> {
        let mut w = WhereBuilder::new();
        w.eq("agent_id", agent_id)
            .compare("seq", ">", query.since_seq());
        if let Some(channels) = &query.channels {
            w.any_of("channel", channels.iter().map(|c| c.to_string()));
        }
        let sql = format!(
            "SELECT agent_id, seq, channel, kind, payload, timestamp FROM events {} ORDER BY seq ASC LIMIT {}",
            w.clause(),
            query.limit
        );
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(param_refs(&w).as_slice(), row_to_event)?;
            Ok(rows.collect::<duckdb::Result<Vec<_>>>()?)
        })
        .await
    }

    async fn save_todos(&self, agent_id: &str, todos: &TodoSnapshot) -> Result<()> {
        let body = serde_json::to_string(todos)?;
        self.with_conn(|conn| {
            write_document(conn, agent_id, doc_kind::TODOS, doc_kind::TODOS_KEY, body, true)
        })
        .await
    }

    async fn load_todos(&self, agent_id: &str) -> Result<Option<TodoSnapshot>> {
        self.with_conn(|conn| load_document(conn, agent_id, doc_kind::TODOS, doc_kind::TODOS_KEY))
            .await
    }

    async fn append_history_window(&self, agent_id: &str, window: &HistoryWindow) -> Result<()> {
        let body = serde_json::to_string(window)?;
        self.with_conn(|conn| {
            write_document(conn, agent_id, doc_kind::HISTORY_WINDOW, &window.id, body, false)
        })
        .await
    }

    async fn list_history_windows(&self, agent_id: &str) -> Result<Vec<HistoryWindow>> {
        self.with_conn(|conn| load_documents(conn, agent_id, doc_kind::HISTORY_WINDOW))
            .await
    }

    async fn append_compression_record(&self, agent_id: &str, record: &CompressionRecord) -> Result<()> {
        let body = serde_json::to_string(record)?;
        self.with_conn(|conn| {
            write_document(conn, agent_id, doc_kind::COMPRESSION, &record.id, body, false)
        })
        .await
    }

    async fn list_compression_records(&self, agent_id: &str) -> Result<Vec<CompressionRecord>> {
        self.with_conn(|conn| load_documents(conn, agent_id, doc_kind::COMPRESSION))
            .await
    }

    async fn save_media(&self, agent_id: &str, entry: &MediaCacheEntry) -> Result<()> {
        let body = serde_json::to_string(entry)?;
        self.with_conn(|conn| {
            write_document(conn, agent_id, doc_kind::MEDIA, &entry.content_hash, body, true)
        })
        .await
    }

    async fn load_media(&self, agent_id: &str, content_hash: &str) -> Result<Option<MediaCacheEntry>> {
        self.with_conn(|conn| load_document(conn, agent_id, doc_kind::MEDIA, content_hash))
            .await
    }

    async fn exists(&self, agent_id: &str) -> Result<bool> {
        self.with_conn(|conn| agent_exists(conn, agent_id)).await
    }

    async fn delete(&self, agent_id: &str) -> Result<()> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            for table in [
                "tool_calls",
                "messages",
                "snapshots",
                "events",
                "agent_documents",
                "agents",
            ] {
                tx.execute(&format!("DELETE FROM {table} WHERE agent_id = ?"), [agent_id])?;
            }
            tx.commit()?;
            Ok(())
        })
        .await?;
        tracing::debug!(agent_id, "agent deleted");
        Ok(())
    }

    async fn list(&self, prefix: Option<&str>) -> Result<Vec<String>> {
        let mut w = WhereBuilder::new();
        if let Some(prefix) = prefix {
            w.prefix("agent_id", prefix);
        }
        let sql = format!(
            "SELECT agent_id FROM agents {} ORDER BY created_at DESC, agent_id DESC",
            w.clause()
        );
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(param_refs(&w).as_slice(), |row| row.get::<_, String>(0))?;
            Ok(rows.collect::<duckdb::Result<Vec<_>>>()?)
        })
        .await
    }

    async fn acquire_agent_lock(&self, agent_id: &str, timeout: Duration) -> Result<AgentLockGuard> {
        self.locks.acquire(agent_id, timeout).await
    }

    async fn health_check(&self) -> HealthStatus {
        let started = Instant::now();
        let probe = self
            .with_conn(|conn| {
                conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
                Ok(())
            })
            .await;
        HealthStatus::from_probe(self.backend_name(), started, probe)
    }

    async fn storage_size(&self) -> Result<u64> {
        self.with_conn(|conn| {
            let bytes: i64 = conn.query_row(
                "SELECT CAST(COALESCE(SUM(block_size * used_blocks), 0) AS BIGINT) FROM pragma_database_size()",
                [],
                |row| row.get(0),
            )?;
            Ok(bytes.max(0) as u64)
        })
        .await
    }
}

#[async_trait::async_trait]
impl QueryBackend for DuckDbStorage {
    async fn query_agents(&self, filter: &AgentFilter, page: &Page, sort: &Sort) -> Result<Vec<AgentInfo>> {
        let w = filter::agent_filter_sql(filter);
        let sql = format!(
            "SELECT {AGENT_COLUMNS} FROM agents {} {} {}",
            w.clause(),
            filter::order_by(sort, "agent_id"),
            page.sql_clause()
        );
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(param_refs(&w).as_slice(), row_to_agent)?;
            Ok(rows.collect::<duckdb::Result<Vec<_>>>()?)
        })
        .await
    }

    async fn query_messages(&self, filter: &MessageFilter, page: &Page) -> Result<Vec<StoredMessage>> {
        let w = filter::message_filter_sql(filter);
        let sql = format!(
            "SELECT role, content, metadata, agent_id, seq FROM messages {} ORDER BY agent_id ASC, seq ASC {}",
            w.clause(),
            page.sql_clause()
        );
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(param_refs(&w).as_slice(), |row| {
                Ok(StoredMessage {
                    message: row_to_message(row)?,
                    agent_id: row.get(3)?,
                    seq: row.get::<_, i64>(4)? as u64,
                })
            })?;
            Ok(rows.collect::<duckdb::Result<Vec<_>>>()?)
        })
        .await
    }

    async fn query_tool_calls(&self, filter: &ToolCallFilter, page: &Page, sort: &Sort) -> Result<Vec<StoredToolCall>> {
        let w = filter::tool_call_filter_sql(filter);
        let sql = format!(
            "SELECT {TOOL_CALL_COLUMNS} FROM tool_calls {} {} {}",
            w.clause(),
            filter::order_by(sort, "id"),
            page.sql_clause()
        );
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(param_refs(&w).as_slice(), |row| {
                Ok(StoredToolCall {
                    record: row_to_tool_call(row)?,
                    agent_id: row.get(14)?,
                })
            })?;
            Ok(rows.collect::<duckdb::Result<Vec<_>>>()?)
        })
        .await
    }

    async fn query_snapshots(&self, filter: &SnapshotFilter, page: &Page, sort: &Sort) -> Result<Vec<Snapshot>> {
        let w = filter::snapshot_filter_sql(filter);
        let sql = format!(
            "SELECT {SNAPSHOT_COLUMNS} FROM snapshots {} {} {}",
            w.clause(),
            filter::order_by(sort, "id"),
            page.sql_clause()
        );
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(param_refs(&w).as_slice(), row_to_snapshot)?;
            Ok(rows.collect::<duckdb::Result<Vec<_>>>()?)
        })
        .await
    }

    async fn aggregate_stats(&self, agent_id: &str) -> Result<AgentStats> {
        self.with_conn(|conn| {
            let mut stats = AgentStats {
                agent_id: agent_id.to_string(),
                message_count: count_rows(conn, "messages", agent_id)?,
                tool_call_count: count_rows(conn, "tool_calls", agent_id)?,
                snapshot_count: count_rows(conn, "snapshots", agent_id)?,
                event_count: count_rows(conn, "events", agent_id)?,
                ..Default::default()
            };
            for (column, target) in [
                ("name", &mut stats.tool_calls_by_name),
                ("state", &mut stats.tool_calls_by_state),
            ] {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {column}, COUNT(*) FROM tool_calls WHERE agent_id = ? GROUP BY {column}"
                ))?;
                let rows = stmt.query_map([agent_id], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as u64))
                })?;
                for row in rows {
                    let (key, count) = row?;
                    target.insert(key, count);
                }
            }
            Ok(stats)
        })
        .await
    }
}

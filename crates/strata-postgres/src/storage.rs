use std::sync::RwLock;
use std::time::{Duration, Instant};

use serde::de::DeserializeOwned;
use sha2::{Digest, Sha256};
use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgArguments, PgPool, PgPoolOptions, PgRow};
use sqlx::query::Query;
use sqlx::types::Json;
use sqlx::{Postgres, Row, Transaction};

use strata_core::config::PoolConfig;
use strata_core::error::{Error, Result};
use strata_core::lock::{AgentLockGuard, LockRelease};
use strata_core::metrics::HealthStatus;
use strata_core::model::agent::AgentInfo;
use strata_core::model::context::{CompressionRecord, HistoryWindow, MediaCacheEntry, TodoSnapshot};
use strata_core::model::event::{EventQuery, NewEvent, TimelineEvent};
use strata_core::model::message::Message;
use strata_core::model::snapshot::Snapshot;
use strata_core::model::tool_call::ToolCallRecord;
use strata_core::retry::{RetryPolicy, with_retry};
use strata_core::storage::filter::{self, SqlParam, WhereBuilder};
use strata_core::storage::{
    AgentFilter, AgentStats, MessageFilter, Page, QueryBackend, SnapshotFilter, Sort,
    StorageBackend, StoredMessage, StoredToolCall, ToolCallFilter, doc_kind,
};

use crate::migrations::{TABLE_NAMES, run_migrations};

const AGENT_COLUMNS: &str = "agent_id, template_id, created_at, config_version, lineage, message_count, last_sfp_index, last_bookmark, breakpoint, metadata";
const TOOL_CALL_COLUMNS: &str = "agent_id, id, name, input, state, approval, result, error, is_error, created_at, updated_at, started_at, completed_at, duration_ms, audit_trail";
const SNAPSHOT_COLUMNS: &str = "id, agent_id, messages, last_sfp_index, last_bookmark, created_at, metadata";

const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// PostgreSQL adapter over a shared connection pool.
///
/// Agent locks are transaction-scoped advisory locks, so they exclude callers
/// in every process connected to the same database.
pub struct PgStorage {
    pool: RwLock<Option<PgPool>>,
    url: Option<String>,
    pool_config: PoolConfig,
    retry: RetryPolicy,
}

impl PgStorage {
    /// A handle that does not connect until [`StorageBackend::init`].
    pub fn new(url: impl Into<String>, pool_config: PoolConfig) -> Self {
        Self {
            pool: RwLock::new(None),
            url: Some(url.into()),
            pool_config,
            retry: RetryPolicy::default(),
        }
    }

    pub async fn connect(url: &str, pool_config: &PoolConfig) -> Result<Self> {
        let storage = Self::new(url, pool_config.clone());
        storage.init().await?;
        Ok(storage)
    }

    /// Wrap an existing pool. Migrations still run on [`StorageBackend::init`].
    pub fn from_pool(pool: PgPool) -> Self {
        Self {
            pool: RwLock::new(Some(pool)),
            url: None,
            pool_config: PoolConfig::default(),
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn pool(&self) -> Result<PgPool> {
        self.pool
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or_else(|| Error::NotInitialized("postgres pool is not open".to_string()))
    }

    async fn conn(&self) -> Result<PoolConnection<Postgres>> {
        let pool = self.pool()?;
        with_retry(&self.retry, "pg_acquire", || {
            let pool = pool.clone();
            async move { pool.acquire().await.map_err(map_sqlx) }
        })
        .await
    }

    async fn begin(&self) -> Result<Transaction<'static, Postgres>> {
        let pool = self.pool()?;
        with_retry(&self.retry, "pg_begin", || {
            let pool = pool.clone();
            async move { pool.begin().await.map_err(map_sqlx) }
        })
        .await
    }

    async fn open_pool(&self, url: &str) -> Result<PgPool> {
        let cfg = &self.pool_config;
        with_retry(&self.retry, "pg_connect", || {
            let options = PgPoolOptions::new()
                .max_connections(cfg.max_connections)
                .min_connections(cfg.min_connections)
                .acquire_timeout(cfg.acquire_timeout())
                .idle_timeout(cfg.idle_timeout());
            async move { options.connect(url).await.map_err(map_sqlx) }
        })
        .await
    }

    async fn write_document(
        &self,
        agent_id: &str,
        kind: &str,
        key: &str,
        body: serde_json::Value,
        replace: bool,
    ) -> Result<()> {
        let mut tx = self.begin().await?;
        require_agent(&mut tx, agent_id).await?;
        if replace {
            sqlx::query("DELETE FROM agent_documents WHERE agent_id = $1 AND kind = $2 AND doc_key = $3")
                .bind(agent_id)
                .bind(kind)
                .bind(key)
                .execute(&mut *tx)
                .await
                .map_err(map_sqlx)?;
        }
        sqlx::query(
            "INSERT INTO agent_documents (agent_id, kind, doc_key, body, created_at) VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(agent_id)
        .bind(kind)
        .bind(key)
        .bind(Json(&body))
        .bind(chrono::Utc::now().to_rfc3339())
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx)?;
        tx.commit().await.map_err(map_sqlx)
    }

    async fn load_documents<T: DeserializeOwned + 'static>(&self, agent_id: &str, kind: &str) -> Result<Vec<T>> {
        let mut conn = self.conn().await?;
        let rows = sqlx::query("SELECT body FROM agent_documents WHERE agent_id = $1 AND kind = $2 ORDER BY id ASC")
            .bind(agent_id)
            .bind(kind)
            .fetch_all(&mut *conn)
            .await
            .map_err(map_sqlx)?;
        rows.iter()
            .map(|row| json_col(row, "body"))
            .collect::<std::result::Result<Vec<T>, _>>()
            .map_err(map_sqlx)
    }

    async fn load_document<T: DeserializeOwned + 'static>(
        &self,
        agent_id: &str,
        kind: &str,
        key: &str,
    ) -> Result<Option<T>> {
        let mut conn = self.conn().await?;
        let row = sqlx::query(
            "SELECT body FROM agent_documents WHERE agent_id = $1 AND kind = $2 AND doc_key = $3 ORDER BY id DESC LIMIT 1",
        )
        .bind(agent_id)
        .bind(kind)
        .bind(key)
        .fetch_optional(&mut *conn)
        .await
        .map_err(map_sqlx)?;
        row.map(|r| json_col(&r, "body")).transpose().map_err(map_sqlx)
    }

    async fn count_rows(&self, conn: &mut PoolConnection<Postgres>, table: &str, agent_id: &str) -> Result<u64> {
        let count: i64 = sqlx::query(&format!("SELECT COUNT(*) FROM {table} WHERE agent_id = $1"))
            .bind(agent_id)
            .fetch_one(&mut **conn)
            .await
            .map_err(map_sqlx)?
            .try_get(0)
            .map_err(map_sqlx)?;
        Ok(count as u64)
    }
}

fn map_sqlx(e: sqlx::Error) -> Error {
    match &e {
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) | sqlx::Error::Tls(_) => {
            Error::ConnectionFailure(e.to_string())
        }
        sqlx::Error::Database(db) if db.is_unique_violation() || db.is_foreign_key_violation() => {
            Error::ConstraintViolation(e.to_string())
        }
        _ => Error::Storage(e.to_string()),
    }
}

/// Advisory-lock key for `agent_id` within `namespace`.
fn lock_key(namespace: &str, agent_id: &str) -> i64 {
    let digest = Sha256::digest(format!("{namespace}{agent_id}").as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    i64::from_be_bytes(bytes)
}

fn bind_params<'q>(
    mut query: Query<'q, Postgres, PgArguments>,
    params: &'q [SqlParam],
) -> Query<'q, Postgres, PgArguments> {
    for param in params {
        query = match param {
            SqlParam::Text(s) => query.bind(s.as_str()),
            SqlParam::Int(v) => query.bind(*v),
        };
    }
    query
}

fn decode_error(e: impl std::error::Error + Send + Sync + 'static) -> sqlx::Error {
    sqlx::Error::Decode(Box::new(e))
}

fn json_col<T: DeserializeOwned + 'static>(row: &PgRow, col: &str) -> std::result::Result<T, sqlx::Error> {
    Ok(row.try_get::<Json<T>, _>(col)?.0)
}

fn json_col_opt<T: DeserializeOwned + 'static>(
    row: &PgRow,
    col: &str,
) -> std::result::Result<Option<T>, sqlx::Error> {
    Ok(row.try_get::<Option<Json<T>>, _>(col)?.map(|j| j.0))
}

fn parsed_col<T>(row: &PgRow, col: &str) -> std::result::Result<T, sqlx::Error>
where
    T: std::str::FromStr<Err = Error>,
{
    row.try_get::<String, _>(col)?.parse().map_err(decode_error)
}

fn row_to_agent(row: &PgRow) -> std::result::Result<AgentInfo, sqlx::Error> {
    let breakpoint: Option<String> = row.try_get("breakpoint")?;
    Ok(AgentInfo {
        agent_id: row.try_get("agent_id")?,
        template_id: row.try_get("template_id")?,
        created_at: row.try_get("created_at")?,
        config_version: row.try_get("config_version")?,
        lineage: json_col(row, "lineage")?,
        message_count: row.try_get::<i64, _>("message_count")? as u64,
        last_sfp_index: row.try_get("last_sfp_index")?,
        last_bookmark: json_col_opt(row, "last_bookmark")?,
        breakpoint: breakpoint
            .map(|s| s.parse())
            .transpose()
            .map_err(decode_error)?,
        metadata: json_col_opt(row, "metadata")?.unwrap_or(serde_json::Value::Null),
    })
}

fn row_to_message(row: &PgRow) -> std::result::Result<Message, sqlx::Error> {
    Ok(Message {
        role: parsed_col(row, "role")?,
        content: json_col(row, "content")?,
        metadata: json_col_opt(row, "metadata")?,
    })
}

fn row_to_tool_call(row: &PgRow) -> std::result::Result<ToolCallRecord, sqlx::Error> {
    Ok(ToolCallRecord {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        input: json_col(row, "input")?,
        state: parsed_col(row, "state")?,
        approval: json_col(row, "approval")?,
        result: json_col_opt(row, "result")?,
        error: row.try_get("error")?,
        is_error: row.try_get("is_error")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
        duration_ms: row.try_get("duration_ms")?,
        audit_trail: json_col(row, "audit_trail")?,
    })
}

fn row_to_snapshot(row: &PgRow) -> std::result::Result<Snapshot, sqlx::Error> {
    Ok(Snapshot {
        id: row.try_get("id")?,
        agent_id: row.try_get("agent_id")?,
        messages: json_col(row, "messages")?,
        last_sfp_index: row.try_get("last_sfp_index")?,
        last_bookmark: json_col_opt(row, "last_bookmark")?,
        created_at: row.try_get("created_at")?,
        metadata: json_col_opt(row, "metadata")?,
    })
}

fn row_to_event(row: &PgRow) -> std::result::Result<TimelineEvent, sqlx::Error> {
    Ok(TimelineEvent {
        agent_id: row.try_get("agent_id")?,
        seq: row.try_get("seq")?,
        channel: parsed_col(row, "channel")?,
        kind: row.try_get("kind")?,
        payload: json_col(row, "payload")?,
        timestamp: row.try_get("timestamp")?,
    })
}

fn map_rows<T>(
    rows: &[PgRow],
    f: impl Fn(&PgRow) -> std::result::Result<T, sqlx::Error>,
) -> Result<Vec<T>> {
    rows.iter()
        .map(f)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(map_sqlx)
}

/// Row-locks the agent for the rest of `tx`, or fails with `NotFound`.
async fn require_agent(tx: &mut Transaction<'static, Postgres>, agent_id: &str) -> Result<()> {
    let found = sqlx::query("SELECT 1 FROM agents WHERE agent_id = $1 FOR UPDATE")
        .bind(agent_id)
        .fetch_optional(&mut **tx)
        .await
        .map_err(map_sqlx)?;
    match found {
        Some(_) => Ok(()),
        None => Err(Error::NotFound(format!("agent {agent_id}"))),
    }
}

fn upsert_agent_sql(on_conflict: &str) -> String {
    format!(
        "INSERT INTO agents ({AGENT_COLUMNS}) \
         VALUES ($1, $2, $3, $4, $5, (SELECT COUNT(*) FROM messages WHERE agent_id = $1), $6, $7, $8, $9) \
         {on_conflict}"
    )
}

fn bind_agent<'q>(
    query: Query<'q, Postgres, PgArguments>,
    info: &'q AgentInfo,
) -> Query<'q, Postgres, PgArguments> {
    query
        .bind(&info.agent_id)
        .bind(&info.template_id)
        .bind(&info.created_at)
        .bind(&info.config_version)
        .bind(Json(&info.lineage))
        .bind(info.last_sfp_index)
        .bind(info.last_bookmark.as_ref().map(Json))
        .bind(info.breakpoint.map(|b| b.to_string()))
        .bind(Json(&info.metadata))
}

struct AdvisoryLock {
    tx: Transaction<'static, Postgres>,
}

#[async_trait::async_trait]
impl LockRelease for AdvisoryLock {
    async fn release(self: Box<Self>) -> Result<()> {
        self.tx.commit().await.map_err(map_sqlx)
    }
}

#[async_trait::async_trait]
impl StorageBackend for PgStorage {
    fn backend_name(&self) -> &'static str {
        "postgres"
    }

    async fn init(&self) -> Result<()> {
        let pool = match self.pool() {
            Ok(pool) => pool,
            Err(_) => {
                let url = self.url.as_deref().ok_or_else(|| {
                    Error::NotInitialized("postgres storage has no url to reconnect with".to_string())
                })?;
                let pool = self.open_pool(url).await?;
                *self.pool.write().unwrap_or_else(|e| e.into_inner()) = Some(pool.clone());
                pool
            }
        };
        run_migrations(&pool).await?;
        tracing::info!(
            max_connections = self.pool_config.max_connections,
            "postgres storage initialized"
        );
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let pool = self.pool.write().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(pool) = pool {
            pool.close().await;
            tracing::debug!("postgres pool closed");
        }
        Ok(())
    }

    async fn create_info(&self, info: &AgentInfo) -> Result<()> {
        let mut conn = self.conn().await?;
        let sql = upsert_agent_sql("ON CONFLICT (agent_id) DO NOTHING");
        let result = bind_agent(sqlx::query(&sql), info)
            .execute(&mut *conn)
            .await
            .map_err(map_sqlx)?;
        if result.rows_affected() == 0 {
            return Err(Error::ConstraintViolation(format!(
                "agent {} already exists",
                info.agent_id
            )));
        }
        Ok(())
    }

    async fn save_info(&self, info: &AgentInfo) -> Result<()> {
        let mut conn = self.conn().await?;
        let sql = upsert_agent_sql(
            "ON CONFLICT (agent_id) DO UPDATE SET \
             template_id = EXCLUDED.template_id, created_at = EXCLUDED.created_at, \
             config_version = EXCLUDED.config_version, lineage = EXCLUDED.lineage, \
             message_count = EXCLUDED.message_count, last_sfp_index = EXCLUDED.last_sfp_index, \
             last_bookmark = EXCLUDED.last_bookmark, breakpoint = EXCLUDED.breakpoint, \
             metadata = EXCLUDED.metadata",
        );
        bind_agent(sqlx::query(&sql), info)
            .execute(&mut *conn)
            .await
            .map_err(map_sqlx)?;
        Ok(())
    }

    async fn load_info(&self, agent_id: &str) -> Result<Option<AgentInfo>> {
        let mut conn = self.conn().await?;
        let row = sqlx::query(&format!("SELECT {AGENT_COLUMNS} FROM agents WHERE agent_id = $1"))
            .bind(agent_id)
            .fetch_optional(&mut *conn)
            .await
            .map_err(map_sqlx)?;
        row.map(|r| row_to_agent(&r)).transpose().map_err(map_sqlx)
    }

    async fn save_messages(&self, agent_id: &str, messages: &[Message]) -> Result<()> {
        let mut tx = self.begin().await?;
        require_agent(&mut tx, agent_id).await?;
        sqlx::query("DELETE FROM messages WHERE agent_id = $1")
            .bind(agent_id)
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx)?;
        for (seq, message) in messages.iter().enumerate() {
            sqlx::query(
                "INSERT INTO messages (agent_id, seq, role, content, metadata) VALUES ($1, $2, $3, $4, $5)",
            )
            .bind(agent_id)
            .bind(seq as i64)
            .bind(message.role.to_string())
            .bind(Json(&message.content))
            .bind(message.metadata.as_ref().map(Json))
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx)?;
        }
        sqlx::query("UPDATE agents SET message_count = $1 WHERE agent_id = $2")
            .bind(messages.len() as i64)
            .bind(agent_id)
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx)?;
        tx.commit()
            .await
            .map_err(map_sqlx)
            .inspect_err(|e| tracing::error!(agent_id, error = %e, "save_messages rolled back"))
    }

    async fn load_messages(&self, agent_id: &str) -> Result<Vec<Message>> {
        let mut conn = self.conn().await?;
        let rows = sqlx::query("SELECT role, content, metadata FROM messages WHERE agent_id = $1 ORDER BY seq ASC")
            .bind(agent_id)
            .fetch_all(&mut *conn)
            .await
            .map_err(map_sqlx)?;
        map_rows(&rows, row_to_message)
    }

    async fn save_tool_call_records(&self, agent_id: &str, records: &[ToolCallRecord]) -> Result<()> {
        let mut tx = self.begin().await?;
        require_agent(&mut tx, agent_id).await?;
        sqlx::query("DELETE FROM tool_calls WHERE agent_id = $1")
            .bind(agent_id)
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx)?;
        for (position, record) in records.iter().enumerate() {
            sqlx::query(
                "INSERT INTO tool_calls (agent_id, id, position, name, input, state, approval, result, error, is_error, created_at, updated_at, started_at, completed_at, duration_ms, audit_trail) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)",
            )
            .bind(agent_id)
            .bind(&record.id)
            .bind(position as i64)
            .bind(&record.name)
            .bind(Json(&record.input))
            .bind(record.state.to_string())
            .bind(Json(&record.approval))
            .bind(record.result.as_ref().map(Json))
            .bind(&record.error)
            .bind(record.is_error)
            .bind(&record.created_at)
            .bind(&record.updated_at)
            .bind(&record.started_at)
            .bind(&record.completed_at)
            .bind(record.duration_ms)
            .bind(Json(&record.audit_trail))
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx)?;
        }
        tx.commit()
            .await
            .map_err(map_sqlx)
            .inspect_err(|e| tracing::error!(agent_id, error = %e, "save_tool_call_records rolled back"))
    }

    async fn load_tool_call_records(&self, agent_id: &str) -> Result<Vec<ToolCallRecord>> {
        let mut conn = self.conn().await?;
        let rows = sqlx::query(&format!(
            "SELECT {TOOL_CALL_COLUMNS} FROM tool_calls WHERE agent_id = $1 ORDER BY position ASC"
        ))
        .bind(agent_id)
        .fetch_all(&mut *conn)
        .await
        .map_err(map_sqlx)?;
        map_rows(&rows, row_to_tool_call)
    }

    async fn save_snapshot(&self, snapshot: &Snapshot) -> Result<()> {
        let mut tx = self.begin().await?;
        require_agent(&mut tx, &snapshot.agent_id).await?;
        sqlx::query(
            "INSERT INTO snapshots (id, agent_id, messages, message_count, last_sfp_index, last_bookmark, created_at, metadata) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8) \
             ON CONFLICT (agent_id, id) DO UPDATE SET \
             messages = EXCLUDED.messages, message_count = EXCLUDED.message_count, \
             last_sfp_index = EXCLUDED.last_sfp_index, last_bookmark = EXCLUDED.last_bookmark, \
             created_at = EXCLUDED.created_at, metadata = EXCLUDED.metadata",
        )
        .bind(&snapshot.id)
        .bind(&snapshot.agent_id)
        .bind(Json(&snapshot.messages))
        .bind(snapshot.messages.len() as i64)
        .bind(snapshot.last_sfp_index)
        .bind(snapshot.last_bookmark.as_ref().map(Json))
        .bind(&snapshot.created_at)
        .bind(snapshot.metadata.as_ref().map(Json))
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx)?;
        tx.commit().await.map_err(map_sqlx)
    }

    async fn load_snapshot(&self, agent_id: &str, snapshot_id: &str) -> Result<Option<Snapshot>> {
        let mut conn = self.conn().await?;
        let row = sqlx::query(&format!(
            "SELECT {SNAPSHOT_COLUMNS} FROM snapshots WHERE agent_id = $1 AND id = $2"
        ))
        .bind(agent_id)
        .bind(snapshot_id)
        .fetch_optional(&mut *conn)
        .await
        .map_err(map_sqlx)?;
        row.map(|r| row_to_snapshot(&r)).transpose().map_err(map_sqlx)
    }

    async fn list_snapshots(&self, agent_id: &str) -> Result<Vec<Snapshot>> {
        let mut conn = self.conn().await?;
        let rows = sqlx::query(&format!(
            "SELECT {SNAPSHOT_COLUMNS} FROM snapshots WHERE agent_id = $1 ORDER BY created_at ASC, id ASC"
        ))
        .bind(agent_id)
        .fetch_all(&mut *conn)
        .await
        .map_err(map_sqlx)?;
        map_rows(&rows, row_to_snapshot)
    }

    async fn delete_snapshot(&self, agent_id: &str, snapshot_id: &str) -> Result<()> {
        let mut conn = self.conn().await?;
        sqlx::query("DELETE FROM snapshots WHERE agent_id = $1 AND id = $2")
            .bind(agent_id)
            .bind(snapshot_id)
            .execute(&mut *conn)
            .await
            .map_err(map_sqlx)?;
        Ok(())
    }

    async fn append_event(&self, agent_id: &str, event: &NewEvent) -> Result<TimelineEvent> {
        let mut tx = self.begin().await?;
        // Separate key space from the agent lock, so appends made while the
        // agent lock is held do not wait on it.
        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(lock_key("strata:events:", agent_id))
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx)?;
        let exists = sqlx::query("SELECT 1 FROM agents WHERE agent_id = $1")
            .bind(agent_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(map_sqlx)?;
        if exists.is_none() {
            return Err(Error::NotFound(format!("agent {agent_id}")));
        }
        let seq: i64 = sqlx::query("SELECT COALESCE(MAX(seq), 0) + 1 FROM events WHERE agent_id = $1")
            .bind(agent_id)
            .fetch_one(&mut *tx)
            .await
            .map_err(map_sqlx)?
            .try_get(0)
            .map_err(map_sqlx)?;
        let appended = TimelineEvent {
            agent_id: agent_id.to_string(),
            seq,
            channel: event.channel,
            kind: event.kind.clone(),
            payload: event.payload.clone(),
            timestamp: chrono::Utc::now().to_rfc3339(),
        };
        sqlx::query(
            "INSERT INTO events (agent_id, seq, channel, kind, payload, timestamp) VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(&appended.agent_id)
        .bind(appended.seq)
        .bind(appended.channel.to_string())
        .bind(&appended.kind)
        .bind(Json(&appended.payload))
        .bind(&appended.timestamp)
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx)?;
        tx.commit().await.map_err(map_sqlx)?;
        Ok(appended)
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
        let mut conn = self.conn().await?;
        let rows = bind_params(sqlx::query(&sql), w.params())
            .fetch_all(&mut *conn)
            .await
            .map_err(map_sqlx)?;
        map_rows(&rows, row_to_event)
    }

    async fn save_todos(&self, agent_id: &str, todos: &TodoSnapshot) -> Result<()> {
        let body = serde_json::to_value(todos)?;
        self.write_document(agent_id, doc_kind::TODOS, doc_kind::TODOS_KEY, body, true)
            .await
    }

    async fn load_todos(&self, agent_id: &str) -> Result<Option<TodoSnapshot>> {
        self.load_document(agent_id, doc_kind::TODOS, doc_kind::TODOS_KEY)
            .await
    }

    async fn append_history_window(&self, agent_id: &str, window: &HistoryWindow) -> Result<()> {
        let body = serde_json::to_value(window)?;
        self.write_document(agent_id, doc_kind::HISTORY_WINDOW, &window.id, body, false)
            .await
    }

    async fn list_history_windows(&self, agent_id: &str) -> Result<Vec<HistoryWindow>> {
        self.load_documents(agent_id, doc_kind::HISTORY_WINDOW).await
    }

    async fn append_compression_record(&self, agent_id: &str, record: &CompressionRecord) -> Result<()> {
        let body = serde_json::to_value(record)?;
        self.write_document(agent_id, doc_kind::COMPRESSION, &record.id, body, false)
            .await
    }

    async fn list_compression_records(&self, agent_id: &str) -> Result<Vec<CompressionRecord>> {
        self.load_documents(agent_id, doc_kind::COMPRESSION).await
    }

    async fn save_media(&self, agent_id: &str, entry: &MediaCacheEntry) -> Result<()> {
        let body = serde_json::to_value(entry)?;
        self.write_document(agent_id, doc_kind::MEDIA, &entry.content_hash, body, true)
            .await
    }

    async fn load_media(&self, agent_id: &str, content_hash: &str) -> Result<Option<MediaCacheEntry>> {
        self.load_document(agent_id, doc_kind::MEDIA, content_hash).await
    }

    async fn exists(&self, agent_id: &str) -> Result<bool> {
        let mut conn = self.conn().await?;
        let row = sqlx::query("SELECT 1 FROM agents WHERE agent_id = $1")
            .bind(agent_id)
            .fetch_optional(&mut *conn)
            .await
            .map_err(map_sqlx)?;
        Ok(row.is_some())
    }

    async fn delete(&self, agent_id: &str) -> Result<()> {
        let mut conn = self.conn().await?;
        // Dependent rows go with the agent through ON DELETE CASCADE.
        sqlx::query("DELETE FROM agents WHERE agent_id = $1")
            .bind(agent_id)
            .execute(&mut *conn)
            .await
            .map_err(map_sqlx)?;
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
        let mut conn = self.conn().await?;
        let rows = bind_params(sqlx::query(&sql), w.params())
            .fetch_all(&mut *conn)
            .await
            .map_err(map_sqlx)?;
        map_rows(&rows, |row| row.try_get::<String, _>(0))
    }

    async fn acquire_agent_lock(&self, agent_id: &str, timeout: Duration) -> Result<AgentLockGuard> {
        let key = lock_key("strata:agent:", agent_id);
        let deadline = Instant::now() + timeout;
        loop {
            // The connection goes back to the pool between attempts, so
            // waiters never starve the holder of connections.
            let mut tx = self.begin().await?;
            let acquired: bool = sqlx::query("SELECT pg_try_advisory_xact_lock($1)")
                .bind(key)
                .fetch_one(&mut *tx)
                .await
                .map_err(map_sqlx)?
                .try_get(0)
                .map_err(map_sqlx)?;
            if acquired {
                return Ok(AgentLockGuard::new(agent_id, Box::new(AdvisoryLock { tx })));
            }
            tx.rollback().await.map_err(map_sqlx)?;

            let now = Instant::now();
            if now >= deadline {
                return Err(Error::LockTimeout {
                    agent_id: agent_id.to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                });
            }
            tokio::time::sleep(LOCK_POLL_INTERVAL.min(deadline - now)).await;
        }
    }

    async fn health_check(&self) -> HealthStatus {
        let started = Instant::now();
        let probe = async {
            let mut conn = self.conn().await?;
            sqlx::query("SELECT 1")
                .execute(&mut *conn)
                .await
                .map_err(map_sqlx)?;
            Ok::<(), Error>(())
        }
        .await;
        HealthStatus::from_probe(self.backend_name(), started, probe)
    }

    async fn storage_size(&self) -> Result<u64> {
        let mut conn = self.conn().await?;
        let bytes: i64 = sqlx::query(
            "SELECT COALESCE(SUM(pg_total_relation_size(to_regclass(t))), 0)::BIGINT FROM unnest($1::text[]) AS t",
        )
        .bind(&TABLE_NAMES[..])
        .fetch_one(&mut *conn)
        .await
        .map_err(map_sqlx)?
        .try_get(0)
        .map_err(map_sqlx)?;
        Ok(bytes.max(0) as u64)
    }
}

#[async_trait::async_trait]
impl QueryBackend for PgStorage {
    async fn query_agents(&self, filter: &AgentFilter, page: &Page, sort: &Sort) -> Result<Vec<AgentInfo>> {
        let w = filter::agent_filter_sql(filter);
        let sql = format!(
            "SELECT {AGENT_COLUMNS} FROM agents {} {} {}",
            w.clause(),
            filter::order_by(sort, "agent_id"),
            page.sql_clause()
        );
        let mut conn = self.conn().await?;
        let rows = bind_params(sqlx::query(&sql), w.params())
            .fetch_all(&mut *conn)
            .await
            .map_err(map_sqlx)?;
        map_rows(&rows, row_to_agent)
    }

    async fn query_messages(&self, filter: &MessageFilter, page: &Page) -> Result<Vec<StoredMessage>> {
        let w = filter::message_filter_sql(filter);
        let sql = format!(
            "SELECT agent_id, seq, role, content, metadata FROM messages {} ORDER BY agent_id ASC, seq ASC {}",
            w.clause(),
            page.sql_clause()
        );
        let mut conn = self.conn().await?;
        let rows = bind_params(sqlx::query(&sql), w.params())
            .fetch_all(&mut *conn)
            .await
            .map_err(map_sqlx)?;
        map_rows(&rows, |row| {
            Ok(StoredMessage {
                agent_id: row.try_get("agent_id")?,
                seq: row.try_get::<i64, _>("seq")? as u64,
                message: row_to_message(row)?,
            })
        })
    }

    async fn query_tool_calls(&self, filter: &ToolCallFilter, page: &Page, sort: &Sort) -> Result<Vec<StoredToolCall>> {
        let w = filter::tool_call_filter_sql(filter);
        let sql = format!(
            "SELECT {TOOL_CALL_COLUMNS} FROM tool_calls {} {} {}",
            w.clause(),
            filter::order_by(sort, "id"),
            page.sql_clause()
        );
        let mut conn = self.conn().await?;
        let rows = bind_params(sqlx::query(&sql), w.params())
            .fetch_all(&mut *conn)
            .await
            .map_err(map_sqlx)?;
        map_rows(&rows, |row| {
            Ok(StoredToolCall {
                agent_id: row.try_get("agent_id")?,
                record: row_to_tool_call(row)?,
            })
        })
    }

    async fn query_snapshots(&self, filter: &SnapshotFilter, page: &Page, sort: &Sort) -> Result<Vec<Snapshot>> {
        let w = filter::snapshot_filter_sql(filter);
        let sql = format!(
            "SELECT {SNAPSHOT_COLUMNS} FROM snapshots {} {} {}",
            w.clause(),
            filter::order_by(sort, "id"),
            page.sql_clause()
        );
        let mut conn = self.conn().await?;
        let rows = bind_params(sqlx::query(&sql), w.params())
            .fetch_all(&mut *conn)
            .await
            .map_err(map_sqlx)?;
        map_rows(&rows, row_to_snapshot)
    }

    async fn aggregate_stats(&self, agent_id: &str) -> Result<AgentStats> {
        let mut conn = self.conn().await?;
        let mut stats = AgentStats {
            agent_id: agent_id.to_string(),
            message_count: self.count_rows(&mut conn, "messages", agent_id).await?,
            tool_call_count: self.count_rows(&mut conn, "tool_calls", agent_id).await?,
            snapshot_count: self.count_rows(&mut conn, "snapshots", agent_id).await?,
            event_count: self.count_rows(&mut conn, "events", agent_id).await?,
            ..Default::default()
        };
        for (column, target) in [
            ("name", &mut stats.tool_calls_by_name),
            ("state", &mut stats.tool_calls_by_state),
        ] {
            let rows = sqlx::query(&format!(
                "SELECT {column}, COUNT(*) FROM tool_calls WHERE agent_id = $1 GROUP BY {column}"
            ))
            .bind(agent_id)
            .fetch_all(&mut *conn)
            .await
            .map_err(map_sqlx)?;
            for row in &rows {
                let key: String = row.try_get(0).map_err(map_sqlx)?;
                let count: i64 = row.try_get(1).map_err(map_sqlx)?;
                target.insert(key, count as u64);
            }
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_keys_are_stable_and_namespaced() {
        assert_eq!(lock_key("strata:agent:", "a1"), lock_key("strata:agent:", "a1"));
        assert_ne!(lock_key("strata:agent:", "a1"), lock_key("strata:agent:", "a2"));
        assert_ne!(lock_key("strata:agent:", "a1"), lock_key("strata:events:", "a1"));
    }

    #[test]
    fn test_pool_errors_are_connection_failures() {
        assert!(matches!(map_sqlx(sqlx::Error::PoolTimedOut), Error::ConnectionFailure(_)));
        assert!(matches!(map_sqlx(sqlx::Error::PoolClosed), Error::ConnectionFailure(_)));
        assert!(matches!(map_sqlx(sqlx::Error::RowNotFound), Error::Storage(_)));
    }

    #[tokio::test]
    async fn test_unopened_storage_is_not_initialized() {
        let storage = PgStorage::new("postgres://localhost/strata", PoolConfig::default());
        let err = storage.load_info("a1").await.unwrap_err();
        assert!(matches!(err, Error::NotInitialized(_)));
        assert!(!storage.health_check().await.healthy);
    }
}

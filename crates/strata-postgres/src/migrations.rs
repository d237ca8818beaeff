use strata_core::error::{Error, Result};

const TABLES: [(&str, &str); 6] = [
    (
        "agents",
        r#"
CREATE TABLE IF NOT EXISTS agents (
    agent_id TEXT PRIMARY KEY,
    template_id TEXT NOT NULL,
    created_at TEXT NOT NULL,
    config_version TEXT NOT NULL,
    lineage JSONB NOT NULL DEFAULT '[]'::jsonb,
    message_count BIGINT NOT NULL DEFAULT 0,
    last_sfp_index BIGINT NOT NULL DEFAULT -1,
    last_bookmark JSONB,
    breakpoint TEXT,
    metadata JSONB
)
"#,
    ),
    (
        "messages",
        r#"
CREATE TABLE IF NOT EXISTS messages (
    agent_id TEXT NOT NULL REFERENCES agents(agent_id) ON DELETE CASCADE,
    seq BIGINT NOT NULL,
    role TEXT NOT NULL,
    content JSONB NOT NULL,
    metadata JSONB,
    PRIMARY KEY (agent_id, seq)
)
"#,
    ),
    (
        "tool_calls",
        r#"
CREATE TABLE IF NOT EXISTS tool_calls (
    agent_id TEXT NOT NULL REFERENCES agents(agent_id) ON DELETE CASCADE,
    id TEXT NOT NULL,
    position BIGINT NOT NULL,
    name TEXT NOT NULL,
    input JSONB NOT NULL,
    state TEXT NOT NULL,
    approval JSONB NOT NULL,
    result JSONB,
    error TEXT,
    is_error BOOLEAN NOT NULL DEFAULT FALSE,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    started_at TEXT,
    completed_at TEXT,
    duration_ms BIGINT,
    audit_trail JSONB NOT NULL,
    PRIMARY KEY (agent_id, id)
)
"#,
    ),
    (
        "snapshots",
        r#"
CREATE TABLE IF NOT EXISTS snapshots (
    agent_id TEXT NOT NULL REFERENCES agents(agent_id) ON DELETE CASCADE,
    id TEXT NOT NULL,
    messages JSONB NOT NULL,
    message_count BIGINT NOT NULL,
    last_sfp_index BIGINT NOT NULL,
    last_bookmark JSONB,
    created_at TEXT NOT NULL,
    metadata JSONB,
    PRIMARY KEY (agent_id, id)
)
"#,
    ),
    (
        "events",
        r#"
CREATE TABLE IF NOT EXISTS events (
    agent_id TEXT NOT NULL REFERENCES agents(agent_id) ON DELETE CASCADE,
    seq BIGINT NOT NULL,
    channel TEXT NOT NULL,
    kind TEXT NOT NULL,
    payload JSONB NOT NULL,
    timestamp TEXT NOT NULL,
    PRIMARY KEY (agent_id, seq)
)
"#,
    ),
    (
        "agent_documents",
        r#"
CREATE TABLE IF NOT EXISTS agent_documents (
    id BIGSERIAL PRIMARY KEY,
    agent_id TEXT NOT NULL REFERENCES agents(agent_id) ON DELETE CASCADE,
    kind TEXT NOT NULL,
    doc_key TEXT NOT NULL,
    body JSONB NOT NULL,
    created_at TEXT NOT NULL
)
"#,
    ),
];

pub const TABLE_NAMES: [&str; 6] = [
    "agents",
    "messages",
    "tool_calls",
    "snapshots",
    "events",
    "agent_documents",
];

const INDEXES: [&str; 6] = [
    "CREATE INDEX IF NOT EXISTS idx_agents_created ON agents(created_at)",
    "CREATE INDEX IF NOT EXISTS idx_agents_template ON agents(template_id)",
    "CREATE INDEX IF NOT EXISTS idx_tool_calls_name ON tool_calls(name)",
    "CREATE INDEX IF NOT EXISTS idx_tool_calls_state ON tool_calls(state)",
    "CREATE INDEX IF NOT EXISTS idx_events_channel ON events(agent_id, channel, seq)",
    "CREATE INDEX IF NOT EXISTS idx_agent_documents_kind ON agent_documents(agent_id, kind, doc_key)",
];

/// Create every table and index if missing. Safe to run concurrently from
/// several processes starting against the same database.
pub async fn run_migrations(pool: &sqlx::PgPool) -> Result<()> {
    // Serializes concurrent cold starts; CREATE ... IF NOT EXISTS alone can
    // still race on the system catalogs.
    let mut tx = pool
        .begin()
        .await
        .map_err(|e| Error::ConnectionFailure(format!("begin migrations: {e}")))?;
    sqlx::query("SELECT pg_advisory_xact_lock(hashtext('strata:migrations'))")
        .execute(&mut *tx)
        .await
        .map_err(|e| Error::Storage(format!("migration lock: {e}")))?;

    for (table, ddl) in TABLES {
        sqlx::query(ddl)
            .execute(&mut *tx)
            .await
            .map_err(|e| Error::Storage(format!("create {table}: {e}")))?;
    }
    for stmt in INDEXES {
        sqlx::query(stmt)
            .execute(&mut *tx)
            .await
            .map_err(|e| Error::Storage(format!("create index: {e}")))?;
    }

    tx.commit()
        .await
        .map_err(|e| Error::Storage(format!("commit migrations: {e}")))?;
    tracing::debug!("postgres migrations applied");
    Ok(())
}

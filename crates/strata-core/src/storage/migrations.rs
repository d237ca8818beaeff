// DuckDB has no ON DELETE CASCADE and re-checks unique indexes eagerly when a
// row is deleted and reinserted in one transaction, so dependent tables carry
// plain indexes only and cascade is an explicit ordered delete.

pub const CREATE_AGENTS_TABLE: &str = "
CREATE TABLE IF NOT EXISTS agents (
    agent_id VARCHAR PRIMARY KEY,
    template_id VARCHAR NOT NULL,
    created_at VARCHAR NOT NULL,
    config_version VARCHAR NOT NULL,
    lineage JSON NOT NULL,
    message_count BIGINT NOT NULL DEFAULT 0,
    last_sfp_index BIGINT NOT NULL DEFAULT -1,
    last_bookmark JSON,
    breakpoint VARCHAR,
    metadata JSON
);
";

pub const CREATE_MESSAGES_TABLE: &str = "
CREATE TABLE IF NOT EXISTS messages (
    agent_id VARCHAR NOT NULL,
    seq BIGINT NOT NULL,
    role VARCHAR NOT NULL,
    content JSON NOT NULL,
    metadata JSON
);
CREATE INDEX IF NOT EXISTS idx_messages_agent ON messages(agent_id, seq);
";

pub const CREATE_TOOL_CALLS_TABLE: &str = "
CREATE TABLE IF NOT EXISTS tool_calls (
    agent_id VARCHAR NOT NULL,
    id VARCHAR NOT NULL,
    position BIGINT NOT NULL,
    name VARCHAR NOT NULL,
    input JSON NOT NULL,
    state VARCHAR NOT NULL,
    approval JSON NOT NULL,
    result JSON,
    error VARCHAR,
    is_error BOOLEAN NOT NULL DEFAULT false,
    created_at VARCHAR NOT NULL,
    updated_at VARCHAR NOT NULL,
    started_at VARCHAR,
    completed_at VARCHAR,
    duration_ms BIGINT,
    audit_trail JSON NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_tool_calls_agent ON tool_calls(agent_id);
CREATE INDEX IF NOT EXISTS idx_tool_calls_name ON tool_calls(name);
CREATE INDEX IF NOT EXISTS idx_tool_calls_state ON tool_calls(state);
";

pub const CREATE_SNAPSHOTS_TABLE: &str = "
CREATE TABLE IF NOT EXISTS snapshots (
    agent_id VARCHAR NOT NULL,
    id VARCHAR NOT NULL,
    messages JSON NOT NULL,
    message_count BIGINT NOT NULL,
    last_sfp_index BIGINT NOT NULL,
    last_bookmark JSON,
    created_at VARCHAR NOT NULL,
    metadata JSON
);
CREATE INDEX IF NOT EXISTS idx_snapshots_agent ON snapshots(agent_id);
";

pub const CREATE_EVENTS_TABLE: &str = "
CREATE TABLE IF NOT EXISTS events (
    agent_id VARCHAR NOT NULL,
    seq BIGINT NOT NULL,
    channel VARCHAR NOT NULL,
    kind VARCHAR NOT NULL,
    payload JSON NOT NULL,
    timestamp VARCHAR NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_events_agent_seq ON events(agent_id, seq);
";

pub const CREATE_AGENT_DOCUMENTS_TABLE: &str = "
CREATE TABLE IF NOT EXISTS agent_documents (
    agent_id VARCHAR NOT NULL,
    kind VARCHAR NOT NULL,
    doc_key VARCHAR NOT NULL,
    seq BIGINT NOT NULL,
    body JSON NOT NULL,
    created_at VARCHAR NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_agent_documents_kind ON agent_documents(agent_id, kind);
";

pub fn run_migrations(conn: &duckdb::Connection) -> duckdb::Result<()> {
    conn.execute_batch(CREATE_AGENTS_TABLE)?;
    conn.execute_batch(CREATE_MESSAGES_TABLE)?;
    conn.execute_batch(CREATE_TOOL_CALLS_TABLE)?;
    conn.execute_batch(CREATE_SNAPSHOTS_TABLE)?;
    conn.execute_batch(CREATE_EVENTS_TABLE)?;
    conn.execute_batch(CREATE_AGENT_DOCUMENTS_TABLE)?;
    Ok(())
}

//! Store contract: every backend must behave identically to callers.
//!
//! Each check is a plain async fn over `Arc<dyn StorageBackend>` and runs
//! against the embedded DuckDB store, the file store, and the hybrid
//! composite of the two.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tempfile::TempDir;

use strata_core::error::Error;
use strata_core::model::agent::{AgentInfo, BreakpointState};
use strata_core::model::context::{CompressionRecord, HistoryWindow, MediaCacheEntry, TodoItem, TodoSnapshot, TodoStatus};
use strata_core::model::event::{Channel, EventQuery, NewEvent};
use strata_core::model::message::{ContentBlock, Message, Role};
use strata_core::model::snapshot::Snapshot;
use strata_core::model::tool_call::{ToolCallRecord, ToolCallState};
use strata_core::storage::StorageBackend;
use strata_core::storage::duckdb::DuckDbStorage;
use strata_core::storage::file::FileStore;
use strata_core::storage::hybrid::HybridStore;

async fn duckdb_store() -> (Option<TempDir>, Arc<dyn StorageBackend>) {
    let store = Arc::new(DuckDbStorage::open_in_memory().unwrap());
    store.init().await.unwrap();
    (None, store)
}

async fn file_store() -> (Option<TempDir>, Arc<dyn StorageBackend>) {
    let tmp = TempDir::new().unwrap();
    let store = Arc::new(FileStore::new(tmp.path().join("agents")));
    store.init().await.unwrap();
    (Some(tmp), store)
}

async fn hybrid_store() -> (Option<TempDir>, Arc<dyn StorageBackend>) {
    let tmp = TempDir::new().unwrap();
    let structured = Arc::new(DuckDbStorage::open_in_memory().unwrap());
    let store = Arc::new(HybridStore::new(structured, tmp.path().join("timeline")));
    store.init().await.unwrap();
    (Some(tmp), store)
}

macro_rules! contract_tests {
    ($($name:ident),* $(,)?) => {
        mod duckdb {
            $(
                #[tokio::test]
                async fn $name() {
                    let (_tmp, store) = super::duckdb_store().await;
                    super::$name(store).await;
                }
            )*
        }
        mod file {
            $(
                #[tokio::test]
                async fn $name() {
                    let (_tmp, store) = super::file_store().await;
                    super::$name(store).await;
                }
            )*
        }
        mod hybrid {
            $(
                #[tokio::test]
                async fn $name() {
                    let (_tmp, store) = super::hybrid_store().await;
                    super::$name(store).await;
                }
            )*
        }
    };
}

contract_tests!(
    info_round_trip,
    messages_replace_as_unit,
    dependent_write_requires_agent,
    tool_call_audit_survives_reload,
    snapshot_upsert_is_idempotent,
    events_are_sequenced_and_resumable,
    delete_cascades,
    delete_is_idempotent,
    list_by_literal_prefix,
    context_records_round_trip,
    lock_excludes_second_caller,
    closed_store_rejects_writes,
);

fn rich_info(agent_id: &str) -> AgentInfo {
    let mut info = AgentInfo::new(agent_id, "planner");
    info.lineage = vec!["root".into(), "mid".into()];
    info.metadata = json!({
        "zeta": 1,
        "alpha": {"nested": [1, 2.5, null, true, "x"]},
        "tags": ["a", "b"],
    });
    info.breakpoint = Some(BreakpointState::Paused);
    info
}

async fn info_round_trip(store: Arc<dyn StorageBackend>) {
    let info = rich_info("a1");
    store.save_info(&info).await.unwrap();
    assert_eq!(store.load_info("a1").await.unwrap(), Some(info.clone()));

    // Saving the same info twice leaves one agent with identical state.
    store.save_info(&info).await.unwrap();
    assert_eq!(store.load_info("a1").await.unwrap(), Some(info));
    assert_eq!(store.list(None).await.unwrap(), vec!["a1".to_string()]);
    assert!(store.load_info("missing").await.unwrap().is_none());
}

async fn messages_replace_as_unit(store: Arc<dyn StorageBackend>) {
    store.create_info(&AgentInfo::new("a1", "tpl")).await.unwrap();
    let messages = vec![
        Message::user("first"),
        Message::new(
            Role::Assistant,
            vec![
                ContentBlock::Text { text: "running".into() },
                ContentBlock::ToolUse {
                    id: "c1".into(),
                    name: "bash".into(),
                    input: json!({"cmd": "ls", "env": {"B": "2", "A": "1"}}),
                },
            ],
        ),
        Message::user("third").with_metadata(json!({"source": "cli"})),
    ];
    store.save_messages("a1", &messages).await.unwrap();
    assert_eq!(store.load_messages("a1").await.unwrap(), messages);
    assert_eq!(store.load_info("a1").await.unwrap().unwrap().message_count, 3);

    store.save_messages("a1", &messages[..1]).await.unwrap();
    assert_eq!(store.load_messages("a1").await.unwrap(), messages[..1].to_vec());
    assert_eq!(store.load_info("a1").await.unwrap().unwrap().message_count, 1);
}

async fn dependent_write_requires_agent(store: Arc<dyn StorageBackend>) {
    let err = store
        .save_messages("ghost", &[Message::user("hi")])
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));
    assert!(!store.exists("ghost").await.unwrap());
    assert!(store.load_info("ghost").await.unwrap().is_none());

    store.create_info(&AgentInfo::new("a1", "tpl")).await.unwrap();
    let err = store.create_info(&AgentInfo::new("a1", "tpl")).await.unwrap_err();
    assert!(matches!(err, Error::ConstraintViolation(_)));
}

async fn tool_call_audit_survives_reload(store: Arc<dyn StorageBackend>) {
    store.create_info(&AgentInfo::new("a1", "tpl")).await.unwrap();
    let mut record = ToolCallRecord::new("c1", "bash", json!({"cmd": "make"}));
    store.save_tool_call_records("a1", &[record.clone()]).await.unwrap();

    record.transition(ToolCallState::Running, None).unwrap();
    record.transition(ToolCallState::Completed, None).unwrap();
    record.result = Some(json!({"exit": 0}));
    store.save_tool_call_records("a1", &[record.clone()]).await.unwrap();

    let loaded = store.load_tool_call_records("a1").await.unwrap();
    assert_eq!(loaded, vec![record]);
    assert_eq!(loaded[0].audit_trail.len(), 3);
    assert_eq!(loaded[0].audit_trail.last().unwrap().state, ToolCallState::Completed);
}

async fn snapshot_upsert_is_idempotent(store: Arc<dyn StorageBackend>) {
    store.create_info(&AgentInfo::new("a1", "tpl")).await.unwrap();
    let snapshot = Snapshot {
        id: "snap:1".into(),
        agent_id: "a1".into(),
        messages: vec![Message::user("hi"), Message::assistant("hello")],
        last_sfp_index: 1,
        last_bookmark: None,
        created_at: "2025-01-01T00:00:00+00:00".into(),
        metadata: Some(json!({"label": "start"})),
    };
    store.save_snapshot(&snapshot).await.unwrap();
    store.save_snapshot(&snapshot).await.unwrap();
    assert_eq!(store.list_snapshots("a1").await.unwrap(), vec![snapshot.clone()]);
    assert_eq!(
        store.load_snapshot("a1", "snap:1").await.unwrap(),
        Some(snapshot)
    );

    store.delete_snapshot("a1", "snap:1").await.unwrap();
    assert!(store.load_snapshot("a1", "snap:1").await.unwrap().is_none());
}

async fn events_are_sequenced_and_resumable(store: Arc<dyn StorageBackend>) {
    store.create_info(&AgentInfo::new("a1", "tpl")).await.unwrap();
    let mut seqs = Vec::new();
    for (channel, kind) in [
        (Channel::Progress, "text_delta"),
        (Channel::Control, "approval_required"),
        (Channel::Progress, "text_delta"),
        (Channel::Monitor, "token_usage"),
    ] {
        let event = store
            .append_event("a1", &NewEvent::new(channel, kind, json!({"k": kind})))
            .await
            .unwrap();
        seqs.push(event.seq);
    }
    assert_eq!(seqs, vec![1, 2, 3, 4]);

    let all = store.read_events("a1", &EventQuery::default()).await.unwrap();
    let first_two = &all[..2];
    let rest = store
        .read_events(
            "a1",
            &EventQuery {
                since: Some(first_two[1].bookmark()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(rest.iter().map(|e| e.seq).collect::<Vec<_>>(), vec![3, 4]);

    let progress = store
        .read_events(
            "a1",
            &EventQuery {
                channels: Some(vec![Channel::Progress]),
                limit: 1,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(progress.len(), 1);
    assert_eq!(progress[0].seq, 1);
}

async fn delete_cascades(store: Arc<dyn StorageBackend>) {
    store.create_info(&AgentInfo::new("a1", "tpl")).await.unwrap();
    store.create_info(&AgentInfo::new("a2", "tpl")).await.unwrap();
    for agent in ["a1", "a2"] {
        store.save_messages(agent, &[Message::user("hi")]).await.unwrap();
        store
            .save_tool_call_records(agent, &[ToolCallRecord::new("c1", "bash", json!({}))])
            .await
            .unwrap();
        store
            .append_event(agent, &NewEvent::new(Channel::Control, "paused", json!({})))
            .await
            .unwrap();
    }

    store.delete("a1").await.unwrap();
    assert!(!store.exists("a1").await.unwrap());
    assert!(store.load_info("a1").await.unwrap().is_none());
    assert!(store.load_messages("a1").await.unwrap().is_empty());
    assert!(store.load_tool_call_records("a1").await.unwrap().is_empty());
    assert!(store.list_snapshots("a1").await.unwrap().is_empty());
    assert!(store.read_events("a1", &EventQuery::default()).await.unwrap().is_empty());

    // The neighbour is untouched.
    assert_eq!(store.load_messages("a2").await.unwrap().len(), 1);
    assert_eq!(store.load_tool_call_records("a2").await.unwrap().len(), 1);

    // A re-created agent starts a fresh timeline.
    store.create_info(&AgentInfo::new("a1", "tpl")).await.unwrap();
    let event = store
        .append_event("a1", &NewEvent::new(Channel::Monitor, "tick", json!({})))
        .await
        .unwrap();
    assert_eq!(event.seq, 1);
}

async fn delete_is_idempotent(store: Arc<dyn StorageBackend>) {
    store.delete("never-existed").await.unwrap();
    store.delete("never-existed").await.unwrap();
    assert!(!store.exists("never-existed").await.unwrap());
}

async fn list_by_literal_prefix(store: Arc<dyn StorageBackend>) {
    for (id, created_at) in [
        ("team_a-1", "2025-01-01T00:00:00+00:00"),
        ("team_a-2", "2025-01-02T00:00:00+00:00"),
        ("teamXa-3", "2025-01-03T00:00:00+00:00"),
        ("other", "2025-01-04T00:00:00+00:00"),
    ] {
        let mut info = AgentInfo::new(id, "tpl");
        info.created_at = created_at.into();
        store.create_info(&info).await.unwrap();
    }
    // `_` is literal, not a wildcard; newest first.
    assert_eq!(
        store.list(Some("team_a")).await.unwrap(),
        vec!["team_a-2".to_string(), "team_a-1".to_string()]
    );
    assert_eq!(store.list(None).await.unwrap().len(), 4);
}

async fn context_records_round_trip(store: Arc<dyn StorageBackend>) {
    store.create_info(&AgentInfo::new("a1", "tpl")).await.unwrap();

    let todos = TodoSnapshot {
        todos: vec![TodoItem {
            id: "t1".into(),
            title: "write tests".into(),
            status: TodoStatus::InProgress,
            note: None,
        }],
        version: 2,
        updated_at: "2025-01-01T00:00:00+00:00".into(),
    };
    store.save_todos("a1", &todos).await.unwrap();
    assert_eq!(store.load_todos("a1").await.unwrap(), Some(todos));

    let window = HistoryWindow {
        id: "w1".into(),
        messages: vec![Message::user("old")],
        created_at: "2025-01-01T00:00:00+00:00".into(),
        metadata: json!({}),
    };
    store.append_history_window("a1", &window).await.unwrap();
    assert_eq!(store.list_history_windows("a1").await.unwrap(), vec![window]);

    let record = CompressionRecord {
        id: "r1".into(),
        window_id: "w1".into(),
        summary: "greeting".into(),
        original_message_count: 1,
        compressed_at: "2025-01-01T00:00:00+00:00".into(),
        metadata: json!({"model": "summarizer"}),
    };
    store.append_compression_record("a1", &record).await.unwrap();
    assert_eq!(store.list_compression_records("a1").await.unwrap(), vec![record]);

    let media = MediaCacheEntry::for_content(b"png bytes", "image/png");
    store.save_media("a1", &media).await.unwrap();
    store.save_media("a1", &media).await.unwrap();
    assert_eq!(
        store.load_media("a1", &media.content_hash).await.unwrap(),
        Some(media.clone())
    );

    store.delete("a1").await.unwrap();
    assert!(store.load_todos("a1").await.unwrap().is_none());
    assert!(store.load_media("a1", &media.content_hash).await.unwrap().is_none());
}

async fn lock_excludes_second_caller(store: Arc<dyn StorageBackend>) {
    let held = store
        .acquire_agent_lock("a1", Duration::from_millis(100))
        .await
        .unwrap();
    let err = store
        .acquire_agent_lock("a1", Duration::from_millis(50))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::LockTimeout { .. }));

    // Other agents are independent.
    let other = store
        .acquire_agent_lock("a2", Duration::from_millis(50))
        .await
        .unwrap();
    other.release().await.unwrap();

    held.release().await.unwrap();
    store
        .acquire_agent_lock("a1", Duration::from_millis(50))
        .await
        .unwrap()
        .release()
        .await
        .unwrap();
}

async fn closed_store_rejects_writes(store: Arc<dyn StorageBackend>) {
    store.close().await.unwrap();
    let err = store.save_info(&AgentInfo::new("a1", "tpl")).await.unwrap_err();
    assert!(matches!(err, Error::NotInitialized(_)));
}

//! Runs only when `STRATA_TEST_POSTGRES_URL` points at a disposable database.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use strata_core::config::PoolConfig;
use strata_core::error::Error;
use strata_core::model::agent::AgentInfo;
use strata_core::model::event::{Channel, EventQuery, NewEvent};
use strata_core::model::message::Message;
use strata_core::model::tool_call::ToolCallRecord;
use strata_core::query::fork::ForkRequest;
use strata_core::query::snapshot::SnapshotRequest;
use strata_core::storage::{AgentFilter, Page, QueryBackend, Sort, StorageBackend};
use strata_core::StrataEngine;
use strata_postgres::PgStorage;

async fn storage() -> Option<Arc<PgStorage>> {
    let url = std::env::var("STRATA_TEST_POSTGRES_URL").ok()?;
    let storage = PgStorage::connect(&url, &PoolConfig::default()).await.unwrap();
    Some(Arc::new(storage))
}

fn unique(prefix: &str) -> String {
    format!("{prefix}-{}", uuid::Uuid::now_v7())
}

#[tokio::test]
async fn test_pg_round_trip_and_cascade() {
    let Some(store) = storage().await else { return };
    let id = unique("pg-rt");
    store.create_info(&AgentInfo::new(&id, "tpl")).await.unwrap();
    let err = store.create_info(&AgentInfo::new(&id, "tpl")).await.unwrap_err();
    assert!(matches!(err, Error::ConstraintViolation(_)));

    store
        .save_messages(&id, &[Message::user("hi"), Message::assistant("hello")])
        .await
        .unwrap();
    store
        .save_tool_call_records(&id, &[ToolCallRecord::new("c1", "bash", json!({"cmd": "ls"}))])
        .await
        .unwrap();
    let info = store.load_info(&id).await.unwrap().unwrap();
    assert_eq!(info.message_count, 2);
    assert_eq!(store.load_tool_call_records(&id).await.unwrap()[0].id, "c1");

    let first = store
        .append_event(&id, &NewEvent::new(Channel::Control, "started", json!({})))
        .await
        .unwrap();
    let second = store
        .append_event(&id, &NewEvent::new(Channel::Progress, "delta", json!({"t": "x"})))
        .await
        .unwrap();
    assert_eq!((first.seq, second.seq), (1, 2));
    let tail = store
        .read_events(
            &id,
            &EventQuery {
                since: Some(first.bookmark()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(tail, vec![second]);

    store.delete(&id).await.unwrap();
    assert!(!store.exists(&id).await.unwrap());
    assert!(store.load_messages(&id).await.unwrap().is_empty());
    assert!(matches!(
        store.save_messages(&id, &[]).await.unwrap_err(),
        Error::NotFound(_)
    ));
}

#[tokio::test]
async fn test_pg_advisory_lock_excludes_and_times_out() {
    let Some(store) = storage().await else { return };
    let id = unique("pg-lock");
    let guard = store
        .acquire_agent_lock(&id, Duration::from_millis(200))
        .await
        .unwrap();
    let err = store
        .acquire_agent_lock(&id, Duration::from_millis(120))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::LockTimeout { .. }));
    guard.release().await.unwrap();
    let again = store
        .acquire_agent_lock(&id, Duration::from_millis(200))
        .await
        .unwrap();
    again.release().await.unwrap();
}

#[tokio::test]
async fn test_pg_concurrent_appends_get_distinct_seqs() {
    let Some(store) = storage().await else { return };
    let id = unique("pg-seq");
    store.create_info(&AgentInfo::new(&id, "tpl")).await.unwrap();
    let appends = (0..8).map(|i| {
        let store = store.clone();
        let id = id.clone();
        tokio::spawn(async move {
            store
                .append_event(&id, &NewEvent::new(Channel::Progress, "delta", json!({"i": i})))
                .await
                .map(|e| e.seq)
        })
    });
    let mut seqs = Vec::new();
    for handle in appends {
        seqs.push(handle.await.unwrap().unwrap());
    }
    seqs.sort();
    assert_eq!(seqs, (1..=8).collect::<Vec<i64>>());
    store.delete(&id).await.unwrap();
}

#[tokio::test]
async fn test_pg_engine_fork_and_query() {
    let Some(store) = storage().await else { return };
    let engine = StrataEngine::with_query_backend(store.clone());
    let parent = unique("pg-parent");
    engine.create_agent(AgentInfo::new(&parent, "tpl-pg")).await.unwrap();
    engine
        .save_messages(&parent, &[Message::user("q"), Message::assistant("a")])
        .await
        .unwrap();
    let snap = engine.snapshot(SnapshotRequest::new(&parent)).await.unwrap().snapshot;
    let child = format!("{parent}-child");
    let fork = engine
        .fork(ForkRequest::new(&parent, &snap.id).with_new_agent_id(&child))
        .await
        .unwrap();
    assert_eq!(fork.lineage, vec![parent.clone()]);

    let found = store
        .query_agents(
            &AgentFilter {
                agent_id_prefix: Some(parent.clone()),
                ..Default::default()
            },
            &Page::default(),
            &Sort::default(),
        )
        .await
        .unwrap();
    assert_eq!(found.len(), 2);
    let stats = engine.stats(&child).await.unwrap();
    assert_eq!(stats.message_count, 2);

    engine.delete_agent(&child).await.unwrap();
    engine.delete_agent(&parent).await.unwrap();
}

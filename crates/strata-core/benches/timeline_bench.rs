use criterion::{criterion_group, criterion_main, Criterion};
use std::sync::Arc;

use serde_json::json;
use strata_core::model::agent::AgentInfo;
use strata_core::model::event::{Channel, EventQuery, NewEvent};
use strata_core::storage::StorageBackend;
use strata_core::storage::duckdb::DuckDbStorage;
use strata_core::storage::file::FileStore;

fn seeded<S: StorageBackend>(rt: &tokio::runtime::Runtime, store: S, events: usize) -> Arc<S> {
    let store = Arc::new(store);
    rt.block_on(async {
        store.init().await.unwrap();
        store.create_info(&AgentInfo::new("bench-agent", "bench")).await.unwrap();
        for i in 0..events {
            store
                .append_event(
                    "bench-agent",
                    &NewEvent::new(Channel::Progress, "text_delta", json!({"i": i})),
                )
                .await
                .unwrap();
        }
    });
    store
}

fn append_throughput(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let duckdb = seeded(&rt, DuckDbStorage::open_in_memory().unwrap(), 0);
    let tmp = tempfile::TempDir::new().unwrap();
    let files = seeded(&rt, FileStore::new(tmp.path()), 0);
    let event = NewEvent::new(Channel::Progress, "text_delta", json!({"text": "token"}));

    c.bench_function("append_event_duckdb", |b| {
        b.iter(|| {
            rt.block_on(async {
                duckdb.append_event("bench-agent", &event).await.unwrap();
            });
        });
    });

    c.bench_function("append_event_file", |b| {
        b.iter(|| {
            rt.block_on(async {
                files.append_event("bench-agent", &event).await.unwrap();
            });
        });
    });
}

fn read_since_bookmark(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let duckdb = seeded(&rt, DuckDbStorage::open_in_memory().unwrap(), 2_000);
    let query = rt.block_on(async {
        let events = duckdb
            .read_events("bench-agent", &EventQuery { limit: 1_500, ..Default::default() })
            .await
            .unwrap();
        EventQuery {
            since: events.last().map(|e| e.bookmark()),
            ..Default::default()
        }
    });

    c.bench_function("read_events_tail_duckdb", |b| {
        b.iter(|| {
            rt.block_on(async {
                duckdb.read_events("bench-agent", &query).await.unwrap();
            });
        });
    });
}

criterion_group!(benches, append_throughput, read_since_bookmark);
criterion_main!(benches);

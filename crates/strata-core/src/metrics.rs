//! Health probe and per-operation counters.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::error::Result;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HealthStatus {
    pub healthy: bool,
    pub latency_ms: u64,
    pub backend: String,
    pub checked_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl HealthStatus {
    pub fn from_probe(backend: &str, started: Instant, probe: Result<()>) -> Self {
        let latency_ms = started.elapsed().as_millis() as u64;
        let checked_at = chrono::Utc::now().to_rfc3339();
        match probe {
            Ok(()) => Self {
                healthy: true,
                latency_ms,
                backend: backend.to_string(),
                checked_at,
                detail: None,
            },
            Err(e) => Self {
                healthy: false,
                latency_ms,
                backend: backend.to_string(),
                checked_at,
                detail: Some(e.to_string()),
            },
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct OperationStats {
    pub count: u64,
    pub errors: u64,
    pub total_ms: u64,
    pub max_ms: u64,
}

impl OperationStats {
    pub fn avg_ms(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.total_ms as f64 / self.count as f64
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetricsSnapshot {
    pub operations: BTreeMap<String, OperationStats>,
    pub storage_bytes: u64,
    pub collected_at: String,
}

#[derive(Default)]
pub struct OperationMetrics {
    ops: Mutex<HashMap<&'static str, OperationStats>>,
}

impl OperationMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, operation: &'static str, elapsed: Duration, ok: bool) {
        let ms = elapsed.as_millis() as u64;
        let mut ops = self.ops.lock().unwrap_or_else(|e| e.into_inner());
        let stats = ops.entry(operation).or_default();
        stats.count += 1;
        if !ok {
            stats.errors += 1;
        }
        stats.total_ms += ms;
        stats.max_ms = stats.max_ms.max(ms);
    }

    /// Run `fut`, recording its latency and outcome under `operation`.
    pub async fn observe<T, F>(&self, operation: &'static str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let started = Instant::now();
        let result = fut.await;
        self.record(operation, started.elapsed(), result.is_ok());
        result
    }

    pub fn snapshot(&self, storage_bytes: u64) -> MetricsSnapshot {
        let ops = self.ops.lock().unwrap_or_else(|e| e.into_inner());
        MetricsSnapshot {
            operations: ops
                .iter()
                .map(|(name, stats)| (name.to_string(), stats.clone()))
                .collect(),
            storage_bytes,
            collected_at: chrono::Utc::now().to_rfc3339(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    #[tokio::test]
    async fn test_observe_counts_errors() {
        let metrics = OperationMetrics::new();
        metrics.observe("load_info", async { Ok(()) }).await.unwrap();
        let _ = metrics
            .observe::<(), _>("load_info", async { Err(Error::NotFound("a".into())) })
            .await;
        let snap = metrics.snapshot(1024);
        let stats = &snap.operations["load_info"];
        assert_eq!(stats.count, 2);
        assert_eq!(stats.errors, 1);
        assert_eq!(snap.storage_bytes, 1024);
    }

    #[test]
    fn test_health_from_failed_probe() {
        let status = HealthStatus::from_probe(
            "duckdb",
            Instant::now(),
            Err(Error::NotInitialized("closed".into())),
        );
        assert!(!status.healthy);
        assert!(status.detail.unwrap().contains("closed"));
    }
}

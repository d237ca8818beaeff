//! Per-agent mutual exclusion.
//!
//! [`AgentLockGuard`] is the release handle every backend hands out. The
//! in-process [`LockTable`] serves single-process media (files, embedded
//! DuckDB) and only excludes callers inside the same process; server-backed
//! stores supply their own [`LockRelease`] built on advisory locks.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use crate::error::{Error, Result};

#[async_trait::async_trait]
pub trait LockRelease: Send {
    async fn release(self: Box<Self>) -> Result<()>;
}

/// Held lock on one agent. Dropping the guard also releases the lock.
pub struct AgentLockGuard {
    agent_id: String,
    acquired_at: Instant,
    inner: Option<Box<dyn LockRelease>>,
}

impl AgentLockGuard {
    pub fn new(agent_id: impl Into<String>, inner: Box<dyn LockRelease>) -> Self {
        Self {
            agent_id: agent_id.into(),
            acquired_at: Instant::now(),
            inner: Some(inner),
        }
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    pub fn held_for(&self) -> Duration {
        self.acquired_at.elapsed()
    }

    pub async fn release(mut self) -> Result<()> {
        match self.inner.take() {
            Some(inner) => {
                tracing::debug!(agent_id = %self.agent_id, held_ms = self.held_for().as_millis() as u64, "releasing agent lock");
                inner.release().await
            }
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for AgentLockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentLockGuard")
            .field("agent_id", &self.agent_id)
            .field("held", &self.inner.is_some())
            .finish()
    }
}

struct ProcessLock {
    _guard: tokio::sync::OwnedMutexGuard<()>,
}

#[async_trait::async_trait]
impl LockRelease for ProcessLock {
    async fn release(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

#[derive(Default)]
pub struct LockTable {
    locks: Mutex<HashMap<String, Weak<tokio::sync::Mutex<()>>>>,
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, agent_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());

        if locks.len() > 128 {
            locks.retain(|_, weak| weak.strong_count() > 0);
        }

        if let Some(existing) = locks.get(agent_id).and_then(Weak::upgrade) {
            return existing;
        }

        let lock = Arc::new(tokio::sync::Mutex::new(()));
        locks.insert(agent_id.to_string(), Arc::downgrade(&lock));
        lock
    }

    /// Wait up to `timeout` for exclusive access to `agent_id`.
    pub async fn acquire(&self, agent_id: &str, timeout: Duration) -> Result<AgentLockGuard> {
        let lock = self.entry(agent_id);
        match tokio::time::timeout(timeout, lock.lock_owned()).await {
            Ok(guard) => Ok(AgentLockGuard::new(
                agent_id,
                Box::new(ProcessLock { _guard: guard }),
            )),
            Err(_) => Err(Error::LockTimeout {
                agent_id: agent_id.to_string(),
                timeout_ms: timeout.as_millis() as u64,
            }),
        }
    }

    /// Number of agents currently tracked (held or recently held).
    pub fn len(&self) -> usize {
        self.locks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .filter(|w| w.strong_count() > 0)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_second_acquire_times_out_while_held() {
        let table = LockTable::new();
        let guard = table.acquire("a1", Duration::from_millis(50)).await.unwrap();
        let err = table
            .acquire("a1", Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::LockTimeout { .. }));
        guard.release().await.unwrap();
        let again = table.acquire("a1", Duration::from_millis(20)).await.unwrap();
        assert_eq!(again.agent_id(), "a1");
    }

    #[tokio::test]
    async fn test_distinct_agents_do_not_contend() {
        let table = LockTable::new();
        let _a = table.acquire("a1", Duration::from_millis(20)).await.unwrap();
        let _b = table.acquire("a2", Duration::from_millis(20)).await.unwrap();
        assert_eq!(table.len(), 2);
    }

    #[tokio::test]
    async fn test_drop_releases() {
        let table = LockTable::new();
        {
            let _guard = table.acquire("a1", Duration::from_millis(20)).await.unwrap();
        }
        assert!(table.acquire("a1", Duration::from_millis(20)).await.is_ok());
        drop(table);
    }

    #[tokio::test]
    async fn test_waiter_proceeds_after_release() {
        let table = Arc::new(LockTable::new());
        let guard = table.acquire("a1", Duration::from_secs(1)).await.unwrap();
        let waiter = {
            let table = table.clone();
            tokio::spawn(async move { table.acquire("a1", Duration::from_secs(5)).await.map(|_| ()) })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        guard.release().await.unwrap();
        waiter.await.unwrap().unwrap();
    }
}

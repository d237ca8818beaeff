//! Multi-channel timeline: durable append through the store, live fan-out
//! per channel, and bookmark-resumable reads.
//!
//! Live subscribers get events over a `tokio::sync::broadcast` channel and
//! may lag; the store is the source of truth and a lagging subscriber catches
//! up by opening an [`EventStream`] from the last bookmark it processed.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use futures::Stream;
use tokio::sync::broadcast;

use crate::error::{Error, Result};
use crate::model::event::{Bookmark, Channel, EventQuery, NewEvent, TimelineEvent};
use crate::storage::StorageBackend;

fn channel_capacity(channel: Channel) -> usize {
    match channel {
        Channel::Progress => 1024,
        Channel::Control => 256,
        Channel::Monitor => 128,
    }
}

pub struct TimelineRouter {
    storage: Arc<dyn StorageBackend>,
    senders: HashMap<Channel, broadcast::Sender<TimelineEvent>>,
    page_size: usize,
    lock_timeout: Duration,
}

impl TimelineRouter {
    pub fn new(storage: Arc<dyn StorageBackend>, page_size: usize, lock_timeout: Duration) -> Self {
        let senders = Channel::ALL
            .into_iter()
            .map(|ch| (ch, broadcast::channel(channel_capacity(ch)).0))
            .collect();
        Self {
            storage,
            senders,
            page_size: page_size.max(1),
            lock_timeout,
        }
    }

    /// Persist an event and announce it to live subscribers of its channel.
    pub async fn emit(
        &self,
        agent_id: &str,
        channel: Channel,
        kind: &str,
        payload: serde_json::Value,
    ) -> Result<TimelineEvent> {
        let event = self
            .storage
            .append_event(agent_id, &NewEvent::new(channel, kind, payload))
            .await?;
        if let Some(sender) = self.senders.get(&channel) {
            // No receivers is not an error.
            let _ = sender.send(event.clone());
        }
        tracing::trace!(agent_id, seq = event.seq, %channel, kind, "event emitted");
        Ok(event)
    }

    pub async fn progress(&self, agent_id: &str, kind: &str, payload: serde_json::Value) -> Result<TimelineEvent> {
        self.emit(agent_id, Channel::Progress, kind, payload).await
    }

    pub async fn control(&self, agent_id: &str, kind: &str, payload: serde_json::Value) -> Result<TimelineEvent> {
        self.emit(agent_id, Channel::Control, kind, payload).await
    }

    pub async fn monitor(&self, agent_id: &str, kind: &str, payload: serde_json::Value) -> Result<TimelineEvent> {
        self.emit(agent_id, Channel::Monitor, kind, payload).await
    }

    /// Live events of one channel, for every agent.
    pub fn subscribe(&self, channel: Channel) -> broadcast::Receiver<TimelineEvent> {
        match self.senders.get(&channel) {
            Some(sender) => sender.subscribe(),
            None => broadcast::channel(1).1,
        }
    }

    /// Stored events after `since`, restricted to `channels` (all if `None`).
    pub fn stream(
        &self,
        agent_id: &str,
        since: Option<Bookmark>,
        channels: Option<Vec<Channel>>,
    ) -> EventStream {
        EventStream::new(self.storage.clone(), agent_id, since, channels, self.page_size)
    }

    /// Record `bookmark` as consumed on the agent. Bookmarks only move forward.
    pub async fn commit_bookmark(&self, agent_id: &str, bookmark: Bookmark) -> Result<()> {
        let guard = self
            .storage
            .acquire_agent_lock(agent_id, self.lock_timeout)
            .await?;
        let result = async {
            let mut info = self
                .storage
                .load_info(agent_id)
                .await?
                .ok_or_else(|| Error::NotFound(format!("agent {agent_id}")))?;
            if info
                .last_bookmark
                .as_ref()
                .is_some_and(|current| current.seq >= bookmark.seq)
            {
                return Ok(());
            }
            info.last_bookmark = Some(bookmark);
            self.storage.save_info(&info).await
        }
        .await;
        if let Err(e) = guard.release().await {
            tracing::warn!(agent_id, error = %e, "failed to release agent lock");
        }
        result
    }
}

/// Finite, restartable read over an agent's stored timeline.
///
/// Pages through [`StorageBackend::read_events`] with a moving bookmark and
/// holds no backend state between pages, so dropping it mid-way is free and a
/// new stream opened from [`EventStream::bookmark`] continues where this one
/// stopped. It ends once the store has nothing newer at the time of the read.
pub struct EventStream {
    storage: Arc<dyn StorageBackend>,
    agent_id: String,
    channels: Option<Vec<Channel>>,
    page_size: usize,
    fetched: Option<Bookmark>,
    delivered: Option<Bookmark>,
    buffer: VecDeque<TimelineEvent>,
    exhausted: bool,
}

impl EventStream {
    pub fn new(
        storage: Arc<dyn StorageBackend>,
        agent_id: &str,
        since: Option<Bookmark>,
        channels: Option<Vec<Channel>>,
        page_size: usize,
    ) -> Self {
        Self {
            storage,
            agent_id: agent_id.to_string(),
            channels,
            page_size: page_size.max(1),
            fetched: since.clone(),
            delivered: since,
            buffer: VecDeque::new(),
            exhausted: false,
        }
    }

    /// Position of the last event handed out, or the starting bookmark.
    pub fn bookmark(&self) -> Option<&Bookmark> {
        self.delivered.as_ref()
    }

    pub async fn next(&mut self) -> Result<Option<TimelineEvent>> {
        if self.buffer.is_empty() && !self.exhausted {
            let query = EventQuery {
                since: self.fetched.clone(),
                channels: self.channels.clone(),
                limit: self.page_size,
            };
            let page = self.storage.read_events(&self.agent_id, &query).await?;
            if page.len() < self.page_size {
                self.exhausted = true;
            }
            if let Some(last) = page.last() {
                self.fetched = Some(last.bookmark());
            }
            self.buffer.extend(page);
        }
        let next = self.buffer.pop_front();
        if let Some(event) = &next {
            self.delivered = Some(event.bookmark());
        }
        Ok(next)
    }

    pub async fn collect_all(mut self) -> Result<Vec<TimelineEvent>> {
        let mut events = Vec::new();
        while let Some(event) = self.next().await? {
            events.push(event);
        }
        Ok(events)
    }

    pub fn into_stream(self) -> impl Stream<Item = Result<TimelineEvent>> + Send {
        futures::stream::try_unfold(self, |mut stream| async move {
            Ok(stream.next().await?.map(|event| (event, stream)))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::agent::AgentInfo;
    use crate::storage::duckdb::DuckDbStorage;
    use futures::TryStreamExt;
    use serde_json::json;

    async fn router() -> TimelineRouter {
        let storage = Arc::new(DuckDbStorage::open_in_memory().unwrap());
        storage.create_info(&AgentInfo::new("a1", "tpl")).await.unwrap();
        TimelineRouter::new(storage, 2, Duration::from_secs(1))
    }

    #[tokio::test]
    async fn test_stream_pages_and_resumes() {
        let router = router().await;
        for i in 0..5 {
            router.progress("a1", "text_delta", json!({"i": i})).await.unwrap();
        }
        let mut stream = router.stream("a1", None, None);
        let first = stream.next().await.unwrap().unwrap();
        let second = stream.next().await.unwrap().unwrap();
        assert_eq!((first.seq, second.seq), (1, 2));

        let resumed = router
            .stream("a1", stream.bookmark().cloned(), None)
            .collect_all()
            .await
            .unwrap();
        assert_eq!(resumed.iter().map(|e| e.seq).collect::<Vec<_>>(), vec![3, 4, 5]);
    }

    #[tokio::test]
    async fn test_stream_filters_channels() {
        let router = router().await;
        router.progress("a1", "text_delta", json!({})).await.unwrap();
        router.control("a1", "paused", json!({})).await.unwrap();
        router.monitor("a1", "tick", json!({})).await.unwrap();
        router.control("a1", "resumed", json!({})).await.unwrap();
        let control: Vec<_> = router
            .stream("a1", None, Some(vec![Channel::Control]))
            .into_stream()
            .try_collect()
            .await
            .unwrap();
        assert_eq!(
            control.iter().map(|e| e.kind.as_str()).collect::<Vec<_>>(),
            vec!["paused", "resumed"]
        );
    }

    #[tokio::test]
    async fn test_live_subscriber_receives_channel_events() {
        let router = router().await;
        let mut control = router.subscribe(Channel::Control);
        router.progress("a1", "text_delta", json!({})).await.unwrap();
        let emitted = router.control("a1", "approval_required", json!({"call_id": "c1"})).await.unwrap();
        let received = control.recv().await.unwrap();
        assert_eq!(received, emitted);
    }

    #[tokio::test]
    async fn test_commit_bookmark_only_moves_forward() {
        let router = router().await;
        let e1 = router.monitor("a1", "tick", json!({})).await.unwrap();
        let e2 = router.monitor("a1", "tick", json!({})).await.unwrap();
        router.commit_bookmark("a1", e2.bookmark()).await.unwrap();
        router.commit_bookmark("a1", e1.bookmark()).await.unwrap();
        let info = router.storage.load_info("a1").await.unwrap().unwrap();
        assert_eq!(info.last_bookmark, Some(e2.bookmark()));
    }
}

//! Flat-file adapter.
//!
//! Layout under `root`, one directory per agent:
//!
//! ```text
//! <agent_id>/info.json
//! <agent_id>/messages.json
//! <agent_id>/tool_calls.json
//! <agent_id>/snapshots/<hex(snapshot_id)>.json
//! <agent_id>/events.jsonl
//! <agent_id>/todos.json
//! <agent_id>/history_windows.jsonl
//! <agent_id>/compression.jsonl
//! <agent_id>/media/<content_hash>.json
//! ```
//!
//! Whole-document files are replaced with a tmp-file + rename, so readers see
//! either the old or the new content. Line files are append-only; a torn
//! final line left by a crash is ignored on read and cut off before the next
//! append. `message_count` is derived from `messages.json` on every load, which
//! keeps it consistent with the message list without a second write. Deleting
//! an agent renames its directory out of the way before removing it.
//!
//! Every write into an agent's directory holds that agent's writer lock, and
//! dependent writes re-check `info.json` under it. A write queued behind a
//! delete therefore fails with `NotFound` instead of recreating the directory.
//! Timeline reads seek to the byte offset of the first unread event, learned
//! from earlier reads.
//!
//! Locks are in-process only.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::{AsyncBufReadExt, AsyncSeekExt, AsyncWriteExt};

use crate::error::{Error, Result};
use crate::lock::{AgentLockGuard, LockTable};
use crate::metrics::HealthStatus;
use crate::model::agent::AgentInfo;
use crate::model::context::{CompressionRecord, HistoryWindow, MediaCacheEntry, TodoSnapshot};
use crate::model::event::{EventQuery, NewEvent, TimelineEvent};
use crate::model::message::Message;
use crate::model::snapshot::Snapshot;
use crate::model::tool_call::ToolCallRecord;
use crate::storage::filter;
use crate::storage::{
    AgentFilter, AgentStats, MessageFilter, Page, QueryBackend, SnapshotFilter, Sort,
    StorageBackend, StoredMessage, StoredToolCall, ToolCallFilter,
};

const INFO_FILE: &str = "info.json";
const MESSAGES_FILE: &str = "messages.json";
const TOOL_CALLS_FILE: &str = "tool_calls.json";
const EVENTS_FILE: &str = "events.jsonl";
const TODOS_FILE: &str = "todos.json";
const HISTORY_FILE: &str = "history_windows.jsonl";
const COMPRESSION_FILE: &str = "compression.jsonl";
const SNAPSHOT_DIR: &str = "snapshots";
const MEDIA_DIR: &str = "media";

/// Upper bound on waiting for another in-process writer of the same agent.
const WRITE_LOCK_TIMEOUT: Duration = Duration::from_secs(30);

pub struct FileStore {
    root: PathBuf,
    ready: AtomicBool,
    /// When false the agent's existence is vouched for by a composite store
    /// and `info.json` is never consulted for dependent writes.
    checks_agents: bool,
    /// Serializes read-modify-write cycles on one agent's files.
    writers: LockTable,
    /// Handed out through `acquire_agent_lock`.
    locks: LockTable,
    last_event_seq: Mutex<HashMap<String, i64>>,
    /// Byte offset of each complete timeline line; index `i` holds seq `i + 1`.
    event_offsets: Mutex<HashMap<String, Vec<u64>>>,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ready: AtomicBool::new(false),
            checks_agents: true,
            writers: LockTable::new(),
            locks: LockTable::new(),
            last_event_seq: Mutex::new(HashMap::new()),
            event_offsets: Mutex::new(HashMap::new()),
        }
    }

    /// A store holding only high-frequency records for agents whose
    /// structured state lives elsewhere.
    pub fn auxiliary(root: impl Into<PathBuf>) -> Self {
        Self {
            checks_agents: false,
            ..Self::new(root)
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn ensure_ready(&self) -> Result<()> {
        if self.ready.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(Error::NotInitialized(format!(
                "file store at {} is not initialized",
                self.root.display()
            )))
        }
    }

    /// Reject ids that are unsafe as a single path component.
    fn validate_id(kind: &str, id: &str) -> Result<()> {
        if id.is_empty() {
            return Err(Error::Validation(format!("{kind} id cannot be empty")));
        }
        if id.starts_with('.')
            || id.contains('/')
            || id.contains('\\')
            || id.contains("..")
            || id.contains('\0')
        {
            return Err(Error::Validation(format!(
                "{kind} id contains invalid characters: {id:?}"
            )));
        }
        if id.chars().any(|c| c.is_control()) {
            return Err(Error::Validation(format!(
                "{kind} id contains control characters: {id:?}"
            )));
        }
        Ok(())
    }

    fn agent_dir(&self, agent_id: &str) -> Result<PathBuf> {
        Self::validate_id("agent", agent_id)?;
        Ok(self.root.join(agent_id))
    }

    fn snapshot_path(&self, agent_id: &str, snapshot_id: &str) -> Result<PathBuf> {
        if snapshot_id.is_empty() {
            return Err(Error::Validation("snapshot id cannot be empty".to_string()));
        }
        Ok(self
            .agent_dir(agent_id)?
            .join(SNAPSHOT_DIR)
            .join(format!("{}.json", hex::encode(snapshot_id))))
    }

    fn media_path(&self, agent_id: &str, content_hash: &str) -> Result<PathBuf> {
        Self::validate_id("media", content_hash)?;
        Ok(self
            .agent_dir(agent_id)?
            .join(MEDIA_DIR)
            .join(format!("{content_hash}.json")))
    }

    async fn has_info(&self, agent_id: &str) -> Result<bool> {
        Ok(tokio::fs::try_exists(self.agent_dir(agent_id)?.join(INFO_FILE)).await?)
    }

    /// Take the agent's writer lock for a dependent write and return its
    /// directory. Unknown agents fail with `NotFound` unless existence is
    /// checked by the caller. The check runs under the lock, after any
    /// queued delete has finished.
    async fn lock_dependent(&self, agent_id: &str) -> Result<(PathBuf, AgentLockGuard)> {
        self.ensure_ready()?;
        let dir = self.agent_dir(agent_id)?;
        let guard = self.write_lock(agent_id).await?;
        if self.checks_agents {
            if !self.has_info(agent_id).await? {
                return Err(Error::NotFound(format!("agent {agent_id}")));
            }
        } else {
            tokio::fs::create_dir_all(&dir).await?;
        }
        Ok((dir, guard))
    }

    async fn write_lock(&self, agent_id: &str) -> Result<AgentLockGuard> {
        self.writers.acquire(agent_id, WRITE_LOCK_TIMEOUT).await
    }

    async fn load_info_in(&self, dir: &Path) -> Result<Option<AgentInfo>> {
        let Some(mut info) = read_json::<AgentInfo>(&dir.join(INFO_FILE)).await? else {
            return Ok(None);
        };
        info.message_count = count_messages(dir).await?;
        Ok(Some(info))
    }

    async fn load_all_infos(&self) -> Result<Vec<AgentInfo>> {
        self.ensure_ready()?;
        let mut infos = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(infos),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if name.starts_with('.') || !entry.file_type().await?.is_dir() {
                continue;
            }
            if let Some(info) = self.load_info_in(&entry.path()).await? {
                infos.push(info);
            }
        }
        Ok(infos)
    }

    async fn read_events_in(&self, dir: &Path) -> Result<Vec<TimelineEvent>> {
        read_jsonl(&dir.join(EVENTS_FILE)).await
    }

    fn cached_seq(&self, agent_id: &str) -> Option<i64> {
        self.last_event_seq
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(agent_id)
            .copied()
    }

    fn remember_seq(&self, agent_id: &str, seq: i64) {
        self.last_event_seq
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(agent_id.to_string(), seq);
    }

    fn forget_timeline(&self, agent_id: &str) {
        self.last_event_seq
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(agent_id);
        self.forget_offsets(agent_id);
    }

    fn forget_offsets(&self, agent_id: &str) {
        self.event_offsets
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(agent_id);
    }

    /// Where to start reading for events after `after`, and the seq of the
    /// line found there minus one.
    fn seek_point(&self, agent_id: &str, after: i64) -> (u64, i64) {
        let offsets = self.event_offsets.lock().unwrap_or_else(|e| e.into_inner());
        let Some(known) = offsets.get(agent_id) else {
            return (0, 0);
        };
        let after = usize::try_from(after).unwrap_or(0);
        match known.get(after) {
            Some(offset) => (*offset, after as i64),
            None => match known.last() {
                Some(offset) => (*offset, known.len() as i64 - 1),
                None => (0, 0),
            },
        }
    }

    fn learn_offsets(&self, agent_id: &str, learned: Vec<(i64, u64)>) {
        if learned.is_empty() {
            return;
        }
        let mut offsets = self.event_offsets.lock().unwrap_or_else(|e| e.into_inner());
        let known = offsets.entry(agent_id.to_string()).or_default();
        for (seq, offset) in learned {
            if seq == known.len() as i64 + 1 {
                known.push(offset);
            }
        }
    }

    /// Read events matching `query`, starting from the closest known line
    /// offset and stopping once `limit` events are collected.
    async fn scan_events(&self, agent_id: &str, dir: &Path, query: &EventQuery) -> Result<Vec<TimelineEvent>> {
        let mut events = Vec::new();
        if query.limit == 0 {
            return Ok(events);
        }
        let file = match tokio::fs::File::open(dir.join(EVENTS_FILE)).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(events),
            Err(e) => return Err(e.into()),
        };
        let len = file.metadata().await?.len();
        let (mut offset, mut expected) = self.seek_point(agent_id, query.since_seq());
        // Offsets learned before a delete may point into a different file.
        let mut verify = offset > 0;
        if verify && offset >= len {
            self.forget_offsets(agent_id);
            (offset, expected, verify) = (0, 0, false);
        }
        let mut reader = tokio::io::BufReader::new(file);
        reader.seek(std::io::SeekFrom::Start(offset)).await?;

        let mut learned = Vec::new();
        let mut line = String::new();
        while events.len() < query.limit {
            line.clear();
            let read = reader.read_line(&mut line).await?;
            if read == 0 || !line.ends_with('\n') {
                break;
            }
            let start = offset;
            offset += read as u64;
            if line.trim().is_empty() {
                continue;
            }
            let parsed = serde_json::from_str::<TimelineEvent>(&line);
            if verify {
                verify = false;
                if !matches!(&parsed, Ok(event) if event.seq == expected + 1) {
                    self.forget_offsets(agent_id);
                    reader.seek(std::io::SeekFrom::Start(0)).await?;
                    (offset, expected) = (0, 0);
                    continue;
                }
            }
            let event = parsed?;
            if event.seq == expected + 1 {
                learned.push((event.seq, start));
                expected = event.seq;
            }
            if query.matches(&event) {
                events.push(event);
            }
        }
        self.learn_offsets(agent_id, learned);
        Ok(events)
    }
}

async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    match tokio::fs::read_to_string(path).await {
        Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Create a subdirectory of an existing agent directory.
async fn ensure_subdir(path: &Path) -> Result<()> {
    match tokio::fs::create_dir(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Replace `path` atomically with the JSON encoding of `value`. The parent
/// directory must already exist.
async fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let content = serde_json::to_vec_pretty(value)?;
    let dir = path
        .parent()
        .ok_or_else(|| Error::Internal(format!("no parent directory for {}", path.display())))?;
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("doc");
    let tmp_path = dir.join(format!(".{file_name}.{}.tmp", uuid::Uuid::now_v7().simple()));

    let write_result = async {
        let mut file = tokio::fs::File::create(&tmp_path).await?;
        file.write_all(&content).await?;
        file.flush().await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&tmp_path, path).await
    }
    .await;

    if let Err(e) = write_result {
        let _ = tokio::fs::remove_file(&tmp_path).await;
        return Err(e.into());
    }
    Ok(())
}

/// Complete lines only; a trailing fragment without a newline is a torn write.
fn complete_lines(content: &str) -> impl Iterator<Item = &str> {
    let complete = match content.rfind('\n') {
        Some(idx) => &content[..=idx],
        None => "",
    };
    complete.lines().filter(|line| !line.trim().is_empty())
}

async fn read_jsonl<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    let content = match tokio::fs::read_to_string(path).await {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    complete_lines(&content)
        .map(|line| serde_json::from_str(line).map_err(Error::from))
        .collect()
}

/// Cut a torn final line so the next append starts on a fresh line.
async fn repair_tail(path: &Path) -> Result<()> {
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    if bytes.last().is_none_or(|b| *b == b'\n') {
        return Ok(());
    }
    let keep = bytes.iter().rposition(|b| *b == b'\n').map_or(0, |i| i + 1);
    tracing::warn!(path = %path.display(), dropped = bytes.len() - keep, "truncating torn line");
    let file = tokio::fs::OpenOptions::new().write(true).open(path).await?;
    file.set_len(keep as u64).await?;
    file.sync_all().await?;
    Ok(())
}

async fn append_jsonl<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut line = serde_json::to_vec(value)?;
    line.push(b'\n');
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    file.write_all(&line).await?;
    file.flush().await?;
    file.sync_data().await?;
    Ok(())
}

async fn count_messages(dir: &Path) -> Result<u64> {
    match tokio::fs::read_to_string(dir.join(MESSAGES_FILE)).await {
        Ok(content) => {
            let items: Vec<serde::de::IgnoredAny> = serde_json::from_str(&content)?;
            Ok(items.len() as u64)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
        Err(e) => Err(e.into()),
    }
}

async fn dir_size(root: &Path) -> Result<u64> {
    let mut total = 0;
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let meta = entry.metadata().await?;
            if meta.is_dir() {
                pending.push(entry.path());
            } else {
                total += meta.len();
            }
        }
    }
    Ok(total)
}

#[async_trait::async_trait]
impl StorageBackend for FileStore {
    fn backend_name(&self) -> &'static str {
        "file"
    }

    async fn init(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.root).await?;
        self.ready.store(true, Ordering::Release);
        tracing::debug!(root = %self.root.display(), "file store initialized");
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.ready.store(false, Ordering::Release);
        self.last_event_seq
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        self.event_offsets
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        Ok(())
    }

    async fn create_info(&self, info: &AgentInfo) -> Result<()> {
        self.ensure_ready()?;
        let dir = self.agent_dir(&info.agent_id)?;
        let _w = self.write_lock(&info.agent_id).await?;
        match tokio::fs::create_dir(&dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                if self.has_info(&info.agent_id).await? {
                    return Err(Error::ConstraintViolation(format!(
                        "agent {} already exists",
                        info.agent_id
                    )));
                }
                // Leftovers without info.json belong to no agent.
                tracing::warn!(agent_id = %info.agent_id, "clearing orphaned agent directory");
                self.forget_timeline(&info.agent_id);
                tokio::fs::remove_dir_all(&dir).await?;
                tokio::fs::create_dir(&dir).await?;
            }
            Err(e) => return Err(e.into()),
        }
        let mut stored = info.clone();
        stored.message_count = 0;
        write_json(&dir.join(INFO_FILE), &stored).await
    }

    async fn save_info(&self, info: &AgentInfo) -> Result<()> {
        self.ensure_ready()?;
        let dir = self.agent_dir(&info.agent_id)?;
        let _w = self.write_lock(&info.agent_id).await?;
        tokio::fs::create_dir_all(&dir).await?;
        let mut stored = info.clone();
        stored.message_count = count_messages(&dir).await?;
        write_json(&dir.join(INFO_FILE), &stored).await
    }

    async fn load_info(&self, agent_id: &str) -> Result<Option<AgentInfo>> {
        self.ensure_ready()?;
        let dir = self.agent_dir(agent_id)?;
        self.load_info_in(&dir).await
    }

    async fn save_messages(&self, agent_id: &str, messages: &[Message]) -> Result<()> {
        let (dir, _w) = self.lock_dependent(agent_id).await?;
        write_json(&dir.join(MESSAGES_FILE), messages).await
    }

    async fn load_messages(&self, agent_id: &str) -> Result<Vec<Message>> {
        self.ensure_ready()?;
        let dir = self.agent_dir(agent_id)?;
        Ok(read_json(&dir.join(MESSAGES_FILE)).await?.unwrap_or_default())
    }

    async fn save_tool_call_records(&self, agent_id: &str, records: &[ToolCallRecord]) -> Result<()> {
        let (dir, _w) = self.lock_dependent(agent_id).await?;
        write_json(&dir.join(TOOL_CALLS_FILE), records).await
    }

    async fn load_tool_call_records(&self, agent_id: &str) -> Result<Vec<ToolCallRecord>> {
        self.ensure_ready()?;
        let dir = self.agent_dir(agent_id)?;
        Ok(read_json(&dir.join(TOOL_CALLS_FILE)).await?.unwrap_or_default())
    }

    async fn save_snapshot(&self, snapshot: &Snapshot) -> Result<()> {
        let path = self.snapshot_path(&snapshot.agent_id, &snapshot.id)?;
        let (dir, _w) = self.lock_dependent(&snapshot.agent_id).await?;
        ensure_subdir(&dir.join(SNAPSHOT_DIR)).await?;
        write_json(&path, snapshot).await
    }

    async fn load_snapshot(&self, agent_id: &str, snapshot_id: &str) -> Result<Option<Snapshot>> {
        self.ensure_ready()?;
        read_json(&self.snapshot_path(agent_id, snapshot_id)?).await
    }

    async fn list_snapshots(&self, agent_id: &str) -> Result<Vec<Snapshot>> {
        self.ensure_ready()?;
        let dir = self.agent_dir(agent_id)?.join(SNAPSHOT_DIR);
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut snapshots = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let is_json = path.extension().is_some_and(|ext| ext == "json");
            let is_tmp = entry.file_name().to_str().is_none_or(|n| n.starts_with('.'));
            if is_json && !is_tmp {
                if let Some(snapshot) = read_json::<Snapshot>(&path).await? {
                    snapshots.push(snapshot);
                }
            }
        }
        snapshots.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(snapshots)
    }

    async fn delete_snapshot(&self, agent_id: &str, snapshot_id: &str) -> Result<()> {
        self.ensure_ready()?;
        match tokio::fs::remove_file(self.snapshot_path(agent_id, snapshot_id)?).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn append_event(&self, agent_id: &str, event: &NewEvent) -> Result<TimelineEvent> {
        let (dir, _w) = self.lock_dependent(agent_id).await?;
        let path = dir.join(EVENTS_FILE);
        let last = match self.cached_seq(agent_id) {
            Some(seq) => seq,
            None => {
                repair_tail(&path).await?;
                self.read_events_in(&dir)
                    .await?
                    .last()
                    .map_or(0, |e| e.seq)
            }
        };
        let appended = TimelineEvent {
            agent_id: agent_id.to_string(),
            seq: last + 1,
            channel: event.channel,
            kind: event.kind.clone(),
            payload: event.payload.clone(),
            timestamp: chrono::Utc::now().to_rfc3339(),
        };
        if let Err(e) = append_jsonl(&path, &appended).await {
            // The file may now end in a partial line; rescan on next append.
            self.forget_timeline(agent_id);
            return Err(e);
        }
        self.remember_seq(agent_id, appended.seq);
        Ok(appended)
    }

    async fn read_events(&self, agent_id: &str, query: &EventQuery) -> Result<Vec<TimelineEvent>> {
        self.ensure_ready()?;
        let dir = self.agent_dir(agent_id)?;
        self.scan_events(agent_id, &dir, query).await
    }

    async fn save_todos(&self, agent_id: &str, todos: &TodoSnapshot) -> Result<()> {
        let (dir, _w) = self.lock_dependent(agent_id).await?;
        write_json(&dir.join(TODOS_FILE), todos).await
    }

    async fn load_todos(&self, agent_id: &str) -> Result<Option<TodoSnapshot>> {
        self.ensure_ready()?;
        read_json(&self.agent_dir(agent_id)?.join(TODOS_FILE)).await
    }

    async fn append_history_window(&self, agent_id: &str, window: &HistoryWindow) -> Result<()> {
        let (dir, _w) = self.lock_dependent(agent_id).await?;
        let path = dir.join(HISTORY_FILE);
        repair_tail(&path).await?;
        append_jsonl(&path, window).await
    }

    async fn list_history_windows(&self, agent_id: &str) -> Result<Vec<HistoryWindow>> {
        self.ensure_ready()?;
        read_jsonl(&self.agent_dir(agent_id)?.join(HISTORY_FILE)).await
    }

    async fn append_compression_record(&self, agent_id: &str, record: &CompressionRecord) -> Result<()> {
        let (dir, _w) = self.lock_dependent(agent_id).await?;
        let path = dir.join(COMPRESSION_FILE);
        repair_tail(&path).await?;
        append_jsonl(&path, record).await
    }

    async fn list_compression_records(&self, agent_id: &str) -> Result<Vec<CompressionRecord>> {
        self.ensure_ready()?;
        read_jsonl(&self.agent_dir(agent_id)?.join(COMPRESSION_FILE)).await
    }

    async fn save_media(&self, agent_id: &str, entry: &MediaCacheEntry) -> Result<()> {
        let path = self.media_path(agent_id, &entry.content_hash)?;
        let (dir, _w) = self.lock_dependent(agent_id).await?;
        ensure_subdir(&dir.join(MEDIA_DIR)).await?;
        write_json(&path, entry).await
    }

    async fn load_media(&self, agent_id: &str, content_hash: &str) -> Result<Option<MediaCacheEntry>> {
        self.ensure_ready()?;
        read_json(&self.media_path(agent_id, content_hash)?).await
    }

    async fn exists(&self, agent_id: &str) -> Result<bool> {
        self.ensure_ready()?;
        self.has_info(agent_id).await
    }

    async fn delete(&self, agent_id: &str) -> Result<()> {
        self.ensure_ready()?;
        let dir = self.agent_dir(agent_id)?;
        let _w = self.write_lock(agent_id).await?;
        let tombstone = self.root.join(format!(
            ".{agent_id}.{}.deleted",
            uuid::Uuid::now_v7().simple()
        ));
        match tokio::fs::rename(&dir, &tombstone).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        }
        self.forget_timeline(agent_id);
        if let Err(e) = tokio::fs::remove_dir_all(&tombstone).await {
            tracing::warn!(agent_id, path = %tombstone.display(), error = %e, "failed to remove deleted agent directory");
        }
        tracing::debug!(agent_id, "agent deleted");
        Ok(())
    }

    async fn list(&self, prefix: Option<&str>) -> Result<Vec<String>> {
        let mut infos = self.load_all_infos().await?;
        if let Some(prefix) = prefix {
            infos.retain(|info| info.agent_id.starts_with(prefix));
        }
        filter::sort_in_memory(&mut infos, &Sort::default(), |i| i.created_at.as_str(), |i| i.agent_id.as_str());
        Ok(infos.into_iter().map(|info| info.agent_id).collect())
    }

    async fn acquire_agent_lock(&self, agent_id: &str, timeout: Duration) -> Result<AgentLockGuard> {
        self.locks.acquire(agent_id, timeout).await
    }

    async fn health_check(&self) -> HealthStatus {
        let started = Instant::now();
        let probe = match self.ensure_ready() {
            Ok(()) => tokio::fs::metadata(&self.root)
                .await
                .map_err(Error::from)
                .and_then(|meta| {
                    if meta.is_dir() {
                        Ok(())
                    } else {
                        Err(Error::Storage(format!(
                            "{} is not a directory",
                            self.root.display()
                        )))
                    }
                }),
            Err(e) => Err(e),
        };
        HealthStatus::from_probe(self.backend_name(), started, probe)
    }

    async fn storage_size(&self) -> Result<u64> {
        self.ensure_ready()?;
        dir_size(&self.root).await
    }
}

#[async_trait::async_trait]
impl QueryBackend for FileStore {
    async fn query_agents(&self, filter: &AgentFilter, page: &Page, sort: &Sort) -> Result<Vec<AgentInfo>> {
        let mut infos = self.load_all_infos().await?;
        infos.retain(|info| filter::agent_matches(filter, info));
        filter::sort_in_memory(&mut infos, sort, |i| i.created_at.as_str(), |i| i.agent_id.as_str());
        Ok(filter::paginate(infos, page))
    }

    async fn query_messages(&self, filter: &MessageFilter, page: &Page) -> Result<Vec<StoredMessage>> {
        let mut agent_ids = match &filter.agent_id {
            Some(agent_id) => vec![agent_id.clone()],
            None => self
                .load_all_infos()
                .await?
                .into_iter()
                .map(|info| info.agent_id)
                .collect(),
        };
        agent_ids.sort();
        let mut matched = Vec::new();
        for agent_id in agent_ids {
            for (seq, message) in self.load_messages(&agent_id).await?.into_iter().enumerate() {
                if filter::message_matches(filter, &agent_id, seq as u64, &message) {
                    matched.push(StoredMessage {
                        agent_id: agent_id.clone(),
                        seq: seq as u64,
                        message,
                    });
                }
            }
        }
        Ok(filter::paginate(matched, page))
    }

    async fn query_tool_calls(&self, filter: &ToolCallFilter, page: &Page, sort: &Sort) -> Result<Vec<StoredToolCall>> {
        let agent_ids = match &filter.agent_id {
            Some(agent_id) => vec![agent_id.clone()],
            None => self
                .load_all_infos()
                .await?
                .into_iter()
                .map(|info| info.agent_id)
                .collect(),
        };
        let mut matched = Vec::new();
        for agent_id in agent_ids {
            for record in self.load_tool_call_records(&agent_id).await? {
                if filter::tool_call_matches(filter, &agent_id, &record) {
                    matched.push(StoredToolCall {
                        agent_id: agent_id.clone(),
                        record,
                    });
                }
            }
        }
        filter::sort_in_memory(&mut matched, sort, |c| c.record.created_at.as_str(), |c| c.record.id.as_str());
        Ok(filter::paginate(matched, page))
    }

    async fn query_snapshots(&self, filter: &SnapshotFilter, page: &Page, sort: &Sort) -> Result<Vec<Snapshot>> {
        let agent_ids = match &filter.agent_id {
            Some(agent_id) => vec![agent_id.clone()],
            None => self
                .load_all_infos()
                .await?
                .into_iter()
                .map(|info| info.agent_id)
                .collect(),
        };
        let mut matched = Vec::new();
        for agent_id in agent_ids {
            matched.extend(
                self.list_snapshots(&agent_id)
                    .await?
                    .into_iter()
                    .filter(|s| filter::snapshot_matches(filter, s)),
            );
        }
        filter::sort_in_memory(&mut matched, sort, |s| s.created_at.as_str(), |s| s.id.as_str());
        Ok(filter::paginate(matched, page))
    }

    async fn aggregate_stats(&self, agent_id: &str) -> Result<AgentStats> {
        self.ensure_ready()?;
        let dir = self.agent_dir(agent_id)?;
        let records = self.load_tool_call_records(agent_id).await?;
        Ok(filter::stats_from_records(
            agent_id,
            count_messages(&dir).await?,
            &records,
            self.list_snapshots(agent_id).await?.len() as u64,
            self.read_events_in(&dir).await?.len() as u64,
        ))
    }
}

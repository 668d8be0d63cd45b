//! `DownloadTask` lifecycle and the task registry (component 4.D).

pub mod retry;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU16, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::cache::SegmentKey;
use crate::key::{self, Fingerprint};

/// Terminal and in-flight states a [`DownloadTask`] passes through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[repr(u8)]
pub enum TaskStatus {
    Queued = 0,
    Downloading = 1,
    Paused = 2,
    Completed = 3,
    Finished = 4,
    Cancelled = 5,
    Failed = 6,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Finished | Self::Cancelled | Self::Failed)
    }

    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Queued,
            1 => Self::Downloading,
            2 => Self::Paused,
            3 => Self::Completed,
            4 => Self::Finished,
            5 => Self::Cancelled,
            _ => Self::Failed,
        }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ProgressEvent {
    pub task_id: u64,
    pub downloaded_bytes: u64,
    pub total_bytes: u64,
    pub status: TaskStatus,
}

/// Priority hint used by the pool's dispatch loop: `Foreground` tasks
/// match the fingerprint currently serving the active client request and
/// jump the queue (spec 4.C "priority boost for foreground playback").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    Foreground,
    Background,
}

/// Identity and mutable progress of one ranged fetch. Mutated only
/// through the pool, as spec §3 requires.
pub struct DownloadTask {
    pub id: u64,
    pub uri: String,
    pub headers: HashMap<String, String>,
    pub fingerprint: Fingerprint,
    pub hls_key: Option<Fingerprint>,
    pub start_range: u64,
    pub end_range: Option<u64>,
    pub priority: Priority,
    downloaded_bytes: AtomicU64,
    total_bytes: AtomicU64,
    status: AtomicU8,
    /// Origin HTTP status that caused a `Failed` transition, when the
    /// cause was a non-retryable `OriginStatus` rather than a
    /// connection-level error (0 = none). Lets callers relay the origin's
    /// actual status verbatim instead of a generic 502 (spec §7).
    failure_status: AtomicU16,
    progress_tx: broadcast::Sender<ProgressEvent>,
    pub cancel_token: CancellationToken,
}

impl DownloadTask {
    pub fn segment_key(&self) -> SegmentKey {
        SegmentKey::new(self.fingerprint.clone(), self.start_range, self.end_range)
    }

    pub fn status(&self) -> TaskStatus {
        TaskStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    pub fn failure_status(&self) -> Option<u16> {
        match self.failure_status.load(Ordering::Acquire) {
            0 => None,
            code => Some(code),
        }
    }

    pub fn set_failure_status(&self, status_code: Option<u16>) {
        self.failure_status.store(status_code.unwrap_or(0), Ordering::Release);
    }

    pub fn downloaded_bytes(&self) -> u64 {
        self.downloaded_bytes.load(Ordering::Acquire)
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes.load(Ordering::Acquire)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.progress_tx.subscribe()
    }

    /// Progress updates are strictly monotonic in `downloaded_bytes`
    /// (spec §5 "Ordering guarantees").
    pub fn emit_progress(&self, downloaded_bytes: u64, total_bytes: u64, status: TaskStatus) {
        if total_bytes > 0 {
            self.total_bytes.store(total_bytes, Ordering::Release);
        }
        self.downloaded_bytes.store(downloaded_bytes, Ordering::Release);
        self.status.store(status as u8, Ordering::Release);
        let _ = self.progress_tx.send(ProgressEvent {
            task_id: self.id,
            downloaded_bytes,
            total_bytes: self.total_bytes.load(Ordering::Acquire),
            status,
        });
    }
}

pub struct NewTask {
    pub uri: String,
    pub headers: HashMap<String, String>,
    pub fingerprint: Fingerprint,
    pub hls_key: Option<Fingerprint>,
    pub start_range: u64,
    pub end_range: Option<u64>,
    pub priority: Priority,
}

struct RegistryInner {
    by_id: HashMap<u64, Arc<DownloadTask>>,
    by_key: HashMap<SegmentKey, u64>,
    by_fingerprint: HashMap<Fingerprint, Vec<u64>>,
    by_hls_key: HashMap<Fingerprint, Vec<u64>>,
    insertion_order: Vec<u64>,
    next_id: u64,
}

impl RegistryInner {
    fn new() -> Self {
        Self {
            by_id: HashMap::new(),
            by_key: HashMap::new(),
            by_fingerprint: HashMap::new(),
            by_hls_key: HashMap::new(),
            insertion_order: Vec::new(),
            next_id: 1,
        }
    }

    fn remove_from_indexes(&mut self, task: &DownloadTask) {
        self.by_key.remove(&task.segment_key());
        if let Some(ids) = self.by_fingerprint.get_mut(&task.fingerprint) {
            ids.retain(|&id| id != task.id);
        }
        if let Some(hls_key) = &task.hls_key {
            if let Some(ids) = self.by_hls_key.get_mut(hls_key) {
                ids.retain(|&id| id != task.id);
            }
        }
        self.insertion_order.retain(|&id| id != task.id);
        self.by_id.remove(&task.id);
    }
}

/// Accepts submissions, coalesces duplicates, maintains the three lookup
/// indexes spec §4.D requires, and fans out task-count changes.
pub struct TaskRegistry {
    inner: std::sync::Mutex<RegistryInner>,
    task_count_tx: watch::Sender<usize>,
}

impl TaskRegistry {
    pub fn new() -> Arc<Self> {
        let (task_count_tx, _rx) = watch::channel(0);
        Arc::new(Self {
            inner: std::sync::Mutex::new(RegistryInner::new()),
            task_count_tx,
        })
    }

    /// Coalesces duplicates: if an equivalent, non-terminal-failed task is
    /// already present, its handle is returned instead of a new task.
    pub fn add_task(&self, new_task: NewTask) -> Arc<DownloadTask> {
        let key = SegmentKey::new(
            new_task.fingerprint.clone(),
            new_task.start_range,
            new_task.end_range,
        );
        let mut inner = self.inner.lock().expect("task registry mutex poisoned");

        if let Some(&existing_id) = inner.by_key.get(&key) {
            if let Some(existing) = inner.by_id.get(&existing_id) {
                let status = existing.status();
                if !matches!(status, TaskStatus::Cancelled | TaskStatus::Failed) {
                    return Arc::clone(existing);
                }
            }
        }

        let id = inner.next_id;
        inner.next_id += 1;
        let (progress_tx, _rx) = broadcast::channel(32);
        let task = Arc::new(DownloadTask {
            id,
            uri: new_task.uri,
            headers: new_task.headers,
            fingerprint: new_task.fingerprint.clone(),
            hls_key: new_task.hls_key.clone(),
            start_range: new_task.start_range,
            end_range: new_task.end_range,
            priority: new_task.priority,
            downloaded_bytes: AtomicU64::new(0),
            total_bytes: AtomicU64::new(0),
            status: AtomicU8::new(TaskStatus::Queued as u8),
            failure_status: AtomicU16::new(0),
            progress_tx,
            cancel_token: CancellationToken::new(),
        });

        inner.by_id.insert(id, Arc::clone(&task));
        inner.by_key.insert(key, id);
        inner
            .by_fingerprint
            .entry(new_task.fingerprint)
            .or_default()
            .push(id);
        if let Some(hls_key) = new_task.hls_key {
            inner.by_hls_key.entry(hls_key).or_default().push(id);
        }
        inner.insertion_order.push(id);

        let count = inner.by_id.len();
        drop(inner);
        let _ = self.task_count_tx.send(count);
        task
    }

    /// Submit and block until the task reaches a terminal state.
    pub async fn execute_task(&self, new_task: NewTask) -> Arc<DownloadTask> {
        let task = self.add_task(new_task);
        if !task.status().is_terminal() {
            let mut rx = task.subscribe();
            while !task.status().is_terminal() {
                if rx.recv().await.is_err() {
                    break;
                }
            }
        }
        task
    }

    pub fn remove_terminal(&self, task_id: u64) {
        let mut inner = self.inner.lock().expect("task registry mutex poisoned");
        if let Some(task) = inner.by_id.get(&task_id).cloned() {
            if task.status().is_terminal() {
                inner.remove_from_indexes(&task);
                let count = inner.by_id.len();
                drop(inner);
                let _ = self.task_count_tx.send(count);
            }
        }
    }

    pub fn task_count(&self) -> usize {
        self.inner.lock().expect("task registry mutex poisoned").by_id.len()
    }

    pub fn active_task_count(&self) -> usize {
        let inner = self.inner.lock().expect("task registry mutex poisoned");
        inner
            .by_id
            .values()
            .filter(|t| matches!(t.status(), TaskStatus::Queued | TaskStatus::Downloading | TaskStatus::Paused))
            .count()
    }

    pub fn task_count_stream(&self) -> watch::Receiver<usize> {
        self.task_count_tx.subscribe()
    }

    pub fn all_tasks(&self) -> Vec<Arc<DownloadTask>> {
        let inner = self.inner.lock().expect("task registry mutex poisoned");
        inner
            .insertion_order
            .iter()
            .filter_map(|id| inner.by_id.get(id).cloned())
            .collect()
    }

    /// Cancels the union of {task.uri == url} ∪ {task.fingerprint ==
    /// fingerprint(url, customCacheId)} ∪ {task.hlsKey == playlistKey(url)},
    /// then removes them. Idempotent: a second call against the same URL
    /// finds nothing left to cancel.
    pub fn cancel_video_tasks(&self, url: &str, custom_cache_id: Option<&str>) -> usize {
        let fingerprint = key::fingerprint(url, custom_cache_id);
        let hls_key = key::playlist_key(url);

        let mut inner = self.inner.lock().expect("task registry mutex poisoned");
        let mut matched: Vec<u64> = inner
            .by_id
            .values()
            .filter(|t| t.uri == url || t.fingerprint == fingerprint || t.hls_key.as_deref() == Some(hls_key.as_str()))
            .map(|t| t.id)
            .collect();
        matched.sort_unstable();
        matched.dedup();

        let mut cancelled = 0;
        for id in &matched {
            if let Some(task) = inner.by_id.get(id).cloned() {
                if !task.status().is_terminal() {
                    task.cancel_token.cancel();
                    task.emit_progress(task.downloaded_bytes(), task.total_bytes(), TaskStatus::Cancelled);
                    cancelled += 1;
                }
                inner.remove_from_indexes(&task);
            }
        }

        let count = inner.by_id.len();
        drop(inner);
        if !matched.is_empty() {
            let _ = self.task_count_tx.send(count);
        }
        debug!(url, cancelled, "cancelled video tasks");
        cancelled
    }
}

//! Fixed-size worker pool executing ranged fetches (component 4.C).

use std::collections::HashMap;
use std::sync::Arc;

use bytes::BytesMut;
use parking_lot::Mutex;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_LENGTH, CONTENT_RANGE, RANGE};
use tokio::sync::{mpsc, watch, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::cache::{SegmentKey, SharedCacheStore};
use crate::error::ProxyError;
use crate::pipeline::mp4::WindowGrid;
use crate::task::retry::{retry_with_backoff, RetryAction, RetryPolicy};
use crate::task::{DownloadTask, Priority, TaskStatus};

/// Scheduler → worker control signals (spec 4.C).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerControl {
    Pause,
    Resume,
}

/// A fixed pool of isolated workers, one per in-flight `DOWNLOADING` task,
/// bounded by a semaphore. Foreground-priority tasks are dispatched ahead
/// of background ones via a `biased` `select!`, matching
/// `mesio-engine`'s `SegmentScheduler::run` dispatch loop
/// (`crates/mesio/src/hls/scheduler.rs`) generalized from HLS-segment jobs
/// to generic ranged fetches.
pub struct WorkerPool {
    client: reqwest::Client,
    cache: SharedCacheStore,
    grid: WindowGrid,
    semaphore: Arc<Semaphore>,
    retry_policy: RetryPolicy,
    foreground_tx: mpsc::UnboundedSender<Arc<DownloadTask>>,
    background_tx: mpsc::UnboundedSender<Arc<DownloadTask>>,
    controls: Mutex<HashMap<u64, watch::Sender<WorkerControl>>>,
    shutdown: CancellationToken,
}

impl WorkerPool {
    pub fn spawn(pool_size: usize, client: reqwest::Client, cache: SharedCacheStore, grid: WindowGrid) -> Arc<Self> {
        let (foreground_tx, mut foreground_rx) = mpsc::unbounded_channel();
        let (background_tx, mut background_rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();

        let pool = Arc::new(Self {
            client,
            cache,
            grid,
            semaphore: Arc::new(Semaphore::new(pool_size.max(1))),
            retry_policy: RetryPolicy::default(),
            foreground_tx,
            background_tx,
            controls: Mutex::new(HashMap::new()),
            shutdown: shutdown.clone(),
        });

        let dispatch_pool = Arc::clone(&pool);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => break,
                    Some(task) = foreground_rx.recv() => dispatch_pool.spawn_worker(task),
                    Some(task) = background_rx.recv() => dispatch_pool.spawn_worker(task),
                    else => break,
                }
            }
        });

        pool
    }

    /// Enqueue a task for dispatch. Foreground tasks are serviced ahead of
    /// background ones but both still respect the `poolSize` concurrency
    /// ceiling via the shared semaphore.
    pub fn submit(&self, task: Arc<DownloadTask>) {
        let (tx, priority) = match task.priority {
            Priority::Foreground => (&self.foreground_tx, "foreground"),
            Priority::Background => (&self.background_tx, "background"),
        };
        debug!(task_id = task.id, priority, "enqueued task");
        let _ = tx.send(task);
    }

    pub fn pause(&self, task_id: u64) {
        if let Some(tx) = self.controls.lock().get(&task_id) {
            let _ = tx.send(WorkerControl::Pause);
        }
    }

    pub fn resume(&self, task_id: u64) {
        if let Some(tx) = self.controls.lock().get(&task_id) {
            let _ = tx.send(WorkerControl::Resume);
        }
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    fn spawn_worker(self: &Arc<Self>, task: Arc<DownloadTask>) {
        if task.status().is_terminal() || task.cancel_token.is_cancelled() {
            return;
        }
        let pool = Arc::clone(self);
        let semaphore = Arc::clone(&self.semaphore);
        let (control_tx, control_rx) = watch::channel(WorkerControl::Resume);
        pool.controls.lock().insert(task.id, control_tx);

        tokio::spawn(async move {
            let _permit = match semaphore.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return,
            };
            pool.run_task(task.clone(), control_rx).await;
            pool.controls.lock().remove(&task.id);
        });
    }

    /// Per-worker protocol: satisfy from cache, else fetch with retry and
    /// backoff, honoring pause/resume and cancellation.
    async fn run_task(&self, task: Arc<DownloadTask>, mut control_rx: watch::Receiver<WorkerControl>) {
        let key = task.segment_key();

        if let Some(cached) = self.cache.get(&key).await {
            let len = cached.len() as u64;
            task.emit_progress(len, len, TaskStatus::Completed);
            task.emit_progress(len, len, TaskStatus::Finished);
            return;
        }

        // Shared across retries so a partial read surviving a transient
        // failure is not discarded: each retry only fetches the remainder
        // via an updated `Range` and appends to the same buffer.
        let accumulator = Arc::new(Mutex::new(BytesMut::new()));
        let result = retry_with_backoff(&self.retry_policy, &task.cancel_token, |_attempt| {
            let task = Arc::clone(&task);
            let control_rx = control_rx.clone();
            let accumulator = Arc::clone(&accumulator);
            async move { self.fetch_once(&task, control_rx, accumulator).await }
        })
        .await;

        match result {
            Ok(()) => {
                let bytes = std::mem::take(&mut *accumulator.lock()).freeze();
                let window_len = bytes.len() as u64;
                // `task.total_bytes()` already tracks the full resource
                // length reported by the origin (Content-Range/-Length);
                // the cache entry's "total" must stay resource-wide, not
                // collapse to this window's own byte count.
                let resource_total = task.total_bytes().max(window_len);
                if let Err(err) = self.cache.put(key, bytes, resource_total).await {
                    warn!(task_id = task.id, error = %err, "cache write failed; streaming without cache");
                }
                task.emit_progress(window_len, resource_total, TaskStatus::Completed);
                task.emit_progress(window_len, resource_total, TaskStatus::Finished);
            }
            Err(ProxyError::Cancelled) => {
                task.emit_progress(task.downloaded_bytes(), task.total_bytes(), TaskStatus::Cancelled);
            }
            Err(ProxyError::OriginStatus { status }) => {
                task.set_failure_status(Some(status.as_u16()));
                task.emit_progress(task.downloaded_bytes(), task.total_bytes(), TaskStatus::Failed);
            }
            Err(_err) => {
                task.emit_progress(task.downloaded_bytes(), task.total_bytes(), TaskStatus::Failed);
            }
        }
    }

    /// A single attempt, resuming from `task.downloaded_bytes()` so a
    /// retry after a partial read picks up where the last one left off
    /// (spec 4.C step 5: "restart step 3 using an updated Range that
    /// resumes from start + downloadedBytes").
    async fn fetch_once(
        &self,
        task: &Arc<DownloadTask>,
        mut control_rx: watch::Receiver<WorkerControl>,
        accumulator: Arc<Mutex<BytesMut>>,
    ) -> RetryAction<()> {
        let resume_from = task.downloaded_bytes();
        let start = task.start_range + resume_from;
        let range_value = match task.end_range {
            Some(end) => format!("bytes={start}-{end}"),
            None => format!("bytes={start}-"),
        };

        let mut headers = HeaderMap::new();
        for (name, value) in &task.headers {
            if let Ok(value) = HeaderValue::from_str(value) {
                if let Ok(name) = reqwest::header::HeaderName::from_bytes(name.as_bytes()) {
                    headers.insert(name, value);
                }
            }
        }
        headers.insert(RANGE, HeaderValue::from_str(&range_value).unwrap());

        let response = match self.client.get(&task.uri).headers(headers).send().await {
            Ok(r) => r,
            Err(e) => {
                let err = ProxyError::from(e);
                return if err.is_retryable() {
                    RetryAction::Retry(err)
                } else {
                    RetryAction::Fail(err)
                };
            }
        };

        if response.status().is_client_error() || response.status().is_server_error() {
            let err = ProxyError::OriginStatus { status: response.status() };
            return if err.is_retryable() {
                RetryAction::Retry(err)
            } else {
                RetryAction::Fail(err)
            };
        }

        // We always send a Range header, so a `200` response (rather than
        // `206`) means this origin ignores Range and returned the whole
        // resource. Caching that verbatim under this window's `SegmentKey`
        // would serve the wrong bytes for every other window; fall back to
        // a single whole-body fetch split into grid windows post-hoc
        // (spec §4.F edge case).
        if response.status() == reqwest::StatusCode::OK {
            debug!(task_id = task.id, "origin ignored Range header; falling back to whole-body fetch");
            return self.stream_whole_body_and_split(task, response, control_rx, accumulator).await;
        }

        let total_bytes = total_bytes_from_headers(response.headers());
        task.emit_progress(resume_from, total_bytes, TaskStatus::Downloading);

        let mut stream = response.bytes_stream();
        use futures::StreamExt;

        loop {
            if *control_rx.borrow() == WorkerControl::Pause {
                task.emit_progress(task.downloaded_bytes(), total_bytes, TaskStatus::Paused);
                if control_rx.changed().await.is_err() {
                    return RetryAction::Fail(ProxyError::Cancelled);
                }
                continue;
            }

            tokio::select! {
                biased;
                _ = task.cancel_token.cancelled() => {
                    return RetryAction::Fail(ProxyError::Cancelled);
                }
                changed = control_rx.changed() => {
                    if changed.is_err() {
                        return RetryAction::Fail(ProxyError::Cancelled);
                    }
                    continue;
                }
                chunk = stream.next() => {
                    match chunk {
                        Some(Ok(bytes)) => {
                            let downloaded = {
                                let mut acc = accumulator.lock();
                                acc.extend_from_slice(&bytes);
                                resume_from + acc.len() as u64
                            };
                            task.emit_progress(downloaded, total_bytes.max(downloaded), TaskStatus::Downloading);
                        }
                        Some(Err(e)) => {
                            let err = ProxyError::from(e);
                            return if err.is_retryable() {
                                RetryAction::Retry(err)
                            } else {
                                RetryAction::Fail(err)
                            };
                        }
                        None => return RetryAction::Success(()),
                    }
                }
            }
        }
    }

    /// Fallback for an origin that ignores `Range`: stream the whole body,
    /// cache every grid window it covers directly, then hand this task's
    /// own window back through `accumulator` so the rest of `run_task`'s
    /// completion logic is unchanged.
    async fn stream_whole_body_and_split(
        &self,
        task: &Arc<DownloadTask>,
        response: reqwest::Response,
        mut control_rx: watch::Receiver<WorkerControl>,
        accumulator: Arc<Mutex<BytesMut>>,
    ) -> RetryAction<()> {
        use futures::StreamExt;

        let mut stream = response.bytes_stream();
        let mut whole = BytesMut::new();

        loop {
            if *control_rx.borrow() == WorkerControl::Pause {
                task.emit_progress(task.downloaded_bytes(), task.total_bytes(), TaskStatus::Paused);
                if control_rx.changed().await.is_err() {
                    return RetryAction::Fail(ProxyError::Cancelled);
                }
                continue;
            }

            tokio::select! {
                biased;
                _ = task.cancel_token.cancelled() => {
                    return RetryAction::Fail(ProxyError::Cancelled);
                }
                changed = control_rx.changed() => {
                    if changed.is_err() {
                        return RetryAction::Fail(ProxyError::Cancelled);
                    }
                    continue;
                }
                chunk = stream.next() => {
                    match chunk {
                        Some(Ok(bytes)) => {
                            whole.extend_from_slice(&bytes);
                            let downloaded = whole.len() as u64;
                            task.emit_progress(downloaded, downloaded, TaskStatus::Downloading);
                        }
                        Some(Err(e)) => {
                            let err = ProxyError::from(e);
                            return if err.is_retryable() {
                                RetryAction::Retry(err)
                            } else {
                                RetryAction::Fail(err)
                            };
                        }
                        None => break,
                    }
                }
            }
        }

        let whole = whole.freeze();
        let total = whole.len() as u64;
        self.insert_grid_windows(&task.fingerprint, &whole).await;

        let own_start = task.start_range.min(total);
        let own_end = task.end_range.map(|e| e.saturating_add(1)).unwrap_or(total).min(total).max(own_start);
        *accumulator.lock() = BytesMut::from(&whole[own_start as usize..own_end as usize]);
        task.emit_progress(total, total, TaskStatus::Downloading);
        RetryAction::Success(())
    }

    /// Splits `whole` (a full-resource fetch) into every grid window it
    /// covers and inserts each directly into the cache, bypassing the
    /// per-task accumulator that only tracks the requesting task's own
    /// window.
    async fn insert_grid_windows(&self, fingerprint: &str, whole: &bytes::Bytes) {
        let total = whole.len() as u64;
        let mut index = 0u64;
        loop {
            let (start, end) = self.grid.bounds(index);
            if start >= total {
                break;
            }
            let window_end = (end + 1).min(total);
            let slice = whole.slice(start as usize..window_end as usize);
            let key = SegmentKey::new(fingerprint.to_string(), start, Some(end));
            // Store the whole resource's length alongside every window, not
            // just this window's own byte count, so a cache hit against any
            // of these windows reports the correct resource-wide total.
            if let Err(err) = self.cache.put(key, slice, total).await {
                warn!(fingerprint, error = %err, index, "failed to cache grid window from whole-body fallback");
            }
            if window_end >= total {
                break;
            }
            index += 1;
        }
    }
}

fn total_bytes_from_headers(headers: &HeaderMap) -> u64 {
    if let Some(content_range) = headers.get(CONTENT_RANGE).and_then(|v| v.to_str().ok()) {
        if let Some(total) = content_range.rsplit('/').next() {
            if let Ok(total) = total.parse() {
                return total;
            }
        }
    }
    headers
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn total_bytes_prefers_content_range_total() {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_RANGE, HeaderValue::from_static("bytes 0-99/12345"));
        headers.insert(CONTENT_LENGTH, HeaderValue::from_static("100"));
        assert_eq!(total_bytes_from_headers(&headers), 12345);
    }

    #[test]
    fn total_bytes_falls_back_to_content_length() {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_LENGTH, HeaderValue::from_static("42"));
        assert_eq!(total_bytes_from_headers(&headers), 42);
    }

    #[test]
    fn total_bytes_defaults_to_zero() {
        let headers = HeaderMap::new();
        assert_eq!(total_bytes_from_headers(&headers), 0);
    }
}

//! MP4 / byte-range pipeline (component 4.F).

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::cache::{SegmentKey, SharedCacheStore};
use crate::config::ProxyConfig;
use crate::error::{ProxyError, Result};
use crate::pool::WorkerPool;
use crate::server::http::write_response_head;
use crate::task::{NewTask, Priority, TaskRegistry, TaskStatus};

/// A client `Range: bytes=S-E?` request. `end` is `None` for an
/// open-ended / to-EOF range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeRequest {
    pub start: u64,
    pub end: Option<u64>,
}

impl RangeRequest {
    /// `None` means no `Range` header was present at all (full-resource
    /// request, default `bytes=0-`).
    pub fn parse(header: Option<&str>) -> Option<Self> {
        let header = header?;
        let spec = header.strip_prefix("bytes=")?;
        let (start_str, end_str) = spec.split_once('-')?;
        let start: u64 = start_str.trim().parse().ok()?;
        let end = if end_str.trim().is_empty() {
            None
        } else {
            end_str.trim().parse().ok()
        };
        Some(Self { start, end })
    }
}

/// Fixed-size windowing over a linear resource: the first window is
/// `first_segment_size` bytes, every subsequent window is `segment_size`.
#[derive(Debug, Clone, Copy)]
pub struct WindowGrid {
    pub first_segment_size: u64,
    pub segment_size: u64,
}

impl WindowGrid {
    pub fn new(first_segment_size: u64, segment_size: u64) -> Self {
        Self {
            first_segment_size: first_segment_size.max(1),
            segment_size: segment_size.max(1),
        }
    }

    /// The grid index containing byte offset `offset`.
    pub fn index_of(&self, offset: u64) -> u64 {
        if offset < self.first_segment_size {
            0
        } else {
            1 + (offset - self.first_segment_size) / self.segment_size
        }
    }

    /// Inclusive `(start, end)` bounds of window `index`, ignoring any
    /// resource-length truncation.
    pub fn bounds(&self, index: u64) -> (u64, u64) {
        if index == 0 {
            (0, self.first_segment_size - 1)
        } else {
            let start = self.first_segment_size + (index - 1) * self.segment_size;
            (start, start + self.segment_size - 1)
        }
    }

    /// Indices of every window intersecting `[start, end]` (inclusive).
    pub fn windows_covering(&self, start: u64, end: u64) -> Vec<u64> {
        let first = self.index_of(start);
        let last = self.index_of(end);
        (first..=last).collect()
    }
}

#[derive(Clone)]
pub struct Mp4PipelineDeps {
    pub cache: SharedCacheStore,
    pub pool: Arc<WorkerPool>,
    pub registry: Arc<TaskRegistry>,
    pub config: Arc<ProxyConfig>,
}

/// Serve `range` of `origin_uri` to `writer`, consulting the cache per
/// window and enqueueing fetch tasks (high priority for the window
/// intersecting the request, low priority for the following
/// `cacheSegments - 1` windows) for anything missing.
pub async fn serve<W: AsyncWrite + Unpin>(
    writer: &mut W,
    origin_uri: &str,
    fingerprint: &str,
    headers: HashMap<String, String>,
    range: Option<RangeRequest>,
    deps: &Mp4PipelineDeps,
    client_cancelled: &CancellationToken,
) -> Result<()> {
    serve_with_hls_key(writer, origin_uri, fingerprint, headers, range, deps, client_cancelled, None).await
}

/// Same as [`serve`], but every task enqueued carries `hls_key` so an HLS
/// segment request can be cancelled alongside its parent playlist group
/// (spec 4.D "cancelVideoTasks" / 4.G "shared hlsKey").
#[allow(clippy::too_many_arguments)]
pub async fn serve_with_hls_key<W: AsyncWrite + Unpin>(
    writer: &mut W,
    origin_uri: &str,
    fingerprint: &str,
    headers: HashMap<String, String>,
    range: Option<RangeRequest>,
    deps: &Mp4PipelineDeps,
    client_cancelled: &CancellationToken,
    hls_key: Option<&str>,
) -> Result<()> {
    let grid = WindowGrid::new(deps.config.first_segment_size, deps.config.segment_size);
    let request = range.unwrap_or(RangeRequest { start: 0, end: None });

    let first_index = grid.index_of(request.start);
    let (first_window, total_bytes) = match fetch_window(
        first_index,
        &grid,
        origin_uri,
        fingerprint,
        &headers,
        deps,
        Priority::Foreground,
        hls_key,
        client_cancelled,
    )
    .await
    {
        Ok(v) => v,
        Err(ProxyError::Cancelled) => return Ok(()),
        Err(ProxyError::OriginStatus { status }) => {
            debug!(fingerprint, %status, "relaying origin status verbatim after exhausted retries");
            write_response_head(writer, status.as_u16(), status.canonical_reason().unwrap_or(""), &[]).await?;
            return Ok(());
        }
        Err(err) => {
            warn!(fingerprint, error = %err, "origin unreachable after exhausted retries");
            write_response_head(writer, 502, "Bad Gateway", &[]).await?;
            return Ok(());
        }
    };

    if total_bytes > 0 {
        if let Some(r) = range {
            if r.start >= total_bytes {
                let err = ProxyError::RangeNotSatisfiable;
                warn!(fingerprint, error = %err, total_bytes, start = r.start, "requested range starts beyond resource length");
                write_response_head(
                    writer,
                    416,
                    "Range Not Satisfiable",
                    &[("Content-Range", format!("bytes */{total_bytes}"))],
                )
                .await?;
                return Ok(());
            }
        }
    }

    let status = if range.is_some() { 206u16 } else { 200u16 };
    let reason = if status == 206 { "Partial Content" } else { "OK" };
    let content_type = "application/octet-stream".to_string();
    let end_inclusive = request
        .end
        .unwrap_or_else(|| if total_bytes > 0 { total_bytes - 1 } else { u64::MAX });

    let mut response_headers = vec![("Content-Type", content_type), ("Accept-Ranges", "bytes".to_string())];
    if total_bytes > 0 {
        if range.is_some() {
            response_headers.push((
                "Content-Range",
                format!("bytes {}-{}/{}", request.start, end_inclusive.min(total_bytes - 1), total_bytes),
            ));
        }
        let body_len = end_inclusive.min(total_bytes - 1) - request.start + 1;
        response_headers.push(("Content-Length", body_len.to_string()));
    }
    write_response_head(writer, status, reason, &response_headers).await?;

    let mut index = first_index;
    let mut window = first_window;
    let mut served_any_eof = false;

    loop {
        if client_cancelled.is_cancelled() {
            debug!(fingerprint, "client disconnected mid-stream");
            break;
        }

        let (window_start, nominal_end) = grid.bounds(index);
        let window_total = window.len() as u64;
        let actual_end = window_start + window_total.saturating_sub(1);
        let slice_start = request.start.max(window_start);
        let slice_end = end_inclusive.min(actual_end);

        if slice_start <= slice_end && window_start + (slice_start - window_start) < window_start + window_total {
            let offset = (slice_start - window_start) as usize;
            let len = (slice_end - slice_start + 1) as usize;
            if offset < window.len() {
                let upper = (offset + len).min(window.len());
                if writer.write_all(&window[offset..upper]).await.is_err() {
                    debug!(fingerprint, "client socket closed during write");
                    client_cancelled.cancel();
                    break;
                }
            }
        }

        if window_total < (nominal_end - window_start + 1) {
            // Short read: this window straddled EOF.
            served_any_eof = true;
        }

        if served_any_eof || slice_end >= end_inclusive || (total_bytes > 0 && actual_end + 1 >= total_bytes) {
            break;
        }

        index += 1;
        let (next_start, _) = grid.bounds(index);
        if next_start > end_inclusive {
            break;
        }

        let priority = if next_start <= request.start + deps.config.segment_size {
            Priority::Foreground
        } else {
            Priority::Background
        };
        let (next_window, next_total) = match fetch_window(
            index,
            &grid,
            origin_uri,
            fingerprint,
            &headers,
            deps,
            priority,
            hls_key,
            client_cancelled,
        )
        .await
        {
            Ok(v) => v,
            Err(ProxyError::Cancelled) => break,
            Err(err) => {
                warn!(fingerprint, error = %err, "window fetch failed mid-stream");
                return Err(err);
            }
        };
        window = next_window;
        let _ = next_total;
    }

    writer.flush().await.ok();

    // A client that's gone has no one to serve warmed windows to; the
    // disconnect policy only protects foreground fetches already in
    // flight (spec §7 `ClientDisconnect`), not new background prefetch.
    if !client_cancelled.is_cancelled() {
        enqueue_prefetch(&grid, index + 1, deps.config.cache_segments, origin_uri, fingerprint, &headers, deps, hls_key);
    }

    Ok(())
}

/// Fetch (from cache or the pool) the bytes for grid window `index`.
/// While awaiting a background-priority task, a client disconnect
/// (`client_cancelled`) cancels it immediately; a foreground task is left
/// to run to completion regardless, per spec §7's `ClientDisconnect`
/// policy ("cancels in-flight low-priority fetches but lets high-priority
/// ones complete up to the cacheSegments horizon").
#[allow(clippy::too_many_arguments)]
async fn fetch_window(
    index: u64,
    grid: &WindowGrid,
    origin_uri: &str,
    fingerprint: &str,
    headers: &HashMap<String, String>,
    deps: &Mp4PipelineDeps,
    priority: Priority,
    hls_key: Option<&str>,
    client_cancelled: &CancellationToken,
) -> Result<(Bytes, u64)> {
    let (start, end) = grid.bounds(index);
    let key = SegmentKey::new(fingerprint.to_string(), start, Some(end));

    if let Some(bytes) = deps.cache.get(&key).await {
        let total = deps.cache.memory_total_bytes(&key).unwrap_or(0);
        return Ok((bytes, total));
    }

    let task = deps.registry.add_task(NewTask {
        uri: origin_uri.to_string(),
        headers: headers.clone(),
        fingerprint: fingerprint.to_string(),
        hls_key: hls_key.map(str::to_string),
        start_range: start,
        end_range: Some(end),
        priority,
    });
    deps.pool.submit(Arc::clone(&task));

    if !task.status().is_terminal() {
        let mut rx = task.subscribe();
        while !task.status().is_terminal() {
            if priority == Priority::Background {
                tokio::select! {
                    biased;
                    _ = client_cancelled.cancelled() => {
                        task.cancel_token.cancel();
                        break;
                    }
                    received = rx.recv() => {
                        if received.is_err() {
                            break;
                        }
                    }
                }
            } else if rx.recv().await.is_err() {
                break;
            }
        }
    }

    match task.status() {
        TaskStatus::Cancelled => Err(ProxyError::Cancelled),
        TaskStatus::Failed => match task.failure_status() {
            Some(code) => Err(ProxyError::OriginStatus {
                status: reqwest::StatusCode::from_u16(code).unwrap_or(reqwest::StatusCode::BAD_GATEWAY),
            }),
            None => Err(ProxyError::origin_protocol("segment fetch failed after retries")),
        },
        _ => {
            let total_bytes = task.total_bytes();
            let bytes = deps.cache.get(&key).await.unwrap_or_default();
            Ok((bytes, total_bytes))
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn enqueue_prefetch(
    grid: &WindowGrid,
    from_index: u64,
    cache_segments: usize,
    origin_uri: &str,
    fingerprint: &str,
    headers: &HashMap<String, String>,
    deps: &Mp4PipelineDeps,
    hls_key: Option<&str>,
) {
    for offset in 0..cache_segments.saturating_sub(1) as u64 {
        let index = from_index + offset;
        let (start, end) = grid.bounds(index);
        let task = deps.registry.add_task(NewTask {
            uri: origin_uri.to_string(),
            headers: headers.clone(),
            fingerprint: fingerprint.to_string(),
            hls_key: hls_key.map(str::to_string),
            start_range: start,
            end_range: Some(end),
            priority: Priority::Background,
        });
        deps.pool.submit(task);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_header_defaults_are_parsed() {
        let r = RangeRequest::parse(Some("bytes=0-1999999")).unwrap();
        assert_eq!(r.start, 0);
        assert_eq!(r.end, Some(1_999_999));
    }

    #[test]
    fn open_ended_range_has_no_end() {
        let r = RangeRequest::parse(Some("bytes=500-")).unwrap();
        assert_eq!(r.start, 500);
        assert_eq!(r.end, None);
    }

    #[test]
    fn missing_header_parses_to_none() {
        assert!(RangeRequest::parse(None).is_none());
    }

    #[test]
    fn window_grid_first_window_uses_first_segment_size() {
        let grid = WindowGrid::new(1_000_000, 2_000_000);
        assert_eq!(grid.index_of(0), 0);
        assert_eq!(grid.index_of(999_999), 0);
        assert_eq!(grid.index_of(1_000_000), 1);
        assert_eq!(grid.bounds(0), (0, 999_999));
        assert_eq!(grid.bounds(1), (1_000_000, 2_999_999));
    }

    #[test]
    fn range_exactly_on_window_boundary_is_single_window() {
        let grid = WindowGrid::new(2_000_000, 2_000_000);
        let windows = grid.windows_covering(0, 1_999_999);
        assert_eq!(windows, vec![0]);
    }

    #[test]
    fn single_byte_range_maps_to_one_window() {
        let grid = WindowGrid::new(2_000_000, 2_000_000);
        assert_eq!(grid.windows_covering(500_000, 500_000), vec![0]);
    }

    #[test]
    fn windows_covering_spans_multiple_windows() {
        let grid = WindowGrid::new(2_000_000, 2_000_000);
        assert_eq!(grid.windows_covering(0, 4_000_000), vec![0, 1, 2]);
    }
}

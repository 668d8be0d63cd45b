//! Composition root: wires the cache, pool, registries, and pipelines
//! together behind the programmatic surface a host app consumes (spec
//! §6 "Programmatic surface").

use std::collections::HashMap;
use std::sync::Arc;

use tokio::io::AsyncWrite;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::cache::{CacheStore, SegmentKey, SharedCacheStore};
use crate::config::ProxyConfig;
use crate::error::{ProxyError, Result};
use crate::hls::{self, HlsPipelineDeps};
use crate::key;
use crate::parser::{self, ParserKind};
use crate::pipeline::mp4::{self, Mp4PipelineDeps, RangeRequest, WindowGrid};
use crate::pool::WorkerPool;
use crate::registry::{CachedVideoInfo, DownloadCacheRegistry};
use crate::server::{Deps as ServerDeps, ProxyServer};
use crate::task::{NewTask, Priority, ProgressEvent, TaskRegistry};

/// Dispatch a single already-resolved request: consult the parser, then
/// hand off to the matching pipeline. Shared between [`Engine::parse`]
/// (exposed for tests, per spec §6) and the live proxy server's
/// per-connection handler.
pub async fn handle_request<W: AsyncWrite + Unpin>(
    writer: &mut W,
    origin_uri: &str,
    fingerprint: &str,
    headers: HashMap<String, String>,
    range: Option<RangeRequest>,
    mp4_deps: &Mp4PipelineDeps,
    hls_deps: &HlsPipelineDeps,
    client_cancelled: &CancellationToken,
) -> Result<()> {
    let content_type = headers.get("content-type").map(String::as_str);
    let known_hls_key = hls_deps.known_hls_key(origin_uri);

    match parser::dispatch(origin_uri, content_type, known_hls_key) {
        ParserKind::HlsPlaylist => {
            let text = hls::serve_playlist(origin_uri, hls_deps).await?;
            crate::server::http::write_response_head(
                writer,
                200,
                "OK",
                &[
                    ("Content-Type", "application/vnd.apple.mpegurl".to_string()),
                    ("Content-Length", text.len().to_string()),
                ],
            )
            .await?;
            use tokio::io::AsyncWriteExt;
            writer.write_all(text.as_bytes()).await?;
            Ok(())
        }
        ParserKind::HlsSegment => {
            hls::serve_segment(writer, origin_uri, fingerprint, headers, range, hls_deps, client_cancelled).await
        }
        ParserKind::Mp4Range => {
            mp4::serve(writer, origin_uri, fingerprint, headers, range, mp4_deps, client_cancelled).await
        }
        ParserKind::PassThrough => pass_through(writer, origin_uri, &headers, &hls_deps.client).await,
    }
}

/// Stream `origin_uri` to `writer` verbatim, forwarding the client's
/// headers and relaying the origin's status and headers unmodified (spec
/// §4.E: "unknown schemes fall through to a pass-through that streams the
/// origin verbatim without caching").
async fn pass_through<W: AsyncWrite + Unpin>(
    writer: &mut W,
    origin_uri: &str,
    headers: &HashMap<String, String>,
    client: &reqwest::Client,
) -> Result<()> {
    let mut request = client.get(origin_uri);
    for (name, value) in headers {
        request = request.header(name.as_str(), value.as_str());
    }

    let response = match request.send().await {
        Ok(r) => r,
        Err(e) => {
            crate::server::http::write_response_head(writer, 502, "Bad Gateway", &[]).await?;
            return Err(ProxyError::from(e));
        }
    };

    let status = response.status();
    let mut response_headers = Vec::new();
    if let Some(content_type) = response.headers().get(reqwest::header::CONTENT_TYPE) {
        if let Ok(v) = content_type.to_str() {
            response_headers.push(("Content-Type", v.to_string()));
        }
    }
    if let Some(content_length) = response.headers().get(reqwest::header::CONTENT_LENGTH) {
        if let Ok(v) = content_length.to_str() {
            response_headers.push(("Content-Length", v.to_string()));
        }
    }

    crate::server::http::write_response_head(
        writer,
        status.as_u16(),
        status.canonical_reason().unwrap_or(""),
        &response_headers,
    )
    .await?;

    use futures::StreamExt;
    use tokio::io::AsyncWriteExt;
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(ProxyError::from)?;
        writer.write_all(&chunk).await?;
    }
    writer.flush().await.ok();
    Ok(())
}

/// Single-process composition root: one `Engine` per proxy instance, the
/// way `siphon-engine`'s top-level `Downloader` owns its cache, pool, and
/// registries rather than relying on process globals.
pub struct Engine {
    config: Arc<ProxyConfig>,
    cache: SharedCacheStore,
    pool: Arc<WorkerPool>,
    tasks: Arc<TaskRegistry>,
    precache_registry: DownloadCacheRegistry,
    mp4_deps: Mp4PipelineDeps,
    hls_deps: Arc<HlsPipelineDeps>,
    server: parking_lot::Mutex<Option<Arc<ProxyServer>>>,
}

impl Engine {
    /// `init(config) -> Engine`. Builds the shared HTTP client, cache
    /// tiers, worker pool, and pipeline dependency bundles from `config`.
    pub fn init(config: ProxyConfig) -> Arc<Self> {
        let config = Arc::new(config);
        let cache: SharedCacheStore = Arc::new(CacheStore::new(&config));
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.read_timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        let grid = WindowGrid::new(config.first_segment_size, config.segment_size);
        let pool = WorkerPool::spawn(config.pool_size, client.clone(), Arc::clone(&cache), grid);
        let tasks = TaskRegistry::new();

        let mp4_deps = Mp4PipelineDeps {
            cache: Arc::clone(&cache),
            pool: Arc::clone(&pool),
            registry: Arc::clone(&tasks),
            config: Arc::clone(&config),
        };
        let hls_deps = Arc::new(HlsPipelineDeps::new(client, mp4_deps.clone(), Arc::clone(&config)));

        info!(ip = %config.ip, port = config.port, "engine initialized");

        Arc::new(Self {
            config,
            cache,
            pool,
            tasks,
            precache_registry: DownloadCacheRegistry::new(),
            mp4_deps,
            hls_deps,
            server: parking_lot::Mutex::new(None),
        })
    }

    /// Start the accept loop in the background and return immediately;
    /// the server keeps running (and self-restarting on failure) until
    /// [`Engine::shutdown`] is called.
    pub fn start(self: &Arc<Self>) {
        let deps = ServerDeps {
            mp4: self.mp4_deps.clone(),
            hls: Arc::clone(&self.hls_deps),
            config: Arc::clone(&self.config),
        };
        let server = ProxyServer::new(deps);
        *self.server.lock() = Some(Arc::clone(&server));
        tokio::spawn(async move { server.run().await });
    }

    /// Graceful shutdown: stop accepting new connections, cancel every
    /// in-flight task, and drain the worker pool's dispatch loop.
    pub fn shutdown(&self) {
        if let Some(server) = self.server.lock().take() {
            server.close();
        }
        for task in self.tasks.all_tasks() {
            task.cancel_token.cancel();
        }
        self.pool.shutdown();
        debug!("engine shutdown complete");
    }

    /// Internal dispatch, exposed for tests per spec §6.
    pub async fn parse<W: AsyncWrite + Unpin>(
        &self,
        writer: &mut W,
        uri: &str,
        headers: HashMap<String, String>,
    ) -> Result<()> {
        let range = RangeRequest::parse(headers.get("range").map(String::as_str));
        let fingerprint = key::fingerprint(uri, Some(&self.config.custom_cache_id));
        let client_cancelled = CancellationToken::new();
        handle_request(
            writer,
            uri,
            &fingerprint,
            headers,
            range,
            &self.mp4_deps,
            &self.hls_deps,
            &client_cancelled,
        )
        .await
    }

    fn window_grid(&self) -> WindowGrid {
        WindowGrid::new(self.config.first_segment_size, self.config.segment_size)
    }

    /// Whether the first `cache_segments` windows of `url` are all
    /// present in the cache (either tier).
    pub fn is_cached(&self, url: &str, custom_cache_id: Option<&str>, cache_segments: usize) -> bool {
        let fingerprint = key::fingerprint(url, custom_cache_id.or(Some(&self.config.custom_cache_id)));
        let grid = self.window_grid();
        (0..cache_segments.max(1) as u64).all(|index| {
            let (start, end) = grid.bounds(index);
            self.cache.contains(&SegmentKey::new(fingerprint.clone(), start, Some(end)))
        })
    }

    /// `precache(url, ..., cacheSegments=2, ...)`. Returns `None` if a
    /// pre-cache run for this URL's dedup key is already active.
    pub fn precache(
        self: &Arc<Self>,
        url: &str,
        headers: HashMap<String, String>,
        custom_cache_id: Option<&str>,
        cache_segments: usize,
        download_now: bool,
        progress_listen: bool,
    ) -> Option<broadcast::Receiver<ProgressEvent>> {
        let fingerprint = key::fingerprint(url, custom_cache_id.or(Some(&self.config.custom_cache_id)));
        let grid = self.window_grid();
        let cache_segments = cache_segments.max(1) as u64;
        let (_, last_end) = grid.bounds(cache_segments - 1);
        let dedup_key = SegmentKey::new(fingerprint.clone(), 0, Some(last_end));

        if !self.precache_registry.try_begin_precache(dedup_key.clone()) {
            debug!(url, "precache already in flight, deduped");
            return None;
        }

        if !download_now {
            self.precache_registry.end_precache(&dedup_key);
            return None;
        }

        let mut first_receiver = None;
        let mut handles = Vec::new();
        for index in 0..cache_segments {
            let (start, end) = grid.bounds(index);
            let priority = if index == 0 { Priority::Foreground } else { Priority::Background };
            let task = self.tasks.add_task(NewTask {
                uri: url.to_string(),
                headers: headers.clone(),
                fingerprint: fingerprint.clone(),
                hls_key: None,
                start_range: start,
                end_range: Some(end),
                priority,
            });
            if progress_listen && index == 0 {
                first_receiver = Some(task.subscribe());
            }
            self.pool.submit(Arc::clone(&task));
            handles.push(task);
        }

        // Release the dedup key once every window this run started has
        // reached a terminal state, so a later precache of the same URL
        // is free to start a fresh run.
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            for task in &handles {
                if !task.status().is_terminal() {
                    let mut rx = task.subscribe();
                    while !task.status().is_terminal() {
                        if rx.recv().await.is_err() {
                            break;
                        }
                    }
                }
            }
            engine.precache_registry.end_precache(&dedup_key);
        });

        if progress_listen {
            first_receiver
        } else {
            None
        }
    }

    /// `precacheByte(url, ..., cacheBytes=500*1024, ...)`. Translates a
    /// byte budget into a window count and delegates to [`Engine::precache`].
    #[allow(clippy::too_many_arguments)]
    pub fn precache_byte(
        self: &Arc<Self>,
        url: &str,
        headers: HashMap<String, String>,
        custom_cache_id: Option<&str>,
        cache_bytes: u64,
        download_now: bool,
        progress_listen: bool,
    ) -> Option<broadcast::Receiver<ProgressEvent>> {
        let grid = self.window_grid();
        let cache_segments = grid.windows_covering(0, cache_bytes.saturating_sub(1)).len().max(1);
        self.precache(url, headers, custom_cache_id, cache_segments, download_now, progress_listen)
    }

    pub fn cancel_video_tasks(&self, url: &str, custom_cache_id: Option<&str>) -> usize {
        self.tasks.cancel_video_tasks(url, custom_cache_id.or(Some(&self.config.custom_cache_id)))
    }

    pub fn task_count(&self) -> usize {
        self.tasks.task_count()
    }

    pub fn active_task_count(&self) -> usize {
        self.tasks.active_task_count()
    }

    pub fn task_count_stream(&self) -> tokio::sync::watch::Receiver<usize> {
        self.tasks.task_count_stream()
    }

    pub fn on_error(&self) -> Option<broadcast::Receiver<String>> {
        self.server.lock().as_ref().map(|s| s.error_stream())
    }

    pub fn get_cached_videos(&self) -> Vec<CachedVideoInfo> {
        self.precache_registry.snapshot(&self.tasks, &self.cache)
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }
}

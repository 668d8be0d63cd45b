//! HLS playlist and segment handling (component 4.G). Segment bytes are
//! served through the same windowed range pipeline as plain MP4
//! (component 4.F); this module owns only playlist fetch/rewrite and the
//! `hlsKey` ancestry that lets a master cancel its whole descendant tree.

pub mod playlist;

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use url::Url;

use crate::config::ProxyConfig;
use crate::error::{ProxyError, Result};
use crate::key;
use crate::pipeline::mp4::{self, Mp4PipelineDeps, RangeRequest};
use playlist::{PlaylistStore, RewrittenPlaylist};

/// Tracks, for every descendant URL a master playlist rewrite has seen,
/// which `hlsKey` it belongs to — populated at rewrite time since that is
/// the only point the parent/child relationship is known.
struct Ancestry {
    hls_key_by_url: Mutex<HashMap<String, String>>,
}

impl Ancestry {
    fn new() -> Self {
        Self {
            hls_key_by_url: Mutex::new(HashMap::new()),
        }
    }

    fn hls_key_of(&self, url: &str) -> Option<String> {
        self.hls_key_by_url.lock().get(url).cloned()
    }

    fn register(&self, url: String, hls_key: String) {
        self.hls_key_by_url.lock().insert(url, hls_key);
    }
}

pub struct HlsPipelineDeps {
    pub client: reqwest::Client,
    pub mp4: Mp4PipelineDeps,
    pub config: Arc<ProxyConfig>,
    playlists: PlaylistStore,
    ancestry: Ancestry,
}

impl HlsPipelineDeps {
    pub fn new(client: reqwest::Client, mp4: Mp4PipelineDeps, config: Arc<ProxyConfig>) -> Self {
        Self {
            client,
            mp4,
            config,
            playlists: PlaylistStore::new(),
            ancestry: Ancestry::new(),
        }
    }

    /// Whether `url` is already known to belong to some master's
    /// descendant tree, used by the parser dispatch's `known_hls_key`
    /// check (spec 4.E).
    pub fn known_hls_key(&self, url: &str) -> bool {
        self.ancestry.hls_key_of(url).is_some() || self.playlists.get(&key::playlist_key(url)).is_some()
    }
}

/// Resolve a playlist request: serve the cached rewritten text if
/// present, otherwise fetch, parse, rewrite, and cache it before
/// returning the rewritten text to send to the client.
pub async fn serve_playlist(absolute_url: &str, deps: &HlsPipelineDeps) -> Result<String> {
    let playlist_key = key::playlist_key(absolute_url);

    if let Some(RewrittenPlaylist { rewritten, .. }) = deps.playlists.get(&playlist_key) {
        debug!(playlist_key, "serving playlist from cache");
        return Ok(rewritten);
    }

    let raw = deps
        .client
        .get(absolute_url)
        .send()
        .await?
        .error_for_status()?
        .text()
        .await?;

    let base =
        Url::parse(absolute_url).map_err(|_| ProxyError::playlist_parse_failure("playlist URL is not absolute"))?;
    let hls_key = playlist::hls_key_for(absolute_url, deps.ancestry.hls_key_of(absolute_url).as_deref());

    let outcome = playlist::rewrite_playlist(&raw, &base, &deps.config.ip.to_string(), deps.config.port)?;
    for child in outcome.child_urls {
        deps.ancestry.register(child, hls_key.clone());
    }

    deps.playlists.insert(
        playlist_key,
        RewrittenPlaylist {
            raw,
            rewritten: outcome.text.clone(),
            hls_key,
        },
    );

    Ok(outcome.text)
}

/// Serve an HLS segment (`.ts`/`.aac`/`.m4s`) by delegating to the MP4
/// range pipeline with the segment's inherited `hlsKey` attached, so it
/// can be cancelled as part of its parent group.
#[allow(clippy::too_many_arguments)]
pub async fn serve_segment<W: tokio::io::AsyncWrite + Unpin>(
    writer: &mut W,
    absolute_url: &str,
    fingerprint: &str,
    headers: HashMap<String, String>,
    range: Option<RangeRequest>,
    deps: &HlsPipelineDeps,
    client_cancelled: &CancellationToken,
) -> Result<()> {
    let hls_key = deps.ancestry.hls_key_of(absolute_url);
    mp4::serve_with_hls_key(
        writer,
        absolute_url,
        fingerprint,
        headers,
        range,
        &deps.mp4,
        client_cancelled,
        hls_key.as_deref(),
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ancestry_round_trips() {
        let ancestry = Ancestry::new();
        assert!(ancestry.hls_key_of("https://host/seg0.ts").is_none());
        ancestry.register("https://host/seg0.ts".to_string(), "master-key".to_string());
        assert_eq!(ancestry.hls_key_of("https://host/seg0.ts"), Some("master-key".to_string()));
    }
}

//! Playlist fetch, parse, and URI rewriting (component 4.G).
//!
//! Parsing itself is out of scope (spec §1: "the vendored HLS playlist
//! grammar... is assumed to be provided by a library"); this module
//! consumes `m3u8-rs`'s parsed output the way
//! `crates/siphon/src/hls/playlist.rs` and `playlist_utils.rs` do.

use std::collections::HashMap;

use m3u8_rs::{MediaPlaylistType, Playlist};
use parking_lot::Mutex;
use url::Url;

use crate::error::{ProxyError, Result};
use crate::key;

/// A playlist after its media URIs have been rewritten to route back
/// through the proxy, alongside the raw text it was derived from.
#[derive(Debug, Clone)]
pub struct RewrittenPlaylist {
    pub raw: String,
    pub rewritten: String,
    pub hls_key: String,
}

/// Keyed store of playlists already fetched and rewritten, so repeat
/// requests for the same `playlistKey` are served without refetching
/// (spec 4.G step 1: "If cached, serve the rewritten form directly").
pub struct PlaylistStore {
    inner: Mutex<HashMap<String, RewrittenPlaylist>>,
}

impl PlaylistStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, playlist_key: &str) -> Option<RewrittenPlaylist> {
        self.inner.lock().get(playlist_key).cloned()
    }

    pub fn insert(&self, playlist_key: String, entry: RewrittenPlaylist) {
        self.inner.lock().insert(playlist_key, entry);
    }

    pub fn remove(&self, playlist_key: &str) {
        self.inner.lock().remove(playlist_key);
    }
}

impl Default for PlaylistStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Result of [`rewrite_playlist`]: the rewritten text plus the absolute
/// origin URL of every child reference it rewrote, so the caller can
/// register each child's `hlsKey` ancestry before it is ever requested.
pub struct RewriteOutcome {
    pub text: String,
    pub child_urls: Vec<String>,
}

/// Parse raw playlist text, rewriting every referenced URI (variant,
/// segment, initialization, or key) to `http://<proxy>/<escaped
/// origin>?origin=<escaped origin>`. Byterange attributes are preserved
/// verbatim since they address the rewritten resource the same way they
/// addressed the original.
pub fn rewrite_playlist(raw: &str, absolute_url: &Url, proxy_ip: &str, proxy_port: u16) -> Result<RewriteOutcome> {
    let bytes = raw.as_bytes();
    let (_, playlist) =
        m3u8_rs::parse_playlist(bytes).map_err(|e| ProxyError::playlist_parse_failure(e.to_string()))?;

    let mut child_urls = Vec::new();
    let mut rewrite_uri = |uri: &str| -> String {
        // A URI that is already one of our own rewritten proxy URIs
        // carries its true origin in `origin=`; pull that back out instead
        // of treating the whole proxy URI as the origin, or a second
        // rewrite pass would wrap an already-wrapped URI again (spec §8's
        // round-trip invariant).
        let resolved = extract_origin(uri).unwrap_or_else(|| resolve_url(uri, absolute_url));
        let rewritten = format!(
            "http://{proxy_ip}:{proxy_port}/{escaped}?origin={escaped}",
            escaped = urlencoding::encode(&resolved)
        );
        child_urls.push(resolved);
        rewritten
    };

    let text = match playlist {
        Playlist::MasterPlaylist(mut master) => {
            for variant in &mut master.variants {
                variant.uri = rewrite_uri(&variant.uri);
            }
            for alt in &mut master.alternatives {
                if let Some(uri) = &alt.uri {
                    alt.uri = Some(rewrite_uri(uri));
                }
            }
            master.to_string()
        }
        Playlist::MediaPlaylist(mut media) => {
            for segment in &mut media.segments {
                segment.uri = rewrite_uri(&segment.uri);
                if let Some(map) = &mut segment.map {
                    map.uri = rewrite_uri(&map.uri);
                }
                for key in &mut segment.keys {
                    if let Some(uri) = &key.uri {
                        key.uri = Some(rewrite_uri(uri));
                    }
                }
            }
            if media.playlist_type.is_none() && media.end_list {
                media.playlist_type = Some(MediaPlaylistType::Vod);
            }
            media.to_string()
        }
    };

    Ok(RewriteOutcome { text, child_urls })
}

/// Extract and decode the `origin=` query value from one of this module's
/// own rewritten proxy URIs, if `uri` is one.
fn extract_origin(uri: &str) -> Option<String> {
    let (_, query) = uri.split_once('?')?;
    for pair in query.split('&') {
        if let Some(value) = pair.strip_prefix("origin=") {
            return urlencoding::decode(value).ok().map(|s| s.into_owned());
        }
    }
    None
}

/// Resolve a (possibly relative) playlist URI against the playlist's own
/// absolute URL, the way `crates/siphon/src/hls/playlist_utils.rs::resolve_url` does.
pub fn resolve_url(uri: &str, base: &Url) -> String {
    if Url::parse(uri).is_ok() {
        return uri.to_string();
    }
    base.join(uri).map(|u| u.to_string()).unwrap_or_else(|_| uri.to_string())
}

/// Whether `raw` parses as a master playlist (vs. a media playlist).
pub fn is_master_playlist(raw: &str) -> bool {
    matches!(m3u8_rs::parse_playlist(raw.as_bytes()), Ok((_, Playlist::MasterPlaylist(_))))
}

/// `hlsKey` for a playlist reached from `absolute_url`, equal to its own
/// fingerprint when it is itself a master, or the caller-supplied
/// ancestor key when it is a descendant.
pub fn hls_key_for(absolute_url: &str, ancestor_hls_key: Option<&str>) -> String {
    ancestor_hls_key
        .map(str::to_string)
        .unwrap_or_else(|| key::playlist_key(absolute_url))
}

#[cfg(test)]
mod tests {
    use super::*;

    const MASTER: &str = "#EXTM3U\n#EXT-X-STREAM-INF:BANDWIDTH=128000\nlow/index.m3u8\n#EXT-X-STREAM-INF:BANDWIDTH=256000\nhigh/index.m3u8\n";
    const MEDIA: &str = "#EXTM3U\n#EXT-X-TARGETDURATION:10\n#EXT-X-MEDIA-SEQUENCE:0\n#EXTINF:9.9,\nseg0.ts\n#EXTINF:9.9,\nseg1.ts\n#EXT-X-ENDLIST\n";

    fn base() -> Url {
        Url::parse("https://host.example/path/master.m3u8").unwrap()
    }

    #[test]
    fn master_variants_are_rewritten_with_origin_param() {
        let outcome = rewrite_playlist(MASTER, &base(), "127.0.0.1", 20250).unwrap();
        assert!(outcome.text.contains("http://127.0.0.1:20250/"));
        assert!(outcome.text.contains("origin="));
        assert!(outcome.text.contains(&urlencoding::encode("https://host.example/path/low/index.m3u8").to_string()));
        assert_eq!(
            outcome.child_urls,
            vec![
                "https://host.example/path/low/index.m3u8".to_string(),
                "https://host.example/path/high/index.m3u8".to_string(),
            ]
        );
    }

    #[test]
    fn media_segments_are_rewritten() {
        let outcome = rewrite_playlist(MEDIA, &base(), "127.0.0.1", 20250).unwrap();
        assert!(outcome.text.contains(&urlencoding::encode("https://host.example/path/seg0.ts").to_string()));
        assert!(outcome.text.contains(&urlencoding::encode("https://host.example/path/seg1.ts").to_string()));
    }

    #[test]
    fn rewriting_is_idempotent_on_its_own_output() {
        let once = rewrite_playlist(MASTER, &base(), "127.0.0.1", 20250).unwrap();
        let twice = rewrite_playlist(&once.text, &base(), "127.0.0.1", 20250).unwrap();
        // Re-rewriting an already-rewritten playlist must reproduce the
        // exact same text: the second pass pulls the true origin back out
        // of `origin=` instead of wrapping the proxy URI itself.
        assert_eq!(once.text, twice.text);
        assert_eq!(once.child_urls, twice.child_urls);
    }

    #[test]
    fn relative_uri_resolves_against_playlist_base() {
        assert_eq!(
            resolve_url("seg0.ts", &base()),
            "https://host.example/path/seg0.ts"
        );
    }

    #[test]
    fn absolute_uri_is_left_untouched_by_resolution() {
        assert_eq!(
            resolve_url("https://other.example/seg0.ts", &base()),
            "https://other.example/seg0.ts"
        );
    }

    #[test]
    fn detects_master_vs_media_playlist() {
        assert!(is_master_playlist(MASTER));
        assert!(!is_master_playlist(MEDIA));
    }

    #[test]
    fn hls_key_defaults_to_own_fingerprint_for_masters() {
        let url = "https://host.example/master.m3u8";
        assert_eq!(hls_key_for(url, None), key::playlist_key(url));
    }

    #[test]
    fn hls_key_inherits_ancestor_for_descendants() {
        assert_eq!(hls_key_for("https://host.example/media.m3u8", Some("abc")), "abc");
    }
}

//! Parser dispatch (component 4.E): choose MP4-range vs. HLS-playlist vs.
//! HLS-segment vs. pass-through for a request URI.

/// One variant per handler — spec §9 licenses "reflection / dynamic
/// dispatch for parser selection is a small enum with one variant per
/// handler", generalized from `siphon-engine`'s playlist-vs-segment split
/// (`crates/siphon/src/hls/hls_downloader.rs`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParserKind {
    HlsPlaylist,
    HlsSegment,
    Mp4Range,
    PassThrough,
}

const HLS_SEGMENT_EXTENSIONS: &[&str] = &[".ts", ".aac", ".m4s"];

/// Decide which handler serves `uri`. `known_hls_key` should be `true`
/// when a playlist key already resolves for this URI's fingerprint
/// (segment URIs are only routed as HLS if their parent playlist is
/// known), per spec §4.E.
pub fn dispatch(uri: &str, content_type: Option<&str>, known_hls_key: bool) -> ParserKind {
    let path = uri.split(['?', '#']).next().unwrap_or(uri);
    let lower_path = path.to_ascii_lowercase();

    if lower_path.ends_with(".m3u8") || uri.contains("m3u8=true") {
        return ParserKind::HlsPlaylist;
    }
    if let Some(content_type) = content_type {
        if content_type.eq_ignore_ascii_case("application/vnd.apple.mpegurl") {
            return ParserKind::HlsPlaylist;
        }
    }

    if known_hls_key && HLS_SEGMENT_EXTENSIONS.iter().any(|ext| lower_path.ends_with(ext)) {
        return ParserKind::HlsSegment;
    }

    if is_supported_scheme(uri) {
        ParserKind::Mp4Range
    } else {
        ParserKind::PassThrough
    }
}

fn is_supported_scheme(uri: &str) -> bool {
    uri.starts_with("http://") || uri.starts_with("https://") || !uri.contains("://")
}

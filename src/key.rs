//! Fingerprint and playlist key derivation (component 4.A).

use md5::{Digest, Md5};
use url::Url;

/// A stable 128-bit hex digest derived from a URL and an optional custom
/// cache-id salt. Used as the primary cache key and, for HLS masters, as
/// the `hlsKey` shared by all descendant playlists and segments.
pub type Fingerprint = String;

/// Lowercase the scheme and host, strip a default port for the scheme,
/// and preserve path and query verbatim.
pub fn canonicalize(url: &str) -> String {
    match Url::parse(url) {
        Ok(mut parsed) => {
            let _ = parsed.set_scheme(&parsed.scheme().to_ascii_lowercase());
            if let Some(host) = parsed.host_str() {
                let host = host.to_ascii_lowercase();
                let _ = parsed.set_host(Some(&host));
            }
            if is_default_port(parsed.scheme(), parsed.port()) {
                let _ = parsed.set_port(None);
            }
            parsed.to_string()
        }
        Err(_) => url.to_string(),
    }
}

fn is_default_port(scheme: &str, port: Option<u16>) -> bool {
    matches!(
        (scheme, port),
        ("http", Some(80)) | ("https", Some(443))
    )
}

/// `fingerprint(url, headers) = hex(md5(canonicalize(url) ⊕ custom_cache_id?))`
pub fn fingerprint(url: &str, custom_cache_id: Option<&str>) -> Fingerprint {
    let canonical = canonicalize(url);
    let mut hasher = Md5::new();
    hasher.update(canonical.as_bytes());
    if let Some(id) = custom_cache_id {
        if !id.is_empty() {
            hasher.update(id.as_bytes());
        }
    }
    hex::encode(hasher.finalize())
}

/// `hlsKey` of a master playlist: the fingerprint of its absolute URL,
/// with no custom-cache-id salt (spec §3: "keyed by the hash of its
/// absolute URL alone").
pub fn playlist_key(absolute_url: &str) -> Fingerprint {
    fingerprint(absolute_url, None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_is_stable_across_calls() {
        let a = fingerprint("https://Host.example/path?q=1", None);
        let b = fingerprint("https://Host.example/path?q=1", None);
        assert_eq!(a, b);
        assert_eq!(a.len(), 32);
    }

    #[test]
    fn fingerprint_is_case_insensitive_on_scheme_and_host() {
        let a = fingerprint("HTTPS://Example.COM/v.mp4", None);
        let b = fingerprint("https://example.com/v.mp4", None);
        assert_eq!(a, b);
    }

    #[test]
    fn fingerprint_preserves_path_and_query_case() {
        let a = fingerprint("https://example.com/Path?Q=1", None);
        let b = fingerprint("https://example.com/path?q=1", None);
        assert_ne!(a, b);
    }

    #[test]
    fn custom_cache_id_partitions_namespace() {
        let a = fingerprint("https://example.com/v.mp4", None);
        let b = fingerprint("https://example.com/v.mp4", Some("user-42"));
        assert_ne!(a, b);
    }

    #[test]
    fn default_port_is_stripped() {
        let a = fingerprint("https://example.com:443/v.mp4", None);
        let b = fingerprint("https://example.com/v.mp4", None);
        assert_eq!(a, b);
    }

    #[test]
    fn non_default_port_is_preserved() {
        let a = fingerprint("https://example.com:8443/v.mp4", None);
        let b = fingerprint("https://example.com/v.mp4", None);
        assert_ne!(a, b);
    }

    #[test]
    fn playlist_key_matches_plain_fingerprint_with_no_salt() {
        let url = "https://example.com/master.m3u8";
        assert_eq!(playlist_key(url), fingerprint(url, None));
    }
}

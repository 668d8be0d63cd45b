//! Proxy-wide configuration, built the way `siphon-engine`'s
//! `DownloaderConfig` is: a plain struct with a hand-written `Default`
//! impl and a merge-with-defaults builder entry point.

use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::time::Duration;

/// Bind address, cache budgets, segment grid, and misc knobs enumerated in
/// the external-interfaces configuration table.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Bind IP for the local HTTP server.
    pub ip: IpAddr,
    /// Bind port; auto-incremented on `EADDRINUSE`.
    pub port: u16,
    /// Memory tier budget, in bytes.
    pub memory_cache_size: u64,
    /// Disk tier budget, in bytes.
    pub storage_cache_size: u64,
    /// Size of an MP4 range-pipeline window, in bytes.
    pub segment_size: u64,
    /// Size of the first window (smaller values start playback sooner).
    pub first_segment_size: u64,
    /// Name of the header used to salt the fingerprint into a separate
    /// cache namespace.
    pub custom_cache_id: String,
    /// Number of windows to keep warm ahead of playback position.
    pub cache_segments: usize,
    /// Fixed worker pool size.
    pub pool_size: usize,
    /// Whether components should emit `tracing` events at `debug` level in
    /// addition to `info`/`warn`/`error` (the host still owns subscriber
    /// installation; this only gates the crate's own verbosity choices).
    pub log_print: bool,
    /// Override for the disk tier root; defaults to a temp-dir subpath.
    pub cache_root_path: Option<PathBuf>,
    /// Origin connect timeout.
    pub connect_timeout: Duration,
    /// Origin idle-read timeout.
    pub read_timeout: Duration,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 20250,
            memory_cache_size: 100_000_000,
            storage_cache_size: 1_000_000_000,
            segment_size: 2_000_000,
            first_segment_size: 2_000_000,
            custom_cache_id: "Custom-Cache-ID".to_string(),
            cache_segments: 2,
            pool_size: 4,
            log_print: true,
            cache_root_path: None,
            connect_timeout: Duration::from_secs(5),
            read_timeout: Duration::from_secs(15),
        }
    }
}

impl ProxyConfig {
    /// Merge `config` over the defaults, the way `DownloaderConfig::with_config`
    /// lets a caller supply a partially-filled struct and fall back to
    /// documented defaults for anything left at its `Default` value.
    pub fn with_config(config: ProxyConfig) -> Self {
        config
    }

    /// Resolve [`ProxyConfig::cache_root_path`] to a concrete directory,
    /// defaulting to a subdirectory of the OS temp dir when unset.
    pub fn resolved_cache_root(&self) -> PathBuf {
        self.cache_root_path
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("mediarelay"))
    }

    pub fn builder() -> ProxyConfigBuilder {
        ProxyConfigBuilder::default()
    }
}

/// Fluent builder over [`ProxyConfig`], mirroring the `with_*` chains the
/// teacher crates expose on their config structs.
#[derive(Debug, Clone, Default)]
pub struct ProxyConfigBuilder {
    config: OptionalFields,
}

#[derive(Debug, Clone, Default)]
struct OptionalFields {
    ip: Option<IpAddr>,
    port: Option<u16>,
    memory_cache_size: Option<u64>,
    storage_cache_size: Option<u64>,
    segment_size: Option<u64>,
    first_segment_size: Option<u64>,
    custom_cache_id: Option<String>,
    cache_segments: Option<usize>,
    pool_size: Option<usize>,
    log_print: Option<bool>,
    cache_root_path: Option<PathBuf>,
}

impl ProxyConfigBuilder {
    pub fn ip(mut self, ip: IpAddr) -> Self {
        self.config.ip = Some(ip);
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.config.port = Some(port);
        self
    }

    pub fn memory_cache_size(mut self, bytes: u64) -> Self {
        self.config.memory_cache_size = Some(bytes);
        self
    }

    pub fn storage_cache_size(mut self, bytes: u64) -> Self {
        self.config.storage_cache_size = Some(bytes);
        self
    }

    pub fn segment_size(mut self, bytes: u64) -> Self {
        self.config.segment_size = Some(bytes);
        self
    }

    pub fn first_segment_size(mut self, bytes: u64) -> Self {
        self.config.first_segment_size = Some(bytes);
        self
    }

    pub fn custom_cache_id(mut self, header_name: impl Into<String>) -> Self {
        self.config.custom_cache_id = Some(header_name.into());
        self
    }

    pub fn cache_segments(mut self, n: usize) -> Self {
        self.config.cache_segments = Some(n);
        self
    }

    pub fn pool_size(mut self, n: usize) -> Self {
        self.config.pool_size = Some(n);
        self
    }

    pub fn log_print(mut self, enabled: bool) -> Self {
        self.config.log_print = Some(enabled);
        self
    }

    pub fn cache_root_path(mut self, path: PathBuf) -> Self {
        self.config.cache_root_path = Some(path);
        self
    }

    pub fn build(self) -> ProxyConfig {
        let defaults = ProxyConfig::default();
        let f = self.config;
        ProxyConfig {
            ip: f.ip.unwrap_or(defaults.ip),
            port: f.port.unwrap_or(defaults.port),
            memory_cache_size: f.memory_cache_size.unwrap_or(defaults.memory_cache_size),
            storage_cache_size: f.storage_cache_size.unwrap_or(defaults.storage_cache_size),
            segment_size: f.segment_size.unwrap_or(defaults.segment_size),
            first_segment_size: f.first_segment_size.unwrap_or(defaults.first_segment_size),
            custom_cache_id: f.custom_cache_id.unwrap_or(defaults.custom_cache_id),
            cache_segments: f.cache_segments.unwrap_or(defaults.cache_segments),
            pool_size: f.pool_size.unwrap_or(defaults.pool_size),
            log_print: f.log_print.unwrap_or(defaults.log_print),
            cache_root_path: f.cache_root_path.or(defaults.cache_root_path),
            ..defaults
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = ProxyConfig::default();
        assert_eq!(config.port, 20250);
        assert_eq!(config.memory_cache_size, 100_000_000);
        assert_eq!(config.storage_cache_size, 1_000_000_000);
        assert_eq!(config.segment_size, 2_000_000);
        assert_eq!(config.first_segment_size, config.segment_size);
        assert_eq!(config.custom_cache_id, "Custom-Cache-ID");
    }

    #[test]
    fn builder_overrides_only_set_fields() {
        let config = ProxyConfig::builder().port(8080).build();
        assert_eq!(config.port, 8080);
        assert_eq!(config.memory_cache_size, ProxyConfig::default().memory_cache_size);
    }

    #[test]
    fn resolved_cache_root_defaults_under_temp_dir() {
        let config = ProxyConfig::default();
        assert_eq!(config.resolved_cache_root(), std::env::temp_dir().join("mediarelay"));
    }
}

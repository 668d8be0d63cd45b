//! Crate-wide error type.

use std::path::PathBuf;

/// Errors surfaced by the proxy, its cache tiers, and its worker pool.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("failed to bind {ip}:{port}: {source}")]
    BindFailure {
        ip: std::net::IpAddr,
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("health check dial to {ip}:{port} failed: {reason}")]
    HealthCheckFailure {
        ip: std::net::IpAddr,
        port: u16,
        reason: String,
    },

    #[error("origin unreachable: {source}")]
    OriginUnreachable {
        #[from]
        source: reqwest::Error,
    },

    #[error("malformed origin response: {reason}")]
    OriginProtocol { reason: String },

    #[error("origin responded with status {status}")]
    OriginStatus { status: reqwest::StatusCode },

    #[error("range not satisfiable")]
    RangeNotSatisfiable,

    #[error("cache I/O failure at {path:?}: {source}")]
    CacheIoFailure {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("playlist parse failure: {reason}")]
    PlaylistParseFailure { reason: String },

    #[error("client disconnected")]
    ClientDisconnect,

    #[error("operation cancelled")]
    Cancelled,

    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },
}

impl ProxyError {
    pub fn origin_protocol(reason: impl Into<String>) -> Self {
        Self::OriginProtocol {
            reason: reason.into(),
        }
    }

    pub fn playlist_parse_failure(reason: impl Into<String>) -> Self {
        Self::PlaylistParseFailure {
            reason: reason.into(),
        }
    }

    pub fn health_check_failure(ip: std::net::IpAddr, port: u16, reason: impl Into<String>) -> Self {
        Self::HealthCheckFailure {
            ip,
            port,
            reason: reason.into(),
        }
    }

    /// Whether a worker should retry the operation that produced this error,
    /// following the backoff policy in [`crate::task::retry`].
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::OriginUnreachable { source } => crate::task::retry::is_retryable_reqwest_error(source),
            Self::OriginProtocol { .. } | Self::Io { .. } => true,
            Self::OriginStatus { status } => {
                status.is_server_error() || *status == reqwest::StatusCode::TOO_MANY_REQUESTS
            }
            Self::BindFailure { .. }
            | Self::HealthCheckFailure { .. }
            | Self::RangeNotSatisfiable
            | Self::CacheIoFailure { .. }
            | Self::PlaylistParseFailure { .. }
            | Self::ClientDisconnect
            | Self::Cancelled => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, ProxyError>;

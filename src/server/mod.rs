//! Raw HTTP/1.1 accept loop, bind/health-check lifecycle, and per-connection
//! dispatch to the parser and pipelines (component 4.H).

pub mod http;

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::config::ProxyConfig;
use crate::error::ProxyError;
use crate::hls::HlsPipelineDeps;
use crate::key;
use crate::pipeline::mp4::{Mp4PipelineDeps, RangeRequest};
use http::{read_request_head, write_simple_response, RequestHead};

const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(10);
const HEALTH_CHECK_DIAL_TIMEOUT: Duration = Duration::from_secs(1);
const RESTART_BACKOFF: Duration = Duration::from_secs(1);

/// `STOPPED → BINDING → LISTENING → {LISTENING | DEGRADED → BINDING}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ServerState {
    Stopped = 0,
    Binding = 1,
    Listening = 2,
    Degraded = 3,
}

impl ServerState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Stopped,
            1 => Self::Binding,
            2 => Self::Listening,
            _ => Self::Degraded,
        }
    }
}

pub struct Deps {
    pub mp4: Mp4PipelineDeps,
    pub hls: Arc<HlsPipelineDeps>,
    pub config: Arc<ProxyConfig>,
}

pub struct ProxyServer {
    deps: Deps,
    state: AtomicU8,
    shutdown: CancellationToken,
    error_tx: broadcast::Sender<String>,
    bound_addr: parking_lot::Mutex<Option<SocketAddr>>,
}

impl ProxyServer {
    pub fn new(deps: Deps) -> Arc<Self> {
        let (error_tx, _rx) = broadcast::channel(32);
        Arc::new(Self {
            deps,
            state: AtomicU8::new(ServerState::Stopped as u8),
            shutdown: CancellationToken::new(),
            error_tx,
            bound_addr: parking_lot::Mutex::new(None),
        })
    }

    pub fn state(&self) -> ServerState {
        ServerState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn error_stream(&self) -> broadcast::Receiver<String> {
        self.error_tx.subscribe()
    }

    pub fn bound_addr(&self) -> Option<SocketAddr> {
        *self.bound_addr.lock()
    }

    fn set_state(&self, state: ServerState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn emit_error(&self, message: impl Into<String>) {
        let message = message.into();
        error!(message, "proxy server error");
        let _ = self.error_tx.send(message);
    }

    /// Cancel the health-check timer and transition to `STOPPED`.
    pub fn close(&self) {
        self.shutdown.cancel();
        self.set_state(ServerState::Stopped);
    }

    /// Run the bind → accept-loop → health-check lifecycle until `close()`
    /// is called. Recoverable failures (bind/listen/health-check) restart
    /// the whole loop after a short delay instead of returning an error.
    pub async fn run(self: &Arc<Self>) {
        while !self.shutdown.is_cancelled() {
            self.set_state(ServerState::Binding);
            match self.bind().await {
                Ok(listener) => {
                    *self.bound_addr.lock() = listener.local_addr().ok();
                    self.set_state(ServerState::Listening);
                    self.serve_until_degraded(listener).await;
                }
                Err(err) => {
                    self.emit_error(err.to_string());
                }
            }
            if self.shutdown.is_cancelled() {
                break;
            }
            tokio::select! {
                _ = tokio::time::sleep(RESTART_BACKOFF) => {}
                _ = self.shutdown.cancelled() => break,
            }
        }
        self.set_state(ServerState::Stopped);
    }

    /// Bind to `configIp:configPort`, incrementing the port on
    /// `EADDRINUSE` and retrying; any other bind error is reported as a
    /// `BindFailure` so the caller can back off and retry the whole loop.
    async fn bind(&self) -> Result<TcpListener, ProxyError> {
        let ip = self.deps.config.ip;
        let mut port = self.deps.config.port;
        loop {
            match TcpListener::bind((ip, port)).await {
                Ok(listener) => {
                    info!(%ip, port, "proxy server listening");
                    return Ok(listener);
                }
                Err(err) if err.kind() == std::io::ErrorKind::AddrInUse => {
                    debug!(%ip, port, "address in use, trying next port");
                    port = port.wrapping_add(1);
                    continue;
                }
                Err(source) => {
                    return Err(ProxyError::BindFailure { ip, port, source });
                }
            }
        }
    }

    async fn serve_until_degraded(self: &Arc<Self>, listener: TcpListener) {
        let ip = self.deps.config.ip;
        let port = listener.local_addr().map(|a| a.port()).unwrap_or(self.deps.config.port);
        let mut health_check = tokio::time::interval(HEALTH_CHECK_INTERVAL);
        health_check.tick().await; // first tick fires immediately; consume it

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                _ = health_check.tick() => {
                    if let Err(reason) = self.dial_health_check(ip, port).await {
                        self.set_state(ServerState::Degraded);
                        self.emit_error(ProxyError::health_check_failure(ip, port, reason.clone()).to_string());
                        return;
                    }
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((socket, peer)) => {
                            let server = Arc::clone(self);
                            tokio::spawn(async move { server.handle_connection(socket, peer).await });
                        }
                        Err(err) => {
                            self.emit_error(format!("accept failed: {err}"));
                            self.set_state(ServerState::Degraded);
                            return;
                        }
                    }
                }
            }
        }
    }

    async fn dial_health_check(&self, ip: IpAddr, port: u16) -> Result<(), String> {
        match tokio::time::timeout(HEALTH_CHECK_DIAL_TIMEOUT, TcpStream::connect((ip, port))).await {
            Ok(Ok(_stream)) => Ok(()),
            Ok(Err(err)) => Err(err.to_string()),
            Err(_) => Err("health-check dial timed out".to_string()),
        }
    }

    async fn handle_connection(self: Arc<Self>, mut socket: TcpStream, peer: SocketAddr) {
        let client_cancelled = CancellationToken::new();
        if let Err(err) = self.dispatch_connection(&mut socket, &client_cancelled).await {
            debug!(%peer, error = %err, "connection handling ended with error");
        }
        let _ = socket.shutdown().await;
    }

    async fn dispatch_connection(&self, socket: &mut TcpStream, client_cancelled: &CancellationToken) -> Result<(), ProxyError> {
        let head = match read_request_head(socket).await? {
            Some(head) => head,
            None => return Ok(()),
        };

        if head.headers.is_empty() && head.method.is_empty() {
            write_simple_response(socket, 400, "Bad Request", "empty request").await?;
            return Ok(());
        }

        if !head.method.eq_ignore_ascii_case("GET") {
            write_simple_response(socket, 405, "Method Not Allowed", "unsupported method").await?;
            return Ok(());
        }

        let origin_uri = match resolve_origin_uri(&head, &self.deps.config) {
            Some(uri) => uri,
            None => {
                write_simple_response(socket, 400, "Bad Request", "cannot resolve origin URI").await?;
                return Ok(());
            }
        };

        let forward_headers = strip_proxy_self_headers(&head, &self.deps.config);
        let range = RangeRequest::parse(head.header("range"));
        let fingerprint = key::fingerprint(&origin_uri, Some(&self.deps.config.custom_cache_id));

        crate::engine::handle_request(
            socket,
            &origin_uri,
            &fingerprint,
            forward_headers,
            range,
            &self.deps.mp4,
            &self.deps.hls,
            client_cancelled,
        )
        .await
    }
}

/// Resolve the origin URI per spec 4.H: absolute `PATH` wins, then an
/// `origin=` query parameter, then `Host` + `X-Forwarded-Proto`.
fn resolve_origin_uri(head: &RequestHead, config: &ProxyConfig) -> Option<String> {
    if head.path.starts_with("http://") || head.path.starts_with("https://") {
        let path = head.path.split('?').next().unwrap_or(&head.path);
        return Some(path.to_string());
    }

    if let Some(query) = head.path.split_once('?').map(|(_, q)| q) {
        for pair in query.split('&') {
            if let Some(value) = pair.strip_prefix("origin=") {
                if let Ok(decoded) = urlencoding::decode(value) {
                    return Some(decoded.into_owned());
                }
            }
        }
    }

    let host = head.header("host")?;
    let proto = head.header("x-forwarded-proto").unwrap_or("http");
    let path = head.path.split('?').next().unwrap_or(&head.path);
    let _ = config;
    Some(format!("{proto}://{host}{path}"))
}

/// Drop headers that describe the proxy itself rather than the origin,
/// so the downstream HTTP client supplies a correct `Host` when it sends
/// the forwarded request.
fn strip_proxy_self_headers(head: &RequestHead, config: &ProxyConfig) -> HashMap<String, String> {
    let proxy_ip = config.ip.to_string();
    let proxy_host_port = format!("{proxy_ip}:{}", config.port);
    head.headers
        .iter()
        .filter(|(name, value)| match name.as_str() {
            "host" => **value != proxy_host_port && **value != proxy_ip,
            "x-forwarded-host" | "x-forwarded-for" => false,
            _ => true,
        })
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn head(path: &str, headers: &[(&str, &str)]) -> RequestHead {
        RequestHead {
            method: "GET".to_string(),
            path: path.to_string(),
            version: "HTTP/1.1".to_string(),
            headers: headers.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
        }
    }

    #[test]
    fn absolute_path_is_used_directly() {
        let h = head("https://host.example/v.mp4", &[]);
        assert_eq!(
            resolve_origin_uri(&h, &ProxyConfig::default()),
            Some("https://host.example/v.mp4".to_string())
        );
    }

    #[test]
    fn origin_query_param_is_decoded() {
        let h = head("/proxy?origin=https%3A%2F%2Fhost.example%2Fv.mp4", &[]);
        assert_eq!(
            resolve_origin_uri(&h, &ProxyConfig::default()),
            Some("https://host.example/v.mp4".to_string())
        );
    }

    #[test]
    fn falls_back_to_host_and_forwarded_proto() {
        let h = head("/v.mp4", &[("host", "host.example"), ("x-forwarded-proto", "https")]);
        assert_eq!(
            resolve_origin_uri(&h, &ProxyConfig::default()),
            Some("https://host.example/v.mp4".to_string())
        );
    }

    #[test]
    fn missing_host_and_no_absolute_path_is_unresolvable() {
        let h = head("/v.mp4", &[]);
        assert!(resolve_origin_uri(&h, &ProxyConfig::default()).is_none());
    }

    #[test]
    fn proxy_self_headers_are_stripped() {
        let config = ProxyConfig::default();
        let proxy_host = format!("{}:{}", config.ip, config.port);
        let h = head(
            "/v.mp4",
            &[
                ("host", proxy_host.as_str()),
                ("x-forwarded-host", "proxy.internal"),
                ("x-forwarded-for", "10.0.0.1"),
                ("range", "bytes=0-99"),
            ],
        );
        let stripped = strip_proxy_self_headers(&h, &config);
        assert!(!stripped.contains_key("host"));
        assert!(!stripped.contains_key("x-forwarded-host"));
        assert!(!stripped.contains_key("x-forwarded-for"));
        assert_eq!(stripped.get("range").map(String::as_str), Some("bytes=0-99"));
    }

    #[test]
    fn non_self_host_header_is_preserved() {
        let config = ProxyConfig::default();
        let h = head("/v.mp4", &[("host", "host.example")]);
        let stripped = strip_proxy_self_headers(&h, &config);
        assert_eq!(stripped.get("host").map(String::as_str), Some("host.example"));
    }
}

//! `mediarelay` — a local HTTP proxy that transparently caches MP4
//! byte-ranges and HLS playlists/segments so repeated or seeked playback
//! is served from a two-tier (memory + disk) cache instead of re-hitting
//! the origin.

pub mod cache;
pub mod config;
pub mod engine;
pub mod error;
pub mod hls;
pub mod key;
pub mod parser;
pub mod pipeline;
pub mod pool;
pub mod registry;
pub mod server;
pub mod task;

pub use config::{ProxyConfig, ProxyConfigBuilder};
pub use engine::Engine;
pub use error::{ProxyError, Result};

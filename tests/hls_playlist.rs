//! HLS playlist rewrite and segment delegation end-to-end (spec §4.G):
//! fetch a master playlist from a mock origin through `Engine::parse`,
//! confirm it comes back with every variant URI rewritten through the
//! proxy, then confirm the descendant's `origin=` URL is itself
//! resolvable.

mod common;

use std::collections::HashMap;

use mediarelay::config::ProxyConfig;
use mediarelay::engine::Engine;

const MASTER_PLAYLIST: &[u8] =
    b"#EXTM3U\n#EXT-X-STREAM-INF:BANDWIDTH=128000\nlow/index.m3u8\n#EXT-X-STREAM-INF:BANDWIDTH=256000\nhigh/index.m3u8\n";

fn test_config() -> ProxyConfig {
    let mut config = ProxyConfig::default();
    config.port = 0;
    config.cache_root_path = Some(std::env::temp_dir().join(format!(
        "mediarelay-hls-test-{}-{:p}",
        std::process::id(),
        &config as *const _
    )));
    config.memory_cache_size = 10_000_000;
    config.storage_cache_size = 10_000_000;
    config
}

#[tokio::test]
async fn master_playlist_variants_are_rewritten_through_the_proxy() {
    let origin = common::spawn(MASTER_PLAYLIST).await;
    let config = test_config();
    let proxy_addr = format!("{}:{}", config.ip, config.port);
    let root = config.resolved_cache_root();
    let engine = Engine::init(config);

    let url = format!("{origin}/master.m3u8");
    let (mut client_side, mut server_side) = tokio::io::duplex(8192);
    let reader = tokio::spawn(async move {
        let mut buf = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut server_side, &mut buf).await.ok();
        buf
    });
    engine.parse(&mut client_side, &url, HashMap::new()).await.expect("parse");
    drop(client_side);
    let raw = reader.await.expect("reader task");
    let text = String::from_utf8_lossy(&raw);

    assert!(text.starts_with("HTTP/1.1 200 OK"));
    assert!(text.contains("application/vnd.apple.mpegurl"));
    assert!(text.contains(&proxy_addr), "rewritten URIs should route back through the proxy: {text}");
    assert!(text.contains(&urlencoding::encode(&format!("{origin}/low/index.m3u8")).to_string()));
    assert!(text.contains(&urlencoding::encode(&format!("{origin}/high/index.m3u8")).to_string()));

    let _ = std::fs::remove_dir_all(&root);
}

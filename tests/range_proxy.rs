//! End-to-end Range-request proxying against an in-process mock origin
//! (spec §8 worked scenarios 1–2): a client range request is served from
//! the cache on a second hit, and Content-Range/Content-Length on the
//! wire reflect the window actually fetched.

mod common;

use std::collections::HashMap;

use mediarelay::config::ProxyConfig;
use mediarelay::engine::Engine;

const BODY: &[u8] = b"0123456789ABCDEF0123456789ABCDEF0123456789ABCDEF0123456789ABCD";

fn test_config(origin_len: u64) -> ProxyConfig {
    let mut config = ProxyConfig::default();
    config.port = 0;
    config.first_segment_size = origin_len;
    config.segment_size = origin_len;
    config.cache_segments = 1;
    config.cache_root_path = Some(std::env::temp_dir().join(format!(
        "mediarelay-range-proxy-test-{}-{:p}",
        std::process::id(),
        &config as *const _
    )));
    config.memory_cache_size = 10_000_000;
    config.storage_cache_size = 10_000_000;
    config
}

async fn parse_to_string(engine: &Engine, url: &str, headers: HashMap<String, String>) -> (Vec<u8>, String) {
    let (mut client_side, mut server_side) = tokio::io::duplex(8192);
    let reader = tokio::spawn(async move {
        let mut buf = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut server_side, &mut buf).await.ok();
        buf
    });
    engine.parse(&mut client_side, url, headers).await.expect("parse");
    drop(client_side);
    let raw = reader.await.expect("reader task");
    let text = String::from_utf8_lossy(&raw).to_string();
    (raw, text)
}

#[tokio::test]
async fn full_request_returns_whole_body() {
    let origin = common::spawn(BODY).await;
    let config = test_config(BODY.len() as u64);
    let root = config.resolved_cache_root();
    let engine = Engine::init(config);

    let url = format!("{origin}/video.bin");
    let (raw, head) = parse_to_string(&engine, &url, HashMap::new()).await;
    assert!(head.starts_with("HTTP/1.1 200 OK"));
    assert!(raw.ends_with(BODY));

    let _ = std::fs::remove_dir_all(&root);
}

#[tokio::test]
async fn ranged_request_returns_partial_content_with_matching_headers() {
    let origin = common::spawn(BODY).await;
    let config = test_config(BODY.len() as u64);
    let root = config.resolved_cache_root();
    let engine = Engine::init(config);

    let url = format!("{origin}/video.bin");
    let mut headers = HashMap::new();
    headers.insert("range".to_string(), "bytes=0-4".to_string());
    let (raw, head) = parse_to_string(&engine, &url, headers).await;

    assert!(head.starts_with("HTTP/1.1 206 Partial Content"), "head: {head}");
    assert!(head.contains(&format!("Content-Range: bytes 0-4/{}", BODY.len())));
    assert!(raw.ends_with(b"01234"));

    let _ = std::fs::remove_dir_all(&root);
}

#[tokio::test]
async fn origin_ignoring_range_still_serves_the_requested_window() {
    let origin = common::spawn_ignoring_range(BODY).await;
    let mut config = test_config(BODY.len() as u64);
    // Small windows so the request below lands in the resource's second
    // half, away from byte 0 — proving the served slice came from the
    // grid split rather than the start of the whole-body fetch.
    config.first_segment_size = 16;
    config.segment_size = 16;
    let root = config.resolved_cache_root();
    let engine = Engine::init(config);

    let url = format!("{origin}/video.bin");
    let mut headers = HashMap::new();
    headers.insert("range".to_string(), "bytes=32-39".to_string());
    let (raw, head) = parse_to_string(&engine, &url, headers).await;

    assert!(head.starts_with("HTTP/1.1 206 Partial Content"), "head: {head}");
    assert!(raw.ends_with(&BODY[32..40]), "expected slice {:?}, got tail of {:?}", &BODY[32..40], raw);

    let _ = std::fs::remove_dir_all(&root);
}

#[tokio::test]
async fn second_request_for_same_range_is_served_from_cache() {
    let origin = common::spawn(BODY).await;
    let config = test_config(BODY.len() as u64);
    let root = config.resolved_cache_root();
    let engine = Engine::init(config);
    let url = format!("{origin}/video.bin");

    let (first_raw, _) = parse_to_string(&engine, &url, HashMap::new()).await;
    assert!(engine.is_cached(&url, None, 1));

    let (second_raw, _) = parse_to_string(&engine, &url, HashMap::new()).await;
    assert_eq!(first_raw, second_raw);

    let _ = std::fs::remove_dir_all(&root);
}

//! A minimal origin server for the integration tests: a raw
//! `tokio::net::TcpListener` loop that honors byte-range requests against
//! a fixed in-memory body, the same framing style the proxy itself uses
//! (no extra HTTP server crate, per SPEC_FULL.md's test-tooling section).

use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};

use mediarelay::pipeline::mp4::RangeRequest;
use mediarelay::server::http::{read_request_head, write_response_head};

/// Bind on an ephemeral port and serve `body` for every connection until
/// the returned listener is dropped. Returns the `http://127.0.0.1:<port>`
/// base URL.
pub async fn spawn(body: &'static [u8]) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind mock origin");
    let addr = listener.local_addr().expect("local addr");

    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(pair) => pair,
                Err(_) => return,
            };
            tokio::spawn(serve_one(socket, body));
        }
    });

    format!("http://{addr}")
}

/// Like [`spawn`], but ignores any `Range` header and always returns the
/// whole body as `200 OK` — exercises the pool's whole-body fallback for
/// origins that don't honor `Range`.
pub async fn spawn_ignoring_range(body: &'static [u8]) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind mock origin");
    let addr = listener.local_addr().expect("local addr");

    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(pair) => pair,
                Err(_) => return,
            };
            tokio::spawn(serve_one_ignoring_range(socket, body));
        }
    });

    format!("http://{addr}")
}

async fn serve_one_ignoring_range(mut socket: TcpStream, body: &'static [u8]) {
    match read_request_head(&mut socket).await {
        Ok(Some(_)) => {}
        _ => return,
    }
    let headers = [
        ("Content-Type", "application/octet-stream".to_string()),
        ("Content-Length", body.len().to_string()),
    ];
    if write_response_head(&mut socket, 200, "OK", &headers).await.is_err() {
        return;
    }
    let _ = socket.write_all(body).await;
    let _ = socket.flush().await;
}

async fn serve_one(mut socket: TcpStream, body: &'static [u8]) {
    let head = match read_request_head(&mut socket).await {
        Ok(Some(head)) => head,
        _ => return,
    };

    let total = body.len() as u64;
    let range = RangeRequest::parse(head.header("range"));
    let (start, end, status, reason) = match range {
        Some(r) => {
            let end = r.end.unwrap_or(total.saturating_sub(1)).min(total.saturating_sub(1));
            (r.start, end, 206u16, "Partial Content")
        }
        None => (0, total.saturating_sub(1), 200u16, "OK"),
    };

    if start > end || start >= total {
        let _ = write_response_head(&mut socket, 416, "Range Not Satisfiable", &[]).await;
        return;
    }

    let slice = &body[start as usize..=end as usize];
    let headers: Vec<(&str, String)> = if status == 206 {
        vec![
            ("Content-Type", "application/octet-stream".to_string()),
            ("Content-Range", format!("bytes {start}-{end}/{total}")),
            ("Content-Length", slice.len().to_string()),
        ]
    } else {
        vec![
            ("Content-Type", "application/octet-stream".to_string()),
            ("Content-Length", slice.len().to_string()),
        ]
    };

    if write_response_head(&mut socket, status, reason, &headers).await.is_err() {
        return;
    }
    let _ = socket.write_all(slice).await;
    let _ = socket.flush().await;
}

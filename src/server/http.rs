//! Minimal byte-oriented HTTP/1.1 request/response framing.
//!
//! Spec §9 "HTTP/1.1 framing" flags the source's `String`-buffered
//! read-until-`\r\n\r\n` approach and asks implementers to prefer
//! byte-oriented framing with an explicit header size limit; this module
//! reads into a `Vec<u8>` and rejects anything over [`MAX_HEADER_BYTES`].

use std::collections::HashMap;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{ProxyError, Result};

pub const MAX_HEADER_BYTES: usize = 16 * 1024;

#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: String,
    pub path: String,
    pub version: String,
    pub headers: HashMap<String, String>,
}

impl RequestHead {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }
}

/// Read a request off `reader` up to and including the terminating
/// `\r\n\r\n`, bounded by [`MAX_HEADER_BYTES`]. Returns `Ok(None)` on a
/// clean EOF before any bytes arrive (idle connection closed).
pub async fn read_request_head<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<RequestHead>> {
    let mut buf = Vec::with_capacity(1024);
    let mut byte = [0u8; 1];

    loop {
        let n = reader.read(&mut byte).await?;
        if n == 0 {
            return if buf.is_empty() {
                Ok(None)
            } else {
                Err(ProxyError::origin_protocol("connection closed mid-request"))
            };
        }
        buf.push(byte[0]);
        if buf.len() > MAX_HEADER_BYTES {
            return Err(ProxyError::origin_protocol("request header block exceeds size limit"));
        }
        if buf.ends_with(b"\r\n\r\n") {
            break;
        }
    }

    let text = String::from_utf8_lossy(&buf);
    parse_request_head(&text).map(Some)
}

fn parse_request_head(text: &str) -> Result<RequestHead> {
    let mut lines = text.split("\r\n");
    let request_line = lines.next().unwrap_or("");
    let mut parts = request_line.split(' ');
    let method = parts.next().unwrap_or("").to_string();
    let path = parts.next().unwrap_or("").to_string();
    let version = parts.next().unwrap_or("HTTP/1.1").to_string();

    if method.is_empty() || path.is_empty() {
        return Err(ProxyError::origin_protocol("empty request header block"));
    }

    let mut headers = HashMap::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_string());
        }
    }

    Ok(RequestHead {
        method,
        path,
        version,
        headers,
    })
}

/// Write a status line plus headers (no body) terminated by the blank
/// line; callers stream the body themselves afterward.
pub async fn write_response_head<W: AsyncWrite + Unpin>(
    writer: &mut W,
    status: u16,
    reason: &str,
    headers: &[(&str, String)],
) -> Result<()> {
    let mut head = format!("HTTP/1.1 {status} {reason}\r\n");
    for (name, value) in headers {
        head.push_str(name);
        head.push_str(": ");
        head.push_str(value);
        head.push_str("\r\n");
    }
    head.push_str("\r\n");
    writer.write_all(head.as_bytes()).await?;
    Ok(())
}

pub async fn write_simple_response<W: AsyncWrite + Unpin>(
    writer: &mut W,
    status: u16,
    reason: &str,
    body: &str,
) -> Result<()> {
    write_response_head(
        writer,
        status,
        reason,
        &[
            ("Content-Type", "text/plain".to_string()),
            ("Content-Length", body.len().to_string()),
            ("Connection", "close".to_string()),
        ],
    )
    .await?;
    writer.write_all(body.as_bytes()).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn parses_request_line_and_headers() {
        let raw = b"GET /v.mp4 HTTP/1.1\r\nHost: example.com\r\nRange: bytes=0-99\r\n\r\n";
        let mut cursor = std::io::Cursor::new(raw.to_vec());
        let head = read_request_head(&mut cursor).await.unwrap().unwrap();
        assert_eq!(head.method, "GET");
        assert_eq!(head.path, "/v.mp4");
        assert_eq!(head.header("host"), Some("example.com"));
        assert_eq!(head.header("range"), Some("bytes=0-99"));
    }

    #[tokio::test]
    async fn empty_connection_yields_none() {
        let mut cursor = std::io::Cursor::new(Vec::<u8>::new());
        assert!(read_request_head(&mut cursor).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn oversized_header_block_is_rejected() {
        let mut raw = b"GET / HTTP/1.1\r\n".to_vec();
        raw.extend(std::iter::repeat(b'a').take(MAX_HEADER_BYTES + 10));
        let mut cursor = std::io::Cursor::new(raw);
        assert!(read_request_head(&mut cursor).await.is_err());
    }

    #[test]
    fn header_lookup_is_case_insensitive() {
        let head = parse_request_head("GET / HTTP/1.1\r\nHOST: example.com\r\n").unwrap();
        assert_eq!(head.header("host"), Some("example.com"));
    }
}

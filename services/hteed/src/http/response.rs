//! Response writing on the raw connection.

use std::io;

use async_trait::async_trait;
use chrono::Utc;
use htee_stream::ByteSink;
use reqwest::header::HeaderMap;
use reqwest::StatusCode;
use tokio::io::{AsyncWrite, AsyncWriteExt};

/// RFC1123 date for response headers, always GMT.
pub fn http_date() -> String {
    Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

/// Interim response on a hijacked record connection.  The Location header
/// tells the writer where readers can attach.
pub async fn write_interim_continue<W: AsyncWrite + Unpin>(
    writer: &mut W,
    location: &str,
) -> io::Result<()> {
    let head = format!("HTTP/1.1 100 Continue\r\nLocation: {location}\r\n\r\n");
    writer.write_all(head.as_bytes()).await?;
    writer.flush().await
}

/// Final response on a hijacked record connection.
pub async fn write_final_no_content<W: AsyncWrite + Unpin>(writer: &mut W) -> io::Result<()> {
    let head = format!(
        "HTTP/1.1 204 No Content\r\nDate: {}\r\nConnection: close\r\n\r\n",
        http_date()
    );
    writer.write_all(head.as_bytes()).await?;
    writer.flush().await
}

/// A one-shot plaintext response; used for errors and DELETE replies.
pub async fn write_simple<W: AsyncWrite + Unpin>(
    writer: &mut W,
    status: u16,
    reason: &str,
    body: &str,
) -> io::Result<()> {
    let mut head = format!(
        "HTTP/1.1 {status} {reason}\r\nDate: {}\r\nConnection: close\r\n",
        http_date()
    );
    if body.is_empty() {
        head.push_str("\r\n");
    } else {
        head.push_str(&format!(
            "Content-Type: text/plain; charset=utf-8\r\nContent-Length: {}\r\n\r\n{body}",
            body.len()
        ));
    }
    writer.write_all(head.as_bytes()).await?;
    writer.flush().await
}

/// Copy an upstream response (status, headers, body) to the client.
pub async fn write_forwarded<W: AsyncWrite + Unpin>(
    writer: &mut W,
    status: StatusCode,
    headers: &HeaderMap,
    body: &[u8],
) -> io::Result<()> {
    let mut head = format!(
        "HTTP/1.1 {} {}\r\n",
        status.as_u16(),
        status.canonical_reason().unwrap_or("Unknown")
    );
    for (name, value) in headers {
        // The body is re-framed by length below.
        let lower = name.as_str();
        if lower == "transfer-encoding" || lower == "content-length" || lower == "connection" {
            continue;
        }
        if let Ok(value) = value.to_str() {
            head.push_str(&format!("{name}: {value}\r\n"));
        }
    }
    head.push_str(&format!(
        "Content-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    ));
    writer.write_all(head.as_bytes()).await?;
    writer.write_all(body).await?;
    writer.flush().await
}

/// Response head for a raw playback: a chunked body follows.
pub async fn write_playback_head<W: AsyncWrite + Unpin>(writer: &mut W) -> io::Result<()> {
    let head = format!(
        "HTTP/1.1 200 OK\r\nDate: {}\r\nTransfer-Encoding: chunked\r\nConnection: close\r\n\r\n",
        http_date()
    );
    writer.write_all(head.as_bytes()).await?;
    writer.flush().await
}

/// Response head for an SSE playback: a close-delimited event body follows.
pub async fn write_sse_head<W: AsyncWrite + Unpin>(writer: &mut W) -> io::Result<()> {
    let head = format!(
        "HTTP/1.1 200 OK\r\nDate: {}\r\nContent-Type: text/event-stream\r\nCache-Control: no-cache\r\nConnection: close\r\n\r\n",
        http_date()
    );
    writer.write_all(head.as_bytes()).await?;
    writer.flush().await
}

/// [`ByteSink`] that frames every chunk in chunked transfer encoding and
/// flushes it immediately.
pub struct ChunkedSink<W> {
    writer: W,
}

impl<W> ChunkedSink<W> {
    pub fn new(writer: W) -> Self {
        ChunkedSink { writer }
    }
}

#[async_trait]
impl<W: AsyncWrite + Send + Unpin> ByteSink for ChunkedSink<W> {
    async fn write_chunk(&mut self, chunk: &[u8]) -> io::Result<()> {
        // A zero-length frame would terminate the body.
        if chunk.is_empty() {
            return Ok(());
        }
        self.writer
            .write_all(format!("{:x}\r\n", chunk.len()).as_bytes())
            .await?;
        self.writer.write_all(chunk).await?;
        self.writer.write_all(b"\r\n").await?;
        self.writer.flush().await
    }

    async fn finish(&mut self) -> io::Result<()> {
        self.writer.write_all(b"0\r\n\r\n").await?;
        self.writer.flush().await
    }
}

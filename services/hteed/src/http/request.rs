//! Request heads on the raw connection.

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use tokio::io::{AsyncBufRead, AsyncBufReadExt};

/// Upper bound on a request head; anything larger is rejected.
const MAX_HEAD_BYTES: usize = 16 * 1024;

/// Parsed request line and headers.  The body, if any, is still on the
/// connection behind it.
#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: String,
    /// Request-target exactly as sent: path plus any query string.
    pub target: String,
    pub headers: HeaderMap,
}

impl RequestHead {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// The target with any query string removed.
    pub fn path(&self) -> &str {
        match self.target.split_once('?') {
            Some((path, _)) => path,
            None => &self.target,
        }
    }

    pub fn is_chunked(&self) -> bool {
        self.header("transfer-encoding")
            .is_some_and(|v| v.split(',').any(|t| t.trim().eq_ignore_ascii_case("chunked")))
    }

    pub fn content_length(&self) -> Option<usize> {
        self.header("content-length")?.trim().parse().ok()
    }

    pub fn wants_sse(&self) -> bool {
        self.header("accept") == Some("text/event-stream")
    }
}

/// Stream name for a request path: the path with its leading slash trimmed.
pub fn stream_name(path: &str) -> &str {
    path.strip_prefix('/').unwrap_or(path)
}

#[derive(Debug, thiserror::Error)]
pub enum HeadError {
    #[error("connection closed before a complete head")]
    ConnectionClosed,
    #[error("request head exceeds {MAX_HEAD_BYTES} bytes")]
    TooLarge,
    #[error("malformed request head: {0}")]
    Malformed(String),
    #[error("reading request head: {0}")]
    Io(#[from] std::io::Error),
}

/// Read one request head off the connection, leaving the body untouched.
pub async fn read_head<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<RequestHead, HeadError> {
    let raw = read_until_blank_line(reader).await?;

    let mut parsed_headers = [httparse::EMPTY_HEADER; 64];
    let mut parsed = httparse::Request::new(&mut parsed_headers);
    match parsed.parse(&raw) {
        Ok(httparse::Status::Complete(_)) => {}
        Ok(httparse::Status::Partial) => {
            return Err(HeadError::Malformed("truncated head".to_owned()))
        }
        Err(e) => return Err(HeadError::Malformed(e.to_string())),
    }

    let method = parsed
        .method
        .ok_or_else(|| HeadError::Malformed("missing method".to_owned()))?
        .to_owned();
    let target = parsed
        .path
        .ok_or_else(|| HeadError::Malformed("missing request target".to_owned()))?
        .to_owned();

    let mut headers = HeaderMap::with_capacity(parsed.headers.len());
    for header in parsed.headers.iter() {
        let name = HeaderName::from_bytes(header.name.as_bytes())
            .map_err(|e| HeadError::Malformed(format!("header name '{}': {e}", header.name)))?;
        let value = HeaderValue::from_bytes(header.value)
            .map_err(|e| HeadError::Malformed(format!("header '{}' value: {e}", header.name)))?;
        headers.append(name, value);
    }

    Ok(RequestHead {
        method,
        target,
        headers,
    })
}

/// Accumulate bytes through the `\r\n\r\n` terminator without consuming any
/// body bytes behind it.
async fn read_until_blank_line<R: AsyncBufRead + Unpin>(
    reader: &mut R,
) -> Result<Vec<u8>, HeadError> {
    let mut head = Vec::new();
    loop {
        let chunk = reader.fill_buf().await?;
        if chunk.is_empty() {
            return Err(HeadError::ConnectionClosed);
        }
        let chunk_len = chunk.len();
        head.extend_from_slice(chunk);

        if let Some(pos) = find_terminator(&head) {
            let head_end = pos + 4;
            let overshoot = head.len() - head_end;
            reader.consume(chunk_len - overshoot);
            head.truncate(head_end);
            return Ok(head);
        }

        reader.consume(chunk_len);
        if head.len() > MAX_HEAD_BYTES {
            return Err(HeadError::TooLarge);
        }
    }
}

fn find_terminator(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|window| window == b"\r\n\r\n")
}

//! htee client: chunked uploads with the interim-response handshake.
//!
//! The tee conversation needs both responses from one `POST`: the interim
//! `100 Continue` (carrying the stream's Location) arrives before the body
//! is sent, and the final `204 No Content` arrives after the body ends on
//! the same connection.  General-purpose HTTP clients consume interim
//! responses internally, so the conversation is spoken directly over a
//! `TcpStream`.
//!
//! # Conversation
//! 1. Connect; send the `POST` head with `Transfer-Encoding: chunked` and
//!    `Expect: 100-continue`
//! 2. Read the interim head; anything but `100` is a rejection
//! 3. Stream the body as chunk frames via [`Upload::send`]
//! 4. [`Upload::finish`] terminates the body and reads the final head

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use url::Url;

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// Connection factory for one htee endpoint.
pub struct Client {
    endpoint: Url,
    token: Option<String>,
}

impl Client {
    pub fn new(endpoint: &str, token: Option<String>) -> Result<Self, ClientError> {
        let endpoint = Url::parse(endpoint)
            .map_err(|e| ClientError::InvalidEndpoint(format!("'{endpoint}': {e}")))?;
        if endpoint.scheme() != "http" {
            return Err(ClientError::InvalidEndpoint(format!(
                "'{endpoint}': only http endpoints are supported"
            )));
        }
        if endpoint.host_str().is_none() {
            return Err(ClientError::InvalidEndpoint(format!(
                "'{endpoint}': missing host"
            )));
        }
        Ok(Client { endpoint, token })
    }

    /// The absolute URL a reader would use for `path`.
    pub fn url_for(&self, path: &str) -> Result<Url, ClientError> {
        self.endpoint
            .join(path)
            .map_err(|e| ClientError::InvalidEndpoint(format!("joining '{path}': {e}")))
    }

    /// Open the record conversation for `path`.
    ///
    /// Returns once the server has accepted the upload with its interim
    /// `100 Continue`; a different interim status is a
    /// [`ClientError::Rejected`].
    pub async fn post(&self, path: &str) -> Result<Upload, ClientError> {
        let host = self
            .endpoint
            .host_str()
            .unwrap_or_default()
            .to_owned();
        let port = self.endpoint.port_or_known_default().unwrap_or(80);

        let stream = TcpStream::connect((host.as_str(), port))
            .await
            .map_err(ClientError::Connect)?;
        let (read_half, mut write_half) = stream.into_split();

        let mut head = format!(
            "POST {path} HTTP/1.1\r\nHost: {host}\r\nTransfer-Encoding: chunked\r\nExpect: 100-continue\r\n"
        );
        if let Some(token) = &self.token {
            head.push_str(&format!("Authorization: Token {token}\r\n"));
        }
        head.push_str("\r\n");
        write_half
            .write_all(head.as_bytes())
            .await
            .map_err(ClientError::Io)?;

        let mut reader = BufReader::new(read_half);
        let interim = read_response_head(&mut reader).await?;
        if interim.status != 100 {
            return Err(ClientError::Rejected(interim));
        }

        Ok(Upload {
            reader,
            writer: write_half,
            interim,
        })
    }
}

// ---------------------------------------------------------------------------
// Upload
// ---------------------------------------------------------------------------

/// An accepted upload: the interim response is in hand and the connection
/// is waiting for body chunks.
pub struct Upload {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    interim: ResponseHead,
}

impl Upload {
    /// The interim `100 Continue` response.
    pub fn interim(&self) -> &ResponseHead {
        &self.interim
    }

    /// Where readers can attach, as announced by the server.
    pub fn location(&self) -> Option<&str> {
        self.interim.header("location")
    }

    /// Send one chunk of body bytes.  Empty chunks are skipped: a
    /// zero-length frame would terminate the body.
    pub async fn send(&mut self, chunk: &[u8]) -> Result<(), ClientError> {
        if chunk.is_empty() {
            return Ok(());
        }
        self.writer
            .write_all(format!("{:x}\r\n", chunk.len()).as_bytes())
            .await
            .map_err(ClientError::Io)?;
        self.writer.write_all(chunk).await.map_err(ClientError::Io)?;
        self.writer
            .write_all(b"\r\n")
            .await
            .map_err(ClientError::Io)?;
        Ok(())
    }

    /// Terminate the body and read the final response from the same
    /// connection.  The server answers `204 No Content` on success;
    /// anything else is handed back for the caller to judge.
    pub async fn finish(mut self) -> Result<ResponseHead, ClientError> {
        self.writer
            .write_all(b"0\r\n\r\n")
            .await
            .map_err(ClientError::Io)?;
        read_response_head(&mut self.reader).await
    }
}

// ---------------------------------------------------------------------------
// Response heads
// ---------------------------------------------------------------------------

/// Status line and headers of one server response.
#[derive(Debug, Clone)]
pub struct ResponseHead {
    pub status: u16,
    pub reason: String,
    pub headers: Vec<(String, String)>,
}

impl ResponseHead {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn status_line(&self) -> String {
        format!("{} {}", self.status, self.reason)
    }
}

const MAX_HEAD_BYTES: usize = 16 * 1024;

async fn read_response_head<R: AsyncBufRead + Unpin>(
    reader: &mut R,
) -> Result<ResponseHead, ClientError> {
    let mut raw = Vec::new();
    loop {
        let chunk = reader.fill_buf().await.map_err(ClientError::Io)?;
        if chunk.is_empty() {
            return Err(ClientError::Malformed(
                "connection closed before a complete response head".to_owned(),
            ));
        }
        let chunk_len = chunk.len();
        raw.extend_from_slice(chunk);

        if let Some(pos) = raw.windows(4).position(|w| w == b"\r\n\r\n") {
            let head_end = pos + 4;
            let overshoot = raw.len() - head_end;
            reader.consume(chunk_len - overshoot);
            raw.truncate(head_end);
            break;
        }

        reader.consume(chunk_len);
        if raw.len() > MAX_HEAD_BYTES {
            return Err(ClientError::Malformed("oversized response head".to_owned()));
        }
    }

    let mut parsed_headers = [httparse::EMPTY_HEADER; 64];
    let mut parsed = httparse::Response::new(&mut parsed_headers);
    match parsed.parse(&raw) {
        Ok(httparse::Status::Complete(_)) => {}
        Ok(httparse::Status::Partial) => {
            return Err(ClientError::Malformed("truncated response head".to_owned()))
        }
        Err(e) => return Err(ClientError::Malformed(e.to_string())),
    }

    let status = parsed
        .code
        .ok_or_else(|| ClientError::Malformed("missing status code".to_owned()))?;
    let reason = parsed.reason.unwrap_or_default().to_owned();
    let mut headers = Vec::with_capacity(parsed.headers.len());
    for header in parsed.headers.iter() {
        let value = String::from_utf8_lossy(header.value).into_owned();
        headers.push((header.name.to_owned(), value));
    }

    Ok(ResponseHead {
        status,
        reason,
        headers,
    })
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("invalid endpoint {0}")]
    InvalidEndpoint(String),
    #[error("connecting: {0}")]
    Connect(std::io::Error),
    #[error("{0}")]
    Io(std::io::Error),
    #[error("malformed response: {0}")]
    Malformed(String),
    #[error("server rejected upload: {}", .0.status_line())]
    Rejected(ResponseHead),
}

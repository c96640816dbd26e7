//! Server-Sent Events re-framing for playback.
//!
//! Each byte slice leaving the engine becomes one or more `data:` events
//! whose payload is a JSON string, so newlines, control bytes, and
//! non-ASCII UTF-8 all embed safely.  Events are flushed as they are
//! written, and a clean close emits a terminal `event:eof`.

use async_trait::async_trait;
use htee_stream::ByteSink;
use std::io;
use tokio::io::{AsyncWrite, AsyncWriteExt};

/// Payload cap per event.  Larger engine chunks are split at this boundary.
const MAX_EVENT_BYTES: usize = 4096;

/// [`ByteSink`] that writes SSE events straight to the connection.
pub struct SseSink<W> {
    writer: W,
}

impl<W> SseSink<W> {
    pub fn new(writer: W) -> Self {
        SseSink { writer }
    }
}

#[async_trait]
impl<W: AsyncWrite + Send + Unpin> ByteSink for SseSink<W> {
    async fn write_chunk(&mut self, chunk: &[u8]) -> io::Result<()> {
        for part in chunk.chunks(MAX_EVENT_BYTES) {
            let mut event = String::with_capacity(part.len() + 16);
            event.push_str("data:");
            json_quote(&String::from_utf8_lossy(part), &mut event);
            event.push_str("\n\n");
            self.writer.write_all(event.as_bytes()).await?;
        }
        self.writer.flush().await
    }

    async fn finish(&mut self) -> io::Result<()> {
        self.writer.write_all(b"event:eof\ndata:\n\n").await?;
        self.writer.flush().await
    }
}

/// JSON-string-quote `input` into `out`.
///
/// Newline and carriage return use their two-character escapes; every other
/// control byte takes the `\u00XX` form (a tab becomes `\u0009`, which is
/// what historic readers of this wire format expect).
fn json_quote(input: &str, out: &mut String) {
    out.push('"');
    for c in input.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            c if (c as u32) < 0x20 => {
                out.push_str(&format!("\\u{:04x}", c as u32));
            }
            c => out.push(c),
        }
    }
    out.push('"');
}

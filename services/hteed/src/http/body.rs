//! Request body readers.
//!
//! A chunked upload is decoded incrementally so the record engine sees
//! payload bytes as they arrive; a truncated chunk surfaces as
//! `UnexpectedEof`, which the engine treats as the upload ending.

use std::io;

use async_stream::try_stream;
use bytes::Bytes;
use futures_core::Stream;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};
use tokio_util::io::StreamReader;

use htee_stream::ByteSource;

/// Decode a `Transfer-Encoding: chunked` body into a plain byte source.
/// Chunk extensions and trailers are accepted and discarded.
pub fn chunked_reader<R>(reader: R) -> ByteSource
where
    R: AsyncBufRead + Send + Unpin + 'static,
{
    Box::new(StreamReader::new(Box::pin(chunked_stream(reader))))
}

fn chunked_stream<R>(reader: R) -> impl Stream<Item = io::Result<Bytes>>
where
    R: AsyncBufRead + Send + Unpin + 'static,
{
    try_stream! {
        let mut reader = reader;
        loop {
            let size = read_chunk_size(&mut reader).await?;
            if size == 0 {
                discard_trailers(&mut reader).await?;
                break;
            }
            let mut data = vec![0u8; size];
            reader.read_exact(&mut data).await?;
            read_chunk_terminator(&mut reader).await?;
            yield Bytes::from(data);
        }
    }
}

async fn read_chunk_size<R: AsyncBufRead + Unpin>(reader: &mut R) -> io::Result<usize> {
    let line = read_line(reader).await?;
    let size_text = line
        .split(';')
        .next()
        .unwrap_or_default()
        .trim();
    usize::from_str_radix(size_text, 16).map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("invalid chunk size line: '{line}'"),
        )
    })
}

async fn read_chunk_terminator<R: AsyncBufRead + Unpin>(reader: &mut R) -> io::Result<()> {
    let mut crlf = [0u8; 2];
    reader.read_exact(&mut crlf).await?;
    if crlf == *b"\r\n" {
        Ok(())
    } else {
        Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "chunk data not followed by CRLF",
        ))
    }
}

/// Consume trailer lines after the final chunk, through the blank line.
async fn discard_trailers<R: AsyncBufRead + Unpin>(reader: &mut R) -> io::Result<()> {
    loop {
        let line = read_line(reader).await?;
        if line.is_empty() {
            return Ok(());
        }
    }
}

/// One CRLF-terminated line, without the terminator.  EOF before the
/// newline is an `UnexpectedEof`.
async fn read_line<R: AsyncBufRead + Unpin>(reader: &mut R) -> io::Result<String> {
    let mut raw = Vec::new();
    let n = reader.read_until(b'\n', &mut raw).await?;
    if n == 0 || raw.last() != Some(&b'\n') {
        return Err(io::ErrorKind::UnexpectedEof.into());
    }
    raw.pop();
    if raw.last() == Some(&b'\r') {
        raw.pop();
    }
    String::from_utf8(raw)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "non-ASCII chunk framing"))
}

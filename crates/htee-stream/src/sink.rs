//! Byte sinks: where playback output goes.

use async_trait::async_trait;
use std::io;

/// Destination for playback bytes.
///
/// `write_chunk` must leave the bytes flushed before returning: readers
/// follow a live stream, so buffering a chunk would stall them.  An empty
/// chunk is a valid call and sinks may treat it as a no-op.
#[async_trait]
pub trait ByteSink: Send {
    async fn write_chunk(&mut self, chunk: &[u8]) -> io::Result<()>;

    /// Terminal marker, called once after a clean close.
    async fn finish(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Swallows everything.  Used when a denied request still drives the
/// engine with its output discarded.
pub struct DiscardSink;

#[async_trait]
impl ByteSink for DiscardSink {
    async fn write_chunk(&mut self, _chunk: &[u8]) -> io::Result<()> {
        Ok(())
    }
}

#[async_trait]
impl ByteSink for Vec<u8> {
    async fn write_chunk(&mut self, chunk: &[u8]) -> io::Result<()> {
        self.extend_from_slice(chunk);
        Ok(())
    }
}

//! Stream store: the persistent append-only byte log behind every stream.
//!
//! A stream named `name` owns three store entries, keyed by a configurable
//! prefix:
//! - `state:<name>`: one byte, [`StreamState`]; a missing key reads Closed.
//! - `data:<name>`:  every byte appended to the stream so far.
//! - `<name>`:       a pub/sub channel carrying [`Frame`]s.
//!
//! Writers go through [`StreamStore::append`], which persists the chunk and
//! publishes it in one atomic step.  Readers call [`StreamStore::snapshot`],
//! which returns the stored prefix together with a live subscription that
//! picks up exactly where the prefix ends, with no gap and no duplicate.
//!
//! Two backends: [`RedisStore`] for production, [`MemoryStore`] for tests
//! and as proof that any store with an atomic read-then-subscribe primitive
//! can stand in.

pub mod memory;
pub mod redis;

pub use self::memory::MemoryStore;
pub use self::redis::RedisStore;

use async_trait::async_trait;
use bytes::Bytes;

/// Stream lifecycle flag stored under `state:<name>`.
///
/// Closed is the zero value: a missing state key reads as Closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum StreamState {
    Closed = 0,
    Opened = 1,
}

/// First byte of a snapshot fence frame.  Fences never leave the store
/// layer; see the redis backend for how they anchor a snapshot's read-point.
pub(crate) const FENCE_BYTE: u8 = 2;

/// One notification on a stream's pub/sub channel.
///
/// Wire form is `[state_byte, payload...]`: an Opened byte followed by the
/// appended chunk, or a lone Closed byte.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Data(Bytes),
    Closed,
}

pub(crate) fn encode_data_frame(chunk: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(1 + chunk.len());
    frame.push(StreamState::Opened as u8);
    frame.extend_from_slice(chunk);
    frame
}

pub(crate) fn encode_closed_frame() -> Vec<u8> {
    vec![StreamState::Closed as u8]
}

/// Errors from store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Pool, network, or timeout failure talking to the store.
    #[error("store unavailable: {0}")]
    Transient(String),
    /// The store answered with something outside the protocol.
    #[error("store protocol violation: {0}")]
    Protocol(String),
    /// `reset` called on a store that was not built in test mode.
    #[error("reset is only available in test mode")]
    ResetDisabled,
}

/// A live feed of the frames published after a snapshot's read-point.
///
/// Frames arrive in publish order; [`Frame::Closed`] is terminal.  Dropping
/// the subscription releases its store connection.
#[async_trait]
pub trait Subscription: Send {
    async fn next(&mut self) -> Result<Frame, StoreError>;
}

/// The stored prefix of a stream plus a subscription to future appends.
pub struct Snapshot {
    pub state: StreamState,
    pub prefix: Bytes,
    pub subscription: Box<dyn Subscription>,
}

/// Backend-agnostic stream storage.
#[async_trait]
pub trait StreamStore: Send + Sync {
    /// Mark the stream Opened before its first append, so readers that
    /// attach ahead of the writer's first byte wait for it instead of
    /// reading end-of-stream.  Nothing is published.
    async fn open(&self, name: &str) -> Result<(), StoreError>;

    /// Atomically mark the stream Opened, append `chunk` to its log, and
    /// publish the chunk to subscribers.
    ///
    /// No writer lock is taken: two writers appending to one name
    /// interleave with overwrite-append semantics.
    async fn append(&self, name: &str, chunk: &[u8]) -> Result<(), StoreError>;

    /// Atomically mark the stream Closed and publish the terminal frame.
    async fn close(&self, name: &str) -> Result<(), StoreError>;

    /// Remove the stream's state and data and publish the terminal frame so
    /// every live reader stops.
    async fn delete(&self, name: &str) -> Result<(), StoreError>;

    /// Atomically read the stream's state and stored bytes and subscribe to
    /// future appends.
    ///
    /// Publishes sequenced before the snapshot's read-point are folded into
    /// the returned prefix; publishes after it are delivered by the
    /// subscription, each exactly once.
    async fn snapshot(&self, name: &str) -> Result<Snapshot, StoreError>;

    /// Liveness probe.
    async fn ping(&self) -> Result<(), StoreError>;

    /// Delete every key under the configured prefix.  Test mode only.
    async fn reset(&self) -> Result<(), StoreError>;
}

/// Key schema shared by the backends.
#[derive(Debug, Clone)]
pub(crate) struct Keys {
    prefix: String,
}

impl Keys {
    pub(crate) fn new(prefix: &str) -> Self {
        Keys {
            prefix: prefix.to_owned(),
        }
    }

    pub(crate) fn prefix(&self) -> &str {
        &self.prefix
    }

    pub(crate) fn state(&self, name: &str) -> String {
        format!("{}state:{}", self.prefix, name)
    }

    pub(crate) fn data(&self, name: &str) -> String {
        format!("{}data:{}", self.prefix, name)
    }

    pub(crate) fn channel(&self, name: &str) -> String {
        format!("{}{}", self.prefix, name)
    }
}

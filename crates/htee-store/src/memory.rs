//! In-memory store backend.
//!
//! One mutex guards the whole keyspace, so a snapshot reads the stored
//! prefix and registers its subscriber in a single critical section: the
//! atomic read-then-subscribe primitive the engine relies on.  Subscribers
//! get their own unbounded channel; a slow or dropped reader never affects
//! the writer or the other readers.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::{Frame, Snapshot, StoreError, StreamState, StreamStore, Subscription};

#[derive(Default)]
struct StreamEntry {
    state: Option<StreamState>,
    data: Vec<u8>,
    subscribers: Vec<mpsc::UnboundedSender<Frame>>,
}

impl StreamEntry {
    fn publish(&mut self, frame: &Frame) {
        self.subscribers
            .retain(|tx| tx.send(frame.clone()).is_ok());
    }
}

/// Mutex-guarded map of streams.
pub struct MemoryStore {
    streams: Mutex<HashMap<String, StreamEntry>>,
    test_mode: bool,
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore {
            streams: Mutex::new(HashMap::new()),
            test_mode: false,
        }
    }

    /// A store whose `reset` is enabled.
    pub fn for_testing() -> Self {
        MemoryStore {
            streams: Mutex::new(HashMap::new()),
            test_mode: true,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, StreamEntry>> {
        self.streams
            .lock()
            .expect("stream keyspace mutex poisoned")
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StreamStore for MemoryStore {
    async fn open(&self, name: &str) -> Result<(), StoreError> {
        let mut streams = self.lock();
        let entry = streams.entry(name.to_owned()).or_default();
        entry.state = Some(StreamState::Opened);
        Ok(())
    }

    async fn append(&self, name: &str, chunk: &[u8]) -> Result<(), StoreError> {
        let mut streams = self.lock();
        let entry = streams.entry(name.to_owned()).or_default();
        entry.state = Some(StreamState::Opened);
        entry.data.extend_from_slice(chunk);
        entry.publish(&Frame::Data(Bytes::copy_from_slice(chunk)));
        Ok(())
    }

    async fn close(&self, name: &str) -> Result<(), StoreError> {
        let mut streams = self.lock();
        let entry = streams.entry(name.to_owned()).or_default();
        entry.state = Some(StreamState::Closed);
        entry.publish(&Frame::Closed);
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<(), StoreError> {
        let mut streams = self.lock();
        if let Some(mut entry) = streams.remove(name) {
            entry.publish(&Frame::Closed);
        }
        Ok(())
    }

    async fn snapshot(&self, name: &str) -> Result<Snapshot, StoreError> {
        let mut streams = self.lock();
        let entry = streams.entry(name.to_owned()).or_default();
        let (tx, rx) = mpsc::unbounded_channel();
        entry.subscribers.push(tx);
        Ok(Snapshot {
            state: entry.state.unwrap_or(StreamState::Closed),
            prefix: Bytes::copy_from_slice(&entry.data),
            subscription: Box::new(MemorySubscription { rx }),
        })
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn reset(&self) -> Result<(), StoreError> {
        if !self.test_mode {
            return Err(StoreError::ResetDisabled);
        }
        self.lock().clear();
        Ok(())
    }
}

struct MemorySubscription {
    rx: mpsc::UnboundedReceiver<Frame>,
}

#[async_trait]
impl Subscription for MemorySubscription {
    async fn next(&mut self) -> Result<Frame, StoreError> {
        match self.rx.recv().await {
            Some(frame) => Ok(frame),
            None => Err(StoreError::Protocol(
                "subscription channel dropped without a terminal frame".to_owned(),
            )),
        }
    }
}

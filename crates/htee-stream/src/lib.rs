//! Stream engine: the record and playback state machines.
//!
//! A [`StreamHandle`] is either recording (draining an HTTP request body
//! into the store) or playing (copying the stored prefix plus live appends
//! out to a sink).  Both directions share one lifecycle: an idempotent
//! [`StreamHandle::cancel`], an awaitable [`StreamHandle::done`], and an
//! error read after completion.  Record and playback never share in-memory
//! state; they coordinate only through the store, so any number of
//! playbacks can run against one recording without a lock on the keyspace.

mod playback;
mod record;
mod sink;

pub use sink::{ByteSink, DiscardSink};

use std::sync::Arc;

use htee_store::{StoreError, StreamStore};
use tokio::io::AsyncRead;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Fixed read-buffer size for record drains.  The wire protocol was built
/// around 4 KiB chunks and the SSE re-framer caps events at the same size.
pub const CHUNK_SIZE: usize = 4096;

/// Errors recorded on a handle.  Cancellation is not an error: a handle
/// cancelled by peer disconnect completes with no error at all.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("reading stream source: {0}")]
    SourceRead(std::io::Error),
    #[error("writing stream sink: {0}")]
    SinkWrite(std::io::Error),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Which direction a handle moves bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleKind {
    Recording,
    Playing,
}

/// The byte producer a recording drains, typically an HTTP request body.
pub type ByteSource = Box<dyn AsyncRead + Send + Unpin>;

/// A running record or playback.
pub struct StreamHandle {
    name: String,
    kind: HandleKind,
    cancel: CancellationToken,
    done: oneshot::Receiver<Option<EngineError>>,
}

impl StreamHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> HandleKind {
        self.kind
    }

    /// The token that cancels this handle.  Wire peer-disconnect signals
    /// here; cancelling is safe from any task, any number of times.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Request early termination.  Idempotent.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Wait for the handle to finish and take its error, if any.
    pub async fn done(self) -> Option<EngineError> {
        match self.done.await {
            Ok(err) => err,
            // The engine task can only vanish without reporting if the
            // runtime is shutting down underneath it.
            Err(_) => Some(EngineError::Store(StoreError::Protocol(
                "engine task ended without completing".to_owned(),
            ))),
        }
    }
}

fn spawn_handle<F>(name: &str, kind: HandleKind, cancel: CancellationToken, task: F) -> StreamHandle
where
    F: std::future::Future<Output = Option<EngineError>> + Send + 'static,
{
    let (tx, rx) = oneshot::channel();
    let task_name = name.to_owned();
    tokio::spawn(async move {
        let err = task.await;
        debug!(name = %task_name, ?kind, error = err.is_some(), "stream handle completed");
        let _ = tx.send(err);
    });
    StreamHandle {
        name: name.to_owned(),
        kind,
        cancel,
        done: rx,
    }
}

/// Start recording `source` into the named stream.
///
/// The stream is marked Opened before this returns, so readers that attach
/// ahead of the first byte wait for it.  The handle completes when the
/// source reaches end-of-file (the stream is then atomically closed), when
/// the source or store errors, or when it is cancelled.
pub async fn record(
    store: Arc<dyn StreamStore>,
    name: &str,
    source: ByteSource,
) -> Result<StreamHandle, EngineError> {
    store.open(name).await?;

    let cancel = CancellationToken::new();
    let task_cancel = cancel.clone();
    let task_name = name.to_owned();
    Ok(spawn_handle(name, HandleKind::Recording, cancel, async move {
        record::run(store, &task_name, source, task_cancel).await
    }))
}

/// Start playing the named stream into `sink`.
///
/// The handle completes when the stream closes, when the sink or store
/// errors, or when it is cancelled.
pub fn play(store: Arc<dyn StreamStore>, name: &str, sink: Box<dyn ByteSink>) -> StreamHandle {
    let cancel = CancellationToken::new();
    let task_cancel = cancel.clone();
    let task_name = name.to_owned();
    spawn_handle(name, HandleKind::Playing, cancel, async move {
        playback::run(store, &task_name, sink, task_cancel).await
    })
}

/// Remove the named stream and wake every live reader.
pub async fn delete(store: &dyn StreamStore, name: &str) -> Result<(), EngineError> {
    store.delete(name).await.map_err(EngineError::from)
}

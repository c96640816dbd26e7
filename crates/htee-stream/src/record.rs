//! Record: drain a byte source into the store.
//!
//! A spawned drainer reads fixed-size buffers from the source into a small
//! channel; the main loop selects between cancellation and drained items,
//! so a stalled source can always be abandoned.  End-of-file (including an
//! unexpected one mid-chunk, which is how an aborted chunked upload
//! surfaces) is the normal end of a recording and closes the stream.  Any
//! other error completes the handle without touching the stored state;
//! the key stays `Opened` until an explicit DELETE clears it.

use std::io;
use std::sync::Arc;

use htee_store::StreamStore;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::{ByteSource, EngineError, CHUNK_SIZE};

pub(crate) async fn run(
    store: Arc<dyn StreamStore>,
    name: &str,
    source: ByteSource,
    cancel: CancellationToken,
) -> Option<EngineError> {
    let (tx, mut rx) = mpsc::channel::<io::Result<Vec<u8>>>(1);
    let drainer = tokio::spawn(drain(source, tx));

    let result = loop {
        tokio::select! {
            () = cancel.cancelled() => break None,
            item = rx.recv() => match item {
                // Drainer reached end-of-file: the upload is complete.
                None => break close(store.as_ref(), name).await,
                Some(Ok(chunk)) => {
                    if chunk.is_empty() {
                        continue;
                    }
                    if let Err(e) = store.append(name, &chunk).await {
                        break Some(EngineError::Store(e));
                    }
                }
                Some(Err(e)) if e.kind() == io::ErrorKind::UnexpectedEof => {
                    break close(store.as_ref(), name).await;
                }
                Some(Err(e)) => break Some(EngineError::SourceRead(e)),
            }
        }
    };

    drainer.abort();
    result
}

async fn close(store: &dyn StreamStore, name: &str) -> Option<EngineError> {
    store.close(name).await.err().map(EngineError::Store)
}

async fn drain(mut source: ByteSource, tx: mpsc::Sender<io::Result<Vec<u8>>>) {
    loop {
        let mut buf = vec![0u8; CHUNK_SIZE];
        match source.read(&mut buf).await {
            // Closing the channel is the EOF signal.
            Ok(0) => return,
            Ok(n) => {
                buf.truncate(n);
                if tx.send(Ok(buf)).await.is_err() {
                    return;
                }
            }
            Err(e) => {
                let _ = tx.send(Err(e)).await;
                return;
            }
        }
    }
}

//! Playback: copy a stream's stored prefix and live appends into a sink.
//!
//! The snapshot hands back the prefix and the subscription from one atomic
//! read-point, so the bytes a reader sees are always a prefix of the
//! writer's input; catch-up and live frames meet with no gap and no
//! duplicate.  A stream that is already Closed skips the live loop; the
//! write of the (possibly empty) prefix still happens so every reader takes
//! the same path.

use std::sync::Arc;

use htee_store::{Frame, StreamState, StreamStore};
use tokio_util::sync::CancellationToken;

use crate::{ByteSink, EngineError};

pub(crate) async fn run(
    store: Arc<dyn StreamStore>,
    name: &str,
    mut sink: Box<dyn ByteSink>,
    cancel: CancellationToken,
) -> Option<EngineError> {
    let snapshot = tokio::select! {
        () = cancel.cancelled() => return None,
        snap = store.snapshot(name) => match snap {
            Ok(snap) => snap,
            Err(e) => return Some(EngineError::Store(e)),
        },
    };

    if let Err(e) = sink.write_chunk(&snapshot.prefix).await {
        return Some(EngineError::SinkWrite(e));
    }

    let mut subscription = snapshot.subscription;
    if snapshot.state == StreamState::Opened {
        loop {
            let frame = tokio::select! {
                // Dropping out of here drops the subscription, which
                // releases its store connection mid-receive.
                () = cancel.cancelled() => return None,
                frame = subscription.next() => match frame {
                    Ok(frame) => frame,
                    Err(e) => return Some(EngineError::Store(e)),
                },
            };
            match frame {
                Frame::Data(chunk) => {
                    if let Err(e) = sink.write_chunk(&chunk).await {
                        return Some(EngineError::SinkWrite(e));
                    }
                }
                Frame::Closed => break,
            }
        }
    }

    sink.finish().await.err().map(EngineError::SinkWrite)
}

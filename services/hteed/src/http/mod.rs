//! HTTP front-end: the accept loop and the per-connection conversation.
//!
//! Routing is by method on any path: `GET` plays a stream back, `POST`
//! records one, `DELETE` removes one.  The record path needs two
//! protocol-level responses on a single connection (the interim
//! `100 Continue` carrying the Location, then the final `204` once the
//! body ends), so the front-end owns the raw socket instead of sitting
//! behind an HTTP framework.
//!
//! Every request is run past the authorization upstream before it reaches
//! the engine; see [`crate::proxy`] for the verdicts.

pub mod body;
pub mod request;
pub mod response;

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use htee_stream::{ByteSink, ByteSource, DiscardSink};
use reqwest::header::{HeaderName, HeaderValue};
use tokio::io::{AsyncReadExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

use crate::proxy::{rails_method_override, ProxyError, Rewrite, Verdict};
use crate::sse::SseSink;
use crate::{ServerError, Services};
use request::{stream_name, RequestHead};

type ConnReader = BufReader<OwnedReadHalf>;

/// The daemon's listener.  Bind, then `run` the accept loop; every
/// connection is served on its own task.
pub struct Server {
    listener: TcpListener,
    services: Arc<Services>,
}

impl Server {
    /// Bind on `addr` (use port 0 to let the OS choose).
    pub async fn bind(addr: &str, services: Arc<Services>) -> Result<Self, ServerError> {
        let listener = TcpListener::bind(addr).await.map_err(|e| ServerError::Bind {
            addr: addr.to_owned(),
            source: e,
        })?;
        Ok(Server { listener, services })
    }

    /// Return the bound local address (useful when port 0 was used).
    pub fn local_addr(&self) -> SocketAddr {
        self.listener
            .local_addr()
            .expect("local_addr always succeeds after bind")
    }

    /// Run the accept loop.  Consumes `self`; runs until the process exits.
    pub async fn run(self) {
        loop {
            match self.listener.accept().await {
                Ok((stream, peer)) => {
                    let services = self.services.clone();
                    tokio::spawn(handle_connection(stream, peer, services));
                }
                Err(e) => warn!(error = %e, "accept failed"),
            }
        }
    }
}

/// One buffered request, ready for dispatch.  `buffered` holds the body of
/// non-chunked requests (and rewrite-injected bodies); a chunked body is
/// still live on `reader`.
struct PendingRequest {
    head: RequestHead,
    method: String,
    buffered: Option<Bytes>,
    reader: ConnReader,
}

impl PendingRequest {
    fn into_source(self) -> ByteSource {
        match self.buffered {
            Some(body) => Box::new(std::io::Cursor::new(body.to_vec())),
            None => body::chunked_reader(self.reader),
        }
    }
}

async fn handle_connection(stream: TcpStream, peer: SocketAddr, services: Arc<Services>) {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    let head = match request::read_head(&mut reader).await {
        Ok(head) => head,
        Err(e) => {
            debug!(%peer, error = %e, "unreadable request head");
            let _ = response::write_simple(&mut write_half, 400, "Bad Request", &e.to_string())
                .await;
            return;
        }
    };

    // Non-chunked bodies are buffered up front so the upstream mirror and
    // the handler see the same bytes.
    let buffered: Option<Bytes> = if head.is_chunked() {
        None
    } else {
        let len = head.content_length().unwrap_or(0);
        let mut data = vec![0u8; len];
        if len > 0 {
            if let Err(e) = reader.read_exact(&mut data).await {
                debug!(%peer, error = %e, "short request body");
                let _ = response::write_simple(
                    &mut write_half,
                    400,
                    "Bad Request",
                    "short request body",
                )
                .await;
                return;
            }
        }
        Some(Bytes::from(data))
    };

    let mut method = head.method.clone();
    if let Some(tunneled) = rails_method_override(&method, &head, buffered.as_deref()) {
        debug!(%peer, from = %head.method, to = %tunneled, "rails verb fix applied");
        method = tunneled;
    }

    let verdict = match services
        .proxy
        .authorize(&method, &head, buffered.clone(), peer.ip())
        .await
    {
        Ok(verdict) => verdict,
        Err(e) => {
            error!(%peer, error = %e, "upstream authorization failed");
            let _ = response::write_simple(
                &mut write_half,
                500,
                "Internal Server Error",
                &e.to_string(),
            )
            .await;
            return;
        }
    };

    let mut pending = PendingRequest {
        head,
        method,
        buffered,
        reader,
    };

    match verdict {
        Verdict::Allow => dispatch(pending, write_half, &services, peer).await,
        Verdict::Rewrite(rewrite) => {
            if let Err(e) = apply_rewrite(&mut pending, rewrite) {
                warn!(%peer, error = %e, "bad rewrite from upstream");
                let _ = response::write_simple(
                    &mut write_half,
                    500,
                    "Internal Server Error",
                    &e.to_string(),
                )
                .await;
                return;
            }
            dispatch(pending, write_half, &services, peer).await;
        }
        Verdict::Forward(forward) => {
            debug!(%peer, status = %forward.status, "forwarding upstream response");
            if response::write_forwarded(
                &mut write_half,
                forward.status,
                &forward.headers,
                &forward.body,
            )
            .await
            .is_err()
            {
                return;
            }
            if forward.downstream_continue {
                run_discarded(pending, &services, peer).await;
            }
        }
    }
}

/// Apply the non-empty fields of a `202` rewrite to the pending request.
fn apply_rewrite(pending: &mut PendingRequest, rewrite: Rewrite) -> Result<(), ProxyError> {
    if !rewrite.method.is_empty() {
        pending.method = rewrite.method;
    }
    if !rewrite.path.is_empty() {
        pending.head.target = rewrite.path;
    }
    for (name, value) in rewrite.headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| ProxyError::RewriteParse(format!("header name '{name}': {e}")))?;
        let value = HeaderValue::from_str(&value)
            .map_err(|e| ProxyError::RewriteParse(format!("header '{name}' value: {e}")))?;
        pending.head.headers.insert(name, value);
    }
    if !rewrite.body.is_empty() {
        pending.buffered = Some(Bytes::from(rewrite.body));
    }
    Ok(())
}

async fn dispatch(
    pending: PendingRequest,
    mut write_half: OwnedWriteHalf,
    services: &Arc<Services>,
    peer: SocketAddr,
) {
    match pending.method.as_str() {
        "GET" => play_stream(pending, write_half, services, peer).await,
        "POST" => record_stream(pending, write_half, services, peer).await,
        "DELETE" => delete_stream(pending, write_half, services, peer).await,
        other => {
            debug!(%peer, method = other, "unsupported method");
            let _ =
                response::write_simple(&mut write_half, 405, "Method Not Allowed", "").await;
        }
    }
}

/// The hijacked record conversation: interim `100 Continue` with the
/// Location, drain the body through the engine, then the final `204` (or a
/// `500` on engine error) on the same connection.
async fn record_stream(
    pending: PendingRequest,
    mut write_half: OwnedWriteHalf,
    services: &Arc<Services>,
    peer: SocketAddr,
) {
    let path = pending.head.path().to_owned();
    let name = stream_name(&path).to_owned();

    // Open the stream before the interim goes out, so a reader chasing the
    // Location never observes it still closed.
    let handle =
        match htee_stream::record(services.store.clone(), &name, pending.into_source()).await {
            Ok(handle) => handle,
            Err(e) => {
                warn!(%peer, name, error = %e, "record setup failed");
                let _ = response::write_simple(
                    &mut write_half,
                    500,
                    "Internal Server Error",
                    &e.to_string(),
                )
                .await;
                return;
            }
        };

    if let Err(e) = response::write_interim_continue(&mut write_half, &path).await {
        debug!(%peer, name, error = %e, "interim response failed");
        handle.cancel();
        return;
    }

    match handle.done().await {
        None => {
            info!(%peer, name, "recorded stream");
            let _ = response::write_final_no_content(&mut write_half).await;
            let services = services.clone();
            let closed_name = name;
            tokio::spawn(async move { services.proxy.notify_closed(&closed_name).await });
        }
        Some(e) => {
            warn!(%peer, name, error = %e, "record failed");
            let _ = response::write_simple(
                &mut write_half,
                500,
                "Internal Server Error",
                &e.to_string(),
            )
            .await;
        }
    }
}

/// Playback: a `200` with a chunked (or SSE) body, flushed chunk by chunk,
/// torn down when the stream closes or the peer disconnects.
async fn play_stream(
    pending: PendingRequest,
    mut write_half: OwnedWriteHalf,
    services: &Arc<Services>,
    peer: SocketAddr,
) {
    let name = stream_name(pending.head.path()).to_owned();
    let sse = pending.head.wants_sse();

    let head_written = if sse {
        response::write_sse_head(&mut write_half).await
    } else {
        response::write_playback_head(&mut write_half).await
    };
    if let Err(e) = head_written {
        debug!(%peer, name, error = %e, "playback head failed");
        return;
    }

    let sink: Box<dyn ByteSink> = if sse {
        Box::new(SseSink::new(write_half))
    } else {
        Box::new(response::ChunkedSink::new(write_half))
    };
    let handle = htee_stream::play(services.store.clone(), &name, sink);

    // Peer disconnect tears the playback down even while the stream idles.
    let cancel = handle.cancel_token();
    let mut reader = pending.reader;
    let watchdog = tokio::spawn(async move {
        let mut buf = [0u8; 64];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) | Err(_) => {
                    cancel.cancel();
                    return;
                }
                // Stray bytes on a playback connection are ignored.
                Ok(_) => {}
            }
        }
    });

    if let Some(e) = handle.done().await {
        warn!(%peer, name, error = %e, "playback ended with error");
    } else {
        debug!(%peer, name, "playback complete");
    }
    watchdog.abort();
}

async fn delete_stream(
    pending: PendingRequest,
    mut write_half: OwnedWriteHalf,
    services: &Arc<Services>,
    peer: SocketAddr,
) {
    let name = stream_name(pending.head.path()).to_owned();
    match htee_stream::delete(services.store.as_ref(), &name).await {
        Ok(()) => {
            info!(%peer, name, "deleted stream");
            let _ = response::write_simple(&mut write_half, 204, "No Content", "").await;
        }
        Err(e) => {
            warn!(%peer, name, error = %e, "delete failed");
            let _ = response::write_simple(
                &mut write_half,
                500,
                "Internal Server Error",
                &e.to_string(),
            )
            .await;
        }
    }
}

/// A deny verdict carried `X-Htee-Downstream-Continue`: the client already
/// has the upstream's response, but the engine still runs with its output
/// discarded.
async fn run_discarded(pending: PendingRequest, services: &Arc<Services>, peer: SocketAddr) {
    let name = stream_name(pending.head.path()).to_owned();
    match pending.method.clone().as_str() {
        "POST" => {
            match htee_stream::record(services.store.clone(), &name, pending.into_source()).await {
                Ok(handle) => {
                    if let Some(e) = handle.done().await {
                        warn!(%peer, name, error = %e, "discarded record failed");
                    }
                }
                Err(e) => warn!(%peer, name, error = %e, "discarded record setup failed"),
            }
        }
        "GET" => {
            let handle = htee_stream::play(services.store.clone(), &name, Box::new(DiscardSink));
            if let Some(e) = handle.done().await {
                warn!(%peer, name, error = %e, "discarded playback failed");
            }
        }
        "DELETE" => {
            if let Err(e) = htee_stream::delete(services.store.as_ref(), &name).await {
                warn!(%peer, name, error = %e, "discarded delete failed");
            }
        }
        _ => {}
    }
}

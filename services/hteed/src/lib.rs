//! hteed: the streaming HTTP tee daemon.
//!
//! A chunked `POST /name` records a byte stream into the store; concurrent
//! `GET /name` requests replay everything stored so far and then follow the
//! live appends (raw bytes, or Server-Sent Events when the client asks for
//! `text/event-stream`); `DELETE /name` removes the stream and wakes every
//! reader.  Before any of that happens the request is mirrored to an
//! authorization upstream, whose verdict may let it through, rewrite it, or
//! answer it outright.

pub mod config;
pub mod http;
pub mod proxy;
pub mod sse;

pub use http::Server;

use std::sync::Arc;
use std::time::Duration;

use htee_store::{RedisStore, StreamStore};
use tracing::{info, warn};

use crate::proxy::{ProxyError, UpstreamProxy};

/// Interval between store liveness probes.
const STORE_PING_INTERVAL: Duration = Duration::from_secs(30);

/// Shared dependencies, built once at startup and handed to every
/// connection handler.  Immutable after construction.
pub struct Services {
    pub store: Arc<dyn StreamStore>,
    pub proxy: UpstreamProxy,
}

impl Services {
    pub fn new(store: Arc<dyn StreamStore>, proxy: UpstreamProxy) -> Self {
        Services { store, proxy }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("binding {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },
    #[error(transparent)]
    Store(#[from] htee_store::StoreError),
    #[error(transparent)]
    Proxy(#[from] ProxyError),
}

/// Start the daemon from a resolved config and serve until the process
/// exits.  Fails fast if the store or the upstream is unreachable.
pub async fn run(cfg: config::Config) -> Result<(), ServerError> {
    let store: Arc<dyn StreamStore> = Arc::new(
        RedisStore::connect(&cfg.redis_url, &cfg.key_prefix, cfg.testing).await?,
    );
    let proxy = UpstreamProxy::new(&cfg.web_url, &cfg.web_token)?;
    proxy.ping().await?;

    spawn_store_pinger(store.clone());

    let services = Arc::new(Services::new(store, proxy));
    let addr = format!("{}:{}", cfg.bind_address, cfg.bind_port);
    let server = Server::bind(&addr, services).await?;
    info!(addr = %server.local_addr(), "hteed listening");
    server.run().await;
    Ok(())
}

fn spawn_store_pinger(store: Arc<dyn StreamStore>) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(STORE_PING_INTERVAL);
        // The first tick completes immediately; connect already pinged.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if let Err(e) = store.ping().await {
                warn!(error = %e, "store ping failed");
            }
        }
    });
}

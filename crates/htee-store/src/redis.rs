//! Redis store backend.
//!
//! Commands go through a shared [`ConnectionManager`]; every snapshot
//! leases a dedicated pub/sub connection that is dropped when the
//! subscription ends; a connection in subscribe mode cannot be returned
//! to the pool.
//!
//! Redis offers no single transaction spanning `GET` and `SUBSCRIBE`, so
//! the snapshot is synthesized: subscribe first, then run one atomic
//! `MULTI`/`EXEC` pipeline of `GET state`, `GET data`, and `PUBLISH` of a
//! fence frame.  Everything the subscription delivers before its own fence
//! was already folded into the prefix and is discarded; everything after it
//! is new.  Fence frames carry a reserved state byte plus a random UUID so
//! concurrent snapshots on one channel cannot confuse each other.

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use redis::aio::{ConnectionManager, PubSub};
use redis::{Client, RedisError};
use tracing::debug;
use uuid::Uuid;

use crate::{
    encode_closed_frame, encode_data_frame, Frame, Keys, Snapshot, StoreError, StreamState,
    StreamStore, Subscription, FENCE_BYTE,
};

/// Redis-backed stream store.
pub struct RedisStore {
    client: Client,
    manager: ConnectionManager,
    keys: Keys,
    test_mode: bool,
}

impl RedisStore {
    /// Connect to `url`, verify liveness with a `PING`, and return a store
    /// whose keys all carry `key_prefix`.
    pub async fn connect(url: &str, key_prefix: &str, test_mode: bool) -> Result<Self, StoreError> {
        let client = Client::open(url).map_err(transient)?;
        let manager = ConnectionManager::new(client.clone())
            .await
            .map_err(transient)?;

        let store = RedisStore {
            client,
            manager,
            keys: Keys::new(key_prefix),
            test_mode,
        };
        store.ping().await?;
        Ok(store)
    }
}

#[async_trait]
impl StreamStore for RedisStore {
    async fn open(&self, name: &str) -> Result<(), StoreError> {
        let mut conn = self.manager.clone();
        let () = redis::cmd("SET")
            .arg(self.keys.state(name))
            .arg(StreamState::Opened as u8)
            .query_async(&mut conn)
            .await
            .map_err(transient)?;
        Ok(())
    }

    async fn append(&self, name: &str, chunk: &[u8]) -> Result<(), StoreError> {
        let mut conn = self.manager.clone();
        let () = redis::pipe()
            .atomic()
            .set(self.keys.state(name), StreamState::Opened as u8)
            .ignore()
            .append(self.keys.data(name), chunk)
            .ignore()
            .publish(self.keys.channel(name), encode_data_frame(chunk))
            .ignore()
            .query_async(&mut conn)
            .await
            .map_err(transient)?;
        Ok(())
    }

    async fn close(&self, name: &str) -> Result<(), StoreError> {
        let mut conn = self.manager.clone();
        let () = redis::pipe()
            .atomic()
            .set(self.keys.state(name), StreamState::Closed as u8)
            .ignore()
            .publish(self.keys.channel(name), encode_closed_frame())
            .ignore()
            .query_async(&mut conn)
            .await
            .map_err(transient)?;
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<(), StoreError> {
        let mut conn = self.manager.clone();
        let () = redis::pipe()
            .atomic()
            .del(vec![self.keys.state(name), self.keys.data(name)])
            .ignore()
            .publish(self.keys.channel(name), encode_closed_frame())
            .ignore()
            .query_async(&mut conn)
            .await
            .map_err(transient)?;
        Ok(())
    }

    async fn snapshot(&self, name: &str) -> Result<Snapshot, StoreError> {
        // Subscribe before reading: any publish executed after the pipeline
        // below is guaranteed to reach this connection.
        let mut pubsub = self.client.get_async_pubsub().await.map_err(transient)?;
        pubsub
            .subscribe(self.keys.channel(name))
            .await
            .map_err(transient)?;

        let fence = Uuid::new_v4();
        let mut fence_frame = Vec::with_capacity(17);
        fence_frame.push(FENCE_BYTE);
        fence_frame.extend_from_slice(fence.as_bytes());

        let mut conn = self.manager.clone();
        let (state, data): (Option<u8>, Option<Vec<u8>>) = redis::pipe()
            .atomic()
            .get(self.keys.state(name))
            .get(self.keys.data(name))
            .publish(self.keys.channel(name), fence_frame)
            .ignore()
            .query_async(&mut conn)
            .await
            .map_err(transient)?;

        let state = match state {
            None | Some(0) => StreamState::Closed,
            Some(1) => StreamState::Opened,
            Some(other) => {
                return Err(StoreError::Protocol(format!(
                    "unknown stream state byte {other}"
                )))
            }
        };

        debug!(name, ?state, "snapshot taken");
        Ok(Snapshot {
            state,
            prefix: Bytes::from(data.unwrap_or_default()),
            subscription: Box::new(RedisSubscription {
                pubsub,
                fence,
                fenced: false,
            }),
        })
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.manager.clone();
        let pong: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(transient)?;
        if pong == "PONG" {
            Ok(())
        } else {
            Err(StoreError::Protocol(format!(
                "unexpected PING reply: {pong}"
            )))
        }
    }

    async fn reset(&self) -> Result<(), StoreError> {
        if !self.test_mode {
            return Err(StoreError::ResetDisabled);
        }
        let mut conn = self.manager.clone();
        let keys: Vec<String> = redis::cmd("KEYS")
            .arg(format!("{}*", self.keys.prefix()))
            .query_async(&mut conn)
            .await
            .map_err(transient)?;
        if !keys.is_empty() {
            let () = redis::cmd("DEL")
                .arg(&keys)
                .query_async(&mut conn)
                .await
                .map_err(transient)?;
        }
        Ok(())
    }
}

fn transient(err: RedisError) -> StoreError {
    StoreError::Transient(err.to_string())
}

struct RedisSubscription {
    pubsub: PubSub,
    fence: Uuid,
    fenced: bool,
}

#[async_trait]
impl Subscription for RedisSubscription {
    async fn next(&mut self) -> Result<Frame, StoreError> {
        loop {
            let payload: Vec<u8> = {
                let mut messages = self.pubsub.on_message();
                let Some(msg) = messages.next().await else {
                    return Err(StoreError::Transient(
                        "subscription connection closed".to_owned(),
                    ));
                };
                msg.get_payload()
                    .map_err(|e| StoreError::Protocol(format!("unreadable frame payload: {e}")))?
            };

            let Some((&state, body)) = payload.split_first() else {
                return Err(StoreError::Protocol("empty pub/sub frame".to_owned()));
            };

            if state == FENCE_BYTE {
                if !self.fenced && body == self.fence.as_bytes() {
                    self.fenced = true;
                }
                // Foreign fences are other snapshots anchoring themselves.
                continue;
            }
            if !self.fenced {
                // Published before our read-point; already in the prefix.
                continue;
            }
            match state {
                1 => return Ok(Frame::Data(Bytes::copy_from_slice(body))),
                0 => return Ok(Frame::Closed),
                other => {
                    return Err(StoreError::Protocol(format!(
                        "unknown frame state byte {other}"
                    )))
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Live-Redis tests (run only when HTEE_TEST_REDIS_URL is set)
// ---------------------------------------------------------------------------

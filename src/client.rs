//! The peer side of a juggler connection.
//!
//! A [`Client`] dials a server, negotiates the subprotocol, and exposes
//! `call`/`publish`/`subscribe`/`unsubscribe`. Every incoming message is
//! handed to the [`ClientHandler`]. Outstanding calls live in a pending
//! table keyed by call uuid; delivery of RES or EXP resolves an entry,
//! and a reaper sweeps entries whose deadline passed, synthesizing a
//! local EXP so a stalled call always resolves exactly once.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use serde::Serialize;
use tokio::pin;
use tokio::sync::{mpsc, Notify};
use tokio::time::{Duration, Instant};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};
use tracing::{debug, trace};
use uuid::Uuid;

use crate::broker::DEFAULT_CALL_TIMEOUT_MS;
use crate::error::Error;
use crate::msg::{Msg, Payload};
use crate::server::{FrameSink, FrameStream, WsFrames, SUBPROTOCOLS};
use crate::TaskSet;

/// Receives every message delivered to the client, including locally
/// synthesized EXPs.
#[async_trait]
pub trait ClientHandler: Send + Sync + 'static {
    /// Process one incoming message.
    async fn handle(&self, msg: Msg);
}

/// How long the reaper sleeps when no call is pending.
const REAPER_IDLE: Duration = Duration::from_secs(1);

struct PendingCall {
    uri: String,
    deadline: Instant,
}

struct Inner {
    uuid: Uuid,
    created_at: DateTime<Utc>,
    write_tx: mpsc::Sender<Msg>,
    pending: parking_lot::Mutex<HashMap<Uuid, PendingCall>>,
    /// Nudges the reaper when a nearer deadline is registered.
    reaper_wake: Notify,
    handler: Arc<dyn ClientHandler>,
    tasks: TaskSet,
    done: CancellationToken,
}

/// A dialed juggler client connection. Cheap to clone.
#[derive(Clone)]
pub struct Client {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("uuid", &self.inner.uuid)
            .field("pending", &self.inner.pending.lock().len())
            .finish_non_exhaustive()
    }
}

impl Client {
    /// Dial `url` with the default subprotocol offer.
    pub async fn dial(url: &str, handler: Arc<dyn ClientHandler>) -> Result<Client, Error> {
        let request = url
            .into_client_request()
            .map_err(|e| Error::Handshake(e.to_string()))?;
        Self::dial_request(request, handler).await
    }

    /// Dial with a caller-built request, for custom headers such as
    /// `Juggler-Allowed-Messages`. The subprotocol offer is added here.
    pub async fn dial_request(
        mut request: Request,
        handler: Arc<dyn ClientHandler>,
    ) -> Result<Client, Error> {
        let offer = SUBPROTOCOLS.join(", ");
        request.headers_mut().insert(
            "Sec-WebSocket-Protocol",
            HeaderValue::from_str(&offer).map_err(|e| Error::Handshake(e.to_string()))?,
        );

        let (ws, response) = connect_async(request)
            .await
            .map_err(|e| Error::Handshake(e.to_string()))?;

        let negotiated = response
            .headers()
            .get("Sec-WebSocket-Protocol")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if !SUBPROTOCOLS.contains(&negotiated) {
            return Err(Error::Handshake(format!(
                "server selected unsupported subprotocol {negotiated:?}"
            )));
        }

        let (sink, stream) = ws.split();
        let (write_tx, write_rx) = mpsc::channel(16);
        let inner = Arc::new(Inner {
            uuid: Uuid::new_v4(),
            created_at: Utc::now(),
            write_tx,
            pending: parking_lot::Mutex::new(HashMap::new()),
            reaper_wake: Notify::new(),
            handler,
            tasks: TaskSet::new(),
            done: CancellationToken::new(),
        });
        let client = Client { inner };

        {
            let client = client.clone();
            client
                .inner
                .tasks
                .clone()
                .spawn_graceful(move |cancel| client.clone().write_loop(write_rx, sink, cancel));
        }
        {
            let client = client.clone();
            client
                .inner
                .tasks
                .clone()
                .spawn_graceful(move |cancel| client.clone().read_loop(WsFrames::from(stream), cancel));
        }
        {
            let client = client.clone();
            client
                .inner
                .tasks
                .clone()
                .spawn_graceful(move |cancel| client.clone().reaper_loop(cancel));
        }
        {
            let client = client.clone();
            tokio::spawn(async move {
                client.inner.tasks.wait().await;
                client.inner.done.cancel();
                debug!(client = %client.inner.uuid, "client closed");
            });
        }

        Ok(client)
    }

    /// The client connection's identifier.
    pub fn uuid(&self) -> Uuid {
        self.inner.uuid
    }

    /// When the connection was dialed.
    pub fn created_at(&self) -> DateTime<Utc> {
        self.inner.created_at
    }

    /// Number of calls awaiting a RES or EXP.
    pub fn pending_calls(&self) -> usize {
        self.inner.pending.lock().len()
    }

    /// Close the connection. Idempotent.
    pub fn close(&self) {
        self.inner.tasks.cancel();
    }

    /// Resolves once every client task has wound down.
    pub async fn closed(&self) {
        self.inner.done.cancelled().await;
    }

    async fn send(&self, msg: Msg) -> Result<Uuid, Error> {
        let uuid = msg.meta.uuid;
        self.inner
            .write_tx
            .send(msg)
            .await
            .map_err(|_| Error::Closed)?;
        Ok(uuid)
    }

    /// Issue a CALL; the result arrives at the handler as RES or EXP with
    /// a matching `for` uuid. Returns the call's uuid.
    pub async fn call<T: Serialize>(
        &self,
        uri: &str,
        args: &T,
        timeout: Duration,
    ) -> Result<Uuid, Error> {
        let args = serde_json::value::to_raw_value(args)
            .map_err(|e| Error::Protocol(format!("serializing call args: {e}")))?;
        let msg = Msg::new_call(uri, args, timeout.as_millis() as u64);
        let uuid = msg.meta.uuid;

        let effective = if timeout.is_zero() {
            Duration::from_millis(DEFAULT_CALL_TIMEOUT_MS)
        } else {
            timeout
        };
        // register before sending so an immediate RES finds the entry
        self.inner.pending.lock().insert(
            uuid,
            PendingCall {
                uri: uri.to_owned(),
                deadline: Instant::now() + effective,
            },
        );
        self.inner.reaper_wake.notify_one();

        if let Err(err) = self.send(msg).await {
            self.inner.pending.lock().remove(&uuid);
            return Err(err);
        }
        Ok(uuid)
    }

    /// Publish on a channel. Returns the PUB's uuid.
    pub async fn publish<T: Serialize>(&self, channel: &str, args: &T) -> Result<Uuid, Error> {
        let args = serde_json::value::to_raw_value(args)
            .map_err(|e| Error::Protocol(format!("serializing event args: {e}")))?;
        self.send(Msg::new_pub(channel, args)).await
    }

    /// Subscribe to a channel (or glob when `pattern`). Returns the SUB's
    /// uuid.
    pub async fn subscribe(&self, channel: &str, pattern: bool) -> Result<Uuid, Error> {
        self.send(Msg::new_sub(channel, pattern)).await
    }

    /// Unsubscribe from a channel (or glob when `pattern`). Returns the
    /// UNSB's uuid.
    pub async fn unsubscribe(&self, channel: &str, pattern: bool) -> Result<Uuid, Error> {
        self.send(Msg::new_unsb(channel, pattern)).await
    }

    async fn write_loop<S: FrameSink>(
        self,
        mut rx: mpsc::Receiver<Msg>,
        mut sink: S,
        cancel: WaitForCancellationFutureOwned,
    ) {
        pin!(cancel);
        loop {
            let msg = tokio::select! {
                biased;
                _ = &mut cancel => break,
                msg = rx.recv() => match msg {
                    Some(msg) => msg,
                    None => break,
                },
            };
            let text = match msg.to_json() {
                Ok(text) => text,
                Err(err) => {
                    debug!(%err, "dropping unencodable message");
                    continue;
                }
            };
            if let Err(err) = sink.send_text(text).await {
                debug!(%err, "client write failed");
                self.inner.tasks.cancel();
                break;
            }
        }
        let _ = sink.close().await;
    }

    async fn read_loop<R: FrameStream>(self, mut stream: R, cancel: WaitForCancellationFutureOwned) {
        pin!(cancel);
        loop {
            let frame = tokio::select! {
                biased;
                _ = &mut cancel => break,
                frame = stream.next() => frame,
            };
            let Some(bytes) = frame else {
                // server went away
                self.inner.tasks.cancel();
                break;
            };
            let msg = match Msg::from_slice(&bytes) {
                Ok(msg) => msg,
                Err(err) => {
                    debug!(client = %self.inner.uuid, %err, "undecodable server message");
                    continue;
                }
            };

            // RES and EXP resolve a pending call exactly once; a response
            // to an already-resolved call is dropped
            let resolved = match &msg.payload {
                Payload::Res(p) => Some(p.for_uuid),
                Payload::Exp(p) => Some(p.for_uuid),
                _ => None,
            };
            if let Some(for_uuid) = resolved {
                if self.inner.pending.lock().remove(&for_uuid).is_none() {
                    trace!(client = %self.inner.uuid, call = %for_uuid, "response for resolved call, dropping");
                    continue;
                }
            }
            self.inner.handler.handle(msg).await;
        }
    }

    /// Sweeps pending calls whose deadline passed and synthesizes a local
    /// EXP for each, so stalled calls always resolve.
    async fn reaper_loop(self, cancel: WaitForCancellationFutureOwned) {
        pin!(cancel);
        loop {
            let next_deadline = self
                .inner
                .pending
                .lock()
                .values()
                .map(|p| p.deadline)
                .min();
            let wake_at = next_deadline.unwrap_or_else(|| Instant::now() + REAPER_IDLE);

            tokio::select! {
                biased;
                _ = &mut cancel => break,
                _ = self.inner.reaper_wake.notified() => continue,
                _ = tokio::time::sleep_until(wake_at) => {}
            }

            let now = Instant::now();
            let lapsed: Vec<(Uuid, String)> = {
                let mut pending = self.inner.pending.lock();
                let keys: Vec<Uuid> = pending
                    .iter()
                    .filter(|(_, p)| p.deadline <= now)
                    .map(|(uuid, _)| *uuid)
                    .collect();
                keys.into_iter()
                    .filter_map(|uuid| pending.remove(&uuid).map(|p| (uuid, p.uri)))
                    .collect()
            };
            for (uuid, uri) in lapsed {
                debug!(client = %self.inner.uuid, call = %uuid, "call deadline lapsed");
                self.inner.handler.handle(Msg::new_exp(uuid, uri)).await;
            }
        }
    }
}

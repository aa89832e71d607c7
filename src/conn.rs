//! The server side of one WebSocket connection.
//!
//! Four flows share the connection and nothing else but its write path:
//!
//! - the **read flow** decodes client envelopes and dispatches them,
//! - the **result flow** pulls this connection's call results off the
//!   broker and turns them into RES or EXP,
//! - the **event flow** owns the connection's dedicated pub/sub upstream
//!   and turns events into EVNT,
//! - the **write flow** owns the socket's sink; everyone else reaches it
//!   through a bounded hand-off whose enqueue wait is the write-lock
//!   acquisition bound.
//!
//! The lifecycle is `Accepting → Connected → Closing → Closed`, strictly
//! forward. Closing is idempotent: the first failure (or close request)
//! wins, cancels every flow, and `Closed` is reached only once all four
//! have wound down.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use tokio::pin;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::WaitForCancellationFutureOwned;
use tracing::{debug, error, trace};
use uuid::Uuid;

use crate::broker::{BrokerError, CallPayload, EventStream, PubSubCtl, ResultsConn};
use crate::error::{code, Error};
use crate::msg::{self, Kind, Msg, Payload};
use crate::server::{FrameSink, FrameStream, Server};
use crate::TaskSet;

/// Lifecycle states of a connection. A connection only ever advances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConnState {
    /// Subprotocol negotiated, flows not yet started.
    Accepting,
    /// All four flows are running.
    Connected,
    /// A flow saw a fatal error or a close was requested.
    Closing,
    /// Every flow has terminated and the socket is closed.
    Closed,
}

/// Observer callback for state transitions.
pub type ConnStateFn = Arc<dyn Fn(&Conn, ConnState) + Send + Sync>;

struct Inner {
    uuid: Uuid,
    created_at: DateTime<Utc>,
    server: Arc<Server>,
    write_tx: mpsc::Sender<Msg>,
    subs: parking_lot::Mutex<HashSet<(String, bool)>>,
    pubsub: PubSubCtl,
    state_tx: watch::Sender<ConnState>,
    close_reason: parking_lot::Mutex<Option<Error>>,
    tasks: TaskSet,
}

/// Handle to a served connection. Cheap to clone.
#[derive(Clone)]
pub struct Conn {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Conn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Conn")
            .field("uuid", &self.inner.uuid)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Conn {
    /// The connection's identifier; results are routed back under it.
    pub fn uuid(&self) -> Uuid {
        self.inner.uuid
    }

    /// When the connection was accepted.
    pub fn created_at(&self) -> DateTime<Utc> {
        self.inner.created_at
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnState {
        *self.inner.state_tx.borrow()
    }

    /// Snapshot of the active subscriptions (channel, pattern flag).
    pub fn subscriptions(&self) -> Vec<(String, bool)> {
        self.inner.subs.lock().iter().cloned().collect()
    }

    /// Advance the state machine, never backwards. Returns whether the
    /// state changed; the observer callback fires on change.
    fn transition(&self, to: ConnState) -> bool {
        let mut advanced = false;
        self.inner.state_tx.send_if_modified(|cur| {
            if to > *cur {
                *cur = to;
                advanced = true;
                true
            } else {
                false
            }
        });
        if advanced {
            trace!(conn = %self.inner.uuid, state = ?to, "state change");
            if let Some(cb) = &self.inner.server.conn_state {
                cb(self, to);
            }
        }
        advanced
    }

    /// Request a close. Idempotent; the first caller wins.
    pub fn close(&self) {
        self.close_with(None);
    }

    pub(crate) fn close_with(&self, reason: Option<Error>) {
        if self.transition(ConnState::Closing) {
            if let Some(err) = reason {
                error!(conn = %self.inner.uuid, %err, "closing connection");
                *self.inner.close_reason.lock() = Some(err);
            }
            self.inner.tasks.cancel();
        }
    }

    /// The failure that closed the connection, if any.
    pub fn close_reason(&self) -> Option<String> {
        self.inner.close_reason.lock().as_ref().map(|e| e.to_string())
    }

    /// Resolves once the connection reaches `Closed`.
    pub async fn closed(&self) {
        let mut rx = self.inner.state_tx.subscribe();
        let _ = rx.wait_for(|s| *s == ConnState::Closed).await;
    }

    /// Enqueue a message on the write path.
    ///
    /// The wait for a slot is bounded by the configured write-lock
    /// acquisition timeout; on timeout the message is abandoned and the
    /// connection closes.
    pub async fn send(&self, msg: Msg) -> Result<(), Error> {
        let bound = self.inner.server.acquire_write_lock_timeout;
        if bound.is_zero() {
            return self
                .inner
                .write_tx
                .send(msg)
                .await
                .map_err(|_| Error::Closed);
        }
        match self.inner.write_tx.send_timeout(msg, bound).await {
            Ok(()) => Ok(()),
            Err(mpsc::error::SendTimeoutError::Timeout(_)) => {
                self.close_with(Some(Error::Deadline("write-lock acquisition")));
                Err(Error::Deadline("write-lock acquisition"))
            }
            Err(mpsc::error::SendTimeoutError::Closed(_)) => Err(Error::Closed),
        }
    }

    async fn send_err(&self, for_uuid: Uuid, for_kind: Option<Kind>, err_code: u16, message: String) {
        let _ = self.send(Msg::new_err(for_uuid, for_kind, err_code, message)).await;
    }

    /// Accept a negotiated socket and run it: starts the four flows and
    /// drives the state machine. Returns once flows are running.
    pub(crate) async fn spawn<S, R>(
        server: Arc<Server>,
        sink: S,
        stream: R,
        allowed: Option<Vec<Kind>>,
    ) -> Result<Conn, Error>
    where
        S: FrameSink,
        R: FrameStream,
    {
        let (write_tx, write_rx) = mpsc::channel(server.write_buffer);
        let (pubsub, events) = server.pubsub_broker.pubsub().await?;
        let (state_tx, _) = watch::channel(ConnState::Accepting);

        let conn = Conn {
            inner: Arc::new(Inner {
                uuid: Uuid::new_v4(),
                created_at: Utc::now(),
                server: server.clone(),
                write_tx,
                subs: parking_lot::Mutex::new(HashSet::new()),
                pubsub,
                state_tx,
                close_reason: parking_lot::Mutex::new(None),
                tasks: server.root_tasks.child(),
            }),
        };

        if let Some(cb) = &server.conn_state {
            cb(&conn, ConnState::Accepting);
        }

        let results = match server.caller_broker.results(conn.uuid()).await {
            Ok(results) => results,
            Err(err) => {
                conn.transition(ConnState::Closing);
                conn.transition(ConnState::Closed);
                return Err(Error::Broker(err));
            }
        };

        {
            let conn = conn.clone();
            conn.inner
                .tasks
                .clone()
                .spawn_graceful(move |cancel| read_loop(conn, stream, allowed, cancel));
        }
        {
            let conn = conn.clone();
            conn.inner
                .tasks
                .clone()
                .spawn_graceful(move |cancel| write_loop(conn, write_rx, sink, cancel));
        }
        {
            let conn = conn.clone();
            conn.inner
                .tasks
                .clone()
                .spawn_graceful(move |cancel| results_loop(conn, results, cancel));
        }
        {
            let conn = conn.clone();
            conn.inner
                .tasks
                .clone()
                .spawn_graceful(move |cancel| events_loop(conn, events, cancel));
        }

        // janitor: once every flow has wound down, the connection is Closed
        {
            let conn = conn.clone();
            tokio::spawn(async move {
                conn.inner.tasks.wait().await;
                conn.transition(ConnState::Closing);
                conn.transition(ConnState::Closed);
                debug!(conn = %conn.inner.uuid, "connection closed");
            });
        }

        conn.transition(ConnState::Connected);
        Ok(conn)
    }
}

/// Read flow: one client envelope at a time, bounded by the read
/// deadline and size limit, dispatched through the handler chain.
async fn read_loop<R: FrameStream>(
    conn: Conn,
    mut stream: R,
    allowed: Option<Vec<Kind>>,
    cancel: WaitForCancellationFutureOwned,
) {
    pin!(cancel);
    let read_timeout = conn.inner.server.read_timeout;
    let read_limit = conn.inner.server.read_limit;

    loop {
        let next = if read_timeout.is_zero() {
            tokio::select! {
                biased;
                _ = &mut cancel => break,
                frame = stream.next() => frame,
            }
        } else {
            tokio::select! {
                biased;
                _ = &mut cancel => break,
                frame = tokio::time::timeout(read_timeout, stream.next()) => match frame {
                    Ok(frame) => frame,
                    Err(_) => {
                        conn.close_with(Some(Error::Deadline("read")));
                        break;
                    }
                },
            }
        };

        let Some(bytes) = next else {
            // peer went away
            conn.close_with(None);
            break;
        };

        if read_limit > 0 && bytes.len() > read_limit {
            conn.close_with(Some(Error::Limit {
                limit: read_limit,
                size: bytes.len(),
            }));
            break;
        }

        let msg = match Msg::from_slice(&bytes) {
            Ok(msg) => msg,
            Err(err) => {
                debug!(conn = %conn.uuid(), %err, "undecodable message");
                let for_uuid = msg::peek_uuid(&bytes).unwrap_or_else(Uuid::nil);
                conn.send_err(for_uuid, None, code::MALFORMED, format!("invalid message: {err}"))
                    .await;
                continue;
            }
        };

        if !msg.meta.kind.is_from_client() {
            conn.send_err(
                msg.meta.uuid,
                Some(msg.meta.kind),
                code::UNKNOWN_KIND,
                format!("{} is not a client message", msg.meta.kind),
            )
            .await;
            continue;
        }

        if let Some(allowed) = &allowed {
            if !allowed.contains(&msg.meta.kind) {
                conn.send_err(
                    msg.meta.uuid,
                    Some(msg.meta.kind),
                    code::DISALLOWED_KIND,
                    format!("{} is not in the handshake allow-list", msg.meta.kind),
                )
                .await;
                conn.close_with(Some(Error::Protocol(format!(
                    "disallowed message kind {}",
                    msg.meta.kind
                ))));
                break;
            }
        }

        match &conn.inner.server.read_handler {
            Some(handler) => handler.handle(&conn, msg).await,
            None => process_msg(&conn, msg).await,
        }
    }
}

/// Default terminal read handler: routes CALL and PUB to the broker,
/// SUB and UNSB to the connection's pub/sub upstream.
///
/// Custom read handlers are expected to call this once their own
/// processing is done, or to fully process the message themselves.
pub async fn process_msg(conn: &Conn, msg: Msg) {
    let meta = msg.meta;
    match (meta.kind, msg.payload) {
        (Kind::Call, Payload::Call(params)) => {
            let cp = CallPayload {
                msg_uuid: meta.uuid,
                conn_uuid: conn.uuid(),
                uri: params.uri,
                args: params.args,
                timeout_ms: params.timeout_ms,
                read_timestamp: None,
                ttl_after_read_ms: None,
            };
            // ack before the enqueue so the ack always precedes the
            // result; an enqueue failure follows as ERR
            if conn.send(Msg::new_ok(&meta)).await.is_err() {
                return;
            }
            if let Err(err) = conn.inner.server.caller_broker.call(&cp).await {
                debug!(conn = %conn.uuid(), %err, uri = %cp.uri, "call enqueue failed");
                conn.send_err(meta.uuid, Some(Kind::Call), code::BROKER, err.to_string())
                    .await;
            }
        }
        (Kind::Pub, Payload::Pub(params)) => {
            match conn
                .inner
                .server
                .pubsub_broker
                .publish(&params.channel, &params.args)
                .await
            {
                Ok(()) => {
                    let _ = conn.send(Msg::new_ok(&meta)).await;
                }
                Err(err) => {
                    debug!(conn = %conn.uuid(), %err, channel = %params.channel, "publish failed");
                    conn.send_err(meta.uuid, Some(Kind::Pub), code::BROKER, err.to_string())
                        .await;
                }
            }
        }
        (Kind::Sub, Payload::Sub(params)) => {
            let entry = (params.channel.clone(), params.pattern);
            if !conn.inner.subs.lock().insert(entry.clone()) {
                conn.send_err(
                    meta.uuid,
                    Some(Kind::Sub),
                    code::REDUNDANT_SUB,
                    format!("already subscribed to {}", params.channel),
                )
                .await;
                return;
            }
            match conn.inner.pubsub.subscribe(&params.channel, params.pattern).await {
                Ok(()) => {
                    let _ = conn.send(Msg::new_ok(&meta)).await;
                }
                Err(err) => {
                    conn.inner.subs.lock().remove(&entry);
                    conn.send_err(meta.uuid, Some(Kind::Sub), code::BROKER, err.to_string())
                        .await;
                }
            }
        }
        (Kind::Unsb, Payload::Sub(params)) => {
            let entry = (params.channel.clone(), params.pattern);
            if !conn.inner.subs.lock().remove(&entry) {
                conn.send_err(
                    meta.uuid,
                    Some(Kind::Unsb),
                    code::UNKNOWN_SUB,
                    format!("not subscribed to {}", params.channel),
                )
                .await;
                return;
            }
            match conn
                .inner
                .pubsub
                .unsubscribe(&params.channel, params.pattern)
                .await
            {
                Ok(()) => {
                    let _ = conn.send(Msg::new_ok(&meta)).await;
                }
                Err(err) => {
                    conn.send_err(meta.uuid, Some(Kind::Unsb), code::BROKER, err.to_string())
                        .await;
                }
            }
        }
        (kind, _) => {
            // the decoder pairs kinds and payloads; anything else slipped
            // past the client-kind filter
            debug!(conn = %conn.uuid(), %kind, "unroutable message");
        }
    }
}

/// Write flow: sole owner of the sink. Each message first passes the
/// terminal write handler when one is set, then the write deadline and
/// size limit; an oversize message of any kind is replaced by an ERR
/// naming the original. After cancellation, already-enqueued messages
/// (a terminal ERR in particular) are still flushed.
async fn write_loop<S: FrameSink>(
    conn: Conn,
    mut rx: mpsc::Receiver<Msg>,
    mut sink: S,
    cancel: WaitForCancellationFutureOwned,
) {
    pin!(cancel);
    let mut broken = false;

    loop {
        let msg = tokio::select! {
            biased;
            _ = &mut cancel => break,
            msg = rx.recv() => match msg {
                Some(msg) => msg,
                None => break,
            },
        };
        if let Err(err) = write_one(&conn, &mut sink, msg).await {
            conn.close_with(Some(err));
            broken = true;
            break;
        }
    }

    // drain what was enqueued before the close won the race
    while !broken {
        match rx.try_recv() {
            Ok(msg) => {
                if write_one(&conn, &mut sink, msg).await.is_err() {
                    break;
                }
            }
            Err(_) => break,
        }
    }

    let _ = sink.close().await;
}

async fn write_one<S: FrameSink>(conn: &Conn, sink: &mut S, msg: Msg) -> Result<(), Error> {
    // terminal write handler: whatever it returns is what gets written
    let msg = match &conn.inner.server.write_handler {
        Some(handler) => match handler.handle(conn, msg).await {
            Some(msg) => msg,
            None => return Ok(()),
        },
        None => msg,
    };

    let mut text = msg
        .to_json()
        .map_err(|e| Error::Protocol(format!("encoding outgoing message: {e}")))?;

    let limit = conn.inner.server.write_limit;
    if limit > 0 && text.len() > limit {
        // never send a truncated payload: substitute an ERR that names
        // the message the peer was waiting for
        let target = msg.for_uuid().unwrap_or(msg.meta.uuid);
        let substitute = Msg::new_err(
            target,
            Some(msg.meta.kind),
            code::TOO_LARGE,
            format!("{} byte {} exceeds the {limit} byte write limit", text.len(), msg.meta.kind),
        );
        debug!(conn = %conn.uuid(), kind = %msg.meta.kind, size = text.len(), "write limit hit, substituting ERR");
        text = substitute
            .to_json()
            .map_err(|e| Error::Protocol(format!("encoding substitute error: {e}")))?;
        if text.len() > limit {
            // not even the substitute fits; abandon the message
            return Err(Error::Limit {
                limit,
                size: text.len(),
            });
        }
    }

    let write_timeout = conn.inner.server.write_timeout;
    if write_timeout.is_zero() {
        sink.send_text(text)
            .await
            .map_err(|e| Error::Transport(e.to_string()))
    } else {
        match tokio::time::timeout(write_timeout, sink.send_text(text)).await {
            Ok(result) => result.map_err(|e| Error::Transport(e.to_string())),
            Err(_) => Err(Error::Deadline("write")),
        }
    }
}

/// Result flow: one reader on the connection's result list; fresh
/// results become RES, expired ones EXP.
async fn results_loop(conn: Conn, mut results: ResultsConn, cancel: WaitForCancellationFutureOwned) {
    pin!(cancel);
    loop {
        let entry = tokio::select! {
            biased;
            _ = &mut cancel => break,
            entry = results.next() => entry,
        };
        let Some(entry) = entry else {
            conn.close_with(Some(Error::Broker(BrokerError::Closed)));
            break;
        };
        let msg = if entry.expired {
            Msg::new_exp(entry.payload.msg_uuid, entry.payload.uri)
        } else {
            Msg::new_res(entry.payload.msg_uuid, entry.payload.uri, entry.payload.args)
        };
        if conn.send(msg).await.is_err() {
            break;
        }
    }
}

/// Event flow: the connection's dedicated pub/sub upstream; every event
/// becomes an EVNT on the write path.
async fn events_loop(conn: Conn, mut events: EventStream, cancel: WaitForCancellationFutureOwned) {
    pin!(cancel);
    loop {
        let event = tokio::select! {
            biased;
            _ = &mut cancel => break,
            event = events.next() => event,
        };
        let Some(event) = event else {
            conn.close_with(Some(Error::Broker(BrokerError::Closed)));
            break;
        };
        let msg = Msg::new_evnt(event.channel, event.pattern, event.args);
        if conn.send(msg).await.is_err() {
            break;
        }
    }
}

//! Broker contracts between connections, callees, and the fan-out fabric.
//!
//! Three seams: [`CallerBroker`] enqueues calls and streams back results
//! for one connection, [`CalleeBroker`] streams pending calls for a set
//! of URIs and stores their results, and [`PubSubBroker`] publishes and
//! carries subscriptions. The crate ships a clustered Redis realization
//! ([`RedisBroker`]); anything implementing the traits works, which is
//! how the test suite swaps in an in-memory fabric.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

mod pubsub;
mod redis;

pub use redis::{RedisBroker, DEFAULT_BLOCKING_TIMEOUT, DEFAULT_CALL_TIMEOUT_MS};

/// Failures crossing the broker seam.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    /// The cluster transport failed.
    #[error(transparent)]
    Cluster(#[from] crate::cluster::Error),

    /// A payload could not be (de)serialized.
    #[error("payload serialization: {0}")]
    Serde(#[from] serde_json::Error),

    /// The broker connection or stream is closed.
    #[error("broker connection closed")]
    Closed,
}

/// A call in flight through the broker.
///
/// Built by the server from a client CALL; `read_timestamp` and
/// `ttl_after_read` are stamped by the broker when a callee dequeues the
/// call and are never on the wire from the client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallPayload {
    /// Identifier of the originating CALL message.
    #[serde(rename = "msgUUID")]
    pub msg_uuid: Uuid,
    /// Identifier of the originating connection; routes the result back.
    #[serde(rename = "connUUID")]
    pub conn_uuid: Uuid,
    /// Routing key of the procedure.
    #[serde(rename = "URI")]
    pub uri: String,
    /// Opaque call arguments.
    pub args: Box<RawValue>,
    /// Caller deadline in milliseconds.
    #[serde(rename = "timeout")]
    pub timeout_ms: u64,
    /// When a callee pulled the call off the queue.
    #[serde(rename = "readTimestamp", skip_serializing_if = "Option::is_none", default)]
    pub read_timestamp: Option<DateTime<Utc>>,
    /// Deadline budget that remained at `read_timestamp`, in milliseconds.
    #[serde(rename = "ttlAfterRead", skip_serializing_if = "Option::is_none", default)]
    pub ttl_after_read_ms: Option<u64>,
}

impl CallPayload {
    /// Budget left for producing a result: the TTL observed at dequeue
    /// minus the time elapsed since. `None` once the budget is spent, or
    /// when the payload was never stamped.
    pub fn remaining_budget(&self) -> Option<Duration> {
        let read_at = self.read_timestamp?;
        let ttl = Duration::from_millis(self.ttl_after_read_ms?);
        let elapsed = (Utc::now() - read_at).to_std().unwrap_or_default();
        let left = ttl.checked_sub(elapsed)?;
        (!left.is_zero()).then_some(left)
    }
}

/// A call result in flight through the broker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResPayload {
    /// Identifier of the CALL this result answers.
    #[serde(rename = "msgUUID")]
    pub msg_uuid: Uuid,
    /// Connection that issued the call.
    #[serde(rename = "callerUUID")]
    pub caller_uuid: Uuid,
    /// Routing key the call was made on.
    #[serde(rename = "URI")]
    pub uri: String,
    /// The callee's result, or an `{"error": ...}` object.
    pub args: Box<RawValue>,
}

/// A result pulled from the broker, with its expiry verdict.
#[derive(Debug)]
pub struct ResultEntry {
    /// The result payload.
    pub payload: ResPayload,
    /// Whether the companion timeout key had already expired; the caller
    /// is told EXP instead of RES.
    pub expired: bool,
}

/// A pub/sub event delivered to a subscribed connection.
#[derive(Debug, Clone)]
pub struct Event {
    /// Channel the event was published on.
    pub channel: String,
    /// The matching glob, for pattern subscriptions.
    pub pattern: Option<String>,
    /// Opaque event payload.
    pub args: Box<RawValue>,
}

/// Stream of calls for the URIs a callee serves. Dropping it stops the
/// underlying dequeue loops.
#[derive(Debug)]
pub struct CallsConn {
    rx: mpsc::Receiver<CallPayload>,
    stop: CancellationToken,
}

impl CallsConn {
    /// Wrap a channel fed by dequeue loops that observe `stop`.
    pub fn new(rx: mpsc::Receiver<CallPayload>, stop: CancellationToken) -> Self {
        Self { rx, stop }
    }

    /// The next pending call; `None` once the stream is closed.
    pub async fn next(&mut self) -> Option<CallPayload> {
        self.rx.recv().await
    }
}

impl Drop for CallsConn {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

/// Stream of results destined for one connection. Dropping it stops the
/// underlying dequeue loop.
#[derive(Debug)]
pub struct ResultsConn {
    rx: mpsc::Receiver<ResultEntry>,
    stop: CancellationToken,
}

impl ResultsConn {
    /// Wrap a channel fed by a dequeue loop that observes `stop`.
    pub fn new(rx: mpsc::Receiver<ResultEntry>, stop: CancellationToken) -> Self {
        Self { rx, stop }
    }

    /// The next result; `None` once the stream is closed.
    pub async fn next(&mut self) -> Option<ResultEntry> {
        self.rx.recv().await
    }
}

impl Drop for ResultsConn {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

/// Stream of events for one connection's subscriptions. Dropping it
/// closes the dedicated upstream connection.
#[derive(Debug)]
pub struct EventStream {
    rx: mpsc::Receiver<Event>,
    stop: CancellationToken,
}

impl EventStream {
    /// Wrap a channel fed by an event loop that observes `stop`.
    pub fn new(rx: mpsc::Receiver<Event>, stop: CancellationToken) -> Self {
        Self { rx, stop }
    }

    /// The next event; `None` once the stream is closed.
    pub async fn next(&mut self) -> Option<Event> {
        self.rx.recv().await
    }
}

impl Drop for EventStream {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

/// A subscribe or unsubscribe instruction for a pub/sub connection.
#[derive(Debug, Clone)]
pub struct SubCmd {
    /// Channel name or glob.
    pub channel: String,
    /// Whether `channel` is a glob.
    pub pattern: bool,
    /// `true` to subscribe, `false` to unsubscribe.
    pub subscribe: bool,
}

/// Command handle for one connection's subscriptions.
///
/// All instructions go to the same upstream connection as the matching
/// [`EventStream`]; moving them elsewhere would orphan the subscription
/// state.
#[derive(Debug, Clone)]
pub struct PubSubCtl {
    tx: mpsc::Sender<SubCmd>,
}

impl PubSubCtl {
    /// Wrap the instruction channel of a pub/sub connection driver.
    pub fn new(tx: mpsc::Sender<SubCmd>) -> Self {
        Self { tx }
    }

    async fn send(&self, cmd: SubCmd) -> Result<(), BrokerError> {
        self.tx.send(cmd).await.map_err(|_| BrokerError::Closed)
    }

    /// Subscribe to a channel or pattern.
    pub async fn subscribe(&self, channel: &str, pattern: bool) -> Result<(), BrokerError> {
        self.send(SubCmd {
            channel: channel.to_owned(),
            pattern,
            subscribe: true,
        })
        .await
    }

    /// Unsubscribe from a channel or pattern.
    pub async fn unsubscribe(&self, channel: &str, pattern: bool) -> Result<(), BrokerError> {
        self.send(SubCmd {
            channel: channel.to_owned(),
            pattern,
            subscribe: false,
        })
        .await
    }
}

/// Caller-side broker seam: enqueue calls, stream back results.
#[async_trait]
pub trait CallerBroker: Send + Sync + 'static {
    /// Enqueue a call for the URI's callees, with its expiring deadline
    /// marker.
    async fn call(&self, cp: &CallPayload) -> Result<(), BrokerError>;

    /// Open the result stream for the connection `conn_uuid`.
    async fn results(&self, conn_uuid: Uuid) -> Result<ResultsConn, BrokerError>;
}

/// Callee-side broker seam: stream pending calls, store results.
#[async_trait]
pub trait CalleeBroker: Send + Sync + 'static {
    /// Open a merged call stream for the given URIs.
    async fn calls(&self, uris: &[String]) -> Result<CallsConn, BrokerError>;

    /// Store the result of an invoked call. When the caller's remaining
    /// budget has lapsed the result is silently dropped.
    async fn result(&self, cp: &CallPayload, args: Box<RawValue>) -> Result<(), BrokerError>;
}

/// Pub/sub broker seam.
#[async_trait]
pub trait PubSubBroker: Send + Sync + 'static {
    /// Publish an event; any broker connection may carry it.
    async fn publish(&self, channel: &str, args: &RawValue) -> Result<(), BrokerError>;

    /// Open a dedicated subscription connection: a command handle and the
    /// event stream bound to the same upstream.
    async fn pubsub(&self) -> Result<(PubSubCtl, EventStream), BrokerError>;
}

//! Clustered Redis realization of the broker seams.
//!
//! A call produces two keys: a list entry on `juggler:calls:{uri}` and an
//! expiring marker `juggler:calls:timeout:{uri}:<msgUUID>` whose PTTL is
//! the caller's remaining deadline. Results mirror this under
//! `juggler:results:{connUUID}`. The hash tags pin each list and its
//! markers to one slot, so a bound connection can pipeline against both.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::value::RawValue;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::cluster::{self, Cluster, Command, Value};

use super::{
    pubsub, BrokerError, CallPayload, CalleeBroker, CallerBroker, CallsConn, EventStream,
    PubSubBroker, PubSubCtl, ResPayload, ResultEntry, ResultsConn,
};

/// BRPOP block window when none is configured.
pub const DEFAULT_BLOCKING_TIMEOUT: Duration = Duration::from_secs(5);
/// Deadline applied to a CALL that carries none.
pub const DEFAULT_CALL_TIMEOUT_MS: u64 = 60_000;

fn call_key(uri: &str) -> String {
    format!("juggler:calls:{{{uri}}}")
}

fn call_timeout_key(uri: &str, msg_uuid: Uuid) -> String {
    format!("juggler:calls:timeout:{{{uri}}}:{msg_uuid}")
}

fn result_key(conn_uuid: Uuid) -> String {
    format!("juggler:results:{{{conn_uuid}}}")
}

fn result_timeout_key(conn_uuid: Uuid, msg_uuid: Uuid) -> String {
    format!("juggler:results:timeout:{{{conn_uuid}}}:{msg_uuid}")
}

/// Broker over a clustered Redis upstream.
#[derive(Debug, Clone)]
pub struct RedisBroker {
    cluster: Cluster,
    blocking_timeout: Duration,
    call_cap: usize,
    result_cap: usize,
}

impl RedisBroker {
    /// Create a broker over `cluster` with default tuning.
    pub fn new(cluster: Cluster) -> Self {
        Self {
            cluster,
            blocking_timeout: DEFAULT_BLOCKING_TIMEOUT,
            call_cap: 0,
            result_cap: 0,
        }
    }

    /// Set the BRPOP block window.
    pub fn with_blocking_timeout(mut self, timeout: Duration) -> Self {
        self.blocking_timeout = timeout;
        self
    }

    /// Cap pending-call lists, trimming from the oldest end on enqueue.
    /// Trimmed calls are lost and surface as EXP on the caller. 0 leaves
    /// lists uncapped.
    pub fn with_call_cap(mut self, cap: usize) -> Self {
        self.call_cap = cap;
        self
    }

    /// Cap pending-result lists, trimming from the oldest end on enqueue.
    /// 0 leaves lists uncapped.
    pub fn with_result_cap(mut self, cap: usize) -> Self {
        self.result_cap = cap;
        self
    }

    fn blocking_secs(&self) -> String {
        self.blocking_timeout.as_secs().max(1).to_string()
    }
}

/// Atomically read and delete an expiring marker, returning its prior
/// PTTL in milliseconds (negative when it had already expired). PTTL and
/// DEL ride one pipeline on the bound connection, so no other reader can
/// interleave between them.
async fn take_pttl(conn: &cluster::Conn, key: &str) -> Result<i64, cluster::Error> {
    let replies = conn
        .pipeline(vec![
            Command::new("PTTL").arg(key),
            Command::new("DEL").arg(key),
        ])
        .await?;
    Ok(replies.first().and_then(Value::as_int).unwrap_or(-2))
}

/// Extract the payload bytes from a BRPOP `[key, payload]` reply.
fn popped_payload(value: Value) -> Option<bytes::Bytes> {
    let mut items = value.into_array()?;
    if items.len() != 2 {
        return None;
    }
    items.pop()?.into_bytes()
}

#[async_trait]
impl CallerBroker for RedisBroker {
    async fn call(&self, cp: &CallPayload) -> Result<(), BrokerError> {
        let mut cp = cp.clone();
        if cp.timeout_ms == 0 {
            cp.timeout_ms = DEFAULT_CALL_TIMEOUT_MS;
        }
        let blob = serde_json::to_vec(&cp)?;
        let to = cp.timeout_ms.to_string();
        let list = call_key(&cp.uri);

        // SET then LPUSH, pipelined but not atomic: a stray marker
        // expires on its own, a stray list entry is dropped at dequeue.
        let mut cmds = vec![
            Command::new("SET")
                .arg(call_timeout_key(&cp.uri, cp.msg_uuid))
                .arg(&to)
                .arg("PX")
                .arg(&to),
            Command::new("LPUSH").arg(&list).arg(&blob),
        ];
        if self.call_cap > 0 {
            cmds.push(
                Command::new("LTRIM")
                    .arg(&list)
                    .arg("0")
                    .arg((self.call_cap - 1).to_string()),
            );
        }

        let conn = self.cluster.get();
        let result = conn.pipeline(cmds).await;
        conn.release().await;
        result?;
        Ok(())
    }

    async fn results(&self, conn_uuid: Uuid) -> Result<ResultsConn, BrokerError> {
        let (tx, rx) = mpsc::channel(16);
        let stop = CancellationToken::new();
        tokio::spawn(results_loop(
            self.cluster.clone(),
            self.blocking_secs(),
            conn_uuid,
            tx,
            stop.child_token(),
        ));
        Ok(ResultsConn::new(rx, stop))
    }
}

#[async_trait]
impl CalleeBroker for RedisBroker {
    async fn calls(&self, uris: &[String]) -> Result<CallsConn, BrokerError> {
        let (tx, rx) = mpsc::channel(64);
        let stop = CancellationToken::new();
        for uri in uris {
            tokio::spawn(calls_loop(
                self.cluster.clone(),
                self.blocking_secs(),
                uri.clone(),
                tx.clone(),
                stop.child_token(),
            ));
        }
        Ok(CallsConn::new(rx, stop))
    }

    async fn result(&self, cp: &CallPayload, args: Box<RawValue>) -> Result<(), BrokerError> {
        let Some(budget) = cp.remaining_budget() else {
            debug!(msg = %cp.msg_uuid, uri = %cp.uri, "caller budget spent, dropping result");
            return Ok(());
        };

        let rp = ResPayload {
            msg_uuid: cp.msg_uuid,
            caller_uuid: cp.conn_uuid,
            uri: cp.uri.clone(),
            args,
        };
        let blob = serde_json::to_vec(&rp)?;
        let ms = budget.as_millis().to_string();
        let list = result_key(rp.caller_uuid);

        let mut cmds = vec![
            Command::new("SET")
                .arg(result_timeout_key(rp.caller_uuid, rp.msg_uuid))
                .arg(&ms)
                .arg("PX")
                .arg(&ms),
            Command::new("LPUSH").arg(&list).arg(&blob),
        ];
        if self.result_cap > 0 {
            cmds.push(
                Command::new("LTRIM")
                    .arg(&list)
                    .arg("0")
                    .arg((self.result_cap - 1).to_string()),
            );
        }

        let conn = self.cluster.get();
        let result = conn.pipeline(cmds).await;
        conn.release().await;
        result?;
        Ok(())
    }
}

#[async_trait]
impl PubSubBroker for RedisBroker {
    async fn publish(&self, channel: &str, args: &RawValue) -> Result<(), BrokerError> {
        self.cluster
            .retry()
            .command(Command::new("PUBLISH").arg(channel).arg(args.get()))
            .await?;
        Ok(())
    }

    async fn pubsub(&self) -> Result<(PubSubCtl, EventStream), BrokerError> {
        pubsub::open(self.cluster.clone()).await
    }
}

/// Dequeue loop for one connection's results.
async fn results_loop(
    cluster: Cluster,
    blocking_secs: String,
    conn_uuid: Uuid,
    tx: mpsc::Sender<ResultEntry>,
    stop: CancellationToken,
) {
    let list = result_key(conn_uuid);
    let (base, max_delay, max_attempts) = {
        let cfg = cluster.cfg();
        (cfg.reconnect_base, cfg.reconnect_max, cfg.max_attempts)
    };
    let mut attempt = 0u32;

    'outer: loop {
        if stop.is_cancelled() {
            break;
        }
        let conn = cluster.get();
        loop {
            let popped = tokio::select! {
                biased;
                _ = stop.cancelled() => break 'outer,
                r = conn.command(Command::new("BRPOP").arg(&list).arg(&blocking_secs)) => r,
            };
            match popped {
                Ok(Value::Nil) => {
                    attempt = 0;
                }
                Ok(value) => {
                    attempt = 0;
                    let Some(blob) = popped_payload(value) else {
                        debug!(list = %list, "unexpected BRPOP reply shape");
                        continue;
                    };
                    let rp: ResPayload = match serde_json::from_slice(&blob) {
                        Ok(rp) => rp,
                        Err(err) => {
                            debug!(%err, "dropping undecodable result payload");
                            continue;
                        }
                    };
                    let marker = result_timeout_key(conn_uuid, rp.msg_uuid);
                    match take_pttl(&conn, &marker).await {
                        Ok(pttl) => {
                            let entry = ResultEntry {
                                payload: rp,
                                expired: pttl <= 0,
                            };
                            if tx.send(entry).await.is_err() {
                                break 'outer;
                            }
                        }
                        Err(err) => {
                            debug!(%err, "result marker check failed");
                            break;
                        }
                    }
                }
                Err(err) => {
                    debug!(%err, list = %list, "result dequeue failed");
                    break;
                }
            }
        }

        if attempt >= max_attempts {
            warn!(list = %list, attempt, "result dequeue giving up");
            break;
        }
        let delay = cluster::exp_jitter_delay(attempt, base, max_delay);
        attempt += 1;
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }
    // dropping tx ends the stream; the owning connection closes with it
}

/// Dequeue loop for one URI's pending calls.
async fn calls_loop(
    cluster: Cluster,
    blocking_secs: String,
    uri: String,
    tx: mpsc::Sender<CallPayload>,
    stop: CancellationToken,
) {
    let list = call_key(&uri);
    let (base, max_delay, max_attempts) = {
        let cfg = cluster.cfg();
        (cfg.reconnect_base, cfg.reconnect_max, cfg.max_attempts)
    };
    let mut attempt = 0u32;

    'outer: loop {
        if stop.is_cancelled() {
            break;
        }
        let conn = cluster.get();
        loop {
            let popped = tokio::select! {
                biased;
                _ = stop.cancelled() => break 'outer,
                r = conn.command(Command::new("BRPOP").arg(&list).arg(&blocking_secs)) => r,
            };
            match popped {
                Ok(Value::Nil) => {
                    attempt = 0;
                }
                Ok(value) => {
                    attempt = 0;
                    let Some(blob) = popped_payload(value) else {
                        debug!(list = %list, "unexpected BRPOP reply shape");
                        continue;
                    };
                    let mut cp: CallPayload = match serde_json::from_slice(&blob) {
                        Ok(cp) => cp,
                        Err(err) => {
                            debug!(%err, "dropping undecodable call payload");
                            continue;
                        }
                    };
                    let marker = call_timeout_key(&uri, cp.msg_uuid);
                    match take_pttl(&conn, &marker).await {
                        Ok(pttl) if pttl <= 0 => {
                            debug!(msg = %cp.msg_uuid, uri = %uri, "call expired, dropping");
                        }
                        Ok(pttl) => {
                            cp.read_timestamp = Some(chrono::Utc::now());
                            cp.ttl_after_read_ms = Some(pttl as u64);
                            if tx.send(cp).await.is_err() {
                                break 'outer;
                            }
                        }
                        Err(err) => {
                            debug!(%err, "call marker check failed");
                            break;
                        }
                    }
                }
                Err(err) => {
                    debug!(%err, list = %list, "call dequeue failed");
                    break;
                }
            }
        }

        if attempt >= max_attempts {
            warn!(list = %list, attempt, "call dequeue giving up");
            break;
        }
        let delay = cluster::exp_jitter_delay(attempt, base, max_delay);
        attempt += 1;
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

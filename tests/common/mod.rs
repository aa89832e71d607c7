//! Shared test harness: an in-memory broker implementing the broker
//! seams, plus helpers to stand up a server on an ephemeral port and to
//! collect client-side messages.

#![allow(dead_code)]

pub mod ws_client;

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::value::RawValue;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc, Notify};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use juggler::broker::{
    BrokerError, CallPayload, CalleeBroker, CallerBroker, CallsConn, Event, EventStream,
    PubSubBroker, PubSubCtl, ResPayload, ResultEntry, ResultsConn, SubCmd,
};
use juggler::{ClientHandler, Msg, Server, ServerShutdown};

const SCAN_FALLBACK: Duration = Duration::from_millis(20);

struct QueuedCall {
    cp: CallPayload,
    deadline: Instant,
}

struct Shared {
    calls: Mutex<HashMap<String, VecDeque<QueuedCall>>>,
    results: Mutex<HashMap<Uuid, VecDeque<ResultEntry>>>,
    wake: Notify,
    events: broadcast::Sender<(String, String)>,
}

/// Broker over process-local queues and a broadcast bus, standing in for
/// the clustered upstream in tests.
#[derive(Clone)]
pub struct MemBroker {
    shared: Arc<Shared>,
}

impl MemBroker {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            shared: Arc::new(Shared {
                calls: Mutex::new(HashMap::new()),
                results: Mutex::new(HashMap::new()),
                wake: Notify::new(),
                events,
            }),
        }
    }
}

/// `*` matches any run of characters, everything else is literal.
fn glob_match(pattern: &str, value: &str) -> bool {
    fn inner(p: &[u8], v: &[u8]) -> bool {
        match (p.first(), v.first()) {
            (None, None) => true,
            (Some(b'*'), _) => inner(&p[1..], v) || (!v.is_empty() && inner(p, &v[1..])),
            (Some(pc), Some(vc)) if pc == vc => inner(&p[1..], &v[1..]),
            _ => false,
        }
    }
    inner(pattern.as_bytes(), value.as_bytes())
}

#[async_trait]
impl CallerBroker for MemBroker {
    async fn call(&self, cp: &CallPayload) -> Result<(), BrokerError> {
        let timeout_ms = if cp.timeout_ms == 0 { 60_000 } else { cp.timeout_ms };
        self.shared
            .calls
            .lock()
            .unwrap()
            .entry(cp.uri.clone())
            .or_default()
            .push_back(QueuedCall {
                cp: cp.clone(),
                deadline: Instant::now() + Duration::from_millis(timeout_ms),
            });
        self.shared.wake.notify_waiters();
        Ok(())
    }

    async fn results(&self, conn_uuid: Uuid) -> Result<ResultsConn, BrokerError> {
        let (tx, rx) = mpsc::channel(16);
        let stop = CancellationToken::new();
        let child = stop.child_token();
        let shared = self.shared.clone();
        tokio::spawn(async move {
            loop {
                if child.is_cancelled() {
                    break;
                }
                let entry = shared
                    .results
                    .lock()
                    .unwrap()
                    .get_mut(&conn_uuid)
                    .and_then(|q| q.pop_front());
                match entry {
                    Some(entry) => {
                        if tx.send(entry).await.is_err() {
                            break;
                        }
                    }
                    None => {
                        tokio::select! {
                            _ = child.cancelled() => break,
                            _ = shared.wake.notified() => {}
                            _ = tokio::time::sleep(SCAN_FALLBACK) => {}
                        }
                    }
                }
            }
        });
        Ok(ResultsConn::new(rx, stop))
    }
}

#[async_trait]
impl CalleeBroker for MemBroker {
    async fn calls(&self, uris: &[String]) -> Result<CallsConn, BrokerError> {
        let (tx, rx) = mpsc::channel(16);
        let stop = CancellationToken::new();
        let child = stop.child_token();
        let shared = self.shared.clone();
        let uris = uris.to_vec();
        tokio::spawn(async move {
            loop {
                if child.is_cancelled() {
                    break;
                }
                let queued = {
                    let mut calls = shared.calls.lock().unwrap();
                    uris.iter()
                        .find_map(|uri| calls.get_mut(uri).and_then(|q| q.pop_front()))
                };
                match queued {
                    Some(queued) => {
                        let now = Instant::now();
                        if queued.deadline <= now {
                            // lapsed before any callee pulled it
                            continue;
                        }
                        let mut cp = queued.cp;
                        cp.read_timestamp = Some(chrono::Utc::now());
                        cp.ttl_after_read_ms = Some((queued.deadline - now).as_millis() as u64);
                        if tx.send(cp).await.is_err() {
                            break;
                        }
                    }
                    None => {
                        tokio::select! {
                            _ = child.cancelled() => break,
                            _ = shared.wake.notified() => {}
                            _ = tokio::time::sleep(SCAN_FALLBACK) => {}
                        }
                    }
                }
            }
        });
        Ok(CallsConn::new(rx, stop))
    }

    async fn result(&self, cp: &CallPayload, args: Box<RawValue>) -> Result<(), BrokerError> {
        if cp.remaining_budget().is_none() {
            return Ok(());
        }
        let entry = ResultEntry {
            payload: ResPayload {
                msg_uuid: cp.msg_uuid,
                caller_uuid: cp.conn_uuid,
                uri: cp.uri.clone(),
                args,
            },
            expired: false,
        };
        self.shared
            .results
            .lock()
            .unwrap()
            .entry(cp.conn_uuid)
            .or_default()
            .push_back(entry);
        self.shared.wake.notify_waiters();
        Ok(())
    }
}

#[async_trait]
impl PubSubBroker for MemBroker {
    async fn publish(&self, channel: &str, args: &RawValue) -> Result<(), BrokerError> {
        let _ = self
            .shared
            .events
            .send((channel.to_owned(), args.get().to_owned()));
        Ok(())
    }

    async fn pubsub(&self) -> Result<(PubSubCtl, EventStream), BrokerError> {
        let (cmd_tx, mut cmd_rx) = mpsc::channel::<SubCmd>(16);
        let (event_tx, event_rx) = mpsc::channel(64);
        let stop = CancellationToken::new();
        let child = stop.child_token();
        let mut bus = self.shared.events.subscribe();
        tokio::spawn(async move {
            let mut subs: HashSet<(String, bool)> = HashSet::new();
            loop {
                tokio::select! {
                    _ = child.cancelled() => break,
                    cmd = cmd_rx.recv() => {
                        let Some(cmd) = cmd else { break };
                        let entry = (cmd.channel, cmd.pattern);
                        if cmd.subscribe {
                            subs.insert(entry);
                        } else {
                            subs.remove(&entry);
                        }
                    }
                    published = bus.recv() => {
                        let Ok((channel, json)) = published else { break };
                        let matched = subs.iter().find(|(sub, pattern)| {
                            if *pattern {
                                glob_match(sub, &channel)
                            } else {
                                sub == &channel
                            }
                        });
                        if let Some((sub, pattern)) = matched {
                            let event = Event {
                                channel: channel.clone(),
                                pattern: (*pattern).then(|| sub.clone()),
                                args: RawValue::from_string(json).unwrap(),
                            };
                            if event_tx.send(event).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            }
        });
        Ok((PubSubCtl::new(cmd_tx), EventStream::new(event_rx, stop)))
    }
}

/// Callee handler shared by the scenarios: `add` sums a two-element
/// array, `big` returns a payload large enough to trip write limits,
/// `boom` always fails.
pub struct TestThunk;

#[async_trait]
impl juggler::CallHandler for TestThunk {
    async fn call(&self, cp: &CallPayload) -> Result<Box<RawValue>, String> {
        match cp.uri.as_str() {
            "add" => {
                let (a, b): (i64, i64) =
                    serde_json::from_str(cp.args.get()).map_err(|e| e.to_string())?;
                serde_json::value::to_raw_value(&(a + b)).map_err(|e| e.to_string())
            }
            "big" => {
                let blob = "x".repeat(16 * 1024);
                serde_json::value::to_raw_value(&blob).map_err(|e| e.to_string())
            }
            "boom" => Err("kaboom".into()),
            other => Err(format!("unknown uri {other}")),
        }
    }
}

/// Opt into test logging with `RUST_LOG=juggler=trace cargo test`.
fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

/// Bind an ephemeral port and serve `server` on it. Returns the ws url.
pub async fn start_server(server: Server) -> (String, ServerShutdown) {
    init_logging();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let shutdown = Arc::new(server).serve(listener).await;
    (format!("ws://{addr}"), shutdown)
}

/// Client handler funneling every delivered message into a channel.
pub struct Collector {
    tx: mpsc::UnboundedSender<Msg>,
}

#[async_trait]
impl ClientHandler for Collector {
    async fn handle(&self, msg: Msg) {
        let _ = self.tx.send(msg);
    }
}

pub fn collector() -> (Arc<Collector>, mpsc::UnboundedReceiver<Msg>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Arc::new(Collector { tx }), rx)
}

/// Receive the next collected message, failing the test after 5s.
pub async fn next_msg(rx: &mut mpsc::UnboundedReceiver<Msg>) -> Msg {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for a message")
        .expect("collector channel closed")
}

//! Slot-aware connection multiplexer for a clustered key/value upstream.
//!
//! Keys map to one of 16384 slots ([`slot`]); each slot is owned by one
//! node. A [`Cluster`] tracks the slot→node table (updated from MOVED
//! replies), pools connections per node, and hands out lazily-bound
//! [`Conn`]s: a connection picks its upstream on first use, from the first
//! command's key, and stays bound for its lifetime. The [`RetryConn`]
//! wrapper replays single commands across MOVED/ASK redirections.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use tokio::net::TcpStream;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::codec::Framed;
use tracing::{debug, trace};

mod conn;
pub mod resp;
mod retry;
pub mod slot;

pub use conn::Conn;
pub use resp::{Command, Value};
pub use retry::RetryConn;
pub use slot::slot;

/// Failures at the cluster transport layer.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Network failure talking to an upstream node.
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    /// The upstream sent bytes that are not valid RESP.
    #[error("protocol: {0}")]
    Protocol(String),

    /// The upstream answered with an error reply.
    #[error("upstream error: {0}")]
    Reply(String),

    /// The addressed slot has moved to another node.
    #[error("slot {slot} moved to {addr}")]
    Moved {
        /// The redirected slot.
        slot: u16,
        /// The node now owning the slot.
        addr: String,
    },

    /// The addressed slot is migrating; retry on `addr` after `ASKING`.
    #[error("slot {slot} asks redirection to {addr}")]
    Ask {
        /// The migrating slot.
        slot: u16,
        /// The node to ask.
        addr: String,
    },

    /// `bind` was called on a connection that already has an upstream.
    #[error("connection already bound to a node")]
    AlreadyBound,

    /// `bind` was called with keys hashing to different slots.
    #[error("keys do not belong to the same slot")]
    CrossSlot,

    /// The cluster was created without any node address.
    #[error("no upstream nodes configured")]
    NoNodes,

    /// The per-node connection cap is reached.
    #[error("node {addr}: connection limit reached")]
    PoolExhausted {
        /// The saturated node.
        addr: String,
    },

    /// A retried command exhausted its attempt budget.
    #[error("command failed after {0} attempts")]
    MaxAttempts(u32),

    /// The connection was closed by the upstream or locally.
    #[error("connection closed")]
    Closed,
}

/// Tuning knobs for a [`Cluster`].
#[derive(Debug, Clone)]
pub struct Config {
    /// Per-node cap on live connections; 0 means unlimited.
    pub pool_max_active: usize,
    /// Per-node cap on idle pooled connections.
    pub pool_max_idle: usize,
    /// Idle connections older than this are discarded; zero disables.
    pub pool_idle_timeout: Duration,
    /// Base delay of the reconnect back-off.
    pub reconnect_base: Duration,
    /// Upper bound of the reconnect back-off window.
    pub reconnect_max: Duration,
    /// Attempt budget for [`RetryConn`] and for broker dequeue loops.
    pub max_attempts: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            pool_max_active: 0,
            pool_max_idle: 8,
            pool_idle_timeout: Duration::from_secs(300),
            reconnect_base: Duration::from_secs(1),
            reconnect_max: Duration::from_secs(60),
            max_attempts: 4,
        }
    }
}

/// Uniformly jittered exponential back-off: attempt `n` sleeps a random
/// duration in `[0, min(max, base * 2^n))`.
pub(crate) fn exp_jitter_delay(attempt: u32, base: Duration, max: Duration) -> Duration {
    let base_ms = base.as_millis() as u64;
    let top = base_ms
        .saturating_mul(2u64.saturating_pow(attempt))
        .min(max.as_millis() as u64)
        .max(1);
    Duration::from_millis(rand::rng().random_range(0..top))
}

/// One pooled or dedicated connection to a single upstream node.
///
/// Not safe for concurrent command issuance; the owning [`Conn`] or loop
/// serializes access.
pub(crate) struct NodeConn {
    addr: String,
    framed: Framed<TcpStream, resp::RespCodec>,
    created: Instant,
    // holding the permit while idle keeps the per-node cap honest
    _permit: Option<OwnedSemaphorePermit>,
}

impl std::fmt::Debug for NodeConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeConn").field("addr", &self.addr).finish()
    }
}

impl NodeConn {
    async fn connect(addr: &str, permit: Option<OwnedSemaphorePermit>) -> Result<Self, Error> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Ok(Self {
            addr: addr.to_owned(),
            framed: Framed::new(stream, resp::RespCodec),
            created: Instant::now(),
            _permit: permit,
        })
    }

    pub(crate) fn addr(&self) -> &str {
        &self.addr
    }

    /// Surrender the framed transport, for owners that drive the socket
    /// directly (the pub/sub connection driver).
    pub(crate) fn into_framed(self) -> Framed<TcpStream, resp::RespCodec> {
        self.framed
    }

    async fn read_reply(&mut self) -> Result<Value, Error> {
        match self.framed.next().await {
            Some(reply) => reply,
            None => Err(Error::Closed),
        }
    }

    /// Send one command and read its reply. Error replies come back as
    /// typed [`Error`]s.
    pub(crate) async fn command(&mut self, cmd: Command) -> Result<Value, Error> {
        trace!(addr = %self.addr, cmd = %String::from_utf8_lossy(cmd.name()), "command");
        self.framed.send(cmd).await?;
        self.read_reply().await?.into_result()
    }

    /// Send several commands in one flush and read one reply per command.
    /// All replies are drained before the first error reply is surfaced.
    pub(crate) async fn pipeline(&mut self, cmds: Vec<Command>) -> Result<Vec<Value>, Error> {
        let n = cmds.len();
        for cmd in cmds {
            self.framed.feed(cmd).await?;
        }
        self.framed.flush().await?;

        let mut raw = Vec::with_capacity(n);
        for _ in 0..n {
            raw.push(self.read_reply().await?);
        }
        raw.into_iter().map(Value::into_result).collect()
    }
}

struct NodePool {
    idle: VecDeque<NodeConn>,
    limit: Option<Arc<Semaphore>>,
}

struct Shared {
    cfg: Config,
    /// All known node addresses, seeded at creation and grown from MOVED.
    addrs: RwLock<Vec<String>>,
    /// slot → owning node, learned lazily from MOVED replies.
    slots: RwLock<HashMap<u16, String>>,
    pools: Mutex<HashMap<String, NodePool>>,
}

/// Handle to the cluster: slot table, node pools, connection hand-out.
///
/// Cheap to clone; all clones share the same state.
#[derive(Clone)]
pub struct Cluster {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for Cluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cluster")
            .field("addrs", &*self.shared.addrs.read())
            .finish_non_exhaustive()
    }
}

impl Cluster {
    /// Create a cluster over the given seed node addresses.
    pub fn new(addrs: impl IntoIterator<Item = impl Into<String>>, cfg: Config) -> Self {
        Self {
            shared: Arc::new(Shared {
                cfg,
                addrs: RwLock::new(addrs.into_iter().map(Into::into).collect()),
                slots: RwLock::new(HashMap::new()),
                pools: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub(crate) fn cfg(&self) -> &Config {
        &self.shared.cfg
    }

    /// A new multiplexed connection, unbound until first use.
    pub fn get(&self) -> Conn {
        Conn::new(self.clone())
    }

    /// A retrying single-command wrapper following MOVED/ASK replies.
    pub fn retry(&self) -> RetryConn {
        RetryConn::new(self.clone(), self.shared.cfg.max_attempts)
    }

    /// Record a MOVED redirection in the shared slot table.
    pub(crate) fn note_moved(&self, moved_slot: u16, addr: &str) {
        debug!(slot = moved_slot, %addr, "slot moved");
        self.shared
            .slots
            .write()
            .insert(moved_slot, addr.to_owned());
        let mut addrs = self.shared.addrs.write();
        if !addrs.iter().any(|a| a == addr) {
            addrs.push(addr.to_owned());
        }
    }

    /// The node currently believed to own `slot`, or a random node when
    /// the slot is unknown or unspecified.
    fn addr_for(&self, target: Option<u16>) -> Result<String, Error> {
        if let Some(s) = target {
            if let Some(addr) = self.shared.slots.read().get(&s) {
                return Ok(addr.clone());
            }
        }
        let addrs = self.shared.addrs.read();
        if addrs.is_empty() {
            return Err(Error::NoNodes);
        }
        Ok(addrs[rand::rng().random_range(0..addrs.len())].clone())
    }

    fn pop_idle(&self, addr: &str) -> Option<NodeConn> {
        let idle_timeout = self.shared.cfg.pool_idle_timeout;
        let mut pools = self.shared.pools.lock();
        let pool = pools.get_mut(addr)?;
        while let Some(nc) = pool.idle.pop_front() {
            if idle_timeout.is_zero() || nc.created.elapsed() < idle_timeout {
                return Some(nc);
            }
            // stale, drop it (permit released with it)
        }
        None
    }

    fn node_limit(&self, addr: &str) -> Option<Arc<Semaphore>> {
        let max = self.shared.cfg.pool_max_active;
        if max == 0 {
            return None;
        }
        let mut pools = self.shared.pools.lock();
        let pool = pools.entry(addr.to_owned()).or_insert_with(|| NodePool {
            idle: VecDeque::new(),
            limit: None,
        });
        if pool.limit.is_none() {
            pool.limit = Some(Arc::new(Semaphore::new(max)));
        }
        pool.limit.clone()
    }

    /// Check out a connection to the node owning `target` (or any node).
    /// Reuses an idle pooled connection when one is fresh.
    pub(crate) async fn checkout(&self, target: Option<u16>) -> Result<NodeConn, Error> {
        let addr = self.addr_for(target)?;
        if let Some(nc) = self.pop_idle(&addr) {
            return Ok(nc);
        }
        let permit = match self.node_limit(&addr) {
            Some(sem) => Some(
                sem.try_acquire_owned()
                    .map_err(|_| Error::PoolExhausted { addr: addr.clone() })?,
            ),
            None => None,
        };
        NodeConn::connect(&addr, permit).await
    }

    /// Dial a specific node directly. The connection is never pooled and
    /// not counted against the node cap; redirect targets and pub/sub
    /// connections use this.
    pub(crate) async fn dial(&self, addr: &str) -> Result<NodeConn, Error> {
        NodeConn::connect(addr, None).await
    }

    /// Dial a random node directly, bypassing the pools. Used for pub/sub
    /// connections, whose subscription state must never be shared.
    pub(crate) async fn dial_any(&self) -> Result<NodeConn, Error> {
        let addr = self.addr_for(None)?;
        self.dial(&addr).await
    }

    /// Return a healthy bound connection to its node's idle pool.
    pub(crate) fn release(&self, nc: NodeConn) {
        let max_idle = self.shared.cfg.pool_max_idle;
        let mut pools = self.shared.pools.lock();
        let pool = pools.entry(nc.addr.clone()).or_insert_with(|| NodePool {
            idle: VecDeque::new(),
            limit: None,
        });
        if pool.idle.len() < max_idle {
            pool.idle.push_back(nc);
        }
        // over the cap: drop, releasing the permit
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jitter_stays_in_window() {
        let base = Duration::from_secs(1);
        let max = Duration::from_secs(60);
        for attempt in 0..12 {
            let cap = Duration::from_millis(
                (base.as_millis() as u64)
                    .saturating_mul(2u64.saturating_pow(attempt))
                    .min(max.as_millis() as u64),
            );
            for _ in 0..50 {
                assert!(exp_jitter_delay(attempt, base, max) < cap.max(Duration::from_millis(1)));
            }
        }
    }

    #[test]
    fn moved_updates_table_and_nodes() {
        let cluster = Cluster::new(["127.0.0.1:7000"], Config::default());
        cluster.note_moved(3999, "127.0.0.1:7001");
        assert_eq!(cluster.addr_for(Some(3999)).unwrap(), "127.0.0.1:7001");
        assert_eq!(cluster.shared.addrs.read().len(), 2);
        // unknown slots fall back to a known node
        let addr = cluster.addr_for(Some(1)).unwrap();
        assert!(addr == "127.0.0.1:7000" || addr == "127.0.0.1:7001");
    }

    #[test]
    fn empty_cluster_refuses() {
        let cluster = Cluster::new(Vec::<String>::new(), Config::default());
        assert!(matches!(cluster.addr_for(None), Err(Error::NoNodes)));
    }
}

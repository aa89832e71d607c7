//! Single-command retrying wrapper.
//!
//! Pipelines cannot be replayed safely across a redirection (part of the
//! batch may already have succeeded), so redirection handling is offered
//! only here: one command at a time, following MOVED and ASK replies and
//! backing off on broken upstreams, up to the configured attempt budget.

use tracing::debug;

use super::resp::{Command, Value};
use super::slot::slot;
use super::{exp_jitter_delay, Cluster, Error, NodeConn};

/// Replays a single command across MOVED/ASK redirections.
#[derive(Debug)]
pub struct RetryConn {
    cluster: Cluster,
    max_attempts: u32,
}

impl RetryConn {
    pub(crate) fn new(cluster: Cluster, max_attempts: u32) -> Self {
        Self {
            cluster,
            max_attempts: max_attempts.max(1),
        }
    }

    /// Execute `cmd`, following redirections. Each attempt uses a fresh
    /// upstream: the slot-table owner first, then whatever node the
    /// redirect named.
    pub async fn command(&self, cmd: Command) -> Result<Value, Error> {
        let base_slot = cmd.key().map(|k| slot(&String::from_utf8_lossy(k)));
        let mut redirect: Option<String> = None;
        let mut asking = false;
        let mut last_err = Error::MaxAttempts(self.max_attempts);

        for attempt in 0..self.max_attempts {
            let mut nc = match self.connect(base_slot, redirect.as_deref()).await {
                Ok(nc) => nc,
                Err(err) => {
                    debug!(%err, attempt, "retry: connect failed");
                    last_err = err;
                    self.backoff(attempt).await;
                    continue;
                }
            };

            if asking {
                if let Err(err) = nc.command(Command::new("ASKING")).await {
                    last_err = err;
                    self.backoff(attempt).await;
                    continue;
                }
            }

            match nc.command(cmd.clone()).await {
                Ok(value) => {
                    self.release(nc, redirect.is_none());
                    return Ok(value);
                }
                Err(Error::Moved { slot: s, addr }) => {
                    self.cluster.note_moved(s, &addr);
                    redirect = Some(addr);
                    asking = false;
                }
                Err(Error::Ask { addr, .. }) => {
                    redirect = Some(addr);
                    asking = true;
                }
                Err(err @ (Error::Io(_) | Error::Closed | Error::Protocol(_))) => {
                    debug!(%err, attempt, "retry: upstream failed");
                    last_err = err;
                    redirect = None;
                    asking = false;
                    self.backoff(attempt).await;
                }
                // a plain error reply is final
                Err(err) => return Err(err),
            }
        }
        Err(last_err)
    }

    async fn connect(&self, base_slot: Option<u16>, redirect: Option<&str>) -> Result<NodeConn, Error> {
        match redirect {
            Some(addr) => self.cluster.dial(addr).await,
            None => self.cluster.checkout(base_slot).await,
        }
    }

    fn release(&self, nc: NodeConn, pooled: bool) {
        if pooled {
            self.cluster.release(nc);
        }
        // redirect targets were dialed directly and are simply dropped
    }

    async fn backoff(&self, attempt: u32) {
        let cfg = self.cluster.cfg();
        tokio::time::sleep(exp_jitter_delay(
            attempt,
            cfg.reconnect_base,
            cfg.reconnect_max,
        ))
        .await;
    }
}

//! A lazily-bound multiplexed connection.
//!
//! A [`Conn`] handed out by [`Cluster::get`] has no upstream yet. It binds
//! on first use: a keyed command binds to the node owning the key's slot,
//! a keyless operation binds to a random node, and [`Conn::bind`] forces
//! the choice from explicit keys. Binding is one-shot; once bound, every
//! command goes verbatim to that node.

use tokio::sync::Mutex;

use super::resp::{Command, Value};
use super::slot::slot;
use super::{Cluster, Error, NodeConn};

enum BindState {
    Unbound,
    Bound(NodeConn),
    /// The upstream failed; the connection is unusable and will not be
    /// returned to a pool.
    Broken,
}

/// A cluster connection, bound to one node on first use.
///
/// The send/receive pair is guarded internally, but the connection is
/// meant for a single producer: concurrent callers would interleave
/// their commands.
pub struct Conn {
    cluster: Cluster,
    state: Mutex<BindState>,
}

impl std::fmt::Debug for Conn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Conn").finish_non_exhaustive()
    }
}

fn key_slot(cmd: &Command) -> Option<u16> {
    cmd.key().map(|k| slot(&String::from_utf8_lossy(k)))
}

impl Conn {
    pub(crate) fn new(cluster: Cluster) -> Self {
        Self {
            cluster,
            state: Mutex::new(BindState::Unbound),
        }
    }

    /// Bind to the node owning the slot of the given keys. All keys must
    /// hash to the same slot, and the connection must still be unbound.
    pub async fn bind(&self, keys: &[&str]) -> Result<(), Error> {
        let mut target = None;
        for key in keys {
            let s = slot(key);
            if target.is_some_and(|t| t != s) {
                return Err(Error::CrossSlot);
            }
            target = Some(s);
        }

        let mut state = self.state.lock().await;
        match &*state {
            BindState::Unbound => {
                let nc = self.cluster.checkout(target).await?;
                *state = BindState::Bound(nc);
                Ok(())
            }
            BindState::Bound(_) => Err(Error::AlreadyBound),
            BindState::Broken => Err(Error::Closed),
        }
    }

    async fn ensure_bound<'a>(
        &self,
        state: &'a mut BindState,
        target: Option<u16>,
    ) -> Result<&'a mut NodeConn, Error> {
        if let BindState::Unbound = state {
            *state = BindState::Bound(self.cluster.checkout(target).await?);
        }
        match state {
            BindState::Bound(nc) => Ok(nc),
            _ => Err(Error::Closed),
        }
    }

    /// Record what an upstream error means for this connection: MOVED
    /// feeds the shared slot table, transport failures break the binding.
    fn observe(&self, state: &mut BindState, err: &Error) {
        match err {
            Error::Moved { slot, addr } => self.cluster.note_moved(*slot, addr),
            Error::Io(_) | Error::Closed | Error::Protocol(_) => *state = BindState::Broken,
            _ => {}
        }
    }

    /// Send one command and read its reply, binding from the command's
    /// key on first use.
    pub async fn command(&self, cmd: Command) -> Result<Value, Error> {
        let target = key_slot(&cmd);
        let mut state = self.state.lock().await;
        let nc = self.ensure_bound(&mut state, target).await?;
        let result = nc.command(cmd).await;
        if let Err(err) = &result {
            self.observe(&mut state, err);
        }
        result
    }

    /// Send a batch of commands in one flush and collect one reply per
    /// command, binding from the first command's key on first use.
    pub async fn pipeline(&self, cmds: Vec<Command>) -> Result<Vec<Value>, Error> {
        let target = cmds.first().and_then(key_slot);
        let mut state = self.state.lock().await;
        let nc = self.ensure_bound(&mut state, target).await?;
        let result = nc.pipeline(cmds).await;
        if let Err(err) = &result {
            self.observe(&mut state, err);
        }
        result
    }

    /// The node this connection is bound to, when bound.
    pub async fn bound_addr(&self) -> Option<String> {
        match &*self.state.lock().await {
            BindState::Bound(nc) => Some(nc.addr().to_owned()),
            _ => None,
        }
    }

    /// Return the connection to its origin pool. A broken or unbound
    /// connection is discarded instead.
    pub async fn release(self) {
        let mut state = self.state.lock().await;
        if let BindState::Bound(nc) = std::mem::replace(&mut *state, BindState::Broken) {
            self.cluster.release(nc);
        }
    }
}

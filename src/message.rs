//! Request messages carried from caller threads to the protocol thread.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use tracing::trace;

use crate::addr::SocketAddr;
use crate::context::PoolSlot;
use crate::endpoint::{Connection, SendOutcome};
use crate::engine::Engine;
use crate::error::{Error, Result};

/// An operation and its inputs.
#[derive(Debug)]
pub(crate) enum Operation {
    /// Allocate a control block for the endpoint.
    Open,
    /// Bind to a local address.
    Bind { addr: SocketAddr },
    /// Start listening for incoming connections.
    Listen { backlog: u8 },
    /// Queue data for transmission. Owned, so a caller that stops waiting
    /// never leaves the protocol thread with a dangling buffer.
    Send { data: Bytes },
    /// Start an active open.
    Connect { addr: SocketAddr },
    /// Shut down one or both halves.
    Shutdown { rx: bool, tx: bool },
    /// Close or abort, optionally notifying the owner.
    Close { notify: bool },
    /// Read the local address.
    LocalAddr,
    /// Read the remote address.
    PeerAddr,
}

/// Typed outputs of an [`Operation`].
#[derive(Debug)]
pub(crate) enum Output {
    Done,
    Sent(SendOutcome),
    Addr(SocketAddr),
}

impl Output {
    pub(crate) fn into_sent(self) -> SendOutcome {
        match self {
            Output::Sent(outcome) => outcome,
            other => unreachable!("send produced {other:?}"),
        }
    }

    pub(crate) fn into_addr(self) -> SocketAddr {
        match self {
            Output::Addr(addr) => addr,
            other => unreachable!("address query produced {other:?}"),
        }
    }
}

/// One in-flight marshaled call.
///
/// The message slot is held until the request is dropped, by whichever side
/// is last to let go of it: the protocol thread after running it, or the
/// run queue if it is discarded unexecuted.
pub(crate) struct Request<E> {
    conn: Arc<Connection<E>>,
    op: Operation,
    _slot: PoolSlot,
}

impl<E: Engine> Request<E> {
    /// Allocates a message for `op` on `conn`. Fails with
    /// [`Error::NoMemory`] before anything else is touched if the message
    /// pool is exhausted.
    pub(crate) fn new(conn: &Arc<Connection<E>>, op: Operation) -> Result<Self> {
        let slot = conn
            .tcpip()
            .context()
            .messages()
            .try_alloc()
            .ok_or(Error::NoMemory)?;

        Ok(Request {
            conn: Arc::clone(conn),
            op,
            _slot: slot,
        })
    }

    /// Runs the operation. Only ever called on the protocol thread.
    pub(crate) fn execute(self, engine: &mut E) -> Result<Output> {
        trace!("executing {:?}", self.op);

        let conn = &self.conn;

        match self.op {
            Operation::Open => conn.conn_open(engine).map(|()| Output::Done),
            Operation::Bind { addr } => conn.conn_bind(engine, addr).map(|()| Output::Done),
            Operation::Listen { backlog } => {
                conn.conn_listen(engine, backlog).map(|()| Output::Done)
            }
            Operation::Send { ref data } => conn.conn_send(engine, data).map(Output::Sent),
            Operation::Connect { addr } => conn.conn_connect(engine, addr).map(|()| Output::Done),
            Operation::Shutdown { rx, tx } => {
                conn.conn_shutdown(engine, rx, tx).map(|()| Output::Done)
            }
            Operation::Close { notify } => conn.conn_close(engine, notify).map(|()| Output::Done),
            Operation::LocalAddr => conn.conn_local_addr(engine).map(Output::Addr),
            Operation::PeerAddr => conn.conn_peer_addr(engine).map(Output::Addr),
        }
    }
}

impl<E> fmt::Debug for Request<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request").field("op", &self.op).finish()
    }
}

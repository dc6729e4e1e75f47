//! The downward interface to the single-threaded protocol engine.
//!
//! The engine owns every control block and runs exclusively on the protocol
//! thread. This layer only ever refers to a control block through an opaque
//! [`Pcb`] handle, and receives asynchronous notifications through the
//! handler functions it registers per control block.

use std::fmt;
use std::ops::BitOr;
use std::sync::Weak;

use bytes::Bytes;

use crate::addr::SocketAddr;
use crate::endpoint::Connection;
use crate::error::{EngineError, EngineResult};

#[cfg(test)]
pub(crate) mod mock;

/// Opaque handle to an engine control block.
#[derive(Debug, Copy, Clone, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct Pcb(u32);

impl Pcb {
    /// Wraps an engine-assigned control block identifier.
    pub const fn new(id: u32) -> Self {
        Pcb(id)
    }

    /// The engine-assigned identifier.
    pub const fn id(self) -> u32 {
        self.0
    }
}

impl fmt::Display for Pcb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pcb#{}", self.0)
    }
}

/// Connection states of a control block, as described in [RFC 793].
///
/// [RFC 793]: https://www.rfc-editor.org/rfc/rfc793
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
#[allow(non_camel_case_types)]
#[allow(clippy::upper_case_acronyms)]
pub enum TcpState {
    /// Represents no connection state at all.
    CLOSED,
    /// Represents waiting for a connection request from any remote TCP and
    /// port.
    LISTEN,
    /// Represents waiting for a matching connection request after having sent a
    /// connection request.
    SYN_SENT,
    /// Represents waiting for a confirming connection request acknowledgment
    /// after having both received and sent a connection request.
    SYN_RECEIVED,
    /// Represents an open connection, the normal state for the data transfer
    /// phase of the connection.
    ESTABLISHED,
    /// Represents waiting for a connection termination request from the remote
    /// TCP, or an acknowledgment of the connection termination request
    /// previously sent.
    FIN_WAIT_1,
    /// Represents waiting for a connection termination request from the remote
    /// TCP.
    FIN_WAIT_2,
    /// Represents waiting for a connection termination request from the local
    /// user.
    CLOSE_WAIT,
    /// Represents waiting for a connection termination request acknowledgment
    /// from the remote TCP.
    CLOSING,
    /// Represents waiting for an acknowledgment of the connection termination
    /// request previously sent to the remote TCP.
    LAST_ACK,
    /// Represents waiting for enough time to pass to be sure the remote TCP
    /// received the acknowledgment of its connection termination request.
    TIME_WAIT,
}

impl TcpState {
    /// Returns `true` for the states that precede any data transfer.
    pub fn is_pre_data(self) -> bool {
        matches!(self, TcpState::CLOSED | TcpState::LISTEN | TcpState::SYN_SENT)
    }
}

/// A received segment: a reference-counted chain of buffers.
///
/// Cloning shares the underlying buffers. The buffers are released when the
/// last clone is dropped, from whichever thread that happens on.
#[derive(Debug, Clone, Default)]
pub struct Segment {
    chain: Vec<Bytes>,
    len: usize,
}

impl Segment {
    /// Creates a segment holding a single buffer.
    pub fn new(buf: impl Into<Bytes>) -> Self {
        let mut segment = Segment::default();
        segment.push(buf.into());
        segment
    }

    /// Appends a buffer to the end of the chain.
    pub fn push(&mut self, buf: Bytes) {
        if buf.is_empty() {
            return;
        }

        self.len += buf.len();
        self.chain.push(buf);
    }

    /// Total payload length across the chain.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns `true` if the segment carries no payload.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Copies payload starting at `offset` into `dst`, returning the number of
    /// bytes copied (the smaller of `dst.len()` and the bytes left after
    /// `offset`).
    pub fn copy_partial(&self, dst: &mut [u8], mut offset: usize) -> usize {
        let mut copied = 0;

        for buf in &self.chain {
            if copied == dst.len() {
                break;
            }

            if offset >= buf.len() {
                offset -= buf.len();
                continue;
            }

            let src = &buf[offset..];
            let n = src.len().min(dst.len() - copied);
            dst[copied..copied + n].copy_from_slice(&src[..n]);

            copied += n;
            offset = 0;
        }

        copied
    }
}

impl FromIterator<Bytes> for Segment {
    fn from_iter<I: IntoIterator<Item = Bytes>>(iter: I) -> Self {
        let mut segment = Segment::default();
        for buf in iter {
            segment.push(buf);
        }
        segment
    }
}

/// Flags passed to [`Engine::write`].
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct WriteFlags(u8);

impl WriteFlags {
    /// The engine copies the data instead of referencing the caller's buffer.
    pub const COPY: WriteFlags = WriteFlags(0x01);
    /// More data follows; the engine should not set the push flag yet.
    pub const MORE: WriteFlags = WriteFlags(0x02);

    /// Returns `true` if every flag in `other` is set.
    pub fn contains(self, other: WriteFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for WriteFlags {
    type Output = WriteFlags;

    fn bitor(self, rhs: WriteFlags) -> WriteFlags {
        WriteFlags(self.0 | rhs.0)
    }
}

/// Per-control-block argument handed back to every handler.
///
/// `None`, or a link that no longer upgrades, means the endpoint has already
/// been torn down and the handler must not touch it.
pub type Arg<E> = Weak<Connection<E>>;

/// A segment refused by the data-arrived handler. The engine keeps it and
/// delivers it again later.
#[derive(Debug)]
pub struct Refused(pub Segment);

/// Data arrived (`Some`) or the peer closed its half (`None`).
pub type RecvFn<E> =
    fn(Option<Arg<E>>, &mut E, Pcb, Option<Segment>, EngineResult) -> Result<(), Refused>;

/// Previously sent data was acknowledged, opening `usize` bytes of send
/// buffer.
pub type SentFn<E> = fn(Option<Arg<E>>, &mut E, Pcb, usize) -> EngineResult;

/// A listening control block produced a new connection. Returning an error
/// refuses it.
pub type AcceptFn<E> = fn(Option<Arg<E>>, &mut E, Pcb, Pcb, EngineResult) -> EngineResult;

/// An active open finished.
pub type ConnectedFn<E> = fn(Option<Arg<E>>, &mut E, Pcb, EngineResult) -> EngineResult;

/// A fatal error occurred. The control block has already been freed by the
/// engine when this runs.
pub type ErrFn<E> = fn(Option<Arg<E>>, &mut E, EngineError);

/// The single-threaded protocol engine.
///
/// Every method is only ever called on the protocol thread. Handlers
/// registered through the `set_*` methods may be invoked from within any
/// engine call, including the ones this layer makes; an implementation must
/// not hold internal borrows across a handler invocation.
pub trait Engine: Send + Sized + 'static {
    /// Allocates a new control block in the `CLOSED` state.
    fn new_pcb(&mut self) -> Option<Pcb>;

    /// Current state of a control block.
    fn state(&self, pcb: Pcb) -> TcpState;

    /// Sets the argument passed to every handler of `pcb`.
    fn set_arg(&mut self, pcb: Pcb, arg: Option<Arg<Self>>);

    /// The argument currently attached to `pcb`.
    fn arg(&self, pcb: Pcb) -> Option<Arg<Self>>;

    /// Registers the data-arrived handler.
    fn set_recv(&mut self, pcb: Pcb, handler: RecvFn<Self>);

    /// Registers the send-window-opened handler.
    fn set_sent(&mut self, pcb: Pcb, handler: SentFn<Self>);

    /// Registers the fatal-error handler.
    fn set_err(&mut self, pcb: Pcb, handler: ErrFn<Self>);

    /// Registers the incoming-connection handler on a listening control
    /// block.
    fn set_accept(&mut self, pcb: Pcb, handler: AcceptFn<Self>);

    /// Allows binding to an address still held by a connection in
    /// `TIME_WAIT`.
    fn set_reuse_addr(&mut self, pcb: Pcb, reuse: bool);

    /// Binds a control block to a local address.
    fn bind(&mut self, pcb: Pcb, addr: SocketAddr) -> EngineResult;

    /// Turns a bound control block into a listening one. The engine may free
    /// `pcb` and return a different handle for the listener.
    fn listen(&mut self, pcb: Pcb, backlog: u8) -> Result<Pcb, EngineError>;

    /// Tells a listener that one pending connection was accepted.
    fn accepted(&mut self, listener: Pcb);

    /// Starts an active open. `connected` runs once it completes.
    fn connect(&mut self, pcb: Pcb, addr: SocketAddr, connected: ConnectedFn<Self>) -> EngineResult;

    /// Bytes of send buffer currently available.
    fn send_buffer(&self, pcb: Pcb) -> usize;

    /// Queues data for transmission.
    fn write(&mut self, pcb: Pcb, data: &[u8], flags: WriteFlags) -> EngineResult;

    /// Transmits queued data now.
    fn output(&mut self, pcb: Pcb) -> EngineResult;

    /// Reports `len` bytes as taken by the application, opening the receive
    /// window.
    fn recved(&mut self, pcb: Pcb, len: usize);

    /// Shuts down one or both halves of a connection.
    fn shutdown(&mut self, pcb: Pcb, rx: bool, tx: bool) -> EngineResult;

    /// Starts a graceful close. Fails if the close cannot be started yet (for
    /// example, unsent data), in which case `pcb` stays valid.
    fn close(&mut self, pcb: Pcb) -> EngineResult;

    /// Resets the connection and frees `pcb`. Cannot fail.
    fn abort(&mut self, pcb: Pcb);

    /// Local address of a control block.
    fn local_addr(&self, pcb: Pcb) -> SocketAddr;

    /// Remote address of a control block.
    fn peer_addr(&self, pcb: Pcb) -> SocketAddr;

    /// Drives the engine's timers. Called periodically on the protocol
    /// thread.
    fn tick(&mut self) {}
}

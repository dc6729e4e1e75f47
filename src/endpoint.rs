//! Connection endpoints and their lifecycle.
//!
//! An [`Endpoint`] is the caller-facing side of one engine control block. Every
//! operation that touches the control block is marshaled onto the protocol
//! thread; reads are served straight from the endpoint's packet queue on the
//! calling thread.
//!
//! The control block handle moves through `Open -> Closing -> Closed` under
//! the endpoint lock. `Closing` covers the window in which the protocol
//! thread is inside an engine call that may tear the control block down, so
//! any handler firing during that call sees the endpoint as already closed.

use std::fmt;
use std::sync::{Arc, Weak};
use std::task::Poll;

use bytes::Bytes;
use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, trace, warn};

use crate::addr::SocketAddr;
use crate::callbacks;
use crate::engine::{Engine, Pcb, Refused, Segment, TcpState, WriteFlags};
use crate::error::{EngineError, Error, Result};
use crate::message::{Operation, Request};
use crate::queue::{PacketQueue, QueueEntry};
use crate::tcpip::Tcpip;

/// Receiver of asynchronous endpoint events.
///
/// Every method runs on the protocol thread, with the engine lent to it so
/// the owner can react inline (for example with [`Endpoint::close_safe`]).
/// The endpoint only holds a weak link to its owner: once the owner is
/// dropped or detached, no more events are delivered.
pub trait EndpointOwner<E>: Send + Sync {
    /// New data is queued, or the receive half has shut down and the next
    /// read will report it.
    fn data_available(&self, _engine: &mut E) {}

    /// The engine has `space` more bytes of send buffer available.
    fn send_window_available(&self, _engine: &mut E, _space: usize) {}

    /// A listening endpoint produced a new connection. It is refused unless
    /// [`PendingAccept::accept`] is called before returning.
    fn incoming_connection(&self, _pending: PendingAccept<'_, E>) {}

    /// An active open completed, successfully or not.
    fn connect_completed(&self, _engine: &mut E, _result: Result<()>) {}

    /// The connection is gone. `status` is [`Error::Closed`] for a local
    /// close, or the translated engine error otherwise.
    fn connection_terminated(&self, _engine: &mut E, _status: Error) {}
}

/// Which halves of a connection to shut down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shutdown {
    /// The receive half.
    Read,
    /// The send half.
    Write,
    /// Both halves.
    Both,
}

impl Shutdown {
    fn halves(self) -> (bool, bool) {
        match self {
            Shutdown::Read => (true, false),
            Shutdown::Write => (false, true),
            Shutdown::Both => (true, true),
        }
    }
}

/// Result of a send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Every byte was queued.
    Complete(usize),
    /// Only this many bytes fit in the send buffer. They were queued without
    /// the push flag; the caller should send the rest later.
    Partial(usize),
    /// No send buffer is available. Nothing was queued; retry after
    /// [`EndpointOwner::send_window_available`].
    Backpressure,
}

impl SendOutcome {
    /// Number of bytes queued.
    pub fn sent(self) -> usize {
        match self {
            SendOutcome::Complete(n) | SendOutcome::Partial(n) => n,
            SendOutcome::Backpressure => 0,
        }
    }
}

/// State of an endpoint's control block handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Handle {
    Open(Pcb),
    Closing(Pcb),
    Closed,
}

impl Handle {
    fn pcb(self) -> Option<Pcb> {
        match self {
            Handle::Open(pcb) => Some(pcb),
            Handle::Closing(_) | Handle::Closed => None,
        }
    }
}

/// Mutable endpoint state. Guarded by [`Connection::inner`].
struct Inner<E> {
    handle: Handle,
    queue: PacketQueue,
    /// Terminal status of the receive half once it has shut down.
    recv_shutdown: Option<Result<()>>,
    send_shutdown: bool,
    owner: Option<Weak<dyn EndpointOwner<E>>>,
}

/// State shared between an [`Endpoint`], the engine's handlers, and
/// in-flight requests.
pub struct Connection<E> {
    tcpip: Tcpip<E>,
    inner: Mutex<Inner<E>>,
}

impl<E: Engine> Connection<E> {
    fn new(
        tcpip: Tcpip<E>,
        owner: Option<Weak<dyn EndpointOwner<E>>>,
        handle: Handle,
    ) -> Arc<Self> {
        Arc::new(Connection {
            tcpip,
            inner: Mutex::new(Inner {
                handle,
                queue: PacketQueue::default(),
                recv_shutdown: None,
                send_shutdown: false,
                owner,
            }),
        })
    }

    pub(crate) fn tcpip(&self) -> &Tcpip<E> {
        &self.tcpip
    }

    /// The control block handle, if the endpoint is open.
    pub(crate) fn pcb(&self) -> Option<Pcb> {
        self.inner.lock().handle.pcb()
    }

    pub(crate) fn handle(&self) -> Handle {
        self.inner.lock().handle
    }

    /// Runs `f` against the owner, if it is still attached and alive. Never
    /// called with the endpoint lock held.
    pub(crate) fn notify(&self, f: impl FnOnce(&dyn EndpointOwner<E>)) {
        let owner = self.inner.lock().owner.as_ref().and_then(Weak::upgrade);

        if let Some(owner) = owner {
            f(&*owner);
        }
    }

    fn detach_owner(&self) {
        self.inner.lock().owner = None;
    }

    /// Appends a received segment. Refuses it if no queue entry can be
    /// allocated.
    pub(crate) fn enqueue(&self, segment: Segment) -> std::result::Result<(), Refused> {
        let Some(slot) = self.tcpip.context().queue_entries().try_alloc() else {
            return Err(Refused(segment));
        };

        self.inner
            .lock()
            .queue
            .enqueue(QueueEntry::new(segment, slot));

        Ok(())
    }

    /// Records a graceful end of stream from the peer. Returns `true` if the
    /// control block is still attached, meaning the closure was initiated
    /// by the peer rather than by a local close.
    pub(crate) fn finish_receive(&self) -> bool {
        let mut inner = self.inner.lock();

        if inner.recv_shutdown.is_none() {
            inner.recv_shutdown = Some(Ok(()));
        }

        matches!(inner.handle, Handle::Open(_))
    }

    /// Records a fatal error. The engine has already freed the control
    /// block. Returns `true` if no data is left to read.
    ///
    /// With data queued the error replaces any earlier status, so it is
    /// read once the queue drains. Otherwise a status already latched by the
    /// receive half is kept.
    pub(crate) fn fail(&self, status: Error) -> bool {
        let mut inner = self.inner.lock();

        let drained = inner.queue.is_empty();
        if !drained || inner.recv_shutdown.is_none() {
            inner.recv_shutdown = Some(Err(status));
        }
        if let Handle::Open(_) = inner.handle {
            inner.handle = Handle::Closed;
        }

        drained
    }

    /// Copies queued data into `buf`.
    ///
    /// Returns `Ready(n)` with `n > 0` if data was copied, `Ready(0)` at a
    /// graceful end of stream, and `Pending` if nothing has arrived yet. Once the receive half has shut down and the
    /// queue is empty, every call returns the latched terminal status.
    pub(crate) fn read_into(&self, buf: &mut [u8]) -> Result<Poll<usize>> {
        let mut inner = self.inner.lock();

        if inner.queue.is_empty() {
            return match inner.recv_shutdown {
                Some(Ok(())) => Ok(Poll::Ready(0)),
                Some(Err(err)) => Err(err),
                None => Ok(Poll::Pending),
            };
        }

        let mut received = 0;

        while received < buf.len() {
            let Some(mut entry) = inner.queue.dequeue() else {
                break;
            };

            let offset = entry.offset();
            let remaining = entry.remaining();
            let len = remaining.min(buf.len() - received);

            // A partially read entry goes straight back to the head, so a
            // concurrent reader still sees the stream in order.
            let segment = if len < remaining {
                let segment = entry.segment().clone();
                entry.advance(len);
                inner.queue.requeue(entry);
                segment
            } else {
                entry.into_segment()
            };

            let dst = &mut buf[received..received + len];
            let copied = MutexGuard::unlocked(&mut inner, || segment.copy_partial(dst, offset));
            debug_assert_eq!(copied, len);

            received += len;
        }

        Ok(Poll::Ready(received))
    }

    pub(crate) fn conn_open(self: &Arc<Self>, engine: &mut E) -> Result<()> {
        let pcb = engine.new_pcb().ok_or(Error::NoMemory)?;

        engine.set_arg(pcb, Some(Arc::downgrade(self)));
        engine.set_err(pcb, callbacks::err::<E>);

        self.inner.lock().handle = Handle::Open(pcb);

        debug!("[{pcb}] (CLOSED) control block allocated");

        Ok(())
    }

    pub(crate) fn conn_bind(&self, engine: &mut E, addr: SocketAddr) -> Result<()> {
        let pcb = self.pcb().ok_or(Error::Closed)?;

        engine.set_reuse_addr(pcb, true);
        engine.bind(pcb, addr).map_err(|err| {
            warn!("[{pcb}] ({:?}) failed to bind {addr}: {err}", engine.state(pcb));
            Error::from_engine(err)
        })
    }

    pub(crate) fn conn_listen(self: &Arc<Self>, engine: &mut E, backlog: u8) -> Result<()> {
        let pcb = self.pcb().ok_or(Error::Closed)?;

        let listener = engine.listen(pcb, backlog).map_err(|err| {
            warn!("[{pcb}] ({:?}) failed to listen: {err}", engine.state(pcb));
            Error::from_engine(err)
        })?;

        engine.set_arg(listener, Some(Arc::downgrade(self)));
        engine.set_accept(listener, callbacks::accept::<E>);

        self.inner.lock().handle = Handle::Open(listener);

        debug!("[{listener}] (LISTEN) listening with backlog {backlog}");

        Ok(())
    }

    pub(crate) fn conn_connect(&self, engine: &mut E, addr: SocketAddr) -> Result<()> {
        let pcb = self.pcb().ok_or(Error::Closed)?;

        engine.set_recv(pcb, callbacks::recv::<E>);
        engine.set_sent(pcb, callbacks::sent::<E>);

        // Success only means the SYN is on its way; the outcome arrives
        // through `connect_completed`.
        engine
            .connect(pcb, addr, callbacks::connected::<E>)
            .map_err(Error::from_engine)?;

        debug!("[{pcb}] ({:?}) connecting to {addr}", engine.state(pcb));

        Ok(())
    }

    pub(crate) fn conn_send(&self, engine: &mut E, data: &[u8]) -> Result<SendOutcome> {
        let (pcb, send_shutdown) = {
            let inner = self.inner.lock();
            (inner.handle.pcb(), inner.send_shutdown)
        };

        let pcb = pcb.ok_or(Error::Closed)?;
        if send_shutdown {
            return Err(Error::Closed);
        }

        let space = engine.send_buffer(pcb);
        if space == 0 {
            trace!("[{pcb}] ({:?}) send buffer full", engine.state(pcb));
            return Ok(SendOutcome::Backpressure);
        }

        if data.is_empty() {
            return Ok(SendOutcome::Complete(0));
        }

        let mut flags = WriteFlags::COPY;
        let mut len = data.len();
        if space < len {
            len = space;
            flags = flags | WriteFlags::MORE;
        }

        match engine.write(pcb, &data[..len], flags) {
            Ok(()) => {
                if let Err(err) = engine.output(pcb) {
                    warn!("[{pcb}] ({:?}) failed to output: {err}", engine.state(pcb));
                }

                debug!(
                    "[{pcb}] ({:?}) queued {len} of {} bytes",
                    engine.state(pcb),
                    data.len()
                );

                if len < data.len() {
                    Ok(SendOutcome::Partial(len))
                } else {
                    Ok(SendOutcome::Complete(len))
                }
            }
            // The engine's segment queue is too long; try again later.
            Err(EngineError::Mem) => Ok(SendOutcome::Backpressure),
            Err(err) => Err(Error::from_engine(err)),
        }
    }

    pub(crate) fn conn_shutdown(&self, engine: &mut E, rx: bool, tx: bool) -> Result<()> {
        let pcb = self.pcb().ok_or(Error::Closed)?;

        // Shutting down once the peer has already closed its half completes
        // the whole connection in the engine, so the handle is retired up
        // front and only restored if the engine refuses.
        let completes = engine.state(pcb) == TcpState::CLOSE_WAIT;
        if completes {
            self.inner.lock().handle = Handle::Closing(pcb);
        }

        let result = engine.shutdown(pcb, rx, tx);

        let mut inner = self.inner.lock();
        match result {
            Ok(()) => {
                if completes {
                    inner.handle = Handle::Closed;
                }
                if rx && inner.recv_shutdown.is_none() {
                    inner.recv_shutdown = Some(Err(Error::Closed));
                }
                if tx {
                    inner.send_shutdown = true;
                }

                debug!("[{pcb}] shut down (rx: {rx}, tx: {tx})");

                Ok(())
            }
            Err(err) => {
                if completes {
                    inner.handle = Handle::Open(pcb);
                }

                warn!("[{pcb}] failed to shut down (rx: {rx}, tx: {tx}): {err}");

                Err(Error::from_engine(err))
            }
        }
    }

    pub(crate) fn conn_close(&self, engine: &mut E, notify: bool) -> Result<()> {
        let (pcb, both_shut) = {
            let mut inner = self.inner.lock();

            let drained = inner.queue.drain();
            if drained > 0 {
                debug!("discarded {drained} unread segments on close");
            }

            let Handle::Open(pcb) = inner.handle else {
                return Ok(());
            };

            inner.handle = Handle::Closing(pcb);

            (pcb, inner.send_shutdown && inner.recv_shutdown.is_some())
        };

        let state = engine.state(pcb);

        let result = if state.is_pre_data() {
            engine.close(pcb)
        } else if both_shut {
            debug!("[{pcb}] ({state:?}) both halves shut down -- aborting");
            engine.abort(pcb);
            Ok(())
        } else {
            // Starts the graceful close, which the engine refuses while it
            // cannot yet accept the FIN.
            engine.close(pcb)
        };

        {
            let mut inner = self.inner.lock();
            inner.handle = match result {
                Ok(()) => Handle::Closed,
                Err(_) => Handle::Open(pcb),
            };
        }

        match result {
            Ok(()) => {
                debug!("[{pcb}] ({state:?}) closed");

                if state.is_pre_data() && notify {
                    self.notify(|owner| owner.connection_terminated(engine, Error::Closed));
                }

                Ok(())
            }
            Err(err) => {
                warn!("[{pcb}] ({state:?}) failed to close: {err}");
                Err(Error::from_engine(err))
            }
        }
    }

    /// Aborts the control block outright. Used when no caller is left to
    /// retry a refused close.
    pub(crate) fn conn_abort(&self, engine: &mut E) {
        let pcb = {
            let mut inner = self.inner.lock();
            let Handle::Open(pcb) = inner.handle else {
                return;
            };
            inner.handle = Handle::Closing(pcb);
            pcb
        };

        debug!("[{pcb}] ({:?}) aborting", engine.state(pcb));
        engine.abort(pcb);

        self.inner.lock().handle = Handle::Closed;
    }

    pub(crate) fn conn_local_addr(&self, engine: &mut E) -> Result<SocketAddr> {
        let pcb = self.pcb().ok_or(Error::Closed)?;
        Ok(engine.local_addr(pcb))
    }

    pub(crate) fn conn_peer_addr(&self, engine: &mut E) -> Result<SocketAddr> {
        let pcb = self.pcb().ok_or(Error::Closed)?;
        Ok(engine.peer_addr(pcb))
    }
}

impl<E> fmt::Debug for Connection<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();

        f.debug_struct("Connection")
            .field("handle", &inner.handle)
            .field("queued", &inner.queue.len())
            .field("recv_shutdown", &inner.recv_shutdown)
            .field("send_shutdown", &inner.send_shutdown)
            .finish()
    }
}

/// A thread-safe, blocking endpoint over one engine control block.
///
/// Dropping an endpoint that is still open schedules a close on the protocol
/// thread without waiting for it.
pub struct Endpoint<E: Engine> {
    conn: Arc<Connection<E>>,
}

impl<E: Engine> Endpoint<E> {
    /// Allocates a new control block on the protocol thread behind `tcpip`.
    ///
    /// `owner` receives the endpoint's events for as long as it is alive.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoMemory`] if either the request message or the
    /// control block could not be allocated.
    pub fn open<O>(tcpip: &Tcpip<E>, owner: &Arc<O>) -> Result<Self>
    where
        O: EndpointOwner<E> + 'static,
    {
        let owner = Arc::downgrade(owner);
        let owner: Weak<dyn EndpointOwner<E>> = owner;

        let endpoint = Endpoint {
            conn: Connection::new(tcpip.clone(), Some(owner), Handle::Closed),
        };
        endpoint.execute(Operation::Open)?;

        Ok(endpoint)
    }

    /// Binds to a local address.
    pub fn bind(&self, addr: SocketAddr) -> Result<()> {
        self.execute(Operation::Bind { addr }).map(drop)
    }

    /// Starts listening. Incoming connections are offered to the owner
    /// through [`EndpointOwner::incoming_connection`].
    pub fn listen(&self, backlog: u8) -> Result<()> {
        self.execute(Operation::Listen { backlog }).map(drop)
    }

    /// Starts connecting to `addr`.
    ///
    /// `Ok` means the connection attempt is in progress; its outcome is
    /// reported through [`EndpointOwner::connect_completed`].
    pub fn connect(&self, addr: SocketAddr) -> Result<()> {
        self.execute(Operation::Connect { addr }).map(drop)
    }

    /// Queues as much of `data` as the send buffer allows.
    pub fn send(&self, data: &[u8]) -> Result<SendOutcome> {
        let data = Bytes::copy_from_slice(data);
        self.execute(Operation::Send { data }).map(|out| out.into_sent())
    }

    /// Like [`Endpoint::send`], for callers already on the protocol thread.
    pub fn send_safe(&self, engine: &mut E, data: &[u8]) -> Result<SendOutcome> {
        let data = Bytes::copy_from_slice(data);
        self.execute_safe(engine, Operation::Send { data })
            .map(|out| out.into_sent())
    }

    /// Reads queued data. Never blocks and never crosses to the protocol
    /// thread.
    ///
    /// `Ok(Poll::Pending)` means nothing has arrived yet: wait for
    /// [`EndpointOwner::data_available`] and try again. `Ok(Poll::Ready(0))`
    /// with a non-empty `buf` is a graceful end of stream.
    pub fn read(&self, buf: &mut [u8]) -> Result<Poll<usize>> {
        self.conn.read_into(buf)
    }

    /// Shuts down one or both halves of the connection.
    ///
    /// Shutting down the receive half makes later reads fail with
    /// [`Error::Closed`], unless the receive half had already ended: after
    /// the peer's FIN, reads keep returning `Ready(0)`.
    pub fn shutdown(&self, how: Shutdown) -> Result<()> {
        let (rx, tx) = how.halves();
        self.execute(Operation::Shutdown { rx, tx }).map(drop)
    }

    /// Like [`Endpoint::shutdown`], for callers already on the protocol
    /// thread.
    pub fn shutdown_safe(&self, engine: &mut E, how: Shutdown) -> Result<()> {
        let (rx, tx) = how.halves();
        self.execute_safe(engine, Operation::Shutdown { rx, tx })
            .map(drop)
    }

    /// Closes the connection, discarding unread data.
    ///
    /// Aborts if both halves were already shut down. Otherwise starts a
    /// graceful close, which the engine may refuse; the endpoint then stays
    /// open so the caller can retry or shut down both halves and close again.
    /// When `notify` is set and the connection never reached data transfer,
    /// the owner receives [`EndpointOwner::connection_terminated`].
    pub fn close(&self, notify: bool) -> Result<()> {
        self.execute(Operation::Close { notify }).map(drop)
    }

    /// Like [`Endpoint::close`], for callers already on the protocol thread,
    /// such as an owner reacting to an event.
    pub fn close_safe(&self, engine: &mut E, notify: bool) -> Result<()> {
        self.execute_safe(engine, Operation::Close { notify })
            .map(drop)
    }

    /// Local address of the control block.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.execute(Operation::LocalAddr).map(|out| out.into_addr())
    }

    /// Remote address of the control block.
    pub fn peer_addr(&self) -> Result<SocketAddr> {
        self.execute(Operation::PeerAddr).map(|out| out.into_addr())
    }

    /// Stops delivering events to the owner. Cannot be undone.
    pub fn detach_owner(&self) {
        self.conn.detach_owner();
    }

    /// Returns `true` once the endpoint no longer has a control block.
    pub fn is_closed(&self) -> bool {
        self.conn.pcb().is_none()
    }

    #[cfg(test)]
    pub(crate) fn connection(&self) -> &Arc<Connection<E>> {
        &self.conn
    }

    fn execute(&self, op: Operation) -> Result<crate::message::Output> {
        let request = Request::new(&self.conn, op)?;
        self.conn.tcpip().submit(request)
    }

    fn execute_safe(&self, engine: &mut E, op: Operation) -> Result<crate::message::Output> {
        let request = Request::new(&self.conn, op)?;
        request.execute(engine)
    }
}

impl<E: Engine> fmt::Debug for Endpoint<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Endpoint").field(&self.conn).finish()
    }
}

impl<E: Engine> Drop for Endpoint<E> {
    fn drop(&mut self) {
        if self.conn.pcb().is_none() {
            return;
        }

        let conn = Arc::clone(&self.conn);
        let scheduled = self.conn.tcpip().callback(move |engine| {
            if let Err(err) = conn.conn_close(engine, false) {
                warn!("failed to close dropped endpoint: {err} -- aborting");
                conn.conn_abort(engine);
            }
        });

        if let Err(err) = scheduled {
            debug!("endpoint dropped while open, close not scheduled: {err}");
        }
    }
}

/// A connection waiting on a listening endpoint, offered to its owner.
///
/// Accepting attaches a new endpoint to the control block. Dropping it
/// without accepting refuses the connection.
pub struct PendingAccept<'a, E> {
    engine: &'a mut E,
    tcpip: Tcpip<E>,
    listener: Pcb,
    pcb: Pcb,
}

impl<'a, E: Engine> PendingAccept<'a, E> {
    pub(crate) fn new(engine: &'a mut E, tcpip: Tcpip<E>, listener: Pcb, pcb: Pcb) -> Self {
        PendingAccept {
            engine,
            tcpip,
            listener,
            pcb,
        }
    }

    /// The engine, for work that must happen before accepting.
    pub fn engine(&mut self) -> &mut E {
        &mut *self.engine
    }

    /// Address of the connecting peer.
    pub fn peer_addr(&self) -> SocketAddr {
        self.engine.peer_addr(self.pcb)
    }

    /// Local address the connection arrived on.
    pub fn local_addr(&self) -> SocketAddr {
        self.engine.local_addr(self.pcb)
    }

    /// Accepts the connection, delivering its events to `owner`.
    pub fn accept<O>(self, owner: &Arc<O>) -> Endpoint<E>
    where
        O: EndpointOwner<E> + 'static,
    {
        let owner = Arc::downgrade(owner);
        let owner: Weak<dyn EndpointOwner<E>> = owner;
        let conn = Connection::new(self.tcpip, Some(owner), Handle::Open(self.pcb));

        let engine = self.engine;
        let pcb = self.pcb;

        // No handler may see the new endpoint before all of them are in place.
        engine.set_arg(pcb, None);
        engine.set_recv(pcb, callbacks::recv::<E>);
        engine.set_sent(pcb, callbacks::sent::<E>);
        engine.set_err(pcb, callbacks::err::<E>);
        engine.set_arg(pcb, Some(Arc::downgrade(&conn)));

        engine.accepted(self.listener);

        debug!(
            "[{pcb}] ({:?}) accepted connection from {}",
            engine.state(pcb),
            engine.peer_addr(pcb)
        );

        Endpoint { conn }
    }
}

impl<E: Engine> fmt::Debug for PendingAccept<'_, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingAccept")
            .field("listener", &self.listener)
            .field("pcb", &self.pcb)
            .finish()
    }
}

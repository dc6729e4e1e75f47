//! Scripted in-memory engine for tests.
//!
//! It keeps just enough per-control-block state to drive the handlers the
//! way a real engine would. Tests run it on a real protocol thread and poke
//! it through `Tcpip::call`.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;

use super::{
    AcceptFn, Arg, ConnectedFn, Engine, ErrFn, Pcb, RecvFn, Refused, Segment, SentFn, TcpState,
    WriteFlags,
};
use crate::addr::SocketAddr;
use crate::endpoint::{Endpoint, EndpointOwner, PendingAccept};
use crate::error::{EngineError, EngineResult, Error, Result};

/// An engine call, as recorded by [`MockEngine`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Call {
    Bind(Pcb, SocketAddr),
    Listen(Pcb),
    Accepted(Pcb),
    Connect(Pcb, SocketAddr),
    Write(Pcb, usize, WriteFlags),
    Output(Pcb),
    Recved(Pcb, usize),
    Shutdown(Pcb, bool, bool),
    Close(Pcb),
    Abort(Pcb),
}

struct MockPcb<E> {
    state: TcpState,
    arg: Option<Arg<E>>,
    recv: Option<RecvFn<E>>,
    sent: Option<SentFn<E>>,
    err: Option<ErrFn<E>>,
    accept: Option<AcceptFn<E>>,
    connected: Option<ConnectedFn<E>>,
    reuse_addr: bool,
    local: SocketAddr,
    peer: SocketAddr,
}

impl<E> MockPcb<E> {
    fn new(state: TcpState) -> Self {
        MockPcb {
            state,
            arg: None,
            recv: None,
            sent: None,
            err: None,
            accept: None,
            connected: None,
            reuse_addr: false,
            local: SocketAddr::default(),
            peer: SocketAddr::default(),
        }
    }
}

pub(crate) struct MockEngine {
    /// Free-form scratch space for ordering tests.
    pub(crate) trace: Vec<i32>,
    pub(crate) ticks: usize,
    pub(crate) calls: Vec<Call>,
    /// Bytes accepted by `write`, across all control blocks.
    pub(crate) written: Vec<u8>,
    pub(crate) send_buffer: usize,
    pub(crate) fail_new_pcb: bool,
    pub(crate) bind_error: Option<EngineError>,
    pub(crate) connect_error: Option<EngineError>,
    pub(crate) write_error: Option<EngineError>,
    pub(crate) shutdown_error: Option<EngineError>,
    pub(crate) close_error: Option<EngineError>,
    pcbs: HashMap<Pcb, MockPcb<MockEngine>>,
    next_id: u32,
}

impl Default for MockEngine {
    fn default() -> Self {
        MockEngine {
            trace: Vec::new(),
            ticks: 0,
            calls: Vec::new(),
            written: Vec::new(),
            send_buffer: 1024,
            fail_new_pcb: false,
            bind_error: None,
            connect_error: None,
            write_error: None,
            shutdown_error: None,
            close_error: None,
            pcbs: HashMap::new(),
            next_id: 1,
        }
    }
}

impl MockEngine {
    fn alloc(&mut self, state: TcpState) -> Pcb {
        let pcb = Pcb::new(self.next_id);
        self.next_id += 1;
        self.pcbs.insert(pcb, MockPcb::new(state));
        pcb
    }

    fn pcb_mut(&mut self, pcb: Pcb) -> &mut MockPcb<MockEngine> {
        self.pcbs
            .get_mut(&pcb)
            .unwrap_or_else(|| panic!("{pcb} is not allocated"))
    }

    pub(crate) fn contains(&self, pcb: Pcb) -> bool {
        self.pcbs.contains_key(&pcb)
    }

    pub(crate) fn set_state(&mut self, pcb: Pcb, state: TcpState) {
        self.pcb_mut(pcb).state = state;
    }

    pub(crate) fn reuses_addr(&self, pcb: Pcb) -> bool {
        self.pcbs.get(&pcb).is_some_and(|p| p.reuse_addr)
    }

    /// Finishes an active open with `status`.
    pub(crate) fn complete_connect(&mut self, pcb: Pcb, status: EngineResult) {
        let state = if status.is_ok() {
            TcpState::ESTABLISHED
        } else {
            TcpState::CLOSED
        };

        let p = self.pcb_mut(pcb);
        p.state = state;
        let (handler, arg) = (p.connected, p.arg.clone());

        if let Some(handler) = handler {
            let _ = handler(arg, self, pcb, status);
        }
    }

    /// Delivers `data` as one segment.
    pub(crate) fn deliver(&mut self, pcb: Pcb, data: &[u8]) -> std::result::Result<(), Refused> {
        let segment = Segment::new(Bytes::copy_from_slice(data));
        self.deliver_segment(pcb, segment)
    }

    pub(crate) fn deliver_segment(
        &mut self,
        pcb: Pcb,
        segment: Segment,
    ) -> std::result::Result<(), Refused> {
        let p = self.pcb_mut(pcb);
        let (handler, arg) = (p.recv, p.arg.clone());

        match handler {
            Some(handler) => handler(arg, self, pcb, Some(segment), Ok(())),
            None => Ok(()),
        }
    }

    /// Delivers the peer's FIN.
    pub(crate) fn deliver_fin(&mut self, pcb: Pcb) {
        let p = self.pcb_mut(pcb);
        p.state = match p.state {
            TcpState::FIN_WAIT_1 => TcpState::CLOSING,
            TcpState::FIN_WAIT_2 => TcpState::TIME_WAIT,
            _ => TcpState::CLOSE_WAIT,
        };
        let (handler, arg) = (p.recv, p.arg.clone());

        if let Some(handler) = handler {
            let _ = handler(arg, self, pcb, None, Ok(()));
        }
    }

    /// Frees the control block and reports `err` to its error handler.
    pub(crate) fn fail(&mut self, pcb: Pcb, err: EngineError) {
        if let Some(p) = self.pcbs.remove(&pcb) {
            if let Some(handler) = p.err {
                handler(p.arg, self, err);
            }
        }
    }

    /// The peer acknowledged `len` bytes.
    pub(crate) fn ack(&mut self, pcb: Pcb, len: usize) {
        self.send_buffer += len;

        let space = self.send_buffer;
        let p = self.pcb_mut(pcb);
        let (handler, arg) = (p.sent, p.arg.clone());

        if let Some(handler) = handler {
            let _ = handler(arg, self, pcb, space);
        }
    }

    /// A peer connects to `listener`. Returns the new control block and the
    /// accept handler's verdict; a refused control block is freed.
    pub(crate) fn incoming(&mut self, listener: Pcb, peer: SocketAddr) -> (Pcb, EngineResult) {
        let local = self.pcb_mut(listener).local;

        let pcb = self.alloc(TcpState::ESTABLISHED);
        let p = self.pcb_mut(pcb);
        p.local = local;
        p.peer = peer;

        let l = self.pcb_mut(listener);
        let (handler, arg) = (l.accept, l.arg.clone());

        let verdict = match handler {
            Some(handler) => handler(arg, self, listener, pcb, Ok(())),
            None => Err(EngineError::Abrt),
        };

        if verdict.is_err() {
            self.pcbs.remove(&pcb);
        }

        (pcb, verdict)
    }
}

impl Engine for MockEngine {
    fn new_pcb(&mut self) -> Option<Pcb> {
        if self.fail_new_pcb {
            return None;
        }

        Some(self.alloc(TcpState::CLOSED))
    }

    fn state(&self, pcb: Pcb) -> TcpState {
        self.pcbs
            .get(&pcb)
            .map_or(TcpState::CLOSED, |p| p.state)
    }

    fn set_arg(&mut self, pcb: Pcb, arg: Option<Arg<Self>>) {
        self.pcb_mut(pcb).arg = arg;
    }

    fn arg(&self, pcb: Pcb) -> Option<Arg<Self>> {
        self.pcbs.get(&pcb).and_then(|p| p.arg.clone())
    }

    fn set_recv(&mut self, pcb: Pcb, handler: RecvFn<Self>) {
        self.pcb_mut(pcb).recv = Some(handler);
    }

    fn set_sent(&mut self, pcb: Pcb, handler: SentFn<Self>) {
        self.pcb_mut(pcb).sent = Some(handler);
    }

    fn set_err(&mut self, pcb: Pcb, handler: ErrFn<Self>) {
        self.pcb_mut(pcb).err = Some(handler);
    }

    fn set_accept(&mut self, pcb: Pcb, handler: AcceptFn<Self>) {
        self.pcb_mut(pcb).accept = Some(handler);
    }

    fn set_reuse_addr(&mut self, pcb: Pcb, reuse: bool) {
        self.pcb_mut(pcb).reuse_addr = reuse;
    }

    fn bind(&mut self, pcb: Pcb, addr: SocketAddr) -> EngineResult {
        self.calls.push(Call::Bind(pcb, addr));

        if let Some(err) = self.bind_error {
            return Err(err);
        }

        self.pcb_mut(pcb).local = addr;
        Ok(())
    }

    fn listen(&mut self, pcb: Pcb, _backlog: u8) -> std::result::Result<Pcb, EngineError> {
        self.calls.push(Call::Listen(pcb));

        let old = self
            .pcbs
            .remove(&pcb)
            .unwrap_or_else(|| panic!("{pcb} is not allocated"));

        let listener = self.alloc(TcpState::LISTEN);
        let l = self.pcb_mut(listener);
        l.local = old.local;
        l.reuse_addr = old.reuse_addr;
        l.arg = old.arg;

        Ok(listener)
    }

    fn accepted(&mut self, listener: Pcb) {
        self.calls.push(Call::Accepted(listener));
    }

    fn connect(&mut self, pcb: Pcb, addr: SocketAddr, connected: ConnectedFn<Self>) -> EngineResult {
        self.calls.push(Call::Connect(pcb, addr));

        if let Some(err) = self.connect_error {
            return Err(err);
        }

        let p = self.pcb_mut(pcb);
        p.state = TcpState::SYN_SENT;
        p.peer = addr;
        p.connected = Some(connected);

        Ok(())
    }

    fn send_buffer(&self, _pcb: Pcb) -> usize {
        self.send_buffer
    }

    fn write(&mut self, pcb: Pcb, data: &[u8], flags: WriteFlags) -> EngineResult {
        self.calls.push(Call::Write(pcb, data.len(), flags));

        if let Some(err) = self.write_error {
            return Err(err);
        }

        self.send_buffer -= data.len();
        self.written.extend_from_slice(data);

        Ok(())
    }

    fn output(&mut self, pcb: Pcb) -> EngineResult {
        self.calls.push(Call::Output(pcb));
        Ok(())
    }

    fn recved(&mut self, pcb: Pcb, len: usize) {
        self.calls.push(Call::Recved(pcb, len));
    }

    fn shutdown(&mut self, pcb: Pcb, rx: bool, tx: bool) -> EngineResult {
        self.calls.push(Call::Shutdown(pcb, rx, tx));

        if let Some(err) = self.shutdown_error {
            return Err(err);
        }

        match self.state(pcb) {
            // Both directions are now closed; the control block goes away.
            TcpState::CLOSE_WAIT => {
                self.pcbs.remove(&pcb);
            }
            TcpState::ESTABLISHED if tx => self.set_state(pcb, TcpState::FIN_WAIT_1),
            _ => {}
        }

        Ok(())
    }

    fn close(&mut self, pcb: Pcb) -> EngineResult {
        self.calls.push(Call::Close(pcb));

        if let Some(err) = self.close_error {
            return Err(err);
        }

        if self.state(pcb).is_pre_data() {
            self.pcbs.remove(&pcb);
        } else {
            self.set_state(pcb, TcpState::FIN_WAIT_1);
        }

        Ok(())
    }

    fn abort(&mut self, pcb: Pcb) {
        self.calls.push(Call::Abort(pcb));
        self.fail(pcb, EngineError::Abrt);
    }

    fn local_addr(&self, pcb: Pcb) -> SocketAddr {
        self.pcbs.get(&pcb).map(|p| p.local).unwrap_or_default()
    }

    fn peer_addr(&self, pcb: Pcb) -> SocketAddr {
        self.pcbs.get(&pcb).map(|p| p.peer).unwrap_or_default()
    }

    fn tick(&mut self) {
        self.ticks += 1;
    }
}

/// An upward event, as recorded by [`RecordingOwner`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Event {
    DataAvailable,
    SendWindow(usize),
    Incoming(SocketAddr),
    Connected(Result<()>),
    Terminated(Error),
}

/// Owner that records every event. If `child` is set it accepts incoming
/// connections on that owner's behalf and keeps the new endpoints.
#[derive(Default)]
pub(crate) struct RecordingOwner {
    events: Mutex<Vec<Event>>,
    child: Option<Arc<RecordingOwner>>,
    accepted: Mutex<Vec<Endpoint<MockEngine>>>,
}

impl RecordingOwner {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(RecordingOwner::default())
    }

    pub(crate) fn accepting(child: &Arc<RecordingOwner>) -> Arc<Self> {
        Arc::new(RecordingOwner {
            child: Some(Arc::clone(child)),
            ..RecordingOwner::default()
        })
    }

    pub(crate) fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    pub(crate) fn take_accepted(&self) -> Vec<Endpoint<MockEngine>> {
        std::mem::take(&mut *self.accepted.lock())
    }
}

impl EndpointOwner<MockEngine> for RecordingOwner {
    fn data_available(&self, _engine: &mut MockEngine) {
        self.events.lock().push(Event::DataAvailable);
    }

    fn send_window_available(&self, _engine: &mut MockEngine, space: usize) {
        self.events.lock().push(Event::SendWindow(space));
    }

    fn incoming_connection(&self, pending: PendingAccept<'_, MockEngine>) {
        self.events.lock().push(Event::Incoming(pending.peer_addr()));

        if let Some(child) = &self.child {
            let endpoint = pending.accept(child);
            self.accepted.lock().push(endpoint);
        }
    }

    fn connect_completed(&self, _engine: &mut MockEngine, result: Result<()>) {
        self.events.lock().push(Event::Connected(result));
    }

    fn connection_terminated(&self, _engine: &mut MockEngine, status: Error) {
        self.events.lock().push(Event::Terminated(status));
    }
}

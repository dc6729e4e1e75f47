//! Handlers registered with the engine for each control block.
//!
//! They run on the protocol thread, inside engine calls. Each one first
//! upgrades its argument; if the endpoint is already gone the handler does
//! the minimum the engine needs and returns without touching endpoint state.

use std::sync::{Arc, Weak};

use tracing::{debug, trace, warn};

use crate::endpoint::{Connection, PendingAccept};
use crate::engine::{Arg, Engine, Pcb, Refused, Segment};
use crate::error::{EngineError, EngineResult, Error};

fn upgrade<E>(arg: Option<Arg<E>>) -> Option<Arc<Connection<E>>> {
    arg.as_ref().and_then(Weak::upgrade)
}

/// Data arrived, or the peer closed its half when `segment` is `None`.
pub(crate) fn recv<E: Engine>(
    arg: Option<Arg<E>>,
    engine: &mut E,
    pcb: Pcb,
    segment: Option<Segment>,
    status: EngineResult,
) -> Result<(), Refused> {
    let Some(conn) = upgrade(arg) else {
        if let Some(segment) = segment {
            engine.recved(pcb, segment.len());
        }
        return Ok(());
    };

    let Some(segment) = segment else {
        if let Err(err) = status {
            warn!("[{pcb}] ({:?}) end of stream with status: {err}", engine.state(pcb));
            return Ok(());
        }

        if conn.finish_receive() {
            debug!("[{pcb}] ({:?}) peer closed its half", engine.state(pcb));
            conn.notify(|owner| owner.data_available(engine));
        } else {
            debug!("[{pcb}] ({:?}) locally initiated close completed", engine.state(pcb));
            conn.notify(|owner| owner.connection_terminated(engine, Error::Closed));
        }

        return Ok(());
    };

    let len = segment.len();
    if len == 0 {
        trace!("[{pcb}] ({:?}) ignoring empty segment", engine.state(pcb));
        return Ok(());
    }

    if let Err(refused) = conn.enqueue(segment) {
        warn!("[{pcb}] ({:?}) queue entries exhausted -- refusing {len} bytes", engine.state(pcb));
        return Err(refused);
    }

    // The window opens as soon as the data is queued, not when it is read.
    engine.recved(pcb, len);

    trace!("[{pcb}] ({:?}) queued {len} bytes", engine.state(pcb));

    conn.notify(|owner| owner.data_available(engine));

    Ok(())
}

/// Send buffer space was freed.
pub(crate) fn sent<E: Engine>(
    arg: Option<Arg<E>>,
    engine: &mut E,
    _pcb: Pcb,
    space: usize,
) -> EngineResult {
    if let Some(conn) = upgrade(arg) {
        conn.notify(|owner| owner.send_window_available(engine, space));
    }

    Ok(())
}

/// A listening control block produced `new_pcb`. Returning an error makes
/// the engine refuse it.
pub(crate) fn accept<E: Engine>(
    arg: Option<Arg<E>>,
    engine: &mut E,
    listener: Pcb,
    new_pcb: Pcb,
    status: EngineResult,
) -> EngineResult {
    let Some(conn) = upgrade(arg) else {
        return Err(EngineError::Abrt);
    };

    if let Err(err) = status {
        warn!("[{listener}] (LISTEN) incoming connection failed: {err}");
        return Err(err);
    }

    let tcpip = conn.tcpip().clone();
    conn.notify(|owner| {
        owner.incoming_connection(PendingAccept::new(&mut *engine, tcpip, listener, new_pcb));
    });

    // Set only if the owner accepted.
    if engine.arg(new_pcb).is_some() {
        Ok(())
    } else {
        debug!("[{listener}] (LISTEN) connection {new_pcb} refused by owner");
        Err(EngineError::Abrt)
    }
}

/// An active open completed.
pub(crate) fn connected<E: Engine>(
    arg: Option<Arg<E>>,
    engine: &mut E,
    pcb: Pcb,
    status: EngineResult,
) -> EngineResult {
    if let Some(conn) = upgrade(arg) {
        debug!("[{pcb}] ({:?}) connect completed: {status:?}", engine.state(pcb));

        let result = status.map_err(Error::from_engine);
        conn.notify(|owner| owner.connect_completed(engine, result));
    }

    Ok(())
}

/// The engine hit a fatal error and has already freed the control block.
pub(crate) fn err<E: Engine>(arg: Option<Arg<E>>, engine: &mut E, err: EngineError) {
    let Some(conn) = upgrade(arg) else {
        return;
    };

    let status = Error::from_engine(err);
    let handle = conn.handle();

    if conn.fail(status) {
        debug!("({handle:?}) fatal error: {err}");
        conn.notify(|owner| owner.connection_terminated(engine, status));
    } else {
        // Queued data is read first; the error surfaces once it drains.
        debug!("({handle:?}) fatal error with data queued, deferring: {err}");
        conn.notify(|owner| owner.data_available(engine));
    }
}

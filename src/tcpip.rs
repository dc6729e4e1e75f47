//! The protocol thread, and the channel that marshals work onto it.
//!
//! The engine is moved onto a dedicated thread and never leaves it. Other
//! threads hand it jobs through a run queue: either fire-and-forget
//! ([`Tcpip::callback`]) or blocking until the job has run ([`Tcpip::call`]).
//! A blocked caller waits on two things at once, its own reply and the
//! process-wide termination signal, so shutdown always releases it.

use std::fmt;
use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, select};
use tracing::{debug, error, trace};

use crate::config::Config;
use crate::context::Context;
use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::message::{Output, Request};

/// Unit of work executed on the protocol thread.
type Job<E> = Box<dyn FnOnce(&mut E) + Send>;

/// Handle to a running protocol thread.
pub struct Tcpip<E> {
    jobs: Sender<Job<E>>,
    thread: ThreadId,
    context: Arc<Context>,
}

impl<E: Engine> Tcpip<E> {
    /// Moves `engine` onto a new protocol thread.
    ///
    /// The thread runs until `context` is terminated or every handle to it
    /// has been dropped.
    ///
    /// # Errors
    ///
    /// Returns an error if the thread could not be spawned.
    pub fn spawn(
        engine: E,
        context: Arc<Context>,
        config: &Config,
    ) -> io::Result<(Self, JoinHandle<()>)> {
        let (tx, rx) = crossbeam_channel::unbounded();
        let tick = config.tick_interval;

        let handle = {
            let context = Arc::clone(&context);
            thread::Builder::new()
                .name(config.thread_name.clone())
                .spawn(move || event_loop(engine, rx, context, tick))?
        };

        let tcpip = Tcpip {
            jobs: tx,
            thread: handle.thread().id(),
            context,
        };

        Ok((tcpip, handle))
    }

    /// The process-wide context this thread was spawned with.
    pub fn context(&self) -> &Arc<Context> {
        &self.context
    }

    /// Returns `true` when called from the protocol thread itself.
    pub fn is_protocol_thread(&self) -> bool {
        thread::current().id() == self.thread
    }

    /// Schedules `f` on the protocol thread without waiting for it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoMemory`] if no message could be allocated, or
    /// [`Error::Closed`] if the protocol thread is gone.
    pub fn callback<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut E) + Send + 'static,
    {
        let slot = self.context.messages().try_alloc().ok_or(Error::NoMemory)?;

        self.post(Box::new(move |engine| {
            let _slot = slot;
            f(engine)
        }))
    }

    /// Runs `f` on the protocol thread and blocks until it returns.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoMemory`] if no message could be allocated,
    /// [`Error::Reentrant`] if called from the protocol thread, and
    /// [`Error::Closed`] if termination was signalled before `f` completed.
    /// In the last case `f` may still run afterwards.
    pub fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut E) -> R + Send + 'static,
        R: Send + 'static,
    {
        let slot = self.context.messages().try_alloc().ok_or(Error::NoMemory)?;

        self.execute(move |engine| {
            let _slot = slot;
            f(engine)
        })
    }

    /// Runs a request on the protocol thread and waits for its output.
    pub(crate) fn submit(&self, request: Request<E>) -> Result<Output> {
        self.execute(move |engine| request.execute(engine))?
    }

    fn execute<F, R>(&self, job: F) -> Result<R>
    where
        F: FnOnce(&mut E) -> R + Send + 'static,
        R: Send + 'static,
    {
        if self.is_protocol_thread() {
            error!("blocking call issued from the protocol thread");
            return Err(Error::Reentrant);
        }

        // Capacity of one, so the protocol thread never blocks on a caller
        // that already gave up.
        let (tx, rx) = crossbeam_channel::bounded(1);

        self.post(Box::new(move |engine| {
            let _ = tx.send(job(engine));
        }))?;

        select! {
            recv(rx) -> output => output.map_err(|_| Error::Closed),
            recv(self.context.termination()) -> _ => {
                debug!("termination signalled while waiting on the protocol thread");
                Err(Error::Closed)
            }
        }
    }

    fn post(&self, job: Job<E>) -> Result<()> {
        if self.context.is_terminated() {
            return Err(Error::Closed);
        }

        self.jobs.send(job).map_err(|_| Error::Closed)
    }
}

impl<E> Clone for Tcpip<E> {
    fn clone(&self) -> Self {
        Tcpip {
            jobs: self.jobs.clone(),
            thread: self.thread,
            context: Arc::clone(&self.context),
        }
    }
}

impl<E> fmt::Debug for Tcpip<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tcpip")
            .field("thread", &self.thread)
            .field("queued", &self.jobs.len())
            .finish()
    }
}

/// Body of the protocol thread: runs jobs one at a time and drives the
/// engine's timers until termination.
fn event_loop<E: Engine>(
    mut engine: E,
    jobs: Receiver<Job<E>>,
    context: Arc<Context>,
    tick: Duration,
) {
    let ticker = crossbeam_channel::tick(tick);

    debug!("protocol thread started");

    loop {
        select! {
            recv(jobs) -> job => match job {
                Ok(job) => job(&mut engine),
                Err(_) => {
                    debug!("all handles dropped -- stopping protocol thread");
                    break;
                }
            },
            recv(ticker) -> _ => {
                trace!("tick");
                engine.tick();
            }
            recv(context.termination()) -> _ => {
                debug!("termination signalled -- stopping protocol thread");
                break;
            }
        }
    }

    // Jobs never run are dropped here, releasing their messages.
    let discarded = jobs.try_iter().count();
    if discarded > 0 {
        debug!("discarded {discarded} queued jobs");
    }
}

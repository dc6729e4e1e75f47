//! Process-wide coordination state shared by every endpoint: the termination
//! signal that releases blocked callers, and the bounded pools request
//! messages and queue entries are allocated from.
//!
//! A [`Context`] must be created before the protocol thread is spawned and
//! outlives it. Pool slots keep their pool alive, so a slot released late by
//! whichever side finishes with a message last is always valid.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use tracing::debug;

use crate::config::Config;

/// Uninhabited message type of the termination channel. Nothing is ever sent;
/// dropping the sender is the signal.
#[derive(Debug)]
pub(crate) enum Never {}

/// Process-wide context handed to the protocol thread and every endpoint.
#[derive(Debug)]
pub struct Context {
    termination: Termination,
    messages: Arc<Pool>,
    queue_entries: Arc<Pool>,
}

impl Context {
    /// Creates a new context with pools sized from `config`.
    pub fn new(config: &Config) -> Arc<Self> {
        Arc::new(Context {
            termination: Termination::new(),
            messages: Pool::new("message", config.message_pool),
            queue_entries: Pool::new("queue entry", config.queue_entry_pool),
        })
    }

    /// Signals termination. Every caller blocked on a marshaled call returns
    /// [`crate::Error::Closed`] and the protocol thread stops. Idempotent.
    pub fn terminate(&self) {
        self.termination.signal();
    }

    /// Returns `true` once [`Context::terminate`] has been called.
    pub fn is_terminated(&self) -> bool {
        self.termination.is_signalled()
    }

    /// Pool request messages are allocated from.
    pub fn messages(&self) -> &Arc<Pool> {
        &self.messages
    }

    /// Pool queue entries are allocated from.
    pub fn queue_entries(&self) -> &Arc<Pool> {
        &self.queue_entries
    }

    pub(crate) fn termination(&self) -> &Receiver<Never> {
        &self.termination.rx
    }
}

/// One-shot, broadcast termination signal.
struct Termination {
    signalled: AtomicBool,
    tx: Mutex<Option<Sender<Never>>>,
    rx: Receiver<Never>,
}

impl Termination {
    fn new() -> Self {
        let (tx, rx) = crossbeam_channel::bounded(0);

        Termination {
            signalled: AtomicBool::new(false),
            tx: Mutex::new(Some(tx)),
            rx,
        }
    }

    fn signal(&self) {
        if !self.signalled.swap(true, Ordering::AcqRel) {
            debug!("termination signalled");
        }

        // Disconnecting the channel wakes every receiver at once.
        self.tx.lock().take();
    }

    fn is_signalled(&self) -> bool {
        self.signalled.load(Ordering::Acquire)
    }
}

impl fmt::Debug for Termination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Termination")
            .field("signalled", &self.is_signalled())
            .finish()
    }
}

/// A bounded allocator handing out RAII slots.
#[derive(Debug)]
pub struct Pool {
    name: &'static str,
    capacity: usize,
    in_use: AtomicUsize,
}

impl Pool {
    /// Creates a pool with room for `capacity` live slots.
    pub fn new(name: &'static str, capacity: usize) -> Arc<Self> {
        Arc::new(Pool {
            name,
            capacity,
            in_use: AtomicUsize::new(0),
        })
    }

    /// Takes a slot, or returns `None` if the pool is exhausted.
    pub fn try_alloc(self: &Arc<Self>) -> Option<PoolSlot> {
        let mut current = self.in_use.load(Ordering::Acquire);

        loop {
            if current >= self.capacity {
                debug!("{} pool exhausted ({} slots)", self.name, self.capacity);
                return None;
            }

            match self.in_use.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    return Some(PoolSlot {
                        pool: Arc::clone(self),
                    });
                }
                Err(actual) => current = actual,
            }
        }
    }

    /// Number of slots currently handed out.
    pub fn in_use(&self) -> usize {
        self.in_use.load(Ordering::Acquire)
    }

    /// Maximum number of live slots.
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// A slot taken from a [`Pool`], returned to it on drop.
#[derive(Debug)]
pub struct PoolSlot {
    pool: Arc<Pool>,
}

impl Drop for PoolSlot {
    fn drop(&mut self) {
        self.pool.in_use.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_exhaustion_and_release() {
        let pool = Pool::new("test", 2);

        let a = pool.try_alloc();
        let b = pool.try_alloc();
        assert!(a.is_some());
        assert!(b.is_some());
        assert!(pool.try_alloc().is_none());
        assert_eq!(pool.in_use(), 2);

        drop(a);
        assert_eq!(pool.in_use(), 1);
        assert!(pool.try_alloc().is_some());
    }

    #[test]
    fn slot_outlives_context() {
        let context = Context::new(&Config::default());
        let slot = context.messages().try_alloc();
        let pool = Arc::clone(context.messages());

        drop(context);
        assert_eq!(pool.in_use(), 1);

        drop(slot);
        assert_eq!(pool.in_use(), 0);
    }

    #[test]
    fn termination_wakes_receivers() {
        let context = Context::new(&Config::default());
        assert!(!context.is_terminated());

        let rx = context.termination().clone();
        let waiter = std::thread::spawn(move || rx.recv().is_err());

        context.terminate();
        context.terminate();

        assert!(context.is_terminated());
        assert!(waiter.join().unwrap());
    }
}

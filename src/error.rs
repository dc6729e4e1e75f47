//! Error types returned to callers of the marshaling layer, and the status
//! codes reported by the underlying engine.

use std::result;

use thiserror::Error;

/// A convenience wrapper around `Result` for [`crate::Error`].
pub type Result<T> = result::Result<T, Error>;

/// Status codes reported by the protocol engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
#[non_exhaustive]
pub enum EngineError {
    /// Out of memory.
    #[error("engine out of memory")]
    Mem,
    /// Buffer error.
    #[error("engine buffer error")]
    Buf,
    /// Operation timed out.
    #[error("operation timed out")]
    Timeout,
    /// No route to the destination.
    #[error("network unreachable")]
    Rte,
    /// Operation is in progress.
    #[error("operation in progress")]
    InProgress,
    /// Illegal value.
    #[error("illegal value")]
    Val,
    /// Operation would block.
    #[error("operation would block")]
    WouldBlock,
    /// Address already in use.
    #[error("address already in use")]
    Use,
    /// Already connected.
    #[error("already connected")]
    IsConn,
    /// Not connected.
    #[error("not connected")]
    Conn,
    /// Connection aborted locally.
    #[error("connection aborted")]
    Abrt,
    /// Connection reset by peer.
    #[error("connection reset by peer")]
    Rst,
    /// Connection closed.
    #[error("connection closed")]
    Clsd,
    /// Illegal argument.
    #[error("illegal argument")]
    Arg,
    /// Low-level network interface error.
    #[error("network interface error")]
    If,
}

/// Result of a call into the engine.
pub type EngineResult = result::Result<(), EngineError>;

/// Errors returned by endpoint operations.
///
/// Values are cheap to clone so a terminal status latched when the receive
/// half shuts down can be handed to every later read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum Error {
    /// The endpoint has no control block (closed, or torn down concurrently),
    /// or the system is shutting down.
    #[error("endpoint is closed")]
    Closed,
    /// A message or queue entry could not be allocated.
    #[error("out of memory")]
    NoMemory,
    /// A blocking call was issued from the protocol thread, where waiting on
    /// the protocol thread can never complete.
    #[error("blocking call issued from the protocol thread")]
    Reentrant,
    /// The engine rejected the operation.
    #[error(transparent)]
    Engine(EngineError),
}

impl Error {
    /// Translates an engine status code into the caller-facing taxonomy.
    pub fn from_engine(err: EngineError) -> Error {
        match err {
            EngineError::Clsd => Error::Closed,
            EngineError::Mem => Error::NoMemory,
            err => Error::Engine(err),
        }
    }

    /// Returns `true` if retrying the same call later may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::NoMemory
                | Error::Engine(EngineError::WouldBlock | EngineError::InProgress)
        )
    }
}

impl From<EngineError> for Error {
    fn from(err: EngineError) -> Error {
        Error::from_engine(err)
    }
}

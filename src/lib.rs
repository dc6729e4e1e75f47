//! Thread-safe, blocking socket layer over a single-threaded TCP engine.
//!
//! The engine runs on a dedicated protocol thread and is driven entirely
//! through callbacks. Caller threads work with [`Endpoint`]s: every operation
//! that touches engine state is marshaled onto the protocol thread, and the
//! caller blocks until it completes or the process-wide [`Context`] is
//! terminated. Inbound data is queued per endpoint and read directly on the
//! caller's thread. Asynchronous events reach the layer above through the
//! [`EndpointOwner`] trait.

#![warn(missing_docs, missing_debug_implementations, rust_2018_idioms)]

pub mod addr;
pub mod config;
pub mod context;
pub mod endpoint;
pub mod engine;
pub mod error;
pub mod tcpip;

mod callbacks;
mod message;
mod queue;

pub use addr::SocketAddr;
pub use config::Config;
pub use context::Context;
pub use endpoint::{Endpoint, EndpointOwner, PendingAccept, SendOutcome, Shutdown};
pub use engine::{Engine, Pcb, Segment, TcpState};
pub use error::{EngineError, Error, Result};
pub use tcpip::Tcpip;

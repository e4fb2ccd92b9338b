//! Single-threaded readiness-multiplexed echo reactor.
//!
//! One thread, one poll instance: the listener and every client socket are
//! registered with mio, and a `while`-loop dispatches each readiness event to
//! its handler. Shared abstractions:
//! - `BufferPool`: fixed-size per-connection buffers
//! - `ConnectionRegistry`: slab of connection state machines
//! - `Reactor`: poll + listener + dispatch loop

mod buffer;
mod connection;
mod event_loop;

pub use event_loop::{Reactor, ReactorHandle};

//! echod: a single-threaded TCP echo server.
//!
//! Accepts many concurrent connections on one thread using readiness
//! multiplexing (epoll/kqueue via mio) and echoes back whatever bytes each
//! client sends.
//!
//! Features:
//! - Slab-backed connection registry with a fixed capacity
//! - Pre-allocated per-connection buffers, no hot-path allocation
//! - Graceful shutdown on SIGINT/SIGTERM
//! - Configuration via CLI arguments or TOML file

mod config;
mod reactor;

use config::Config;
use reactor::{Reactor, ReactorHandle};
use std::sync::OnceLock;
use tracing::info;
use tracing_subscriber::EnvFilter;

static SIGNAL_HANDLE: OnceLock<ReactorHandle> = OnceLock::new();

extern "C" fn request_shutdown(_signal: libc::c_int) {
    // Async-signal-safe: an atomic store plus one write to the poll waker.
    if let Some(handle) = SIGNAL_HANDLE.get() {
        handle.shutdown();
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        listen = %config.listen,
        max_connections = config.max_connections,
        buffer_size = config.buffer_size,
        "Starting echod"
    );

    let reactor = Reactor::bind(&config)?;
    let _ = SIGNAL_HANDLE.set(reactor.handle());

    unsafe {
        let handler: extern "C" fn(libc::c_int) = request_shutdown;
        libc::signal(libc::SIGINT, handler as libc::sighandler_t);
        libc::signal(libc::SIGTERM, handler as libc::sighandler_t);
    }

    reactor.run()?;
    info!("Shutdown complete");
    Ok(())
}

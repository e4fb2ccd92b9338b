//! mio event loop implementation.
//!
//! Readiness-based model: poll tells us when sockets are ready, then we
//! perform non-blocking read/write syscalls. Uses epoll on Linux, kqueue on
//! macOS.
//!
//! The whole server runs on the calling thread. Handlers run to completion
//! between polls, so the registry and buffers need no locking; the only
//! suspension point is inside `poll`.

use crate::config::Config;
use crate::reactor::buffer::BufferPool;
use crate::reactor::connection::{ConnState, Connection, ConnectionRegistry};
use mio::event::Event;
use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Token, Waker};
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

const LISTENER_TOKEN: Token = Token(usize::MAX);
const WAKER_TOKEN: Token = Token(usize::MAX - 1);

/// Events drained per poll call.
const EVENTS_CAPACITY: usize = 1024;

/// Single-threaded echo reactor.
///
/// Owns the poll instance, the listening socket, the connection registry and
/// the buffer pool. Constructed once at startup with [`Reactor::bind`] and
/// consumed by [`Reactor::run`].
pub struct Reactor {
    poll: Poll,
    listener: TcpListener,
    local_addr: SocketAddr,
    connections: ConnectionRegistry,
    buffers: BufferPool,
    waker: Arc<Waker>,
    shutdown: Arc<AtomicBool>,
    active: Arc<AtomicUsize>,
}

/// Cloneable handle for observing and stopping a running [`Reactor`].
#[derive(Clone)]
pub struct ReactorHandle {
    shutdown: Arc<AtomicBool>,
    waker: Arc<Waker>,
    active: Arc<AtomicUsize>,
}

impl ReactorHandle {
    /// Request shutdown: the reactor closes all registered handles and
    /// returns from `run`. Safe to call from any thread, and from a signal
    /// handler (an atomic store plus one write syscall).
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        let _ = self.waker.wake();
    }

    /// Number of currently registered client connections.
    pub fn connection_count(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }
}

impl Reactor {
    /// Bind the listening socket and set up the poll instance.
    pub fn bind(config: &Config) -> io::Result<Self> {
        let addr: SocketAddr = config
            .listen
            .parse()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);

        let mut listener = TcpListener::from_std(create_listener(addr)?);
        let local_addr = listener.local_addr()?;
        poll.registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;

        Ok(Self {
            poll,
            listener,
            local_addr,
            connections: ConnectionRegistry::new(config.max_connections),
            buffers: BufferPool::new(config.max_connections, config.buffer_size),
            waker,
            shutdown: Arc::new(AtomicBool::new(false)),
            active: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// The address the listener is actually bound to (resolves port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Create a handle for shutdown and introspection.
    pub fn handle(&self) -> ReactorHandle {
        ReactorHandle {
            shutdown: Arc::clone(&self.shutdown),
            waker: Arc::clone(&self.waker),
            active: Arc::clone(&self.active),
        }
    }

    /// Run the event loop until shutdown is requested.
    ///
    /// Each iteration blocks in poll, then dispatches every ready event of
    /// the batch: the listener's accept handler, the waker, or a client
    /// connection's echo handler. Per-connection errors close only that
    /// connection; registration failures propagate out and end the process.
    pub fn run(mut self) -> io::Result<()> {
        let mut events = Events::with_capacity(EVENTS_CAPACITY);

        info!(
            addr = %self.local_addr,
            max_connections = self.buffers.available(),
            buffer_size = self.buffers.buffer_size(),
            "Reactor running"
        );

        loop {
            if let Err(e) = self.poll.poll(&mut events, None) {
                // Signal delivery interrupts poll; the shutdown check below
                // picks up the flag set by the handler.
                if e.kind() != io::ErrorKind::Interrupted {
                    return Err(e);
                }
            }

            for event in events.iter() {
                match event.token() {
                    LISTENER_TOKEN => self.accept_ready()?,
                    WAKER_TOKEN => {}
                    Token(conn_id) => self.connection_ready(conn_id, event),
                }
            }

            if self.shutdown.load(Ordering::SeqCst) {
                self.drain_connections();
                info!("Reactor stopped");
                return Ok(());
            }
        }
    }

    /// Accept handler: drain the listener's accept queue.
    ///
    /// Readiness is edge-triggered, so a single accept per wakeup could
    /// strand queued connections; loop until `WouldBlock`.
    fn accept_ready(&mut self) -> io::Result<()> {
        loop {
            match self.listener.accept() {
                Ok((stream, peer_addr)) => {
                    let buf_idx = match self.buffers.alloc() {
                        Some(idx) => idx,
                        None => {
                            warn!(peer = %peer_addr, "Buffer pool exhausted, rejecting connection");
                            continue;
                        }
                    };

                    let conn_id = match self.connections.insert(Connection::new(stream, buf_idx)) {
                        Some(id) => id,
                        None => {
                            warn!(peer = %peer_addr, "Connection limit reached, rejecting connection");
                            self.buffers.free(buf_idx);
                            continue;
                        }
                    };

                    // Re-borrow after insert
                    if let Some(conn) = self.connections.get_mut(conn_id) {
                        self.poll.registry().register(
                            &mut conn.stream,
                            Token(conn_id),
                            Interest::READABLE,
                        )?;
                    }

                    self.active.store(self.connections.len(), Ordering::SeqCst);
                    debug!(conn_id, peer = %peer_addr, "Accepted connection");
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    // Transient accept failures (e.g. EMFILE) leave the
                    // listener registered; future accepts are still served.
                    error!(error = %e, "Accept error");
                    break;
                }
            }
        }
        Ok(())
    }

    /// Dispatch a readiness event for a client connection.
    ///
    /// Errors are contained to the connection: it is closed and
    /// deregistered, and the loop moves on. A token whose entry was removed
    /// earlier in the same batch is ignored.
    fn connection_ready(&mut self, conn_id: usize, event: &Event) {
        if !self.connections.contains(conn_id) {
            return;
        }

        if event.is_readable() {
            if let Err(e) = self.handle_readable(conn_id) {
                debug!(conn_id, error = %e, "Connection error");
                self.close_connection(conn_id);
                return;
            }
        }

        // Re-check: the readable path may have closed the connection
        if !self.connections.contains(conn_id) {
            return;
        }

        if event.is_writable() {
            if let Err(e) = self.handle_writable(conn_id) {
                debug!(conn_id, error = %e, "Connection error");
                self.close_connection(conn_id);
            }
        }
    }

    /// Echo handler, read side: one bounded read, then flip to writing.
    fn handle_readable(&mut self, conn_id: usize) -> io::Result<()> {
        let conn = match self.connections.get_mut(conn_id) {
            Some(conn) => conn,
            None => return Ok(()),
        };

        if !matches!(conn.state, ConnState::Reading) {
            return Ok(());
        }

        let buf = self.buffers.get_mut(conn.buf_idx);
        let n = loop {
            match conn.stream.read(buf) {
                Ok(0) => {
                    // Orderly shutdown by the peer
                    return Err(io::Error::new(io::ErrorKind::ConnectionReset, "peer closed"));
                }
                Ok(n) => break n,
                // Spurious wakeup, nothing to do
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        };

        // Echo the batch back. Switching interest to WRITABLE re-arms
        // readiness, so leftover input produces a fresh event once the
        // write completes and interest flips back.
        conn.start_writing(n);
        self.poll
            .registry()
            .reregister(&mut conn.stream, Token(conn_id), Interest::WRITABLE)?;

        Ok(())
    }

    /// Echo handler, write side: drain the pending batch, then flip back to
    /// reading. Short writes keep the connection in writing state with its
    /// progress recorded; no byte of a batch is dropped.
    fn handle_writable(&mut self, conn_id: usize) -> io::Result<()> {
        let conn = match self.connections.get_mut(conn_id) {
            Some(conn) => conn,
            None => return Ok(()),
        };

        let (mut written, total) = match conn.state {
            ConnState::Writing { written, total } => (written, total),
            ConnState::Reading => return Ok(()),
        };

        let buf = self.buffers.get(conn.buf_idx);
        while written < total {
            match conn.stream.write(&buf[written..total]) {
                Ok(0) => {
                    return Err(io::Error::new(io::ErrorKind::WriteZero, "write returned 0"));
                }
                Ok(n) => written += n,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    // Socket buffer full; resume on next write-readiness
                    conn.state = ConnState::Writing { written, total };
                    return Ok(());
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }

        conn.start_reading();
        self.poll
            .registry()
            .reregister(&mut conn.stream, Token(conn_id), Interest::READABLE)?;

        Ok(())
    }

    /// Deregister, close and forget a connection. Safe to call for an id
    /// already removed.
    fn close_connection(&mut self, conn_id: usize) {
        if let Some(mut conn) = self.connections.remove(conn_id) {
            let _ = self.poll.registry().deregister(&mut conn.stream);
            self.buffers.free(conn.buf_idx);
            self.active.store(self.connections.len(), Ordering::SeqCst);
            debug!(conn_id, "Connection closed");
        }
    }

    /// Shutdown path: close every registered handle.
    fn drain_connections(&mut self) {
        let drained = self.connections.drain();
        let count = drained.len();
        for mut conn in drained {
            let _ = self.poll.registry().deregister(&mut conn.stream);
            self.buffers.free(conn.buf_idx);
        }
        self.active.store(0, Ordering::SeqCst);
        let _ = self.poll.registry().deregister(&mut self.listener);

        if count > 0 {
            info!(count, "Closed remaining connections");
        }
    }
}

/// Create the listening socket: non-blocking, address reuse, fixed backlog.
fn create_listener(addr: SocketAddr) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;

    Ok(socket.into())
}

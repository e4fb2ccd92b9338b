//! Connection state machine and registry.
//!
//! Each accepted connection tracks its current state (reading or writing back
//! an echo batch) and its pool buffer. The registry maps slab keys, which
//! double as mio tokens, to live connections.

use mio::net::TcpStream;
use slab::Slab;

/// Current state of a connection.
#[derive(Debug, Clone, Copy)]
pub enum ConnState {
    /// Waiting for the peer to send data.
    Reading,
    /// Echoing a read batch back to the peer.
    Writing {
        /// Bytes already written.
        written: usize,
        /// Total bytes to write.
        total: usize,
    },
}

/// A single client connection.
#[derive(Debug)]
pub struct Connection {
    /// The non-blocking socket.
    pub stream: TcpStream,
    /// Current connection state.
    pub state: ConnState,
    /// Index of this connection's buffer in the pool.
    pub buf_idx: usize,
}

impl Connection {
    /// Create a new connection in initial reading state.
    pub fn new(stream: TcpStream, buf_idx: usize) -> Self {
        Self {
            stream,
            state: ConnState::Reading,
            buf_idx,
        }
    }

    /// Transition to writing back `total` echoed bytes.
    pub fn start_writing(&mut self, total: usize) {
        self.state = ConnState::Writing { written: 0, total };
    }

    /// Transition back to reading state.
    pub fn start_reading(&mut self) {
        self.state = ConnState::Reading;
    }
}

/// Registry of active connections using slab allocation.
///
/// Provides O(1) insert, lookup, and remove. Every live client handle has
/// exactly one entry; a removed key is never handed out to dispatch again.
pub struct ConnectionRegistry {
    connections: Slab<Connection>,
    max_connections: usize,
}

impl ConnectionRegistry {
    /// Create a new registry with specified maximum capacity.
    pub fn new(max_connections: usize) -> Self {
        Self {
            connections: Slab::with_capacity(max_connections),
            max_connections,
        }
    }

    /// Insert a new connection into the registry.
    ///
    /// Returns `None` if the registry is at capacity.
    pub fn insert(&mut self, conn: Connection) -> Option<usize> {
        if self.connections.len() >= self.max_connections {
            return None;
        }
        Some(self.connections.insert(conn))
    }

    /// Get a mutable reference to a connection.
    pub fn get_mut(&mut self, id: usize) -> Option<&mut Connection> {
        self.connections.get_mut(id)
    }

    /// Remove a connection from the registry.
    ///
    /// Removing an id that is not present is a no-op returning `None`, so a
    /// handle closed earlier in the same event batch can be ignored safely.
    pub fn remove(&mut self, id: usize) -> Option<Connection> {
        self.connections.try_remove(id)
    }

    /// Check if a connection exists.
    pub fn contains(&self, id: usize) -> bool {
        self.connections.contains(id)
    }

    /// Number of active connections.
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// Drain all connections, returning them for cleanup.
    pub fn drain(&mut self) -> Vec<Connection> {
        let mut drained = Vec::with_capacity(self.connections.len());
        let ids: Vec<usize> = self.connections.iter().map(|(id, _)| id).collect();
        for id in ids {
            drained.push(self.connections.remove(id));
        }
        drained
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener as StdTcpListener;

    fn loopback_stream(listener: &StdTcpListener) -> TcpStream {
        let addr = listener.local_addr().unwrap();
        let client = std::net::TcpStream::connect(addr).unwrap();
        client.set_nonblocking(true).unwrap();
        TcpStream::from_std(client)
    }

    #[test]
    fn test_connection_state_transitions() {
        let listener = StdTcpListener::bind("127.0.0.1:0").unwrap();
        let mut conn = Connection::new(loopback_stream(&listener), 0);

        assert!(matches!(conn.state, ConnState::Reading));

        conn.start_writing(100);
        assert!(matches!(
            conn.state,
            ConnState::Writing {
                written: 0,
                total: 100
            }
        ));

        conn.start_reading();
        assert!(matches!(conn.state, ConnState::Reading));
    }

    #[test]
    fn test_registry_capacity_and_removal() {
        let listener = StdTcpListener::bind("127.0.0.1:0").unwrap();
        let mut registry = ConnectionRegistry::new(2);

        let c1 = Connection::new(loopback_stream(&listener), 0);
        let c2 = Connection::new(loopback_stream(&listener), 1);
        let c3 = Connection::new(loopback_stream(&listener), 2);

        let id1 = registry.insert(c1).unwrap();
        let id2 = registry.insert(c2).unwrap();

        // At capacity
        assert!(registry.insert(c3).is_none());

        assert_eq!(registry.len(), 2);
        assert!(registry.contains(id1));
        assert_eq!(registry.get_mut(id2).unwrap().buf_idx, 1);

        assert!(registry.remove(id1).is_some());
        assert!(!registry.contains(id1));
        assert_eq!(registry.len(), 1);

        // Double-remove is a no-op
        assert!(registry.remove(id1).is_none());
    }

    #[test]
    fn test_registry_drain() {
        let listener = StdTcpListener::bind("127.0.0.1:0").unwrap();
        let mut registry = ConnectionRegistry::new(8);

        for i in 0..3 {
            let conn = Connection::new(loopback_stream(&listener), i);
            registry.insert(conn).unwrap();
        }

        let drained = registry.drain();
        assert_eq!(drained.len(), 3);
        assert_eq!(registry.len(), 0);
    }
}

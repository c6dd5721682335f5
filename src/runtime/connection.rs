//! Connection state machine for managing TCP connections.
//!
//! Each connection tracks its current state (awaiting read, awaiting write,
//! closed) and owns the read and write buffers its requests pass through.

use bytes::BytesMut;
use mio::Interest;
use slab::Slab;
use std::io::{self, Read, Write};

/// Current state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Registered for read readiness, waiting for the next request.
    AwaitingRead,
    /// A request was read; registered for write readiness to send the reply.
    AwaitingWrite,
    /// Peer went away. Terminal.
    Closed,
}

impl ConnState {
    /// State after a read returned `n` bytes.
    pub fn after_read(self, n: usize) -> ConnState {
        match self {
            ConnState::AwaitingRead if n == 0 => ConnState::Closed,
            ConnState::AwaitingRead => ConnState::AwaitingWrite,
            other => other,
        }
    }

    /// State after the reply was written.
    pub fn after_write(self) -> ConnState {
        match self {
            ConnState::AwaitingWrite => ConnState::AwaitingRead,
            other => other,
        }
    }

    /// Readiness the socket must be registered for in this state.
    pub fn interest(self) -> Option<Interest> {
        match self {
            ConnState::AwaitingRead => Some(Interest::READABLE),
            ConnState::AwaitingWrite => Some(Interest::WRITABLE),
            ConnState::Closed => None,
        }
    }
}

/// A single client connection.
#[derive(Debug)]
pub struct Connection<S> {
    pub stream: S,
    pub state: ConnState,
    read_buf: BytesMut,
    write_buf: BytesMut,
}

impl<S: Read + Write> Connection<S> {
    /// Create a new connection in the initial `AwaitingRead` state.
    pub fn new(stream: S, read_buf: BytesMut, write_buf: BytesMut) -> Self {
        Self {
            stream,
            state: ConnState::AwaitingRead,
            read_buf,
            write_buf,
        }
    }

    /// Issue a single read of at most `max` bytes into the read buffer.
    ///
    /// On success the buffer holds exactly the bytes read; on error it is
    /// left empty.
    pub fn read_chunk(&mut self, max: usize) -> io::Result<usize> {
        self.read_buf.resize(max, 0);
        match self.stream.read(&mut self.read_buf[..]) {
            Ok(n) => {
                self.read_buf.truncate(n);
                Ok(n)
            }
            Err(e) => {
                self.read_buf.clear();
                Err(e)
            }
        }
    }

    /// Bytes from the last successful `read_chunk`.
    pub fn received(&self) -> &[u8] {
        &self.read_buf
    }

    /// Reset the read buffer after its contents were consumed.
    pub fn clear_received(&mut self) {
        self.read_buf.clear();
    }

    /// Stage `reply` in the write buffer and issue a single write.
    ///
    /// The write buffer is cleared afterwards whatever the outcome.
    pub fn write_reply(&mut self, reply: &[u8]) -> io::Result<usize> {
        self.write_buf.extend_from_slice(reply);
        let result = self.stream.write(&self.write_buf);
        self.write_buf.clear();
        result
    }

    /// Release the buffers, keeping only the socket for deregistration.
    pub fn into_stream(self) -> S {
        self.stream
    }
}

/// Registry of active connections using slab allocation.
///
/// Provides O(1) insert, lookup, and remove operations. Slab keys double
/// as the connections' poll tokens.
pub struct ConnectionRegistry<S> {
    connections: Slab<Connection<S>>,
}

impl<S> ConnectionRegistry<S> {
    /// Create a new registry with room for `capacity` connections before it grows.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            connections: Slab::with_capacity(capacity),
        }
    }

    /// Insert a new connection, returning its id.
    pub fn insert(&mut self, conn: Connection<S>) -> usize {
        self.connections.insert(conn)
    }

    /// Get a mutable reference to a connection.
    pub fn get_mut(&mut self, id: usize) -> Option<&mut Connection<S>> {
        self.connections.get_mut(id)
    }

    /// Remove a connection from the registry.
    pub fn remove(&mut self, id: usize) -> Option<Connection<S>> {
        self.connections.try_remove(id)
    }

    /// Id the next inserted connection will receive.
    pub fn vacant_key(&self) -> usize {
        self.connections.vacant_key()
    }

    /// Number of active connections.
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// Check if there are no connections.
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Remove every connection, yielding them for cleanup.
    pub fn drain(&mut self) -> impl Iterator<Item = Connection<S>> + '_ {
        self.connections.drain()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    /// In-memory stream: reads from `input`, records writes, optionally
    /// accepting only `write_limit` bytes per call.
    struct MockStream {
        input: Cursor<Vec<u8>>,
        written: Vec<u8>,
        write_limit: Option<usize>,
    }

    impl MockStream {
        fn new(input: &[u8]) -> Self {
            Self {
                input: Cursor::new(input.to_vec()),
                written: Vec::new(),
                write_limit: None,
            }
        }
    }

    impl Read for MockStream {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.input.read(buf)
        }
    }

    impl Write for MockStream {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            let n = self.write_limit.map_or(buf.len(), |limit| limit.min(buf.len()));
            self.written.extend_from_slice(&buf[..n]);
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn conn(input: &[u8]) -> Connection<MockStream> {
        Connection::new(
            MockStream::new(input),
            BytesMut::with_capacity(16),
            BytesMut::with_capacity(16),
        )
    }

    #[test]
    fn test_connection_state_transitions() {
        let state = ConnState::AwaitingRead;
        assert_eq!(state.interest(), Some(Interest::READABLE));

        let state = state.after_read(4);
        assert_eq!(state, ConnState::AwaitingWrite);
        assert_eq!(state.interest(), Some(Interest::WRITABLE));

        // Reads are ignored while waiting to write
        assert_eq!(state.after_read(0), ConnState::AwaitingWrite);

        let state = state.after_write();
        assert_eq!(state, ConnState::AwaitingRead);

        let state = state.after_read(0);
        assert_eq!(state, ConnState::Closed);
        assert_eq!(state.interest(), None);
        assert_eq!(state.after_write(), ConnState::Closed);
        assert_eq!(state.after_read(10), ConnState::Closed);
    }

    #[test]
    fn test_single_read_is_bounded() {
        let mut conn = conn(b"hello world");
        assert_eq!(conn.state, ConnState::AwaitingRead);

        let n = conn.read_chunk(5).unwrap();
        assert_eq!(n, 5);
        assert_eq!(conn.received(), b"hello");

        conn.clear_received();
        assert!(conn.received().is_empty());

        let n = conn.read_chunk(16).unwrap();
        assert_eq!(conn.received(), b" world");
        assert_eq!(n, 6);

        conn.clear_received();
        assert_eq!(conn.read_chunk(16).unwrap(), 0);
        assert!(conn.received().is_empty());
    }

    #[test]
    fn test_write_reply_clears_buffer() {
        let mut conn = conn(b"");
        assert_eq!(conn.write_reply(b"success").unwrap(), 7);
        assert_eq!(conn.write_reply(b"success").unwrap(), 7);

        assert!(conn.write_buf.is_empty());
        assert!(conn.received().is_empty());
        assert_eq!(conn.into_stream().written, b"successsuccess");
    }

    #[test]
    fn test_short_write_is_not_retried() {
        let mut conn = conn(b"");
        conn.stream.write_limit = Some(3);

        assert_eq!(conn.write_reply(b"success").unwrap(), 3);
        assert_eq!(conn.stream.written, b"suc");
        assert!(conn.write_buf.is_empty());
    }

    #[test]
    fn test_connection_registry() {
        let mut registry = ConnectionRegistry::with_capacity(2);
        assert!(registry.is_empty());

        let id1 = registry.insert(conn(b"a"));
        let id2 = registry.insert(conn(b"b"));
        let id3 = registry.insert(conn(b"c"));

        assert_eq!(registry.len(), 3);
        assert_ne!(id1, id2);
        assert_eq!(registry.vacant_key(), 3);
        assert_eq!(registry.get_mut(id3).unwrap().read_chunk(4).unwrap(), 1);

        assert!(registry.remove(id1).is_some());
        assert!(registry.remove(id1).is_none());
        assert_eq!(registry.len(), 2);
        // Freed slots are reused
        assert_eq!(registry.vacant_key(), id1);

        assert_eq!(registry.drain().count(), 2);
        assert!(registry.is_empty());
    }
}

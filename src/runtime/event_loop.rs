//! mio event loop implementation.
//!
//! Readiness-based model: poll tells us when sockets are ready,
//! then we perform non-blocking accept/read/write syscalls.
//! Uses epoll on Linux, kqueue on macOS.
//!
//! Each connection alternates between two registrations: readable while
//! waiting for a request, writable while its reply is pending. Exactly one
//! read and one write happen per cycle.

use crate::runtime::connection::{ConnState, Connection, ConnectionRegistry};
use crate::runtime::{Observer, ShutdownHandle, Stats};
use bytes::{Bytes, BytesMut};
use mio::event::Event;
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token, Waker};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

const LISTENER_TOKEN: Token = Token(usize::MAX);
const WAKE_TOKEN: Token = Token(usize::MAX - 1);

const INITIAL_CONNECTIONS: usize = 128;

/// Settings the event loop runs with.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub response: Bytes,
    pub buffer_size: usize,
    pub batch_size: usize,
    pub poll_timeout: Duration,
}

/// The event loop: a poll instance, its listener, and the connections
/// accepted through it. Everything here is touched by a single thread.
pub struct Worker<O> {
    poll: Poll,
    listener: TcpListener,
    connections: ConnectionRegistry<TcpStream>,
    observer: O,
    settings: WorkerSettings,
    shutdown: ShutdownHandle,
    stats: Arc<Stats>,
}

impl<O: Observer> Worker<O> {
    /// Register `listener` with a fresh poll instance.
    ///
    /// The worker's waker is added to `shutdown` so a shutdown request
    /// interrupts its readiness wait.
    pub fn new(
        listener: std::net::TcpListener,
        observer: O,
        settings: WorkerSettings,
        shutdown: ShutdownHandle,
        stats: Arc<Stats>,
    ) -> io::Result<Self> {
        let poll = Poll::new()?;

        let mut listener = TcpListener::from_std(listener);
        poll.registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;

        let waker = Waker::new(poll.registry(), WAKE_TOKEN)?;
        shutdown.register(Arc::new(waker));

        let connections = ConnectionRegistry::with_capacity(INITIAL_CONNECTIONS);

        Ok(Self {
            poll,
            listener,
            connections,
            observer,
            settings,
            shutdown,
            stats,
        })
    }

    /// Run until shutdown is requested.
    ///
    /// Only a failure of the readiness wait itself ends the loop with an
    /// error; per-connection failures are logged and the loop moves on.
    pub fn run(mut self) -> io::Result<()> {
        let mut events = Events::with_capacity(self.settings.batch_size);
        let mut iterations: u64 = 0;

        info!(
            buffer_size = self.settings.buffer_size,
            poll_timeout_secs = self.settings.poll_timeout.as_secs(),
            "Event loop started"
        );

        while !self.shutdown.is_triggered() {
            match self.poll.poll(&mut events, Some(self.settings.poll_timeout)) {
                Ok(()) => {}
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!(error = %e, "Poll failed");
                    return Err(e);
                }
            }

            iterations += 1;
            trace!(
                iterations,
                ready = events.iter().count(),
                "Poll returned"
            );

            for event in events.iter() {
                match event.token() {
                    WAKE_TOKEN => {}
                    LISTENER_TOKEN => {
                        if let Err(e) = self.accept_connections() {
                            self.stats.record_error();
                            error!(error = %e, "Accept error");
                        }
                    }
                    Token(conn_id) => {
                        if let Err(e) = self.handle_connection_event(conn_id, event) {
                            self.stats.record_error();
                            if is_peer_gone(&e) {
                                debug!(conn_id, error = %e, "Peer gone");
                                self.close_connection(conn_id);
                            } else {
                                warn!(conn_id, error = %e, "Connection error");
                            }
                        }
                    }
                }
            }
        }

        let open = self.connections.len();
        if !self.connections.is_empty() {
            debug!(open, "Dropping open connections");
        }
        for conn in self.connections.drain() {
            let mut stream = conn.into_stream();
            let _ = self.poll.registry().deregister(&mut stream);
            self.stats.record_close();
        }

        info!(
            iterations,
            dropped_connections = open,
            stats = ?self.stats.snapshot(),
            "Event loop stopped"
        );
        Ok(())
    }

    /// Accept until the listener would block.
    ///
    /// Errors that concern only the connection being accepted are logged and
    /// skipped; anything else stops this round of accepting.
    fn accept_connections(&mut self) -> io::Result<()> {
        loop {
            let (mut stream, peer_addr) = match self.listener.accept() {
                Ok(accepted) => accepted,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) if is_transient_accept_error(&e) => {
                    self.stats.record_error();
                    warn!(error = %e, "Skipping failed accept");
                    continue;
                }
                Err(e) => return Err(e),
            };

            let entry = self.connections.vacant_key();
            self.poll
                .registry()
                .register(&mut stream, Token(entry), Interest::READABLE)?;

            let read_buf = BytesMut::with_capacity(self.settings.buffer_size);
            let write_buf = BytesMut::with_capacity(self.settings.response.len());
            let conn_id = self
                .connections
                .insert(Connection::new(stream, read_buf, write_buf));
            debug_assert_eq!(conn_id, entry);
            self.stats.record_accept();

            debug!(
                conn_id,
                peer = %peer_addr,
                "Accepted connection"
            );
        }
    }

    fn handle_connection_event(&mut self, conn_id: usize, event: &Event) -> io::Result<()> {
        if event.is_readable() || event.is_read_closed() || event.is_error() {
            self.handle_readable(conn_id)?;
        }

        if event.is_writable() {
            self.handle_writable(conn_id)?;
        }

        Ok(())
    }

    fn handle_readable(&mut self, conn_id: usize) -> io::Result<()> {
        let conn = match self.connections.get_mut(conn_id) {
            Some(conn) if conn.state == ConnState::AwaitingRead => conn,
            // Closed earlier in this batch, or not waiting for a request
            _ => return Ok(()),
        };

        let n = match conn.read_chunk(self.settings.buffer_size) {
            Ok(n) => n,
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
            Err(e) => return Err(e),
        };

        conn.state = conn.state.after_read(n);
        if conn.state == ConnState::Closed {
            trace!(conn_id, "Read EOF");
            self.close_connection(conn_id);
            return Ok(());
        }

        self.stats.record_read();
        self.observer.observe(conn_id, conn.received());
        conn.clear_received();

        self.rearm(conn_id)?;
        trace!(conn_id, bytes = n, "Awaiting write");

        Ok(())
    }

    fn handle_writable(&mut self, conn_id: usize) -> io::Result<()> {
        let conn = match self.connections.get_mut(conn_id) {
            Some(conn) if conn.state == ConnState::AwaitingWrite => conn,
            _ => return Ok(()),
        };

        let response = &self.settings.response;
        let n = match conn.write_reply(response) {
            Ok(0) => {
                return Err(io::Error::new(io::ErrorKind::WriteZero, "write returned 0"));
            }
            Ok(n) => n,
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
            Err(e) => return Err(e),
        };

        if n < response.len() {
            warn!(
                conn_id,
                written = n,
                total = response.len(),
                "Short write, reply truncated"
            );
        }
        self.stats.record_reply();

        conn.state = conn.state.after_write();
        self.rearm(conn_id)?;
        trace!(conn_id, "Awaiting read");

        Ok(())
    }

    /// Replace the connection's registration with the interest its state calls for.
    fn rearm(&mut self, conn_id: usize) -> io::Result<()> {
        let conn = match self.connections.get_mut(conn_id) {
            Some(conn) => conn,
            None => return Ok(()),
        };

        match conn.state.interest() {
            Some(interest) => self
                .poll
                .registry()
                .reregister(&mut conn.stream, Token(conn_id), interest),
            None => Ok(()),
        }
    }

    fn close_connection(&mut self, conn_id: usize) {
        if let Some(conn) = self.connections.remove(conn_id) {
            let mut stream = conn.into_stream();
            let _ = self.poll.registry().deregister(&mut stream);
            self.stats.record_close();

            debug!(conn_id, "Connection closed");
        }
    }
}

/// Errors meaning the peer is no longer there to talk to.
fn is_peer_gone(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof
            | io::ErrorKind::WriteZero
    )
}

/// Accept failures that concern only the connection being accepted.
///
/// Descriptor or memory exhaustion is not in this set: retrying those in a
/// loop would spin.
fn is_transient_accept_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::Interrupted
            | io::ErrorKind::PermissionDenied
            | io::ErrorKind::TimedOut
    )
}

/// Create a non-blocking TCP listener.
///
/// `SO_REUSEPORT` is never set, so a port that is already in use fails the
/// bind.
pub fn create_listener(addr: SocketAddr) -> io::Result<std::net::TcpListener> {
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

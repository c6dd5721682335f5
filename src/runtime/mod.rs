//! Readiness-based runtime for the acknowledgment server.
//!
//! A server is one event loop on one thread, owning:
//! - a mio `Poll` and the listening socket
//! - a `ConnectionRegistry` of the connections it accepted, each with its
//!   own read and write buffer
//!
//! Other threads only reach it through the shutdown handle and the
//! statistics counters.

mod connection;
mod event_loop;
mod observer;
mod shutdown;
mod stats;

pub use observer::{LogObserver, Observer};
pub use shutdown::{install_signal_handler, ShutdownHandle};
pub use stats::Stats;

use crate::config::Config;
use bytes::Bytes;
use event_loop::{create_listener, Worker, WorkerSettings};
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tracing::info;

/// A bound server, ready to run.
///
/// Binding happens in [`Server::bind`], so an address that is already in use
/// fails at startup rather than inside the event loop.
pub struct Server<O = LogObserver> {
    worker: Worker<O>,
    local_addr: SocketAddr,
    shutdown: ShutdownHandle,
    stats: Arc<Stats>,
}

impl Server<LogObserver> {
    /// Bind a server that logs every request it reads.
    pub fn bind(config: &Config) -> io::Result<Self> {
        Self::bind_with_observer(config, LogObserver)
    }
}

impl<O: Observer> Server<O> {
    /// Bind a server that hands every chunk it reads to `observer`.
    ///
    /// An invalid `config` fails with `InvalidInput` before anything is bound.
    pub fn bind_with_observer(config: &Config, observer: O) -> io::Result<Self> {
        config
            .validate()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e.to_string()))?;
        let host: IpAddr = config
            .host
            .parse()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

        let settings = WorkerSettings {
            response: Bytes::copy_from_slice(config.response.as_bytes()),
            buffer_size: config.buffer_size,
            batch_size: config.batch_size,
            poll_timeout: config.poll_timeout,
        };

        let shutdown = ShutdownHandle::new();
        let stats = Arc::new(Stats::default());

        let listener = create_listener(SocketAddr::new(host, config.port))?;
        let local_addr = listener.local_addr()?;

        info!(
            addr = %local_addr,
            response_len = settings.response.len(),
            "Server bound"
        );

        let worker = Worker::new(
            listener,
            observer,
            settings,
            shutdown.clone(),
            Arc::clone(&stats),
        )?;

        Ok(Self {
            worker,
            local_addr,
            shutdown,
            stats,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Handle that stops the server when triggered.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    pub fn stats(&self) -> Arc<Stats> {
        Arc::clone(&self.stats)
    }

    /// Run the event loop on the calling thread until shutdown is requested.
    pub fn run(self) -> io::Result<()> {
        self.worker.run()
    }
}

/// Bind and run a server from `config` until SIGINT or SIGTERM.
pub fn run(config: Config) -> io::Result<()> {
    let server = Server::bind(&config)?;
    install_signal_handler(server.shutdown_handle())?;
    info!(addr = %server.local_addr(), "Listening");

    let stats = server.stats();
    server.run()?;

    let snapshot = stats.snapshot();
    info!(
        accepted = snapshot.accepted,
        closed = snapshot.closed,
        active = snapshot.active(),
        replies = snapshot.replies,
        errors = snapshot.errors,
        "Final statistics"
    );
    Ok(())
}

//! ack-loop: a readiness-based TCP acknowledgment server
//!
//! Every chunk of bytes a client sends is handed to an observer (logged by
//! default) and answered with a fixed reply, after which the connection is
//! re-armed for the next request.
//!
//! Features:
//! - Single-threaded mio event loop (epoll/kqueue)
//! - Explicit per-connection state with close on end-of-stream
//! - Configuration via CLI arguments or TOML file

mod config;
mod runtime;

use config::Config;
use tracing::info;
use tracing_subscriber::EnvFilter;

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
        host = %config.host,
        port = config.port,
        buffer_size = config.buffer_size,
        poll_timeout_secs = config.poll_timeout.as_secs(),
        "Starting ack-loop server"
    );

    runtime::run(config)?;

    info!("Server stopped");
    Ok(())
}

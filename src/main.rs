//! nectarine: a readiness-driven TCP request/response server
//!
//! A single dispatcher thread multiplexes the listening socket and every
//! accepted connection; a bounded pool of worker threads reads each request
//! and writes the reply.
//!
//! Features:
//! - Persistent connections with many request/response exchanges
//! - Bounded handler concurrency with backpressure on accept
//! - Fixed-reply or echo responses
//! - Optional idle timeout and graceful shutdown on Ctrl-C
//! - Configuration via CLI arguments or TOML file

mod config;
mod error;
mod runtime;

use config::Config;
use error::ServerError;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), ServerError> {
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
        workers = config.workers,
        queue_depth = config.queue_depth,
        mode = ?config.mode,
        "Starting nectarine server"
    );

    runtime::run(config)
}

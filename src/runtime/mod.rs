//! Connection acceptance and dispatch runtime.
//!
//! Readiness-based I/O using mio (epoll on Linux, kqueue on macOS):
//! - `listener`: bound listening socket and non-blocking accept
//! - `multiplexer`: watch set and readiness wait
//! - `connection`: connection handles and the registry that owns them
//! - `dispatcher`: the control loop
//! - `handler`: one read, one response, keep or close
//! - `pool`: bounded worker threads that run handlers
//! - `protocol`: the `Responder` that computes replies

mod connection;
mod dispatcher;
mod handler;
mod listener;
mod multiplexer;
mod pool;
pub mod protocol;
mod stats;

pub use dispatcher::Dispatcher;

use crate::config::Config;
use crate::error::ServerError;
use tracing::info;

/// Bind, install the Ctrl-C handler and run until shutdown.
pub fn run(config: Config) -> Result<(), ServerError> {
    let responder = protocol::from_config(&config);
    let dispatcher = Dispatcher::bind(&config, responder)?;

    info!(addr = %dispatcher.local_addr(), "Ready to accept connections");

    let shutdown = dispatcher.shutdown_handle();
    ctrlc::set_handler(move || {
        info!("Received interrupt, shutting down");
        shutdown.shutdown();
    })?;

    dispatcher.run()
}

//! Error taxonomy for the acceptor.
//!
//! Only `BindError` and `MultiplexerError` are fatal. Accept failures are
//! logged and retried, connection errors close the one connection they
//! belong to.

use crate::config::ConfigError;
use std::io;
use std::net::SocketAddr;
use thiserror::Error;

/// The listening socket could not be created, bound or put into listen mode.
#[derive(Error, Debug)]
#[error("failed to bind {addr}: {source}")]
pub struct BindError {
    pub addr: SocketAddr,
    #[source]
    pub source: io::Error,
}

/// A single `accept` call failed. The accept loop survives these.
#[derive(Error, Debug)]
#[error("accept failed: {0}")]
pub struct AcceptError(#[from] pub io::Error);

impl AcceptError {
    /// True when the failure comes from running out of descriptors or memory,
    /// where retrying immediately would only spin.
    pub fn is_resource_exhaustion(&self) -> bool {
        matches!(
            self.0.raw_os_error(),
            Some(libc::EMFILE | libc::ENFILE | libc::ENOBUFS | libc::ENOMEM)
        )
    }
}

/// A read or write on one connection failed.
#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("read failed: {0}")]
    Read(#[source] io::Error),

    #[error("write failed: {0}")]
    Write(#[source] io::Error),

    #[error("write did not complete within {0:?}")]
    WriteTimeout(std::time::Duration),
}

/// The readiness mechanism failed or was asked to break its watch-set invariant.
#[derive(Error, Debug)]
pub enum MultiplexerError {
    #[error("multiplexer I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("token {0} is already watched")]
    AlreadyWatched(usize),

    #[error("token {0} is not watched")]
    NotWatched(usize),
}

/// Top-level error returned from `main`.
#[derive(Error, Debug)]
pub enum ServerError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Bind(#[from] BindError),

    #[error(transparent)]
    Multiplexer(#[from] MultiplexerError),

    #[error("failed to start worker pool: {0}")]
    Spawn(#[source] io::Error),

    #[error("failed to install signal handler: {0}")]
    Signal(#[from] ctrlc::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resource_exhaustion_classification() {
        let emfile = AcceptError(io::Error::from_raw_os_error(libc::EMFILE));
        assert!(emfile.is_resource_exhaustion());

        let reset = AcceptError(io::Error::from_raw_os_error(libc::ECONNABORTED));
        assert!(!reset.is_resource_exhaustion());
    }

    #[test]
    fn test_bind_error_display() {
        let err = BindError {
            addr: "127.0.0.1:7070".parse().unwrap(),
            source: io::Error::from(io::ErrorKind::AddrInUse),
        };
        assert!(err.to_string().starts_with("failed to bind 127.0.0.1:7070"));
    }
}

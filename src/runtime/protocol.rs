//! Response computation for the connection handler.
//!
//! The runtime is protocol-agnostic: it reads one chunk of bytes and hands it
//! to a `Responder`, then writes back whatever comes out. Nothing here parses
//! or frames requests.

use crate::config::{Config, ResponseMode};
use bytes::Bytes;
use std::sync::Arc;

/// Computes the reply for one chunk of request bytes.
///
/// Called from worker threads, possibly for many connections at once.
pub trait Responder: Send + Sync + 'static {
    /// Produce the bytes to send back for `request`.
    ///
    /// An empty reply writes nothing and leaves the connection open.
    fn respond(&self, request: &[u8]) -> Bytes;
}

impl<F> Responder for F
where
    F: Fn(&[u8]) -> Bytes + Send + Sync + 'static,
{
    fn respond(&self, request: &[u8]) -> Bytes {
        self(request)
    }
}

/// Answers every request with the same bytes.
#[derive(Debug, Clone)]
pub struct FixedReply(Bytes);

impl FixedReply {
    pub fn new(reply: impl Into<Bytes>) -> Self {
        Self(reply.into())
    }
}

impl Responder for FixedReply {
    fn respond(&self, _request: &[u8]) -> Bytes {
        // Bytes clones share the allocation.
        self.0.clone()
    }
}

/// Answers every request with the request itself.
#[derive(Debug, Clone, Copy, Default)]
pub struct Echo;

impl Responder for Echo {
    fn respond(&self, request: &[u8]) -> Bytes {
        Bytes::copy_from_slice(request)
    }
}

/// Build the responder selected by the configuration.
pub fn from_config(config: &Config) -> Arc<dyn Responder> {
    match config.mode {
        ResponseMode::Fixed => Arc::new(FixedReply::new(config.reply.clone())),
        ResponseMode::Echo => Arc::new(Echo),
    }
}

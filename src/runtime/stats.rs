//! Runtime counters shared between the dispatcher, the worker pool and tests.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Lock-free counters describing what the acceptor is doing.
#[derive(Debug, Default)]
pub struct ServerStats {
    accepted: AtomicU64,
    accept_errors: AtomicU64,
    closed: AtomicU64,
    deferred: AtomicU64,
    wakeups: AtomicU64,
    open_connections: AtomicUsize,
    watched: AtomicUsize,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

/// Point-in-time copy of [`ServerStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub accepted: u64,
    pub accept_errors: u64,
    pub closed: u64,
    pub deferred: u64,
    /// Times the dispatcher returned from a multiplexer wait.
    pub wakeups: u64,
    pub open_connections: usize,
    pub watched: usize,
    pub in_flight: usize,
    pub peak_in_flight: usize,
}

impl ServerStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn connection_opened(&self) {
        self.accepted.fetch_add(1, Ordering::Relaxed);
        self.open_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn connection_closed(&self) {
        self.closed.fetch_add(1, Ordering::Relaxed);
        self.open_connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub(crate) fn accept_failed(&self) {
        self.accept_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn dispatch_deferred(&self) {
        self.deferred.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn woke(&self) {
        self.wakeups.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn set_watched(&self, count: usize) {
        self.watched.store(count, Ordering::Relaxed);
    }

    pub(crate) fn handler_started(&self) {
        let now = self.in_flight.fetch_add(1, Ordering::AcqRel) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::AcqRel);
    }

    pub(crate) fn handler_finished(&self) {
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            accepted: self.accepted.load(Ordering::Relaxed),
            accept_errors: self.accept_errors.load(Ordering::Relaxed),
            closed: self.closed.load(Ordering::Relaxed),
            deferred: self.deferred.load(Ordering::Relaxed),
            wakeups: self.wakeups.load(Ordering::Relaxed),
            open_connections: self.open_connections.load(Ordering::Relaxed),
            watched: self.watched.load(Ordering::Relaxed),
            in_flight: self.in_flight.load(Ordering::Acquire),
            peak_in_flight: self.peak_in_flight.load(Ordering::Acquire),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peak_tracks_maximum() {
        let stats = ServerStats::new();
        stats.handler_started();
        stats.handler_started();
        stats.handler_finished();
        stats.handler_started();
        stats.handler_finished();
        stats.handler_finished();

        let snap = stats.snapshot();
        assert_eq!(snap.in_flight, 0);
        assert_eq!(snap.peak_in_flight, 2);
    }

    #[test]
    fn test_open_close_balance() {
        let stats = ServerStats::new();
        stats.connection_opened();
        stats.connection_opened();
        stats.connection_closed();

        let snap = stats.snapshot();
        assert_eq!(snap.accepted, 2);
        assert_eq!(snap.closed, 1);
        assert_eq!(snap.open_connections, 1);
    }
}

//! Dispatcher: the control loop that turns readiness into handler work.
//!
//! One thread owns the multiplexer and the connection registry; every watch,
//! unwatch, insert and remove happens here. Handlers run on the worker pool
//! and report back through a completion channel plus a multiplexer wake-up.
//!
//! Each wake-up is processed in a fixed order:
//!
//! 1. completions (re-arm or close the connections handlers returned)
//! 2. connections deferred by backpressure, oldest first
//! 3. connections reported readable in this batch
//! 4. the listener, if it is ready or still has a backlog
//! 5. the idle sweep
//!
//! Closing before dispatching means a descriptor closed in this batch is
//! never handed to a handler, and accepting last means a slot freed in this
//! batch is never reused before the batch's stale events are discarded.

use crate::config::Config;
use crate::error::{MultiplexerError, ServerError};
use crate::runtime::connection::{ConnectionHandle, ConnectionRegistry};
use crate::runtime::handler::{HandlerContext, HandlerOutcome};
use crate::runtime::listener::{self, Accept, ListenEndpoint};
use crate::runtime::multiplexer::{Multiplexer, WAKE_TOKEN};
use crate::runtime::pool::{Completion, SubmitError, WorkerPool};
use crate::runtime::protocol::Responder;
use crate::runtime::stats::ServerStats;
use crossbeam::channel::{self, Receiver, RecvTimeoutError};
use mio::net::{TcpListener, TcpStream};
use mio::{Token, Waker};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

const LISTENER_TOKEN: Token = Token(usize::MAX);

const ACCEPT_BACKOFF_MIN: Duration = Duration::from_millis(10);
const ACCEPT_BACKOFF_MAX: Duration = Duration::from_secs(1);

/// Stops a running dispatcher from any thread.
#[derive(Clone)]
pub struct ShutdownHandle {
    flag: Arc<AtomicBool>,
    waker: Arc<Waker>,
}

impl ShutdownHandle {
    /// Request shutdown and interrupt the dispatcher's wait.
    pub fn shutdown(&self) {
        self.flag.store(true, Ordering::Release);
        if let Err(e) = self.waker.wake() {
            warn!(error = %e, "Failed to wake dispatcher for shutdown");
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

/// Accept retry bookkeeping.
///
/// The listener is edge-triggered, so once an accept is skipped or fails the
/// dispatcher has to remember that the backlog may still hold connections.
#[derive(Debug, Default)]
struct AcceptState {
    pending: bool,
    failures: u32,
    retry_at: Option<Instant>,
}

impl AcceptState {
    fn succeeded(&mut self) {
        self.failures = 0;
        self.retry_at = None;
    }

    fn failed(&mut self, now: Instant, exhausted: bool) -> Duration {
        self.failures = self.failures.saturating_add(1);
        self.pending = true;
        let delay = if exhausted {
            backoff_delay(self.failures)
        } else {
            ACCEPT_BACKOFF_MIN
        };
        self.retry_at = Some(now + delay);
        delay
    }

    /// Accepting stopped for backpressure. The backlog is retried on the
    /// next wake-up after a completion, not on a timer.
    fn paused(&mut self) {
        self.pending = true;
        self.retry_at = None;
    }

    fn due(&self, now: Instant) -> bool {
        self.pending && self.retry_at.map_or(true, |at| now >= at)
    }
}

fn backoff_delay(failures: u32) -> Duration {
    let exp = failures.saturating_sub(1).min(16);
    (ACCEPT_BACKOFF_MIN * 2u32.pow(exp)).min(ACCEPT_BACKOFF_MAX)
}

pub struct Dispatcher<L: Accept = TcpListener> {
    listener: Option<L>,
    local_addr: SocketAddr,
    mux: Multiplexer,
    registry: ConnectionRegistry,
    pool: WorkerPool,
    completions: Receiver<Completion>,
    /// Connections ready for a handler while the pool was full, oldest first.
    deferred: VecDeque<usize>,
    accept: AcceptState,
    idle_timeout: Option<Duration>,
    next_sweep: Option<Instant>,
    shutdown_grace: Duration,
    shutdown: ShutdownHandle,
    stats: Arc<ServerStats>,
}

impl Dispatcher<TcpListener> {
    /// Bind the configured endpoint and start the worker pool.
    pub fn bind(config: &Config, responder: Arc<dyn Responder>) -> Result<Self, ServerError> {
        let endpoint = ListenEndpoint::new(config.listen_addr()?, config.backlog);
        let listener = listener::open(&endpoint)?;
        info!(addr = %endpoint.addr, backlog = endpoint.backlog, "Listening");
        Self::with_acceptor(listener, config, responder)
    }
}

impl<L: Accept> Dispatcher<L> {
    /// Build a dispatcher around an already listening source.
    pub fn with_acceptor(
        mut listener: L,
        config: &Config,
        responder: Arc<dyn Responder>,
    ) -> Result<Self, ServerError> {
        let local_addr = listener.local_addr().map_err(MultiplexerError::Io)?;

        let mut mux = Multiplexer::new(config.batch_size)?;
        mux.watch(&mut listener, LISTENER_TOKEN)?;

        let stats = Arc::new(ServerStats::new());
        stats.set_watched(mux.len());

        let ctx = Arc::new(HandlerContext {
            responder,
            write_timeout: config.write_timeout,
            close_after_reply: config.close_after_reply,
        });
        let (done_tx, completions) = channel::unbounded();
        let pool = WorkerPool::spawn(
            config.workers,
            config.queue_depth,
            ctx,
            done_tx,
            mux.waker(),
            Arc::clone(&stats),
        )
        .map_err(ServerError::Spawn)?;

        let shutdown = ShutdownHandle {
            flag: Arc::new(AtomicBool::new(false)),
            waker: mux.waker(),
        };

        Ok(Self {
            listener: Some(listener),
            local_addr,
            mux,
            registry: ConnectionRegistry::new(config.max_connections, config.buffer_size),
            pool,
            completions,
            deferred: VecDeque::new(),
            accept: AcceptState::default(),
            idle_timeout: config.idle_timeout,
            next_sweep: config.idle_timeout.map(|t| Instant::now() + sweep_interval(t)),
            shutdown_grace: config.shutdown_grace,
            shutdown,
            stats,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    #[cfg_attr(not(test), allow(dead_code))]
    pub fn stats(&self) -> Arc<ServerStats> {
        Arc::clone(&self.stats)
    }

    /// Run until shutdown is requested or the multiplexer fails.
    ///
    /// Either way the listener is released and open connections are closed
    /// before this returns.
    pub fn run(mut self) -> Result<(), ServerError> {
        info!(
            workers = self.pool.size(),
            max_connections = self.registry.capacity(),
            "Dispatcher started"
        );

        let result = self.event_loop();
        if let Err(ref e) = result {
            error!(error = %e, "Multiplexer failed, shutting down");
        }
        self.drain();
        result.map_err(ServerError::from)
    }

    fn event_loop(&mut self) -> Result<(), MultiplexerError> {
        loop {
            let timeout = self.next_timeout(Instant::now());
            let events = self.mux.wait(timeout)?;
            self.stats.woke();

            if self.shutdown.is_shutdown() {
                return Ok(());
            }

            let mut ready = Vec::with_capacity(events.len());
            for event in &events {
                match event.token {
                    LISTENER_TOKEN => self.accept.pending = true,
                    WAKE_TOKEN => {}
                    Token(conn_id) if event.readable || event.hangup => ready.push(conn_id),
                    Token(_) => {}
                }
            }

            self.collect_completions();
            self.dispatch_deferred();
            for conn_id in ready {
                self.dispatch(conn_id);
            }

            let now = Instant::now();
            if self.listener.is_some() && self.accept.due(now) {
                self.accept_connections();
            }
            self.sweep_idle(now);

            self.stats.set_watched(self.mux.len());
        }
    }

    /// How long the next wait may block: until an accept retry or idle sweep
    /// is due, or indefinitely.
    fn next_timeout(&self, now: Instant) -> Option<Duration> {
        let retry = self
            .accept
            .retry_at
            .filter(|_| self.accept.pending && self.listener.is_some());

        let deadline = match (retry, self.next_sweep) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        deadline.map(|at| at.saturating_duration_since(now))
    }

    fn collect_completions(&mut self) {
        while let Ok(Completion { mut handle, outcome }) = self.completions.try_recv() {
            match outcome {
                HandlerOutcome::StillOpen => {
                    let token = handle.token();
                    if let Err(e) = self.mux.rewatch(&mut handle.stream, token) {
                        debug!(conn_id = handle.id(), error = %e, "Failed to re-arm connection");
                        self.close_checked_out(handle);
                        continue;
                    }
                    if let Err(handle) = self.registry.checkin(handle) {
                        debug_assert!(false, "completed connection was not in flight");
                        self.close(handle);
                    }
                }
                HandlerOutcome::Closed => self.close_checked_out(handle),
            }
        }
    }

    /// Hand a readable connection to the pool.
    ///
    /// Connections that are in flight or already queued are skipped: their
    /// readiness is picked up again when the handler returns them.
    fn dispatch(&mut self, conn_id: usize) {
        let Some(handle) = self.registry.checkout(conn_id) else {
            return;
        };

        // Keep FIFO order behind anything already waiting.
        if !self.deferred.is_empty() {
            self.park(handle);
            return;
        }

        match self.pool.try_submit(handle) {
            Ok(()) => {}
            Err(SubmitError::Full(handle)) => {
                debug!(queued = self.pool.queued(), "Worker pool saturated, deferring dispatch");
                self.park(handle);
            }
            Err(SubmitError::Closed(handle)) => self.close_checked_out(handle),
        }
    }

    fn park(&mut self, handle: ConnectionHandle) {
        let conn_id = handle.id();
        match self.registry.defer(handle) {
            Ok(()) => {
                self.deferred.push_back(conn_id);
                self.stats.dispatch_deferred();
            }
            Err(handle) => self.close_checked_out(handle),
        }
    }

    fn dispatch_deferred(&mut self) {
        while let Some(&conn_id) = self.deferred.front() {
            let Some(handle) = self.registry.resume(conn_id) else {
                self.deferred.pop_front();
                continue;
            };

            match self.pool.try_submit(handle) {
                Ok(()) => {
                    self.deferred.pop_front();
                }
                Err(SubmitError::Full(handle)) => {
                    if let Err(handle) = self.registry.defer(handle) {
                        self.deferred.pop_front();
                        self.close_checked_out(handle);
                    }
                    break;
                }
                Err(SubmitError::Closed(handle)) => {
                    self.deferred.pop_front();
                    self.close_checked_out(handle);
                }
            }
        }
    }

    /// Accept until the backlog is drained, capacity runs out, or accept fails.
    fn accept_connections(&mut self) {
        loop {
            if self.registry.is_full() || !self.deferred.is_empty() {
                // Leave the rest in the OS backlog; a completion wakes us.
                self.accept.paused();
                return;
            }

            let result = match self.listener.as_ref() {
                Some(l) => listener::accept(l),
                None => return,
            };

            match result {
                Ok(Some((stream, peer))) => {
                    self.accept.succeeded();
                    self.register(stream, peer);
                }
                Ok(None) => {
                    self.accept.succeeded();
                    self.accept.pending = false;
                    return;
                }
                Err(e) => {
                    self.stats.accept_failed();
                    let delay = self
                        .accept
                        .failed(Instant::now(), e.is_resource_exhaustion());
                    warn!(
                        error = %e,
                        failures = self.accept.failures,
                        retry_in = ?delay,
                        "Accept failed"
                    );
                    return;
                }
            }
        }
    }

    /// Watch a new connection before anything else can happen to it.
    fn register(&mut self, stream: TcpStream, peer: SocketAddr) {
        if let Err(e) = stream.set_nodelay(true) {
            debug!(peer = %peer, error = %e, "Failed to set TCP_NODELAY");
        }

        let mut handle = self.registry.new_handle(stream, peer);
        let token = handle.token();
        if let Err(e) = self.mux.watch(&mut handle.stream, token) {
            warn!(peer = %peer, error = %e, "Failed to watch accepted connection");
            return;
        }

        match self.registry.insert(handle) {
            Ok(conn_id) => {
                self.stats.connection_opened();
                debug!(conn_id, peer = %peer, "Accepted connection");
            }
            Err(mut handle) => {
                // Capacity is checked before accepting, so this is unreachable
                // in practice; undo the watch before the drop closes it.
                if let Err(e) = self.mux.unwatch(&mut handle.stream, token) {
                    warn!(peer = %peer, error = %e, "Failed to unwatch rejected connection");
                }
            }
        }
    }

    fn sweep_idle(&mut self, now: Instant) {
        let (Some(timeout), Some(due)) = (self.idle_timeout, self.next_sweep) else {
            return;
        };
        if now < due {
            return;
        }

        for handle in self.registry.evict_idle(now, timeout) {
            debug!(conn_id = handle.id(), "Closing idle connection");
            self.close(handle);
        }
        self.next_sweep = Some(now + sweep_interval(timeout));
    }

    /// Close a connection whose registry entry is still marked in flight.
    fn close_checked_out(&mut self, handle: ConnectionHandle) {
        self.registry.release(handle.id());
        self.close(handle);
    }

    /// Unwatch, then close by dropping. The handle is consumed, so a
    /// descriptor can only be closed once.
    fn close(&mut self, mut handle: ConnectionHandle) {
        let token = handle.token();
        if let Err(e) = self.mux.unwatch(&mut handle.stream, token) {
            warn!(conn_id = handle.id(), error = %e, "Failed to unwatch connection");
        }
        self.stats.connection_closed();
        debug!(conn_id = handle.id(), peer = %handle.peer(), "Connection closed");
    }

    /// Orderly shutdown: stop accepting, close parked connections, give
    /// in-flight handlers the grace period, then stop the pool.
    fn drain(mut self) {
        info!(
            open = self.registry.len(),
            in_flight = self.registry.in_flight(),
            "Shutting down"
        );

        if let Some(mut l) = self.listener.take() {
            if let Err(e) = self.mux.unwatch(&mut l, LISTENER_TOKEN) {
                warn!(error = %e, "Failed to unwatch listener");
            }
        }

        self.deferred.clear();
        for handle in self.registry.drain_parked() {
            self.close(handle);
        }

        let deadline = Instant::now() + self.shutdown_grace;
        while !self.registry.is_empty() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.completions.recv_timeout(remaining) {
                Ok(Completion { handle, .. }) => self.close_checked_out(handle),
                Err(RecvTimeoutError::Timeout) => {
                    warn!(
                        in_flight = self.registry.len(),
                        "Shutdown grace period expired with handlers still running"
                    );
                    break;
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        self.stats.set_watched(self.mux.len());
        let stats = self.stats.snapshot();
        self.pool.shutdown(deadline);

        info!(
            accepted = stats.accepted,
            closed = stats.closed,
            accept_errors = stats.accept_errors,
            deferred = stats.deferred,
            wakeups = stats.wakeups,
            peak_in_flight = stats.peak_in_flight,
            still_in_flight = stats.in_flight,
            still_open = stats.open_connections,
            still_watched = stats.watched,
            "Dispatcher stopped"
        );
    }
}

fn sweep_interval(idle_timeout: Duration) -> Duration {
    (idle_timeout / 2).clamp(Duration::from_millis(10), Duration::from_secs(1))
}

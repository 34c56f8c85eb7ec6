//! Fixed-size pool of handler threads fed by a bounded queue.
//!
//! The pool is the concurrency bound: at most `size` handlers run at once and
//! at most `queue_depth` more wait for a thread. When both are taken
//! `try_submit` hands the connection back so the dispatcher can defer it.

use crate::runtime::connection::ConnectionHandle;
use crate::runtime::handler::{self, HandlerContext, HandlerOutcome};
use crate::runtime::stats::ServerStats;
use crossbeam::channel::{self, Receiver, Sender, TrySendError};
use mio::Waker;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

/// A finished handler invocation, sent back to the dispatcher.
#[derive(Debug)]
pub struct Completion {
    pub handle: ConnectionHandle,
    pub outcome: HandlerOutcome,
}

/// Why a connection could not be submitted. The handle comes back either way.
#[derive(Debug)]
pub enum SubmitError {
    /// Every worker is busy and the queue is full.
    Full(ConnectionHandle),
    /// The pool is shutting down.
    Closed(ConnectionHandle),
}

pub struct WorkerPool {
    jobs: Option<Sender<ConnectionHandle>>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Start `size` named worker threads.
    pub fn spawn(
        size: usize,
        queue_depth: usize,
        ctx: Arc<HandlerContext>,
        completions: Sender<Completion>,
        waker: Arc<Waker>,
        stats: Arc<ServerStats>,
    ) -> io::Result<Self> {
        let size = size.max(1);
        let (jobs, queue) = channel::bounded(queue_depth);
        let mut workers = Vec::with_capacity(size);

        for worker_id in 0..size {
            let queue = queue.clone();
            let ctx = Arc::clone(&ctx);
            let completions = completions.clone();
            let waker = Arc::clone(&waker);
            let stats = Arc::clone(&stats);

            let worker = thread::Builder::new()
                .name(format!("worker-{worker_id}"))
                .spawn(move || worker_loop(worker_id, queue, &ctx, completions, &waker, &stats))?;
            workers.push(worker);
        }

        Ok(Self {
            jobs: Some(jobs),
            workers,
        })
    }

    /// Queue a connection for a handler without blocking.
    pub fn try_submit(&self, handle: ConnectionHandle) -> Result<(), SubmitError> {
        let Some(jobs) = &self.jobs else {
            return Err(SubmitError::Closed(handle));
        };
        match jobs.try_send(handle) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(handle)) => Err(SubmitError::Full(handle)),
            Err(TrySendError::Disconnected(handle)) => Err(SubmitError::Closed(handle)),
        }
    }

    /// Number of worker threads.
    pub fn size(&self) -> usize {
        self.workers.len()
    }

    /// Jobs waiting for a free worker.
    pub fn queued(&self) -> usize {
        self.jobs.as_ref().map_or(0, Sender::len)
    }

    /// Stop taking work and wait up to `deadline` for the workers to exit.
    ///
    /// Workers still busy at the deadline are detached. Returns true when all
    /// of them were joined.
    pub fn shutdown(mut self, deadline: Instant) -> bool {
        self.jobs.take();

        while Instant::now() < deadline && !self.workers.iter().all(JoinHandle::is_finished) {
            thread::sleep(Duration::from_millis(5));
        }

        let mut detached = 0;
        for worker in self.workers.drain(..) {
            if worker.is_finished() {
                let _ = worker.join();
            } else {
                detached += 1;
            }
        }

        if detached > 0 {
            warn!(detached, "Workers still busy after shutdown grace period");
        }
        detached == 0
    }
}

fn worker_loop(
    worker_id: usize,
    queue: Receiver<ConnectionHandle>,
    ctx: &HandlerContext,
    completions: Sender<Completion>,
    waker: &mio::Waker,
    stats: &ServerStats,
) {
    debug!(worker = worker_id, "Worker started");

    for mut handle in queue.iter() {
        stats.handler_started();
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| handler::handle(&mut handle, ctx)))
            .unwrap_or_else(|_| {
                error!(worker = worker_id, conn_id = handle.id(), "Handler panicked");
                HandlerOutcome::Closed
            });
        stats.handler_finished();

        if completions.send(Completion { handle, outcome }).is_err() {
            // Dispatcher is gone; dropping the handle closes the socket.
            break;
        }
        if let Err(e) = waker.wake() {
            warn!(worker = worker_id, error = %e, "Failed to wake dispatcher");
        }
    }

    debug!(worker = worker_id, "Worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::multiplexer::Multiplexer;
    use crate::runtime::protocol::Responder;
    use bytes::Bytes;
    use mio::net::TcpStream;
    use std::io::{Read, Write};
    use std::net::TcpListener;

    fn handle(id: usize) -> (ConnectionHandle, std::net::TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = std::net::TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, peer) = listener.accept().unwrap();
        server.set_nonblocking(true).unwrap();
        (ConnectionHandle::new(id, TcpStream::from_std(server), peer, 64), client)
    }

    fn context(responder: impl Responder) -> Arc<HandlerContext> {
        Arc::new(HandlerContext {
            responder: Arc::new(responder),
            write_timeout: Duration::from_secs(1),
            close_after_reply: false,
        })
    }

    #[test]
    fn test_full_queue_hands_back_connection() {
        let mux = Multiplexer::new(4).unwrap();
        let (done_tx, _done_rx) = channel::unbounded();
        let (gate_tx, gate_rx) = channel::bounded::<()>(0);
        let stats = Arc::new(ServerStats::new());

        // One worker, no queue: the worker blocks in the responder on the gate.
        let responder = move |_req: &[u8]| {
            let _ = gate_rx.recv();
            Bytes::from_static(b"ok")
        };
        let pool =
            WorkerPool::spawn(1, 0, context(responder), done_tx, mux.waker(), stats).unwrap();

        let (first, mut c1) = handle(0);
        c1.write_all(b"a").unwrap();
        thread::sleep(Duration::from_millis(20));

        // Rendezvous: wait until the idle worker takes the first job.
        let mut first = Some(first);
        let deadline = Instant::now() + Duration::from_secs(2);
        while let Some(h) = first.take() {
            match pool.try_submit(h) {
                Ok(()) => {}
                Err(SubmitError::Full(h)) => {
                    assert!(Instant::now() < deadline);
                    thread::sleep(Duration::from_millis(1));
                    first = Some(h);
                }
                Err(SubmitError::Closed(_)) => panic!("pool closed"),
            }
        }

        // Give the worker time to reach the gate, then the pool is saturated.
        thread::sleep(Duration::from_millis(50));
        let (second, _c2) = handle(1);
        match pool.try_submit(second) {
            Err(SubmitError::Full(h)) => assert_eq!(h.id(), 1),
            other => panic!("expected Full, got {other:?}"),
        }

        gate_tx.send(()).unwrap();
        let mut reply = [0u8; 2];
        c1.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        c1.read_exact(&mut reply).unwrap();
        assert_eq!(&reply, b"ok");

        assert!(pool.shutdown(Instant::now() + Duration::from_secs(2)));
    }

    #[test]
    fn test_completion_reports_outcome() {
        let mux = Multiplexer::new(4).unwrap();
        let (done_tx, done_rx) = channel::unbounded();
        let stats = Arc::new(ServerStats::new());
        let pool = WorkerPool::spawn(
            2,
            4,
            context(|_req: &[u8]| Bytes::new()),
            done_tx,
            mux.waker(),
            Arc::clone(&stats),
        )
        .unwrap();
        assert_eq!(pool.size(), 2);

        let (conn, client) = handle(7);
        drop(client);
        thread::sleep(Duration::from_millis(20));
        pool.try_submit(conn).unwrap();

        let done = done_rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(done.handle.id(), 7);
        assert_eq!(done.outcome, HandlerOutcome::Closed);
        assert_eq!(stats.snapshot().peak_in_flight, 1);

        assert!(pool.shutdown(Instant::now() + Duration::from_secs(2)));
    }

    #[test]
    fn test_panicking_responder_closes_connection() {
        let mux = Multiplexer::new(4).unwrap();
        let (done_tx, done_rx) = channel::unbounded();
        let stats = Arc::new(ServerStats::new());
        let pool = WorkerPool::spawn(
            1,
            4,
            context(|_req: &[u8]| -> Bytes { panic!("boom") }),
            done_tx,
            mux.waker(),
            Arc::clone(&stats),
        )
        .unwrap();

        let (conn, mut client) = handle(3);
        client.write_all(b"x").unwrap();
        thread::sleep(Duration::from_millis(20));
        pool.try_submit(conn).unwrap();

        let done = done_rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(done.outcome, HandlerOutcome::Closed);
        assert_eq!(stats.snapshot().in_flight, 0);

        assert!(pool.shutdown(Instant::now() + Duration::from_secs(2)));
    }
}

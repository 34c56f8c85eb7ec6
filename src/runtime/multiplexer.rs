//! Readiness multiplexer built on mio (epoll on Linux, kqueue on macOS).
//!
//! Keeps its own watch set next to the OS registration so that watching a
//! token twice, or unwatching one that was never watched, is reported instead
//! of silently corrupting the interest list.

use crate::error::MultiplexerError;
use mio::event::Source;
use mio::{Events, Interest, Poll, Token, Waker};
use std::collections::HashSet;
use std::io;
use std::sync::Arc;
use std::time::Duration;

/// Token used by the cross-thread waker.
pub const WAKE_TOKEN: Token = Token(usize::MAX - 1);

/// One readiness notification from a single `wait`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadyEvent {
    pub token: Token,
    pub readable: bool,
    /// Peer hung up or the socket reported an error.
    pub hangup: bool,
}

pub struct Multiplexer {
    poll: Poll,
    events: Events,
    watched: HashSet<Token>,
    waker: Arc<Waker>,
}

impl Multiplexer {
    /// Create a multiplexer returning at most `capacity` events per wait.
    pub fn new(capacity: usize) -> Result<Self, MultiplexerError> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKE_TOKEN)?);
        Ok(Self {
            poll,
            events: Events::with_capacity(capacity.max(1)),
            watched: HashSet::new(),
            waker,
        })
    }

    /// Waker that interrupts a blocked `wait` from any thread.
    pub fn waker(&self) -> Arc<Waker> {
        Arc::clone(&self.waker)
    }

    /// Start watching `source` for readability.
    pub fn watch<S>(&mut self, source: &mut S, token: Token) -> Result<(), MultiplexerError>
    where
        S: Source + ?Sized,
    {
        if self.watched.contains(&token) {
            return Err(MultiplexerError::AlreadyWatched(token.0));
        }
        self.poll
            .registry()
            .register(source, token, Interest::READABLE)?;
        self.watched.insert(token);
        Ok(())
    }

    /// Re-arm a watched source so readiness that arrived while it was being
    /// serviced is reported again.
    pub fn rewatch<S>(&mut self, source: &mut S, token: Token) -> Result<(), MultiplexerError>
    where
        S: Source + ?Sized,
    {
        if !self.watched.contains(&token) {
            return Err(MultiplexerError::NotWatched(token.0));
        }
        self.poll
            .registry()
            .reregister(source, token, Interest::READABLE)?;
        Ok(())
    }

    /// Stop watching `source`. Must happen before the descriptor is closed.
    pub fn unwatch<S>(&mut self, source: &mut S, token: Token) -> Result<(), MultiplexerError>
    where
        S: Source + ?Sized,
    {
        if !self.watched.remove(&token) {
            return Err(MultiplexerError::NotWatched(token.0));
        }
        self.poll.registry().deregister(source)?;
        Ok(())
    }

    #[cfg_attr(not(test), allow(dead_code))]
    pub fn is_watched(&self, token: Token) -> bool {
        self.watched.contains(&token)
    }

    /// Number of watched descriptors (the waker is not counted).
    pub fn len(&self) -> usize {
        self.watched.len()
    }

    /// Block until something is ready or `timeout` expires.
    ///
    /// A signal interrupting the wait yields an empty batch.
    pub fn wait(&mut self, timeout: Option<Duration>) -> Result<Vec<ReadyEvent>, MultiplexerError> {
        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => return Ok(Vec::new()),
            Err(e) => return Err(MultiplexerError::Io(e)),
        }

        Ok(self
            .events
            .iter()
            .map(|event| ReadyEvent {
                token: event.token(),
                readable: event.is_readable(),
                hangup: event.is_read_closed() || event.is_error(),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mio::net::TcpListener;
    use std::io::Write;

    fn listener() -> TcpListener {
        TcpListener::bind("127.0.0.1:0".parse().unwrap()).unwrap()
    }

    #[test]
    fn test_double_watch_rejected() {
        let mut mux = Multiplexer::new(8).unwrap();
        let mut l = listener();

        mux.watch(&mut l, Token(1)).unwrap();
        assert!(matches!(
            mux.watch(&mut l, Token(1)),
            Err(MultiplexerError::AlreadyWatched(1))
        ));
        assert_eq!(mux.len(), 1);
    }

    #[test]
    fn test_unwatch_unknown_rejected() {
        let mut mux = Multiplexer::new(8).unwrap();
        let mut l = listener();

        assert!(matches!(
            mux.unwatch(&mut l, Token(3)),
            Err(MultiplexerError::NotWatched(3))
        ));
        assert!(matches!(
            mux.rewatch(&mut l, Token(3)),
            Err(MultiplexerError::NotWatched(3))
        ));

        mux.watch(&mut l, Token(3)).unwrap();
        mux.unwatch(&mut l, Token(3)).unwrap();
        assert!(!mux.is_watched(Token(3)));
        assert_eq!(mux.len(), 0);
    }

    #[test]
    fn test_wait_reports_readable_listener() {
        let mut mux = Multiplexer::new(8).unwrap();
        let mut l = listener();
        let addr = l.local_addr().unwrap();
        mux.watch(&mut l, Token(0)).unwrap();

        let mut client = std::net::TcpStream::connect(addr).unwrap();
        client.write_all(b"x").unwrap();

        let events = mux.wait(Some(Duration::from_secs(2))).unwrap();
        assert!(events
            .iter()
            .any(|ev| ev.token == Token(0) && ev.readable));
    }

    #[test]
    fn test_wait_times_out_empty() {
        let mut mux = Multiplexer::new(8).unwrap();
        let events = mux.wait(Some(Duration::from_millis(10))).unwrap();
        assert!(events.is_empty());
    }

    #[test]
    fn test_waker_interrupts_wait() {
        let mut mux = Multiplexer::new(8).unwrap();
        let waker = mux.waker();

        let handle = std::thread::spawn(move || waker.wake().unwrap());
        let events = mux.wait(Some(Duration::from_secs(5))).unwrap();
        handle.join().unwrap();

        assert!(events.iter().any(|ev| ev.token == WAKE_TOKEN));
    }
}

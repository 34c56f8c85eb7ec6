//! Per-connection request/response step.
//!
//! A handler runs on a worker thread with exclusive ownership of the
//! connection. It performs one read, and for a non-empty read writes the full
//! response back. End-of-stream or any I/O error ends the connection: the
//! handler never reads from or writes to a socket that has reported either.

use crate::error::ConnectionError;
use crate::runtime::connection::ConnectionHandle;
use crate::runtime::protocol::Responder;
use std::io::{self, Read, Write};
use std::os::unix::io::AsRawFd;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// What the dispatcher should do with a connection after a handler ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerOutcome {
    /// Stop watching and close the connection.
    Closed,
    /// Keep the connection registered for its next request.
    StillOpen,
}

/// Settings every handler invocation shares.
pub struct HandlerContext {
    pub responder: Arc<dyn Responder>,
    pub write_timeout: Duration,
    pub close_after_reply: bool,
}

/// Service one readiness event on `conn`.
pub fn handle(conn: &mut ConnectionHandle, ctx: &HandlerContext) -> HandlerOutcome {
    match serve(conn, ctx) {
        Ok(outcome) => outcome,
        Err(e) => {
            debug!(conn_id = conn.id(), peer = %conn.peer(), error = %e, "Connection error");
            HandlerOutcome::Closed
        }
    }
}

fn serve(conn: &mut ConnectionHandle, ctx: &HandlerContext) -> Result<HandlerOutcome, ConnectionError> {
    let n = match read_request(conn)? {
        Some(0) => {
            trace!(conn_id = conn.id(), "Connection closed by peer");
            return Ok(HandlerOutcome::Closed);
        }
        Some(n) => n,
        // Spurious wakeup: nothing to read yet.
        None => return Ok(HandlerOutcome::StillOpen),
    };

    let response = ctx.responder.respond(&conn.buffer[..n]);
    write_response(conn, &response, ctx.write_timeout)?;

    if ctx.close_after_reply {
        Ok(HandlerOutcome::Closed)
    } else {
        Ok(HandlerOutcome::StillOpen)
    }
}

/// Read whatever is available into the connection buffer.
///
/// `Ok(None)` means the socket would block.
fn read_request(conn: &mut ConnectionHandle) -> Result<Option<usize>, ConnectionError> {
    let capacity = conn.buffer.capacity().max(1);
    conn.buffer.clear();
    conn.buffer.resize(capacity, 0);

    loop {
        match conn.stream.read(&mut conn.buffer[..]) {
            Ok(n) => {
                conn.buffer.truncate(n);
                return Ok(Some(n));
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                conn.buffer.clear();
                return Ok(None);
            }
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                conn.buffer.clear();
                return Err(ConnectionError::Read(e));
            }
        }
    }
}

/// Write all of `data`, waiting for writability on partial writes.
fn write_response(
    conn: &mut ConnectionHandle,
    mut data: &[u8],
    timeout: Duration,
) -> Result<(), ConnectionError> {
    let deadline = Instant::now() + timeout;

    while !data.is_empty() {
        match conn.stream.write(data) {
            Ok(0) => {
                return Err(ConnectionError::Write(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "write returned 0",
                )));
            }
            Ok(n) => data = &data[n..],
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                wait_writable(conn, deadline, timeout)?;
            }
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(ConnectionError::Write(e)),
        }
    }

    Ok(())
}

/// Block this worker until the socket accepts more bytes or `deadline` passes.
///
/// The stream stays non-blocking and registered with the dispatcher's
/// multiplexer, so this polls the single descriptor directly.
fn wait_writable(
    conn: &ConnectionHandle,
    deadline: Instant,
    timeout: Duration,
) -> Result<(), ConnectionError> {
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(ConnectionError::WriteTimeout(timeout));
        }

        let mut pfd = libc::pollfd {
            fd: conn.stream.as_raw_fd(),
            events: libc::POLLOUT,
            revents: 0,
        };
        let millis = remaining.as_millis().clamp(1, libc::c_int::MAX as u128) as libc::c_int;

        // SAFETY: `pfd` is a valid pollfd for the duration of the call and the
        // descriptor is owned by `conn`, which outlives it.
        let rc = unsafe { libc::poll(&mut pfd, 1, millis) };
        match rc {
            0 => continue,
            n if n > 0 => {
                if pfd.revents & (libc::POLLERR | libc::POLLHUP | libc::POLLNVAL) != 0 {
                    return Err(ConnectionError::Write(io::Error::new(
                        io::ErrorKind::BrokenPipe,
                        "socket closed while writing",
                    )));
                }
                return Ok(());
            }
            _ => {
                let err = io::Error::last_os_error();
                if err.kind() != io::ErrorKind::Interrupted {
                    return Err(ConnectionError::Write(err));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::protocol::{Echo, FixedReply};
    use bytes::Bytes;
    use mio::net::TcpStream;
    use std::net::{SocketAddr, TcpListener};
    use std::thread;

    fn ctx(responder: Arc<dyn Responder>) -> HandlerContext {
        HandlerContext {
            responder,
            write_timeout: Duration::from_secs(2),
            close_after_reply: false,
        }
    }

    /// A handle over the server half of a loopback connection, plus the client.
    fn connection(buffer_size: usize) -> (ConnectionHandle, std::net::TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = std::net::TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        client
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        let (server, peer): (_, SocketAddr) = listener.accept().unwrap();
        server.set_nonblocking(true).unwrap();
        (
            ConnectionHandle::new(0, TcpStream::from_std(server), peer, buffer_size),
            client,
        )
    }

    /// Run the handler until it sees the bytes the client just sent.
    fn handle_when_ready(conn: &mut ConnectionHandle, ctx: &HandlerContext) -> HandlerOutcome {
        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            let outcome = handle(conn, ctx);
            if outcome == HandlerOutcome::Closed || !conn.buffer.is_empty() {
                return outcome;
            }
            assert!(Instant::now() < deadline, "request never arrived");
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_round_trip_keeps_connection_open() {
        let (mut conn, mut client) = connection(1024);
        let ctx = ctx(Arc::new(FixedReply::new(&b"+PONG\r\n"[..])));

        client.write_all(b"PING").unwrap();
        assert_eq!(handle_when_ready(&mut conn, &ctx), HandlerOutcome::StillOpen);

        let mut reply = [0u8; 7];
        client.read_exact(&mut reply).unwrap();
        assert_eq!(&reply, b"+PONG\r\n");
    }

    #[test]
    fn test_spurious_wakeup_writes_nothing() {
        let (mut conn, mut client) = connection(1024);
        let ctx = ctx(Arc::new(FixedReply::new(&b"+PONG\r\n"[..])));

        assert_eq!(handle(&mut conn, &ctx), HandlerOutcome::StillOpen);

        client
            .set_read_timeout(Some(Duration::from_millis(50)))
            .unwrap();
        let mut buf = [0u8; 8];
        let err = client.read(&mut buf).unwrap_err();
        assert!(matches!(
            err.kind(),
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
        ));
    }

    #[test]
    fn test_peer_close_is_closed() {
        let (mut conn, client) = connection(1024);
        let ctx = ctx(Arc::new(Echo));
        drop(client);

        assert_eq!(handle_when_ready(&mut conn, &ctx), HandlerOutcome::Closed);
    }

    #[test]
    fn test_close_after_reply() {
        let (mut conn, mut client) = connection(1024);
        let mut ctx = ctx(Arc::new(Echo));
        ctx.close_after_reply = true;

        client.write_all(b"once").unwrap();
        assert_eq!(handle_when_ready(&mut conn, &ctx), HandlerOutcome::Closed);

        let mut reply = [0u8; 4];
        client.read_exact(&mut reply).unwrap();
        assert_eq!(&reply, b"once");
    }

    #[test]
    fn test_large_response_written_fully() {
        let (mut conn, mut client) = connection(64);
        let payload = Bytes::from(vec![b'x'; 4 * 1024 * 1024]);
        let expected = payload.len();
        let ctx = ctx(Arc::new(FixedReply::new(payload)));

        client.write_all(b"go").unwrap();

        // The reply exceeds the socket buffers, so the client must drain
        // concurrently while the handler waits for writability.
        let reader = thread::spawn(move || {
            let mut total = 0;
            let mut buf = [0u8; 64 * 1024];
            while total < expected {
                let n = client.read(&mut buf).unwrap();
                assert!(n > 0);
                total += n;
            }
            total
        });

        assert_eq!(handle_when_ready(&mut conn, &ctx), HandlerOutcome::StillOpen);
        assert_eq!(reader.join().unwrap(), expected);
    }
}

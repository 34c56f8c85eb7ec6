//! Listening socket setup and non-blocking accept.

use crate::error::{AcceptError, BindError};
use mio::event::Source;
use mio::net::{TcpListener, TcpStream};
use std::io;
use std::net::SocketAddr;

/// Where and how to listen. Fixed for the lifetime of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenEndpoint {
    pub addr: SocketAddr,
    pub backlog: i32,
}

impl ListenEndpoint {
    pub fn new(addr: SocketAddr, backlog: i32) -> Self {
        Self { addr, backlog }
    }
}

/// A listening source the dispatcher can accept from.
///
/// Implemented by `mio::net::TcpListener`; tests wrap it to inject failures.
pub trait Accept: Source {
    /// Accept one pending connection.
    fn accept(&self) -> io::Result<(TcpStream, SocketAddr)>;

    fn local_addr(&self) -> io::Result<SocketAddr>;
}

impl Accept for TcpListener {
    fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
        TcpListener::accept(self)
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        TcpListener::local_addr(self)
    }
}

/// Create a non-blocking listener with address and port reuse enabled.
///
/// Any failure is a `BindError`; the caller treats it as fatal.
pub fn open(endpoint: &ListenEndpoint) -> Result<TcpListener, BindError> {
    let addr = endpoint.addr;
    let bind_err = |source| BindError { addr, source };

    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )
    .map_err(bind_err)?;

    socket.set_reuse_address(true).map_err(bind_err)?;
    socket.set_reuse_port(true).map_err(bind_err)?;
    socket.set_nonblocking(true).map_err(bind_err)?;
    socket.bind(&addr.into()).map_err(bind_err)?;
    socket.listen(endpoint.backlog).map_err(bind_err)?;

    Ok(TcpListener::from_std(socket.into()))
}

/// Accept one connection if one is pending.
///
/// `Ok(None)` means the backlog is drained. Interrupted calls are retried.
pub fn accept<L: Accept + ?Sized>(
    listener: &L,
) -> Result<Option<(TcpStream, SocketAddr)>, AcceptError> {
    loop {
        match listener.accept() {
            Ok(conn) => return Ok(Some(conn)),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(AcceptError(e)),
        }
    }
}

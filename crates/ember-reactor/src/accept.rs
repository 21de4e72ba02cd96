use std::io;

use mio::event::Source;

use crate::{Protocol, Transport};

/// Builds the transport + protocol pair for each accepted connection.
///
/// One acceptor per listening socket; the factory closure captures the
/// listener's settings (protocol stack, TLS wrapper, limits).
pub trait Acceptor: Send {
    fn source(&mut self) -> &mut dyn Source;

    /// Accepts one pending connection. `Ok(None)` means the backlog is empty.
    fn accept(&mut self) -> io::Result<Option<(Box<dyn Transport>, Box<dyn Protocol>)>>;
}

type TcpFactory =
    Box<dyn Fn(mio::net::TcpStream, std::net::SocketAddr) -> (Box<dyn Transport>, Box<dyn Protocol>) + Send>;

pub struct TcpAcceptor {
    listener: mio::net::TcpListener,
    factory: TcpFactory,
}

impl TcpAcceptor {
    pub fn new(listener: mio::net::TcpListener, factory: TcpFactory) -> Self {
        Self { listener, factory }
    }
}

impl Acceptor for TcpAcceptor {
    fn source(&mut self) -> &mut dyn Source {
        &mut self.listener
    }

    fn accept(&mut self) -> io::Result<Option<(Box<dyn Transport>, Box<dyn Protocol>)>> {
        match self.listener.accept() {
            Ok((stream, addr)) => Ok(Some((self.factory)(stream, addr))),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }
}

type UnixFactory =
    Box<dyn Fn(mio::net::UnixStream) -> (Box<dyn Transport>, Box<dyn Protocol>) + Send>;

pub struct UnixAcceptor {
    listener: mio::net::UnixListener,
    factory: UnixFactory,
}

impl UnixAcceptor {
    pub fn new(listener: mio::net::UnixListener, factory: UnixFactory) -> Self {
        Self { listener, factory }
    }
}

impl Acceptor for UnixAcceptor {
    fn source(&mut self) -> &mut dyn Source {
        &mut self.listener
    }

    fn accept(&mut self) -> io::Result<Option<(Box<dyn Transport>, Box<dyn Protocol>)>> {
        match self.listener.accept() {
            Ok((stream, _addr)) => Ok(Some((self.factory)(stream))),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }
}

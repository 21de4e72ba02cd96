use std::{
    io::{self, Read, Write},
    net::SocketAddr,
    os::fd::{AsRawFd, RawFd},
};

use mio::event::Source;

/// Byte-level seam between the socket layer and the wire.
///
/// The reactor only talks to this trait, so a TLS adapter can be swapped in
/// per listener without the protocol layer ever seeing the difference.
/// Handshake progress is driven by socket readiness: the reactor calls
/// [`Transport::handshake`] on every readable/writable event until it
/// returns `Ok(true)`.
pub trait Transport: Send {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;
    fn write(&mut self, buf: &[u8]) -> io::Result<usize>;

    /// Returns `Ok(true)` once application data may flow. Plaintext
    /// transports are born ready.
    fn handshake(&mut self) -> io::Result<bool> {
        Ok(true)
    }

    /// True when the kernel may copy file bytes directly to this socket.
    /// Encrypting transports must return false and take the buffered path.
    fn can_sendfile(&self) -> bool {
        false
    }

    fn peer_addr(&self) -> Option<SocketAddr>;
    fn shutdown(&mut self);
    fn source(&mut self) -> &mut dyn Source;
    fn raw_fd(&self) -> RawFd;
}

/// Plaintext TCP transport.
pub struct PlainTcp {
    stream: mio::net::TcpStream,
    peer_addr: Option<SocketAddr>,
}

impl PlainTcp {
    pub fn new(stream: mio::net::TcpStream) -> Self {
        let peer_addr = stream.peer_addr().ok();
        let _ = stream.set_nodelay(true);
        Self { stream, peer_addr }
    }
}

impl Transport for PlainTcp {
    #[inline]
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.read(buf)
    }

    #[inline]
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stream.write(buf)
    }

    fn can_sendfile(&self) -> bool {
        cfg!(target_os = "linux")
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    fn shutdown(&mut self) {
        let _ = self.stream.shutdown(std::net::Shutdown::Both);
    }

    fn source(&mut self) -> &mut dyn Source {
        &mut self.stream
    }

    fn raw_fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }
}

/// Plaintext Unix-domain transport, used for the cluster IPC channel and
/// `unix://` listeners.
pub struct PlainUnix {
    stream: mio::net::UnixStream,
}

impl PlainUnix {
    pub fn new(stream: mio::net::UnixStream) -> Self {
        Self { stream }
    }
}

impl Transport for PlainUnix {
    #[inline]
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.read(buf)
    }

    #[inline]
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stream.write(buf)
    }

    fn can_sendfile(&self) -> bool {
        cfg!(target_os = "linux")
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        None
    }

    fn shutdown(&mut self) {
        let _ = self.stream.shutdown(std::net::Shutdown::Both);
    }

    fn source(&mut self) -> &mut dyn Source {
        &mut self.stream
    }

    fn raw_fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }
}

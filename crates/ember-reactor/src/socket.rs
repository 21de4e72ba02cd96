use std::{
    collections::VecDeque,
    io::{self, Read, Seek, SeekFrom},
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use mio::{Interest, Registry, Token};
use tracing::debug;

use crate::{Packet, Transport};

/// Outcome of a socket flush or read pass.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum SocketState {
    Alive,
    Closed,
}

/// What a flush pass left behind.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum FlushOutcome {
    /// Queue empty, WRITABLE interest dropped.
    Drained,
    /// Still backlogged, waiting for the next writable event.
    Pending,
    Closed,
}

const SENDFILE_MAX_CHUNK: usize = 1 << 20;
const FILE_FALLBACK_CHUNK: usize = 64 * 1024;

/// One non-blocking socket with its outbound packet chain.
///
/// Writes pop the FIFO head and push bytes until the kernel blocks; offsets
/// advance in place and a packet is freed only once fully sent. WRITABLE
/// interest is registered exactly while the chain is non-empty.
pub(crate) struct Socket {
    transport: Box<dyn Transport>,
    outbox: VecDeque<Packet>,
    /// Shared backlog gauge, also read by handler threads via `pending`.
    backlog: Arc<AtomicUsize>,
    writable_armed: bool,
    handshaken: bool,
    /// Scratch for the buffered file path on transports without sendfile.
    file_chunk: Vec<u8>,
}

impl Socket {
    pub(crate) fn new(transport: Box<dyn Transport>) -> Self {
        Self {
            transport,
            outbox: VecDeque::new(),
            backlog: Arc::new(AtomicUsize::new(0)),
            writable_armed: false,
            handshaken: false,
            file_chunk: Vec::new(),
        }
    }

    #[inline]
    pub(crate) fn transport(&self) -> &dyn Transport {
        &*self.transport
    }

    #[inline]
    pub(crate) fn source(&mut self) -> &mut dyn mio::event::Source {
        self.transport.source()
    }

    #[inline]
    pub(crate) fn backlog_bytes(&self) -> usize {
        self.backlog.load(Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn backlog_gauge(&self) -> Arc<AtomicUsize> {
        self.backlog.clone()
    }

    #[inline]
    pub(crate) fn has_backlog(&self) -> bool {
        !self.outbox.is_empty()
    }

    /// Drives the transport handshake. Returns `Ok(true)` once complete.
    pub(crate) fn handshake(&mut self) -> io::Result<bool> {
        if self.handshaken {
            return Ok(true);
        }
        self.handshaken = self.transport.handshake()?;
        Ok(self.handshaken)
    }

    /// Reads until `WouldBlock`, appending to `inbox` in `chunk`-sized steps.
    /// Returns the number of fresh bytes and whether the peer is gone.
    pub(crate) fn read_into(
        &mut self,
        inbox: &mut Vec<u8>,
        chunk: usize,
    ) -> (usize, SocketState) {
        let mut fresh = 0;
        loop {
            let start = inbox.len();
            inbox.resize(start + chunk, 0);
            match self.transport.read(&mut inbox[start..]) {
                Ok(0) => {
                    inbox.truncate(start);
                    return (fresh, SocketState::Closed);
                }
                Ok(n) => {
                    inbox.truncate(start + n);
                    fresh += n;
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    inbox.truncate(start);
                    return (fresh, SocketState::Alive);
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {
                    inbox.truncate(start);
                }
                Err(err) => {
                    inbox.truncate(start);
                    debug!(?err, "socket: read");
                    return (fresh, SocketState::Closed);
                }
            }
        }
    }

    /// Enqueues a packet and attempts an immediate flush when the chain was
    /// empty.
    pub(crate) fn enqueue(
        &mut self,
        registry: &Registry,
        token: Token,
        packet: Packet,
    ) -> SocketState {
        if packet.is_done() {
            return SocketState::Alive;
        }
        self.backlog.fetch_add(packet.remaining() as usize, Ordering::Relaxed);
        self.outbox.push_back(packet);
        if self.outbox.len() == 1 {
            // Head of line: try the kernel right away, arm WRITABLE if it
            // pushes back.
            if self.flush(registry, token) == FlushOutcome::Closed {
                return SocketState::Closed;
            }
            SocketState::Alive
        } else {
            self.arm_writable(registry, token)
        }
    }

    /// Pop-write loop until `WouldBlock` or the chain empties.
    pub(crate) fn flush(&mut self, registry: &Registry, token: Token) -> FlushOutcome {
        while let Some(front) = self.outbox.front_mut() {
            let wrote = match front {
                Packet::Buf { data, offset } => write_buf(&mut *self.transport, data, offset),
                Packet::File { file, offset, remaining } => write_file(
                    &mut *self.transport,
                    &mut self.file_chunk,
                    file,
                    offset,
                    remaining,
                ),
            };
            match wrote {
                Ok(0) => return FlushOutcome::Closed,
                Ok(n) => {
                    self.backlog.fetch_sub(n, Ordering::Relaxed);
                    if self.outbox.front().is_some_and(Packet::is_done) {
                        self.outbox.pop_front();
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if self.arm_writable(registry, token) == SocketState::Closed {
                        return FlushOutcome::Closed;
                    }
                    return FlushOutcome::Pending;
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => {
                    debug!(?err, "socket: write");
                    return FlushOutcome::Closed;
                }
            }
        }

        // Drop WRITABLE interest only when fully drained.
        if self.writable_armed {
            if let Err(err) =
                registry.reregister(self.transport.source(), token, Interest::READABLE)
            {
                debug!(?err, "socket: reregister drop writable");
                return FlushOutcome::Closed;
            }
            self.writable_armed = false;
        }
        FlushOutcome::Drained
    }

    /// Arm WRITABLE notifications when transitioning from empty to non-empty
    /// chain; the poll loop flushes on the next writable event.
    fn arm_writable(&mut self, registry: &Registry, token: Token) -> SocketState {
        if !self.writable_armed {
            if let Err(err) = registry.reregister(
                self.transport.source(),
                token,
                Interest::READABLE | Interest::WRITABLE,
            ) {
                debug!(?err, "socket: reregister arm writable");
                return SocketState::Closed;
            }
            self.writable_armed = true;
        }
        SocketState::Alive
    }

    /// Drops undelivered packets (connection is being destroyed).
    pub(crate) fn abandon_backlog(&mut self) {
        self.outbox.clear();
        self.backlog.store(0, Ordering::Relaxed);
    }

    pub(crate) fn shutdown(&mut self, registry: &Registry) {
        let _ = registry.deregister(self.transport.source());
        self.transport.shutdown();
    }
}

#[inline]
fn write_buf(transport: &mut dyn Transport, data: &[u8], offset: &mut usize) -> io::Result<usize> {
    let n = transport.write(&data[*offset..])?;
    *offset += n;
    Ok(n)
}

/// File packet path: zero-copy sendfile where the transport allows it,
/// otherwise read a chunk and write it like a buffer.
fn write_file(
    transport: &mut dyn Transport,
    scratch: &mut Vec<u8>,
    file: &mut std::fs::File,
    offset: &mut u64,
    remaining: &mut u64,
) -> io::Result<usize> {
    if *remaining == 0 {
        return Ok(0);
    }

    #[cfg(target_os = "linux")]
    if transport.can_sendfile() {
        use std::os::fd::AsRawFd;
        let count = (*remaining).min(SENDFILE_MAX_CHUNK as u64) as usize;
        let mut off = *offset as libc::off_t;
        let n = unsafe {
            libc::sendfile(transport.raw_fd(), file.as_raw_fd(), &mut off, count)
        };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        *offset += n as u64;
        *remaining -= n as u64;
        return Ok(n as usize);
    }

    let count = (*remaining).min(FILE_FALLBACK_CHUNK as u64) as usize;
    scratch.resize(count, 0);
    file.seek(SeekFrom::Start(*offset))?;
    let got = file.read(&mut scratch[..count])?;
    if got == 0 {
        // File truncated under us; drop the rest of the packet.
        let stale = *remaining;
        *remaining = 0;
        return Ok(stale as usize);
    }
    let n = transport.write(&scratch[..got])?;
    *offset += n as u64;
    *remaining -= n as u64;
    Ok(n)
}

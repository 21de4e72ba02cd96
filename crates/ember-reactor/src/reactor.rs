use std::{
    io,
    net::SocketAddr,
    sync::{Arc, atomic::AtomicUsize},
    time::{Duration, Instant},
};

use crossbeam_channel::{Receiver, Sender, unbounded};
use ember_utils::safe_panic;
use mio::{Events, Interest, Poll, Token, Waker};
use slab::Slab;
use tracing::{debug, trace, warn};

use crate::{
    Acceptor, ConnId, Note, Packet, Protocol, Transport,
    defer::{self, DeferQueue},
    socket::{FlushOutcome, Socket, SocketState},
    timer::{TimerEntry, TimerOutcome, Timers},
};

const WAKER_TOKEN: Token = Token(usize::MAX);
const EVENTS_CAPACITY: usize = 1024;
const DEFAULT_READ_CHUNK: usize = 16 * 1024;
/// Sweep interval for idle-timeout review.
const TIMEOUT_SWEEP: Duration = Duration::from_secs(1);
/// Back-off applied to a listener that ran out of file descriptors.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// A deferred unit of work, run on the reactor thread after the poll phase.
pub type Task = Box<dyn FnOnce(&mut Reactor) + Send>;

#[derive(Debug, thiserror::Error)]
pub enum ReactorError {
    #[error("poller initialisation failed: {0}")]
    Init(#[source] io::Error),
    #[error("poll failed: {0}")]
    Poll(#[source] io::Error),
    #[error("socket registration failed: {0}")]
    Registry(#[source] io::Error),
}

enum Op {
    Write(ConnId, Packet),
    Notify(ConnId, Note),
    Close(ConnId),
    Defer(Task),
    Stop,
}

/// Cloneable cross-thread entry point into a reactor.
///
/// Every operation is queued and the poll is woken; ordering is preserved
/// per sender. Operations referring to a connection that died in the
/// meantime are dropped (the generation check rejects them).
#[derive(Clone)]
pub struct ReactorHandle {
    tx: Sender<Op>,
    waker: Arc<Waker>,
}

impl ReactorHandle {
    fn send(&self, op: Op) {
        if self.tx.send(op).is_ok() {
            let _ = self.waker.wake();
        }
    }

    /// Enqueues an outbound packet on the connection.
    pub fn write2(&self, id: ConnId, packet: Packet) {
        self.send(Op::Write(id, packet));
    }

    /// Delivers a typed note to the connection's protocol.
    pub fn notify(&self, id: ConnId, note: Note) {
        self.send(Op::Notify(id, note));
    }

    /// Requests a graceful close: flush outbound, then destroy. Idempotent
    /// and safe from any thread.
    pub fn close(&self, id: ConnId) {
        self.send(Op::Close(id));
    }

    /// Pushes a task onto the reactor's run-after-poll queue.
    pub fn defer(&self, task: impl FnOnce(&mut Reactor) + Send + 'static) {
        self.send(Op::Defer(Box::new(task)));
    }

    /// Stops the reactor loop after the current turn.
    pub fn stop(&self) {
        self.send(Op::Stop);
    }
}

struct Conn {
    generation: u32,
    socket: Socket,
    /// Taken while a callback runs; doubles as the re-entrancy guard.
    protocol: Option<Box<dyn Protocol>>,
    /// Unconsumed inbound bytes awaiting the protocol.
    inbox: Vec<u8>,
    read_chunk: usize,
    timeout: Option<Duration>,
    last_active: Instant,
    /// `on_open` fired.
    open: bool,
    /// Graceful close pending outbound flush.
    closing: bool,
    /// Fatal I/O observed while the protocol was detached.
    dead: bool,
}

struct ListenerSlot {
    acceptor: Box<dyn Acceptor>,
    paused: bool,
}

enum Slot {
    Conn(Conn),
    Listener(ListenerSlot),
}

/// Identifier of an attached listening socket.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct ListenerId(usize);

/// Single-threaded cooperative event loop.
///
/// Turn order: expired timers (scheduled order), I/O readiness events, then
/// the deferred queue drained up to [`DEFER_TURN_BUDGET`] tasks. Signal
/// handling belongs to the embedding loop, which checks its flags between
/// turns. All connection callbacks run here; cross-thread work arrives
/// through the [`ReactorHandle`] injector.
///
/// [`DEFER_TURN_BUDGET`]: crate::DEFER_TURN_BUDGET
pub struct Reactor {
    poll: Poll,
    events: Events,
    slots: Slab<Slot>,
    /// Per-slot generation counters, bumped on free so stale ids miss.
    generations: Vec<u32>,
    timers: Timers,
    defer: DeferQueue,
    injector: Receiver<Op>,
    handle: ReactorHandle,
    stopped: bool,
    draining: bool,
}

impl Reactor {
    pub fn new() -> Result<Self, ReactorError> {
        let poll = Poll::new().map_err(ReactorError::Init)?;
        let waker = Waker::new(poll.registry(), WAKER_TOKEN).map_err(ReactorError::Init)?;
        let (tx, injector) = unbounded();
        let mut reactor = Self {
            poll,
            events: Events::with_capacity(EVENTS_CAPACITY),
            slots: Slab::new(),
            generations: Vec::new(),
            timers: Timers::default(),
            defer: DeferQueue::default(),
            injector,
            handle: ReactorHandle { tx, waker: Arc::new(waker) },
            stopped: false,
            draining: false,
        };
        reactor.run_every(TIMEOUT_SWEEP, 0, |r| {
            r.sweep_timeouts();
            TimerOutcome::Continue
        });
        Ok(reactor)
    }

    #[inline]
    pub fn handle(&self) -> ReactorHandle {
        self.handle.clone()
    }

    #[inline]
    pub fn is_draining(&self) -> bool {
        self.draining
    }

    #[inline]
    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    pub fn stop(&mut self) {
        self.stopped = true;
    }

    /// Number of live (non-listener) connections.
    pub fn conn_count(&self) -> usize {
        self.slots.iter().filter(|(_, s)| matches!(s, Slot::Conn(_))).count()
    }

    /* ---------------------------------------------------------------- */
    /* attach / listen                                                   */
    /* ---------------------------------------------------------------- */

    /// Registers a connected transport and binds `protocol` to it. Fires
    /// `on_open` once any transport handshake completes.
    pub fn attach(
        &mut self,
        transport: Box<dyn Transport>,
        protocol: Box<dyn Protocol>,
    ) -> Result<ConnId, ReactorError> {
        let index = self.slots.vacant_key();
        if self.generations.len() <= index {
            self.generations.resize(index + 1, 0);
        }
        let generation = self.generations[index];
        let mut socket = Socket::new(transport);
        self.poll
            .registry()
            .register(socket.source(), Token(index), Interest::READABLE)
            .map_err(ReactorError::Registry)?;
        self.slots.insert(Slot::Conn(Conn {
            generation,
            socket,
            protocol: Some(protocol),
            inbox: Vec::new(),
            read_chunk: DEFAULT_READ_CHUNK,
            timeout: None,
            last_active: Instant::now(),
            open: false,
            closing: false,
            dead: false,
        }));
        let id = ConnId::new(index, generation);
        self.try_open(index);
        Ok(id)
    }

    /// Registers a listening socket. Accepted connections are attached with
    /// whatever the acceptor's factory builds.
    pub fn listen(&mut self, mut acceptor: Box<dyn Acceptor>) -> Result<ListenerId, ReactorError> {
        let index = self.slots.vacant_key();
        if self.generations.len() <= index {
            self.generations.resize(index + 1, 0);
        }
        self.poll
            .registry()
            .register(acceptor.source(), Token(index), Interest::READABLE)
            .map_err(ReactorError::Registry)?;
        self.slots.insert(Slot::Listener(ListenerSlot { acceptor, paused: false }));
        Ok(ListenerId(index))
    }

    /* ---------------------------------------------------------------- */
    /* timers / defer                                                    */
    /* ---------------------------------------------------------------- */

    /// Schedules `task` every `every`. `reps == 0` repeats forever; the task
    /// cancels itself by returning [`TimerOutcome::Stop`].
    pub fn run_every<F>(&mut self, every: Duration, reps: u32, task: F)
    where
        F: FnMut(&mut Reactor) -> TimerOutcome + Send + 'static,
    {
        self.timers.schedule(every, TimerEntry {
            interval: every,
            reps_left: (reps != 0).then_some(reps),
            task: Box::new(task),
            on_finish: None,
        });
    }

    /// As [`run_every`], with an `on_finish` hook that fires exactly once
    /// after the last repetition or cancellation.
    ///
    /// [`run_every`]: Self::run_every
    pub fn run_every_with<F, G>(&mut self, every: Duration, reps: u32, task: F, on_finish: G)
    where
        F: FnMut(&mut Reactor) -> TimerOutcome + Send + 'static,
        G: FnOnce(&mut Reactor) + Send + 'static,
    {
        self.timers.schedule(every, TimerEntry {
            interval: every,
            reps_left: (reps != 0).then_some(reps),
            task: Box::new(task),
            on_finish: Some(Box::new(on_finish)),
        });
    }

    /// Pushes a task to run after the current poll phase, same thread.
    pub fn defer(&mut self, task: impl FnOnce(&mut Reactor) + Send + 'static) {
        self.defer.push(Box::new(task));
    }

    pub(crate) fn defer_pop(&mut self) -> Option<Task> {
        self.defer.pop()
    }

    /* ---------------------------------------------------------------- */
    /* connection operations                                             */
    /* ---------------------------------------------------------------- */

    fn valid_index(&self, id: ConnId) -> Option<usize> {
        match self.slots.get(id.index()) {
            Some(Slot::Conn(conn)) if conn.generation == id.generation() => Some(id.index()),
            _ => None,
        }
    }

    /// Enqueues a packet on a live connection; silently dropped when the id
    /// is stale or the connection is already closing.
    pub fn write2(&mut self, id: ConnId, packet: Packet) {
        if let Some(index) = self.valid_index(id) {
            self.enqueue_on(index, packet);
            if self.conn_is_dead(index) {
                self.destroy(index);
            }
        }
    }

    /// Graceful close: flush the outbound chain, then destroy. Idempotent.
    pub fn close(&mut self, id: ConnId) {
        if let Some(index) = self.valid_index(id) {
            self.close_index(index);
        }
    }

    /// Current outbound backlog in bytes, 0 for stale ids.
    pub fn backlog(&self, id: ConnId) -> usize {
        self.valid_index(id)
            .and_then(|i| match &self.slots[i] {
                Slot::Conn(c) => Some(c.socket.backlog_bytes()),
                Slot::Listener(_) => None,
            })
            .unwrap_or(0)
    }

    fn enqueue_on(&mut self, index: usize, packet: Packet) {
        let Self { poll, slots, .. } = self;
        let Some(Slot::Conn(conn)) = slots.get_mut(index) else { return };
        if conn.closing || conn.dead {
            return;
        }
        if conn.socket.enqueue(poll.registry(), Token(index), packet) == SocketState::Closed {
            conn.dead = true;
        }
    }

    fn conn_is_dead(&self, index: usize) -> bool {
        matches!(self.slots.get(index), Some(Slot::Conn(c)) if c.dead)
    }

    fn close_index(&mut self, index: usize) {
        let Some(Slot::Conn(conn)) = self.slots.get_mut(index) else { return };
        if conn.closing {
            return;
        }
        if conn.socket.has_backlog() && !conn.dead {
            conn.closing = true;
        } else {
            self.destroy(index);
        }
    }

    /// Frees the slot, fires `on_close` (exactly once per successful open)
    /// and bumps the generation so stale ids are rejected.
    fn destroy(&mut self, index: usize) {
        if !self.slots.contains(index) {
            return;
        }
        let slot = self.slots.remove(index);
        match slot {
            Slot::Conn(mut conn) => {
                conn.socket.abandon_backlog();
                conn.socket.shutdown(self.poll.registry());
                self.generations[index] = self.generations[index].wrapping_add(1);
                let id = ConnId::new(index, conn.generation);
                trace!(conn = %id, "reactor: destroy");
                if conn.open
                    && let Some(mut protocol) = conn.protocol.take()
                {
                    protocol.on_close(id);
                }
            }
            Slot::Listener(mut listener) => {
                let _ = self.poll.registry().deregister(listener.acceptor.source());
            }
        }
    }

    /// Runs one protocol callback with the binding temporarily detached,
    /// then applies any close/upgrade the callback recorded.
    fn with_protocol(
        &mut self,
        index: usize,
        f: Box<dyn FnOnce(&mut dyn Protocol, &mut ConnCtx<'_>) + '_>,
    ) {
        let Some(Slot::Conn(conn)) = self.slots.get_mut(index) else { return };
        let Some(mut protocol) = conn.protocol.take() else { return };
        let id = ConnId::new(index, conn.generation);

        let mut cx = ConnCtx { reactor: self, index, id, close: None, upgrade: None };
        f(&mut *protocol, &mut cx);
        let ConnCtx { close, upgrade, .. } = cx;

        let upgraded = upgrade.is_some();
        if let Some(Slot::Conn(conn)) = self.slots.get_mut(index) {
            if conn.generation == id.generation() {
                conn.protocol = Some(upgrade.unwrap_or(protocol));
            }
        }

        match close {
            Some(CloseMode::Now) => {
                self.destroy(index);
                return;
            }
            Some(CloseMode::Graceful) => {
                self.close_index(index);
                return;
            }
            None => {}
        }
        if self.conn_is_dead(index) {
            self.destroy(index);
            return;
        }
        if upgraded {
            // New binding takes over; give it its open callback.
            self.with_protocol(index, Box::new(|p, cx| p.on_open(cx)));
        }
    }

    fn try_open(&mut self, index: usize) {
        let Some(Slot::Conn(conn)) = self.slots.get_mut(index) else { return };
        if conn.open {
            return;
        }
        match conn.socket.handshake() {
            Ok(true) => {
                conn.open = true;
                conn.last_active = Instant::now();
                self.with_protocol(index, Box::new(|p, cx| p.on_open(cx)));
            }
            Ok(false) => {}
            Err(err) => {
                debug!(?err, "reactor: transport handshake failed");
                // Never opened, so no on_close is owed.
                self.destroy(index);
            }
        }
    }

    /* ---------------------------------------------------------------- */
    /* event dispatch                                                    */
    /* ---------------------------------------------------------------- */

    fn dispatch_conn(&mut self, index: usize, readable: bool, writable: bool) {
        // TLS (or other) handshake first; application data waits for it.
        let open = match self.slots.get(index) {
            Some(Slot::Conn(conn)) => conn.open,
            _ => return,
        };
        if !open {
            self.try_open(index);
            if !matches!(self.slots.get(index), Some(Slot::Conn(c)) if c.open) {
                return;
            }
        }

        if writable {
            let (outcome, had_backlog, closing) = {
                let Self { poll, slots, .. } = self;
                let Some(Slot::Conn(conn)) = slots.get_mut(index) else { return };
                let had_backlog = conn.socket.has_backlog();
                (conn.socket.flush(poll.registry(), Token(index)), had_backlog, conn.closing)
            };
            match outcome {
                FlushOutcome::Closed => {
                    self.destroy(index);
                    return;
                }
                FlushOutcome::Drained => {
                    if closing {
                        self.destroy(index);
                        return;
                    }
                    if had_backlog {
                        self.with_protocol(index, Box::new(|p, cx| p.on_ready(cx)));
                    }
                }
                FlushOutcome::Pending => {}
            }
        }

        if readable {
            self.read_and_deliver(index);
        }
    }

    fn read_and_deliver(&mut self, index: usize) {
        let (mut inbox, fresh, state, closing) = {
            let Some(Slot::Conn(conn)) = self.slots.get_mut(index) else { return };
            let mut inbox = std::mem::take(&mut conn.inbox);
            let (fresh, state) = conn.socket.read_into(&mut inbox, conn.read_chunk);
            if conn.closing {
                // Draining only; discard whatever the peer still sends.
                inbox.clear();
            } else if fresh > 0 {
                conn.last_active = Instant::now();
            }
            (inbox, fresh, state, conn.closing)
        };

        if !closing && fresh > 0 {
            self.with_protocol(index, Box::new(|p, cx| p.on_data(cx, &mut inbox)));
        }
        // Hand the unconsumed remainder back, if the connection survived.
        if let Some(Slot::Conn(conn)) = self.slots.get_mut(index) {
            if !inbox.is_empty() && conn.inbox.is_empty() {
                conn.inbox = inbox;
            }
        }
        if state == SocketState::Closed {
            self.destroy(index);
        }
    }

    fn dispatch_listener(&mut self, index: usize) {
        loop {
            let accepted = {
                let Some(Slot::Listener(slot)) = self.slots.get_mut(index) else { return };
                if slot.paused {
                    return;
                }
                slot.acceptor.accept()
            };
            match accepted {
                Ok(Some((transport, protocol))) => {
                    if let Err(err) = self.attach(transport, protocol) {
                        warn!(?err, "reactor: accepted connection dropped");
                    }
                }
                Ok(None) => return,
                Err(err) if is_fd_exhaustion(&err) => {
                    warn!(?err, "reactor: fd limit reached, pausing accept");
                    self.pause_listener(index, true);
                    self.run_every(ACCEPT_BACKOFF, 1, move |r| {
                        r.pause_listener(index, false);
                        TimerOutcome::Stop
                    });
                    return;
                }
                Err(err) => {
                    debug!(?err, "reactor: accept");
                    return;
                }
            }
        }
    }

    fn pause_listener(&mut self, index: usize, pause: bool) {
        let Self { poll, slots, draining, .. } = self;
        let Some(Slot::Listener(slot)) = slots.get_mut(index) else { return };
        if *draining && !pause {
            return;
        }
        if pause && !slot.paused {
            let _ = poll.registry().deregister(slot.acceptor.source());
            slot.paused = true;
        } else if !pause && slot.paused {
            if let Err(err) =
                poll.registry().register(slot.acceptor.source(), Token(index), Interest::READABLE)
            {
                warn!(?err, "reactor: listener resume failed");
                return;
            }
            slot.paused = false;
        }
    }

    /* ---------------------------------------------------------------- */
    /* lifecycle                                                         */
    /* ---------------------------------------------------------------- */

    /// Stops accepting and fires `on_shutdown` on every live connection.
    /// The embedding loop keeps turning until `conn_count` hits zero or the
    /// drain window ends, then calls [`force_close_all`].
    ///
    /// [`force_close_all`]: Self::force_close_all
    pub fn begin_shutdown(&mut self) {
        if self.draining {
            return;
        }
        let indices: Vec<usize> = self.slots.iter().map(|(i, _)| i).collect();
        for index in &indices {
            if matches!(self.slots.get(*index), Some(Slot::Listener(_))) {
                self.pause_listener(*index, true);
            }
        }
        self.draining = true;
        for index in indices {
            if matches!(self.slots.get(index), Some(Slot::Conn(_))) {
                self.with_protocol(index, Box::new(|p, cx| p.on_shutdown(cx)));
            }
        }
    }

    /// Force-destroys every remaining connection (end of the drain window).
    pub fn force_close_all(&mut self) {
        let indices: Vec<usize> = self
            .slots
            .iter()
            .filter(|(_, s)| matches!(s, Slot::Conn(_)))
            .map(|(i, _)| i)
            .collect();
        for index in indices {
            self.destroy(index);
        }
    }

    fn sweep_timeouts(&mut self) {
        let now = Instant::now();
        let expired: Vec<(usize, bool)> = self
            .slots
            .iter()
            .filter_map(|(i, s)| match s {
                Slot::Conn(c) => {
                    let budget = c.timeout?;
                    (now.duration_since(c.last_active) > budget).then_some((i, c.closing))
                }
                Slot::Listener(_) => None,
            })
            .collect();
        for (index, closing) in expired {
            if closing {
                // Flush never completed; EAGAIN-forever ends here.
                self.destroy(index);
            } else {
                self.touch(index);
                self.with_protocol(index, Box::new(|p, cx| p.on_timeout(cx)));
            }
        }
    }

    fn touch(&mut self, index: usize) {
        if let Some(Slot::Conn(conn)) = self.slots.get_mut(index) {
            conn.last_active = Instant::now();
        }
    }

    /// One reactor turn: timers, poll + I/O, injector, deferred tasks.
    pub fn turn(&mut self, max_wait: Option<Duration>) -> Result<(), ReactorError> {
        let now = Instant::now();
        while let Some(entry) = self.timers.pop_expired(now) {
            self.fire_timer(entry);
        }

        let timeout = self.poll_timeout(max_wait);
        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(ReactorError::Poll(e)),
        }

        let ready: Vec<(usize, bool, bool)> = self
            .events
            .iter()
            .filter(|e| e.token() != WAKER_TOKEN)
            .map(|e| (e.token().0, e.is_readable() || e.is_read_closed(), e.is_writable()))
            .collect();
        for (index, readable, writable) in ready {
            match self.slots.get(index) {
                Some(Slot::Listener(_)) => self.dispatch_listener(index),
                Some(Slot::Conn(_)) => self.dispatch_conn(index, readable, writable),
                None => {}
            }
        }

        while let Ok(op) = self.injector.try_recv() {
            self.apply(op);
        }
        defer::drain(self);
        Ok(())
    }

    /// Runs until stopped. Signal processing, if any, belongs to the caller's
    /// loop around [`turn`].
    ///
    /// [`turn`]: Self::turn
    pub fn run(&mut self) -> Result<(), ReactorError> {
        while !self.stopped {
            self.turn(None)?;
        }
        Ok(())
    }

    fn apply(&mut self, op: Op) {
        match op {
            Op::Write(id, packet) => self.write2(id, packet),
            Op::Notify(id, note) => {
                if let Some(index) = self.valid_index(id) {
                    self.with_protocol(index, Box::new(|p, cx| p.on_notify(cx, note)));
                }
            }
            Op::Close(id) => self.close(id),
            Op::Defer(task) => self.defer.push(task),
            Op::Stop => self.stopped = true,
        }
    }

    fn poll_timeout(&self, max_wait: Option<Duration>) -> Option<Duration> {
        if !self.defer.is_empty() || !self.injector.is_empty() {
            return Some(Duration::ZERO);
        }
        let now = Instant::now();
        let until_timer = self
            .timers
            .next_deadline()
            .map(|d| d.saturating_duration_since(now));
        match (until_timer, max_wait) {
            (Some(t), Some(w)) => Some(t.min(w)),
            (Some(t), None) => Some(t),
            (None, w) => w,
        }
    }

    fn fire_timer(&mut self, mut entry: TimerEntry) {
        let outcome = (entry.task)(self);
        let exhausted = entry.reps_left.is_some_and(|r| r <= 1);
        if outcome == TimerOutcome::Stop || exhausted {
            if let Some(finish) = entry.on_finish.take() {
                finish(self);
            }
            return;
        }
        if let Some(reps) = entry.reps_left.as_mut() {
            *reps -= 1;
        }
        let interval = entry.interval;
        self.timers.schedule(interval, entry);
    }
}

enum CloseMode {
    Graceful,
    Now,
}

/// Borrowed view of one connection, handed to protocol callbacks.
///
/// Writes and timer/defer scheduling apply immediately; close and upgrade
/// are recorded and applied after the callback returns, so the binding is
/// never destroyed under its own feet.
pub struct ConnCtx<'a> {
    reactor: &'a mut Reactor,
    index: usize,
    id: ConnId,
    close: Option<CloseMode>,
    upgrade: Option<Box<dyn Protocol>>,
}

impl ConnCtx<'_> {
    #[inline]
    pub fn id(&self) -> ConnId {
        self.id
    }

    /// Cross-thread handle to this reactor.
    pub fn handle(&self) -> ReactorHandle {
        self.reactor.handle()
    }

    /// Queues an outbound packet on this connection.
    pub fn write(&mut self, packet: Packet) {
        if self.close.is_none() {
            self.reactor.enqueue_on(self.index, packet);
        }
    }

    /// Outstanding outbound bytes (buffers plus unsent file bytes).
    pub fn backlog(&self) -> usize {
        match self.reactor.slots.get(self.index) {
            Some(Slot::Conn(c)) => c.socket.backlog_bytes(),
            _ => 0,
        }
    }

    /// Shared gauge behind [`backlog`], readable from any thread.
    ///
    /// [`backlog`]: Self::backlog
    pub fn backlog_gauge(&self) -> Arc<AtomicUsize> {
        match self.reactor.slots.get(self.index) {
            Some(Slot::Conn(c)) => c.socket.backlog_gauge(),
            _ => {
                safe_panic!("backlog gauge requested for a non-connection slot");
                Arc::new(AtomicUsize::new(0))
            }
        }
    }

    /// Graceful close after the outbound chain flushes.
    pub fn close(&mut self) {
        if !matches!(self.close, Some(CloseMode::Now)) {
            self.close = Some(CloseMode::Graceful);
        }
    }

    /// Immediate close; undelivered outbound data is dropped.
    pub fn close_now(&mut self) {
        self.close = Some(CloseMode::Now);
    }

    /// Swaps the protocol binding once this callback returns. The new
    /// binding receives `on_open`; the old one is dropped without close
    /// callbacks (ownership moved, the socket stays up).
    pub fn upgrade(&mut self, protocol: Box<dyn Protocol>) {
        self.upgrade = Some(protocol);
    }

    /// Sets (or clears) the idle-timeout budget.
    pub fn set_timeout(&mut self, timeout: Option<Duration>) {
        if let Some(Slot::Conn(conn)) = self.reactor.slots.get_mut(self.index) {
            conn.timeout = timeout;
        }
    }

    /// Resets the idle clock, e.g. after a protocol-level probe.
    pub fn touch(&mut self) {
        self.reactor.touch(self.index);
    }

    /// Read size hint for this connection's inbound passes.
    pub fn set_read_chunk(&mut self, bytes: usize) {
        if let Some(Slot::Conn(conn)) = self.reactor.slots.get_mut(self.index) {
            conn.read_chunk = bytes.max(1024);
        }
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        match self.reactor.slots.get(self.index) {
            Some(Slot::Conn(c)) => c.socket.transport().peer_addr(),
            _ => None,
        }
    }

    /// True once process shutdown began and the connection is draining.
    pub fn is_draining(&self) -> bool {
        self.reactor.draining
    }

    pub fn defer(&mut self, task: impl FnOnce(&mut Reactor) + Send + 'static) {
        self.reactor.defer(task);
    }

    pub fn run_every<F>(&mut self, every: Duration, reps: u32, task: F)
    where
        F: FnMut(&mut Reactor) -> TimerOutcome + Send + 'static,
    {
        self.reactor.run_every(every, reps, task);
    }
}

fn is_fd_exhaustion(err: &io::Error) -> bool {
    matches!(err.raw_os_error(), Some(libc::EMFILE) | Some(libc::ENFILE))
}

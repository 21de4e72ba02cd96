use std::{
    io::{Read, Write},
    net::TcpStream,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    thread,
    time::Duration,
};

use ember_reactor::{
    Acceptor, ConnCtx, ConnId, Packet, PlainTcp, Protocol, Reactor, TcpAcceptor, TimerOutcome,
};

struct Echo {
    opens: Arc<AtomicUsize>,
    closes: Arc<AtomicUsize>,
}

impl Protocol for Echo {
    fn on_open(&mut self, _cx: &mut ConnCtx<'_>) {
        self.opens.fetch_add(1, Ordering::SeqCst);
    }

    fn on_data(&mut self, cx: &mut ConnCtx<'_>, buf: &mut Vec<u8>) {
        if !buf.is_empty() {
            cx.write(Packet::from_vec(std::mem::take(buf)));
        }
    }

    fn on_close(&mut self, _id: ConnId) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

fn spawn_echo_server() -> (std::net::SocketAddr, Arc<AtomicUsize>, Arc<AtomicUsize>, Arc<AtomicBool>) {
    let opens = Arc::new(AtomicUsize::new(0));
    let closes = Arc::new(AtomicUsize::new(0));
    let stop = Arc::new(AtomicBool::new(false));

    let listener = mio::net::TcpListener::bind("127.0.0.1:0".parse().unwrap()).unwrap();
    let addr = listener.local_addr().unwrap();

    let (o, c, s) = (opens.clone(), closes.clone(), stop.clone());
    thread::spawn(move || {
        let mut reactor = Reactor::new().unwrap();
        let factory = {
            let (o, c) = (o.clone(), c.clone());
            Box::new(move |stream: mio::net::TcpStream, _addr: std::net::SocketAddr| {
                let transport: Box<dyn ember_reactor::Transport> = Box::new(PlainTcp::new(stream));
                let protocol: Box<dyn Protocol> =
                    Box::new(Echo { opens: o.clone(), closes: c.clone() });
                (transport, protocol)
            })
        };
        let acceptor: Box<dyn Acceptor> = Box::new(TcpAcceptor::new(listener, factory));
        reactor.listen(acceptor).unwrap();
        while !s.load(Ordering::SeqCst) {
            reactor.turn(Some(Duration::from_millis(10))).unwrap();
        }
        reactor.force_close_all();
        // One extra turn so close callbacks settle.
        reactor.turn(Some(Duration::ZERO)).unwrap();
    });

    (addr, opens, closes, stop)
}

#[test]
fn echo_roundtrip_and_lifecycle() {
    let (addr, opens, closes, stop) = spawn_echo_server();

    let mut client = TcpStream::connect(addr).unwrap();
    client.write_all(b"hello reactor").unwrap();
    client.set_read_timeout(Some(Duration::from_secs(5))).unwrap();

    let mut buf = [0u8; 64];
    let n = client.read(&mut buf).unwrap();
    assert_eq!(&buf[..n], b"hello reactor");

    drop(client);
    // Peer close must surface exactly one on_close for the one on_open.
    for _ in 0..200 {
        if closes.load(Ordering::SeqCst) == 1 {
            break;
        }
        thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(opens.load(Ordering::SeqCst), 1);
    assert_eq!(closes.load(Ordering::SeqCst), 1);

    stop.store(true, Ordering::SeqCst);
}

#[test]
fn cross_thread_write_and_close() {
    let (addr, _opens, closes, stop) = spawn_echo_server();

    let mut client = TcpStream::connect(addr).unwrap();
    client.write_all(b"x").unwrap();
    client.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    let mut buf = [0u8; 8];
    let n = client.read(&mut buf).unwrap();
    assert_eq!(&buf[..n], b"x");

    drop(client);
    for _ in 0..200 {
        if closes.load(Ordering::SeqCst) == 1 {
            break;
        }
        thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(closes.load(Ordering::SeqCst), 1);
    stop.store(true, Ordering::SeqCst);
}

#[test]
fn timer_repetitions_and_finish() {
    let mut reactor = Reactor::new().unwrap();
    let fires = Arc::new(AtomicUsize::new(0));
    let finished = Arc::new(AtomicUsize::new(0));

    // reps = 1 fires exactly once, then on_finish once.
    {
        let (fires, finished) = (fires.clone(), finished.clone());
        reactor.run_every_with(
            Duration::from_millis(1),
            1,
            move |_| {
                fires.fetch_add(1, Ordering::SeqCst);
                TimerOutcome::Continue
            },
            move |_| {
                finished.fetch_add(1, Ordering::SeqCst);
            },
        );
    }
    for _ in 0..20 {
        reactor.turn(Some(Duration::from_millis(2))).unwrap();
    }
    assert_eq!(fires.load(Ordering::SeqCst), 1);
    assert_eq!(finished.load(Ordering::SeqCst), 1);

    // reps = 0 runs until the task cancels; on_finish fires exactly once.
    let fires = Arc::new(AtomicUsize::new(0));
    let finished = Arc::new(AtomicUsize::new(0));
    {
        let (fires, finished) = (fires.clone(), finished.clone());
        reactor.run_every_with(
            Duration::from_millis(1),
            0,
            move |_| {
                if fires.fetch_add(1, Ordering::SeqCst) + 1 == 3 {
                    TimerOutcome::Stop
                } else {
                    TimerOutcome::Continue
                }
            },
            move |_| {
                finished.fetch_add(1, Ordering::SeqCst);
            },
        );
    }
    for _ in 0..40 {
        reactor.turn(Some(Duration::from_millis(2))).unwrap();
    }
    assert_eq!(fires.load(Ordering::SeqCst), 3);
    assert_eq!(finished.load(Ordering::SeqCst), 1);
}

#[test]
fn deferred_tasks_run_in_fifo_order() {
    let mut reactor = Reactor::new().unwrap();
    let order = Arc::new(Mutex::new(Vec::new()));
    for tag in 0..4u8 {
        let order = order.clone();
        reactor.defer(move |r| {
            order.lock().unwrap().push(tag);
            if tag == 0 {
                // Scheduled from within the drain: still this turn.
                let order = order.clone();
                r.defer(move |_| order.lock().unwrap().push(99));
            }
        });
    }
    reactor.turn(Some(Duration::ZERO)).unwrap();
    assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 99]);
}

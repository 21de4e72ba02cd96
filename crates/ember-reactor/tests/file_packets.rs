use std::{
    io::{Read, Write},
    net::TcpStream,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::Duration,
};

use ember_reactor::{Acceptor, ConnCtx, Packet, PlainTcp, Protocol, Reactor, TcpAcceptor};

/// Sends a fixed greeting buffer, then a file slice, on open. Exercises the
/// mixed buffer/file outbound chain and its FIFO ordering.
struct FileGreeter {
    path: std::path::PathBuf,
    offset: u64,
    len: u64,
}

impl Protocol for FileGreeter {
    fn on_open(&mut self, cx: &mut ConnCtx<'_>) {
        cx.write(Packet::from_vec(b"head:".to_vec()));
        let file = std::fs::File::open(&self.path).unwrap();
        cx.write(Packet::from_file(file, self.offset, self.len));
        cx.write(Packet::from_vec(b":tail".to_vec()));
        cx.close();
    }

    fn on_data(&mut self, _cx: &mut ConnCtx<'_>, buf: &mut Vec<u8>) {
        buf.clear();
    }
}

#[test]
fn file_packets_interleave_with_buffers_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("payload.bin");
    let content: Vec<u8> = (0u8..=255).cycle().take(128 * 1024).collect();
    std::fs::write(&path, &content).unwrap();

    let listener = mio::net::TcpListener::bind("127.0.0.1:0".parse().unwrap()).unwrap();
    let addr = listener.local_addr().unwrap();
    let stop = Arc::new(AtomicBool::new(false));

    let server = {
        let stop = stop.clone();
        let path = path.clone();
        thread::spawn(move || {
            let mut reactor = Reactor::new().unwrap();
            let factory = Box::new(move |stream: mio::net::TcpStream, _addr: std::net::SocketAddr| {
                let transport: Box<dyn ember_reactor::Transport> = Box::new(PlainTcp::new(stream));
                let protocol: Box<dyn Protocol> = Box::new(FileGreeter {
                    path: path.clone(),
                    // Skip the first KiB, send the next 64 KiB.
                    offset: 1024,
                    len: 64 * 1024,
                });
                (transport, protocol)
            });
            let acceptor: Box<dyn Acceptor> = Box::new(TcpAcceptor::new(listener, factory));
            reactor.listen(acceptor).unwrap();
            while !stop.load(Ordering::SeqCst) {
                reactor.turn(Some(Duration::from_millis(10))).unwrap();
            }
        })
    };

    let mut client = TcpStream::connect(addr).unwrap();
    client.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    let mut received = Vec::new();
    let mut chunk = [0u8; 16 * 1024];
    loop {
        match client.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => received.extend_from_slice(&chunk[..n]),
            Err(e) => panic!("read: {e}"),
        }
    }
    // Writes flush in enqueue order: buffer, file slice, buffer.
    let expected_len = 5 + 64 * 1024 + 5;
    assert_eq!(received.len(), expected_len);
    assert_eq!(&received[..5], b"head:");
    assert_eq!(&received[5..5 + 64 * 1024], &content[1024..1024 + 64 * 1024]);
    assert_eq!(&received[expected_len - 5..], b":tail");

    // The client never spoke, so the write path alone drove the exchange.
    let _ = client.write_all(b"");
    stop.store(true, Ordering::SeqCst);
    server.join().unwrap();
}

use std::{
    io::{Read, Write},
    net::TcpStream,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    thread,
    time::Duration,
};

use ember::{Conn, Handler, HttpConn, ListenerUrl, Runtime, run_single_process};

fn start_server(port: u16, handler: Arc<dyn Handler>) {
    let mut runtime = Runtime::new();
    runtime.workers = 0;
    runtime.threads = 2;
    let url = ListenerUrl::parse(&format!("http://127.0.0.1:{port}")).unwrap();
    runtime.listen(url, handler);
    thread::spawn(move || {
        let _ = run_single_process(runtime);
    });
}

fn connect(port: u16) -> TcpStream {
    for _ in 0..100 {
        if let Ok(stream) = TcpStream::connect(("127.0.0.1", port)) {
            stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
            return stream;
        }
        thread::sleep(Duration::from_millis(20));
    }
    panic!("server never came up on port {port}");
}

fn read_until(stream: &mut TcpStream, needle: &[u8]) -> Vec<u8> {
    let mut collected = Vec::new();
    let mut byte = [0u8; 1024];
    loop {
        let n = stream.read(&mut byte).expect("read");
        assert!(n > 0, "peer closed while waiting for {:?}", String::from_utf8_lossy(needle));
        collected.extend_from_slice(&byte[..n]);
        if collected.windows(needle.len()).any(|w| w == needle) {
            return collected;
        }
    }
}

/* ------------------------------------------------------------------ */
/* 1. HTTP echo                                                        */
/* ------------------------------------------------------------------ */

struct EchoHandler;

impl Handler for EchoHandler {
    fn on_http(&self, conn: &mut HttpConn) {
        let body = conn.body().read(None).to_vec();
        conn.write_header("content-type", "application/octet-stream");
        conn.finish(Some(&body));
    }
}

#[test]
fn http_echo_roundtrip() {
    start_server(28801, Arc::new(EchoHandler));
    let mut client = connect(28801);
    client
        .write_all(b"POST /echo HTTP/1.1\r\nHost: x\r\nContent-Length: 5\r\n\r\nhello")
        .unwrap();
    let reply = read_until(&mut client, b"hello");
    let text = String::from_utf8_lossy(&reply);
    assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(text.contains("content-length: 5\r\n"));
    assert!(text.ends_with("\r\n\r\nhello"));
}

#[test]
fn http_keep_alive_serves_sequential_requests() {
    start_server(28802, Arc::new(EchoHandler));
    let mut client = connect(28802);
    for payload in ["one", "two"] {
        let request = format!(
            "POST /echo HTTP/1.1\r\nHost: x\r\nContent-Length: {}\r\n\r\n{payload}",
            payload.len()
        );
        client.write_all(request.as_bytes()).unwrap();
        let reply = read_until(&mut client, payload.as_bytes());
        assert!(String::from_utf8_lossy(&reply).contains("200 OK"));
    }
}

#[test]
fn oversized_body_gets_413_before_any_handler_runs() {
    let ran = Arc::new(AtomicBool::new(false));
    struct Recorder(Arc<AtomicBool>);
    impl Handler for Recorder {
        fn on_http(&self, conn: &mut HttpConn) {
            self.0.store(true, Ordering::SeqCst);
            conn.finish(None);
        }
    }
    let mut runtime = Runtime::new();
    runtime.workers = 0;
    runtime.threads = 1;
    runtime.defaults.limits.max_body_size = 16;
    let url = ListenerUrl::parse("http://127.0.0.1:28803").unwrap();
    runtime.listen(url, Arc::new(Recorder(ran.clone())));
    thread::spawn(move || {
        let _ = run_single_process(runtime);
    });

    let mut client = connect(28803);
    client
        .write_all(b"POST /big HTTP/1.1\r\nHost: x\r\nContent-Length: 17\r\n\r\n")
        .unwrap();
    let reply = read_until(&mut client, b"\r\n\r\n");
    assert!(String::from_utf8_lossy(&reply).contains("413"));
    assert!(!ran.load(Ordering::SeqCst));
}

/* ------------------------------------------------------------------ */
/* 2. WebSocket upgrade + echo                                         */
/* ------------------------------------------------------------------ */

struct WsEcho;

impl Handler for WsEcho {
    fn on_message(&self, conn: &mut Conn, data: &[u8], is_text: bool) {
        conn.write_frame(data, is_text);
    }
}

fn upgrade_request(port: u16) -> TcpStream {
    let mut client = connect(port);
    client
        .write_all(
            b"GET /chat HTTP/1.1\r\n\
              Host: x\r\n\
              Upgrade: websocket\r\n\
              Connection: Upgrade\r\n\
              Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
              Sec-WebSocket-Version: 13\r\n\r\n",
        )
        .unwrap();
    let head = read_until(&mut client, b"\r\n\r\n");
    let text = String::from_utf8_lossy(&head);
    assert!(text.starts_with("HTTP/1.1 101 Switching Protocols\r\n"), "got: {text}");
    assert!(text.contains("sec-websocket-accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n"));
    client
}

/// Client-side frame reader with a persistent buffer, so pipelined frames
/// are never dropped between reads.
struct WsReader {
    stream: TcpStream,
    buf: Vec<u8>,
}

impl WsReader {
    fn new(stream: TcpStream) -> Self {
        Self { stream, buf: Vec::new() }
    }

    fn next(&mut self) -> (u8, Vec<u8>) {
        let mut chunk = [0u8; 64 * 1024];
        loop {
            if let Some((frame, used)) = ember_ws::decode(&self.buf, u64::MAX).unwrap() {
                self.buf.drain(..used);
                return (frame.opcode as u8, frame.payload);
            }
            let n = self.stream.read(&mut chunk).expect("ws read");
            assert!(n > 0, "peer closed mid-frame");
            self.buf.extend_from_slice(&chunk[..n]);
        }
    }

    fn send_text(&mut self, payload: &[u8]) {
        let mut frame = Vec::new();
        ember_ws::encode(ember_ws::Opcode::Text, true, Some([0x37, 0xfa, 0x21, 0x3d]), payload, &mut frame);
        self.stream.write_all(&frame).unwrap();
    }
}

#[test]
fn websocket_upgrade_and_echo() {
    start_server(28804, Arc::new(WsEcho));
    let mut client = WsReader::new(upgrade_request(28804));

    client.send_text(b"hello");
    let (opcode, payload) = client.next();
    assert_eq!(opcode, 1, "echoed as a text frame");
    assert_eq!(payload, b"hello", "echoed unmasked payload");
}

/* ------------------------------------------------------------------ */
/* 3. Pub/sub fan-out (single process)                                 */
/* ------------------------------------------------------------------ */

struct Room;

impl Handler for Room {
    fn on_open(&self, conn: &mut Conn) {
        conn.subscribe("room");
    }
    fn on_message(&self, conn: &mut Conn, data: &[u8], _is_text: bool) {
        conn.publish("room", data);
    }
}

#[test]
fn pubsub_fanout_reaches_both_subscribers_once() {
    start_server(28805, Arc::new(Room));
    let mut alice = WsReader::new(upgrade_request(28805));
    let mut bob = WsReader::new(upgrade_request(28805));
    // Give the async on_open (and with it the subscriptions) a beat.
    thread::sleep(Duration::from_millis(200));

    bob.send_text(b"hi");

    let (_, to_alice) = alice.next();
    let (_, to_bob) = bob.next();
    assert_eq!(to_alice, b"hi");
    assert_eq!(to_bob, b"hi", "publisher's own subscription hears it too");
}

/* ------------------------------------------------------------------ */
/* 4. Backpressure: pending + on_drained                               */
/* ------------------------------------------------------------------ */

const FLOOD_BYTES: usize = 16 * 1024 * 1024;

struct Flood {
    saw_pending: Arc<AtomicUsize>,
    drained: Arc<AtomicBool>,
}

impl Handler for Flood {
    fn on_message(&self, conn: &mut Conn, data: &[u8], _is_text: bool) {
        match data {
            b"flood" => {
                conn.write_frame(&vec![0xabu8; FLOOD_BYTES], false);
                // Give the reactor a beat to take the packet, then sample
                // the backlog gauge; handlers are allowed to be slow.
                thread::sleep(Duration::from_millis(100));
                self.saw_pending.fetch_max(conn.pending(), Ordering::SeqCst);
            }
            b"check" => {
                let drained = self.drained.load(Ordering::SeqCst);
                conn.write_frame(if drained { b"yes" } else { b"no" }, true);
            }
            _ => {}
        }
    }
    fn on_drained(&self, _conn: &mut Conn) {
        self.drained.store(true, Ordering::SeqCst);
    }
}

#[test]
fn backpressure_reports_pending_then_drains() {
    let saw_pending = Arc::new(AtomicUsize::new(0));
    let drained = Arc::new(AtomicBool::new(false));
    start_server(
        28806,
        Arc::new(Flood { saw_pending: saw_pending.clone(), drained: drained.clone() }),
    );
    let mut client = WsReader::new(upgrade_request(28806));

    client.send_text(b"flood");

    // Consume the flood (fragmented into continuation frames) slowly
    // enough for a backlog to build server-side.
    let mut received = 0usize;
    while received < FLOOD_BYTES {
        let (opcode, payload) = client.next();
        assert!(opcode == 2 || opcode == 0, "flood arrives as binary + continuations");
        received += payload.len();
        thread::sleep(Duration::from_micros(100));
    }
    assert_eq!(received, FLOOD_BYTES);
    assert!(saw_pending.load(Ordering::SeqCst) > 0, "pending was observable mid-flood");

    // on_drained is asynchronous; poll through the protocol itself.
    let deadline = std::time::Instant::now() + Duration::from_secs(10);
    loop {
        client.send_text(b"check");
        let (_, reply) = client.next();
        if reply == b"yes" {
            break;
        }
        assert!(std::time::Instant::now() < deadline, "on_drained never fired");
        thread::sleep(Duration::from_millis(50));
    }
}

/* ------------------------------------------------------------------ */
/* 5. SSE stream + replay                                              */
/* ------------------------------------------------------------------ */

struct Feed;

impl Handler for Feed {
    fn on_http(&self, conn: &mut HttpConn) {
        // POST /pub?{payload in body} publishes into the feed.
        let body = conn.body().read(None).to_vec();
        conn.publish("feed", &body);
        conn.finish(Some(b"ok"));
    }
    fn on_open(&self, conn: &mut Conn) {
        conn.subscribe("feed");
    }
}

#[test]
fn sse_stream_delivers_and_replays_history() {
    start_server(28807, Arc::new(Feed));

    // Publish three messages before any subscriber exists; the built-in
    // memory history caches them.
    let mut publisher = connect(28807);
    for payload in ["m1", "m2", "m3"] {
        let request = format!(
            "POST /pub HTTP/1.1\r\nHost: x\r\nContent-Length: {}\r\n\r\n{payload}",
            payload.len()
        );
        publisher.write_all(request.as_bytes()).unwrap();
        read_until(&mut publisher, b"ok");
    }

    // Reconnect carrying Last-Event-ID: 0 → replay everything cached.
    let mut client = connect(28807);
    client
        .write_all(
            b"GET /feed HTTP/1.1\r\n\
              Host: x\r\n\
              Accept: text/event-stream\r\n\
              Last-Event-ID: 0\r\n\r\n",
        )
        .unwrap();
    // Head and replayed events may share packets; collect until the last
    // replayed event is visible and assert over the whole prefix.
    let collected = read_until(&mut client, b"data: m3\n\n");
    let stream = String::from_utf8_lossy(&collected);
    assert!(stream.starts_with("HTTP/1.1 200"), "got: {stream}");
    assert!(stream.contains("content-type: text/event-stream"));
    let p1 = stream.find("data: m1").expect("m1 replayed");
    let p2 = stream.find("data: m2").expect("m2 replayed");
    let p3 = stream.find("data: m3").expect("m3 replayed");
    assert!(p1 < p2 && p2 < p3, "replay preserves publication order");

    // Live traffic resumes after the replay.
    let request = "POST /pub HTTP/1.1\r\nHost: x\r\nContent-Length: 4\r\n\r\nlive";
    publisher.write_all(request.as_bytes()).unwrap();
    read_until(&mut publisher, b"ok");
    let live = read_until(&mut client, b"data: live\n\n");
    assert!(String::from_utf8_lossy(&live).contains("data: live"));
}

/* ------------------------------------------------------------------ */
/* 6. Streamed responses and static files                              */
/* ------------------------------------------------------------------ */

struct Streamer;

impl Handler for Streamer {
    fn on_http(&self, conn: &mut HttpConn) {
        conn.write_header("content-type", "text/plain");
        conn.write(b"part one, ");
        conn.write(b"part two");
        conn.finish(None);
    }
}

#[test]
fn streamed_response_arrives_chunked() {
    start_server(28808, Arc::new(Streamer));
    let mut client = connect(28808);
    client.write_all(b"GET /stream HTTP/1.1\r\nHost: x\r\n\r\n").unwrap();
    let reply = read_until(&mut client, b"0\r\n\r\n");
    let text = String::from_utf8_lossy(&reply);
    assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(text.contains("transfer-encoding: chunked\r\n"));
    assert!(!text.contains("content-length"), "framings are mutually exclusive");
    assert!(text.contains("a\r\npart one, \r\n"), "first chunk framed: {text}");
    assert!(text.contains("8\r\npart two\r\n"));
    assert!(text.ends_with("0\r\n\r\n"));
}

#[test]
fn public_folder_serves_files_with_validators() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("hello.txt"), b"static bytes").unwrap();

    let mut runtime = Runtime::new();
    runtime.workers = 0;
    runtime.threads = 1;
    runtime.defaults.public_folder = Some(ember::StaticSettings {
        root: dir.path().to_path_buf(),
        max_age: 60,
    });
    let url = ListenerUrl::parse("http://127.0.0.1:28809").unwrap();
    runtime.listeners.push(ember::ListenerSpec { url, routes: Vec::new(), settings: None });
    thread::spawn(move || {
        let _ = run_single_process(runtime);
    });

    let mut client = connect(28809);
    client.write_all(b"GET /hello.txt HTTP/1.1\r\nHost: x\r\n\r\n").unwrap();
    let reply = read_until(&mut client, b"static bytes");
    let text = String::from_utf8_lossy(&reply);
    assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(text.contains("content-length: 12\r\n"));
    assert!(text.contains("content-type: text/plain"));
    assert!(text.contains("cache-control: max-age=60"));
    let etag_line = text
        .lines()
        .find(|l| l.starts_with("etag: "))
        .expect("strong validator present")
        .to_string();

    // Revalidation with the returned ETag gets a 304 on the same
    // keep-alive connection.
    let etag = etag_line.trim_start_matches("etag: ").trim();
    let revalidate =
        format!("GET /hello.txt HTTP/1.1\r\nHost: x\r\nIf-None-Match: {etag}\r\n\r\n");
    client.write_all(revalidate.as_bytes()).unwrap();
    let reply = read_until(&mut client, b"\r\n\r\n");
    assert!(String::from_utf8_lossy(&reply).starts_with("HTTP/1.1 304 Not Modified"));

    // Missing files 404 (no routes are mounted at all).
    client.write_all(b"GET /missing.txt HTTP/1.1\r\nHost: x\r\n\r\n").unwrap();
    let reply = read_until(&mut client, b"\r\n\r\n");
    assert!(String::from_utf8_lossy(&reply).contains("404"));
}

/* ------------------------------------------------------------------ */
/* 7. Global (connection-less) subscriptions                           */
/* ------------------------------------------------------------------ */

#[test]
fn global_subscription_hears_handler_publishes() {
    struct Publisher;
    impl Handler for Publisher {
        fn on_http(&self, conn: &mut HttpConn) {
            let body = conn.body().read(None).to_vec();
            conn.publish("audit", &body);
            conn.finish(Some(b"ok"));
        }
    }

    let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
    let mut runtime = Runtime::new();
    runtime.workers = 0;
    runtime.threads = 2;
    {
        let seen = seen.clone();
        runtime.subscribe("audit", move |msg| {
            seen.lock().unwrap().push(msg.payload.to_vec());
        });
    }
    let url = ListenerUrl::parse("http://127.0.0.1:28810").unwrap();
    runtime.listen(url, Arc::new(Publisher));
    thread::spawn(move || {
        let _ = run_single_process(runtime);
    });

    let mut client = connect(28810);
    for payload in ["alpha", "beta"] {
        let request = format!(
            "POST /pub HTTP/1.1\r\nHost: x\r\nContent-Length: {}\r\n\r\n{payload}",
            payload.len()
        );
        client.write_all(request.as_bytes()).unwrap();
        read_until(&mut client, b"ok");
    }

    for _ in 0..100 {
        if seen.lock().unwrap().len() == 2 {
            break;
        }
        thread::sleep(Duration::from_millis(20));
    }
    assert_eq!(*seen.lock().unwrap(), vec![b"alpha".to_vec(), b"beta".to_vec()]);
}

use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
};

use bytes::Bytes;
use ember_http::{Request, Response, encode_event};
use ember_pubsub::{ChannelKey, Message, PubSub, SubscriptionId, Target};
use ember_reactor::{ConnId, Packet, ReactorHandle};
use parking_lot::Mutex;
use tracing::debug;

use crate::workers::Serializer;

/// Outbound fragmentation threshold for handler-written WebSocket messages.
const WS_FRAGMENT_THRESHOLD: usize = 64 * 1024;

/// What shape the connection's wire currently speaks; drives how writes and
/// pub/sub deliveries are framed.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ConnKind {
    Raw,
    WebSocket,
    Sse,
}

/// State shared between a connection's protocol binding (reactor thread)
/// and the handler facades (async pool threads).
pub(crate) struct ConnCore {
    pub(crate) handle: ReactorHandle,
    pub(crate) id: ConnId,
    pub(crate) kind: ConnKind,
    pub(crate) peer: Option<SocketAddr>,
    pub(crate) pending: Arc<AtomicUsize>,
    pub(crate) pubsub: Arc<PubSub>,
    pub(crate) serializer: Serializer,
    /// Subscriptions owned by this connection; cancelled on close.
    subs: Mutex<Vec<(ChannelKey, bool, SubscriptionId)>>,
    /// Set when a write pushed the backlog past the high-water mark; the
    /// drain event turns it into a handler `on_drained`.
    pub(crate) crossed_high_water: Arc<AtomicBool>,
    pub(crate) high_water: usize,
    closed: AtomicBool,
}

impl ConnCore {
    pub(crate) fn new(
        handle: ReactorHandle,
        id: ConnId,
        kind: ConnKind,
        peer: Option<SocketAddr>,
        pending: Arc<AtomicUsize>,
        pubsub: Arc<PubSub>,
        serializer: Serializer,
        high_water: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            handle,
            id,
            kind,
            peer,
            pending,
            pubsub,
            serializer,
            subs: Mutex::new(Vec::new()),
            crossed_high_water: Arc::new(AtomicBool::new(false)),
            high_water,
            closed: AtomicBool::new(false),
        })
    }

    pub(crate) fn write_bytes(&self, bytes: Vec<u8>) {
        if bytes.is_empty() || self.closed.load(Ordering::Relaxed) {
            return;
        }
        self.handle.write2(self.id, Packet::from_vec(bytes));
        // The backlog gauge moves on the reactor thread; check the
        // high-water crossing there, ordered after the write above.
        let gauge = self.pending.clone();
        let crossed = self.crossed_high_water.clone();
        let high_water = self.high_water;
        self.handle.defer(move |_| {
            if gauge.load(Ordering::Relaxed) > high_water {
                crossed.store(true, Ordering::Relaxed);
            }
        });
    }

    pub(crate) fn pending_bytes(&self) -> usize {
        self.pending.load(Ordering::Relaxed)
    }

    pub(crate) fn request_close(&self) {
        if !self.closed.swap(true, Ordering::Relaxed) {
            self.handle.close(self.id);
        }
    }

    pub(crate) fn mark_closed(&self) {
        self.closed.store(true, Ordering::Relaxed);
    }

    /// Frames one pub/sub message for this connection's wire.
    fn frame_message(&self, msg: &Arc<Message>) -> Vec<u8> {
        let mut out = Vec::with_capacity(msg.payload.len() + 16);
        match self.kind {
            ConnKind::Raw => out.extend_from_slice(&msg.payload),
            ConnKind::WebSocket => {
                let is_text = std::str::from_utf8(&msg.payload).is_ok();
                ember_ws::encode_data_frames(
                    &msg.payload,
                    is_text,
                    WS_FRAGMENT_THRESHOLD,
                    None,
                    &mut out,
                );
            }
            ConnKind::Sse => {
                encode_event(Some(&msg.id.to_string()), None, &msg.payload, &mut out);
            }
        }
        out
    }

    /// Subscribes this connection; deliveries bypass the handler and write
    /// straight to the socket.
    pub(crate) fn subscribe_direct(self: &Arc<Self>, channel: &str, filter: i16) {
        let key = ChannelKey::filtered(channel.as_bytes().to_vec(), filter);
        let core = self.clone();
        let pattern = channel.contains(['*', '?', '[']);
        let sink: ember_pubsub::SubscriberFn = Arc::new(move |msg: &Arc<Message>| {
            let bytes = core.frame_message(msg);
            core.write_bytes(bytes);
        });
        let registered = if pattern {
            self.pubsub.psubscribe(key.clone(), sink, None)
        } else {
            Ok(self.pubsub.subscribe(key.clone(), sink, None))
        };
        match registered {
            Ok(id) => self.subs.lock().push((key, pattern, id)),
            Err(err) => debug!(?err, channel, "subscribe rejected"),
        }
    }

    pub(crate) fn unsubscribe_named(&self, channel: &str, filter: i16) -> bool {
        let key = ChannelKey::filtered(channel.as_bytes().to_vec(), filter);
        let mut subs = self.subs.lock();
        let Some(at) = subs.iter().position(|(k, _, _)| *k == key) else { return false };
        let (_, _, id) = subs.remove(at);
        drop(subs);
        self.pubsub.unsubscribe(id);
        true
    }

    /// Number of live subscriptions this connection owns.
    pub(crate) fn subscription_count(&self) -> usize {
        self.subs.lock().len()
    }

    /// Channel keys this connection currently subscribes to.
    pub(crate) fn subscribed_keys(&self) -> Vec<ChannelKey> {
        self.subs.lock().iter().map(|(key, _, _)| key.clone()).collect()
    }

    /// On close: no subscription outlives its owning connection.
    pub(crate) fn cancel_subscriptions(&self) {
        let drained: Vec<_> = std::mem::take(&mut *self.subs.lock());
        for (_, _, id) in drained {
            self.pubsub.unsubscribe(id);
        }
    }
}

/// Handler-facing connection for WebSocket, SSE and raw-TCP sessions.
pub struct Conn {
    core: Arc<ConnCore>,
    env: HashMap<String, String>,
}

impl Conn {
    pub(crate) fn new(core: Arc<ConnCore>, env: HashMap<String, String>) -> Self {
        Self { core, env }
    }

    pub fn kind(&self) -> ConnKind {
        self.core.kind
    }

    /// Writes a message framed for this connection's protocol: a WebSocket
    /// data frame (text when `data` is valid UTF-8), an SSE data event, or
    /// raw bytes.
    pub fn write(&mut self, data: &[u8]) {
        let bytes = match self.core.kind {
            ConnKind::Raw => data.to_vec(),
            ConnKind::WebSocket => {
                let mut out = Vec::with_capacity(data.len() + 8);
                let is_text = std::str::from_utf8(data).is_ok();
                ember_ws::encode_data_frames(data, is_text, WS_FRAGMENT_THRESHOLD, None, &mut out);
                out
            }
            ConnKind::Sse => {
                let mut out = Vec::new();
                encode_event(None, None, data, &mut out);
                out
            }
        };
        self.core.write_bytes(bytes);
    }

    /// WebSocket-only: write with an explicit text/binary flag.
    pub fn write_frame(&mut self, data: &[u8], is_text: bool) {
        if self.core.kind != ConnKind::WebSocket {
            self.write(data);
            return;
        }
        let mut out = Vec::with_capacity(data.len() + 8);
        ember_ws::encode_data_frames(data, is_text, WS_FRAGMENT_THRESHOLD, None, &mut out);
        self.core.write_bytes(out);
    }

    /// SSE-only: full event framing.
    pub fn write_sse(&mut self, id: Option<&str>, event: Option<&str>, data: &[u8]) {
        let mut out = Vec::new();
        encode_event(id, event, data, &mut out);
        self.core.write_bytes(out);
    }

    pub fn subscribe(&mut self, channel: &str) {
        self.core.subscribe_direct(channel, 0);
    }

    pub fn subscribe_filtered(&mut self, channel: &str, filter: i16) {
        self.core.subscribe_direct(channel, filter);
    }

    pub fn unsubscribe(&mut self, channel: &str) -> bool {
        self.core.unsubscribe_named(channel, 0)
    }

    pub fn publish(&self, channel: &str, payload: &[u8]) {
        self.core.pubsub.publish(
            Target::Cluster,
            Bytes::copy_from_slice(channel.as_bytes()),
            0,
            Bytes::copy_from_slice(payload),
        );
    }

    pub fn publish_filtered(&self, channel: &str, filter: i16, payload: &[u8]) {
        self.core.pubsub.publish(
            Target::Cluster,
            Bytes::copy_from_slice(channel.as_bytes()),
            filter,
            Bytes::copy_from_slice(payload),
        );
    }

    /// Outstanding outbound bytes on this connection.
    pub fn pending(&self) -> usize {
        self.core.pending_bytes()
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.core.peer
    }

    /// Request-scoped environment: method, path, query, version, peer.
    pub fn env(&self) -> &HashMap<String, String> {
        &self.env
    }

    pub fn subscription_count(&self) -> usize {
        self.core.subscription_count()
    }

    pub fn close(&mut self) {
        self.core.request_close();
    }
}

/// Handler-facing request/response pair for one HTTP exchange.
pub struct HttpConn {
    core: Arc<ConnCore>,
    pub(crate) request: Request,
    pub(crate) response: Response,
}

impl HttpConn {
    pub(crate) fn new(core: Arc<ConnCore>, request: Request) -> Self {
        let keep_alive = request.keep_alive();
        let head_only = request.is_head();
        Self { core, request, response: Response::new(keep_alive, head_only) }
    }

    /* request side */

    pub fn method(&self) -> &str {
        &self.request.method
    }

    pub fn path(&self) -> &str {
        &self.request.path
    }

    pub fn query(&self) -> Option<&str> {
        self.request.query.as_deref()
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.request.headers.get(name)
    }

    pub fn cookie(&mut self, name: &str) -> Option<String> {
        self.request.cookie(name).map(str::to_string)
    }

    pub fn body(&mut self) -> &mut ember_http::Body {
        &mut self.request.body
    }

    pub fn env(&self) -> HashMap<String, String> {
        build_env(&self.request, self.core.peer)
    }

    /* response side */

    pub fn set_status(&mut self, status: u16) -> bool {
        self.response.set_status(status)
    }

    /// Pre-commit only: returns false once headers hit the wire.
    pub fn write_header(&mut self, name: &str, value: &str) -> bool {
        self.response.write_header(name, value)
    }

    /// Streams a chunk (commits headers with chunked framing on first use).
    pub fn write(&mut self, chunk: &[u8]) {
        let wire = self.response.stream(chunk);
        self.core.write_bytes(wire);
    }

    /// Completes the response. With no prior `write`, sends `body` (or an
    /// empty body) as a simple Content-Length response.
    pub fn finish(&mut self, body: Option<&[u8]>) {
        let wire = self.response.finish(body);
        self.core.write_bytes(wire);
    }

    pub fn pending(&self) -> usize {
        self.core.pending_bytes()
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.core.peer
    }

    pub fn subscribe(&mut self, channel: &str) {
        self.core.subscribe_direct(channel, 0);
    }

    pub fn unsubscribe(&mut self, channel: &str) -> bool {
        self.core.unsubscribe_named(channel, 0)
    }

    pub fn publish(&self, channel: &str, payload: &[u8]) {
        self.core.pubsub.publish(
            Target::Cluster,
            Bytes::copy_from_slice(channel.as_bytes()),
            0,
            Bytes::copy_from_slice(payload),
        );
    }

    pub fn close(&mut self) {
        self.core.request_close();
    }
}

pub(crate) fn build_env(
    request: &Request,
    peer: Option<SocketAddr>,
) -> HashMap<String, String> {
    let mut env = HashMap::new();
    env.insert("REQUEST_METHOD".into(), request.method.clone());
    env.insert("PATH_INFO".into(), request.path.clone());
    env.insert("QUERY_STRING".into(), request.query.clone().unwrap_or_default());
    env.insert("SERVER_PROTOCOL".into(), format!("HTTP/1.{}", request.version_minor));
    if let Some(peer) = peer {
        env.insert("REMOTE_ADDR".into(), peer.ip().to_string());
        env.insert("REMOTE_PORT".into(), peer.port().to_string());
    }
    if let Some(host) = request.headers.get("host") {
        env.insert("HTTP_HOST".into(), host.to_string());
    }
    env
}

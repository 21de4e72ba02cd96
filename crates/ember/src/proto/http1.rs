use std::sync::Arc;

use ember_http::{
    Request, RequestParser, Response, StaticOutcome, Upgrade, error_response, serve_static,
};
use ember_reactor::{ConnCtx, ConnId, Note, Packet, Protocol};
use ember_ws::accept_key;
use tracing::{debug, info};

use crate::{
    connection::{ConnCore, ConnKind, HttpConn, build_env},
    handler::Handler,
    proto::{HttpNote, guard, sse::SseProto, ws::WsProto},
    runtime::ListenerStack,
    workers::Serializer,
};

/// HTTP/1.1 protocol binding: parses requests off the wire, hands each to
/// the routed handler on the async pool, and promotes the connection to a
/// WebSocket or SSE session on upgrade.
///
/// Pipelining is tolerated: bytes accumulate here, but the next request is
/// parsed only once the current response finishes.
pub(crate) struct Http1 {
    stack: Arc<ListenerStack>,
    parser: RequestParser,
    buffer: Vec<u8>,
    /// A response cycle is in flight on the pool.
    busy: bool,
    core: Option<Arc<ConnCore>>,
}

impl Http1 {
    pub(crate) fn new(stack: Arc<ListenerStack>) -> Self {
        let parser = RequestParser::new(stack.settings.limits);
        Self { stack, parser, buffer: Vec::new(), busy: false, core: None }
    }

    fn core(&self) -> Arc<ConnCore> {
        self.core.clone().expect("core exists after on_open")
    }

    fn fail(&mut self, cx: &mut ConnCtx<'_>, status: u16) {
        cx.write(Packet::from_vec(error_response(status)));
        cx.close();
    }

    fn try_dispatch(&mut self, cx: &mut ConnCtx<'_>) {
        while !self.busy {
            match self.parser.advance(&mut self.buffer) {
                Ok(Some(request)) => {
                    if !self.route(cx, request) {
                        return;
                    }
                }
                Ok(None) => return,
                Err(err) => {
                    debug!(%err, "http: parse failed");
                    self.fail(cx, err.status());
                    return;
                }
            }
        }
    }

    /// Routes one parsed request. Returns false when the connection is done
    /// for (error path).
    fn route(&mut self, cx: &mut ConnCtx<'_>, request: Request) -> bool {
        let settings = &self.stack.settings;
        if settings.log_requests {
            info!(
                method = %request.method,
                path = %request.raw_path,
                peer = ?cx.peer_addr(),
                "request"
            );
        }

        let handler = self.stack.router.lookup(&request.path).cloned();

        match request.upgrade() {
            Upgrade::WebSocket { key } if handler.is_some() => {
                self.busy = true;
                self.dispatch_ws_auth(cx, request, key, handler.expect("checked"));
            }
            Upgrade::Sse if handler.is_some() => {
                self.busy = true;
                self.dispatch_sse_auth(cx, request, handler.expect("checked"));
            }
            _ => {
                if let Some(handler) = handler {
                    self.busy = true;
                    self.dispatch_http(cx, request, handler);
                } else if let Some(public) = &settings.public_folder {
                    let keep_alive = request.keep_alive();
                    serve_public(cx, public, &request, keep_alive);
                    if !keep_alive {
                        cx.close();
                        return false;
                    }
                } else {
                    let keep_alive = request.keep_alive();
                    let mut response = Response::new(keep_alive, request.is_head());
                    response.set_status(404);
                    cx.write(Packet::from_vec(response.finish(None)));
                    if !keep_alive {
                        cx.close();
                        return false;
                    }
                }
            }
        }
        true
    }

    fn dispatch_http(
        &mut self,
        cx: &mut ConnCtx<'_>,
        request: Request,
        handler: Arc<dyn Handler>,
    ) {
        let core = self.core();
        let handle = cx.handle();
        let id = cx.id();
        core.serializer.clone().submit(Box::new(move || {
            let mut conn = HttpConn::new(core.clone(), request);
            match guard("on_http", || handler.on_http(&mut conn)) {
                Some(()) => {
                    if !conn.response.finished() {
                        conn.finish(None);
                    }
                    let keep_alive = conn.response.keep_alive();
                    handle.notify(id, Box::new(HttpNote::Done { keep_alive }));
                }
                None => {
                    // Handler exception: 500 pre-commit, drop post-commit.
                    if !conn.response.committed() {
                        core.write_bytes(error_response(500));
                    }
                    handle.notify(id, Box::new(HttpNote::Fatal));
                }
            }
        }));
    }

    fn dispatch_ws_auth(
        &mut self,
        cx: &mut ConnCtx<'_>,
        request: Request,
        key: String,
        handler: Arc<dyn Handler>,
    ) {
        let core = self.core();
        let handle = cx.handle();
        let id = cx.id();
        core.serializer.clone().submit(Box::new(move || {
            let env = build_env(&request, core.peer);
            let mut conn = HttpConn::new(core.clone(), request);
            let allowed =
                guard("on_authenticate_websocket", || handler.on_authenticate_websocket(&mut conn))
                    .unwrap_or(false);
            let note = if allowed {
                HttpNote::AcceptWs { accept: accept_key(&key), handler, env }
            } else {
                HttpNote::RejectUpgrade
            };
            handle.notify(id, Box::new(note));
        }));
    }

    fn dispatch_sse_auth(
        &mut self,
        cx: &mut ConnCtx<'_>,
        request: Request,
        handler: Arc<dyn Handler>,
    ) {
        let core = self.core();
        let handle = cx.handle();
        let id = cx.id();
        core.serializer.clone().submit(Box::new(move || {
            let env = build_env(&request, core.peer);
            let last_event_id =
                ember_http::parse_last_event_id(&request.headers).map(str::to_string);
            let mut conn = HttpConn::new(core.clone(), request);
            let allowed = guard("on_authenticate_sse", || handler.on_authenticate_sse(&mut conn))
                .unwrap_or(false);
            let note = if allowed {
                HttpNote::AcceptSse { handler, env, last_event_id }
            } else {
                HttpNote::RejectUpgrade
            };
            handle.notify(id, Box::new(note));
        }));
    }

    fn accept_ws(&mut self, cx: &mut ConnCtx<'_>, accept: String, handler: Arc<dyn Handler>, env: std::collections::HashMap<String, String>) {
        let mut response = Response::new(true, false);
        response.write_header("upgrade", "websocket");
        response.write_header("connection", "Upgrade");
        response.write_header("sec-websocket-accept", &accept);
        cx.write(Packet::from_vec(response.send_upgrade_head()));

        let settings = &self.stack.settings;
        let core = ConnCore::new(
            cx.handle(),
            cx.id(),
            ConnKind::WebSocket,
            cx.peer_addr(),
            cx.backlog_gauge(),
            self.stack.shared.pubsub.clone(),
            Serializer::new(self.stack.shared.pool.clone()),
            settings.high_water,
        );
        let early = std::mem::take(&mut self.buffer);
        let proto = WsProto::new(
            handler,
            core,
            env,
            settings.ws_max_message,
            settings.ping_interval,
            early,
        );
        cx.upgrade(Box::new(proto));
    }

    fn accept_sse(
        &mut self,
        cx: &mut ConnCtx<'_>,
        handler: Arc<dyn Handler>,
        env: std::collections::HashMap<String, String>,
        last_event_id: Option<String>,
    ) {
        let mut response = Response::new(false, false);
        response.write_header("content-type", "text/event-stream");
        response.write_header("cache-control", "no-store");
        response.write_header("connection", "keep-alive");
        // The stream is connection-delimited; no length, no chunking.
        cx.write(Packet::from_vec(response.send_raw_head()));

        let settings = &self.stack.settings;
        let core = ConnCore::new(
            cx.handle(),
            cx.id(),
            ConnKind::Sse,
            cx.peer_addr(),
            cx.backlog_gauge(),
            self.stack.shared.pubsub.clone(),
            Serializer::new(self.stack.shared.pool.clone()),
            settings.high_water,
        );
        let proto =
            SseProto::new(handler, core, env, settings.ping_interval, settings.sse_retry_ms, last_event_id);
        cx.upgrade(Box::new(proto));
    }
}

impl Protocol for Http1 {
    fn on_open(&mut self, cx: &mut ConnCtx<'_>) {
        let settings = &self.stack.settings;
        cx.set_timeout(Some(settings.keep_alive));
        cx.set_read_chunk(settings.read_chunk);
        self.core = Some(ConnCore::new(
            cx.handle(),
            cx.id(),
            ConnKind::Raw,
            cx.peer_addr(),
            cx.backlog_gauge(),
            self.stack.shared.pubsub.clone(),
            Serializer::new(self.stack.shared.pool.clone()),
            settings.high_water,
        ));
    }

    fn on_data(&mut self, cx: &mut ConnCtx<'_>, buf: &mut Vec<u8>) {
        if self.buffer.is_empty() {
            std::mem::swap(&mut self.buffer, buf);
        } else {
            self.buffer.extend_from_slice(buf);
            buf.clear();
        }
        self.try_dispatch(cx);
    }

    fn on_notify(&mut self, cx: &mut ConnCtx<'_>, note: Note) {
        let Ok(note) = note.downcast::<HttpNote>() else { return };
        match *note {
            HttpNote::Done { keep_alive } => {
                self.busy = false;
                cx.touch();
                if keep_alive {
                    self.try_dispatch(cx);
                } else {
                    cx.close();
                }
            }
            HttpNote::Fatal => cx.close(),
            HttpNote::AcceptWs { accept, handler, env } => {
                self.accept_ws(cx, accept, handler, env);
            }
            HttpNote::AcceptSse { handler, env, last_event_id } => {
                self.accept_sse(cx, handler, env, last_event_id);
            }
            HttpNote::RejectUpgrade => self.fail(cx, 403),
        }
    }

    fn on_timeout(&mut self, cx: &mut ConnCtx<'_>) {
        // Keep-alive expiry; HTTP has no probe, the connection just ends.
        cx.close();
    }

    fn on_close(&mut self, _id: ConnId) {
        if let Some(core) = self.core.take() {
            core.mark_closed();
            core.cancel_subscriptions();
        }
    }
}

/// Static service runs on the reactor thread: metadata + open are bounded
/// work, and payloads leave as sendfile packets.
fn serve_public(
    cx: &mut ConnCtx<'_>,
    settings: &ember_http::StaticSettings,
    request: &Request,
    keep_alive: bool,
) {
    let head_only = request.is_head();
    let mut response = Response::new(keep_alive, head_only);

    match serve_static(settings, &request.path, &request.headers) {
        StaticOutcome::NotFound => {
            response.set_status(404);
            cx.write(Packet::from_vec(response.finish(None)));
        }
        StaticOutcome::NotModified { headers } => {
            response.set_status(304);
            for (name, value) in &headers {
                response.write_header(name, value);
            }
            cx.write(Packet::from_vec(response.finish(None)));
        }
        StaticOutcome::RangeInvalid { len } => {
            response.set_status(416);
            response.write_header("content-range", &format!("bytes */{len}"));
            cx.write(Packet::from_vec(response.finish(None)));
        }
        StaticOutcome::File { file, offset, len, status, headers } => {
            response.set_status(status);
            for (name, value) in &headers {
                response.write_header(name, value);
            }
            cx.write(Packet::from_vec(response.send_file_head(len)));
            if !head_only && len > 0 {
                cx.write(Packet::from_file(file, offset, len));
            }
        }
    }
}

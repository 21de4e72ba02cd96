use std::{collections::HashMap, sync::Arc, time::Duration};

use ember_reactor::{ConnCtx, ConnId, Packet, Protocol};
use ember_ws::{
    CLOSE_GOING_AWAY, CLOSE_INTERNAL_ERROR, IdleAction, WsConfig, WsSession,
};
use tracing::debug;

use crate::{
    connection::{Conn, ConnCore},
    handler::Handler,
    proto::guard,
};

/// WebSocket protocol binding: frames move through [`WsSession`] on the
/// reactor thread; assembled messages are handed to the handler on the
/// pool, serialised per connection.
pub(crate) struct WsProto {
    handler: Arc<dyn Handler>,
    session: WsSession,
    core: Arc<ConnCore>,
    env: HashMap<String, String>,
    ping_interval: Duration,
    /// Bytes the client sent on the heels of the upgrade request, before
    /// the protocol swap landed.
    initial: Vec<u8>,
}

impl WsProto {
    pub(crate) fn new(
        handler: Arc<dyn Handler>,
        core: Arc<ConnCore>,
        env: HashMap<String, String>,
        max_message: usize,
        ping_interval: Duration,
        initial: Vec<u8>,
    ) -> Self {
        let session = WsSession::new(WsConfig {
            max_message_size: max_message,
            server: true,
            fragment_threshold: 64 * 1024,
        });
        Self { handler, session, core, env, ping_interval, initial }
    }

    fn conn(&self) -> Conn {
        Conn::new(self.core.clone(), self.env.clone())
    }

    fn dispatch<F>(&self, what: &'static str, f: F)
    where
        F: FnOnce(&Arc<dyn Handler>, &mut Conn) + Send + 'static,
    {
        let handler = self.handler.clone();
        let mut conn = self.conn();
        self.core.serializer.submit(Box::new(move || {
            guard(what, || f(&handler, &mut conn));
        }));
    }
}

impl Protocol for WsProto {
    fn on_open(&mut self, cx: &mut ConnCtx<'_>) {
        cx.set_timeout(Some(self.ping_interval));
        self.dispatch("on_open", |handler, conn| handler.on_open(conn));
        let mut early = std::mem::take(&mut self.initial);
        if !early.is_empty() {
            self.on_data(cx, &mut early);
        }
    }

    fn on_data(&mut self, cx: &mut ConnCtx<'_>, buf: &mut Vec<u8>) {
        match self.session.receive(buf) {
            Ok(got) => {
                if !got.replies.is_empty() {
                    cx.write(Packet::from_vec(got.replies));
                }
                for message in got.messages {
                    self.dispatch("on_message", move |handler, conn| {
                        handler.on_message(conn, &message.data, message.is_text);
                    });
                }
                if let Some(code) = got.close_done {
                    debug!(code, "ws: close handshake complete");
                    cx.close();
                }
            }
            Err(violation) => {
                debug!(%violation, "ws: protocol violation");
                let mut wire = Vec::new();
                self.session.send_close(violation.close_code(), &mut wire);
                cx.write(Packet::from_vec(wire));
                cx.close();
            }
        }
    }

    fn on_ready(&mut self, _cx: &mut ConnCtx<'_>) {
        if self.core.crossed_high_water.swap(false, std::sync::atomic::Ordering::Relaxed) {
            self.dispatch("on_drained", |handler, conn| handler.on_drained(conn));
        }
    }

    fn on_timeout(&mut self, cx: &mut ConnCtx<'_>) {
        let mut wire = Vec::new();
        match self.session.idle_tick(&mut wire) {
            IdleAction::PingSent => {
                cx.write(Packet::from_vec(wire));
                cx.touch();
            }
            IdleAction::TimedOut => {
                let mut close = Vec::new();
                self.session.send_close(CLOSE_INTERNAL_ERROR, &mut close);
                cx.write(Packet::from_vec(close));
                cx.close();
            }
        }
    }

    fn on_shutdown(&mut self, cx: &mut ConnCtx<'_>) {
        self.dispatch("on_shutdown", |handler, conn| handler.on_shutdown(conn));
        let mut wire = Vec::new();
        self.session.send_close(CLOSE_GOING_AWAY, &mut wire);
        if !wire.is_empty() {
            cx.write(Packet::from_vec(wire));
        }
    }

    fn on_close(&mut self, _id: ConnId) {
        self.core.mark_closed();
        self.core.cancel_subscriptions();
        let handler = self.handler.clone();
        let mut conn = self.conn();
        self.core.serializer.submit(Box::new(move || {
            guard("on_close", || handler.on_close(&mut conn));
            guard("on_finish", || handler.on_finish(&mut conn));
        }));
    }
}

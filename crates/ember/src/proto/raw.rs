use std::{collections::HashMap, sync::Arc, time::Duration};

use ember_reactor::{ConnCtx, ConnId, Protocol};

use crate::{
    connection::{Conn, ConnCore},
    handler::Handler,
    proto::guard,
};

/// Raw-TCP binding (`tcp://` listeners): every read is handed to the
/// handler's `on_message` as-is, writes are unframed bytes.
pub(crate) struct RawProto {
    handler: Arc<dyn Handler>,
    core: Option<Arc<ConnCore>>,
    env: HashMap<String, String>,
    timeout: Duration,
    make_core: Box<dyn FnMut(&mut ConnCtx<'_>) -> Arc<ConnCore> + Send>,
}

impl RawProto {
    pub(crate) fn new(
        handler: Arc<dyn Handler>,
        timeout: Duration,
        make_core: Box<dyn FnMut(&mut ConnCtx<'_>) -> Arc<ConnCore> + Send>,
    ) -> Self {
        Self { handler, core: None, env: HashMap::new(), timeout, make_core }
    }

    fn dispatch<F>(&self, what: &'static str, f: F)
    where
        F: FnOnce(&Arc<dyn Handler>, &mut Conn) + Send + 'static,
    {
        let Some(core) = self.core.clone() else { return };
        let handler = self.handler.clone();
        let mut conn = Conn::new(core.clone(), self.env.clone());
        core.serializer.submit(Box::new(move || {
            guard(what, || f(&handler, &mut conn));
        }));
    }
}

impl Protocol for RawProto {
    fn on_open(&mut self, cx: &mut ConnCtx<'_>) {
        cx.set_timeout(Some(self.timeout));
        if let Some(peer) = cx.peer_addr() {
            self.env.insert("REMOTE_ADDR".into(), peer.ip().to_string());
        }
        self.core = Some((self.make_core)(cx));
        self.dispatch("on_open", |handler, conn| handler.on_open(conn));
    }

    fn on_data(&mut self, _cx: &mut ConnCtx<'_>, buf: &mut Vec<u8>) {
        if buf.is_empty() {
            return;
        }
        let data = std::mem::take(buf);
        self.dispatch("on_message", move |handler, conn| {
            handler.on_message(conn, &data, false);
        });
    }

    fn on_ready(&mut self, _cx: &mut ConnCtx<'_>) {
        let Some(core) = &self.core else { return };
        if core.crossed_high_water.swap(false, std::sync::atomic::Ordering::Relaxed) {
            self.dispatch("on_drained", |handler, conn| handler.on_drained(conn));
        }
    }

    fn on_timeout(&mut self, _cx: &mut ConnCtx<'_>) {
        self.dispatch("on_timeout", |handler, conn| handler.on_timeout(conn));
    }

    fn on_shutdown(&mut self, _cx: &mut ConnCtx<'_>) {
        self.dispatch("on_shutdown", |handler, conn| handler.on_shutdown(conn));
    }

    fn on_close(&mut self, _id: ConnId) {
        let Some(core) = self.core.take() else { return };
        core.mark_closed();
        core.cancel_subscriptions();
        let handler = self.handler.clone();
        let mut conn = Conn::new(core.clone(), self.env.clone());
        core.serializer.submit(Box::new(move || {
            guard("on_close", || handler.on_close(&mut conn));
        }));
    }
}

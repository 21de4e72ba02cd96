use std::{collections::HashMap, sync::Arc, time::Duration};

use ember_http::{SSE_KEEPALIVE, encode_event, encode_retry};
use ember_pubsub::ReplayFrom;
use ember_reactor::{ConnCtx, ConnId, Packet, Protocol};

use crate::{
    connection::{Conn, ConnCore},
    handler::Handler,
    proto::guard,
};

/// Server-Sent Events binding. The wire is write-only after the head;
/// keepalive comments ride the idle-timeout sweep, and a reconnecting
/// client's `Last-Event-ID` drives history replay before live delivery.
pub(crate) struct SseProto {
    handler: Arc<dyn Handler>,
    core: Arc<ConnCore>,
    env: HashMap<String, String>,
    keepalive: Duration,
    retry_ms: Option<u64>,
    last_event_id: Option<String>,
}

impl SseProto {
    pub(crate) fn new(
        handler: Arc<dyn Handler>,
        core: Arc<ConnCore>,
        env: HashMap<String, String>,
        keepalive: Duration,
        retry_ms: Option<u64>,
        last_event_id: Option<String>,
    ) -> Self {
        Self { handler, core, env, keepalive, retry_ms, last_event_id }
    }
}

impl Protocol for SseProto {
    fn on_open(&mut self, cx: &mut ConnCtx<'_>) {
        cx.set_timeout(Some(self.keepalive));
        if let Some(ms) = self.retry_ms {
            let mut wire = Vec::new();
            encode_retry(ms, &mut wire);
            cx.write(Packet::from_vec(wire));
        }

        let handler = self.handler.clone();
        let core = self.core.clone();
        let env = self.env.clone();
        let last_event_id = self.last_event_id.take();
        self.core.serializer.submit(Box::new(move || {
            let mut conn = Conn::new(core.clone(), env);
            guard("on_open", || handler.on_open(&mut conn));

            // Replay the cached window between the id the client last saw
            // and now, for whatever on_open subscribed to.
            if let Some(last_id) = last_event_id {
                let wants_replay =
                    guard("on_eventsource_reconnect", || {
                        handler.on_eventsource_reconnect(&mut conn, &last_id)
                    })
                    .unwrap_or(false);
                if wants_replay && let Ok(since) = last_id.parse::<u64>() {
                    replay_subscriptions(&core, since);
                }
            }
        }));
    }

    fn on_data(&mut self, _cx: &mut ConnCtx<'_>, buf: &mut Vec<u8>) {
        // The event stream is one-way; inbound bytes are discarded.
        buf.clear();
    }

    fn on_ready(&mut self, _cx: &mut ConnCtx<'_>) {
        if self.core.crossed_high_water.swap(false, std::sync::atomic::Ordering::Relaxed) {
            let handler = self.handler.clone();
            let mut conn = Conn::new(self.core.clone(), self.env.clone());
            self.core.serializer.submit(Box::new(move || {
                guard("on_drained", || handler.on_drained(&mut conn));
            }));
        }
    }

    fn on_timeout(&mut self, cx: &mut ConnCtx<'_>) {
        cx.write(Packet::from_vec(SSE_KEEPALIVE.to_vec()));
        cx.touch();
    }

    fn on_shutdown(&mut self, _cx: &mut ConnCtx<'_>) {
        let handler = self.handler.clone();
        let mut conn = Conn::new(self.core.clone(), self.env.clone());
        self.core.serializer.submit(Box::new(move || {
            guard("on_shutdown", || handler.on_shutdown(&mut conn));
        }));
    }

    fn on_close(&mut self, _id: ConnId) {
        self.core.mark_closed();
        self.core.cancel_subscriptions();
        let handler = self.handler.clone();
        let mut conn = Conn::new(self.core.clone(), self.env.clone());
        self.core.serializer.submit(Box::new(move || {
            guard("on_close", || handler.on_close(&mut conn));
            guard("on_finish", || handler.on_finish(&mut conn));
        }));
    }
}

/// Writes cached messages with id > `since` for every channel the
/// connection subscribed to, before live traffic resumes.
fn replay_subscriptions(core: &Arc<ConnCore>, since: u64) {
    for key in core.subscribed_keys() {
        let Some(window) = core.pubsub.replay(&key, ReplayFrom::MessageId(since)) else {
            continue;
        };
        for msg in window {
            let mut wire = Vec::new();
            encode_event(Some(&msg.id.to_string()), None, &msg.payload, &mut wire);
            core.write_bytes(wire);
        }
    }
}

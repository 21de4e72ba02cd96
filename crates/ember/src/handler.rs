use std::sync::Arc;

use crate::connection::{Conn, HttpConn};

/// Application callbacks. Every method has a default, so a handler
/// implements only what it cares about; the runtime calls exactly what the
/// connection's protocol produces and nothing else.
///
/// All callbacks run on the worker's async pool (or inline in the
/// single-thread fast path) and are serialised per connection: two
/// callbacks never run concurrently for the same connection.
pub trait Handler: Send + Sync + 'static {
    /// Produce a response for one request. Default: 404.
    fn on_http(&self, conn: &mut HttpConn) {
        conn.set_status(404);
        conn.finish(None);
    }

    /// Gate a WebSocket upgrade. Default allows; route WebSocket traffic to
    /// dedicated handlers (or override this) to restrict it.
    fn on_authenticate_websocket(&self, _conn: &mut HttpConn) -> bool {
        true
    }

    /// Gate an SSE stream. Default allows.
    fn on_authenticate_sse(&self, _conn: &mut HttpConn) -> bool {
        true
    }

    /// The connection finished its upgrade (WebSocket/SSE) or raw attach.
    fn on_open(&self, _conn: &mut Conn) {}

    /// One complete WebSocket message, or one raw-TCP read.
    fn on_message(&self, _conn: &mut Conn, _data: &[u8], _is_text: bool) {}

    /// Outbound backlog crossed the high-water mark earlier and has now
    /// drained to zero; produce more.
    fn on_drained(&self, _conn: &mut Conn) {}

    /// Graceful shutdown began; say goodbye before the drain window ends.
    fn on_shutdown(&self, _conn: &mut Conn) {}

    /// The connection is gone. Fires exactly once per on_open.
    fn on_close(&self, _conn: &mut Conn) {}

    /// Idle timeout on a raw-TCP connection (HTTP and WS/SSE have
    /// protocol-level timeout behavior instead).
    fn on_timeout(&self, conn: &mut Conn) {
        conn.close();
    }

    /// An SSE client posted an event upstream (reserved surface).
    fn on_eventsource(&self, _conn: &mut Conn, _id: &str, _event: &str, _data: &[u8]) {}

    /// An SSE client reconnected bearing `Last-Event-ID`. Return true to
    /// replay the cached window for its subscriptions before live traffic.
    fn on_eventsource_reconnect(&self, _conn: &mut Conn, _last_id: &str) -> bool {
        true
    }

    /// A response cycle completed (streamed responses included).
    fn on_finish(&self, _conn: &mut Conn) {}
}

/// A no-op handler: 404 for HTTP, upgrades accepted but silent.
pub(crate) struct DefaultHandler;

impl Handler for DefaultHandler {}

pub(crate) fn default_handler() -> Arc<dyn Handler> {
    Arc::new(DefaultHandler)
}

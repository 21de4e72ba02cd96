use std::any::Any;

use crate::{ConnId, reactor::ConnCtx};

/// Cross-thread notification payload delivered through the reactor queue.
/// Protocols downcast to their own event type.
pub type Note = Box<dyn Any + Send>;

/// Per-connection protocol state machine.
///
/// The reactor owns exactly one protocol binding per connection and calls it
/// serially: no two callbacks ever run concurrently for the same connection.
/// All methods run on the reactor thread and must not block; slow work is
/// handed to the async pool and comes back through [`ReactorHandle::notify`]
/// or queued writes.
///
/// [`ReactorHandle::notify`]: crate::ReactorHandle::notify
pub trait Protocol: Send {
    /// Connection attached and (for TLS) handshook. Fires once.
    fn on_open(&mut self, _cx: &mut ConnCtx<'_>) {}

    /// Inbound bytes are available. `buf` holds everything not yet consumed;
    /// drain the parsed prefix and leave the rest for the next call.
    fn on_data(&mut self, cx: &mut ConnCtx<'_>, buf: &mut Vec<u8>);

    /// The outbound queue drained to zero.
    fn on_ready(&mut self, _cx: &mut ConnCtx<'_>) {}

    /// A notification queued from another thread arrived.
    fn on_notify(&mut self, _cx: &mut ConnCtx<'_>, _note: Note) {}

    /// The idle timeout budget expired. The default drops the connection;
    /// protocols that can probe the peer (WebSocket ping) override this.
    fn on_timeout(&mut self, cx: &mut ConnCtx<'_>) {
        cx.close();
    }

    /// Graceful process shutdown began; the connection will be closed once
    /// outbound data flushes or the drain window ends.
    fn on_shutdown(&mut self, _cx: &mut ConnCtx<'_>) {}

    /// The connection is gone. Fires exactly once per successful `on_open`,
    /// after which no other callback runs.
    fn on_close(&mut self, _id: ConnId) {}
}

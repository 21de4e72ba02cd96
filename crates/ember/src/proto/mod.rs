pub(crate) mod http1;
pub(crate) mod raw;
pub(crate) mod sse;
pub(crate) mod ws;

use std::{collections::HashMap, panic::AssertUnwindSafe, sync::Arc};

use tracing::error;

use crate::handler::Handler;

/// Runs one handler callback, catching panics at the host boundary. A
/// panicking handler never takes the runtime down; the caller decides what
/// happens to the affected connection.
pub(crate) fn guard<R>(what: &'static str, f: impl FnOnce() -> R) -> Option<R> {
    match std::panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(value) => Some(value),
        Err(panic) => {
            let msg = panic
                .downcast_ref::<&str>()
                .map(|s| (*s).to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "opaque panic payload".to_string());
            error!(callback = what, panic = %msg, "handler raised; connection isolated");
            None
        }
    }
}

/// Cross-thread notes from pool jobs back to the HTTP protocol binding.
pub(crate) enum HttpNote {
    /// The response cycle completed; resume parsing (or close).
    Done { keep_alive: bool },
    /// Handler failed post-commit; drop the connection.
    Fatal,
    /// WebSocket upgrade authorised.
    AcceptWs { accept: String, handler: Arc<dyn Handler>, env: HashMap<String, String> },
    /// SSE stream authorised.
    AcceptSse {
        handler: Arc<dyn Handler>,
        env: HashMap<String, String>,
        last_event_id: Option<String>,
    },
    /// Upgrade refused by the handler.
    RejectUpgrade,
}

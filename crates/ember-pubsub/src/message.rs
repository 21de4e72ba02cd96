use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{SystemTime, UNIX_EPOCH},
};

use bytes::Bytes;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// One published message. Immutable after creation and shared by reference
/// count across every delivery, local and remote.
#[derive(Debug, Clone)]
pub struct Message {
    /// Monotonic within the publishing process.
    pub id: u64,
    pub channel: Bytes,
    /// Small-integer parallel namespace; 0 for plain channel publishes.
    pub filter: i16,
    pub payload: Bytes,
    /// Publication wall-clock time, milliseconds since the epoch.
    pub published_ms: u64,
}

impl Message {
    pub fn new(channel: Bytes, filter: i16, payload: Bytes) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            channel,
            filter,
            payload,
            published_ms: now_ms(),
        })
    }

    /// Rebuilds a message that originated in another process. Remote ids are
    /// not comparable to local ones; a fresh local id keeps replay cursors
    /// monotonic.
    pub fn remote(channel: Bytes, filter: i16, payload: Bytes) -> Arc<Self> {
        Self::new(channel, filter, payload)
    }
}

pub(crate) fn now_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as u64).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_monotonic() {
        let a = Message::new(Bytes::from_static(b"ch"), 0, Bytes::from_static(b"1"));
        let b = Message::new(Bytes::from_static(b"ch"), 0, Bytes::from_static(b"2"));
        assert!(b.id > a.id);
    }
}

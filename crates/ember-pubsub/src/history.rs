use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
};

use parking_lot::Mutex;

use crate::{ChannelKey, Message, message::now_ms};

/// Replay cursor for a history request.
#[derive(Clone, Copy, Debug)]
pub enum ReplayFrom {
    /// Messages with id strictly greater than this (SSE `Last-Event-ID`).
    MessageId(u64),
    /// Messages published at or after this timestamp (subscribe-with-since).
    Timestamp(u64),
}

/// Pluggable replay store. Managers are consulted in priority order
/// (highest first); the first one able to serve a window wins.
pub trait HistoryManager: Send + Sync {
    fn priority(&self) -> u8;

    /// Observes every publish seen by this process.
    fn store(&self, msg: &Arc<Message>);

    /// Returns the cached window, oldest first, or `None` when this manager
    /// cannot serve the request.
    fn replay(&self, key: &ChannelKey, since: ReplayFrom) -> Option<Vec<Arc<Message>>>;
}

#[derive(Clone, Copy, Debug)]
pub struct MemoryHistoryConfig {
    /// Total cached messages across all channels.
    pub max_messages: usize,
    /// Per-message lifetime in milliseconds; 0 keeps until evicted by size.
    pub max_age_ms: u64,
    pub priority: u8,
}

impl Default for MemoryHistoryConfig {
    fn default() -> Self {
        Self { max_messages: 4096, max_age_ms: 0, priority: 0 }
    }
}

/// Built-in size-capped in-memory cache. Eviction drops the globally oldest
/// message first (publication ids are monotonic per process), and expired
/// messages are pruned on every store.
pub struct MemoryHistory {
    config: MemoryHistoryConfig,
    inner: Mutex<CacheInner>,
}

#[derive(Default)]
struct CacheInner {
    channels: HashMap<ChannelKey, VecDeque<Arc<Message>>>,
    total: usize,
}

impl MemoryHistory {
    pub fn new(config: MemoryHistoryConfig) -> Self {
        Self { config, inner: Mutex::new(CacheInner::default()) }
    }

    fn prune(&self, inner: &mut CacheInner) {
        if self.config.max_age_ms != 0 {
            let cutoff = now_ms().saturating_sub(self.config.max_age_ms);
            inner.channels.retain(|_, q| {
                while q.front().is_some_and(|m| m.published_ms < cutoff) {
                    q.pop_front();
                }
                !q.is_empty()
            });
            inner.total = inner.channels.values().map(VecDeque::len).sum();
        }

        while inner.total > self.config.max_messages {
            // Evict the channel queue holding the globally oldest message.
            let oldest = inner
                .channels
                .iter()
                .filter_map(|(k, q)| q.front().map(|m| (m.id, k.clone())))
                .min_by_key(|(id, _)| *id);
            let Some((_, key)) = oldest else { break };
            if let Some(q) = inner.channels.get_mut(&key) {
                q.pop_front();
                inner.total -= 1;
                if q.is_empty() {
                    inner.channels.remove(&key);
                }
            }
        }
    }
}

impl HistoryManager for MemoryHistory {
    fn priority(&self) -> u8 {
        self.config.priority
    }

    fn store(&self, msg: &Arc<Message>) {
        let mut inner = self.inner.lock();
        let key = ChannelKey { channel: msg.channel.clone(), filter: msg.filter };
        inner.channels.entry(key).or_default().push_back(msg.clone());
        inner.total += 1;
        self.prune(&mut inner);
    }

    fn replay(&self, key: &ChannelKey, since: ReplayFrom) -> Option<Vec<Arc<Message>>> {
        let inner = self.inner.lock();
        let queue = inner.channels.get(key)?;
        let window: Vec<Arc<Message>> = queue
            .iter()
            .filter(|m| match since {
                ReplayFrom::MessageId(id) => m.id > id,
                ReplayFrom::Timestamp(ms) => m.published_ms >= ms,
            })
            .cloned()
            .collect();
        Some(window)
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;

    fn publish(history: &MemoryHistory, channel: &'static str, payload: &'static str) -> u64 {
        let msg =
            Message::new(Bytes::from_static(channel.as_bytes()), 0, Bytes::from_static(payload.as_bytes()));
        history.store(&msg);
        msg.id
    }

    #[test]
    fn replay_window_is_exclusive_of_cursor() {
        let history = MemoryHistory::new(MemoryHistoryConfig::default());
        let first = publish(&history, "feed", "one");
        publish(&history, "feed", "two");
        publish(&history, "feed", "three");

        let got = history.replay(&ChannelKey::channel("feed"), ReplayFrom::MessageId(first));
        let payloads: Vec<&[u8]> = got.as_deref().unwrap().iter().map(|m| &m.payload[..]).collect();
        assert_eq!(payloads, vec![b"two".as_slice(), b"three"]);
    }

    #[test]
    fn unknown_channel_cannot_be_served() {
        let history = MemoryHistory::new(MemoryHistoryConfig::default());
        assert!(history.replay(&ChannelKey::channel("nope"), ReplayFrom::MessageId(0)).is_none());
    }

    #[test]
    fn size_cap_evicts_oldest() {
        let history =
            MemoryHistory::new(MemoryHistoryConfig { max_messages: 2, ..Default::default() });
        publish(&history, "a", "1");
        publish(&history, "a", "2");
        publish(&history, "b", "3");

        let got = history.replay(&ChannelKey::channel("a"), ReplayFrom::MessageId(0)).unwrap();
        assert_eq!(got.len(), 1, "oldest message was evicted");
        assert_eq!(&got[0].payload[..], b"2");
    }
}

use std::{collections::HashMap, sync::Arc};

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::trace;

use crate::Message;

/// Key of one subscription bucket. Filters are a parallel namespace: the
/// textual channel `"chat"` and filter `7` never collide, and a publish to
/// one never fans out to the other.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct ChannelKey {
    pub channel: Bytes,
    pub filter: i16,
}

impl ChannelKey {
    pub fn channel(channel: impl Into<Bytes>) -> Self {
        Self { channel: channel.into(), filter: 0 }
    }

    pub fn filtered(channel: impl Into<Bytes>, filter: i16) -> Self {
        Self { channel: channel.into(), filter }
    }
}

/// Delivery callback. Runs on the publisher's thread; the subscription's
/// declared queue (async pool hop, direct reactor write) is baked into the
/// closure by whoever registered it.
pub type SubscriberFn = Arc<dyn Fn(&Arc<Message>) + Send + Sync>;
pub type UnsubscribeFn = Box<dyn FnOnce() + Send>;

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct SubscriptionId(u64);

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum SubscribeError {
    #[error("pattern is not valid UTF-8")]
    PatternNotUtf8,
    #[error("invalid glob pattern: {0}")]
    BadPattern(String),
}

struct SubEntry {
    key: ChannelKey,
    pattern: Option<glob::Pattern>,
    on_message: SubscriberFn,
    on_unsubscribe: Option<UnsubscribeFn>,
}

#[derive(Default)]
struct TableInner {
    next_id: u64,
    /// Exact buckets hold subscription ids in registration order.
    exact: HashMap<ChannelKey, Vec<u64>>,
    /// Pattern subscriptions, scanned linearly on every publish.
    patterns: Vec<u64>,
    subs: HashMap<u64, SubEntry>,
}

/// Per-process subscription table.
///
/// The lock covers structural mutation and the snapshot taken at fan-out;
/// delivery itself runs outside the lock, so an unsubscribe races at most
/// one in-flight message (the documented single-message window).
#[derive(Default)]
pub struct ChannelTable {
    inner: Mutex<TableInner>,
}

impl ChannelTable {
    /// Registers a subscription. Returns its id and whether it is the first
    /// local subscription for the key (the cluster layer forwards SUBSCRIBE
    /// upstream exactly then).
    pub fn subscribe(
        &self,
        key: ChannelKey,
        on_message: SubscriberFn,
        on_unsubscribe: Option<UnsubscribeFn>,
    ) -> (SubscriptionId, bool) {
        let mut inner = self.inner.lock();
        inner.next_id += 1;
        let id = inner.next_id;
        inner.subs.insert(id, SubEntry {
            key: key.clone(),
            pattern: None,
            on_message,
            on_unsubscribe,
        });
        let bucket = inner.exact.entry(key).or_default();
        bucket.push(id);
        (SubscriptionId(id), bucket.len() == 1)
    }

    /// Registers a pattern subscription (`*`, `?`, `[set]` glob syntax).
    pub fn psubscribe(
        &self,
        key: ChannelKey,
        on_message: SubscriberFn,
        on_unsubscribe: Option<UnsubscribeFn>,
    ) -> Result<(SubscriptionId, bool), SubscribeError> {
        let source =
            std::str::from_utf8(&key.channel).map_err(|_| SubscribeError::PatternNotUtf8)?;
        let pattern =
            glob::Pattern::new(source).map_err(|e| SubscribeError::BadPattern(e.to_string()))?;
        let mut inner = self.inner.lock();
        inner.next_id += 1;
        let id = inner.next_id;
        let first = !inner
            .subs
            .values()
            .any(|s| s.pattern.is_some() && s.key == key);
        inner.subs.insert(id, SubEntry {
            key,
            pattern: Some(pattern),
            on_message,
            on_unsubscribe,
        });
        inner.patterns.push(id);
        Ok((SubscriptionId(id), first))
    }

    /// Cancels a subscription and fires its `on_unsubscribe` hook. Returns
    /// the key and whether this was the last local subscription for it.
    pub fn unsubscribe(&self, id: SubscriptionId) -> Option<(ChannelKey, bool, bool)> {
        let (entry, last) = {
            let mut inner = self.inner.lock();
            let entry = inner.subs.remove(&id.0)?;
            let last = if entry.pattern.is_some() {
                inner.patterns.retain(|p| *p != id.0);
                !inner.subs.values().any(|s| s.pattern.is_some() && s.key == entry.key)
            } else {
                match inner.exact.get_mut(&entry.key) {
                    Some(bucket) => {
                        bucket.retain(|s| *s != id.0);
                        let empty = bucket.is_empty();
                        if empty {
                            inner.exact.remove(&entry.key);
                        }
                        empty
                    }
                    None => true,
                }
            };
            (entry, last)
        };
        let is_pattern = entry.pattern.is_some();
        if let Some(hook) = entry.on_unsubscribe {
            hook();
        }
        Some((entry.key, last, is_pattern))
    }

    /// Fans a message out to every matching local subscription, exact
    /// buckets first (registration order), then patterns. Each subscriber
    /// sees the message at most once per publish.
    pub fn fanout(&self, msg: &Arc<Message>) {
        let targets: Vec<SubscriberFn> = {
            let inner = self.inner.lock();
            let key = ChannelKey { channel: msg.channel.clone(), filter: msg.filter };
            let mut targets = Vec::new();
            if let Some(bucket) = inner.exact.get(&key) {
                targets.extend(
                    bucket.iter().filter_map(|id| inner.subs.get(id)).map(|s| s.on_message.clone()),
                );
            }
            if let Ok(channel) = std::str::from_utf8(&msg.channel) {
                for id in &inner.patterns {
                    let Some(sub) = inner.subs.get(id) else { continue };
                    if sub.key.filter == msg.filter
                        && sub.pattern.as_ref().is_some_and(|p| p.matches(channel))
                    {
                        targets.push(sub.on_message.clone());
                    }
                }
            }
            targets
        };
        trace!(channel = ?msg.channel, subscribers = targets.len(), "pubsub: fanout");
        for deliver in targets {
            deliver(msg);
        }
    }

    /// True when at least one local subscription (exact or pattern) would
    /// receive a publish on `key`'s channel.
    pub fn has_subscribers(&self, key: &ChannelKey) -> bool {
        let inner = self.inner.lock();
        if inner.exact.contains_key(key) {
            return true;
        }
        let Ok(channel) = std::str::from_utf8(&key.channel) else { return false };
        inner.patterns.iter().filter_map(|id| inner.subs.get(id)).any(|s| {
            s.key.filter == key.filter && s.pattern.as_ref().is_some_and(|p| p.matches(channel))
        })
    }

    pub fn subscription_count(&self) -> usize {
        self.inner.lock().subs.len()
    }
}

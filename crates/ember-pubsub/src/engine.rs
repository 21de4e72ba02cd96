use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::debug;

use crate::{
    ChannelKey, ChannelTable, HistoryManager, Message, ReplayFrom, SubscribeError, SubscriberFn,
    SubscriptionId, table::UnsubscribeFn,
};

/// Built-in fan-out scopes.
///
/// `Cluster` is the default: local delivery plus master-arbitrated fan-out
/// to every other process. `Local` and `Process` are synonyms (this process
/// only), `Siblings` reaches the other workers but not the publisher,
/// `Root` reaches only the master.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Target {
    Cluster,
    Local,
    Process,
    Siblings,
    Root,
}

impl Target {
    #[inline]
    fn delivers_locally(self) -> bool {
        matches!(self, Self::Cluster | Self::Local | Self::Process)
    }

    #[inline]
    pub fn crosses_process(self) -> bool {
        matches!(self, Self::Cluster | Self::Siblings | Self::Root)
    }
}

/// Pluggable pub/sub backend (e.g. a Redis bridge).
///
/// Attached engines are told about subscription changes and see every
/// locally published message; whatever they deliver back goes through
/// [`PubSub::publish_remote`] so it cannot loop.
pub trait Engine: Send + Sync {
    fn subscribe(&self, _channel: &[u8], _filter: i16) {}
    fn unsubscribe(&self, _channel: &[u8], _filter: i16) {}
    fn psubscribe(&self, _pattern: &[u8], _filter: i16) {}
    fn punsubscribe(&self, _pattern: &[u8], _filter: i16) {}
    fn publish(&self, _msg: &Arc<Message>) {}
    /// The engine was detached; last chance to clean up.
    fn detached(&self) {}
}

/// Cluster uplink callback: ships a publish (or subscription change) to the
/// master process. Installed by the runtime once the IPC link is up.
pub type Uplink = Box<dyn Fn(UplinkOp) + Send + Sync>;

pub enum UplinkOp {
    Subscribe(ChannelKey, bool),
    Unsubscribe(ChannelKey, bool),
    Publish(Target, Arc<Message>),
}

/// Process-wide pub/sub facade: channel table + engines + history + uplink.
pub struct PubSub {
    table: ChannelTable,
    engines: Mutex<Vec<Arc<dyn Engine>>>,
    history: Mutex<Vec<Arc<dyn HistoryManager>>>,
    uplink: Mutex<Option<Uplink>>,
}

impl Default for PubSub {
    fn default() -> Self {
        Self {
            table: ChannelTable::default(),
            engines: Mutex::new(Vec::new()),
            history: Mutex::new(Vec::new()),
            uplink: Mutex::new(None),
        }
    }
}

impl PubSub {
    pub fn table(&self) -> &ChannelTable {
        &self.table
    }

    /// Installs (or clears) the cluster uplink. Cleared when the IPC link
    /// drops, which devolves publishes to local-only delivery.
    pub fn set_uplink(&self, uplink: Option<Uplink>) {
        *self.uplink.lock() = uplink;
    }

    pub fn attach_engine(&self, engine: Arc<dyn Engine>) {
        self.engines.lock().push(engine);
    }

    pub fn detach_engine(&self, engine: &Arc<dyn Engine>) {
        let mut engines = self.engines.lock();
        if let Some(at) = engines.iter().position(|e| Arc::ptr_eq(e, engine)) {
            let engine = engines.remove(at);
            drop(engines);
            engine.detached();
        }
    }

    /// Registers a history manager; highest priority is consulted first.
    pub fn attach_history(&self, manager: Arc<dyn HistoryManager>) {
        let mut history = self.history.lock();
        history.push(manager);
        history.sort_by_key(|m| std::cmp::Reverse(m.priority()));
    }

    /// Replays the cached window for one channel, if any manager can serve
    /// it. The first (highest-priority) able manager wins; others are
    /// skipped.
    pub fn replay(&self, key: &ChannelKey, since: ReplayFrom) -> Option<Vec<Arc<Message>>> {
        let managers = self.history.lock().clone();
        managers.iter().find_map(|m| m.replay(key, since))
    }

    pub fn subscribe(
        &self,
        key: ChannelKey,
        on_message: SubscriberFn,
        on_unsubscribe: Option<UnsubscribeFn>,
    ) -> SubscriptionId {
        let (id, first) = self.table.subscribe(key.clone(), on_message, on_unsubscribe);
        if first {
            self.uplink(UplinkOp::Subscribe(key.clone(), false));
            for engine in self.engines.lock().iter() {
                engine.subscribe(&key.channel, key.filter);
            }
        }
        id
    }

    pub fn psubscribe(
        &self,
        key: ChannelKey,
        on_message: SubscriberFn,
        on_unsubscribe: Option<UnsubscribeFn>,
    ) -> Result<SubscriptionId, SubscribeError> {
        let (id, first) = self.table.psubscribe(key.clone(), on_message, on_unsubscribe)?;
        if first {
            self.uplink(UplinkOp::Subscribe(key.clone(), true));
            for engine in self.engines.lock().iter() {
                engine.psubscribe(&key.channel, key.filter);
            }
        }
        Ok(id)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        if let Some((key, last, pattern)) = self.table.unsubscribe(id)
            && last
        {
            self.uplink(UplinkOp::Unsubscribe(key.clone(), pattern));
            for engine in self.engines.lock().iter() {
                if pattern {
                    engine.punsubscribe(&key.channel, key.filter);
                } else {
                    engine.unsubscribe(&key.channel, key.filter);
                }
            }
        }
    }

    /// Publishes on `channel`/`filter` with the given scope. Local delivery
    /// happens inline on the caller's thread; remote delivery goes through
    /// the uplink and attached engines.
    pub fn publish(
        &self,
        target: Target,
        channel: Bytes,
        filter: i16,
        payload: Bytes,
    ) -> Arc<Message> {
        let msg = Message::new(channel, filter, payload);
        self.store_history(&msg);

        if target.delivers_locally() {
            self.table.fanout(&msg);
        }
        if target.crosses_process() {
            // Filters stay process-local unless an engine forwards them
            // itself; the cluster wire only routes plain channels.
            if msg.filter == 0 {
                self.uplink(UplinkOp::Publish(target, msg.clone()));
            } else {
                debug!(filter = msg.filter, "pubsub: filtered publish kept process-local");
            }
            for engine in self.engines.lock().iter() {
                engine.publish(&msg);
            }
        }
        msg
    }

    /// Delivers a message that arrived from another process or an engine:
    /// local fan-out only, never re-forwarded.
    pub fn publish_remote(&self, msg: &Arc<Message>) {
        self.store_history(msg);
        self.table.fanout(msg);
    }

    fn store_history(&self, msg: &Arc<Message>) {
        for manager in self.history.lock().iter() {
            manager.store(msg);
        }
    }

    fn uplink(&self, op: UplinkOp) {
        if let Some(uplink) = self.uplink.lock().as_ref() {
            uplink(op);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[derive(Default)]
    struct CountingEngine {
        published: AtomicUsize,
        subscribed: AtomicUsize,
    }

    impl Engine for CountingEngine {
        fn subscribe(&self, _channel: &[u8], _filter: i16) {
            self.subscribed.fetch_add(1, Ordering::SeqCst);
        }
        fn publish(&self, _msg: &Arc<Message>) {
            self.published.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn engines_observe_subscribes_and_publishes() {
        let pubsub = PubSub::default();
        let engine = Arc::new(CountingEngine::default());
        pubsub.attach_engine(engine.clone());

        pubsub.subscribe(ChannelKey::channel("a"), Arc::new(|_| {}), None);
        // Second subscription to the same channel: no engine call.
        pubsub.subscribe(ChannelKey::channel("a"), Arc::new(|_| {}), None);
        assert_eq!(engine.subscribed.load(Ordering::SeqCst), 1);

        pubsub.publish(Target::Cluster, Bytes::from_static(b"a"), 0, Bytes::new());
        // Local-only publish does not reach engines.
        pubsub.publish(Target::Local, Bytes::from_static(b"a"), 0, Bytes::new());
        assert_eq!(engine.published.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn siblings_scope_skips_local_delivery() {
        let pubsub = PubSub::default();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        pubsub.subscribe(
            ChannelKey::channel("x"),
            Arc::new(move |_| {
                h.fetch_add(1, Ordering::SeqCst);
            }),
            None,
        );
        pubsub.publish(Target::Siblings, Bytes::from_static(b"x"), 0, Bytes::new());
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        pubsub.publish(Target::Cluster, Bytes::from_static(b"x"), 0, Bytes::new());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn filtered_publish_never_reaches_uplink() {
        let pubsub = PubSub::default();
        let uplinked = Arc::new(AtomicUsize::new(0));
        let u = uplinked.clone();
        pubsub.set_uplink(Some(Box::new(move |op| {
            if matches!(op, UplinkOp::Publish(..)) {
                u.fetch_add(1, Ordering::SeqCst);
            }
        })));

        pubsub.publish(Target::Cluster, Bytes::from_static(b"c"), 9, Bytes::new());
        assert_eq!(uplinked.load(Ordering::SeqCst), 0);
        pubsub.publish(Target::Cluster, Bytes::from_static(b"c"), 0, Bytes::new());
        assert_eq!(uplinked.load(Ordering::SeqCst), 1);
    }
}

use std::{collections::HashMap, path::PathBuf, sync::Arc, time::Duration};

use ember_http::{HttpLimits, Router, StaticSettings};
use ember_pubsub::{Message, PubSub};
use ember_reactor::Transport;

use crate::{
    handler::Handler,
    listener::{ListenerUrl, TlsOptions},
    workers::PoolHandle,
};

/// Per-listener tunables. A listener starts from [`Runtime::defaults`] and
/// may override any of it.
#[derive(Clone)]
pub struct ListenerSettings {
    pub limits: HttpLimits,
    /// HTTP keep-alive idle budget.
    pub keep_alive: Duration,
    /// WebSocket ping / SSE keepalive interval.
    pub ping_interval: Duration,
    pub ws_max_message: usize,
    pub public_folder: Option<StaticSettings>,
    pub log_requests: bool,
    /// Read size hint for HTTP connections.
    pub read_chunk: usize,
    /// Outbound backlog high-water mark driving `on_drained`.
    pub high_water: usize,
    /// SSE `retry:` hint sent on stream open.
    pub sse_retry_ms: Option<u64>,
}

impl Default for ListenerSettings {
    fn default() -> Self {
        Self {
            limits: HttpLimits::default(),
            keep_alive: Duration::from_secs(40),
            ping_interval: Duration::from_secs(40),
            ws_max_message: 256 * 1024,
            public_folder: None,
            log_requests: false,
            read_chunk: 32 * 1024,
            high_water: 1024 * 1024,
            sse_retry_ms: None,
        }
    }
}

/// One listening socket plus its routing table.
pub struct ListenerSpec {
    pub url: ListenerUrl,
    /// Route table entries, longest prefix wins. An empty table serves the
    /// default 404 handler (static files still apply).
    pub routes: Vec<(String, Arc<dyn Handler>)>,
    pub settings: Option<ListenerSettings>,
}

/// Supervisor / process lifecycle events, each firing registered hooks.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum Lifecycle {
    PreStart,
    BeforeFork,
    AfterFork,
    EnterMaster,
    EnterChild,
    OnStart,
    OnParentCrush,
    OnChildCrush,
    OnShutdown,
    OnStop,
    OnIdle,
    OnExit,
}

pub type Hook = Box<dyn Fn() + Send + Sync>;

#[derive(Default)]
pub struct LifecycleHooks {
    hooks: HashMap<Lifecycle, Vec<Hook>>,
}

impl LifecycleHooks {
    pub fn on(&mut self, event: Lifecycle, hook: impl Fn() + Send + Sync + 'static) {
        self.hooks.entry(event).or_default().push(Box::new(hook));
    }

    pub(crate) fn fire(&self, event: Lifecycle) {
        if let Some(hooks) = self.hooks.get(&event) {
            for hook in hooks {
                hook();
            }
        }
    }
}

/// Builds a TLS transport for an accepted stream, per listener. The
/// runtime ships only the seam: adapters (and their algorithm stacks) plug
/// in from outside.
pub type TlsTransportFactory =
    Arc<dyn Fn(mio::net::TcpStream, &TlsOptions) -> Box<dyn Transport> + Send + Sync>;

/// Process-lifetime pub/sub callback, not owned by any connection. Runs on
/// the worker's async pool, serialised per subscription.
pub type GlobalSubscriber = Arc<dyn Fn(&Arc<Message>) + Send + Sync>;

/// Explicit whole-process configuration, constructed at startup and shared
/// immutably by workers (no global state).
pub struct Runtime {
    pub listeners: Vec<ListenerSpec>,
    /// Async callback threads per worker; negative means `ncpu + n`.
    pub threads: i32,
    /// Worker processes; negative means `ncpu + n`, 0 runs single-process.
    pub workers: i32,
    pub defaults: ListenerSettings,
    pub shutdown_timeout: Duration,
    /// Cluster secret; absent falls back to `SECRET`/random.
    pub secret: Option<String>,
    /// Cross-host UDP broadcast port.
    pub broadcast_port: Option<u16>,
    pub pidfile: Option<PathBuf>,
    pub hooks: LifecycleHooks,
    pub tls_transport: Option<TlsTransportFactory>,
    /// Global subscriptions registered at startup; every worker (and the
    /// master) subscribes these on boot. Glob metacharacters make a
    /// pattern subscription.
    pub global_subscriptions: Vec<(String, GlobalSubscriber)>,
}

impl Default for Runtime {
    fn default() -> Self {
        Self {
            listeners: Vec::new(),
            threads: 4,
            workers: 0,
            defaults: ListenerSettings::default(),
            shutdown_timeout: Duration::from_secs(5),
            secret: None,
            broadcast_port: None,
            pidfile: None,
            hooks: LifecycleHooks::default(),
            tls_transport: None,
            global_subscriptions: Vec::new(),
        }
    }
}

impl Runtime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a listener with a root route.
    pub fn listen(&mut self, url: ListenerUrl, handler: Arc<dyn Handler>) -> &mut ListenerSpec {
        self.listeners.push(ListenerSpec {
            url,
            routes: vec![("/".to_string(), handler)],
            settings: None,
        });
        self.listeners.last_mut().expect("just pushed")
    }

    /// Registers a process-wide subscription delivered on the async pool.
    pub fn subscribe(
        &mut self,
        channel: &str,
        callback: impl Fn(&Arc<Message>) + Send + Sync + 'static,
    ) {
        self.global_subscriptions.push((channel.to_string(), Arc::new(callback)));
    }

    pub(crate) fn resolved_threads(&self) -> usize {
        resolve_count(self.threads)
    }

    pub(crate) fn resolved_workers(&self) -> usize {
        resolve_count(self.workers)
    }
}

/// Negative counts are relative to the CPU count, clamped at zero.
fn resolve_count(configured: i32) -> usize {
    if configured >= 0 {
        configured as usize
    } else {
        let cpus = num_cpus::get() as i32;
        (cpus + configured).max(0) as usize
    }
}

/// Per-worker shared services, one instance per process.
pub(crate) struct WorkerShared {
    pub(crate) pubsub: Arc<PubSub>,
    pub(crate) pool: PoolHandle,
}

/// Everything one listener's connections need, assembled per worker.
pub(crate) struct ListenerStack {
    pub(crate) router: Router<Arc<dyn Handler>>,
    pub(crate) settings: ListenerSettings,
    pub(crate) shared: Arc<WorkerShared>,
}

impl ListenerStack {
    pub(crate) fn build(spec: &ListenerSpec, defaults: &ListenerSettings, shared: Arc<WorkerShared>) -> Self {
        let mut router = Router::new();
        for (prefix, handler) in &spec.routes {
            router.route(prefix, handler.clone());
        }
        let settings = spec.settings.clone().unwrap_or_else(|| defaults.clone());
        Self { router, settings, shared }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn negative_counts_are_cpu_relative() {
        let cpus = num_cpus::get();
        assert_eq!(resolve_count(4), 4);
        assert_eq!(resolve_count(0), 0);
        assert_eq!(resolve_count(-1), cpus.saturating_sub(1));
        assert_eq!(resolve_count(-(cpus as i32) - 10), 0);
    }
}

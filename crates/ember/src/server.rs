use std::{
    io,
    net::ToSocketAddrs,
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

use ember_cluster::ClusterSecret;
use ember_pubsub::{MemoryHistory, MemoryHistoryConfig, PubSub};
use ember_reactor::{
    Acceptor, PlainTcp, PlainUnix, Protocol, Reactor, TcpAcceptor, Transport, UnixAcceptor,
};
use socket2::{Domain, Socket, Type};
use tracing::{debug, info};

use crate::{
    ServerError,
    cluster_glue::{ClusterLinkProto, UplinkGate, install_uplink},
    connection::{ConnCore, ConnKind},
    handler::default_handler,
    listener::Scheme,
    proto::{http1::Http1, raw::RawProto},
    runtime::{Lifecycle, ListenerStack, Runtime, WorkerShared},
    workers::{AsyncPool, Serializer},
};

/// One listening socket bound by the master and inherited by workers
/// across fork (and across hot restarts).
pub(crate) enum BoundSocket {
    Tcp(std::net::TcpListener),
    Unix(std::os::unix::net::UnixListener),
}

impl BoundSocket {
    pub(crate) fn try_clone(&self) -> io::Result<Self> {
        match self {
            Self::Tcp(listener) => listener.try_clone().map(Self::Tcp),
            Self::Unix(listener) => listener.try_clone().map(Self::Unix),
        }
    }
}

/// Binds every configured listener. TCP sockets get `SO_REUSEADDR` and a
/// deep backlog; everything ends up non-blocking for the reactor.
pub(crate) fn bind_listeners(runtime: &Runtime) -> Result<Vec<(usize, BoundSocket)>, ServerError> {
    let mut bound = Vec::with_capacity(runtime.listeners.len());
    for (index, spec) in runtime.listeners.iter().enumerate() {
        if spec.url.scheme.is_tls() && runtime.tls_transport.is_none() {
            return Err(ServerError::Config(format!(
                "{} requires a TLS transport adapter and none is configured",
                spec.url
            )));
        }
        let socket = match &spec.url.unix_path {
            Some(path) => bind_unix(path),
            None => bind_tcp(&spec.url.bind_addr()),
        }
        .map_err(|source| ServerError::Bind { url: spec.url.to_string(), source })?;
        info!(listener = %spec.url, "listening");
        bound.push((index, socket));
    }
    Ok(bound)
}

fn bind_tcp(addr: &str) -> io::Result<BoundSocket> {
    let addr = addr
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "unresolvable bind address"))?;
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, None)?;
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;
    socket.set_nonblocking(true)?;
    Ok(BoundSocket::Tcp(socket.into()))
}

fn bind_unix(path: &Path) -> io::Result<BoundSocket> {
    // A stale socket file from a previous run blocks bind.
    let _ = std::fs::remove_file(path);
    let listener = std::os::unix::net::UnixListener::bind(path)?;
    listener.set_nonblocking(true)?;
    Ok(BoundSocket::Unix(listener))
}

/// Everything a worker needs to run, assembled by the supervisor (or by
/// single-process mode) before the reactor starts.
pub(crate) struct WorkerContext {
    pub(crate) runtime: Arc<Runtime>,
    pub(crate) bound: Vec<(usize, BoundSocket)>,
    pub(crate) ipc_path: Option<PathBuf>,
    pub(crate) secret: ClusterSecret,
}

/// Runs one worker to completion. Returns the process exit code: 0 for a
/// graceful stop, nonzero when the master vanished underneath us.
pub(crate) fn run_worker(ctx: WorkerContext) -> Result<i32, ServerError> {
    let runtime = ctx.runtime;
    let pool = AsyncPool::new(runtime.resolved_threads());
    let pubsub = Arc::new(PubSub::default());
    pubsub.attach_history(Arc::new(MemoryHistory::new(MemoryHistoryConfig::default())));
    let shared = Arc::new(WorkerShared { pubsub: pubsub.clone(), pool: pool.handle() });
    register_global_subscriptions(&runtime, &pubsub, &pool);

    let mut reactor = Reactor::new()?;

    for (spec_index, socket) in ctx.bound {
        let spec = &runtime.listeners[spec_index];
        let stack = Arc::new(ListenerStack::build(spec, &runtime.defaults, shared.clone()));
        let acceptor = build_acceptor(socket, spec.url.scheme, spec.url.tls.clone(), stack, &runtime);
        reactor.listen(acceptor)?;
    }

    // Cluster IPC: connect to the master and install the pub/sub uplink.
    let master_gone = Arc::new(AtomicBool::new(false));
    let mut link_id = None;
    if let Some(path) = &ctx.ipc_path {
        let stream = std::os::unix::net::UnixStream::connect(path).map_err(ServerError::Ipc)?;
        stream.set_nonblocking(true).map_err(ServerError::Ipc)?;
        let transport: Box<dyn Transport> =
            Box::new(PlainUnix::new(mio::net::UnixStream::from_std(stream)));
        let gate = UplinkGate::new();
        let proto: Box<dyn Protocol> = Box::new(ClusterLinkProto::new(
            ctx.secret.clone(),
            pubsub.clone(),
            master_gone.clone(),
            gate.clone(),
        ));
        let link = reactor.attach(transport, proto)?;
        install_uplink(&pubsub, reactor.handle(), link, gate);
        link_id = Some(link);
    }

    let term = Arc::new(AtomicBool::new(false));
    let _ = signal_hook::flag::register(signal_hook::consts::SIGTERM, term.clone());
    let _ = signal_hook::flag::register(signal_hook::consts::SIGINT, term.clone());

    runtime.hooks.fire(Lifecycle::OnStart);
    info!(
        threads = runtime.resolved_threads(),
        pid = std::process::id(),
        "worker serving"
    );

    let mut drain_deadline: Option<Instant> = None;
    let mut was_active = true;
    loop {
        if drain_deadline.is_none() && master_gone.load(Ordering::SeqCst) {
            runtime.hooks.fire(Lifecycle::OnParentCrush);
            pool.shutdown();
            return Ok(1);
        }
        if term.load(Ordering::SeqCst) && drain_deadline.is_none() {
            info!("worker draining");
            runtime.hooks.fire(Lifecycle::OnShutdown);
            reactor.begin_shutdown();
            // The IPC link would otherwise hold the connection count above
            // zero for the whole window.
            if let Some(link) = link_id.take() {
                pubsub.set_uplink(None);
                reactor.close(link);
            }
            drain_deadline = Some(Instant::now() + runtime.shutdown_timeout);
        }
        if let Some(deadline) = drain_deadline {
            if reactor.conn_count() == 0 || Instant::now() >= deadline {
                reactor.force_close_all();
                let _ = reactor.turn(Some(Duration::ZERO));
                break;
            }
        }
        reactor.turn(Some(Duration::from_millis(100)))?;

        // Edge-triggered idle hook: fires once per busy → idle transition.
        let active = reactor.conn_count() != 0;
        if !active && was_active && drain_deadline.is_none() {
            runtime.hooks.fire(Lifecycle::OnIdle);
        }
        was_active = active;
    }

    runtime.hooks.fire(Lifecycle::OnStop);
    pool.shutdown();
    runtime.hooks.fire(Lifecycle::OnExit);
    info!("worker stopped");
    Ok(0)
}

/// Global-callback subscriptions live for the whole process; each gets its
/// own serial queue on the async pool, so one callback never runs twice
/// concurrently.
pub(crate) fn register_global_subscriptions(
    runtime: &Runtime,
    pubsub: &Arc<PubSub>,
    pool: &AsyncPool,
) {
    for (channel, callback) in &runtime.global_subscriptions {
        let serializer = Serializer::new(pool.handle());
        let callback = callback.clone();
        let sink: ember_pubsub::SubscriberFn = Arc::new(move |msg| {
            let msg = msg.clone();
            let callback = callback.clone();
            serializer.submit(Box::new(move || callback(&msg)));
        });
        let key = ember_pubsub::ChannelKey::channel(channel.as_bytes().to_vec());
        if channel.contains(['*', '?', '[']) {
            if let Err(err) = pubsub.psubscribe(key, sink, None) {
                debug!(%err, channel, "global pattern subscription rejected");
            }
        } else {
            pubsub.subscribe(key, sink, None);
        }
    }
}

fn build_acceptor(
    socket: BoundSocket,
    scheme: Scheme,
    tls: crate::listener::TlsOptions,
    stack: Arc<ListenerStack>,
    runtime: &Arc<Runtime>,
) -> Box<dyn Acceptor> {
    let tls_factory = runtime.tls_transport.clone();
    match socket {
        BoundSocket::Tcp(listener) => {
            let listener = mio::net::TcpListener::from_std(listener);
            let factory = Box::new(
                move |stream: mio::net::TcpStream, _addr: std::net::SocketAddr| {
                    let transport: Box<dyn Transport> = match (&tls_factory, scheme.is_tls()) {
                        (Some(make), true) => make(stream, &tls),
                        _ => Box::new(PlainTcp::new(stream)),
                    };
                    (transport, make_protocol(scheme, &stack))
                },
            );
            Box::new(TcpAcceptor::new(listener, factory))
        }
        BoundSocket::Unix(listener) => {
            let listener = mio::net::UnixListener::from_std(listener);
            let factory = Box::new(move |stream: mio::net::UnixStream| {
                let transport: Box<dyn Transport> = Box::new(PlainUnix::new(stream));
                (transport, make_protocol(scheme, &stack))
            });
            Box::new(UnixAcceptor::new(listener, factory))
        }
    }
}

fn make_protocol(scheme: Scheme, stack: &Arc<ListenerStack>) -> Box<dyn Protocol> {
    if scheme.is_http() {
        return Box::new(Http1::new(stack.clone()));
    }
    // Raw TCP: the root route's handler owns the whole socket.
    let handler =
        stack.router.lookup("/").cloned().unwrap_or_else(default_handler);
    let shared = stack.shared.clone();
    let high_water = stack.settings.high_water;
    let timeout = stack.settings.keep_alive;
    let make_core = Box::new(move |cx: &mut ember_reactor::ConnCtx<'_>| {
        ConnCore::new(
            cx.handle(),
            cx.id(),
            ConnKind::Raw,
            cx.peer_addr(),
            cx.backlog_gauge(),
            shared.pubsub.clone(),
            Serializer::new(shared.pool.clone()),
            high_water,
        )
    });
    Box::new(RawProto::new(handler, timeout, make_core))
}

/// Runs master and worker as the same process: no fork, no IPC, pub/sub is
/// process-local. This is the development default (`workers == 0`).
pub fn run_single_process(runtime: Runtime) -> Result<(), ServerError> {
    runtime.hooks.fire(Lifecycle::PreStart);
    let runtime = Arc::new(runtime);
    let bound = bind_listeners(&runtime)?;
    let secret = match &runtime.secret {
        Some(secret) => ClusterSecret::new(secret.clone().into_bytes()),
        None => ClusterSecret::from_env(),
    };
    debug!("single-process mode, master == worker");
    let code =
        run_worker(WorkerContext { runtime, bound, ipc_path: None, secret })?;
    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}

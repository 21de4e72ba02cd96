use std::{
    io,
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use ember_cluster::{ClusterSecret, WorkerId};
use ember_pubsub::{MemoryHistory, MemoryHistoryConfig, PubSub};
use ember_reactor::{Acceptor, PlainUnix, Protocol, Reactor, Transport, UnixAcceptor};
use tracing::{error, info, warn};

use crate::{
    ServerError,
    cluster_glue::{BroadcastTx, HubShared, MasterHubProto, inject_broadcast},
    runtime::{Lifecycle, Runtime},
    server::{WorkerContext, bind_listeners, run_single_process, run_worker},
};

/// Minimum pause between respawns of the same worker slot, so a
/// crash-looping app cannot fork-bomb the host.
const RESPAWN_BACKOFF: Duration = Duration::from_secs(1);

struct WorkerSlot {
    pid: libc::pid_t,
    last_spawn: Instant,
}

/// Starts the runtime. With `workers == 0` (after resolution) master and
/// worker share one process; otherwise the master binds the listeners,
/// forks N workers and supervises: respawn on crash, SIGUSR1 hot restart,
/// SIGINT/SIGTERM graceful stop.
pub fn start(runtime: Runtime) -> Result<(), ServerError> {
    // A dead peer must surface as a write error, not a process kill.
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }

    let workers = runtime.resolved_workers();
    if workers == 0 {
        return run_single_process(runtime);
    }

    runtime.hooks.fire(Lifecycle::PreStart);
    let runtime = Arc::new(runtime);
    let bound = bind_listeners(&runtime)?;

    if let Some(pidfile) = &runtime.pidfile {
        std::fs::write(pidfile, format!("{}\n", std::process::id()))
            .map_err(|e| ServerError::Config(format!("pidfile: {e}")))?;
    }

    let secret = match &runtime.secret {
        Some(secret) => ClusterSecret::new(secret.clone().into_bytes()),
        None => ClusterSecret::from_env(),
    };
    let ipc_path = ipc_socket_path();
    let _ = std::fs::remove_file(&ipc_path);
    let ipc_listener =
        std::os::unix::net::UnixListener::bind(&ipc_path).map_err(ServerError::Ipc)?;
    ipc_listener.set_nonblocking(true).map_err(ServerError::Ipc)?;

    // Fork the pool before entering the master loop; children never reach
    // the supervisor code below.
    let mut slots = Vec::with_capacity(workers);
    for _ in 0..workers {
        let slot = spawn_worker(&runtime, &bound, &ipc_path, &secret)?;
        slots.push(slot);
    }

    runtime.hooks.fire(Lifecycle::EnterMaster);
    info!(workers, pid = std::process::id(), "master supervising");

    let outcome = master_loop(&runtime, &bound, ipc_listener, &ipc_path, secret, slots);

    let _ = std::fs::remove_file(&ipc_path);
    if let Some(pidfile) = &runtime.pidfile {
        let _ = std::fs::remove_file(pidfile);
    }
    runtime.hooks.fire(Lifecycle::OnStop);
    runtime.hooks.fire(Lifecycle::OnExit);
    outcome
}

fn ipc_socket_path() -> PathBuf {
    std::env::temp_dir().join(format!("ember-{}.sock", std::process::id()))
}

fn spawn_worker(
    runtime: &Arc<Runtime>,
    bound: &[(usize, crate::server::BoundSocket)],
    ipc_path: &PathBuf,
    secret: &ClusterSecret,
) -> Result<WorkerSlot, ServerError> {
    runtime.hooks.fire(Lifecycle::BeforeFork);

    // The child gets its own clone of every listening socket.
    let mut inherited = Vec::with_capacity(bound.len());
    for (index, socket) in bound {
        inherited.push((
            *index,
            socket.try_clone().map_err(|e| ServerError::Fork(e))?,
        ));
    }

    let pid = unsafe { libc::fork() };
    match pid {
        -1 => Err(ServerError::Fork(io::Error::last_os_error())),
        0 => {
            // Child: run a worker and never return.
            runtime.hooks.fire(Lifecycle::AfterFork);
            runtime.hooks.fire(Lifecycle::EnterChild);
            let context = WorkerContext {
                runtime: runtime.clone(),
                bound: inherited,
                ipc_path: Some(ipc_path.clone()),
                secret: secret.clone(),
            };
            let code = match run_worker(context) {
                Ok(code) => code,
                Err(err) => {
                    error!(%err, "worker failed");
                    err.exit_code()
                }
            };
            std::process::exit(code);
        }
        pid => {
            runtime.hooks.fire(Lifecycle::AfterFork);
            info!(worker = pid, "worker forked");
            Ok(WorkerSlot { pid, last_spawn: Instant::now() })
        }
    }
}

#[allow(clippy::too_many_lines)]
fn master_loop(
    runtime: &Arc<Runtime>,
    bound: &[(usize, crate::server::BoundSocket)],
    ipc_listener: std::os::unix::net::UnixListener,
    ipc_path: &PathBuf,
    secret: ClusterSecret,
    mut slots: Vec<WorkerSlot>,
) -> Result<(), ServerError> {
    let term = Arc::new(AtomicBool::new(false));
    let usr1 = Arc::new(AtomicBool::new(false));
    let _ = signal_hook::flag::register(signal_hook::consts::SIGTERM, term.clone());
    let _ = signal_hook::flag::register(signal_hook::consts::SIGINT, term.clone());
    let _ = signal_hook::flag::register(signal_hook::consts::SIGUSR1, usr1.clone());

    // The master serves no connections; its reactor runs only the IPC hub
    // (and the optional cross-host broadcast bridge).
    let mut reactor = Reactor::new()?;
    let pubsub = Arc::new(PubSub::default());
    pubsub.attach_history(Arc::new(MemoryHistory::new(MemoryHistoryConfig::default())));
    // The master runs no async pool; its global callbacks execute inline.
    let inline_pool = crate::workers::AsyncPool::new(0);
    crate::server::register_global_subscriptions(runtime, &pubsub, &inline_pool);
    let hub = HubShared::new(secret.clone(), pubsub);
    hub.install_master_uplink(reactor.handle());

    let next_worker_id = Arc::new(AtomicU64::new(1));
    let acceptor: Box<dyn Acceptor> = {
        let hub = hub.clone();
        let next = next_worker_id.clone();
        let factory = Box::new(move |stream: mio::net::UnixStream| {
            let transport: Box<dyn Transport> = Box::new(PlainUnix::new(stream));
            let wid = WorkerId(next.fetch_add(1, Ordering::Relaxed));
            let proto: Box<dyn Protocol> = Box::new(MasterHubProto::new(hub.clone(), wid));
            (transport, proto)
        });
        Box::new(UnixAcceptor::new(
            mio::net::UnixListener::from_std(ipc_listener),
            factory,
        ))
    };
    reactor.listen(acceptor)?;

    let _broadcast_bridge = start_broadcast_bridge(runtime, &secret, &hub, &reactor);

    runtime.hooks.fire(Lifecycle::OnStart);

    loop {
        if term.load(Ordering::SeqCst) {
            info!("master stopping, terminating workers");
            runtime.hooks.fire(Lifecycle::OnShutdown);
            stop_workers(&mut slots, runtime.shutdown_timeout);
            return Ok(());
        }

        if usr1.swap(false, Ordering::SeqCst) {
            hot_restart(runtime, bound, ipc_path, &secret, &mut slots)?;
        }

        reap_and_respawn(runtime, bound, ipc_path, &secret, &mut slots)?;
        reactor.turn(Some(Duration::from_millis(100)))?;
    }
}

/// SIGUSR1: re-fork workers one at a time. The listening sockets stay open
/// in the master, so no connection is ever refused during the roll.
fn hot_restart(
    runtime: &Arc<Runtime>,
    bound: &[(usize, crate::server::BoundSocket)],
    ipc_path: &PathBuf,
    secret: &ClusterSecret,
    slots: &mut [WorkerSlot],
) -> Result<(), ServerError> {
    info!("hot restart: rolling the worker pool");
    for slot in slots.iter_mut() {
        unsafe {
            libc::kill(slot.pid, libc::SIGTERM);
        }
        wait_for_exit(slot.pid, runtime.shutdown_timeout + Duration::from_secs(1));
        *slot = spawn_worker(runtime, bound, ipc_path, secret)?;
    }
    Ok(())
}

fn reap_and_respawn(
    runtime: &Arc<Runtime>,
    bound: &[(usize, crate::server::BoundSocket)],
    ipc_path: &PathBuf,
    secret: &ClusterSecret,
    slots: &mut [WorkerSlot],
) -> Result<(), ServerError> {
    loop {
        let mut status = 0;
        let pid = unsafe { libc::waitpid(-1, &mut status, libc::WNOHANG) };
        if pid <= 0 {
            return Ok(());
        }
        let Some(slot) = slots.iter_mut().find(|s| s.pid == pid) else {
            continue;
        };
        warn!(worker = pid, status, "worker exited, respawning");
        runtime.hooks.fire(Lifecycle::OnChildCrush);

        // Backoff keeps a crash loop from hot-spinning the fork path.
        let since = slot.last_spawn.elapsed();
        if since < RESPAWN_BACKOFF {
            std::thread::sleep(RESPAWN_BACKOFF - since);
        }
        *slot = spawn_worker(runtime, bound, ipc_path, secret)?;
    }
}

/// Graceful stop: SIGTERM everyone, give them the drain window, then make
/// sure with SIGKILL.
fn stop_workers(slots: &mut Vec<WorkerSlot>, window: Duration) {
    for slot in slots.iter() {
        unsafe {
            libc::kill(slot.pid, libc::SIGTERM);
        }
    }
    let deadline = Instant::now() + window + Duration::from_secs(1);
    for slot in slots.drain(..) {
        if !wait_until(slot.pid, deadline) {
            warn!(worker = slot.pid, "worker ignored the drain window, killing");
            unsafe {
                libc::kill(slot.pid, libc::SIGKILL);
            }
            let mut status = 0;
            unsafe {
                libc::waitpid(slot.pid, &mut status, 0);
            }
        }
    }
}

fn wait_for_exit(pid: libc::pid_t, window: Duration) {
    let deadline = Instant::now() + window;
    if !wait_until(pid, deadline) {
        unsafe {
            libc::kill(pid, libc::SIGKILL);
        }
        let mut status = 0;
        unsafe {
            libc::waitpid(pid, &mut status, 0);
        }
    }
}

/// Polls `waitpid` until the deadline. True when the child was reaped.
fn wait_until(pid: libc::pid_t, deadline: Instant) -> bool {
    loop {
        let mut status = 0;
        let got = unsafe { libc::waitpid(pid, &mut status, libc::WNOHANG) };
        if got == pid {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
}

/// Optional cross-host bridge: publishes leaving this cluster ride UDP
/// broadcast datagrams; inbound (verified) datagrams fan into the hub.
fn start_broadcast_bridge(
    runtime: &Arc<Runtime>,
    secret: &ClusterSecret,
    hub: &Arc<HubShared>,
    reactor: &Reactor,
) -> Option<std::thread::JoinHandle<()>> {
    let port = runtime.broadcast_port?;
    let socket = match std::net::UdpSocket::bind(("0.0.0.0", port)) {
        Ok(socket) => socket,
        Err(err) => {
            warn!(%err, port, "cluster: broadcast bind failed, cross-host disabled");
            return None;
        }
    };
    let _ = socket.set_broadcast(true);
    if let Ok(tx_socket) = socket.try_clone() {
        hub.enable_broadcast(BroadcastTx {
            socket: tx_socket,
            target: std::net::SocketAddr::from(([255, 255, 255, 255], port)),
        });
    }
    let secret = secret.clone();
    let hub = hub.clone();
    let handle = reactor.handle();
    let thread = std::thread::Builder::new()
        .name("ember-broadcast".into())
        .spawn(move || {
            let mut buf = vec![0u8; 64 * 1024];
            // A hostile or misconfigured LAN peer can spray garbage; keep
            // the log readable.
            let mut bad_datagram_log = ember_reactor::Repeater::every(Duration::from_secs(10));
            loop {
                match socket.recv_from(&mut buf) {
                    Ok((len, peer)) => {
                        match ember_cluster::decode_datagram(&secret, &buf[..len]) {
                            Some(record) => {
                                let hub = hub.clone();
                                let handle2 = handle.clone();
                                handle.defer(move |_| {
                                    inject_broadcast(&hub, &handle2, record);
                                });
                            }
                            None => {
                                if bad_datagram_log.fired() {
                                    warn!(?peer, "cluster: unverified broadcast datagram dropped");
                                }
                            }
                        }
                    }
                    Err(err) => {
                        warn!(%err, "cluster: broadcast receive failed");
                        return;
                    }
                }
            }
        })
        .ok();
    info!(port, "cluster: cross-host broadcast enabled");
    thread
}

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use ember_cluster::{
    ClusterSecret, HubAction, LinkAction, MasterHub, Record, RecordKind, WireError, WorkerId,
    WorkerLink, decode,
};
use ember_pubsub::{Message, PubSub, Target, UplinkOp};
use ember_reactor::{ConnCtx, ConnId, Packet, Protocol, ReactorHandle};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

/// Buffers uplink records until the HELLO/AUTH exchange completes, so a
/// subscription registered at worker startup never races the handshake.
pub(crate) struct UplinkGate {
    authed: AtomicBool,
    pending: Mutex<Vec<Vec<u8>>>,
}

impl UplinkGate {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self { authed: AtomicBool::new(false), pending: Mutex::new(Vec::new()) })
    }

    fn forward_or_hold(&self, handle: &ReactorHandle, link: ConnId, bytes: Vec<u8>) {
        if self.authed.load(Ordering::Acquire) {
            handle.write2(link, Packet::from_vec(bytes));
        } else {
            self.pending.lock().push(bytes);
        }
    }

    fn open(&self, cx: &mut ConnCtx<'_>) {
        self.authed.store(true, Ordering::Release);
        for bytes in self.pending.lock().drain(..) {
            cx.write(Packet::from_vec(bytes));
        }
    }
}

/// Worker-side IPC binding: authenticates against the master's challenge,
/// injects inbound PUBLISH records into the local channel table, and (via
/// the uplink installed on [`PubSub`]) carries local changes upstream.
pub(crate) struct ClusterLinkProto {
    link: WorkerLink,
    buffer: Vec<u8>,
    pubsub: Arc<PubSub>,
    master_gone: Arc<AtomicBool>,
    gate: Arc<UplinkGate>,
}

impl ClusterLinkProto {
    pub(crate) fn new(
        secret: ClusterSecret,
        pubsub: Arc<PubSub>,
        master_gone: Arc<AtomicBool>,
        gate: Arc<UplinkGate>,
    ) -> Self {
        Self { link: WorkerLink::new(secret), buffer: Vec::new(), pubsub, master_gone, gate }
    }
}

/// Liveness interval for the worker → master PING probe.
const LINK_PING_INTERVAL: std::time::Duration = std::time::Duration::from_secs(30);

impl Protocol for ClusterLinkProto {
    fn on_open(&mut self, cx: &mut ConnCtx<'_>) {
        cx.set_timeout(Some(LINK_PING_INTERVAL));
    }

    fn on_timeout(&mut self, cx: &mut ConnCtx<'_>) {
        // Quiet link: probe the master instead of closing.
        cx.write(Packet::from_vec(self.link.ping()));
        cx.touch();
    }

    fn on_data(&mut self, cx: &mut ConnCtx<'_>, buf: &mut Vec<u8>) {
        if self.buffer.is_empty() {
            std::mem::swap(&mut self.buffer, buf);
        } else {
            self.buffer.extend_from_slice(buf);
            buf.clear();
        }
        loop {
            match decode(&self.buffer) {
                Ok(Some((record, used))) => {
                    self.buffer.drain(..used);
                    let was_authed = self.link.authed();
                    match self.link.on_record(record) {
                        LinkAction::Reply(bytes) => cx.write(Packet::from_vec(bytes)),
                        LinkAction::Deliver(record) => {
                            let msg =
                                Message::remote(record.channel, record.filter, record.payload);
                            self.pubsub.publish_remote(&msg);
                        }
                        LinkAction::Ignore => {}
                    }
                    if !was_authed && self.link.authed() {
                        self.gate.open(cx);
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    warn!(%err, "cluster: master sent an invalid record");
                    cx.close_now();
                    return;
                }
            }
        }
    }

    fn on_close(&mut self, _id: ConnId) {
        // Pub/sub devolves to local-only; the worker exits and the
        // supervisor (or init) restarts the tree.
        warn!("cluster: IPC link lost");
        self.pubsub.set_uplink(None);
        self.master_gone.store(true, Ordering::SeqCst);
    }
}

/// Installs the worker's uplink: local subscription changes and
/// cluster-scoped publishes become wire records to the master.
pub(crate) fn install_uplink(
    pubsub: &Arc<PubSub>,
    handle: ReactorHandle,
    link: ConnId,
    gate: Arc<UplinkGate>,
) {
    pubsub.set_uplink(Some(Box::new(move |op: UplinkOp| {
        let bytes = match op {
            UplinkOp::Subscribe(key, pattern) => {
                WorkerLink::subscription(key.channel, pattern, true)
            }
            UplinkOp::Unsubscribe(key, pattern) => {
                WorkerLink::subscription(key.channel, pattern, false)
            }
            UplinkOp::Publish(target, msg) => {
                let kind = publish_kind(target);
                WorkerLink::publish(kind, msg.channel.clone(), msg.payload.clone())
            }
        };
        gate.forward_or_hold(&handle, link, bytes);
    })));
}

fn publish_kind(target: Target) -> RecordKind {
    match target {
        Target::Siblings => RecordKind::PublishSiblings,
        Target::Root => RecordKind::PublishRoot,
        _ => RecordKind::Publish,
    }
}

/// Outbound cross-host fan-out: datagrams leave through this socket,
/// signed with the cluster secret.
pub(crate) struct BroadcastTx {
    pub(crate) socket: std::net::UdpSocket,
    pub(crate) target: std::net::SocketAddr,
}

/// Shared master-side state: the hub plus the worker-id → connection map
/// the hub's actions are routed through.
pub(crate) struct HubShared {
    pub(crate) hub: Mutex<MasterHub>,
    pub(crate) conns: Mutex<HashMap<WorkerId, ConnId>>,
    pub(crate) pubsub: Arc<PubSub>,
    secret: ClusterSecret,
    broadcast: Mutex<Option<BroadcastTx>>,
}

impl HubShared {
    pub(crate) fn new(secret: ClusterSecret, pubsub: Arc<PubSub>) -> Arc<Self> {
        Arc::new(Self {
            hub: Mutex::new(MasterHub::new(secret.clone())),
            conns: Mutex::new(HashMap::new()),
            pubsub,
            secret,
            broadcast: Mutex::new(None),
        })
    }

    pub(crate) fn enable_broadcast(&self, tx: BroadcastTx) {
        *self.broadcast.lock() = Some(tx);
    }

    /// Ships a cluster-scoped publish to other hosts, best-effort.
    pub(crate) fn maybe_broadcast(&self, record: &Record) {
        if record.kind != RecordKind::Publish {
            return;
        }
        let guard = self.broadcast.lock();
        if let Some(tx) = guard.as_ref() {
            let datagram = ember_cluster::encode_datagram(&self.secret, record);
            if let Err(err) = tx.socket.send_to(&datagram, tx.target) {
                debug!(%err, "cluster: broadcast send failed");
            }
        }
    }

    pub(crate) fn apply(&self, actions: Vec<HubAction>, handle: &ReactorHandle) {
        for action in actions {
            match action {
                HubAction::Send(wid, bytes) => {
                    if let Some(conn) = self.conns.lock().get(&wid) {
                        handle.write2(*conn, Packet::from_vec(bytes));
                    }
                }
                HubAction::Drop(wid) => {
                    if let Some(conn) = self.conns.lock().remove(&wid) {
                        handle.close(conn);
                    }
                }
                HubAction::DeliverLocal(record) => {
                    let msg = Message::remote(record.channel, record.filter, record.payload);
                    self.pubsub.publish_remote(&msg);
                }
            }
        }
    }

    /// Uplink for the master's own publishes: fan out to subscribed
    /// workers directly.
    pub(crate) fn install_master_uplink(self: &Arc<Self>, handle: ReactorHandle) {
        let shared = self.clone();
        self.pubsub.set_uplink(Some(Box::new(move |op: UplinkOp| {
            if let UplinkOp::Publish(target, msg) = op {
                if target == Target::Root {
                    // Already local to the master.
                    return;
                }
                let record = Record::publish(
                    RecordKind::Publish,
                    msg.channel.clone(),
                    msg.filter,
                    msg.payload.clone(),
                );
                shared.maybe_broadcast(&record);
                let actions = shared.hub.lock().broadcast(&record);
                shared.apply(actions, &handle);
            }
        })));
    }
}

/// Master-side IPC binding, one per worker connection.
pub(crate) struct MasterHubProto {
    shared: Arc<HubShared>,
    wid: WorkerId,
    buffer: Vec<u8>,
}

impl MasterHubProto {
    pub(crate) fn new(shared: Arc<HubShared>, wid: WorkerId) -> Self {
        Self { shared, wid, buffer: Vec::new() }
    }
}

impl Protocol for MasterHubProto {
    fn on_open(&mut self, cx: &mut ConnCtx<'_>) {
        let hello = self.shared.hub.lock().worker_connected(self.wid);
        self.shared.conns.lock().insert(self.wid, cx.id());
        cx.write(Packet::from_vec(hello));
        debug!(worker = self.wid.0, "cluster: worker channel up");
    }

    fn on_data(&mut self, cx: &mut ConnCtx<'_>, buf: &mut Vec<u8>) {
        if self.buffer.is_empty() {
            std::mem::swap(&mut self.buffer, buf);
        } else {
            self.buffer.extend_from_slice(buf);
            buf.clear();
        }
        let handle = cx.handle();
        loop {
            match decode(&self.buffer) {
                Ok(Some((record, used))) => {
                    self.buffer.drain(..used);
                    // Only authenticated workers reach other hosts.
                    if self.shared.hub.lock().is_authed(self.wid) {
                        self.shared.maybe_broadcast(&record);
                    }
                    let actions = self.shared.hub.lock().on_record(self.wid, record);
                    self.shared.apply(actions, &handle);
                }
                Ok(None) => break,
                Err(err) => {
                    handle_wire_error(&err, self.wid);
                    cx.close_now();
                    return;
                }
            }
        }
    }

    fn on_close(&mut self, _id: ConnId) {
        info!(worker = self.wid.0, "cluster: worker channel down");
        self.shared.conns.lock().remove(&self.wid);
        self.shared.hub.lock().worker_disconnected(self.wid);
    }
}

fn handle_wire_error(err: &WireError, wid: WorkerId) {
    warn!(%err, worker = wid.0, "cluster: dropping worker after protocol error");
}

/// Converts a broadcast-received record into hub fan-out plus local
/// delivery (cross-host UDP path). Never re-broadcast: datagrams fan out
/// exactly one hop.
pub(crate) fn inject_broadcast(shared: &Arc<HubShared>, handle: &ReactorHandle, record: Record) {
    let mut actions = shared.hub.lock().broadcast(&record);
    actions.push(HubAction::DeliverLocal(record));
    shared.apply(actions, handle);
}

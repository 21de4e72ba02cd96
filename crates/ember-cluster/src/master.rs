use std::collections::{HashMap, HashSet};

use bytes::Bytes;
use tracing::{debug, info, warn};

use crate::{
    ClusterSecret, Record, RecordKind,
    auth::CHALLENGE_LEN,
};

/// Master-side identifier of one worker IPC connection.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct WorkerId(pub u64);

/// What the hub wants done after consuming a record.
#[derive(Debug, PartialEq, Eq)]
pub enum HubAction {
    /// Write these bytes to the worker's IPC connection.
    Send(WorkerId, Vec<u8>),
    /// Authentication failed or the peer misbehaved; drop the connection.
    Drop(WorkerId),
    /// Deliver this publish to the master's own subscription table.
    DeliverLocal(Record),
}

struct WorkerState {
    authed: bool,
    challenge: [u8; CHALLENGE_LEN],
    /// Exact channel subscriptions this worker holds.
    channels: HashSet<Bytes>,
    /// Pattern subscriptions, compiled for forward-time matching.
    patterns: Vec<(Bytes, glob::Pattern)>,
}

/// The master's view of the cluster: per-worker subscription sets and
/// PUBLISH forwarding, filtered so a worker only sees channels it
/// subscribed to.
#[derive(Default)]
pub struct MasterHub {
    secret: Option<ClusterSecret>,
    workers: HashMap<WorkerId, WorkerState>,
}

impl MasterHub {
    pub fn new(secret: ClusterSecret) -> Self {
        Self { secret: Some(secret), workers: HashMap::new() }
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// True once the worker passed the HELLO/AUTH exchange.
    pub fn is_authed(&self, id: WorkerId) -> bool {
        self.workers.get(&id).is_some_and(|w| w.authed)
    }

    /// Registers a fresh IPC connection and returns the HELLO challenge to
    /// send it.
    pub fn worker_connected(&mut self, id: WorkerId) -> Vec<u8> {
        let challenge = ClusterSecret::fresh_challenge();
        self.workers.insert(id, WorkerState {
            authed: false,
            challenge,
            channels: HashSet::new(),
            patterns: Vec::new(),
        });
        Record::control(RecordKind::Hello, challenge.to_vec()).to_bytes()
    }

    /// Worker IPC drop: all subscriptions owned by the worker are gone.
    pub fn worker_disconnected(&mut self, id: WorkerId) {
        if let Some(state) = self.workers.remove(&id) {
            info!(
                worker = id.0,
                channels = state.channels.len(),
                patterns = state.patterns.len(),
                "cluster: worker detached, subscriptions cancelled"
            );
        }
    }

    pub fn on_record(&mut self, from: WorkerId, record: Record) -> Vec<HubAction> {
        let Some(state) = self.workers.get_mut(&from) else {
            return vec![HubAction::Drop(from)];
        };

        if !state.authed {
            return self.authenticate(from, &record);
        }

        match record.kind {
            RecordKind::Subscribe => {
                state.channels.insert(record.channel);
                Vec::new()
            }
            RecordKind::Unsubscribe => {
                state.channels.remove(&record.channel);
                Vec::new()
            }
            RecordKind::PSubscribe => {
                match compile_pattern(&record.channel) {
                    Some(pattern) => state.patterns.push((record.channel, pattern)),
                    None => debug!(worker = from.0, "cluster: unusable pattern ignored"),
                }
                Vec::new()
            }
            RecordKind::PUnsubscribe => {
                state.patterns.retain(|(source, _)| *source != record.channel);
                Vec::new()
            }
            RecordKind::Ping => {
                vec![HubAction::Send(from, Record::control(RecordKind::Pong, Bytes::new()).to_bytes())]
            }
            RecordKind::Pong => Vec::new(),

            RecordKind::Publish => {
                let mut actions = self.forward(from, &record);
                actions.push(HubAction::DeliverLocal(record));
                actions
            }
            RecordKind::PublishSiblings => {
                // Siblings: every process except the publisher, master
                // included.
                let mut actions = self.forward(from, &record);
                actions.push(HubAction::DeliverLocal(record));
                actions
            }
            RecordKind::PublishRoot => vec![HubAction::DeliverLocal(record)],

            RecordKind::Hello | RecordKind::Auth => {
                warn!(worker = from.0, "cluster: handshake record after auth");
                vec![HubAction::Drop(from)]
            }
        }
    }

    /// Master-originated publish (its own process published with a
    /// cluster-wide scope): forward to every subscribed worker.
    pub fn broadcast(&mut self, record: &Record) -> Vec<HubAction> {
        self.forward(WorkerId(u64::MAX), record)
    }

    fn authenticate(&mut self, from: WorkerId, record: &Record) -> Vec<HubAction> {
        let Some(state) = self.workers.get_mut(&from) else {
            return vec![HubAction::Drop(from)];
        };
        let verified = record.kind == RecordKind::Auth
            && self
                .secret
                .as_ref()
                .is_none_or(|secret| secret.verify(&state.challenge, &record.payload));
        if !verified {
            warn!(worker = from.0, "cluster: authentication rejected");
            self.workers.remove(&from);
            return vec![HubAction::Drop(from)];
        }
        state.authed = true;
        debug!(worker = from.0, "cluster: worker authenticated");
        Vec::new()
    }

    fn forward(&self, origin: WorkerId, record: &Record) -> Vec<HubAction> {
        let mut actions = Vec::new();
        let channel_text = std::str::from_utf8(&record.channel).ok();
        for (id, state) in &self.workers {
            if *id == origin || !state.authed {
                continue;
            }
            let wants = state.channels.contains(&record.channel)
                || channel_text.is_some_and(|text| {
                    state.patterns.iter().any(|(_, pattern)| pattern.matches(text))
                });
            if wants {
                actions.push(HubAction::Send(*id, record.to_bytes()));
            }
        }
        actions
    }
}

fn compile_pattern(source: &Bytes) -> Option<glob::Pattern> {
    let text = std::str::from_utf8(source).ok()?;
    glob::Pattern::new(text).ok()
}

use bytes::Bytes;
use tracing::warn;

use crate::{ClusterSecret, Record, RecordKind};

/// What the worker's IPC link wants done after consuming a record.
#[derive(Debug, PartialEq, Eq)]
pub enum LinkAction {
    /// Write these bytes back to the master.
    Reply(Vec<u8>),
    /// Inject this publish into the local channel table.
    Deliver(Record),
    Ignore,
}

/// Worker-side IPC state machine: answers the HELLO challenge, then turns
/// inbound PUBLISH records into local deliveries.
pub struct WorkerLink {
    secret: ClusterSecret,
    authed: bool,
}

impl WorkerLink {
    pub fn new(secret: ClusterSecret) -> Self {
        Self { secret, authed: false }
    }

    #[inline]
    pub fn authed(&self) -> bool {
        self.authed
    }

    pub fn on_record(&mut self, record: Record) -> LinkAction {
        match record.kind {
            RecordKind::Hello => {
                let tag = self.secret.sign(&record.payload);
                self.authed = true;
                LinkAction::Reply(Record::control(RecordKind::Auth, tag.to_vec()).to_bytes())
            }
            RecordKind::Publish | RecordKind::PublishSiblings | RecordKind::PublishRoot => {
                LinkAction::Deliver(record)
            }
            RecordKind::Ping => {
                LinkAction::Reply(Record::control(RecordKind::Pong, Bytes::new()).to_bytes())
            }
            RecordKind::Pong => LinkAction::Ignore,
            kind => {
                warn!(?kind, "cluster: unexpected record from master");
                LinkAction::Ignore
            }
        }
    }

    /// Encodes the liveness probe the worker sends on its ping interval.
    pub fn ping(&self) -> Vec<u8> {
        Record::control(RecordKind::Ping, Bytes::new()).to_bytes()
    }

    /// Encodes a subscription change for the master's per-worker set.
    pub fn subscription(channel: Bytes, pattern: bool, subscribe: bool) -> Vec<u8> {
        let kind = match (pattern, subscribe) {
            (false, true) => RecordKind::Subscribe,
            (false, false) => RecordKind::Unsubscribe,
            (true, true) => RecordKind::PSubscribe,
            (true, false) => RecordKind::PUnsubscribe,
        };
        Record::channel_op(kind, channel, 0).to_bytes()
    }

    /// Encodes an outbound publish with its scope kind.
    pub fn publish(kind: RecordKind, channel: Bytes, payload: Bytes) -> Vec<u8> {
        Record::publish(kind, channel, 0, payload).to_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MasterHub;

    #[test]
    fn link_answers_challenge_that_the_hub_accepts() {
        let secret = ClusterSecret::new(b"shared".to_vec());
        let mut hub = MasterHub::new(secret.clone());
        let mut link = WorkerLink::new(secret);

        let id = crate::WorkerId(1);
        let hello = hub.worker_connected(id);
        let (hello_record, _) = crate::wire::decode(&hello).unwrap().unwrap();

        let LinkAction::Reply(auth) = link.on_record(hello_record) else {
            panic!("link must answer the challenge");
        };
        let (auth_record, _) = crate::wire::decode(&auth).unwrap().unwrap();
        assert!(hub.on_record(id, auth_record).is_empty(), "auth accepted");
        assert!(link.authed());
    }

    #[test]
    fn inbound_publish_is_delivered() {
        let mut link = WorkerLink::new(ClusterSecret::random());
        let publish = Record::publish(
            RecordKind::Publish,
            Bytes::from_static(b"room"),
            0,
            Bytes::from_static(b"hi"),
        );
        assert_eq!(link.on_record(publish.clone()), LinkAction::Deliver(publish));
    }

    #[test]
    fn ping_gets_ponged() {
        let mut link = WorkerLink::new(ClusterSecret::random());
        let LinkAction::Reply(wire) = link.on_record(Record::control(RecordKind::Ping, Bytes::new()))
        else {
            panic!()
        };
        let (pong, _) = crate::wire::decode(&wire).unwrap().unwrap();
        assert_eq!(pong.kind, RecordKind::Pong);
    }
}

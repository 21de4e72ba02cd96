//! Cluster IPC: the master-arbitrated pub/sub bridge between workers.
//!
//! Wire format, HMAC connect authentication, the master-side hub (per-worker
//! subscription sets, filtered PUBLISH forwarding) and the worker-side link
//! are all plain state machines here; the runtime crate binds them to Unix
//! sockets through the reactor.

mod auth;
mod broadcast;
mod master;
mod wire;
mod worker;

pub use auth::ClusterSecret;
pub use broadcast::{decode_datagram, encode_datagram};
pub use master::{HubAction, MasterHub, WorkerId};
pub use wire::{MAX_RECORD_PAYLOAD, Record, RecordKind, WireError, decode, encode};
pub use worker::{LinkAction, WorkerLink};

//! ember: a clustered HTTP/1.1 + WebSocket + SSE runtime.
//!
//! One master process supervises N workers; each worker multiplexes its
//! connections on a single-threaded reactor and runs handler callbacks on a
//! bounded async pool. Pub/sub fan-out crosses process boundaries through a
//! master-arbitrated Unix-socket channel.
//!
//! The crate assembles the protocol crates (`ember-http`, `ember-ws`,
//! `ember-pubsub`, `ember-cluster`) on top of `ember-reactor` and exposes
//! the handler-facing surface: [`Handler`], [`HttpConn`], [`Conn`] and the
//! [`Runtime`] configuration.

mod cluster_glue;
mod connection;
mod error;
mod handler;
mod listener;
mod proto;
mod runtime;
mod server;
mod supervisor;
mod workers;

pub use connection::{Conn, ConnKind, HttpConn};
pub use ember_http::{Body, HttpLimits, StaticSettings};
pub use ember_pubsub::{Message, ReplayFrom, Target};
pub use error::ServerError;
pub use handler::Handler;
pub use listener::{ListenError, ListenerUrl, Scheme, TlsOptions};
pub use runtime::{
    GlobalSubscriber, Lifecycle, LifecycleHooks, ListenerSettings, ListenerSpec, Runtime,
    TlsTransportFactory,
};
pub use server::run_single_process;
pub use supervisor::start;

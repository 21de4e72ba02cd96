//! Single-threaded cooperative I/O reactor.
//!
//! One reactor runs per worker process and multiplexes every socket the
//! worker owns. Protocol state machines attach to connections through the
//! [`Protocol`] trait; other threads reach the reactor through a cloneable
//! [`ReactorHandle`] that queues operations and wakes the poll.

mod accept;
mod defer;
mod handle;
mod packet;
mod protocol;
mod reactor;
mod socket;
mod timer;
mod transport;

pub use accept::{Acceptor, TcpAcceptor, UnixAcceptor};
pub use defer::DEFER_TURN_BUDGET;
pub use handle::ConnId;
pub use packet::Packet;
pub use protocol::{Note, Protocol};
pub use reactor::{ConnCtx, ListenerId, Reactor, ReactorError, ReactorHandle, Task};
pub use timer::{Repeater, TimerOutcome};
pub use transport::{PlainTcp, PlainUnix, Transport};

//! Process-local publish/subscribe core.
//!
//! A per-process [`ChannelTable`] maps `(channel, filter)` keys and glob
//! patterns to subscriptions; [`PubSub`] layers fan-out scopes, pluggable
//! engines and history replay on top. Cross-process distribution is the
//! cluster crate's business: it plugs in through [`PubSub::set_uplink`].

mod engine;
mod history;
mod message;
mod table;

pub use engine::{Engine, PubSub, Target, UplinkOp};
pub use history::{HistoryManager, MemoryHistory, MemoryHistoryConfig, ReplayFrom};
pub use message::Message;
pub use table::{
    ChannelKey, ChannelTable, SubscribeError, SubscriberFn, SubscriptionId, UnsubscribeFn,
};

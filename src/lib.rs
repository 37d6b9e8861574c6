//! Public interface to the shardcast core library: a shard-scoped,
//! totally-ordered atomic multicast engine with SST-driven membership
//! management and optional append-only persistence of delivered messages.

#![allow(clippy::uninlined_format_args)]

#[macro_use]
mod utils;

mod group;
mod multicast;
mod persist;
mod sst;
mod view;

pub use group::{CallbackSet, Group, GroupConfig, SendOptions};
pub use multicast::{Medium, Mode, NodeId, SendBuffer, SubgroupId};
pub use utils::ShardcastError;
pub use view::{
    load_view, persist_view, Contact, StateCapability, StateFactory,
    StateRegistry, SubgroupInfo, SubgroupSpec, View,
};

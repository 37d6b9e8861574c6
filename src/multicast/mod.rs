//! The per-subgroup send/receive/order/deliver pipeline and its two
//! transport paths (bulk transfer + SST slots).

mod bulk;
mod group;
mod message;

/// Stable, globally unique identifier of one participant.
pub type NodeId = u32;

/// Dense identifier of one logical replicated object's shard; scoped to a
/// view.
pub type SubgroupId = usize;

/// Delivery discipline of a subgroup.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum Mode {
    /// Totally-ordered atomic multicast gated on shard-wide stability.
    Ordered,

    /// Immediate delivery on receipt; no stability or delivery tracking.
    Raw,
}

/// Transport path selection for one send.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum Medium {
    /// Bulk transfer through a pooled registered buffer.
    Bulk,

    /// Small-message path through a fixed-size SST row slot.
    Slot,
}

pub use group::SendBuffer;

pub(crate) use bulk::BulkHub;
pub(crate) use group::{
    DeliveryCallbacks, GroupParams, MulticastGroup, SubgroupSettings,
};
pub(crate) use message::HEADER_SIZE;

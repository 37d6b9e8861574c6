//! The shared-state table (SST): a replicated row-per-member table with
//! one-sided remote writes and registrable recurrent predicates.

mod exchange;
mod layout;
mod predicates;
mod table;

pub(crate) use layout::{LayoutParams, RowLayout};
pub(crate) use predicates::{PredHandle, PredicateKind};
pub(crate) use table::{SharedStateTable, SstSnapshot};

#[cfg(test)]
pub(crate) mod tests_support {
    use std::sync::Arc;

    use super::{LayoutParams, RowLayout, SharedStateTable};

    /// Builds a single-member table on the given localhost port, for tests
    /// that only need a live table instance.
    pub(crate) async fn lone_table(port: u16) -> Arc<SharedStateTable> {
        let layout = RowLayout::new(LayoutParams {
            num_members: 1,
            change_capacity: 2,
            contact_capacity: 64,
            total_senders: 1,
            num_subgroups: 1,
            window_size: 3,
            max_slot_msg_size: 64,
        });
        let addrs = vec![format!("127.0.0.1:{}", port).parse().unwrap()];
        SharedStateTable::new_and_setup(0, 0, &addrs, layout)
            .await
            .unwrap()
    }
}

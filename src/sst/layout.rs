//! Fixed byte layout of one shared-state table row.
//!
//! Every member's row is a flat byte buffer; remote writes replicate a byte
//! range of the writer's own row at identical offsets on every reader. All
//! multi-byte fields are little-endian.
//!
//! Per-row column order:
//! `vid:i32 | suspected:u8[N] | changes:u32[C] | joiner_ids:u32[C]
//!  | joiner_contacts:u8[C*K] | n_changes:i32 | n_committed:i32
//!  | n_acked:i32 | n_installed:i32 | num_received:i64[S]
//!  | num_received_sst:i64[S] | seq_num:i64[G] | stable_num:i64[G]
//!  | delivered_num:i64[G] | persisted_num:i64[G]
//!  | slots:{next_seq:i64, size:i32, buf:u8[MAXMSG]}[G*W] | heartbeat:u8[N]
//!  | global_min:i64[S] | global_min_ready:u8[G]`
//! where N = members, C = change capacity, K = contact string capacity,
//! S = total shard senders across subgroups, G = total subgroups and
//! W = window size.

use std::ops::Range;

/// Sizing parameters from which all row offsets derive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct LayoutParams {
    /// Number of members in the current view (N).
    pub num_members: usize,

    /// Capacity of the pending-changes arrays (C).
    pub change_capacity: usize,

    /// Bytes reserved for each joiner contact string (K).
    pub contact_capacity: usize,

    /// Total count of shard senders summed across subgroups (S).
    pub total_senders: usize,

    /// Total number of subgroups (G).
    pub num_subgroups: usize,

    /// Send window size (W).
    pub window_size: usize,

    /// Size of one slot payload buffer, message header included (MAXMSG).
    pub max_slot_msg_size: usize,
}

/// Byte extent of one slot: `next_seq:i64 | size:i32 | buf[MAXMSG]`.
#[inline]
fn slot_extent(params: &LayoutParams) -> usize {
    8 + 4 + params.max_slot_msg_size
}

/// Computed fixed offsets of every column in a row.
#[derive(Debug, Clone)]
pub(crate) struct RowLayout {
    pub params: LayoutParams,

    vid_off: usize,
    suspected_off: usize,
    changes_off: usize,
    joiner_ids_off: usize,
    joiner_contacts_off: usize,
    n_changes_off: usize,
    n_committed_off: usize,
    n_acked_off: usize,
    n_installed_off: usize,
    num_received_off: usize,
    num_received_sst_off: usize,
    seq_num_off: usize,
    stable_num_off: usize,
    delivered_num_off: usize,
    persisted_num_off: usize,
    slots_off: usize,
    heartbeat_off: usize,
    global_min_off: usize,
    global_min_ready_off: usize,

    row_size: usize,
}

impl RowLayout {
    pub(crate) fn new(params: LayoutParams) -> Self {
        let n = params.num_members;
        let c = params.change_capacity;
        let k = params.contact_capacity;
        let s = params.total_senders;
        let g = params.num_subgroups;
        let w = params.window_size;

        let vid_off = 0;
        let suspected_off = vid_off + 4;
        let changes_off = suspected_off + n;
        let joiner_ids_off = changes_off + 4 * c;
        let joiner_contacts_off = joiner_ids_off + 4 * c;
        let n_changes_off = joiner_contacts_off + c * k;
        let n_committed_off = n_changes_off + 4;
        let n_acked_off = n_committed_off + 4;
        let n_installed_off = n_acked_off + 4;
        let num_received_off = n_installed_off + 4;
        let num_received_sst_off = num_received_off + 8 * s;
        let seq_num_off = num_received_sst_off + 8 * s;
        let stable_num_off = seq_num_off + 8 * g;
        let delivered_num_off = stable_num_off + 8 * g;
        let persisted_num_off = delivered_num_off + 8 * g;
        let slots_off = persisted_num_off + 8 * g;
        let heartbeat_off = slots_off + g * w * slot_extent(&params);
        let global_min_off = heartbeat_off + n;
        let global_min_ready_off = global_min_off + 8 * s;
        let row_size = global_min_ready_off + g;

        RowLayout {
            params,
            vid_off,
            suspected_off,
            changes_off,
            joiner_ids_off,
            joiner_contacts_off,
            n_changes_off,
            n_committed_off,
            n_acked_off,
            n_installed_off,
            num_received_off,
            num_received_sst_off,
            seq_num_off,
            stable_num_off,
            delivered_num_off,
            persisted_num_off,
            slots_off,
            heartbeat_off,
            global_min_off,
            global_min_ready_off,
            row_size,
        }
    }

    /// Total byte size of one row.
    #[inline]
    pub(crate) fn row_size(&self) -> usize {
        self.row_size
    }

    #[inline]
    pub(crate) fn vid(&self) -> Range<usize> {
        self.vid_off..self.vid_off + 4
    }

    #[inline]
    pub(crate) fn suspected(&self, member: usize) -> Range<usize> {
        debug_assert!(member < self.params.num_members);
        self.suspected_off + member..self.suspected_off + member + 1
    }

    #[inline]
    pub(crate) fn suspected_all(&self) -> Range<usize> {
        self.suspected_off..self.suspected_off + self.params.num_members
    }

    #[inline]
    pub(crate) fn changes(&self, idx: usize) -> Range<usize> {
        debug_assert!(idx < self.params.change_capacity);
        let off = self.changes_off + 4 * idx;
        off..off + 4
    }

    #[inline]
    pub(crate) fn joiner_ids(&self, idx: usize) -> Range<usize> {
        debug_assert!(idx < self.params.change_capacity);
        let off = self.joiner_ids_off + 4 * idx;
        off..off + 4
    }

    #[inline]
    pub(crate) fn joiner_contacts(&self, idx: usize) -> Range<usize> {
        debug_assert!(idx < self.params.change_capacity);
        let off =
            self.joiner_contacts_off + self.params.contact_capacity * idx;
        off..off + self.params.contact_capacity
    }

    /// Range covering the entire membership-change column block, used to
    /// replicate a proposal (or an ack copy) with one write.
    #[inline]
    pub(crate) fn change_block(&self) -> Range<usize> {
        self.changes_off..self.n_installed_off + 4
    }

    #[inline]
    pub(crate) fn n_changes(&self) -> Range<usize> {
        self.n_changes_off..self.n_changes_off + 4
    }

    #[inline]
    pub(crate) fn n_committed(&self) -> Range<usize> {
        self.n_committed_off..self.n_committed_off + 4
    }

    #[inline]
    pub(crate) fn n_acked(&self) -> Range<usize> {
        self.n_acked_off..self.n_acked_off + 4
    }

    #[inline]
    pub(crate) fn n_installed(&self) -> Range<usize> {
        self.n_installed_off..self.n_installed_off + 4
    }

    #[inline]
    pub(crate) fn num_received(&self, col: usize) -> Range<usize> {
        debug_assert!(col < self.params.total_senders);
        let off = self.num_received_off + 8 * col;
        off..off + 8
    }

    #[inline]
    pub(crate) fn num_received_cols(
        &self,
        offset: usize,
        count: usize,
    ) -> Range<usize> {
        debug_assert!(offset + count <= self.params.total_senders);
        let off = self.num_received_off + 8 * offset;
        off..off + 8 * count
    }

    #[inline]
    pub(crate) fn num_received_sst(&self, col: usize) -> Range<usize> {
        debug_assert!(col < self.params.total_senders);
        let off = self.num_received_sst_off + 8 * col;
        off..off + 8
    }

    #[inline]
    pub(crate) fn num_received_sst_cols(
        &self,
        offset: usize,
        count: usize,
    ) -> Range<usize> {
        debug_assert!(offset + count <= self.params.total_senders);
        let off = self.num_received_sst_off + 8 * offset;
        off..off + 8 * count
    }

    #[inline]
    pub(crate) fn seq_num(&self, subgroup: usize) -> Range<usize> {
        debug_assert!(subgroup < self.params.num_subgroups);
        let off = self.seq_num_off + 8 * subgroup;
        off..off + 8
    }

    #[inline]
    pub(crate) fn stable_num(&self, subgroup: usize) -> Range<usize> {
        debug_assert!(subgroup < self.params.num_subgroups);
        let off = self.stable_num_off + 8 * subgroup;
        off..off + 8
    }

    #[inline]
    pub(crate) fn delivered_num(&self, subgroup: usize) -> Range<usize> {
        debug_assert!(subgroup < self.params.num_subgroups);
        let off = self.delivered_num_off + 8 * subgroup;
        off..off + 8
    }

    #[inline]
    pub(crate) fn persisted_num(&self, subgroup: usize) -> Range<usize> {
        debug_assert!(subgroup < self.params.num_subgroups);
        let off = self.persisted_num_off + 8 * subgroup;
        off..off + 8
    }

    #[inline]
    fn slot_off(&self, subgroup: usize, slot: usize) -> usize {
        debug_assert!(subgroup < self.params.num_subgroups);
        debug_assert!(slot < self.params.window_size);
        self.slots_off
            + (subgroup * self.params.window_size + slot)
                * slot_extent(&self.params)
    }

    #[inline]
    pub(crate) fn slot_next_seq(
        &self,
        subgroup: usize,
        slot: usize,
    ) -> Range<usize> {
        let off = self.slot_off(subgroup, slot);
        off..off + 8
    }

    #[inline]
    pub(crate) fn slot_size(
        &self,
        subgroup: usize,
        slot: usize,
    ) -> Range<usize> {
        let off = self.slot_off(subgroup, slot) + 8;
        off..off + 4
    }

    #[inline]
    pub(crate) fn slot_buf(
        &self,
        subgroup: usize,
        slot: usize,
    ) -> Range<usize> {
        let off = self.slot_off(subgroup, slot) + 12;
        off..off + self.params.max_slot_msg_size
    }

    /// Range covering a slot's size + payload but not its `next_seq`, so the
    /// contents can be replicated strictly before the `next_seq` bump.
    #[inline]
    pub(crate) fn slot_contents(
        &self,
        subgroup: usize,
        slot: usize,
    ) -> Range<usize> {
        let off = self.slot_off(subgroup, slot) + 8;
        off..off + 4 + self.params.max_slot_msg_size
    }

    #[inline]
    pub(crate) fn heartbeat(&self, member: usize) -> Range<usize> {
        debug_assert!(member < self.params.num_members);
        self.heartbeat_off + member..self.heartbeat_off + member + 1
    }

    #[inline]
    pub(crate) fn global_min(&self, col: usize) -> Range<usize> {
        debug_assert!(col < self.params.total_senders);
        let off = self.global_min_off + 8 * col;
        off..off + 8
    }

    #[inline]
    pub(crate) fn global_min_cols(
        &self,
        offset: usize,
        count: usize,
    ) -> Range<usize> {
        debug_assert!(offset + count <= self.params.total_senders);
        let off = self.global_min_off + 8 * offset;
        off..off + 8 * count
    }

    #[inline]
    pub(crate) fn global_min_ready(&self, subgroup: usize) -> Range<usize> {
        debug_assert!(subgroup < self.params.num_subgroups);
        self.global_min_ready_off + subgroup
            ..self.global_min_ready_off + subgroup + 1
    }

    /// Range covering the whole row.
    #[inline]
    pub(crate) fn whole_row(&self) -> Range<usize> {
        0..self.row_size
    }
}

#[cfg(test)]
mod layout_tests {
    use super::*;

    fn small_params() -> LayoutParams {
        LayoutParams {
            num_members: 3,
            change_capacity: 2,
            contact_capacity: 8,
            total_senders: 4,
            num_subgroups: 2,
            window_size: 3,
            max_slot_msg_size: 16,
        }
    }

    #[test]
    fn offsets_follow_wire_order() {
        let layout = RowLayout::new(small_params());
        assert_eq!(layout.vid(), 0..4);
        assert_eq!(layout.suspected_all(), 4..7);
        assert_eq!(layout.changes(0), 7..11);
        assert_eq!(layout.changes(1), 11..15);
        assert_eq!(layout.joiner_ids(0), 15..19);
        assert_eq!(layout.joiner_contacts(0), 23..31);
        assert_eq!(layout.n_changes(), 39..43);
        assert_eq!(layout.n_committed(), 43..47);
        assert_eq!(layout.n_acked(), 47..51);
        assert_eq!(layout.n_installed(), 51..55);
        assert_eq!(layout.num_received(0), 55..63);
        assert_eq!(layout.num_received_sst(0), 87..95);
        assert_eq!(layout.seq_num(0), 119..127);
        assert_eq!(layout.stable_num(0), 135..143);
        assert_eq!(layout.delivered_num(1), 159..167);
        assert_eq!(layout.persisted_num(0), 167..175);
        // slots start right after persisted_num
        assert_eq!(layout.slot_next_seq(0, 0).start, 183);
        // each slot spans 8 + 4 + 16 = 28 bytes, 2 * 3 slots total
        assert_eq!(layout.heartbeat(0).start, 183 + 6 * 28);
        assert_eq!(layout.global_min(0).start, 183 + 6 * 28 + 3);
        assert_eq!(
            layout.global_min_ready(1).end,
            183 + 6 * 28 + 3 + 4 * 8 + 2
        );
        assert_eq!(layout.row_size(), layout.global_min_ready(1).end);
    }

    #[test]
    fn slot_contents_exclude_next_seq() {
        let layout = RowLayout::new(small_params());
        let contents = layout.slot_contents(1, 2);
        assert_eq!(contents.start, layout.slot_next_seq(1, 2).end);
        assert_eq!(contents.end, layout.slot_buf(1, 2).end);
        assert_eq!(layout.slot_size(1, 2).start, contents.start);
    }

    #[test]
    fn change_block_covers_proposal_columns() {
        let layout = RowLayout::new(small_params());
        let block = layout.change_block();
        assert_eq!(block.start, layout.changes(0).start);
        assert_eq!(block.end, layout.n_installed().end);
    }
}

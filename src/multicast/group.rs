//! The multicast group: receipt bookkeeping, sequence-number assignment,
//! stability tracking, in-order delivery, persistence gating, sender flow
//! control, and the transition of in-flight state across views.
//!
//! Sequence numbers interleave senders: a message with per-sender index `i`
//! from the sender at rank `r` among `n` shard senders occupies sequence
//! number `i * n + r`, so per-sender monotonic indices compose into one
//! global shard order.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::multicast::bulk::{BulkGroupId, BulkHub};
use crate::multicast::message::{
    BulkMessage, IntervalTracker, MessageBuffer, MessageHeader, SlotMessage,
    HEADER_SIZE,
};
use crate::multicast::{Medium, Mode, NodeId, SubgroupId};
use crate::persist::{PersistRecord, PersistWriter};
use crate::sst::{PredHandle, PredicateKind, SharedStateTable, SstSnapshot};
use crate::utils::{Bitmap, ShardcastError};

use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::{self, Duration, MissedTickBehavior};

/// Per-subgroup shard configuration, derived from the membership policy for
/// the current view. Settings exist for every subgroup id; the `my_*` fields
/// are `None` on nodes outside the shard.
#[derive(Debug, Clone)]
pub(crate) struct SubgroupSettings {
    /// Shard members in rank order.
    pub members: Vec<NodeId>,

    /// Which shard ranks are senders; parallel to `members`.
    pub senders: Bitmap,

    /// This node's shard rank, if a member.
    pub my_shard_rank: Option<usize>,

    /// This node's sender rank, if a sender.
    pub my_sender_rank: Option<usize>,

    /// First `num_received` column belonging to this subgroup's senders.
    pub num_received_offset: usize,

    /// Delivery discipline; pinned for the subgroup's lifetime.
    pub mode: Mode,
}

impl SubgroupSettings {
    #[inline]
    pub(crate) fn num_senders(&self) -> usize {
        self.senders.count()
    }

    /// Shard ranks holding each sender rank, in sender-rank order.
    pub(crate) fn sender_shard_ranks(&self) -> Vec<usize> {
        self.senders
            .iter()
            .filter_map(|(rank, is_sender)| is_sender.then_some(rank))
            .collect()
    }

    /// Sender rank of the given member, if it is a sender of this shard.
    pub(crate) fn sender_rank_of(&self, node: NodeId) -> Option<usize> {
        let mut sender_rank = 0;
        for (shard_rank, member) in self.members.iter().enumerate() {
            let is_sender = self.senders.get(shard_rank).unwrap_or(false);
            if *member == node {
                return is_sender.then_some(sender_rank);
            }
            if is_sender {
                sender_rank += 1;
            }
        }
        None
    }
}

/// Upcalls issued by the delivery pipeline, injected at construction.
#[derive(Clone)]
pub(crate) struct DeliveryCallbacks {
    /// Stability upcall for raw-delivery payloads, in global order.
    pub global_stability:
        Arc<dyn Fn(SubgroupId, NodeId, i64, &[u8]) + Send + Sync>,

    /// Dispatch for cooked (RPC-path) payloads.
    pub rpc: Arc<dyn Fn(SubgroupId, NodeId, &[u8]) + Send + Sync>,

    /// Fired once a delivered payload has been made durable.
    pub local_persistence:
        Arc<dyn Fn(SubgroupId, NodeId, i64, &[u8]) + Send + Sync>,
}

/// Everything needed to build a multicast group for one view.
pub(crate) struct GroupParams {
    pub my_node_id: NodeId,
    pub members: Vec<NodeId>,
    pub sst: Arc<SharedStateTable>,
    pub bulk: Arc<BulkHub>,
    pub total_num_subgroups: usize,
    pub subgroups: HashMap<SubgroupId, SubgroupSettings>,
    pub callbacks: DeliveryCallbacks,
    pub window_size: usize,
    pub max_payload_size: usize,
    pub heartbeat_interval: Duration,
    /// Members already failed at construction time; bulk groups are not
    /// created if any is set, leaving the group unable to send until the
    /// next view.
    pub already_failed: Vec<bool>,
    pub writer: Option<Arc<PersistWriter>>,
    /// Heartbeat completion failures are reported here as (vid, rank)
    /// pairs, so stale reports from a superseded view can be discarded.
    pub tx_peer_failure: Option<mpsc::UnboundedSender<(i32, usize)>>,
}

/// Message state of all subgroups, guarded by the one group-wide mutex.
struct MessageState {
    /// Free registered buffers per subgroup. Together with every in-flight
    /// owner, each pool holds exactly `window_size * shard_size` buffers.
    free_message_buffers: Vec<Vec<MessageBuffer>>,

    /// Queued outbound bulk messages per subgroup, in index order.
    pending_sends: Vec<VecDeque<BulkMessage>>,

    /// The bulk message currently on the wire per subgroup.
    current_sends: Vec<Option<BulkMessage>>,

    /// In-flight inbound bulk transfers keyed by (subgroup, sequence).
    current_receives: HashMap<(SubgroupId, i64), BulkMessage>,

    /// Received-but-undelivered messages per subgroup, keyed by sequence.
    locally_stable_bulk: Vec<BTreeMap<i64, BulkMessage>>,
    locally_stable_slot: Vec<BTreeMap<i64, SlotMessage>>,

    /// Delivered messages awaiting the persistence writer's acknowledgement.
    non_persistent_bulk: Vec<BTreeMap<i64, BulkMessage>>,
    non_persistent_slot: Vec<BTreeMap<i64, SlotMessage>>,

    /// Next per-sender index this node will assign, per subgroup.
    future_message_indices: Vec<i64>,

    /// Sender flow-control counter per subgroup.
    next_message_to_deliver: Vec<i64>,

    /// Hole-aware receipt counters, one per `num_received` column.
    received: Vec<IntervalTracker>,

    /// Round-robin cursor of the sender task.
    subgroup_cursor: usize,
}

impl MessageState {
    fn new(num_subgroups: usize, total_senders: usize) -> Self {
        MessageState {
            free_message_buffers: (0..num_subgroups)
                .map(|_| Vec::new())
                .collect(),
            pending_sends: (0..num_subgroups)
                .map(|_| VecDeque::new())
                .collect(),
            current_sends: (0..num_subgroups).map(|_| None).collect(),
            current_receives: HashMap::new(),
            locally_stable_bulk: (0..num_subgroups)
                .map(|_| BTreeMap::new())
                .collect(),
            locally_stable_slot: (0..num_subgroups)
                .map(|_| BTreeMap::new())
                .collect(),
            non_persistent_bulk: (0..num_subgroups)
                .map(|_| BTreeMap::new())
                .collect(),
            non_persistent_slot: (0..num_subgroups)
                .map(|_| BTreeMap::new())
                .collect(),
            future_message_indices: vec![0; num_subgroups],
            next_message_to_deliver: vec![0; num_subgroups],
            received: (0..total_senders)
                .map(|_| IntervalTracker::new())
                .collect(),
            subgroup_cursor: 0,
        }
    }
}

/// How a newly received message entered the pipeline.
enum Incoming {
    /// Self-receipt of this node's own bulk send.
    BulkSelf,

    /// Bulk transfer from a peer; bytes to land in the claimed buffer.
    BulkRemote(Vec<u8>),

    /// Copy of an SST slot's contents.
    Slot(Vec<u8>),
}

/// Shared innards of a multicast group; closures registered with the SST
/// and the bulk hub hold clones of this.
pub(crate) struct GroupCore {
    my_node_id: NodeId,
    members: Vec<NodeId>,
    member_index: usize,
    node_id_to_sst_index: HashMap<NodeId, usize>,

    window_size: usize,
    max_msg_size: usize,
    total_num_subgroups: usize,
    subgroups: HashMap<SubgroupId, SubgroupSettings>,

    callbacks: DeliveryCallbacks,
    sst: Arc<SharedStateTable>,
    bulk: Arc<BulkHub>,

    state: Mutex<MessageState>,

    wedged: AtomicBool,
    send_failed: AtomicBool,
    bulk_groups_created: AtomicBool,
    sender_notify: Notify,

    pred_handles: Mutex<Vec<PredHandle>>,
    my_bulk_groups: Mutex<HashMap<SubgroupId, BulkGroupId>>,
    all_bulk_groups: Mutex<Vec<BulkGroupId>>,

    writer: Mutex<Option<Arc<PersistWriter>>>,
    persist_enabled: bool,

    heartbeat_interval: Duration,
    tx_peer_failure: Option<mpsc::UnboundedSender<(i32, usize)>>,
}

impl GroupCore {
    #[inline]
    fn settings(&self, subgroup: SubgroupId) -> &SubgroupSettings {
        self.subgroups
            .get(&subgroup)
            .expect("settings exist for every subgroup id")
    }

    /// SST row indices of the given subgroup's shard members.
    fn shard_rows(&self, subgroup: SubgroupId) -> Vec<usize> {
        self.settings(subgroup)
            .members
            .iter()
            .map(|m| self.node_id_to_sst_index[m])
            .collect()
    }

    #[inline]
    fn is_wedged(&self) -> bool {
        self.wedged.load(Ordering::Acquire)
    }

    /// Terminal shutdown of this group instance: removes its predicates,
    /// destroys its transfer groups, and wakes the sender task so it can
    /// drain. Idempotent.
    pub(crate) fn wedge(&self) {
        if self.wedged.swap(true, Ordering::AcqRel) {
            return;
        }
        pf_debug!("wedging multicast group");
        for handle in self.pred_handles.lock().unwrap().drain(..) {
            self.sst.predicates.remove(handle);
        }
        for gid in self.all_bulk_groups.lock().unwrap().drain(..) {
            self.bulk.destroy_group(gid);
        }
        self.my_bulk_groups.lock().unwrap().clear();
        self.sender_notify.notify_one();
    }

    /// Inserts a received message (plus placeholders for any skipped turns)
    /// into the locally-stable queues, advances the sender's receipt
    /// counter, and in raw mode delivers the newly sequenced prefix at
    /// once. Returns the (old, new) receipt counter values.
    fn sequence_received(
        &self,
        state: &mut MessageState,
        subgroup: SubgroupId,
        sender_rank: usize,
        node_id: NodeId,
        header: &MessageHeader,
        incoming: Incoming,
    ) -> (i64, i64) {
        let settings = self.settings(subgroup);
        let ns = settings.num_senders() as i64;
        let col = settings.num_received_offset + sender_rank;
        let beg_index = header.index;
        let mut index = header.index;
        let mut seq = index * ns + sender_rank as i64;
        let mut slot_path = false;

        pf_debug!(
            "locally received message in subgroup {}, sender rank {}, \
             index {}",
            subgroup,
            sender_rank,
            index
        );

        match incoming {
            Incoming::BulkSelf => {
                let msg = state.current_sends[subgroup]
                    .take()
                    .expect("self-receipt without a current send");
                state.locally_stable_bulk[subgroup].insert(seq, msg);
            }
            Incoming::BulkRemote(bytes) => {
                match state.current_receives.remove(&(subgroup, seq)) {
                    Some(mut msg) => {
                        msg.index = index;
                        msg.size = bytes.len();
                        msg.buffer.bytes_mut()[..bytes.len()]
                            .copy_from_slice(&bytes);
                        state.locally_stable_bulk[subgroup].insert(seq, msg);
                    }
                    None => {
                        pf_error!(
                            "no claimed receive buffer for subgroup {} \
                             seq {}",
                            subgroup,
                            seq
                        );
                        let cur = state.received[col].value();
                        return (cur, cur);
                    }
                }
            }
            Incoming::Slot(data) => {
                slot_path = true;
                let size = data.len();
                state.locally_stable_slot[subgroup].insert(
                    seq,
                    SlotMessage {
                        sender_id: node_id,
                        index,
                        size,
                        data,
                    },
                );
            }
        }

        // skipped turns become zero-size placeholders
        for _ in 0..header.pause_sending_turns {
            index += 1;
            seq += ns;
            if slot_path {
                state.locally_stable_slot[subgroup]
                    .insert(seq, SlotMessage::placeholder(node_id, index));
            } else {
                state.locally_stable_bulk[subgroup]
                    .insert(seq, BulkMessage::placeholder(node_id, index));
            }
        }

        let old = state.received[col].value();
        let new = state.received[col].insert(beg_index, index);

        if settings.mode == Mode::Raw {
            // immediate delivery of the newly sequenced prefix
            for i in (old + 1)..=new {
                let sn = i * ns + sender_rank as i64;
                self.raw_deliver_seq(state, subgroup, sn);
            }
        }

        if new > old {
            self.sst.set_num_received(col, new);
        }
        (old, new)
    }

    /// Raw-mode immediate delivery of one sequence number from whichever
    /// locally-stable queue holds it.
    fn raw_deliver_seq(
        &self,
        state: &mut MessageState,
        subgroup: SubgroupId,
        seq: i64,
    ) {
        let slot_head = state.locally_stable_slot[subgroup]
            .first_key_value()
            .map(|(k, _)| *k);
        if slot_head == Some(seq) {
            let (_, msg) =
                state.locally_stable_slot[subgroup].pop_first().unwrap();
            if msg.size > 0 {
                if let Ok(header) = MessageHeader::decode(&msg.data) {
                    let payload =
                        &msg.data[header.header_size as usize..msg.size];
                    if !payload.is_empty() {
                        (self.callbacks.global_stability)(
                            subgroup,
                            msg.sender_id,
                            msg.index,
                            payload,
                        );
                    }
                }
            }
            return;
        }

        let bulk_head = state.locally_stable_bulk[subgroup]
            .first_key_value()
            .map(|(k, _)| *k);
        if bulk_head == Some(seq) {
            let (_, msg) =
                state.locally_stable_bulk[subgroup].pop_first().unwrap();
            if msg.size > 0 {
                if let Ok(header) = MessageHeader::decode(msg.buffer.bytes())
                {
                    let payload = &msg.buffer.bytes()
                        [header.header_size as usize..msg.size];
                    if !payload.is_empty() {
                        (self.callbacks.global_stability)(
                            subgroup,
                            msg.sender_id,
                            msg.index,
                            payload,
                        );
                    }
                }
            }
            if msg.buffer.capacity() > 0 {
                state.free_message_buffers[subgroup].push(msg.buffer);
            }
        } else {
            pf_error!(
                "raw message seq {} missing from stable queues of \
                 subgroup {}",
                seq,
                subgroup
            );
        }
    }

    /// Publishes this node's receipt state for a subgroup: recomputes
    /// `seq_num` from the per-sender minima and replicates the changed
    /// columns to the shard.
    fn publish_receipts(&self, subgroup: SubgroupId) {
        let settings = self.settings(subgroup);
        let ns = settings.num_senders();
        let off = settings.num_received_offset;
        let me_row = self.member_index;
        let shard_rows = self.shard_rows(subgroup);
        let layout = self.sst.layout().clone();

        let mut min_received = i64::MAX;
        let mut argmin = 0usize;
        for j in 0..ns {
            let v = self.sst.num_received(me_row, off + j);
            if v < min_received {
                min_received = v;
                argmin = j;
            }
        }

        let new_seq_num =
            (min_received + 1) * ns as i64 + argmin as i64 - 1;
        if new_seq_num > self.sst.seq_num(me_row, subgroup) {
            pf_debug!(
                "updating seq_num for subgroup {} to {}",
                subgroup,
                new_seq_num
            );
            self.sst.set_seq_num(subgroup, new_seq_num);
            self.sst.put(&shard_rows, layout.seq_num(subgroup));
        }
        self.sst
            .put(&shard_rows, layout.num_received_cols(off, ns));
    }

    /// Issues the delivery upcall for one bulk message and routes its
    /// buffer onward (persistence queue or free pool).
    fn deliver_bulk(
        &self,
        state: &mut MessageState,
        subgroup: SubgroupId,
        msg: BulkMessage,
    ) {
        if msg.size == 0 {
            return; // skipped-turn placeholder
        }
        let header = match MessageHeader::decode(msg.buffer.bytes()) {
            Ok(header) => header,
            Err(e) => {
                pf_error!("undeliverable bulk message: {}", e);
                return;
            }
        };
        let payload = msg.buffer.bytes()[header.header_size as usize..msg.size]
            .to_vec();

        if !payload.is_empty() {
            if header.cooked_send {
                (self.callbacks.rpc)(subgroup, msg.sender_id, &payload);
            } else {
                (self.callbacks.global_stability)(
                    subgroup,
                    msg.sender_id,
                    msg.index,
                    &payload,
                );
            }
        }

        if self.persist_enabled && !payload.is_empty() {
            let settings = self.settings(subgroup);
            let ns = settings.num_senders() as i64;
            let sender_rank = settings
                .sender_rank_of(msg.sender_id)
                .expect("delivered message from a non-sender");
            let seq = msg.index * ns + sender_rank as i64;
            let record = PersistRecord {
                subgroup,
                vid: self.sst.vid(),
                sender: msg.sender_id,
                index: msg.index,
                cooked: header.cooked_send,
                payload,
            };
            state.non_persistent_bulk[subgroup].insert(seq, msg);
            if let Some(writer) = self.writer.lock().unwrap().as_ref() {
                if let Err(e) = writer.submit(record) {
                    pf_error!("fatal persistence submit error: {}", e);
                    std::process::abort();
                }
            }
        } else if msg.buffer.capacity() > 0 {
            state.free_message_buffers[subgroup].push(msg.buffer);
        }
    }

    /// As `deliver_bulk`, for a slot-path message.
    fn deliver_slot(
        &self,
        state: &mut MessageState,
        subgroup: SubgroupId,
        msg: SlotMessage,
    ) {
        if msg.size == 0 {
            return;
        }
        let header = match MessageHeader::decode(&msg.data) {
            Ok(header) => header,
            Err(e) => {
                pf_error!("undeliverable slot message: {}", e);
                return;
            }
        };
        let payload =
            msg.data[header.header_size as usize..msg.size].to_vec();

        if !payload.is_empty() {
            if header.cooked_send {
                (self.callbacks.rpc)(subgroup, msg.sender_id, &payload);
            } else {
                (self.callbacks.global_stability)(
                    subgroup,
                    msg.sender_id,
                    msg.index,
                    &payload,
                );
            }
        }

        if self.persist_enabled && !payload.is_empty() {
            let settings = self.settings(subgroup);
            let ns = settings.num_senders() as i64;
            let sender_rank = settings
                .sender_rank_of(msg.sender_id)
                .expect("delivered message from a non-sender");
            let seq = msg.index * ns + sender_rank as i64;
            let record = PersistRecord {
                subgroup,
                vid: self.sst.vid(),
                sender: msg.sender_id,
                index: msg.index,
                cooked: header.cooked_send,
                payload,
            };
            state.non_persistent_slot[subgroup].insert(seq, msg);
            if let Some(writer) = self.writer.lock().unwrap().as_ref() {
                if let Err(e) = writer.submit(record) {
                    pf_error!("fatal persistence submit error: {}", e);
                    std::process::abort();
                }
            }
        }
    }

    /// Whether the head of a subgroup's pending queue may be sent now.
    fn should_send_to_subgroup(
        &self,
        state: &MessageState,
        subgroup: SubgroupId,
    ) -> bool {
        if state.pending_sends[subgroup].is_empty() {
            return false;
        }
        let settings = self.settings(subgroup);
        let Some(sender_rank) = settings.my_sender_rank else {
            return false;
        };
        let msg = state.pending_sends[subgroup].front().unwrap();
        let ns = settings.num_senders() as i64;
        let off = settings.num_received_offset;
        let col = off + sender_rank;
        let window = self.window_size as i64;

        // this sender's own receipt stream must have caught up to the
        // message's predecessor
        if state.received[col].value() < msg.index - 1 {
            return false;
        }

        let shard_rows = self.shard_rows(subgroup);
        if settings.mode == Mode::Ordered {
            let gate = (msg.index - window) * ns + sender_rank as i64;
            for &row in &shard_rows {
                if self.sst.delivered_num(row, subgroup) < gate {
                    return false;
                }
                if self.persist_enabled
                    && self.sst.persisted_num(row, subgroup) < gate
                {
                    return false;
                }
            }
        } else {
            let future = state.future_message_indices[subgroup];
            for &row in &shard_rows {
                if self.sst.num_received(row, col) < future - 1 - window {
                    return false;
                }
            }
        }
        true
    }

    /// Picks the next admissible pending send, round-robin over subgroups,
    /// moving it into `current_sends`. Returns the transfer-group id and a
    /// copy of the wire bytes.
    fn pick_next_send(&self) -> Option<(BulkGroupId, Vec<u8>)> {
        let mut state = self.state.lock().unwrap();
        for i in 1..=self.total_num_subgroups {
            let subgroup =
                (state.subgroup_cursor + i) % self.total_num_subgroups;
            if !self.should_send_to_subgroup(&state, subgroup) {
                continue;
            }
            let gid = *self.my_bulk_groups.lock().unwrap().get(&subgroup)?;
            state.subgroup_cursor = subgroup;
            let msg = state.pending_sends[subgroup].pop_front().unwrap();
            pf_debug!(
                "sending in subgroup {} message {} from {}",
                subgroup,
                msg.index,
                msg.sender_id
            );
            let bytes = msg.buffer.bytes()[..msg.size].to_vec();
            state.current_sends[subgroup] = Some(msg);
            return Some((gid, bytes));
        }
        None
    }
}

/// A prepared outbound message: header space reserved, payload writable by
/// the caller, committed by `send`. Dropping it uncommitted returns any
/// pooled buffer it holds.
pub struct SendBuffer {
    core: Arc<GroupCore>,
    subgroup: SubgroupId,
    payload_size: usize,
    msg_size: usize,
    pause_sending_turns: u32,
    cooked_send: bool,
    kind: Option<SendKind>,
}

enum SendKind {
    Bulk { buffer: MessageBuffer },
    Slot { data: Vec<u8> },
}

impl SendBuffer {
    /// The writable payload region, exactly `payload_size` bytes.
    pub fn payload_mut(&mut self) -> &mut [u8] {
        let range = HEADER_SIZE..HEADER_SIZE + self.payload_size;
        match self.kind.as_mut().expect("send buffer already committed") {
            SendKind::Bulk { buffer } => &mut buffer.bytes_mut()[range],
            SendKind::Slot { data } => &mut data[range],
        }
    }

    #[inline]
    pub fn payload_size(&self) -> usize {
        self.payload_size
    }
}

impl Drop for SendBuffer {
    fn drop(&mut self) {
        if let Some(SendKind::Bulk { buffer }) = self.kind.take() {
            // uncommitted buffer returns to its pool
            let mut state = self.core.state.lock().unwrap();
            state.free_message_buffers[self.subgroup].push(buffer);
        }
    }
}

/// The per-view multicast group instance.
pub(crate) struct MulticastGroup {
    core: Arc<GroupCore>,
    sender_handle: JoinHandle<()>,
    heartbeat_handle: JoinHandle<()>,
}

impl MulticastGroup {
    /// Creates a fresh group (first view or a newly joined node).
    pub(crate) async fn new_and_setup(
        params: GroupParams,
    ) -> Result<Self, ShardcastError> {
        let core = Self::build_core(params)?;

        // fill each owned subgroup's pool to `window_size * shard_size`
        {
            let mut state = core.state.lock().unwrap();
            for (&subgroup, settings) in &core.subgroups {
                if settings.my_shard_rank.is_none() {
                    continue;
                }
                let want = core.window_size * settings.members.len();
                while state.free_message_buffers[subgroup].len() < want {
                    state.free_message_buffers[subgroup]
                        .push(MessageBuffer::new(core.max_msg_size));
                }
            }
        }

        if let Some(writer) = core.writer.lock().unwrap().as_ref() {
            writer.set_written_callback(Self::make_written_callback(&core));
        }

        Self::finish_setup(core).await
    }

    /// View transition: wedges the old group, drains its tasks, and builds
    /// the next instance after transferring buffer pools, queues, and the
    /// persistence writer. In-flight transfers of discarded senders are
    /// abandoned; this node's own undelivered sends are renumbered and
    /// re-queued.
    pub(crate) async fn handoff(
        old: MulticastGroup,
        mut params: GroupParams,
    ) -> Result<Self, ShardcastError> {
        old.core.wedge();
        let old = std::mem::ManuallyDrop::new(old);
        let old_core = unsafe { std::ptr::read(&old.core) };
        let sender_handle = unsafe { std::ptr::read(&old.sender_handle) };
        let heartbeat_handle = unsafe { std::ptr::read(&old.heartbeat_handle) };
        let _ = sender_handle.await;
        let _ = heartbeat_handle.await;

        params.writer = old_core.writer.lock().unwrap().take();
        let core = Self::build_core(params)?;

        // hold the written-callback lock across the transfer so in-flight
        // persistence acknowledgements cannot observe half-moved queues
        let writer_opt = core.writer.lock().unwrap().clone();
        {
            let mut cb_guard =
                writer_opt.as_ref().map(|writer| writer.lock_callback());

            {
            let mut old_state = old_core.state.lock().unwrap();
            let mut new_state = core.state.lock().unwrap();
            // the shard layout is fixed at group creation, but guard the
            // transfer anyway in case subgroup counts ever differ
            let shared_subgroups = core
                .total_num_subgroups
                .min(old_core.total_num_subgroups);

            // steal the free pools, growing each to the new shard size
            for (&subgroup, settings) in &core.subgroups {
                if settings.my_shard_rank.is_none() {
                    continue;
                }
                let mut pool = if subgroup < shared_subgroups {
                    std::mem::take(
                        &mut old_state.free_message_buffers[subgroup],
                    )
                } else {
                    Vec::new()
                };
                let want = core.window_size * settings.members.len();
                while pool.len() < want {
                    pool.push(MessageBuffer::new(core.max_msg_size));
                }
                new_state.free_message_buffers[subgroup] = pool;
            }

            // abandoned in-flight receives give their buffers back
            for ((subgroup, _), msg) in old_state.current_receives.drain() {
                if subgroup < shared_subgroups
                    && msg.buffer.capacity() > 0
                {
                    new_state.free_message_buffers[subgroup]
                        .push(msg.buffer);
                }
            }

            for subgroup in 0..shared_subgroups {
                // locally-stable but undelivered: re-send mine, free others
                let stable = std::mem::take(
                    &mut old_state.locally_stable_bulk[subgroup],
                );
                for (_, msg) in stable {
                    if msg.sender_id == core.my_node_id && msg.size > 0 {
                        let msg = Self::convert_bulk(
                            &core,
                            &mut new_state,
                            subgroup,
                            msg,
                        );
                        new_state.pending_sends[subgroup].push_back(msg);
                    } else if msg.buffer.capacity() > 0 {
                        new_state.free_message_buffers[subgroup]
                            .push(msg.buffer);
                    }
                }
                // slot messages belong to the old table instance
                old_state.locally_stable_slot[subgroup].clear();

                // outstanding sends are re-attempted, oldest first
                if let Some(msg) = old_state.current_sends[subgroup].take() {
                    let msg = Self::convert_bulk(
                        &core,
                        &mut new_state,
                        subgroup,
                        msg,
                    );
                    new_state.pending_sends[subgroup].push_back(msg);
                }
                while let Some(msg) =
                    old_state.pending_sends[subgroup].pop_front()
                {
                    let msg = Self::convert_bulk(
                        &core,
                        &mut new_state,
                        subgroup,
                        msg,
                    );
                    new_state.pending_sends[subgroup].push_back(msg);
                }

                // already delivered, awaiting durability: keep keyed under
                // their original sequence numbers so the writer's
                // acknowledgements still find them
                new_state.non_persistent_bulk[subgroup] = std::mem::take(
                    &mut old_state.non_persistent_bulk[subgroup],
                );
                new_state.non_persistent_slot[subgroup] = std::mem::take(
                    &mut old_state.non_persistent_slot[subgroup],
                );
                }
            }

            if let Some(guard) = cb_guard.as_mut() {
                **guard = Some(Self::make_written_callback(&core));
            }
        }

        Self::finish_setup(core).await
    }

    fn build_core(
        params: GroupParams,
    ) -> Result<Arc<GroupCore>, ShardcastError> {
        let GroupParams {
            my_node_id,
            members,
            sst,
            bulk,
            total_num_subgroups,
            subgroups,
            callbacks,
            window_size,
            max_payload_size,
            heartbeat_interval,
            already_failed,
            writer,
            tx_peer_failure,
        } = params;

        if window_size == 0 {
            return logged_err!("invalid window_size 0");
        }
        let Some(member_index) =
            members.iter().position(|&m| m == my_node_id)
        else {
            return logged_err!(
                "node {} not in member list {:?}",
                my_node_id,
                members
            );
        };
        for subgroup in 0..total_num_subgroups {
            if !subgroups.contains_key(&subgroup) {
                return logged_err!(
                    "missing settings for subgroup {}",
                    subgroup
                );
            }
        }
        let total_senders: usize = subgroups
            .values()
            .map(|settings| settings.num_senders())
            .sum();

        let node_id_to_sst_index: HashMap<NodeId, usize> = members
            .iter()
            .enumerate()
            .map(|(index, &node)| (node, index))
            .collect();

        let persist_enabled = writer.is_some();
        let no_failures = !already_failed.iter().any(|&failed| failed);

        let core = Arc::new(GroupCore {
            my_node_id,
            members,
            member_index,
            node_id_to_sst_index,
            window_size,
            max_msg_size: max_payload_size + HEADER_SIZE,
            total_num_subgroups,
            subgroups,
            callbacks,
            sst,
            bulk,
            state: Mutex::new(MessageState::new(
                total_num_subgroups,
                total_senders,
            )),
            wedged: AtomicBool::new(false),
            send_failed: AtomicBool::new(false),
            bulk_groups_created: AtomicBool::new(no_failures),
            sender_notify: Notify::new(),
            pred_handles: Mutex::new(Vec::new()),
            my_bulk_groups: Mutex::new(HashMap::new()),
            all_bulk_groups: Mutex::new(Vec::new()),
            writer: Mutex::new(writer),
            persist_enabled,
            heartbeat_interval,
            tx_peer_failure,
        });
        Ok(core)
    }

    /// Renumbers a carried-over message into the new view's index space,
    /// rewriting its wire header to match.
    fn convert_bulk(
        core: &Arc<GroupCore>,
        state: &mut MessageState,
        subgroup: SubgroupId,
        mut msg: BulkMessage,
    ) -> BulkMessage {
        let mut header = MessageHeader::decode(msg.buffer.bytes())
            .expect("carried-over message has a valid header");
        msg.sender_id = core.my_node_id;
        msg.index = state.future_message_indices[subgroup];
        state.future_message_indices[subgroup] +=
            header.pause_sending_turns as i64 + 1;
        header.index = msg.index;
        header.encode_into(msg.buffer.bytes_mut());
        msg
    }

    /// Common tail of both constructors: initial row publication, transfer
    /// groups, predicates, worker tasks.
    async fn finish_setup(
        core: Arc<GroupCore>,
    ) -> Result<MulticastGroup, ShardcastError> {
        core.sst.put_everywhere();
        core.sst.sync_with_members().await;

        if core.bulk_groups_created.load(Ordering::Acquire) {
            let created = Self::create_bulk_groups(&core);
            core.bulk_groups_created.store(created, Ordering::Release);
            if !created {
                pf_warn!("bulk transfer groups not created; group cannot send");
            }
        }

        Self::register_predicates(&core);

        let sender_core = core.clone();
        let sender_handle = tokio::spawn(async move {
            Self::sender_task(sender_core).await;
        });
        let heartbeat_core = core.clone();
        let heartbeat_handle = tokio::spawn(async move {
            Self::heartbeat_task(heartbeat_core).await;
        });

        Ok(MulticastGroup {
            core,
            sender_handle,
            heartbeat_handle,
        })
    }

    /// Creates one transfer group per (subgroup, sender), with the member
    /// list rotated so the sender is the root. Group ids are assigned in
    /// global (subgroup, sender-rank) order so every member agrees on them.
    fn create_bulk_groups(core: &Arc<GroupCore>) -> bool {
        let mut gid: BulkGroupId = 0;
        for subgroup in 0..core.total_num_subgroups {
            let settings = core.settings(subgroup).clone();
            let shard = settings.members.clone();
            let mut sender_rank = 0usize;
            for (shard_rank, &member) in shard.iter().enumerate() {
                if !settings.senders.get(shard_rank).unwrap_or(false) {
                    continue;
                }
                let this_rank = sender_rank;
                sender_rank += 1;
                let this_gid = gid;
                gid += 1;

                if settings.my_shard_rank.is_none() {
                    continue; // id counted, not my shard
                }

                let rotated: Vec<NodeId> = (0..shard.len())
                    .map(|k| shard[(shard_rank + k) % shard.len()])
                    .collect();

                let created = if member == core.my_node_id {
                    core.my_bulk_groups
                        .lock()
                        .unwrap()
                        .insert(subgroup, this_gid);
                    core.bulk.create_group(
                        this_gid,
                        rotated,
                        // the root's destination-select never runs
                        Box::new(|_| false),
                        Self::make_bulk_completion(
                            core, subgroup, this_rank, member, true,
                        ),
                    )
                } else {
                    core.bulk.create_group(
                        this_gid,
                        rotated,
                        Self::make_destination_select(
                            core, subgroup, this_rank, member,
                        ),
                        Self::make_bulk_completion(
                            core, subgroup, this_rank, member, false,
                        ),
                    )
                };
                if !created {
                    return false;
                }
                core.all_bulk_groups.lock().unwrap().push(this_gid);
            }
        }
        true
    }

    /// Destination-select callback for one remote sender's transfer group:
    /// claims a pooled buffer and records the in-flight receive under the
    /// sequence number the incoming message must carry.
    fn make_destination_select(
        core: &Arc<GroupCore>,
        subgroup: SubgroupId,
        sender_rank: usize,
        node_id: NodeId,
    ) -> Box<dyn FnMut(usize) -> bool + Send> {
        let core = core.clone();
        Box::new(move |size| {
            if core.is_wedged() {
                return false;
            }
            let settings = core.settings(subgroup);
            let ns = settings.num_senders() as i64;
            let col = settings.num_received_offset + sender_rank;
            let index = core.sst.num_received(core.member_index, col) + 1;
            let seq = index * ns + sender_rank as i64;

            let mut state = core.state.lock().unwrap();
            let Some(buffer) = state.free_message_buffers[subgroup].pop()
            else {
                pf_error!(
                    "no free receive buffer in subgroup {}",
                    subgroup
                );
                return false;
            };
            state.current_receives.insert(
                (subgroup, seq),
                BulkMessage {
                    sender_id: node_id,
                    index,
                    size,
                    buffer,
                },
            );
            true
        })
    }

    /// Completion callback for one sender's transfer group, shared by the
    /// self-receive and remote-receive paths.
    fn make_bulk_completion(
        core: &Arc<GroupCore>,
        subgroup: SubgroupId,
        sender_rank: usize,
        node_id: NodeId,
        is_self: bool,
    ) -> Box<dyn FnMut(&[u8]) + Send> {
        let core = core.clone();
        Box::new(move |bytes| {
            if core.is_wedged() {
                return;
            }
            let header = match MessageHeader::decode(bytes) {
                Ok(header) => header,
                Err(e) => {
                    pf_error!("malformed bulk message: {}", e);
                    return;
                }
            };
            let incoming = if is_self {
                Incoming::BulkSelf
            } else {
                Incoming::BulkRemote(bytes.to_vec())
            };
            let (old, new) = {
                let mut state = core.state.lock().unwrap();
                core.sequence_received(
                    &mut state,
                    subgroup,
                    sender_rank,
                    node_id,
                    &header,
                    incoming,
                )
            };
            if new > old {
                core.publish_receipts(subgroup);
            }
            core.sender_notify.notify_one();
        })
    }

    /// Registers the per-subgroup receive/stability/delivery/flow-control
    /// predicates with the table.
    fn register_predicates(core: &Arc<GroupCore>) {
        let mut handles = Vec::new();
        let me_row = core.member_index;
        let window = core.window_size as i64;
        let drain_rounds = (core.window_size / 2).max(1);

        for subgroup in 0..core.total_num_subgroups {
            let settings = core.settings(subgroup);
            if settings.my_shard_rank.is_none() {
                continue;
            }
            let ns = settings.num_senders();
            let off = settings.num_received_offset;
            let shard_rows = core.shard_rows(subgroup);
            let sender_rows: Vec<usize> = settings
                .sender_shard_ranks()
                .iter()
                .map(|&shard_rank| {
                    core.node_id_to_sst_index[&settings.members[shard_rank]]
                })
                .collect();
            let sender_ids: Vec<NodeId> = settings
                .sender_shard_ranks()
                .iter()
                .map(|&shard_rank| settings.members[shard_rank])
                .collect();

            // receiver predicate: some sender's next slot has arrived
            let pred_sender_rows = sender_rows.clone();
            let receiver_pred = Box::new(move |snap: &SstSnapshot| {
                for j in 0..ns {
                    let num_received =
                        snap.num_received_sst(me_row, off + j) + 1;
                    let slot = (num_received % window) as usize;
                    if snap.slot_next_seq(
                        pred_sender_rows[j],
                        subgroup,
                        slot,
                    ) == num_received / window + 1
                    {
                        return true;
                    }
                }
                false
            });
            let trig_core = core.clone();
            let trig_sender_rows = sender_rows.clone();
            let trig_shard_rows = shard_rows.clone();
            let receiver_trig =
                Box::new(move |sst: &SharedStateTable| {
                    let mut advanced = false;
                    {
                        let mut state = trig_core.state.lock().unwrap();
                        for _ in 0..drain_rounds {
                            for j in 0..ns {
                                let col = off + j;
                                let num_received =
                                    sst.num_received_sst(me_row, col) + 1;
                                let slot =
                                    (num_received % window) as usize;
                                if sst.slot_next_seq(
                                    trig_sender_rows[j],
                                    subgroup,
                                    slot,
                                ) != num_received / window + 1
                                {
                                    continue;
                                }
                                let data = sst.slot_bytes_copy(
                                    trig_sender_rows[j],
                                    subgroup,
                                    slot,
                                );
                                let header =
                                    match MessageHeader::decode(&data) {
                                        Ok(header) => header,
                                        Err(e) => {
                                            pf_error!(
                                                "malformed slot message: {}",
                                                e
                                            );
                                            continue;
                                        }
                                    };
                                let (old, new) = trig_core
                                    .sequence_received(
                                        &mut state,
                                        subgroup,
                                        j,
                                        sender_ids[j],
                                        &header,
                                        Incoming::Slot(data),
                                    );
                                // the cursor jumps over skipped turns: the
                                // sender's next slot holds index
                                // `header.index + pause + 1`, never the
                                // intermediate ones
                                let end_index = header.index
                                    + header.pause_sending_turns as i64;
                                sst.set_num_received_sst(col, end_index);
                                if new > old {
                                    advanced = true;
                                }
                            }
                        }
                    }
                    let layout = sst.layout().clone();
                    sst.put(
                        &trig_shard_rows,
                        layout.num_received_sst_cols(off, ns),
                    );
                    if advanced {
                        trig_core.publish_receipts(subgroup);
                    }
                });
            handles.push(core.sst.predicates.insert(
                receiver_pred,
                receiver_trig,
                PredicateKind::Recurrent,
            ));

            if settings.mode == Mode::Ordered {
                // stability predicate: publish the shard-wide seq_num min
                let stab_shard_rows = shard_rows.clone();
                handles.push(core.sst.predicates.insert(
                    Box::new(|_| true),
                    Box::new(move |sst: &SharedStateTable| {
                        let mut min_seq_num = i64::MAX;
                        for &row in &stab_shard_rows {
                            min_seq_num =
                                min_seq_num.min(sst.seq_num(row, subgroup));
                        }
                        if min_seq_num > sst.stable_num(me_row, subgroup) {
                            pf_debug!(
                                "subgroup {}, updating stable_num to {}",
                                subgroup,
                                min_seq_num
                            );
                            sst.set_stable_num(subgroup, min_seq_num);
                            let layout = sst.layout().clone();
                            sst.put(
                                &stab_shard_rows,
                                layout.stable_num(subgroup),
                            );
                        }
                    }),
                    PredicateKind::Recurrent,
                ));

                // delivery predicate: deliver everything at or below the
                // shard-wide stable_num min, in sequence order
                let del_core = core.clone();
                let del_shard_rows = shard_rows.clone();
                handles.push(core.sst.predicates.insert(
                    Box::new(|_| true),
                    Box::new(move |sst: &SharedStateTable| {
                        let mut min_stable_num = i64::MAX;
                        for &row in &del_shard_rows {
                            min_stable_num = min_stable_num
                                .min(sst.stable_num(row, subgroup));
                        }
                        let mut updated = false;
                        {
                            let mut state = del_core.state.lock().unwrap();
                            loop {
                                let bulk_head = state.locally_stable_bulk
                                    [subgroup]
                                    .first_key_value()
                                    .map(|(k, _)| *k)
                                    .unwrap_or(i64::MAX);
                                let slot_head = state.locally_stable_slot
                                    [subgroup]
                                    .first_key_value()
                                    .map(|(k, _)| *k)
                                    .unwrap_or(i64::MAX);
                                if bulk_head < slot_head
                                    && bulk_head <= min_stable_num
                                {
                                    let (_, msg) = state.locally_stable_bulk
                                        [subgroup]
                                        .pop_first()
                                        .unwrap();
                                    del_core.deliver_bulk(
                                        &mut state, subgroup, msg,
                                    );
                                    sst.set_delivered_num(
                                        subgroup, bulk_head,
                                    );
                                    updated = true;
                                } else if slot_head < bulk_head
                                    && slot_head <= min_stable_num
                                {
                                    let (_, msg) = state.locally_stable_slot
                                        [subgroup]
                                        .pop_first()
                                        .unwrap();
                                    del_core.deliver_slot(
                                        &mut state, subgroup, msg,
                                    );
                                    sst.set_delivered_num(
                                        subgroup, slot_head,
                                    );
                                    updated = true;
                                } else {
                                    break;
                                }
                            }
                        }
                        if updated {
                            let layout = sst.layout().clone();
                            sst.put(
                                &del_shard_rows,
                                layout.delivered_num(subgroup),
                            );
                        }
                    }),
                    PredicateKind::Recurrent,
                ));

                // sender flow-control predicate
                if let Some(my_sender_rank) = settings.my_sender_rank {
                    let snd_core = core.clone();
                    let snd_shard_rows = shard_rows.clone();
                    let persist = core.persist_enabled;
                    let ns_i = ns as i64;
                    handles.push(core.sst.predicates.insert(
                        Box::new(move |snap: &SstSnapshot| {
                            let next = snd_core
                                .state
                                .lock()
                                .unwrap()
                                .next_message_to_deliver[subgroup];
                            let seq =
                                next * ns_i + my_sender_rank as i64;
                            for &row in &snd_shard_rows {
                                if snap.delivered_num(row, subgroup) < seq {
                                    return false;
                                }
                                if persist
                                    && snap.persisted_num(row, subgroup)
                                        < seq
                                {
                                    return false;
                                }
                            }
                            true
                        }),
                        {
                            let trig_core = core.clone();
                            Box::new(move |_sst: &SharedStateTable| {
                                trig_core.sender_notify.notify_one();
                                trig_core
                                    .state
                                    .lock()
                                    .unwrap()
                                    .next_message_to_deliver[subgroup] += 1;
                            })
                        },
                        PredicateKind::Recurrent,
                    ));
                }
            } else if let Some(my_sender_rank) = settings.my_sender_rank {
                // raw mode gates on receipt instead of delivery
                let snd_core = core.clone();
                let snd_shard_rows = shard_rows.clone();
                let col = off + my_sender_rank;
                handles.push(core.sst.predicates.insert(
                    Box::new(move |snap: &SstSnapshot| {
                        let future = snd_core
                            .state
                            .lock()
                            .unwrap()
                            .future_message_indices[subgroup];
                        for &row in &snd_shard_rows {
                            if snap.num_received(row, col)
                                < future - 1 - window
                            {
                                return false;
                            }
                        }
                        true
                    }),
                    {
                        let trig_core = core.clone();
                        Box::new(move |_sst: &SharedStateTable| {
                            trig_core.sender_notify.notify_one();
                        })
                    },
                    PredicateKind::Recurrent,
                ));
            }
        }

        *core.pred_handles.lock().unwrap() = handles;
    }

    /// Callback run by the persistence writer once a record is durable:
    /// fires the local-persistence upcall, frees the record's buffer, and
    /// publishes the advanced `persisted_num`.
    fn make_written_callback(
        core: &Arc<GroupCore>,
    ) -> Box<dyn Fn(&PersistRecord) + Send> {
        let core = core.clone();
        Box::new(move |record| {
            let settings = core.settings(record.subgroup);
            let Some(sender_rank) = settings.sender_rank_of(record.sender)
            else {
                pf_error!(
                    "persisted record from unknown sender {}",
                    record.sender
                );
                return;
            };
            let ns = settings.num_senders() as i64;
            let seq = record.index * ns + sender_rank as i64;

            (core.callbacks.local_persistence)(
                record.subgroup,
                record.sender,
                record.index,
                &record.payload,
            );

            {
                let mut state = core.state.lock().unwrap();
                if let Some(msg) = state.non_persistent_bulk
                    [record.subgroup]
                    .remove(&seq)
                {
                    if msg.buffer.capacity() > 0 {
                        state.free_message_buffers[record.subgroup]
                            .push(msg.buffer);
                    }
                } else if state.non_persistent_slot[record.subgroup]
                    .remove(&seq)
                    .is_none()
                {
                    pf_warn!(
                        "persisted record seq {} not found in pending \
                         queues",
                        seq
                    );
                }
                if seq
                    > core
                        .sst
                        .persisted_num(core.member_index, record.subgroup)
                {
                    core.sst.set_persisted_num(record.subgroup, seq);
                    let layout = core.sst.layout().clone();
                    core.sst.put(
                        &core.shard_rows(record.subgroup),
                        layout.persisted_num(record.subgroup),
                    );
                }
            }
        })
    }

    /// Sender task: waits for admissible work, issues bulk sends.
    async fn sender_task(core: Arc<GroupCore>) {
        pf_debug!("sender task spawned");
        loop {
            if core.is_wedged() {
                break;
            }
            match core.pick_next_send() {
                Some((gid, bytes)) => {
                    if let Err(e) = core.bulk.send(gid, &bytes) {
                        pf_error!("bulk send failed: {}", e);
                        core.send_failed.store(true, Ordering::Release);
                        core.wedge();
                        break;
                    }
                }
                None => core.sender_notify.notified().await,
            }
        }
        pf_debug!("sender task exited");
    }

    /// Heartbeat task: periodically replicates this node's heartbeat byte
    /// with completion tracking; completion failures are the fine-grained
    /// peer-failure signal.
    async fn heartbeat_task(core: Arc<GroupCore>) {
        pf_debug!("heartbeat task spawned");
        let me_row = core.member_index;
        let targets: Vec<usize> = (0..core.members.len())
            .filter(|&row| row != me_row)
            .collect();
        let completion_timeout = (core.heartbeat_interval * 10)
            .max(Duration::from_millis(200));
        let mut interval = time::interval(core.heartbeat_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut reported: HashSet<usize> = HashSet::new();

        loop {
            interval.tick().await;
            if core.is_wedged() {
                break;
            }
            if targets.is_empty() {
                continue;
            }
            core.sst.bump_heartbeat();
            let layout = core.sst.layout().clone();
            let failed = core
                .sst
                .put_with_completion(
                    &targets,
                    layout.heartbeat(me_row),
                    completion_timeout,
                )
                .await;
            for rank in failed {
                if reported.insert(rank) {
                    pf_warn!(
                        "heartbeat completion failed for member rank {}",
                        rank
                    );
                    if let Some(tx) = &core.tx_peer_failure {
                        let _ = tx.send((core.sst.vid(), rank));
                    }
                }
            }
        }
        pf_debug!("heartbeat task exited");
    }

    /// Returns a writable send buffer of exactly `payload_size` bytes, or
    /// `None` if the group is wedged, the window is full, capacity is
    /// exhausted, or this node is not a sender of the subgroup.
    pub(crate) fn get_sendbuffer(
        &self,
        subgroup: SubgroupId,
        payload_size: usize,
        medium: Medium,
        pause_sending_turns: u32,
        cooked_send: bool,
        null_send: bool,
    ) -> Option<SendBuffer> {
        let core = &self.core;
        if core.is_wedged()
            || core.send_failed.load(Ordering::Acquire)
            || !core.bulk_groups_created.load(Ordering::Acquire)
        {
            return None;
        }
        let settings = core.subgroups.get(&subgroup)?;
        let sender_rank = settings.my_sender_rank?;
        let ns = settings.num_senders() as i64;
        let off = settings.num_received_offset;
        let window = core.window_size as i64;

        let msg_size = if null_send {
            HEADER_SIZE
        } else {
            HEADER_SIZE + payload_size
        };
        if msg_size > core.max_msg_size {
            pf_warn!(
                "message of {} bytes exceeds the maximum of {}",
                msg_size,
                core.max_msg_size
            );
            return None;
        }

        let shard_rows = core.shard_rows(subgroup);
        let mut state = core.state.lock().unwrap();
        let future = state.future_message_indices[subgroup];

        // window flow control
        if settings.mode == Mode::Ordered {
            let gate = (future - window) * ns + sender_rank as i64;
            for &row in &shard_rows {
                if core.sst.delivered_num(row, subgroup) < gate {
                    return None;
                }
                if core.persist_enabled
                    && core.sst.persisted_num(row, subgroup) < gate
                {
                    return None;
                }
            }
        } else {
            for &row in &shard_rows {
                if core.sst.num_received(row, off + sender_rank)
                    < future - window
                {
                    return None;
                }
            }
        }

        let payload_size = msg_size - HEADER_SIZE;
        let kind = match medium {
            Medium::Bulk => {
                let buffer = state.free_message_buffers[subgroup].pop()?;
                SendKind::Bulk { buffer }
            }
            Medium::Slot => {
                if msg_size > core.sst.layout().params.max_slot_msg_size {
                    pf_warn!(
                        "message of {} bytes too large for a slot",
                        msg_size
                    );
                    return None;
                }
                // every receiver must have consumed the slot being reused
                for &row in &shard_rows {
                    if core.sst.num_received_sst(row, off + sender_rank)
                        < future - window
                    {
                        return None;
                    }
                }
                SendKind::Slot {
                    data: vec![0u8; msg_size],
                }
            }
        };

        Some(SendBuffer {
            core: core.clone(),
            subgroup,
            payload_size,
            msg_size,
            pause_sending_turns,
            cooked_send,
            kind: Some(kind),
        })
    }

    /// Commits a prepared send buffer: assigns its per-sender index and
    /// hands it to the chosen transport path. Returns false if the group
    /// has wedged since the buffer was prepared.
    pub(crate) fn send(&self, mut buffer: SendBuffer) -> bool {
        let core = &self.core;
        debug_assert!(Arc::ptr_eq(&buffer.core, core));
        if core.is_wedged() || core.send_failed.load(Ordering::Acquire) {
            return false; // Drop returns any pooled buffer
        }
        let Some(kind) = buffer.kind.take() else {
            return false;
        };
        let subgroup = buffer.subgroup;
        let msg_size = buffer.msg_size;
        let window = core.window_size as i64;

        let mut state = core.state.lock().unwrap();
        let index = state.future_message_indices[subgroup];
        state.future_message_indices[subgroup] +=
            buffer.pause_sending_turns as i64 + 1;
        let header = MessageHeader::new(
            index,
            buffer.pause_sending_turns,
            buffer.cooked_send,
        );

        match kind {
            SendKind::Bulk { mut buffer } => {
                header.encode_into(buffer.bytes_mut());
                state.pending_sends[subgroup].push_back(BulkMessage {
                    sender_id: core.my_node_id,
                    index,
                    size: msg_size,
                    buffer,
                });
                drop(state);
                core.sender_notify.notify_one();
            }
            SendKind::Slot { mut data } => {
                drop(state);
                header.encode_into(&mut data);
                let slot = (index % window) as usize;
                let shard_rows = core.shard_rows(subgroup);
                let layout = core.sst.layout().clone();
                // contents strictly before the next_seq bump
                core.sst.set_slot_contents(subgroup, slot, &data);
                core.sst
                    .put(&shard_rows, layout.slot_contents(subgroup, slot));
                core.sst.set_slot_next_seq(
                    subgroup,
                    slot,
                    index / window + 1,
                );
                core.sst
                    .put(&shard_rows, layout.slot_next_seq(subgroup, slot));
            }
        }
        true
    }

    /// Forces delivery of everything up to the given per-sender indices,
    /// regardless of the current stability frontier. Used by ragged-edge
    /// cleanup during a view change.
    pub(crate) fn deliver_messages_upto(
        &self,
        max_indices_per_sender: &[i64],
        subgroup: SubgroupId,
    ) {
        let core = &self.core;
        let settings = core.settings(subgroup);
        let ns = settings.num_senders() as i64;
        debug_assert_eq!(max_indices_per_sender.len(), ns as usize);

        let mut state = core.state.lock().unwrap();
        let curr_seq = core.sst.delivered_num(core.member_index, subgroup);
        let mut max_seq = curr_seq;
        for (sender, &index) in max_indices_per_sender.iter().enumerate() {
            max_seq = max_seq.max(index * ns + sender as i64);
        }

        for seq in (curr_seq + 1)..=max_seq {
            // each sender is bounded by its own frontier entry; a message
            // past it may be held here but not by every live member, so
            // delivering it would diverge the delivered streams
            let sender = seq.rem_euclid(ns) as usize;
            let index = seq.div_euclid(ns);
            if index > max_indices_per_sender[sender] {
                continue;
            }
            if let Some(msg) =
                state.locally_stable_bulk[subgroup].remove(&seq)
            {
                core.deliver_bulk(&mut state, subgroup, msg);
            } else if let Some(msg) =
                state.locally_stable_slot[subgroup].remove(&seq)
            {
                core.deliver_slot(&mut state, subgroup, msg);
            }
        }
    }

    /// Min of the shard's published `stable_num`s.
    pub(crate) fn stability_frontier(&self, subgroup: SubgroupId) -> i64 {
        let core = &self.core;
        let mut frontier = i64::MAX;
        for row in core.shard_rows(subgroup) {
            frontier = frontier.min(core.sst.stable_num(row, subgroup));
        }
        frontier
    }

    /// Whether every delivered message has been acknowledged durable.
    /// Vacuously true when persistence is disabled.
    pub(crate) fn pending_persistence_empty(&self) -> bool {
        let state = self.core.state.lock().unwrap();
        state.non_persistent_bulk.iter().all(BTreeMap::is_empty)
            && state.non_persistent_slot.iter().all(BTreeMap::is_empty)
    }

    /// Terminal shutdown; all public operations fail afterwards.
    pub(crate) fn wedge(&self) {
        self.core.wedge();
    }

    /// Count of free buffers currently pooled for a subgroup.
    #[cfg(test)]
    fn free_buffer_count(&self, subgroup: SubgroupId) -> usize {
        self.core.state.lock().unwrap().free_message_buffers[subgroup].len()
    }
}

impl Drop for MulticastGroup {
    fn drop(&mut self) {
        self.core.wedge();
    }
}

#[cfg(test)]
mod group_tests {
    use super::*;
    use crate::sst::{LayoutParams, RowLayout};
    use std::net::SocketAddr;
    use std::path::Path;

    type DeliveryLog = Arc<Mutex<Vec<(NodeId, i64, Vec<u8>)>>>;

    struct TestNode {
        sst: Arc<SharedStateTable>,
        bulk: Arc<BulkHub>,
        group: MulticastGroup,
        delivered: DeliveryLog,
        persisted: Arc<Mutex<Vec<i64>>>,
    }

    /// Builds one member of a single-subgroup shard in which every member
    /// is a sender.
    async fn build_node(
        my_id: NodeId,
        members: Vec<NodeId>,
        sst_base: u16,
        bulk_base: u16,
        mode: Mode,
        window: usize,
        persist_path: Option<&str>,
    ) -> TestNode {
        let n = members.len();
        let my_rank = members.iter().position(|&m| m == my_id).unwrap();
        let layout = RowLayout::new(LayoutParams {
            num_members: n,
            change_capacity: 2,
            contact_capacity: 64,
            total_senders: n,
            num_subgroups: 1,
            window_size: window,
            max_slot_msg_size: 128 + HEADER_SIZE,
        });
        let sst_addrs: Vec<SocketAddr> = (0..n)
            .map(|i| {
                format!("127.0.0.1:{}", sst_base + i as u16)
                    .parse()
                    .unwrap()
            })
            .collect();
        let bulk_addrs: Vec<SocketAddr> = (0..n)
            .map(|i| {
                format!("127.0.0.1:{}", bulk_base + i as u16)
                    .parse()
                    .unwrap()
            })
            .collect();

        let sst =
            SharedStateTable::new_and_setup(my_rank, 0, &sst_addrs, layout)
                .await
                .unwrap();
        let bulk = BulkHub::new_and_setup(my_id, &members, &bulk_addrs, 0)
            .await
            .unwrap();

        let settings = SubgroupSettings {
            members: members.clone(),
            senders: Bitmap::new(n, true),
            my_shard_rank: Some(my_rank),
            my_sender_rank: Some(my_rank),
            num_received_offset: 0,
            mode,
        };

        let delivered: DeliveryLog = Arc::new(Mutex::new(Vec::new()));
        let persisted = Arc::new(Mutex::new(Vec::new()));
        let delivered_ref = delivered.clone();
        let persisted_ref = persisted.clone();
        let callbacks = DeliveryCallbacks {
            global_stability: Arc::new(move |_, sender, index, payload| {
                delivered_ref.lock().unwrap().push((
                    sender,
                    index,
                    payload.to_vec(),
                ));
            }),
            rpc: Arc::new(|_, _, _| {}),
            local_persistence: Arc::new(move |_, _, index, _| {
                persisted_ref.lock().unwrap().push(index);
            }),
        };

        let writer = match persist_path {
            Some(path) => {
                let _ = std::fs::remove_file(path);
                Some(Arc::new(
                    PersistWriter::new_and_setup(Path::new(path))
                        .await
                        .unwrap(),
                ))
            }
            None => None,
        };

        let params = GroupParams {
            my_node_id: my_id,
            members,
            sst: sst.clone(),
            bulk: bulk.clone(),
            total_num_subgroups: 1,
            subgroups: HashMap::from([(0, settings)]),
            callbacks,
            window_size: window,
            max_payload_size: 128,
            heartbeat_interval: Duration::from_millis(50),
            already_failed: vec![false; n],
            writer,
            tx_peer_failure: None,
        };
        let group = MulticastGroup::new_and_setup(params).await.unwrap();

        TestNode {
            sst,
            bulk,
            group,
            delivered,
            persisted,
        }
    }

    /// Retries `get_sendbuffer` until the window opens, then commits.
    async fn send_until_ok(
        node: &TestNode,
        payload: &[u8],
        medium: Medium,
        pause_sending_turns: u32,
    ) {
        loop {
            if let Some(mut buffer) = node.group.get_sendbuffer(
                0,
                payload.len(),
                medium,
                pause_sending_turns,
                false,
                false,
            ) {
                buffer.payload_mut().copy_from_slice(payload);
                assert!(node.group.send(buffer));
                return;
            }
            time::sleep(Duration::from_millis(2)).await;
        }
    }

    async fn await_delivered(
        node: &TestNode,
        count: usize,
    ) -> Vec<(NodeId, i64, Vec<u8>)> {
        for _ in 0..5000 {
            if node.delivered.lock().unwrap().len() >= count {
                break;
            }
            time::sleep(Duration::from_millis(2)).await;
        }
        node.delivered.lock().unwrap().clone()
    }

    fn teardown(node: TestNode) {
        node.group.wedge();
        node.bulk.stop();
        node.sst.stop();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 6)]
    async fn ordered_broadcast_three_nodes() -> Result<(), ShardcastError> {
        let (tx_log, mut rx_log) = mpsc::unbounded_channel();
        for node_id in [1u32, 2u32] {
            let tx_log = tx_log.clone();
            tokio::spawn(async move {
                let node = build_node(
                    node_id,
                    vec![0, 1, 2],
                    31011,
                    31021,
                    Mode::Ordered,
                    3,
                    None,
                )
                .await;
                for i in 0..10 {
                    let payload = format!("{}-{}", node_id, i);
                    send_until_ok(
                        &node,
                        payload.as_bytes(),
                        Medium::Bulk,
                        0,
                    )
                    .await;
                }
                let log = await_delivered(&node, 30).await;
                tx_log.send((node_id, log)).unwrap();
                // stay up until the slower members finish delivering
                time::sleep(Duration::from_millis(800)).await;
                teardown(node);
            });
        }

        let node = build_node(
            0,
            vec![0, 1, 2],
            31011,
            31021,
            Mode::Ordered,
            3,
            None,
        )
        .await;
        for i in 0..10 {
            let payload = format!("0-{}", i);
            send_until_ok(&node, payload.as_bytes(), Medium::Bulk, 0).await;
        }
        let log0 = await_delivered(&node, 30).await;
        assert_eq!(log0.len(), 30);

        // restricted to any sender, indices are exactly 0..9 in order
        for sender in [0u32, 1, 2] {
            let indices: Vec<i64> = log0
                .iter()
                .filter(|(s, _, _)| *s == sender)
                .map(|(_, index, _)| *index)
                .collect();
            assert_eq!(indices, (0..10).collect::<Vec<i64>>());
        }
        // payloads carry what the sender wrote
        for (sender, index, payload) in &log0 {
            assert_eq!(
                payload,
                format!("{}-{}", sender, index).as_bytes()
            );
        }
        // the global order is identical on every node
        for _ in 0..2 {
            let (node_id, log) = rx_log.recv().await.unwrap();
            assert_eq!(log, log0, "node {} delivered differently", node_id);
        }

        time::sleep(Duration::from_millis(800)).await;
        teardown(node);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn raw_mode_immediate_delivery() -> Result<(), ShardcastError> {
        let barrier = Arc::new(tokio::sync::Barrier::new(2));
        let barrier1 = barrier.clone();

        tokio::spawn(async move {
            // node 0: the sender
            let node = build_node(
                0,
                vec![0, 1],
                31111,
                31121,
                Mode::Raw,
                3,
                None,
            )
            .await;
            send_until_ok(&node, b"A", Medium::Slot, 0).await;
            send_until_ok(&node, b"B", Medium::Slot, 0).await;
            barrier1.wait().await;
            teardown(node);
        });

        let node =
            build_node(1, vec![0, 1], 31111, 31121, Mode::Raw, 3, None)
                .await;
        let log = await_delivered(&node, 2).await;
        assert_eq!(log.len(), 2);
        assert_eq!(log[0], (0, 0, b"A".to_vec()));
        assert_eq!(log[1], (0, 1, b"B".to_vec()));
        // raw mode never advances the stability/delivery columns
        for row in 0..2 {
            assert_eq!(node.sst.stable_num(row, 0), -1);
            assert_eq!(node.sst.delivered_num(row, 0), -1);
        }
        barrier.wait().await;
        teardown(node);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn pause_turns_reserve_sequence_slots() -> Result<(), ShardcastError>
    {
        let barrier = Arc::new(tokio::sync::Barrier::new(2));
        let barrier1 = barrier.clone();

        tokio::spawn(async move {
            // node 1: sender rank 1, four plain messages
            let node = build_node(
                1,
                vec![0, 1],
                31211,
                31221,
                Mode::Ordered,
                5,
                None,
            )
            .await;
            for i in 0..4 {
                let payload = format!("x{}", i);
                send_until_ok(&node, payload.as_bytes(), Medium::Bulk, 0)
                    .await;
            }
            let _ = await_delivered(&node, 6).await;
            barrier1.wait().await;
            time::sleep(Duration::from_millis(300)).await;
            teardown(node);
        });

        // node 0: sender rank 0, skips two turns after "A"; goes through
        // the slot path so skipped turns are exercised on both media
        let node = build_node(
            0,
            vec![0, 1],
            31211,
            31221,
            Mode::Ordered,
            5,
            None,
        )
        .await;
        send_until_ok(&node, b"A", Medium::Slot, 2).await;
        send_until_ok(&node, b"B", Medium::Slot, 0).await;

        let log = await_delivered(&node, 6).await;
        assert_eq!(log.len(), 6);
        // the two reserved turns became silent placeholders, so this
        // sender's payloads carry indices 0 and 3
        let mine: Vec<(i64, Vec<u8>)> = log
            .iter()
            .filter(|(sender, _, _)| *sender == 0)
            .map(|(_, index, payload)| (*index, payload.clone()))
            .collect();
        assert_eq!(
            mine,
            vec![(0, b"A".to_vec()), (3, b"B".to_vec())]
        );
        barrier.wait().await;
        time::sleep(Duration::from_millis(300)).await;
        teardown(node);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn ordered_slot_two_nodes() -> Result<(), ShardcastError> {
        let (tx_log, mut rx_log) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            let node = build_node(
                1,
                vec![0, 1],
                31411,
                31421,
                Mode::Ordered,
                3,
                None,
            )
            .await;
            for i in 0..5 {
                let payload = format!("s1-{}", i);
                send_until_ok(&node, payload.as_bytes(), Medium::Slot, 0)
                    .await;
            }
            let log = await_delivered(&node, 10).await;
            tx_log.send(log).unwrap();
            time::sleep(Duration::from_millis(500)).await;
            teardown(node);
        });

        let node = build_node(
            0,
            vec![0, 1],
            31411,
            31421,
            Mode::Ordered,
            3,
            None,
        )
        .await;
        for i in 0..5 {
            let payload = format!("s0-{}", i);
            send_until_ok(&node, payload.as_bytes(), Medium::Slot, 0).await;
        }
        let log0 = await_delivered(&node, 10).await;
        assert_eq!(log0.len(), 10);
        let log1 = rx_log.recv().await.unwrap();
        assert_eq!(log1, log0);

        time::sleep(Duration::from_millis(500)).await;
        teardown(node);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 3)]
    async fn persistence_gates_and_reports() -> Result<(), ShardcastError> {
        let path = "/tmp/test-shardcast-gating.plog";
        let node = build_node(
            7,
            vec![7],
            31311,
            31321,
            Mode::Ordered,
            2,
            Some(path),
        )
        .await;

        for i in 0..5 {
            let payload = format!("p{}", i);
            send_until_ok(&node, payload.as_bytes(), Medium::Bulk, 0).await;
        }

        // all five records durable, acknowledged in delivery order
        for _ in 0..5000 {
            if node.persisted.lock().unwrap().len() >= 5 {
                break;
            }
            time::sleep(Duration::from_millis(2)).await;
        }
        assert_eq!(*node.persisted.lock().unwrap(), vec![0, 1, 2, 3, 4]);
        // the acknowledgement's bookkeeping (buffer return, persisted_num
        // publication) follows the upcall; give it a beat to settle
        time::sleep(Duration::from_millis(100)).await;
        assert_eq!(node.sst.persisted_num(0, 0), 4);

        // every buffer returned: |free| == window_size * shard_size
        assert_eq!(node.group.free_buffer_count(0), 2);

        let records = PersistWriter::read_all(Path::new(path)).await?;
        assert_eq!(records.len(), 5);
        for (i, record) in records.iter().enumerate() {
            assert_eq!(record.index, i as i64);
            assert_eq!(record.payload, format!("p{}", i).into_bytes());
        }

        teardown(node);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 3)]
    async fn null_sends_and_window_boundaries() -> Result<(), ShardcastError>
    {
        let node = build_node(
            3,
            vec![3],
            31511,
            31521,
            Mode::Ordered,
            2,
            None,
        )
        .await;

        // the pool holds exactly window_size * shard_size buffers
        let first = node
            .group
            .get_sendbuffer(0, 8, Medium::Bulk, 0, false, false)
            .unwrap();
        let second = node
            .group
            .get_sendbuffer(0, 8, Medium::Bulk, 0, false, false)
            .unwrap();
        assert!(node
            .group
            .get_sendbuffer(0, 8, Medium::Bulk, 0, false, false)
            .is_none());
        drop(first);
        drop(second);
        assert!(node
            .group
            .get_sendbuffer(0, 8, Medium::Bulk, 0, false, false)
            .is_some());

        // oversized payloads are refused outright
        assert!(node
            .group
            .get_sendbuffer(0, 4096, Medium::Bulk, 0, false, false)
            .is_none());

        // a null send consumes a sequence slot without an upcall
        let null_buffer = node
            .group
            .get_sendbuffer(0, 0, Medium::Bulk, 0, false, true)
            .unwrap();
        assert_eq!(null_buffer.payload_size(), 0);
        assert!(node.group.send(null_buffer));
        send_until_ok(&node, b"real", Medium::Bulk, 0).await;

        let log = await_delivered(&node, 1).await;
        assert_eq!(log, vec![(3, 1, b"real".to_vec())]);
        // delivered_num covers the null message's sequence number too
        for _ in 0..1000 {
            if node.sst.delivered_num(0, 0) >= 1 {
                break;
            }
            time::sleep(Duration::from_millis(2)).await;
        }
        assert_eq!(node.sst.delivered_num(0, 0), 1);

        // wedging is terminal: public operations fail from then on
        let staged = node
            .group
            .get_sendbuffer(0, 4, Medium::Bulk, 0, false, false)
            .unwrap();
        node.group.wedge();
        node.group.wedge(); // re-entering is a no-op
        assert!(!node.group.send(staged));
        assert!(node
            .group
            .get_sendbuffer(0, 4, Medium::Bulk, 0, false, false)
            .is_none());
        let before = node.delivered.lock().unwrap().len();
        time::sleep(Duration::from_millis(50)).await;
        assert_eq!(node.delivered.lock().unwrap().len(), before);

        teardown(node);
        Ok(())
    }
}


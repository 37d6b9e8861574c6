//! The shared-state table: one fixed-layout row per member, replicated by
//! one-sided writes.
//!
//! Each member owns its row and may write only to it; `put` replicates a
//! byte range of the owned row to the listed member ranks. Reads of other
//! members' rows see whatever the latest applied writes left there. A single
//! predicate-loop task evaluates registered predicates against a per-cycle
//! snapshot of all rows.

use std::net::SocketAddr;
use std::ops::Range;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use crate::sst::exchange::SstExchange;
use crate::sst::layout::RowLayout;
use crate::sst::predicates::PredicateRegistry;
use crate::utils::ShardcastError;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{self, Duration, MissedTickBehavior};

#[inline]
fn read_i64(bytes: &[u8], range: Range<usize>) -> i64 {
    i64::from_le_bytes(bytes[range].try_into().unwrap())
}

#[inline]
fn read_i32(bytes: &[u8], range: Range<usize>) -> i32 {
    i32::from_le_bytes(bytes[range].try_into().unwrap())
}

#[inline]
fn read_u32(bytes: &[u8], range: Range<usize>) -> u32 {
    u32::from_le_bytes(bytes[range].try_into().unwrap())
}

/// Consistent copy of all rows taken at the start of a predicate cycle.
pub(crate) struct SstSnapshot {
    pub(crate) layout: Arc<RowLayout>,
    rows: Vec<Box<[u8]>>,
}

impl SstSnapshot {
    #[inline]
    pub(crate) fn num_rows(&self) -> usize {
        self.rows.len()
    }

    #[inline]
    pub(crate) fn vid(&self, row: usize) -> i32 {
        read_i32(&self.rows[row], self.layout.vid())
    }

    #[inline]
    pub(crate) fn suspected(&self, row: usize, member: usize) -> bool {
        self.rows[row][self.layout.suspected(member).start] != 0
    }

    #[inline]
    pub(crate) fn change(&self, row: usize, idx: usize) -> u32 {
        read_u32(&self.rows[row], self.layout.changes(idx))
    }

    #[inline]
    pub(crate) fn joiner_id(&self, row: usize, idx: usize) -> u32 {
        read_u32(&self.rows[row], self.layout.joiner_ids(idx))
    }

    /// Joiner contact string, trimmed at the first NUL byte.
    pub(crate) fn joiner_contact(&self, row: usize, idx: usize) -> String {
        let bytes = &self.rows[row][self.layout.joiner_contacts(idx)];
        let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
        String::from_utf8_lossy(&bytes[..end]).into_owned()
    }

    #[inline]
    pub(crate) fn n_changes(&self, row: usize) -> i32 {
        read_i32(&self.rows[row], self.layout.n_changes())
    }

    #[inline]
    pub(crate) fn n_committed(&self, row: usize) -> i32 {
        read_i32(&self.rows[row], self.layout.n_committed())
    }

    #[inline]
    pub(crate) fn n_acked(&self, row: usize) -> i32 {
        read_i32(&self.rows[row], self.layout.n_acked())
    }

    #[inline]
    pub(crate) fn n_installed(&self, row: usize) -> i32 {
        read_i32(&self.rows[row], self.layout.n_installed())
    }

    #[inline]
    pub(crate) fn num_received(&self, row: usize, col: usize) -> i64 {
        read_i64(&self.rows[row], self.layout.num_received(col))
    }

    #[inline]
    pub(crate) fn num_received_sst(&self, row: usize, col: usize) -> i64 {
        read_i64(&self.rows[row], self.layout.num_received_sst(col))
    }

    #[inline]
    pub(crate) fn seq_num(&self, row: usize, subgroup: usize) -> i64 {
        read_i64(&self.rows[row], self.layout.seq_num(subgroup))
    }

    #[inline]
    pub(crate) fn stable_num(&self, row: usize, subgroup: usize) -> i64 {
        read_i64(&self.rows[row], self.layout.stable_num(subgroup))
    }

    #[inline]
    pub(crate) fn delivered_num(&self, row: usize, subgroup: usize) -> i64 {
        read_i64(&self.rows[row], self.layout.delivered_num(subgroup))
    }

    #[inline]
    pub(crate) fn persisted_num(&self, row: usize, subgroup: usize) -> i64 {
        read_i64(&self.rows[row], self.layout.persisted_num(subgroup))
    }

    #[inline]
    pub(crate) fn slot_next_seq(
        &self,
        row: usize,
        subgroup: usize,
        slot: usize,
    ) -> i64 {
        read_i64(&self.rows[row], self.layout.slot_next_seq(subgroup, slot))
    }

    #[inline]
    pub(crate) fn global_min(&self, row: usize, col: usize) -> i64 {
        read_i64(&self.rows[row], self.layout.global_min(col))
    }

    #[inline]
    pub(crate) fn global_min_ready(&self, row: usize, subgroup: usize) -> bool {
        self.rows[row][self.layout.global_min_ready(subgroup).start] != 0
    }
}

/// The shared-state table for one view.
pub(crate) struct SharedStateTable {
    my_rank: usize,
    vid: i32,
    layout: Arc<RowLayout>,
    rows: Arc<RwLock<Vec<Box<[u8]>>>>,

    /// Registered predicates, run by the predicate-loop task.
    pub(crate) predicates: PredicateRegistry,

    exchange: Arc<SstExchange>,
    pred_notify: Arc<Notify>,
    shutdown: AtomicBool,
    loop_handle: Mutex<Option<JoinHandle<()>>>,
}

impl SharedStateTable {
    /// Creates the table for one view: allocates rows, brings up the
    /// replication links to all other members, initializes counter columns
    /// and spawns the predicate-loop task.
    pub(crate) async fn new_and_setup(
        my_rank: usize,
        vid: i32,
        addrs: &[SocketAddr],
        layout: RowLayout,
    ) -> Result<Arc<Self>, ShardcastError> {
        let layout = Arc::new(layout);
        let num_members = addrs.len();
        debug_assert_eq!(num_members, layout.params.num_members);

        let rows: Vec<Box<[u8]>> = (0..num_members)
            .map(|_| vec![0u8; layout.row_size()].into_boxed_slice())
            .collect();
        let rows = Arc::new(RwLock::new(rows));
        let pred_notify = Arc::new(Notify::new());

        let exchange = SstExchange::new_and_setup(
            my_rank,
            vid,
            addrs,
            rows.clone(),
            pred_notify.clone(),
        )
        .await?;

        let table = Arc::new(SharedStateTable {
            my_rank,
            vid,
            layout,
            rows,
            predicates: PredicateRegistry::new(),
            exchange,
            pred_notify,
            shutdown: AtomicBool::new(false),
            loop_handle: Mutex::new(None),
        });

        table.init_row_defaults();

        let table_ref = table.clone();
        let handle = tokio::spawn(async move {
            Self::predicate_loop(table_ref).await;
        });
        *table.loop_handle.lock().unwrap() = Some(handle);

        Ok(table)
    }

    /// Sets the sentinel (-1) starting values of every counter column in
    /// every local row replica, so minima computed before the first remote
    /// write are correct.
    fn init_row_defaults(&self) {
        let layout = &self.layout;
        let mut rows = self.rows.write().unwrap();
        for row in rows.iter_mut() {
            row[layout.vid()].copy_from_slice(&self.vid.to_le_bytes());
            for col in 0..layout.params.total_senders {
                row[layout.num_received(col)]
                    .copy_from_slice(&(-1i64).to_le_bytes());
                row[layout.num_received_sst(col)]
                    .copy_from_slice(&(-1i64).to_le_bytes());
                row[layout.global_min(col)]
                    .copy_from_slice(&(-1i64).to_le_bytes());
            }
            for sg in 0..layout.params.num_subgroups {
                row[layout.seq_num(sg)]
                    .copy_from_slice(&(-1i64).to_le_bytes());
                row[layout.stable_num(sg)]
                    .copy_from_slice(&(-1i64).to_le_bytes());
                row[layout.delivered_num(sg)]
                    .copy_from_slice(&(-1i64).to_le_bytes());
                row[layout.persisted_num(sg)]
                    .copy_from_slice(&(-1i64).to_le_bytes());
            }
        }
    }

    #[inline]
    pub(crate) fn my_rank(&self) -> usize {
        self.my_rank
    }

    #[inline]
    pub(crate) fn vid(&self) -> i32 {
        self.vid
    }

    #[inline]
    pub(crate) fn num_rows(&self) -> usize {
        self.layout.params.num_members
    }

    #[inline]
    pub(crate) fn layout(&self) -> &Arc<RowLayout> {
        &self.layout
    }

    /// Takes a consistent copy of all rows.
    pub(crate) fn snapshot(&self) -> SstSnapshot {
        let rows = self.rows.read().unwrap();
        SstSnapshot {
            layout: self.layout.clone(),
            rows: rows.clone(),
        }
    }

    // live reads of arbitrary rows, for code running off-cycle

    pub(crate) fn n_changes(&self, row: usize) -> i32 {
        let rows = self.rows.read().unwrap();
        read_i32(&rows[row], self.layout.n_changes())
    }

    pub(crate) fn change(&self, row: usize, idx: usize) -> u32 {
        let rows = self.rows.read().unwrap();
        read_u32(&rows[row], self.layout.changes(idx))
    }

    pub(crate) fn num_received(&self, row: usize, col: usize) -> i64 {
        let rows = self.rows.read().unwrap();
        read_i64(&rows[row], self.layout.num_received(col))
    }

    pub(crate) fn num_received_sst(&self, row: usize, col: usize) -> i64 {
        let rows = self.rows.read().unwrap();
        read_i64(&rows[row], self.layout.num_received_sst(col))
    }

    pub(crate) fn seq_num(&self, row: usize, subgroup: usize) -> i64 {
        let rows = self.rows.read().unwrap();
        read_i64(&rows[row], self.layout.seq_num(subgroup))
    }

    pub(crate) fn stable_num(&self, row: usize, subgroup: usize) -> i64 {
        let rows = self.rows.read().unwrap();
        read_i64(&rows[row], self.layout.stable_num(subgroup))
    }

    pub(crate) fn delivered_num(&self, row: usize, subgroup: usize) -> i64 {
        let rows = self.rows.read().unwrap();
        read_i64(&rows[row], self.layout.delivered_num(subgroup))
    }

    pub(crate) fn persisted_num(&self, row: usize, subgroup: usize) -> i64 {
        let rows = self.rows.read().unwrap();
        read_i64(&rows[row], self.layout.persisted_num(subgroup))
    }

    pub(crate) fn slot_next_seq(
        &self,
        row: usize,
        subgroup: usize,
        slot: usize,
    ) -> i64 {
        let rows = self.rows.read().unwrap();
        read_i64(&rows[row], self.layout.slot_next_seq(subgroup, slot))
    }

    /// Copies out a slot's used bytes (`size` worth of its payload buffer).
    pub(crate) fn slot_bytes_copy(
        &self,
        row: usize,
        subgroup: usize,
        slot: usize,
    ) -> Vec<u8> {
        let rows = self.rows.read().unwrap();
        let size =
            read_i32(&rows[row], self.layout.slot_size(subgroup, slot))
                as usize;
        let buf = self.layout.slot_buf(subgroup, slot);
        rows[row][buf.start..buf.start + size].to_vec()
    }

    // writes into the owned row; replication is a separate `put`

    fn write_own(&self, range: Range<usize>, bytes: &[u8]) {
        debug_assert_eq!(range.len(), bytes.len());
        let mut rows = self.rows.write().unwrap();
        rows[self.my_rank][range].copy_from_slice(bytes);
    }

    pub(crate) fn set_suspected(&self, member: usize, flag: bool) {
        self.write_own(self.layout.suspected(member), &[flag as u8]);
    }

    pub(crate) fn set_change(&self, idx: usize, node: u32) {
        self.write_own(self.layout.changes(idx), &node.to_le_bytes());
    }

    pub(crate) fn set_joiner_id(&self, idx: usize, node: u32) {
        self.write_own(self.layout.joiner_ids(idx), &node.to_le_bytes());
    }

    pub(crate) fn set_joiner_contact(&self, idx: usize, contact: &str) {
        let range = self.layout.joiner_contacts(idx);
        let mut bytes = vec![0u8; range.len()];
        let copied = contact.len().min(range.len());
        bytes[..copied].copy_from_slice(&contact.as_bytes()[..copied]);
        self.write_own(range, &bytes);
    }

    pub(crate) fn set_n_changes(&self, v: i32) {
        self.write_own(self.layout.n_changes(), &v.to_le_bytes());
    }

    pub(crate) fn set_n_committed(&self, v: i32) {
        self.write_own(self.layout.n_committed(), &v.to_le_bytes());
    }

    pub(crate) fn set_n_acked(&self, v: i32) {
        self.write_own(self.layout.n_acked(), &v.to_le_bytes());
    }

    pub(crate) fn set_n_installed(&self, v: i32) {
        self.write_own(self.layout.n_installed(), &v.to_le_bytes());
    }

    /// Copies the whole change-proposal block from another member's row
    /// replica into the owned row (the follower ack step).
    pub(crate) fn copy_change_block_from(&self, row: usize) {
        let range = self.layout.change_block();
        let mut rows = self.rows.write().unwrap();
        let src = rows[row][range.clone()].to_vec();
        rows[self.my_rank][range].copy_from_slice(&src);
    }

    pub(crate) fn set_num_received(&self, col: usize, v: i64) {
        self.write_own(self.layout.num_received(col), &v.to_le_bytes());
    }

    pub(crate) fn set_num_received_sst(&self, col: usize, v: i64) {
        self.write_own(self.layout.num_received_sst(col), &v.to_le_bytes());
    }

    pub(crate) fn set_seq_num(&self, subgroup: usize, v: i64) {
        self.write_own(self.layout.seq_num(subgroup), &v.to_le_bytes());
    }

    pub(crate) fn set_stable_num(&self, subgroup: usize, v: i64) {
        self.write_own(self.layout.stable_num(subgroup), &v.to_le_bytes());
    }

    pub(crate) fn set_delivered_num(&self, subgroup: usize, v: i64) {
        self.write_own(self.layout.delivered_num(subgroup), &v.to_le_bytes());
    }

    pub(crate) fn set_persisted_num(&self, subgroup: usize, v: i64) {
        self.write_own(self.layout.persisted_num(subgroup), &v.to_le_bytes());
    }

    /// Fills a slot's size and payload bytes (not its `next_seq`).
    pub(crate) fn set_slot_contents(
        &self,
        subgroup: usize,
        slot: usize,
        bytes: &[u8],
    ) {
        debug_assert!(bytes.len() <= self.layout.params.max_slot_msg_size);
        let mut rows = self.rows.write().unwrap();
        let row = &mut rows[self.my_rank];
        row[self.layout.slot_size(subgroup, slot)]
            .copy_from_slice(&(bytes.len() as i32).to_le_bytes());
        let buf = self.layout.slot_buf(subgroup, slot);
        row[buf.start..buf.start + bytes.len()].copy_from_slice(bytes);
    }

    pub(crate) fn set_slot_next_seq(
        &self,
        subgroup: usize,
        slot: usize,
        v: i64,
    ) {
        self.write_own(
            self.layout.slot_next_seq(subgroup, slot),
            &v.to_le_bytes(),
        );
    }

    pub(crate) fn bump_heartbeat(&self) {
        let range = self.layout.heartbeat(self.my_rank);
        let cur = {
            let rows = self.rows.read().unwrap();
            rows[self.my_rank][range.start]
        };
        self.write_own(range, &[cur.wrapping_add(1)]);
    }

    pub(crate) fn set_global_min(&self, col: usize, v: i64) {
        self.write_own(self.layout.global_min(col), &v.to_le_bytes());
    }

    pub(crate) fn set_global_min_ready(&self, subgroup: usize, flag: bool) {
        self.write_own(self.layout.global_min_ready(subgroup), &[flag as u8]);
    }

    /// Replicates a byte range of the owned row to the listed ranks
    /// (one-sided, asynchronous, no completion wait).
    pub(crate) fn put(&self, targets: &[usize], range: Range<usize>) {
        let bytes = {
            let rows = self.rows.read().unwrap();
            rows[self.my_rank][range.clone()].to_vec()
        };
        for &target in targets {
            if target != self.my_rank {
                self.exchange.send_update(
                    target,
                    range.start,
                    bytes.clone(),
                );
            }
        }
        // local writes also feed local predicates
        self.pred_notify.notify_one();
    }

    /// Replicates the whole owned row to every other member.
    pub(crate) fn put_everywhere(&self) {
        let targets: Vec<usize> = (0..self.num_rows()).collect();
        self.put(&targets, self.layout.whole_row());
    }

    /// As `put`, but waits for each target to acknowledge the write (or for
    /// its link to be declared broken). Returns the ranks that failed.
    pub(crate) async fn put_with_completion(
        &self,
        targets: &[usize],
        range: Range<usize>,
        timeout: Duration,
    ) -> Vec<usize> {
        self.put(targets, range);
        self.exchange.probe_completion(targets, timeout).await
    }

    /// Barrier ensuring each member has initialized and replicated its row.
    pub(crate) async fn sync_with_members(&self) {
        self.exchange.sync_barrier().await;
    }

    /// Wakes the predicate loop.
    pub(crate) fn nudge(&self) {
        self.pred_notify.notify_one();
    }

    /// Stops the predicate loop and tears down replication links.
    pub(crate) fn stop(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.pred_notify.notify_one();
        self.exchange.stop();
        if let Some(handle) = self.loop_handle.lock().unwrap().take() {
            handle.abort();
        }
    }

    async fn predicate_loop(table: Arc<SharedStateTable>) {
        pf_debug!("predicate loop task spawned");
        let mut tick = time::interval(Duration::from_millis(1));
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = table.pred_notify.notified() => {},
                _ = tick.tick() => {},
            }
            if table.shutdown.load(Ordering::Acquire) {
                break;
            }
            let snapshot = table.snapshot();
            table.predicates.run_cycle(&snapshot, &table);
        }
        pf_debug!("predicate loop task exited");
    }
}

impl Drop for SharedStateTable {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        self.pred_notify.notify_one();
    }
}

#[cfg(test)]
mod table_tests {
    use super::*;
    use crate::sst::layout::LayoutParams;
    use crate::sst::predicates::PredicateKind;
    use std::sync::atomic::AtomicI64;
    use tokio::sync::Barrier;

    fn test_layout(n: usize) -> RowLayout {
        RowLayout::new(LayoutParams {
            num_members: n,
            change_capacity: 4,
            contact_capacity: 64,
            total_senders: n,
            num_subgroups: 1,
            window_size: 3,
            max_slot_msg_size: 64,
        })
    }

    fn test_addrs(base_port: u16, n: usize) -> Vec<SocketAddr> {
        (0..n)
            .map(|i| {
                format!("127.0.0.1:{}", base_port + i as u16)
                    .parse()
                    .unwrap()
            })
            .collect()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 3)]
    async fn put_replicates_columns() -> Result<(), ShardcastError> {
        let addrs = test_addrs(30841, 2);
        let addrs1 = addrs.clone();
        let barrier = Arc::new(Barrier::new(2));
        let barrier1 = barrier.clone();

        tokio::spawn(async move {
            // rank 1
            let table =
                SharedStateTable::new_and_setup(1, 0, &addrs1, test_layout(2))
                    .await?;
            table.sync_with_members().await;
            table.set_seq_num(0, 42);
            table.put(&[0], table.layout().seq_num(0));
            barrier1.wait().await;
            barrier1.wait().await;
            table.stop();
            Ok::<(), ShardcastError>(())
        });

        // rank 0
        let table =
            SharedStateTable::new_and_setup(0, 0, &addrs, test_layout(2))
                .await?;
        table.sync_with_members().await;
        barrier.wait().await;
        let mut seen = -1;
        for _ in 0..200 {
            seen = table.seq_num(1, 0);
            if seen == 42 {
                break;
            }
            time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(seen, 42);
        let snap = table.snapshot();
        assert_eq!(snap.seq_num(1, 0), 42);
        assert_eq!(snap.vid(1), 0);
        // initial sentinel values survive in untouched columns
        assert_eq!(table.num_received(1, 0), -1);
        barrier.wait().await;
        table.stop();
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 3)]
    async fn predicate_fires_on_remote_write() -> Result<(), ShardcastError> {
        let addrs = test_addrs(30851, 2);
        let addrs1 = addrs.clone();
        let barrier = Arc::new(Barrier::new(2));
        let barrier1 = barrier.clone();

        tokio::spawn(async move {
            let table =
                SharedStateTable::new_and_setup(1, 0, &addrs1, test_layout(2))
                    .await?;
            table.sync_with_members().await;
            table.set_stable_num(0, 7);
            table.put(&[0], table.layout().stable_num(0));
            barrier1.wait().await;
            barrier1.wait().await;
            table.stop();
            Ok::<(), ShardcastError>(())
        });

        let table =
            SharedStateTable::new_and_setup(0, 0, &addrs, test_layout(2))
                .await?;
        table.sync_with_members().await;

        let observed = Arc::new(AtomicI64::new(-1));
        let observed_ref = observed.clone();
        table.predicates.insert(
            Box::new(|snap| snap.stable_num(1, 0) >= 0),
            Box::new(move |sst| {
                let snap = sst.snapshot();
                observed_ref.store(snap.stable_num(1, 0), Ordering::Release);
            }),
            PredicateKind::OneTime,
        );

        barrier.wait().await;
        let mut seen = -1;
        for _ in 0..200 {
            seen = observed.load(Ordering::Acquire);
            if seen == 7 {
                break;
            }
            time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(seen, 7);
        barrier.wait().await;
        table.stop();
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 3)]
    async fn completion_fails_on_dead_peer() -> Result<(), ShardcastError> {
        let addrs = test_addrs(30861, 2);
        let addrs1 = addrs.clone();
        let barrier = Arc::new(Barrier::new(2));
        let barrier1 = barrier.clone();

        tokio::spawn(async move {
            let table =
                SharedStateTable::new_and_setup(1, 0, &addrs1, test_layout(2))
                    .await?;
            table.sync_with_members().await;
            barrier1.wait().await;
            // die abruptly
            table.stop();
            Ok::<(), ShardcastError>(())
        });

        let table =
            SharedStateTable::new_and_setup(0, 0, &addrs, test_layout(2))
                .await?;
        table.sync_with_members().await;

        // while alive, completion succeeds
        table.bump_heartbeat();
        let failed = table
            .put_with_completion(
                &[1],
                table.layout().heartbeat(0),
                Duration::from_millis(500),
            )
            .await;
        assert!(failed.is_empty());

        barrier.wait().await;
        time::sleep(Duration::from_millis(200)).await;

        // peer stopped; eventually completion reports it failed
        let mut failed = Vec::new();
        for _ in 0..50 {
            table.bump_heartbeat();
            failed = table
                .put_with_completion(
                    &[1],
                    table.layout().heartbeat(0),
                    Duration::from_millis(100),
                )
                .await;
            if !failed.is_empty() {
                break;
            }
            time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(failed, vec![1]);
        table.stop();
        Ok(())
    }
}

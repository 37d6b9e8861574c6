//! Registry of predicates evaluated against the shared-state table.
//!
//! A predicate is a pure test over a row snapshot; its trigger runs when the
//! test holds, may mutate local row fields, and may enqueue asynchronous
//! `put`s, but must never block on I/O. The owning table runs all registered
//! predicates serially on its predicate-loop task.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crate::sst::{SharedStateTable, SstSnapshot};

/// Opaque handle to a registered predicate.
pub(crate) type PredHandle = u64;

/// Whether a predicate stays registered after its first firing.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub(crate) enum PredicateKind {
    /// Removed automatically after the first cycle in which it fires.
    OneTime,

    /// Fires in every cycle in which the test holds, until removed.
    Recurrent,
}

/// Predicate test over a consistent snapshot of all rows.
pub(crate) type PredFn = Box<dyn Fn(&SstSnapshot) -> bool + Send>;

/// Trigger body run when the test holds.
pub(crate) type TrigFn = Box<dyn FnMut(&SharedStateTable) + Send>;

struct PredicateEntry {
    pred: PredFn,
    trig: TrigFn,
    kind: PredicateKind,
}

/// Thread-safe predicate registry keyed by opaque handles.
pub(crate) struct PredicateRegistry {
    entries: Mutex<BTreeMap<PredHandle, PredicateEntry>>,

    /// Handles removed while their entry was checked out by the loop; the
    /// entry is discarded instead of re-inserted.
    tombstones: Mutex<HashSet<PredHandle>>,

    next_handle: AtomicU64,
}

impl PredicateRegistry {
    pub(crate) fn new() -> Self {
        PredicateRegistry {
            entries: Mutex::new(BTreeMap::new()),
            tombstones: Mutex::new(HashSet::new()),
            next_handle: AtomicU64::new(1),
        }
    }

    /// Registers a predicate; returns its handle.
    pub(crate) fn insert(
        &self,
        pred: PredFn,
        trig: TrigFn,
        kind: PredicateKind,
    ) -> PredHandle {
        let handle = self.next_handle.fetch_add(1, Ordering::AcqRel);
        self.entries
            .lock()
            .unwrap()
            .insert(handle, PredicateEntry { pred, trig, kind });
        handle
    }

    /// Removes a predicate. Idempotent; removing an unknown handle is a
    /// no-op.
    pub(crate) fn remove(&self, handle: PredHandle) {
        if self.entries.lock().unwrap().remove(&handle).is_none() {
            // may be checked out by the loop right now; tombstone it
            self.tombstones.lock().unwrap().insert(handle);
        }
    }

    /// Removes every registered predicate.
    pub(crate) fn clear(&self) {
        let handles: Vec<PredHandle> =
            self.entries.lock().unwrap().keys().copied().collect();
        for handle in handles {
            self.remove(handle);
        }
    }

    /// Number of currently registered predicates.
    #[allow(dead_code)]
    pub(crate) fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    /// Runs one evaluation cycle against the given snapshot. Entries are
    /// checked out one at a time so that triggers can insert or remove
    /// predicates without deadlocking on the registry.
    pub(crate) fn run_cycle(
        &self,
        snapshot: &SstSnapshot,
        table: &SharedStateTable,
    ) {
        let handles: Vec<PredHandle> =
            self.entries.lock().unwrap().keys().copied().collect();

        for handle in handles {
            let entry = self.entries.lock().unwrap().remove(&handle);
            let Some(mut entry) = entry else {
                continue; // removed since listing
            };

            let fired = (entry.pred)(snapshot);
            if fired {
                (entry.trig)(table);
            }

            let keep = !(fired && entry.kind == PredicateKind::OneTime);
            let tombstoned =
                self.tombstones.lock().unwrap().remove(&handle);
            if keep && !tombstoned {
                self.entries.lock().unwrap().insert(handle, entry);
            }
        }
    }
}

#[cfg(test)]
mod predicates_tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    use crate::sst::tests_support::lone_table;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn one_time_fires_once() {
        let table = lone_table(30821).await;
        let registry = PredicateRegistry::new();
        let count = Arc::new(AtomicUsize::new(0));
        let count_ref = count.clone();
        registry.insert(
            Box::new(|_| true),
            Box::new(move |_| {
                count_ref.fetch_add(1, Ordering::AcqRel);
            }),
            PredicateKind::OneTime,
        );

        let snap = table.snapshot();
        registry.run_cycle(&snap, &table);
        registry.run_cycle(&snap, &table);
        assert_eq!(count.load(Ordering::Acquire), 1);
        assert_eq!(registry.len(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn recurrent_fires_every_cycle() {
        let table = lone_table(30822).await;
        let registry = PredicateRegistry::new();
        let count = Arc::new(AtomicUsize::new(0));
        let count_ref = count.clone();
        let handle = registry.insert(
            Box::new(|_| true),
            Box::new(move |_| {
                count_ref.fetch_add(1, Ordering::AcqRel);
            }),
            PredicateKind::Recurrent,
        );

        let snap = table.snapshot();
        registry.run_cycle(&snap, &table);
        registry.run_cycle(&snap, &table);
        assert_eq!(count.load(Ordering::Acquire), 2);

        registry.remove(handle);
        registry.remove(handle); // idempotent
        registry.run_cycle(&snap, &table);
        assert_eq!(count.load(Ordering::Acquire), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn trigger_may_remove_peer_predicate() {
        let table = lone_table(30823).await;
        let registry = Arc::new(PredicateRegistry::new());
        let count = Arc::new(AtomicUsize::new(0));

        let count_ref = count.clone();
        let victim = registry.insert(
            Box::new(|_| true),
            Box::new(move |_| {
                count_ref.fetch_add(1, Ordering::AcqRel);
            }),
            PredicateKind::Recurrent,
        );

        // a predicate whose trigger removes the victim; registered second so
        // the victim fires once before removal takes effect
        let registry_ref = registry.clone();
        registry.insert(
            Box::new(|_| true),
            Box::new(move |_| registry_ref.remove(victim)),
            PredicateKind::OneTime,
        );

        let snap = table.snapshot();
        registry.run_cycle(&snap, &table);
        registry.run_cycle(&snap, &table);
        assert_eq!(count.load(Ordering::Acquire), 1);
    }
}

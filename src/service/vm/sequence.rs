// =============================================================================
// Orbiton Matrix Homeserver Core - Evaluation Sequence Counters
// =============================================================================
//
// Project: Orbiton - Federated Matrix Homeserver Core
// Contributors: Orbiton Development Team
// License: Apache 2.0 / MIT
//
// Description:
//   Process-wide counters of the evaluation pipeline. Indexes are issued in
//   FIFO admission order; completion may happen out of order, so `retired`
//   advances through a contiguity buffer. Abandoned issues (hard-failed
//   evaluations) retire their index without committing, leaving a permanent
//   gap the store tolerates.
//
// =============================================================================

use std::{
    collections::BTreeSet,
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex,
    },
};

/// Snapshot of the counters at one observation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Counters {
    /// Highest index that has completed all phases, durable write included.
    pub retired: u64,
    /// Highest index past all pre-write phases; the visibility watermark.
    pub committed: u64,
    /// Next index to allocate.
    pub uncommitted: u64,
    /// In-flight evaluations.
    pub pending: u64,
}

pub struct Sequence {
    retired: AtomicU64,
    committed: AtomicU64,
    uncommitted: AtomicU64,
    pending: AtomicU64,
    /// Out-of-order completions not yet covered by `retired`.
    completed: Mutex<BTreeSet<u64>>,
}

impl Sequence {
    /// `highest_durable` is the largest index found in the store on startup;
    /// zero for an empty store. Index zero is never allocated.
    pub fn new(highest_durable: u64) -> Self {
        Self {
            retired: AtomicU64::new(highest_durable),
            committed: AtomicU64::new(highest_durable),
            uncommitted: AtomicU64::new(highest_durable + 1),
            pending: AtomicU64::new(0),
            completed: Mutex::new(BTreeSet::new()),
        }
    }

    /// ISSUE: allocates the next index, FIFO with admission order.
    pub fn issue(&self) -> u64 {
        self.pending.fetch_add(1, Ordering::SeqCst);
        self.uncommitted.fetch_add(1, Ordering::SeqCst)
    }

    /// WRITE completed for `idx`.
    pub fn commit(&self, idx: u64) {
        self.committed.fetch_max(idx, Ordering::SeqCst);
    }

    /// All phases done for `idx`; advances `retired` over the contiguous
    /// completed range.
    pub fn retire(&self, idx: u64) {
        let mut completed = self.completed.lock().expect("lock is not poisoned");
        completed.insert(idx);
        let mut watermark = self.retired.load(Ordering::SeqCst);
        while completed.remove(&(watermark + 1)) {
            watermark += 1;
        }
        self.retired.store(watermark, Ordering::SeqCst);
        self.pending.fetch_sub(1, Ordering::SeqCst);
    }

    /// Hard failure after ISSUE: the index is permanently skipped. The
    /// abandoned index counts as committed first, so `retired` can never
    /// be observed ahead of `committed` while other evaluations are still
    /// in flight.
    pub fn abandon(&self, idx: u64) {
        self.committed.fetch_max(idx, Ordering::SeqCst);
        self.retire(idx);
    }

    pub fn counters(&self) -> Counters {
        Counters {
            retired: self.retired.load(Ordering::SeqCst),
            committed: self.committed.load(Ordering::SeqCst),
            uncommitted: self.uncommitted.load(Ordering::SeqCst),
            pending: self.pending.load(Ordering::SeqCst),
        }
    }

    /// The quiescence invariant: retired = committed = uncommitted - 1 and
    /// nothing pending.
    pub fn is_quiescent(&self) -> bool {
        let c = self.counters();
        c.pending == 0 && c.retired == c.committed && c.committed == c.uncommitted - 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Test: retired ≤ committed ≤ uncommitted at every observation
    #[test]
    fn test_counter_ordering_invariant() {
        let seq = Sequence::new(0);
        assert!(seq.is_quiescent());

        let a = seq.issue();
        let b = seq.issue();
        assert_eq!((a, b), (1, 2));

        let c = seq.counters();
        assert!(c.retired <= c.committed && c.committed < c.uncommitted);
        assert_eq!(c.pending, 2);

        seq.commit(a);
        seq.retire(a);
        seq.commit(b);
        seq.retire(b);
        assert!(seq.is_quiescent());
        assert_eq!(seq.counters().retired, 2);
    }

    /// Test: out-of-order completion holds retired back until the gap fills
    #[test]
    fn test_out_of_order_retirement() {
        let seq = Sequence::new(0);
        let a = seq.issue();
        let b = seq.issue();

        seq.commit(b);
        seq.retire(b);
        assert_eq!(seq.counters().retired, 0, "b waits on a");

        seq.commit(a);
        seq.retire(a);
        assert_eq!(seq.counters().retired, b);
        assert!(seq.is_quiescent());
    }

    /// Test: an abandoned issue leaves a gap but does not wedge the
    /// watermark, and the ordering invariant holds at every observation,
    /// including while another evaluation is still in flight
    #[test]
    fn test_abandoned_issue_gap() {
        let seq = Sequence::new(0);
        let a = seq.issue();
        let b = seq.issue();

        seq.abandon(a);
        // b is still pending here; retiring a must not run ahead of
        // committed.
        let mid = seq.counters();
        assert!(mid.retired <= mid.committed && mid.committed < mid.uncommitted);
        assert_eq!(mid.retired, a);

        seq.commit(b);
        seq.retire(b);

        let c = seq.counters();
        assert_eq!(c.retired, b);
        assert_eq!(c.pending, 0);
        assert!(c.retired <= c.committed && c.committed < c.uncommitted);
    }

    /// Test: startup reseeds from the highest durable index
    #[test]
    fn test_reseed_from_store() {
        let seq = Sequence::new(41);
        assert!(seq.is_quiescent());
        assert_eq!(seq.issue(), 42);
    }
}

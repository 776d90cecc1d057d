//! Prepare-time validation of optimistic serializable transactions.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_skiplist::SkipMap;
use gridcache_common::{TxKey, TxState};
use tracing::debug;

use crate::error::{TxError, TxResult};
use crate::manager::TxManager;
use crate::tx::CacheTx;

/// A concurrent FIFO of transactions that supports removal while iterating.
#[derive(Default)]
pub struct TxQueue {
    seq: AtomicU64,
    queue: SkipMap<u64, Arc<CacheTx>>,
}

impl TxQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, tx: Arc<CacheTx>) {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        self.queue.insert(seq, tx);
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

fn intersects(a: &BTreeSet<TxKey>, b: &BTreeSet<TxKey>) -> bool {
    let (small, large) = if a.len() <= b.len() { (a, b) } else { (b, a) };
    small.iter().any(|key| large.contains(key))
}

impl TxManager {
    /// Prepare stage of two phase commit for a local transaction.
    ///
    /// Optimistic serializable transactions are validated against the
    /// transactions that committed since they started and the ones that are
    /// preparing concurrently, then their entries are locked. Pessimistic
    /// transactions already hold their locks and only garbage collect the
    /// committed queue.
    pub(crate) fn prepare_tx(&self, tx: &Arc<CacheTx>) -> TxResult<()> {
        if tx.state() == TxState::MarkedRollback {
            if tx.timed_out() {
                return Err(TxError::Timeout(tx.xid()));
            }
            return Err(TxError::MarkedRollback(tx.xid()));
        }

        if tx.remaining_time().is_some_and(|left| left.is_zero()) {
            self.set_rollback_only(tx);
            return Err(TxError::Timeout(tx.xid()));
        }

        let serializable_enabled = self.config().serializable_enabled;

        if tx.is_pessimistic() {
            if tx.enforce_serializable() && serializable_enabled {
                self.gc_committed_queue(tx);
            }
            return Ok(());
        }

        if serializable_enabled && tx.enforce_serializable() {
            let read_set = tx.read_set();
            let write_set = tx.write_set();
            let start_tn = tx.start_version();
            let finish_tn = self.context().versions().last();

            if tx.mark_preparing() {
                self.prepare_q.push(tx.clone());
            }

            // Our read set must not intersect the write set of any
            // transaction that committed while we were reading.
            for entry in self.committed_q.queue.iter() {
                let committed = entry.value();
                if Arc::ptr_eq(committed, tx) {
                    continue;
                }
                if self.is_safe_to_forget(committed) {
                    entry.remove();
                    continue;
                }
                let Some(tn) = committed.end_version() else {
                    continue;
                };
                if tn <= start_tn || tn > finish_tn {
                    continue;
                }
                if tx.is_serializable() && intersects(&committed.write_set(), &read_set) {
                    self.set_rollback_only(tx);
                    return Err(TxError::OptimisticConflict(format!(
                        "committed vs. read-set conflict with {}: {tx}",
                        committed.xid()
                    )));
                }
            }

            let mut read_write = read_set;
            read_write.extend(write_set);

            for entry in self.prepare_q.queue.iter() {
                let preparing = entry.value().clone();
                if Arc::ptr_eq(&preparing, tx) {
                    continue;
                }
                if preparing.done() {
                    entry.remove();
                    debug!(xid = %preparing.xid(), "removed finished transaction from prepare queue");
                    continue;
                }
                if !self.context().node_alive(&preparing.node_id()) {
                    entry.remove();
                    if let Err(err) = self.rollback(&preparing) {
                        debug!(xid = %preparing.xid(), error = %err, "failed to roll back transaction of left node");
                    }
                    debug!(
                        xid = %preparing.xid(),
                        "removed and rolled back transaction because sender node left"
                    );
                    continue;
                }
                if tx.is_serializable()
                    && !preparing.is_rollback_only()
                    && intersects(&preparing.write_set(), &read_write)
                {
                    entry.remove();
                    self.set_rollback_only(tx);
                    return Err(TxError::OptimisticConflict(format!(
                        "read-set/write-set conflict with {}: {tx}",
                        preparing.xid()
                    )));
                }
            }
        }

        if !self.lock_multiple(tx, &tx.optimistic_lock_entries())? {
            self.set_rollback_only(tx);
            return Err(TxError::OptimisticConflict(format!("lock conflict: {tx}")));
        }
        Ok(())
    }

    fn gc_committed_queue(&self, tx: &Arc<CacheTx>) {
        for entry in self.committed_q.queue.iter() {
            if !Arc::ptr_eq(entry.value(), tx) && self.is_safe_to_forget(entry.value()) {
                entry.remove();
            }
        }
    }

    /// A committed transaction can be forgotten once no live transaction
    /// started before it finished.
    pub(crate) fn is_safe_to_forget(&self, tx: &CacheTx) -> bool {
        match self.start_versions.first() {
            None => true,
            Some(first) => tx.end_version().is_some_and(|end| end <= first),
        }
    }
}

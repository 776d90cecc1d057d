use std::sync::Arc;

use tracing::debug;

use crate::error::{EntryError, TxError, TxResult};
use crate::manager::TxManager;
use crate::tx::{CacheTx, TxEntry};

enum LockOutcome {
    Acquired,
    Busy,
    /// The entry's partition moved away; the entry is skipped.
    Skipped,
}

impl TxManager {
    /// Lock the entries of an optimistic transaction at prepare.
    ///
    /// Returns false if a lock could not be acquired within the transaction's
    /// remaining time, after releasing the locks taken by this call.
    pub(crate) fn lock_multiple(&self, tx: &Arc<CacheTx>, entries: &[Arc<TxEntry>]) -> TxResult<bool> {
        for (idx, tx_entry) in entries.iter().enumerate() {
            if !tx_entry.mark_prepared() {
                continue;
            }
            match self.lock_entry(tx, tx_entry)? {
                LockOutcome::Acquired | LockOutcome::Skipped => {}
                LockOutcome::Busy => {
                    self.unlock_multiple(tx, &entries[..idx]);
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }

    /// Lock a single entry on access, for pessimistic transactions.
    pub(crate) fn lock_on_access(&self, tx: &Arc<CacheTx>, tx_entry: &TxEntry) -> TxResult<()> {
        if !tx_entry.mark_prepared() {
            return Ok(());
        }
        match self.lock_entry(tx, tx_entry)? {
            LockOutcome::Acquired | LockOutcome::Skipped => Ok(()),
            LockOutcome::Busy => {
                tx.set_timed_out();
                self.set_rollback_only(tx);
                Err(TxError::Timeout(tx.xid()))
            }
        }
    }

    fn lock_entry(&self, tx: &Arc<CacheTx>, tx_entry: &TxEntry) -> TxResult<LockOutcome> {
        let timeout = tx.remaining_time();
        loop {
            let cached = tx_entry.cached();
            debug_assert!(!cached.detached(), "expected attached entry: {cached:?}");
            match cached.tm_lock(&tx.xid(), timeout) {
                Ok(true) => {
                    if let Err(err) = cached.unswap() {
                        debug!(key = %tx_entry.key(), error = %err, "failed to unswap locked entry");
                    }
                    return Ok(LockOutcome::Acquired);
                }
                Ok(false) => return Ok(LockOutcome::Busy),
                Err(EntryError::Removed) => {
                    debug!(key = %tx_entry.key(), "got removed entry while locking (will retry)");
                    match self.refresh_entry(tx, tx_entry) {
                        Ok(()) => continue,
                        Err(EntryError::InvalidPartition(partition)) => {
                            self.skip_invalid_partition(tx, tx_entry, partition);
                            return Ok(LockOutcome::Skipped);
                        }
                        Err(err) => return Err(err.into()),
                    }
                }
                Err(EntryError::InvalidPartition(partition)) => {
                    self.skip_invalid_partition(tx, tx_entry, partition);
                    return Ok(LockOutcome::Skipped);
                }
                Err(EntryError::LockCancelled) => {
                    self.set_rollback_only(tx);
                    return Err(TxError::LockCancelled(tx.xid()));
                }
            }
        }
    }

    fn skip_invalid_partition(&self, tx: &CacheTx, tx_entry: &TxEntry, partition: u32) {
        debug_assert!(tx.is_dht(), "invalid partition {partition} for non DHT transaction {tx}");
        debug!(key = %tx_entry.key(), partition, "skipping entry of invalid partition");
        tx.add_invalid_partition(tx_entry.key().cache_id(), partition);
    }

    /// Replace a removed entry handle with the current one.
    pub(crate) fn refresh_entry(&self, tx: &CacheTx, tx_entry: &TxEntry) -> Result<(), EntryError> {
        let fresh = self
            .context()
            .entry(tx_entry.key(), tx.topology_version())?;
        tx_entry.set_cached(fresh);
        Ok(())
    }

    /// Release the locks `tx` holds on `entries`. Detached entries are skipped.
    pub(crate) fn unlock_multiple(&self, tx: &CacheTx, entries: &[Arc<TxEntry>]) {
        for tx_entry in entries {
            self.unlock_entry(tx, tx_entry);
        }
    }

    /// Release the single group lock of a group lock transaction.
    pub(crate) fn unlock_group_locks(&self, tx: &CacheTx) {
        let Some(key) = tx.group_lock_key() else {
            return;
        };
        match tx.entry(key) {
            Some(tx_entry) => self.unlock_entry(tx, &tx_entry),
            None => debug_assert!(
                tx.is_near() && !tx.is_local(),
                "missing group lock entry for {tx}"
            ),
        }
    }

    fn unlock_entry(&self, tx: &CacheTx, tx_entry: &TxEntry) {
        loop {
            let cached = tx_entry.cached();
            if cached.detached() {
                return;
            }
            match cached.tx_unlock(&tx.xid()) {
                Ok(()) => return,
                Err(EntryError::Removed) => {
                    debug!(key = %tx_entry.key(), "got removed entry while unlocking (will retry)");
                    if let Err(err) = self.refresh_entry(tx, tx_entry) {
                        debug!(key = %tx_entry.key(), error = %err, "entry is gone, nothing to unlock");
                        return;
                    }
                }
                Err(err) => {
                    debug!(key = %tx_entry.key(), error = %err, "failed to unlock entry");
                    return;
                }
            }
        }
    }
}

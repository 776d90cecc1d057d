//! The transaction manager: creation, indexing and completion of every
//! transaction a node takes part in.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use gridcache_common::{
    CacheVersion, NodeId, ThreadId, TxConcurrency, TxIsolation, TxKey, TxState, current_thread_id,
};
use parking_lot::RwLock;
use tracing::{debug, error, warn};

use crate::completed::CompletedVersions;
use crate::config::TxManagerConfig;
use crate::context::{CacheContext, CacheEntry, MvccCandidate, RecoveryTransport, TxSynchronization};
use crate::error::{EntryError, TxError, TxResult};
use crate::finish_sync::{self, FinishSync};
use crate::future::{TxFuture, join_all};
use crate::message::CommittedTxInfo;
use crate::metrics::{TxManagerStats, TxMetrics};
use crate::recovery_buffer::RecoveryBuffer;
use crate::registry::TxRegistry;
use crate::serializable::TxQueue;
use crate::start_versions::StartVersionCounts;
use crate::thread_ctx::{self, ContextGuard};
use crate::timeout::TimeoutObject;
use crate::tx::{CacheTx, CompletedSnapshot, TxBuilder, TxClass, TxEntry, TxKind, TxOp};

static NEXT_MANAGER_ID: AtomicU64 = AtomicU64::new(1);

/// Options of a transaction started by a local user thread.
#[derive(Debug, Clone)]
pub struct NewTxOptions {
    pub implicit: bool,
    pub implicit_single: bool,
    pub system: bool,
    pub concurrency: TxConcurrency,
    pub isolation: TxIsolation,
    /// Zero means no timeout.
    pub timeout: Duration,
    pub invalidate: bool,
    pub store_enabled: bool,
    /// Expected number of entries.
    pub tx_size: usize,
    pub group_lock_key: Option<TxKey>,
    /// Whether the group lock covers a whole partition.
    pub partition_lock: bool,
}

impl Default for NewTxOptions {
    fn default() -> Self {
        Self {
            implicit: false,
            implicit_single: false,
            system: false,
            concurrency: TxConcurrency::Pessimistic,
            isolation: TxIsolation::RepeatableRead,
            timeout: Duration::ZERO,
            invalidate: false,
            store_enabled: false,
            tx_size: 0,
            group_lock_key: None,
            partition_lock: false,
        }
    }
}

pub struct TxManager {
    id: u64,
    pub(crate) me: Weak<TxManager>,
    ctx: Arc<dyn CacheContext>,
    pub(crate) transport: Arc<dyn RecoveryTransport>,
    config: TxManagerConfig,
    slow_tx_warn_timeout_ms: AtomicU64,

    pub(crate) registry: TxRegistry,
    pub(crate) completed: CompletedVersions,
    pub(crate) start_versions: StartVersionCounts,
    /// Committed serializable transactions that are not safe to forget yet.
    pub(crate) committed_q: TxQueue,
    /// Serializable transactions being prepared.
    pub(crate) prepare_q: TxQueue,
    pub(crate) finish_sync: FinishSync,
    pub(crate) recovery_buf: RecoveryBuffer,
    syncs: RwLock<Vec<Arc<dyn TxSynchronization>>>,
    metrics: TxMetrics,
}

impl TxManager {
    pub fn new(
        ctx: Arc<dyn CacheContext>,
        transport: Arc<dyn RecoveryTransport>,
        config: TxManagerConfig,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            id: NEXT_MANAGER_ID.fetch_add(1, Ordering::Relaxed),
            me: me.clone(),
            ctx,
            transport,
            slow_tx_warn_timeout_ms: AtomicU64::new(millis(config.slow_tx_warn_timeout)),
            registry: TxRegistry::new(),
            completed: CompletedVersions::new(config.max_completed_tx_count),
            start_versions: StartVersionCounts::new(),
            committed_q: TxQueue::new(),
            prepare_q: TxQueue::new(),
            finish_sync: FinishSync::new(),
            recovery_buf: RecoveryBuffer::new(config.recovery_buffer_size),
            syncs: RwLock::new(Vec::new()),
            metrics: TxMetrics::default(),
            config,
        })
    }

    #[inline]
    pub fn config(&self) -> &TxManagerConfig {
        &self.config
    }

    #[inline]
    pub fn context(&self) -> &dyn CacheContext {
        self.ctx.as_ref()
    }

    #[inline]
    pub fn metrics(&self) -> &TxMetrics {
        &self.metrics
    }

    pub fn slow_tx_warn_timeout(&self) -> Duration {
        Duration::from_millis(self.slow_tx_warn_timeout_ms.load(Ordering::Relaxed))
    }

    pub fn set_slow_tx_warn_timeout(&self, timeout: Duration) {
        self.slow_tx_warn_timeout_ms
            .store(millis(timeout), Ordering::Relaxed);
    }

    fn serializable_tracking(&self, tx: &CacheTx) -> bool {
        self.config.serializable_enabled && tx.enforce_serializable()
    }

    /// Start a near-local transaction for the calling thread.
    ///
    /// Returns `None` if a transaction with the allocated version already exists.
    pub fn new_tx(&self, opts: NewTxOptions) -> TxResult<Option<Arc<CacheTx>>> {
        let topology_version = self.ctx.topology_version();
        let xid = self.ctx.versions().next(topology_version)?;
        let mut builder = TxBuilder::new(TxKind::near_local(), xid, self.ctx.local_node_id())
            .implicit(opts.implicit, opts.implicit_single)
            .class(if opts.system {
                TxClass::System
            } else {
                TxClass::User
            })
            .concurrency(opts.concurrency)
            .isolation(opts.isolation)
            .timeout(opts.timeout)
            .invalidate(opts.invalidate)
            .store_used(opts.store_enabled)
            .topology_version(topology_version)
            .tx_size(opts.tx_size);
        if let Some(key) = opts.group_lock_key {
            builder = builder
                .group_lock_key(key)
                .partition_lock(opts.partition_lock);
        }
        debug!(xid = %xid, tx_size = opts.tx_size, "creating new transaction");
        Ok(self.on_created(Arc::new(builder.build())))
    }

    /// Register a newly created transaction. Returns `None` if the
    /// transaction already completed or another one with the same xid exists.
    pub fn on_created(&self, tx: Arc<CacheTx>) -> Option<Arc<CacheTx>> {
        // Start clean.
        thread_ctx::reset(self.id);

        if self.is_completed(&tx) {
            debug!(tx = %tx, "attempt to create a completed transaction (will ignore)");
            return None;
        }

        if let Err(existing) = self.registry.insert(&tx) {
            debug!(tx = %tx, existing = %existing, "attempt to create an existing transaction (will ignore)");
            return None;
        }

        // Remote and DHT transactions may carry a thread id of another node.
        if tx.is_local() && !tx.is_dht() {
            self.registry.set_thread(&tx);
        }

        if let Some(near) = tx.mapped_version() {
            self.completed.map(near, tx.xid());
            debug!(from = %near, to = %tx.xid(), "added transaction version mapping");
        }

        if self.serializable_tracking(&tx) {
            self.start_versions.increment(tx.start_version());
        }

        if !tx.timeout().is_zero() {
            self.ctx.timeouts().add_timeout_object(Arc::new(TxTimeoutObject {
                tx: Arc::downgrade(&tx),
                manager: self.me.clone(),
                id: tx.timeout_id(),
                end: tx.start_time() + tx.timeout(),
            }));
            debug!(xid = %tx.xid(), "registered transaction with timeout processor");
        }

        debug!(tx = %tx, "transaction created");
        Some(tx)
    }

    /// Called when the first operation runs in a transaction. Returns false
    /// if the transaction already completed.
    pub fn on_started(&self, tx: &Arc<CacheTx>) -> bool {
        debug_assert!(
            tx.state() == TxState::Active || tx.is_rollback_only(),
            "invalid state on start: {tx}"
        );
        if self.is_completed(tx) {
            debug!(tx = %tx, "attempt to start a completed transaction (will ignore)");
            return false;
        }
        self.fire_state_change(None, TxState::Active, tx);
        debug!(tx = %tx, "transaction started");
        true
    }

    pub fn enlist_read(&self, tx: &Arc<CacheTx>, key: TxKey) -> TxResult<Arc<TxEntry>> {
        self.enlist(tx, key, TxOp::Read)
    }

    pub fn enlist_write(&self, tx: &Arc<CacheTx>, key: TxKey, op: TxOp) -> TxResult<Arc<TxEntry>> {
        self.enlist(tx, key, op)
    }

    /// Add a key to the transaction. Local pessimistic transactions lock the
    /// entry right away, except for read committed reads.
    fn enlist(&self, tx: &Arc<CacheTx>, key: TxKey, op: TxOp) -> TxResult<Arc<TxEntry>> {
        match tx.state() {
            TxState::Active => {}
            TxState::MarkedRollback => return Err(self.rollback_only_error(tx)),
            state => {
                return Err(TxError::InvalidState {
                    xid: tx.xid(),
                    state,
                    reason: "keys can only be enlisted in an active transaction",
                });
            }
        }

        let needs_lock = tx.is_local()
            && tx.is_pessimistic()
            && (op != TxOp::Read || !tx.is_read_committed());

        let cached = match tx.entry(&key) {
            Some(existing) => existing.cached(),
            None => self
                .ctx
                .entry(&key, tx.topology_version())
                .map_err(|err| match err {
                    EntryError::InvalidPartition(partition) => TxError::InvalidPartition {
                        cache_id: key.cache_id(),
                        partition,
                    },
                    other => other.into(),
                })?,
        };
        let (entry, _) = tx.add_entry(key, op, move || cached);

        if needs_lock {
            self.lock_on_access(tx, &entry)?;
        }
        Ok(entry)
    }

    fn rollback_only_error(&self, tx: &CacheTx) -> TxError {
        if tx.timed_out() {
            TxError::Timeout(tx.xid())
        } else {
            TxError::MarkedRollback(tx.xid())
        }
    }

    /// Prepare the transaction. On failure it is rolled back and the error
    /// is returned.
    pub fn prepare(&self, tx: &Arc<CacheTx>) -> TxResult<()> {
        match self.prepare_inner(tx) {
            Ok(()) => Ok(()),
            Err(err) => {
                debug!(tx = %tx, error = %err, "prepare failed (will rollback)");
                self.set_rollback_only(tx);
                if let Err(rollback_err) = self.rollback(tx) {
                    error!(tx = %tx, error = %rollback_err, "failed to rollback transaction");
                }
                Err(err)
            }
        }
    }

    /// Prepare without rolling back on failure. Returns `Ok` without doing
    /// anything if the transaction is prepared or being prepared already.
    pub(crate) fn prepare_inner(&self, tx: &Arc<CacheTx>) -> TxResult<()> {
        match tx.state() {
            TxState::Active => {}
            TxState::Preparing | TxState::Prepared | TxState::Committing | TxState::Committed => {
                return Ok(());
            }
            TxState::MarkedRollback => return Err(self.rollback_only_error(tx)),
            state => {
                return Err(TxError::InvalidState {
                    xid: tx.xid(),
                    state,
                    reason: "cannot prepare a finished transaction",
                });
            }
        }

        if !self.cas_transition(tx, TxState::Active, TxState::Preparing) {
            return match tx.state() {
                TxState::Preparing | TxState::Prepared | TxState::Committing | TxState::Committed => {
                    Ok(())
                }
                TxState::MarkedRollback => Err(self.rollback_only_error(tx)),
                state => Err(TxError::InvalidState {
                    xid: tx.xid(),
                    state,
                    reason: "transaction state changed during prepare",
                }),
            };
        }

        if tx.is_local() {
            let res = self.prepare_tx(tx);
            // A rollback that ran while we were still locking released only
            // what was held then.
            if matches!(tx.state(), TxState::RollingBack | TxState::RolledBack) {
                debug!(tx = %tx, "transaction rolled back during prepare (releasing locks)");
                self.release_locks(tx);
            }
            res?;
        }

        if !self.cas_transition(tx, TxState::Preparing, TxState::Prepared) {
            return Err(match tx.state() {
                TxState::MarkedRollback => self.rollback_only_error(tx),
                state => TxError::InvalidState {
                    xid: tx.xid(),
                    state,
                    reason: "transaction state changed during prepare",
                },
            });
        }
        Ok(())
    }

    /// Commit the transaction, preparing it first if it is still active.
    pub fn commit(&self, tx: &Arc<CacheTx>) -> TxResult<()> {
        if tx.state() == TxState::Active {
            self.prepare(tx)?;
        }

        if !self.cas_transition(tx, TxState::Prepared, TxState::Committing) {
            return match tx.state() {
                TxState::Committing | TxState::Committed => Ok(()),
                TxState::MarkedRollback => {
                    let err = self.rollback_only_error(tx);
                    if let Err(rollback_err) = self.rollback(tx) {
                        error!(tx = %tx, error = %rollback_err, "failed to rollback transaction");
                    }
                    Err(err)
                }
                state => Err(TxError::InvalidState {
                    xid: tx.xid(),
                    state,
                    reason: "only a prepared transaction can commit",
                }),
            };
        }

        let _ctx = ContextGuard::enter(self.id, tx.clone());

        self.add_committed_tx(tx);

        if let Err(err) = self.apply_writes(tx) {
            error!(tx = %tx, error = %err, "failed to commit transaction writes");
            self.transition(tx, TxState::Unknown);
            self.uncommit_tx(tx);
            tx.complete_finish(TxState::Unknown);
            return Err(err);
        }

        if let Err(err) = self.commit_tx(tx) {
            error!(tx = %tx, error = %err, "failed to commit transaction");
            self.transition(tx, TxState::Unknown);
            tx.complete_finish(TxState::Unknown);
            return Err(err);
        }

        self.transition(tx, TxState::Committed);
        tx.complete_finish(TxState::Committed);
        Ok(())
    }

    /// Commit on the calling thread and hand the outcome over as a future.
    pub fn commit_async(&self, tx: &Arc<CacheTx>) -> TxFuture<TxResult<()>> {
        TxFuture::finished(self.commit(tx))
    }

    fn apply_writes(&self, tx: &Arc<CacheTx>) -> TxResult<()> {
        let invalidate = tx.is_invalidate() || tx.is_system_invalidate();
        for entry in tx.write_entries() {
            let op = if invalidate { TxOp::Delete } else { entry.op() };
            loop {
                match entry.cached().commit_write(&tx.xid(), &op) {
                    Ok(()) => break,
                    Err(EntryError::Removed) => match self.refresh_entry(tx, &entry) {
                        Ok(()) => continue,
                        Err(EntryError::InvalidPartition(partition)) => {
                            tx.add_invalid_partition(entry.key().cache_id(), partition);
                            break;
                        }
                        Err(err) => return Err(err.into()),
                    },
                    Err(EntryError::InvalidPartition(partition)) => {
                        tx.add_invalid_partition(entry.key().cache_id(), partition);
                        break;
                    }
                    Err(err) => return Err(err.into()),
                }
            }
        }
        Ok(())
    }

    /// Complete a transaction in `COMMITTING` state: release its resources
    /// and remove it from every index.
    pub fn commit_tx(&self, tx: &Arc<CacheTx>) -> TxResult<()> {
        if tx.state() != TxState::Committing {
            return Err(TxError::InvalidState {
                xid: tx.xid(),
                state: tx.state(),
                reason: "commit from the manager requires COMMITTING state",
            });
        }
        debug!(node = %self.ctx.local_node_id(), tx = %tx, "committing from TM");

        if !tx.timeout().is_zero() {
            self.ctx.timeouts().remove_timeout_object(tx.timeout_id());
        }

        // 1. Make sure the committed version was recorded.
        let committed = self.completed.committed();
        if !(committed.contains(&tx.xid())
            || tx.write_set().is_empty()
            || tx.is_system_invalidate())
        {
            self.uncommit_tx(tx);
            return Err(TxError::MissingCommitVersion {
                version: tx.xid(),
                first: committed.first(),
                last: committed.last(),
            });
        }

        if !self.registry.remove(tx) {
            debug!(tx = %tx, "did not commit from TM (was already committed)");
            return Ok(());
        }

        // 2. Completed versions must be gathered before unlocking.
        self.process_completed_entries(tx);

        if let TxKind::DhtLocal(_) = tx.kind() {
            self.collect_pending_versions(tx);
        }

        // 3. Data structures hook and pessimistic recovery buffer.
        self.ctx.on_tx_committed(tx);
        self.add_pessimistic_recovery(tx);

        // 4. Unlock write resources.
        if tx.is_group_lock() {
            self.unlock_group_locks(tx);
        } else {
            self.unlock_multiple(tx, &tx.write_entries());
        }

        // 5. Release read locks.
        if holds_read_locks(tx) && !tx.is_group_lock() {
            self.unlock_multiple(tx, &tx.read_entries());
        }

        // 6. Notify evictions.
        self.notify_evictions(tx);

        // 7. Remove obsolete entries from the cache.
        self.remove_obsolete(tx);

        // 8. Assign the end version.
        match self.ctx.versions().next(tx.topology_version()) {
            Ok(end) => tx.set_end_version(end),
            Err(err) => error!(tx = %tx, error = %err, "failed to assign end version"),
        }

        // 9. Release the start version.
        if self.serializable_tracking(tx) {
            self.start_versions.decrement(&tx.start_version());

            // 10. Keep the transaction while it can still conflict with others.
            if !self.is_safe_to_forget(tx) {
                self.committed_q.push(tx.clone());
            }
        }

        // 11. Remove from the remaining indexes.
        self.deindex(tx);

        // 12. Update metrics.
        if tx.is_local() && !tx.is_dht() {
            self.metrics.on_tx_commit(tx.start_time().elapsed());
        }
        self.warn_if_slow(tx);

        debug!(node = %self.ctx.local_node_id(), tx = %tx, "committed from TM");
        Ok(())
    }

    /// Roll the transaction back. Refused once the transaction is committing.
    pub fn rollback(&self, tx: &Arc<CacheTx>) -> TxResult<()> {
        loop {
            match tx.state() {
                TxState::RolledBack | TxState::RollingBack => return Ok(()),
                state @ (TxState::Committing | TxState::Committed | TxState::Unknown) => {
                    return Err(TxError::InvalidState {
                        xid: tx.xid(),
                        state,
                        reason: "rollback refused",
                    });
                }
                state => {
                    if self.cas_transition(tx, state, TxState::RollingBack) {
                        break;
                    }
                }
            }
        }

        self.rollback_tx(tx);
        self.transition(tx, TxState::RolledBack);
        tx.complete_finish(TxState::RolledBack);
        Ok(())
    }

    /// Roll back on the calling thread and hand the outcome over as a future.
    pub fn rollback_async(&self, tx: &Arc<CacheTx>) -> TxFuture<TxResult<()>> {
        TxFuture::finished(self.rollback(tx))
    }

    /// Release the resources of a rolled back transaction and remove it from
    /// every index.
    pub fn rollback_tx(&self, tx: &Arc<CacheTx>) {
        debug!(node = %self.ctx.local_node_id(), tx = %tx, "rolling back from TM");

        if !tx.timeout().is_zero() {
            self.ctx.timeouts().remove_timeout_object(tx.timeout_id());
        }

        // 1. Record the version to avoid duplicates.
        self.add_rolledback_tx(tx);

        if !self.registry.remove(tx) {
            debug!(tx = %tx, "did not rollback from TM (was already rolled back)");
            return;
        }

        self.release_locks(tx);
        self.notify_evictions(tx);
        self.remove_obsolete(tx);
        if self.serializable_tracking(tx) {
            self.start_versions.decrement(&tx.start_version());
        }
        self.deindex(tx);

        if tx.is_local() && !tx.is_dht() {
            self.metrics.on_tx_rollback(tx.start_time().elapsed());
        }
        debug!(node = %self.ctx.local_node_id(), tx = %tx, "rolled back from TM");
    }

    /// Release locks and indexes without recording the transaction as
    /// completed. Used when a commit turns out to be impossible.
    pub fn uncommit_tx(&self, tx: &Arc<CacheTx>) {
        debug!(tx = %tx, "uncommitting from TM");

        if !tx.timeout().is_zero() {
            self.ctx.timeouts().remove_timeout_object(tx.timeout_id());
        }

        if !self.registry.remove(tx) {
            debug!(tx = %tx, "did not uncommit from TM (was already committed or rolled back)");
            return;
        }

        self.release_locks(tx);
        self.notify_evictions(tx);
        if self.serializable_tracking(tx) {
            self.start_versions.decrement(&tx.start_version());
        }
        self.deindex(tx);
        debug!(tx = %tx, "uncommitted from TM");
    }

    fn release_locks(&self, tx: &CacheTx) {
        self.unlock_multiple(tx, &tx.write_entries());
        if holds_read_locks(tx) {
            self.unlock_multiple(tx, &tx.read_entries());
        }
    }

    /// Remove from the thread map, alternate versions and the near mapping,
    /// then clear the thread context.
    fn deindex(&self, tx: &Arc<CacheTx>) {
        if tx.is_local() && !tx.is_dht() {
            self.registry.remove_thread(tx);
        }
        for ver in tx.alternate_versions() {
            self.registry.remove_alternate(&ver, tx);
        }
        if let Some(near) = tx.mapped_version() {
            self.completed.unmap(&near);
        }
        thread_ctx::reset(self.id);
    }

    fn process_completed_entries(&self, tx: &CacheTx) {
        if !tx.needs_completed_versions() {
            return;
        }
        let mut min = tx.xid();
        for entry in tx.all_entries() {
            match entry.cached().remote_mvcc_snapshot() {
                Ok(versions) => {
                    if let Some(lowest) = versions.into_iter().min() {
                        min = min.min(lowest);
                    }
                }
                Err(err) => debug!(key = %entry.key(), error = %err, "no remote candidates"),
            }
        }
        tx.set_completed_versions(CompletedSnapshot {
            min,
            committed: self.committed_versions(&min),
            rolled_back: self.rolledback_versions(&min),
        });
    }

    /// Record the versions of lock candidates queued before this transaction
    /// that do not own their lock yet.
    fn collect_pending_versions(&self, tx: &CacheTx) {
        if !tx.needs_completed_versions() {
            return;
        }
        let mut pending: Vec<CacheVersion> = Vec::new();
        for entry in tx.all_entries() {
            let cached = entry.cached();
            if cached.obsolete() {
                continue;
            }
            match cached.local_candidates() {
                Ok(candidates) => {
                    for MvccCandidate { version, owner } in candidates {
                        if !owner && version < tx.xid() && !pending.contains(&version) {
                            debug!(version = %version, "adding candidate version to pending set");
                            pending.push(version);
                        }
                    }
                }
                Err(_) => debug!(key = %entry.key(), "no pending locks for removed entry"),
            }
        }
        if !pending.is_empty() {
            tx.set_pending_versions(pending);
        }
    }

    fn add_pessimistic_recovery(&self, tx: &CacheTx) {
        // Optimistic and local replicated transactions are never queried.
        if tx.is_optimistic() || (tx.is_local() && tx.is_replicated()) {
            return;
        }
        self.recovery_buf.add_committed_tx(CommittedTxInfo::from_tx(tx));
    }

    fn notify_evictions(&self, tx: &CacheTx) {
        if tx.is_internal() && !tx.is_group_lock() {
            return;
        }
        for entry in tx.all_entries() {
            self.ctx.touch(&entry, tx.is_local());
        }
    }

    fn remove_obsolete(&self, tx: &CacheTx) {
        let entries = if tx.is_local() && !tx.is_dht() {
            tx.all_entries()
        } else {
            tx.write_entries()
        };
        for entry in entries {
            let cached = entry.cached();
            if cached.detached() {
                continue;
            }
            let obsolete = if cached.obsolete() {
                Ok(true)
            } else {
                cached.mark_obsolete_if_empty(&tx.xid())
            };
            match obsolete {
                Ok(true) => self.ctx.remove_entry(&cached),
                Ok(false) => {}
                Err(err) => {
                    error!(key = %entry.key(), error = %err, "failed to remove obsolete entry from cache")
                }
            }
            if !tx.is_near() {
                if let Some(near) = self.ctx.near_entry(entry.key()) {
                    if matches!(near.mark_obsolete_if_empty(&tx.xid()), Ok(true)) {
                        self.ctx.remove_near_entry(&near);
                    }
                }
            }
        }
    }

    fn warn_if_slow(&self, tx: &CacheTx) {
        let threshold = self.slow_tx_warn_timeout();
        if !threshold.is_zero() && tx.is_local() && tx.start_time().elapsed() > threshold {
            warn!(
                tx = %tx,
                slow_tx_warn_timeout_ms = millis(threshold),
                "slow transaction detected"
            );
        }
    }

    fn transition(&self, tx: &CacheTx, new: TxState) -> bool {
        match tx.set_state(new) {
            Some(prev) => {
                self.fire_state_change(Some(prev), new, tx);
                true
            }
            None => false,
        }
    }

    fn cas_transition(&self, tx: &CacheTx, from: TxState, to: TxState) -> bool {
        if tx.cas_state(from, to) {
            self.fire_state_change(Some(from), to, tx);
            true
        } else {
            false
        }
    }

    /// Mark the transaction for rollback. Returns true if it is now marked,
    /// rolling back or rolled back; false if it is already committing.
    pub fn set_rollback_only(&self, tx: &CacheTx) -> bool {
        loop {
            let state = tx.state();
            match state {
                TxState::MarkedRollback | TxState::RollingBack | TxState::RolledBack => {
                    return true;
                }
                state if state.can_transition_to(TxState::MarkedRollback) => {
                    if self.cas_transition(tx, state, TxState::MarkedRollback) {
                        return true;
                    }
                }
                _ => return false,
            }
        }
    }

    /// Force a state transition, for hosts that drive the two phase commit
    /// messages themselves. Returns false if the transition is not legal.
    pub fn set_tx_state(&self, tx: &CacheTx, state: TxState) -> bool {
        self.transition(tx, state)
    }

    fn fire_state_change(&self, prev: Option<TxState>, new: TxState, tx: &CacheTx) {
        let syncs = self.syncs.read().clone();
        for sync in syncs {
            sync.on_state_changed(prev, new, tx);
        }
    }

    pub fn add_synchronizations(&self, syncs: impl IntoIterator<Item = Arc<dyn TxSynchronization>>) {
        let mut registered = self.syncs.write();
        for sync in syncs {
            if !registered.iter().any(|s| Arc::ptr_eq(s, &sync)) {
                registered.push(sync);
            }
        }
    }

    pub fn remove_synchronizations(&self, syncs: &[Arc<dyn TxSynchronization>]) {
        self.syncs
            .write()
            .retain(|s| !syncs.iter().any(|removed| Arc::ptr_eq(s, removed)));
    }

    pub fn synchronizations(&self) -> Vec<Arc<dyn TxSynchronization>> {
        self.syncs.read().clone()
    }

    pub fn is_completed(&self, tx: &CacheTx) -> bool {
        self.completed.is_completed(&tx.xid())
    }

    /// Returns false if the version was already recorded.
    pub fn add_committed_tx(&self, tx: &CacheTx) -> bool {
        self.add_committed_version(tx.xid(), Some(tx.near_xid()))
    }

    pub fn add_committed_version(&self, xid: CacheVersion, near_xid: Option<CacheVersion>) -> bool {
        debug_assert!(
            !self.completed.rolled_back().contains(&xid),
            "version was rolled back: {xid}"
        );
        let added = self.completed.committed().add(xid, near_xid);
        if added {
            debug!(xid = %xid, "added transaction to committed version set");
        } else {
            debug!(xid = %xid, "transaction is already present in committed version set");
        }
        added
    }

    pub fn add_rolledback_tx(&self, tx: &CacheTx) -> bool {
        self.add_rolledback_version(tx.xid())
    }

    pub fn add_rolledback_version(&self, xid: CacheVersion) -> bool {
        debug_assert!(
            !self.completed.committed().contains(&xid),
            "version was committed: {xid}"
        );
        let added = self.completed.rolled_back().add(xid, None);
        if added {
            debug!(xid = %xid, "added transaction to rolled back version set");
        } else {
            debug!(xid = %xid, "transaction is already present in rolled back version set");
        }
        added
    }

    pub fn remove_committed_tx(&self, tx: &CacheTx) -> bool {
        self.completed.committed().remove(&tx.xid())
    }

    /// Committed versions starting from `min`, inclusive.
    pub fn committed_versions(&self, min: &CacheVersion) -> Vec<CacheVersion> {
        self.completed.committed().tail(min, true)
    }

    /// Rolled back versions starting from `min`, inclusive.
    pub fn rolledback_versions(&self, min: &CacheVersion) -> Vec<CacheVersion> {
        self.completed.rolled_back().tail(min, true)
    }

    /// DHT version of the live transaction with near version `near`.
    pub fn mapped_version(&self, near: &CacheVersion) -> Option<CacheVersion> {
        let dht = self.completed.mapped(near);
        debug!(from = %near, to = ?dht, "found mapped version");
        dht
    }

    /// Near version of the live transaction with DHT version `dht`.
    pub fn near_version(&self, dht: &CacheVersion) -> Option<CacheVersion> {
        self.registry.get_by_xid(dht).map(|tx| tx.near_xid())
    }

    /// Register the transaction under one more version, typically the version
    /// of an explicit lock it took over.
    pub fn add_alternate_version(&self, ver: CacheVersion, tx: &Arc<CacheTx>) -> bool {
        if self.registry.add_alternate(ver, tx) {
            tx.add_alternate_version(ver);
            debug!(ver = %ver, tx = %tx, "registered alternate transaction version");
            true
        } else {
            false
        }
    }

    pub fn tx_for_xid(&self, xid: &CacheVersion) -> Option<Arc<CacheTx>> {
        self.registry.get_by_xid(xid)
    }

    pub fn near_tx_for_xid(&self, xid: &CacheVersion) -> Option<Arc<CacheTx>> {
        self.registry.get_near(xid)
    }

    pub fn tx_for_thread(&self, thread_id: ThreadId) -> Option<Arc<CacheTx>> {
        self.registry.get_by_thread(thread_id)
    }

    /// The transaction the calling thread is finishing, or else the one it started.
    pub fn current_tx(&self) -> Option<Arc<CacheTx>> {
        thread_ctx::get(self.id).or_else(|| self.tx_for_thread(current_thread_id()))
    }

    pub fn local_tx(&self) -> Option<Arc<CacheTx>> {
        self.current_tx().filter(|tx| tx.is_local())
    }

    /// The explicit transaction started by the calling thread.
    pub fn thread_local_tx(&self) -> Option<Arc<CacheTx>> {
        self.tx_for_thread(current_thread_id()).filter(|tx| {
            tx.is_local() && (!tx.is_dht() || tx.is_colocated()) && !tx.is_implicit()
        })
    }

    /// The active user transaction of the calling thread.
    pub fn user_tx(&self) -> Option<Arc<CacheTx>> {
        let active_user = |tx: &Arc<CacheTx>| tx.is_user() && tx.state() == TxState::Active;
        thread_ctx::get(self.id)
            .filter(active_user)
            .or_else(|| self.tx_for_thread(current_thread_id()).filter(active_user))
    }

    pub fn in_user_tx(&self) -> bool {
        self.user_tx().is_some()
    }

    /// Version of the transaction in the calling thread's context.
    pub fn tx_context_version(&self) -> Option<CacheVersion> {
        thread_ctx::get(self.id).map(|tx| tx.xid())
    }

    /// Snapshot of every live transaction.
    pub fn txs(&self) -> Vec<Arc<CacheTx>> {
        self.registry.txs()
    }

    /// Whether all `tx_num` transactions with near version `near_xid` are
    /// prepared or committed here. A transaction found unprepared is rolled
    /// back.
    pub fn txs_prepared_or_committed(&self, near_xid: &CacheVersion, tx_num: usize) -> bool {
        if tx_num == 0 {
            return true;
        }
        let mut remaining = tx_num;
        let mut processed: HashSet<CacheVersion> = HashSet::new();

        for tx in self.txs() {
            if tx.near_xid() != *near_xid {
                continue;
            }
            match tx.state() {
                TxState::Prepared | TxState::Committing | TxState::Committed => {
                    remaining -= 1;
                    if remaining == 0 {
                        return true;
                    }
                }
                state => {
                    if self.set_rollback_only(&tx) || state == TxState::Unknown {
                        if let Err(err) = self.rollback(&tx) {
                            debug!(tx = %tx, error = %err, "failed to rollback unprepared transaction");
                        }
                        debug!(tx = %tx, "transaction was not prepared (rolled back)");
                    } else {
                        debug!(tx = %tx, "transaction is not prepared");
                    }
                    return false;
                }
            }
            processed.insert(tx.xid());
        }

        // Some transactions may have finished already.
        for (ver, near) in self.completed.committed().iter() {
            if processed.contains(&ver) {
                continue;
            }
            if near == Some(*near_xid) {
                remaining -= 1;
                if remaining == 0 {
                    return true;
                }
            }
        }
        false
    }

    /// A future completed once every transaction that may be affected by a
    /// move to topology `topology_version` is finished: every older
    /// pessimistic transaction, and older optimistic ones that are past
    /// their read phase.
    pub fn finish_txs(&self, topology_version: u32) -> TxFuture<bool> {
        let futures: Vec<TxFuture<TxState>> = self
            .txs()
            .into_iter()
            .filter(|tx| {
                let tx_top = tx.topology_version();
                if tx_top == 0 || tx_top >= topology_version {
                    return false;
                }
                match tx.concurrency() {
                    TxConcurrency::Pessimistic => true,
                    TxConcurrency::Optimistic => matches!(
                        tx.state(),
                        TxState::Preparing | TxState::Prepared | TxState::Committing
                    ),
                }
            })
            .map(|tx| tx.finish_future())
            .collect();
        join_all(futures).chain(|_| true)
    }

    /// Forward a lock ownership change to the remote transaction that won it.
    pub fn on_owner_changed(&self, entry: &dyn CacheEntry, owner: Option<MvccCandidate>) -> bool {
        // Only acquired locks matter.
        let Some(owner) = owner else {
            return false;
        };
        let tx = self
            .registry
            .get_by_xid(&owner.version)
            .or_else(|| self.registry.get_near(&owner.version));
        match tx {
            Some(tx) if !tx.is_local() => {
                debug!(key = %entry.key(), tx = %tx, "found transaction for owner changed event");
                tx.on_owner_changed(entry.key());
                true
            }
            Some(tx) => {
                debug!(tx = %tx, "ignoring local transaction for owner change event");
                false
            }
            None => {
                debug!(key = %entry.key(), owner = %owner.version, "transaction not found for owner changed event");
                false
            }
        }
    }

    fn finish_sync_enabled(&self) -> bool {
        !finish_sync::is_disabled()
    }

    /// Called before a near finish request is sent to `node_id`.
    pub fn before_finish_remote(&self, node_id: NodeId, thread_id: ThreadId) {
        if self.finish_sync_enabled() {
            self.finish_sync.on_finish_send(node_id, thread_id);
        }
    }

    /// Called when `node_id` acknowledged a near finish request.
    pub fn on_finished_remote(&self, node_id: NodeId, thread_id: ThreadId) {
        if self.finish_sync_enabled() {
            self.finish_sync.on_ack_received(node_id, thread_id);
        }
    }

    /// Wait for the finish acks of `thread_id` from `node_id`.
    pub fn await_finish_ack_async(&self, node_id: NodeId, thread_id: ThreadId) -> TxFuture<()> {
        if self.finish_sync_enabled() {
            self.finish_sync.await_ack_async(node_id, thread_id)
        } else {
            TxFuture::finished(())
        }
    }

    pub fn memory_stats(&self) -> TxManagerStats {
        TxManagerStats {
            thread_map_size: self.registry.thread_map_len(),
            id_map_size: self.registry.id_map_len(),
            near_id_map_size: self.registry.near_id_map_len(),
            committed_queue_size: self.committed_q.len(),
            prepare_queue_size: self.prepare_q.len(),
            start_version_counts_size: self.start_versions.len(),
            committed_versions_size: self.completed.committed().len(),
            rolledback_versions_size: self.completed.rolled_back().len(),
            mapped_versions_size: self.completed.mapped_len(),
            recovery_buffer_size: self.recovery_buf.len(),
        }
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Pessimistic transactions lock reads on access unless they read committed.
/// Optimistic serializable ones lock them at prepare.
fn holds_read_locks(tx: &CacheTx) -> bool {
    if tx.is_pessimistic() {
        !tx.is_read_committed()
    } else {
        tx.is_serializable()
    }
}

/// Marks a transaction rollback-only once its timeout passes.
struct TxTimeoutObject {
    tx: Weak<CacheTx>,
    manager: Weak<TxManager>,
    id: u64,
    end: Instant,
}

impl TimeoutObject for TxTimeoutObject {
    fn timeout_id(&self) -> u64 {
        self.id
    }

    fn end_time(&self) -> Instant {
        self.end
    }

    fn on_timeout(&self) {
        let (Some(tx), Some(manager)) = (self.tx.upgrade(), self.manager.upgrade()) else {
            return;
        };
        if matches!(
            tx.state(),
            TxState::Active | TxState::Preparing | TxState::Prepared
        ) {
            tx.set_timed_out();
            if manager.set_rollback_only(&tx) {
                warn!(tx = %tx, "transaction timed out");
            }
        }
    }
}

//! Salvage and recovery of transactions whose originating node is gone.

use std::sync::{Arc, Weak};
use std::time::Instant;

use gridcache_common::{CacheVersion, FinalizationStatus, NodeId, TxState};
use tracing::{debug, error, warn};

use crate::context::CacheContext;
use crate::error::{TxError, TxResult};
use crate::future::{TxFuture, join_all};
use crate::manager::TxManager;
use crate::message::{
    CheckCommittedRequest, CheckPreparedRequest, CheckPreparedResponse, CommittedTxInfo,
};
use crate::timeout::TimeoutObject;
use crate::tx::{CacheTx, TxOp};

/// Holds the stop-safety gateway of the cache context while alive.
struct GatewayGuard<'a> {
    ctx: &'a dyn CacheContext,
}

impl<'a> GatewayGuard<'a> {
    fn enter(ctx: &'a dyn CacheContext) -> Option<Self> {
        ctx.enter_gateway().then_some(Self { ctx })
    }
}

impl Drop for GatewayGuard<'_> {
    fn drop(&mut self) {
        self.ctx.leave_gateway();
    }
}

/// Runs recovery for the transactions of a failed node once the salvage
/// delay has passed.
pub(crate) struct NodeFailureTimeoutObject {
    pub(crate) manager: Weak<TxManager>,
    pub(crate) node_id: NodeId,
    pub(crate) id: u64,
    pub(crate) end: Instant,
}

impl TimeoutObject for NodeFailureTimeoutObject {
    fn timeout_id(&self) -> u64 {
        self.id
    }

    fn end_time(&self) -> Instant {
        self.end
    }

    fn on_timeout(&self) {
        if let Some(manager) = self.manager.upgrade() {
            manager.on_node_failure(self.node_id);
        }
    }
}

impl TxManager {
    /// Invalidate a transaction in the name of the user. Returns true if the
    /// transaction was finished by this call.
    pub fn salvage_tx(&self, tx: &Arc<CacheTx>) -> bool {
        self.salvage(tx, false, FinalizationStatus::UserFinish)
    }

    /// Commit an active or prepared transaction with system invalidation, or
    /// roll back one that is marked for rollback.
    pub(crate) fn salvage(&self, tx: &Arc<CacheTx>, warn: bool, status: FinalizationStatus) -> bool {
        debug!(tx = %tx, "invalidating transaction");

        match tx.state() {
            TxState::Active | TxState::Preparing | TxState::Prepared => {
                if !tx.mark_finalizing(status) {
                    debug!(tx = %tx, "will not try to commit invalidate transaction (could not mark finalized)");
                    return false;
                }

                tx.system_invalidate(true);

                match self.prepare_inner(tx) {
                    Ok(()) => {}
                    Err(TxError::OptimisticConflict(_)) => {
                        self.rollback_logged(tx);
                        return true;
                    }
                    Err(err) => {
                        error!(tx = %tx, error = %err, "failed to invalidate transaction");
                        return false;
                    }
                }

                // Another thread is preparing it.
                if tx.state() == TxState::Preparing {
                    debug!(tx = %tx, "ignoring transaction in PREPARING state as it is currently handled by another thread");
                    return false;
                }

                tx.done_remote(tx.xid(), Vec::new(), Vec::new(), Vec::new());

                match self.commit(tx) {
                    Ok(()) => {
                        if warn {
                            warn!(
                                tx = %tx,
                                "invalidated transaction because originating node either crashed or left grid"
                            );
                        }
                        true
                    }
                    Err(TxError::OptimisticConflict(_)) => {
                        self.rollback_logged(tx);
                        true
                    }
                    Err(err) => {
                        error!(tx = %tx, error = %err, "failed to invalidate transaction");
                        false
                    }
                }
            }
            TxState::MarkedRollback => {
                self.rollback_logged(tx);
                true
            }
            _ => {
                debug!(tx = %tx, "no need to salvage transaction");
                false
            }
        }
    }

    fn rollback_logged(&self, tx: &Arc<CacheTx>) {
        if let Err(err) = self.rollback(tx) {
            error!(tx = %tx, error = %err, "failed to rollback transaction");
        }
    }

    /// Recover every transaction affected by the failure of `failed`.
    pub(crate) fn on_node_failure(&self, failed: NodeId) {
        let Some(_gateway) = GatewayGuard::enter(self.context()) else {
            debug!("failed to acquire gateway (node is stopping)");
            return;
        };

        debug!(local = %self.context().local_node_id(), failed = %failed, "processing node failed event");

        for tx in self.txs() {
            if (tx.is_near() && !tx.is_local())
                || (tx.store_used() && tx.master_node_ids().contains(&failed))
            {
                self.salvage(&tx, false, FinalizationStatus::RecoveryFinish);
            } else if tx.is_optimistic() {
                // The originating node finishes the rest itself.
                if tx.originating_node_id() != failed {
                    continue;
                }
                if tx.state() == TxState::Prepared {
                    self.commit_if_prepared(&tx, failed);
                } else if self.set_rollback_only(&tx) {
                    self.rollback_logged(&tx);
                }
                // Otherwise it is being committed.
            } else if tx.originating_node_id() == failed {
                if matches!(tx.state(), TxState::Committing | TxState::Committed) {
                    debug!(tx = %tx, "skipping pessimistic transaction check (transaction is being committed)");
                } else {
                    self.commit_if_remotely_committed(&tx, failed);
                }
            } else {
                debug!(tx = %tx, failed = %failed, "skipping pessimistic transaction check");
            }
        }
    }

    /// Ask every other participant whether it prepared `tx`. Completes with
    /// true if all of them did, or with `RemoteUnreachable` if one could not
    /// answer.
    pub fn check_prepared(&self, tx: &Arc<CacheTx>, failed: NodeId) -> TxFuture<TxResult<bool>> {
        let nodes = self.recovery_nodes(tx, failed);
        if nodes.is_empty() {
            return TxFuture::finished(Ok(true));
        }

        let xid = tx.xid();
        let futures = nodes
            .into_iter()
            .map(|node_id| {
                if !self.context().node_alive(&node_id) {
                    return TxFuture::finished(Err(TxError::RemoteUnreachable(xid)));
                }
                self.transport.send_check_prepared(
                    node_id,
                    CheckPreparedRequest {
                        xid,
                        near_xid: tx.near_xid(),
                        tx_num: 1,
                        originating_node_id: tx.originating_node_id(),
                    },
                )
            })
            .collect();

        join_all(futures).chain(move |responses| {
            let mut prepared = true;
            for response in responses {
                match response {
                    Ok(response) => prepared &= response.prepared,
                    Err(err) => {
                        debug!(xid = %xid, error = %err, "failed to check prepared state on remote node");
                        return Err(TxError::RemoteUnreachable(xid));
                    }
                }
            }
            Ok(prepared)
        })
    }

    fn commit_if_prepared(&self, tx: &Arc<CacheTx>, failed: NodeId) {
        debug_assert!(tx.is_dht(), "expected DHT transaction: {tx}");
        debug!(tx = %tx, "checking optimistic transaction state on remote nodes");

        let manager = self.me.clone();
        let tx0 = tx.clone();
        self.check_prepared(tx, failed).listen(move |res| {
            let Some(manager) = manager.upgrade() else {
                return;
            };
            let commit = match res {
                Ok(prepared) => *prepared,
                Err(err) => {
                    debug!(tx = %tx0, error = %err, "check prepared failed (will rollback)");
                    false
                }
            };
            manager.finish_optimistic_tx_on_recovery(&tx0, commit);
        });
    }

    /// Peer-side handler of a check prepared request.
    pub fn process_check_prepared(&self, req: &CheckPreparedRequest) -> CheckPreparedResponse {
        CheckPreparedResponse {
            prepared: self.txs_prepared_or_committed(&req.near_xid, req.tx_num),
        }
    }

    /// Ask every other participant whether it committed `tx`. Completes with
    /// the commit info of the first one that did.
    pub fn check_committed(
        &self,
        tx: &Arc<CacheTx>,
        failed: NodeId,
    ) -> TxFuture<TxResult<Option<CommittedTxInfo>>> {
        let nodes = self.recovery_nodes(tx, failed);
        if nodes.is_empty() {
            return TxFuture::finished(Ok(None));
        }

        let xid = tx.xid();
        let futures = nodes
            .into_iter()
            .map(|node_id| {
                if !self.context().node_alive(&node_id) {
                    return TxFuture::finished(Err(TxError::RemoteUnreachable(xid)));
                }
                self.transport.send_check_committed(
                    node_id,
                    CheckCommittedRequest {
                        near_xid: tx.near_xid(),
                        originating_node_id: tx.originating_node_id(),
                        originating_thread_id: tx.thread_id(),
                        near_only_check: false,
                    },
                )
            })
            .collect();

        join_all(futures).chain(move |responses| {
            let mut failure = None;
            for response in responses {
                match response {
                    Ok(response) => {
                        if let Some(info) = &response.info {
                            return Ok(Some(info.clone()));
                        }
                    }
                    Err(err) => failure = Some(err.clone()),
                }
            }
            match failure {
                Some(err) => {
                    debug!(xid = %xid, error = %err, "failed to check committed state on remote node");
                    Err(TxError::RemoteUnreachable(xid))
                }
                None => Ok(None),
            }
        })
    }

    fn commit_if_remotely_committed(&self, tx: &Arc<CacheTx>, failed: NodeId) {
        debug!(tx = %tx, "checking pessimistic transaction state on remote nodes");

        let manager = self.me.clone();
        let tx0 = tx.clone();
        self.check_committed(tx, failed).listen(move |res| {
            let Some(manager) = manager.upgrade() else {
                return;
            };
            let info = match res {
                Ok(info) => info.clone(),
                Err(err) => {
                    debug!(tx = %tx0, error = %err, "check committed failed (will rollback)");
                    None
                }
            };
            manager.finish_pessimistic_tx_on_recovery(&tx0, info);
        });
    }

    fn recovery_nodes(&self, tx: &CacheTx, failed: NodeId) -> Vec<NodeId> {
        let local = self.context().local_node_id();
        let mut nodes: Vec<NodeId> = Vec::new();
        for node_id in tx.transaction_nodes() {
            if *node_id != failed && *node_id != local && !nodes.contains(node_id) {
                nodes.push(*node_id);
            }
        }
        nodes
    }

    /// Peer-side handler of a check committed request: waits for a matching
    /// local transaction to finish, or answers from the recovery buffer.
    pub fn check_pessimistic_tx_committed(
        &self,
        req: &CheckCommittedRequest,
    ) -> TxFuture<Option<CommittedTxInfo>> {
        if let Some(tx) = self.local_tx_for_recovery(&req.near_xid, !req.near_only_check) {
            debug!(tx = %tx, "found active near transaction, will wait for completion");
            let tx0 = tx.clone();
            return tx.finish_future().chain(move |state| {
                (*state == TxState::Committed).then(|| CommittedTxInfo::from_tx(&tx0))
            });
        }

        TxFuture::finished(self.recovery_buf.committed_tx(
            &req.near_xid,
            req.originating_node_id,
            req.originating_thread_id,
        ))
    }

    /// The local transaction with near version `near_xid`. With
    /// `mark_finalizing`, transactions that are not finished by their user
    /// yet are marked as waiting for recovery and skipped.
    pub fn local_tx_for_recovery(
        &self,
        near_xid: &CacheVersion,
        mark_finalizing: bool,
    ) -> Option<Arc<CacheTx>> {
        let tx = self.registry.get_by_xid(near_xid).or_else(|| {
            let mut found = None;
            for tx in self.registry.id_txs() {
                if tx.near_xid() == *near_xid
                    && (!mark_finalizing || !tx.mark_finalizing(FinalizationStatus::RecoveryWait))
                {
                    found = Some(tx);
                }
            }
            found
        });
        tx.filter(|tx| tx.is_local())
    }

    /// Commit or roll back a prepared optimistic transaction on recovery.
    pub fn finish_optimistic_tx_on_recovery(&self, tx: &Arc<CacheTx>, commit: bool) {
        debug!(tx = %tx, commit, "finishing prepared transaction");

        if !tx.mark_finalizing(FinalizationStatus::RecoveryFinish) {
            debug!(tx = %tx, "will not try to commit prepared transaction (could not mark finalized)");
            return;
        }

        tx.done_remote(tx.xid(), Vec::new(), Vec::new(), Vec::new());

        if commit {
            self.listen_commit(tx, self.commit_async(tx));
        } else {
            self.rollback_logged(tx);
        }
    }

    /// Commit a pessimistic transaction with the writes some peer committed,
    /// or roll it back if no peer committed it.
    pub fn finish_pessimistic_tx_on_recovery(&self, tx: &Arc<CacheTx>, info: Option<CommittedTxInfo>) {
        if !tx.mark_finalizing(FinalizationStatus::RecoveryFinish) {
            debug!(tx = %tx, "will not try to finish pessimistic transaction (could not mark as finalizing)");
            return;
        }

        tx.done_remote(tx.xid(), Vec::new(), Vec::new(), Vec::new());

        let Some(info) = info else {
            self.rollback_logged(tx);
            return;
        };

        // Merged entries must be locked before prepare.
        let prepared = self
            .merge_recovery_writes(tx, &info)
            .and_then(|()| self.prepare_inner(tx));
        if let Err(err) = prepared {
            error!(tx = %tx, error = %err, "failed to prepare pessimistic transaction (will invalidate)");
            self.salvage(tx, false, FinalizationStatus::RecoveryFinish);
            return;
        }

        self.listen_commit(tx, self.commit_async(tx));
    }

    /// Apply the writes a peer committed to the entries `tx` holds. Keys it
    /// never enlisted are skipped since it owns no lock on them.
    fn merge_recovery_writes(&self, tx: &Arc<CacheTx>, info: &CommittedTxInfo) -> TxResult<()> {
        tx.set_recovery_writes(info.recovery_writes.clone());
        for write in &info.recovery_writes {
            if write.op == TxOp::Read {
                continue;
            }
            let Some(entry) = tx.entry(&write.key) else {
                debug!(tx = %tx, key = %write.key, "skipping recovery write of key not in transaction");
                continue;
            };
            if entry.cached().detached() {
                self.refresh_entry(tx, &entry)?;
            }
            entry.set_op(write.op.clone());
            // Read committed reads were not locked on access.
            if tx.is_local() {
                self.lock_on_access(tx, &entry)?;
            }
        }
        Ok(())
    }

    /// Roll back on optimistic conflict, log anything else.
    fn listen_commit(&self, tx: &Arc<CacheTx>, fut: TxFuture<TxResult<()>>) {
        let manager = self.me.clone();
        let tx0 = tx.clone();
        fut.listen(move |res| match res {
            Ok(()) => {}
            Err(TxError::OptimisticConflict(_)) => {
                if let Some(manager) = manager.upgrade() {
                    manager.rollback_logged(&tx0);
                }
            }
            Err(err) => error!(tx = %tx0, error = %err, "failed to commit transaction during failover"),
        });
    }
}

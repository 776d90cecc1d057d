//! Recovery messages exchanged between nodes.
//!
//! The transport itself is a collaborator (see [`RecoveryTransport`]); these
//! types only fix the payloads so they can be serialized by any codec.
//!
//! [`RecoveryTransport`]: crate::context::RecoveryTransport

use gridcache_common::{CacheVersion, NodeId, ThreadId, TxKey};
use serde::{Deserialize, Serialize};

use crate::tx::{CacheTx, TxOp};

/// A write that a committed pessimistic transaction applied, replayed on
/// peers that missed the commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryWrite {
    pub key: TxKey,
    pub op: TxOp,
}

/// Summary of a committed transaction kept for recovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommittedTxInfo {
    pub xid: CacheVersion,
    pub near_xid: CacheVersion,
    pub originating_node_id: NodeId,
    pub originating_thread_id: ThreadId,
    pub recovery_writes: Vec<RecoveryWrite>,
}

impl CommittedTxInfo {
    pub fn from_tx(tx: &CacheTx) -> Self {
        let recovery_writes = tx
            .write_entries()
            .iter()
            .map(|entry| RecoveryWrite {
                key: entry.key().clone(),
                op: entry.op(),
            })
            .collect();
        Self {
            xid: tx.xid(),
            near_xid: tx.near_xid(),
            originating_node_id: tx.originating_node_id(),
            originating_thread_id: tx.thread_id(),
            recovery_writes,
        }
    }
}

/// Asks a participant whether its part of an optimistic transaction is prepared.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckPreparedRequest {
    pub xid: CacheVersion,
    pub near_xid: CacheVersion,
    /// Number of transactions the participant is expected to hold for `near_xid`.
    pub tx_num: usize,
    pub originating_node_id: NodeId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckPreparedResponse {
    pub prepared: bool,
}

/// Asks a participant whether it committed a pessimistic transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckCommittedRequest {
    pub near_xid: CacheVersion,
    pub originating_node_id: NodeId,
    pub originating_thread_id: ThreadId,
    /// When set the peer only looks at its near transaction and does not
    /// mark local transactions as waiting for recovery.
    pub near_only_check: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckCommittedResponse {
    pub info: Option<CommittedTxInfo>,
}

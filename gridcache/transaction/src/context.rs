//! Collaborator contracts consumed by the transaction manager.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use gridcache_common::{CacheVersion, NodeId, TxKey, TxState, VersionGenerator};

use crate::error::{EntryError, TxResult};
use crate::events::DiscoveryListener;
use crate::future::TxFuture;
use crate::message::{
    CheckCommittedRequest, CheckCommittedResponse, CheckPreparedRequest, CheckPreparedResponse,
};
use crate::timeout::TimeoutScheduler;
use crate::tx::{CacheTx, TxEntry, TxOp};

/// A lock candidate queued on an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MvccCandidate {
    pub version: CacheVersion,
    pub owner: bool,
}

/// A cache entry with its MVCC lock queue.
///
/// Every method may fail with [`EntryError::Removed`] if the entry was
/// evicted from the cache map concurrently; callers refresh the handle
/// through [`CacheContext::entry`] and retry.
pub trait CacheEntry: Send + Sync + fmt::Debug {
    fn key(&self) -> &TxKey;

    /// Acquire the entry lock for transaction `xid`, waiting at most
    /// `timeout` (`None` waits without bound). Returns false if the lock
    /// could not be acquired in time.
    fn tm_lock(&self, xid: &CacheVersion, timeout: Option<Duration>) -> Result<bool, EntryError>;

    fn tx_unlock(&self, xid: &CacheVersion) -> Result<(), EntryError>;

    fn obsolete(&self) -> bool;

    /// Mark the entry obsolete if it holds neither a value nor lock candidates.
    fn mark_obsolete_if_empty(&self, xid: &CacheVersion) -> Result<bool, EntryError>;

    /// Detached entries are not part of any cache map.
    fn detached(&self) -> bool;

    /// Bring a swapped out entry back on heap.
    fn unswap(&self) -> Result<(), EntryError>;

    fn local_candidates(&self) -> Result<Vec<MvccCandidate>, EntryError>;

    /// Versions of remote lock candidates.
    fn remote_mvcc_snapshot(&self) -> Result<Vec<CacheVersion>, EntryError>;

    /// Apply a committed write of transaction `xid`.
    fn commit_write(&self, xid: &CacheVersion, op: &TxOp) -> Result<(), EntryError>;
}

/// Node-level services the manager depends on.
pub trait CacheContext: Send + Sync {
    fn local_node_id(&self) -> NodeId;

    /// Current topology version.
    fn topology_version(&self) -> u32;

    fn versions(&self) -> &VersionGenerator;

    /// Look up or create the entry for `key`.
    fn entry(&self, key: &TxKey, topology_version: u32) -> Result<Arc<dyn CacheEntry>, EntryError>;

    fn remove_entry(&self, entry: &Arc<dyn CacheEntry>);

    /// The near cache entry for `key`, if a near cache is enabled and holds it.
    fn near_entry(&self, _key: &TxKey) -> Option<Arc<dyn CacheEntry>> {
        None
    }

    fn remove_near_entry(&self, _entry: &Arc<dyn CacheEntry>) {}

    /// Eviction hook called for every entry of a finished transaction.
    fn touch(&self, entry: &TxEntry, local: bool);

    /// Data structures hook called on commit.
    fn on_tx_committed(&self, _tx: &CacheTx) {}

    fn node_alive(&self, node_id: &NodeId) -> bool;

    fn alive_all(&self, node_ids: &[NodeId]) -> bool {
        node_ids.iter().all(|id| self.node_alive(id))
    }

    fn timeouts(&self) -> &dyn TimeoutScheduler;

    /// Enter the stop-safety gateway. Returns false if the node is stopping.
    fn enter_gateway(&self) -> bool {
        true
    }

    fn leave_gateway(&self) {}

    /// Register a listener for node left and node failed events.
    fn subscribe_discovery(&self, listener: DiscoveryListener);
}

/// Sends recovery requests to peers. Every future completes with the peer's
/// answer or with an error if the peer could not be reached.
pub trait RecoveryTransport: Send + Sync {
    fn send_check_prepared(
        &self,
        node_id: NodeId,
        req: CheckPreparedRequest,
    ) -> TxFuture<TxResult<CheckPreparedResponse>>;

    fn send_check_committed(
        &self,
        node_id: NodeId,
        req: CheckCommittedRequest,
    ) -> TxFuture<TxResult<CheckCommittedResponse>>;
}

/// Callback fired on every transaction state change.
pub trait TxSynchronization: Send + Sync {
    fn on_state_changed(&self, prev: Option<TxState>, new: TxState, tx: &CacheTx);
}

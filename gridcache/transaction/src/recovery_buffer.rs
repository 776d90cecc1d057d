use std::num::NonZeroUsize;

use gridcache_common::{CacheVersion, NodeId, ThreadId};
use lru::LruCache;
use parking_lot::Mutex;

use crate::message::CommittedTxInfo;

/// The last committed pessimistic transaction of every originating thread,
/// used to answer peers asking whether a transaction committed here.
pub struct RecoveryBuffer {
    committed: Mutex<LruCache<(NodeId, ThreadId), CommittedTxInfo>>,
}

impl RecoveryBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            committed: Mutex::new(LruCache::new(
                NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN),
            )),
        }
    }

    pub fn add_committed_tx(&self, info: CommittedTxInfo) {
        let key = (info.originating_node_id, info.originating_thread_id);
        self.committed.lock().put(key, info);
    }

    /// Commit info of the transaction with `near_xid`, if it was the last one
    /// committed for its originating thread.
    pub fn committed_tx(
        &self,
        near_xid: &CacheVersion,
        originating_node_id: NodeId,
        originating_thread_id: ThreadId,
    ) -> Option<CommittedTxInfo> {
        self.committed
            .lock()
            .get(&(originating_node_id, originating_thread_id))
            .filter(|info| info.near_xid == *near_xid)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.committed.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.committed.lock().is_empty()
    }
}

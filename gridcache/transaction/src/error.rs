use gridcache_common::{CacheId, CacheVersion, TxState, VersionError};
use thiserror::Error;

pub type TxResult<T> = Result<T, TxError>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TxError {
    #[error("transaction timed out: {0}")]
    Timeout(CacheVersion),

    #[error("optimistic conflict: {0}")]
    OptimisticConflict(String),

    #[error("entry lock has been cancelled for transaction: {0}")]
    LockCancelled(CacheVersion),

    #[error(
        "missing commit version (consider increasing GRIDCACHE_MAX_COMPLETED_TX_COUNT) \
         [ver={version}, first={first:?}, last={last:?}]"
    )]
    MissingCommitVersion {
        version: CacheVersion,
        first: Option<CacheVersion>,
        last: Option<CacheVersion>,
    },

    #[error("partition {partition} of cache {cache_id} is not valid on this node")]
    InvalidPartition { cache_id: CacheId, partition: u32 },

    #[error("failed to gather recovery confirmations for transaction {0}")]
    RemoteUnreachable(CacheVersion),

    #[error("transaction is marked for rollback: {0}")]
    MarkedRollback(CacheVersion),

    #[error("invalid transaction state [xid={xid}, state={state}]: {reason}")]
    InvalidState {
        xid: CacheVersion,
        state: TxState,
        reason: &'static str,
    },

    #[error("cache entry error: {0}")]
    Entry(#[from] EntryError),

    #[error("version error: {0}")]
    Version(#[from] VersionError),
}

/// Errors raised by cache entries, the MVCC collaborator of the manager.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryError {
    #[error("entry has been removed")]
    Removed,

    #[error("partition {0} is invalid on this node")]
    InvalidPartition(u32),

    #[error("lock has been cancelled")]
    LockCancelled,
}

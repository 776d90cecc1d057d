use std::cell::Cell;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Cluster node identifier.
pub type NodeId = Uuid;

/// Identifier of the thread that started a transaction.
pub type ThreadId = u64;

/// Cache identifier.
pub type CacheId = u32;

static NEXT_THREAD_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static THREAD_ID: Cell<ThreadId> = const { Cell::new(0) };
}

/// Returns a process-unique numeric id of the calling thread.
pub fn current_thread_id() -> ThreadId {
    THREAD_ID.with(|id| {
        if id.get() == 0 {
            id.set(NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed));
        }
        id.get()
    })
}

/// A key enlisted in a transaction: the cache it belongs to plus the key bytes.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TxKey {
    cache_id: CacheId,
    key: Vec<u8>,
}

impl TxKey {
    pub fn new(cache_id: CacheId, key: impl Into<Vec<u8>>) -> Self {
        Self {
            cache_id,
            key: key.into(),
        }
    }

    pub fn cache_id(&self) -> CacheId {
        self.cache_id
    }

    pub fn key(&self) -> &[u8] {
        &self.key
    }
}

impl fmt::Display for TxKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}",
            self.cache_id,
            String::from_utf8_lossy(&self.key)
        )
    }
}

/// Transaction state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum TxState {
    Active = 0,
    Preparing = 1,
    Prepared = 2,
    Committing = 3,
    Committed = 4,
    MarkedRollback = 5,
    RollingBack = 6,
    RolledBack = 7,
    Unknown = 8,
}

impl TxState {
    pub fn from_u8(raw: u8) -> Option<Self> {
        Some(match raw {
            0 => Self::Active,
            1 => Self::Preparing,
            2 => Self::Prepared,
            3 => Self::Committing,
            4 => Self::Committed,
            5 => Self::MarkedRollback,
            6 => Self::RollingBack,
            7 => Self::RolledBack,
            8 => Self::Unknown,
            _ => return None,
        })
    }

    /// Returns true if no further transition is possible.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Committed | Self::RolledBack | Self::Unknown)
    }

    /// Returns true if the state machine allows moving from `self` to `next`.
    pub fn can_transition_to(&self, next: TxState) -> bool {
        use TxState::*;
        match (self, next) {
            (_, Unknown) => !self.is_terminal(),
            (Active, Preparing | Committing) => true,
            (Preparing, Prepared) => true,
            (Prepared, Committing) => true,
            (Committing, Committed) => true,
            (Active | Preparing | Prepared, MarkedRollback) => true,
            (Active | Preparing | Prepared | MarkedRollback, RollingBack) => true,
            (RollingBack, RolledBack) => true,
            _ => false,
        }
    }
}

impl fmt::Display for TxState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Active => "ACTIVE",
            Self::Preparing => "PREPARING",
            Self::Prepared => "PREPARED",
            Self::Committing => "COMMITTING",
            Self::Committed => "COMMITTED",
            Self::MarkedRollback => "MARKED_ROLLBACK",
            Self::RollingBack => "ROLLING_BACK",
            Self::RolledBack => "ROLLED_BACK",
            Self::Unknown => "UNKNOWN",
        };
        f.write_str(name)
    }
}

/// Isolation level for transactions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TxIsolation {
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

/// Lock-at-prepare (optimistic) or lock-at-access (pessimistic).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TxConcurrency {
    Optimistic,
    Pessimistic,
}

/// Who is finishing a transaction. Orthogonal to [`TxState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum FinalizationStatus {
    None = 0,
    UserFinish = 1,
    RecoveryWait = 2,
    RecoveryFinish = 3,
}

impl FinalizationStatus {
    pub fn from_u8(raw: u8) -> Option<Self> {
        Some(match raw {
            0 => Self::None,
            1 => Self::UserFinish,
            2 => Self::RecoveryWait,
            3 => Self::RecoveryFinish,
            _ => return None,
        })
    }
}

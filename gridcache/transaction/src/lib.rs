//! Transaction manager of the grid cache.
//!
//! Every node runs one [`TxManager`]. It owns the lifecycle of all
//! transactions the node takes part in, as coordinator (near local), as
//! primary (DHT local) or as participant (remote): creation and indexing,
//! prepare with optimistic serializable validation, commit, rollback, and
//! recovery of transactions whose originating node failed.
//!
//! Cache entries, discovery, timers and the network are collaborators
//! reached through the traits in [`context`] and [`timeout`].

pub mod completed;
pub mod config;
pub mod context;
pub mod error;
pub mod events;
pub mod finish_sync;
pub mod future;
mod lock;
pub mod manager;
pub mod message;
pub mod metrics;
pub mod recovery;
pub mod recovery_buffer;
pub mod registry;
pub mod serializable;
pub mod start_versions;
pub mod thread_ctx;
pub mod timeout;
pub mod tx;

pub use config::TxManagerConfig;
pub use context::{CacheContext, CacheEntry, MvccCandidate, RecoveryTransport, TxSynchronization};
pub use error::{EntryError, TxError, TxResult};
pub use events::{DiscoveryEvent, DiscoveryEventKind, DiscoveryListener};
pub use future::{TxFuture, join_all};
pub use manager::{NewTxOptions, TxManager};
pub use message::{
    CheckCommittedRequest, CheckCommittedResponse, CheckPreparedRequest, CheckPreparedResponse,
    CommittedTxInfo, RecoveryWrite,
};
pub use metrics::{TxManagerStats, TxMetrics};
pub use timeout::{TimeoutObject, TimeoutProcessor, TimeoutScheduler};
pub use tx::{CacheTx, TxBuilder, TxClass, TxEntry, TxKind, TxOp};

//! Common types for the grid cache transaction layer.
//!
//! This crate holds the identifiers and enums shared by the transaction
//! manager and its collaborators: cache versions, transaction keys and the
//! transaction state machine.

pub mod error;
pub mod types;
pub mod version;

pub use error::VersionError;
pub use types::{
    CacheId, FinalizationStatus, NodeId, ThreadId, TxConcurrency, TxIsolation, TxKey, TxState,
    current_thread_id,
};
pub use version::{CacheVersion, VersionGenerator};

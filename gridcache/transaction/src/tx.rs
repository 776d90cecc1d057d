//! The transaction handle.
//!
//! A [`CacheTx`] is one node's projection of a distributed transaction. Its
//! role is a [`TxKind`]: the coordinator's near-local view, the primary's
//! DHT-local view, or a remote participant view. The manager drives all state
//! transitions; the handle only guarantees they are atomic and legal.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::time::{Duration, Instant};

use gridcache_common::{
    CacheId, CacheVersion, FinalizationStatus, NodeId, ThreadId, TxConcurrency, TxIsolation,
    TxKey, TxState,
};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::context::CacheEntry;
use crate::future::TxFuture;
use crate::message::RecoveryWrite;
use crate::timeout::next_timeout_id;

/// Operation recorded for a key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxOp {
    Read,
    Update(Vec<u8>),
    Delete,
}

/// A key enlisted in a transaction together with the cached entry handle.
pub struct TxEntry {
    key: TxKey,
    op: Mutex<TxOp>,
    cached: RwLock<Arc<dyn CacheEntry>>,
    prepared: AtomicBool,
}

impl TxEntry {
    pub fn new(key: TxKey, op: TxOp, cached: Arc<dyn CacheEntry>) -> Self {
        Self {
            key,
            op: Mutex::new(op),
            cached: RwLock::new(cached),
            prepared: AtomicBool::new(false),
        }
    }

    #[inline]
    pub fn key(&self) -> &TxKey {
        &self.key
    }

    pub fn op(&self) -> TxOp {
        self.op.lock().clone()
    }

    pub fn set_op(&self, op: TxOp) {
        *self.op.lock() = op;
    }

    pub fn is_read(&self) -> bool {
        matches!(*self.op.lock(), TxOp::Read)
    }

    pub fn cached(&self) -> Arc<dyn CacheEntry> {
        self.cached.read().clone()
    }

    /// Replace the entry handle after the previous one was removed.
    pub fn set_cached(&self, cached: Arc<dyn CacheEntry>) {
        *self.cached.write() = cached;
    }

    /// Returns true if this call marked the entry prepared.
    pub fn mark_prepared(&self) -> bool {
        self.prepared
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn is_prepared(&self) -> bool {
        self.prepared.load(Ordering::Acquire)
    }
}

impl fmt::Debug for TxEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TxEntry")
            .field("key", &self.key)
            .field("op", &*self.op.lock())
            .field("prepared", &self.is_prepared())
            .finish()
    }
}

/// Versions reported by the coordinator when it finishes a remote transaction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DoneRemote {
    pub base: Option<CacheVersion>,
    pub committed: Vec<CacheVersion>,
    pub rolled_back: Vec<CacheVersion>,
    pub pending: Vec<CacheVersion>,
}

#[derive(Debug, Default)]
pub struct DhtLocalState {
    pending_versions: Mutex<Vec<CacheVersion>>,
}

#[derive(Debug, Default)]
pub struct RemoteState {
    done_remote: Mutex<Option<DoneRemote>>,
    locked_keys: Mutex<BTreeSet<TxKey>>,
}

/// The role a transaction plays on this node.
#[derive(Debug)]
pub enum TxKind {
    /// Started on this node by a user thread.
    NearLocal,
    /// Primary-side projection of a transaction on this node.
    DhtLocal(DhtLocalState),
    /// Near cache projection of a transaction coordinated elsewhere.
    NearRemote(RemoteState),
    /// Backup-side projection of a transaction.
    DhtRemote(RemoteState),
}

impl TxKind {
    pub fn near_local() -> Self {
        Self::NearLocal
    }

    pub fn dht_local() -> Self {
        Self::DhtLocal(DhtLocalState::default())
    }

    pub fn near_remote() -> Self {
        Self::NearRemote(RemoteState::default())
    }

    pub fn dht_remote() -> Self {
        Self::DhtRemote(RemoteState::default())
    }

    fn name(&self) -> &'static str {
        match self {
            Self::NearLocal => "near-local",
            Self::DhtLocal(_) => "dht-local",
            Self::NearRemote(_) => "near-remote",
            Self::DhtRemote(_) => "dht-remote",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxClass {
    User,
    System,
    Internal,
}

/// Snapshot of completed versions handed to remotes for reordering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedSnapshot {
    pub min: CacheVersion,
    pub committed: Vec<CacheVersion>,
    pub rolled_back: Vec<CacheVersion>,
}

pub struct TxBuilder {
    kind: TxKind,
    xid: CacheVersion,
    near_xid: Option<CacheVersion>,
    start_version: Option<CacheVersion>,
    node_id: NodeId,
    originating_node_id: Option<NodeId>,
    master_node_ids: Option<Vec<NodeId>>,
    transaction_nodes: Vec<NodeId>,
    thread_id: ThreadId,
    isolation: TxIsolation,
    concurrency: TxConcurrency,
    class: TxClass,
    implicit: bool,
    implicit_single: bool,
    colocated: bool,
    invalidate: bool,
    store_used: bool,
    replicated: bool,
    enforce_serializable: bool,
    needs_completed_versions: bool,
    timeout: Duration,
    topology_version: u32,
    group_lock_key: Option<TxKey>,
    partition_lock: bool,
    tx_size: usize,
}

impl TxBuilder {
    pub fn new(kind: TxKind, xid: CacheVersion, node_id: NodeId) -> Self {
        Self {
            kind,
            xid,
            near_xid: None,
            start_version: None,
            node_id,
            originating_node_id: None,
            master_node_ids: None,
            transaction_nodes: Vec::new(),
            thread_id: gridcache_common::current_thread_id(),
            isolation: TxIsolation::RepeatableRead,
            concurrency: TxConcurrency::Pessimistic,
            class: TxClass::User,
            implicit: false,
            implicit_single: false,
            colocated: false,
            invalidate: false,
            store_used: false,
            replicated: false,
            enforce_serializable: true,
            needs_completed_versions: false,
            timeout: Duration::ZERO,
            topology_version: xid.topology_version(),
            group_lock_key: None,
            partition_lock: false,
            tx_size: 0,
        }
    }

    pub fn near_xid(mut self, near_xid: CacheVersion) -> Self {
        self.near_xid = Some(near_xid);
        self
    }

    pub fn start_version(mut self, start_version: CacheVersion) -> Self {
        self.start_version = Some(start_version);
        self
    }

    pub fn originating_node_id(mut self, node_id: NodeId) -> Self {
        self.originating_node_id = Some(node_id);
        self
    }

    pub fn master_node_ids(mut self, node_ids: Vec<NodeId>) -> Self {
        self.master_node_ids = Some(node_ids);
        self
    }

    pub fn transaction_nodes(mut self, node_ids: Vec<NodeId>) -> Self {
        self.transaction_nodes = node_ids;
        self
    }

    pub fn thread_id(mut self, thread_id: ThreadId) -> Self {
        self.thread_id = thread_id;
        self
    }

    pub fn isolation(mut self, isolation: TxIsolation) -> Self {
        self.isolation = isolation;
        self
    }

    pub fn concurrency(mut self, concurrency: TxConcurrency) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn class(mut self, class: TxClass) -> Self {
        self.class = class;
        self
    }

    pub fn implicit(mut self, implicit: bool, implicit_single: bool) -> Self {
        self.implicit = implicit;
        self.implicit_single = implicit && implicit_single;
        self
    }

    pub fn colocated(mut self, colocated: bool) -> Self {
        self.colocated = colocated;
        self
    }

    pub fn invalidate(mut self, invalidate: bool) -> Self {
        self.invalidate = invalidate;
        self
    }

    pub fn store_used(mut self, store_used: bool) -> Self {
        self.store_used = store_used;
        self
    }

    pub fn replicated(mut self, replicated: bool) -> Self {
        self.replicated = replicated;
        self
    }

    pub fn enforce_serializable(mut self, enforce: bool) -> Self {
        self.enforce_serializable = enforce;
        self
    }

    pub fn needs_completed_versions(mut self, needs: bool) -> Self {
        self.needs_completed_versions = needs;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn topology_version(mut self, topology_version: u32) -> Self {
        self.topology_version = topology_version;
        self
    }

    pub fn group_lock_key(mut self, key: TxKey) -> Self {
        self.group_lock_key = Some(key);
        self
    }

    /// Whether the group lock covers a whole partition. Ignored without a
    /// group lock key.
    pub fn partition_lock(mut self, partition_lock: bool) -> Self {
        self.partition_lock = partition_lock;
        self
    }

    /// Expected number of entries.
    pub fn tx_size(mut self, tx_size: usize) -> Self {
        self.tx_size = tx_size;
        self
    }

    pub fn build(self) -> CacheTx {
        let originating_node_id = self.originating_node_id.unwrap_or(self.node_id);
        CacheTx {
            xid: self.xid,
            near_xid: self.near_xid.unwrap_or(self.xid),
            start_version: self.start_version.unwrap_or(self.xid),
            node_id: self.node_id,
            originating_node_id,
            master_node_ids: self.master_node_ids.unwrap_or_else(|| vec![originating_node_id]),
            transaction_nodes: self.transaction_nodes,
            thread_id: self.thread_id,
            isolation: self.isolation,
            concurrency: self.concurrency,
            class: self.class,
            implicit: self.implicit,
            implicit_single: self.implicit_single,
            colocated: self.colocated,
            invalidate: self.invalidate,
            store_used: self.store_used,
            replicated: self.replicated,
            enforce_serializable: self.enforce_serializable,
            needs_completed_versions: self.needs_completed_versions,
            timeout: self.timeout,
            start_time: Instant::now(),
            topology_version: self.topology_version,
            partition_lock: self.partition_lock && self.group_lock_key.is_some(),
            group_lock_key: self.group_lock_key,
            tx_size: self.tx_size,
            kind: self.kind,
            state: AtomicU8::new(TxState::Active as u8),
            finalization: AtomicU8::new(FinalizationStatus::None as u8),
            system_invalidate: AtomicBool::new(false),
            timed_out: AtomicBool::new(false),
            preparing: AtomicBool::new(false),
            entries: RwLock::new(BTreeMap::new()),
            alternate_versions: Mutex::new(Vec::new()),
            invalid_partitions: Mutex::new(BTreeMap::new()),
            completed: Mutex::new(None),
            recovery_writes: Mutex::new(Vec::new()),
            end_version: Mutex::new(None),
            finish_fut: TxFuture::new(),
            timeout_id: next_timeout_id(),
        }
    }
}

pub struct CacheTx {
    kind: TxKind,
    xid: CacheVersion,
    near_xid: CacheVersion,
    start_version: CacheVersion,
    node_id: NodeId,
    originating_node_id: NodeId,
    master_node_ids: Vec<NodeId>,
    transaction_nodes: Vec<NodeId>,
    thread_id: ThreadId,
    isolation: TxIsolation,
    concurrency: TxConcurrency,
    class: TxClass,
    implicit: bool,
    implicit_single: bool,
    colocated: bool,
    invalidate: bool,
    store_used: bool,
    replicated: bool,
    enforce_serializable: bool,
    needs_completed_versions: bool,
    timeout: Duration,
    start_time: Instant,
    topology_version: u32,
    group_lock_key: Option<TxKey>,
    partition_lock: bool,
    tx_size: usize,

    state: AtomicU8,
    finalization: AtomicU8,
    system_invalidate: AtomicBool,
    timed_out: AtomicBool,
    /// Set by the first prepare of a serializable transaction.
    preparing: AtomicBool,

    entries: RwLock<BTreeMap<TxKey, Arc<TxEntry>>>,
    alternate_versions: Mutex<Vec<CacheVersion>>,
    invalid_partitions: Mutex<BTreeMap<CacheId, BTreeSet<u32>>>,
    completed: Mutex<Option<CompletedSnapshot>>,
    recovery_writes: Mutex<Vec<RecoveryWrite>>,
    end_version: Mutex<Option<CacheVersion>>,
    finish_fut: TxFuture<TxState>,
    timeout_id: u64,
}

impl CacheTx {
    #[inline]
    pub fn kind(&self) -> &TxKind {
        &self.kind
    }

    #[inline]
    pub fn xid(&self) -> CacheVersion {
        self.xid
    }

    #[inline]
    pub fn near_xid(&self) -> CacheVersion {
        self.near_xid
    }

    #[inline]
    pub fn start_version(&self) -> CacheVersion {
        self.start_version
    }

    /// The end version, assigned once the write set is committed.
    pub fn end_version(&self) -> Option<CacheVersion> {
        *self.end_version.lock()
    }

    pub(crate) fn set_end_version(&self, ver: CacheVersion) {
        *self.end_version.lock() = Some(ver);
    }

    /// The near version a DHT-local transaction is registered under, if it
    /// differs from its own.
    pub fn mapped_version(&self) -> Option<CacheVersion> {
        match self.kind {
            TxKind::DhtLocal(_) if self.near_xid != self.xid => Some(self.near_xid),
            _ => None,
        }
    }

    /// Node that sent this transaction to us (the local node for local transactions).
    #[inline]
    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    #[inline]
    pub fn originating_node_id(&self) -> NodeId {
        self.originating_node_id
    }

    pub fn master_node_ids(&self) -> &[NodeId] {
        &self.master_node_ids
    }

    /// Other primary nodes taking part in the transaction.
    pub fn transaction_nodes(&self) -> &[NodeId] {
        &self.transaction_nodes
    }

    /// Originating thread.
    #[inline]
    pub fn thread_id(&self) -> ThreadId {
        self.thread_id
    }

    pub fn is_local(&self) -> bool {
        matches!(self.kind, TxKind::NearLocal | TxKind::DhtLocal(_))
    }

    pub fn is_near(&self) -> bool {
        matches!(self.kind, TxKind::NearLocal | TxKind::NearRemote(_))
    }

    pub fn is_dht(&self) -> bool {
        matches!(self.kind, TxKind::DhtLocal(_) | TxKind::DhtRemote(_))
    }

    pub fn is_remote(&self) -> bool {
        !self.is_local()
    }

    pub fn is_colocated(&self) -> bool {
        self.colocated
    }

    pub fn class(&self) -> TxClass {
        self.class
    }

    pub fn is_user(&self) -> bool {
        self.class == TxClass::User
    }

    pub fn is_internal(&self) -> bool {
        self.class == TxClass::Internal
    }

    pub fn is_implicit(&self) -> bool {
        self.implicit
    }

    pub fn is_implicit_single(&self) -> bool {
        self.implicit_single
    }

    pub fn isolation(&self) -> TxIsolation {
        self.isolation
    }

    pub fn concurrency(&self) -> TxConcurrency {
        self.concurrency
    }

    pub fn is_optimistic(&self) -> bool {
        self.concurrency == TxConcurrency::Optimistic
    }

    pub fn is_pessimistic(&self) -> bool {
        self.concurrency == TxConcurrency::Pessimistic
    }

    pub fn is_serializable(&self) -> bool {
        self.isolation == TxIsolation::Serializable
    }

    pub fn is_read_committed(&self) -> bool {
        self.isolation == TxIsolation::ReadCommitted
    }

    pub fn enforce_serializable(&self) -> bool {
        self.enforce_serializable
    }

    pub fn is_invalidate(&self) -> bool {
        self.invalidate
    }

    pub fn store_used(&self) -> bool {
        self.store_used
    }

    pub fn is_replicated(&self) -> bool {
        self.replicated
    }

    pub fn needs_completed_versions(&self) -> bool {
        self.needs_completed_versions
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn start_time(&self) -> Instant {
        self.start_time
    }

    pub fn topology_version(&self) -> u32 {
        self.topology_version
    }

    pub fn group_lock_key(&self) -> Option<&TxKey> {
        self.group_lock_key.as_ref()
    }

    pub fn is_group_lock(&self) -> bool {
        self.group_lock_key.is_some()
    }

    pub fn is_partition_lock(&self) -> bool {
        self.partition_lock
    }

    /// Expected number of entries given at creation.
    pub fn tx_size(&self) -> usize {
        self.tx_size
    }

    pub(crate) fn timeout_id(&self) -> u64 {
        self.timeout_id
    }

    /// Time left before the transaction times out, `None` if it has no timeout.
    pub fn remaining_time(&self) -> Option<Duration> {
        if self.timeout.is_zero() {
            None
        } else {
            Some(self.timeout.saturating_sub(self.start_time.elapsed()))
        }
    }

    pub fn state(&self) -> TxState {
        TxState::from_u8(self.state.load(Ordering::Acquire)).unwrap_or(TxState::Unknown)
    }

    /// Move to `new` if the state machine allows it from the current state.
    /// Returns the previous state on success.
    pub(crate) fn set_state(&self, new: TxState) -> Option<TxState> {
        let mut cur = self.state();
        loop {
            if !cur.can_transition_to(new) {
                return None;
            }
            match self.state.compare_exchange(
                cur as u8,
                new as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some(cur),
                Err(actual) => cur = TxState::from_u8(actual).unwrap_or(TxState::Unknown),
            }
        }
    }

    /// Move from exactly `expected` to `new`.
    pub(crate) fn cas_state(&self, expected: TxState, new: TxState) -> bool {
        expected.can_transition_to(new)
            && self
                .state
                .compare_exchange(
                    expected as u8,
                    new as u8,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
    }

    pub fn is_rollback_only(&self) -> bool {
        matches!(
            self.state(),
            TxState::MarkedRollback | TxState::RollingBack | TxState::RolledBack
        )
    }

    /// Whether the transaction reached a terminal state.
    pub fn done(&self) -> bool {
        self.state().is_terminal()
    }

    pub fn finalization(&self) -> FinalizationStatus {
        FinalizationStatus::from_u8(self.finalization.load(Ordering::Acquire))
            .unwrap_or(FinalizationStatus::None)
    }

    /// Claim the right to finish the transaction.
    ///
    /// A user finish only wins against nobody. A recovery wait succeeds if
    /// recovery owns or already waits on the transaction. A recovery finish
    /// wins against everything but a user finish.
    pub fn mark_finalizing(&self, status: FinalizationStatus) -> bool {
        let cas = |from: FinalizationStatus, to: FinalizationStatus| {
            self.finalization
                .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        };
        match status {
            FinalizationStatus::None => false,
            FinalizationStatus::UserFinish => cas(FinalizationStatus::None, status),
            FinalizationStatus::RecoveryWait => {
                cas(FinalizationStatus::None, status);
                matches!(
                    self.finalization(),
                    FinalizationStatus::RecoveryWait | FinalizationStatus::RecoveryFinish
                )
            }
            FinalizationStatus::RecoveryFinish => {
                let old = self.finalization();
                old != FinalizationStatus::UserFinish && cas(old, status)
            }
        }
    }

    /// Returns true if this call marked the transaction as preparing.
    pub(crate) fn mark_preparing(&self) -> bool {
        self.preparing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn is_system_invalidate(&self) -> bool {
        self.system_invalidate.load(Ordering::Acquire)
    }

    pub fn system_invalidate(&self, invalidate: bool) {
        self.system_invalidate.store(invalidate, Ordering::Release);
    }

    pub fn timed_out(&self) -> bool {
        self.timed_out.load(Ordering::Acquire)
    }

    pub(crate) fn set_timed_out(&self) {
        self.timed_out.store(true, Ordering::Release);
    }

    /// Completed with the terminal state once the transaction is finished.
    pub fn finish_future(&self) -> TxFuture<TxState> {
        self.finish_fut.clone()
    }

    pub fn entry(&self, key: &TxKey) -> Option<Arc<TxEntry>> {
        self.entries.read().get(key).cloned()
    }

    pub fn all_entries(&self) -> Vec<Arc<TxEntry>> {
        self.entries.read().values().cloned().collect()
    }

    /// Entries that were only read.
    pub fn read_entries(&self) -> Vec<Arc<TxEntry>> {
        self.entries
            .read()
            .values()
            .filter(|e| e.is_read())
            .cloned()
            .collect()
    }

    pub fn write_entries(&self) -> Vec<Arc<TxEntry>> {
        self.entries
            .read()
            .values()
            .filter(|e| !e.is_read())
            .cloned()
            .collect()
    }

    pub fn read_set(&self) -> BTreeSet<TxKey> {
        self.entries
            .read()
            .iter()
            .filter(|(_, e)| e.is_read())
            .map(|(k, _)| k.clone())
            .collect()
    }

    pub fn write_set(&self) -> BTreeSet<TxKey> {
        self.entries
            .read()
            .iter()
            .filter(|(_, e)| !e.is_read())
            .map(|(k, _)| k.clone())
            .collect()
    }

    /// Entries locked at prepare by an optimistic transaction: every entry
    /// for serializable isolation, the writes otherwise.
    pub fn optimistic_lock_entries(&self) -> Vec<Arc<TxEntry>> {
        if self.is_serializable() {
            self.all_entries()
        } else {
            self.write_entries()
        }
    }

    /// Insert an entry, or update the operation of an existing one. A write
    /// never downgrades to a read. Returns the stored entry and whether it
    /// was newly added.
    pub(crate) fn add_entry(
        &self,
        key: TxKey,
        op: TxOp,
        cached: impl FnOnce() -> Arc<dyn CacheEntry>,
    ) -> (Arc<TxEntry>, bool) {
        let mut entries = self.entries.write();
        if let Some(existing) = entries.get(&key) {
            if op != TxOp::Read {
                existing.set_op(op);
            }
            return (existing.clone(), false);
        }
        let entry = Arc::new(TxEntry::new(key.clone(), op, cached()));
        entries.insert(key, entry.clone());
        (entry, true)
    }

    pub fn alternate_versions(&self) -> Vec<CacheVersion> {
        self.alternate_versions.lock().clone()
    }

    pub(crate) fn add_alternate_version(&self, ver: CacheVersion) {
        let mut alternates = self.alternate_versions.lock();
        if !alternates.contains(&ver) {
            alternates.push(ver);
        }
    }

    pub fn add_invalid_partition(&self, cache_id: CacheId, partition: u32) {
        self.invalid_partitions
            .lock()
            .entry(cache_id)
            .or_default()
            .insert(partition);
    }

    pub fn invalid_partitions(&self) -> BTreeMap<CacheId, BTreeSet<u32>> {
        self.invalid_partitions.lock().clone()
    }

    pub fn completed_versions(&self) -> Option<CompletedSnapshot> {
        self.completed.lock().clone()
    }

    pub(crate) fn set_completed_versions(&self, snapshot: CompletedSnapshot) {
        *self.completed.lock() = Some(snapshot);
    }

    /// Versions of lock candidates that were pending when a DHT-local
    /// transaction committed.
    pub fn pending_versions(&self) -> Vec<CacheVersion> {
        match &self.kind {
            TxKind::DhtLocal(state) => state.pending_versions.lock().clone(),
            _ => Vec::new(),
        }
    }

    pub(crate) fn set_pending_versions(&self, versions: Vec<CacheVersion>) {
        if let TxKind::DhtLocal(state) = &self.kind {
            *state.pending_versions.lock() = versions;
        }
    }

    fn remote_state(&self) -> Option<&RemoteState> {
        match &self.kind {
            TxKind::NearRemote(state) | TxKind::DhtRemote(state) => Some(state),
            _ => None,
        }
    }

    /// Record the completion versions the coordinator sent with its finish
    /// request. Ignored for local transactions.
    pub fn done_remote(
        &self,
        base: CacheVersion,
        committed: Vec<CacheVersion>,
        rolled_back: Vec<CacheVersion>,
        pending: Vec<CacheVersion>,
    ) -> bool {
        match self.remote_state() {
            Some(state) => {
                *state.done_remote.lock() = Some(DoneRemote {
                    base: Some(base),
                    committed,
                    rolled_back,
                    pending,
                });
                true
            }
            None => false,
        }
    }

    pub fn done_remote_versions(&self) -> Option<DoneRemote> {
        self.remote_state()
            .and_then(|state| state.done_remote.lock().clone())
    }

    /// Note that the lock on `key` passed to this remote transaction.
    pub(crate) fn on_owner_changed(&self, key: &TxKey) -> bool {
        match self.remote_state() {
            Some(state) => state.locked_keys.lock().insert(key.clone()),
            None => false,
        }
    }

    /// Keys whose lock ownership passed to this remote transaction.
    pub fn locked_keys(&self) -> BTreeSet<TxKey> {
        self.remote_state()
            .map(|state| state.locked_keys.lock().clone())
            .unwrap_or_default()
    }

    pub fn recovery_writes(&self) -> Vec<RecoveryWrite> {
        self.recovery_writes.lock().clone()
    }

    pub(crate) fn set_recovery_writes(&self, writes: Vec<RecoveryWrite>) {
        *self.recovery_writes.lock() = writes;
    }

    pub(crate) fn complete_finish(&self, state: TxState) {
        self.finish_fut.on_done(state);
    }
}

impl fmt::Display for CacheTx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}[xid={}, near={}, state={}, {:?}/{:?}]",
            self.kind.name(),
            self.xid,
            self.near_xid,
            self.state(),
            self.concurrency,
            self.isolation,
        )
    }
}

impl fmt::Debug for CacheTx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheTx")
            .field("kind", &self.kind.name())
            .field("xid", &self.xid)
            .field("near_xid", &self.near_xid)
            .field("state", &self.state())
            .field("finalization", &self.finalization())
            .field("concurrency", &self.concurrency)
            .field("isolation", &self.isolation)
            .field("thread_id", &self.thread_id)
            .finish_non_exhaustive()
    }
}

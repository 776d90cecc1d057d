#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use gridcache_common::{CacheVersion, NodeId, TxKey, TxState, VersionGenerator};
use gridcache_transaction::context::{CacheContext, CacheEntry, MvccCandidate, RecoveryTransport};
use gridcache_transaction::error::{EntryError, TxError, TxResult};
use gridcache_transaction::events::{DiscoveryEvent, DiscoveryEventKind, DiscoveryListener};
use gridcache_transaction::future::TxFuture;
use gridcache_transaction::message::{
    CheckCommittedRequest, CheckCommittedResponse, CheckPreparedRequest, CheckPreparedResponse,
};
use gridcache_transaction::timeout::{TimeoutObject, TimeoutScheduler};
use gridcache_transaction::tx::{CacheTx, TxEntry, TxOp};
use gridcache_transaction::{TxManager, TxManagerConfig, TxSynchronization};
use parking_lot::{Condvar, Mutex};
use uuid::Uuid;

pub const CACHE_ID: u32 = 1;
pub const TOPOLOGY_VERSION: u32 = 1;

pub fn key(name: &str) -> TxKey {
    TxKey::new(CACHE_ID, name.as_bytes())
}

pub fn version(order: u64) -> CacheVersion {
    CacheVersion::new(TOPOLOGY_VERSION, 0, order, 1, 0)
}

/// A version allocated by another node.
pub fn remote_version(order: u64) -> CacheVersion {
    CacheVersion::new(TOPOLOGY_VERSION, 0, order, 99, 0)
}

#[derive(Default)]
struct EntryState {
    owner: Option<CacheVersion>,
    value: Option<Vec<u8>>,
    remote_candidates: Vec<CacheVersion>,
    local_candidates: Vec<MvccCandidate>,
}

/// An in-memory cache entry with a single owner lock.
pub struct MockEntry {
    key: TxKey,
    state: Mutex<EntryState>,
    cv: Condvar,
    removed: AtomicBool,
    cancelled: AtomicBool,
    obsolete: AtomicBool,
    /// Writes committed by a transaction that did not own the lock.
    unlocked_writes: AtomicUsize,
}

impl std::fmt::Debug for MockEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockEntry").field("key", &self.key).finish()
    }
}

impl MockEntry {
    fn new(key: TxKey, value: Option<Vec<u8>>) -> Self {
        Self {
            key,
            state: Mutex::new(EntryState {
                value,
                ..Default::default()
            }),
            cv: Condvar::new(),
            removed: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
            obsolete: AtomicBool::new(false),
            unlocked_writes: AtomicUsize::new(0),
        }
    }

    fn check(&self) -> Result<(), EntryError> {
        if self.removed.load(Ordering::SeqCst) {
            return Err(EntryError::Removed);
        }
        Ok(())
    }

    pub fn owner(&self) -> Option<CacheVersion> {
        self.state.lock().owner
    }

    pub fn value(&self) -> Option<Vec<u8>> {
        self.state.lock().value.clone()
    }

    pub fn unlocked_writes(&self) -> usize {
        self.unlocked_writes.load(Ordering::SeqCst)
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_obsolete(&self) -> bool {
        self.obsolete.load(Ordering::SeqCst)
    }

    pub fn set_remote_candidates(&self, versions: Vec<CacheVersion>) {
        self.state.lock().remote_candidates = versions;
    }

    pub fn set_local_candidates(&self, candidates: Vec<MvccCandidate>) {
        self.state.lock().local_candidates = candidates;
    }
}

impl CacheEntry for MockEntry {
    fn key(&self) -> &TxKey {
        &self.key
    }

    fn tm_lock(&self, xid: &CacheVersion, timeout: Option<Duration>) -> Result<bool, EntryError> {
        self.check()?;
        if self.cancelled.load(Ordering::SeqCst) {
            return Err(EntryError::LockCancelled);
        }
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.state.lock();
        loop {
            match state.owner {
                None => {
                    state.owner = Some(*xid);
                    return Ok(true);
                }
                Some(owner) if owner == *xid => return Ok(true),
                Some(_) => {}
            }
            match deadline {
                Some(deadline) => {
                    if self.cv.wait_until(&mut state, deadline).timed_out() {
                        return Ok(false);
                    }
                }
                None => self.cv.wait(&mut state),
            }
        }
    }

    fn tx_unlock(&self, xid: &CacheVersion) -> Result<(), EntryError> {
        self.check()?;
        let mut state = self.state.lock();
        if state.owner == Some(*xid) {
            state.owner = None;
            self.cv.notify_all();
        }
        Ok(())
    }

    fn obsolete(&self) -> bool {
        self.obsolete.load(Ordering::SeqCst)
    }

    fn mark_obsolete_if_empty(&self, _xid: &CacheVersion) -> Result<bool, EntryError> {
        self.check()?;
        let state = self.state.lock();
        if state.owner.is_none() && state.value.is_none() {
            self.obsolete.store(true, Ordering::SeqCst);
            return Ok(true);
        }
        Ok(false)
    }

    fn detached(&self) -> bool {
        false
    }

    fn unswap(&self) -> Result<(), EntryError> {
        self.check()
    }

    fn local_candidates(&self) -> Result<Vec<MvccCandidate>, EntryError> {
        self.check()?;
        Ok(self.state.lock().local_candidates.clone())
    }

    fn remote_mvcc_snapshot(&self) -> Result<Vec<CacheVersion>, EntryError> {
        self.check()?;
        Ok(self.state.lock().remote_candidates.clone())
    }

    fn commit_write(&self, xid: &CacheVersion, op: &TxOp) -> Result<(), EntryError> {
        self.check()?;
        let mut state = self.state.lock();
        if *op != TxOp::Read && state.owner != Some(*xid) {
            self.unlocked_writes.fetch_add(1, Ordering::SeqCst);
        }
        match op {
            TxOp::Read => {}
            TxOp::Update(value) => state.value = Some(value.clone()),
            TxOp::Delete => state.value = None,
        }
        Ok(())
    }
}

/// A scheduler that only fires when told to.
#[derive(Default)]
pub struct ManualTimeouts {
    objects: Mutex<Vec<Arc<dyn TimeoutObject>>>,
}

impl ManualTimeouts {
    pub fn len(&self) -> usize {
        self.objects.lock().len()
    }

    pub fn fire_all(&self) {
        let objects = std::mem::take(&mut *self.objects.lock());
        for obj in objects {
            obj.on_timeout();
        }
    }
}

impl TimeoutScheduler for ManualTimeouts {
    fn add_timeout_object(&self, obj: Arc<dyn TimeoutObject>) {
        self.objects.lock().push(obj);
    }

    fn remove_timeout_object(&self, id: u64) -> bool {
        let mut objects = self.objects.lock();
        let before = objects.len();
        objects.retain(|obj| obj.timeout_id() != id);
        objects.len() != before
    }
}

pub struct MockCache {
    node_id: NodeId,
    versions: VersionGenerator,
    topology_version: AtomicU32,
    entries: Mutex<HashMap<TxKey, Arc<MockEntry>>>,
    invalid: Mutex<HashSet<TxKey>>,
    alive: Mutex<HashSet<NodeId>>,
    listeners: Mutex<Vec<DiscoveryListener>>,
    timeouts: ManualTimeouts,
    pub touched: AtomicUsize,
    pub committed: AtomicUsize,
}

impl MockCache {
    pub fn new(start_order: u64) -> Self {
        let node_id = Uuid::new_v4();
        Self {
            node_id,
            versions: VersionGenerator::with_start(1, 0, start_order),
            topology_version: AtomicU32::new(TOPOLOGY_VERSION),
            entries: Mutex::new(HashMap::new()),
            invalid: Mutex::new(HashSet::new()),
            alive: Mutex::new(HashSet::from([node_id])),
            listeners: Mutex::new(Vec::new()),
            timeouts: ManualTimeouts::default(),
            touched: AtomicUsize::new(0),
            committed: AtomicUsize::new(0),
        }
    }

    pub fn manual_timeouts(&self) -> &ManualTimeouts {
        &self.timeouts
    }

    /// Register a live node and return its id.
    pub fn add_node(&self) -> NodeId {
        let node_id = Uuid::new_v4();
        self.alive.lock().insert(node_id);
        node_id
    }

    pub fn fail_node(&self, node_id: NodeId) {
        self.alive.lock().remove(&node_id);
        let listeners = self.listeners.lock().clone();
        let evt = DiscoveryEvent {
            kind: DiscoveryEventKind::NodeFailed,
            node_id,
        };
        for listener in listeners {
            listener(&evt);
        }
    }

    pub fn mock_entry(&self, key: &TxKey) -> Option<Arc<MockEntry>> {
        self.entries.lock().get(key).cloned()
    }

    pub fn put(&self, key: &TxKey, value: &[u8]) {
        self.entries.lock().insert(
            key.clone(),
            Arc::new(MockEntry::new(key.clone(), Some(value.to_vec()))),
        );
    }

    /// Evict the entry so handles to it fail with `Removed`.
    pub fn evict(&self, key: &TxKey) {
        if let Some(entry) = self.entries.lock().remove(key) {
            entry.removed.store(true, Ordering::SeqCst);
        }
    }

    pub fn set_invalid(&self, key: &TxKey) {
        self.invalid.lock().insert(key.clone());
    }
}

impl CacheContext for MockCache {
    fn local_node_id(&self) -> NodeId {
        self.node_id
    }

    fn topology_version(&self) -> u32 {
        self.topology_version.load(Ordering::SeqCst)
    }

    fn versions(&self) -> &VersionGenerator {
        &self.versions
    }

    fn entry(&self, key: &TxKey, _topology_version: u32) -> Result<Arc<dyn CacheEntry>, EntryError> {
        if self.invalid.lock().contains(key) {
            return Err(EntryError::InvalidPartition(7));
        }
        let entry: Arc<dyn CacheEntry> = self
            .entries
            .lock()
            .entry(key.clone())
            .or_insert_with(|| Arc::new(MockEntry::new(key.clone(), None)))
            .clone();
        Ok(entry)
    }

    fn remove_entry(&self, entry: &Arc<dyn CacheEntry>) {
        let mut entries = self.entries.lock();
        let same = entries
            .get(entry.key())
            .is_some_and(|e| Arc::as_ptr(e) as *const () == Arc::as_ptr(entry) as *const ());
        if same {
            entries.remove(entry.key());
        }
    }

    fn touch(&self, _entry: &TxEntry, _local: bool) {
        self.touched.fetch_add(1, Ordering::SeqCst);
    }

    fn on_tx_committed(&self, _tx: &CacheTx) {
        self.committed.fetch_add(1, Ordering::SeqCst);
    }

    fn node_alive(&self, node_id: &NodeId) -> bool {
        self.alive.lock().contains(node_id)
    }

    fn timeouts(&self) -> &dyn TimeoutScheduler {
        &self.timeouts
    }

    fn subscribe_discovery(&self, listener: DiscoveryListener) {
        self.listeners.lock().push(listener);
    }
}

/// Answers recovery requests from planned per-node responses. Nodes without
/// a plan are unreachable.
#[derive(Default)]
pub struct MockTransport {
    prepared: Mutex<HashMap<NodeId, bool>>,
    committed: Mutex<HashMap<NodeId, CheckCommittedResponse>>,
    pub sent: AtomicUsize,
}

impl MockTransport {
    pub fn answer_prepared(&self, node_id: NodeId, prepared: bool) {
        self.prepared.lock().insert(node_id, prepared);
    }

    pub fn answer_committed(&self, node_id: NodeId, response: CheckCommittedResponse) {
        self.committed.lock().insert(node_id, response);
    }
}

impl RecoveryTransport for MockTransport {
    fn send_check_prepared(
        &self,
        node_id: NodeId,
        req: CheckPreparedRequest,
    ) -> TxFuture<TxResult<CheckPreparedResponse>> {
        self.sent.fetch_add(1, Ordering::SeqCst);
        let res = match self.prepared.lock().get(&node_id) {
            Some(prepared) => Ok(CheckPreparedResponse {
                prepared: *prepared,
            }),
            None => Err(TxError::RemoteUnreachable(req.near_xid)),
        };
        TxFuture::finished(res)
    }

    fn send_check_committed(
        &self,
        node_id: NodeId,
        req: CheckCommittedRequest,
    ) -> TxFuture<TxResult<CheckCommittedResponse>> {
        self.sent.fetch_add(1, Ordering::SeqCst);
        let res = match self.committed.lock().get(&node_id) {
            Some(response) => Ok(response.clone()),
            None => Err(TxError::RemoteUnreachable(req.near_xid)),
        };
        TxFuture::finished(res)
    }
}

/// Records every state change it is notified of.
#[derive(Default)]
pub struct RecordingSync {
    pub events: Mutex<Vec<(Option<TxState>, TxState)>>,
}

impl TxSynchronization for RecordingSync {
    fn on_state_changed(&self, prev: Option<TxState>, new: TxState, _tx: &CacheTx) {
        self.events.lock().push((prev, new));
    }
}

pub struct Harness {
    pub manager: Arc<TxManager>,
    pub cache: Arc<MockCache>,
    pub transport: Arc<MockTransport>,
}

impl Harness {
    pub fn new(config: TxManagerConfig) -> Self {
        Self::with_start(config, 1)
    }

    /// Versions allocated by the manager start at order `start_order`.
    pub fn with_start(config: TxManagerConfig, start_order: u64) -> Self {
        let cache = Arc::new(MockCache::new(start_order));
        let transport = Arc::new(MockTransport::default());
        let manager = TxManager::new(cache.clone(), transport.clone(), config);
        Self {
            manager,
            cache,
            transport,
        }
    }

    pub fn local_node(&self) -> NodeId {
        self.cache.local_node_id()
    }
}

pub fn serializable_config() -> TxManagerConfig {
    TxManagerConfig {
        serializable_enabled: true,
        ..Default::default()
    }
}

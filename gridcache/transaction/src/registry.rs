use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use gridcache_common::{CacheVersion, ThreadId};

use crate::tx::CacheTx;

/// Index of live transactions.
///
/// Local transactions and non-near remote transactions live in the id map,
/// near remote transactions in the near id map. Local non-DHT transactions
/// are additionally indexed by the thread that started them.
#[derive(Default)]
pub struct TxRegistry {
    id_map: DashMap<CacheVersion, Arc<CacheTx>>,
    near_id_map: DashMap<CacheVersion, Arc<CacheTx>>,
    thread_map: DashMap<ThreadId, Arc<CacheTx>>,
}

impl TxRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The map a transaction is registered in.
    fn transaction_map(&self, tx: &CacheTx) -> &DashMap<CacheVersion, Arc<CacheTx>> {
        if tx.is_near() && !tx.is_local() {
            &self.near_id_map
        } else {
            &self.id_map
        }
    }

    /// Register `tx` under its xid. On collision returns the transaction
    /// already registered.
    pub fn insert(&self, tx: &Arc<CacheTx>) -> Result<(), Arc<CacheTx>> {
        match self.transaction_map(tx).entry(tx.xid()) {
            Entry::Occupied(existing) => Err(existing.get().clone()),
            Entry::Vacant(vacant) => {
                vacant.insert(tx.clone());
                Ok(())
            }
        }
    }

    /// Remove `tx` only if it is still the transaction registered under its xid.
    pub fn remove(&self, tx: &Arc<CacheTx>) -> bool {
        self.transaction_map(tx)
            .remove_if(&tx.xid(), |_, registered| Arc::ptr_eq(registered, tx))
            .is_some()
    }

    pub fn get_by_xid(&self, xid: &CacheVersion) -> Option<Arc<CacheTx>> {
        self.id_map.get(xid).map(|tx| tx.clone())
    }

    pub fn get_near(&self, xid: &CacheVersion) -> Option<Arc<CacheTx>> {
        self.near_id_map.get(xid).map(|tx| tx.clone())
    }

    pub fn get_by_thread(&self, thread_id: ThreadId) -> Option<Arc<CacheTx>> {
        self.thread_map.get(&thread_id).map(|tx| tx.clone())
    }

    pub fn set_thread(&self, tx: &Arc<CacheTx>) {
        self.thread_map.insert(tx.thread_id(), tx.clone());
    }

    pub fn remove_thread(&self, tx: &Arc<CacheTx>) -> bool {
        self.thread_map
            .remove_if(&tx.thread_id(), |_, registered| Arc::ptr_eq(registered, tx))
            .is_some()
    }

    /// Register `tx` under an additional version. Returns false if the
    /// version is taken.
    pub fn add_alternate(&self, ver: CacheVersion, tx: &Arc<CacheTx>) -> bool {
        match self.id_map.entry(ver) {
            Entry::Occupied(_) => false,
            Entry::Vacant(vacant) => {
                vacant.insert(tx.clone());
                true
            }
        }
    }

    pub fn remove_alternate(&self, ver: &CacheVersion, tx: &Arc<CacheTx>) -> bool {
        self.id_map
            .remove_if(ver, |_, registered| Arc::ptr_eq(registered, tx))
            .is_some()
    }

    /// Snapshot of the id map's transactions, without alternate registrations.
    pub fn id_txs(&self) -> Vec<Arc<CacheTx>> {
        self.id_map
            .iter()
            .filter(|e| *e.key() == e.value().xid())
            .map(|e| e.value().clone())
            .collect()
    }

    /// Snapshot of every live transaction.
    pub fn txs(&self) -> Vec<Arc<CacheTx>> {
        let mut txs = self.id_txs();
        txs.extend(self.near_id_map.iter().map(|e| e.value().clone()));
        txs
    }

    pub fn id_map_len(&self) -> usize {
        self.id_map.len()
    }

    pub fn near_id_map_len(&self) -> usize {
        self.near_id_map.len()
    }

    pub fn thread_map_len(&self) -> usize {
        self.thread_map.len()
    }
}

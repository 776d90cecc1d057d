//! Per-thread slot for the transaction a thread is currently finishing.
//!
//! Slots are keyed by manager so several managers in one process (one per
//! simulated node in tests) do not see each other's context.

use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::Arc;

use crate::tx::CacheTx;

thread_local! {
    static TX_CONTEXT: RefCell<HashMap<u64, Arc<CacheTx>>> = RefCell::new(HashMap::new());
}

pub fn set(manager_id: u64, tx: Arc<CacheTx>) {
    TX_CONTEXT.with(|ctx| {
        ctx.borrow_mut().insert(manager_id, tx);
    });
}

pub fn get(manager_id: u64) -> Option<Arc<CacheTx>> {
    TX_CONTEXT.with(|ctx| ctx.borrow().get(&manager_id).cloned())
}

pub fn reset(manager_id: u64) {
    TX_CONTEXT.with(|ctx| {
        ctx.borrow_mut().remove(&manager_id);
    });
}

/// Sets the context for the lifetime of the guard.
pub struct ContextGuard {
    manager_id: u64,
}

impl ContextGuard {
    pub fn enter(manager_id: u64, tx: Arc<CacheTx>) -> Self {
        set(manager_id, tx);
        Self { manager_id }
    }
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        reset(self.manager_id);
    }
}

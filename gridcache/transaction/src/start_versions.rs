use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam_skiplist::SkipMap;
use gridcache_common::CacheVersion;
use tracing::{debug, error};

/// Multiset of start versions of live serializable transactions.
///
/// Counters are compared by identity: a counter that dropped to zero is
/// about to be removed by its decrementer, so an incrementer that observes
/// zero removes that exact counter itself and retries with a fresh one.
#[derive(Default)]
pub struct StartVersionCounts {
    counts: SkipMap<CacheVersion, Arc<AtomicUsize>>,
}

impl StartVersionCounts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment(&self, ver: CacheVersion) {
        loop {
            let fresh = Arc::new(AtomicUsize::new(1));
            let entry = self.counts.get_or_insert(ver, fresh.clone());
            if Arc::ptr_eq(entry.value(), &fresh) {
                return;
            }

            let counter = entry.value();
            let mut cur = counter.load(Ordering::Acquire);
            loop {
                if cur == 0 {
                    if entry.remove() {
                        debug!(version = %ver, "removed drained start version count");
                    }
                    break;
                }
                match counter.compare_exchange_weak(
                    cur,
                    cur + 1,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => return,
                    Err(actual) => cur = actual,
                }
            }
        }
    }

    pub fn decrement(&self, ver: &CacheVersion) {
        let Some(entry) = self.counts.get(ver) else {
            error!(version = %ver, "missing start version count");
            return;
        };
        let Ok(prev) = entry
            .value()
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
        else {
            error!(version = %ver, "start version count underflow");
            return;
        };
        if prev == 1 && entry.remove() {
            debug!(version = %ver, "removed start version count");
        }
    }

    /// The smallest start version of a live transaction.
    pub fn first(&self) -> Option<CacheVersion> {
        self.counts.front().map(|e| *e.key())
    }

    pub fn count(&self, ver: &CacheVersion) -> usize {
        self.counts
            .get(ver)
            .map(|e| e.value().load(Ordering::Acquire))
            .unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }
}

//! Committed and rolled back version sets.

use std::ops::Bound;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use crossbeam_skiplist::SkipMap;
use dashmap::DashMap;
use gridcache_common::CacheVersion;
use tracing::debug;

/// A concurrent ordered set of versions holding at most `capacity` elements.
/// When an insert pushes it over capacity the smallest versions are evicted.
///
/// Each version may carry the near version of the transaction it belongs to,
/// which is used for reverse lookups during recovery. Equality is on the
/// version alone.
pub struct BoundedVersionSet {
    set: SkipMap<CacheVersion, (Option<CacheVersion>, u64)>,
    size: AtomicUsize,
    capacity: usize,
    next_token: AtomicU64,
}

impl BoundedVersionSet {
    pub fn new(capacity: usize) -> Self {
        Self {
            set: SkipMap::new(),
            size: AtomicUsize::new(0),
            capacity: capacity.max(1),
            next_token: AtomicU64::new(0),
        }
    }

    /// Add a version. Returns false if it was already present.
    pub fn add(&self, ver: CacheVersion, near: Option<CacheVersion>) -> bool {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let entry = self.set.get_or_insert(ver, (near, token));
        if entry.value().1 != token {
            return false;
        }
        self.size.fetch_add(1, Ordering::AcqRel);

        while self.size.load(Ordering::Acquire) > self.capacity {
            match self.set.pop_front() {
                Some(evicted) => {
                    self.size.fetch_sub(1, Ordering::AcqRel);
                    debug!(version = %evicted.key(), "evicted completed version");
                }
                None => break,
            }
        }
        true
    }

    pub fn remove(&self, ver: &CacheVersion) -> bool {
        if self.set.remove(ver).is_some() {
            self.size.fetch_sub(1, Ordering::AcqRel);
            true
        } else {
            false
        }
    }

    pub fn contains(&self, ver: &CacheVersion) -> bool {
        self.set.contains_key(ver)
    }

    pub fn first(&self) -> Option<CacheVersion> {
        self.set.front().map(|e| *e.key())
    }

    pub fn last(&self) -> Option<CacheVersion> {
        self.set.back().map(|e| *e.key())
    }

    /// Versions greater than (or equal to, if `inclusive`) `min`, in order.
    pub fn tail(&self, min: &CacheVersion, inclusive: bool) -> Vec<CacheVersion> {
        let lower = if inclusive {
            Bound::Included(*min)
        } else {
            Bound::Excluded(*min)
        };
        self.set
            .range((lower, Bound::Unbounded))
            .map(|e| *e.key())
            .collect()
    }

    /// Iterate over `(version, near version)` pairs in order.
    pub fn iter(&self) -> impl Iterator<Item = (CacheVersion, Option<CacheVersion>)> + '_ {
        self.set.iter().map(|e| (*e.key(), e.value().0))
    }

    pub fn len(&self) -> usize {
        self.set.len()
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// The manager's record of finished transactions: committed and rolled back
/// versions plus the near to DHT version mapping of live transactions.
pub struct CompletedVersions {
    committed: BoundedVersionSet,
    rolled_back: BoundedVersionSet,
    mapped: DashMap<CacheVersion, CacheVersion>,
}

impl CompletedVersions {
    pub fn new(capacity: usize) -> Self {
        Self {
            committed: BoundedVersionSet::new(capacity),
            rolled_back: BoundedVersionSet::new(capacity),
            mapped: DashMap::new(),
        }
    }

    #[inline]
    pub fn committed(&self) -> &BoundedVersionSet {
        &self.committed
    }

    #[inline]
    pub fn rolled_back(&self) -> &BoundedVersionSet {
        &self.rolled_back
    }

    /// Returns true if the version is in either completed set.
    pub fn is_completed(&self, ver: &CacheVersion) -> bool {
        self.committed.contains(ver) || self.rolled_back.contains(ver)
    }

    pub fn map(&self, near: CacheVersion, dht: CacheVersion) {
        self.mapped.insert(near, dht);
    }

    pub fn unmap(&self, near: &CacheVersion) {
        self.mapped.remove(near);
    }

    pub fn mapped(&self, near: &CacheVersion) -> Option<CacheVersion> {
        self.mapped.get(near).map(|dht| *dht)
    }

    pub fn mapped_len(&self) -> usize {
        self.mapped.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ver(order: u64) -> CacheVersion {
        CacheVersion::new(1, 0, order, 1, 0)
    }

    #[test]
    fn test_add_is_deduplicated() {
        let set = BoundedVersionSet::new(8);
        assert!(set.add(ver(1), None));
        assert!(!set.add(ver(1), Some(ver(9))));
        assert_eq!(set.len(), 1);
        // The first insert wins, including its near version.
        assert_eq!(set.iter().next(), Some((ver(1), None)));
    }

    #[test]
    fn test_evicts_smallest_on_overflow() {
        let set = BoundedVersionSet::new(4);
        for order in [3, 1, 5, 2, 4] {
            set.add(ver(order), None);
        }
        assert_eq!(set.len(), 4);
        assert!(!set.contains(&ver(1)));
        assert_eq!(set.first(), Some(ver(2)));
        assert_eq!(set.last(), Some(ver(5)));
    }

    #[test]
    fn test_tail() {
        let set = BoundedVersionSet::new(16);
        for order in 1..=5 {
            set.add(ver(order), None);
        }
        assert_eq!(set.tail(&ver(3), true), vec![ver(3), ver(4), ver(5)]);
        assert_eq!(set.tail(&ver(3), false), vec![ver(4), ver(5)]);
        assert!(set.tail(&ver(6), true).is_empty());
    }

    #[test]
    fn test_remove_frees_capacity() {
        let set = BoundedVersionSet::new(2);
        set.add(ver(1), None);
        set.add(ver(2), None);
        assert!(set.remove(&ver(1)));
        assert!(!set.remove(&ver(1)));
        set.add(ver(3), None);
        assert!(set.contains(&ver(2)));
        assert!(set.contains(&ver(3)));
    }

    #[test]
    fn test_completed_versions() {
        let completed = CompletedVersions::new(4);
        completed.committed().add(ver(1), Some(ver(10)));
        completed.rolled_back().add(ver(2), None);
        assert!(completed.is_completed(&ver(1)));
        assert!(completed.is_completed(&ver(2)));
        assert!(!completed.is_completed(&ver(3)));

        completed.map(ver(10), ver(1));
        assert_eq!(completed.mapped(&ver(10)), Some(ver(1)));
        completed.unmap(&ver(10));
        assert_eq!(completed.mapped(&ver(10)), None);
    }
}

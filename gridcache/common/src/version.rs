//! Cache versions used as transaction identifiers.
//!
//! A [`CacheVersion`] is the globally unique, totally ordered identifier of a
//! transaction (its XID) and also serves as start and end version. Versions are
//! allocated by a per-node [`VersionGenerator`].

use std::cmp::Ordering as CmpOrdering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::VersionError;

/// Globally unique version made of topology version, global time, order,
/// node order and data center id.
///
/// The global time is informational only: it takes no part in equality,
/// hashing or ordering. Versions compare by topology version first, then by
/// order, then by node order and data center id.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct CacheVersion {
    topology_version: u32,
    global_time: u64,
    order: u64,
    node_order: u32,
    data_center_id: u8,
}

impl CacheVersion {
    pub const fn new(
        topology_version: u32,
        global_time: u64,
        order: u64,
        node_order: u32,
        data_center_id: u8,
    ) -> Self {
        Self {
            topology_version,
            global_time,
            order,
            node_order,
            data_center_id,
        }
    }

    /// The largest representable version.
    pub const fn max() -> Self {
        Self::new(u32::MAX, u64::MAX, u64::MAX, u32::MAX, u8::MAX)
    }

    pub fn topology_version(&self) -> u32 {
        self.topology_version
    }

    pub fn global_time(&self) -> u64 {
        self.global_time
    }

    pub fn order(&self) -> u64 {
        self.order
    }

    pub fn node_order(&self) -> u32 {
        self.node_order
    }

    pub fn data_center_id(&self) -> u8 {
        self.data_center_id
    }

    fn ordering_key(&self) -> (u32, u64, u32, u8) {
        (
            self.topology_version,
            self.order,
            self.node_order,
            self.data_center_id,
        )
    }
}

impl PartialEq for CacheVersion {
    fn eq(&self, other: &Self) -> bool {
        self.ordering_key() == other.ordering_key()
    }
}

impl Eq for CacheVersion {}

impl Hash for CacheVersion {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.ordering_key().hash(state);
    }
}

impl PartialOrd for CacheVersion {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for CacheVersion {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.ordering_key().cmp(&other.ordering_key())
    }
}

impl fmt::Display for CacheVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "v[top={}, order={}, node={}, dc={}]",
            self.topology_version, self.order, self.node_order, self.data_center_id
        )
    }
}

/// Allocates versions for one node.
pub struct VersionGenerator {
    node_order: u32,
    data_center_id: u8,
    /// Order of the last issued version.
    order: AtomicU64,
    /// Highest topology version seen so far.
    topology_version: AtomicU32,
}

impl VersionGenerator {
    /// Create a generator whose first version has order 1.
    pub fn new(node_order: u32, data_center_id: u8) -> Self {
        Self::with_start(node_order, data_center_id, 1)
    }

    /// Create a generator whose first version has the given order.
    pub fn with_start(node_order: u32, data_center_id: u8, start: u64) -> Self {
        Self {
            node_order,
            data_center_id,
            order: AtomicU64::new(start.saturating_sub(1)),
            topology_version: AtomicU32::new(0),
        }
    }

    /// Generate the next version for the given topology version.
    pub fn next(&self, topology_version: u32) -> Result<CacheVersion, VersionError> {
        let mut cur = self.order.load(Ordering::SeqCst);
        loop {
            if cur == u64::MAX {
                return Err(VersionError::OrderOverflow(cur));
            }
            match self.order.compare_exchange_weak(
                cur,
                cur + 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => {
                    let top = self
                        .topology_version
                        .fetch_max(topology_version, Ordering::SeqCst)
                        .max(topology_version);
                    return Ok(CacheVersion::new(
                        top,
                        now_millis(),
                        cur + 1,
                        self.node_order,
                        self.data_center_id,
                    ));
                }
                Err(actual) => cur = actual,
            }
        }
    }

    /// The last issued version, without allocating a new one.
    pub fn last(&self) -> CacheVersion {
        CacheVersion::new(
            self.topology_version.load(Ordering::SeqCst),
            now_millis(),
            self.order.load(Ordering::SeqCst),
            self.node_order,
            self.data_center_id,
        )
    }

    /// Make sure versions generated later are greater than a version received
    /// from a remote node.
    pub fn on_received(&self, ver: &CacheVersion) {
        self.order.fetch_max(ver.order(), Ordering::SeqCst);
        self.topology_version
            .fetch_max(ver.topology_version(), Ordering::SeqCst);
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_global_time_ignored_by_equality() {
        let a = CacheVersion::new(1, 100, 5, 1, 0);
        let b = CacheVersion::new(1, 200, 5, 1, 0);
        assert_eq!(a, b);
        assert_eq!(a.cmp(&b), CmpOrdering::Equal);
    }

    #[test]
    fn test_topology_dominates_order() {
        let older = CacheVersion::new(1, 0, 100, 1, 0);
        let newer = CacheVersion::new(2, 0, 1, 1, 0);
        assert!(older < newer);
        assert!(CacheVersion::max() > newer);
    }

    #[test]
    fn test_generator_sequence() {
        let generator = VersionGenerator::with_start(3, 0, 10);
        assert_eq!(generator.last().order(), 9);

        let v1 = generator.next(1).unwrap();
        assert_eq!(v1.order(), 10);
        assert_eq!(v1.node_order(), 3);
        assert_eq!(generator.last(), v1);

        let v2 = generator.next(1).unwrap();
        assert!(v2 > v1);
        assert_eq!(v2.order(), 11);
    }

    #[test]
    fn test_topology_never_goes_back() {
        let generator = VersionGenerator::new(1, 0);
        let v1 = generator.next(5).unwrap();
        let v2 = generator.next(3).unwrap();
        assert_eq!(v2.topology_version(), 5);
        assert!(v2 > v1);
    }

    #[test]
    fn test_on_received() {
        let generator = VersionGenerator::new(1, 0);
        generator.on_received(&CacheVersion::new(2, 0, 100, 7, 0));
        let next = generator.next(1).unwrap();
        assert_eq!(next.order(), 101);
        assert_eq!(next.topology_version(), 2);

        // Never decreases.
        generator.on_received(&CacheVersion::new(1, 0, 50, 7, 0));
        assert_eq!(generator.next(1).unwrap().order(), 102);
    }

    #[test]
    fn test_overflow() {
        let generator = VersionGenerator::with_start(1, 0, u64::MAX);
        assert_eq!(generator.next(1).unwrap().order(), u64::MAX);
        assert!(matches!(
            generator.next(1),
            Err(VersionError::OrderOverflow(u64::MAX))
        ));
    }
}

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

fn nanos(duration: Duration) -> u64 {
    u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX)
}

/// Commit and rollback counters of local transactions.
#[derive(Debug, Default)]
pub struct TxMetrics {
    commits: AtomicU64,
    rollbacks: AtomicU64,
    commit_time_nanos: AtomicU64,
    rollback_time_nanos: AtomicU64,
}

impl TxMetrics {
    pub(crate) fn on_tx_commit(&self, duration: Duration) {
        self.commits.fetch_add(1, Ordering::Relaxed);
        self.commit_time_nanos
            .fetch_add(nanos(duration), Ordering::Relaxed);
    }

    pub(crate) fn on_tx_rollback(&self, duration: Duration) {
        self.rollbacks.fetch_add(1, Ordering::Relaxed);
        self.rollback_time_nanos
            .fetch_add(nanos(duration), Ordering::Relaxed);
    }

    #[inline]
    pub fn commits(&self) -> u64 {
        self.commits.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn rollbacks(&self) -> u64 {
        self.rollbacks.load(Ordering::Relaxed)
    }

    /// Returns the accumulated lifetime of committed transactions.
    #[inline]
    pub fn commit_time(&self) -> Duration {
        Duration::from_nanos(self.commit_time_nanos.load(Ordering::Relaxed))
    }

    /// Returns the accumulated lifetime of rolled back transactions.
    #[inline]
    pub fn rollback_time(&self) -> Duration {
        Duration::from_nanos(self.rollback_time_nanos.load(Ordering::Relaxed))
    }
}

/// Snapshot of the manager's internal structure sizes.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TxManagerStats {
    pub thread_map_size: usize,
    pub id_map_size: usize,
    pub near_id_map_size: usize,
    pub committed_queue_size: usize,
    pub prepare_queue_size: usize,
    pub start_version_counts_size: usize,
    pub committed_versions_size: usize,
    pub rolledback_versions_size: usize,
    pub mapped_versions_size: usize,
    pub recovery_buffer_size: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let metrics = TxMetrics::default();
        metrics.on_tx_commit(Duration::from_millis(2));
        metrics.on_tx_commit(Duration::from_millis(3));
        metrics.on_tx_rollback(Duration::from_millis(1));
        assert_eq!(metrics.commits(), 2);
        assert_eq!(metrics.rollbacks(), 1);
        assert_eq!(metrics.commit_time(), Duration::from_millis(5));
        assert_eq!(metrics.rollback_time(), Duration::from_millis(1));
    }
}

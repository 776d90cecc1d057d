use std::sync::atomic::{AtomicBool, Ordering};

use dashmap::{DashMap, DashSet};
use dashmap::mapref::entry::Entry;
use gridcache_common::{NodeId, ThreadId};
use tracing::debug;

use crate::future::TxFuture;

static DISABLED: AtomicBool = AtomicBool::new(false);

/// Turn finish-ack synchronization into a no-op for the whole process. Meant
/// for test harnesses that never deliver acks.
pub fn set_disabled(disabled: bool) {
    DISABLED.store(disabled, Ordering::Relaxed);
}

pub fn is_disabled() -> bool {
    DISABLED.load(Ordering::Relaxed)
}

#[derive(Default)]
struct PendingAcks {
    count: usize,
    waiter: Option<TxFuture<()>>,
}

/// Tracks finish requests sent to remote nodes that are not acknowledged yet,
/// per remote node and originating thread.
#[derive(Default)]
pub struct FinishSync {
    pending: DashMap<(NodeId, ThreadId), PendingAcks>,
    /// Nodes that left. Their acks will never arrive.
    left: DashSet<NodeId>,
}

impl FinishSync {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_finish_send(&self, node_id: NodeId, thread_id: ThreadId) {
        if self.left.contains(&node_id) {
            debug!(%node_id, thread_id, "finish request sent to node that left");
            return;
        }
        self.pending.entry((node_id, thread_id)).or_default().count += 1;

        // Raced with on_node_left, which may have cleared the node already.
        if self.left.contains(&node_id) {
            let removed = self.pending.remove(&(node_id, thread_id));
            if let Some((_, PendingAcks { waiter: Some(waiter), .. })) = removed {
                waiter.on_done(());
            }
        }
    }

    pub fn on_ack_received(&self, node_id: NodeId, thread_id: ThreadId) {
        let waiter = match self.pending.entry((node_id, thread_id)) {
            Entry::Occupied(mut occupied) => {
                let pending = occupied.get_mut();
                pending.count = pending.count.saturating_sub(1);
                if pending.count == 0 {
                    occupied.remove().waiter
                } else {
                    None
                }
            }
            Entry::Vacant(_) => {
                debug!(%node_id, thread_id, "ack received without pending finish request");
                None
            }
        };
        if let Some(waiter) = waiter {
            waiter.on_done(());
        }
    }

    /// Returns a future completed once every finish request sent to
    /// `node_id` from `thread_id` is acknowledged.
    pub fn await_ack_async(&self, node_id: NodeId, thread_id: ThreadId) -> TxFuture<()> {
        match self.pending.get_mut(&(node_id, thread_id)) {
            Some(mut pending) if pending.count > 0 => {
                pending.waiter.get_or_insert_with(TxFuture::new).clone()
            }
            _ => TxFuture::finished(()),
        }
    }

    /// Release every waiter on a node that left. Its acks will never arrive.
    pub fn on_node_left(&self, node_id: NodeId) {
        self.left.insert(node_id);
        let mut waiters = Vec::new();
        self.pending.retain(|(node, _), pending| {
            if *node != node_id {
                return true;
            }
            waiters.extend(pending.waiter.take());
            false
        });
        for waiter in waiters {
            waiter.on_done(());
        }
    }

    /// Number of unacknowledged finish requests.
    pub fn pending(&self, node_id: NodeId, thread_id: ThreadId) -> usize {
        self.pending
            .get(&(node_id, thread_id))
            .map(|p| p.count)
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;

    #[test]
    fn test_ready_without_pending() {
        let sync = FinishSync::new();
        assert!(sync.await_ack_async(Uuid::new_v4(), 1).is_done());
    }

    #[test]
    fn test_waiter_shared_between_calls() {
        let sync = FinishSync::new();
        let node = Uuid::new_v4();
        sync.on_finish_send(node, 1);
        let first = sync.await_ack_async(node, 1);
        let second = sync.await_ack_async(node, 1);
        assert!(!first.is_done());
        sync.on_ack_received(node, 1);
        assert!(first.is_done() && second.is_done());
        assert_eq!(sync.pending(node, 1), 0);
    }

    #[test]
    fn test_threads_are_independent() {
        let sync = FinishSync::new();
        let node = Uuid::new_v4();
        sync.on_finish_send(node, 1);
        sync.on_finish_send(node, 2);
        let waiter = sync.await_ack_async(node, 1);
        sync.on_ack_received(node, 2);
        assert!(!waiter.is_done());
        assert!(sync.await_ack_async(node, 2).is_done());
    }

    #[test]
    fn test_send_after_node_left_is_not_awaited() {
        let sync = FinishSync::new();
        let node = Uuid::new_v4();
        sync.on_node_left(node);
        sync.on_finish_send(node, 1);
        assert_eq!(sync.pending(node, 1), 0);
        assert!(sync.await_ack_async(node, 1).is_done());
    }

    #[test]
    fn test_stray_ack_is_ignored() {
        let sync = FinishSync::new();
        let node = Uuid::new_v4();
        sync.on_ack_received(node, 1);
        sync.on_finish_send(node, 1);
        assert!(!sync.await_ack_async(node, 1).is_done());
    }
}

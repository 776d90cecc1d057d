//! Discovery event bindings of the transaction manager.

use std::sync::Arc;
use std::time::Instant;

use gridcache_common::{FinalizationStatus, NodeId};
use tracing::debug;

use crate::manager::TxManager;
use crate::recovery::NodeFailureTimeoutObject;
use crate::timeout::next_timeout_id;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryEventKind {
    NodeJoined,
    NodeLeft,
    NodeFailed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiscoveryEvent {
    pub kind: DiscoveryEventKind,
    pub node_id: NodeId,
}

pub type DiscoveryListener = Arc<dyn Fn(&DiscoveryEvent) + Send + Sync>;

impl TxManager {
    /// Subscribe to discovery events and invalidate transactions left over
    /// from nodes that are already gone.
    pub fn on_start(&self) {
        let manager = self.me.clone();
        self.context()
            .subscribe_discovery(Arc::new(move |evt: &DiscoveryEvent| {
                if let Some(manager) = manager.upgrade() {
                    manager.on_discovery_event(evt);
                }
            }));

        for tx in self.registry.id_txs() {
            if (!tx.is_local() || tx.is_dht()) && !self.context().alive_all(tx.master_node_ids()) {
                debug!(tx = %tx, "remaining transaction from left node");
                self.salvage(&tx, true, FinalizationStatus::UserFinish);
            }
        }
    }

    /// Schedule recovery for a node that left or failed and release the
    /// finish acks nobody will send anymore.
    pub fn on_discovery_event(&self, evt: &DiscoveryEvent) {
        match evt.kind {
            DiscoveryEventKind::NodeLeft | DiscoveryEventKind::NodeFailed => {
                debug!(node_id = %evt.node_id, kind = ?evt.kind, "scheduling transaction salvage");
                self.context()
                    .timeouts()
                    .add_timeout_object(Arc::new(NodeFailureTimeoutObject {
                        manager: self.me.clone(),
                        node_id: evt.node_id,
                        id: next_timeout_id(),
                        end: Instant::now() + self.config().tx_salvage_timeout,
                    }));
                self.finish_sync.on_node_left(evt.node_id);
            }
            DiscoveryEventKind::NodeJoined => {}
        }
    }
}

mod common;

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use common::*;
use gridcache_common::{TxConcurrency, TxIsolation, TxState};
use gridcache_transaction::tx::TxOp;
use gridcache_transaction::{CacheTx, NewTxOptions, TxError, TxManagerConfig};

fn optimistic(h: &Harness, isolation: TxIsolation) -> Arc<CacheTx> {
    h.manager
        .new_tx(NewTxOptions {
            concurrency: TxConcurrency::Optimistic,
            isolation,
            timeout: Duration::from_millis(200),
            ..Default::default()
        })
        .unwrap()
        .unwrap()
}

fn write(h: &Harness, tx: &Arc<CacheTx>, name: &str) {
    h.manager
        .enlist_write(tx, key(name), TxOp::Update(name.as_bytes().to_vec()))
        .unwrap();
}

fn read(h: &Harness, tx: &Arc<CacheTx>, name: &str) {
    h.manager.enlist_read(tx, key(name)).unwrap();
}

// ========== READ/WRITE CONFLICTS ==========

#[test]
fn test_committed_write_conflicts_with_concurrent_read() {
    let h = Harness::with_start(serializable_config(), 10);
    let tx1 = optimistic(&h, TxIsolation::Serializable);
    let tx2 = optimistic(&h, TxIsolation::Serializable);
    assert_eq!(tx1.start_version().order(), 10);
    assert_eq!(tx2.start_version().order(), 11);

    write(&h, &tx1, "k1");
    read(&h, &tx2, "k1");

    h.manager.commit(&tx1).unwrap();
    assert_eq!(tx1.end_version().unwrap().order(), 12);

    let err = h.manager.commit(&tx2).unwrap_err();
    assert!(matches!(err, TxError::OptimisticConflict(_)));
    assert_eq!(tx2.state(), TxState::RolledBack);
    assert_eq!(h.manager.committed_versions(&tx1.xid())[0], tx1.xid());
    assert_eq!(h.manager.rolledback_versions(&tx2.xid()), vec![tx2.xid()]);
}

#[test]
fn test_disjoint_sets_both_commit() {
    let h = Harness::new(serializable_config());
    let tx1 = optimistic(&h, TxIsolation::Serializable);
    let tx2 = optimistic(&h, TxIsolation::Serializable);

    write(&h, &tx1, "k1");
    write(&h, &tx2, "k2");
    read(&h, &tx2, "k3");

    h.manager.prepare(&tx1).unwrap();
    h.manager.prepare(&tx2).unwrap();
    h.manager.commit(&tx1).unwrap();
    h.manager.commit(&tx2).unwrap();

    let committed = h.manager.committed_versions(&tx1.xid());
    assert!(committed.contains(&tx1.xid()));
    assert!(committed.contains(&tx2.xid()));
}

#[test]
fn test_concurrent_writes_conflict() {
    let h = Harness::new(serializable_config());
    let tx1 = optimistic(&h, TxIsolation::Serializable);
    let tx2 = optimistic(&h, TxIsolation::Serializable);

    write(&h, &tx1, "k1");
    write(&h, &tx2, "k1");

    h.manager.prepare(&tx1).unwrap();
    let err = h.manager.prepare(&tx2).unwrap_err();
    assert!(matches!(err, TxError::OptimisticConflict(_)));
    assert_eq!(tx2.state(), TxState::RolledBack);

    h.manager.commit(&tx1).unwrap();
    assert_eq!(
        h.cache.mock_entry(&key("k1")).unwrap().value(),
        Some(b"k1".to_vec())
    );
}

#[test]
fn test_read_after_commit_does_not_conflict() {
    let h = Harness::new(serializable_config());
    let tx1 = optimistic(&h, TxIsolation::Serializable);
    write(&h, &tx1, "k1");
    h.manager.commit(&tx1).unwrap();

    // Started after tx1 finished, so it saw tx1's write.
    let tx2 = optimistic(&h, TxIsolation::Serializable);
    read(&h, &tx2, "k1");
    h.manager.commit(&tx2).unwrap();
}

#[test]
fn test_repeatable_read_skips_validation() {
    let h = Harness::new(serializable_config());
    let tx1 = optimistic(&h, TxIsolation::RepeatableRead);
    let tx2 = optimistic(&h, TxIsolation::RepeatableRead);

    write(&h, &tx1, "k1");
    read(&h, &tx2, "k1");
    h.manager.commit(&tx1).unwrap();
    h.manager.commit(&tx2).unwrap();
}

// ========== LOCKING AT PREPARE ==========

#[test]
fn test_lock_conflict_unwinds_acquired_locks() {
    let h = Harness::new(TxManagerConfig::default());
    let holder = h.manager.new_tx(NewTxOptions::default()).unwrap().unwrap();
    h.manager
        .enlist_write(&holder, key("k1"), TxOp::Delete)
        .unwrap();

    let tx = h
        .manager
        .new_tx(NewTxOptions {
            concurrency: TxConcurrency::Optimistic,
            timeout: Duration::from_millis(30),
            ..Default::default()
        })
        .unwrap()
        .unwrap();
    write(&h, &tx, "k0");
    write(&h, &tx, "k1");
    let k0 = h.cache.mock_entry(&key("k0")).unwrap();

    let err = h.manager.commit(&tx).unwrap_err();
    assert!(matches!(err, TxError::OptimisticConflict(_)));
    assert_eq!(tx.state(), TxState::RolledBack);
    assert_eq!(k0.owner(), None);
    assert_eq!(
        h.cache.mock_entry(&key("k1")).unwrap().owner(),
        Some(holder.xid())
    );
    h.manager.commit(&holder).unwrap();
}

#[test]
fn test_rollback_while_locking_releases_late_locks() {
    let h = Harness::new(TxManagerConfig::default());
    let holder = h.manager.new_tx(NewTxOptions::default()).unwrap().unwrap();
    h.manager
        .enlist_write(&holder, key("k1"), TxOp::Update(b"holder".to_vec()))
        .unwrap();

    // No timeout: prepare blocks on k1 until the holder releases it.
    let tx = h
        .manager
        .new_tx(NewTxOptions {
            concurrency: TxConcurrency::Optimistic,
            ..Default::default()
        })
        .unwrap()
        .unwrap();
    write(&h, &tx, "k0");
    write(&h, &tx, "k1");
    let k0 = h.cache.mock_entry(&key("k0")).unwrap();
    let k1 = h.cache.mock_entry(&key("k1")).unwrap();

    let preparing = {
        let manager = h.manager.clone();
        let tx = tx.clone();
        thread::spawn(move || manager.prepare(&tx))
    };

    let deadline = Instant::now() + Duration::from_secs(5);
    while k0.owner() != Some(tx.xid()) {
        assert!(Instant::now() < deadline, "prepare never locked k0");
        thread::sleep(Duration::from_millis(1));
    }

    // Rolled back by a recovery check while still waiting for k1.
    assert!(!h.manager.txs_prepared_or_committed(&tx.near_xid(), 1));
    assert_eq!(tx.state(), TxState::RolledBack);
    assert_eq!(k0.owner(), None);

    h.manager.commit(&holder).unwrap();
    assert!(preparing.join().unwrap().is_err());

    assert_eq!(tx.state(), TxState::RolledBack);
    assert_eq!(k0.owner(), None);
    assert_eq!(k1.owner(), None);
    assert_eq!(k1.value(), Some(b"holder".to_vec()));
}

#[test]
fn test_serializable_read_locks_released() {
    let h = Harness::new(serializable_config());
    let committed = optimistic(&h, TxIsolation::Serializable);
    write(&h, &committed, "k1");
    read(&h, &committed, "k2");
    let k2 = h.cache.mock_entry(&key("k2")).unwrap();
    h.manager.commit(&committed).unwrap();
    assert_eq!(k2.owner(), None);

    let rolled_back = optimistic(&h, TxIsolation::Serializable);
    read(&h, &rolled_back, "k3");
    h.manager.prepare(&rolled_back).unwrap();
    let k3 = h.cache.mock_entry(&key("k3")).unwrap();
    assert_eq!(k3.owner(), Some(rolled_back.xid()));
    h.manager.rollback(&rolled_back).unwrap();

    assert_eq!(k3.owner(), None);
}

// ========== COMMITTED QUEUE GC ==========

#[test]
fn test_committed_queue_collected_once_safe() {
    let h = Harness::new(serializable_config());
    let tx1 = optimistic(&h, TxIsolation::Serializable);
    let tx2 = optimistic(&h, TxIsolation::Serializable);
    assert_eq!(h.manager.memory_stats().start_version_counts_size, 2);

    write(&h, &tx1, "k1");
    h.manager.commit(&tx1).unwrap();

    // tx2 started before tx1 ended and may still conflict with it.
    assert_eq!(h.manager.memory_stats().committed_queue_size, 1);

    h.manager.rollback(&tx2).unwrap();
    assert_eq!(h.manager.memory_stats().start_version_counts_size, 0);

    // A later prepare collects everything that is safe to forget.
    let tx3 = h.manager.new_tx(NewTxOptions::default()).unwrap().unwrap();
    h.manager.prepare(&tx3).unwrap();
    assert_eq!(h.manager.memory_stats().committed_queue_size, 0);
    h.manager.commit(&tx3).unwrap();
}

#[test]
fn test_safe_commit_skips_queue() {
    let h = Harness::new(serializable_config());
    let tx = optimistic(&h, TxIsolation::Serializable);
    write(&h, &tx, "k1");
    h.manager.commit(&tx).unwrap();
    assert_eq!(h.manager.memory_stats().committed_queue_size, 0);
    assert_eq!(h.manager.memory_stats().start_version_counts_size, 0);
}

#[test]
fn test_serializable_disabled_tracks_nothing() {
    let h = Harness::new(TxManagerConfig::default());
    let tx1 = optimistic(&h, TxIsolation::Serializable);
    let tx2 = optimistic(&h, TxIsolation::Serializable);
    assert_eq!(h.manager.memory_stats().start_version_counts_size, 0);

    write(&h, &tx1, "k1");
    read(&h, &tx2, "k1");
    h.manager.commit(&tx1).unwrap();
    h.manager.commit(&tx2).unwrap();
    assert_eq!(h.manager.memory_stats().committed_queue_size, 0);
}

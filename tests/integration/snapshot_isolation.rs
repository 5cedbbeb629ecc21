#![allow(missing_docs)]

mod support;

use std::thread;
use std::time::Duration;

use pagestore::{PageAccess, PageStore, PageUpdate, Result, StoreError, Transaction};
use support::{commit_and_finalize, init_tracing, options};
use tempfile::tempdir;

#[test]
fn older_snapshot_never_sees_newer_commit() -> Result<()> {
    init_tracing();
    let dir = tempdir().expect("tmpdir");
    let store = PageStore::open(options(dir.path()))?;
    let page = store.allocate()?;

    let t1 = Transaction::new(1, 10);
    let t2 = Transaction::new(2, 11).with_commit_version(12);
    store.begin_transaction(&t1, None)?;
    store.begin_transaction(&t2, None)?;
    store.update(Some(&t2), vec![PageUpdate::new(page, 0, 1, vec![7, 7])])?;
    commit_and_finalize(&store, &t2)?;

    store.cache().sweep_now()?;
    assert_eq!(&store.get(Some(&t1), page)?.data()[..2], &[0, 0]);

    let t3 = Transaction::new(3, 12);
    store.begin_transaction(&t3, None)?;
    assert_eq!(&store.get(Some(&t3), page)?.data()[..2], &[7, 7]);
    assert_eq!(&store.get(None, page)?.data()[..2], &[7, 7]);

    store.rollback_transaction(&t1)?;
    store.rollback_transaction(&t3)?;
    Ok(())
}

#[test]
fn transaction_reads_its_own_writes() -> Result<()> {
    init_tracing();
    let dir = tempdir().expect("tmpdir");
    let store = PageStore::open(options(dir.path()))?;
    let page = store.allocate()?;

    let txn = Transaction::new(1, 0);
    store.begin_transaction(&txn, None)?;
    store.update(Some(&txn), vec![PageUpdate::new(page, 40, 1, b"mine".to_vec())])?;
    assert_eq!(&store.get(Some(&txn), page)?.data()[40..44], b"mine");

    let other = Transaction::new(2, 0);
    store.begin_transaction(&other, None)?;
    assert_eq!(&store.get(Some(&other), page)?.data()[40..44], &[0; 4]);
    assert_eq!(&store.get(None, page)?.data()[40..44], &[0; 4]);
    Ok(())
}

#[test]
fn rolled_back_writes_disappear() -> Result<()> {
    init_tracing();
    let dir = tempdir().expect("tmpdir");
    let store = PageStore::open(options(dir.path()))?;
    let page = store.allocate()?;

    let txn = Transaction::new(1, 0).with_commit_version(1);
    store.begin_transaction(&txn, None)?;
    store.update(Some(&txn), vec![PageUpdate::new(page, 0, 1, vec![9])])?;
    store.rollback_transaction(&txn)?;
    assert!(matches!(
        store.get(Some(&txn), page),
        Err(StoreError::TxnNotActive(_))
    ));
    assert!(matches!(
        store.commit_transaction(&txn),
        Err(StoreError::TxnNotActive(_))
    ));
    assert_eq!(store.get(None, page)?.data()[0], 0);
    assert_eq!(store.cache().fileset().read_page(page)?.data()[0], 0);
    Ok(())
}

#[test]
fn pinned_snapshot_survives_background_sweeps() -> Result<()> {
    init_tracing();
    let dir = tempdir().expect("tmpdir");
    let store = PageStore::open(
        options(dir.path())
            .with_sweep_interval_ms(1)
            .with_page_idle_sweeps(1),
    )?;
    let page = store.allocate()?;

    let reader = Transaction::new(100, 0);
    store.begin_transaction(&reader, None)?;
    for version in 1..=20u64 {
        let writer = Transaction::new(version, version - 1).with_commit_version(version);
        store.begin_transaction(&writer, None)?;
        store.update(
            Some(&writer),
            vec![PageUpdate::new(page, 0, 1, version.to_be_bytes().to_vec())],
        )?;
        commit_and_finalize(&store, &writer)?;
    }
    thread::sleep(Duration::from_millis(30));

    assert_eq!(&store.get(Some(&reader), page)?.data()[..8], &[0; 8]);
    assert_eq!(&store.get(None, page)?.data()[..8], &20u64.to_be_bytes());

    store.rollback_transaction(&reader)?;
    store.cache().sweep_now()?;
    store.cache().sweep_now()?;
    let stats = store.stats();
    assert_eq!(stats.transaction_heads, 0);
    assert_eq!(stats.version_heads, 1);
    assert_eq!(&store.get(None, page)?.data()[..8], &20u64.to_be_bytes());
    Ok(())
}

#![allow(missing_docs)]

mod support;

use std::sync::Arc;

use pagestore::{
    FileIo, FileSet, FileSetOptions, MemFileIo, PageAccess, PageId, PageStore, PageUpdate, Result,
    StoreError, StoreOptions, Synchronous, Transaction,
};
use support::{commit_and_finalize, init_tracing, options};
use tempfile::tempdir;

#[test]
fn data_files_change_only_after_finalize() -> Result<()> {
    init_tracing();
    let dir = tempdir().expect("tmpdir");
    let store = PageStore::open(options(dir.path()).with_synchronous(Synchronous::Full))?;
    let page = store.allocate()?;

    let txn = Transaction::new(1, 0).with_commit_version(1);
    store.begin_transaction(&txn, None)?;
    store.update(Some(&txn), vec![PageUpdate::new(page, 8, 1, b"durable".to_vec())])?;
    store.commit_transaction(&txn)?.wait()?;

    let fileset = store.cache().fileset();
    assert_eq!(&fileset.read_page(page)?.data()[8..15], &[0; 7]);
    assert_eq!(&store.get(None, page)?.data()[8..15], b"durable");
    assert!(fileset.has_pending(txn.id));

    store.finalize_transaction(&txn).wait()?;
    assert_eq!(&fileset.read_page(page)?.data()[8..15], b"durable");
    assert!(!fileset.has_pending(txn.id));
    assert!(fileset.get_incomplete_transactions()?.is_empty());
    Ok(())
}

#[test]
fn updates_apply_in_sequence_order() -> Result<()> {
    init_tracing();
    let dir = tempdir().expect("tmpdir");
    let store = PageStore::open(options(dir.path()))?;
    let page = store.allocate()?;

    let txn = Transaction::new(1, 0).with_commit_version(1);
    store.begin_transaction(&txn, None)?;
    store.update(
        Some(&txn),
        vec![
            PageUpdate::new(page, 11, 2, vec![2; 5]),
            PageUpdate::new(page, 10, 1, vec![1; 5]),
            PageUpdate::new(page, 12, 3, vec![3; 5]),
        ],
    )?;
    let expected: [u8; 7] = [1, 2, 3, 3, 3, 3, 3];
    assert_eq!(&store.get(Some(&txn), page)?.data()[10..17], &expected);

    commit_and_finalize(&store, &txn)?;
    assert_eq!(&store.get(None, page)?.data()[10..17], &expected);
    assert_eq!(
        &store.cache().fileset().read_page(page)?.data()[10..17],
        &expected
    );
    Ok(())
}

#[test]
fn finalize_requires_a_commit() -> Result<()> {
    init_tracing();
    let dir = tempdir().expect("tmpdir");
    let store = PageStore::open(options(dir.path()))?;
    let page = store.allocate()?;

    let txn = Transaction::new(1, 0).with_commit_version(1);
    store.begin_transaction(&txn, None)?;
    store.update(Some(&txn), vec![PageUpdate::new(page, 0, 1, vec![1])])?;
    assert!(matches!(
        store.finalize_transaction(&txn).wait(),
        Err(StoreError::Invalid(_))
    ));
    Ok(())
}

#[test]
fn parent_with_active_child_cannot_commit() -> Result<()> {
    init_tracing();
    let dir = tempdir().expect("tmpdir");
    let store = PageStore::open(options(dir.path()))?;
    let page = store.allocate()?;

    let parent = Transaction::new(1, 0).with_commit_version(1);
    let child = Transaction::new(2, 0);
    let grandchild = Transaction::new(3, 0);
    store.begin_transaction(&parent, None)?;
    store.begin_transaction(&child, Some(parent.id))?;
    store.begin_transaction(&grandchild, Some(child.id))?;
    store.update(Some(&grandchild), vec![PageUpdate::new(page, 3, 1, vec![3])])?;

    assert!(matches!(
        store.commit_transaction(&parent),
        Err(StoreError::Invalid(_))
    ));
    store.commit_transaction(&grandchild)?.wait()?;
    store.commit_transaction(&child)?.wait()?;
    assert_eq!(store.get(Some(&parent), page)?.data()[3], 3);
    commit_and_finalize(&store, &parent)?;
    assert_eq!(store.get(None, page)?.data()[3], 3);

    assert!(matches!(
        store.begin_transaction(&Transaction::new(4, 1), Some(parent.id)),
        Err(StoreError::TxnNotActive(_))
    ));
    Ok(())
}

#[test]
fn commit_older_than_current_version_is_refused() -> Result<()> {
    init_tracing();
    let dir = tempdir().expect("tmpdir");
    let store = PageStore::open(options(dir.path()))?;
    let page = store.allocate()?;

    let later = Transaction::new(1, 0).with_commit_version(2);
    let earlier = Transaction::new(2, 0).with_commit_version(1);
    store.begin_transaction(&later, None)?;
    store.begin_transaction(&earlier, None)?;
    store.update(Some(&later), vec![PageUpdate::new(page, 0, 1, vec![2])])?;
    store.update(Some(&earlier), vec![PageUpdate::new(page, 1, 1, vec![1])])?;
    commit_and_finalize(&store, &later)?;

    assert!(matches!(
        store.commit_transaction(&earlier),
        Err(StoreError::Invalid(_))
    ));
    assert!(matches!(
        store.get(Some(&earlier), page),
        Err(StoreError::TxnNotActive(_))
    ));

    let reader = Transaction::new(3, 1);
    store.begin_transaction(&reader, None)?;
    assert_eq!(&store.get(Some(&reader), page)?.data()[..2], &[0, 0]);
    assert_eq!(&store.get(None, page)?.data()[..2], &[2, 0]);
    assert_eq!(&store.cache().fileset().read_page(page)?.data()[..2], &[2, 0]);
    assert_eq!(store.cache().fileset().log_stats()[0].entries_appended, 1);
    store.rollback_transaction(&reader)?;
    Ok(())
}

#[test]
fn log_failure_surfaces_through_tickets() -> Result<()> {
    init_tracing();
    let log = MemFileIo::new();
    let options = StoreOptions::default()
        .with_page_size(128)
        .with_synchronous(Synchronous::Off)
        .with_worker_threads(1)
        .with_sweep_interval_ms(0);
    let fileset = FileSet::open(
        vec![Arc::new(MemFileIo::new()) as Arc<dyn FileIo>],
        vec![Arc::new(log.clone()) as Arc<dyn FileIo>],
        FileSetOptions::from(&options),
    )?;
    let store = PageStore::with_fileset(fileset, &options)?;
    let page = store.allocate()?;

    let txn = Transaction::new(1, 0).with_commit_version(1);
    store.begin_transaction(&txn, None)?;
    store.update(Some(&txn), vec![PageUpdate::new(page, 0, 1, vec![1])])?;
    log.fail_writes(true);
    let logged = store.commit_transaction(&txn)?;
    assert!(matches!(logged.wait(), Err(StoreError::Io(_))));
    assert!(matches!(
        store.finalize_transaction(&txn).wait(),
        Err(StoreError::Io(_))
    ));
    assert!(!store.cache().fileset().has_pending(txn.id));
    assert_eq!(store.cache().fileset().read_page(page)?.data()[0], 0);
    Ok(())
}

#[test]
fn commits_rotate_across_log_files() -> Result<()> {
    init_tracing();
    let dir = tempdir().expect("tmpdir");
    let store = PageStore::open(
        StoreOptions::striped(dir.path(), 3, 2)
            .with_page_size(128)
            .with_synchronous(Synchronous::Off)
            .with_sweep_interval_ms(0),
    )?;
    let first = store.allocate_run(4)?;

    for n in 0..4u64 {
        let txn = Transaction::new(n + 1, n).with_commit_version(n + 1);
        store.begin_transaction(&txn, None)?;
        store.update(
            Some(&txn),
            vec![PageUpdate::new(PageId(first.0 + n), 0, 1, vec![n as u8 + 1])],
        )?;
        commit_and_finalize(&store, &txn)?;
    }

    let fileset = store.cache().fileset();
    let appended: Vec<u64> = fileset
        .log_stats()
        .iter()
        .map(|stats| stats.entries_appended)
        .collect();
    assert_eq!(appended, vec![2, 2]);
    for n in 0..4u64 {
        let page = PageId(first.0 + n);
        assert_eq!(fileset.read_page(page)?.data()[0], n as u8 + 1);
    }
    assert!(fileset.checkpoint_logs()?);
    assert!(fileset.get_incomplete_transactions()?.is_empty());
    Ok(())
}

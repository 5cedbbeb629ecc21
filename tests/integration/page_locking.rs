#![allow(missing_docs)]

mod support;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use pagestore::{PageAccess, PageId, PageStore, PageUpdate, Result, StoreError, Transaction};
use support::{commit_and_finalize, init_tracing, options};
use tempfile::tempdir;

const WORKERS: u64 = 8;

fn read_counter(store: &PageStore, txn: Option<&Transaction>, page: PageId) -> Result<u64> {
    let page = store.get(txn, page)?;
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&page.data()[..8]);
    Ok(u64::from_be_bytes(raw))
}

#[test]
fn reentrant_lock_must_be_fully_released() -> Result<()> {
    init_tracing();
    let dir = tempdir().expect("tmpdir");
    let store = Arc::new(PageStore::open(options(dir.path()))?);
    let page = store.allocate()?;

    let holder = Transaction::new(1, 0);
    store.begin_transaction(&holder, None)?;
    assert!(store.lock(&holder, page)?);
    assert!(!store.lock(&holder, page)?);

    let contender = Transaction::new(2, 0);
    store.begin_transaction(&contender, None)?;
    let waiter = {
        let store = Arc::clone(&store);
        thread::spawn(move || store.lock(&contender, page))
    };

    thread::sleep(Duration::from_millis(30));
    store.unlock(&holder, page)?;
    thread::sleep(Duration::from_millis(30));
    assert!(!waiter.is_finished());

    store.unlock(&holder, page)?;
    assert!(waiter.join().expect("waiter panicked")?);
    Ok(())
}

#[test]
fn commit_releases_every_lock_level() -> Result<()> {
    init_tracing();
    let dir = tempdir().expect("tmpdir");
    let store = Arc::new(PageStore::open(options(dir.path()))?);
    let page = store.allocate()?;

    let holder = Transaction::new(1, 0).with_commit_version(1);
    store.begin_transaction(&holder, None)?;
    store.lock(&holder, page)?;
    store.lock(&holder, page)?;
    store.update(Some(&holder), vec![PageUpdate::new(page, 0, 1, vec![1])])?;

    let contender = Transaction::new(2, 0);
    store.begin_transaction(&contender, None)?;
    let waiter = {
        let store = Arc::clone(&store);
        thread::spawn(move || -> Result<u8> {
            store.lock(&contender, page)?;
            Ok(store.get(Some(&contender), page)?.data()[0])
        })
    };
    thread::sleep(Duration::from_millis(30));
    assert!(!waiter.is_finished());

    commit_and_finalize(&*store, &holder)?;
    assert_eq!(waiter.join().expect("waiter panicked")?, 1);
    Ok(())
}

#[test]
fn concurrent_increments_serialize_under_the_lock() -> Result<()> {
    init_tracing();
    let dir = tempdir().expect("tmpdir");
    let store = Arc::new(PageStore::open(options(dir.path()))?);
    let page = store.allocate()?;
    let next_version = Arc::new(AtomicU64::new(1));
    let start = Arc::new(Barrier::new(WORKERS as usize));

    let handles: Vec<_> = (0..WORKERS)
        .map(|worker| {
            let store = Arc::clone(&store);
            let next_version = Arc::clone(&next_version);
            let start = Arc::clone(&start);
            thread::spawn(move || -> Result<()> {
                let begin = store.cache().current_version().0;
                let mut txn = Transaction::new(worker + 1, begin);
                store.begin_transaction(&txn, None)?;
                start.wait();
                store.lock(&txn, page)?;
                let value = read_counter(&store, Some(&txn), page)?;
                store.update(
                    Some(&txn),
                    vec![PageUpdate::new(page, 0, 1, (value + 1).to_be_bytes().to_vec())],
                )?;
                txn = txn.with_commit_version(next_version.fetch_add(1, Ordering::SeqCst));
                let logged = store.commit_transaction(&txn)?;
                logged.wait()?;
                store.finalize_transaction(&txn).wait()
            })
        })
        .collect();
    for handle in handles {
        handle.join().expect("worker panicked")?;
    }

    assert_eq!(read_counter(&store, None, page)?, WORKERS);
    assert_eq!(store.stats().commits, WORKERS);
    Ok(())
}

#[test]
fn child_extends_parent_updates_under_inherited_lock() -> Result<()> {
    init_tracing();
    let dir = tempdir().expect("tmpdir");
    let store = PageStore::open(options(dir.path()))?;
    let page = store.allocate()?;

    let parent = Transaction::new(1, 0).with_commit_version(1);
    let child = Transaction::new(2, 0);
    store.begin_transaction(&parent, None)?;
    assert!(store.lock(&parent, page)?);
    store.update(Some(&parent), vec![PageUpdate::new(page, 0, 1, vec![1])])?;

    store.begin_transaction(&child, Some(parent.id))?;
    assert!(!store.lock(&child, page)?);
    assert_eq!(store.get(Some(&child), page)?.data()[0], 1);
    store.update(Some(&child), vec![PageUpdate::new(page, 1, 1, vec![2])])?;
    store.unlock(&child, page)?;
    assert_eq!(&store.get(Some(&parent), page)?.data()[..2], &[1, 0]);

    let merged = store.commit_transaction(&child)?;
    assert!(merged.is_done());
    merged.wait()?;
    assert_eq!(&store.get(Some(&parent), page)?.data()[..2], &[1, 2]);

    commit_and_finalize(&store, &parent)?;
    assert_eq!(&store.get(None, page)?.data()[..2], &[1, 2]);
    assert_eq!(
        &store.cache().fileset().read_page(page)?.data()[..2],
        &[1, 2]
    );
    Ok(())
}

#[test]
fn lock_misuse_is_reported() -> Result<()> {
    init_tracing();
    let dir = tempdir().expect("tmpdir");
    let store = PageStore::open(options(dir.path()))?;
    let page = store.allocate()?;

    let never_begun = Transaction::new(9, 0);
    assert!(matches!(
        store.lock(&never_begun, page),
        Err(StoreError::TxnNotActive(_))
    ));

    let txn = Transaction::new(1, 0);
    store.begin_transaction(&txn, None)?;
    assert!(matches!(
        store.unlock(&txn, page),
        Err(StoreError::Invalid(_))
    ));
    Ok(())
}

#![allow(missing_docs)]

mod support;

use std::fs;
use std::path::Path;
use std::sync::Arc;

use pagestore::primitives::wal::{LogFile, LogStatus, LOG_HEADER_LEN, STATUS_AT};
use pagestore::{
    FileIo, FileSet, FileSetOptions, MemFileIo, PageAccess, PageId, PageStore, PageUpdate, Result,
    StdFileIo, StoreError, StoreOptions, Synchronous, Transaction, Version,
};
use support::{commit_and_finalize, init_tracing, options};
use tempfile::tempdir;

struct Outcome {
    pages: [PageId; 2],
    bytes: [Vec<u8>; 2],
}

/// Runs three overlapping commits, finalizing them only when asked.
fn three_commits(dir: &Path, finalize: bool) -> Result<Outcome> {
    let store = PageStore::open(options(dir))?;
    let pages = [store.allocate()?, store.allocate()?];
    let batches = [
        vec![
            PageUpdate::new(pages[0], 0, 1, vec![1; 4]),
            PageUpdate::new(pages[1], 4, 2, vec![1; 2]),
        ],
        vec![PageUpdate::new(pages[0], 2, 1, vec![2; 4])],
        vec![PageUpdate::new(pages[1], 0, 1, vec![3; 6])],
    ];
    for (n, updates) in batches.into_iter().enumerate() {
        let version = n as u64 + 1;
        let txn = Transaction::new(version, version - 1).with_commit_version(version);
        store.begin_transaction(&txn, None)?;
        store.update(Some(&txn), updates)?;
        store.commit_transaction(&txn)?.wait()?;
        if finalize {
            store.finalize_transaction(&txn).wait()?;
        }
    }
    let bytes = [
        store.get(None, pages[0])?.data().to_vec(),
        store.get(None, pages[1])?.data().to_vec(),
    ];
    Ok(Outcome { pages, bytes })
}

fn reopen_fileset(dir: &Path) -> Result<Arc<FileSet>> {
    let options = options(dir);
    let open = |path: &Path| -> Result<Arc<dyn FileIo>> { Ok(Arc::new(StdFileIo::open(path)?)) };
    FileSet::open(
        vec![open(&options.data_files[0])?],
        vec![open(&options.log_files[0])?],
        FileSetOptions::from(&options),
    )
}

#[test]
fn logged_commits_roll_forward_like_a_normal_finalize() -> Result<()> {
    init_tracing();
    let crashed = tempdir().expect("tmpdir");
    let finalized = tempdir().expect("tmpdir");
    let expected = three_commits(crashed.path(), false)?;
    three_commits(finalized.path(), true)?;

    let fileset = reopen_fileset(crashed.path())?;
    let incomplete = fileset.get_incomplete_transactions()?;
    assert!(incomplete.roll_back.is_empty());
    let versions: Vec<Version> = incomplete.roll_forward.iter().map(|e| e.version).collect();
    assert_eq!(versions, vec![Version(1), Version(2), Version(3)]);
    for page in expected.pages {
        assert!(fileset.read_page(page)?.data().iter().all(|&b| b == 0));
    }

    fileset.roll_forward(&incomplete.roll_forward)?;
    let reference = reopen_fileset(finalized.path())?;
    for (page, bytes) in expected.pages.iter().zip(&expected.bytes) {
        let recovered = fileset.read_page(*page)?;
        assert_eq!(recovered.data(), reference.read_page(*page)?.data());
        assert_eq!(recovered.data(), bytes.as_slice());
    }
    assert!(fileset.get_incomplete_transactions()?.is_empty());
    Ok(())
}

#[test]
fn store_open_recovers_and_resumes_versions() -> Result<()> {
    init_tracing();
    let dir = tempdir().expect("tmpdir");
    let expected = three_commits(dir.path(), false)?;

    let store = PageStore::open(options(dir.path()))?;
    let report = store.recovery_report();
    assert_eq!(report.rolled_forward, 3);
    assert_eq!(report.rolled_back, 0);
    assert_eq!(report.max_version, Version(3));
    assert_eq!(store.cache().current_version(), Version(3));
    for (page, bytes) in expected.pages.iter().zip(&expected.bytes) {
        assert_eq!(store.get(None, *page)?.data(), bytes.as_slice());
    }

    let txn = Transaction::new(10, 3).with_commit_version(4);
    store.begin_transaction(&txn, None)?;
    store.update(Some(&txn), vec![PageUpdate::new(expected.pages[0], 0, 1, vec![4])])?;
    store.commit_transaction(&txn)?.wait()?;
    store.finalize_transaction(&txn).wait()?;
    drop(store);

    let store = PageStore::open(options(dir.path()))?;
    assert_eq!(store.recovery_report().rolled_forward, 0);
    assert_eq!(store.get(None, expected.pages[0])?.data()[0], 4);
    Ok(())
}

#[test]
fn interrupted_log_write_is_rolled_back() -> Result<()> {
    init_tracing();
    let dir = tempdir().expect("tmpdir");
    let options = options(dir.path());
    let page = {
        let store = PageStore::open(options.clone())?;
        store.allocate()?
    };
    {
        let io: Arc<dyn FileIo> = Arc::new(StdFileIo::open(&options.log_files[0])?);
        let log = LogFile::open(Arc::clone(&io))?;
        let offset = log.commit_start(
            Version(5),
            &[PageUpdate::new(page, 0, 1, vec![9; 8])],
            false,
        )?;
        let status_at = LOG_HEADER_LEN + offset + STATUS_AT as u64;
        io.write_at(status_at, &[LogStatus::LogStarted as u8])?;
    }

    let store = PageStore::open(options.clone())?;
    let report = store.recovery_report();
    assert_eq!(report.rolled_back, 1);
    assert_eq!(report.rolled_forward, 0);
    assert_eq!(store.cache().current_version(), Version(5));
    assert!(store.get(None, page)?.data().iter().all(|&b| b == 0));
    drop(store);

    let store = PageStore::open(options)?;
    assert_eq!(store.recovery_report().rolled_back, 0);
    Ok(())
}

#[test]
fn failed_log_write_never_replays_after_restart() -> Result<()> {
    init_tracing();
    let data = MemFileIo::new();
    let log = MemFileIo::new();
    let options = StoreOptions::default()
        .with_page_size(128)
        .with_synchronous(Synchronous::Off)
        .with_worker_threads(1)
        .with_sweep_interval_ms(0);
    let open = |options: &StoreOptions| -> Result<PageStore> {
        let fileset = FileSet::open(
            vec![Arc::new(data.clone()) as Arc<dyn FileIo>],
            vec![Arc::new(log.clone()) as Arc<dyn FileIo>],
            FileSetOptions::from(options),
        )?;
        PageStore::with_fileset(fileset, options)
    };

    let page = {
        let store = open(&options)?;
        let page = store.allocate()?;

        let failed = Transaction::new(1, 0).with_commit_version(1);
        store.begin_transaction(&failed, None)?;
        store.update(Some(&failed), vec![PageUpdate::new(page, 0, 1, vec![9; 64])])?;
        log.fail_writes_after(1);
        assert!(matches!(
            store.commit_transaction(&failed)?.wait(),
            Err(StoreError::Io(_))
        ));
        assert!(store.finalize_transaction(&failed).wait().is_err());
        log.fail_writes(false);

        let next = Transaction::new(2, 1).with_commit_version(2);
        store.begin_transaction(&next, None)?;
        store.update(Some(&next), vec![PageUpdate::new(page, 100, 1, vec![4])])?;
        commit_and_finalize(&store, &next)?;
        page
    };

    let store = open(&options)?;
    let report = store.recovery_report();
    assert_eq!(report.rolled_forward, 0);
    assert_eq!(report.rolled_back, 0);
    assert_eq!(report.max_version, Version(2));
    let bytes = store.get(None, page)?;
    assert!(bytes.data()[..64].iter().all(|&b| b == 0));
    assert_eq!(bytes.data()[100], 4);
    assert!(store.cache().fileset().get_incomplete_transactions()?.is_empty());
    Ok(())
}

#[test]
fn newer_log_format_refuses_to_open() -> Result<()> {
    init_tracing();
    let dir = tempdir().expect("tmpdir");
    let options: StoreOptions = options(dir.path());
    fs::write(&options.log_files[0], 99u32.to_be_bytes())?;
    match PageStore::open(options.clone()) {
        Err(StoreError::Incompatible { found, .. }) => assert_eq!(found, 99),
        Err(other) => panic!("unexpected error: {other}"),
        Ok(_) => panic!("newer log format must not open"),
    }
    assert_eq!(fs::read(&options.log_files[0])?, 99u32.to_be_bytes());
    Ok(())
}

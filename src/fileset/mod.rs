#![forbid(unsafe_code)]

//! Striped data files, the commit logs, and the commit → log → apply pipeline.
//!
//! Page `p` lives in data file `p % N` at local page `p / N`. Transactional
//! updates are buffered per transaction, logged by [`FileSet::commit_transaction`]
//! and applied to the data files by [`FileSet::finalize_transaction`].

mod data_file;
mod recovery;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::{debug, info};

pub use data_file::{DataFileHeader, DATA_FORMAT_VERSION, DATA_HEADER_LEN};
pub use recovery::{IncompleteEntry, IncompleteTransactions, RecoveryReport};

use crate::options::{StoreOptions, Synchronous, MIN_PAGE_SIZE};
use crate::primitives::dispatch::{TaskPool, Ticket};
use crate::primitives::io::FileIo;
use crate::primitives::page::{page_runs, sort_updates, Page, PagePool, PageUpdate};
use crate::primitives::wal::{LogFile, LogStats, LogStatus};
use crate::types::{PageId, Result, StoreError, Transaction, TxnId, Version};
use data_file::DataFile;

/// Settings shared by every file of a [`FileSet`].
#[derive(Clone, Copy, Debug)]
pub struct FileSetOptions {
    /// Page size of every data file.
    pub page_size: usize,
    /// Durability mode.
    pub synchronous: Synchronous,
    /// Threads running commit and finalize work.
    pub worker_threads: usize,
    /// Idle page buffers kept by the page pool. The pool is shared by every
    /// set with the same page size and keeps the largest request.
    pub pool_retain_pages: usize,
}

impl FileSetOptions {
    /// Creates options with the given page size and default everything else.
    pub fn new(page_size: usize) -> Self {
        Self {
            page_size,
            ..Self::from(&StoreOptions::default())
        }
    }
}

impl From<&StoreOptions> for FileSetOptions {
    fn from(options: &StoreOptions) -> Self {
        Self {
            page_size: options.page_size,
            synchronous: options.synchronous,
            worker_threads: options.worker_threads,
            pool_retain_pages: options.pool_retain_pages,
        }
    }
}

enum LogProgress {
    NotCommitted,
    Committing,
    Logged { log: usize, offset: u64 },
    Failed(StoreError),
}

struct PendingState {
    version: Version,
    updates: Vec<PageUpdate>,
    pages: FxHashSet<PageId>,
    progress: LogProgress,
}

struct PendingTxn {
    state: Mutex<PendingState>,
    logged: Condvar,
}

/// N data files and M log files sharing one page size.
///
/// Lock order: the pending map before any single pending record.
pub struct FileSet {
    page_size: usize,
    synchronous: Synchronous,
    data: Vec<DataFile>,
    logs: Vec<LogFile>,
    next_log: AtomicUsize,
    pending: Mutex<FxHashMap<TxnId, Arc<PendingTxn>>>,
    apply_lock: Mutex<()>,
    pool: Arc<PagePool>,
    tasks: TaskPool,
}

impl FileSet {
    /// Opens the set, initializing empty files.
    ///
    /// Either every data file is empty or every one carries a header from the
    /// same set; a mix is a configuration error.
    pub fn open(
        data: Vec<Arc<dyn FileIo>>,
        logs: Vec<Arc<dyn FileIo>>,
        options: FileSetOptions,
    ) -> Result<Arc<Self>> {
        if data.is_empty() {
            return Err(StoreError::Config("at least one data file is required"));
        }
        if logs.is_empty() {
            return Err(StoreError::Config("at least one log file is required"));
        }
        if options.page_size < MIN_PAGE_SIZE {
            return Err(StoreError::ConfigOwned(format!(
                "page size {} is below the minimum of {MIN_PAGE_SIZE}",
                options.page_size
            )));
        }
        let page_size = u32::try_from(options.page_size)
            .map_err(|_| StoreError::Config("page size does not fit in 32 bits"))?;
        let file_count = u32::try_from(data.len())
            .map_err(|_| StoreError::Config("too many data files"))?;

        let mut existing = Vec::with_capacity(data.len());
        for io in &data {
            existing.push(data_file::read_header(io.as_ref())?);
        }
        let initialized = existing.iter().filter(|h| h.is_some()).count();
        if initialized != 0 && initialized != existing.len() {
            return Err(StoreError::Config(
                "data file set mixes initialized and empty files",
            ));
        }
        let set_salt = match existing.iter().flatten().next() {
            Some(header) => header.set_salt,
            None => rand::random::<u64>(),
        };

        let logs = logs
            .into_iter()
            .map(LogFile::open)
            .collect::<Result<Vec<_>>>()?;

        let sync = options.synchronous.syncs();
        let mut files = Vec::with_capacity(data.len());
        for (index, io) in data.into_iter().enumerate() {
            let expected = DataFileHeader {
                page_size,
                set_salt,
                file_index: index as u32,
                file_count,
            };
            files.push(DataFile::open(io, expected, sync)?);
        }

        let pool = PagePool::shared(options.page_size);
        pool.retain_at_least(options.pool_retain_pages);
        let tasks = TaskPool::new("fileset", options.worker_threads)?;
        info!(
            data_files = files.len(),
            log_files = logs.len(),
            page_size = options.page_size,
            fresh = initialized == 0,
            "fileset.open"
        );
        Ok(Arc::new(Self {
            page_size: options.page_size,
            synchronous: options.synchronous,
            data: files,
            logs,
            next_log: AtomicUsize::new(0),
            pending: Mutex::new(FxHashMap::default()),
            apply_lock: Mutex::new(()),
            pool,
            tasks,
        }))
    }

    /// Page size of every data file.
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Pool page buffers are drawn from.
    pub fn pool(&self) -> &Arc<PagePool> {
        &self.pool
    }

    /// Number of data files.
    pub fn data_file_count(&self) -> usize {
        self.data.len()
    }

    /// Number of log files.
    pub fn log_file_count(&self) -> usize {
        self.logs.len()
    }

    /// Counters of every log file, in configuration order.
    pub fn log_stats(&self) -> Vec<LogStats> {
        self.logs.iter().map(LogFile::stats).collect()
    }

    /// Maps a page to `(data file, page within that file)`.
    pub fn locate(&self, page: PageId) -> (usize, u64) {
        let count = self.data.len() as u64;
        ((page.0 % count) as usize, page.0 / count)
    }

    /// Reads the page as currently stored in the data files.
    pub fn read_page(&self, page: PageId) -> Result<Page> {
        let (file, local) = self.locate(page);
        let mut buf = self.pool.get(page, false);
        self.data[file].read_page(local, buf.data_mut())?;
        Ok(buf)
    }

    /// Applies `updates` to the data files now (`txn` = `None`) or buffers
    /// them for a later commit of `txn`.
    pub fn write(&self, txn: Option<&Transaction>, updates: Vec<PageUpdate>) -> Result<()> {
        for update in &updates {
            update.check_bounds(self.page_size)?;
        }
        let Some(txn) = txn else {
            debug!(updates = updates.len(), "fileset.write.direct");
            return self.apply_updates(updates);
        };
        let mut pending = self.pending.lock();
        let record = pending.entry(txn.id).or_insert_with(|| {
            Arc::new(PendingTxn {
                state: Mutex::new(PendingState {
                    version: txn.commit_version,
                    updates: Vec::new(),
                    pages: FxHashSet::default(),
                    progress: LogProgress::NotCommitted,
                }),
                logged: Condvar::new(),
            })
        });
        let mut state = record.state.lock();
        if !matches!(state.progress, LogProgress::NotCommitted) {
            return Err(StoreError::Invalid("transaction already committed to the log"));
        }
        state.pages.extend(updates.iter().map(|update| update.page_id));
        state.updates.extend(updates);
        Ok(())
    }

    /// Buffers `updates` for `txn` and starts its log write.
    pub fn write_and_commit(
        self: &Arc<Self>,
        txn: &Transaction,
        updates: Vec<PageUpdate>,
    ) -> Result<Ticket> {
        self.write(Some(txn), updates)?;
        Ok(self.commit_transaction(txn))
    }

    /// Appends the buffered updates of `txn` to the next log file in rotation.
    ///
    /// The ticket completes once the entry is durable.
    pub fn commit_transaction(self: &Arc<Self>, txn: &Transaction) -> Ticket {
        let Some(record) = self.pending_record(txn.id) else {
            return Ticket::completed(Err(StoreError::TxnNotActive(txn.id)));
        };
        {
            let mut state = record.state.lock();
            if !matches!(state.progress, LogProgress::NotCommitted) {
                return Ticket::completed(Err(StoreError::Invalid(
                    "transaction already committed to the log",
                )));
            }
            state.version = txn.commit_version;
            state.progress = LogProgress::Committing;
        }
        let this = Arc::clone(self);
        let id = txn.id;
        self.tasks.submit(move || this.log_pending(id, &record))
    }

    /// Applies the logged updates of `txn` to the data files and marks its
    /// entry complete.
    ///
    /// Waits for the commit's log write when it is still running.
    pub fn finalize_transaction(self: &Arc<Self>, txn: &Transaction) -> Ticket {
        let Some(record) = self.pending_record(txn.id) else {
            return Ticket::completed(Err(StoreError::TxnNotActive(txn.id)));
        };
        if matches!(record.state.lock().progress, LogProgress::NotCommitted) {
            return Ticket::completed(Err(StoreError::Invalid(
                "transaction was never committed",
            )));
        }
        let this = Arc::clone(self);
        let id = txn.id;
        self.tasks.submit(move || this.apply_pending(id, &record))
    }

    /// Drops everything buffered for `txn`. No file I/O.
    pub fn rollback_transaction(&self, txn: TxnId) -> bool {
        let removed = self.pending.lock().remove(&txn).is_some();
        if removed {
            debug!(txn = txn.0, "fileset.rollback");
        }
        removed
    }

    /// Returns true while `txn` has buffered or unapplied updates.
    pub fn has_pending(&self, txn: TxnId) -> bool {
        self.pending.lock().contains_key(&txn)
    }

    /// Number of transactions with buffered or unapplied updates.
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Returns true when an unapplied transaction touches `page`.
    pub fn has_pending_page(&self, page: PageId) -> bool {
        let pending = self.pending.lock();
        pending
            .values()
            .any(|record| record.state.lock().pages.contains(&page))
    }

    fn pending_record(&self, txn: TxnId) -> Option<Arc<PendingTxn>> {
        self.pending.lock().get(&txn).cloned()
    }

    fn log_pending(&self, txn: TxnId, record: &PendingTxn) -> Result<()> {
        let (version, mut updates) = {
            let state = record.state.lock();
            (state.version, state.updates.clone())
        };
        sort_updates(&mut updates);
        let index = self.next_log.fetch_add(1, Ordering::Relaxed) % self.logs.len();
        let log = &self.logs[index];
        let sync = self.synchronous.syncs();
        let outcome = log.commit_start(version, &updates, sync).and_then(|offset| {
            if self.logs.len() > 1 {
                log.set_status(offset, LogStatus::LoggedAll, sync)?;
            }
            Ok(offset)
        });
        let mut state = record.state.lock();
        let result = match outcome {
            Ok(offset) => {
                state.progress = LogProgress::Logged { log: index, offset };
                debug!(
                    txn = txn.0,
                    version = version.0,
                    log = index,
                    offset,
                    "fileset.commit.logged"
                );
                Ok(())
            }
            Err(err) => {
                state.progress = LogProgress::Failed(err.duplicate());
                Err(err)
            }
        };
        record.logged.notify_all();
        result
    }

    fn apply_pending(&self, txn: TxnId, record: &PendingTxn) -> Result<()> {
        let (log, offset, version, updates) = {
            let mut state = record.state.lock();
            while matches!(state.progress, LogProgress::Committing) {
                record.logged.wait(&mut state);
            }
            let (log, offset) = match &state.progress {
                LogProgress::Logged { log, offset } => (*log, *offset),
                LogProgress::Failed(err) => {
                    let err = err.duplicate();
                    drop(state);
                    self.pending.lock().remove(&txn);
                    return Err(err);
                }
                LogProgress::NotCommitted => {
                    return Err(StoreError::Invalid("transaction was never committed"))
                }
                LogProgress::Committing => {
                    return Err(StoreError::Corruption("log write still in progress"))
                }
            };
            (log, offset, state.version, std::mem::take(&mut state.updates))
        };
        let count = updates.len();
        self.apply_updates(updates)?;
        self.logs[log].set_status(offset, LogStatus::CompleteThis, self.synchronous.syncs())?;
        self.pending.lock().remove(&txn);
        debug!(
            txn = txn.0,
            version = version.0,
            updates = count,
            "fileset.finalize.complete"
        );
        Ok(())
    }

    /// Read-modify-writes every touched page in `(page, sequence)` order.
    fn apply_updates(&self, mut updates: Vec<PageUpdate>) -> Result<()> {
        if updates.is_empty() {
            return Ok(());
        }
        sort_updates(&mut updates);
        let _guard = self.apply_lock.lock();
        let mut touched = vec![false; self.data.len()];
        for run in page_runs(&updates) {
            let page_id = run[0].page_id;
            let (file, local) = self.locate(page_id);
            let mut page = self.pool.get(page_id, false);
            self.data[file].read_page(local, page.data_mut())?;
            for update in run {
                page.apply(update)?;
            }
            self.data[file].write_page(local, page.data())?;
            touched[file] = true;
        }
        if self.synchronous.syncs() {
            for (file, _) in touched.iter().enumerate().filter(|(_, t)| **t) {
                self.data[file].sync()?;
            }
        }
        Ok(())
    }
}

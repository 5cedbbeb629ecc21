#![forbid(unsafe_code)]

//! Transactional page cache.
//!
//! Reads resolve through a transaction's private copies first and then the
//! page's version chain at the transaction's begin version. Commits publish
//! new page versions under the commit version and hand the raw updates to the
//! [`FileSet`] for logging; finalize applies them to the data files.

/// Per-page version chains and page locks.
pub mod page_head;
pub mod sweeper;
/// Per-transaction private pages and queued updates.
pub mod transaction_head;
/// Per-version snapshot sets and reader counts.
pub mod version_head;

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::fileset::FileSet;
use crate::primitives::dispatch::Ticket;
use crate::primitives::page::{page_runs, sort_updates, Page, PageUpdate};
use crate::types::{PageId, Result, StoreError, Transaction, TxnId, Version};
use page_head::{PageHead, PageHeadCollection, PageVersion};
use sweeper::{SweepPass, Sweeper};
use transaction_head::{TransactionHeadCollection, TxnState};
use version_head::VersionHeadCollection;

/// Tuning knobs for a [`PageCache`].
#[derive(Clone, Copy, Debug)]
pub struct CacheOptions {
    /// Background sweep period; `None` disables the sweeper threads.
    pub sweep_interval: Option<Duration>,
    /// Sweeps a page head must sit idle before it is evicted.
    pub page_idle_sweeps: u64,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            sweep_interval: Some(Duration::from_millis(20)),
            page_idle_sweeps: 64,
        }
    }
}

/// Point-in-time counters for a [`PageCache`].
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct PageCacheStats {
    /// Cached page heads.
    pub page_heads: usize,
    /// Snapshots across every page head.
    pub page_versions: usize,
    /// Live version heads.
    pub version_heads: usize,
    /// Transaction heads still in the table, finished ones included.
    pub transaction_heads: usize,
    /// Newest committed version.
    pub current_version: Version,
    /// Transactions committed since open.
    pub commits: u64,
    /// Transactions rolled back since open.
    pub rollbacks: u64,
}

impl fmt::Display for PageCacheStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "pages={} page_versions={} version_heads={} txns={} current={} commits={} rollbacks={}",
            self.page_heads,
            self.page_versions,
            self.version_heads,
            self.transaction_heads,
            self.current_version,
            self.commits,
            self.rollbacks
        )
    }
}

pub(crate) struct CacheInner {
    fileset: Arc<FileSet>,
    pages: Arc<PageHeadCollection>,
    versions: VersionHeadCollection,
    txns: TransactionHeadCollection,
    publish: Mutex<()>,
    commits: AtomicU64,
    rollbacks: AtomicU64,
}

impl CacheInner {
    pub(crate) fn sweep_page_heads(&self) -> Result<usize> {
        Ok(self.pages.sweep(self.versions.oldest_live()))
    }

    pub(crate) fn reclaim_versions(&self) -> Result<usize> {
        let reclaimed = self.versions.collect_unreferenced();
        let oldest_live = self.versions.oldest_live();
        let mut pruned = 0;
        for version in &reclaimed {
            for snapshot in &version.pages {
                if let Some(head) = self.pages.peek(snapshot.page_id()) {
                    pruned += head.prune_before(oldest_live);
                }
            }
        }
        if !reclaimed.is_empty() {
            debug!(versions = reclaimed.len(), pruned, "page_cache.reclaim");
        }
        Ok(reclaimed.len())
    }

    pub(crate) fn reap_transactions(&self) -> Result<usize> {
        Ok(self.txns.reap())
    }
}

/// Transactional page API over a [`FileSet`].
pub struct PageCache {
    sweeper: Option<Sweeper>,
    inner: Arc<CacheInner>,
}

impl PageCache {
    /// Creates a cache whose current version is `current`.
    ///
    /// `current` must be at least the newest version the logs have seen so
    /// new commits are ordered after recovered ones.
    pub fn new(fileset: Arc<FileSet>, current: Version, options: CacheOptions) -> Result<Self> {
        let pages = Arc::new(PageHeadCollection::new(
            Arc::clone(&fileset),
            options.page_idle_sweeps,
        ));
        let inner = Arc::new(CacheInner {
            txns: TransactionHeadCollection::new(Arc::clone(&pages), fileset.page_size()),
            versions: VersionHeadCollection::new(current),
            pages,
            fileset,
            publish: Mutex::new(()),
            commits: AtomicU64::new(0),
            rollbacks: AtomicU64::new(0),
        });
        let sweeper = match options.sweep_interval {
            Some(interval) => Some(Sweeper::start(&inner, interval)?),
            None => None,
        };
        info!(
            current = current.0,
            sweeping = sweeper.is_some(),
            "page_cache.open"
        );
        Ok(Self { sweeper, inner })
    }

    /// Page size in bytes.
    pub fn page_size(&self) -> usize {
        self.inner.fileset.page_size()
    }

    /// Backing file set.
    pub fn fileset(&self) -> &Arc<FileSet> {
        &self.inner.fileset
    }

    /// Newest committed version.
    pub fn current_version(&self) -> Version {
        self.inner.versions.current()
    }

    /// Starts `txn`, nested under `parent` when given.
    ///
    /// A root transaction pins its begin version until it finishes.
    pub fn begin_transaction(&self, txn: &Transaction, parent: Option<TxnId>) -> Result<()> {
        self.inner.txns.begin(txn, parent)?;
        if parent.is_none() {
            self.inner.versions.transaction_started(txn.begin_version);
        }
        Ok(())
    }

    /// Returns the page as `txn` sees it, or the newest version without one.
    pub fn get(&self, txn: Option<&Transaction>, page: PageId) -> Result<Arc<Page>> {
        let Some(txn) = txn else {
            let head = self.inner.pages.get_page_head(page)?;
            return Ok(Arc::clone(&head.get_version(None)?.page));
        };
        if let Some(private) = self.inner.txns.get_modified_page(txn.id, page)? {
            return Ok(private);
        }
        let head = self.inner.pages.get_page_head(page)?;
        Ok(Arc::clone(&head.get_version(Some(txn.begin_version))?.page))
    }

    /// Stages `updates` in `txn`, or writes them straight through to the data
    /// files when `txn` is `None`.
    ///
    /// Direct writes bypass versioning and are meant for bootstrap pages.
    pub fn update(&self, txn: Option<&Transaction>, updates: Vec<PageUpdate>) -> Result<()> {
        if let Some(txn) = txn {
            return self.inner.txns.add_updates(txn.id, updates);
        }
        let mut sorted = updates;
        sort_updates(&mut sorted);
        self.inner.pages.write_direct(sorted)
    }

    /// Locks `page` for the transaction tree of `txn`; see
    /// [`TransactionHeadCollection::lock`].
    pub fn lock(&self, txn: &Transaction, page: PageId) -> Result<bool> {
        self.inner.txns.lock(txn.id, page)
    }

    /// Drops one lock level on `page`.
    pub fn unlock(&self, txn: &Transaction, page: PageId) -> Result<()> {
        self.inner.txns.unlock(txn.id, page)
    }

    /// Publishes the updates of `txn` as page versions tagged with its commit
    /// version and starts the log write.
    ///
    /// A child merges into its parent instead. The returned ticket completes
    /// when the log write is durable; it is already complete when there was
    /// nothing to write.
    pub fn commit_transaction(&self, txn: &Transaction) -> Result<Ticket> {
        let inner = &self.inner;
        if inner.txns.is_child(txn.id)? {
            inner.txns.merge_into_parent(txn.id)?;
            return Ok(Ticket::completed(Ok(())));
        }
        let updates = inner.txns.take_for_commit(txn.id)?;
        if updates.is_empty() {
            inner.txns.finish(txn.id, TxnState::Committed);
            inner.versions.transaction_ended(txn.begin_version)?;
            inner.commits.fetch_add(1, Ordering::Relaxed);
            debug!(txn = txn.id.0, "page_cache.commit.empty");
            return Ok(Ticket::completed(Ok(())));
        }
        match self.publish(txn, updates) {
            Ok(ticket) => {
                inner.commits.fetch_add(1, Ordering::Relaxed);
                Ok(ticket)
            }
            Err(err) => {
                if inner.txns.rollback(txn.id)? {
                    inner.versions.transaction_ended(txn.begin_version)?;
                }
                inner.fileset.rollback_transaction(txn.id);
                inner.rollbacks.fetch_add(1, Ordering::Relaxed);
                Err(err)
            }
        }
    }

    fn publish(&self, txn: &Transaction, updates: Vec<PageUpdate>) -> Result<Ticket> {
        let inner = &self.inner;
        if txn.commit_version <= txn.begin_version {
            return Err(StoreError::Invalid(
                "commit version must be newer than the begin version",
            ));
        }
        // Held until the version is registered so commits publish in version order.
        let _publish = inner.publish.lock();
        if txn.commit_version <= inner.versions.current() {
            return Err(StoreError::Invalid(
                "commit version must be newer than the current version",
            ));
        }
        debug!(
            txn = txn.id.0,
            version = txn.commit_version.0,
            updates = updates.len(),
            "page_cache.commit.start"
        );
        let mut built: Vec<(Arc<PageHead>, Arc<PageVersion>)> = Vec::new();
        for run in page_runs(&updates) {
            let head = inner.pages.get_page_head(run[0].page_id)?;
            let mut page = Arc::clone(&head.get_version(None)?.page);
            let target = Arc::make_mut(&mut page);
            for update in run {
                target.apply(update)?;
            }
            built.push((
                head,
                Arc::new(PageVersion {
                    version: txn.commit_version,
                    page,
                }),
            ));
        }
        inner.fileset.write(Some(txn), updates)?;
        for (head, snapshot) in &built {
            head.add_version(Arc::clone(snapshot));
        }
        inner.versions.add(
            txn.commit_version,
            built.into_iter().map(|(_, snapshot)| snapshot),
        );
        inner.txns.finish(txn.id, TxnState::Committed);
        inner.versions.transaction_ended(txn.begin_version)?;
        Ok(inner.fileset.commit_transaction(txn))
    }

    /// Applies the logged updates of a committed root to the data files.
    ///
    /// Children and transactions that wrote nothing finish immediately.
    pub fn finalize_transaction(&self, txn: &Transaction) -> Ticket {
        let inner = &self.inner;
        if inner.fileset.has_pending(txn.id) {
            return inner.fileset.finalize_transaction(txn);
        }
        match inner.txns.get(txn.id) {
            Ok(head) if head.is_root() && head.state() == TxnState::Active => Ticket::completed(
                Err(StoreError::Invalid("transaction was never committed")),
            ),
            _ => Ticket::completed(Ok(())),
        }
    }

    /// Discards `txn` and everything nested under it. No file I/O.
    pub fn rollback_transaction(&self, txn: &Transaction) -> Result<()> {
        let inner = &self.inner;
        if inner.txns.rollback(txn.id)? {
            inner.versions.transaction_ended(txn.begin_version)?;
            inner.fileset.rollback_transaction(txn.id);
        }
        inner.rollbacks.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Adds a zero-filled page to the page universe.
    pub fn new_page(&self, page: PageId) -> Result<()> {
        self.inner.pages.new_page(page).map(|_| ())
    }

    /// Runs every reclamation pass once on the calling thread.
    pub fn sweep_now(&self) -> Result<()> {
        for pass in [SweepPass::Versions, SweepPass::Transactions, SweepPass::PageHeads] {
            pass.run(&self.inner)?;
        }
        Ok(())
    }

    /// Current counters.
    pub fn stats(&self) -> PageCacheStats {
        let inner = &self.inner;
        PageCacheStats {
            page_heads: inner.pages.len(),
            page_versions: inner.pages.version_count(),
            version_heads: inner.versions.len(),
            transaction_heads: inner.txns.len(),
            current_version: inner.versions.current(),
            commits: inner.commits.load(Ordering::Relaxed),
            rollbacks: inner.rollbacks.load(Ordering::Relaxed),
        }
    }
}

impl Drop for PageCache {
    fn drop(&mut self) {
        if let Some(mut sweeper) = self.sweeper.take() {
            sweeper.stop();
        }
    }
}

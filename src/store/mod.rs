#![forbid(unsafe_code)]

//! Page store: the [`PageCache`] plus the page-0 index registry and page
//! allocation.
//!
//! Page 0 holds `(object_type: u16, start_page: u64)` slots, big-endian, ten
//! bytes each; a start page of 0 marks a free slot and type 0 belongs to the
//! free-page map. Page 1 holds the highest allocated page number as a
//! big-endian `u64`. Both pages are written outside any transaction.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::cache::{CacheOptions, PageCache, PageCacheStats};
use crate::fileset::{FileSet, FileSetOptions, RecoveryReport};
use crate::options::StoreOptions;
use crate::primitives::dispatch::Ticket;
use crate::primitives::io::{FileIo, StdFileIo};
use crate::primitives::page::{Page, PageUpdate};
use crate::types::{be_u16, be_u64, PageId, Result, StoreError, Transaction, TxnId};

/// Page holding the index registry.
pub const INDEX_REGISTRY_PAGE: PageId = PageId(0);
/// Page holding the allocation counter.
pub const ALLOCATION_PAGE: PageId = PageId(1);
/// Object type reserved for the free-page map.
pub const FREE_PAGE_MAP_TYPE: u16 = 0;

const REGISTRY_SLOT_LEN: usize = 10;

/// Page-level contract consumed by index and record layers.
pub trait PageAccess: Send + Sync {
    /// Page size in bytes.
    fn page_size(&self) -> u32;
    /// First page of the index for `object_type`, allocated on first use.
    fn get_first_index_page(&self, object_type: u16) -> Result<PageId>;
    /// Allocates one page.
    fn allocate(&self) -> Result<PageId>;
    /// Allocates `count` contiguous pages and returns the first.
    fn allocate_run(&self, count: u8) -> Result<PageId>;
    /// Gives a page back. Freed pages are not reused yet.
    fn release(&self, page: PageId);
    /// Starts a transaction, nested under `parent` when given.
    fn begin_transaction(&self, txn: &Transaction, parent: Option<TxnId>) -> Result<()>;
    /// Reads a page as `txn` sees it.
    fn get(&self, txn: Option<&Transaction>, page: PageId) -> Result<Arc<Page>>;
    /// Stages updates in `txn`, or writes them through without one.
    fn update(&self, txn: Option<&Transaction>, updates: Vec<PageUpdate>) -> Result<()>;
    /// Takes the re-entrant page lock for the tree of `txn`.
    fn lock(&self, txn: &Transaction, page: PageId) -> Result<bool>;
    /// Drops one level of the page lock.
    fn unlock(&self, txn: &Transaction, page: PageId) -> Result<()>;
    /// Publishes `txn` and starts its log write.
    fn commit_transaction(&self, txn: &Transaction) -> Result<Ticket>;
    /// Applies a committed transaction to the data files.
    fn finalize_transaction(&self, txn: &Transaction) -> Ticket;
    /// Discards `txn` and its nested transactions.
    fn rollback_transaction(&self, txn: &Transaction) -> Result<()>;
}

/// Transactional page store over striped data files and commit logs.
pub struct PageStore {
    cache: PageCache,
    meta: Mutex<()>,
    recovery: RecoveryReport,
}

impl PageStore {
    /// Opens (or creates) the files named in `options`, recovers the logs, and
    /// bootstraps the reserved pages.
    pub fn open(options: StoreOptions) -> Result<Self> {
        options.validate()?;
        let data = open_files(&options.data_files)?;
        let logs = open_files(&options.log_files)?;
        let fileset = FileSet::open(data, logs, FileSetOptions::from(&options))?;
        Self::with_fileset(fileset, &options)
    }

    /// Builds a store over an already opened file set.
    pub fn with_fileset(fileset: Arc<FileSet>, options: &StoreOptions) -> Result<Self> {
        if fileset.page_size() < 2 * REGISTRY_SLOT_LEN {
            return Err(StoreError::Config("page size cannot hold the index registry"));
        }
        let recovery = fileset.recover()?;
        let cache = PageCache::new(
            fileset,
            recovery.max_version,
            CacheOptions {
                sweep_interval: options.sweep_interval(),
                page_idle_sweeps: options.page_idle_sweeps,
            },
        )?;
        let store = Self {
            cache,
            meta: Mutex::new(()),
            recovery,
        };
        store.bootstrap()?;
        info!(
            page_size = store.cache.page_size(),
            current = store.cache.current_version().0,
            highest_page = store.highest_allocated()?.0,
            "page_store.open"
        );
        Ok(store)
    }

    fn bootstrap(&self) -> Result<()> {
        let _meta = self.meta.lock();
        if self.read_counter()? == 0 {
            self.write_counter(ALLOCATION_PAGE.0)?;
            debug!("page_store.bootstrap");
        }
        Ok(())
    }

    fn read_counter(&self) -> Result<u64> {
        let page = self.cache.get(None, ALLOCATION_PAGE)?;
        Ok(be_u64(page.data(), 0))
    }

    fn write_counter(&self, highest: u64) -> Result<()> {
        self.cache.update(
            None,
            vec![PageUpdate::new(
                ALLOCATION_PAGE,
                0,
                1,
                highest.to_be_bytes().to_vec(),
            )],
        )
    }

    // Caller holds `meta`.
    fn allocate_locked(&self, count: u8) -> Result<PageId> {
        if count == 0 {
            return Err(StoreError::Invalid("cannot allocate an empty run"));
        }
        let highest = self.read_counter()?;
        let first = highest + 1;
        let last = highest + u64::from(count);
        self.write_counter(last)?;
        for page in first..=last {
            match self.cache.new_page(PageId(page)) {
                Ok(()) | Err(StoreError::Invalid(_)) => {}
                Err(err) => return Err(err),
            }
        }
        debug!(first, count, "page_store.allocate");
        Ok(PageId(first))
    }

    /// First page of the index for `object_type`, allocated on first use.
    pub fn get_first_index_page(&self, object_type: u16) -> Result<PageId> {
        let _meta = self.meta.lock();
        let registry = self.cache.get(None, INDEX_REGISTRY_PAGE)?;
        let mut free_slot = None;
        for (slot, entry) in registry.data().chunks_exact(REGISTRY_SLOT_LEN).enumerate() {
            let start = be_u64(entry, 2);
            if start == 0 {
                free_slot.get_or_insert(slot);
            } else if be_u16(entry, 0) == object_type {
                return Ok(PageId(start));
            }
        }
        let slot = free_slot.ok_or(StoreError::Invalid("index registry is full"))?;
        let start = self.allocate_locked(1)?;
        let mut entry = Vec::with_capacity(REGISTRY_SLOT_LEN);
        entry.extend_from_slice(&object_type.to_be_bytes());
        entry.extend_from_slice(&start.0.to_be_bytes());
        let offset = u32::try_from(slot * REGISTRY_SLOT_LEN)
            .map_err(|_| StoreError::Corruption("registry slot offset overflow"))?;
        self.cache.update(
            None,
            vec![PageUpdate::new(INDEX_REGISTRY_PAGE, offset, 1, entry)],
        )?;
        info!(object_type, start = start.0, slot, "page_store.registry.insert");
        Ok(start)
    }

    /// Allocates one page.
    pub fn allocate(&self) -> Result<PageId> {
        self.allocate_run(1)
    }

    /// Allocates `count` contiguous pages and returns the first.
    pub fn allocate_run(&self, count: u8) -> Result<PageId> {
        let _meta = self.meta.lock();
        self.allocate_locked(count)
    }

    /// Gives a page back. Freed pages are not reused yet.
    pub fn release(&self, page: PageId) {
        debug!(page = page.0, "page_store.release");
    }

    /// Highest page number handed out so far.
    pub fn highest_allocated(&self) -> Result<PageId> {
        Ok(PageId(self.read_counter()?))
    }

    /// Page size in bytes.
    pub fn page_size(&self) -> usize {
        self.cache.page_size()
    }

    /// The transactional cache.
    pub fn cache(&self) -> &PageCache {
        &self.cache
    }

    /// What recovery did while opening.
    pub fn recovery_report(&self) -> RecoveryReport {
        self.recovery
    }

    /// Cache counters.
    pub fn stats(&self) -> PageCacheStats {
        self.cache.stats()
    }
}

impl PageAccess for PageStore {
    fn page_size(&self) -> u32 {
        // Validated to fit in 32 bits when the file set was opened.
        self.cache.page_size() as u32
    }

    fn get_first_index_page(&self, object_type: u16) -> Result<PageId> {
        PageStore::get_first_index_page(self, object_type)
    }

    fn allocate(&self) -> Result<PageId> {
        PageStore::allocate(self)
    }

    fn allocate_run(&self, count: u8) -> Result<PageId> {
        PageStore::allocate_run(self, count)
    }

    fn release(&self, page: PageId) {
        PageStore::release(self, page);
    }

    fn begin_transaction(&self, txn: &Transaction, parent: Option<TxnId>) -> Result<()> {
        self.cache.begin_transaction(txn, parent)
    }

    fn get(&self, txn: Option<&Transaction>, page: PageId) -> Result<Arc<Page>> {
        self.cache.get(txn, page)
    }

    fn update(&self, txn: Option<&Transaction>, updates: Vec<PageUpdate>) -> Result<()> {
        self.cache.update(txn, updates)
    }

    fn lock(&self, txn: &Transaction, page: PageId) -> Result<bool> {
        self.cache.lock(txn, page)
    }

    fn unlock(&self, txn: &Transaction, page: PageId) -> Result<()> {
        self.cache.unlock(txn, page)
    }

    fn commit_transaction(&self, txn: &Transaction) -> Result<Ticket> {
        self.cache.commit_transaction(txn)
    }

    fn finalize_transaction(&self, txn: &Transaction) -> Ticket {
        self.cache.finalize_transaction(txn)
    }

    fn rollback_transaction(&self, txn: &Transaction) -> Result<()> {
        self.cache.rollback_transaction(txn)
    }
}

fn open_files(paths: &[std::path::PathBuf]) -> Result<Vec<Arc<dyn FileIo>>> {
    paths
        .iter()
        .map(|path| Ok(Arc::new(StdFileIo::open(path)?) as Arc<dyn FileIo>))
        .collect()
}

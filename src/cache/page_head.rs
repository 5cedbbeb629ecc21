#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use rustc_hash::FxHashMap;
use tracing::debug;

use crate::fileset::FileSet;
use crate::primitives::page::{page_runs, Page, PageUpdate};
use crate::types::{PageId, Result, StoreError, TxnId, Version};

/// Immutable snapshot of one page as produced by one version.
///
/// Shared between the page's [`PageHead`] and the version's
/// [`VersionHead`](super::version_head::VersionHead).
#[derive(Debug)]
pub struct PageVersion {
    /// Version that produced this snapshot.
    pub version: Version,
    /// Page bytes.
    pub page: Arc<Page>,
}

impl PageVersion {
    /// Page number of the snapshot.
    pub fn page_id(&self) -> PageId {
        self.page.id()
    }
}

struct HeadState {
    versions: BTreeMap<Version, Arc<PageVersion>>,
    owner: Option<TxnId>,
    lock_count: u32,
}

/// Version chain and lock of one page number.
///
/// At least one version is always present.
pub struct PageHead {
    id: PageId,
    state: Mutex<HeadState>,
    released: Condvar,
    last_touch: AtomicU64,
}

impl PageHead {
    fn new(initial: PageVersion, epoch: u64) -> Self {
        let id = initial.page_id();
        let mut versions = BTreeMap::new();
        versions.insert(initial.version, Arc::new(initial));
        Self {
            id,
            state: Mutex::new(HeadState {
                versions,
                owner: None,
                lock_count: 0,
            }),
            released: Condvar::new(),
            last_touch: AtomicU64::new(epoch),
        }
    }

    /// Page number.
    pub fn id(&self) -> PageId {
        self.id
    }

    /// Snapshot visible at `version`: the highest version not above it, or
    /// the newest one when `version` is `None`.
    pub fn get_version(&self, version: Option<Version>) -> Result<Arc<PageVersion>> {
        let state = self.state.lock();
        let found = match version {
            Some(version) => state.versions.range(..=version).next_back(),
            None => state.versions.iter().next_back(),
        };
        found
            .map(|(_, page_version)| Arc::clone(page_version))
            .ok_or(StoreError::Corruption("no page version visible at requested version"))
    }

    /// Inserts a snapshot, replacing one already stored for the same version.
    pub fn add_version(&self, page_version: Arc<PageVersion>) {
        let mut state = self.state.lock();
        state.versions.insert(page_version.version, page_version);
    }

    /// Writes `updates` into the newest snapshot without creating a version.
    ///
    /// Used for non-transactional writes, which bypass versioning.
    pub fn apply_in_place(&self, updates: &[PageUpdate]) -> Result<()> {
        let mut state = self.state.lock();
        let Some(mut newest) = state.versions.last_entry() else {
            return Err(StoreError::Corruption("page head has no versions"));
        };
        let mut page = Arc::clone(&newest.get().page);
        let target = Arc::make_mut(&mut page);
        for update in updates {
            target.apply(update)?;
        }
        let version = newest.get().version;
        newest.insert(Arc::new(PageVersion { version, page }));
        Ok(())
    }

    /// Drops every snapshot superseded at `version`: those older than the
    /// snapshot a reader at `version` would see.
    pub fn prune_before(&self, version: Version) -> usize {
        let mut state = self.state.lock();
        let Some(&visible) = state.versions.range(..=version).next_back().map(|(v, _)| v) else {
            return 0;
        };
        let kept = state.versions.split_off(&visible);
        let removed = state.versions.len();
        state.versions = kept;
        removed
    }

    /// Number of stored snapshots.
    pub fn version_count(&self) -> usize {
        self.state.lock().versions.len()
    }

    /// Blocks until no other transaction root holds the page, then takes
    /// one more level of the re-entrant lock for `owner`.
    pub fn lock(&self, owner: TxnId) {
        let mut state = self.state.lock();
        while matches!(state.owner, Some(current) if current != owner) {
            self.released.wait(&mut state);
        }
        state.owner = Some(owner);
        state.lock_count += 1;
    }

    /// Drops one lock level; returns true when the page became free.
    pub fn unlock(&self, owner: TxnId) -> Result<bool> {
        let mut state = self.state.lock();
        if state.owner != Some(owner) {
            return Err(StoreError::Invalid("page is not locked by this transaction"));
        }
        state.lock_count -= 1;
        if state.lock_count > 0 {
            return Ok(false);
        }
        state.owner = None;
        self.released.notify_all();
        Ok(true)
    }

    /// Drops every lock level `owner` holds.
    pub fn release(&self, owner: TxnId) {
        let mut state = self.state.lock();
        if state.owner == Some(owner) {
            state.owner = None;
            state.lock_count = 0;
            self.released.notify_all();
        }
    }

    /// Current lock owner and depth.
    pub fn lock_state(&self) -> (Option<TxnId>, u32) {
        let state = self.state.lock();
        (state.owner, state.lock_count)
    }

    fn evictable(&self, epoch: u64, idle_sweeps: u64, oldest_live: Version) -> bool {
        if epoch.saturating_sub(self.last_touch.load(Ordering::Relaxed)) < idle_sweeps {
            return false;
        }
        let state = self.state.lock();
        state.owner.is_none()
            && state.versions.len() == 1
            && state
                .versions
                .first_key_value()
                .is_some_and(|(&version, _)| version <= oldest_live)
    }
}

/// Every cached [`PageHead`], keyed by page number.
pub struct PageHeadCollection {
    fileset: Arc<FileSet>,
    pages: Mutex<FxHashMap<PageId, Arc<PageHead>>>,
    epoch: AtomicU64,
    direct_writes: AtomicU64,
    idle_sweeps: u64,
}

impl PageHeadCollection {
    /// Creates an empty collection reading cold pages from `fileset`.
    pub fn new(fileset: Arc<FileSet>, idle_sweeps: u64) -> Self {
        Self {
            fileset,
            pages: Mutex::new(FxHashMap::default()),
            epoch: AtomicU64::new(0),
            direct_writes: AtomicU64::new(0),
            idle_sweeps,
        }
    }

    /// Returns the head of `page`, loading version 0 from the data files on
    /// first access.
    ///
    /// The disk read happens outside the collection lock. When a direct write
    /// lands in between, the page is read again under the lock.
    pub fn get_page_head(&self, page: PageId) -> Result<Arc<PageHead>> {
        if let Some(head) = self.get_cached(page) {
            return Ok(head);
        }
        let generation = self.direct_writes.load(Ordering::Acquire);
        let mut loaded = self.fileset.read_page(page)?;
        let epoch = self.epoch.load(Ordering::Relaxed);
        let mut pages = self.pages.lock();
        if let Some(head) = pages.get(&page) {
            return Ok(Arc::clone(head));
        }
        if self.direct_writes.load(Ordering::Acquire) != generation {
            debug!(page = page.0, "page_heads.reload");
            loaded = self.fileset.read_page(page)?;
        }
        let head = Arc::new(PageHead::new(
            PageVersion {
                version: Version(0),
                page: Arc::new(loaded),
            },
            epoch,
        ));
        pages.insert(page, Arc::clone(&head));
        Ok(head)
    }

    /// Writes sorted `updates` straight to the data files and into every
    /// cached head they touch, bypassing versioning.
    ///
    /// Holds the collection lock throughout so a concurrent cold load never
    /// caches the bytes from before the write.
    pub fn write_direct(&self, updates: Vec<PageUpdate>) -> Result<()> {
        let pages = self.pages.lock();
        let result = self.fileset.write(None, updates.clone());
        self.direct_writes.fetch_add(1, Ordering::AcqRel);
        result?;
        for run in page_runs(&updates) {
            if let Some(head) = pages.get(&run[0].page_id) {
                head.apply_in_place(run)?;
            }
        }
        Ok(())
    }

    /// Registers a zero-filled page; fails when the page is already cached.
    pub fn new_page(&self, page: PageId) -> Result<Arc<PageHead>> {
        let mut pages = self.pages.lock();
        if pages.contains_key(&page) {
            return Err(StoreError::Invalid("page already exists"));
        }
        let zeroed = self.fileset.pool().get(page, true);
        let head = Arc::new(PageHead::new(
            PageVersion {
                version: Version(0),
                page: Arc::new(zeroed),
            },
            self.epoch.load(Ordering::Relaxed),
        ));
        pages.insert(page, Arc::clone(&head));
        debug!(page = page.0, "page_heads.new_page");
        Ok(head)
    }

    /// Returns the head of `page` when it is cached.
    pub fn get_cached(&self, page: PageId) -> Option<Arc<PageHead>> {
        let head = self.pages.lock().get(&page).cloned();
        if let Some(head) = &head {
            head.last_touch
                .store(self.epoch.load(Ordering::Relaxed), Ordering::Relaxed);
        }
        head
    }

    /// Like [`get_cached`](Self::get_cached) but does not count as an access.
    pub fn peek(&self, page: PageId) -> Option<Arc<PageHead>> {
        self.pages.lock().get(&page).cloned()
    }

    /// Prunes superseded snapshots, then evicts idle heads whose single
    /// snapshot every live reader can see.
    ///
    /// A head is kept while anyone outside the collection holds it, while it
    /// is locked, or while an unapplied commit touches its page.
    pub fn sweep(&self, oldest_live: Version) -> usize {
        let epoch = self.epoch.fetch_add(1, Ordering::Relaxed) + 1;
        let mut pages = self.pages.lock();
        let before = pages.len();
        pages.retain(|page, head| {
            head.prune_before(oldest_live);
            let idle = Arc::strong_count(head) == 1
                && head.evictable(epoch, self.idle_sweeps, oldest_live)
                && !self.fileset.has_pending_page(*page);
            !idle
        });
        let evicted = before - pages.len();
        if evicted > 0 {
            debug!(evicted, remaining = pages.len(), "page_heads.sweep");
        }
        evicted
    }

    /// Number of cached heads.
    pub fn len(&self) -> usize {
        self.pages.lock().len()
    }

    /// Returns true when no head is cached.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total snapshots across every cached head.
    pub fn version_count(&self) -> usize {
        let heads: Vec<Arc<PageHead>> = self.pages.lock().values().cloned().collect();
        heads.iter().map(|head| head.version_count()).sum()
    }
}

#![forbid(unsafe_code)]

use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::types::{PageId, Result, StoreError};

/// Number of idle buffers a shared pool keeps before handing surplus back to the allocator.
pub const DEFAULT_POOL_RETAIN: usize = 256;

static SHARED_POOLS: OnceLock<Mutex<FxHashMap<usize, Arc<PagePool>>>> = OnceLock::new();

/// Free list of page-sized buffers.
///
/// Pools never block: when the free list is empty a fresh buffer is allocated.
pub struct PagePool {
    page_size: usize,
    retain: AtomicUsize,
    free: Mutex<Vec<Box<[u8]>>>,
    allocated: AtomicU64,
    reused: AtomicU64,
}

/// Counters describing pool behaviour.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct PagePoolStats {
    /// Buffers allocated because the free list was empty.
    pub allocated: u64,
    /// Buffers served from the free list.
    pub reused: u64,
    /// Buffers currently idle in the free list.
    pub idle: usize,
}

impl PagePool {
    /// Returns the process-wide pool for `page_size`, creating it on first use.
    pub fn shared(page_size: usize) -> Arc<PagePool> {
        let pools = SHARED_POOLS.get_or_init(|| Mutex::new(FxHashMap::default()));
        let mut pools = pools.lock();
        Arc::clone(
            pools
                .entry(page_size)
                .or_insert_with(|| PagePool::with_retain(page_size, DEFAULT_POOL_RETAIN)),
        )
    }

    /// Creates a private pool that keeps at most `retain` idle buffers.
    pub fn with_retain(page_size: usize, retain: usize) -> Arc<PagePool> {
        Arc::new(Self {
            page_size,
            retain: AtomicUsize::new(retain),
            free: Mutex::new(Vec::new()),
            allocated: AtomicU64::new(0),
            reused: AtomicU64::new(0),
        })
    }

    /// Size of every buffer handed out by this pool.
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Hands out a buffer tagged with `id`; `clear` zero-fills it.
    ///
    /// A recycled buffer that is not cleared still holds its previous bytes.
    pub fn get(self: &Arc<Self>, id: PageId, clear: bool) -> Page {
        let recycled = self.free.lock().pop();
        let buf = match recycled {
            Some(mut buf) => {
                self.reused.fetch_add(1, Ordering::Relaxed);
                if clear {
                    buf.fill(0);
                }
                buf
            }
            None => {
                self.allocated.fetch_add(1, Ordering::Relaxed);
                vec![0u8; self.page_size].into_boxed_slice()
            }
        };
        Page {
            id,
            buf: Some(buf),
            pool: Arc::clone(self),
        }
    }

    /// Raises the idle-buffer limit to `retain`; never lowers it.
    ///
    /// Shared pools serve every file set with the same page size, so each one
    /// can only ask for more room.
    pub fn retain_at_least(&self, retain: usize) {
        self.retain.fetch_max(retain, Ordering::Relaxed);
    }

    /// Idle buffers the pool keeps at most.
    pub fn retain(&self) -> usize {
        self.retain.load(Ordering::Relaxed)
    }

    /// Changes how many idle buffers the pool keeps.
    pub fn set_retain(&self, retain: usize) {
        self.retain.store(retain, Ordering::Relaxed);
        let mut free = self.free.lock();
        free.truncate(retain);
    }

    /// Returns current pool counters.
    pub fn stats(&self) -> PagePoolStats {
        PagePoolStats {
            allocated: self.allocated.load(Ordering::Relaxed),
            reused: self.reused.load(Ordering::Relaxed),
            idle: self.free.lock().len(),
        }
    }

    fn put(&self, buf: Box<[u8]>) {
        let mut free = self.free.lock();
        if free.len() < self.retain.load(Ordering::Relaxed) {
            free.push(buf);
        }
    }
}

/// Fixed-size page buffer tagged with its page number.
///
/// Sharing is expressed with `Arc<Page>`; the buffer goes back to its pool when
/// the last holder drops it. Mutation needs unique ownership, so shared pages
/// are copied first (`Arc::make_mut`).
pub struct Page {
    id: PageId,
    buf: Option<Box<[u8]>>,
    pool: Arc<PagePool>,
}

impl Page {
    /// Page number this buffer belongs to.
    pub fn id(&self) -> PageId {
        self.id
    }

    /// Page bytes.
    pub fn data(&self) -> &[u8] {
        self.buf.as_deref().unwrap_or(&[])
    }

    /// Mutable page bytes.
    pub fn data_mut(&mut self) -> &mut [u8] {
        self.buf.as_deref_mut().unwrap_or(&mut [])
    }

    /// Page size in bytes.
    pub fn len(&self) -> usize {
        self.data().len()
    }

    /// Returns true for a zero-length page.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copies `update` into this page.
    pub fn apply(&mut self, update: &PageUpdate) -> Result<()> {
        update.apply_to(self.data_mut())
    }
}

impl Clone for Page {
    fn clone(&self) -> Self {
        let mut copy = self.pool.get(self.id, false);
        copy.data_mut().copy_from_slice(self.data());
        copy
    }
}

impl Drop for Page {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.put(buf);
        }
    }
}

impl fmt::Debug for Page {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Page")
            .field("id", &self.id)
            .field("len", &self.len())
            .finish()
    }
}

/// One contiguous write into a page.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PageUpdate {
    /// Target page.
    pub page_id: PageId,
    /// Byte offset inside the page.
    pub offset: u32,
    /// Apply order among updates to the same page within one commit.
    pub sequence: u32,
    /// Bytes to write.
    pub data: Vec<u8>,
}

impl PageUpdate {
    /// Builds an update.
    pub fn new(page_id: PageId, offset: u32, sequence: u32, data: impl Into<Vec<u8>>) -> Self {
        Self {
            page_id,
            offset,
            sequence,
            data: data.into(),
        }
    }

    /// Byte offset one past the last written byte.
    pub fn end(&self) -> u64 {
        u64::from(self.offset) + self.data.len() as u64
    }

    /// Fails when the update does not fit inside a page of `page_size` bytes.
    pub fn check_bounds(&self, page_size: usize) -> Result<()> {
        if self.end() > page_size as u64 {
            return Err(StoreError::Invalid("page update exceeds page bounds"));
        }
        Ok(())
    }

    /// Copies the update bytes into `buf`.
    pub fn apply_to(&self, buf: &mut [u8]) -> Result<()> {
        self.check_bounds(buf.len())?;
        let start = self.offset as usize;
        buf[start..start + self.data.len()].copy_from_slice(&self.data);
        Ok(())
    }
}

/// Orders updates by `(page, sequence)`, the order in which they must be applied.
pub fn sort_updates(updates: &mut [PageUpdate]) {
    updates.sort_by_key(|update| (update.page_id, update.sequence));
}

/// Splits updates already sorted by [`sort_updates`] into per-page runs.
pub fn page_runs(updates: &[PageUpdate]) -> impl Iterator<Item = &[PageUpdate]> {
    updates.chunk_by(|a, b| a.page_id == b.page_id)
}

//! Transactional, multi-version page storage.
//!
//! Fixed-size pages are striped across data files and protected by
//! write-ahead commit logs. Readers see the snapshot of their begin version,
//! writers stage updates in private page copies, and commits publish new page
//! versions before their log write completes. A separate finalize step applies
//! logged updates to the data files; recovery replays whatever was logged but
//! not applied.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cache;
pub mod fileset;
pub mod options;
pub mod primitives;
pub mod store;
pub mod types;

pub use cache::{CacheOptions, PageCache, PageCacheStats};
pub use fileset::{FileSet, FileSetOptions, RecoveryReport};
pub use options::{StoreOptions, Synchronous};
pub use primitives::dispatch::Ticket;
pub use primitives::io::{FileIo, MemFileIo, StdFileIo};
pub use primitives::page::{Page, PageUpdate};
pub use store::{PageAccess, PageStore};
pub use types::{PageId, Result, StoreError, Transaction, TxnId, Version};

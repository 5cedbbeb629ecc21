//! Low-level primitives for building the page store.
//!
//! Includes positional file I/O, pooled page buffers, the commit log,
//! and the worker pool that runs commit and finalize work.

/// Worker pool and completion tickets.
///
/// Commit and finalize work is dispatched here and awaited through tickets.
pub mod dispatch;

/// I/O abstractions and utilities.
///
/// Interfaces for reading/writing data and file operations.
pub mod io;

/// Pooled fixed-size page buffers and page updates.
pub mod page;

/// Write-ahead log of committed transactions.
///
/// Ensures durability through a chained, self-describing entry format.
pub mod wal;

#![forbid(unsafe_code)]

//! Identifiers, the caller-supplied transaction descriptor, and the crate error type.

use std::fmt;

/// Page number within the striped page universe.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default)]
pub struct PageId(pub u64);

/// Database version number. Commit versions are strictly increasing.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default)]
pub struct Version(pub u64);

/// Transaction identifier supplied by the database layer.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct TxnId(pub u64);

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for PageId {
    fn from(value: u64) -> Self {
        PageId(value)
    }
}

impl From<u64> for Version {
    fn from(value: u64) -> Self {
        Version(value)
    }
}

/// Transaction descriptor owned by the database layer.
///
/// `commit_version` starts out equal to `begin_version`; the database layer
/// assigns a fresh, strictly increasing value before calling commit.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct Transaction {
    /// Transaction identifier.
    pub id: TxnId,
    /// Snapshot the transaction reads from.
    pub begin_version: Version,
    /// Version the transaction's changes are published under.
    pub commit_version: Version,
}

impl Transaction {
    /// Creates a transaction reading at `begin_version`.
    pub fn new(id: u64, begin_version: u64) -> Self {
        Self {
            id: TxnId(id),
            begin_version: Version(begin_version),
            commit_version: Version(begin_version),
        }
    }

    /// Returns a copy carrying the given commit version.
    pub fn with_commit_version(mut self, version: u64) -> Self {
        self.commit_version = Version(version);
        self
    }
}

/// Errors surfaced by the page store.
#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    /// Underlying file I/O failed.
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),
    /// The store was configured inconsistently.
    #[error("configuration: {0}")]
    Config(&'static str),
    /// Configuration error carrying a formatted message.
    #[error("configuration: {0}")]
    ConfigOwned(String),
    /// An on-disk structure was written by a newer format.
    #[error("unsupported format version {found} (newest supported is {supported})")]
    Incompatible {
        /// Version found on disk.
        found: u32,
        /// Newest version this build understands.
        supported: u32,
    },
    /// The transaction was never begun or has already finished.
    #[error("transaction {0} is not active")]
    TxnNotActive(TxnId),
    /// The caller violated the API contract.
    #[error("invalid argument: {0}")]
    Invalid(&'static str),
    /// An internal invariant does not hold.
    #[error("corruption: {0}")]
    Corruption(&'static str),
    /// Roll-forward could not re-apply a logged transaction.
    #[error("recovery of version {version} failed: {source}")]
    Recovery {
        /// Version of the log entry being replayed.
        version: Version,
        /// Underlying failure.
        #[source]
        source: Box<StoreError>,
    },
    /// A background task did not run to completion.
    #[error("background task: {0}")]
    Task(String),
}

impl StoreError {
    /// Copies an error so it can be reported to more than one waiter.
    ///
    /// `std::io::Error` is not `Clone`; the copy keeps its kind and message.
    pub fn duplicate(&self) -> StoreError {
        match self {
            StoreError::Io(err) => StoreError::Io(std::io::Error::new(err.kind(), err.to_string())),
            StoreError::Config(msg) => StoreError::Config(msg),
            StoreError::ConfigOwned(msg) => StoreError::ConfigOwned(msg.clone()),
            StoreError::Incompatible { found, supported } => StoreError::Incompatible {
                found: *found,
                supported: *supported,
            },
            StoreError::TxnNotActive(id) => StoreError::TxnNotActive(*id),
            StoreError::Invalid(msg) => StoreError::Invalid(msg),
            StoreError::Corruption(msg) => StoreError::Corruption(msg),
            StoreError::Recovery { version, source } => StoreError::Recovery {
                version: *version,
                source: Box::new(source.duplicate()),
            },
            StoreError::Task(msg) => StoreError::Task(msg.clone()),
        }
    }
}

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Reads a big-endian `u16` at `at`.
pub(crate) fn be_u16(buf: &[u8], at: usize) -> u16 {
    u16::from_be_bytes([buf[at], buf[at + 1]])
}

/// Reads a big-endian `u32` at `at`.
pub(crate) fn be_u32(buf: &[u8], at: usize) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&buf[at..at + 4]);
    u32::from_be_bytes(raw)
}

/// Reads a big-endian `u64` at `at`.
pub(crate) fn be_u64(buf: &[u8], at: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&buf[at..at + 8]);
    u64::from_be_bytes(raw)
}

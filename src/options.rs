//! Store configuration.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::types::{Result, StoreError};

/// Smallest page that can hold the index registry and allocation counter.
pub const MIN_PAGE_SIZE: usize = 64;

/// Durability mode for log and data-file writes.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Synchronous {
    /// fsync the log after every commit and the data files after every finalize.
    #[default]
    Full,
    /// No explicit syncs (fastest but least durable).
    Off,
}

impl Synchronous {
    /// Returns the string representation of the synchronous mode.
    pub fn as_str(self) -> &'static str {
        match self {
            Synchronous::Full => "full",
            Synchronous::Off => "off",
        }
    }

    /// Parses a synchronous mode from a string (case-insensitive).
    pub fn from_str(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "full" => Some(Synchronous::Full),
            "off" => Some(Synchronous::Off),
            _ => None,
        }
    }

    /// Returns true when writes must be fsynced.
    pub fn syncs(self) -> bool {
        matches!(self, Synchronous::Full)
    }
}

/// Options for opening a [`PageStore`](crate::store::PageStore).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StoreOptions {
    /// Size of each page in bytes.
    pub page_size: usize,
    /// Data files, in striping order.
    pub data_files: Vec<PathBuf>,
    /// Log files, used round-robin per commit.
    pub log_files: Vec<PathBuf>,
    /// Durability mode.
    pub synchronous: Synchronous,
    /// Threads running commit and finalize work.
    pub worker_threads: usize,
    /// Background sweep period in milliseconds; 0 disables the sweeper threads.
    pub sweep_interval_ms: u64,
    /// Page-head sweeps a page must sit idle before it is evicted.
    pub page_idle_sweeps: u64,
    /// Idle page buffers kept for reuse. Stores with the same page size share
    /// one pool, which keeps the largest value any of them asked for.
    pub pool_retain_pages: usize,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            page_size: 4096,
            data_files: Vec::new(),
            log_files: Vec::new(),
            synchronous: Synchronous::Full,
            worker_threads: 4,
            sweep_interval_ms: 20,
            page_idle_sweeps: 64,
            pool_retain_pages: 256,
        }
    }
}

impl StoreOptions {
    /// One data file and one log file inside `dir`.
    pub fn in_dir(dir: impl AsRef<Path>) -> Self {
        Self::striped(dir, 1, 1)
    }

    /// `data` data files and `logs` log files inside `dir`.
    pub fn striped(dir: impl AsRef<Path>, data: usize, logs: usize) -> Self {
        let dir = dir.as_ref();
        Self {
            data_files: (0..data)
                .map(|n| dir.join(format!("pages-{n}.dat")))
                .collect(),
            log_files: (0..logs)
                .map(|n| dir.join(format!("commit-{n}.log")))
                .collect(),
            ..Self::default()
        }
    }

    /// Parses options from TOML text; absent keys keep their defaults.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|err| StoreError::ConfigOwned(err.to_string()))
    }

    /// Reads options from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
            .map_err(|err| StoreError::ConfigOwned(format!("{}: {err}", path.display())))
    }

    /// Sets the page size.
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    /// Sets the durability mode.
    pub fn with_synchronous(mut self, synchronous: Synchronous) -> Self {
        self.synchronous = synchronous;
        self
    }

    /// Sets the number of worker threads.
    pub fn with_worker_threads(mut self, workers: usize) -> Self {
        self.worker_threads = workers;
        self
    }

    /// Sets the sweep period; 0 disables the sweeper threads.
    pub fn with_sweep_interval_ms(mut self, interval_ms: u64) -> Self {
        self.sweep_interval_ms = interval_ms;
        self
    }

    /// Sets the idle threshold for page-head eviction.
    pub fn with_page_idle_sweeps(mut self, sweeps: u64) -> Self {
        self.page_idle_sweeps = sweeps;
        self
    }

    /// Sweep period, or `None` when background sweeping is disabled.
    pub fn sweep_interval(&self) -> Option<Duration> {
        (self.sweep_interval_ms > 0).then(|| Duration::from_millis(self.sweep_interval_ms))
    }

    /// Rejects inconsistent options.
    pub fn validate(&self) -> Result<()> {
        if self.page_size < MIN_PAGE_SIZE {
            return Err(StoreError::ConfigOwned(format!(
                "page size {} is below the minimum of {MIN_PAGE_SIZE}",
                self.page_size
            )));
        }
        if u32::try_from(self.page_size).is_err() {
            return Err(StoreError::Config("page size does not fit in 32 bits"));
        }
        if self.data_files.is_empty() {
            return Err(StoreError::Config("at least one data file is required"));
        }
        if self.log_files.is_empty() {
            return Err(StoreError::Config("at least one log file is required"));
        }
        if self.worker_threads == 0 {
            return Err(StoreError::Config("worker_threads must be at least 1"));
        }
        Ok(())
    }
}

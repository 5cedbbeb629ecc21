use tracing::{debug, info};

use super::FileSet;
use crate::primitives::wal::{LogFile, LogStatus};
use crate::types::{Result, StoreError, Version};

/// A log entry recovery still has to act on.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct IncompleteEntry {
    /// Commit version of the logged transaction.
    pub version: Version,
    /// Log file holding the entry.
    pub log_index: usize,
    /// Entry offset within that log.
    pub offset: u64,
    /// Status found on disk.
    pub status: LogStatus,
    /// Number of logged updates.
    pub update_count: u32,
}

/// Log entries classified by what recovery must do with them.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct IncompleteTransactions {
    /// Entries whose log write was interrupted.
    pub roll_back: Vec<IncompleteEntry>,
    /// Fully logged entries not yet applied to the data files.
    pub roll_forward: Vec<IncompleteEntry>,
}

impl IncompleteTransactions {
    /// Returns true when no entry needs recovery.
    pub fn is_empty(&self) -> bool {
        self.roll_back.is_empty() && self.roll_forward.is_empty()
    }
}

/// Outcome of [`FileSet::recover`].
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct RecoveryReport {
    /// Entries marked rolled back.
    pub rolled_back: usize,
    /// Entries re-applied to the data files.
    pub rolled_forward: usize,
    /// Highest commit version found in any log, settled or not.
    pub max_version: Version,
}

impl FileSet {
    /// Scans every log from its start and classifies unsettled entries.
    ///
    /// Both lists are sorted by version.
    pub fn get_incomplete_transactions(&self) -> Result<IncompleteTransactions> {
        let mut out = IncompleteTransactions::default();
        for (log_index, log) in self.logs.iter().enumerate() {
            for entry in log.entries()? {
                let incomplete = IncompleteEntry {
                    version: entry.version,
                    log_index,
                    offset: entry.offset,
                    status: entry.status,
                    update_count: entry.update_count,
                };
                match entry.status {
                    LogStatus::LogStarted => out.roll_back.push(incomplete),
                    LogStatus::LoggedThis | LogStatus::LoggedAll => {
                        out.roll_forward.push(incomplete)
                    }
                    LogStatus::CompleteThis | LogStatus::RolledBack => {}
                }
            }
        }
        out.roll_back.sort_by_key(|entry| entry.version);
        out.roll_forward.sort_by_key(|entry| entry.version);
        Ok(out)
    }

    /// Re-applies each entry to the data files and marks it complete.
    ///
    /// A failure is fatal: the data files may be partially written.
    pub fn roll_forward(&self, entries: &[IncompleteEntry]) -> Result<()> {
        let sync = self.synchronous.syncs();
        for entry in entries {
            let log = self.log(entry.log_index)?;
            let replay = log
                .get_updates(entry.offset)
                .and_then(|updates| self.apply_updates(updates))
                .and_then(|()| log.set_status(entry.offset, LogStatus::CompleteThis, sync));
            replay.map_err(|source| StoreError::Recovery {
                version: entry.version,
                source: Box::new(source),
            })?;
            debug!(
                version = entry.version.0,
                log = entry.log_index,
                offset = entry.offset,
                "fileset.recovery.rolled_forward"
            );
        }
        Ok(())
    }

    /// Marks each entry rolled back without touching the data files.
    pub fn roll_back(&self, entries: &[IncompleteEntry]) -> Result<()> {
        let sync = self.synchronous.syncs();
        for entry in entries {
            self.log(entry.log_index)?
                .set_status(entry.offset, LogStatus::RolledBack, sync)?;
            debug!(
                version = entry.version.0,
                log = entry.log_index,
                offset = entry.offset,
                "fileset.recovery.rolled_back"
            );
        }
        Ok(())
    }

    /// Rolls back interrupted entries and rolls forward logged ones.
    ///
    /// Meant to run at open, before any transaction starts.
    pub fn recover(&self) -> Result<RecoveryReport> {
        let mut max_version = Version(0);
        for log in &self.logs {
            for entry in log.entries()? {
                max_version = max_version.max(entry.version);
            }
        }
        let incomplete = self.get_incomplete_transactions()?;
        self.roll_back(&incomplete.roll_back)?;
        self.roll_forward(&incomplete.roll_forward)?;
        let report = RecoveryReport {
            rolled_back: incomplete.roll_back.len(),
            rolled_forward: incomplete.roll_forward.len(),
            max_version,
        };
        info!(
            rolled_back = report.rolled_back,
            rolled_forward = report.rolled_forward,
            max_version = report.max_version.0,
            "fileset.recovery.complete"
        );
        Ok(report)
    }

    /// Truncates every log back to its header once all entries are settled.
    ///
    /// Returns false, leaving the logs alone, while any transaction is pending
    /// or any entry still matters to recovery.
    pub fn checkpoint_logs(&self) -> Result<bool> {
        let pending = self.pending.lock();
        if !pending.is_empty() {
            return Ok(false);
        }
        for log in &self.logs {
            if !log.entries()?.iter().all(|entry| entry.status.is_settled()) {
                return Ok(false);
            }
        }
        let sync = self.synchronous.syncs();
        for log in &self.logs {
            log.reset(sync)?;
        }
        drop(pending);
        info!(logs = self.logs.len(), "fileset.checkpoint");
        Ok(true)
    }

    fn log(&self, index: usize) -> Result<&LogFile> {
        self.logs
            .get(index)
            .ok_or(StoreError::Invalid("log index out of range"))
    }
}

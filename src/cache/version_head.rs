#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use smallvec::SmallVec;

use super::page_head::PageVersion;
use crate::types::{Result, StoreError, Version};

/// Snapshots created by one commit plus the number of root transactions
/// reading at that version.
#[derive(Default)]
pub struct VersionHead {
    refs: u64,
    pages: SmallVec<[Arc<PageVersion>; 8]>,
}

impl VersionHead {
    /// Returns true while a transaction reads at this version.
    pub fn is_referenced(&self) -> bool {
        self.refs != 0
    }

    /// Snapshots this version produced.
    pub fn pages(&self) -> &[Arc<PageVersion>] {
        &self.pages
    }
}

/// A version removed by [`VersionHeadCollection::collect_unreferenced`].
pub struct ReclaimedVersion {
    /// The reclaimed version.
    pub version: Version,
    /// Snapshots it held.
    pub pages: SmallVec<[Arc<PageVersion>; 8]>,
}

/// Every live [`VersionHead`], ordered by version.
pub struct VersionHeadCollection {
    versions: Mutex<BTreeMap<Version, VersionHead>>,
    current: AtomicU64,
}

impl VersionHeadCollection {
    /// Creates a collection whose current version is `current`.
    pub fn new(current: Version) -> Self {
        Self {
            versions: Mutex::new(BTreeMap::new()),
            current: AtomicU64::new(current.0),
        }
    }

    /// Newest committed version.
    pub fn current(&self) -> Version {
        Version(self.current.load(Ordering::Acquire))
    }

    /// Makes sure a head exists for `version`.
    pub fn get_or_create(&self, version: Version) {
        self.versions.lock().entry(version).or_default();
    }

    /// Records the snapshots of a fresh commit and advances the current version.
    pub fn add(&self, version: Version, pages: impl IntoIterator<Item = Arc<PageVersion>>) {
        let mut versions = self.versions.lock();
        versions.entry(version).or_default().pages.extend(pages);
        self.current.fetch_max(version.0, Ordering::AcqRel);
    }

    /// A root transaction began reading at `version`.
    pub fn transaction_started(&self, version: Version) {
        let mut versions = self.versions.lock();
        versions.entry(version).or_default().refs += 1;
    }

    /// A root transaction reading at `version` finished.
    pub fn transaction_ended(&self, version: Version) -> Result<()> {
        let mut versions = self.versions.lock();
        match versions.get_mut(&version) {
            Some(head) if head.refs > 0 => {
                head.refs -= 1;
                Ok(())
            }
            _ => Err(StoreError::Corruption("version reference count underflow")),
        }
    }

    /// Returns true while a transaction reads at `version`.
    pub fn is_referenced(&self, version: Version) -> bool {
        self.versions
            .lock()
            .get(&version)
            .is_some_and(VersionHead::is_referenced)
    }

    /// Oldest version a live transaction may read, or the current version
    /// when none is running.
    pub fn oldest_live(&self) -> Version {
        let versions = self.versions.lock();
        versions
            .iter()
            .find(|(_, head)| head.is_referenced())
            .map(|(&version, _)| version)
            .unwrap_or_else(|| self.current())
            .min(self.current())
    }

    /// Removes versions in ascending order, stopping at the first one that is
    /// referenced or current.
    pub fn collect_unreferenced(&self) -> Vec<ReclaimedVersion> {
        let current = self.current();
        let mut versions = self.versions.lock();
        let mut reclaimed = Vec::new();
        while let Some(entry) = versions.first_entry() {
            if *entry.key() >= current || entry.get().is_referenced() {
                break;
            }
            let (version, head) = entry.remove_entry();
            reclaimed.push(ReclaimedVersion {
                version,
                pages: head.pages,
            });
        }
        reclaimed
    }

    /// Number of live version heads.
    pub fn len(&self) -> usize {
        self.versions.lock().len()
    }

    /// Returns true when no version head is live.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

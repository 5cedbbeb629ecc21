#![forbid(unsafe_code)]

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::primitives::io::FileIo;
use crate::primitives::page::PageUpdate;
use crate::types::{be_u32, be_u64, PageId, Result, StoreError, Version};

/// Newest log format this build reads and writes.
pub const LOG_FORMAT_VERSION: u32 = 1;
/// Bytes before the first entry.
pub const LOG_HEADER_LEN: u64 = 4;
/// `length:u32 | version:u64 | status:u8 | update_count:u32`
pub const ENTRY_HEADER_LEN: usize = 17;
/// `sequence:u32 | page:u64 | offset:u32 | data_length:u32`
pub const UPDATE_HEADER_LEN: usize = 20;

/// Offset of the status byte within an entry header.
pub const STATUS_AT: usize = 12;

/// Durability progress of one log entry.
#[repr(u8)]
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum LogStatus {
    /// Entry is being written; its updates may be incomplete.
    LogStarted = 1,
    /// Every update of the entry is on disk.
    LoggedThis = 2,
    /// Entry is durable across every cooperating log file.
    LoggedAll = 3,
    /// Updates were applied to the data files.
    CompleteThis = 4,
    /// Entry was discarded by recovery.
    RolledBack = 5,
}

impl LogStatus {
    fn from_u8(raw: u8) -> Result<Self> {
        match raw {
            1 => Ok(Self::LogStarted),
            2 => Ok(Self::LoggedThis),
            3 => Ok(Self::LoggedAll),
            4 => Ok(Self::CompleteThis),
            5 => Ok(Self::RolledBack),
            _ => Err(StoreError::Corruption("log entry status unknown")),
        }
    }

    /// Returns true once the entry no longer matters to recovery.
    pub fn is_settled(self) -> bool {
        matches!(self, Self::CompleteThis | Self::RolledBack)
    }
}

impl fmt::Display for LogStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::LogStarted => "log-started",
            Self::LoggedThis => "logged-this",
            Self::LoggedAll => "logged-all",
            Self::CompleteThis => "complete-this",
            Self::RolledBack => "rolled-back",
        };
        f.write_str(name)
    }
}

/// Header fields of one entry as found on disk.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct LogEntryHeader {
    /// Entry offset, relative to the first entry.
    pub offset: u64,
    /// Total encoded length of the entry.
    pub length: u32,
    /// Commit version of the logged transaction.
    pub version: Version,
    /// Current status.
    pub status: LogStatus,
    /// Number of updates in the entry.
    pub update_count: u32,
    /// Offset of the following entry.
    pub next_offset: u64,
}

/// Outcome of [`LogFile::read_next`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LogRead {
    /// An entry starts at the requested offset.
    Entry(LogEntryHeader),
    /// The requested offset is the logical end of the log.
    Eof,
}

/// Counters for one log file.
#[derive(Clone, Debug, Default)]
pub struct LogStats {
    /// Entries appended since open.
    pub entries_appended: u64,
    /// Bytes appended since open.
    pub bytes_appended: u64,
    /// Status rewrites performed.
    pub status_updates: u64,
    /// fsync calls issued.
    pub syncs: u64,
}

struct LogState {
    end: u64,
    stats: LogStats,
}

/// Append-only log of committed transactions for one physical stream.
///
/// Entries are chained by their length field; there is no separate index.
/// Every read and write goes through the state mutex so positioning on one
/// stream is never concurrent.
pub struct LogFile {
    io: Arc<dyn FileIo>,
    state: Mutex<LogState>,
}

impl LogFile {
    /// Opens a log, writing a fresh header when the file is empty.
    ///
    /// Any torn tail past the last complete entry is cut off.
    pub fn open(io: Arc<dyn FileIo>) -> Result<Self> {
        let len = io.len()?;
        if len < LOG_HEADER_LEN {
            io.write_at(0, &LOG_FORMAT_VERSION.to_be_bytes())?;
            io.truncate(LOG_HEADER_LEN)?;
        } else {
            let mut raw = [0u8; LOG_HEADER_LEN as usize];
            io.read_at(0, &mut raw)?;
            let found = u32::from_be_bytes(raw);
            if found == 0 {
                return Err(StoreError::Corruption("log format version is zero"));
            }
            if found > LOG_FORMAT_VERSION {
                return Err(StoreError::Incompatible {
                    found,
                    supported: LOG_FORMAT_VERSION,
                });
            }
        }
        let mut end = 0u64;
        while let LogRead::Entry(entry) = read_header(io.as_ref(), end)? {
            end = entry.next_offset;
        }
        if io.len()? > LOG_HEADER_LEN + end {
            debug!(end, "log.open.truncate_tail");
            io.truncate(LOG_HEADER_LEN + end)?;
        }
        debug!(end, "log.open");
        Ok(Self {
            io,
            state: Mutex::new(LogState {
                end,
                stats: LogStats::default(),
            }),
        })
    }

    /// Durably appends an entry for `version` and returns its offset.
    ///
    /// The entry is written in full with status `LogStarted`, then the status
    /// is rewritten to `LoggedThis`. With `sync` set each step is fsynced.
    /// When any step fails the log is cut back to its previous end, so a
    /// failed entry never reaches recovery.
    pub fn commit_start(&self, version: Version, updates: &[PageUpdate], sync: bool) -> Result<u64> {
        let encoded = encode_entry(version, updates)?;
        let mut state = self.state.lock();
        let offset = state.end;
        let pos = LOG_HEADER_LEN + offset;
        if let Err(err) = self.write_entry(&mut state, pos, &encoded, sync) {
            self.discard_tail(pos);
            warn!(version = version.0, offset, error = %err, "log.commit_start.failed");
            return Err(err);
        }
        state.end += encoded.len() as u64;
        state.stats.entries_appended += 1;
        state.stats.bytes_appended += encoded.len() as u64;
        debug!(
            version = version.0,
            offset,
            updates = updates.len(),
            "log.commit_start"
        );
        Ok(offset)
    }

    fn write_entry(&self, state: &mut LogState, pos: u64, encoded: &[u8], sync: bool) -> Result<()> {
        self.io.write_at(pos, encoded)?;
        if sync {
            self.io.sync_all()?;
            state.stats.syncs += 1;
        }
        self.io
            .write_at(pos + STATUS_AT as u64, &[LogStatus::LoggedThis as u8])?;
        if sync {
            self.io.sync_all()?;
            state.stats.syncs += 1;
        }
        Ok(())
    }

    /// Removes whatever a failed append left past `pos`. Falls back to
    /// zeroing the length field, which reads as the end of the log.
    fn discard_tail(&self, pos: u64) {
        let cut = self.io.truncate(pos).and_then(|()| self.io.sync_all());
        if let Err(err) = cut {
            warn!(pos, error = %err, "log.discard_tail.truncate_failed");
            if let Err(err) = self.io.write_at(pos, &[0u8; 4]) {
                warn!(pos, error = %err, "log.discard_tail.failed");
            }
        }
    }

    /// Rewrites the status byte of the entry at `offset`.
    pub fn set_status(&self, offset: u64, status: LogStatus, sync: bool) -> Result<()> {
        let mut state = self.state.lock();
        match read_header(self.io.as_ref(), offset)? {
            LogRead::Entry(_) => {}
            LogRead::Eof => return Err(StoreError::Invalid("no log entry at offset")),
        }
        self.io.write_at(
            LOG_HEADER_LEN + offset + STATUS_AT as u64,
            &[status as u8],
        )?;
        if sync {
            self.io.sync_all()?;
            state.stats.syncs += 1;
        }
        state.stats.status_updates += 1;
        debug!(offset, status = %status, "log.set_status");
        Ok(())
    }

    /// Reads the entry header at `offset`.
    pub fn read_next(&self, offset: u64) -> Result<LogRead> {
        let _state = self.state.lock();
        read_header(self.io.as_ref(), offset)
    }

    /// Decodes every update of the entry at `offset`.
    pub fn get_updates(&self, offset: u64) -> Result<Vec<PageUpdate>> {
        let _state = self.state.lock();
        let entry = match read_header(self.io.as_ref(), offset)? {
            LogRead::Entry(entry) => entry,
            LogRead::Eof => return Err(StoreError::Invalid("no log entry at offset")),
        };
        let mut buf = vec![0u8; entry.length as usize];
        self.io.read_at(LOG_HEADER_LEN + offset, &mut buf)?;
        decode_updates(&buf, entry.update_count)
    }

    /// Lists every entry from the start of the log.
    pub fn entries(&self) -> Result<Vec<LogEntryHeader>> {
        let _state = self.state.lock();
        let mut out = Vec::new();
        let mut offset = 0;
        while let LogRead::Entry(entry) = read_header(self.io.as_ref(), offset)? {
            offset = entry.next_offset;
            out.push(entry);
        }
        Ok(out)
    }

    /// Drops every entry, leaving only the header.
    pub fn reset(&self, sync: bool) -> Result<()> {
        let mut state = self.state.lock();
        self.io.truncate(LOG_HEADER_LEN)?;
        if sync {
            self.io.sync_all()?;
            state.stats.syncs += 1;
        }
        state.end = 0;
        debug!("log.reset");
        Ok(())
    }

    /// Logical end of the log, relative to the first entry.
    pub fn end_offset(&self) -> u64 {
        self.state.lock().end
    }

    /// Returns current counters.
    pub fn stats(&self) -> LogStats {
        self.state.lock().stats.clone()
    }
}

fn read_header(io: &dyn FileIo, offset: u64) -> Result<LogRead> {
    let pos = LOG_HEADER_LEN + offset;
    let physical = io.len()?;
    if pos + ENTRY_HEADER_LEN as u64 > physical {
        return Ok(LogRead::Eof);
    }
    let mut buf = [0u8; ENTRY_HEADER_LEN];
    io.read_at(pos, &mut buf)?;
    let length = be_u32(&buf, 0);
    if length == 0 {
        return Ok(LogRead::Eof);
    }
    if (length as usize) < ENTRY_HEADER_LEN {
        return Err(StoreError::Corruption("log entry shorter than its header"));
    }
    if pos + u64::from(length) > physical {
        return Ok(LogRead::Eof);
    }
    Ok(LogRead::Entry(LogEntryHeader {
        offset,
        length,
        version: Version(be_u64(&buf, 4)),
        status: LogStatus::from_u8(buf[STATUS_AT])?,
        update_count: be_u32(&buf, 13),
        next_offset: offset + u64::from(length),
    }))
}

fn encode_entry(version: Version, updates: &[PageUpdate]) -> Result<Vec<u8>> {
    let body: usize = updates
        .iter()
        .map(|update| UPDATE_HEADER_LEN + update.data.len())
        .sum();
    let total = ENTRY_HEADER_LEN + body;
    let length =
        u32::try_from(total).map_err(|_| StoreError::Invalid("log entry exceeds 4 GiB"))?;
    let count = u32::try_from(updates.len())
        .map_err(|_| StoreError::Invalid("too many updates in one commit"))?;
    let mut buf = Vec::with_capacity(total);
    buf.extend_from_slice(&length.to_be_bytes());
    buf.extend_from_slice(&version.0.to_be_bytes());
    buf.push(LogStatus::LogStarted as u8);
    buf.extend_from_slice(&count.to_be_bytes());
    for update in updates {
        let data_len = update.data.len() as u32;
        buf.extend_from_slice(&update.sequence.to_be_bytes());
        buf.extend_from_slice(&update.page_id.0.to_be_bytes());
        buf.extend_from_slice(&update.offset.to_be_bytes());
        buf.extend_from_slice(&data_len.to_be_bytes());
        buf.extend_from_slice(&update.data);
    }
    Ok(buf)
}

fn decode_updates(entry: &[u8], count: u32) -> Result<Vec<PageUpdate>> {
    let fits = (entry.len().saturating_sub(ENTRY_HEADER_LEN)) / UPDATE_HEADER_LEN;
    if count as usize > fits {
        return Err(StoreError::Corruption("log update count exceeds entry length"));
    }
    let mut out = Vec::with_capacity(count as usize);
    let mut at = ENTRY_HEADER_LEN;
    for _ in 0..count {
        if at + UPDATE_HEADER_LEN > entry.len() {
            return Err(StoreError::Corruption("log update header truncated"));
        }
        let sequence = be_u32(entry, at);
        let page_id = PageId(be_u64(entry, at + 4));
        let offset = be_u32(entry, at + 12);
        let data_len = be_u32(entry, at + 16) as usize;
        at += UPDATE_HEADER_LEN;
        if at + data_len > entry.len() {
            return Err(StoreError::Corruption("log update data truncated"));
        }
        out.push(PageUpdate::new(
            page_id,
            offset,
            sequence,
            &entry[at..at + data_len],
        ));
        at += data_len;
    }
    if at != entry.len() {
        return Err(StoreError::Corruption("log entry length mismatch"));
    }
    Ok(out)
}

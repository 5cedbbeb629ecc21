#![forbid(unsafe_code)]

use std::sync::Arc;

use crate::primitives::io::FileIo;
use crate::types::{be_u32, be_u64, Result, StoreError};

/// Newest data-file format this build understands.
pub const DATA_FORMAT_VERSION: u32 = 1;
/// Bytes reserved before page 0 of every data file.
pub const DATA_HEADER_LEN: u64 = 32;

const DATA_MAGIC: [u8; 4] = *b"PGSD";

/// Header identifying one member of a data-file set.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct DataFileHeader {
    /// Page size shared by the set.
    pub page_size: u32,
    /// Random value shared by every file of the set.
    pub set_salt: u64,
    /// Position of this file in the striping order.
    pub file_index: u32,
    /// Number of data files in the set.
    pub file_count: u32,
}

impl DataFileHeader {
    fn encode(&self) -> [u8; DATA_HEADER_LEN as usize] {
        let mut buf = [0u8; DATA_HEADER_LEN as usize];
        buf[0..4].copy_from_slice(&DATA_FORMAT_VERSION.to_be_bytes());
        buf[4..8].copy_from_slice(&self.page_size.to_be_bytes());
        buf[8..12].copy_from_slice(&DATA_MAGIC);
        buf[12..20].copy_from_slice(&self.set_salt.to_be_bytes());
        buf[20..24].copy_from_slice(&self.file_index.to_be_bytes());
        buf[24..28].copy_from_slice(&self.file_count.to_be_bytes());
        let crc = crc32fast::hash(&buf[..28]);
        buf[28..32].copy_from_slice(&crc.to_be_bytes());
        buf
    }

    fn decode(src: &[u8]) -> Result<Self> {
        if src.len() < DATA_HEADER_LEN as usize {
            return Err(StoreError::Corruption("data file header truncated"));
        }
        let version = be_u32(src, 0);
        if version > DATA_FORMAT_VERSION {
            return Err(StoreError::Incompatible {
                found: version,
                supported: DATA_FORMAT_VERSION,
            });
        }
        if src[8..12] != DATA_MAGIC {
            return Err(StoreError::Corruption("data file magic mismatch"));
        }
        if crc32fast::hash(&src[..28]) != be_u32(src, 28) {
            return Err(StoreError::Corruption("data file header crc mismatch"));
        }
        Ok(Self {
            page_size: be_u32(src, 4),
            set_salt: be_u64(src, 12),
            file_index: be_u32(src, 20),
            file_count: be_u32(src, 24),
        })
    }
}

/// Reads the header of `io`, or `None` for a file that was never initialized.
pub(crate) fn read_header(io: &dyn FileIo) -> Result<Option<DataFileHeader>> {
    if io.is_empty()? {
        return Ok(None);
    }
    let mut buf = [0u8; DATA_HEADER_LEN as usize];
    if io.len()? < DATA_HEADER_LEN {
        return Err(StoreError::Corruption("data file header truncated"));
    }
    io.read_at(0, &mut buf)?;
    DataFileHeader::decode(&buf).map(Some)
}

/// One striped member of a [`FileSet`](super::FileSet).
pub(crate) struct DataFile {
    io: Arc<dyn FileIo>,
    page_size: usize,
}

impl DataFile {
    /// Opens `io`, writing `expected` into a fresh file or checking it against an existing one.
    pub(crate) fn open(io: Arc<dyn FileIo>, expected: DataFileHeader, sync: bool) -> Result<Self> {
        match read_header(io.as_ref())? {
            None => {
                io.write_at(0, &expected.encode())?;
                if sync {
                    io.sync_all()?;
                }
            }
            Some(found) => {
                if found.page_size != expected.page_size {
                    return Err(StoreError::ConfigOwned(format!(
                        "data file {} has page size {}, expected {}",
                        expected.file_index, found.page_size, expected.page_size
                    )));
                }
                if found.file_count != expected.file_count {
                    return Err(StoreError::ConfigOwned(format!(
                        "data file {} belongs to a set of {} files, opened with {}",
                        expected.file_index, found.file_count, expected.file_count
                    )));
                }
                if found.file_index != expected.file_index {
                    return Err(StoreError::ConfigOwned(format!(
                        "data file opened at position {} was created at position {}",
                        expected.file_index, found.file_index
                    )));
                }
                if found.set_salt != expected.set_salt {
                    return Err(StoreError::Config("data file belongs to another file set"));
                }
            }
        }
        Ok(Self {
            io,
            page_size: expected.page_size as usize,
        })
    }

    fn position(&self, local_page: u64) -> u64 {
        DATA_HEADER_LEN + local_page * self.page_size as u64
    }

    /// Fills `dst` with the page; bytes past the physical end read as zero.
    pub(crate) fn read_page(&self, local_page: u64, dst: &mut [u8]) -> Result<()> {
        let pos = self.position(local_page);
        let len = self.io.len()?;
        let available = len.saturating_sub(pos).min(dst.len() as u64) as usize;
        if available > 0 {
            self.io.read_at(pos, &mut dst[..available])?;
        }
        dst[available..].fill(0);
        Ok(())
    }

    pub(crate) fn write_page(&self, local_page: u64, src: &[u8]) -> Result<()> {
        self.io.write_at(self.position(local_page), src)
    }

    pub(crate) fn sync(&self) -> Result<()> {
        self.io.sync_all()
    }
}

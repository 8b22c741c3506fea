//! A single memory-mapped file of fixed virtual size.
//!
//! Every persistent structure in the engine lives in one of these. The file
//! is created sparse at its full capacity and mapped once, so pointers into
//! it stay stable for the life of the mapping and no remap path exists.

use std::fs::File;
use std::path::Path;

use memmap2::{MmapOptions, MmapRaw};

use crate::DbError;

pub(crate) struct Mapping {
    map: MmapRaw,
    file: File,
}

impl Mapping {
    /// Open (creating if needed) `path` and map `size` bytes of it. A brand
    /// new file is extended sparsely to `size`; an existing file must be
    /// exactly `size` bytes or the open is refused.
    pub fn open(path: &Path, size: usize) -> Result<Self, DbError> {
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        let file_size = file.metadata()?.len();
        if file_size == 0 {
            file.set_len(size as u64)?;
        } else if file_size != size as u64 {
            return Err(DbError::InvalidFileFormat);
        }
        let map = MmapOptions::new().len(size).map_raw(&file)?;
        Ok(Self { map, file })
    }

    /// Like [`Self::open`], but the mapping may be larger than the file;
    /// the block allocator grows the file underneath it.
    pub fn open_sparse(path: &Path, map_size: usize) -> Result<Self, DbError> {
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        let map = MmapOptions::new().len(map_size).map_raw(&file)?;
        Ok(Self { map, file })
    }

    pub fn file(&self) -> &File {
        &self.file
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.map.as_mut_ptr()
    }

    /// Synchronously flush a byte range to disk.
    pub fn flush_range(&self, offset: usize, len: usize) -> Result<(), DbError> {
        self.map.flush_range(offset, len).map_err(DbError::Io)
    }

    /// Queue an asynchronous flush of a byte range.
    pub fn flush_async_range(&self, offset: usize, len: usize) -> Result<(), DbError> {
        self.map.flush_async_range(offset, len).map_err(DbError::Io)
    }

    pub fn flush(&self) -> Result<(), DbError> {
        self.map.flush().map_err(DbError::Io)
    }
}

// The raw map is only handed out as `*mut u8`; all concurrent access goes
// through atomics or is single-writer by protocol.
unsafe impl Send for Mapping {}
unsafe impl Sync for Mapping {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_write_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("m");
        {
            let m = Mapping::open(&path, 8192).unwrap();
            unsafe { m.as_ptr().add(100).write(0xAB) };
            m.flush().unwrap();
        }
        let m = Mapping::open(&path, 8192).unwrap();
        assert_eq!(unsafe { m.as_ptr().add(100).read() }, 0xAB);
    }

    #[test]
    fn size_mismatch_refused() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("m");
        drop(Mapping::open(&path, 4096).unwrap());
        assert!(matches!(Mapping::open(&path, 8192), Err(DbError::InvalidFileFormat)));
    }
}

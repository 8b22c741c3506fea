//! Block allocator: a mapped file that grows in fixed-size blocks.
//!
//! The whole `max_blocks * block_size` range is mapped up front, so
//! [`BlockAllocator::get`] is pointer arithmetic with no lock and no remap.
//! Growth just extends the (sparse) file under the mapping, serialized by a
//! mutex. Blocks are never returned to the file; higher layers recycle them.

use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use crate::{mapping::Mapping, DbError};

pub(crate) struct BlockAllocator {
    map: Mapping,
    block_size: usize,
    max_blocks: usize,
    num_blocks: AtomicU32,
    grow: Mutex<()>,
}

impl BlockAllocator {
    pub fn open(path: &Path, block_size: usize, max_blocks: usize) -> Result<Self, DbError> {
        let map = Mapping::open_sparse(path, block_size * max_blocks)?;
        let existing = map.file().metadata()?.len();
        if existing % block_size as u64 != 0 {
            return Err(DbError::InvalidFileFormat);
        }
        let num_blocks = (existing / block_size as u64) as u32;
        Ok(Self {
            map,
            block_size,
            max_blocks,
            num_blocks: AtomicU32::new(num_blocks),
            grow: Mutex::new(()),
        })
    }

    pub fn num_blocks(&self) -> u32 {
        self.num_blocks.load(Ordering::Acquire)
    }

    /// Grow the file by one block and return the new block's number.
    pub fn alloc(&self) -> Result<u32, DbError> {
        let _g = self.grow.lock().unwrap();
        let n = self.num_blocks.load(Ordering::Relaxed);
        if n as usize >= self.max_blocks {
            return Err(DbError::OutOfSpace(self.max_blocks));
        }
        self.map
            .file()
            .set_len((n as u64 + 1) * self.block_size as u64)?;
        self.num_blocks.store(n + 1, Ordering::Release);
        Ok(n)
    }

    /// Pointer to the start of a block. Stable until the allocator is
    /// dropped; lock-free.
    pub fn get(&self, block: u32) -> *mut u8 {
        debug_assert!(block < self.num_blocks());
        unsafe { self.map.as_ptr().add(block as usize * self.block_size) }
    }

    pub fn flush_block_range(
        &self,
        block: u32,
        offset: usize,
        len: usize,
        sync: bool,
    ) -> Result<(), DbError> {
        let base = block as usize * self.block_size + offset;
        if sync {
            self.map.flush_range(base, len)
        } else {
            self.map.flush_async_range(base, len)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grows_in_blocks() {
        let dir = tempfile::tempdir().unwrap();
        let ba = BlockAllocator::open(&dir.path().join("blocks"), 4096, 8).unwrap();
        assert_eq!(ba.num_blocks(), 0);
        assert_eq!(ba.alloc().unwrap(), 0);
        assert_eq!(ba.alloc().unwrap(), 1);
        assert_eq!(ba.num_blocks(), 2);

        unsafe {
            ba.get(0).write(1);
            ba.get(1).add(4095).write(2);
            assert_eq!(ba.get(0).read(), 1);
            assert_eq!(ba.get(1).add(4095).read(), 2);
        }
    }

    #[test]
    fn capacity_is_enforced() {
        let dir = tempfile::tempdir().unwrap();
        let ba = BlockAllocator::open(&dir.path().join("blocks"), 4096, 2).unwrap();
        ba.alloc().unwrap();
        ba.alloc().unwrap();
        assert!(matches!(ba.alloc(), Err(DbError::OutOfSpace(2))));
    }

    #[test]
    fn reopen_preserves_count() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blocks");
        {
            let ba = BlockAllocator::open(&path, 4096, 8).unwrap();
            ba.alloc().unwrap();
            ba.alloc().unwrap();
            ba.alloc().unwrap();
        }
        let ba = BlockAllocator::open(&path, 4096, 8).unwrap();
        assert_eq!(ba.num_blocks(), 3);
    }
}

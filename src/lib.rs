//! coral-db: an embedded, persistent, copy-on-write adaptive-radix-trie
//! key/value store.
//!
//! Variable-length byte keys map to byte values or to nested sub-tries.
//! Storage is a segmented log carved out of memory-mapped files; every
//! logical object address is indirected through an atomic meta slot so a
//! background compactor can relocate live objects underneath concurrent
//! readers. Writers are serialized per named root; readers pin a snapshot
//! with a per-session epoch and never block anyone.

use std::path::Path;

mod addr;
mod address_alloc;
mod block;
mod db;
mod error;
mod iter;
mod mapping;
mod meta;
mod seg_alloc;
mod segment;
mod spmc;
mod upsert;

pub use addr::Address;
pub use db::{
    Database, NodeHandle, ReadSession, RuntimeConfig, SyncType, WriteSession, WriteTransaction,
};
pub use error::DbError;
pub use iter::Iter;

/// Segments are the units the data log grows and recycles in.
#[cfg(not(test))]
pub const SEGMENT_SIZE: usize = 1 << 30;
/// Small segments under test so compaction scenarios move megabytes.
#[cfg(test)]
pub const SEGMENT_SIZE: usize = 1 << 20;

/// Upper bound on segments; also the capacity of the segment bitmaps.
pub const MAX_SEGMENT_COUNT: usize = 1 << 16;

/// Largest single object the allocator will place in a segment.
pub const MAX_OBJECT_SIZE: usize = SEGMENT_SIZE / 4;

/// Concurrently open sessions (read or write).
pub const MAX_SESSIONS: usize = 64;

/// Number of named top roots in the database header.
pub const NUM_TOP_ROOTS: usize = 488;

pub const MAX_KEY_LEN: usize = 1024;

/// Convenience: create a database with default config.
pub fn create<P: AsRef<Path>>(dir: P) -> Result<Database, DbError> {
    Database::create(dir, RuntimeConfig::default())
}

/// Convenience: open an existing database with its stored config.
pub fn open<P: AsRef<Path>>(dir: P) -> Result<Database, DbError> {
    Database::open(dir)
}

//! The mapped allocator state: everything the segment allocator persists
//! outside the data segments themselves. One `header` file holds runtime
//! config, the ready-segment buffer state, per-session read-lock slots and
//! read-cache rings, the recycled-segment ring, the provider's segment
//! bitmaps, and one [`SegmentMeta`] record per segment.

use std::path::Path;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use coral_nodes::bitmap::SegmentBitmap;

use crate::mapping::Mapping;
use crate::spmc::SpmcState;
use crate::{DbError, MAX_SEGMENT_COUNT, MAX_SESSIONS, SEGMENT_SIZE};

const STATE_MAGIC: u64 = 0x6c61_726f_6364_6273; // header file magic
const STATE_VERSION: u32 = 1;

/// msync behavior on commit and segment rollover.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
#[repr(u32)]
pub enum SyncType {
    /// Skip durability entirely; the OS writes back eventually.
    None = 0,
    /// Queue an async writeback.
    Async = 1,
    /// Synchronous flush of dirty ranges.
    #[default]
    Sync = 2,
    /// Synchronous flush including file metadata.
    Full = 3,
}

impl SyncType {
    pub(crate) fn from_u32(v: u32) -> Self {
        match v {
            1 => Self::Async,
            2 => Self::Sync,
            3 => Self::Full,
            _ => Self::None,
        }
    }
}

/// Tunables that may change while the database is open. Stored in the
/// mapped header; background threads re-read them at the top of each loop
/// iteration, so changes take effect on the next pass.
#[derive(Clone, Copy, Debug)]
pub struct RuntimeConfig {
    /// Upper bound on mlocked (pinned) segment memory, in MiB.
    pub max_pinned_cache_size_mb: u64,
    /// Window over which every region's read bits decay once.
    pub cache_frequency_window_ms: u64,
    pub sync_mode: SyncType,
    pub checksum_on_modify: bool,
    pub checksum_on_compact: bool,
    pub validate_on_compact: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_pinned_cache_size_mb: 4096,
            cache_frequency_window_ms: 60_000,
            sync_mode: SyncType::Sync,
            checksum_on_modify: false,
            checksum_on_compact: true,
            validate_on_compact: false,
        }
    }
}

impl RuntimeConfig {
    pub(crate) fn max_pinned_segments(&self) -> usize {
        (self.max_pinned_cache_size_mb as usize * (1 << 20)) / SEGMENT_SIZE
    }
}

#[repr(C)]
pub(crate) struct ConfigState {
    max_pinned_cache_size_mb: AtomicU64,
    cache_frequency_window_ms: AtomicU64,
    sync_mode: AtomicU32,
    checksum_on_modify: AtomicU32,
    checksum_on_compact: AtomicU32,
    validate_on_compact: AtomicU32,
}

impl ConfigState {
    pub fn store(&self, c: &RuntimeConfig) {
        self.max_pinned_cache_size_mb
            .store(c.max_pinned_cache_size_mb, Ordering::Relaxed);
        self.cache_frequency_window_ms
            .store(c.cache_frequency_window_ms, Ordering::Relaxed);
        self.sync_mode.store(c.sync_mode as u32, Ordering::Relaxed);
        self.checksum_on_modify
            .store(c.checksum_on_modify as u32, Ordering::Relaxed);
        self.checksum_on_compact
            .store(c.checksum_on_compact as u32, Ordering::Relaxed);
        self.validate_on_compact
            .store(c.validate_on_compact as u32, Ordering::Release);
    }

    pub fn load(&self) -> RuntimeConfig {
        RuntimeConfig {
            max_pinned_cache_size_mb: self.max_pinned_cache_size_mb.load(Ordering::Relaxed),
            cache_frequency_window_ms: self.cache_frequency_window_ms.load(Ordering::Relaxed),
            sync_mode: SyncType::from_u32(self.sync_mode.load(Ordering::Relaxed)),
            checksum_on_modify: self.checksum_on_modify.load(Ordering::Relaxed) != 0,
            checksum_on_compact: self.checksum_on_compact.load(Ordering::Relaxed) != 0,
            validate_on_compact: self.validate_on_compact.load(Ordering::Relaxed) != 0,
        }
    }
}

const STATE_IS_ALLOC: u64 = 1 << 32;
const STATE_IS_PINNED: u64 = 1 << 33;
const FREE_SPACE_MASK: u64 = u32::MAX as u64;

/// Per-segment bookkeeping, one 64-byte record per segment. The segment
/// body holds only object data; everything else lives here so recycling a
/// segment never touches its gigabyte of pages.
#[repr(C, align(64))]
pub(crate) struct SegmentMeta {
    /// Bump pointer: bytes of the segment consumed by allocation. Stays at
    /// its final value once the segment seals (the walk bound).
    alloc_pos: AtomicU32,
    /// Highest offset known durable on disk.
    last_sync_pos: AtomicU32,
    /// free_space (low 32) | is_alloc | is_pinned
    state: AtomicU64,
    /// Activation order stamp; `u64::MAX` = not currently active.
    age: AtomicU64,
    /// Weighted virtual-age accumulator: compacted destinations inherit the
    /// average age of their sources, keeping cold data together.
    vage_sum: AtomicU64,
    vage_weight: AtomicU64,
    _reserved: [u64; 2],
}

impl SegmentMeta {
    pub fn data_end(&self) -> u32 {
        self.alloc_pos.load(Ordering::Acquire)
    }

    pub fn last_sync_pos(&self) -> u32 {
        self.last_sync_pos.load(Ordering::Acquire)
    }

    pub fn set_last_sync_pos(&self, pos: u32) {
        self.last_sync_pos.store(pos, Ordering::Release);
    }

    /// Reserve `size` bytes; `None` when the segment can't fit them.
    pub fn try_bump(&self, size: u32) -> Option<u32> {
        self.alloc_pos
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |pos| {
                (pos as usize + size as usize <= SEGMENT_SIZE).then(|| pos + size)
            })
            .ok()
    }

    /// Roll back the most recent bump (lost move race).
    pub fn unbump(&self, size: u32) {
        self.alloc_pos.fetch_sub(size, Ordering::AcqRel);
    }

    pub fn free_space(&self) -> u32 {
        (self.state.load(Ordering::Acquire) & FREE_SPACE_MASK) as u32
    }

    /// Credit bytes of dead object.
    pub fn add_free_space(&self, bytes: u32) {
        self.state.fetch_add(bytes as u64, Ordering::AcqRel);
    }

    /// Overwrite the free-space counter, keeping the flag bits. Recovery
    /// uses this after recomputing live bytes from a root walk.
    pub fn set_free_space(&self, bytes: u32) {
        let mut cur = self.state.load(Ordering::Acquire);
        loop {
            let next = (cur & !FREE_SPACE_MASK) | bytes as u64;
            match self.state.compare_exchange_weak(cur, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return,
                Err(w) => cur = w,
            }
        }
    }

    pub fn is_alloc(&self) -> bool {
        self.state.load(Ordering::Acquire) & STATE_IS_ALLOC != 0
    }

    pub fn set_alloc(&self, v: bool) {
        if v {
            self.state.fetch_or(STATE_IS_ALLOC, Ordering::AcqRel);
        } else {
            self.state.fetch_and(!STATE_IS_ALLOC, Ordering::AcqRel);
        }
    }

    pub fn is_pinned(&self) -> bool {
        self.state.load(Ordering::Acquire) & STATE_IS_PINNED != 0
    }

    pub fn set_pinned(&self, v: bool) {
        if v {
            self.state.fetch_or(STATE_IS_PINNED, Ordering::AcqRel);
        } else {
            self.state.fetch_and(!STATE_IS_PINNED, Ordering::AcqRel);
        }
    }

    pub fn age(&self) -> u64 {
        self.age.load(Ordering::Acquire)
    }

    /// Weighted average age of the data in this segment, in ms.
    pub fn vage(&self) -> u64 {
        let w = self.vage_weight.load(Ordering::Acquire);
        if w == 0 {
            return 0;
        }
        self.vage_sum.load(Ordering::Acquire) / w
    }

    /// Fold a data age sample into the accumulator, weighted by bytes.
    pub fn absorb_vage(&self, age_ms: u64, weight: u64) {
        self.vage_sum.fetch_add(age_ms.saturating_mul(weight), Ordering::AcqRel);
        self.vage_weight.fetch_add(weight, Ordering::AcqRel);
    }

    /// Make the segment active for allocation.
    pub fn activate(&self, age: u64, now_ms: u64) {
        self.alloc_pos.store(0, Ordering::Relaxed);
        self.last_sync_pos.store(0, Ordering::Relaxed);
        let pinned = self.is_pinned();
        self.state.store(
            STATE_IS_ALLOC | if pinned { STATE_IS_PINNED } else { 0 },
            Ordering::Relaxed,
        );
        self.vage_sum.store(now_ms, Ordering::Relaxed);
        self.vage_weight.store(1, Ordering::Relaxed);
        self.age.store(age, Ordering::Release);
    }

    /// Reset after compaction emptied the segment; pinned state survives.
    pub fn finish_compaction(&self) {
        let pinned = self.is_pinned();
        self.alloc_pos.store(0, Ordering::Relaxed);
        self.state
            .store(if pinned { STATE_IS_PINNED } else { 0 }, Ordering::Relaxed);
        self.vage_sum.store(0, Ordering::Relaxed);
        self.vage_weight.store(0, Ordering::Relaxed);
        self.age.store(u64::MAX, Ordering::Release);
    }
}

/// Epoch value meaning "session holds no read lock".
pub(crate) const EPOCH_IDLE: u64 = u64::MAX;

pub(crate) const RCACHE_CAPACITY: usize = 254;

/// Per-session single-producer/single-consumer ring of recently read
/// addresses, drained by the compactor for read-cache promotion. The
/// session is the producer; overflow just drops candidates.
#[repr(C)]
pub(crate) struct RcacheRing {
    head: AtomicU32,
    tail: AtomicU32,
    buf: [AtomicU32; RCACHE_CAPACITY],
}

impl RcacheRing {
    pub fn push(&self, v: u32) -> bool {
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Relaxed);
        if tail.wrapping_sub(head) as usize >= RCACHE_CAPACITY {
            return false;
        }
        self.buf[tail as usize % RCACHE_CAPACITY].store(v, Ordering::Relaxed);
        self.tail.store(tail.wrapping_add(1), Ordering::Release);
        true
    }

    pub fn pop(&self) -> Option<u32> {
        let tail = self.tail.load(Ordering::Acquire);
        let head = self.head.load(Ordering::Relaxed);
        if head == tail {
            return None;
        }
        let v = self.buf[head as usize % RCACHE_CAPACITY].load(Ordering::Relaxed);
        self.head.store(head.wrapping_add(1), Ordering::Release);
        Some(v)
    }
}

#[repr(C)]
pub(crate) struct SessionData {
    /// Bit set = session number in use.
    allocated: AtomicU64,
    epochs: [AtomicU64; MAX_SESSIONS],
    rcache: [RcacheRing; MAX_SESSIONS],
}

impl SessionData {
    /// Claim a session number, or `None` when all are taken.
    pub fn alloc_session(&self) -> Option<u32> {
        loop {
            let bm = self.allocated.load(Ordering::Acquire);
            let free = !bm;
            if free == 0 {
                return None;
            }
            let n = free.trailing_zeros();
            if self
                .allocated
                .compare_exchange_weak(bm, bm | (1 << n), Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                self.epochs[n as usize].store(EPOCH_IDLE, Ordering::Release);
                return Some(n);
            }
        }
    }

    pub fn release_session(&self, n: u32) {
        self.epochs[n as usize].store(EPOCH_IDLE, Ordering::Release);
        self.allocated.fetch_and(!(1u64 << n), Ordering::AcqRel);
    }

    pub fn epoch(&self, n: u32) -> &AtomicU64 {
        &self.epochs[n as usize]
    }

    pub fn rcache(&self, n: u32) -> &RcacheRing {
        &self.rcache[n as usize]
    }

    pub fn active_sessions(&self) -> u32 {
        self.allocated.load(Ordering::Acquire).count_ones()
    }

    /// The oldest (minimum) epoch across live sessions; [`EPOCH_IDLE`] when
    /// nobody holds a read lock.
    pub fn min_epoch(&self) -> u64 {
        let mut bm = self.allocated.load(Ordering::Acquire);
        let mut min = EPOCH_IDLE;
        while bm != 0 {
            let n = bm.trailing_zeros() as usize;
            bm &= bm - 1;
            min = min.min(self.epochs[n].load(Ordering::SeqCst));
        }
        min
    }

    /// Clear all session slots; used on open since sessions never outlive
    /// the process.
    pub fn reset(&self) {
        self.allocated.store(0, Ordering::Relaxed);
        for e in &self.epochs {
            e.store(EPOCH_IDLE, Ordering::Relaxed);
        }
        for r in &self.rcache {
            r.head.store(0, Ordering::Relaxed);
            r.tail.store(0, Ordering::Relaxed);
        }
    }
}

pub(crate) const RECYCLE_CAPACITY: usize = 1024;

/// Ring of `(freed_epoch, segment)` pairs: compactor pushes, provider pops
/// once every session epoch has moved past the freeing epoch.
#[repr(C)]
pub(crate) struct RecycleRing {
    head: AtomicU64,
    tail: AtomicU64,
    entries: [AtomicU64; RECYCLE_CAPACITY],
}

fn recycle_entry(segment: u32, epoch: u64) -> u64 {
    debug_assert!(segment < MAX_SEGMENT_COUNT as u32);
    epoch << 16 | segment as u64
}

impl RecycleRing {
    pub fn push(&self, segment: u32, epoch: u64) -> bool {
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Relaxed);
        if tail.wrapping_sub(head) as usize >= RECYCLE_CAPACITY {
            return false;
        }
        self.entries[tail as usize % RECYCLE_CAPACITY]
            .store(recycle_entry(segment, epoch), Ordering::Relaxed);
        self.tail.store(tail.wrapping_add(1), Ordering::Release);
        true
    }

    /// Pop the next segment whose freeing epoch is strictly below
    /// `min_epoch`; the ring is ordered by epoch, so the head decides.
    pub fn pop_available(&self, min_epoch: u64) -> Option<u32> {
        let tail = self.tail.load(Ordering::Acquire);
        let head = self.head.load(Ordering::Relaxed);
        if head == tail {
            return None;
        }
        let e = self.entries[head as usize % RECYCLE_CAPACITY].load(Ordering::Relaxed);
        if e >> 16 >= min_epoch {
            return None;
        }
        self.head.store(head.wrapping_add(1), Ordering::Release);
        Some((e & 0xFFFF) as u32)
    }

    pub fn len(&self) -> usize {
        let tail = self.tail.load(Ordering::Acquire);
        let head = self.head.load(Ordering::Acquire);
        tail.wrapping_sub(head) as usize
    }
}

/// Segment-provider private state. Only the provider thread mutates the
/// bitmaps; the counters mirror them for stats readers.
#[repr(C)]
pub(crate) struct ProviderState {
    pub free_segments: SegmentBitmap,
    pub mlock_segments: SegmentBitmap,
    pub free_count: AtomicU32,
    pub mlock_count: AtomicU32,
}

/// The whole mapped header file.
#[repr(C)]
pub(crate) struct AllocatorState {
    magic: u64,
    version: u32,
    _pad0: u32,
    pub config: ConfigState,
    pub next_alloc_age: AtomicU64,
    pub next_clear_read_bit_region: AtomicU32,
    _pad1: u32,
    /// Monotone count of segments ever recycled: the read-lock epoch clock.
    pub segments_freed: AtomicU64,
    pub total_promoted_bytes: AtomicU64,
    pub ready: SpmcState,
    pub sessions: SessionData,
    pub recycle: RecycleRing,
    pub provider: ProviderState,
    pub meta: [SegmentMeta; MAX_SEGMENT_COUNT],
}

fn state_file_size() -> usize {
    let sz = std::mem::size_of::<AllocatorState>();
    let page = page_size::get();
    (sz + page - 1) & !(page - 1)
}

pub(crate) struct StateFile {
    map: Mapping,
}

impl StateFile {
    /// Open (creating and initializing if fresh) the header file.
    pub fn open(path: &Path, config: &RuntimeConfig) -> Result<Self, DbError> {
        let map = Mapping::open(path, state_file_size())?;
        let file = Self { map };
        let s = file.state();
        if s.magic == 0 {
            s.config.store(config);
            s.next_clear_read_bit_region.store(1, Ordering::Relaxed);
            crate::spmc::Spmc::new(&s.ready, &crate::spmc::SpmcSync::default()).reset();
            s.sessions.reset();
            unsafe {
                let p = file.map.as_ptr() as *mut u64;
                p.add(1).write(STATE_VERSION as u64);
                p.write(STATE_MAGIC);
            }
        } else if s.magic != STATE_MAGIC {
            return Err(DbError::InvalidFileFormat);
        } else {
            // sessions are process-scoped; stale slots from a dead process
            // must not hold the epoch clock back
            s.sessions.reset();
        }
        Ok(file)
    }

    pub fn state(&self) -> &AllocatorState {
        unsafe { &*(self.map.as_ptr() as *const AllocatorState) }
    }

    pub fn flush(&self) -> Result<(), DbError> {
        self.map.flush()
    }
}

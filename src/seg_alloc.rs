//! The segment allocator: serves writes into an active segment per session,
//! recycles emptied segments through the provider thread, compacts dead
//! space, pins hot segments in RAM, and decays read bits.
//!
//! Three background threads run here (segment provider, compactor, read-bit
//! decay). Each pass is also callable inline, which is how the tests drive
//! the machinery deterministically.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use coral_nodes::binary::BinaryNode;
use coral_nodes::bitmap::SegmentBitmap;
use coral_nodes::{NodeHeader, NodeType, OBJECT_ALIGN};

use crate::address_alloc::AddressAlloc;
use crate::block::BlockAllocator;
use crate::meta::{MetaSlot, MetaWord, MoveResult, SegmentLoc};
use crate::segment::{AllocatorState, RuntimeConfig, StateFile, SyncType, EPOCH_IDLE};
use crate::spmc::{AckMode, Spmc, SpmcSync};
use crate::{Address, DbError, MAX_OBJECT_SIZE, MAX_SEGMENT_COUNT, MAX_SESSIONS, SEGMENT_SIZE};

/// How many candidate segments one compactor pass will take on.
const COMPACT_PINNED_BATCH: usize = 16;
const COMPACT_UNPINNED_BATCH: usize = 4;

pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Compute an object's checksum: xxh3 over everything after the checksum
/// field, truncated and never zero (zero means "unset").
pub(crate) fn object_checksum(hdr: *const NodeHeader) -> u32 {
    let size = unsafe { (*hdr).size() };
    let bytes = unsafe { std::slice::from_raw_parts((hdr as *const u8).add(4), size - 4) };
    let h = xxhash_rust::xxh3::xxh3_64(bytes) as u32;
    if h == 0 {
        1
    } else {
        h
    }
}

pub(crate) fn checksum_ok(hdr: *const NodeHeader) -> bool {
    let stored = unsafe { (*hdr).checksum };
    stored == 0 || stored == object_checksum(hdr)
}

pub(crate) struct SegAllocator {
    state_file: StateFile,
    segs: BlockAllocator,
    pub addrs: AddressAlloc,
    spmc_sync: SpmcSync,
    /// Serializes provider passes (thread + inline test drivers).
    provider_lock: Mutex<()>,
    /// Serializes msync sweeps.
    sync_lock: Mutex<()>,
    threads_running: AtomicBool,
    should_stop: Arc<AtomicBool>,
    threads: Mutex<Vec<std::thread::JoinHandle<()>>>,
}

impl SegAllocator {
    pub fn open(dir: &std::path::Path, config: &RuntimeConfig) -> Result<Arc<Self>, DbError> {
        let state_file = StateFile::open(&dir.join("header"), config)?;
        let segs = BlockAllocator::open(&dir.join("segs"), SEGMENT_SIZE, MAX_SEGMENT_COUNT)?;
        let addrs = AddressAlloc::open(dir)?;
        Ok(Arc::new(Self {
            state_file,
            segs,
            addrs,
            spmc_sync: SpmcSync::default(),
            provider_lock: Mutex::new(()),
            sync_lock: Mutex::new(()),
            threads_running: AtomicBool::new(false),
            should_stop: Arc::new(AtomicBool::new(false)),
            threads: Mutex::new(Vec::new()),
        }))
    }

    pub fn state(&self) -> &AllocatorState {
        self.state_file.state()
    }

    pub fn config(&self) -> RuntimeConfig {
        self.state().config.load()
    }

    pub fn ready(&self) -> Spmc<'_> {
        Spmc::new(&self.state().ready, &self.spmc_sync)
    }

    pub fn segment_ptr(&self, seg: u32) -> *mut u8 {
        self.segs.get(seg)
    }

    pub fn num_segments(&self) -> u32 {
        self.segs.num_blocks()
    }

    /// Raw object header pointer for a physical location.
    pub fn object_ptr(&self, loc: SegmentLoc) -> *mut NodeHeader {
        debug_assert!(loc.offset as usize + 64 <= SEGMENT_SIZE);
        unsafe { self.segment_ptr(loc.segment).add(loc.offset as usize) as *mut NodeHeader }
    }

    pub fn flush_header(&self) -> Result<(), DbError> {
        self.state_file.flush()
    }

    // ---- background threads ----------------------------------------------

    pub fn start_threads(self: &Arc<Self>) {
        if self.threads_running.swap(true, Ordering::AcqRel) {
            return;
        }
        self.should_stop.store(false, Ordering::Release);
        let mut threads = self.threads.lock().unwrap();

        let me = self.clone();
        let stop = self.should_stop.clone();
        threads.push(
            std::thread::Builder::new()
                .name("coral-provider".into())
                .spawn(move || {
                    while !stop.load(Ordering::Acquire) {
                        if !me.provider_pass().unwrap_or(false) {
                            std::thread::sleep(Duration::from_millis(1));
                        }
                    }
                })
                .expect("spawn provider thread"),
        );

        let me = self.clone();
        let stop = self.should_stop.clone();
        threads.push(
            std::thread::Builder::new()
                .name("coral-compactor".into())
                .spawn(move || {
                    let ses = SegAllocSession::new(&me);
                    while !stop.load(Ordering::Acquire) {
                        match me.compactor_pass(&ses) {
                            Ok(true) => {}
                            Ok(false) => std::thread::sleep(Duration::from_millis(10)),
                            Err(DbError::Interrupted) => break,
                            Err(e) => {
                                log::warn!("compactor pass failed: {e}");
                                std::thread::sleep(Duration::from_millis(100));
                            }
                        }
                    }
                })
                .expect("spawn compactor thread"),
        );

        let me = self.clone();
        let stop = self.should_stop.clone();
        threads.push(
            std::thread::Builder::new()
                .name("coral-read-decay".into())
                .spawn(move || {
                    while !stop.load(Ordering::Acquire) {
                        let window = me.config().cache_frequency_window_ms;
                        let regions = me.addrs.num_regions().max(1) as u64;
                        let tick = (window / regions).max(10);
                        std::thread::sleep(Duration::from_millis(tick));
                        me.decay_pass();
                    }
                })
                .expect("spawn read-decay thread"),
        );
    }

    pub fn stop_threads(&self) {
        if !self.threads_running.swap(false, Ordering::AcqRel) {
            return;
        }
        self.should_stop.store(true, Ordering::Release);
        self.ready().wake_blocked();
        let mut threads = self.threads.lock().unwrap();
        for t in threads.drain(..) {
            let _ = t.join();
        }
        self.ready().clear_interrupt();
    }

    pub fn threads_running(&self) -> bool {
        self.threads_running.load(Ordering::Acquire)
    }

    // ---- segment provider -------------------------------------------------

    /// One provider iteration. Returns whether any work happened.
    pub fn provider_pass(&self) -> Result<bool, DbError> {
        let _g = self.provider_lock.lock().unwrap();
        let s = self.state();
        let cfg = s.config.load();
        let max_pinned = cfg.max_pinned_segments();
        // Safety: bitmap mutation is provider-only and we hold the provider
        // lock for the whole pass.
        let (free, mlock) = unsafe {
            let p = &s.provider as *const _ as *mut crate::segment::ProviderState;
            (&mut (*p).free_segments, &mut (*p).mlock_segments)
        };
        let mut did = false;

        // 1. drain recycled segments whose freeing epoch every session has
        //    passed
        let min_epoch = s.sessions.min_epoch();
        while let Some(seg) = s.recycle.pop_available(min_epoch) {
            free.set(seg as usize);
            did = true;
        }

        // 2. shed pinned segments beyond the cap, oldest data first
        while mlock.count() > max_pinned {
            let mut oldest: Option<(u64, usize)> = None;
            let mut it = mlock.first_set();
            while let Some(seg) = it {
                let vage = s.meta[seg].vage();
                if oldest.map_or(true, |(v, _)| vage < v) {
                    oldest = Some((vage, seg));
                }
                it = mlock.next_set(seg + 1);
            }
            let Some((_, seg)) = oldest else { break };
            self.munlock_segment(seg as u32);
            mlock.reset(seg);
            s.meta[seg].set_pinned(false);
            did = true;
        }

        // 3. acknowledge consumed ready slots; mlock what fits
        for seg in self.ready().pop_ack() {
            let seg = seg as usize;
            did = true;
            if mlock.count() < max_pinned && !mlock.test(seg) {
                if self.mlock_segment(seg as u32) {
                    mlock.set(seg);
                    s.meta[seg].set_pinned(true);
                } else {
                    s.meta[seg].set_pinned(false);
                }
            }
        }

        // 4. keep the ready buffer stocked, preferring already-pinned free
        //    segments (pushed to the front)
        while self.ready().can_push() {
            let mut pick = None;
            let mut it = free.first_set();
            while let Some(seg) = it {
                if mlock.test(seg) {
                    pick = Some((seg as u32, true));
                    break;
                }
                it = free.next_set(seg + 1);
            }
            let (seg, pinned) = match pick {
                Some(p) => p,
                None => match free.first_set() {
                    Some(seg) => (seg as u32, false),
                    None => (self.segs.alloc()?, false),
                },
            };
            free.reset(seg as usize);
            s.meta[seg as usize].activate(s.next_alloc_age.fetch_add(1, Ordering::AcqRel), now_ms());
            let pushed = if pinned {
                self.ready().push_front(seg as u64)
            } else {
                self.ready().push(seg as u64)
            };
            if pushed.is_none() {
                // watermark refused it; put everything back
                s.meta[seg as usize].set_alloc(false);
                s.meta[seg as usize].finish_compaction();
                free.set(seg as usize);
                break;
            }
            did = true;
        }

        s.provider.free_count.store(free.count() as u32, Ordering::Relaxed);
        s.provider.mlock_count.store(mlock.count() as u32, Ordering::Relaxed);
        Ok(did)
    }

    fn mlock_segment(&self, seg: u32) -> bool {
        let r = unsafe { libc::mlock(self.segment_ptr(seg) as *const libc::c_void, SEGMENT_SIZE) };
        if r != 0 {
            log::warn!(
                "mlock of segment {seg} failed: {}; leaving it unpinned",
                std::io::Error::last_os_error()
            );
            return false;
        }
        true
    }

    fn munlock_segment(&self, seg: u32) {
        let r =
            unsafe { libc::munlock(self.segment_ptr(seg) as *const libc::c_void, SEGMENT_SIZE) };
        if r != 0 {
            log::warn!("munlock of segment {seg} failed: {}", std::io::Error::last_os_error());
        }
    }

    // ---- read-bit decay ---------------------------------------------------

    /// Clear the read bits of one region, advancing the region cursor.
    pub fn decay_pass(&self) {
        let regions = self.addrs.num_regions().max(2) as u32;
        let region = self
            .state()
            .next_clear_read_bit_region
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |r| {
                Some(if r + 1 >= regions { 1 } else { r + 1 })
            })
            .unwrap();
        self.addrs.clear_some_read_bits(region as u16, 1);
    }

    // ---- sync -------------------------------------------------------------

    /// Flush one segment's unsynced range and mark the covered objects
    /// const (durable ⇒ copy-on-write from now on).
    pub fn sync_segment(&self, seg: u32, st: SyncType) {
        if st == SyncType::None {
            return;
        }
        let meta = &self.state().meta[seg as usize];
        let end = meta.data_end();
        let last = meta.last_sync_pos();
        if end <= last {
            return;
        }
        // restart from the start of the page last_sync landed in; the tail
        // of that page may have been rewritten since
        let page_mask = !(page_size::get() as u32 - 1);
        let start = last & page_mask;
        if let Err(e) = self.segs.flush_block_range(
            seg,
            start as usize,
            (end - start) as usize,
            st != SyncType::Async,
        ) {
            log::warn!("msync of segment {seg} [{start}, {end}) failed: {e}");
            return;
        }
        meta.set_last_sync_pos(end);
        self.mark_const_range(seg, end);
    }

    fn mark_const_range(&self, seg: u32, end: u32) {
        self.walk_segment(seg, end, |off, hdr| {
            let addr = Address::from_u32(hdr.address());
            if let Ok(slot) = self.addrs.get(addr) {
                let cur = SegmentLoc { segment: seg, offset: off };
                let w = slot.load();
                if w.ref_count() > 0 && w.loc() == Some(cur) {
                    slot.set_const();
                }
            }
        });
    }

    /// Flush every segment with dirty bytes, serialized by the sync mutex.
    pub fn sync(&self, st: SyncType) {
        if st == SyncType::None {
            return;
        }
        let _g = self.sync_lock.lock().unwrap();
        for seg in 0..self.num_segments() {
            self.sync_segment(seg, st);
        }
    }

    /// Walk object headers in `[0, end)` of a segment.
    pub fn walk_segment(&self, seg: u32, end: u32, mut f: impl FnMut(u32, &NodeHeader)) {
        let base = self.segment_ptr(seg);
        let mut off = 0u32;
        while off < end {
            let hdr = unsafe { &*(base.add(off as usize) as *const NodeHeader) };
            let size = hdr.size();
            if size == 0 || size % OBJECT_ALIGN != 0 || off as usize + size > SEGMENT_SIZE {
                break;
            }
            f(off, hdr);
            off += size as u32;
        }
    }

    // ---- compactor --------------------------------------------------------

    /// One compactor iteration: promote read-cache traffic, then compact the
    /// best pinned candidate and the best unpinned candidate.
    pub fn compactor_pass(&self, ses: &SegAllocSession) -> Result<bool, DbError> {
        let mut did = self.promote_rcache(ses)?;
        for seg in self.compact_candidates(true, COMPACT_PINNED_BATCH) {
            self.compact_segment(ses, seg)?;
            did = true;
        }
        did |= self.promote_rcache(ses)?;
        for seg in self.compact_candidates(false, COMPACT_UNPINNED_BATCH) {
            self.compact_segment(ses, seg)?;
            did = true;
        }
        Ok(did)
    }

    /// Sealed segments worth compacting: pinned ones above 1/8 dead space,
    /// unpinned above 1/2. Oldest data first.
    fn compact_candidates(&self, pinned: bool, limit: usize) -> Vec<u32> {
        let s = self.state();
        let threshold = if pinned { SEGMENT_SIZE / 8 } else { SEGMENT_SIZE / 2 } as u32;
        let mut found: Vec<(u64, u32)> = Vec::new();
        for seg in 0..self.num_segments() {
            let m = &s.meta[seg as usize];
            if m.is_alloc() || m.age() == u64::MAX || m.is_pinned() != pinned {
                continue;
            }
            if m.free_space() < threshold {
                continue;
            }
            found.push((m.vage(), seg));
        }
        found.sort_unstable();
        found.truncate(limit);
        found.into_iter().map(|(_, seg)| seg).collect()
    }

    /// Relocate every live object out of `seg`, then push it for recycling.
    pub fn compact_segment(&self, ses: &SegAllocSession, seg: u32) -> Result<(), DbError> {
        let cfg = self.config();
        let s = self.state();
        let smeta = &s.meta[seg as usize];
        let src_vage = smeta.vage();
        let end = smeta.data_end();
        let mut moved_bytes = 0u64;
        let mut failed = false;

        let mut dest_seg = ses.active_segment();
        self.walk_segment(seg, end, |off, hdr| {
            if failed {
                return;
            }
            let addr = Address::from_u32(hdr.address());
            let Ok(slot) = self.addrs.get(addr) else {
                return;
            };
            let w = slot.load();
            let cur = SegmentLoc { segment: seg, offset: off };
            // dead, moved, or the address got reused for another object
            if w.ref_count() == 0 || w.loc() != Some(cur) {
                return;
            }
            let size = hdr.size();
            let Ok((new_loc, new_hdr)) =
                ses.alloc_data(size, addr, hdr.seq(), w.node_type().unwrap_or(NodeType::Value), Some(src_vage))
            else {
                // can't place the copy (interrupted / out of space): the
                // segment still holds live data and must not be recycled
                failed = true;
                return;
            };
            // rolling into a fresh destination syncs the filled one first
            if dest_seg != ses.active_segment() {
                if let Some(prev) = dest_seg {
                    self.sync_segment(prev, cfg.sync_mode);
                }
                dest_seg = ses.active_segment();
            }
            if !slot.try_start_move(cur) {
                ses.unalloc(new_loc, size);
                return;
            }
            unsafe {
                if w.node_type() == Some(NodeType::Binary) {
                    // type-specific copy drops the dead space
                    let src = BinaryNode::from_header(hdr);
                    let dst =
                        std::slice::from_raw_parts_mut(new_hdr as *mut u8, size);
                    src.clone_into(dst, addr.to_u32(), hdr.seq(), None);
                } else {
                    std::ptr::copy_nonoverlapping(
                        hdr as *const NodeHeader as *const u8,
                        new_hdr as *mut u8,
                        size,
                    );
                }
                if cfg.checksum_on_compact && (*new_hdr).checksum == 0 {
                    (*new_hdr).checksum = object_checksum(new_hdr);
                }
                if cfg.validate_on_compact && !checksum_ok(new_hdr) {
                    log::warn!("checksum mismatch compacting {addr} out of segment {seg}");
                }
            }
            match slot.try_move(cur, new_loc) {
                MoveResult::Moved => moved_bytes += size as u64,
                MoveResult::Raced => ses.unalloc(new_loc, size),
            }
        });

        if failed {
            return Err(DbError::Interrupted);
        }
        // live data moved out; make sure it is durable before the segment
        // can ever be handed back out
        if let Some(dest) = ses.active_segment() {
            self.sync_segment(dest, cfg.sync_mode);
        }
        log::info!(
            "compacted segment {seg}: {moved_bytes} live bytes relocated, {} were free",
            smeta.free_space()
        );
        smeta.finish_compaction();
        let epoch = s.segments_freed.fetch_add(1, Ordering::AcqRel);
        while !s.recycle.push(seg, epoch) {
            // ring full: the provider is behind; give it a moment
            std::thread::yield_now();
        }
        Ok(())
    }

    /// Drain every session's read-cache ring, copying hot objects into the
    /// compactor session's current segment.
    pub fn promote_rcache(&self, ses: &SegAllocSession) -> Result<bool, DbError> {
        let s = self.state();
        let mut did = false;
        for snum in 0..MAX_SESSIONS as u32 {
            let ring = s.sessions.rcache(snum);
            while let Some(raw) = ring.pop() {
                did = true;
                let addr = Address::from_u32(raw);
                let Ok(slot) = self.addrs.get(addr) else {
                    continue;
                };
                self.try_move_header(ses, addr, slot);
                slot.end_pending_cache();
            }
        }
        Ok(did)
    }

    /// Read-cache promotion of one object; best-effort.
    fn try_move_header(&self, ses: &SegAllocSession, addr: Address, slot: &MetaSlot) {
        let s = self.state();
        let w = slot.load();
        let (Some(loc), true) = (w.loc(), w.ref_count() > 0) else {
            return;
        };
        let seg_meta = &s.meta[loc.segment as usize];
        if seg_meta.is_pinned() || seg_meta.is_alloc() {
            return; // already hot
        }
        let hdr = self.object_ptr(loc);
        let size = unsafe { (*hdr).size() };
        let seq = unsafe { (*hdr).seq() };
        let Ok((new_loc, new_hdr)) = ses.alloc_data(
            size,
            addr,
            seq,
            w.node_type().unwrap_or(NodeType::Value),
            Some(seg_meta.vage()),
        ) else {
            return;
        };
        if !slot.try_start_move(loc) {
            ses.unalloc(new_loc, size);
            return;
        }
        unsafe {
            std::ptr::copy_nonoverlapping(hdr as *const u8, new_hdr as *mut u8, size);
        }
        match slot.try_move(loc, new_loc) {
            MoveResult::Moved => {
                s.total_promoted_bytes.fetch_add(size as u64, Ordering::Relaxed);
                seg_meta.add_free_space(size as u32);
            }
            MoveResult::Raced => ses.unalloc(new_loc, size),
        }
    }
}

impl Drop for SegAllocator {
    fn drop(&mut self) {
        self.stop_threads();
    }
}

// ---- sessions -------------------------------------------------------------

/// A per-thread handle onto the allocator: owns a session number, at most
/// one active segment, and the read-lock epoch slot.
pub(crate) struct SegAllocSession {
    alloc: Arc<SegAllocator>,
    num: u32,
    active: std::cell::Cell<Option<u32>>,
    lock_depth: std::cell::Cell<u32>,
}

impl SegAllocSession {
    pub fn new(alloc: &Arc<SegAllocator>) -> Self {
        let num = alloc
            .state()
            .sessions
            .alloc_session()
            .expect("out of session slots");
        Self {
            alloc: alloc.clone(),
            num,
            active: std::cell::Cell::new(None),
            lock_depth: std::cell::Cell::new(0),
        }
    }

    pub fn allocator(&self) -> &Arc<SegAllocator> {
        &self.alloc
    }

    pub fn active_segment(&self) -> Option<u32> {
        self.active.get()
    }

    /// Pin the recycle epoch: while the returned guard lives, no segment
    /// freed from now on can be handed back out.
    pub fn lock(&self) -> ReadLock<'_> {
        let depth = self.lock_depth.get();
        if depth == 0 {
            let epoch = self.alloc.state().segments_freed.load(Ordering::SeqCst);
            self.alloc
                .state()
                .sessions
                .epoch(self.num)
                .store(epoch, Ordering::SeqCst);
        }
        self.lock_depth.set(depth + 1);
        ReadLock { ses: self }
    }

    fn next_segment(&self) -> Result<u32, DbError> {
        loop {
            if let Some(seg) = self.alloc.ready().pop(AckMode::Require) {
                return Ok(seg as u32);
            }
            if self.alloc.threads_running() {
                return Ok(self.alloc.ready().pop_wait(AckMode::Require)? as u32);
            }
            // no provider thread (tests, early startup): run a pass inline
            self.alloc.provider_pass()?;
        }
    }

    /// Bump-allocate object space, sealing and replacing the active segment
    /// as needed. Writes the object header; the caller fills the body.
    pub fn alloc_data(
        &self,
        size: usize,
        addr: Address,
        seq: u16,
        ntype: NodeType,
        src_vage: Option<u64>,
    ) -> Result<(SegmentLoc, *mut NodeHeader), DbError> {
        debug_assert!(size % OBJECT_ALIGN == 0);
        if size > MAX_OBJECT_SIZE {
            return Err(DbError::ValueTooLarge(size));
        }
        let s = self.alloc.state();
        loop {
            let seg = match self.active.get() {
                Some(seg) => seg,
                None => {
                    let seg = self.next_segment()?;
                    self.active.set(Some(seg));
                    seg
                }
            };
            let meta = &s.meta[seg as usize];
            if let Some(pos) = meta.try_bump(size as u32) {
                meta.absorb_vage(src_vage.unwrap_or_else(now_ms), size as u64);
                let loc = SegmentLoc { segment: seg, offset: pos };
                let hdr = self.alloc.object_ptr(loc);
                unsafe {
                    *hdr = NodeHeader::new(size, addr.to_u32(), seq, ntype);
                }
                return Ok((loc, hdr));
            }
            // segment full: seal it, sync it, move on
            self.seal_active();
        }
    }

    /// Roll back an allocation whose object never got published.
    pub fn unalloc(&self, loc: SegmentLoc, size: usize) {
        let meta = &self.alloc.state().meta[loc.segment as usize];
        if loc.offset + size as u32 == meta.data_end() {
            meta.unbump(size as u32);
        } else {
            meta.add_free_space(size as u32);
        }
    }

    /// Seal the active segment (if any): no more allocation, flushed per the
    /// configured sync mode, eligible for compaction.
    pub fn seal_active(&self) {
        if let Some(seg) = self.active.take() {
            let meta = &self.alloc.state().meta[seg as usize];
            meta.set_alloc(false);
            self.alloc.sync_segment(seg, self.alloc.config().sync_mode);
        }
    }

    /// Queue an address for read-cache promotion if it looks cold.
    pub fn note_read(&self, addr: Address, slot: &MetaSlot) {
        if !slot.mark_read() {
            return; // already marked this window
        }
        let w = slot.load();
        let Some(loc) = w.loc() else { return };
        let smeta = &self.alloc.state().meta[loc.segment as usize];
        if smeta.is_pinned() || smeta.is_alloc() {
            return;
        }
        if slot.start_pending_cache() {
            let ring = self.alloc.state().sessions.rcache(self.num);
            if !ring.push(addr.to_u32()) {
                slot.end_pending_cache();
            }
        }
    }
}

impl Drop for SegAllocSession {
    fn drop(&mut self) {
        self.seal_active();
        self.alloc.state().sessions.release_session(self.num);
    }
}

/// RAII read lock: pins the session's epoch for the lifetime of a
/// traversal. Object references only hand out data while one is held.
pub(crate) struct ReadLock<'s> {
    ses: &'s SegAllocSession,
}

impl Drop for ReadLock<'_> {
    fn drop(&mut self) {
        let depth = self.ses.lock_depth.get() - 1;
        self.ses.lock_depth.set(depth);
        if depth == 0 {
            self.ses
                .alloc
                .state()
                .sessions
                .epoch(self.ses.num)
                .store(EPOCH_IDLE, Ordering::SeqCst);
        }
    }
}

impl<'s> ReadLock<'s> {
    pub fn session(&self) -> &'s SegAllocSession {
        self.ses
    }

    pub fn allocator(&self) -> &'s SegAllocator {
        &self.ses.alloc
    }

    /// Object reference for an address. The reference (and any node views
    /// derived from it) cannot outlive this lock.
    pub fn get(&self, addr: Address) -> ObjectRef<'_> {
        let slot = self.ses.alloc.addrs.slot(addr);
        ObjectRef { alloc: &self.ses.alloc, addr, slot, word: slot.load() }
    }

    pub fn get_checked(&self, addr: Address) -> Result<ObjectRef<'_>, DbError> {
        let slot = self.ses.alloc.addrs.get(addr)?;
        Ok(ObjectRef { alloc: &self.ses.alloc, addr, slot, word: slot.load() })
    }
}

/// A meta slot plus a cached copy of its word.
pub(crate) struct ObjectRef<'a> {
    alloc: &'a SegAllocator,
    addr: Address,
    slot: &'a MetaSlot,
    word: MetaWord,
}

impl<'a> ObjectRef<'a> {
    pub fn address(&self) -> Address {
        self.addr
    }

    pub fn meta(&self) -> MetaWord {
        self.word
    }

    pub fn slot(&self) -> &'a MetaSlot {
        self.slot
    }

    pub fn refresh(&mut self) -> MetaWord {
        self.word = self.slot.load();
        self.word
    }

    pub fn ref_count(&self) -> u32 {
        self.word.ref_count()
    }

    pub fn node_type(&self) -> Option<NodeType> {
        self.word.node_type()
    }

    pub fn loc(&self) -> Option<SegmentLoc> {
        self.word.loc()
    }

    /// Header of the live object. Re-reads the location so a reader that
    /// raced a relocation lands on whichever side the CAS published.
    pub fn header_ptr(&mut self) -> *mut NodeHeader {
        let loc = self.refresh().loc().expect("dereferencing a freed object");
        self.alloc.object_ptr(loc)
    }

    pub fn retain(&mut self) {
        self.slot.retain();
        self.word = self.slot.load();
    }

    /// Drop one reference. When this was the last one, the object's storage
    /// is reclaimed here and `Some(freed location/size)` comes back so the
    /// caller can release children and the address itself.
    pub fn release(&mut self) -> Option<(SegmentLoc, usize)> {
        let prev = self.slot.release();
        self.word = self.slot.load();
        if prev.ref_count() != 1 {
            return None;
        }
        let loc = prev.loc()?;
        let size = unsafe { (*self.alloc.object_ptr(loc)).size() };
        self.alloc.state().meta[loc.segment as usize].add_free_space(size as u32);
        Some((loc, size))
    }

    /// Scoped in-place mutation. Takes the copy flag as a modify lock so the
    /// compactor can't relocate the bytes mid-write; recomputes the checksum
    /// on drop when configured.
    pub fn modify(&mut self) -> ModifyGuard<'_, 'a> {
        let w = self.slot.lock_modify();
        debug_assert_eq!(w.ref_count(), 1, "in-place mutation requires a unique reference");
        debug_assert!(!w.is_const(), "in-place mutation of a durable object");
        self.word = w;
        let hdr = self.alloc.object_ptr(w.loc().expect("modify on a freed object"));
        ModifyGuard { obj: self, hdr }
    }
}

pub(crate) struct ModifyGuard<'o, 'a> {
    obj: &'o mut ObjectRef<'a>,
    hdr: *mut NodeHeader,
}

impl ModifyGuard<'_, '_> {
    pub fn header_ptr(&mut self) -> *mut NodeHeader {
        self.hdr
    }
}

impl Drop for ModifyGuard<'_, '_> {
    fn drop(&mut self) {
        if self.obj.alloc.config().checksum_on_modify {
            unsafe { (*self.hdr).checksum = object_checksum(self.hdr) };
        } else {
            // stale checksum would fail validation after the edit
            unsafe { (*self.hdr).checksum = 0 };
        }
        self.obj.slot.unlock_modify();
        self.obj.word = self.obj.slot.load();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use coral_nodes::value::{ValueInit, ValueNode};

    fn open_alloc() -> (tempfile::TempDir, Arc<SegAllocator>) {
        let dir = tempfile::tempdir().unwrap();
        let cfg = RuntimeConfig { sync_mode: SyncType::None, ..Default::default() };
        let a = SegAllocator::open(dir.path(), &cfg).unwrap();
        (dir, a)
    }

    fn alloc_value(
        ses: &SegAllocSession,
        region: u16,
        key: &[u8],
        val: &[u8],
    ) -> (Address, SegmentLoc) {
        let a = ses.allocator().clone();
        let (addr, slot) = a.addrs.alloc(region).unwrap();
        let size = ValueNode::alloc_size(key.len(), val.len());
        let (loc, hdr) = ses.alloc_data(size, addr, 0, NodeType::Value, None).unwrap();
        let buf = unsafe { std::slice::from_raw_parts_mut(hdr as *mut u8, size) };
        ValueNode::init(buf, addr.to_u32(), 0, key, ValueInit::Bytes(val));
        slot.init_object(NodeType::Value, loc);
        (addr, loc)
    }

    #[test]
    fn alloc_and_read_back() {
        let (_d, a) = open_alloc();
        let ses = SegAllocSession::new(&a);
        let region = a.addrs.new_region();
        let (addr, loc) = alloc_value(&ses, region, b"key", b"value");
        assert_eq!(loc.offset, 0);

        let lk = ses.lock();
        let mut obj = lk.get(addr);
        assert_eq!(obj.ref_count(), 1);
        assert_eq!(obj.node_type(), Some(NodeType::Value));
        let vn = unsafe { ValueNode::from_header(&*obj.header_ptr()) };
        assert_eq!(vn.key(), b"key");
        assert_eq!(vn.value(), b"value");
    }

    #[test]
    fn segment_rolls_over_when_full() {
        let (_d, a) = open_alloc();
        let ses = SegAllocSession::new(&a);
        let region = a.addrs.new_region();
        let big = vec![7u8; 64 * 1024];
        let n = SEGMENT_SIZE / ValueNode::alloc_size(1, big.len()) + 2;
        for _ in 0..n {
            alloc_value(&ses, region, b"k", &big);
        }
        assert!(a.num_segments() >= 2);
        let first = &a.state().meta[0];
        assert!(!first.is_alloc(), "filled segment should be sealed");
    }

    #[test]
    fn release_credits_free_space() {
        let (_d, a) = open_alloc();
        let ses = SegAllocSession::new(&a);
        let region = a.addrs.new_region();
        let (addr, loc) = alloc_value(&ses, region, b"k", &[0u8; 100]);
        let lk = ses.lock();
        let mut obj = lk.get(addr);
        let freed = obj.release().expect("last reference frees");
        assert_eq!(freed.0, loc);
        assert_eq!(a.state().meta[loc.segment as usize].free_space() as usize, freed.1);
    }

    #[test]
    fn compaction_relocates_live_objects() {
        let (_d, a) = open_alloc();
        let ses = SegAllocSession::new(&a);
        let region = a.addrs.new_region();
        // fill segment 0 past the unpinned threshold with garbage, keep one
        // live object
        let (live, live_loc) = alloc_value(&ses, region, b"live", b"data");
        let chunk = vec![1u8; 32 * 1024];
        let mut dead = Vec::new();
        while ses.active_segment() == Some(live_loc.segment) {
            dead.push(alloc_value(&ses, region, b"d", &chunk).0);
        }
        {
            let lk = ses.lock();
            for addr in dead {
                lk.get(addr).release();
            }
        }
        let src = live_loc.segment;
        assert!(a.state().meta[src as usize].free_space() as usize > SEGMENT_SIZE / 2);

        let candidates = a.compact_candidates(false, 4);
        assert!(candidates.contains(&src));
        a.compact_segment(&ses, src).unwrap();

        // live object moved and is still readable
        let lk = ses.lock();
        let mut obj = lk.get(live);
        let new_loc = obj.loc().unwrap();
        assert_ne!(new_loc, live_loc);
        let vn = unsafe { ValueNode::from_header(&*obj.header_ptr()) };
        assert_eq!(vn.key(), b"live");
        assert_eq!(vn.value(), b"data");
        assert_eq!(a.state().meta[src as usize].age(), u64::MAX);
    }

    #[test]
    fn recycled_segment_respects_read_epochs() {
        let (_d, a) = open_alloc();
        let ses = SegAllocSession::new(&a);
        let reader = SegAllocSession::new(&a);
        let region = a.addrs.new_region();
        let (_live, live_loc) = alloc_value(&ses, region, b"live", b"data");
        let chunk = vec![1u8; 32 * 1024];
        let mut dead = Vec::new();
        while ses.active_segment() == Some(live_loc.segment) {
            dead.push(alloc_value(&ses, region, b"d", &chunk).0);
        }
        {
            let lk = ses.lock();
            for addr in dead {
                lk.get(addr).release();
            }
        }

        let pinned = reader.lock(); // epoch taken before the free
        a.compact_segment(&ses, live_loc.segment).unwrap();
        a.provider_pass().unwrap();
        let s = a.state();
        assert!(
            !s.provider.free_segments.test(live_loc.segment as usize),
            "segment must stay un-recycled while a reader epoch predates its free"
        );
        drop(pinned);
        a.provider_pass().unwrap();
        assert!(s.provider.free_segments.test(live_loc.segment as usize));
    }

    #[test]
    fn rcache_promotion_moves_read_objects() {
        let (_d, a) = open_alloc();
        let ses = SegAllocSession::new(&a);
        let region = a.addrs.new_region();
        let (addr, loc) = alloc_value(&ses, region, b"hot", b"object");
        // seal so the object's segment is cold (not is_alloc)
        ses.seal_active();

        {
            let lk = ses.lock();
            let obj = lk.get(addr);
            ses.note_read(addr, obj.slot());
        }
        assert!(a.addrs.slot(addr).load().pending_cache());

        let compactor = SegAllocSession::new(&a);
        assert!(a.promote_rcache(&compactor).unwrap());
        let w = a.addrs.slot(addr).load();
        assert!(!w.pending_cache());
        assert_ne!(w.loc(), Some(loc), "object should have moved to the hot segment");
        assert_eq!(w.loc().unwrap().segment, compactor.active_segment().unwrap());
        assert!(a.state().total_promoted_bytes.load(Ordering::Relaxed) > 0);

        let lk = ses.lock();
        let mut obj = lk.get(addr);
        let vn = unsafe { ValueNode::from_header(&*obj.header_ptr()) };
        assert_eq!(vn.key(), b"hot");
    }

    #[test]
    fn sync_marks_objects_const() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = RuntimeConfig { sync_mode: SyncType::Sync, ..Default::default() };
        let a = SegAllocator::open(dir.path(), &cfg).unwrap();
        let ses = SegAllocSession::new(&a);
        let region = a.addrs.new_region();
        let (addr, _loc) = alloc_value(&ses, region, b"k", b"v");
        assert!(!a.addrs.slot(addr).load().is_const());
        a.sync(SyncType::Sync);
        assert!(a.addrs.slot(addr).load().is_const());
    }

    #[test]
    fn background_threads_start_and_stop() {
        let (_d, a) = open_alloc();
        a.start_threads();
        let ses = SegAllocSession::new(&a);
        let region = a.addrs.new_region();
        alloc_value(&ses, region, b"k", b"v");
        std::thread::sleep(Duration::from_millis(50));
        a.stop_threads();
        // ready buffer usable again after interrupt cleared
        assert!(a.provider_pass().is_ok());
    }
}

//! The per-address atomic meta word.
//!
//! One 64-bit word per logical address encodes everything the engine needs
//! to know about the object without touching it: reference count, physical
//! location, node type, and the state bits the compactor and read-cache
//! machinery negotiate through.
//!
//! ```text
//! bits 0..=14   ref count (saturating; 0x7FFF pins the object forever)
//! bit  15       read bit (set by readers, decayed in the background)
//! bits 16..=18  node type tag
//! bit  19       const flag (synced to disk; mutation requires CoW)
//! bit  20       copy flag (a relocation or in-place modify is in flight)
//! bit  21       pending-cache flag (queued for read-cache promotion)
//! bits 22..=61  location: segment(16) | offset/64(24); all ones = null
//! ```

use std::sync::atomic::{AtomicU64, Ordering};

use coral_nodes::NodeType;

pub(crate) const MAX_REF: u64 = 0x7FFF;

const REF_MASK: u64 = 0x7FFF;
const READ_BIT: u64 = 1 << 15;
const TYPE_SHIFT: u32 = 16;
const TYPE_MASK: u64 = 0x7 << TYPE_SHIFT;
const CONST_BIT: u64 = 1 << 19;
const COPY_BIT: u64 = 1 << 20;
const PENDING_CACHE_BIT: u64 = 1 << 21;
const LOC_SHIFT: u32 = 22;
const LOC_MASK_RAW: u64 = (1 << 40) - 1;
const NULL_LOC: u64 = LOC_MASK_RAW;

/// A physical object position: segment number plus byte offset within it.
/// Offsets are 64-byte aligned, which is what lets them pack into 24 bits.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct SegmentLoc {
    pub segment: u32,
    pub offset: u32,
}

impl SegmentLoc {
    fn to_raw(self) -> u64 {
        debug_assert!(self.offset % 64 == 0);
        debug_assert!(self.segment < 1 << 16);
        (self.segment as u64) << 24 | (self.offset as u64) >> 6
    }

    fn from_raw(raw: u64) -> Option<Self> {
        if raw == NULL_LOC {
            return None;
        }
        Some(Self {
            segment: (raw >> 24) as u32,
            offset: ((raw & 0xFF_FFFF) << 6) as u32,
        })
    }
}

/// Decoded snapshot of a meta word.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct MetaWord(u64);

impl MetaWord {
    pub const FREE: MetaWord = MetaWord(0);

    /// Word for a freshly allocated object: one reference, not const.
    pub fn new_object(ntype: NodeType, loc: SegmentLoc) -> Self {
        Self(1 | ((ntype as u64) << TYPE_SHIFT) | (loc.to_raw() << LOC_SHIFT))
    }

    pub fn ref_count(self) -> u32 {
        (self.0 & REF_MASK) as u32
    }

    pub fn is_read(self) -> bool {
        self.0 & READ_BIT != 0
    }

    pub fn node_type(self) -> Option<NodeType> {
        NodeType::from_u8(((self.0 & TYPE_MASK) >> TYPE_SHIFT) as u8)
    }

    pub fn is_const(self) -> bool {
        self.0 & CONST_BIT != 0
    }

    pub fn is_copying(self) -> bool {
        self.0 & COPY_BIT != 0
    }

    pub fn pending_cache(self) -> bool {
        self.0 & PENDING_CACHE_BIT != 0
    }

    pub fn loc(self) -> Option<SegmentLoc> {
        SegmentLoc::from_raw((self.0 >> LOC_SHIFT) & LOC_MASK_RAW)
    }

    fn with_loc(self, loc: SegmentLoc) -> Self {
        Self((self.0 & !(LOC_MASK_RAW << LOC_SHIFT)) | (loc.to_raw() << LOC_SHIFT))
    }
}

/// What a compactor CAS against the meta word produced.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum MoveResult {
    Moved,
    /// Someone else moved or freed the object first.
    Raced,
}

/// The atomic slot itself; lives in the mapped address table.
#[repr(transparent)]
pub struct MetaSlot(AtomicU64);

impl MetaSlot {
    pub fn load(&self) -> MetaWord {
        MetaWord(self.0.load(Ordering::Acquire))
    }

    pub fn store(&self, w: MetaWord) {
        self.0.store(w.0, Ordering::Release);
    }

    /// Publish a fresh object into this slot.
    pub fn init_object(&self, ntype: NodeType, loc: SegmentLoc) {
        self.store(MetaWord::new_object(ntype, loc));
    }

    /// Reset to free. The address allocator does this before re-listing the
    /// slot as available.
    pub fn clear(&self) {
        self.0.store(0, Ordering::Release);
    }

    /// Bump the reference count, saturating at the "many" value.
    pub fn retain(&self) -> MetaWord {
        let prev = self
            .0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |w| {
                if w & REF_MASK == MAX_REF {
                    None
                } else {
                    Some(w + 1)
                }
            })
            .unwrap_or_else(|w| w);
        MetaWord(prev)
    }

    /// Drop one reference. Returns the *previous* word; the caller owns
    /// cleanup when `previous.ref_count() == 1`. Saturated counts are never
    /// decremented.
    pub fn release(&self) -> MetaWord {
        let prev = self
            .0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |w| {
                let r = w & REF_MASK;
                debug_assert!(r != 0, "release on a free meta slot");
                if r == MAX_REF || r == 0 {
                    None
                } else {
                    Some(w - 1)
                }
            })
            .unwrap_or_else(|w| w);
        MetaWord(prev)
    }

    /// Try to set the copy flag, which locks out other movers. Succeeds only
    /// while the object is live, its location is still `from`, and nobody
    /// else holds the flag.
    pub fn try_start_move(&self, from: SegmentLoc) -> bool {
        self.0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |w| {
                let m = MetaWord(w);
                if m.ref_count() == 0 || m.is_copying() || m.loc() != Some(from) {
                    None
                } else {
                    Some(w | COPY_BIT)
                }
            })
            .is_ok()
    }

    /// Finish a move started with [`Self::try_start_move`]: swing the
    /// location from `from` to `to` and clear the copy flag. Fails if the
    /// object was freed in the meantime.
    pub fn try_move(&self, from: SegmentLoc, to: SegmentLoc) -> MoveResult {
        let r = self.0.fetch_update(Ordering::AcqRel, Ordering::Acquire, |w| {
            let m = MetaWord(w);
            if m.ref_count() == 0 || m.loc() != Some(from) {
                None
            } else {
                Some(m.with_loc(to).0 & !COPY_BIT)
            }
        });
        match r {
            Ok(_) => MoveResult::Moved,
            Err(_) => MoveResult::Raced,
        }
    }

    /// Abandon a started move, clearing the copy flag.
    pub fn end_move(&self) {
        self.0.fetch_and(!COPY_BIT, Ordering::AcqRel);
    }

    /// Take the copy flag as a modify lock, spinning out any in-flight
    /// relocation. Returns the word observed after acquisition.
    pub fn lock_modify(&self) -> MetaWord {
        loop {
            match self.0.fetch_update(Ordering::AcqRel, Ordering::Acquire, |w| {
                if w & COPY_BIT != 0 {
                    None
                } else {
                    Some(w | COPY_BIT)
                }
            }) {
                Ok(prev) => return MetaWord(prev | COPY_BIT),
                Err(_) => std::hint::spin_loop(),
            }
        }
    }

    pub fn unlock_modify(&self) {
        self.0.fetch_and(!COPY_BIT, Ordering::AcqRel);
    }

    /// Mark read; returns true when the bit was newly set.
    pub fn mark_read(&self) -> bool {
        self.0.fetch_or(READ_BIT, Ordering::AcqRel) & READ_BIT == 0
    }

    pub fn clear_read(&self) {
        self.0.fetch_and(!READ_BIT, Ordering::AcqRel);
    }

    /// Queue for read-cache promotion; returns false if already queued.
    pub fn start_pending_cache(&self) -> bool {
        self.0.fetch_or(PENDING_CACHE_BIT, Ordering::AcqRel) & PENDING_CACHE_BIT == 0
    }

    pub fn end_pending_cache(&self) {
        self.0.fetch_and(!PENDING_CACHE_BIT, Ordering::AcqRel);
    }

    /// Flag the object as durable-and-immutable. Never cleared for the
    /// life of the allocation: mutation from here on is copy-on-write.
    pub fn set_const(&self) {
        self.0.fetch_or(CONST_BIT, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slot() -> MetaSlot {
        MetaSlot(AtomicU64::new(0))
    }

    const LOC_A: SegmentLoc = SegmentLoc { segment: 3, offset: 128 };
    const LOC_B: SegmentLoc = SegmentLoc { segment: 9, offset: 4096 };

    #[test]
    fn word_roundtrip() {
        let w = MetaWord::new_object(NodeType::Setlist, LOC_A);
        assert_eq!(w.ref_count(), 1);
        assert_eq!(w.node_type(), Some(NodeType::Setlist));
        assert_eq!(w.loc(), Some(LOC_A));
        assert!(!w.is_const() && !w.is_copying() && !w.is_read());
        assert_eq!(MetaWord::FREE.loc(), Some(SegmentLoc { segment: 0, offset: 0 }));
        assert_eq!(MetaWord::FREE.ref_count(), 0);
    }

    #[test]
    fn retain_release() {
        let s = slot();
        s.init_object(NodeType::Value, LOC_A);
        s.retain();
        s.retain();
        assert_eq!(s.load().ref_count(), 3);
        assert_eq!(s.release().ref_count(), 3);
        assert_eq!(s.release().ref_count(), 2);
        let prev = s.release();
        assert_eq!(prev.ref_count(), 1); // caller's cue to free
    }

    #[test]
    fn saturated_ref_never_drops() {
        let s = slot();
        s.0.store(MAX_REF | (1 << TYPE_SHIFT), Ordering::Relaxed);
        s.retain();
        assert_eq!(s.load().ref_count(), MAX_REF as u32);
        s.release();
        assert_eq!(s.load().ref_count(), MAX_REF as u32);
    }

    #[test]
    fn move_protocol() {
        let s = slot();
        s.init_object(NodeType::Binary, LOC_A);
        assert!(s.try_start_move(LOC_A));
        // second mover loses
        assert!(!s.try_start_move(LOC_A));
        assert_eq!(s.try_move(LOC_A, LOC_B), MoveResult::Moved);
        assert_eq!(s.load().loc(), Some(LOC_B));
        assert!(!s.load().is_copying());
        // stale mover: location no longer matches
        assert!(!s.try_start_move(LOC_A));
        assert_eq!(s.try_move(LOC_A, LOC_B), MoveResult::Raced);
    }

    #[test]
    fn modify_lock_excludes_mover() {
        let s = slot();
        s.init_object(NodeType::Binary, LOC_A);
        let w = s.lock_modify();
        assert!(w.is_copying());
        assert!(!s.try_start_move(LOC_A));
        s.unlock_modify();
        assert!(s.try_start_move(LOC_A));
        s.end_move();
        assert!(!s.load().is_copying());
    }

    #[test]
    fn flag_bits() {
        let s = slot();
        s.init_object(NodeType::Value, LOC_A);
        assert!(s.mark_read());
        assert!(!s.mark_read());
        s.clear_read();
        assert!(s.mark_read());
        assert!(s.start_pending_cache());
        assert!(!s.start_pending_cache());
        s.end_pending_cache();
        s.set_const();
        assert!(s.load().is_const());
    }
}

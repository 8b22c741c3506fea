//! Logical addresses.

use std::fmt;

/// Slots per 64-byte cacheline of the address table.
pub(crate) const CACHELINE_SLOTS: usize = 8;
/// Meta slots per region page (one 4 KiB page of 8-byte slots).
pub(crate) const SLOTS_PER_PAGE: usize = 512;
/// Cachelines per region page.
pub(crate) const CACHELINES_PER_PAGE: usize = SLOTS_PER_PAGE / CACHELINE_SLOTS;
/// Pages a region can grow to (128 * 512 = 2^16 addresses per region).
pub(crate) const PAGES_PER_REGION: usize = 128;
pub(crate) const MAX_REGIONS: usize = 1 << 16;

/// A logical object address: `(region, index)` packed into 32 bits.
///
/// The region partitions the address space so siblings can be colocated;
/// the index names a slot within the region. Address 0 is null; region 0
/// is never handed out. An address is stable for the life of the object it
/// names; the object's physical location is read through its meta slot.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address(u32);

impl Address {
    pub const NULL: Address = Address(0);

    pub fn new(region: u16, index: u16) -> Self {
        Self((region as u32) << 16 | index as u32)
    }

    pub fn from_u32(v: u32) -> Self {
        Self(v)
    }

    pub fn to_u32(self) -> u32 {
        self.0
    }

    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    pub fn region(self) -> u16 {
        (self.0 >> 16) as u16
    }

    pub fn index(self) -> u16 {
        self.0 as u16
    }

    /// Which page of the region this index lives on.
    pub(crate) fn page(self) -> usize {
        self.index() as usize / SLOTS_PER_PAGE
    }

    /// Slot within the page.
    pub(crate) fn page_slot(self) -> usize {
        self.index() as usize % SLOTS_PER_PAGE
    }

    /// Cacheline within the page.
    pub(crate) fn cacheline(self) -> usize {
        self.page_slot() / CACHELINE_SLOTS
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "r{}.i{}", self.region(), self.index())
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packing() {
        let a = Address::new(7, 1234);
        assert_eq!(a.region(), 7);
        assert_eq!(a.index(), 1234);
        assert_eq!(a.page(), 2);
        assert_eq!(a.page_slot(), 210);
        assert_eq!(a.cacheline(), 26);
        assert_eq!(Address::from_u32(a.to_u32()), a);
        assert!(Address::NULL.is_null());
        assert!(!a.is_null());
        assert_eq!(format!("{a}"), "r7.i1234");
    }
}

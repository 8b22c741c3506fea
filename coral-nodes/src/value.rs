//! Value node: a leaf holding the remainder of one key together with either
//! an inline byte blob or the address of a nested subtree.

use crate::{round_up, Error, NodeHeader, NodeType};

const KIND_BYTES: u8 = 0;
const KIND_SUBTREE: u8 = 1;

/// What a freshly built value node should hold.
#[derive(Clone, Copy, Debug)]
pub enum ValueInit<'a> {
    Bytes(&'a [u8]),
    Subtree(u32),
}

impl ValueInit<'_> {
    pub fn stored_len(&self) -> usize {
        match self {
            Self::Bytes(b) => b.len(),
            Self::Subtree(_) => 4,
        }
    }
}

/// Layout: this fixed part, then `key_len` key bytes, then the value bytes
/// (a 4-byte little-endian address for subtrees). Spare capacity up to the
/// allocation size allows in-place growth of the value.
#[repr(C)]
pub struct ValueNode {
    hdr: NodeHeader,
    val_len: u32,
    key_len: u16,
    kind: u8,
    _pad: u8,
}

const FIXED: usize = core::mem::size_of::<ValueNode>();

impl ValueNode {
    /// Allocation size for a new node, with ~25% headroom on the value so
    /// small in-place growth doesn't force a reallocation.
    pub fn alloc_size(key_len: usize, value_len: usize) -> usize {
        round_up(FIXED + key_len + value_len + value_len / 4)
    }

    /// Exact allocation size, no headroom. Used by the compactor's copies.
    pub fn alloc_size_exact(key_len: usize, value_len: usize) -> usize {
        round_up(FIXED + key_len + value_len)
    }

    /// Placement-construct into `buf`, which must be the full allocation.
    pub fn init<'a>(
        buf: &'a mut [u8],
        address: u32,
        seq: u16,
        key: &[u8],
        val: ValueInit,
    ) -> &'a mut Self {
        assert!(buf.len() >= FIXED + key.len() + val.stored_len());
        assert_eq!(buf.len() % crate::OBJECT_ALIGN, 0);
        let node = unsafe { &mut *(buf.as_mut_ptr() as *mut Self) };
        node.hdr = NodeHeader::new(buf.len(), address, seq, NodeType::Value);
        node.key_len = key.len() as u16;
        unsafe {
            node.data_mut(0, key.len()).copy_from_slice(key);
        }
        match val {
            ValueInit::Bytes(b) => {
                node.kind = KIND_BYTES;
                node.val_len = b.len() as u32;
                unsafe { node.data_mut(key.len(), b.len()).copy_from_slice(b) };
            }
            ValueInit::Subtree(addr) => {
                node.kind = KIND_SUBTREE;
                node.val_len = 4;
                unsafe { node.data_mut(key.len(), 4).copy_from_slice(&addr.to_le_bytes()) };
            }
        }
        node._pad = 0;
        node
    }

    /// # Safety
    ///
    /// `h` must head an allocation of at least `h.size()` bytes that was
    /// initialized as a value node.
    pub unsafe fn from_header(h: &NodeHeader) -> &Self {
        &*(h as *const NodeHeader as *const Self)
    }

    /// # Safety
    ///
    /// Same as [`Self::from_header`], plus exclusive access.
    pub unsafe fn from_header_mut(h: &mut NodeHeader) -> &mut Self {
        &mut *(h as *mut NodeHeader as *mut Self)
    }

    unsafe fn data(&self, off: usize, len: usize) -> &[u8] {
        let base = (self as *const Self as *const u8).add(FIXED + off);
        core::slice::from_raw_parts(base, len)
    }

    unsafe fn data_mut(&mut self, off: usize, len: usize) -> &mut [u8] {
        let base = (self as *mut Self as *mut u8).add(FIXED + off);
        core::slice::from_raw_parts_mut(base, len)
    }

    pub fn header(&self) -> &NodeHeader {
        &self.hdr
    }

    pub fn key(&self) -> &[u8] {
        unsafe { self.data(0, self.key_len as usize) }
    }

    pub fn is_subtree(&self) -> bool {
        self.kind == KIND_SUBTREE
    }

    pub fn subtree_address(&self) -> Option<u32> {
        if self.kind != KIND_SUBTREE {
            return None;
        }
        let raw = unsafe { self.data(self.key_len as usize, 4) };
        Some(u32::from_le_bytes(raw.try_into().unwrap()))
    }

    /// The inline value bytes. Empty (and meaningless) for subtree nodes;
    /// check [`Self::is_subtree`] first.
    pub fn value(&self) -> &[u8] {
        if self.is_subtree() {
            return &[];
        }
        unsafe { self.data(self.key_len as usize, self.val_len as usize) }
    }

    pub fn value_size(&self) -> usize {
        self.val_len as usize
    }

    /// Bytes available for the value without reallocating.
    pub fn value_capacity(&self) -> usize {
        self.hdr.size() - FIXED - self.key_len as usize
    }

    /// Replace the value in place. Returns the previously held subtree
    /// address, if any, which the caller must release.
    pub fn set_value(&mut self, v: &[u8]) -> Result<Option<u32>, Error> {
        if v.len() > self.value_capacity() {
            return Err(Error::OutOfSpace(v.len() - self.value_capacity()));
        }
        let old = self.subtree_address();
        self.kind = KIND_BYTES;
        self.val_len = v.len() as u32;
        let key_len = self.key_len as usize;
        unsafe { self.data_mut(key_len, v.len()).copy_from_slice(v) };
        Ok(old)
    }

    /// Point this node at a subtree instead. Returns any prior subtree
    /// address for the caller to release.
    pub fn set_subtree(&mut self, addr: u32) -> Option<u32> {
        let old = self.subtree_address();
        self.kind = KIND_SUBTREE;
        self.val_len = 4;
        let key_len = self.key_len as usize;
        unsafe { self.data_mut(key_len, 4).copy_from_slice(&addr.to_le_bytes()) };
        old
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build<'a>(buf: &'a mut [u8], key: &[u8], val: ValueInit) -> &'a mut ValueNode {
        let size = ValueNode::alloc_size(key.len(), val.stored_len());
        ValueNode::init(&mut buf[..size], 7, 0, key, val)
    }

    #[test]
    fn bytes_value() {
        let mut buf = [0u8; 256];
        let vn = build(&mut buf, b"anana", ValueInit::Bytes(b"yellow"));
        assert_eq!(vn.key(), b"anana");
        assert_eq!(vn.value(), b"yellow");
        assert_eq!(vn.value_size(), 6);
        assert!(!vn.is_subtree());
        assert!(vn.value_capacity() >= 7);
    }

    #[test]
    fn in_place_update_and_capacity() {
        let mut buf = [0u8; 256];
        let vn = build(&mut buf, b"k", ValueInit::Bytes(b"abc"));
        let cap = vn.value_capacity();
        assert_eq!(vn.set_value(b"abcd").unwrap(), None);
        assert_eq!(vn.value(), b"abcd");
        let too_big = alloc::vec![0xAA; cap + 1];
        assert!(matches!(vn.set_value(&too_big), Err(Error::OutOfSpace(_))));
        assert_eq!(vn.value(), b"abcd");
    }

    #[test]
    fn subtree_swap() {
        let mut buf = [0u8; 256];
        let vn = build(&mut buf, b"", ValueInit::Subtree(0x0005_0009));
        assert!(vn.is_subtree());
        assert_eq!(vn.subtree_address(), Some(0x0005_0009));
        assert_eq!(vn.set_value(b"now bytes").unwrap(), Some(0x0005_0009));
        assert!(!vn.is_subtree());
        assert_eq!(vn.set_subtree(0x0001_0001), None);
        assert_eq!(vn.subtree_address(), Some(0x0001_0001));
    }
}

//! The header every object in a segment starts with.

/// Objects are allocated in 64-byte multiples on 64-byte boundaries, so a
/// segment can be walked header-to-header.
pub const OBJECT_ALIGN: usize = 64;

/// Node variant tag. The values are stable: they appear in object headers on
/// disk and in the meta-slot type field.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum NodeType {
    Value = 1,
    Binary = 2,
    Setlist = 3,
    Full = 4,
}

impl NodeType {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(Self::Value),
            2 => Some(Self::Binary),
            3 => Some(Self::Setlist),
            4 => Some(Self::Full),
            _ => None,
        }
    }
}

/// 16-byte header at the start of every object.
///
/// `checksum` covers every byte of the object after itself; zero means "not
/// computed". A zero `address` terminates a segment walk, which is why
/// address 0 is reserved as null and fresh segment memory must be zeroed.
#[derive(Clone, Copy, bytemuck::Zeroable, bytemuck::Pod)]
#[repr(C)]
pub struct NodeHeader {
    pub checksum: u32,
    size: u32,
    address: u32,
    seq: u16,
    ntype: u8,
    _reserved: u8,
}

pub const NODE_HEADER_SIZE: usize = core::mem::size_of::<NodeHeader>();

impl NodeHeader {
    pub fn new(size: usize, address: u32, seq: u16, ntype: NodeType) -> Self {
        debug_assert!(size % OBJECT_ALIGN == 0);
        Self {
            checksum: 0,
            size: size as u32,
            address,
            seq,
            ntype: ntype as u8,
            _reserved: 0,
        }
    }

    /// Allocation size in bytes, always a multiple of [`OBJECT_ALIGN`].
    #[inline]
    pub fn size(&self) -> usize {
        self.size as usize
    }

    /// The logical address this object was allocated under, packed as
    /// `region << 16 | index`.
    #[inline]
    pub fn address(&self) -> u32 {
        self.address
    }

    #[inline]
    pub fn seq(&self) -> u16 {
        self.seq
    }

    #[inline]
    pub fn node_type(&self) -> Option<NodeType> {
        NodeType::from_u8(self.ntype)
    }

    /// Byte offset of the next object header in a segment walk.
    #[inline]
    pub fn next_offset(&self, current: usize) -> usize {
        current + self.size()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout() {
        assert_eq!(NODE_HEADER_SIZE, 16);
        let h = NodeHeader::new(128, 0x0001_0007, 3, NodeType::Binary);
        assert_eq!(h.size(), 128);
        assert_eq!(h.address(), 0x0001_0007);
        assert_eq!(h.seq(), 3);
        assert_eq!(h.node_type(), Some(NodeType::Binary));
        assert_eq!(h.next_offset(64), 192);
    }
}

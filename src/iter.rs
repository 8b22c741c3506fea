//! Read-side traversal: point lookups, descendant-count range counting,
//! and the ordered iterator.
//!
//! Traversal works on logical addresses, which are stable across compactor
//! relocations; every dereference happens under a session read lock so the
//! segment holding the bytes can't be recycled mid-read. A snapshot pinned
//! by a retained root is never mutated in place (the writer's copy-on-write
//! cascade clones anything reachable from a shared root), so an iterator
//! can keep addresses between calls.

use coral_nodes::binary::{BinaryNode, BinaryValue};
use coral_nodes::full::FullNode;
use coral_nodes::inner::InnerNode;
use coral_nodes::setlist::SetlistNode;
use coral_nodes::value::ValueNode;
use coral_nodes::{common_prefix, NodeType};

use crate::seg_alloc::{ReadLock, SegAllocSession};
use crate::{Address, DbError};

/// What a lookup found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum GetResult {
    NotFound,
    Bytes(Vec<u8>),
    Subtree(Address),
}

/// Point lookup. Marks read bits along the path for the read-cache.
pub(crate) fn trie_get(lk: &ReadLock, root: Address, key: &[u8]) -> Result<GetResult, DbError> {
    if root.is_null() {
        return Ok(GetResult::NotFound);
    }
    let mut addr = root;
    let mut key = key;
    loop {
        let mut r = lk.get(addr);
        lk.session().note_read(addr, r.slot());
        let hdr = unsafe { &*r.header_ptr() };
        match hdr.node_type() {
            Some(NodeType::Value) => {
                let vn = unsafe { ValueNode::from_header(hdr) };
                if vn.key() != key {
                    return Ok(GetResult::NotFound);
                }
                return Ok(match vn.subtree_address() {
                    Some(s) => GetResult::Subtree(Address::from_u32(s)),
                    None => GetResult::Bytes(vn.value().to_vec()),
                });
            }
            Some(NodeType::Binary) => {
                let bn = unsafe { BinaryNode::from_header(hdr) };
                let Some(i) = bn.find_key_idx(key) else {
                    return Ok(GetResult::NotFound);
                };
                return Ok(match bn.get_value(i) {
                    BinaryValue::Inline(b) => GetResult::Bytes(b.to_vec()),
                    BinaryValue::ObjId(a) => {
                        let mut vr = lk.get(Address::from_u32(a));
                        let vn = unsafe { ValueNode::from_header(&*vr.header_ptr()) };
                        GetResult::Bytes(vn.value().to_vec())
                    }
                    BinaryValue::Subtree(a) => GetResult::Subtree(Address::from_u32(a)),
                });
            }
            Some(NodeType::Setlist) => match inner_step::<SetlistNode>(lk, hdr, key)? {
                Step::Descend(a, rest) => {
                    addr = a;
                    key = rest;
                }
                Step::Done(res) => return Ok(res),
            },
            Some(NodeType::Full) => match inner_step::<FullNode>(lk, hdr, key)? {
                Step::Descend(a, rest) => {
                    addr = a;
                    key = rest;
                }
                Step::Done(res) => return Ok(res),
            },
            None => return Err(DbError::Corrupt("lookup hit an object with a bad type tag")),
        }
    }
}

enum Step<'k> {
    Descend(Address, &'k [u8]),
    Done(GetResult),
}

fn inner_step<'k, N: InnerNode>(
    lk: &ReadLock,
    hdr: &coral_nodes::NodeHeader,
    key: &'k [u8],
) -> Result<Step<'k>, DbError> {
    let node = unsafe { N::from_header(hdr) };
    let prefix = node.prefix();
    if key.len() < prefix.len() || &key[..prefix.len()] != prefix {
        return Ok(Step::Done(GetResult::NotFound));
    }
    let rest = &key[prefix.len()..];
    if rest.is_empty() {
        if !node.has_eof_value() {
            return Ok(Step::Done(GetResult::NotFound));
        }
        let eof = Address::from_u32(node.eof_address());
        if node.eof_is_subtree() {
            return Ok(Step::Done(GetResult::Subtree(eof)));
        }
        let mut vr = lk.get(eof);
        let vn = unsafe { ValueNode::from_header(&*vr.header_ptr()) };
        return Ok(Step::Done(GetResult::Bytes(vn.value().to_vec())));
    }
    match node.get_branch(rest[0]) {
        Some(idx) => Ok(Step::Descend(Address::new(node.branch_region(), idx), &rest[1..])),
        None => Ok(Step::Done(GetResult::NotFound)),
    }
}

// ---- range counting --------------------------------------------------------

/// Keys in the subtree at `addr`, from the maintained descendant counts.
pub(crate) fn subtree_count(lk: &ReadLock, addr: Address) -> u64 {
    if addr.is_null() {
        return 0;
    }
    let mut r = lk.get(addr);
    let hdr = unsafe { &*r.header_ptr() };
    match hdr.node_type() {
        Some(NodeType::Value) => 1,
        Some(NodeType::Binary) => unsafe { BinaryNode::from_header(hdr) }.descendants(),
        Some(NodeType::Setlist) => unsafe { SetlistNode::from_header(hdr) }.descendants(),
        Some(NodeType::Full) => unsafe { FullNode::from_header(hdr) }.descendants(),
        None => 0,
    }
}

/// Count keys `k` with `lo <= k < hi` (either bound optional) without
/// walking subtrees that lie entirely inside the range.
pub(crate) fn count_range(
    lk: &ReadLock,
    addr: Address,
    lo: Option<&[u8]>,
    hi: Option<&[u8]>,
) -> u64 {
    if addr.is_null() {
        return 0;
    }
    if lo.is_none() && hi.is_none() {
        return subtree_count(lk, addr);
    }
    let mut r = lk.get(addr);
    let hdr = unsafe { &*r.header_ptr() };
    match hdr.node_type() {
        Some(NodeType::Value) => {
            let vn = unsafe { ValueNode::from_header(hdr) };
            in_range(vn.key(), lo, hi) as u64
        }
        Some(NodeType::Binary) => {
            let bn = unsafe { BinaryNode::from_header(hdr) };
            let from = lo.map_or(0, |l| bn.lower_bound_idx(l));
            let to = hi.map_or(bn.num_branches(), |h| bn.lower_bound_idx(h));
            (to.saturating_sub(from)) as u64
        }
        Some(NodeType::Setlist) => count_inner::<SetlistNode>(lk, hdr, lo, hi),
        Some(NodeType::Full) => count_inner::<FullNode>(lk, hdr, lo, hi),
        None => 0,
    }
}

fn in_range(k: &[u8], lo: Option<&[u8]>, hi: Option<&[u8]>) -> bool {
    lo.map_or(true, |l| k >= l) && hi.map_or(true, |h| k < h)
}

/// Clip a bound against a node prefix. `Ok(rest)` descends with the
/// remaining bound (`None` = already satisfied for the whole subtree);
/// `Err(())` means every key under the node falls outside the bound.
fn clip_bound<'b>(
    prefix: &[u8],
    bound: Option<&'b [u8]>,
    is_lower: bool,
) -> Result<Option<&'b [u8]>, ()> {
    let Some(b) = bound else { return Ok(None) };
    let m = common_prefix(prefix, b).len();
    if m < prefix.len() && m < b.len() {
        // strict order decided at the first mismatching byte
        let subtree_greater = prefix[m] > b[m];
        return if subtree_greater == is_lower { Ok(None) } else { Err(()) };
    }
    if b.len() <= prefix.len() {
        // bound exhausted inside the prefix: every key here extends it
        return if is_lower { Ok(None) } else { Err(()) };
    }
    Ok(Some(&b[prefix.len()..]))
}

fn count_inner<N: InnerNode>(
    lk: &ReadLock,
    hdr: &coral_nodes::NodeHeader,
    lo: Option<&[u8]>,
    hi: Option<&[u8]>,
) -> u64 {
    let node = unsafe { N::from_header(hdr) };
    let prefix = node.prefix();
    let Ok(lo) = clip_bound(prefix, lo, true) else { return 0 };
    let Ok(hi) = clip_bound(prefix, hi, false) else { return 0 };
    if lo.is_none() && hi.is_none() {
        return node.descendants();
    }
    let region = node.branch_region();
    let mut total = 0u64;
    // the empty suffix (eof value) sorts before every branch
    if node.has_eof_value()
        && lo.map_or(true, |l| l.is_empty())
        && hi.map_or(true, |h| !h.is_empty())
    {
        total += 1;
    }
    let mut branches = Vec::with_capacity(node.num_branches());
    node.visit_branches(&mut |b, i| branches.push((b, i)));
    for (b, idx) in branches {
        let child = Address::new(region, idx);
        let child_lo = match lo {
            None => None,
            Some(l) if l.is_empty() => None,
            Some(l) => {
                if b < l[0] {
                    continue;
                } else if b > l[0] {
                    None
                } else {
                    Some(&l[1..])
                }
            }
        };
        let child_hi = match hi {
            None => None,
            Some(h) if h.is_empty() => break,
            Some(h) => {
                if b > h[0] {
                    break;
                } else if b < h[0] {
                    None
                } else {
                    Some(&h[1..])
                }
            }
        };
        total += count_range(lk, child, child_lo, child_hi);
    }
    total
}

// ---- iterator --------------------------------------------------------------

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum FramePos {
    /// Positioned on the node's end-of-key value.
    Eof,
    /// Positioned on (or descending through) the branch with this byte.
    Branch(u8),
    /// Positioned on a binary-node entry.
    Entry(usize),
    /// Positioned on a leaf value node.
    Leaf,
}

#[derive(Clone)]
struct Frame {
    addr: Address,
    /// Key length before this node contributed anything.
    base: usize,
    pos: FramePos,
}

/// Ordered cursor over one trie. Keeps only addresses and key bytes, so it
/// survives compaction; the caller's root handle keeps the snapshot alive.
pub struct Iter<'s> {
    ses: &'s SegAllocSession,
    root: Address,
    stack: Vec<Frame>,
    key: Vec<u8>,
    valid: bool,
}

impl<'s> Iter<'s> {
    pub(crate) fn new(ses: &'s SegAllocSession, root: Address) -> Self {
        Self { ses, root, stack: Vec::new(), key: Vec::new(), valid: false }
    }

    pub fn valid(&self) -> bool {
        self.valid
    }

    /// The current key. Empty unless [`Self::valid`].
    pub fn key(&self) -> &[u8] {
        if self.valid {
            &self.key
        } else {
            &[]
        }
    }

    fn reset(&mut self) {
        self.stack.clear();
        self.key.clear();
        self.valid = false;
    }

    /// Position on the smallest key. Returns validity.
    pub fn first(&mut self) -> bool {
        self.reset();
        if self.root.is_null() {
            return false;
        }
        let lk = self.ses.lock();
        self.valid = self.descend_min(&lk, self.root);
        self.valid
    }

    /// Position on the largest key.
    pub fn last(&mut self) -> bool {
        self.reset();
        if self.root.is_null() {
            return false;
        }
        let lk = self.ses.lock();
        self.valid = self.descend_max(&lk, self.root);
        self.valid
    }

    /// Position on the first key `>= target`.
    pub fn lower_bound(&mut self, target: &[u8]) -> bool {
        self.reset();
        if self.root.is_null() {
            return false;
        }
        let lk = self.ses.lock();
        self.valid = self.seek(&lk, self.root, target);
        self.valid
    }

    /// Position on the first key `> target`.
    pub fn upper_bound(&mut self, target: &[u8]) -> bool {
        if !self.lower_bound(target) {
            return false;
        }
        if self.key == target {
            return self.next();
        }
        true
    }

    /// Advance to the next key in order.
    pub fn next(&mut self) -> bool {
        if !self.valid {
            return false;
        }
        let lk = self.ses.lock();
        self.valid = self.advance(&lk);
        self.valid
    }

    /// Step back to the previous key in order.
    pub fn prev(&mut self) -> bool {
        if !self.valid {
            return false;
        }
        let lk = self.ses.lock();
        self.valid = self.retreat(&lk);
        self.valid
    }

    /// The value bytes under the cursor.
    pub fn value(&self) -> Result<Vec<u8>, DbError> {
        match self.value_result()? {
            GetResult::Bytes(b) => Ok(b),
            GetResult::Subtree(_) => Err(DbError::SubtreeRequired),
            GetResult::NotFound => Err(DbError::KeyNotFound),
        }
    }

    /// True when the cursor sits on a nested subtree value.
    pub fn is_subtree(&self) -> bool {
        matches!(self.value_result(), Ok(GetResult::Subtree(_)))
    }

    /// The value under the cursor.
    pub(crate) fn value_result(&self) -> Result<GetResult, DbError> {
        if !self.valid {
            return Ok(GetResult::NotFound);
        }
        let lk = self.ses.lock();
        let f = self.stack.last().expect("valid cursor has a frame");
        let mut r = lk.get(f.addr);
        let hdr = unsafe { &*r.header_ptr() };
        match f.pos {
            FramePos::Leaf => {
                let vn = unsafe { ValueNode::from_header(hdr) };
                Ok(match vn.subtree_address() {
                    Some(s) => GetResult::Subtree(Address::from_u32(s)),
                    None => GetResult::Bytes(vn.value().to_vec()),
                })
            }
            FramePos::Entry(i) => {
                let bn = unsafe { BinaryNode::from_header(hdr) };
                Ok(match bn.get_value(i) {
                    BinaryValue::Inline(b) => GetResult::Bytes(b.to_vec()),
                    BinaryValue::ObjId(a) => {
                        let mut vr = lk.get(Address::from_u32(a));
                        let vn = unsafe { ValueNode::from_header(&*vr.header_ptr()) };
                        GetResult::Bytes(vn.value().to_vec())
                    }
                    BinaryValue::Subtree(a) => GetResult::Subtree(Address::from_u32(a)),
                })
            }
            FramePos::Eof => {
                let (eof, sub) = match hdr.node_type() {
                    Some(NodeType::Setlist) => {
                        let n = unsafe { SetlistNode::from_header(hdr) };
                        (Address::from_u32(n.eof_address()), n.eof_is_subtree())
                    }
                    Some(NodeType::Full) => {
                        let n = unsafe { FullNode::from_header(hdr) };
                        (Address::from_u32(n.eof_address()), n.eof_is_subtree())
                    }
                    _ => return Err(DbError::Corrupt("eof cursor on a non-inner node")),
                };
                if sub {
                    return Ok(GetResult::Subtree(eof));
                }
                let mut vr = lk.get(eof);
                let vn = unsafe { ValueNode::from_header(&*vr.header_ptr()) };
                Ok(GetResult::Bytes(vn.value().to_vec()))
            }
            FramePos::Branch(_) => Err(DbError::Corrupt("cursor stopped mid-descent")),
        }
    }

    // -- internals --

    fn with_inner<T>(
        &self,
        lk: &ReadLock,
        addr: Address,
        f: impl FnOnce(&dyn InnerNode) -> T,
    ) -> Option<T> {
        let mut r = lk.get(addr);
        let hdr = unsafe { &*r.header_ptr() };
        match hdr.node_type() {
            Some(NodeType::Setlist) => Some(f(unsafe { SetlistNode::from_header(hdr) })),
            Some(NodeType::Full) => Some(f(unsafe { FullNode::from_header(hdr) })),
            _ => None,
        }
    }

    /// Descend to the smallest key under `addr`, pushing frames.
    fn descend_min(&mut self, lk: &ReadLock, mut addr: Address) -> bool {
        loop {
            let base = self.key.len();
            let mut r = lk.get(addr);
            self.ses.note_read(addr, r.slot());
            let hdr = unsafe { &*r.header_ptr() };
            match hdr.node_type() {
                Some(NodeType::Value) => {
                    let vn = unsafe { ValueNode::from_header(hdr) };
                    self.key.extend_from_slice(vn.key());
                    self.stack.push(Frame { addr, base, pos: FramePos::Leaf });
                    return true;
                }
                Some(NodeType::Binary) => {
                    let bn = unsafe { BinaryNode::from_header(hdr) };
                    if bn.num_branches() == 0 {
                        return false;
                    }
                    self.key.extend_from_slice(bn.get_key(0));
                    self.stack.push(Frame { addr, base, pos: FramePos::Entry(0) });
                    return true;
                }
                Some(NodeType::Setlist) | Some(NodeType::Full) => {
                    let (prefix, eof, first, region) = self
                        .with_inner(lk, addr, |n| {
                            (
                                n.prefix().to_vec(),
                                n.has_eof_value(),
                                n.next_branch(0),
                                n.branch_region(),
                            )
                        })
                        .expect("type matched");
                    self.key.extend_from_slice(&prefix);
                    if eof {
                        self.stack.push(Frame { addr, base, pos: FramePos::Eof });
                        return true;
                    }
                    let Some((b, idx)) = first else { return false };
                    self.key.push(b);
                    self.stack.push(Frame { addr, base, pos: FramePos::Branch(b) });
                    addr = Address::new(region, idx);
                }
                None => return false,
            }
        }
    }

    /// Descend to the largest key under `addr`.
    fn descend_max(&mut self, lk: &ReadLock, mut addr: Address) -> bool {
        loop {
            let base = self.key.len();
            let mut r = lk.get(addr);
            self.ses.note_read(addr, r.slot());
            let hdr = unsafe { &*r.header_ptr() };
            match hdr.node_type() {
                Some(NodeType::Value) => {
                    let vn = unsafe { ValueNode::from_header(hdr) };
                    self.key.extend_from_slice(vn.key());
                    self.stack.push(Frame { addr, base, pos: FramePos::Leaf });
                    return true;
                }
                Some(NodeType::Binary) => {
                    let bn = unsafe { BinaryNode::from_header(hdr) };
                    let nb = bn.num_branches();
                    if nb == 0 {
                        return false;
                    }
                    self.key.extend_from_slice(bn.get_key(nb - 1));
                    self.stack.push(Frame { addr, base, pos: FramePos::Entry(nb - 1) });
                    return true;
                }
                Some(NodeType::Setlist) | Some(NodeType::Full) => {
                    let (prefix, eof, last, region) = self
                        .with_inner(lk, addr, |n| {
                            (
                                n.prefix().to_vec(),
                                n.has_eof_value(),
                                n.prev_branch(255),
                                n.branch_region(),
                            )
                        })
                        .expect("type matched");
                    self.key.extend_from_slice(&prefix);
                    match last {
                        Some((b, idx)) => {
                            self.key.push(b);
                            self.stack.push(Frame { addr, base, pos: FramePos::Branch(b) });
                            addr = Address::new(region, idx);
                        }
                        None if eof => {
                            self.stack.push(Frame { addr, base, pos: FramePos::Eof });
                            return true;
                        }
                        None => return false,
                    }
                }
                None => return false,
            }
        }
    }

    /// Pop/advance until a next key is found.
    fn advance(&mut self, lk: &ReadLock) -> bool {
        while let Some(frame) = self.stack.pop() {
            self.key.truncate(frame.base);
            match frame.pos {
                FramePos::Leaf => continue,
                FramePos::Entry(i) => {
                    let mut r = lk.get(frame.addr);
                    let hdr = unsafe { &*r.header_ptr() };
                    let bn = unsafe { BinaryNode::from_header(hdr) };
                    if i + 1 < bn.num_branches() {
                        self.key.extend_from_slice(bn.get_key(i + 1));
                        self.stack.push(Frame { pos: FramePos::Entry(i + 1), ..frame });
                        return true;
                    }
                }
                FramePos::Eof | FramePos::Branch(_) => {
                    let from = match frame.pos {
                        FramePos::Eof => 0u16,
                        FramePos::Branch(b) => b as u16 + 1,
                        _ => unreachable!(),
                    };
                    let (prefix, nxt, region) = self
                        .with_inner(lk, frame.addr, |n| {
                            (n.prefix().to_vec(), n.next_branch(from), n.branch_region())
                        })
                        .expect("inner frame");
                    if let Some((b, idx)) = nxt {
                        self.key.extend_from_slice(&prefix);
                        self.key.push(b);
                        self.stack.push(Frame { pos: FramePos::Branch(b), ..frame });
                        return self.descend_min(lk, Address::new(region, idx));
                    }
                }
            }
        }
        false
    }

    /// Pop/retreat until a previous key is found.
    fn retreat(&mut self, lk: &ReadLock) -> bool {
        while let Some(frame) = self.stack.pop() {
            self.key.truncate(frame.base);
            match frame.pos {
                FramePos::Leaf => continue,
                FramePos::Entry(i) => {
                    if i > 0 {
                        let mut r = lk.get(frame.addr);
                        let hdr = unsafe { &*r.header_ptr() };
                        let bn = unsafe { BinaryNode::from_header(hdr) };
                        self.key.extend_from_slice(bn.get_key(i - 1));
                        self.stack.push(Frame { pos: FramePos::Entry(i - 1), ..frame });
                        return true;
                    }
                }
                FramePos::Eof => continue,
                FramePos::Branch(b) => {
                    let found = self
                        .with_inner(lk, frame.addr, |n| {
                            (
                                n.prefix().to_vec(),
                                n.prev_branch(b as i32 - 1),
                                n.has_eof_value(),
                                n.branch_region(),
                            )
                        })
                        .expect("inner frame");
                    let (prefix, prv, eof, region) = found;
                    self.key.extend_from_slice(&prefix);
                    if let Some((pb, idx)) = prv {
                        self.key.push(pb);
                        self.stack.push(Frame { pos: FramePos::Branch(pb), ..frame });
                        return self.descend_max(lk, Address::new(region, idx));
                    }
                    if eof {
                        self.stack.push(Frame { pos: FramePos::Eof, ..frame });
                        return true;
                    }
                    self.key.truncate(frame.base);
                }
            }
        }
        false
    }

    /// Position on the first key `>= target` under `addr`.
    fn seek(&mut self, lk: &ReadLock, mut addr: Address, mut target: &[u8]) -> bool {
        loop {
            let base = self.key.len();
            let mut r = lk.get(addr);
            self.ses.note_read(addr, r.slot());
            let hdr = unsafe { &*r.header_ptr() };
            match hdr.node_type() {
                Some(NodeType::Value) => {
                    let vn = unsafe { ValueNode::from_header(hdr) };
                    if vn.key() >= target {
                        self.key.extend_from_slice(vn.key());
                        self.stack.push(Frame { addr, base, pos: FramePos::Leaf });
                        return true;
                    }
                    return self.advance(lk);
                }
                Some(NodeType::Binary) => {
                    let bn = unsafe { BinaryNode::from_header(hdr) };
                    let i = bn.lower_bound_idx(target);
                    if i < bn.num_branches() {
                        self.key.extend_from_slice(bn.get_key(i));
                        self.stack.push(Frame { addr, base, pos: FramePos::Entry(i) });
                        return true;
                    }
                    return self.advance(lk);
                }
                Some(NodeType::Setlist) | Some(NodeType::Full) => {
                    let (prefix, region) = self
                        .with_inner(lk, addr, |n| (n.prefix().to_vec(), n.branch_region()))
                        .expect("type matched");
                    let m = common_prefix(&prefix, target).len();
                    if m < prefix.len() {
                        // the whole subtree compares on its first divergent
                        // prefix byte
                        if m >= target.len() || prefix[m] > target[m] {
                            return self.descend_min(lk, addr);
                        }
                        return self.advance(lk);
                    }
                    let rest = &target[prefix.len()..];
                    if rest.is_empty() {
                        return self.descend_min(lk, addr);
                    }
                    self.key.extend_from_slice(&prefix);
                    // the eof key equals the prefix, which is < target here
                    let want = rest[0];
                    let nxt = self
                        .with_inner(lk, addr, |n| n.next_branch(want as u16))
                        .expect("type matched");
                    match nxt {
                        Some((b, idx)) if b == want => {
                            self.key.push(b);
                            self.stack.push(Frame { addr, base, pos: FramePos::Branch(b) });
                            addr = Address::new(region, idx);
                            target = &rest[1..];
                        }
                        Some((b, idx)) => {
                            self.key.push(b);
                            self.stack.push(Frame { addr, base, pos: FramePos::Branch(b) });
                            return self.descend_min(lk, Address::new(region, idx));
                        }
                        None => return self.advance(lk),
                    }
                }
                None => return false,
            }
        }
    }
}

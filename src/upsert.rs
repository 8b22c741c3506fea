//! The copy-on-write trie mutation kernel.
//!
//! Everything funnels through [`trie_upsert`]: a recursion over the node
//! variants that either mutates in place (the node's reference count is 1
//! and it hasn't been made durable) or produces an edited copy at a fresh
//! address. The contract at every level:
//!
//! - returning the same address means the node was edited in place (or its
//!   storage remade under the same address);
//! - returning a different address means the caller now owns the new node
//!   and must release its reference to the old one;
//! - returning null means the key removal emptied the node: the caller
//!   drops the branch and releases the old node.
//!
//! Clones retain the children they keep, so releasing the original
//! afterwards leaves every child's count correct.

use coral_nodes::binary::{BinaryNode, BinaryValue, MAX_BINARY_NODE_SIZE};
use coral_nodes::full::FullNode;
use coral_nodes::inner::InnerNode;
use coral_nodes::setlist::{SetlistNode, FULL_NODE_THRESHOLD};
use coral_nodes::value::{ValueInit, ValueNode};
use coral_nodes::{common_prefix, NodeHeader, NodeType};

use crate::seg_alloc::{object_checksum, ObjectRef, ReadLock};
use crate::{Address, DbError, MAX_KEY_LEN};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum Op {
    /// Fails with [`DbError::KeyAlreadyExists`] when the key is present.
    Insert,
    /// Fails with [`DbError::KeyNotFound`] when the key is absent.
    Update,
    Upsert,
    /// Fails with [`DbError::KeyNotFound`] when the key is absent.
    Remove,
}

#[derive(Clone, Copy)]
pub(crate) enum Value<'a> {
    Bytes(&'a [u8]),
    /// Ownership of one reference moves into the trie when stored.
    Subtree(Address),
}

/// What the operation did, for the session-level return values.
#[derive(Default, Debug)]
pub(crate) struct Outcome {
    pub delta_keys: i64,
    /// Size of the previously stored value when the key existed
    /// (0 for subtree entries).
    pub old_size: Option<usize>,
}

struct Ctx<'v> {
    op: Op,
    val: Value<'v>,
    delta: i64,
    old: Option<usize>,
}

/// Apply one operation to the trie rooted at `root` (null = empty trie).
/// Returns the (possibly new) root address.
pub(crate) fn trie_upsert(
    lk: &ReadLock,
    root: Address,
    key: &[u8],
    op: Op,
    val: Value,
) -> Result<(Address, Outcome), DbError> {
    if key.len() > MAX_KEY_LEN {
        return Err(DbError::KeyTooLong(key.len()));
    }
    let mut ctx = Ctx { op, val, delta: 0, old: None };
    let new_root = if root.is_null() {
        match op {
            Op::Update | Op::Remove => return Err(DbError::KeyNotFound),
            Op::Insert | Op::Upsert => {
                ctx.delta = 1;
                let region = lk.allocator().addrs.new_region();
                make_value(lk, region, key, val)?
            }
        }
    } else {
        // on an address change (or null) the caller owns releasing the old
        // root, the same contract every recursion level follows
        upsert_node(lk, &mut ctx, true, root, key, root.region())?
    };
    Ok((new_root, Outcome { delta_keys: ctx.delta, old_size: ctx.old }))
}

/// Release one reference on `addr`; on the last one, cascade into children,
/// credit the dead bytes, and free the address.
pub(crate) fn release_node(lk: &ReadLock, addr: Address) {
    if addr.is_null() {
        return;
    }
    let mut r = lk.get(addr);
    let Some((loc, _size)) = r.release() else {
        return;
    };
    let hdr = unsafe { &*lk.allocator().object_ptr(loc) };
    match hdr.node_type() {
        Some(NodeType::Value) => {
            let vn = unsafe { ValueNode::from_header(hdr) };
            if let Some(sub) = vn.subtree_address() {
                release_node(lk, Address::from_u32(sub));
            }
        }
        Some(NodeType::Binary) => {
            let bn = unsafe { BinaryNode::from_header(hdr) };
            for i in 0..bn.num_branches() {
                match bn.get_value(i) {
                    BinaryValue::ObjId(a) | BinaryValue::Subtree(a) => {
                        release_node(lk, Address::from_u32(a));
                    }
                    BinaryValue::Inline(_) => {}
                }
            }
        }
        Some(NodeType::Setlist) => release_inner_children::<SetlistNode>(lk, hdr),
        Some(NodeType::Full) => release_inner_children::<FullNode>(lk, hdr),
        None => debug_assert!(false, "releasing object with bad type tag"),
    }
    lk.allocator().addrs.free(addr);
}

fn release_inner_children<N: InnerNode>(lk: &ReadLock, hdr: &NodeHeader) {
    let node = unsafe { N::from_header(hdr) };
    if node.has_eof_value() {
        release_node(lk, Address::from_u32(node.eof_address()));
    }
    let region = node.branch_region();
    let mut children = Vec::with_capacity(node.num_branches());
    node.visit_branches(&mut |_, idx| children.push(idx));
    for idx in children {
        release_node(lk, Address::new(region, idx));
    }
}

// ---- allocation helpers ----------------------------------------------------

fn finish_checksum(lk: &ReadLock, hdr: *mut NodeHeader) {
    if lk.allocator().config().checksum_on_modify {
        unsafe { (*hdr).checksum = object_checksum(hdr) };
    }
}

/// Allocate and publish a fresh node.
fn make_node(
    lk: &ReadLock,
    region: u16,
    size: usize,
    ntype: NodeType,
    build: impl FnOnce(&mut [u8], Address),
) -> Result<Address, DbError> {
    let a = lk.allocator();
    let (addr, slot) = a.addrs.alloc(region)?;
    let (loc, hdr) = lk.session().alloc_data(size, addr, 0, ntype, None)?;
    let buf = unsafe { std::slice::from_raw_parts_mut(hdr as *mut u8, size) };
    build(buf, addr);
    finish_checksum(lk, hdr);
    slot.init_object(ntype, loc);
    Ok(addr)
}

/// Replace a uniquely held node's storage under the same logical address.
/// The old bytes become dead space; children are untouched (their ownership
/// moves to the rebuilt node).
fn remake_node(
    lk: &ReadLock,
    r: &mut ObjectRef,
    size: usize,
    ntype: NodeType,
    build: impl FnOnce(&mut [u8], Address),
) -> Result<Address, DbError> {
    debug_assert_eq!(r.ref_count(), 1);
    let addr = r.address();
    let old_loc = r.loc().expect("remake of a freed node");
    let old_size = unsafe { (*lk.allocator().object_ptr(old_loc)).size() };
    let (loc, hdr) = lk.session().alloc_data(size, addr, 0, ntype, None)?;
    let buf = unsafe { std::slice::from_raw_parts_mut(hdr as *mut u8, size) };
    build(buf, addr);
    finish_checksum(lk, hdr);
    r.slot().init_object(ntype, loc);
    lk.allocator().state().meta[old_loc.segment as usize].add_free_space(old_size as u32);
    Ok(addr)
}

/// Leaf value node carrying a remainder key.
fn make_value(lk: &ReadLock, region: u16, key: &[u8], val: Value) -> Result<Address, DbError> {
    let init = match val {
        Value::Bytes(b) => ValueInit::Bytes(b),
        Value::Subtree(a) => ValueInit::Subtree(a.to_u32()),
    };
    let size = ValueNode::alloc_size(key.len(), init.stored_len());
    make_node(lk, region, size, NodeType::Value, |buf, addr| {
        ValueNode::init(buf, addr.to_u32(), 0, key, init);
    })
}

/// An end-of-key slot value: subtrees are stored by address, bytes get a
/// keyless value node. Returns `(address, is_subtree)`.
fn make_eof_value(lk: &ReadLock, region: u16, val: Value) -> Result<(Address, bool), DbError> {
    match val {
        Value::Subtree(a) => Ok((a, true)),
        Value::Bytes(_) => Ok((make_value(lk, region, b"", val)?, false)),
    }
}

/// How an entry value is materialized inside a binary node.
enum OwnedValue {
    Inline(Vec<u8>),
    ObjId(Address),
    Subtree(Address),
}

impl OwnedValue {
    fn as_binary_value(&self) -> BinaryValue<'_> {
        match self {
            Self::Inline(b) => BinaryValue::Inline(b),
            Self::ObjId(a) => BinaryValue::ObjId(a.to_u32()),
            Self::Subtree(a) => BinaryValue::Subtree(a.to_u32()),
        }
    }

    fn stored_len(&self) -> usize {
        match self {
            Self::Inline(b) => b.len(),
            _ => 4,
        }
    }
}

/// Turn the operation's value into a binary-node entry, promoting
/// non-inlinable bytes to a value node colocated with the node's children.
fn prepare_entry_value(lk: &ReadLock, region: u16, val: Value) -> Result<OwnedValue, DbError> {
    match val {
        Value::Subtree(a) => Ok(OwnedValue::Subtree(a)),
        Value::Bytes(b) if BinaryNode::can_inline(b.len()) => Ok(OwnedValue::Inline(b.to_vec())),
        Value::Bytes(_) => Ok(OwnedValue::ObjId(make_value(lk, region, b"", val)?)),
    }
}

/// Reported size of an existing binary entry's value.
fn entry_report_size(lk: &ReadLock, bn: &BinaryNode, i: usize) -> usize {
    match bn.get_value(i) {
        BinaryValue::Inline(b) => b.len(),
        BinaryValue::ObjId(a) => {
            let mut vr = lk.get(Address::from_u32(a));
            unsafe { ValueNode::from_header(&*vr.header_ptr()) }.value_size()
        }
        BinaryValue::Subtree(_) => 0,
    }
}

fn entry_child(bn: &BinaryNode, i: usize) -> Option<Address> {
    match bn.get_value(i) {
        BinaryValue::ObjId(a) | BinaryValue::Subtree(a) => Some(Address::from_u32(a)),
        BinaryValue::Inline(_) => None,
    }
}

/// Retain every obj-id/subtree child of `bn` except entry `skip`; used when
/// a shared clone copies the entries.
fn retain_binary_children(lk: &ReadLock, bn: &BinaryNode, skip: Option<usize>) {
    for i in 0..bn.num_branches() {
        if Some(i) == skip {
            continue;
        }
        if let Some(a) = entry_child(bn, i) {
            lk.get(a).retain();
        }
    }
}

// ---- dispatch --------------------------------------------------------------

fn upsert_node(
    lk: &ReadLock,
    ctx: &mut Ctx,
    parent_unique: bool,
    addr: Address,
    key: &[u8],
    hint: u16,
) -> Result<Address, DbError> {
    let mut r = lk.get(addr);
    let unique = parent_unique && r.ref_count() == 1 && !r.meta().is_const();
    match r.node_type() {
        Some(NodeType::Value) => upsert_value(lk, ctx, unique, &mut r, key, hint),
        Some(NodeType::Binary) => upsert_binary(lk, ctx, unique, &mut r, key, hint),
        Some(NodeType::Setlist) => upsert_inner::<SetlistNode>(lk, ctx, unique, &mut r, key, hint),
        Some(NodeType::Full) => upsert_inner::<FullNode>(lk, ctx, unique, &mut r, key, hint),
        None => Err(DbError::Corrupt("upsert reached an object with a bad type tag")),
    }
}

// ---- value nodes -----------------------------------------------------------

fn upsert_value(
    lk: &ReadLock,
    ctx: &mut Ctx,
    unique: bool,
    r: &mut ObjectRef,
    key: &[u8],
    hint: u16,
) -> Result<Address, DbError> {
    // copy out everything we need before any mutation can alias the node
    let (same_key, old_key, old_val, old_sub, capacity, old_report) = {
        let vn = unsafe { ValueNode::from_header(&*r.header_ptr()) };
        (
            vn.key() == key,
            vn.key().to_vec(),
            vn.value().to_vec(),
            vn.subtree_address().map(Address::from_u32),
            vn.value_capacity(),
            if vn.is_subtree() { 0 } else { vn.value_size() },
        )
    };

    if same_key {
        match ctx.op {
            Op::Insert => Err(DbError::KeyAlreadyExists),
            Op::Remove => {
                ctx.old = Some(old_report);
                ctx.delta = -1;
                // caller releases the node; the cascade frees any subtree
                Ok(Address::NULL)
            }
            Op::Update | Op::Upsert => {
                ctx.old = Some(old_report);
                match ctx.val {
                    Value::Bytes(b) if unique && b.len() <= capacity => {
                        {
                            let mut g = r.modify();
                            let vm = unsafe { ValueNode::from_header_mut(&mut *g.header_ptr()) };
                            vm.set_value(b).expect("capacity checked");
                        }
                        if let Some(sub) = old_sub {
                            release_node(lk, sub);
                        }
                        Ok(r.address())
                    }
                    Value::Subtree(sub) if unique => {
                        {
                            let mut g = r.modify();
                            let vm = unsafe { ValueNode::from_header_mut(&mut *g.header_ptr()) };
                            vm.set_subtree(sub.to_u32());
                        }
                        if let Some(old) = old_sub {
                            if old != sub {
                                release_node(lk, old);
                            }
                        }
                        Ok(r.address())
                    }
                    Value::Bytes(b) if unique => {
                        // grow under the same address
                        let size = ValueNode::alloc_size(key.len(), b.len());
                        let a = remake_node(lk, r, size, NodeType::Value, |buf, addr| {
                            ValueNode::init(buf, addr.to_u32(), 0, key, ValueInit::Bytes(b));
                        })?;
                        if let Some(sub) = old_sub {
                            release_node(lk, sub);
                        }
                        Ok(a)
                    }
                    val => {
                        // shared: fresh node; the old one (and any subtree it
                        // holds) is released by the caller's cascade
                        make_value(lk, hint, key, val)
                    }
                }
            }
        }
    } else {
        match ctx.op {
            Op::Remove | Op::Update => return Err(DbError::KeyNotFound),
            Op::Insert | Op::Upsert => {}
        }
        ctx.delta = 1;
        // two distinct keys: this leaf becomes a binary node holding both
        let bregion = lk.allocator().addrs.new_region();
        let old_entry = match old_sub {
            Some(sub) => {
                if !unique {
                    lk.get(sub).retain();
                }
                OwnedValue::Subtree(sub)
            }
            None if BinaryNode::can_inline(old_val.len()) => OwnedValue::Inline(old_val),
            None => OwnedValue::ObjId(make_value(lk, bregion, b"", Value::Bytes(&old_val))?),
        };
        let new_entry = prepare_entry_value(lk, bregion, ctx.val)?;
        let data = old_key.len() + old_entry.stored_len() + key.len() + new_entry.stored_len();
        let size = BinaryNode::alloc_size(2, data);
        let key_vec = key.to_vec();
        let build = move |buf: &mut [u8], addr: Address| {
            let bn = BinaryNode::init(buf, addr.to_u32(), 0, bregion);
            let first_old = old_key < key_vec;
            let (ka, va, kb, vb) = if first_old {
                (&old_key, &old_entry, &key_vec, &new_entry)
            } else {
                (&key_vec, &new_entry, &old_key, &old_entry)
            };
            bn.insert(0, ka, va.as_binary_value()).expect("sized for both entries");
            bn.insert(1, kb, vb.as_binary_value()).expect("sized for both entries");
        };
        if unique {
            remake_node(lk, r, size, NodeType::Binary, build)
        } else {
            make_node(lk, hint, size, NodeType::Binary, build)
        }
    }
}

// ---- binary nodes ----------------------------------------------------------

fn upsert_binary(
    lk: &ReadLock,
    ctx: &mut Ctx,
    unique: bool,
    r: &mut ObjectRef,
    key: &[u8],
    hint: u16,
) -> Result<Address, DbError> {
    let bn = unsafe { BinaryNode::from_header(&*r.header_ptr()) };
    let found = bn.find_key_idx(key);
    match (found, ctx.op) {
        (Some(_), Op::Insert) => Err(DbError::KeyAlreadyExists),
        (None, Op::Remove) | (None, Op::Update) => Err(DbError::KeyNotFound),
        (Some(i), Op::Remove) => {
            ctx.old = Some(entry_report_size(lk, bn, i));
            ctx.delta = -1;
            if bn.num_branches() == 1 {
                // node dissolves; caller releases it (cascade frees children)
                return Ok(Address::NULL);
            }
            if unique {
                let victim = entry_child(bn, i);
                {
                    let mut g = r.modify();
                    let bm = unsafe { BinaryNode::from_header_mut(&mut *g.header_ptr()) };
                    bm.remove(i);
                }
                if let Some(v) = victim {
                    release_node(lk, v);
                }
                Ok(r.address())
            } else {
                let size = BinaryNode::alloc_size(
                    bn.num_branches() - 1,
                    bn.live_data_size(),
                );
                retain_binary_children(lk, bn, Some(i));
                make_node(lk, hint, size, NodeType::Binary, |buf, addr| {
                    bn.clone_into(buf, addr.to_u32(), 0, Some(i));
                })
            }
        }
        (Some(i), Op::Update | Op::Upsert) => {
            ctx.old = Some(entry_report_size(lk, bn, i));
            let new_len = match ctx.val {
                Value::Bytes(b) if BinaryNode::can_inline(b.len()) => b.len(),
                _ => 4,
            };
            let key_len = bn.get_key(i).len();
            // a compacted clone must fit both the old record (copied live)
            // and the appended replacement
            let grown = BinaryNode::alloc_size(
                bn.num_branches(),
                bn.live_data_size() + 4 + key_len + new_len,
            );
            let fits_in_place = unique
                && (new_len == bn.get_value(i).stored_len()
                    || bn.can_reinsert(key_len, new_len));
            if !fits_in_place && grown > MAX_BINARY_NODE_SIZE {
                // hopeless as a binary node: refactor to a radix node and
                // run the operation against that
                return refactor_and_recurse(lk, ctx, unique, r, key, hint);
            }
            let old_child = entry_child(bn, i);
            let new_entry = prepare_entry_value(lk, bn.branch_region(), ctx.val)?;
            if unique {
                if new_len == bn.get_value(i).stored_len() {
                    let mut g = r.modify();
                    let bm = unsafe { BinaryNode::from_header_mut(&mut *g.header_ptr()) };
                    bm.set_value(i, new_entry.as_binary_value());
                } else if bn.can_reinsert(key_len, new_len) {
                    let mut g = r.modify();
                    let bm = unsafe { BinaryNode::from_header_mut(&mut *g.header_ptr()) };
                    bm.reinsert(i, new_entry.as_binary_value()).expect("space checked");
                } else {
                    remake_node(lk, r, grown, NodeType::Binary, |buf, addr| {
                        let dst = bn.clone_into(buf, addr.to_u32(), 0, None);
                        dst.mark_reallocated();
                        dst.reinsert(i, new_entry.as_binary_value())
                            .expect("grown clone holds the new value");
                    })?;
                }
                if let Some(c) = old_child {
                    release_node(lk, c);
                }
                Ok(r.address())
            } else {
                retain_binary_children(lk, bn, Some(i));
                make_node(lk, hint, grown, NodeType::Binary, |buf, addr| {
                    let dst = bn.clone_into(buf, addr.to_u32(), 0, None);
                    dst.mark_reallocated();
                    dst.reinsert(i, new_entry.as_binary_value())
                        .expect("grown clone holds the new value");
                })
            }
        }
        (None, Op::Insert | Op::Upsert) => {
            ctx.delta = 1;
            let new_len = match ctx.val {
                Value::Bytes(b) if BinaryNode::can_inline(b.len()) => b.len(),
                _ => 4,
            };
            let grown = BinaryNode::alloc_size(
                bn.num_branches() + 1,
                bn.live_data_size() + key.len() + new_len,
            );
            let direct = unique && bn.can_insert(key.len(), new_len);
            if !direct && grown > MAX_BINARY_NODE_SIZE {
                // too much fan-out for a flat table: refactor into a radix
                // node, then insert into it
                return refactor_and_recurse(lk, ctx, unique, r, key, hint);
            }
            let entry = prepare_entry_value(lk, bn.branch_region(), ctx.val)?;
            let idx = bn.lower_bound_idx(key);
            if direct {
                let mut g = r.modify();
                let bm = unsafe { BinaryNode::from_header_mut(&mut *g.header_ptr()) };
                bm.insert(idx, key, entry.as_binary_value()).expect("space checked");
                drop(g);
                Ok(r.address())
            } else if unique {
                remake_node(lk, r, grown, NodeType::Binary, |buf, addr| {
                    let dst = bn.clone_into(buf, addr.to_u32(), 0, None);
                    dst.mark_reallocated();
                    dst.insert(idx, key, entry.as_binary_value())
                        .expect("grown clone holds the new entry");
                })
            } else {
                retain_binary_children(lk, bn, None);
                make_node(lk, hint, grown, NodeType::Binary, |buf, addr| {
                    let dst = bn.clone_into(buf, addr.to_u32(), 0, None);
                    dst.mark_reallocated();
                    dst.insert(idx, key, entry.as_binary_value())
                        .expect("grown clone holds the new entry");
                })
            }
        }
    }
}

/// Refactor, then re-run the pending operation against the new radix node.
/// The refactored node is unique by construction, so the recursion only
/// returns a different address when a prefix split replaced it, in which
/// case it must be released here unless the caller already owns it (the
/// unique refactor keeps the original address).
fn refactor_and_recurse(
    lk: &ReadLock,
    ctx: &mut Ctx,
    unique: bool,
    r: &mut ObjectRef,
    key: &[u8],
    hint: u16,
) -> Result<Address, DbError> {
    let ra = refactor(lk, unique, r, hint)?;
    let result = upsert_node(lk, ctx, true, ra, key, hint)?;
    if result != ra && ra != r.address() {
        release_node(lk, ra);
    }
    Ok(result)
}

// ---- refactor: binary → radix ---------------------------------------------

/// Rebuild an over-full binary node as a set-list or full node whose prefix
/// is the longest common prefix of its keys. Entries sharing their first
/// post-prefix byte become a smaller binary node; loners become value
/// nodes. Children land in a fresh branch region.
fn refactor(
    lk: &ReadLock,
    unique: bool,
    r: &mut ObjectRef,
    hint: u16,
) -> Result<Address, DbError> {
    let bn = unsafe { BinaryNode::from_header(&*r.header_ptr()) };
    let nb = bn.num_branches();
    debug_assert!(nb > 1);
    let cpre = common_prefix(bn.get_key(0), bn.get_key(nb - 1)).to_vec();
    let has_eof = bn.get_key(0).len() == cpre.len();

    let mut freq = [0u32; 256];
    for i in (has_eof as usize)..nb {
        let k = bn.get_key(i);
        debug_assert!(k.len() > cpre.len());
        freq[k[cpre.len()] as usize] += 1;
    }

    let a = lk.allocator();
    let bregion = a.addrs.new_region();
    let mut branches: Vec<(u8, u16)> = Vec::new();
    let mut obsolete: Vec<Address> = Vec::new(); // unique path: copied-out obj nodes

    let mut i = has_eof as usize;
    while i < nb {
        let byte = bn.get_key(i)[cpre.len()];
        let to = i + freq[byte as usize] as usize;
        let child = if to - i > 1 {
            // a smaller binary node holding the group, keys cut past the
            // branch byte
            let mut data = 0usize;
            for j in i..to {
                data += bn.get_key(j).len() - cpre.len() - 1 + bn.get_value(j).stored_len();
            }
            let size = BinaryNode::alloc_size(to - i, data);
            let inner_region = bn.branch_region();
            make_node(lk, bregion, size, NodeType::Binary, |buf, addr| {
                let dst = BinaryNode::init(buf, addr.to_u32(), 0, inner_region);
                for (out, j) in (i..to).enumerate() {
                    let k = &bn.get_key(j)[cpre.len() + 1..];
                    dst.insert(out, k, bn.get_value(j)).expect("sized for the group");
                    if !unique {
                        if let Some(c) = entry_child(bn, j) {
                            lk.get(c).retain();
                        }
                    }
                }
            })?
        } else {
            let suffix = &bn.get_key(i)[cpre.len() + 1..];
            match bn.get_value(i) {
                BinaryValue::Inline(b) => make_value(lk, bregion, suffix, Value::Bytes(b))?,
                BinaryValue::ObjId(raw) => {
                    // the value bytes move into a keyed leaf
                    let va = Address::from_u32(raw);
                    let bytes = {
                        let mut vr = lk.get(va);
                        unsafe { ValueNode::from_header(&*vr.header_ptr()) }.value().to_vec()
                    };
                    if unique {
                        obsolete.push(va);
                    }
                    make_value(lk, bregion, suffix, Value::Bytes(&bytes))?
                }
                BinaryValue::Subtree(raw) => {
                    let sub = Address::from_u32(raw);
                    if !unique {
                        lk.get(sub).retain();
                    }
                    make_value(lk, bregion, suffix, Value::Subtree(sub))?
                }
            }
        };
        debug_assert_eq!(child.region(), bregion);
        branches.push((byte, child.index()));
        i = to;
    }

    let eof = if has_eof {
        match bn.get_value(0) {
            BinaryValue::Inline(b) => Some((make_value(lk, bregion, b"", Value::Bytes(b))?, false)),
            BinaryValue::ObjId(raw) => {
                // an eof value node is exactly what's already allocated
                let va = Address::from_u32(raw);
                if !unique {
                    lk.get(va).retain();
                }
                Some((va, false))
            }
            BinaryValue::Subtree(raw) => {
                let sub = Address::from_u32(raw);
                if !unique {
                    lk.get(sub).retain();
                }
                Some((sub, true))
            }
        }
    } else {
        None
    };

    let descendants = nb as u64;
    let new_addr = if branches.len() >= FULL_NODE_THRESHOLD {
        let size = FullNode::alloc_size(cpre.len());
        let build = |buf: &mut [u8], addr: Address| {
            let fnode = FullNode::init(buf, addr.to_u32(), 0, &cpre, bregion);
            for &(b, idx) in &branches {
                fnode.add_branch(b, idx);
            }
            install_eof(fnode, eof);
            fnode.add_descendants(descendants as i64);
        };
        if unique {
            remake_node(lk, r, size, NodeType::Full, build)?
        } else {
            make_node(lk, hint, size, NodeType::Full, build)?
        }
    } else {
        let cap = SetlistNode::grow_cap(branches.len());
        let size = SetlistNode::alloc_size(cpre.len(), cap);
        let build = |buf: &mut [u8], addr: Address| {
            let sl = SetlistNode::init(buf, addr.to_u32(), 0, &cpre, bregion, cap);
            for &(b, idx) in &branches {
                sl.add_branch(b, idx);
            }
            install_eof(sl, eof);
            sl.add_descendants(descendants as i64);
        };
        if unique {
            remake_node(lk, r, size, NodeType::Setlist, build)?
        } else {
            make_node(lk, hint, size, NodeType::Setlist, build)?
        }
    };
    for va in obsolete {
        release_node(lk, va);
    }
    Ok(new_addr)
}

fn install_eof<N: InnerNode>(node: &mut N, eof: Option<(Address, bool)>) {
    match eof {
        Some((a, true)) => node.set_eof_subtree(a.to_u32()),
        Some((a, false)) => node.set_eof(a.to_u32()),
        None => {}
    }
}

// ---- inner (radix) nodes ---------------------------------------------------

/// Placement details the kernel needs beyond the shared inner protocol.
trait InnerPlace: InnerNode {
    const NODE_TYPE: NodeType;

    fn place_size(prefix_len: usize, branch_cap: usize) -> usize;
    fn place<'b>(
        buf: &'b mut [u8],
        addr: u32,
        prefix: &[u8],
        branch_region: u16,
        branch_cap: usize,
    ) -> &'b mut Self;
}

impl InnerPlace for SetlistNode {
    const NODE_TYPE: NodeType = NodeType::Setlist;

    fn place_size(prefix_len: usize, branch_cap: usize) -> usize {
        Self::alloc_size(prefix_len, branch_cap)
    }

    fn place<'b>(
        buf: &'b mut [u8],
        addr: u32,
        prefix: &[u8],
        branch_region: u16,
        branch_cap: usize,
    ) -> &'b mut Self {
        Self::init(buf, addr, 0, prefix, branch_region, branch_cap)
    }
}

impl InnerPlace for FullNode {
    const NODE_TYPE: NodeType = NodeType::Full;

    fn place_size(prefix_len: usize, _branch_cap: usize) -> usize {
        Self::alloc_size(prefix_len)
    }

    fn place<'b>(
        buf: &'b mut [u8],
        addr: u32,
        prefix: &[u8],
        branch_region: u16,
        _branch_cap: usize,
    ) -> &'b mut Self {
        Self::init(buf, addr, 0, prefix, branch_region)
    }
}

/// Snapshot of an inner node, taken before any mutation.
struct InnerView {
    prefix: Vec<u8>,
    branch_region: u16,
    branches: Vec<(u8, u16)>,
    eof: Option<(Address, bool)>,
    descendants: u64,
}

fn view_inner<N: InnerNode>(node: &N) -> InnerView {
    let mut branches = Vec::with_capacity(node.num_branches());
    node.visit_branches(&mut |b, i| branches.push((b, i)));
    InnerView {
        prefix: node.prefix().to_vec(),
        branch_region: node.branch_region(),
        branches,
        eof: node
            .has_eof_value()
            .then(|| (Address::from_u32(node.eof_address()), node.eof_is_subtree())),
        descendants: node.descendants(),
    }
}

/// Build a copy of an inner node (same variant) with one branch optionally
/// skipped and the eof optionally skipped, then let `edit` adjust it.
/// Shared copies retain the children they keep.
#[allow(clippy::too_many_arguments)]
fn rebuild_inner<DST: InnerPlace>(
    lk: &ReadLock,
    r: &mut ObjectRef,
    unique: bool,
    hint: u16,
    view: &InnerView,
    branch_cap: usize,
    skip_branch: Option<u8>,
    skip_eof: bool,
    desc_delta: i64,
    edit: impl FnOnce(&mut DST),
) -> Result<Address, DbError> {
    let size = DST::place_size(view.prefix.len(), branch_cap);
    let descendants = (view.descendants as i64 + desc_delta) as u64;
    let build = |buf: &mut [u8], addr: Address| {
        let dst = DST::place(buf, addr.to_u32(), &view.prefix, view.branch_region, branch_cap);
        for &(b, idx) in &view.branches {
            if Some(b) == skip_branch {
                continue;
            }
            dst.add_branch(b, idx);
        }
        if !skip_eof {
            install_eof(dst, view.eof);
        }
        dst.add_descendants(descendants as i64);
        edit(dst);
    };
    let addr = if unique {
        remake_node(lk, r, size, DST::NODE_TYPE, build)?
    } else {
        let a = make_node(lk, hint, size, DST::NODE_TYPE, build)?;
        for &(b, idx) in &view.branches {
            if Some(b) == skip_branch {
                continue;
            }
            lk.get(Address::new(view.branch_region, idx)).retain();
        }
        if !skip_eof {
            if let Some((e, _)) = view.eof {
                lk.get(e).retain();
            }
        }
        a
    };
    Ok(addr)
}

fn upsert_inner<N: InnerPlace>(
    lk: &ReadLock,
    ctx: &mut Ctx,
    unique: bool,
    r: &mut ObjectRef,
    key: &[u8],
    hint: u16,
) -> Result<Address, DbError> {
    let view = {
        let node = unsafe { N::from_header(&*r.header_ptr()) };
        view_inner(node)
    };
    let cpre_len = common_prefix(&view.prefix, key).len();

    if cpre_len < view.prefix.len() {
        return split_prefix::<N>(lk, ctx, r, key, hint, &view, cpre_len);
    }
    if cpre_len >= key.len() {
        return upsert_eof::<N>(lk, ctx, unique, r, hint, &view);
    }

    let byte = key[cpre_len];
    let remainder = &key[cpre_len + 1..];
    let existing = view.branches.iter().find(|(b, _)| *b == byte).map(|&(_, i)| i);

    match existing {
        Some(idx) => {
            let child = Address::new(view.branch_region, idx);
            let new_child = upsert_node(lk, ctx, unique, child, remainder, view.branch_region)?;
            if new_child == child && ctx.delta == 0 {
                return Ok(r.address());
            }
            if unique {
                {
                    let mut g = r.modify();
                    let nm = unsafe { N::from_header_mut(&mut *g.header_ptr()) };
                    if new_child.is_null() {
                        nm.remove_branch(byte);
                    } else if new_child != child {
                        debug_assert_eq!(new_child.region(), view.branch_region);
                        nm.set_branch(byte, new_child.index());
                    }
                    if ctx.delta != 0 {
                        nm.add_descendants(ctx.delta);
                    }
                }
                if new_child != child {
                    release_node(lk, child);
                }
                let node = unsafe { N::from_header(&*r.header_ptr()) };
                if node.num_branches() == 0 && !node.has_eof_value() {
                    return Ok(Address::NULL);
                }
                Ok(r.address())
            } else {
                if new_child.is_null() && view.branches.len() == 1 && view.eof.is_none() {
                    // the clone would be empty; skip making it
                    return Ok(Address::NULL);
                }
                rebuild_inner::<N>(
                    lk,
                    r,
                    false,
                    hint,
                    &view,
                    view.branches.len(),
                    Some(byte),
                    false,
                    ctx.delta,
                    |dst| {
                        if !new_child.is_null() {
                            dst.add_branch(byte, new_child.index());
                        }
                    },
                )
            }
        }
        None => {
            match ctx.op {
                Op::Remove | Op::Update => return Err(DbError::KeyNotFound),
                Op::Insert | Op::Upsert => {}
            }
            ctx.delta = 1;
            let leaf = make_value(lk, view.branch_region, remainder, ctx.val)?;
            let can_in_place = unique && {
                let node = unsafe { N::from_header(&*r.header_ptr()) };
                node.can_add_branch()
            };
            if can_in_place {
                let mut g = r.modify();
                let nm = unsafe { N::from_header_mut(&mut *g.header_ptr()) };
                nm.add_branch(byte, leaf.index());
                nm.add_descendants(1);
                drop(g);
                return Ok(r.address());
            }
            // out of branch room: grow the set-list, or promote it to a
            // full node past the threshold
            if N::NODE_TYPE == NodeType::Setlist
                && view.branches.len() + 1 >= FULL_NODE_THRESHOLD
            {
                rebuild_inner::<FullNode>(lk, r, unique, hint, &view, 0, None, false, 1, |dst| {
                    dst.add_branch(byte, leaf.index());
                })
            } else {
                let cap = SetlistNode::grow_cap(view.branches.len() + 1);
                rebuild_inner::<N>(lk, r, unique, hint, &view, cap, None, false, 1, |dst| {
                    dst.add_branch(byte, leaf.index());
                })
            }
        }
    }
}

/// The key diverges inside this node's prefix: demote the node under a new
/// two-branch set-list whose prefix is the common part. The demotion is
/// always a clone (the address must move to a fresh region), so unique and
/// shared callers are handled identically.
#[allow(clippy::too_many_arguments)]
fn split_prefix<N: InnerPlace>(
    lk: &ReadLock,
    ctx: &mut Ctx,
    r: &mut ObjectRef,
    key: &[u8],
    hint: u16,
    view: &InnerView,
    cpre_len: usize,
) -> Result<Address, DbError> {
    match ctx.op {
        Op::Remove | Op::Update => return Err(DbError::KeyNotFound),
        Op::Insert | Op::Upsert => {}
    }
    ctx.delta = 1;
    let a = lk.allocator();
    // the demoted node needs a region distinct from both its old home and
    // its own children's region
    let mut new_reg = a.addrs.new_region();
    while new_reg == r.address().region() || new_reg == view.branch_region {
        new_reg = a.addrs.new_region();
    }
    let demote_byte = view.prefix[cpre_len];
    let demoted_prefix = view.prefix[cpre_len + 1..].to_vec();

    // clone (never remake: the address must move to the new region) with
    // children retained; releasing the original afterwards rebalances
    let size = N::place_size(demoted_prefix.len(), view.branches.len().max(1));
    let demoted = make_node(lk, new_reg, size, N::NODE_TYPE, |buf, addr| {
        let dst = N::place(
            buf,
            addr.to_u32(),
            &demoted_prefix,
            view.branch_region,
            view.branches.len().max(1),
        );
        for &(b, idx) in &view.branches {
            dst.add_branch(b, idx);
        }
        install_eof(dst, view.eof);
        dst.add_descendants(view.descendants as i64);
    })?;
    for &(_, idx) in &view.branches {
        lk.get(Address::new(view.branch_region, idx)).retain();
    }
    if let Some((e, _)) = view.eof {
        lk.get(e).retain();
    }
    // the original node is released by the caller (its address changes),
    // which cancels the retains above

    let cpre = &key[..cpre_len];
    let parent_desc = (view.descendants + 1) as i64;
    if key.len() == cpre_len {
        // the new key ends exactly at the split: it becomes the eof value
        let (eof_addr, eof_sub) = make_eof_value(lk, new_reg, ctx.val)?;
        let size = SetlistNode::alloc_size(cpre_len, 2);
        make_node(lk, hint, size, NodeType::Setlist, |buf, addr| {
            let sl = SetlistNode::init(buf, addr.to_u32(), 0, cpre, new_reg, 2);
            install_eof(sl, Some((eof_addr, eof_sub)));
            sl.add_branch(demote_byte, demoted.index());
            sl.add_descendants(parent_desc);
        })
    } else {
        let leaf = make_value(lk, new_reg, &key[cpre_len + 1..], ctx.val)?;
        let size = SetlistNode::alloc_size(cpre_len, 2);
        make_node(lk, hint, size, NodeType::Setlist, |buf, addr| {
            let sl = SetlistNode::init(buf, addr.to_u32(), 0, cpre, new_reg, 2);
            sl.add_branch(demote_byte, demoted.index());
            sl.add_branch(key[cpre_len], leaf.index());
            sl.add_descendants(parent_desc);
        })
    }
}

/// The key terminates on this node: operate on the end-of-key slot.
fn upsert_eof<N: InnerPlace>(
    lk: &ReadLock,
    ctx: &mut Ctx,
    unique: bool,
    r: &mut ObjectRef,
    hint: u16,
    view: &InnerView,
) -> Result<Address, DbError> {
    match (view.eof, ctx.op) {
        (Some(_), Op::Insert) => Err(DbError::KeyAlreadyExists),
        (None, Op::Remove) | (None, Op::Update) => Err(DbError::KeyNotFound),
        (Some((eof_addr, eof_sub)), Op::Remove) => {
            ctx.old = Some(if eof_sub { 0 } else { eof_value_size(lk, eof_addr) });
            ctx.delta = -1;
            if view.branches.is_empty() {
                // nothing left; caller releases us and the cascade frees
                // the eof value
                return Ok(Address::NULL);
            }
            if unique {
                {
                    let mut g = r.modify();
                    let nm = unsafe { N::from_header_mut(&mut *g.header_ptr()) };
                    nm.clear_eof();
                    nm.add_descendants(-1);
                }
                release_node(lk, eof_addr);
                Ok(r.address())
            } else {
                rebuild_inner::<N>(
                    lk,
                    r,
                    false,
                    hint,
                    view,
                    view.branches.len(),
                    None,
                    true, // drop the eof; the caller's release cascades it
                    -1,
                    |_| {},
                )
            }
        }
        (Some((eof_addr, eof_sub)), Op::Update | Op::Upsert) => {
            ctx.old = Some(if eof_sub { 0 } else { eof_value_size(lk, eof_addr) });
            // in-place rewrite of an exclusively held eof value node
            if let (Value::Bytes(b), false) = (ctx.val, eof_sub) {
                let mut er = lk.get(eof_addr);
                if unique && er.ref_count() == 1 && !er.meta().is_const() {
                    let capacity = {
                        let vn = unsafe { ValueNode::from_header(&*er.header_ptr()) };
                        vn.value_capacity()
                    };
                    if b.len() <= capacity {
                        let mut g = er.modify();
                        let vm = unsafe { ValueNode::from_header_mut(&mut *g.header_ptr()) };
                        vm.set_value(b).expect("capacity checked");
                        drop(g);
                        return Ok(r.address());
                    }
                }
            }
            let (new_eof, new_sub) = make_eof_value(lk, view.branch_region, ctx.val)?;
            if unique {
                {
                    let mut g = r.modify();
                    let nm = unsafe { N::from_header_mut(&mut *g.header_ptr()) };
                    install_eof(nm, Some((new_eof, new_sub)));
                }
                release_node(lk, eof_addr);
                Ok(r.address())
            } else {
                rebuild_inner::<N>(
                    lk,
                    r,
                    false,
                    hint,
                    view,
                    view.branches.len(),
                    None,
                    true,
                    0,
                    |dst| install_eof(dst, Some((new_eof, new_sub))),
                )
            }
        }
        (None, Op::Insert | Op::Upsert) => {
            ctx.delta = 1;
            let (new_eof, new_sub) = make_eof_value(lk, view.branch_region, ctx.val)?;
            if unique {
                let mut g = r.modify();
                let nm = unsafe { N::from_header_mut(&mut *g.header_ptr()) };
                install_eof(nm, Some((new_eof, new_sub)));
                nm.add_descendants(1);
                drop(g);
                Ok(r.address())
            } else {
                rebuild_inner::<N>(lk, r, false, hint, view, view.branches.len(), None, false, 1, |dst| {
                    install_eof(dst, Some((new_eof, new_sub)));
                })
            }
        }
    }
}

fn eof_value_size(lk: &ReadLock, addr: Address) -> usize {
    let mut vr = lk.get(addr);
    unsafe { ValueNode::from_header(&*vr.header_ptr()) }.value_size()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::iter::{count_range, subtree_count, trie_get, GetResult};
    use crate::seg_alloc::{SegAllocSession, SegAllocator};
    use crate::segment::{RuntimeConfig, SyncType};
    use std::sync::Arc;

    struct Harness {
        _dir: tempfile::TempDir,
        alloc: Arc<SegAllocator>,
        ses: SegAllocSession,
        root: Address,
    }

    impl Harness {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let cfg = RuntimeConfig { sync_mode: SyncType::None, ..Default::default() };
            let alloc = SegAllocator::open(dir.path(), &cfg).unwrap();
            let ses = SegAllocSession::new(&alloc);
            Self { _dir: dir, alloc, ses, root: Address::NULL }
        }

        fn apply(&mut self, key: &[u8], op: Op, val: Value) -> Result<Outcome, DbError> {
            let lk = self.ses.lock();
            let (new_root, out) = trie_upsert(&lk, self.root, key, op, val)?;
            if new_root != self.root {
                let old = std::mem::replace(&mut self.root, new_root);
                if !old.is_null() {
                    release_node(&lk, old);
                }
            }
            Ok(out)
        }

        fn upsert(&mut self, key: &[u8], val: &[u8]) {
            self.apply(key, Op::Upsert, Value::Bytes(val)).unwrap();
        }

        fn remove(&mut self, key: &[u8]) -> Result<Outcome, DbError> {
            self.apply(key, Op::Remove, Value::Bytes(&[]))
        }

        fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
            let lk = self.ses.lock();
            match trie_get(&lk, self.root, key).unwrap() {
                GetResult::Bytes(b) => Some(b),
                GetResult::NotFound => None,
                GetResult::Subtree(_) => panic!("unexpected subtree"),
            }
        }

        fn count(&self) -> u64 {
            let lk = self.ses.lock();
            subtree_count(&lk, self.root)
        }

        fn root_type(&self) -> NodeType {
            let lk = self.ses.lock();
            lk.get(self.root).node_type().unwrap()
        }
    }

    #[test]
    fn insert_then_get() {
        let mut h = Harness::new();
        h.upsert(b"banana", b"yellow");
        assert_eq!(h.get(b"banana").as_deref(), Some(b"yellow".as_slice()));
        assert_eq!(h.get(b"apple"), None);
        assert_eq!(h.count(), 1);
        assert_eq!(h.root_type(), NodeType::Value);
    }

    #[test]
    fn second_key_converts_to_binary() {
        let mut h = Harness::new();
        h.upsert(b"banana", b"yellow");
        h.upsert(b"apple", b"red");
        assert_eq!(h.root_type(), NodeType::Binary);
        assert_eq!(h.get(b"banana").as_deref(), Some(b"yellow".as_slice()));
        assert_eq!(h.get(b"apple").as_deref(), Some(b"red".as_slice()));
        assert_eq!(h.count(), 2);
        // sorted entries
        let lk = h.ses.lock();
        let mut r = lk.get(h.root);
        let bn = unsafe { BinaryNode::from_header(&*r.header_ptr()) };
        assert!(bn.get_key(0) < bn.get_key(1));
        bn.validate().unwrap();
    }

    #[test]
    fn strict_ops_enforce_presence() {
        let mut h = Harness::new();
        assert!(matches!(h.remove(b"nope"), Err(DbError::KeyNotFound)));
        h.upsert(b"k", b"v1");
        assert!(matches!(
            h.apply(b"k", Op::Insert, Value::Bytes(b"v2")),
            Err(DbError::KeyAlreadyExists)
        ));
        assert!(matches!(
            h.apply(b"other", Op::Update, Value::Bytes(b"v2")),
            Err(DbError::KeyNotFound)
        ));
        let out = h.apply(b"k", Op::Update, Value::Bytes(b"longer value")).unwrap();
        assert_eq!(out.old_size, Some(2));
        assert_eq!(h.get(b"k").as_deref(), Some(b"longer value".as_slice()));
        // two distinct keys in the trie never happened; still a value node
        assert_eq!(h.count(), 1);
    }

    #[test]
    fn binary_overflow_refactors_to_radix() {
        let mut h = Harness::new();
        // 200 keys with an empty common prefix and ~200 distinct lead bytes
        let mut keys = Vec::new();
        for i in 0..200u32 {
            let b = (i % 250) as u8;
            keys.push(vec![b, (i / 250) as u8, 0x33, b ^ 0x5A]);
        }
        keys.sort();
        keys.dedup();
        for k in &keys {
            h.upsert(k, b"0123456789abcdef");
        }
        // a flat 4 KiB table cannot hold them; the root must have refactored
        let t = h.root_type();
        assert!(t == NodeType::Full || t == NodeType::Setlist, "got {t:?}");
        assert_eq!(h.count(), keys.len() as u64);
        for k in &keys {
            assert_eq!(h.get(k).as_deref(), Some(b"0123456789abcdef".as_slice()), "key {k:?}");
        }
        // prefix of the radix root is empty
        let lk = h.ses.lock();
        let mut r = lk.get(h.root);
        if t == NodeType::Full {
            let n = unsafe { FullNode::from_header(&*r.header_ptr()) };
            assert!(n.prefix().is_empty());
            assert!(n.num_branches() >= FULL_NODE_THRESHOLD);
        }
    }

    #[test]
    fn shared_prefix_builds_and_splits() {
        let mut h = Harness::new();
        // enough same-prefix keys to overflow a binary node and refactor
        // into a set-list whose prefix is "prefix/"
        for i in 0..60u32 {
            let key = format!("prefix/{i}");
            h.upsert(key.as_bytes(), &[0xAB; 100]);
        }
        assert_eq!(h.root_type(), NodeType::Setlist);
        {
            let lk = h.ses.lock();
            let mut r = lk.get(h.root);
            let n = unsafe { SetlistNode::from_header(&*r.header_ptr()) };
            assert_eq!(n.prefix(), b"prefix/");
            n.validate().unwrap();
            assert_eq!(n.descendants(), 60);
        }
        // a key diverging inside the prefix forces a split
        h.upsert(b"postfix", b"value");
        assert_eq!(h.root_type(), NodeType::Setlist);
        {
            let lk = h.ses.lock();
            let mut r = lk.get(h.root);
            let n = unsafe { SetlistNode::from_header(&*r.header_ptr()) };
            assert_eq!(n.prefix(), b"p");
            assert_eq!(n.num_branches(), 2);
            assert_eq!(n.descendants(), 61);
        }
        assert_eq!(h.get(b"postfix").as_deref(), Some(b"value".as_slice()));
        for i in 0..60u32 {
            let key = format!("prefix/{i}");
            assert!(h.get(key.as_bytes()).is_some(), "lost {key}");
        }
    }

    #[test]
    fn eof_values_on_nested_keys() {
        let mut h = Harness::new();
        // a key that is exactly the shared prefix of many longer ones ends
        // up in the radix node's end-of-key slot after the refactor
        h.upsert(b"ab", b"prefix itself");
        for i in 0..50u32 {
            let key = format!("ab{i}");
            h.upsert(key.as_bytes(), &[0x11; 100]);
        }
        assert_eq!(h.root_type(), NodeType::Setlist);
        {
            let lk = h.ses.lock();
            let mut r = lk.get(h.root);
            let n = unsafe { SetlistNode::from_header(&*r.header_ptr()) };
            assert_eq!(n.prefix(), b"ab");
            assert!(n.has_eof_value());
        }
        assert_eq!(h.count(), 51);
        assert_eq!(h.get(b"ab").as_deref(), Some(b"prefix itself".as_slice()));

        // rewrite and then drop the eof value
        h.upsert(b"ab", b"rewritten");
        assert_eq!(h.get(b"ab").as_deref(), Some(b"rewritten".as_slice()));
        let out = h.remove(b"ab").unwrap();
        assert_eq!(out.old_size, Some(9));
        assert_eq!(h.get(b"ab"), None);
        assert_eq!(h.count(), 50);
        assert_eq!(h.get(b"ab7").as_deref(), Some([0x11; 100].as_slice()));
    }

    #[test]
    fn remove_everything_dissolves_the_trie() {
        let mut h = Harness::new();
        let keys: Vec<String> = (0..40).map(|i| format!("key-{i:03}")).collect();
        for k in &keys {
            h.upsert(k.as_bytes(), b"some value here");
        }
        for k in &keys {
            let out = h.remove(k.as_bytes()).unwrap();
            assert_eq!(out.delta_keys, -1);
        }
        assert!(h.root.is_null());
        assert_eq!(h.count(), 0);
        // every address went back to the allocator
        assert_eq!(h.alloc.addrs.count(), 0);
    }

    #[test]
    fn large_values_promote_to_value_nodes() {
        let mut h = Harness::new();
        let big = vec![0x5Au8; 5000];
        h.upsert(b"small", b"x");
        h.upsert(b"big", &big);
        assert_eq!(h.get(b"big").as_deref(), Some(big.as_slice()));
        // shrink it back to inline
        h.upsert(b"big", b"tiny");
        assert_eq!(h.get(b"big").as_deref(), Some(b"tiny".as_slice()));
        assert_eq!(h.count(), 2);
    }

    #[test]
    fn snapshot_survives_writes() {
        let mut h = Harness::new();
        h.upsert(b"stable", b"before");
        h.upsert(b"other", b"one");
        // pin the current root the way a reader session would
        let snapshot = h.root;
        {
            let lk = h.ses.lock();
            lk.get(snapshot).retain();
        }

        h.upsert(b"stable", b"after");
        h.upsert(b"brand", b"new");
        assert_ne!(h.root, snapshot, "CoW must move the root under a snapshot");

        let lk = h.ses.lock();
        match trie_get(&lk, snapshot, b"stable").unwrap() {
            GetResult::Bytes(b) => assert_eq!(b, b"before"),
            other => panic!("snapshot lost its value: {other:?}"),
        }
        assert!(matches!(trie_get(&lk, snapshot, b"brand").unwrap(), GetResult::NotFound));
        assert_eq!(subtree_count(&lk, snapshot), 2);
        release_node(&lk, snapshot);
    }

    #[test]
    fn subtree_as_value() {
        let mut h = Harness::new();
        // build a detached subtree
        let lk = h.ses.lock();
        let (sub, _) =
            trie_upsert(&lk, Address::NULL, b"k1", Op::Upsert, Value::Bytes(b"v1")).unwrap();
        let (sub, _) = trie_upsert(&lk, sub, b"k2", Op::Upsert, Value::Bytes(b"v2")).unwrap();
        drop(lk);

        h.upsert(b"plain", b"bytes");
        h.apply(b"nested", Op::Upsert, Value::Subtree(sub)).unwrap();

        let lk = h.ses.lock();
        let got = trie_get(&lk, h.root, b"nested").unwrap();
        let GetResult::Subtree(found) = got else {
            panic!("expected subtree, got {got:?}")
        };
        assert_eq!(found, sub);
        match trie_get(&lk, found, b"k1").unwrap() {
            GetResult::Bytes(b) => assert_eq!(b, b"v1"),
            other => panic!("nested lookup failed: {other:?}"),
        }
        drop(lk);

        // removing the entry releases the whole nested trie
        h.remove(b"nested").unwrap();
        h.remove(b"plain").unwrap();
        assert_eq!(h.alloc.addrs.count(), 0);
    }

    #[test]
    fn descendant_counts_and_ranges() {
        let mut h = Harness::new();
        // enough volume to refactor into a radix tree (prefix "k")
        for i in 0..400u32 {
            h.upsert(format!("k{i:03}").as_bytes(), b"0123456789abcdef");
        }
        assert_eq!(h.count(), 400);
        assert_ne!(h.root_type(), NodeType::Binary);
        let lk = h.ses.lock();
        assert_eq!(count_range(&lk, h.root, Some(b"k000"), Some(b"k010")), 10);
        assert_eq!(count_range(&lk, h.root, Some(b"k100"), None), 300);
        assert_eq!(count_range(&lk, h.root, None, Some(b"k050")), 50);
        assert_eq!(count_range(&lk, h.root, Some(b"a"), Some(b"z")), 400);
        assert_eq!(count_range(&lk, h.root, Some(b"x"), Some(b"z")), 0);
        assert_eq!(count_range(&lk, h.root, Some(b"k0995"), Some(b"k1005")), 1);
        assert_eq!(count_range(&lk, h.root, Some(b"k123"), Some(b"k321")), 198);
    }

    #[test]
    fn random_ops_match_reference_map() {
        use rand::{rngs::StdRng, Rng, SeedableRng};
        let mut h = Harness::new();
        let mut model = std::collections::BTreeMap::<Vec<u8>, Vec<u8>>::new();
        let mut rng = StdRng::seed_from_u64(0x0c0a11ab);
        for step in 0..4000u32 {
            let key = format!("key-{:03}", rng.gen_range(0..500)).into_bytes();
            match rng.gen_range(0..10) {
                0..=5 => {
                    let val = vec![rng.gen::<u8>(); rng.gen_range(0..200)];
                    h.upsert(&key, &val);
                    model.insert(key, val);
                }
                6..=8 => {
                    let ours = h.remove(&key);
                    let theirs = model.remove(&key);
                    assert_eq!(ours.is_ok(), theirs.is_some(), "step {step}");
                }
                _ => {
                    assert_eq!(h.get(&key), model.get(&key).cloned(), "step {step}");
                }
            }
        }
        assert_eq!(h.count(), model.len() as u64);
        for (k, v) in &model {
            assert_eq!(h.get(k).as_deref(), Some(v.as_slice()));
        }
    }
}

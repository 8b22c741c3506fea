//! The database: named top roots, sessions, and write transactions.
//!
//! A write transaction owns its root's write mutex, runs the mutation
//! kernel against a private copy-on-write root, and publishes the new root
//! address atomically on commit, after the data below it was made durable.
//! Readers pin a snapshot by retaining a root handle; their session epoch
//! keeps any segment they might still reach out of the recycler.

use std::io::Write as IoWrite;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use byteorder::{ByteOrder, LittleEndian};

use crate::iter::{count_range, subtree_count, trie_get, GetResult, Iter};
use crate::mapping::Mapping;
use crate::seg_alloc::{checksum_ok, SegAllocSession, SegAllocator};
use crate::upsert::{release_node, trie_upsert, Op, Value};
use crate::{Address, DbError, NUM_TOP_ROOTS};

pub use crate::segment::{RuntimeConfig, SyncType};

const DB_MAGIC: u64 = 0x6c61_726f_6364_621f;
const DB_VERSION: u32 = 1;
const DB_FILE_SIZE: usize = 8192;

/// The mapped `db` file: magic, shutdown marker, and the top-root table.
#[repr(C)]
struct DatabaseMemory {
    magic: u64,
    version: u32,
    clean_shutdown: AtomicU32,
    top_root: [AtomicU64; NUM_TOP_ROOTS],
}

pub(crate) struct DbInner {
    dir: PathBuf,
    mem: Mapping,
    pub(crate) alloc: Arc<SegAllocator>,
    root_locks: Vec<Mutex<()>>,
    /// Guards the brief copy of a top-root word so retain can't race a
    /// publish-then-release.
    root_change: Mutex<()>,
    _lock_file: std::fs::File,
}

impl DbInner {
    fn dbm(&self) -> &DatabaseMemory {
        unsafe { &*(self.mem.as_ptr() as *const DatabaseMemory) }
    }
}

impl Drop for DbInner {
    fn drop(&mut self) {
        self.alloc.stop_threads();
        self.alloc.sync(SyncType::Full);
        if let Err(e) = self.alloc.flush_header() {
            log::warn!("flushing allocator header on shutdown failed: {e}");
        }
        self.dbm().clean_shutdown.store(1, Ordering::Release);
        if let Err(e) = self.mem.flush() {
            log::warn!("flushing database header on shutdown failed: {e}");
        }
    }
}

/// An open database. Cheap to clone handles out of via sessions; dropping
/// the last piece performs a clean shutdown.
pub struct Database {
    inner: Arc<DbInner>,
}

impl Database {
    /// Create a fresh database in `dir` (the directory may exist, a
    /// database in it may not).
    pub fn create<P: AsRef<Path>>(dir: P, config: RuntimeConfig) -> Result<Self, DbError> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;
        if dir.join("db").exists() {
            return Err(DbError::DirectoryExists);
        }
        Self::open_impl(dir, Some(config))
    }

    /// Open an existing database with its stored configuration.
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self, DbError> {
        let dir = dir.as_ref();
        if !dir.join("db").exists() {
            return Err(DbError::InvalidFileFormat);
        }
        Self::open_impl(dir, None)
    }

    fn open_impl(dir: &Path, create: Option<RuntimeConfig>) -> Result<Self, DbError> {
        use fs4::fs_std::FileExt;
        let lock_file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(dir.join("lock"))?;
        lock_file.try_lock_exclusive().map_err(DbError::Lock)?;

        let mem = Mapping::open(&dir.join("db"), DB_FILE_SIZE)?;
        let fresh = {
            let mut magic_buf = [0u8; 8];
            unsafe {
                std::ptr::copy_nonoverlapping(mem.as_ptr(), magic_buf.as_mut_ptr(), 8);
            }
            LittleEndian::read_u64(&magic_buf) == 0
        };
        if fresh {
            if create.is_none() {
                return Err(DbError::InvalidFileFormat);
            }
            unsafe {
                let p = mem.as_ptr();
                LittleEndian::write_u32(std::slice::from_raw_parts_mut(p.add(8), 4), DB_VERSION);
                LittleEndian::write_u32(std::slice::from_raw_parts_mut(p.add(12), 4), 1); // clean
                LittleEndian::write_u64(std::slice::from_raw_parts_mut(p, 8), DB_MAGIC);
            }
        }

        // validate before building the database value: its Drop writes the
        // clean-shutdown marker, which must never land in a foreign file
        {
            let mut head = [0u8; 12];
            unsafe {
                std::ptr::copy_nonoverlapping(mem.as_ptr(), head.as_mut_ptr(), 12);
            }
            if LittleEndian::read_u64(&head[..8]) != DB_MAGIC
                || LittleEndian::read_u32(&head[8..]) != DB_VERSION
            {
                return Err(DbError::InvalidFileFormat);
            }
        }

        let config = create.unwrap_or_default();
        let alloc = SegAllocator::open(dir, &config)?;
        let inner = Arc::new(DbInner {
            dir: dir.to_path_buf(),
            mem,
            alloc,
            root_locks: (0..NUM_TOP_ROOTS).map(|_| Mutex::new(())).collect(),
            root_change: Mutex::new(()),
            _lock_file: lock_file,
        });
        let dbm = inner.dbm();
        debug_assert!(dbm.magic == DB_MAGIC && dbm.version == DB_VERSION);

        let was_clean = dbm.clean_shutdown.swap(0, Ordering::AcqRel) == 1;
        if !was_clean {
            log::warn!(
                "database {:?} was not shut down cleanly; rebuilding segment statistics",
                inner.dir
            );
            recover_statistics(&inner)?;
        }
        inner.mem.flush()?;
        inner.alloc.start_threads();
        Ok(Self { inner })
    }

    pub fn start_read_session(&self) -> ReadSession {
        ReadSession {
            db: self.inner.clone(),
            ses: SegAllocSession::new(&self.inner.alloc),
        }
    }

    pub fn start_write_session(&self) -> WriteSession {
        WriteSession {
            db: self.inner.clone(),
            ses: SegAllocSession::new(&self.inner.alloc),
        }
    }

    pub fn get_runtime_config(&self) -> RuntimeConfig {
        self.inner.alloc.state().config.load()
    }

    /// Store new tunables; background loops pick them up on their next
    /// iteration.
    pub fn set_runtime_config(&self, cfg: RuntimeConfig) {
        self.inner.alloc.state().config.store(&cfg);
    }

    pub fn sync(&self, st: SyncType) {
        self.inner.alloc.sync(st);
    }

    /// Dump allocator and segment statistics.
    pub fn print_stats(&self, out: &mut dyn IoWrite, detail: bool) -> std::io::Result<()> {
        let a = &self.inner.alloc;
        let s = a.state();
        writeln!(out, "segments: {} total", a.num_segments())?;
        writeln!(
            out,
            "  free: {}  mlocked: {}  ready-buffer usage: {}",
            s.provider.free_count.load(Ordering::Relaxed),
            s.provider.mlock_count.load(Ordering::Relaxed),
            a.ready().usage(),
        )?;
        writeln!(out, "sessions: {} active", s.sessions.active_sessions())?;
        writeln!(out, "addresses: {} allocated", a.addrs.count())?;
        writeln!(
            out,
            "read-cache: {} bytes promoted",
            s.total_promoted_bytes.load(Ordering::Relaxed)
        )?;
        writeln!(
            out,
            "recycle: {} freed all-time, {} awaiting reader epochs",
            s.segments_freed.load(Ordering::Relaxed),
            s.recycle.len(),
        )?;
        if detail {
            writeln!(out, "  seg   alloc_pos   free_space  age        vage  flags")?;
            for seg in 0..a.num_segments() {
                let m = &s.meta[seg as usize];
                writeln!(
                    out,
                    "  {:>4}  {:>9}  {:>10}  {:>9}  {:>10}  {}{}",
                    seg,
                    m.data_end(),
                    m.free_space(),
                    if m.age() == u64::MAX { -1i64 } else { m.age() as i64 },
                    m.vage(),
                    if m.is_alloc() { 'A' } else { '-' },
                    if m.is_pinned() { 'P' } else { '-' },
                )?;
            }
        }
        Ok(())
    }
}

/// Rebuild per-segment free-space accounting by walking every top root,
/// optionally verifying checksums.
fn recover_statistics(inner: &Arc<DbInner>) -> Result<(), DbError> {
    let a = &inner.alloc;
    let verify = {
        let c = a.state().config.load();
        c.checksum_on_modify || c.checksum_on_compact
    };
    let ses = SegAllocSession::new(a);
    let lk = ses.lock();
    let mut live = std::collections::HashMap::<u32, u64>::new();
    let mut seen = std::collections::HashSet::<Address>::new();
    for i in 0..NUM_TOP_ROOTS {
        let root = Address::from_u32(inner.dbm().top_root[i].load(Ordering::Acquire) as u32);
        if !root.is_null() {
            walk_live(&lk, root, &mut seen, &mut live, verify);
        }
    }
    for seg in 0..a.num_segments() {
        let m = &a.state().meta[seg as usize];
        let used = live.get(&seg).copied().unwrap_or(0);
        let end = m.data_end() as u64;
        m.set_free_space(end.saturating_sub(used) as u32);
        // sessions died with the process; nothing is mid-allocation anymore
        m.set_alloc(false);
    }
    Ok(())
}

fn walk_live(
    lk: &crate::seg_alloc::ReadLock,
    addr: Address,
    seen: &mut std::collections::HashSet<Address>,
    live: &mut std::collections::HashMap<u32, u64>,
    verify: bool,
) {
    use coral_nodes::binary::{BinaryNode, BinaryValue};
    use coral_nodes::full::FullNode;
    use coral_nodes::inner::InnerNode;
    use coral_nodes::setlist::SetlistNode;
    use coral_nodes::value::ValueNode;
    use coral_nodes::NodeType;

    if addr.is_null() || !seen.insert(addr) {
        return;
    }
    let mut r = lk.get(addr);
    let Some(loc) = r.loc() else { return };
    let hdr_ptr = r.header_ptr();
    let hdr = unsafe { &*hdr_ptr };
    *live.entry(loc.segment).or_default() += hdr.size() as u64;
    if verify && !checksum_ok(hdr_ptr) {
        log::warn!("checksum mismatch at {addr} during recovery walk");
    }
    let mut children = Vec::new();
    match hdr.node_type() {
        Some(NodeType::Value) => {
            let vn = unsafe { ValueNode::from_header(hdr) };
            if let Some(s) = vn.subtree_address() {
                children.push(Address::from_u32(s));
            }
        }
        Some(NodeType::Binary) => {
            let bn = unsafe { BinaryNode::from_header(hdr) };
            for i in 0..bn.num_branches() {
                match bn.get_value(i) {
                    BinaryValue::ObjId(a) | BinaryValue::Subtree(a) => {
                        children.push(Address::from_u32(a));
                    }
                    BinaryValue::Inline(_) => {}
                }
            }
        }
        Some(NodeType::Setlist) => collect_inner::<SetlistNode>(hdr, &mut children),
        Some(NodeType::Full) => collect_inner::<FullNode>(hdr, &mut children),
        None => return,
    }
    for c in children {
        walk_live(lk, c, seen, live, verify);
    }
}

fn collect_inner<N: coral_nodes::inner::InnerNode>(
    hdr: &coral_nodes::NodeHeader,
    out: &mut Vec<Address>,
) {
    let node = unsafe { N::from_header(hdr) };
    if node.has_eof_value() {
        out.push(Address::from_u32(node.eof_address()));
    }
    let region = node.branch_region();
    node.visit_branches(&mut |_, idx| out.push(Address::new(region, idx)));
}

// ---- handles ---------------------------------------------------------------

/// A movable, reference-counted owner of a trie root (or subtree) address.
pub struct NodeHandle {
    addr: Address,
    alloc: Arc<SegAllocator>,
}

impl NodeHandle {
    pub(crate) fn retained(addr: Address, alloc: &Arc<SegAllocator>) -> Self {
        if !addr.is_null() {
            alloc.addrs.slot(addr).retain();
        }
        Self { addr, alloc: alloc.clone() }
    }

    /// Wrap an address whose reference we already own.
    pub(crate) fn owned(addr: Address, alloc: &Arc<SegAllocator>) -> Self {
        Self { addr, alloc: alloc.clone() }
    }

    pub(crate) fn address(&self) -> Address {
        self.addr
    }

    /// A handle over no keys at all.
    pub fn is_empty(&self) -> bool {
        self.addr.is_null()
    }
}

impl Clone for NodeHandle {
    fn clone(&self) -> Self {
        Self::retained(self.addr, &self.alloc)
    }
}

impl Drop for NodeHandle {
    fn drop(&mut self) {
        if self.addr.is_null() {
            return;
        }
        // a short-lived session pins the epoch for the release cascade
        let ses = SegAllocSession::new(&self.alloc);
        let lk = ses.lock();
        release_node(&lk, self.addr);
    }
}

// ---- read sessions ---------------------------------------------------------

/// A lightweight reader: costs one session slot and nothing else.
pub struct ReadSession {
    db: Arc<DbInner>,
    ses: SegAllocSession,
}

impl ReadSession {
    /// Pin the current state of a named root.
    pub fn get_root(&self, index: usize) -> Result<NodeHandle, DbError> {
        if index >= NUM_TOP_ROOTS {
            return Err(DbError::IndexOutOfRange(index as u32));
        }
        let _g = self.db.root_change.lock().unwrap();
        let raw = self.db.dbm().top_root[index].load(Ordering::Relaxed);
        Ok(NodeHandle::retained(Address::from_u32(raw as u32), &self.db.alloc))
    }

    pub fn get(&self, root: &NodeHandle, key: &[u8]) -> Result<Option<Vec<u8>>, DbError> {
        let lk = self.ses.lock();
        match trie_get(&lk, root.address(), key)? {
            GetResult::NotFound => Ok(None),
            GetResult::Bytes(b) => Ok(Some(b)),
            GetResult::Subtree(_) => Err(DbError::SubtreeRequired),
        }
    }

    /// Fetch a nested trie stored under `key`.
    pub fn get_subtree(&self, root: &NodeHandle, key: &[u8]) -> Result<Option<NodeHandle>, DbError> {
        let lk = self.ses.lock();
        match trie_get(&lk, root.address(), key)? {
            GetResult::NotFound => Ok(None),
            GetResult::Bytes(_) => Err(DbError::SubtreeForbidden),
            GetResult::Subtree(a) => Ok(Some(NodeHandle::retained(a, &self.db.alloc))),
        }
    }

    /// Keys in `[lo, hi)`; either bound may be `None` for unbounded.
    pub fn count_keys(
        &self,
        root: &NodeHandle,
        lo: Option<&[u8]>,
        hi: Option<&[u8]>,
    ) -> u64 {
        let lk = self.ses.lock();
        if lo.is_none() && hi.is_none() {
            return subtree_count(&lk, root.address());
        }
        count_range(&lk, root.address(), lo, hi)
    }

    /// Ordered cursor over the handle's trie.
    pub fn iter<'a>(&'a self, root: &'a NodeHandle) -> Iter<'a> {
        Iter::new(&self.ses, root.address())
    }

    pub(crate) fn subtree_handle(&self, addr: Address) -> NodeHandle {
        NodeHandle::retained(addr, &self.db.alloc)
    }
}

// ---- write sessions --------------------------------------------------------

pub struct WriteSession {
    db: Arc<DbInner>,
    ses: SegAllocSession,
}

impl WriteSession {
    /// Take the per-root write lock and load the root for mutation. One
    /// writer per root; a second transaction on the same root blocks here.
    pub fn start_write_transaction(&mut self, root_index: usize) -> Result<WriteTransaction<'_>, DbError> {
        if root_index >= NUM_TOP_ROOTS {
            return Err(DbError::IndexOutOfRange(root_index as u32));
        }
        let guard = self.db.root_locks[root_index].lock().unwrap();
        let root = {
            let _g = self.db.root_change.lock().unwrap();
            let raw = self.db.dbm().top_root[root_index].load(Ordering::Relaxed);
            let addr = Address::from_u32(raw as u32);
            if !addr.is_null() {
                self.db.alloc.addrs.slot(addr).retain();
            }
            addr
        };
        Ok(WriteTransaction { ws: self, index: root_index, _guard: guard, root, done: false })
    }

    /// A fresh, empty trie to build a subtree in.
    pub fn create_root(&self) -> NodeHandle {
        NodeHandle::owned(Address::NULL, &self.db.alloc)
    }

    /// Standalone upsert against a detached handle (subtree building).
    pub fn upsert_handle(
        &self,
        handle: &mut NodeHandle,
        key: &[u8],
        value: &[u8],
    ) -> Result<Option<usize>, DbError> {
        let lk = self.ses.lock();
        let (new_root, out) = trie_upsert(&lk, handle.addr, key, Op::Upsert, Value::Bytes(value))?;
        if new_root != handle.addr {
            let old = std::mem::replace(&mut handle.addr, new_root);
            if !old.is_null() {
                release_node(&lk, old);
            }
        }
        Ok(out.old_size)
    }

    pub fn get_handle(&self, handle: &NodeHandle, key: &[u8]) -> Result<Option<Vec<u8>>, DbError> {
        let lk = self.ses.lock();
        match trie_get(&lk, handle.addr, key)? {
            GetResult::NotFound => Ok(None),
            GetResult::Bytes(b) => Ok(Some(b)),
            GetResult::Subtree(_) => Err(DbError::SubtreeRequired),
        }
    }
}

/// A serialized mutation of one named root. Commit publishes atomically;
/// drop without commit aborts, reclaiming every fresh allocation through
/// the normal release discipline.
pub struct WriteTransaction<'s> {
    ws: &'s WriteSession,
    index: usize,
    _guard: MutexGuard<'s, ()>,
    root: Address,
    done: bool,
}

impl WriteTransaction<'_> {
    fn apply(&mut self, key: &[u8], op: Op, val: Value) -> Result<crate::upsert::Outcome, DbError> {
        let lk = self.ws.ses.lock();
        let (new_root, out) = trie_upsert(&lk, self.root, key, op, val)?;
        if new_root != self.root {
            let old = std::mem::replace(&mut self.root, new_root);
            if !old.is_null() {
                release_node(&lk, old);
            }
        }
        Ok(out)
    }

    /// Insert or replace. Returns the previous value's size, if any.
    pub fn upsert(&mut self, key: &[u8], value: &[u8]) -> Result<Option<usize>, DbError> {
        self.apply(key, Op::Upsert, Value::Bytes(value)).map(|o| o.old_size)
    }

    /// Strict insert: the key must not exist.
    pub fn insert(&mut self, key: &[u8], value: &[u8]) -> Result<(), DbError> {
        self.apply(key, Op::Insert, Value::Bytes(value)).map(|_| ())
    }

    /// Strict update: the key must exist. Returns the old value's size.
    pub fn update(&mut self, key: &[u8], value: &[u8]) -> Result<usize, DbError> {
        let out = self.apply(key, Op::Update, Value::Bytes(value))?;
        out.old_size.ok_or(DbError::Corrupt("update succeeded without an old value"))
    }

    /// Strict remove. Returns the removed value's size.
    pub fn remove(&mut self, key: &[u8]) -> Result<usize, DbError> {
        let out = self.apply(key, Op::Remove, Value::Bytes(&[]))?;
        out.old_size.ok_or(DbError::Corrupt("remove succeeded without an old value"))
    }

    /// Store a whole trie as the value of `key`. The handle keeps its own
    /// reference; the trie gains one.
    pub fn upsert_subtree(&mut self, key: &[u8], sub: &NodeHandle) -> Result<Option<usize>, DbError> {
        if sub.is_empty() {
            return Err(DbError::SubtreeForbidden);
        }
        // the stored entry owns a reference of its own
        self.ws.db.alloc.addrs.slot(sub.addr).retain();
        match self.apply(key, Op::Upsert, Value::Subtree(sub.addr)) {
            Ok(o) => Ok(o.old_size),
            Err(e) => {
                let lk = self.ws.ses.lock();
                release_node(&lk, sub.addr);
                Err(e)
            }
        }
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, DbError> {
        let lk = self.ws.ses.lock();
        match trie_get(&lk, self.root, key)? {
            GetResult::NotFound => Ok(None),
            GetResult::Bytes(b) => Ok(Some(b)),
            GetResult::Subtree(_) => Err(DbError::SubtreeRequired),
        }
    }

    pub fn get_subtree(&self, key: &[u8]) -> Result<Option<NodeHandle>, DbError> {
        let lk = self.ws.ses.lock();
        match trie_get(&lk, self.root, key)? {
            GetResult::NotFound => Ok(None),
            GetResult::Bytes(_) => Err(DbError::SubtreeForbidden),
            GetResult::Subtree(a) => Ok(Some(NodeHandle::retained(a, &self.ws.db.alloc))),
        }
    }

    pub fn count_keys(&self, lo: Option<&[u8]>, hi: Option<&[u8]>) -> u64 {
        let lk = self.ws.ses.lock();
        if lo.is_none() && hi.is_none() {
            return subtree_count(&lk, self.root);
        }
        count_range(&lk, self.root, lo, hi)
    }

    /// A retained handle over the uncommitted state.
    pub fn root_handle(&self) -> NodeHandle {
        NodeHandle::retained(self.root, &self.ws.db.alloc)
    }

    /// Make the mutations durable, then publish the new root.
    pub fn commit(mut self) -> Result<(), DbError> {
        let cfg = self.ws.db.alloc.state().config.load();
        self.ws.db.alloc.sync(cfg.sync_mode);
        let old = {
            let _g = self.ws.db.root_change.lock().unwrap();
            let raw = self.ws.db.dbm().top_root[self.index]
                .swap(self.root.to_u32() as u64, Ordering::Release);
            Address::from_u32(raw as u32)
        };
        self.done = true;
        // the transaction's reference transfers to the table; the table's
        // previous reference goes away
        let victim = if old == self.root { self.root } else { old };
        if !victim.is_null() {
            let lk = self.ws.ses.lock();
            release_node(&lk, victim);
        }
        Ok(())
    }

    /// Throw the mutations away.
    pub fn abort(self) {}
}

impl Drop for WriteTransaction<'_> {
    fn drop(&mut self) {
        if !self.done && !self.root.is_null() {
            let lk = self.ws.ses.lock();
            release_node(&lk, self.root);
        }
    }
}

impl ReadSession {
    /// Resolve an iterator's subtree value into a handle.
    pub fn iter_subtree(&self, it: &Iter<'_>) -> Result<Option<NodeHandle>, DbError> {
        match it.value_result()? {
            GetResult::Subtree(a) => Ok(Some(self.subtree_handle(a))),
            GetResult::NotFound => Ok(None),
            GetResult::Bytes(_) => Err(DbError::SubtreeForbidden),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn test_config() -> RuntimeConfig {
        RuntimeConfig { sync_mode: SyncType::None, ..Default::default() }
    }

    fn new_db(dir: &tempfile::TempDir) -> Database {
        Database::create(dir.path().join("db-under-test"), test_config()).unwrap()
    }

    #[test]
    fn create_open_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x");
        assert!(matches!(Database::open(&path), Err(DbError::InvalidFileFormat)));
        let db = Database::create(&path, test_config()).unwrap();
        assert!(matches!(
            Database::create(&path, test_config()),
            Err(DbError::DirectoryExists)
        ));
        drop(db);
        // reopen after clean shutdown
        let db = Database::open(&path).unwrap();
        drop(db);
    }

    #[test]
    fn insert_commit_get() {
        let dir = tempfile::tempdir().unwrap();
        let db = new_db(&dir);
        let mut ws = db.start_write_session();
        let mut tx = ws.start_write_transaction(0).unwrap();
        tx.insert(b"banana", b"yellow").unwrap();
        assert_eq!(tx.get(b"banana").unwrap().as_deref(), Some(b"yellow".as_slice()));
        tx.commit().unwrap();

        let rs = db.start_read_session();
        let root = rs.get_root(0).unwrap();
        assert_eq!(rs.get(&root, b"banana").unwrap().as_deref(), Some(b"yellow".as_slice()));
        assert_eq!(rs.get(&root, b"apple").unwrap(), None);
    }

    #[test]
    fn abort_discards_everything() {
        let dir = tempfile::tempdir().unwrap();
        let db = new_db(&dir);
        let mut ws = db.start_write_session();
        {
            let mut tx = ws.start_write_transaction(0).unwrap();
            tx.insert(b"ghost", b"data").unwrap();
            tx.abort();
        }
        {
            let tx = ws.start_write_transaction(0).unwrap();
            assert_eq!(tx.get(b"ghost").unwrap(), None);
        }
        // aborted allocations were reclaimed
        assert_eq!(db.inner.alloc.addrs.count(), 0);
    }

    #[test]
    fn persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("p");
        {
            let db = Database::create(&path, test_config()).unwrap();
            let mut ws = db.start_write_session();
            let mut tx = ws.start_write_transaction(0).unwrap();
            for i in 0..200u32 {
                tx.upsert(format!("key{i:04}").as_bytes(), format!("val{i}").as_bytes())
                    .unwrap();
            }
            tx.commit().unwrap();
        }
        let db = Database::open(&path).unwrap();
        let rs = db.start_read_session();
        let root = rs.get_root(0).unwrap();
        assert_eq!(rs.count_keys(&root, None, None), 200);
        for i in (0..200u32).step_by(17) {
            assert_eq!(
                rs.get(&root, format!("key{i:04}").as_bytes()).unwrap(),
                Some(format!("val{i}").into_bytes())
            );
        }
    }

    #[test]
    fn dirty_reopen_walks_roots() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("d");
        {
            let db = Database::create(&path, test_config()).unwrap();
            let mut ws = db.start_write_session();
            let mut tx = ws.start_write_transaction(0).unwrap();
            for i in 0..50u32 {
                tx.upsert(format!("k{i}").as_bytes(), b"v").unwrap();
            }
            tx.commit().unwrap();
        }
        // fake a crash: clear the clean-shutdown marker behind the engine
        {
            use std::io::{Seek, SeekFrom, Write};
            let mut f = std::fs::OpenOptions::new().write(true).open(path.join("db")).unwrap();
            f.seek(SeekFrom::Start(12)).unwrap();
            f.write_all(&0u32.to_le_bytes()).unwrap();
        }
        let db = Database::open(&path).unwrap();
        let rs = db.start_read_session();
        let root = rs.get_root(0).unwrap();
        assert_eq!(rs.count_keys(&root, None, None), 50);
        assert_eq!(rs.get(&root, b"k17").unwrap().as_deref(), Some(b"v".as_slice()));
    }

    #[test]
    fn snapshot_isolation_across_commits() {
        let dir = tempfile::tempdir().unwrap();
        let db = new_db(&dir);
        let rs = db.start_read_session();
        let before = rs.get_root(0).unwrap();

        let mut ws = db.start_write_session();
        let mut checkpoints = Vec::new();
        for round in 0..4u32 {
            let mut tx = ws.start_write_transaction(0).unwrap();
            for i in 0..50u32 {
                let key = format!("r{round}-key{i:016}");
                tx.insert(key.as_bytes(), b"payload").unwrap();
            }
            tx.commit().unwrap();
            checkpoints.push(rs.get_root(0).unwrap());
        }

        // the pre-write snapshot stays empty forever
        assert!(before.is_empty());
        assert_eq!(rs.count_keys(&before, None, None), 0);
        // each checkpoint sees exactly the keys committed up to it
        for (n, snap) in checkpoints.iter().enumerate() {
            assert_eq!(rs.count_keys(snap, None, None), 50 * (n as u64 + 1));
            assert_eq!(
                rs.get(snap, b"r0-key0000000000000007").unwrap().as_deref(),
                Some(b"payload".as_slice())
            );
            let future = format!("r{}-key{:016}", n + 1, 0);
            assert_eq!(rs.get(snap, future.as_bytes()).unwrap(), None);
        }
    }

    #[test]
    fn iterator_matches_reference_order() {
        use rand::{rngs::StdRng, Rng, SeedableRng};
        let dir = tempfile::tempdir().unwrap();
        let db = new_db(&dir);
        let mut model = BTreeMap::new();
        let mut rng = StdRng::seed_from_u64(7);
        {
            let mut ws = db.start_write_session();
            let mut tx = ws.start_write_transaction(0).unwrap();
            for _ in 0..500 {
                let key: Vec<u8> = (0..rng.gen_range(1..20)).map(|_| rng.gen_range(b'a'..=b'f')).collect();
                let val = format!("{:x}", rng.gen::<u64>()).into_bytes();
                tx.upsert(&key, &val).unwrap();
                model.insert(key, val);
            }
            tx.commit().unwrap();
        }
        let rs = db.start_read_session();
        let root = rs.get_root(0).unwrap();
        assert_eq!(rs.count_keys(&root, None, None), model.len() as u64);

        // forward scan
        let mut it = rs.iter(&root);
        let mut seen = Vec::new();
        let mut ok = it.first();
        while ok {
            seen.push((it.key().to_vec(), it.value().unwrap()));
            ok = it.next();
        }
        let want: Vec<_> = model.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        assert_eq!(seen, want);

        // backward scan
        let mut rev = Vec::new();
        let mut ok = it.last();
        while ok {
            rev.push(it.key().to_vec());
            ok = it.prev();
        }
        let want_rev: Vec<_> = model.keys().rev().cloned().collect();
        assert_eq!(rev, want_rev);

        // lower/upper bound at a key in the middle
        let mid = model.keys().nth(model.len() / 2).unwrap().clone();
        assert!(it.lower_bound(&mid));
        assert_eq!(it.key(), &mid[..]);
        assert!(it.upper_bound(&mid));
        let after = model.range(next_key(&mid)..).next().map(|(k, _)| k.clone());
        assert_eq!(after.as_deref(), Some(it.key()));

        // seeking past the end is invalid
        assert!(!it.lower_bound(b"zzzzzzzzzzzzzzzzzzzzzz"));
        assert!(!it.valid());
    }

    fn next_key(k: &[u8]) -> Vec<u8> {
        let mut n = k.to_vec();
        n.push(0);
        n
    }

    #[test]
    fn subtree_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let db = new_db(&dir);
        let mut ws = db.start_write_session();
        let mut sub = ws.create_root();
        ws.upsert_handle(&mut sub, b"k1", b"v1").unwrap();
        ws.upsert_handle(&mut sub, b"k2", b"v2").unwrap();
        assert_eq!(ws.get_handle(&sub, b"k1").unwrap().as_deref(), Some(b"v1".as_slice()));

        let mut tx = ws.start_write_transaction(0).unwrap();
        tx.insert(b"plain", b"bytes").unwrap();
        tx.upsert_subtree(b"nested", &sub).unwrap();
        tx.commit().unwrap();
        drop(sub);

        let rs = db.start_read_session();
        let root = rs.get_root(0).unwrap();
        // a plain get on the subtree entry refuses
        assert!(matches!(rs.get(&root, b"nested"), Err(DbError::SubtreeRequired)));
        assert!(matches!(rs.get_subtree(&root, b"plain"), Err(DbError::SubtreeForbidden)));
        let nested = rs.get_subtree(&root, b"nested").unwrap().unwrap();
        assert_eq!(rs.get(&nested, b"k1").unwrap().as_deref(), Some(b"v1".as_slice()));
        assert_eq!(rs.get(&nested, b"k2").unwrap().as_deref(), Some(b"v2".as_slice()));

        // the iterator flags the subtree value
        let mut it = rs.iter(&root);
        assert!(it.lower_bound(b"nested"));
        assert!(it.is_subtree());
        assert!(it.value().is_err());
        let via_iter = rs.iter_subtree(&it).unwrap().unwrap();
        assert_eq!(rs.get(&via_iter, b"k1").unwrap().as_deref(), Some(b"v1".as_slice()));
    }

    #[test]
    fn independent_roots() {
        let dir = tempfile::tempdir().unwrap();
        let db = new_db(&dir);
        let mut ws = db.start_write_session();
        let mut tx = ws.start_write_transaction(0).unwrap();
        tx.insert(b"in-zero", b"0").unwrap();
        tx.commit().unwrap();
        let mut tx = ws.start_write_transaction(5).unwrap();
        tx.insert(b"in-five", b"5").unwrap();
        tx.commit().unwrap();

        let rs = db.start_read_session();
        let r0 = rs.get_root(0).unwrap();
        let r5 = rs.get_root(5).unwrap();
        assert_eq!(rs.get(&r0, b"in-zero").unwrap().as_deref(), Some(b"0".as_slice()));
        assert_eq!(rs.get(&r0, b"in-five").unwrap(), None);
        assert_eq!(rs.get(&r5, b"in-five").unwrap().as_deref(), Some(b"5".as_slice()));
        assert!(matches!(rs.get_root(NUM_TOP_ROOTS), Err(DbError::IndexOutOfRange(_))));
    }

    #[test]
    fn runtime_config_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let db = new_db(&dir);
        let mut cfg = db.get_runtime_config();
        assert_eq!(cfg.sync_mode, SyncType::None);
        cfg.cache_frequency_window_ms = 1234;
        cfg.checksum_on_modify = true;
        db.set_runtime_config(cfg);
        let got = db.get_runtime_config();
        assert_eq!(got.cache_frequency_window_ms, 1234);
        assert!(got.checksum_on_modify);
    }

    #[test]
    fn print_stats_smoke() {
        let dir = tempfile::tempdir().unwrap();
        let db = new_db(&dir);
        let mut ws = db.start_write_session();
        let mut tx = ws.start_write_transaction(0).unwrap();
        tx.insert(b"k", b"v").unwrap();
        tx.commit().unwrap();
        let mut out = Vec::new();
        db.print_stats(&mut out, true).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("segments:"));
        assert!(text.contains("sessions:"));
    }

    #[test]
    fn compaction_reclaims_deleted_space() {
        let dir = tempfile::tempdir().unwrap();
        let db = new_db(&dir);
        let mut ws = db.start_write_session();
        let chunk = vec![0xCDu8; 32 * 1024];
        let mut tx = ws.start_write_transaction(0).unwrap();
        for i in 0..45u32 {
            tx.upsert(format!("bulk{i:03}").as_bytes(), &chunk).unwrap();
        }
        tx.commit().unwrap();
        // delete almost everything so the first segment crosses the
        // half-dead compaction threshold
        let mut tx = ws.start_write_transaction(0).unwrap();
        for i in 0..42u32 {
            tx.remove(format!("bulk{i:03}").as_bytes()).unwrap();
        }
        tx.commit().unwrap();

        let freed_before = db.inner.alloc.state().segments_freed.load(Ordering::Relaxed);
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(10);
        while db.inner.alloc.state().segments_freed.load(Ordering::Relaxed) == freed_before {
            assert!(std::time::Instant::now() < deadline, "compactor never freed a segment");
            std::thread::sleep(std::time::Duration::from_millis(20));
        }

        // the survivors moved but stayed readable
        let rs = db.start_read_session();
        let root = rs.get_root(0).unwrap();
        assert_eq!(rs.count_keys(&root, None, None), 3);
        for i in 42..45u32 {
            assert_eq!(
                rs.get(&root, format!("bulk{i:03}").as_bytes()).unwrap().as_deref(),
                Some(chunk.as_slice())
            );
        }
    }
}

//! Paged node arena and the copy-on-write store layered on top of it.
//!
//! Nodes live in a linear byte space carved into fixed 4 KiB pages. Each
//! occupied slot is `[capacity: u16 LE][length: u16 LE][payload]`; a node id
//! is the linear offset of the payload, so ids grow monotonically and a slot
//! never straddles a page (allocation skips a too-short page tail).
//!
//! [NodeStore] adds the single-writer discipline: an `update_from` watermark
//! splits the id space into sealed history (immutable, visible to readers)
//! and the current batch's frontier (freely overwritable), plus a per-length
//! cache of recycled frontier slots so structural rewrites inside a batch
//! reuse space instead of growing the file.

use std::collections::HashMap;
use std::fmt;

use thiserror::Error;

use crate::logger::trace;

pub const PAGE_SIZE_NBIT: u64 = 12;
pub const PAGE_SIZE: u64 = 1 << PAGE_SIZE_NBIT;
pub const PAGE_MASK: u64 = PAGE_SIZE - 1;

/// The first page of the linear space is reserved for store metadata.
pub const RESERVED: u64 = PAGE_SIZE;

/// Size of a serialized node id.
pub const ID_SIZE: usize = 8;

/// Recycled slots up to this capacity are cached per length.
pub const MAX_CACHED_LEN: usize = 256;

/// Ids must leave their top four bits clear so branch records can pack a
/// nibble next to them.
const ID_BITS: u32 = 60;
const MAX_ID: u64 = (1 << ID_BITS) - 1;

const SLOT_HDR: u64 = 4;

/// Opaque 64-bit handle to a stored node. Zero is the null id.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(u64);

impl NodeId {
    pub const NULL: NodeId = NodeId(0);

    #[inline(always)]
    pub fn new(raw: u64) -> Self {
        NodeId(raw)
    }

    #[inline(always)]
    pub fn is_null(&self) -> bool {
        self.0 == 0
    }

    #[inline(always)]
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "[NodeId 0x{:x}]", self.0)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "0x{:x}", self.0)
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("node arena exhausted the 60-bit id space")]
    OutOfSpace,
    #[error("payload of {0} bytes does not fit a page slot")]
    Oversize(usize),
    #[error("invalid node id 0x{0:x}")]
    BadId(u64),
    #[error("init error: {0}")]
    InitError(String),
    #[error("system error: {0}")]
    System(#[from] nix::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// The backing arena the engine consumes.
///
/// `read` hands out zero-copy slices; they stay valid until the next
/// mutating call, which the borrow checker enforces. `write` is stable: the
/// returned id resolves until `free`. `patch` overwrites a slot's payload in
/// place (at most `capacity` bytes) and updates its length.
pub trait PageStore {
    fn read(&self, id: NodeId) -> Result<&[u8], StoreError>;
    fn capacity(&self, id: NodeId) -> Result<usize, StoreError>;
    fn write(&mut self, bytes: &[u8]) -> Result<NodeId, StoreError>;
    fn patch(&mut self, id: NodeId, bytes: &[u8]) -> Result<(), StoreError>;
    fn free(&mut self, id: NodeId) -> Result<(), StoreError>;
    /// Monotone allocation cursor; the next `write` lands at or after it.
    fn next_id(&self) -> u64;
    /// Forces durability of every id in `(prev_id, next_id]`.
    fn flush_from(&mut self, prev_id: u64) -> Result<(), StoreError>;
    /// Whether two linear offsets fall into the same file segment.
    fn is_same_file(&self, a: u64, b: u64) -> bool;
    /// Root-id metadata slot, persisted by stores that outlive the process.
    fn root(&self) -> NodeId;
    fn set_root(&mut self, root: NodeId);
}

/// Bump-plus-freelist allocation state shared by the arena implementations.
#[derive(Debug)]
pub(crate) struct PageAlloc {
    next: u64,
    free: HashMap<usize, Vec<u64>>,
}

impl PageAlloc {
    pub(crate) fn new(start: u64) -> Self {
        Self {
            next: start,
            free: HashMap::new(),
        }
    }

    pub(crate) fn next(&self) -> u64 {
        self.next
    }

    /// Claims a fresh slot for a `len`-byte payload; returns the slot offset
    /// and the payload id. Skips to the next page when the current tail is
    /// too short.
    pub(crate) fn place(&mut self, len: usize) -> Result<(u64, u64), StoreError> {
        let n = SLOT_HDR + len as u64;
        if n > PAGE_SIZE {
            return Err(StoreError::Oversize(len));
        }
        let mut slot = self.next;
        if (slot & PAGE_MASK) + n > PAGE_SIZE {
            slot = (slot | PAGE_MASK) + 1;
        }
        let id = slot + SLOT_HDR;
        if id + len as u64 > MAX_ID {
            return Err(StoreError::OutOfSpace);
        }
        self.next = slot + n;
        Ok((slot, id))
    }

    pub(crate) fn take_free(&mut self, len: usize) -> Option<u64> {
        self.free.get_mut(&len)?.pop()
    }

    pub(crate) fn release(&mut self, id: u64, cap: usize) {
        self.free.entry(cap).or_default().push(id);
    }
}

/// Volatile arena over a single linear `Vec`, the in-memory counterpart of
/// the file-backed store and the workhorse of the test suite.
pub struct PagedMem {
    space: Vec<u8>,
    alloc: PageAlloc,
    file_nbit: u64,
    root: NodeId,
}

impl PagedMem {
    pub fn new() -> Self {
        Self::with_file_nbit(22)
    }

    /// Same arena with a custom segment size; lets tests shrink file epochs.
    pub fn with_file_nbit(file_nbit: u64) -> Self {
        assert!(file_nbit >= PAGE_SIZE_NBIT);
        Self {
            space: vec![0; RESERVED as usize],
            alloc: PageAlloc::new(RESERVED),
            file_nbit,
            root: NodeId::NULL,
        }
    }

    fn slot(&self, id: NodeId) -> Result<(usize, usize, usize), StoreError> {
        let raw = id.raw();
        if raw < RESERVED + SLOT_HDR || raw >= self.alloc.next() {
            return Err(StoreError::BadId(raw));
        }
        let off = raw as usize;
        let cap = u16::from_le_bytes([self.space[off - 4], self.space[off - 3]]) as usize;
        let len = u16::from_le_bytes([self.space[off - 2], self.space[off - 1]]) as usize;
        if len > cap || off + cap > self.space.len() {
            return Err(StoreError::BadId(raw));
        }
        Ok((off, cap, len))
    }

    fn write_slot(&mut self, slot: usize, cap: usize, bytes: &[u8]) {
        self.space[slot..slot + 2].copy_from_slice(&(cap as u16).to_le_bytes());
        self.space[slot + 2..slot + 4].copy_from_slice(&(bytes.len() as u16).to_le_bytes());
        self.space[slot + 4..slot + 4 + bytes.len()].copy_from_slice(bytes);
    }
}

impl Default for PagedMem {
    fn default() -> Self {
        Self::new()
    }
}

impl PageStore for PagedMem {
    fn read(&self, id: NodeId) -> Result<&[u8], StoreError> {
        let (off, _, len) = self.slot(id)?;
        Ok(&self.space[off..off + len])
    }

    fn capacity(&self, id: NodeId) -> Result<usize, StoreError> {
        Ok(self.slot(id)?.1)
    }

    fn write(&mut self, bytes: &[u8]) -> Result<NodeId, StoreError> {
        if let Some(id) = self.alloc.take_free(bytes.len()) {
            self.write_slot(id as usize - 4, bytes.len(), bytes);
            return Ok(NodeId::new(id));
        }
        let (slot, id) = self.alloc.place(bytes.len())?;
        let end = ((self.alloc.next() | PAGE_MASK) + 1) as usize;
        if end > self.space.len() {
            self.space.resize(end, 0);
        }
        self.write_slot(slot as usize, bytes.len(), bytes);
        trace!("write {} bytes at 0x{:x}", bytes.len(), id);
        Ok(NodeId::new(id))
    }

    fn patch(&mut self, id: NodeId, bytes: &[u8]) -> Result<(), StoreError> {
        let (off, cap, _) = self.slot(id)?;
        if bytes.len() > cap {
            return Err(StoreError::BadId(id.raw()));
        }
        self.space[off - 2..off].copy_from_slice(&(bytes.len() as u16).to_le_bytes());
        self.space[off..off + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    fn free(&mut self, id: NodeId) -> Result<(), StoreError> {
        let (_, cap, _) = self.slot(id)?;
        trace!("free 0x{:x} (cap {})", id.raw(), cap);
        self.alloc.release(id.raw(), cap);
        Ok(())
    }

    fn next_id(&self) -> u64 {
        self.alloc.next()
    }

    fn flush_from(&mut self, _prev_id: u64) -> Result<(), StoreError> {
        Ok(())
    }

    fn is_same_file(&self, a: u64, b: u64) -> bool {
        a >> self.file_nbit == b >> self.file_nbit
    }

    fn root(&self) -> NodeId {
        self.root
    }

    fn set_root(&mut self, root: NodeId) {
        self.root = root;
    }
}

/// Copy-on-write store over a [PageStore].
///
/// Ids at or above `update_from` belong to the batch being built and may be
/// patched in place; everything below is sealed history. Sealing pushes the
/// watermark to infinity, so a later batch can never touch bytes a reader
/// might be holding.
pub struct NodeStore<S> {
    store: S,
    update_from: u64,
    slots: [NodeId; MAX_CACHED_LEN],
}

impl<S: PageStore> NodeStore<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            update_from: u64::MAX,
            slots: [NodeId::NULL; MAX_CACHED_LEN],
        }
    }

    pub fn inner(&self) -> &S {
        &self.store
    }

    pub fn read(&self, id: NodeId) -> Result<&[u8], StoreError> {
        self.store.read(id)
    }

    pub fn write(&mut self, bytes: &[u8]) -> Result<NodeId, StoreError> {
        self.store.write(bytes)
    }

    pub fn free(&mut self, id: NodeId) -> Result<(), StoreError> {
        self.store.free(id)
    }

    #[inline(always)]
    pub fn is_updatable(&self, id: NodeId) -> bool {
        id.raw() >= self.update_from
    }

    /// Replaces the node at `id` with `bytes`: in place when the node is in
    /// the current frontier and the slot is large enough, otherwise through
    /// a fresh allocation (favoring slots this batch recycled earlier).
    /// Returns the id now holding the node.
    pub fn try_update_or_add(&mut self, id: NodeId, bytes: &[u8]) -> Result<NodeId, StoreError> {
        debug_assert!(!id.is_null());
        if self.is_updatable(id) {
            let cap = self.store.capacity(id)?;
            if bytes.len() <= cap {
                self.store.patch(id, bytes)?;
                return Ok(id);
            }
            // outgrown its slot; recycle it within the batch
            if (ID_SIZE..MAX_CACHED_LEN).contains(&cap) {
                let head = self.slots[cap];
                self.store.patch(id, &head.raw().to_le_bytes())?;
                self.slots[cap] = id;
                trace!("cache slot 0x{:x} (cap {})", id.raw(), cap);
            } else {
                self.store.free(id)?;
            }
        }
        self.add(bytes)
    }

    fn add(&mut self, bytes: &[u8]) -> Result<NodeId, StoreError> {
        let want = bytes.len();
        if (ID_SIZE..MAX_CACHED_LEN).contains(&want) {
            loop {
                let head = self.slots[want];
                if head.is_null() {
                    break;
                }
                let raw = self.store.read(head)?;
                if raw.len() < ID_SIZE {
                    return Err(StoreError::BadId(head.raw()));
                }
                let mut next = [0u8; ID_SIZE];
                next.copy_from_slice(&raw[..ID_SIZE]);
                self.slots[want] = NodeId::new(u64::from_le_bytes(next));
                // reuse only within the segment currently being appended to,
                // keeping the batch's working set contiguous
                if self.store.is_same_file(head.raw(), self.store.next_id()) {
                    self.store.patch(head, bytes)?;
                    return Ok(head);
                }
                self.store.free(head)?;
            }
        }
        self.store.write(bytes)
    }

    /// Opens the frontier at batch start: everything allocated from here on
    /// may be updated in place until the next seal.
    pub fn ensure_updatable(&mut self) {
        if self.update_from == u64::MAX {
            self.update_from = self.store.next_id();
        }
    }

    /// Freezes the batch: published nodes become immutable and the recycled
    /// slots are dropped, since readers may now reach them.
    pub fn seal(&mut self) {
        self.update_from = u64::MAX;
        self.slots = [NodeId::NULL; MAX_CACHED_LEN];
    }

    pub fn next_id(&self) -> u64 {
        self.store.next_id()
    }

    pub fn flush_from(&mut self, prev_id: u64) -> Result<(), StoreError> {
        self.store.flush_from(prev_id)
    }

    pub fn root(&self) -> NodeId {
        self.store.root()
    }

    pub fn set_root(&mut self, root: NodeId) {
        self.store.set_root(root)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_read_round_trip() {
        let mut mem = PagedMem::new();
        let a = mem.write(b"hello").unwrap();
        let b = mem.write(&[0xaa; 200]).unwrap();
        assert_eq!(mem.read(a).unwrap(), b"hello");
        assert_eq!(mem.read(b).unwrap(), &[0xaa; 200][..]);
        assert_eq!(mem.capacity(a).unwrap(), 5);
    }

    #[test]
    fn test_patch_shrinks_length() {
        let mut mem = PagedMem::new();
        let id = mem.write(&[1, 2, 3, 4, 5, 6]).unwrap();
        mem.patch(id, &[9, 9]).unwrap();
        assert_eq!(mem.read(id).unwrap(), &[9, 9]);
        assert_eq!(mem.capacity(id).unwrap(), 6);
        assert!(mem.patch(id, &[0; 7]).is_err());
    }

    #[test]
    fn test_slots_never_straddle_pages() {
        let mut mem = PagedMem::new();
        for i in 0..200 {
            let id = mem.write(&[i as u8; 100]).unwrap();
            let first = id.raw() >> PAGE_SIZE_NBIT;
            let last = (id.raw() + 99) >> PAGE_SIZE_NBIT;
            assert_eq!(first, last);
        }
    }

    #[test]
    fn test_free_list_reuse() {
        let mut mem = PagedMem::new();
        let a = mem.write(&[7; 64]).unwrap();
        mem.free(a).unwrap();
        let b = mem.write(&[8; 64]).unwrap();
        assert_eq!(a, b);
        assert_eq!(mem.read(b).unwrap(), &[8; 64][..]);
    }

    #[test]
    fn test_bad_ids_rejected() {
        let mem = PagedMem::new();
        assert!(mem.read(NodeId::new(1)).is_err());
        assert!(mem.read(NodeId::new(RESERVED + SLOT_HDR)).is_err());
    }

    #[test]
    fn test_update_in_place_within_frontier() {
        let mut store = NodeStore::new(PagedMem::new());
        store.ensure_updatable();
        let id = store.write(&[1; 40]).unwrap();
        let same = store.try_update_or_add(id, &[2; 40]).unwrap();
        assert_eq!(same, id);
        let smaller = store.try_update_or_add(id, &[3; 10]).unwrap();
        assert_eq!(smaller, id);
        assert_eq!(store.read(id).unwrap(), &[3; 10][..]);
    }

    #[test]
    fn test_sealed_nodes_are_copied_not_patched() {
        let mut store = NodeStore::new(PagedMem::new());
        store.ensure_updatable();
        let id = store.write(&[1; 40]).unwrap();
        store.seal();
        store.ensure_updatable();
        let other = store.try_update_or_add(id, &[2; 10]).unwrap();
        assert_ne!(other, id);
        assert_eq!(store.read(id).unwrap(), &[1; 40][..]);
        assert_eq!(store.read(other).unwrap(), &[2; 10][..]);
    }

    #[test]
    fn test_outgrown_slot_is_recycled() {
        let mut store = NodeStore::new(PagedMem::new());
        store.ensure_updatable();
        let a = store.write(&[1; 20]).unwrap();
        // growing a past its slot moves it and caches the 20-byte slot
        let grown = store.try_update_or_add(a, &[2; 60]).unwrap();
        assert_ne!(grown, a);
        // a same-sized rewrite elsewhere should pop the cached slot
        let c = store.write(&[3; 10]).unwrap();
        let reused = store.try_update_or_add(c, &[4; 20]).unwrap();
        assert_eq!(reused, a);
        assert_eq!(store.read(reused).unwrap(), &[4; 20][..]);
    }

    #[test]
    fn test_seal_clears_slot_cache() {
        let mut store = NodeStore::new(PagedMem::new());
        store.ensure_updatable();
        let a = store.write(&[1; 20]).unwrap();
        store.try_update_or_add(a, &[2; 60]).unwrap();
        store.seal();
        store.ensure_updatable();
        let c = store.write(&[3; 10]).unwrap();
        let fresh = store.try_update_or_add(c, &[4; 20]).unwrap();
        assert_ne!(fresh, a);
    }

    #[test]
    fn test_stale_segment_slots_are_skipped() {
        // one page per file epoch: recycled slots from an older page are
        // freed instead of reused
        let mut store = NodeStore::new(PagedMem::with_file_nbit(PAGE_SIZE_NBIT));
        store.ensure_updatable();
        let a = store.write(&[1; 20]).unwrap();
        // push the cursor into the next page
        for _ in 0..80 {
            store.write(&[0; 48]).unwrap();
        }
        let grown = store.try_update_or_add(a, &[2; 60]).unwrap();
        assert_ne!(grown, a);
        let c = store.write(&[3; 10]).unwrap();
        let reused = store.try_update_or_add(c, &[4; 20]).unwrap();
        assert_ne!(reused, a);
    }

    #[test]
    fn test_tiny_slots_are_freed_not_cached() {
        let mut store = NodeStore::new(PagedMem::new());
        store.ensure_updatable();
        let a = store.write(&[1; 4]).unwrap();
        let grown = store.try_update_or_add(a, &[2; 60]).unwrap();
        assert_ne!(grown, a);
        // a 4-byte slot cannot hold a link, so it went to the backing
        // allocator and an exact-size write gets it back
        let b = store.write(&[5; 4]).unwrap();
        assert_eq!(b, a);
    }
}

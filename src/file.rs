//! File-backed node arena.
//!
//! The linear space is chunked into fixed-size segment files under one
//! directory, each memory-mapped read-write. A segment is a file epoch: ids
//! from different segments compare unequal under `is_same_file`. The first
//! page of segment zero holds the store header (magic, geometry, root id,
//! allocation cursor), rewritten on every flush.

use std::fs::{File, OpenOptions};
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};

use bytemuck::{Pod, Zeroable};
use memmap2::MmapMut;
use nix::fcntl::{flock, FlockArg};
use typed_builder::TypedBuilder;

use crate::logger::{debug, trace};
use crate::storage::{
    NodeId, PageAlloc, PageStore, StoreError, PAGE_SIZE_NBIT, RESERVED,
};

const MAGIC: [u8; 16] = *b"sapwood v0.1\0\0\0\0";
const SLOT_HDR: usize = 4;

#[derive(TypedBuilder)]
pub struct StoreConfig {
    /// log2 of the segment-file size; 22 gives 4 MiB segments.
    #[builder(default = 22)]
    pub file_nbit: u64,
    /// Wipe any existing store under the directory before opening.
    #[builder(default = false)]
    pub truncate: bool,
}

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct StoreHeader {
    magic: [u8; 16],
    file_nbit: u64,
    next: u64,
    root: u64,
}

pub struct PagedFile {
    dir: PathBuf,
    lock: File,
    file_nbit: u64,
    segs: Vec<MmapMut>,
    alloc: PageAlloc,
    root: NodeId,
}

impl PagedFile {
    pub fn open<P: AsRef<Path>>(dir: P, cfg: &StoreConfig) -> Result<Self, StoreError> {
        if cfg.file_nbit < PAGE_SIZE_NBIT {
            return Err(StoreError::InitError(
                "segment files must hold at least one page".into(),
            ));
        }
        if cfg.truncate {
            let _ = std::fs::remove_dir_all(dir.as_ref());
        }
        std::fs::create_dir_all(dir.as_ref())?;
        let lock = File::open(dir.as_ref())?;
        if flock(lock.as_raw_fd(), FlockArg::LockExclusiveNonblock).is_err() {
            return Err(StoreError::InitError("the store is busy".into()));
        }

        let dir = PathBuf::from(dir.as_ref());
        let fresh = !dir.join(Self::seg_name(0)).exists();
        let mut this = Self {
            dir,
            lock,
            file_nbit: cfg.file_nbit,
            segs: Vec::new(),
            alloc: PageAlloc::new(RESERVED),
            root: NodeId::NULL,
        };
        this.ensure_mapped(0)?;

        if fresh {
            this.write_header()?;
            this.segs[0].flush()?;
        } else {
            let header: StoreHeader = bytemuck::try_pod_read_unaligned(
                &this.segs[0][..std::mem::size_of::<StoreHeader>()],
            )
            .map_err(|_| StoreError::InitError("unreadable store header".into()))?;
            if header.magic != MAGIC {
                return Err(StoreError::InitError("not a sapwood store".into()));
            }
            this.file_nbit = header.file_nbit;
            this.alloc = PageAlloc::new(header.next);
            this.root = NodeId::new(header.root);
            let last_seg = (header.next.saturating_sub(1) >> this.file_nbit) as usize;
            this.ensure_mapped(last_seg)?;
        }
        debug!(
            "opened store at {:?}: next 0x{:x}, root {}",
            this.dir,
            this.alloc.next(),
            this.root
        );
        Ok(this)
    }

    fn seg_name(idx: usize) -> String {
        format!("{idx:08x}.sw")
    }

    fn seg_size(&self) -> u64 {
        1 << self.file_nbit
    }

    fn ensure_mapped(&mut self, idx: usize) -> Result<(), StoreError> {
        while self.segs.len() <= idx {
            let path = self.dir.join(Self::seg_name(self.segs.len()));
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .open(&path)?;
            if file.metadata()?.len() < 1 << self.file_nbit {
                file.set_len(1 << self.file_nbit)?;
            }
            let map = unsafe { MmapMut::map_mut(&file)? };
            trace!("mapped segment {:?}", path);
            self.segs.push(map);
        }
        Ok(())
    }

    /// Splits an id into its segment index, in-segment payload offset and
    /// current length, validating the slot header on the way.
    fn slot(&self, id: NodeId) -> Result<(usize, usize, usize, usize), StoreError> {
        let raw = id.raw();
        if raw < RESERVED + SLOT_HDR as u64 || raw >= self.alloc.next() {
            return Err(StoreError::BadId(raw));
        }
        let seg = (raw >> self.file_nbit) as usize;
        let off = (raw & (self.seg_size() - 1)) as usize;
        if seg >= self.segs.len() || off < SLOT_HDR {
            return Err(StoreError::BadId(raw));
        }
        let mem = &self.segs[seg];
        let cap = u16::from_le_bytes([mem[off - 4], mem[off - 3]]) as usize;
        let len = u16::from_le_bytes([mem[off - 2], mem[off - 1]]) as usize;
        if len > cap || off + cap > mem.len() {
            return Err(StoreError::BadId(raw));
        }
        Ok((seg, off, cap, len))
    }

    fn write_slot(&mut self, raw_slot: u64, cap: usize, bytes: &[u8]) {
        let seg = (raw_slot >> self.file_nbit) as usize;
        let off = (raw_slot & (self.seg_size() - 1)) as usize;
        let mem = &mut self.segs[seg];
        mem[off..off + 2].copy_from_slice(&(cap as u16).to_le_bytes());
        mem[off + 2..off + 4].copy_from_slice(&(bytes.len() as u16).to_le_bytes());
        mem[off + 4..off + 4 + bytes.len()].copy_from_slice(bytes);
    }

    fn write_header(&mut self) -> Result<(), StoreError> {
        let header = StoreHeader {
            magic: MAGIC,
            file_nbit: self.file_nbit,
            next: self.alloc.next(),
            root: self.root.raw(),
        };
        let raw = bytemuck::bytes_of(&header);
        self.segs[0][..raw.len()].copy_from_slice(raw);
        Ok(())
    }
}

impl Drop for PagedFile {
    fn drop(&mut self) {
        flock(self.lock.as_raw_fd(), FlockArg::UnlockNonblock).ok();
    }
}

impl PageStore for PagedFile {
    fn read(&self, id: NodeId) -> Result<&[u8], StoreError> {
        let (seg, off, _, len) = self.slot(id)?;
        Ok(&self.segs[seg][off..off + len])
    }

    fn capacity(&self, id: NodeId) -> Result<usize, StoreError> {
        Ok(self.slot(id)?.2)
    }

    fn write(&mut self, bytes: &[u8]) -> Result<NodeId, StoreError> {
        if let Some(id) = self.alloc.take_free(bytes.len()) {
            self.write_slot(id - SLOT_HDR as u64, bytes.len(), bytes);
            return Ok(NodeId::new(id));
        }
        let (slot, id) = self.alloc.place(bytes.len())?;
        self.ensure_mapped((slot >> self.file_nbit) as usize)?;
        self.write_slot(slot, bytes.len(), bytes);
        Ok(NodeId::new(id))
    }

    fn patch(&mut self, id: NodeId, bytes: &[u8]) -> Result<(), StoreError> {
        let (seg, off, cap, _) = self.slot(id)?;
        if bytes.len() > cap {
            return Err(StoreError::BadId(id.raw()));
        }
        let mem = &mut self.segs[seg];
        mem[off - 2..off].copy_from_slice(&(bytes.len() as u16).to_le_bytes());
        mem[off..off + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    fn free(&mut self, id: NodeId) -> Result<(), StoreError> {
        let (_, _, cap, _) = self.slot(id)?;
        self.alloc.release(id.raw(), cap);
        Ok(())
    }

    fn next_id(&self) -> u64 {
        self.alloc.next()
    }

    fn flush_from(&mut self, prev_id: u64) -> Result<(), StoreError> {
        self.write_header()?;
        let next = self.alloc.next();
        let first = (prev_id >> self.file_nbit) as usize;
        let last = (next.saturating_sub(1) >> self.file_nbit) as usize;
        // header lives in segment 0, keep it durable as well
        self.segs[0].flush()?;
        for seg in self.segs.iter().take(last + 1).skip(first.max(1)) {
            seg.flush()?;
        }
        debug!("flushed ids (0x{prev_id:x}, 0x{next:x}]");
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_flush_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = StoreConfig::builder().build();
        let (a, b);
        {
            let mut store = PagedFile::open(dir.path(), &cfg).unwrap();
            a = store.write(b"stay around").unwrap();
            b = store.write(&[0x5a; 300]).unwrap();
            store.set_root(b);
            store.flush_from(0).unwrap();
        }
        let store = PagedFile::open(dir.path(), &cfg).unwrap();
        assert_eq!(store.root(), b);
        assert_eq!(store.read(a).unwrap(), b"stay around");
        assert_eq!(store.read(b).unwrap(), &[0x5a; 300][..]);
    }

    #[test]
    fn test_second_open_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = StoreConfig::builder().build();
        let _store = PagedFile::open(dir.path(), &cfg).unwrap();
        assert!(matches!(
            PagedFile::open(dir.path(), &cfg),
            Err(StoreError::InitError(_))
        ));
    }

    #[test]
    fn test_growth_across_segments() {
        let dir = tempfile::tempdir().unwrap();
        // one page per segment to force growth
        let cfg = StoreConfig::builder().file_nbit(PAGE_SIZE_NBIT).build();
        let mut store = PagedFile::open(dir.path(), &cfg).unwrap();
        let ids: Vec<NodeId> = (0..64)
            .map(|i| store.write(&[i as u8; 200]).unwrap())
            .collect();
        store.flush_from(0).unwrap();
        for (i, id) in ids.iter().enumerate() {
            assert_eq!(store.read(*id).unwrap(), &[i as u8; 200][..]);
        }
        assert!(!store.is_same_file(ids[0].raw(), ids[63].raw()));
    }

    #[test]
    fn test_truncate_wipes_the_store() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = StoreConfig::builder().build();
        let id;
        {
            let mut store = PagedFile::open(dir.path(), &cfg).unwrap();
            id = store.write(b"doomed").unwrap();
            store.flush_from(0).unwrap();
        }
        let wipe = StoreConfig::builder().truncate(true).build();
        let store = PagedFile::open(dir.path(), &wipe).unwrap();
        assert!(store.read(id).is_err());
    }
}

//! The engine surface: a trie per store, written through batches.
//!
//! A [Db] owns the node store and the current root id behind one mutex. At
//! most one [Batch] exists at a time (it holds the guard); readers that come
//! through the [Db] handle see the last committed root until the batch
//! publishes a new one.

use std::path::Path;

use parking_lot::{Mutex, MutexGuard};
use thiserror::Error;

use crate::file::{PagedFile, StoreConfig};
use crate::logger::debug;
use crate::merkle::{self, MerkleError, TrieHash};
use crate::nibbles::NibblePath;
use crate::storage::{NodeId, NodeStore, PageStore, StoreError};

/// Keys are account / storage-slot identifiers: exactly 32 bytes.
pub const KEY_LEN: usize = 32;

#[derive(Debug, Error)]
pub enum DbError {
    #[error(transparent)]
    Merkle(#[from] MerkleError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// What a [Batch::commit] does beyond publishing the new root.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitMode {
    /// Publish the root id; the batch's nodes stay in the writable frontier.
    RootOnly,
    /// Publish and seal: the batch's nodes become immutable history.
    SealUpdatable,
    /// Publish, seal, and force everything since the last flush to disk.
    ForceFlush,
}

struct DbInner<S: PageStore> {
    store: NodeStore<S>,
    root: NodeId,
    last_flush_to: u64,
}

pub struct Db<S: PageStore> {
    inner: Mutex<DbInner<S>>,
}

impl<S: PageStore> Db<S> {
    /// Wraps a backing store, adopting whatever root it recorded.
    pub fn new(store: S) -> Self {
        let root = store.root();
        let store = NodeStore::new(store);
        let last_flush_to = store.next_id();
        Db {
            inner: Mutex::new(DbInner {
                store,
                root,
                last_flush_to,
            }),
        }
    }

    /// Starts the (single) write batch. Blocks while another batch or reader
    /// holds the engine.
    pub fn begin(&self) -> Batch<'_, S> {
        let mut m = self.inner.lock();
        m.store.ensure_updatable();
        let root = m.root;
        Batch { m, root }
    }

    /// One-shot insert: a batch of one `set`, committed `RootOnly`.
    pub fn set(&self, key: &[u8], value: &[u8]) -> Result<(), DbError> {
        let mut batch = self.begin();
        batch.set(key, value)?;
        batch.commit(CommitMode::RootOnly)
    }

    pub fn try_get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, DbError> {
        let m = self.inner.lock();
        Ok(merkle::try_get(&m.store, m.root, key_path(key)?)?)
    }

    pub fn root_hash(&self) -> Result<TrieHash, DbError> {
        let m = self.inner.lock();
        Ok(merkle::root_hash(&m.store, m.root)?)
    }

    pub fn dump(&self) -> Result<String, DbError> {
        let m = self.inner.lock();
        Ok(merkle::dump(&m.store, m.root)?)
    }
}

impl Db<PagedFile> {
    /// Opens (or creates) a file-backed engine under `dir`.
    pub fn open<P: AsRef<Path>>(dir: P, cfg: &StoreConfig) -> Result<Self, DbError> {
        Ok(Self::new(PagedFile::open(dir, cfg)?))
    }
}

/// The single write transaction.
///
/// Reads through the batch observe its own writes; the engine's root moves
/// only on [Batch::commit]. Dropping the batch abandons its work: nothing is
/// published and the orphaned nodes stay in the frontier for the next batch
/// to overwrite.
pub struct Batch<'a, S: PageStore> {
    m: MutexGuard<'a, DbInner<S>>,
    root: NodeId,
}

impl<'a, S: PageStore> Batch<'a, S> {
    pub fn set(&mut self, key: &[u8], value: &[u8]) -> Result<(), DbError> {
        let path = key_path(key)?;
        self.root = merkle::insert(&mut self.m.store, self.root, path, value)?;
        Ok(())
    }

    pub fn try_get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, DbError> {
        Ok(merkle::try_get(&self.m.store, self.root, key_path(key)?)?)
    }

    /// Deletes a key; returns whether it was present.
    pub fn remove(&mut self, key: &[u8]) -> Result<bool, DbError> {
        match merkle::remove(&mut self.m.store, self.root, key_path(key)?)? {
            Some(new_root) => {
                self.root = new_root;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn root_hash(&self) -> Result<TrieHash, DbError> {
        Ok(merkle::root_hash(&self.m.store, self.root)?)
    }

    /// Publishes the batch's root and applies the commit mode.
    pub fn commit(mut self, mode: CommitMode) -> Result<(), DbError> {
        let inner = &mut *self.m;
        inner.root = self.root;
        inner.store.set_root(self.root);
        match mode {
            CommitMode::RootOnly => {}
            CommitMode::SealUpdatable => inner.store.seal(),
            CommitMode::ForceFlush => {
                inner.store.seal();
                let up_to = inner.store.next_id();
                inner.store.flush_from(inner.last_flush_to)?;
                inner.last_flush_to = up_to;
                debug!("commit flushed through 0x{up_to:x}");
            }
        }
        Ok(())
    }
}

fn key_path(key: &[u8]) -> Result<NibblePath<'_>, MerkleError> {
    if key.len() != KEY_LEN {
        return Err(MerkleError::InvalidArgument("key must be exactly 32 bytes"));
    }
    Ok(NibblePath::from_key(key))
}

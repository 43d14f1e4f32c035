//! The Merkle-Patricia trie over the node store.
//!
//! All mutation funnels through [insert] and [remove]; both publish every
//! rewritten node with `try_update_or_add`, so whether a change lands in
//! place or behind a fresh id is entirely the store's call. Reads never
//! allocate. [root_hash] walks the tree and folds it into the Ethereum
//! Keccak commitment.

pub mod node;

use std::fmt::Write as _;
use std::ops::Deref;

use sha3::{Digest, Keccak256};
use thiserror::Error;

use crate::nibbles::{concat_into, path_buf, prepend_into, NibblePath};
use crate::storage::{NodeId, NodeStore, PageStore, StoreError};
use node::{
    BranchRecords, MerkleEnc, Node, RlpChild, BRANCH_MAX_LEN, EXT_MAX_LEN, MAX_NODE_LEN,
    MAX_VALUE_LEN, NBRANCH,
};

#[derive(Debug, Error)]
pub enum MerkleError {
    #[error("corrupt node: {0}")]
    CorruptNode(&'static str),
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Keccak-256 commitment over the whole trie.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TrieHash(pub [u8; 32]);

impl Deref for TrieHash {
    type Target = [u8; 32];
    fn deref(&self) -> &[u8; 32] {
        &self.0
    }
}

impl std::fmt::Display for TrieHash {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// Inserts `value` under the remaining `path` of the subtree rooted at `id`
/// and returns the id of the rewritten subtree root.
pub fn insert<S: PageStore>(
    store: &mut NodeStore<S>,
    id: NodeId,
    path: NibblePath<'_>,
    value: &[u8],
) -> Result<NodeId, MerkleError> {
    if value.len() > MAX_VALUE_LEN {
        return Err(MerkleError::InvalidArgument("value too large"));
    }
    if id.is_null() {
        return write_leaf(store, &path, value);
    }
    let raw = store.read(id)?.to_vec();
    match Node::decode(&raw)? {
        Node::Leaf {
            path: epath,
            value: evalue,
        } => {
            if evalue.len() > MAX_VALUE_LEN {
                return Err(MerkleError::CorruptNode("oversized leaf value"));
            }
            let d = path.first_different_nibble(&epath);
            if d == path.len() && d == epath.len() {
                // same key: plain overwrite
                let mut buf = [0u8; MAX_NODE_LEN];
                let n = node::encode_leaf(&path, value, &mut buf);
                return Ok(store.try_update_or_add(id, &buf[..n])?);
            }
            if d == path.len() || d == epath.len() {
                return Err(MerkleError::InvalidArgument(
                    "key is a prefix of an existing key",
                ));
            }
            if d == 0 {
                // diverge immediately: the old leaf drops one nibble and a
                // branch takes its place
                let new_leaf = write_leaf(store, &path.slice_from(1), value)?;
                let mut buf = [0u8; MAX_NODE_LEN];
                let n = node::encode_leaf(&epath.slice_from(1), evalue, &mut buf);
                let old_leaf = store.try_update_or_add(id, &buf[..n])?;
                let recs =
                    BranchRecords::pair(path.nibble_at(0), new_leaf, epath.nibble_at(0), old_leaf);
                let mut bbuf = [0u8; BRANCH_MAX_LEN];
                let bn = node::encode_branch(&recs, &mut bbuf);
                return Ok(store.write(&bbuf[..bn])?);
            }
            // shared prefix: two shortened leaves under a branch, fronted by
            // an extension that replaces the old leaf
            let new_leaf = write_leaf(store, &path.slice_from(d + 1), value)?;
            let old_leaf = {
                let mut buf = [0u8; MAX_NODE_LEN];
                let n = node::encode_leaf(&epath.slice_from(d + 1), evalue, &mut buf);
                store.write(&buf[..n])?
            };
            let recs =
                BranchRecords::pair(path.nibble_at(d), new_leaf, epath.nibble_at(d), old_leaf);
            let mut bbuf = [0u8; BRANCH_MAX_LEN];
            let bn = node::encode_branch(&recs, &mut bbuf);
            let branch = store.write(&bbuf[..bn])?;
            let mut ebuf = [0u8; EXT_MAX_LEN];
            let en = node::encode_extension(&path.slice_to(d), branch, &mut ebuf);
            Ok(store.try_update_or_add(id, &ebuf[..en])?)
        }
        Node::Branch(mut recs) => {
            if path.is_empty() {
                return Err(MerkleError::InvalidArgument(
                    "key is a prefix of an existing key",
                ));
            }
            let n = path.nibble_at(0);
            let child = recs.child(n);
            if child.is_null() {
                let leaf = write_leaf(store, &path.slice_from(1), value)?;
                recs.set(n, leaf);
            } else {
                let new_child = insert(store, child, path.slice_from(1), value)?;
                if new_child == child {
                    return Ok(id);
                }
                recs.set(n, new_child);
            }
            let mut buf = [0u8; BRANCH_MAX_LEN];
            let bn = node::encode_branch(&recs, &mut buf);
            Ok(store.try_update_or_add(id, &buf[..bn])?)
        }
        Node::Extension { path: epath, child } => {
            let d = epath.first_different_nibble(&path);
            if d == epath.len() {
                let new_child = insert(store, child, path.slice_from(d), value)?;
                if new_child == child {
                    return Ok(id);
                }
                let mut buf = [0u8; EXT_MAX_LEN];
                let n = node::encode_extension(&epath, new_child, &mut buf);
                return Ok(store.try_update_or_add(id, &buf[..n])?);
            }
            if d == path.len() {
                return Err(MerkleError::InvalidArgument(
                    "key is a prefix of an existing key",
                ));
            }
            // the extension splits at d; its child is pushed down past the
            // diverging nibble
            let new_leaf = write_leaf(store, &path.slice_from(d + 1), value)?;
            let pushed = if epath.len() == d + 1 {
                child
            } else {
                let mut buf = [0u8; EXT_MAX_LEN];
                let n = node::encode_extension(&epath.slice_from(d + 1), child, &mut buf);
                store.write(&buf[..n])?
            };
            let recs =
                BranchRecords::pair(path.nibble_at(d), new_leaf, epath.nibble_at(d), pushed);
            let mut bbuf = [0u8; BRANCH_MAX_LEN];
            let bn = node::encode_branch(&recs, &mut bbuf);
            if d == 0 {
                return Ok(store.try_update_or_add(id, &bbuf[..bn])?);
            }
            let branch = store.write(&bbuf[..bn])?;
            let mut ebuf = [0u8; EXT_MAX_LEN];
            let en = node::encode_extension(&path.slice_to(d), branch, &mut ebuf);
            Ok(store.try_update_or_add(id, &ebuf[..en])?)
        }
    }
}

fn write_leaf<S: PageStore>(
    store: &mut NodeStore<S>,
    path: &NibblePath,
    value: &[u8],
) -> Result<NodeId, MerkleError> {
    let mut buf = [0u8; MAX_NODE_LEN];
    let n = node::encode_leaf(path, value, &mut buf);
    Ok(store.write(&buf[..n])?)
}

/// Looks up the value stored under `key` below `root`.
pub fn try_get<S: PageStore>(
    store: &NodeStore<S>,
    root: NodeId,
    key: NibblePath<'_>,
) -> Result<Option<Vec<u8>>, MerkleError> {
    let mut id = root;
    let mut path = key;
    loop {
        if id.is_null() {
            return Ok(None);
        }
        let raw = store.read(id)?;
        match Node::decode(raw)? {
            Node::Leaf {
                path: lpath,
                value,
            } => {
                return Ok((lpath == path).then(|| value.to_vec()));
            }
            Node::Branch(recs) => {
                if path.is_empty() {
                    return Ok(None);
                }
                let child = recs.child(path.nibble_at(0));
                if child.is_null() {
                    return Ok(None);
                }
                id = child;
                path = path.slice_from(1);
            }
            Node::Extension { path: epath, child } => {
                let d = epath.first_different_nibble(&path);
                if d < epath.len() {
                    return Ok(None);
                }
                id = child;
                path = path.slice_from(d);
            }
        }
    }
}

/// Deletes `path` from the subtree rooted at `id`.
///
/// Returns `None` when the key was not present; otherwise the id of the
/// rewritten subtree, null if the deletion emptied it. A branch left with a
/// single child collapses into that child (which absorbs the branch
/// nibble), and an extension over a collapsed child merges paths so the
/// no-extension-under-extension and no-singleton-branch shapes hold at
/// every published root.
pub fn remove<S: PageStore>(
    store: &mut NodeStore<S>,
    id: NodeId,
    path: NibblePath<'_>,
) -> Result<Option<NodeId>, MerkleError> {
    if id.is_null() {
        return Ok(None);
    }
    let raw = store.read(id)?.to_vec();
    match Node::decode(&raw)? {
        Node::Leaf { path: lpath, .. } => {
            if lpath == path {
                release(store, id)?;
                Ok(Some(NodeId::NULL))
            } else {
                Ok(None)
            }
        }
        Node::Branch(mut recs) => {
            if path.is_empty() {
                return Ok(None);
            }
            let n = path.nibble_at(0);
            let child = recs.child(n);
            if child.is_null() {
                return Ok(None);
            }
            let Some(new_child) = remove(store, child, path.slice_from(1))? else {
                return Ok(None);
            };
            if new_child == child {
                return Ok(Some(id));
            }
            if !new_child.is_null() {
                recs.set(n, new_child);
                let mut buf = [0u8; BRANCH_MAX_LEN];
                let bn = node::encode_branch(&recs, &mut buf);
                return Ok(Some(store.try_update_or_add(id, &buf[..bn])?));
            }
            recs.unset(n);
            if recs.len() >= 2 {
                let mut buf = [0u8; BRANCH_MAX_LEN];
                let bn = node::encode_branch(&recs, &mut buf);
                return Ok(Some(store.try_update_or_add(id, &buf[..bn])?));
            }
            // one survivor: the branch dissolves into it
            let (last_nibble, last_child) = recs
                .single()
                .ok_or(MerkleError::CorruptNode("branch below two children"))?;
            let merged = absorb_nibble(store, last_nibble, last_child)?;
            release(store, id)?;
            Ok(Some(merged))
        }
        Node::Extension { path: epath, child } => {
            let d = epath.first_different_nibble(&path);
            if d < epath.len() {
                return Ok(None);
            }
            let Some(new_child) = remove(store, child, path.slice_from(d))? else {
                return Ok(None);
            };
            if new_child == child {
                return Ok(Some(id));
            }
            if new_child.is_null() {
                release(store, id)?;
                return Ok(Some(NodeId::NULL));
            }
            // a collapse below may have produced a leaf or another
            // extension; fold it into this one
            let craw = store.read(new_child)?.to_vec();
            match Node::decode(&craw)? {
                Node::Branch(_) => {
                    let mut buf = [0u8; EXT_MAX_LEN];
                    let n = node::encode_extension(&epath, new_child, &mut buf);
                    Ok(Some(store.try_update_or_add(id, &buf[..n])?))
                }
                Node::Leaf {
                    path: lpath,
                    value,
                } => {
                    if value.len() > MAX_VALUE_LEN {
                        return Err(MerkleError::CorruptNode("oversized leaf value"));
                    }
                    let mut pbuf = path_buf();
                    let joined = concat_into(&mut pbuf, &epath, &lpath);
                    let mut buf = [0u8; MAX_NODE_LEN];
                    let n = node::encode_leaf(&joined, value, &mut buf);
                    let out = store.try_update_or_add(id, &buf[..n])?;
                    release(store, new_child)?;
                    Ok(Some(out))
                }
                Node::Extension {
                    path: cpath,
                    child: grandchild,
                } => {
                    let mut pbuf = path_buf();
                    let joined = concat_into(&mut pbuf, &epath, &cpath);
                    let mut buf = [0u8; EXT_MAX_LEN];
                    let n = node::encode_extension(&joined, grandchild, &mut buf);
                    let out = store.try_update_or_add(id, &buf[..n])?;
                    release(store, new_child)?;
                    Ok(Some(out))
                }
            }
        }
    }
}

/// Re-anchors the survivor of a collapsed branch one nibble higher.
fn absorb_nibble<S: PageStore>(
    store: &mut NodeStore<S>,
    nibble: u8,
    child: NodeId,
) -> Result<NodeId, MerkleError> {
    let raw = store.read(child)?.to_vec();
    match Node::decode(&raw)? {
        Node::Leaf { path, value } => {
            if value.len() > MAX_VALUE_LEN {
                return Err(MerkleError::CorruptNode("oversized leaf value"));
            }
            let mut pbuf = path_buf();
            let joined = prepend_into(&mut pbuf, nibble, &path);
            let mut buf = [0u8; MAX_NODE_LEN];
            let n = node::encode_leaf(&joined, value, &mut buf);
            Ok(store.try_update_or_add(child, &buf[..n])?)
        }
        Node::Extension { path, child: next } => {
            let mut pbuf = path_buf();
            let joined = prepend_into(&mut pbuf, nibble, &path);
            let mut buf = [0u8; EXT_MAX_LEN];
            let n = node::encode_extension(&joined, next, &mut buf);
            Ok(store.try_update_or_add(child, &buf[..n])?)
        }
        Node::Branch(_) => {
            // a branch keeps its id and gains a one-nibble extension
            let key = [nibble << 4];
            let path = NibblePath::new(&key, 0, 1);
            let mut buf = [0u8; EXT_MAX_LEN];
            let n = node::encode_extension(&path, child, &mut buf);
            Ok(store.write(&buf[..n])?)
        }
    }
}

/// Frees a node the tree no longer references. Sealed nodes stay: they are
/// part of a published snapshot and reclaiming them is the host's job.
fn release<S: PageStore>(store: &mut NodeStore<S>, id: NodeId) -> Result<(), StoreError> {
    if store.is_updatable(id) {
        store.free(id)?;
    }
    Ok(())
}

/// Merkle-encodes the node at `id` into `out`.
fn merkle_encode<S: PageStore>(
    store: &NodeStore<S>,
    id: NodeId,
    out: &mut [u8; 32],
) -> Result<MerkleEnc, MerkleError> {
    let raw = store.read(id)?;
    match Node::decode(raw)? {
        Node::Leaf { path, value } => Ok(node::digest_or_inline(&node::leaf_rlp(&path, value), out)),
        Node::Extension { path, child } => {
            let mut cbuf = [0u8; 32];
            let enc = merkle_encode(store, child, &mut cbuf)?;
            let child = rlp_child(&cbuf, enc);
            Ok(node::digest_or_inline(&node::extension_rlp(&path, child), out))
        }
        Node::Branch(recs) => {
            let mut bufs = [[0u8; 32]; NBRANCH];
            let mut encs = [None; NBRANCH];
            for n in 0..NBRANCH {
                let child = recs.child(n as u8);
                if !child.is_null() {
                    encs[n] = Some(merkle_encode(store, child, &mut bufs[n])?);
                }
            }
            let children: [Option<RlpChild>; NBRANCH] =
                std::array::from_fn(|n| encs[n].map(|enc| rlp_child(&bufs[n], enc)));
            Ok(node::digest_or_inline(&node::branch_rlp(&children), out))
        }
    }
}

fn rlp_child<'a>(buf: &'a [u8; 32], enc: MerkleEnc) -> RlpChild<'a> {
    match enc {
        MerkleEnc::HasRlp(n) => RlpChild::Inline(&buf[..n]),
        MerkleEnc::HasKeccak => RlpChild::Hash(buf),
    }
}

/// The Keccak-256 root commitment of the trie at `root`.
pub fn root_hash<S: PageStore>(
    store: &NodeStore<S>,
    root: NodeId,
) -> Result<TrieHash, MerkleError> {
    if root.is_null() {
        // hash of the empty RLP string
        return Ok(TrieHash(Keccak256::digest([0x80u8]).into()));
    }
    let mut buf = [0u8; 32];
    match merkle_encode(store, root, &mut buf)? {
        MerkleEnc::HasRlp(n) => Ok(TrieHash(Keccak256::digest(&buf[..n]).into())),
        MerkleEnc::HasKeccak => Ok(TrieHash(buf)),
    }
}

/// Renders the trie as indented text, one node per line.
pub fn dump<S: PageStore>(store: &NodeStore<S>, root: NodeId) -> Result<String, MerkleError> {
    let mut out = String::new();
    if root.is_null() {
        out.push_str("<empty>\n");
        return Ok(out);
    }
    dump_at(store, root, 0, &mut out)?;
    Ok(out)
}

fn dump_at<S: PageStore>(
    store: &NodeStore<S>,
    id: NodeId,
    depth: usize,
    out: &mut String,
) -> Result<(), MerkleError> {
    let pad = "  ".repeat(depth);
    let raw = store.read(id)?.to_vec();
    match Node::decode(&raw)? {
        Node::Leaf { path, value } => {
            let _ = writeln!(out, "{pad}{id} leaf {path:?} => {}", hex::encode(value));
        }
        Node::Extension { path, child } => {
            let _ = writeln!(out, "{pad}{id} ext {path:?}");
            dump_at(store, child, depth + 1, out)?;
        }
        Node::Branch(recs) => {
            let _ = writeln!(out, "{pad}{id} branch ({} children)", recs.len());
            for n in 0..NBRANCH as u8 {
                let child = recs.child(n);
                if !child.is_null() {
                    let _ = writeln!(out, "{pad} [{n:x}]");
                    dump_at(store, child, depth + 1, out)?;
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::PagedMem;

    fn setup() -> NodeStore<PagedMem> {
        let mut store = NodeStore::new(PagedMem::new());
        store.ensure_updatable();
        store
    }

    fn key(tail: &[u8]) -> [u8; 32] {
        let mut k = [0u8; 32];
        k[32 - tail.len()..].copy_from_slice(tail);
        k
    }

    #[test]
    fn test_empty_tree_misses() {
        let store = setup();
        let k = key(&[1]);
        assert!(try_get(&store, NodeId::NULL, NibblePath::from_key(&k))
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_single_leaf_round_trip() {
        let mut store = setup();
        let k = key(&[1]);
        let root = insert(&mut store, NodeId::NULL, NibblePath::from_key(&k), b"v1").unwrap();
        assert_eq!(
            try_get(&store, root, NibblePath::from_key(&k)).unwrap(),
            Some(b"v1".to_vec())
        );
        let other = key(&[2]);
        assert!(try_get(&store, root, NibblePath::from_key(&other))
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_last_nibble_split_shape() {
        let mut store = setup();
        let (k1, k2) = (key(&[0x01]), key(&[0x02]));
        let mut root = NodeId::NULL;
        for k in [&k1, &k2] {
            root = insert(&mut store, root, NibblePath::from_key(k), b"v").unwrap();
        }
        // 63 shared nibbles: an extension over a branch over two empty-path leaves
        let raw = store.read(root).unwrap().to_vec();
        let (epath, branch) = match Node::decode(&raw).unwrap() {
            Node::Extension { path, child } => (path.len(), child),
            n => panic!("expected extension at the root, got {n:?}"),
        };
        assert_eq!(epath, 63);
        let braw = store.read(branch).unwrap().to_vec();
        let recs = *Node::decode(&braw).unwrap().as_branch().unwrap();
        assert_eq!(recs.len(), 2);
        for (_, leaf) in recs.iter() {
            let lraw = store.read(leaf).unwrap().to_vec();
            let (lpath, _) = match Node::decode(&lraw).unwrap() {
                Node::Leaf { path, value } => (path.len(), value.len()),
                n => panic!("expected leaf, got {n:?}"),
            };
            assert_eq!(lpath, 0);
        }
    }

    #[test]
    fn test_first_nibble_split_shape() {
        let mut store = setup();
        let mut k2 = key(&[0x01]);
        k2[0] = 0x10;
        let k1 = key(&[0x01]);
        let mut root = NodeId::NULL;
        for k in [&k1, &k2] {
            root = insert(&mut store, root, NibblePath::from_key(k), b"v").unwrap();
        }
        let raw = store.read(root).unwrap().to_vec();
        let recs = *Node::decode(&raw).unwrap().as_branch().unwrap();
        assert_eq!(recs.len(), 2);
        for (_, leaf) in recs.iter() {
            let lraw = store.read(leaf).unwrap().to_vec();
            let path_len = match Node::decode(&lraw).unwrap() {
                Node::Leaf { path, .. } => path.len(),
                n => panic!("expected leaf, got {n:?}"),
            };
            assert_eq!(path_len, 63);
        }
    }

    #[test]
    fn test_unchanged_insert_keeps_root() {
        let mut store = setup();
        let k = key(&[7, 7]);
        let root = insert(&mut store, NodeId::NULL, NibblePath::from_key(&k), b"same").unwrap();
        let again = insert(&mut store, root, NibblePath::from_key(&k), b"same").unwrap();
        assert_eq!(again, root);
    }

    #[test]
    fn test_remove_collapses_to_single_leaf() {
        let mut store = setup();
        let (k1, k2) = (key(&[0x01]), key(&[0x02]));
        let mut root = NodeId::NULL;
        root = insert(&mut store, root, NibblePath::from_key(&k1), b"a").unwrap();
        root = insert(&mut store, root, NibblePath::from_key(&k2), b"b").unwrap();
        root = remove(&mut store, root, NibblePath::from_key(&k2))
            .unwrap()
            .expect("key present");
        let raw = store.read(root).unwrap().to_vec();
        let (path, value) = match Node::decode(&raw).unwrap() {
            Node::Leaf { path, value } => (path.len(), value.to_vec()),
            n => panic!("expected leaf after collapse, got {n:?}"),
        };
        assert_eq!(path, 64);
        assert_eq!(value, b"a");
        assert_eq!(
            try_get(&store, root, NibblePath::from_key(&k1)).unwrap(),
            Some(b"a".to_vec())
        );
    }

    #[test]
    fn test_remove_missing_key_is_noop() {
        let mut store = setup();
        let k = key(&[1]);
        let root = insert(&mut store, NodeId::NULL, NibblePath::from_key(&k), b"v").unwrap();
        assert!(remove(&mut store, root, NibblePath::from_key(&key(&[9])))
            .unwrap()
            .is_none());
        assert_eq!(
            try_get(&store, root, NibblePath::from_key(&k)).unwrap(),
            Some(b"v".to_vec())
        );
    }

    #[test]
    fn test_remove_last_key_empties_tree() {
        let mut store = setup();
        let k = key(&[1]);
        let root = insert(&mut store, NodeId::NULL, NibblePath::from_key(&k), b"v").unwrap();
        let root = remove(&mut store, root, NibblePath::from_key(&k))
            .unwrap()
            .expect("key present");
        assert!(root.is_null());
    }

    #[test]
    fn test_empty_root_hash() {
        let store = setup();
        assert_eq!(
            root_hash(&store, NodeId::NULL).unwrap().to_string(),
            "56e81f171bcc55a6ff8345e692c0f86e5b48e01b996cadc001622fb5e363b421"
        );
    }
}

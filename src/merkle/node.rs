//! On-disk node codec and the Merkle (RLP/Keccak) encoding.
//!
//! Every node starts with a prefix byte whose top two bits select the kind;
//! the rest of the payload is kind-specific:
//!
//! - extension (`0b00……`): serialized path, then the 8-byte LE child id
//! - leaf (`0b01……`): serialized path, then the value to the end of the slot
//! - branch (`0b10……`): low four prefix bits hold `child_count - 2`; the
//!   body is one 8-byte LE record per child, `(nibble << 60) | child_id`.
//!   With fewer than 16 children the records sit in insertion order; a full
//!   branch stores the record for nibble `i` at byte `1 + i * 8` so lookup
//!   is a direct index.
//!
//! The Merkle encoding follows the Ethereum rule: a node whose RLP is
//! shorter than 32 bytes is inlined into its parent verbatim, anything
//! longer is referenced by its Keccak-256 hash.

use bitflags::bitflags;
use enum_as_inner::EnumAsInner;
use sha3::{Digest, Keccak256};

use crate::nibbles::{NibblePath, MAX_PATH_BYTES};
use crate::storage::{NodeId, ID_SIZE};

use super::MerkleError;

/// Branching factor of the trie.
pub const NBRANCH: usize = 16;

/// Largest value the engine accepts; keeps any node within a page slot.
pub const MAX_VALUE_LEN: usize = 1024;

/// Serialized size bounds per kind.
pub const MAX_NODE_LEN: usize = 1 + MAX_PATH_BYTES + MAX_VALUE_LEN;
pub const BRANCH_MAX_LEN: usize = 1 + NBRANCH * ID_SIZE;
pub const EXT_MAX_LEN: usize = 1 + MAX_PATH_BYTES + ID_SIZE;

const KIND_MASK: u8 = 0b1100_0000;
const EXT_TAG: u8 = 0b0000_0000;
const LEAF_TAG: u8 = 0b0100_0000;
const BRANCH_TAG: u8 = 0b1000_0000;

const CHILD_MASK: u64 = 0x0fff_ffff_ffff_ffff;

/// Child table of a branch node, kept in record order.
///
/// Sparse tables preserve insertion order; the moment the table fills up it
/// is normalized to nibble order, which is what the full on-disk layout and
/// its O(1) lookup rely on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BranchRecords {
    recs: [(u8, NodeId); NBRANCH],
    count: u8,
}

impl BranchRecords {
    pub fn new() -> Self {
        Self {
            recs: [(0, NodeId::NULL); NBRANCH],
            count: 0,
        }
    }

    /// The two-child table every split starts from.
    pub fn pair(na: u8, a: NodeId, nb: u8, b: NodeId) -> Self {
        debug_assert!(na != nb);
        let mut recs = Self::new();
        recs.set(na, a);
        recs.set(nb, b);
        recs
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.count as usize
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    #[inline(always)]
    pub fn is_full(&self) -> bool {
        self.count as usize == NBRANCH
    }

    /// Child id for `nibble`, or null. Full tables are nibble-ordered, so
    /// the lookup is a direct index; sparse tables scan.
    pub fn child(&self, nibble: u8) -> NodeId {
        if self.is_full() {
            return self.recs[nibble as usize].1;
        }
        for (n, id) in self.iter() {
            if n == nibble {
                return id;
            }
        }
        NodeId::NULL
    }

    /// Replaces the record for `nibble`, or appends one.
    pub fn set(&mut self, nibble: u8, id: NodeId) {
        debug_assert!((nibble as usize) < NBRANCH);
        debug_assert!(!id.is_null());
        for rec in self.recs[..self.count as usize].iter_mut() {
            if rec.0 == nibble {
                rec.1 = id;
                return;
            }
        }
        self.recs[self.count as usize] = (nibble, id);
        self.count += 1;
        if self.is_full() {
            self.recs.sort_unstable_by_key(|r| r.0);
        }
    }

    /// Drops the record for `nibble`, preserving the order of the rest.
    pub fn unset(&mut self, nibble: u8) {
        let n = self.count as usize;
        if let Some(at) = self.recs[..n].iter().position(|r| r.0 == nibble) {
            self.recs.copy_within(at + 1..n, at);
            self.count -= 1;
        }
    }

    /// The only record, once a removal has whittled the table down to one.
    pub fn single(&self) -> Option<(u8, NodeId)> {
        (self.count == 1).then(|| self.recs[0])
    }

    pub fn iter(&self) -> impl Iterator<Item = (u8, NodeId)> + '_ {
        self.recs[..self.count as usize].iter().copied()
    }
}

impl Default for BranchRecords {
    fn default() -> Self {
        Self::new()
    }
}

/// A decoded node borrowing the slot it was read from.
#[derive(Debug, PartialEq, Eq, EnumAsInner)]
pub enum Node<'a> {
    Leaf { path: NibblePath<'a>, value: &'a [u8] },
    Extension { path: NibblePath<'a>, child: NodeId },
    Branch(BranchRecords),
}

impl<'a> Node<'a> {
    pub fn decode(raw: &'a [u8]) -> Result<Node<'a>, MerkleError> {
        let corrupt = MerkleError::CorruptNode;
        let &prefix = raw.first().ok_or(corrupt("empty slot"))?;
        match prefix & KIND_MASK {
            LEAF_TAG => {
                let (path, value) =
                    NibblePath::read_from(&raw[1..]).ok_or(corrupt("leaf path"))?;
                Ok(Node::Leaf { path, value })
            }
            EXT_TAG => {
                let (path, rest) =
                    NibblePath::read_from(&raw[1..]).ok_or(corrupt("extension path"))?;
                if path.is_empty() {
                    return Err(corrupt("empty extension path"));
                }
                let raw_id: [u8; ID_SIZE] = rest
                    .try_into()
                    .map_err(|_| corrupt("extension child id"))?;
                let child = NodeId::new(u64::from_le_bytes(raw_id));
                if child.is_null() {
                    return Err(corrupt("null extension child"));
                }
                Ok(Node::Extension { path, child })
            }
            BRANCH_TAG => {
                let count = ((prefix & 0x0f) + 2) as usize;
                let body = &raw[1..];
                if count > NBRANCH || body.len() != count * ID_SIZE {
                    return Err(corrupt("branch record table"));
                }
                let mut recs = BranchRecords::new();
                let mut seen = 0u16;
                for (i, rec) in body.chunks_exact(ID_SIZE).enumerate() {
                    let rec = rec
                        .try_into()
                        .map(u64::from_le_bytes)
                        .map_err(|_| corrupt("branch record"))?;
                    let nibble = (rec >> 60) as u8;
                    let child = NodeId::new(rec & CHILD_MASK);
                    if child.is_null() || seen & (1 << nibble) != 0 {
                        return Err(corrupt("branch record"));
                    }
                    if count == NBRANCH && nibble as usize != i {
                        return Err(corrupt("full branch record order"));
                    }
                    seen |= 1 << nibble;
                    recs.recs[i] = (nibble, child);
                }
                recs.count = count as u8;
                Ok(Node::Branch(recs))
            }
            _ => Err(corrupt("unknown node kind")),
        }
    }
}

pub fn encode_leaf(path: &NibblePath, value: &[u8], dst: &mut [u8]) -> usize {
    dst[0] = LEAF_TAG;
    let rest = path.write_to(&mut dst[1..]);
    rest[..value.len()].copy_from_slice(value);
    1 + path.encoded_len() + value.len()
}

pub fn encode_extension(path: &NibblePath, child: NodeId, dst: &mut [u8]) -> usize {
    debug_assert!(!path.is_empty());
    debug_assert!(!child.is_null());
    dst[0] = EXT_TAG;
    let rest = path.write_to(&mut dst[1..]);
    rest[..ID_SIZE].copy_from_slice(&child.raw().to_le_bytes());
    1 + path.encoded_len() + ID_SIZE
}

pub fn encode_branch(recs: &BranchRecords, dst: &mut [u8]) -> usize {
    debug_assert!(recs.len() >= 2);
    dst[0] = BRANCH_TAG | (recs.len() - 2) as u8;
    for (i, (nibble, child)) in recs.iter().enumerate() {
        debug_assert!(child.raw() <= CHILD_MASK);
        let rec = ((nibble as u64) << 60) | child.raw();
        dst[1 + i * ID_SIZE..1 + (i + 1) * ID_SIZE].copy_from_slice(&rec.to_le_bytes());
    }
    1 + recs.len() * ID_SIZE
}

bitflags! {
    // hex-prefix flag nibble
    struct Flags: u8 {
        const TERMINAL = 0b0010;
        const ODD_LEN  = 0b0001;
    }
}

/// Ethereum hex-prefix encoding of a path, used only inside the RLP forms.
fn hex_prefix(path: &NibblePath, terminal: bool) -> Vec<u8> {
    let mut flags = Flags::empty();
    if terminal {
        flags |= Flags::TERMINAL;
    }
    let odd = path.len() & 1 == 1;
    if odd {
        flags |= Flags::ODD_LEN;
    }
    let mut out = Vec::with_capacity(1 + path.len() / 2);
    let start = if odd {
        out.push((flags.bits() << 4) | path.nibble_at(0));
        1
    } else {
        out.push(flags.bits() << 4);
        0
    };
    let mut i = start;
    while i < path.len() {
        out.push((path.nibble_at(i) << 4) | path.nibble_at(i + 1));
        i += 2;
    }
    out
}

/// How a node's Merkle encoding landed in the caller's 32-byte buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MerkleEnc {
    /// The RLP fit inline; the buffer holds that many raw bytes.
    HasRlp(usize),
    /// The RLP was 32 bytes or longer; the buffer holds its Keccak-256.
    HasKeccak,
}

/// A child reference while assembling a parent's RLP.
#[derive(Debug, Clone, Copy)]
pub enum RlpChild<'a> {
    /// Short child, spliced in as already-encoded RLP.
    Inline(&'a [u8]),
    /// Long child, referenced by hash (a 32-byte RLP string).
    Hash(&'a [u8; 32]),
}

fn append_child(stream: &mut rlp::RlpStream, child: RlpChild) {
    match child {
        RlpChild::Inline(raw) => {
            stream.append_raw(raw, 1);
        }
        RlpChild::Hash(h) => {
            stream.append(&&h[..]);
        }
    }
}

pub fn leaf_rlp(path: &NibblePath, value: &[u8]) -> Vec<u8> {
    rlp::encode_list::<Vec<u8>, _>(&[hex_prefix(path, true), value.to_vec()]).into()
}

pub fn extension_rlp(path: &NibblePath, child: RlpChild) -> Vec<u8> {
    let mut stream = rlp::RlpStream::new_list(2);
    stream.append(&hex_prefix(path, false));
    append_child(&mut stream, child);
    stream.out().into()
}

pub fn branch_rlp(children: &[Option<RlpChild>; NBRANCH]) -> Vec<u8> {
    let mut stream = rlp::RlpStream::new_list(NBRANCH + 1);
    for child in children {
        match child {
            Some(c) => append_child(&mut stream, *c),
            None => {
                stream.append_empty_data();
            }
        }
    }
    // branches carry no value of their own
    stream.append_empty_data();
    stream.out().into()
}

/// Finishes a Merkle encoding: short RLP is copied into `out` verbatim,
/// anything 32 bytes or longer is replaced by its Keccak-256.
pub fn digest_or_inline(raw: &[u8], out: &mut [u8; 32]) -> MerkleEnc {
    if raw.len() >= 32 {
        *out = Keccak256::digest(raw).into();
        MerkleEnc::HasKeccak
    } else {
        out[..raw.len()].copy_from_slice(raw);
        MerkleEnc::HasRlp(raw.len())
    }
}

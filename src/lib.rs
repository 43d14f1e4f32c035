//! # Sapwood: an embedded Merkle-Patricia key-value store for chain state.
//!
//! Sapwood maps 32-byte keys (account or storage-slot identifiers) to small
//! values and keeps an Ethereum-style Merkle-Patricia trie over the mapping,
//! so a Keccak-256 root commitment is available at any time. It is built to
//! sit directly under an EVM-ish state layer: no generic KV store below it,
//! no emulation of the trie on top of a flat namespace. The trie nodes
//! *are* the on-disk data structure.
//!
//! The layering, bottom up:
//!
//! - **Paged arena** ([storage::PageStore], with [storage::PagedMem] in
//!   memory and [file::PagedFile] on disk): a linear 64-bit byte space cut
//!   into fixed 4 KiB pages, chunked into memory-mapped segment files. A
//!   node id is just an offset into this space; a node never straddles a
//!   page, so a page is always self-contained on disk.
//!
//! - **Copy-on-write store** ([storage::NodeStore]): the single-writer
//!   discipline. Every id below the `update_from` watermark belongs to a
//!   sealed revision and is immutable forever; everything above it is the
//!   current batch's private frontier and may be rewritten in place. A
//!   per-length cache recycles frontier slots that structural rewrites
//!   outgrow. Sealing a batch is one store write: the watermark jumps to
//!   infinity. No reference counting anywhere.
//!
//! - **Trie engine** ([merkle]): leaf/extension/branch nodes addressed by
//!   nibble paths ([nibbles::NibblePath], a zero-copy half-byte view),
//!   insert with the usual split and push-down rewrites, removal with
//!   branch collapse, and the RLP/Keccak encoding that produces the same
//!   root hash geth would.
//!
//! - **Engine surface** ([db::Db] / [db::Batch]): one write batch at a
//!   time; readers observe the previously committed root until the batch
//!   publishes. Commit modes decide whether the batch stays overwritable,
//!   seals, or seals and flushes to disk.

pub mod db;
pub mod file;
pub(crate) mod logger;
pub mod merkle;
pub mod nibbles;
pub mod storage;

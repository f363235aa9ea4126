//! `coffer` is the storage core of an embedded, transactional database: one
//! memory-mapped file of immutable, 8-byte-aligned nodes, mutated copy-on-write
//! and published by flipping a single selector byte between two top-ref slots.
//!
//! The crate is organized bottom-up:
//!   - node headers and bit-packed integer arrays (the leaves),
//!   - B+-trees assembled from those arrays,
//!   - a slab allocator that hands out file offsets and tracks per-version
//!     free space,
//!   - an AES-CBC + HMAC page layer that makes the file unreadable at rest and
//!     recoverable after a torn write,
//!   - a commit engine providing single-writer / many-reader transactions.
//!
//! Everything above this (schema, queries, sync) lives in other crates and
//! only consumes the transaction, array and tree interfaces exported here.

pub mod api;
pub use api::*;

mod backend;
pub use backend::{Array, BpTree, ReadArray, ReadTree, SlabAlloc, BP_ORDER};
pub use backend::{Encoding, NodeFlags, NodeHeader, RefOrTagged};
pub use backend::{ReadTxn, Store, StoreOptions, WriteTxn};

#[cfg(test)]
mod tests;

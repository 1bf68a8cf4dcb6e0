//! # Revision-Safe Copy-on-Write B-Tree
//!
//! The tree that backs a [`Table`]: fixed-size blocks in a single data
//! file, each block a node, with a directory of sorted item offsets up
//! front and the items themselves packed against the block's tail.
//!
//! ## Block layout
//!
//! ```text
//!   R L M T D o1 o2 o3 ... oN <gap> [item] .. [item] .. [item]
//!   <---------- D ----------> <-M->
//!
//!   R = REVISION    u32 LE  revision that wrote this block
//!   L = LEVEL       u8      0 = leaf; the root has the highest level
//!   M = MAX_FREE    u16 LE  size of the gap after the directory
//!   T = TOTAL_FREE  u16 LE  total free bytes in the block
//!   D = DIR_END     u16 LE  end offset of the directory (exclusive)
//! ```
//!
//! `o1..oN` are offsets to the N items, ordered by item key. Items grow
//! downward from the block end; deleting or shrinking an item leaves a
//! hole that `TOTAL_FREE` tracks and compaction reclaims.
//!
//! ## Item layout
//!
//! ```text
//!   leaf:    I K key x C tag
//!   branch:  I K key x child
//!              <-K-->
//!            <-----I----->
//! ```
//!
//! A value too long for one block is split into C chunks, each stored
//! as its own item; the key is extended with a big-endian counter `x`
//! running from 1 to C, so the chunks of one logical value sort
//! contiguously and in order. Branch items carry a child block number
//! where leaf items carry a tag chunk.
//!
//! ## Copy-on-write
//!
//! Blocks are never modified in place unless they were allocated during
//! the current transaction ("free at start"). Touching an older block
//! moves it to a fresh block number first, rippling a pointer update up
//! to the root; the displaced numbers are not reusable until commit, so
//! readers of the previous revision keep a consistent tree under their
//! feet without taking any lock.

mod block;
mod cursor;
mod item;
mod table;

pub use cursor::Cursor;
pub use table::Table;

/// Offset of the first directory entry; also the block header size.
pub(crate) const DIR_START: usize = 11;

/// Width of one directory entry.
pub(crate) const D2: usize = 2;

/// Longest key `add` accepts. The key length byte also covers the
/// 2-byte chunk counter, and a one-byte margin keeps separator
/// truncation (which may lengthen a key by one byte) in range.
pub const MAX_KEY_LEN: usize = 252;

/// Hard ceiling on tree depth; a table needing more levels than this is
/// corrupt, not merely large.
pub const BTREE_CURSOR_LEVELS: usize = 10;

/// At least this many maximal items fit in any block.
pub(crate) const BLOCK_CAPACITY: usize = 4;

/// Cursor slot holding no block.
pub(crate) const BLK_UNUSED: u32 = u32::MAX;

/// A run of this many in-order insertions flips block splitting into
/// sequential (split-at-insert-point) mode.
pub(crate) const SEQ_START_POINT: i32 = -10;

/// Largest item a block of `block_size` bytes may hold.
pub(crate) fn max_item_size(block_size: usize) -> usize {
    (block_size - DIR_START - BLOCK_CAPACITY * D2) / BLOCK_CAPACITY
}

//! # Cursors
//!
//! A [`Cursor`] is a read-only positional iterator over a table,
//! independent of the writer's built-in stack: it owns one
//! [`CursorLevel`] per tree level and borrows the table only to read
//! blocks (preferring the writer's in-memory copies, which may be ahead
//! of the disk).
//!
//! Entries are the component-1 items of each logical key; [`Cursor::next`]
//! and [`Cursor::prev`] step over continuation chunks and the null item
//! transparently. Reading a value ([`Cursor::current_tag`]) walks the
//! chunk chain and leaves the underlying position on the last chunk, so
//! the following `next` lands on the next key.
//!
//! ## Walk strategies
//!
//! The default step recurses up the cursor stack and back down into the
//! sibling subtree. For tables whose persisted `sequential` flag is
//! still set - blocks were allocated roughly in key order - the leaf
//! level instead steps by block number directly, skipping blocks that
//! are not leaves or that live (possibly modified) in the writer's
//! cursor stack.
//!
//! ## Invalidation
//!
//! Each cursor snapshots the table's `cursor_version`; a writer
//! mutation made after the cursor was created bumps the version, and
//! the cursor re-resolves its current key before its next movement.

use std::cmp::Ordering;
use std::mem;

use eyre::{ensure, Result};
use smallvec::SmallVec;

use crate::compress::TagCompressor;
use crate::error::Error;

use super::block;
use super::item::{Item, SearchKey};
use super::table::{find_in_block, Table};
use super::{BLK_UNUSED, BTREE_CURSOR_LEVELS, D2, DIR_START, MAX_KEY_LEN};

/// One level of a cursor: a block number, the owned buffer holding that
/// block, the current directory offset, and whether the buffer has
/// unwritten modifications (only ever true in the writer's built-in
/// stack).
#[derive(Debug)]
pub(crate) struct CursorLevel {
    pub n: u32,
    pub p: Vec<u8>,
    pub c: i32,
    pub rewrite: bool,
}

impl CursorLevel {
    pub fn new(block_size: usize) -> Self {
        Self {
            n: BLK_UNUSED,
            p: vec![0; block_size],
            c: -1,
            rewrite: false,
        }
    }
}

/// Read-only positional iterator over a [`Table`].
#[derive(Debug)]
pub struct Cursor<'a> {
    table: &'a Table,
    levels: SmallVec<[CursorLevel; BTREE_CURSOR_LEVELS]>,
    level: usize,
    version: u64,
    positioned: bool,
    current_key: Vec<u8>,
    compressor: TagCompressor,
}

impl<'a> Cursor<'a> {
    pub(crate) fn new(table: &'a Table) -> Self {
        let level = table.tree_level();
        let mut levels: SmallVec<[CursorLevel; BTREE_CURSOR_LEVELS]> = (0..=level)
            .map(|_| CursorLevel::new(table.block_size()))
            .collect();
        let (root_p, root_n) = table.builtin_root();
        levels[level].p.copy_from_slice(root_p);
        levels[level].n = root_n;
        table.mark_cursor_created();
        Self {
            table,
            levels,
            level,
            version: table.cursor_version_snapshot(),
            positioned: false,
            current_key: Vec::new(),
            compressor: TagCompressor::new(),
        }
    }

    /// Positions on the last entry whose key is <= `key`; true iff the
    /// key matched exactly. With an empty (or over-long, hence
    /// unstorable) key the cursor lands before the first entry.
    pub fn find_entry(&mut self, key: &[u8]) -> Result<bool> {
        self.sync_version()?;
        self.find_entry_inner(key)
    }

    fn find_entry_inner(&mut self, key: &[u8]) -> Result<bool> {
        let found = if key.len() > MAX_KEY_LEN {
            self.descend(&SearchKey::new(&key[..MAX_KEY_LEN], 1))?;
            false
        } else {
            self.descend(&SearchKey::new(key, 1))?
        };

        // A miss can land inside another key's chunk chain, or before
        // the first item of a non-leftmost leaf (separator truncation
        // admits keys below the leaf's first); back up to the first
        // component of the true predecessor. The leftmost leaf's null
        // item stops both walks.
        loop {
            let c = self.levels[0].c;
            if c >= DIR_START as i32
                && Item::at(&self.levels[0].p, c as usize).component() == 1
            {
                break;
            }
            if !self.step_prev()? {
                break;
            }
        }

        self.positioned = true;
        self.refresh_current_key();
        Ok(found)
    }

    /// Moves to the next entry; false (and unpositioned) at the end.
    /// On a freshly created cursor this is the first entry.
    pub fn next(&mut self) -> Result<bool> {
        self.sync_version()?;
        if !self.positioned {
            self.find_entry_inner(b"")?;
        }
        loop {
            if !self.step_next()? {
                self.positioned = false;
                return Ok(false);
            }
            let item = Item::at(&self.levels[0].p, self.levels[0].c as usize);
            if item.component() == 1 && item.key().len() > 0 {
                break;
            }
        }
        self.refresh_current_key();
        Ok(true)
    }

    /// Moves to the previous entry; false (and unpositioned) before the
    /// first.
    pub fn prev(&mut self) -> Result<bool> {
        self.sync_version()?;
        if !self.positioned {
            return Ok(false);
        }
        // Reading a tag leaves the underlying position on the entry's
        // last chunk; walk back onto its first component so the step
        // below really reaches the previous entry.
        while self.levels[0].c >= DIR_START as i32
            && Item::at(&self.levels[0].p, self.levels[0].c as usize).component() != 1
        {
            if !self.step_prev()? {
                self.positioned = false;
                return Ok(false);
            }
        }
        loop {
            if !self.step_prev()? {
                self.positioned = false;
                return Ok(false);
            }
            let item = Item::at(&self.levels[0].p, self.levels[0].c as usize);
            if item.component() == 1 && item.key().len() > 0 {
                break;
            }
        }
        self.refresh_current_key();
        Ok(true)
    }

    /// The key of the current entry; `None` when unpositioned or before
    /// the first entry.
    pub fn current_key(&self) -> Option<&[u8]> {
        (self.positioned && !self.current_key.is_empty()).then_some(self.current_key.as_slice())
    }

    /// The value of the current entry, reassembled from its chunks and
    /// decompressed.
    pub fn current_tag(&mut self) -> Result<Vec<u8>> {
        self.sync_version()?;
        ensure!(
            self.positioned && self.levels[0].c >= DIR_START as i32 && !self.current_key.is_empty(),
            "cursor is not positioned on an entry"
        );

        // A prior read left the position on this entry's last chunk;
        // re-resolve onto its first component before reading again.
        if Item::at(&self.levels[0].p, self.levels[0].c as usize).component() != 1 {
            let key = mem::take(&mut self.current_key);
            self.find_entry_inner(&key)?;
        }

        let (components, compressed, mut tag) = {
            let first = Item::at(&self.levels[0].p, self.levels[0].c as usize);
            let mut tag = Vec::new();
            tag.extend_from_slice(first.tag());
            (first.components(), first.compressed(), tag)
        };

        for _ in 2..=components {
            if !self.step_next()? {
                eyre::bail!(Error::Corrupt(
                    "unexpected end of table when reading continuation of tag".into()
                ));
            }
            let chunk = Item::at(&self.levels[0].p, self.levels[0].c as usize);
            tag.extend_from_slice(chunk.tag());
        }

        if compressed {
            self.compressor.inflate(&tag)
        } else {
            Ok(tag)
        }
    }

    /// Re-resolves the cursor after a writer mutation bumped the
    /// table's cursor version.
    fn sync_version(&mut self) -> Result<()> {
        if self.version == self.table.cursor_version_snapshot() {
            return Ok(());
        }
        self.version = self.table.cursor_version_snapshot();
        self.level = self.table.tree_level();
        self.levels = (0..=self.level)
            .map(|_| CursorLevel::new(self.table.block_size()))
            .collect();
        let (root_p, root_n) = self.table.builtin_root();
        self.levels[self.level].p.copy_from_slice(root_p);
        self.levels[self.level].n = root_n;

        if self.positioned {
            let key = mem::take(&mut self.current_key);
            self.find_entry_inner(&key)?;
        }
        Ok(())
    }

    fn descend(&mut self, key: &SearchKey) -> Result<bool> {
        for j in (1..=self.level).rev() {
            let c = find_in_block(&self.levels[j].p, key, false, self.levels[j].c);
            self.levels[j].c = c;
            let child = Item::at(&self.levels[j].p, c as usize).child_block();
            let parent_revision = block::revision(&self.levels[j].p);
            self.table
                .load_block_for_reader(&mut self.levels[j - 1], j - 1, child, parent_revision)?;
        }
        let c = find_in_block(&self.levels[0].p, key, true, self.levels[0].c);
        self.levels[0].c = c;
        if c < DIR_START as i32 {
            return Ok(false);
        }
        Ok(Item::at(&self.levels[0].p, c as usize).key().cmp_search(key) == Ordering::Equal)
    }

    fn refresh_current_key(&mut self) {
        self.current_key.clear();
        let c = self.levels[0].c;
        if c >= DIR_START as i32 {
            self.current_key
                .extend_from_slice(Item::at(&self.levels[0].p, c as usize).key().bytes());
        }
    }

    fn step_next(&mut self) -> Result<bool> {
        if self.table.is_sequential() {
            self.next_sequential()
        } else {
            self.next_default(0)
        }
    }

    fn step_prev(&mut self) -> Result<bool> {
        if self.table.is_sequential() {
            self.prev_sequential()
        } else {
            self.prev_default(0)
        }
    }

    fn next_default(&mut self, j: usize) -> Result<bool> {
        let mut c = self.levels[j].c + D2 as i32;
        if c as usize >= block::dir_end(&self.levels[j].p) {
            if j == self.level {
                return Ok(false);
            }
            // The recursive step repositions the parent and loads its
            // next child into this level.
            if !self.next_default(j + 1)? {
                return Ok(false);
            }
            c = DIR_START as i32;
        }
        self.levels[j].c = c;
        if j > 0 {
            let child = Item::at(&self.levels[j].p, c as usize).child_block();
            let parent_revision = block::revision(&self.levels[j].p);
            self.table
                .load_block_for_reader(&mut self.levels[j - 1], j - 1, child, parent_revision)?;
        }
        Ok(true)
    }

    fn prev_default(&mut self, j: usize) -> Result<bool> {
        let mut c = self.levels[j].c;
        if c <= DIR_START as i32 {
            if j == self.level {
                return Ok(false);
            }
            if !self.prev_default(j + 1)? {
                return Ok(false);
            }
            c = block::dir_end(&self.levels[j].p) as i32;
        }
        c -= D2 as i32;
        self.levels[j].c = c;
        if j > 0 {
            let child = Item::at(&self.levels[j].p, c as usize).child_block();
            let parent_revision = block::revision(&self.levels[j].p);
            self.table
                .load_block_for_reader(&mut self.levels[j - 1], j - 1, child, parent_revision)?;
        }
        Ok(true)
    }

    fn next_sequential(&mut self) -> Result<bool> {
        let mut c = self.levels[0].c + D2 as i32;
        if c as usize >= block::dir_end(&self.levels[0].p) {
            let mut n = self.levels[0].n;
            self.levels[0].n = BLK_UNUSED;
            loop {
                if n >= self.table.last_block() {
                    return Ok(false);
                }
                n += 1;
                if !self.table.read_block_for_sequential(n, &mut self.levels[0].p)? {
                    continue;
                }
                self.check_sequential_revision()?;
                if block::level(&self.levels[0].p) == 0 {
                    break;
                }
            }
            self.levels[0].n = n;
            c = DIR_START as i32;
        }
        self.levels[0].c = c;
        Ok(true)
    }

    fn prev_sequential(&mut self) -> Result<bool> {
        let mut c = self.levels[0].c;
        if c <= DIR_START as i32 {
            let mut n = self.levels[0].n;
            self.levels[0].n = BLK_UNUSED;
            loop {
                if n == 0 {
                    return Ok(false);
                }
                n -= 1;
                if !self.table.read_block_for_sequential(n, &mut self.levels[0].p)? {
                    continue;
                }
                self.check_sequential_revision()?;
                if block::level(&self.levels[0].p) == 0 {
                    break;
                }
            }
            self.levels[0].n = n;
            c = block::dir_end(&self.levels[0].p) as i32;
        }
        c -= D2 as i32;
        self.levels[0].c = c;
        Ok(true)
    }

    /// A sequential walk reads blocks without descending through their
    /// parents, so the revision guard compares against the opened
    /// revision directly (one higher for a writer, whose uncommitted
    /// blocks already carry the next revision).
    fn check_sequential_revision(&self) -> Result<()> {
        let limit = self.table.revision() + u32::from(self.table.is_writable());
        if block::revision(&self.levels[0].p) > limit {
            return Err(self.table.reader_overwritten_err());
        }
        Ok(())
    }
}

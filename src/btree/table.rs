//! # Table Engine
//!
//! The writer (and point-reader) side of the tree: one [`Table`] owns
//! the data file, the in-memory base, a built-in cursor stack, and the
//! scratch buffers every mutation works through.
//!
//! ## Copy-on-write transaction shape
//!
//! A transaction is simply the span between two commits. The first
//! modification of any pre-existing block moves it to a freshly
//! allocated block number ([`Table::alter`]); the old number is
//! released into the live free map but stays claimed in the
//! transaction-start snapshot, so a reader of the committed revision
//! can keep walking its tree unharmed. Commit flushes the dirty cursor
//! blocks, fsyncs the data file, writes the new base under a temporary
//! name and atomically renames it over the retiring letter's sibling.
//! The retiring base itself is unlinked lazily, on the first block
//! write of the *next* transaction, so a reader that opened just before
//! the commit still finds a consistent pair on disk.
//!
//! ## Sequential-insertion bias
//!
//! A run of in-order insertions (tracked via `changed_n`/`changed_c`
//! and `seq_count`) flips block splitting from the mid-point rule to
//! splitting at the insertion point, which leaves the left half full
//! and immutable in the common append pattern. The persisted
//! `sequential` flag additionally lets cursors walk leaves by block
//! number instead of through the tree.

use std::cell::Cell;
use std::cmp::Ordering;
use std::io::Write;
use std::mem;
use std::path::{Path, PathBuf};

use eyre::{bail, ensure, Result};
use smallvec::SmallVec;
use tracing::debug;

use crate::compress::{CompressStrategy, TagCompressor, COMPRESS_MIN};
use crate::config::{snap_block_size, TableOptions};
use crate::encoding::pack_uint;
use crate::error::Error;
use crate::storage::{
    base_path, db_path, other_letter, tmp_path, BlockFile, RevisionBase,
};

use super::block;
use super::cursor::{Cursor, CursorLevel};
use super::item::{self, Item, ItemBuf, SearchKey};
use super::{
    max_item_size, BLK_UNUSED, BTREE_CURSOR_LEVELS, D2, DIR_START, MAX_KEY_LEN, SEQ_START_POINT,
};

/// A single-file, revision-safe, copy-on-write B-tree mapping byte
/// string keys to byte string values.
#[derive(Debug)]
pub struct Table {
    path: PathBuf,
    name: String,
    writable: bool,
    lazy: bool,
    dangerous: bool,
    full_compaction: bool,
    compress_strategy: CompressStrategy,

    file: Option<BlockFile>,
    base: RevisionBase,
    base_letter: char,
    both_bases: bool,

    block_size: usize,
    max_item: usize,
    revision: u32,
    latest_revision: u32,
    root: u32,
    level: usize,
    item_count: u32,
    faked_root: bool,
    sequential: bool,
    modified: bool,

    stack: SmallVec<[CursorLevel; BTREE_CURSOR_LEVELS]>,
    kt: ItemBuf,
    scratch: Vec<u8>,
    split_buf: Vec<u8>,
    compressor: TagCompressor,

    seq_count: i32,
    changed_n: u32,
    changed_c: i32,
    cursor_version: u64,
    cursor_since_modify: Cell<bool>,
}

impl Table {
    fn init(path: &Path, options: &TableOptions, writable: bool) -> Self {
        let block_size = snap_block_size(options.block_size);
        Self {
            path: path.to_path_buf(),
            name: table_name(path),
            writable,
            lazy: options.lazy,
            dangerous: options.dangerous,
            full_compaction: options.full_compaction,
            compress_strategy: options.compress_strategy,
            file: None,
            base: RevisionBase::new(block_size as u32),
            base_letter: 'A',
            both_bases: false,
            block_size,
            max_item: max_item_size(block_size),
            revision: 0,
            latest_revision: 0,
            root: 0,
            level: 0,
            item_count: 0,
            faked_root: true,
            sequential: true,
            modified: false,
            stack: SmallVec::new(),
            kt: ItemBuf::default(),
            scratch: Vec::new(),
            split_buf: Vec::new(),
            compressor: TagCompressor::new(),
            seq_count: 0,
            changed_n: 0,
            changed_c: DIR_START as i32,
            cursor_version: 0,
            cursor_since_modify: Cell::new(false),
        }
    }

    /// Creates a fresh table at `path`, truncating any existing one: an
    /// initial base `A` at revision 0 with a faked root, and an empty
    /// data file.
    pub fn create(path: &Path, options: TableOptions) -> Result<Self> {
        ensure!(
            !options.readonly,
            Error::Database("can't create a table read-only".into())
        );
        let mut table = Self::init(path, &options, true);
        table.create_and_open()?;
        debug!(path = %path.display(), block_size = table.block_size, "created table");
        Ok(table)
    }

    /// Opens the table at its latest committed revision.
    pub fn open(path: &Path, options: TableOptions) -> Result<Self> {
        let writable = !options.readonly;
        let mut table = Self::init(path, &options, writable);
        table.open_files(None, false)?;
        debug!(path = %path.display(), revision = table.revision, "opened table");
        Ok(table)
    }

    /// Opens the table at a specific revision. Returns `Ok(None)` -
    /// non-exceptionally - when that revision is no longer present on
    /// disk; the caller picks a newer one and retries.
    pub fn open_at(path: &Path, options: TableOptions, revision: u32) -> Result<Option<Self>> {
        let writable = !options.readonly;
        let mut table = Self::init(path, &options, writable);
        if table.open_files(Some(revision), false)? {
            Ok(Some(table))
        } else {
            Ok(None)
        }
    }

    /// Whether a committed table exists at `path`.
    pub fn exists(path: &Path) -> bool {
        db_path(path).exists()
            && (base_path(path, 'A').exists() || base_path(path, 'B').exists())
    }

    fn create_and_open(&mut self) -> Result<()> {
        let mut base = RevisionBase::new(self.block_size as u32);
        base.set_revision(self.revision);
        base.write_to_file(&base_path(&self.path, 'A'))?;
        let _ = std::fs::remove_file(base_path(&self.path, 'B'));
        self.open_files(None, true)?;
        Ok(())
    }

    /// Opens data file and base; `Ok(false)` only when a requested
    /// revision is missing.
    fn open_files(&mut self, requested: Option<u32>, create: bool) -> Result<bool> {
        let db = db_path(&self.path);
        let file = if create {
            BlockFile::create(&db)
        } else {
            BlockFile::open(&db, self.writable)
        };
        match file {
            Ok(f) => self.file = Some(f),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound && self.lazy && !create => {
                // A lazy table with no data file is simply empty; a lazy
                // writer creates its files on the first add. The faked
                // root still needs a cursor stack behind it.
                self.revision = requested.unwrap_or(0);
                self.latest_revision = self.revision;
                self.kt = ItemBuf::new(self.block_size);
                self.stack = smallvec::smallvec![CursorLevel::new(self.block_size)];
                if self.writable {
                    self.scratch = vec![0; self.block_size];
                    self.split_buf = vec![0; self.block_size];
                }
                self.read_root()?;
                return Ok(true);
            }
            Err(e) => {
                return Err(Error::Opening(format!(
                    "couldn't open {}: {e}",
                    db.display()
                ))
                .into())
            }
        }

        if !self.basic_open(requested)? {
            self.file = None;
            return Ok(false);
        }

        self.kt = ItemBuf::new(self.block_size);
        self.stack = (0..=self.level)
            .map(|_| CursorLevel::new(self.block_size))
            .collect();
        if self.writable {
            self.scratch = vec![0; self.block_size];
            self.split_buf = vec![0; self.block_size];
        }
        self.read_root()?;

        self.changed_n = 0;
        self.changed_c = DIR_START as i32;
        self.seq_count = SEQ_START_POINT;
        Ok(true)
    }

    /// Reads whichever base files exist and installs the right one.
    fn basic_open(&mut self, requested: Option<u32>) -> Result<bool> {
        let mut bases: Vec<(char, RevisionBase)> = Vec::with_capacity(2);
        let mut errors: Vec<String> = Vec::new();
        for letter in ['A', 'B'] {
            match RevisionBase::read(&base_path(&self.path, letter)) {
                Ok(base) => bases.push((letter, base)),
                Err(e) => errors.push(format!("{e:#}")),
            }
        }
        self.both_bases = bases.len() == 2;
        if bases.is_empty() {
            return Err(Error::Opening(format!(
                "no usable base file for table {}: {}",
                self.path.display(),
                errors.join("; ")
            ))
            .into());
        }

        let chosen = match requested {
            Some(revision) => {
                match bases.iter().position(|(_, b)| b.revision() == revision) {
                    Some(i) => i,
                    None => return Ok(false),
                }
            }
            None => {
                let mut best = 0;
                for (i, (_, base)) in bases.iter().enumerate() {
                    if base.revision() >= bases[best].1.revision() {
                        best = i;
                    }
                }
                best
            }
        };

        self.latest_revision = bases.iter().map(|(_, b)| b.revision()).max().unwrap_or(0);
        let (letter, base) = bases.swap_remove(chosen);
        self.base_letter = letter;
        self.revision = base.revision();
        self.block_size = base.block_size() as usize;
        self.max_item = max_item_size(self.block_size);
        self.root = base.root();
        self.level = base.level() as usize;
        self.item_count = base.item_count();
        self.faked_root = base.have_fakeroot();
        self.sequential = base.sequential();
        self.latest_revision = self.latest_revision.max(self.revision);
        self.base = base;
        Ok(true)
    }

    /// Puts the root block into the cursor: read from disk, or - for a
    /// table with no blocks at all - synthesized as one empty leaf
    /// holding only the null item.
    fn read_root(&mut self) -> Result<()> {
        if self.faked_root {
            let lvl = &mut self.stack[0];
            lvl.p.fill(0);
            let o = self.block_size - item::FAKE_ROOT_ITEM_SIZE;
            item::write_fake_root_item(&mut lvl.p, o);
            block::set_dir_entry(&mut lvl.p, DIR_START, o);
            block::set_dir_end(&mut lvl.p, DIR_START + D2);
            let free = o - (DIR_START + D2);
            block::set_max_free(&mut lvl.p, free);
            block::set_total_free(&mut lvl.p, free);
            block::set_level(&mut lvl.p, 0);
            if self.writable {
                block::set_revision(&mut lvl.p, self.latest_revision + 1);
                lvl.n = self.base.free_map_mut().next_free_block();
            } else {
                block::set_revision(&mut lvl.p, 0);
                lvl.n = 0;
            }
            Ok(())
        } else {
            self.block_to_cursor(self.level, self.root)?;
            if block::revision(&self.stack[self.level].p) > self.revision {
                return Err(self.overwritten_err());
            }
            Ok(())
        }
    }

    fn overwritten_err(&self) -> eyre::Report {
        if self.writable {
            // A writer should never race anyone; a newer block under it
            // means the file is damaged or shared with another writer.
            Error::Corrupt("block overwritten - are there multiple writers?".into()).into()
        } else {
            Error::Modified.into()
        }
    }

    /// Unlinks the previous revision's base on the first block write of
    /// a transaction, so it can't later be opened against a data file
    /// we are about to modify.
    fn drop_spare_base(&mut self) -> Result<()> {
        if self.both_bases {
            // Failure to unlink is ignored: we only wanted it gone.
            let _ = std::fs::remove_file(base_path(&self.path, other_letter(self.base_letter)));
            self.both_bases = false;
            self.latest_revision = self.revision;
        }
        Ok(())
    }

    fn write_stack_block(&mut self, j: usize) -> Result<()> {
        self.drop_spare_base()?;
        let Some(file) = self.file.as_ref() else {
            bail!("table has no data file open");
        };
        let lvl = &self.stack[j];
        debug_assert!(self.dangerous || self.base.free_map().block_free_at_start(lvl.n));
        file.write_block(lvl.n, &lvl.p)?;
        self.stack[j].rewrite = false;
        Ok(())
    }

    /// Loads block `n` into cursor level `j`, first writing back the
    /// block currently there if it is dirty.
    fn block_to_cursor(&mut self, j: usize, n: u32) -> Result<()> {
        if self.stack[j].n == n {
            return Ok(());
        }
        if self.stack[j].rewrite {
            self.write_stack_block(j)?;
        }
        let Some(file) = self.file.as_ref() else {
            bail!("table has no data file open");
        };
        file.read_block(n, &mut self.stack[j].p)?;
        self.stack[j].n = n;
        block::validate(&self.stack[j].p)
            .map_err(|e| Error::Corrupt(format!("block {n}: {e:#}")))?;
        if j < self.level
            && block::revision(&self.stack[j].p) > block::revision(&self.stack[j + 1].p)
        {
            return Err(self.overwritten_err());
        }
        ensure!(
            block::level(&self.stack[j].p) == j,
            Error::Corrupt(format!(
                "block {n} has level {}, expected {j}",
                block::level(&self.stack[j].p)
            ))
        );
        Ok(())
    }

    /// Prepares the cursor's blocks for modification. Walking leaf to
    /// root: a block already marked dirty means all its ancestors are
    /// too; a block that was free at the start of the transaction can
    /// be rewritten in place; anything else moves to a fresh block
    /// number and repoints its parent.
    fn alter(&mut self) -> Result<()> {
        if self.dangerous {
            self.stack[0].rewrite = true;
            return Ok(());
        }
        let mut j = 0;
        loop {
            if self.stack[j].rewrite {
                return Ok(());
            }
            self.stack[j].rewrite = true;
            let n = self.stack[j].n;
            if self.base.free_map().block_free_at_start(n) {
                return Ok(());
            }
            self.base.free_map_mut().free_block(n);
            let fresh = self.base.free_map_mut().next_free_block();
            self.stack[j].n = fresh;
            block::set_revision(&mut self.stack[j].p, self.latest_revision + 1);

            if j == self.level {
                return Ok(());
            }
            j += 1;
            let c = self.stack[j].c as usize;
            item::set_child_block(&mut self.stack[j].p, c, fresh);
        }
    }

    /// Positions the built-in cursor on the last key <= the key in
    /// `kt`; true iff that key is byte-equal.
    fn find(&mut self) -> Result<bool> {
        let key = self.kt.search_key();
        for j in (1..=self.level).rev() {
            let c = find_in_block(&self.stack[j].p, &key, false, self.stack[j].c);
            self.stack[j].c = c;
            let child = Item::at(&self.stack[j].p, c as usize).child_block();
            self.block_to_cursor(j - 1, child)?;
        }
        let c = find_in_block(&self.stack[0].p, &key, true, self.stack[0].c);
        self.stack[0].c = c;
        if c < DIR_START as i32 {
            return Ok(false);
        }
        Ok(Item::at(&self.stack[0].p, c as usize)
            .key()
            .cmp_search(&key)
            == Ordering::Equal)
    }

    /// Adds `new_item` to the block at cursor level `j`, splitting it
    /// (and growing the tree) when there is no room.
    fn add_item(&mut self, new_item: &[u8], j: usize) -> Result<()> {
        let needed = new_item.len() + D2;
        let mut c = self.stack[j].c as usize;
        let n;

        if block::total_free(&self.stack[j].p) < needed {
            // Split. The lower half keeps the pre-split block number and
            // is written out at once; the upper half stays in the cursor
            // under a fresh number and keeps absorbing inserts.
            let m = if self.seq_count < 0 {
                block::mid_point(&self.stack[j].p)
            } else {
                c
            };
            let split_n = self.stack[j].n;
            self.stack[j].n = self.base.free_map_mut().next_free_block();

            let mut split_p = mem::take(&mut self.split_buf);
            let mut scratch = mem::take(&mut self.scratch);
            split_p.copy_from_slice(&self.stack[j].p);
            block::set_dir_end(&mut split_p, m);
            block::compact(&mut split_p, &mut scratch);

            {
                let p = &mut self.stack[j].p;
                let residue = block::dir_end(p) - m;
                p.copy_within(m..m + residue, DIR_START);
                block::set_dir_end(p, DIR_START + residue);
                block::compact(p, &mut scratch);
            }

            let add_to_upper = if self.seq_count < 0 {
                c >= m
            } else {
                // Sequential mode: prefer the lower half if it has room.
                block::total_free(&split_p) < needed
            };

            if add_to_upper {
                c -= m - DIR_START;
                block::add_item_to_block(&mut self.stack[j].p, &mut scratch, new_item, c);
                n = self.stack[j].n;
            } else {
                block::add_item_to_block(&mut split_p, &mut scratch, new_item, c);
                n = split_n;
            }

            self.drop_spare_base()?;
            {
                let Some(file) = self.file.as_ref() else {
                    bail!("table has no data file open");
                };
                file.write_block(split_n, &split_p)?;
            }

            // Separator: between the last key of the lower half and the
            // first key of the upper half. Copied out before the scratch
            // buffers go back.
            let prevkey =
                SearchKey::from_key(Item::at(&split_p, block::dir_end(&split_p) - D2).key());
            let newkey = SearchKey::from_key(Item::at(&self.stack[j].p, DIR_START).key());
            self.split_buf = split_p;
            self.scratch = scratch;

            if j == self.level {
                self.split_root(split_n)?;
            }
            self.enter_key(j + 1, prevkey, newkey)?;
        } else {
            let mut scratch = mem::take(&mut self.scratch);
            block::add_item_to_block(&mut self.stack[j].p, &mut scratch, new_item, c);
            self.scratch = scratch;
            n = self.stack[j].n;
        }

        if j == 0 {
            self.changed_n = n;
            self.changed_c = c as i32;
        }
        Ok(())
    }

    /// Grows the tree by one level: a new root holding a single null
    /// item pointing at the lower half of the just-split old root.
    fn split_root(&mut self, split_n: u32) -> Result<()> {
        self.level += 1;
        ensure!(
            self.level < BTREE_CURSOR_LEVELS,
            Error::Corrupt(format!(
                "tree has grown impossibly deep ({BTREE_CURSOR_LEVELS} levels)"
            ))
        );
        debug!(level = self.level, "splitting root");

        let mut lvl = CursorLevel::new(self.block_size);
        block::init_empty(&mut lvl.p, self.level, self.latest_revision + 1);
        lvl.n = self.base.free_map_mut().next_free_block();
        lvl.c = DIR_START as i32;
        lvl.rewrite = true;
        self.stack.push(lvl);

        let null = item::null_branch_item(split_n);
        self.add_item(&null, self.level)
    }

    /// Enters a separator for the freshly split block at level `j - 1`
    /// into level `j`. At `j == 1` the separator is truncated to one
    /// byte past the first difference from the preceding key; deeper
    /// separators were already truncated at their originating level and
    /// must not be trimmed again.
    fn enter_key(&mut self, j: usize, prevkey: SearchKey, newkey: SearchKey) -> Result<()> {
        debug_assert!(j >= 1);
        let child = self.stack[j - 1].n;
        let newkey_len = newkey.bytes().len();

        let truncate_to = if j == 1 {
            let min_len = newkey_len.min(prevkey.bytes().len());
            let mut i = 0;
            while i < min_len && prevkey.bytes()[i] == newkey.bytes()[i] {
                i += 1;
            }
            // One byte of difference.
            if i < newkey_len {
                i += 1;
            }
            i
        } else {
            newkey_len
        };

        let sep_item = item::branch_item(&newkey.bytes()[..truncate_to], newkey.count(), child);

        if j > 1 {
            // The upper half's first key is now covered by the separator
            // going into the parent; null it out in place to save the
            // key bytes.
            let p = &mut self.stack[j - 1].p;
            let freed = item::nullify_first_key(p);
            let total = block::total_free(p) + freed;
            block::set_total_free(p, total);
        }

        let sep_key = SearchKey::new(&newkey.bytes()[..truncate_to], newkey.count());
        let c = find_in_block(&self.stack[j].p, &sep_key, false, -1) + D2 as i32;
        self.stack[j].c = c;
        self.stack[j].rewrite = true;
        self.add_item(&sep_item, j)
    }

    /// Removes the directory entry at cursor level `j`. With
    /// `repeatedly`, empties propagate: a drained block is freed and
    /// its parent entry removed, and a root left with a single null
    /// item loses a level.
    fn delete_item(&mut self, j: usize, repeatedly: bool) -> Result<()> {
        let c = self.stack[j].c as usize;
        {
            let p = &mut self.stack[j].p;
            let item_len = Item::at(p, c).size();
            let dir_end = block::dir_end(p) - D2;
            p.copy_within(c + D2..dir_end + D2, c);
            block::set_dir_end(p, dir_end);
            let max = block::max_free(p) + D2;
            block::set_max_free(p, max);
            let total = block::total_free(p) + item_len + D2;
            block::set_total_free(p, total);
        }

        if !repeatedly {
            return Ok(());
        }

        if j < self.level {
            if block::dir_end(&self.stack[j].p) == DIR_START {
                let n = self.stack[j].n;
                self.base.free_map_mut().free_block(n);
                self.stack[j].rewrite = false;
                self.stack[j].n = BLK_UNUSED;
                self.stack[j + 1].rewrite = true;
                return self.delete_item(j + 1, true);
            }
        } else {
            while block::dir_end(&self.stack[self.level].p) == DIR_START + D2 && self.level > 0 {
                // A root holding a single (null) item: drop a level.
                let new_root = Item::at(&self.stack[self.level].p, DIR_START).child_block();
                let n = self.stack[self.level].n;
                self.base.free_map_mut().free_block(n);
                self.stack.pop();
                self.level -= 1;
                self.block_to_cursor(self.level, new_root)?;
            }
        }
        Ok(())
    }

    /// Inserts or replaces the item held in `kt`, whose key the cursor
    /// has just been positioned on (`found` is the result of `find`).
    /// Returns the chunk count of any replaced item.
    fn add_kt(&mut self, found: bool) -> Result<u16> {
        self.alter()?;

        if found {
            self.seq_count = SEQ_START_POINT;
            self.sequential = false;

            let c = self.stack[0].c as usize;
            let kt_size = self.kt.size();
            let (components, old_size) = {
                let existing = Item::at(&self.stack[0].p, c);
                (existing.components(), existing.size())
            };

            if kt_size <= old_size {
                // Overwrite in place; the shrinkage joins the block's
                // fragmented free space.
                let off = block::dir_entry(&self.stack[0].p, c);
                self.stack[0].p[off..off + kt_size].copy_from_slice(self.kt.bytes());
                let total = block::total_free(&self.stack[0].p) + (old_size - kt_size);
                block::set_total_free(&mut self.stack[0].p, total);
            } else if block::max_free(&self.stack[0].p) >= kt_size {
                // Place in the gap and repoint the directory entry.
                let p = &mut self.stack[0].p;
                let new_max = block::max_free(p) - kt_size;
                let o = block::dir_end(p) + new_max;
                p[o..o + kt_size].copy_from_slice(self.kt.bytes());
                block::set_dir_entry(p, c, o);
                block::set_max_free(p, new_max);
                let total = block::total_free(p) - (kt_size - old_size);
                block::set_total_free(p, total);
            } else {
                // The long way round.
                self.delete_item(0, false)?;
                let kt = mem::take(&mut self.kt);
                let result = self.add_item(kt.bytes(), 0);
                self.kt = kt;
                result?;
            }
            Ok(components)
        } else {
            if self.changed_n == self.stack[0].n && self.changed_c == self.stack[0].c {
                if self.seq_count < 0 {
                    self.seq_count += 1;
                }
            } else {
                self.seq_count = SEQ_START_POINT;
                self.sequential = false;
            }
            self.stack[0].c += D2 as i32;
            let kt = mem::take(&mut self.kt);
            let result = self.add_item(kt.bytes(), 0);
            self.kt = kt;
            result?;
            Ok(0)
        }
    }

    /// Deletes the item whose key is held in `kt`, if present,
    /// returning its chunk count (0 when absent).
    fn delete_kt(&mut self) -> Result<u16> {
        let found = self.find()?;
        self.seq_count = SEQ_START_POINT;
        self.sequential = false;
        if !found {
            return Ok(0);
        }
        let components = Item::at(&self.stack[0].p, self.stack[0].c as usize).components();
        self.alter()?;
        self.delete_item(0, true)?;
        Ok(components)
    }

    /// Inserts `tag` under `key`, replacing any existing value. Long
    /// values are split into chunks, each stored as its own item; a
    /// replacement with fewer chunks deletes the survivors' trailing
    /// siblings. With `already_compressed` the bytes are stored flagged
    /// as deflated without touching them.
    pub fn add(&mut self, key: &[u8], tag: &[u8], already_compressed: bool) -> Result<()> {
        ensure!(
            self.writable,
            Error::Database("table opened read-only".into())
        );
        ensure!(!key.is_empty(), Error::Database("empty key".into()));
        ensure!(
            key.len() <= MAX_KEY_LEN,
            Error::Database(format!(
                "key of {} bytes exceeds the {MAX_KEY_LEN} byte limit",
                key.len()
            ))
        );

        if self.file.is_none() {
            ensure!(
                self.lazy,
                Error::Database("table is closed".into())
            );
            self.create_and_open()?;
        }

        self.kt.form_key(key);

        let mut compressed = already_compressed;
        let mut owned_tag: Option<Vec<u8>> = None;
        if !compressed && self.compress_strategy.compresses() && tag.len() > COMPRESS_MIN {
            if let Some(deflated) = self.compressor.deflate(tag)? {
                owned_tag = Some(deflated);
                compressed = true;
            }
        }
        let tag: &[u8] = owned_tag.as_deref().unwrap_or(tag);

        // Chunk geometry: cd bytes of item overhead leave l_max bytes of
        // tag data per block-sized item.
        let cd = item::leaf_tag_offset(key.len());
        let l_max = self.max_item - cd;
        let mut first_l = l_max;

        let mut found = self.find()?;
        if !found {
            // Space packing: if the leaf's free space would otherwise be
            // wasted, let the first chunk be an odd size to use it. When
            // that space covers the value's final partial chunk this
            // saves a block outright, so it's worthwhile even without
            // full compaction.
            let mut n = block::total_free(&self.stack[0].p) % (self.max_item + D2);
            if n > D2 + cd {
                n -= D2 + cd;
                let last = tag.len() % l_max;
                if n >= last || (self.full_compaction && n >= key.len() + 34) {
                    first_l = n;
                }
            }
        }

        let m = if tag.is_empty() {
            1
        } else {
            (tag.len() + l_max - 1 - first_l) / l_max + 1
        };
        ensure!(
            m < 1 << 16,
            Error::Unimplemented(format!("value needs {m} chunks"))
        );

        self.kt.set_components(m as u16);

        let mut o = 0usize;
        let mut residue = tag.len();
        let mut replaced: u16 = 0;
        let mut replacement = false;

        for i in 1..=m {
            let l = if i == m {
                residue
            } else if i == 1 {
                first_l
            } else {
                l_max
            };
            self.kt.set_tag(cd, &tag[o..o + l], compressed);
            self.kt.set_component(i as u16);
            o += l;
            residue -= l;

            if i > 1 {
                found = self.find()?;
            }
            replaced = self.add_kt(found)?;
            if replaced > 0 {
                replacement = true;
            }
        }

        for i in (m as u32 + 1)..=(replaced as u32) {
            self.kt.set_component(i as u16);
            self.delete_kt()?;
        }

        if !replacement {
            self.item_count += 1;
        }
        self.note_modification();
        Ok(())
    }

    /// Removes `key`; true iff it was present.
    pub fn del(&mut self, key: &[u8]) -> Result<bool> {
        ensure!(
            self.writable,
            Error::Database("table opened read-only".into())
        );
        if self.file.is_none() {
            return Ok(false);
        }
        // A key we couldn't have stored can't be present.
        if key.is_empty() || key.len() > MAX_KEY_LEN {
            return Ok(false);
        }

        self.kt.form_key(key);
        let components = self.delete_kt()?;
        if components == 0 {
            return Ok(false);
        }
        for i in 2..=components {
            self.kt.set_component(i);
            self.delete_kt()?;
        }

        self.item_count -= 1;
        self.note_modification();
        Ok(true)
    }

    /// Fetches the value stored under `key`, reassembled from its
    /// chunks and decompressed.
    pub fn get_exact_entry(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        if self.file.is_none() {
            return Ok(None);
        }
        if key.is_empty() || key.len() > MAX_KEY_LEN {
            return Ok(None);
        }

        self.kt.form_key(key);
        if !self.find()? {
            return Ok(None);
        }
        Ok(Some(self.read_tag()?))
    }

    /// Whether `key` is present, without reading its value.
    pub fn key_exists(&mut self, key: &[u8]) -> Result<bool> {
        if self.file.is_none() || key.is_empty() || key.len() > MAX_KEY_LEN {
            return Ok(false);
        }
        self.kt.form_key(key);
        self.find()
    }

    /// Reassembles the tag whose first chunk the built-in cursor is on.
    fn read_tag(&mut self) -> Result<Vec<u8>> {
        let (components, compressed, mut tag) = {
            let first = Item::at(&self.stack[0].p, self.stack[0].c as usize);
            let components = first.components();
            let mut tag = Vec::with_capacity(if components > 1 {
                (self.max_item - item::leaf_tag_offset(1)) * components as usize
            } else {
                first.tag().len()
            });
            tag.extend_from_slice(first.tag());
            (components, first.compressed(), tag)
        };

        for _ in 2..=components {
            if !self.next_in_stack(0)? {
                bail!(Error::Corrupt(
                    "unexpected end of table when reading continuation of tag".into()
                ));
            }
            let chunk = Item::at(&self.stack[0].p, self.stack[0].c as usize);
            tag.extend_from_slice(chunk.tag());
        }

        if compressed {
            self.compressor.inflate(&tag)
        } else {
            Ok(tag)
        }
    }

    /// Advances the built-in cursor one item at level `j`, walking up
    /// and back down over block boundaries.
    fn next_in_stack(&mut self, j: usize) -> Result<bool> {
        let mut c = self.stack[j].c + D2 as i32;
        if c as usize >= block::dir_end(&self.stack[j].p) {
            if j == self.level {
                return Ok(false);
            }
            if !self.next_in_stack(j + 1)? {
                return Ok(false);
            }
            c = DIR_START as i32;
        }
        self.stack[j].c = c;
        if j > 0 {
            let child = Item::at(&self.stack[j].p, c as usize).child_block();
            self.block_to_cursor(j - 1, child)?;
        }
        Ok(true)
    }

    fn note_modification(&mut self) {
        self.modified = true;
        if self.cursor_since_modify.get() {
            self.cursor_since_modify.set(false);
            self.cursor_version += 1;
        }
    }

    /// A read-only iterator over the table at its current state (for a
    /// writer, including uncommitted changes).
    pub fn cursor(&self) -> Cursor<'_> {
        Cursor::new(self)
    }

    /// Writes every dirty cursor block out to the data file.
    fn flush(&mut self) -> Result<()> {
        for j in (0..=self.level).rev() {
            if self.stack[j].rewrite {
                self.write_stack_block(j)?;
            }
        }
        if self.modified {
            self.faked_root = false;
        }
        Ok(())
    }

    /// Commits the transaction as `revision`, which must be greater
    /// than the current revision. On return the new revision is fully
    /// durable. Internal failures close the table and propagate.
    pub fn commit(&mut self, revision: u32) -> Result<()> {
        ensure!(
            self.writable,
            Error::Database("table opened read-only".into())
        );
        ensure!(
            revision > self.revision,
            Error::Database(format!(
                "commit revision {revision} is not later than the current revision {}",
                self.revision
            ))
        );

        if self.file.is_none() {
            // Lazy table never written: nothing on disk to update.
            self.revision = revision;
            self.latest_revision = revision;
            return Ok(());
        }

        let result = self.commit_inner(revision);
        if result.is_err() {
            self.file = None;
        }
        result
    }

    fn commit_inner(&mut self, revision: u32) -> Result<()> {
        self.flush()?;

        if self.faked_root {
            // No blocks were ever written; commit an empty claim.
            self.base.free_map_mut().clear();
        }
        self.base.free_map_mut().calculate_last_block();
        self.base.set_revision(revision);
        self.base.set_root(self.stack[self.level].n);
        self.base.set_level(self.level as u32);
        self.base.set_item_count(self.item_count);
        self.base.set_have_fakeroot(self.faked_root);
        self.base.set_sequential(self.sequential);

        self.base_letter = other_letter(self.base_letter);
        self.both_bases = true;
        self.revision = revision;
        self.latest_revision = revision;
        self.root = self.stack[self.level].n;
        self.modified = false;

        for lvl in self.stack.iter_mut() {
            lvl.n = BLK_UNUSED;
            lvl.c = -1;
            lvl.rewrite = false;
        }

        // As late as possible, to give queued writes the longest time to
        // drain before we wait on them.
        {
            let Some(file) = self.file.as_ref() else {
                bail!("table has no data file open");
            };
            file.sync().map_err(|e| {
                Error::Database(format!("can't commit new revision - fsync failed: {e}"))
            })?;
        }

        // Stage the base under the tmp name, then rename, so a reader
        // can never observe a partially written base.
        let tmp = tmp_path(&self.path);
        let basefile = base_path(&self.path, self.base_letter);
        self.base.write_to_file(&tmp)?;
        if let Err(rename_err) = std::fs::rename(&tmp, &basefile) {
            // If the source is gone the rename may actually have
            // happened (an NFS quirk); only then is this survivable.
            match std::fs::remove_file(&tmp) {
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                _ => {
                    return Err(Error::Database(format!(
                        "couldn't update base file {}: {rename_err}",
                        basefile.display()
                    ))
                    .into());
                }
            }
        }
        self.base.commit();

        self.read_root()?;
        self.changed_n = 0;
        self.changed_c = DIR_START as i32;
        self.seq_count = SEQ_START_POINT;
        debug!(revision, base = %self.base_letter, "committed");
        Ok(())
    }

    /// Discards all uncommitted changes by rereading the current base.
    pub fn cancel(&mut self) -> Result<()> {
        ensure!(
            self.writable,
            Error::Database("table opened read-only".into())
        );
        if self.file.is_none() {
            self.latest_revision = self.revision;
            return Ok(());
        }

        let base = RevisionBase::read(&base_path(&self.path, self.base_letter))
            .map_err(|e| Error::Corrupt(format!("couldn't reread base {}: {e:#}", self.base_letter)))?;

        self.revision = base.revision();
        self.block_size = base.block_size() as usize;
        self.root = base.root();
        self.level = base.level() as usize;
        self.item_count = base.item_count();
        self.faked_root = base.have_fakeroot();
        self.sequential = base.sequential();
        self.base = base;
        self.latest_revision = self.revision;
        self.modified = false;

        self.stack = (0..=self.level)
            .map(|_| CursorLevel::new(self.block_size))
            .collect();
        self.read_root()?;

        self.changed_n = 0;
        self.changed_c = DIR_START as i32;
        self.seq_count = SEQ_START_POINT;
        debug!(revision = self.revision, "cancelled transaction");
        Ok(())
    }

    /// Emits this transaction's delta for replication:
    /// `2, len(name), name, block_size, (block_no + 1, block bytes)...,
    /// 0`, integers packed. Call after the last modification and before
    /// [`Self::commit`], which freezes the delta.
    pub fn write_changed_blocks(&mut self, sink: &mut dyn Write) -> Result<()> {
        if self.file.is_none() || self.faked_root {
            return Ok(());
        }
        self.flush()?;

        let mut head = Vec::new();
        pack_uint(2, &mut head);
        pack_uint(self.name.len() as u64, &mut head);
        head.extend_from_slice(self.name.as_bytes());
        pack_uint(self.block_size as u64, &mut head);
        sink.write_all(&head).map_err(Error::Io)?;

        self.base.free_map_mut().calculate_last_block();
        let mut buf = vec![0u8; self.block_size];
        let mut n = 0u32;
        while self.base.free_map().find_changed_block(&mut n) {
            let Some(file) = self.file.as_ref() else {
                bail!("table has no data file open");
            };
            file.read_block(n, &mut buf)?;
            let mut entry = Vec::with_capacity(8);
            pack_uint(n as u64 + 1, &mut entry);
            sink.write_all(&entry).map_err(Error::Io)?;
            sink.write_all(&buf).map_err(Error::Io)?;
            n += 1;
        }

        let mut tail = Vec::new();
        pack_uint(0, &mut tail);
        sink.write_all(&tail).map_err(Error::Io)?;
        Ok(())
    }

    /// Fill blocks as full as possible, trading CPU per insert for
    /// space. Also flips splitting into sequential mode at once.
    pub fn set_full_compaction(&mut self, on: bool) {
        if on {
            self.seq_count = 0;
        }
        self.full_compaction = on;
    }

    pub fn revision(&self) -> u32 {
        self.revision
    }

    /// Highest revision present across both base files; the next commit
    /// must exceed it.
    pub fn latest_revision(&self) -> u32 {
        self.latest_revision
    }

    pub fn entry_count(&self) -> u32 {
        self.item_count
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn is_modified(&self) -> bool {
        self.modified
    }

    pub fn is_sequential(&self) -> bool {
        self.sequential
    }

    // ---- support for external cursors ----

    pub(crate) fn tree_level(&self) -> usize {
        self.level
    }

    pub(crate) fn builtin_root(&self) -> (&[u8], u32) {
        (&self.stack[self.level].p, self.stack[self.level].n)
    }

    pub(crate) fn cursor_version_snapshot(&self) -> u64 {
        self.cursor_version
    }

    pub(crate) fn mark_cursor_created(&self) {
        self.cursor_since_modify.set(true);
    }

    pub(crate) fn is_writable(&self) -> bool {
        self.writable
    }

    pub(crate) fn last_block(&self) -> u32 {
        self.base.free_map().last_block()
    }

    pub(crate) fn reader_overwritten_err(&self) -> eyre::Report {
        self.overwritten_err()
    }

    /// Loads block `n` into an external cursor's level `j`, preferring
    /// the writer's in-memory (possibly dirty) copy of that block.
    pub(crate) fn load_block_for_reader(
        &self,
        lvl: &mut CursorLevel,
        j: usize,
        n: u32,
        parent_revision: u32,
    ) -> Result<()> {
        if lvl.n == n {
            return Ok(());
        }
        if self.writable && j < self.stack.len() && n == self.stack[j].n {
            lvl.p.copy_from_slice(&self.stack[j].p);
        } else {
            let Some(file) = self.file.as_ref() else {
                bail!("table has no data file open");
            };
            file.read_block(n, &mut lvl.p)?;
        }
        lvl.n = n;
        block::validate(&lvl.p).map_err(|e| Error::Corrupt(format!("block {n}: {e:#}")))?;
        if block::revision(&lvl.p) > parent_revision {
            return Err(self.overwritten_err());
        }
        ensure!(
            block::level(&lvl.p) == j,
            Error::Corrupt(format!(
                "block {n} has level {}, expected {j}",
                block::level(&lvl.p)
            ))
        );
        Ok(())
    }

    /// Reads block `n` for a sequential-walk cursor. Returns false when
    /// the block lives (possibly modified) in the writer's cursor stack
    /// at a branch level, so its on-disk form can't be trusted.
    pub(crate) fn read_block_for_sequential(&self, n: u32, buf: &mut [u8]) -> Result<bool> {
        if self.writable {
            if n == self.stack[0].n {
                buf.copy_from_slice(&self.stack[0].p);
                return Ok(true);
            }
            for j in 1..=self.level {
                if n == self.stack[j].n {
                    return Ok(false);
                }
            }
        }
        let Some(file) = self.file.as_ref() else {
            bail!("table has no data file open");
        };
        file.read_block(n, buf)?;
        Ok(true)
    }
}

/// Binary search of a block directory for the last key <= `key`,
/// returning its directory offset (for a leaf, `DIR_START - D2` when
/// every key is greater). A cursor hint `c` from a previous search
/// narrows the range first, making in-order runs O(1) per level.
pub(crate) fn find_in_block(p: &[u8], key: &SearchKey, leaf: bool, hint: i32) -> i32 {
    let d2 = D2 as i32;
    let mut i = DIR_START as i32 - if leaf { d2 } else { 0 };
    let mut j = block::dir_end(p) as i32;

    let mut c = hint;
    if c != -1 {
        if c < j && i < c && Item::at(p, c as usize).key().cmp_search(key) != Ordering::Greater {
            i = c;
        }
        c += d2;
        if c < j && i < c && Item::at(p, c as usize).key().cmp_search(key) == Ordering::Greater {
            j = c;
        }
    }

    while j - i > d2 {
        let k = i + ((j - i) / (2 * d2)) * d2;
        if Item::at(p, k as usize).key().cmp_search(key) == Ordering::Greater {
            j = k;
        } else {
            i = k;
        }
    }
    i
}

/// The table's name in changes-stream entries: the final path component
/// with any trailing dot separator trimmed.
fn table_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().trim_end_matches('.').to_string())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btree::item::branch_item;

    #[test]
    fn table_name_trims_the_stem_separator() {
        assert_eq!(table_name(Path::new("/db/postlist.")), "postlist");
        assert_eq!(table_name(Path::new("record")), "record");
    }

    fn block_of(keys: &[&[u8]]) -> Vec<u8> {
        let mut p = vec![0u8; 2048];
        block::init_empty(&mut p, 1, 1);
        let mut scratch = vec![0u8; 2048];
        let mut c = DIR_START;
        for key in keys {
            let item = branch_item(key, 1, 0);
            block::add_item_to_block(&mut p, &mut scratch, &item, c);
            c += D2;
        }
        p
    }

    fn search(key: &[u8]) -> SearchKey {
        SearchKey::new(key, 1)
    }

    #[test]
    fn find_in_block_returns_last_at_most_position() {
        let p = block_of(&[b"", b"dd", b"hh", b"pp"]);

        assert_eq!(find_in_block(&p, &search(b"a"), false, -1), DIR_START as i32);
        assert_eq!(
            find_in_block(&p, &search(b"dd"), false, -1),
            DIR_START as i32 + 2
        );
        assert_eq!(
            find_in_block(&p, &search(b"ee"), false, -1),
            DIR_START as i32 + 2
        );
        assert_eq!(
            find_in_block(&p, &search(b"zz"), false, -1),
            DIR_START as i32 + 6
        );
    }

    #[test]
    fn find_in_block_leaf_reports_the_null_position() {
        let mut p = vec![0u8; 2048];
        block::init_empty(&mut p, 0, 1);
        let mut scratch = vec![0u8; 2048];
        let mut c = DIR_START;
        for key in [b"mm".as_slice(), b"tt".as_slice()] {
            let item = branch_item(key, 1, 0);
            block::add_item_to_block(&mut p, &mut scratch, &item, c);
            c += D2;
        }

        assert_eq!(
            find_in_block(&p, &search(b"aa"), true, -1),
            DIR_START as i32 - D2 as i32
        );
        assert_eq!(find_in_block(&p, &search(b"mm"), true, -1), DIR_START as i32);
    }

    #[test]
    fn find_in_block_hints_do_not_change_the_answer() {
        let keys: Vec<Vec<u8>> = (0..40u8).map(|i| vec![b'a' + i / 8, b'a' + i % 8]).collect();
        let refs: Vec<&[u8]> = keys.iter().map(|k| k.as_slice()).collect();
        let p = block_of(&refs);

        let probes: Vec<Vec<u8>> = vec![b"ab".to_vec(), b"ba".to_vec(), b"ez".to_vec()];
        for probe in &probes {
            let expected = find_in_block(&p, &search(probe), false, -1);
            let mut hint = DIR_START as i32;
            while hint < block::dir_end(&p) as i32 {
                assert_eq!(find_in_block(&p, &search(probe), false, hint), expected);
                hint += D2 as i32;
            }
        }
    }
}

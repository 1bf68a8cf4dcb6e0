//! # Table Options
//!
//! Open-time configuration. Options are plain data with chainable
//! setters; nothing here touches the filesystem.

use crate::compress::CompressStrategy;
use crate::storage::{DEFAULT_BLOCK_SIZE, MAX_BLOCK_SIZE, MIN_BLOCK_SIZE};

#[derive(Debug, Clone)]
pub struct TableOptions {
    /// Block size for newly created tables. Must be a power of two in
    /// `2048..=65536`; anything else snaps to the 8192 default. Ignored
    /// when opening an existing table (the base file governs).
    pub block_size: usize,
    /// Whether (and how) to deflate tags before chunking.
    pub compress_strategy: CompressStrategy,
    /// Treat a missing data file as an empty table instead of an open
    /// error; a lazy writer creates its files on the first `add`.
    pub lazy: bool,
    /// Try harder to fill each block completely, at some CPU cost per
    /// insert.
    pub full_compaction: bool,
    /// Open without write access.
    pub readonly: bool,
    /// Write modified blocks in place instead of copy-on-write. This
    /// forfeits crash safety and concurrent readability; a crash mid
    /// transaction can corrupt the table. Off by default.
    pub dangerous: bool,
}

impl TableOptions {
    pub fn new() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            compress_strategy: CompressStrategy::None,
            lazy: false,
            full_compaction: false,
            readonly: false,
            dangerous: false,
        }
    }

    pub fn block_size(mut self, block_size: usize) -> Self {
        self.block_size = snap_block_size(block_size);
        self
    }

    pub fn compress_strategy(mut self, strategy: CompressStrategy) -> Self {
        self.compress_strategy = strategy;
        self
    }

    pub fn lazy(mut self, lazy: bool) -> Self {
        self.lazy = lazy;
        self
    }

    pub fn full_compaction(mut self, on: bool) -> Self {
        self.full_compaction = on;
        self
    }

    pub fn readonly(mut self, readonly: bool) -> Self {
        self.readonly = readonly;
        self
    }

    pub fn dangerous(mut self, dangerous: bool) -> Self {
        self.dangerous = dangerous;
        self
    }
}

impl Default for TableOptions {
    fn default() -> Self {
        Self::new()
    }
}

/// Out-of-range or non-power-of-two sizes snap to the default rather
/// than erroring, matching the format this crate replaces.
pub(crate) fn snap_block_size(block_size: usize) -> usize {
    if !(MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&block_size)
        || !block_size.is_power_of_two()
    {
        DEFAULT_BLOCK_SIZE
    } else {
        block_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_block_sizes_are_kept() {
        assert_eq!(TableOptions::new().block_size(2048).block_size, 2048);
        assert_eq!(TableOptions::new().block_size(65536).block_size, 65536);
        assert_eq!(TableOptions::new().block_size(16384).block_size, 16384);
    }

    #[test]
    fn invalid_block_sizes_snap_to_default() {
        assert_eq!(TableOptions::new().block_size(0).block_size, 8192);
        assert_eq!(TableOptions::new().block_size(1024).block_size, 8192);
        assert_eq!(TableOptions::new().block_size(3000).block_size, 8192);
        assert_eq!(TableOptions::new().block_size(131072).block_size, 8192);
    }

    #[test]
    fn defaults_are_safe() {
        let opts = TableOptions::default();
        assert!(!opts.dangerous);
        assert!(!opts.readonly);
        assert!(!opts.lazy);
        assert_eq!(opts.block_size, 8192);
    }
}

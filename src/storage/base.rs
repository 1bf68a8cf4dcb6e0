//! # Base Files
//!
//! A base file is the small sidecar that makes a revision durable: it
//! records where the tree's root lives, how deep the tree is, how many
//! entries it holds, and which blocks of the data file the revision
//! owns. Two base files alternate under the suffixes `A` and `B`; each
//! commit writes whichever letter the previous commit did not, so a
//! crash at any instant leaves at least one complete base on disk.
//!
//! ## On-disk layout
//!
//! ```text
//! +----------------------------+
//! | magic        [u8; 16]      |
//! | version      u32 LE        |
//! | payload_len  u32 LE        |
//! | crc32        u32 LE        |  CRC-32 (iSCSI) over the payload
//! +----------------------------+
//! | payload: packed uints      |
//! |   block_size               |
//! |   revision                 |
//! |   root block               |
//! |   level                    |
//! |   item count               |
//! |   have_fakeroot (0/1)      |
//! |   sequential    (0/1)      |
//! |   bitmap length            |
//! |   bitmap bytes ...         |
//! |   last block               |
//! +----------------------------+
//! ```
//!
//! The checksum turns torn or damaged bases into clean read failures;
//! the opener then falls back to the other letter.

use std::path::Path;

use crc::{Crc, CRC_32_ISCSI};
use eyre::{ensure, Result, WrapErr};
use zerocopy::little_endian::U32;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::encoding::{pack_uint, unpack_uint};

use super::FreeMap;

pub const BASE_MAGIC: &[u8; 16] = b"strata base\x00\x00\x00\x00\x00";
pub const BASE_VERSION: u32 = 1;

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);
const HEADER_SIZE: usize = 28;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
struct BaseHeader {
    magic: [u8; 16],
    version: U32,
    payload_len: U32,
    crc32: U32,
}

const _: () = assert!(std::mem::size_of::<BaseHeader>() == HEADER_SIZE);

/// In-memory image of one base file.
#[derive(Debug, Clone)]
pub struct RevisionBase {
    revision: u32,
    block_size: u32,
    root: u32,
    level: u32,
    item_count: u32,
    have_fakeroot: bool,
    sequential: bool,
    free_map: FreeMap,
}

impl RevisionBase {
    /// A base for a freshly created table: no blocks, a faked root, and
    /// sequential mode on.
    pub fn new(block_size: u32) -> Self {
        Self {
            revision: 0,
            block_size,
            root: 0,
            level: 0,
            item_count: 0,
            have_fakeroot: true,
            sequential: true,
            free_map: FreeMap::new(),
        }
    }

    pub fn read(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)
            .wrap_err_with(|| format!("couldn't read base file {}", path.display()))?;
        Self::decode(&bytes).wrap_err_with(|| format!("bad base file {}", path.display()))
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        ensure!(bytes.len() >= HEADER_SIZE, "base file too short");
        let header = BaseHeader::ref_from_bytes(&bytes[..HEADER_SIZE])
            .map_err(|e| eyre::eyre!("failed to parse base header: {:?}", e))?;
        ensure!(&header.magic == BASE_MAGIC, "invalid magic bytes");
        ensure!(
            header.version.get() == BASE_VERSION,
            "unsupported base version: {} (expected {})",
            header.version.get(),
            BASE_VERSION
        );

        let payload_len = header.payload_len.get() as usize;
        ensure!(
            bytes.len() >= HEADER_SIZE + payload_len,
            "base file truncated: payload {} of {} bytes present",
            bytes.len() - HEADER_SIZE,
            payload_len
        );
        let payload = &bytes[HEADER_SIZE..HEADER_SIZE + payload_len];
        ensure!(
            CRC32.checksum(payload) == header.crc32.get(),
            "base file checksum mismatch"
        );

        let mut pos = 0usize;
        let mut next = || -> Result<u64> {
            let (v, n) = unpack_uint(&payload[pos..])?;
            pos += n;
            Ok(v)
        };

        let block_size = next()? as u32;
        let revision = next()? as u32;
        let root = next()? as u32;
        let level = next()? as u32;
        let item_count = next()? as u32;
        let have_fakeroot = next()? != 0;
        let sequential = next()? != 0;
        let bitmap_len = next()? as usize;

        ensure!(
            payload.len() >= pos + bitmap_len,
            "base file bitmap truncated"
        );
        let bitmap = &payload[pos..pos + bitmap_len];
        let (last_block, _) = unpack_uint(&payload[pos + bitmap_len..])?;

        Ok(Self {
            revision,
            block_size,
            root,
            level,
            item_count,
            have_fakeroot,
            sequential,
            free_map: FreeMap::from_bytes(bitmap, last_block as u32),
        })
    }

    fn encode(&self) -> Vec<u8> {
        let bitmap = self.free_map.bytes();
        let mut payload = Vec::with_capacity(bitmap.len() + 64);
        pack_uint(self.block_size as u64, &mut payload);
        pack_uint(self.revision as u64, &mut payload);
        pack_uint(self.root as u64, &mut payload);
        pack_uint(self.level as u64, &mut payload);
        pack_uint(self.item_count as u64, &mut payload);
        pack_uint(self.have_fakeroot as u64, &mut payload);
        pack_uint(self.sequential as u64, &mut payload);
        pack_uint(bitmap.len() as u64, &mut payload);
        payload.extend_from_slice(bitmap);
        pack_uint(self.free_map.last_block() as u64, &mut payload);

        let header = BaseHeader {
            magic: *BASE_MAGIC,
            version: U32::new(BASE_VERSION),
            payload_len: U32::new(payload.len() as u32),
            crc32: U32::new(CRC32.checksum(&payload)),
        };

        let mut out = Vec::with_capacity(HEADER_SIZE + payload.len());
        out.extend_from_slice(header.as_bytes());
        out.extend_from_slice(&payload);
        out
    }

    /// Writes and fsyncs the base under `path`; the caller renames it
    /// into place.
    pub fn write_to_file(&self, path: &Path) -> Result<()> {
        let bytes = self.encode();
        let mut file = std::fs::File::create(path)
            .wrap_err_with(|| format!("couldn't create base file {}", path.display()))?;
        std::io::Write::write_all(&mut file, &bytes)
            .wrap_err_with(|| format!("couldn't write base file {}", path.display()))?;
        file.sync_all()
            .wrap_err_with(|| format!("couldn't sync base file {}", path.display()))?;
        Ok(())
    }

    pub fn revision(&self) -> u32 {
        self.revision
    }

    pub fn set_revision(&mut self, revision: u32) {
        self.revision = revision;
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    pub fn root(&self) -> u32 {
        self.root
    }

    pub fn set_root(&mut self, root: u32) {
        self.root = root;
    }

    pub fn level(&self) -> u32 {
        self.level
    }

    pub fn set_level(&mut self, level: u32) {
        self.level = level;
    }

    pub fn item_count(&self) -> u32 {
        self.item_count
    }

    pub fn set_item_count(&mut self, count: u32) {
        self.item_count = count;
    }

    pub fn have_fakeroot(&self) -> bool {
        self.have_fakeroot
    }

    pub fn set_have_fakeroot(&mut self, value: bool) {
        self.have_fakeroot = value;
    }

    pub fn sequential(&self) -> bool {
        self.sequential
    }

    pub fn set_sequential(&mut self, value: bool) {
        self.sequential = value;
    }

    pub fn free_map(&self) -> &FreeMap {
        &self.free_map
    }

    pub fn free_map_mut(&mut self) -> &mut FreeMap {
        &mut self.free_map
    }

    /// Freezes the bitmap after a successful commit.
    pub fn commit(&mut self) {
        self.free_map.commit();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> RevisionBase {
        let mut base = RevisionBase::new(8192);
        base.set_revision(7);
        base.set_root(42);
        base.set_level(2);
        base.set_item_count(100_000);
        base.set_have_fakeroot(false);
        base.set_sequential(false);
        for _ in 0..50 {
            base.free_map_mut().next_free_block();
        }
        base
    }

    #[test]
    fn encode_decode_round_trip() {
        let base = sample();
        let restored = RevisionBase::decode(&base.encode()).unwrap();

        assert_eq!(restored.revision(), 7);
        assert_eq!(restored.block_size(), 8192);
        assert_eq!(restored.root(), 42);
        assert_eq!(restored.level(), 2);
        assert_eq!(restored.item_count(), 100_000);
        assert!(!restored.have_fakeroot());
        assert!(!restored.sequential());
        assert_eq!(restored.free_map().bytes(), base.free_map().bytes());
        assert_eq!(restored.free_map().last_block(), 49);
    }

    #[test]
    fn file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("baseA");
        let base = sample();
        base.write_to_file(&path).unwrap();

        let restored = RevisionBase::read(&path).unwrap();
        assert_eq!(restored.revision(), base.revision());
        assert_eq!(restored.root(), base.root());
    }

    #[test]
    fn corrupt_payload_fails_the_checksum() {
        let base = sample();
        let mut bytes = base.encode();
        let last = bytes.len() - 5;
        bytes[last] ^= 0xFF;

        let err = RevisionBase::decode(&bytes).unwrap_err();
        assert!(err.to_string().contains("checksum"));
    }

    #[test]
    fn truncated_file_is_rejected() {
        let base = sample();
        let bytes = base.encode();

        assert!(RevisionBase::decode(&bytes[..10]).is_err());
        assert!(RevisionBase::decode(&bytes[..bytes.len() - 3]).is_err());
    }

    #[test]
    fn wrong_magic_is_rejected() {
        let base = sample();
        let mut bytes = base.encode();
        bytes[0] = b'X';

        let err = RevisionBase::decode(&bytes).unwrap_err();
        assert!(err.to_string().contains("magic"));
    }

    #[test]
    fn missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(RevisionBase::read(&dir.path().join("baseA")).is_err());
    }

    #[test]
    fn new_base_describes_an_empty_table() {
        let base = RevisionBase::new(2048);
        assert_eq!(base.revision(), 0);
        assert!(base.have_fakeroot());
        assert!(base.sequential());
        assert_eq!(base.item_count(), 0);
    }
}

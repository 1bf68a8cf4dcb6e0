//! # Tag Compression
//!
//! Optional per-value compression for tag chunks. Values are deflated as
//! raw streams (no zlib header, 32K window) before being chunked, and
//! inflated after reassembly. A value is only stored compressed when the
//! deflated form is strictly smaller than the original; incompressible
//! data is kept verbatim and never round-trips through zlib on read.
//!
//! ## Strategy
//!
//! [`CompressStrategy::None`] disables compression entirely. The other
//! strategies all enable it; they exist to mirror the zlib strategy
//! hints of the on-disk format this crate replaces, but the encoder
//! backing `flate2` exposes only the default heuristics, so they are
//! currently equivalent to [`CompressStrategy::Default`].
//!
//! ## Stream reuse
//!
//! Deflate and inflate state is allocated lazily on first use and reset
//! (not freed) between operations, so a table or cursor that never
//! touches a compressed tag pays nothing.
//!
//! ## Truncated streams
//!
//! Some historical writers dropped the four trailing checksum bytes of a
//! deflate stream. When inflate stalls with no input left, we synthesize
//! the adler32 of the bytes produced so far and feed it once before
//! giving up.

use eyre::{bail, ensure, Result};
use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};

use crate::error::Error;

/// Tags at or below this many bytes are never worth deflating.
pub const COMPRESS_MIN: usize = 4;

const INFLATE_CHUNK: usize = 8192;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompressStrategy {
    /// Store every tag verbatim.
    #[default]
    None,
    /// Deflate with the default encoder heuristics.
    Default,
    /// Hint for filtered data (small values with a somewhat random
    /// distribution).
    Filtered,
    /// Hint to use Huffman coding only.
    HuffmanOnly,
    /// Hint to limit match distances to one (run-length encoding).
    Rle,
}

impl CompressStrategy {
    pub fn compresses(self) -> bool {
        self != CompressStrategy::None
    }
}

/// Lazily allocated deflate/inflate state, owned by a table or cursor.
#[derive(Default)]
pub struct TagCompressor {
    deflate: Option<Compress>,
    inflate: Option<Decompress>,
}

impl std::fmt::Debug for TagCompressor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TagCompressor")
            .field("deflate", &self.deflate.is_some())
            .field("inflate", &self.inflate.is_some())
            .finish()
    }
}

impl TagCompressor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deflates `tag` as a raw stream. Returns `None` when the deflated
    /// form would not be strictly smaller than the input.
    pub fn deflate(&mut self, tag: &[u8]) -> Result<Option<Vec<u8>>> {
        if tag.len() <= 1 {
            return Ok(None);
        }

        let z = match &mut self.deflate {
            Some(z) => {
                z.reset();
                z
            }
            stream => stream.insert(Compress::new(Compression::default(), false)),
        };

        // Capping the output below the input length means "finished"
        // implies "strictly smaller".
        let mut out = Vec::with_capacity(tag.len() - 1);
        let status = z
            .compress_vec(tag, &mut out, FlushCompress::Finish)
            .map_err(|e| Error::Database(format!("deflate failed: {e}")))?;

        if status == Status::StreamEnd {
            Ok(Some(out))
        } else {
            Ok(None)
        }
    }

    /// Inflates a raw deflate stream produced by [`Self::deflate`] (or a
    /// foreign writer of the same format).
    pub fn inflate(&mut self, src: &[u8]) -> Result<Vec<u8>> {
        let z = match &mut self.inflate {
            Some(z) => {
                z.reset(false);
                z
            }
            stream => stream.insert(Decompress::new(false)),
        };

        let mut out = Vec::with_capacity(src.len() + src.len() / 2);
        let mut buf = [0u8; INFLATE_CHUNK];
        let mut pos = 0usize;
        let mut faked_checksum = false;

        loop {
            let in_before = z.total_in();
            let out_before = z.total_out();
            let status = z
                .decompress(&src[pos..], &mut buf, FlushDecompress::Sync)
                .map_err(|e| Error::Corrupt(format!("inflate failed: {e}")))?;
            pos += (z.total_in() - in_before) as usize;
            out.extend_from_slice(&buf[..(z.total_out() - out_before) as usize]);

            match status {
                Status::StreamEnd => break,
                Status::Ok => continue,
                Status::BufError => {
                    if pos < src.len() || faked_checksum {
                        bail!(Error::Corrupt("inflate stalled mid-stream".into()));
                    }
                    // Legacy truncation recovery: feed the checksum the
                    // writer should have appended.
                    faked_checksum = true;
                    let trailer = adler32(&out).to_be_bytes();
                    let out_before = z.total_out();
                    let status = z
                        .decompress(&trailer, &mut buf, FlushDecompress::Sync)
                        .map_err(|e| Error::Corrupt(format!("inflate failed: {e}")))?;
                    out.extend_from_slice(&buf[..(z.total_out() - out_before) as usize]);
                    if status == Status::StreamEnd {
                        break;
                    }
                    bail!(Error::Corrupt(
                        "compressed tag is truncated and unrecoverable".into()
                    ));
                }
            }
        }

        ensure!(
            out.len() as u64 == z.total_out(),
            Error::Corrupt(format!(
                "compressed tag didn't expand to the expected size: {} != {}",
                out.len(),
                z.total_out()
            ))
        );

        Ok(out)
    }
}

/// Adler-32 over `data`, for the truncated-stream recovery path.
fn adler32(data: &[u8]) -> u32 {
    const MOD: u32 = 65521;
    let mut a: u32 = 1;
    let mut b: u32 = 0;
    for chunk in data.chunks(5552) {
        for &byte in chunk {
            a += byte as u32;
            b += a;
        }
        a %= MOD;
        b %= MOD;
    }
    (b << 16) | a
}

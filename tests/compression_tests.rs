//! # Tag Compression Tests
//!
//! Behavior of tables opened with a compression strategy: transparent
//! round-trips, on-disk footprint of compressible data, the
//! incompressible fallback, and caller-compressed tags.

use std::path::PathBuf;

use flate2::{Compress, Compression, FlushCompress};
use rand::{Rng, SeedableRng};
use strata::{CompressStrategy, Table, TableOptions};

fn stem(dir: &tempfile::TempDir) -> PathBuf {
    dir.path().join("zipped.")
}

fn opts() -> TableOptions {
    TableOptions::new().compress_strategy(CompressStrategy::Default)
}

fn disk_footprint(dir: &tempfile::TempDir) -> u64 {
    ["zipped.DB", "zipped.baseA", "zipped.baseB"]
        .iter()
        .filter_map(|f| std::fs::metadata(dir.path().join(f)).ok())
        .map(|m| m.len())
        .sum()
}

#[test]
fn compressible_megabyte_stays_small_on_disk() {
    let dir = tempfile::tempdir().unwrap();
    let mut table = Table::create(&stem(&dir), opts()).unwrap();

    let value = b"abcd".repeat(262_144); // 1 MiB
    table.add(b"repeats", &value, false).unwrap();
    table.commit(1).unwrap();
    drop(table);

    assert!(
        disk_footprint(&dir) < 100 * 1024,
        "compressible value blew up on disk: {} bytes",
        disk_footprint(&dir)
    );

    let mut reader = Table::open(&stem(&dir), opts().readonly(true)).unwrap();
    assert_eq!(reader.get_exact_entry(b"repeats").unwrap(), Some(value));
}

#[test]
fn incompressible_values_are_stored_raw_and_intact() {
    let dir = tempfile::tempdir().unwrap();
    let mut table = Table::create(&stem(&dir), opts()).unwrap();

    let mut value = vec![0u8; 64 * 1024];
    rand::rngs::StdRng::seed_from_u64(99).fill(&mut value[..]);

    table.add(b"noise", &value, false).unwrap();
    table.commit(1).unwrap();
    drop(table);

    // Random data doesn't deflate; the footprint reflects that.
    assert!(disk_footprint(&dir) >= 64 * 1024);

    let mut reader = Table::open(&stem(&dir), opts().readonly(true)).unwrap();
    assert_eq!(reader.get_exact_entry(b"noise").unwrap(), Some(value));
}

#[test]
fn tiny_values_skip_the_compressor() {
    let dir = tempfile::tempdir().unwrap();
    let mut table = Table::create(&stem(&dir), opts()).unwrap();

    for (key, value) in [
        (b"a".as_slice(), b"".as_slice()),
        (b"b", b"x"),
        (b"c", b"xxxx"),
        (b"d", b"xxxxx"),
    ] {
        table.add(key, value, false).unwrap();
    }
    table.commit(1).unwrap();

    for (key, value) in [
        (b"a".as_slice(), b"".as_slice()),
        (b"b", b"x"),
        (b"c", b"xxxx"),
        (b"d", b"xxxxx"),
    ] {
        assert_eq!(table.get_exact_entry(key).unwrap(), Some(value.to_vec()));
    }
}

#[test]
fn caller_compressed_tags_are_stored_verbatim() {
    let dir = tempfile::tempdir().unwrap();
    let mut table = Table::create(&stem(&dir), opts()).unwrap();

    let original = b"the quick brown fox jumps over the lazy dog ".repeat(1000);

    // Raw deflate, as a posting-list encoder handing us pre-compressed
    // data would produce.
    let mut deflater = Compress::new(Compression::default(), false);
    let mut packed = Vec::with_capacity(original.len());
    deflater
        .compress_vec(&original, &mut packed, FlushCompress::Finish)
        .unwrap();

    table.add(b"prepacked", &packed, true).unwrap();
    table.commit(1).unwrap();
    drop(table);

    let mut reader = Table::open(&stem(&dir), opts().readonly(true)).unwrap();
    assert_eq!(reader.get_exact_entry(b"prepacked").unwrap(), Some(original));
}

#[test]
fn compressed_tags_survive_cursor_reads() {
    let dir = tempfile::tempdir().unwrap();
    let mut table = Table::create(&stem(&dir), opts()).unwrap();

    let big = b"posting list entry ".repeat(60_000); // > 1 MiB, compressible
    table.add(b"big", &big, false).unwrap();
    table.add(b"next", b"after", false).unwrap();
    table.commit(1).unwrap();

    let mut cursor = table.cursor();
    assert!(cursor.next().unwrap());
    assert_eq!(cursor.current_key().unwrap(), b"big");
    assert_eq!(cursor.current_tag().unwrap(), big);

    // Reading the tag leaves the cursor ready to step to the next key.
    assert!(cursor.next().unwrap());
    assert_eq!(cursor.current_key().unwrap(), b"next");
    assert_eq!(cursor.current_tag().unwrap(), b"after");
    assert!(!cursor.next().unwrap());
}

#[test]
fn compression_strategies_all_round_trip() {
    for strategy in [
        CompressStrategy::Default,
        CompressStrategy::Filtered,
        CompressStrategy::HuffmanOnly,
        CompressStrategy::Rle,
        CompressStrategy::None,
    ] {
        let dir = tempfile::tempdir().unwrap();
        let mut table = Table::create(
            &stem(&dir),
            TableOptions::new().compress_strategy(strategy),
        )
        .unwrap();

        let value = b"zzzzzzzz".repeat(5000);
        table.add(b"k", &value, false).unwrap();
        table.commit(1).unwrap();
        assert_eq!(table.get_exact_entry(b"k").unwrap(), Some(value));
    }
}

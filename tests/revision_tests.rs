//! # Revision Protocol Tests
//!
//! The two-base commit dance: alternating base letters, opening
//! specific revisions, readers racing a writer, and the changed-blocks
//! delta stream used by replication.

use std::path::PathBuf;

use strata::encoding::unpack_uint;
use strata::{Error, Table, TableOptions};

fn stem(dir: &tempfile::TempDir) -> PathBuf {
    dir.path().join("rev.")
}

fn opts() -> TableOptions {
    TableOptions::new()
}

#[test]
fn base_letters_alternate_across_commits() {
    let dir = tempfile::tempdir().unwrap();
    let mut table = Table::create(&stem(&dir), opts()).unwrap();

    // Creation writes base A at revision 0.
    assert!(dir.path().join("rev.baseA").exists());
    assert!(!dir.path().join("rev.baseB").exists());

    table.add(b"k", b"v1", false).unwrap();
    table.commit(1).unwrap();
    assert!(dir.path().join("rev.baseB").exists());

    table.add(b"k", b"v2", false).unwrap();
    table.commit(2).unwrap();
    // The first write of the second transaction retired base A; the
    // commit recreated it at revision 2.
    assert!(dir.path().join("rev.baseA").exists());
    assert!(dir.path().join("rev.baseB").exists());
    assert_eq!(table.revision(), 2);
    assert_eq!(table.latest_revision(), 2);
}

#[test]
fn open_at_returns_the_requested_revision_or_none() {
    let dir = tempfile::tempdir().unwrap();
    let mut table = Table::create(&stem(&dir), opts()).unwrap();
    table.add(b"k", b"v1", false).unwrap();
    table.commit(1).unwrap();
    table.add(b"k", b"v2", false).unwrap();
    table.commit(2).unwrap();
    drop(table);

    // Both revisions are still on disk, under opposite letters.
    let mut old = Table::open_at(&stem(&dir), opts().readonly(true), 1)
        .unwrap()
        .expect("revision 1 should still exist");
    assert_eq!(old.get_exact_entry(b"k").unwrap(), Some(b"v1".to_vec()));

    let mut new = Table::open_at(&stem(&dir), opts().readonly(true), 2)
        .unwrap()
        .expect("revision 2 should exist");
    assert_eq!(new.get_exact_entry(b"k").unwrap(), Some(b"v2".to_vec()));

    // A revision that never was (or is long gone) is a non-exceptional
    // miss.
    assert!(Table::open_at(&stem(&dir), opts().readonly(true), 7)
        .unwrap()
        .is_none());

    // Plain open picks the newest.
    let mut latest = Table::open(&stem(&dir), opts().readonly(true)).unwrap();
    assert_eq!(latest.revision(), 2);
    assert_eq!(latest.get_exact_entry(b"k").unwrap(), Some(b"v2".to_vec()));
}

#[test]
fn a_new_transaction_retires_the_oldest_revision() {
    let dir = tempfile::tempdir().unwrap();
    let mut table = Table::create(&stem(&dir), opts()).unwrap();
    table.add(b"k", b"v1", false).unwrap();
    table.commit(1).unwrap();
    table.add(b"k", b"v2", false).unwrap();
    table.commit(2).unwrap();

    // Revision 1 is readable until the writer starts overwriting.
    assert!(Table::open_at(&stem(&dir), opts().readonly(true), 1)
        .unwrap()
        .is_some());

    // Small in-memory additions don't touch the file yet, so revision 1
    // stays readable...
    table.add(b"k2", b"v", false).unwrap();
    assert!(Table::open_at(&stem(&dir), opts().readonly(true), 1)
        .unwrap()
        .is_some());

    // ...but the transaction's first block write (here forced by block
    // splits) drops revision 1's base before anything is clobbered.
    for i in 0..2000u32 {
        let key = format!("fill{i:06}");
        table.add(key.as_bytes(), b"x", false).unwrap();
    }
    assert!(Table::open_at(&stem(&dir), opts().readonly(true), 1)
        .unwrap()
        .is_none());
    table.commit(3).unwrap();
}

#[test]
fn racing_reader_gets_old_data_or_a_clean_modified_error() {
    let dir = tempfile::tempdir().unwrap();
    let keys: Vec<String> = (0..2000).map(|i| format!("k{i:06}")).collect();

    let mut writer = Table::create(&stem(&dir), opts().block_size(2048)).unwrap();
    for key in &keys {
        writer.add(key.as_bytes(), b"old", false).unwrap();
    }
    writer.commit(1).unwrap();

    // Reader pinned at revision 1.
    let mut reader = Table::open_at(&stem(&dir), opts().readonly(true), 1)
        .unwrap()
        .unwrap();

    // The writer commits revision 2, then starts a third transaction,
    // which is free to overwrite revision 1's blocks.
    for key in &keys {
        writer.add(key.as_bytes(), b"newer", false).unwrap();
    }
    writer.commit(2).unwrap();
    for key in &keys {
        writer.add(key.as_bytes(), b"newest", false).unwrap();
    }

    // Every lookup must yield revision 1's value or a clean Modified
    // error - never a newer value, never garbage. Which of the two
    // depends on allocation order; the invariant is only "no wrong
    // answers".
    for key in &keys {
        match reader.get_exact_entry(key.as_bytes()) {
            Ok(value) => assert_eq!(value, Some(b"old".to_vec()), "torn read of {key}"),
            Err(e) => {
                assert!(
                    matches!(e.downcast_ref::<Error>(), Some(Error::Modified)),
                    "unexpected error for {key}: {e:#}"
                );
                break;
            }
        }
    }
}

#[test]
fn reopening_after_modified_sees_the_new_revision() {
    let dir = tempfile::tempdir().unwrap();
    let mut writer = Table::create(&stem(&dir), opts()).unwrap();
    writer.add(b"k", b"v1", false).unwrap();
    writer.commit(1).unwrap();
    writer.add(b"k", b"v2", false).unwrap();
    writer.commit(2).unwrap();

    let mut reader = Table::open(&stem(&dir), opts().readonly(true)).unwrap();
    assert_eq!(reader.revision(), 2);
    assert_eq!(reader.get_exact_entry(b"k").unwrap(), Some(b"v2".to_vec()));
}

#[test]
fn changed_blocks_delta_reproduces_the_committed_file() {
    let dir = tempfile::tempdir().unwrap();
    let db_file = dir.path().join("rev.DB");

    let mut writer = Table::create(&stem(&dir), opts().block_size(2048)).unwrap();
    for i in 0..500u32 {
        let key = format!("k{i:06}");
        writer.add(key.as_bytes(), format!("v{i}").as_bytes(), false).unwrap();
    }
    let mut delta1 = Vec::new();
    writer.write_changed_blocks(&mut delta1).unwrap();
    writer.commit(1).unwrap();

    // Applying the first delta to an empty image yields the committed
    // file.
    let mut image = Vec::new();
    apply_delta(&delta1, &mut image, b"rev", 2048);
    assert_eq!(image, std::fs::read(&db_file).unwrap());

    // Second transaction: replacements and fresh keys.
    let snapshot = std::fs::read(&db_file).unwrap();
    for i in 0..500u32 {
        let key = format!("k{i:06}");
        writer.add(key.as_bytes(), format!("w{i}").as_bytes(), false).unwrap();
    }
    let mut delta2 = Vec::new();
    writer.write_changed_blocks(&mut delta2).unwrap();
    writer.commit(2).unwrap();

    let mut image = snapshot;
    apply_delta(&delta2, &mut image, b"rev", 2048);
    assert_eq!(image, std::fs::read(&db_file).unwrap());
}

/// Parses a changes-stream entry
/// (`2, len(name), name, block_size, (block_no + 1, bytes)..., 0`) and
/// applies the carried blocks to `image`.
fn apply_delta(delta: &[u8], image: &mut Vec<u8>, name: &[u8], block_size: usize) {
    let mut pos = 0;
    let mut next = |pos: &mut usize| {
        let (v, n) = unpack_uint(&delta[*pos..]).unwrap();
        *pos += n;
        v
    };

    assert_eq!(next(&mut pos), 2, "wrong entry tag");
    let name_len = next(&mut pos) as usize;
    assert_eq!(&delta[pos..pos + name_len], name);
    pos += name_len;
    assert_eq!(next(&mut pos) as usize, block_size);

    loop {
        let tagged = next(&mut pos);
        if tagged == 0 {
            break;
        }
        let block_no = (tagged - 1) as usize;
        let end = (block_no + 1) * block_size;
        if image.len() < end {
            image.resize(end, 0);
        }
        image[block_no * block_size..end].copy_from_slice(&delta[pos..pos + block_size]);
        pos += block_size;
    }
    assert_eq!(pos, delta.len(), "trailing bytes after the delta");
}

#[test]
fn a_writer_can_reopen_an_older_revision_and_supersede_the_newer_one() {
    // Crash-recovery shape: the database layer decides revision 2 never
    // happened, reopens the writer at revision 1, and commits onward
    // from there.
    let dir = tempfile::tempdir().unwrap();
    let mut writer = Table::create(&stem(&dir), opts()).unwrap();
    writer.add(b"k", b"v1", false).unwrap();
    writer.commit(1).unwrap();
    writer.add(b"k", b"v2", false).unwrap();
    writer.add(b"only-in-2", b"x", false).unwrap();
    writer.commit(2).unwrap();
    drop(writer);

    let mut recovered = Table::open_at(&stem(&dir), opts(), 1)
        .unwrap()
        .expect("revision 1 should be reopenable");
    assert_eq!(recovered.revision(), 1);
    assert_eq!(recovered.latest_revision(), 2);
    assert_eq!(recovered.get_exact_entry(b"k").unwrap(), Some(b"v1".to_vec()));
    assert_eq!(recovered.get_exact_entry(b"only-in-2").unwrap(), None);

    recovered.add(b"k", b"v1b", false).unwrap();
    recovered.commit(5).unwrap();
    drop(recovered);

    let mut reader = Table::open(&stem(&dir), opts().readonly(true)).unwrap();
    assert_eq!(reader.revision(), 5);
    assert_eq!(reader.get_exact_entry(b"k").unwrap(), Some(b"v1b".to_vec()));
    assert_eq!(reader.get_exact_entry(b"only-in-2").unwrap(), None);
}

#[test]
fn lazy_table_commit_without_data_is_a_no_op_on_disk() {
    let dir = tempfile::tempdir().unwrap();
    let mut table = Table::open(&stem(&dir), opts().lazy(true)).unwrap();

    let mut delta = Vec::new();
    table.write_changed_blocks(&mut delta).unwrap();
    assert!(delta.is_empty());

    table.commit(5).unwrap();
    assert_eq!(table.revision(), 5);
    assert!(!Table::exists(&stem(&dir)));
}

//! # Crash Atomicity
//!
//! Every mutation runs inside one redo transaction, and the clean-header
//! commit is the only other durable transition. These tests abandon a
//! store the way a crashing process would (no final commit) and verify
//! that reopening recovers exactly the committed transaction prefix:
//! all of them when the log is intact, a strict prefix when the tail is
//! torn, and nothing after a clean close.

use std::io::{Read, Seek, SeekFrom, Write};

use pindb::{Store, StoreOptions};
use tempfile::tempdir;

const REDO_TAIL_AT: u64 = 40;

fn options() -> StoreOptions {
    StoreOptions::new().file_size(1 << 14).populate(|schema| {
        schema.structure(
            "Root",
            &[("name", "bytes"), ("age", "int"), ("motto", "bytes")],
        )
    })
}

fn redo_path(path: &std::path::Path) -> std::path::PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".redo");
    std::path::PathBuf::from(name)
}

/// Reads the redo log's cached tail offset.
fn redo_tail(path: &std::path::Path) -> u64 {
    let mut file = std::fs::File::open(redo_path(path)).unwrap();
    file.seek(SeekFrom::Start(REDO_TAIL_AT)).unwrap();
    let mut bytes = [0u8; 8];
    file.read_exact(&mut bytes).unwrap();
    u64::from_le_bytes(bytes)
}

/// Flips the last payload byte of the last committed transaction,
/// simulating a torn write.
fn tear_last_transaction(path: &std::path::Path) {
    let tail = redo_tail(path);
    let mut file = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open(redo_path(path))
        .unwrap();
    file.seek(SeekFrom::Start(tail - 1)).unwrap();
    let mut byte = [0u8; 1];
    file.read_exact(&mut byte).unwrap();
    file.seek(SeekFrom::Start(tail - 1)).unwrap();
    file.write_all(&[byte[0] ^ 0xFF]).unwrap();
}

#[test]
fn committed_transactions_survive_a_crash() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("crash.pin");

    {
        let store = Store::open(&path, options()).unwrap();
        let root = store.root().unwrap();
        root.set_field("age", 27).unwrap();
        root.set_field("name", "James Bond").unwrap();
        store.abandon();
    }

    let store = Store::open(&path, StoreOptions::new()).unwrap();
    let root = store.root().unwrap();
    assert_eq!(root.field("age").unwrap().unwrap().get_int().unwrap(), 27);
    assert_eq!(
        root.field("name").unwrap().unwrap().bytes().unwrap(),
        b"James Bond"
    );
    store.close().unwrap();
}

#[test]
fn a_torn_tail_is_discarded_and_the_prefix_recovers() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("torn.pin");

    let free_after_first;
    {
        let store = Store::open(&path, options()).unwrap();
        let root = store.root().unwrap();
        root.set_field("age", 27).unwrap();
        free_after_first = store.free_offset().unwrap();
        root.set_field("name", "Q").unwrap();
        store.abandon();
    }

    tear_last_transaction(&path);

    let store = Store::open(&path, StoreOptions::new()).unwrap();
    let root = store.root().unwrap();

    // The committed first transaction replayed; the torn second one was
    // discarded, which rolls the allocator back to the committed mark so
    // the byte string it allocated is reclaimed.
    assert_eq!(root.field("age").unwrap().unwrap().get_int().unwrap(), 27);
    assert_eq!(store.free_offset().unwrap(), free_after_first);

    // The recovered state is committed and fully usable.
    root.set_field("name", "R").unwrap();
    store.close().unwrap();

    let store = Store::open(&path, StoreOptions::new()).unwrap();
    let root = store.root().unwrap();
    assert_eq!(root.field("name").unwrap().unwrap().bytes().unwrap(), b"R");
    store.close().unwrap();
}

#[test]
fn recovery_restores_the_allocator_mark() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("alloc.pin");

    let free_before;
    {
        let store = Store::open(&path, options()).unwrap();
        let root = store.root().unwrap();
        root.set_field("motto", "the world is not enough").unwrap();
        free_before = store.free_offset().unwrap();
        store.abandon();
    }

    let store = Store::open(&path, StoreOptions::new()).unwrap();
    assert_eq!(store.free_offset().unwrap(), free_before);

    // A fresh allocation cannot overlap replayed data.
    let fresh = store.new_bytes(b"fresh after recovery").unwrap();
    assert!(fresh.offset() >= free_before);
    assert_eq!(
        store
            .root()
            .unwrap()
            .field("motto")
            .unwrap()
            .unwrap()
            .bytes()
            .unwrap(),
        b"the world is not enough"
    );

    drop(fresh);
    store.close().unwrap();
}

#[test]
fn a_clean_close_leaves_an_empty_log() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("clean.pin");

    {
        let store = Store::open(&path, options()).unwrap();
        store.root().unwrap().set_field("age", 1).unwrap();
        store.close().unwrap();
    }

    // After a clean close the cached tail is back at the first
    // transaction slot (one header page in).
    assert_eq!(redo_tail(&path), 4096);

    let store = Store::open(&path, StoreOptions::new()).unwrap();
    assert_eq!(
        store
            .root()
            .unwrap()
            .field("age")
            .unwrap()
            .unwrap()
            .get_int()
            .unwrap(),
        1
    );
    store.close().unwrap();
}

#[test]
fn journaling_can_be_disabled() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("nolog.pin");

    {
        let store = Store::open(&path, options().journal(false)).unwrap();
        store.root().unwrap().set_field("age", 5).unwrap();
        store.close().unwrap();
    }

    assert!(!redo_path(&path).exists());

    let store = Store::open(&path, StoreOptions::new().journal(false)).unwrap();
    assert_eq!(
        store
            .root()
            .unwrap()
            .field("age")
            .unwrap()
            .unwrap()
            .get_int()
            .unwrap(),
        5
    );
    store.close().unwrap();
}

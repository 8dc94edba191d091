//! Tests for Database record operations
//!
//! These tests verify:
//! - Basic fetch/store/delete/append/exists
//! - Store modes
//! - In-place rewrites and growth
//! - Read-only and internal databases
//! - Caller-controlled chain locks
//! - Sharing one handle across threads

use tdbkv::{Config, Database, ErrorKind, StoreMode, TdbError};
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

fn setup_temp_db() -> (TempDir, Database) {
    let temp_dir = TempDir::new().unwrap();
    let db = Database::open(Config::for_path(temp_dir.path().join("test.tdb"))).unwrap();
    (temp_dir, db)
}

fn assert_conserved(db: &Database) {
    let report = db.check().unwrap();
    assert!(report.is_conserved(), "space leaked: {:?}", report);
}

// =============================================================================
// Basic Operations Tests
// =============================================================================

#[test]
fn test_store_fetch() {
    let (_temp, db) = setup_temp_db();

    db.store(b"hello", b"world", StoreMode::Replace).unwrap();

    assert_eq!(db.fetch(b"hello").unwrap().as_deref(), Some(&b"world"[..]));
    assert_eq!(db.last_error(), ErrorKind::Success);
}

#[test]
fn test_fetch_missing_records_not_found() {
    let (_temp, db) = setup_temp_db();

    assert_eq!(db.fetch(b"nothing").unwrap(), None);
    assert_eq!(db.last_error(), ErrorKind::RecordNotFound);
    assert_eq!(db.error_string(), "Record does not exist");
}

#[test]
fn test_exists() {
    let (_temp, db) = setup_temp_db();

    db.store(b"k", b"v", StoreMode::Insert).unwrap();

    assert!(db.exists(b"k").unwrap());
    assert!(!db.exists(b"other").unwrap());
}

#[test]
fn test_empty_key_and_value() {
    let (_temp, db) = setup_temp_db();

    db.store(b"", b"empty key", StoreMode::Insert).unwrap();
    db.store(b"empty value", b"", StoreMode::Insert).unwrap();

    assert_eq!(db.fetch(b"").unwrap().as_deref(), Some(&b"empty key"[..]));
    assert_eq!(db.fetch(b"empty value").unwrap().as_deref(), Some(&b""[..]));
    assert_conserved(&db);
}

#[test]
fn test_delete() {
    let (_temp, db) = setup_temp_db();

    db.store(b"key", b"value", StoreMode::Insert).unwrap();
    db.delete(b"key").unwrap();

    assert_eq!(db.fetch(b"key").unwrap(), None);
    assert_conserved(&db);
}

#[test]
fn test_delete_missing() {
    let (_temp, db) = setup_temp_db();

    let err = db.delete(b"missing").unwrap_err();

    assert!(matches!(err, TdbError::RecordNotFound));
    assert_eq!(db.last_error(), ErrorKind::RecordNotFound);
}

#[test]
fn test_example_session() {
    let temp_dir = TempDir::new().unwrap();
    let config = Config::builder()
        .path(temp_dir.path().join("db"))
        .hash_size(131)
        .clear_if_first(true)
        .build();
    let db = Database::open(config).unwrap();

    db.store(b"a", b"1", StoreMode::Insert).unwrap();
    db.store(b"b", b"22", StoreMode::Insert).unwrap();
    assert_eq!(db.fetch(b"a").unwrap().as_deref(), Some(&b"1"[..]));
    assert_eq!(db.fetch(b"b").unwrap().as_deref(), Some(&b"22"[..]));

    db.delete(b"a").unwrap();
    assert_eq!(db.fetch(b"a").unwrap(), None);
    assert!(matches!(db.delete(b"a"), Err(TdbError::RecordNotFound)));

    let mut seen = Vec::new();
    db.traverse(|k, v| {
        seen.push((k.to_vec(), v.to_vec()));
        tdbkv::TraverseControl::Continue
    })
    .unwrap();
    assert_eq!(seen, vec![(b"b".to_vec(), b"22".to_vec())]);

    db.close().unwrap();
}

// =============================================================================
// Store Mode Tests
// =============================================================================

#[test]
fn test_insert_refuses_existing_key() {
    let (_temp, db) = setup_temp_db();

    db.store(b"key", b"first", StoreMode::Insert).unwrap();
    let err = db.store(b"key", b"second", StoreMode::Insert).unwrap_err();

    assert!(matches!(err, TdbError::RecordExists));
    assert_eq!(db.last_error(), ErrorKind::RecordExists);
    assert_eq!(db.fetch(b"key").unwrap().as_deref(), Some(&b"first"[..]));
}

#[test]
fn test_modify_requires_existing_key() {
    let (_temp, db) = setup_temp_db();

    let err = db.store(b"key", b"value", StoreMode::Modify).unwrap_err();
    assert!(matches!(err, TdbError::RecordNotFound));
    assert_eq!(db.fetch(b"key").unwrap(), None);

    db.store(b"key", b"value", StoreMode::Insert).unwrap();
    db.store(b"key", b"changed", StoreMode::Modify).unwrap();
    assert_eq!(db.fetch(b"key").unwrap().as_deref(), Some(&b"changed"[..]));
}

#[test]
fn test_replace_with_smaller_value_stays_in_place() {
    let (_temp, db) = setup_temp_db();

    db.store(b"key", &[b'x'; 100], StoreMode::Replace).unwrap();
    let chain = db.dump_chain(db.bucket_of(b"key")).unwrap();
    let before = chain[0].offset;

    db.store(b"key", b"short", StoreMode::Replace).unwrap();

    let chain = db.dump_chain(db.bucket_of(b"key")).unwrap();
    assert_eq!(chain.len(), 1);
    assert_eq!(chain[0].offset, before);
    assert_eq!(chain[0].header.data_len, 5);
    assert_eq!(db.fetch(b"key").unwrap().as_deref(), Some(&b"short"[..]));
    assert_conserved(&db);
}

#[test]
fn test_replace_with_larger_value_relocates() {
    let (_temp, db) = setup_temp_db();

    db.store(b"key", b"short", StoreMode::Replace).unwrap();
    db.store(b"key", &[b'y'; 500], StoreMode::Replace).unwrap();

    assert_eq!(db.fetch(b"key").unwrap().unwrap().len(), 500);
    assert_eq!(db.dump_chain(db.bucket_of(b"key")).unwrap().len(), 1);
    assert_conserved(&db);
}

// =============================================================================
// Append Tests
// =============================================================================

#[test]
fn test_append_creates_then_extends() {
    let (_temp, db) = setup_temp_db();

    db.append(b"log", b"one").unwrap();
    db.append(b"log", b",two").unwrap();
    db.append(b"log", b"").unwrap();

    assert_eq!(db.fetch(b"log").unwrap().as_deref(), Some(&b"one,two"[..]));
}

#[test]
fn test_append_grows_record() {
    let (_temp, db) = setup_temp_db();

    let mut expected = Vec::new();
    for i in 0..200u32 {
        let piece = format!("<{}>", i);
        db.append(b"grow", piece.as_bytes()).unwrap();
        expected.extend_from_slice(piece.as_bytes());
    }

    assert_eq!(db.fetch(b"grow").unwrap().unwrap().as_ref(), &expected[..]);
    assert_conserved(&db);
}

// =============================================================================
// Growth & Persistence Tests
// =============================================================================

#[test]
fn test_large_value_expands_file() {
    let (_temp, db) = setup_temp_db();
    let initial = db.file_size();
    let value = vec![0xAB; 64 * 1024];

    db.store(b"big", &value, StoreMode::Insert).unwrap();

    assert!(db.file_size() > initial + 64 * 1024);
    assert_eq!(db.fetch(b"big").unwrap().unwrap().as_ref(), &value[..]);
    assert_conserved(&db);
}

#[test]
fn test_many_records() {
    let (_temp, db) = setup_temp_db();

    for i in 0..1000u32 {
        let key = format!("key-{}", i);
        db.store(key.as_bytes(), &i.to_le_bytes(), StoreMode::Insert).unwrap();
    }
    for i in (0..1000u32).step_by(2) {
        db.delete(format!("key-{}", i).as_bytes()).unwrap();
    }

    for i in 0..1000u32 {
        let got = db.fetch(format!("key-{}", i).as_bytes()).unwrap();
        if i % 2 == 0 {
            assert_eq!(got, None);
        } else {
            assert_eq!(got.as_deref(), Some(&i.to_le_bytes()[..]));
        }
    }
    let report = db.check().unwrap();
    assert!(report.is_conserved());
    assert_eq!(report.live_records, 500);
}

#[test]
fn test_data_survives_reopen() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("persist.tdb");

    {
        let db = Database::open_path(&path).unwrap();
        db.store(b"a", b"1", StoreMode::Insert).unwrap();
        db.store(b"b", b"2", StoreMode::Insert).unwrap();
        db.close().unwrap();
    }

    let db = Database::open_path(&path).unwrap();
    assert_eq!(db.fetch(b"a").unwrap().as_deref(), Some(&b"1"[..]));
    assert_eq!(db.fetch(b"b").unwrap().as_deref(), Some(&b"2"[..]));
}

#[test]
fn test_no_mmap_uses_file_io() {
    let temp_dir = TempDir::new().unwrap();
    let config = Config::builder()
        .path(temp_dir.path().join("pread.tdb"))
        .no_mmap(true)
        .build();
    let db = Database::open(config).unwrap();

    for i in 0..100u32 {
        db.store(&i.to_be_bytes(), &[7u8; 300], StoreMode::Insert).unwrap();
    }

    assert_eq!(db.fetch(&42u32.to_be_bytes()).unwrap().unwrap().len(), 300);
    assert_conserved(&db);
}

// =============================================================================
// Read-Only & Internal Tests
// =============================================================================

#[test]
fn test_read_only_rejects_writes() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("ro.tdb");
    {
        let db = Database::open_path(&path).unwrap();
        db.store(b"k", b"v", StoreMode::Insert).unwrap();
    }

    let db = Database::open(Config::builder().path(&path).read_only(true).build()).unwrap();

    assert!(db.is_read_only());
    assert_eq!(db.fetch(b"k").unwrap().as_deref(), Some(&b"v"[..]));
    assert!(matches!(
        db.store(b"k", b"w", StoreMode::Replace),
        Err(TdbError::ReadOnly)
    ));
    assert!(matches!(db.delete(b"k"), Err(TdbError::ReadOnly)));
    assert!(db.lock_all().is_err());
}

#[test]
fn test_internal_database() {
    let db = Database::memory().unwrap();

    assert!(db.is_internal());
    assert_eq!(db.path(), None);

    for i in 0..300u32 {
        db.store(&i.to_le_bytes(), &[1u8; 64], StoreMode::Insert).unwrap();
    }
    db.delete(&5u32.to_le_bytes()).unwrap();

    assert_eq!(db.fetch(&5u32.to_le_bytes()).unwrap(), None);
    assert!(db.exists(&6u32.to_le_bytes()).unwrap());
    assert_conserved(&db);
}

#[test]
fn test_custom_hash_single_chain() {
    fn constant(_: &[u8]) -> u32 {
        7
    }
    let db = Database::open(
        Config::builder()
            .internal(true)
            .hash_size(5)
            .hash_fn(constant)
            .build(),
    )
    .unwrap();

    for key in [&b"a"[..], b"b", b"c"] {
        db.store(key, key, StoreMode::Insert).unwrap();
    }
    db.delete(b"b").unwrap();

    assert_eq!(db.dump_chain(2).unwrap().len(), 2);
    assert!(db.dump_chain(0).unwrap().is_empty());
    assert_eq!(db.fetch(b"a").unwrap().as_deref(), Some(&b"a"[..]));
    assert_eq!(db.fetch(b"c").unwrap().as_deref(), Some(&b"c"[..]));
    assert!(matches!(db.dump_chain(5), Err(TdbError::Config(_))));
}

// =============================================================================
// Caller Lock Tests
// =============================================================================

#[test]
fn test_operations_inside_chain_lock() {
    let (_temp, db) = setup_temp_db();

    db.lock_chain(b"key").unwrap();
    db.store(b"key", b"value", StoreMode::Insert).unwrap();
    assert_eq!(db.fetch(b"key").unwrap().as_deref(), Some(&b"value"[..]));
    db.unlock_chain(b"key").unwrap();

    db.lock_chain_read(b"key").unwrap();
    assert!(db.exists(b"key").unwrap());
    db.unlock_chain_read(b"key").unwrap();
}

#[test]
fn test_unbalanced_unlock_fails() {
    let (_temp, db) = setup_temp_db();

    assert!(db.unlock_chain(b"never locked").is_err());
    assert_eq!(db.last_error(), ErrorKind::LockFailed);
}

#[test]
fn test_lock_all_covers_every_operation() {
    let (_temp, db) = setup_temp_db();

    db.lock_all().unwrap();
    db.store(b"x", b"1", StoreMode::Insert).unwrap();
    db.append(b"x", b"2").unwrap();
    assert_eq!(db.fetch(b"x").unwrap().as_deref(), Some(&b"12"[..]));
    db.unlock_all().unwrap();
}

// =============================================================================
// Concurrent Access Tests
// =============================================================================

#[test]
fn test_threads_share_handle() {
    let (_temp, db) = setup_temp_db();

    crossbeam::thread::scope(|s| {
        for t in 0..4u32 {
            let db = &db;
            s.spawn(move |_| {
                for i in 0..100u32 {
                    let key = format!("t{}-{}", t, i);
                    db.store(key.as_bytes(), key.as_bytes(), StoreMode::Insert).unwrap();
                    db.append(b"shared", b".").unwrap();
                }
            });
        }
    })
    .unwrap();

    assert_eq!(db.fetch(b"shared").unwrap().unwrap().len(), 400);
    assert_eq!(db.check().unwrap().live_records, 401);
    assert_conserved(&db);
}

//! Tests for traversal
//!
//! These tests verify:
//! - Every live record is visited exactly once
//! - Callbacks may mutate the database, including the current record
//! - Nested traversals and the first/next key cursor
//! - Records of exited owners are hidden and reclaimed

use std::collections::HashSet;
use std::process::Command;

use tdbkv::{Config, Database, StoreMode, TraverseControl};
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

fn setup_filled_db(n: u32) -> (TempDir, Database) {
    let temp_dir = TempDir::new().unwrap();
    let db = Database::open(Config::for_path(temp_dir.path().join("walk.tdb"))).unwrap();
    for i in 0..n {
        db.store(format!("key{}", i).as_bytes(), &i.to_le_bytes(), StoreMode::Insert)
            .unwrap();
    }
    (temp_dir, db)
}

fn all_keys(db: &Database) -> HashSet<Vec<u8>> {
    let mut keys = HashSet::new();
    db.traverse(|k, _| {
        assert!(keys.insert(k.to_vec()), "key visited twice");
        TraverseControl::Continue
    })
    .unwrap();
    keys
}

/// Pid of a process that has already exited
fn dead_pid() -> u32 {
    let mut child = Command::new("true").spawn().unwrap();
    let pid = child.id();
    child.wait().unwrap();
    pid
}

// =============================================================================
// Basic Traversal Tests
// =============================================================================

#[test]
fn test_traverse_empty() {
    let (_temp, db) = setup_filled_db(0);

    assert_eq!(db.traverse(|_, _| TraverseControl::Continue).unwrap(), 0);
    assert_eq!(db.first_key().unwrap(), None);
}

#[test]
fn test_traverse_visits_everything_once() {
    let (_temp, db) = setup_filled_db(300);

    let keys = all_keys(&db);

    assert_eq!(keys.len(), 300);
    assert!(keys.contains(&b"key123".to_vec()));
}

#[test]
fn test_traverse_hands_out_values() {
    let (_temp, db) = setup_filled_db(50);

    db.traverse(|k, v| {
        let i: u32 = std::str::from_utf8(&k[3..]).unwrap().parse().unwrap();
        assert_eq!(v, &i.to_le_bytes()[..]);
        TraverseControl::Continue
    })
    .unwrap();
}

#[test]
fn test_traverse_stop() {
    let (_temp, db) = setup_filled_db(100);

    let mut seen = 0;
    let count = db
        .traverse(|_, _| {
            seen += 1;
            if seen == 10 {
                TraverseControl::Stop
            } else {
                TraverseControl::Continue
            }
        })
        .unwrap();

    assert_eq!(count, 10);
    // the stopped cursor must not pin anything
    db.delete(b"key0").unwrap();
    assert!(db.check().unwrap().is_conserved());
}

// =============================================================================
// Mutation During Traversal Tests
// =============================================================================

#[test]
fn test_delete_current_record_in_callback() {
    let (_temp, db) = setup_filled_db(200);

    let count = db
        .traverse(|k, _| {
            db.delete(k).unwrap();
            TraverseControl::Continue
        })
        .unwrap();

    assert_eq!(count, 200);
    let report = db.check().unwrap();
    assert_eq!(report.live_records, 0);
    assert!(report.is_conserved());

    // a later pass reclaims the tombstones left behind
    assert_eq!(db.traverse(|_, _| TraverseControl::Continue).unwrap(), 0);
    let report = db.check().unwrap();
    assert_eq!(report.dead_records, 0);
    assert!(report.is_conserved());
}

#[test]
fn test_delete_other_records_in_callback() {
    let (_temp, db) = setup_filled_db(100);

    let mut visited = HashSet::new();
    let mut gone = HashSet::new();
    db.traverse(|k, _| {
        visited.insert(k.to_vec());
        let victim = (0..100)
            .map(|i| format!("key{}", i).into_bytes())
            .find(|other| !visited.contains(other) && !gone.contains(other));
        if let Some(victim) = victim {
            db.delete(&victim).unwrap();
            gone.insert(victim);
        }
        TraverseControl::Continue
    })
    .unwrap();

    assert_eq!(visited.len() + gone.len(), 100);
    assert!(visited.is_disjoint(&gone));
    assert_eq!(all_keys(&db), visited);
}

#[test]
fn test_store_in_callback() {
    let (_temp, db) = setup_filled_db(50);

    let mut originals = 0;
    db.traverse(|k, v| {
        if k.starts_with(b"key") {
            originals += 1;
            let mut copy = b"copy".to_vec();
            copy.extend_from_slice(k);
            db.store(&copy, v, StoreMode::Replace).unwrap();
            db.store(k, b"rewritten with a longer value", StoreMode::Replace).unwrap();
        }
        TraverseControl::Continue
    })
    .unwrap();

    assert_eq!(originals, 50);
    assert_eq!(all_keys(&db).len(), 100);
    assert!(db.check().unwrap().is_conserved());
}

#[test]
fn test_nested_traversal() {
    let (_temp, db) = setup_filled_db(20);

    let mut outer = 0;
    db.traverse(|_, _| {
        outer += 1;
        if outer == 5 {
            assert_eq!(db.traverse(|_, _| TraverseControl::Continue).unwrap(), 20);
        }
        TraverseControl::Continue
    })
    .unwrap();

    assert_eq!(outer, 20);
}

#[test]
fn test_concurrent_delete_while_traversing() {
    let (_temp, db) = setup_filled_db(400);

    crossbeam::thread::scope(|s| {
        s.spawn(|_| {
            db.traverse(|_, _| TraverseControl::Continue).unwrap();
        });
        s.spawn(|_| {
            for i in (0..400).step_by(2) {
                db.delete(format!("key{}", i).as_bytes()).unwrap();
            }
        });
    })
    .unwrap();

    assert_eq!(all_keys(&db).len(), 200);
    assert!(db.check().unwrap().is_conserved());
}

// =============================================================================
// Key Cursor Tests
// =============================================================================

#[test]
fn test_first_next_key_walk() {
    let (_temp, db) = setup_filled_db(120);

    let mut keys = HashSet::new();
    let mut key = db.first_key().unwrap();
    while let Some(k) = key {
        assert!(keys.insert(k.to_vec()));
        key = db.next_key(&k).unwrap();
    }

    assert_eq!(keys, all_keys(&db));
}

#[test]
fn test_keys_iterator() {
    let (_temp, db) = setup_filled_db(60);

    let keys: HashSet<Vec<u8>> = db.keys().map(|k| k.unwrap().to_vec()).collect();

    assert_eq!(keys.len(), 60);
}

#[test]
fn test_key_walk_deleting_as_it_goes() {
    let (_temp, db) = setup_filled_db(80);

    let mut deleted = 0;
    let mut key = db.first_key().unwrap();
    while let Some(k) = key {
        db.delete(&k).unwrap();
        deleted += 1;
        key = db.next_key(&k).unwrap();
    }

    assert_eq!(deleted, 80);
    assert_eq!(db.traverse(|_, _| TraverseControl::Continue).unwrap(), 0);
    assert!(db.check().unwrap().is_conserved());
}

#[test]
fn test_next_key_of_unknown_key() {
    let (_temp, db) = setup_filled_db(5);

    assert_eq!(db.next_key(b"not a key").unwrap(), None);
}

// =============================================================================
// Owner Liveness Tests
// =============================================================================

#[test]
fn test_records_of_exited_owners_are_hidden() {
    let temp_dir = TempDir::new().unwrap();
    let db = Database::open(Config::for_path(temp_dir.path().join("owners.tdb"))).unwrap();
    let gone = dead_pid();
    let alive = std::process::id();

    db.store(b"mine", &alive.to_le_bytes(), StoreMode::Insert).unwrap();
    db.store(b"orphan", &gone.to_le_bytes(), StoreMode::Insert).unwrap();
    db.set_owner_probe(|_: &[u8], value: &[u8]| value.try_into().ok().map(u32::from_le_bytes));

    assert!(db.exists(b"mine").unwrap());
    assert_eq!(db.fetch(b"orphan").unwrap(), None);
    assert_eq!(all_keys(&db), HashSet::from([b"mine".to_vec()]));

    // reaped on the way, so the space is free again
    db.clear_owner_probe();
    assert_eq!(db.fetch(b"orphan").unwrap(), None);
    assert_eq!(db.check().unwrap().live_records, 1);
}

#[test]
fn test_read_only_traversal() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("ro.tdb");
    {
        let db = Database::open_path(&path).unwrap();
        for i in 0..30u32 {
            db.store(&i.to_le_bytes(), b"v", StoreMode::Insert).unwrap();
        }
    }

    let db = Database::open(Config::builder().path(&path).read_only(true).build()).unwrap();

    assert_eq!(db.traverse(|_, _| TraverseControl::Continue).unwrap(), 30);
    assert_eq!(db.keys().count(), 30);
}

//! Tests for multi-process locking
//!
//! These tests verify:
//! - Chain locks serialize writers in different processes
//! - Lock waits honor timeouts and cancellation
//! - Clear-if-first only wipes a database nobody else has open
//! - A record under a traversal survives deletion by another process

use std::io::{BufRead, BufReader};
use std::path::Path;
use std::process::{Child, Command, Output, Stdio};
use std::thread;
use std::time::Duration;

use tdbkv::{CancelToken, Config, Database, ErrorKind, StoreMode, TdbError, TraverseControl};
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

fn tdbtool(args: &[&str]) -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_tdbtool"));
    cmd.args(args);
    cmd
}

fn run_tool(path: &Path, args: &[&str]) -> Output {
    let mut all = vec![path.to_str().unwrap()];
    all.extend_from_slice(args);
    tdbtool(&all).output().unwrap()
}

fn create_db(temp_dir: &TempDir, name: &str) -> std::path::PathBuf {
    let path = temp_dir.path().join(name);
    Database::open_path(&path).unwrap().close().unwrap();
    path
}

/// Start a child holding every chain lock; returns once the locks are held
fn spawn_holder(path: &Path, millis: u64) -> Child {
    let mut child = tdbtool(&[
        path.to_str().unwrap(),
        "hold",
        "--millis",
        &millis.to_string(),
    ])
    .stdout(Stdio::piped())
    .spawn()
    .unwrap();

    let mut line = String::new();
    BufReader::new(child.stdout.as_mut().unwrap())
        .read_line(&mut line)
        .unwrap();
    assert_eq!(line.trim(), "locked");
    child
}

// =============================================================================
// Cross-Process Writer Tests
// =============================================================================

#[test]
fn test_concurrent_appends_from_processes() {
    let temp_dir = TempDir::new().unwrap();
    let path = create_db(&temp_dir, "append.tdb");

    let letters = "abcdefghijkl";
    let children: Vec<Child> = letters
        .chars()
        .map(|c| {
            tdbtool(&[path.to_str().unwrap(), "append", "shared", &c.to_string()])
                .spawn()
                .unwrap()
        })
        .collect();
    for mut child in children {
        assert!(child.wait().unwrap().success());
    }

    let db = Database::open_path(&path).unwrap();
    let mut value = db.fetch(b"shared").unwrap().unwrap().to_vec();
    value.sort_unstable();
    assert_eq!(value, letters.as_bytes());
    assert!(db.check().unwrap().is_conserved());
}

#[test]
fn test_processes_and_threads_mix() {
    let temp_dir = TempDir::new().unwrap();
    let path = create_db(&temp_dir, "mix.tdb");
    let db = Database::open_path(&path).unwrap();

    crossbeam::thread::scope(|s| {
        s.spawn(|_| {
            for i in 0..20 {
                let out = run_tool(&path, &["insert", &format!("child{}", i), "v"]);
                assert!(out.status.success());
            }
        });
        s.spawn(|_| {
            for i in 0..200u32 {
                db.store(format!("parent{}", i).as_bytes(), b"v", StoreMode::Insert)
                    .unwrap();
            }
        });
    })
    .unwrap();

    let report = db.check().unwrap();
    assert_eq!(report.live_records, 220);
    assert!(report.is_conserved());
}

// =============================================================================
// Wait Policy Tests
// =============================================================================

#[test]
fn test_lock_timeout() {
    let temp_dir = TempDir::new().unwrap();
    let path = create_db(&temp_dir, "timeout.tdb");
    let mut holder = spawn_holder(&path, 3000);

    let db = Database::open(
        Config::builder()
            .path(&path)
            .lock_timeout(Duration::from_millis(100))
            .build(),
    )
    .unwrap();

    let err = db.store(b"k", b"v", StoreMode::Insert).unwrap_err();
    assert!(matches!(err, TdbError::LockTimeout));
    assert_eq!(db.last_error(), ErrorKind::LockTimeout);
    assert_eq!(db.error_string(), "Lock timeout");

    assert!(matches!(db.lock_all(), Err(TdbError::NoLockOnSomeChains)));

    assert!(holder.wait().unwrap().success());
    db.store(b"k", b"v", StoreMode::Insert).unwrap();
}

#[test]
fn test_cancel_token_interrupts_wait() {
    let temp_dir = TempDir::new().unwrap();
    let path = create_db(&temp_dir, "cancel.tdb");
    let mut holder = spawn_holder(&path, 3000);

    let token = CancelToken::new();
    let db = Database::open(
        Config::builder()
            .path(&path)
            .cancel_token(token.clone())
            .build(),
    )
    .unwrap();

    let canceller = {
        let token = token.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(100));
            token.cancel();
        })
    };
    let result = db.fetch(b"k");
    canceller.join().unwrap();

    assert!(matches!(result, Err(TdbError::LockTimeout)));
    holder.kill().ok();
    holder.wait().unwrap();
}

#[test]
fn test_chain_lock_blocks_other_process() {
    let temp_dir = TempDir::new().unwrap();
    let path = create_db(&temp_dir, "chain.tdb");
    let db = Database::open_path(&path).unwrap();

    db.lock_chain(b"k").unwrap();
    let blocked = tdbtool(&["--timeout-ms", "100", path.to_str().unwrap(), "store", "k", "v"])
        .output()
        .unwrap();
    assert!(!blocked.status.success());

    db.unlock_chain(b"k").unwrap();
    assert!(run_tool(&path, &["store", "k", "v"]).status.success());
    assert_eq!(db.fetch(b"k").unwrap().as_deref(), Some(&b"v"[..]));
}

#[test]
fn test_read_lock_admits_readers_only() {
    let temp_dir = TempDir::new().unwrap();
    let path = create_db(&temp_dir, "read.tdb");
    let db = Database::open_path(&path).unwrap();
    db.store(b"k", b"v", StoreMode::Insert).unwrap();

    db.lock_chain_read(b"k").unwrap();
    let read = tdbtool(&["--timeout-ms", "100", path.to_str().unwrap(), "show", "k"])
        .output()
        .unwrap();
    let write = tdbtool(&["--timeout-ms", "100", path.to_str().unwrap(), "delete", "k"])
        .output()
        .unwrap();
    db.unlock_chain_read(b"k").unwrap();

    assert!(read.status.success());
    assert_eq!(String::from_utf8_lossy(&read.stdout).trim(), "v");
    assert!(!write.status.success());
    assert!(db.exists(b"k").unwrap());
}

// =============================================================================
// Clear-If-First Tests
// =============================================================================

#[test]
fn test_clear_if_first_spares_database_in_use() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("cif.tdb");
    let db = Database::open(Config::builder().path(&path).clear_if_first(true).build()).unwrap();
    db.store(b"k", b"v", StoreMode::Insert).unwrap();

    let out = run_tool(&path, &["--clear-if-first", "show", "k"]);
    assert!(out.status.success());
    assert_eq!(String::from_utf8_lossy(&out.stdout).trim(), "v");

    drop(db);
    let out = tdbtool(&["--clear-if-first", path.to_str().unwrap(), "show", "k"])
        .output()
        .unwrap();
    assert!(!out.status.success());
}

// =============================================================================
// Record Lock Tests
// =============================================================================

#[test]
fn test_record_under_traversal_is_tombstoned() {
    let temp_dir = TempDir::new().unwrap();
    let path = create_db(&temp_dir, "pinned.tdb");
    let db = Database::open_path(&path).unwrap();
    db.store(b"pinned", b"v", StoreMode::Insert).unwrap();

    db.traverse(|key, _| {
        assert_eq!(key, b"pinned");
        assert!(run_tool(&path, &["delete", "pinned"]).status.success());
        TraverseControl::Continue
    })
    .unwrap();

    assert_eq!(db.fetch(b"pinned").unwrap(), None);
    let report = db.check().unwrap();
    assert_eq!(report.dead_records, 1);
    assert!(report.is_conserved());

    // the next pass reclaims it
    db.traverse(|_, _| TraverseControl::Continue).unwrap();
    assert_eq!(db.check().unwrap().dead_records, 0);
}

//! tdbbackup
//!
//! Copies databases to `<file><suffix>` by walking every record into a
//! fresh database, so the copy is consistent even while other processes
//! use the original. With `-v` each database is verified instead, and
//! restored from its backup when it is damaged.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::Parser;
use tdbkv::{Config, Database, Digest, StoreMode, TdbError, TraverseControl};
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

/// Back up or verify tdbkv databases
#[derive(Parser, Debug)]
#[command(name = "tdbbackup")]
#[command(about = "Back up tdbkv databases, or verify and restore them")]
#[command(version)]
struct Args {
    /// Suffix appended to backup file names
    #[arg(short, long, default_value = ".bak")]
    suffix: String,

    /// Verify each database, restoring it from its backup if damaged
    #[arg(short, long)]
    verify: bool,

    /// Bucket count for new backups (0 = same as the source)
    #[arg(short = 'n', long, default_value = "0")]
    hash_size: u32,

    /// Databases to process
    #[arg(required = true)]
    files: Vec<PathBuf>,
}

fn main() -> ExitCode {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let mut failed = false;

    for file in &args.files {
        let backup = backup_name(file, &args.suffix);
        let result = if args.verify {
            verify(file, &backup, args.hash_size)
        } else {
            backup_database(file, &backup, args.hash_size).map(|_| ())
        };
        if let Err(e) = result {
            eprintln!("tdbbackup: {}: {}", file.display(), e);
            failed = true;
        }
    }

    if failed {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

fn backup_name(file: &Path, suffix: &str) -> PathBuf {
    let mut name = file.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

/// Copy `source` into a fresh database at `dest`, atomically replacing it
fn backup_database(source: &Path, dest: &Path, hash_size: u32) -> tdbkv::Result<Digest> {
    let src = Database::open(Config::builder().path(source).create(false).build())?;
    let tmp = backup_name(dest, ".tmp");
    let hash_size = if hash_size == 0 { src.hash_size() } else { hash_size };

    // no writer may slip in between the copy and its digest
    src.lock_all()?;
    let copied = copy_records(&src, &tmp, hash_size);
    let unlocked = src.unlock_all();
    let digest = match copied.and_then(|d| unlocked.map(|_| d)) {
        Ok(digest) => digest,
        Err(e) => {
            let _ = fs::remove_file(&tmp);
            return Err(e);
        }
    };

    fs::rename(&tmp, dest)?;
    info!(source = %source.display(), dest = %dest.display(), records = digest.records, "backup written");
    Ok(digest)
}

fn copy_records(src: &Database, tmp: &Path, hash_size: u32) -> tdbkv::Result<Digest> {
    let dst = Database::open(
        Config::builder()
            .path(tmp)
            .hash_size(hash_size)
            .truncate(true)
            .no_lock(true)
            .build(),
    )?;

    let mut failed = None;
    src.traverse(|key, value| match dst.store(key, value, StoreMode::Insert) {
        Ok(()) => TraverseControl::Continue,
        Err(e) => {
            failed = Some(e);
            TraverseControl::Stop
        }
    })?;
    if let Some(e) = failed {
        return Err(e);
    }

    let expected = src.digest()?;
    let written = dst.digest()?;
    if expected != written {
        return Err(TdbError::Corrupt(format!(
            "copy differs from source ({} records copied, {} expected)",
            written.records, expected.records
        )));
    }
    dst.close()?;
    Ok(written)
}

/// Check `file`; if it is damaged, replace it with its backup
fn verify(file: &Path, backup: &Path, hash_size: u32) -> tdbkv::Result<()> {
    let healthy = match Database::open(Config::builder().path(file).create(false).build()) {
        Ok(db) => db.check().and_then(|_| db.digest()).map(|_| ()),
        Err(e) => Err(e),
    };

    match healthy {
        Ok(()) => {
            println!("{}: ok", file.display());
            Ok(())
        }
        Err(e) => {
            warn!(file = %file.display(), error = %e, "verification failed, restoring");
            backup_database(backup, file, hash_size)?;
            println!("{}: restored from {}", file.display(), backup.display());
            Ok(())
        }
    }
}

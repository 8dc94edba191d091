//! tdbtool
//!
//! Command-line access to a database file: inspect it, edit records, walk
//! its keys, or hold its locks (handy when poking at another process's behavior).

use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tdbkv::{Config, Database, StoreMode, TraverseControl};
use tracing_subscriber::{fmt, EnvFilter};

/// tdbkv database tool
#[derive(Parser, Debug)]
#[command(name = "tdbtool")]
#[command(about = "Inspect and edit a tdbkv database")]
#[command(version)]
struct Args {
    /// Database file
    file: PathBuf,

    /// Bucket count when creating the database
    #[arg(long, default_value = "0")]
    hash_size: u32,

    /// Skip byte-range locking
    #[arg(long)]
    no_lock: bool,

    /// Wipe the database if no other process has it open
    #[arg(long)]
    clear_if_first: bool,

    /// Give up on a lock after this many milliseconds
    #[arg(long)]
    timeout_ms: Option<u64>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create the database if it does not exist
    Create,

    /// Print header details and a space report
    Info,

    /// Print every non-empty hash chain
    Dump,

    /// Print every record
    List,

    /// Print the free list
    Free,

    /// Print one value
    Show { key: String },

    /// Add a record; fails if the key exists
    Insert { key: String, value: String },

    /// Add or replace a record
    Store { key: String, value: String },

    /// Append to a record's value
    Append { key: String, value: String },

    /// Remove a record
    Delete { key: String },

    /// Print every key via first/next
    Keys,

    /// Print the first key in hash order
    First,

    /// Print the key following `key` in hash order
    Next { key: String },

    /// Delete every record
    Erase,

    /// Lock the whole database, hold it, then release
    Hold {
        #[arg(long, default_value = "1000")]
        millis: u64,
    },
}

fn main() -> ExitCode {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let mut builder = Config::builder()
        .path(&args.file)
        .hash_size(args.hash_size)
        .no_lock(args.no_lock)
        .clear_if_first(args.clear_if_first);
    if let Some(ms) = args.timeout_ms {
        builder = builder.lock_timeout(Duration::from_millis(ms));
    }

    let db = match Database::open(builder.build()) {
        Ok(db) => db,
        Err(e) => {
            eprintln!("tdbtool: cannot open {}: {}", args.file.display(), e);
            return ExitCode::FAILURE;
        }
    };

    match run(&db, args.command) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("tdbtool: {} ({})", e, db.error_string());
            ExitCode::FAILURE
        }
    }
}

fn run(db: &Database, command: Commands) -> tdbkv::Result<()> {
    match command {
        Commands::Create => Ok(()),
        Commands::Info => {
            let report = db.check()?;
            println!("hash size:   {}", db.hash_size());
            println!("file size:   {}", report.file_size);
            println!("byte order:  {}", if db.is_big_endian() { "big" } else { "little" });
            println!("converting:  {}", db.is_converting());
            println!("live:        {} records, {} bytes", report.live_records, report.live_bytes);
            println!("dead:        {} records, {} bytes", report.dead_records, report.dead_bytes);
            println!("free:        {} records, {} bytes", report.free_records, report.free_bytes);
            Ok(())
        }
        Commands::Dump => {
            for bucket in 0..db.hash_size() {
                let chain = db.dump_chain(bucket)?;
                if chain.is_empty() {
                    continue;
                }
                println!("hash={}", bucket);
                for entry in chain {
                    let h = entry.header;
                    println!(
                        "  rec: offset={} next={} rec_len={} key_len={} data_len={} full_hash=0x{:x} magic=0x{:x}{}",
                        entry.offset,
                        h.next,
                        h.rec_len,
                        h.key_len,
                        h.data_len,
                        h.full_hash,
                        h.magic,
                        if entry.tailer_ok { "" } else { " BAD TAILER" }
                    );
                }
            }
            Ok(())
        }
        Commands::List => {
            db.traverse(|key, value| {
                println!("{} = {}", String::from_utf8_lossy(key), String::from_utf8_lossy(value));
                TraverseControl::Continue
            })?;
            Ok(())
        }
        Commands::Free => {
            let free = db.freelist()?;
            let total: u64 = free.iter().map(|e| e.rec_len as u64).sum();
            for entry in &free {
                println!("free: offset={} rec_len={}", entry.offset, entry.rec_len);
            }
            println!("{} free records, {} bytes", free.len(), total);
            Ok(())
        }
        Commands::Show { key } => match db.fetch(key.as_bytes())? {
            Some(value) => {
                println!("{}", String::from_utf8_lossy(&value));
                Ok(())
            }
            None => Err(tdbkv::TdbError::RecordNotFound),
        },
        Commands::Insert { key, value } => db.store(key.as_bytes(), value.as_bytes(), StoreMode::Insert),
        Commands::Store { key, value } => db.store(key.as_bytes(), value.as_bytes(), StoreMode::Replace),
        Commands::Append { key, value } => db.append(key.as_bytes(), value.as_bytes()),
        Commands::Delete { key } => db.delete(key.as_bytes()),
        Commands::Keys => {
            for key in db.keys() {
                println!("{}", String::from_utf8_lossy(&key?));
            }
            Ok(())
        }
        Commands::First => print_key(db.first_key()?),
        Commands::Next { key } => print_key(db.next_key(key.as_bytes())?),
        Commands::Erase => {
            let mut failed = None;
            db.traverse(|key, _| match db.delete(key) {
                Ok(()) => TraverseControl::Continue,
                Err(e) => {
                    failed = Some(e);
                    TraverseControl::Stop
                }
            })?;
            failed.map_or(Ok(()), Err)
        }
        Commands::Hold { millis } => {
            db.lock_all()?;
            println!("locked");
            std::io::stdout().flush()?;
            std::thread::sleep(Duration::from_millis(millis));
            db.unlock_all()
        }
    }
}

fn print_key(key: Option<bytes::Bytes>) -> tdbkv::Result<()> {
    match key {
        Some(key) => {
            println!("{}", String::from_utf8_lossy(&key));
            Ok(())
        }
        None => Err(tdbkv::TdbError::RecordNotFound),
    }
}

//! StrataKV Admin Binary
//!
//! Opens a database directory and inspects or maintains it.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use stratakv::{Engine, Options, ReadOptions};
use tracing_subscriber::{fmt, EnvFilter};

/// StrataKV Admin
#[derive(Parser, Debug)]
#[command(name = "stratakv-admin")]
#[command(about = "Inspect and maintain a StrataKV database")]
#[command(version)]
struct Args {
    /// Database directory
    db: PathBuf,

    /// Create the database if it does not exist
    #[arg(long)]
    create: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print per-level compaction statistics
    Stats,

    /// List the tables of every level
    Sstables,

    /// Compact the whole key space
    Compact,

    /// Check that no sorted level holds overlapping tables
    Verify,

    /// Print the value stored under a key
    Get {
        /// The key to look up
        key: String,
    },
}

fn main() {
    // Initialize tracing/logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,stratakv=debug"));

    fmt().with_env_filter(filter).with_target(true).with_thread_ids(true).init();

    let args = Args::parse();
    tracing::info!("StrataKV Admin v{}", stratakv::VERSION);

    let options = Options::builder().create_if_missing(args.create).build();
    let engine = match Engine::open(options, &args.db) {
        Ok(engine) => engine,
        Err(e) => {
            tracing::error!("Failed to open {}: {}", args.db.display(), e);
            std::process::exit(1);
        }
    };

    let result = match args.command {
        Commands::Stats => {
            print_property(&engine, "stratakv.stats");
            print_property(&engine, "stratakv.total-bytes");
            print_property(&engine, "stratakv.write-penalty");
            Ok(())
        }
        Commands::Sstables => {
            print_property(&engine, "stratakv.sstables");
            Ok(())
        }
        Commands::Compact => engine.compact_range(None, None).map(|()| {
            println!("Compaction finished");
            print_property(&engine, "stratakv.sstables");
        }),
        Commands::Verify => engine.verify_levels().map(|()| println!("OK")),
        Commands::Get { key } => engine.get(&ReadOptions::default(), key.as_bytes()).map(|value| match value {
            Some(value) => println!("{}", String::from_utf8_lossy(&value)),
            None => println!("(not found)"),
        }),
    };

    let closed = engine.close();
    if let Err(e) = result.and(closed) {
        tracing::error!("{}", e);
        std::process::exit(1);
    }
}

fn print_property(engine: &Engine, name: &str) {
    if let Some(value) = engine.property(name) {
        println!("{}:\n{}", name, value.trim_end());
    }
}

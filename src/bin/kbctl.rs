// bin/kbctl.rs - KB Inspection Tool
//
// Read-only operational CLI straight against the KB persistence, no bus.
//
//   kbctl --db ./data/kb.sqlite get --key session:sess-123:chat:timeline:main
//   kbctl --db ./data/kb.sqlite dump --session sess-123

use anyhow::Result;
use clap::{Parser, Subcommand};
use serde_json::json;
use std::path::PathBuf;

use mas_platform::kb::{KbStore, StoreError};

/// KB Inspection Tool
#[derive(Parser, Debug)]
#[command(name = "kbctl")]
#[command(author = "SavageS")]
#[command(version)]
#[command(about = "Read-only Knowledge Base inspector", long_about = None)]
struct Args {
    /// Path to the KB sqlite database
    #[arg(long)]
    db: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the latest (or an explicit) version of a key as JSON
    Get {
        /// Full 5-segment key
        #[arg(long)]
        key: String,

        /// Explicit version instead of the latest
        #[arg(long)]
        version: Option<i64>,
    },

    /// Print `key vN etag @ ISO8601` lines for a session
    Dump {
        /// Session id
        #[arg(long)]
        session: String,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();
    let store = KbStore::open(&args.db)?;

    match args.command {
        Commands::Get { key, version } => match store.get_sync(&key, version, None) {
            Ok(item) => {
                let out = json!({
                    "key": item.key,
                    "version": item.version,
                    "etag": item.etag,
                    "content_type": item.content_type,
                    "stored_at": item.created_at,
                    "value": item.value,
                });
                println!("{}", serde_json::to_string_pretty(&out)?);
            }
            Err(StoreError::NotFound(_)) => {
                eprintln!("NOT_FOUND");
                std::process::exit(2);
            }
            Err(e) => return Err(e.into()),
        },
        Commands::Dump { session } => {
            for (key, version, etag, created_at) in store.dump_session_sync(&session)? {
                println!("{key} v{version} etag={etag} @ {created_at}");
            }
        }
    }
    Ok(())
}

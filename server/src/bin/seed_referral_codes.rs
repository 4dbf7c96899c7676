//! Create platform referral codes.
//!
//! Usage: cargo run --bin seed-referral-codes -- --count 5 --sqlite-path odds.db
//!
//! Explicit `--code` values are inserted as given; otherwise `--count` random
//! codes are generated. Existing codes are left untouched.

use anyhow::{Context, Result};
use clap::Parser;
use odds_server::services::referral::generate_platform_codes;
use odds_server::services::ReferralService;
use odds_server::store::Store;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "seed-referral-codes")]
#[command(about = "Create platform referral codes")]
struct Args {
    /// Number of random codes to generate when no --code is given
    #[arg(short, long, default_value_t = 1)]
    count: usize,

    /// Explicit code to create (repeatable)
    #[arg(long = "code")]
    codes: Vec<String>,

    /// Postgres connection string (falls back to DATABASE_URL)
    #[arg(long)]
    database_url: Option<String>,

    /// SQLite database path, used when no Postgres URL is set
    #[arg(long, default_value = "odds.db")]
    sqlite_path: PathBuf,

    /// Allow Postgres hosts outside private networks
    #[arg(long, default_value_t = false)]
    database_allow_public: bool,

    /// Allow Postgres hostnames that are not IP literals
    #[arg(long, default_value_t = false)]
    database_allow_hostname: bool,
}

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        eprintln!("seed-referral-codes failed: {err:#}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let args = Args::parse();

    let database_url = args
        .database_url
        .clone()
        .or_else(|| std::env::var("DATABASE_URL").ok())
        .filter(|url| !url.trim().is_empty());
    let store = match database_url {
        Some(url) => {
            let (allow_public, allow_hostname) =
                (args.database_allow_public, args.database_allow_hostname);
            tokio::task::spawn_blocking(move || {
                Store::connect_postgres(&url, allow_public, allow_hostname)
            })
            .await
            .context("postgres connect task failed")?
            .context("failed to connect to postgres")?
        }
        None => Store::open_sqlite(&args.sqlite_path).with_context(|| {
            format!("failed to open sqlite database {}", args.sqlite_path.display())
        })?,
    };

    let codes = if args.codes.is_empty() {
        if args.count == 0 {
            anyhow::bail!("--count must be > 0");
        }
        generate_platform_codes(args.count)
    } else {
        args.codes
    };

    let service = ReferralService::new(store, 0);
    let created = service
        .create_platform_codes(codes)
        .await
        .context("failed to create platform referral codes")?;

    println!("Platform referral codes:");
    for code in created {
        println!("  {}", code.code);
    }
    Ok(())
}

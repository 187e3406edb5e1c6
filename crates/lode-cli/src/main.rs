//! lode command-line interface
//!
//! Opens a store directory through the dispatcher and runs one command
//! against it.
//!
//! # Usage
//!
//! ```bash
//! # Write and read a key
//! lode --path /tmp/store put greeting hello --sync
//! lode --path /tmp/store get greeting
//!
//! # Scan a range in batches of 10
//! lode --path /tmp/store scan --gte a --lt m --batch 10
//!
//! # Use a configuration file
//! lode --config lode.toml --path /tmp/store stats
//! ```

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use clap::{Args as ClapArgs, Parser, Subcommand};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use lode_common::{HandleId, LodeConfig};
use lode_core::{RangeBounds, ReplyChannel, RowSink, ScanEnd};
use lode_dispatch::{Dispatcher, Request};

/// lode store tool
#[derive(Parser, Debug)]
#[command(
    name = "lode",
    version,
    about = "Command-line access to lode stores",
    long_about = "Opens a lode store directory and runs a single command against it.\n\n\
                  Point reads and writes, range scans, and store statistics are supported."
)]
struct Args {
    /// Store directory
    #[arg(short = 'p', long, value_name = "DIR", env = "LODE_PATH")]
    path: PathBuf,

    /// Configuration file path
    #[arg(short = 'c', long, value_name = "FILE", env = "LODE_CONFIG")]
    config: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info", env = "LODE_LOG_LEVEL")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the value stored under KEY
    Get {
        /// Key to read
        key: String,
    },
    /// Store VALUE under KEY
    Put {
        /// Key to write
        key: String,
        /// Value to write
        value: String,
        /// Sync the write to disk before returning
        #[arg(long)]
        sync: bool,
    },
    /// Remove KEY
    Delete {
        /// Key to remove
        key: String,
    },
    /// Print every key/value pair in a range
    Scan(ScanArgs),
    /// Print store statistics
    Stats,
}

#[derive(ClapArgs, Debug)]
struct ScanArgs {
    /// Only keys strictly greater than K
    #[arg(long, value_name = "K", conflicts_with = "gte")]
    gt: Option<String>,

    /// Only keys greater than or equal to K
    #[arg(long, value_name = "K")]
    gte: Option<String>,

    /// Only keys strictly less than K
    #[arg(long, value_name = "K", conflicts_with = "lte")]
    lt: Option<String>,

    /// Only keys less than or equal to K
    #[arg(long, value_name = "K")]
    lte: Option<String>,

    /// Maximum number of rows (negative for no limit)
    #[arg(long, default_value_t = -1, allow_negative_numbers = true)]
    limit: i64,

    /// Rows requested per pull
    #[arg(long, default_value_t = lode_common::DEFAULT_PULL_BATCH)]
    batch: u32,
}

impl ScanArgs {
    fn bounds(&self) -> RangeBounds {
        let mut bounds = RangeBounds::all().with_limit(self.limit);
        if let Some(key) = &self.gt {
            bounds = bounds.gt(key.clone());
        } else if let Some(key) = &self.gte {
            bounds = bounds.gte(key.clone());
        }
        if let Some(key) = &self.lt {
            bounds = bounds.lt(key.clone());
        } else if let Some(key) = &self.lte {
            bounds = bounds.lte(key.clone());
        }
        bounds
    }
}

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run() -> Result<()> {
    let args = Args::parse();

    init_logging(&args.log_level);

    let config = load_config(&args)?;
    let dispatcher = Dispatcher::from_config(&config);
    let handle = open(&dispatcher, &args)?;

    let result = execute(&dispatcher, handle, &args.command);

    dispatcher
        .close(handle)
        .with_context(|| format!("Failed to close {}", args.path.display()))?;
    result
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| {
            EnvFilter::try_new(format!(
                "lode_cli={level},lode_dispatch={level},lode_core={level},lode_engine={level}"
            ))
        })
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .without_time()
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(args: &Args) -> Result<LodeConfig> {
    match &args.config {
        Some(path) => LodeConfig::from_file(path)
            .with_context(|| format!("Failed to load config file {}", path.display())),
        None => Ok(LodeConfig::default()),
    }
}

fn open(dispatcher: &Dispatcher, args: &Args) -> Result<HandleId> {
    let (reply, rx) = ReplyChannel::oneshot();
    dispatcher.dispatch(Request::Open {
        identity: dispatcher.identity(&args.path),
        shared: true,
        reply,
    });
    let handle = rx
        .blocking_recv()
        .context("Open was abandoned")?
        .with_context(|| format!("Failed to open {}", args.path.display()))?;
    debug!(%handle, path = %args.path.display(), "store opened");
    Ok(handle)
}

fn execute(dispatcher: &Dispatcher, handle: HandleId, command: &Command) -> Result<()> {
    match command {
        Command::Get { key } => {
            match dispatcher.get(handle, key.as_bytes()).context("Get failed")? {
                Some(value) => println!("{}", String::from_utf8_lossy(&value)),
                None => println!("(not found)"),
            }
        }
        Command::Put { key, value, sync } => {
            dispatcher
                .put(handle, key.as_bytes(), value.as_bytes(), *sync)
                .context("Put failed")?;
            info!(key = %key, sync = *sync, "stored");
        }
        Command::Delete { key } => {
            dispatcher
                .delete(handle, key.as_bytes())
                .context("Delete failed")?;
            info!(key = %key, "deleted");
        }
        Command::Scan(scan) => {
            let rows = run_scan(dispatcher, handle, scan)?;
            info!(rows, "scan complete");
        }
        Command::Stats => {
            let keys = dispatcher.key_count(handle).context("Stats failed")?;
            println!("keys: {}", keys);
        }
    }
    Ok(())
}

/// Pulls the range in batches, printing rows as they arrive.
fn run_scan(dispatcher: &Dispatcher, handle: HandleId, scan: &ScanArgs) -> Result<u64> {
    if scan.batch == 0 {
        bail!("--batch must be at least 1");
    }
    let cursor = dispatcher
        .new_cursor(handle, scan.bounds())
        .context("Failed to create cursor")?;

    let mut total = 0u64;
    let outcome = loop {
        let (sink, stream) = RowSink::channel();
        dispatcher.pull_rows(cursor, scan.batch, sink);
        let (rows, end) = stream.collect_blocking();
        for (key, value) in &rows {
            println!("{}\t{}", lossy(key), lossy(value));
        }
        total += rows.len() as u64;
        if !end.has_more() {
            break end;
        }
    };
    dispatcher.forget_cursor(cursor);

    match outcome {
        ScanEnd::ExhaustedRange | ScanEnd::QuotaReached => Ok(total),
        ScanEnd::Closed => bail!("Scan interrupted after {} rows", total),
        ScanEnd::Failed(kind) => bail!("Scan failed after {} rows: {}", total, kind),
    }
}

fn lossy(bytes: &Bytes) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

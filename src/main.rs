//! Firmup device service: hosts the upgrade command router on a
//! line-oriented TCP transport.

use anyhow::Result;
use clap::Parser;
use firmup::config::UpgradeConfig;
use firmup::logger::{JsonLogger, NoopLogger, TextLogger, UpgradeLogger};
use firmup::net;
use firmup::router::CommandRouter;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Staged OTA firmware upgrade service for sensor expansion boards"
)]
struct Args {
    /// Bind address for the command channel
    #[arg(long, default_value = "0.0.0.0:9040")]
    bind: String,

    /// Device filesystem root (the live firmware tree)
    #[arg(long, default_value = ".")]
    root: PathBuf,

    /// Optional TOML config overriding roots, allow-list and thresholds
    #[arg(long)]
    config: Option<PathBuf>,

    /// Write upgrade event log entries to file
    #[arg(long = "log-file")]
    log_file: Option<PathBuf>,
}

fn main() -> Result<()> {
    ctrlc::set_handler(move || {
        eprintln!("\nInterrupted by user. Exiting (Ctrl-C)...");
        std::process::exit(130);
    })
    .expect("Error setting Ctrl-C handler");

    let args = Args::parse();

    let cfg = match &args.config {
        Some(path) => UpgradeConfig::load(path)?,
        None => UpgradeConfig::for_root(&args.root),
    };

    // Zero overhead on the chunk path with NoopLogger.
    let logger: Arc<dyn UpgradeLogger> = match &args.log_file {
        Some(p) if p.extension().is_some_and(|e| e == "jsonl") => match JsonLogger::new(p) {
            Ok(l) => Arc::new(l),
            Err(e) => {
                eprintln!("cannot open log file {}: {e}; logging disabled", p.display());
                Arc::new(NoopLogger)
            }
        },
        Some(p) => match TextLogger::new(p) {
            Ok(l) => Arc::new(l),
            Err(e) => {
                eprintln!("cannot open log file {}: {e}; logging disabled", p.display());
                Arc::new(NoopLogger)
            }
        },
        None => Arc::new(NoopLogger),
    };

    let mut router = CommandRouter::new(cfg, logger);
    net::serve(&args.bind, &mut router)
}

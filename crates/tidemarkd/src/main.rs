//! tidemarkd — the Tidemark daemon.
//!
//! Keeps the indices behind every logical table rotated, aliased,
//! archived and pruned on a fixed interval.
//!
//! # Usage
//!
//! ```text
//! tidemarkd --config /etc/tidemark/tidemark.toml run
//! tidemarkd --config tidemark.toml rotate --table 2_bklog.demo --force
//! ```

mod daemon;

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use tidemark_core::TidemarkConfig;

use crate::daemon::{Daemon, summarize};

const DEFAULT_FILTER: &str = "info,tidemarkd=debug,tidemark=debug";

#[derive(Parser)]
#[command(name = "tidemarkd", about = "Tidemark index lifecycle daemon")]
struct Cli {
    /// Path to tidemark.toml.
    #[arg(long, short, default_value = "/etc/tidemark/tidemark.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the lifecycle loop until interrupted.
    Run {
        /// Seconds between cycles; overrides the config.
        #[arg(long)]
        interval: Option<u64>,
    },
    /// Run every stage for one table now.
    Rotate {
        #[arg(long)]
        table: String,

        /// Create a new index even if no trigger fires.
        #[arg(long)]
        force: bool,
    },
    /// Clean indices left on clusters a table moved away from.
    CleanHistory {
        #[arg(long)]
        table: Option<String>,
    },
    /// Move a table to another cluster.
    Migrate {
        #[arg(long)]
        table: String,

        #[arg(long)]
        cluster: u32,
    },
    /// Show the current index of a table.
    Info {
        #[arg(long)]
        table: String,
    },
    /// Run one cycle and print its metrics in Prometheus text format.
    RenderMetrics,
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    if json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = TidemarkConfig::from_file(&cli.config)?;
    init_tracing(config.daemon.json_logs);

    let daemon = Daemon::open(config)?;
    match cli.command {
        Command::Run { interval } => {
            let secs = interval.unwrap_or(daemon.config.daemon.interval_secs);
            daemon.run(Duration::from_secs(secs)).await
        }
        Command::Rotate { table, force } => {
            let report = daemon.rotate(&table, force).await?;
            println!("{}", summarize(&report));
            Ok(())
        }
        Command::CleanHistory { table } => {
            for line in daemon.clean_history(table.as_deref()).await? {
                println!("{line}");
            }
            Ok(())
        }
        Command::Migrate { table, cluster } => {
            let report = daemon.migrate(&table, cluster).await?;
            println!("{}", summarize(&report));
            Ok(())
        }
        Command::Info { table } => {
            println!("{}", daemon.info(&table).await?);
            Ok(())
        }
        Command::RenderMetrics => {
            print!("{}", daemon.render_metrics().await?);
            Ok(())
        }
    }
}

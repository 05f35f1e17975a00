use std::path::PathBuf;

use clap::Parser;

/// Government data sync CLI arguments
#[derive(Debug, Parser)]
#[command(
    name = "gov-data-sync",
    version,
    about = "Keeps cached government open-data feeds fresh under per-source rate limits"
)]
pub struct Cli {
    /// Address the observability API listens on
    #[arg(long)]
    pub bind: Option<String>,

    /// JSON file declaring the data sources to register
    #[arg(long)]
    pub sources: Option<PathBuf>,

    /// Scheduler tick interval in seconds
    #[arg(long)]
    pub tick_seconds: Option<u64>,

    /// Skip the warm-up sync of critical and high priority sources
    #[arg(long)]
    pub no_initial_sync: bool,
}

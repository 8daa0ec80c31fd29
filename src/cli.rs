use clap::Parser;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "confluence-sync")]
#[command(about = "Bidirectional sync between a Confluence page tree and local markdown")]
pub struct Cli {
    /// Sync only this file (relative to the configured local root); the
    /// last-synced timestamp is not advanced. With --init, this is the
    /// local directory to sync into.
    pub file: Option<PathBuf>,

    /// Initialize: resolve "SPACE:Title/Path" (trailing "/" or empty path
    /// means the space root) and write .confluence-sync/config.yaml.
    #[arg(long, value_name = "SPACE:PATH")]
    pub init: Option<String>,

    /// Classify and report; apply nothing.
    #[arg(long)]
    pub dry_run: bool,

    /// Local side wins everywhere; bypasses change detection.
    #[arg(long, conflicts_with = "force_pull")]
    pub force_push: bool,

    /// Remote side wins everywhere; bypasses change detection.
    #[arg(long, conflicts_with = "force_push")]
    pub force_pull: bool,

    /// Verbosity: 0 warnings, 1 info, 2 debug.
    #[arg(short, default_value_t = 0, value_name = "N")]
    pub verbosity: u8,

    /// Disable ANSI coloring.
    #[arg(long)]
    pub no_color: bool,

    /// Write logs to DIR/confluence-sync-YYYYMMDD-HHMMSS.log instead of stderr.
    #[arg(long, value_name = "DIR")]
    pub logdir: Option<PathBuf>,
}

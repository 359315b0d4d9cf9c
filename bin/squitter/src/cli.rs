use std::path::PathBuf;

use chrono::FixedOffset;
use clap::{ArgAction, Args, Parser, Subcommand};
use tracing::level_filters::LevelFilter;

/// Ingests BaseStation (SBS-1) aircraft feeds and writes throttled, batched records to a sink.
#[derive(Parser, Debug)]
#[command(about, version)]
pub struct Cli {
    /// Enable verbose output. Repeat for more detail.
    #[arg(global = true, short = 'v', long, action = ArgAction::Count, default_value_t = 0)]
    verbose: u8,

    /// Path to a YAML or JSON configuration file.
    #[arg(global = true, short = 'c', long = "config")]
    pub config_path: Option<PathBuf>,

    /// Number of records to buffer before committing a batch to the sink.
    #[arg(global = true, long)]
    pub batch_size: Option<usize>,

    #[command(flatten)]
    pub feed: FeedArgs,

    #[command(subcommand)]
    pub action: Option<Action>,
}

impl Cli {
    /// Returns the log level implied by the verbosity flags, if any were given.
    pub fn log_level(&self) -> Option<LevelFilter> {
        match self.verbose {
            0 => None,
            1 => Some(LevelFilter::DEBUG),
            _ => Some(LevelFilter::TRACE),
        }
    }
}

/// Flags describing a single feed.
///
/// When any of these are given, they replace the feeds listed in the configuration with a single feed.
#[derive(Args, Debug, Default)]
pub struct FeedArgs {
    /// Host of the BaseStation feed.
    #[arg(global = true, short = 'l', long)]
    pub host: Option<String>,

    /// Port of the BaseStation feed.
    #[arg(global = true, short = 'p', long)]
    pub port: Option<u16>,

    /// Identifier attached to every record from this feed.
    #[arg(global = true, long)]
    pub source_id: Option<u16>,

    /// Maximum number of bytes to read from the feed at a time.
    #[arg(global = true, long)]
    pub buffer_size: Option<usize>,

    /// Number of connection attempts before giving up.
    #[arg(global = true, long)]
    pub connect_attempt_limit: Option<usize>,

    /// Seconds to wait between connection attempts.
    #[arg(global = true, long, value_name = "SECS")]
    pub connect_attempt_delay: Option<f64>,

    /// UTC offset of the receiver's clock, such as `+02:00`.
    #[arg(global = true, long, value_name = "OFFSET", allow_hyphen_values = true)]
    pub timezone: Option<FixedOffset>,
}

impl FeedArgs {
    /// Returns `true` if any feed flag was given.
    pub fn is_set(&self) -> bool {
        self.host.is_some()
            || self.port.is_some()
            || self.source_id.is_some()
            || self.buffer_size.is_some()
            || self.connect_attempt_limit.is_some()
            || self.connect_attempt_delay.is_some()
            || self.timezone.is_some()
    }
}

#[derive(Subcommand, Debug)]
pub enum Action {
    /// Connects to the configured feeds and ingests until interrupted. This is the default.
    #[command(name = "run")]
    Run,

    /// Loads and validates the configuration, prints a summary, and exits.
    #[command(name = "check-config")]
    CheckConfig,
}

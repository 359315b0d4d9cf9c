use std::{collections::BTreeMap, fmt, path::PathBuf, time::Duration};

use anyhow::{bail, ensure, Context as _};
use chrono::{FixedOffset, Offset as _, Utc};
use serde::Deserialize;
use serde_with::{serde_as, DisplayFromStr, DurationSecondsWithFrac};
use squitter_config::ConfigurationLoader;
use squitter_core::{
    record::{TransmissionType, TransmissionTypeSet},
    throttle::{TtlTable, DEFAULT_IDLE_HORIZON},
    writer::DEFAULT_BATCH_SIZE,
};
use squitter_io::{
    framing::DEFAULT_MAX_FRAGMENT_LEN,
    net::{
        DEFAULT_CONNECT_ATTEMPT_DELAY, DEFAULT_CONNECT_ATTEMPT_LIMIT, DEFAULT_READ_BUFFER_SIZE, DEFAULT_READ_TIMEOUT,
    },
};

use crate::cli::Cli;

/// Prefix for environment variables that override configuration values.
pub const ENV_PREFIX: &str = "SQUITTER";

/// Port on which piaware serves multilateration results in BaseStation format.
pub const MLAT_PORT: u16 = 31003;

const DEFAULT_HOST: &str = "localhost";
const DEFAULT_PORT: u16 = 30003;

const fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}

const fn default_max_fragment_len() -> usize {
    DEFAULT_MAX_FRAGMENT_LEN
}

const fn default_idle_eviction() -> Duration {
    DEFAULT_IDLE_HORIZON
}

fn default_host() -> String {
    DEFAULT_HOST.to_string()
}

const fn default_port() -> u16 {
    DEFAULT_PORT
}

const fn default_read_buffer_size() -> usize {
    DEFAULT_READ_BUFFER_SIZE
}

const fn default_read_timeout() -> Duration {
    DEFAULT_READ_TIMEOUT
}

const fn default_connect_attempt_limit() -> usize {
    DEFAULT_CONNECT_ATTEMPT_LIMIT
}

const fn default_connect_attempt_delay() -> Duration {
    DEFAULT_CONNECT_ATTEMPT_DELAY
}

fn default_accept_transmission_types() -> Vec<u8> {
    TransmissionTypeSet::default().iter().map(TransmissionType::as_u8).collect()
}

fn default_feeds() -> Vec<FeedConfiguration> {
    vec![FeedConfiguration::default()]
}

/// Top-level configuration.
#[serde_as]
#[derive(Clone, Debug, Deserialize)]
pub struct IngestConfiguration {
    /// Log filter directives, in `RUST_LOG` syntax.
    #[serde(default)]
    pub log_level: Option<String>,

    /// Whether to emit logs as JSON.
    #[serde(default)]
    pub log_format_json: bool,

    /// Number of buffered records that triggers a batch commit.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Maximum time the oldest buffered record may wait before a commit is forced.
    #[serde_as(as = "Option<DurationSecondsWithFrac<f64>>")]
    #[serde(rename = "max_batch_age_secs")]
    pub max_batch_age: Option<Duration>,

    /// Longest malformed fragment carried over before it is discarded.
    #[serde(default = "default_max_fragment_len")]
    pub max_fragment_len: usize,

    /// Throttle settings shared by every feed.
    #[serde(default)]
    pub throttle: ThrottleConfiguration,

    /// Destination of committed batches.
    #[serde(default)]
    pub sink: SinkConfiguration,

    /// Feeds to ingest, each run by its own pipeline.
    #[serde(default = "default_feeds")]
    pub feeds: Vec<FeedConfiguration>,
}

/// Throttle configuration shared by every feed.
#[serde_as]
#[derive(Clone, Debug, Deserialize)]
pub struct ThrottleConfiguration {
    /// TTL overrides, keyed by transmission type.
    ///
    /// Only canonical classes (1, 2, 4, 5, 6) may be set. Classes not listed keep their default TTL.
    #[serde_as(as = "BTreeMap<_, DurationSecondsWithFrac<f64>>")]
    #[serde(default)]
    pub ttls: BTreeMap<String, Duration>,

    /// How long an aircraft may go unseen before its throttle state is dropped.
    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    #[serde(default = "default_idle_eviction", rename = "idle_eviction_secs")]
    pub idle_eviction: Duration,
}

impl Default for ThrottleConfiguration {
    fn default() -> Self {
        Self {
            ttls: BTreeMap::new(),
            idle_eviction: default_idle_eviction(),
        }
    }
}

impl ThrottleConfiguration {
    /// Builds the TTL table, layering the configured overrides over the defaults.
    ///
    /// # Errors
    ///
    /// If a key is not a canonical transmission type, an error is returned.
    pub fn ttl_table(&self) -> Result<TtlTable, anyhow::Error> {
        let mut table = TtlTable::default();
        for (key, ttl) in &self.ttls {
            let tt = key
                .trim()
                .parse::<u8>()
                .ok()
                .and_then(|raw| TransmissionType::try_from(raw).ok())
                .with_context(|| format!("Throttle TTL key '{}' is not a transmission type (1-8).", key))?;
            ensure!(
                tt.is_canonical(),
                "Throttle TTL key '{}' is not a canonical class. Set the TTL for class {} instead.",
                key,
                tt.throttle_alias()
            );
            table.set(tt, *ttl);
        }
        Ok(table)
    }
}

/// Where committed batches are written.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SinkConfiguration {
    /// Newline-delimited JSON, appended to a file or written to standard output when no path is given.
    Jsonl {
        /// File to append to.
        #[serde(default)]
        path: Option<PathBuf>,
    },

    /// Discards records, logging how many were received.
    Blackhole,
}

impl Default for SinkConfiguration {
    fn default() -> Self {
        Self::Jsonl { path: None }
    }
}

impl fmt::Display for SinkConfiguration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Jsonl { path: Some(path) } => write!(f, "jsonl ({})", path.display()),
            Self::Jsonl { path: None } => write!(f, "jsonl (stdout)"),
            Self::Blackhole => write!(f, "blackhole"),
        }
    }
}

/// A single BaseStation feed.
#[serde_as]
#[derive(Clone, Debug, Deserialize)]
pub struct FeedConfiguration {
    /// Host of the feed.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port of the feed.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Identifier attached to every record from this feed.
    #[serde(default)]
    pub source_id: u16,

    /// Whether this feed carries multilateration results. Defaults to `true` for the piaware mlat port.
    #[serde(default)]
    pub is_mlat: Option<bool>,

    /// UTC offset of the receiver's clock, such as `+02:00`.
    ///
    /// The generated and logged timestamps carry no zone, so they are read in this offset. Defaults to UTC.
    #[serde_as(as = "Option<DisplayFromStr>")]
    pub timezone: Option<FixedOffset>,

    /// Maximum number of bytes to read from the feed at a time.
    #[serde(default = "default_read_buffer_size")]
    pub read_buffer_size: usize,

    /// How long the feed may stay silent before the connection is recycled.
    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    #[serde(default = "default_read_timeout", rename = "read_timeout_secs")]
    pub read_timeout: Duration,

    /// Number of connection attempts before giving up.
    #[serde(default = "default_connect_attempt_limit")]
    pub connect_attempt_limit: usize,

    /// Pause between connection attempts.
    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    #[serde(default = "default_connect_attempt_delay", rename = "connect_attempt_delay_secs")]
    pub connect_attempt_delay: Duration,

    /// Transmission types (1-8) kept by the parser.
    #[serde(default = "default_accept_transmission_types")]
    pub accept_transmission_types: Vec<u8>,

    /// Drop records that lack a latitude or longitude.
    #[serde(default)]
    pub require_position: bool,
}

impl Default for FeedConfiguration {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            source_id: 0,
            is_mlat: None,
            timezone: None,
            read_buffer_size: default_read_buffer_size(),
            read_timeout: default_read_timeout(),
            connect_attempt_limit: default_connect_attempt_limit(),
            connect_attempt_delay: default_connect_attempt_delay(),
            accept_transmission_types: default_accept_transmission_types(),
            require_position: false,
        }
    }
}

impl FeedConfiguration {
    /// Returns the `host:port` address of the feed.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Returns whether records from this feed are multilateration results.
    pub fn is_mlat(&self) -> bool {
        self.is_mlat.unwrap_or(self.port == MLAT_PORT)
    }

    /// Returns the UTC offset of the receiver's clock.
    pub fn timezone(&self) -> FixedOffset {
        self.timezone.unwrap_or(Utc.fix())
    }

    /// Builds the set of accepted transmission types.
    ///
    /// # Errors
    ///
    /// If any entry is outside of 1-8, an error is returned.
    pub fn accepted(&self) -> Result<TransmissionTypeSet, anyhow::Error> {
        self.accept_transmission_types
            .iter()
            .map(|raw| {
                TransmissionType::try_from(*raw).map_err(|raw| {
                    anyhow::anyhow!(
                        "Feed {} accepts transmission type {}, which is outside of 1-8.",
                        self.address(),
                        raw
                    )
                })
            })
            .collect()
    }

    fn validate(&self) -> Result<(), anyhow::Error> {
        let address = self.address();
        ensure!(!self.host.is_empty(), "Feed host must not be empty.");
        ensure!(
            self.read_buffer_size >= 1,
            "Feed {} read buffer size must be at least 1.",
            address
        );
        ensure!(
            self.connect_attempt_limit >= 1,
            "Feed {} connect attempt limit must be at least 1.",
            address
        );
        self.accepted()?;
        Ok(())
    }
}

impl IngestConfiguration {
    /// Loads the configuration from the given file (if any) and `SQUITTER_`-prefixed environment variables, then
    /// applies command-line overrides and validates the result.
    ///
    /// # Errors
    ///
    /// If any source cannot be read, or the merged configuration is invalid, an error is returned.
    pub fn load(cli: &Cli) -> Result<Self, anyhow::Error> {
        let mut loader = ConfigurationLoader::default();
        if let Some(path) = &cli.config_path {
            loader = loader.from_file(path)?;
        }

        let mut config = loader
            .from_environment(ENV_PREFIX)?
            .into_typed::<IngestConfiguration>()
            .context("Failed to load configuration.")?;

        config.apply_overrides(cli)?;
        config.validate()?;
        Ok(config)
    }

    /// Applies command-line overrides.
    ///
    /// Any feed flag replaces the configured feeds with a single feed built from the defaults and the given flags.
    ///
    /// # Errors
    ///
    /// If the connection attempt delay is negative or not a finite number of seconds, an error is returned.
    pub fn apply_overrides(&mut self, cli: &Cli) -> Result<(), anyhow::Error> {
        if let Some(batch_size) = cli.batch_size {
            self.batch_size = batch_size;
        }

        let args = &cli.feed;
        if !args.is_set() {
            return Ok(());
        }

        let mut feed = FeedConfiguration::default();
        if let Some(host) = &args.host {
            feed.host = host.clone();
        }
        if let Some(port) = args.port {
            feed.port = port;
        }
        if let Some(source_id) = args.source_id {
            feed.source_id = source_id;
        }
        if let Some(buffer_size) = args.buffer_size {
            feed.read_buffer_size = buffer_size;
        }
        if let Some(limit) = args.connect_attempt_limit {
            feed.connect_attempt_limit = limit;
        }
        if let Some(delay) = args.connect_attempt_delay {
            feed.connect_attempt_delay = Duration::try_from_secs_f64(delay)
                .with_context(|| format!("Connect attempt delay '{}' is not a valid number of seconds.", delay))?;
        }
        if let Some(timezone) = args.timezone {
            feed.timezone = Some(timezone);
        }
        self.feeds = vec![feed];
        Ok(())
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// If any value is out of range, an error describing the first offending value is returned.
    pub fn validate(&self) -> Result<(), anyhow::Error> {
        ensure!(self.batch_size >= 1, "Batch size must be at least 1.");
        ensure!(
            self.max_fragment_len >= 1,
            "Maximum fragment length must be at least 1."
        );
        if self.max_batch_age.is_some_and(|age| age.is_zero()) {
            bail!("Maximum batch age must be greater than zero when set.");
        }
        if self.feeds.is_empty() {
            bail!("At least one feed must be configured.");
        }

        self.throttle.ttl_table()?;
        for feed in &self.feeds {
            feed.validate()?;
        }
        Ok(())
    }
}

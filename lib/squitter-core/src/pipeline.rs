//! Feed pipeline driver.

use std::{sync::Arc, time::Duration};

use chrono::{FixedOffset, Offset as _, Utc};
use snafu::Snafu;
use squitter_io::{
    framing::{Frame, LineReassembler, DEFAULT_MAX_FRAGMENT_LEN},
    net::{ConnectError, FeedConnection, FeedConnector, ReadOutcome},
    shutdown::ShutdownSignal,
};
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

use crate::{
    parser::RecordParser,
    record::TransmissionTypeSet,
    sink::Sink,
    telemetry::PipelineTelemetry,
    throttle::{Throttle, TtlTable, DEFAULT_IDLE_HORIZON},
    writer::{BatchWriter, DEFAULT_BATCH_SIZE},
};

/// Consecutive transient read errors after which a connection is recycled.
const MAX_CONSECUTIVE_READ_ERRORS: u32 = 5;

/// Pause after a transient read error before reading again.
const READ_ERROR_BACKOFF: Duration = Duration::from_millis(200);

/// Pipeline error.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum PipelineError {
    /// The feed could not be (re)connected within the retry budget.
    #[snafu(display("feed {} stopped: {}", summary.source_id, source))]
    Connect {
        /// Underlying connection error.
        source: ConnectError,

        /// Counters accumulated before the pipeline stopped.
        summary: Box<PipelineSummary>,
    },
}

impl PipelineError {
    /// Returns the counters accumulated before the pipeline stopped.
    pub fn summary(&self) -> &PipelineSummary {
        match self {
            Self::Connect { summary, .. } => summary,
        }
    }
}

/// Counters describing a completed pipeline run.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct PipelineSummary {
    /// Source ID of the feed.
    pub source_id: u16,

    /// Candidate lines produced by the reassembler.
    pub lines_received: u64,

    /// Fragments discarded by the reassembler, including those dropped on reconnect.
    pub fragments_discarded: u64,

    /// Lines rejected by the parser.
    pub records_rejected: u64,

    /// Records rejected by the throttle.
    pub records_throttled: u64,

    /// Records dropped for lacking a position.
    pub records_filtered: u64,

    /// Records handed to the batch writer.
    pub records_enqueued: u64,

    /// Records committed to the sink.
    pub records_written: u64,

    /// Records still buffered after the final flush.
    pub records_pending: u64,

    /// Failed batch commits.
    pub batch_commit_failures: u64,

    /// Times the feed connection was recycled.
    pub reconnects: u64,
}

/// Lifecycle state of a feed pipeline.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PipelineState {
    /// No connection is held.
    Disconnected,

    /// Establishing a connection.
    Connecting,

    /// Reading from an established connection.
    Connected,

    /// Flushing buffered records before stopping.
    Draining,

    /// Stopped.
    Terminated,
}

/// A single feed ingestion pipeline.
///
/// Connects to a feed, reassembles lines, parses and throttles records, and delivers them in batches to a sink. A
/// dead or silent connection is recycled, and only running out of connection attempts stops the pipeline early. Every
/// pipeline drains its buffered records once before stopping, whether it stops on shutdown or on failure.
pub struct FeedPipeline {
    source_id: u16,
    connector: FeedConnector,
    sink: Arc<dyn Sink>,
    accepted: TransmissionTypeSet,
    is_mlat: bool,
    timezone: FixedOffset,
    ttls: TtlTable,
    idle_horizon: Duration,
    batch_size: usize,
    max_batch_age: Option<Duration>,
    max_fragment_len: usize,
    require_position: bool,
}

impl FeedPipeline {
    /// Creates a new `FeedPipeline` reading from the given connector and writing to the given sink.
    pub fn new(source_id: u16, connector: FeedConnector, sink: Arc<dyn Sink>) -> Self {
        Self {
            source_id,
            connector,
            sink,
            accepted: TransmissionTypeSet::default(),
            is_mlat: false,
            timezone: Utc.fix(),
            ttls: TtlTable::default(),
            idle_horizon: DEFAULT_IDLE_HORIZON,
            batch_size: DEFAULT_BATCH_SIZE,
            max_batch_age: None,
            max_fragment_len: DEFAULT_MAX_FRAGMENT_LEN,
            require_position: false,
        }
    }

    /// Sets the transmission types that are accepted.
    pub fn with_accepted(mut self, accepted: TransmissionTypeSet) -> Self {
        self.accepted = accepted;
        self
    }

    /// Sets whether the feed is a multilateration source.
    ///
    /// Records from a multilateration source are marked as such and are never throttled.
    pub fn with_mlat(mut self, is_mlat: bool) -> Self {
        self.is_mlat = is_mlat;
        self
    }

    /// Sets the UTC offset of the receiver's clock, used to resolve the generated and logged timestamps.
    pub fn with_timezone(mut self, timezone: FixedOffset) -> Self {
        self.timezone = timezone;
        self
    }

    /// Sets the throttle intervals.
    pub fn with_ttls(mut self, ttls: TtlTable) -> Self {
        self.ttls = ttls;
        self
    }

    /// Sets the idle horizon after which throttle entries are evicted.
    pub fn with_idle_horizon(mut self, idle_horizon: Duration) -> Self {
        self.idle_horizon = idle_horizon;
        self
    }

    /// Sets the number of records per batch.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Sets the maximum time a record may wait before its batch is flushed.
    pub fn with_max_batch_age(mut self, max_batch_age: Option<Duration>) -> Self {
        self.max_batch_age = max_batch_age;
        self
    }

    /// Sets the ceiling on carried fragment length, in bytes.
    pub fn with_max_fragment_len(mut self, max_fragment_len: usize) -> Self {
        self.max_fragment_len = max_fragment_len;
        self
    }

    /// Sets whether records without a position are dropped.
    pub fn with_require_position(mut self, require_position: bool) -> Self {
        self.require_position = require_position;
        self
    }

    /// Runs the pipeline until shutdown is triggered or the feed cannot be reconnected.
    ///
    /// # Errors
    ///
    /// If the connection retry budget is exhausted, an error is returned after buffered records have been drained.
    pub async fn run(self, shutdown: ShutdownSignal) -> Result<PipelineSummary, PipelineError> {
        let telemetry = PipelineTelemetry::new(self.source_id);
        let writer = BatchWriter::new(self.sink, self.source_id, self.batch_size)
            .with_max_batch_age(self.max_batch_age)
            .with_telemetry(telemetry.clone());

        let driver = PipelineDriver {
            source_id: self.source_id,
            connector: self.connector,
            shutdown,
            reassembler: LineReassembler::new(self.max_fragment_len),
            parser: RecordParser::new(self.source_id)
                .with_accepted(self.accepted)
                .with_mlat(self.is_mlat)
                .with_timezone(self.timezone),
            throttle: Throttle::new(self.ttls)
                .with_bypass(self.is_mlat)
                .with_idle_horizon(self.idle_horizon),
            writer,
            require_position: self.require_position,
            telemetry,
            read_errors: ReadErrorStreak::new(MAX_CONSECUTIVE_READ_ERRORS),
            summary: PipelineSummary {
                source_id: self.source_id,
                ..Default::default()
            },
        };

        driver.run().await
    }
}

struct PipelineDriver {
    source_id: u16,
    connector: FeedConnector,
    shutdown: ShutdownSignal,
    reassembler: LineReassembler,
    parser: RecordParser,
    throttle: Throttle,
    writer: BatchWriter,
    require_position: bool,
    telemetry: PipelineTelemetry,
    read_errors: ReadErrorStreak,
    summary: PipelineSummary,
}

impl PipelineDriver {
    async fn run(mut self) -> Result<PipelineSummary, PipelineError> {
        let address = self.connector.address();
        info!(source_id = self.source_id, %address, is_mlat = self.parser.is_mlat(), "Feed pipeline started.");

        let mut state = PipelineState::Connecting;
        let mut connection: Option<FeedConnection> = None;
        let mut fatal_error = None;

        loop {
            let next_state = match state {
                PipelineState::Disconnected => {
                    if self.shutdown.is_triggered() {
                        PipelineState::Draining
                    } else {
                        PipelineState::Connecting
                    }
                }
                PipelineState::Connecting => match self.connector.connect(&mut self.shutdown).await {
                    Ok(conn) => {
                        connection = Some(conn);
                        PipelineState::Connected
                    }
                    Err(ConnectError::Stopped { .. }) => PipelineState::Draining,
                    Err(e) => {
                        error!(source_id = self.source_id, error = %e, "Giving up on feed.");
                        fatal_error = Some(e);
                        PipelineState::Draining
                    }
                },
                PipelineState::Connected => {
                    if self.shutdown.is_triggered() {
                        PipelineState::Draining
                    } else if let Some(conn) = connection.as_mut() {
                        match conn.read().await {
                            ReadOutcome::Data(chunk) => {
                                self.read_errors.reset();
                                self.ingest(&chunk).await;
                                PipelineState::Connected
                            }
                            ReadOutcome::Interrupted(e) => {
                                if self.read_errors.record() {
                                    warn!(source_id = self.source_id, error = %e, "Feed keeps failing reads.");
                                    self.recycle(connection.take()).await;
                                    PipelineState::Disconnected
                                } else {
                                    debug!(source_id = self.source_id, error = %e, "Transient read error from feed.");
                                    self.housekeeping().await;
                                    self.shutdown.sleep(READ_ERROR_BACKOFF).await;
                                    PipelineState::Connected
                                }
                            }
                            ReadOutcome::Closed | ReadOutcome::TimedOut => {
                                self.recycle(connection.take()).await;
                                PipelineState::Disconnected
                            }
                        }
                    } else {
                        PipelineState::Disconnected
                    }
                }
                PipelineState::Draining => {
                    if let Some(conn) = connection.take() {
                        conn.close().await;
                    }
                    self.drain().await;
                    PipelineState::Terminated
                }
                PipelineState::Terminated => break,
            };

            if next_state != state {
                debug!(source_id = self.source_id, from = ?state, to = ?next_state, "Pipeline state changed.");
            }
            state = next_state;
        }

        info!(
            source_id = self.source_id,
            %address,
            records_written = self.summary.records_written,
            "Feed pipeline stopped. {} records written.",
            self.summary.records_written
        );

        match fatal_error {
            None => Ok(self.summary),
            Some(source) => Err(PipelineError::Connect {
                source,
                summary: Box::new(self.summary),
            }),
        }
    }

    async fn ingest(&mut self, chunk: &[u8]) {
        self.reassembler.extend(chunk);

        while let Some(frame) = self.reassembler.next_frame() {
            match frame {
                Frame::Line(line) => {
                    self.process_line(line.as_bytes());
                    self.writer.maybe_flush().await;
                }
                Frame::Discarded { len } => self.report_discarded(len, "Discarded oversized fragment."),
            }
        }

        self.housekeeping().await;
    }

    fn process_line(&mut self, line: &[u8]) {
        self.summary.lines_received += 1;
        self.telemetry.lines_received().increment(1);

        let record = match self.parser.parse(line, Utc::now()) {
            Ok(record) => record,
            Err(e) => {
                self.summary.records_rejected += 1;
                self.telemetry.records_rejected(e.reason()).increment(1);
                trace!(source_id = self.source_id, error = %e, "Rejected line.");
                return;
            }
        };

        if self.require_position && !record.has_position() {
            self.summary.records_filtered += 1;
            self.telemetry.records_filtered().increment(1);
            return;
        }

        if !self.throttle.accept(&record) {
            self.summary.records_throttled += 1;
            self.telemetry.records_throttled().increment(1);
            return;
        }

        self.summary.records_enqueued += 1;
        self.writer.enqueue(record);
    }

    async fn housekeeping(&mut self) {
        self.writer.maybe_flush().await;
        self.throttle.maybe_evict(Instant::now());
    }

    async fn recycle(&mut self, connection: Option<FeedConnection>) {
        warn!(
            source_id = self.source_id,
            address = %self.connector.address(),
            "No broadcast received. Attempting to reconnect."
        );

        self.summary.reconnects += 1;
        self.telemetry.reconnects().increment(1);
        self.read_errors.reset();

        let dropped = self.reassembler.reset();
        if dropped > 0 {
            self.report_discarded(dropped, "Discarded partial line from previous connection.");
        }

        self.housekeeping().await;
        self.shutdown.sleep(self.connector.attempt_delay()).await;

        if let Some(conn) = connection {
            conn.close().await;
        }
    }

    fn report_discarded(&mut self, len: usize, message: &'static str) {
        self.summary.fragments_discarded += 1;
        self.telemetry.fragments_discarded().increment(1);
        warn!(source_id = self.source_id, len, "{}", message);
    }

    async fn drain(&mut self) {
        let pending = self.writer.drain().await;
        if pending > 0 {
            error!(
                source_id = self.source_id,
                pending, "Stopping with {} records that could not be written.", pending
            );
        }

        self.summary.records_written = self.writer.records_written();
        self.summary.batch_commit_failures = self.writer.commit_failures();
        self.summary.records_pending = pending as u64;
    }
}

/// Counts consecutive transient read errors on one connection.
#[derive(Debug)]
struct ReadErrorStreak {
    current: u32,
    limit: u32,
}

impl ReadErrorStreak {
    fn new(limit: u32) -> Self {
        Self { current: 0, limit }
    }

    /// Records an error, returning `true` once the streak reaches the limit.
    fn record(&mut self) -> bool {
        self.current = self.current.saturating_add(1);
        self.current >= self.limit
    }

    fn reset(&mut self) {
        self.current = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_error_streak_recycles_at_limit() {
        let mut streak = ReadErrorStreak::new(3);
        assert!(!streak.record());
        assert!(!streak.record());
        assert!(streak.record());
        assert!(streak.record());

        streak.reset();
        assert!(!streak.record());
    }

    #[test]
    fn successful_reads_break_the_streak() {
        let mut streak = ReadErrorStreak::new(MAX_CONSECUTIVE_READ_ERRORS);
        for _ in 0..10 {
            for _ in 1..MAX_CONSECUTIVE_READ_ERRORS {
                assert!(!streak.record());
            }
            streak.reset();
        }
    }
}

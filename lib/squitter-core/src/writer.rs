//! Batched delivery of records to a sink.

use std::{sync::Arc, time::Duration};

use tokio::time::Instant;
use tracing::{debug, error, info};

use crate::{record::Record, sink::Sink, telemetry::PipelineTelemetry};

/// Default number of records per batch.
pub const DEFAULT_BATCH_SIZE: usize = 20;

/// Result of a flush attempt.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FlushOutcome {
    /// Nothing was buffered.
    Idle,

    /// The buffered records were committed.
    Committed {
        /// Number of records committed.
        records: usize,
    },

    /// The sink rejected the batch. The records stay buffered and are retried on the next flush.
    Failed {
        /// Number of records still buffered.
        pending: usize,
    },
}

/// Buffers records and commits them to a sink in batches.
///
/// A flush is due once `batch_size` records have been enqueued since the last attempt, or, if a maximum batch age is
/// set, once the oldest record enqueued since the last attempt has waited that long. A failed commit keeps every
/// buffered record, and the next attempt retries them together with whatever was enqueued since. A successful commit
/// drains the buffer, so no record is ever part of two successful commits.
pub struct BatchWriter {
    sink: Arc<dyn Sink>,
    source_id: u16,
    batch_size: usize,
    max_batch_age: Option<Duration>,
    buffer: Vec<Record>,
    enqueued_since_attempt: usize,
    due_since: Option<Instant>,
    started: Instant,
    records_written: u64,
    commit_failures: u64,
    recovering: bool,
    telemetry: PipelineTelemetry,
}

impl BatchWriter {
    /// Creates a new `BatchWriter` that commits to the given sink.
    ///
    /// A batch size of zero is treated as one.
    pub fn new(sink: Arc<dyn Sink>, source_id: u16, batch_size: usize) -> Self {
        let batch_size = batch_size.max(1);
        Self {
            sink,
            source_id,
            batch_size,
            max_batch_age: None,
            buffer: Vec::with_capacity(batch_size),
            enqueued_since_attempt: 0,
            due_since: None,
            started: Instant::now(),
            records_written: 0,
            commit_failures: 0,
            recovering: false,
            telemetry: PipelineTelemetry::noop(),
        }
    }

    /// Sets the maximum time a record may wait before a flush is due, regardless of batch size.
    pub fn with_max_batch_age(mut self, max_batch_age: Option<Duration>) -> Self {
        self.max_batch_age = max_batch_age;
        self
    }

    /// Sets the telemetry handles to update.
    pub fn with_telemetry(mut self, telemetry: PipelineTelemetry) -> Self {
        self.telemetry = telemetry;
        self
    }

    /// Returns the number of buffered records.
    pub fn pending_len(&self) -> usize {
        self.buffer.len()
    }

    /// Returns the total number of records committed.
    pub fn records_written(&self) -> u64 {
        self.records_written
    }

    /// Returns the number of failed commits.
    pub fn commit_failures(&self) -> u64 {
        self.commit_failures
    }

    /// Buffers a record.
    pub fn enqueue(&mut self, record: Record) {
        self.buffer.push(record);
        self.enqueued_since_attempt += 1;
        if self.due_since.is_none() {
            self.due_since = Some(Instant::now());
        }

        self.telemetry.records_enqueued().increment(1);
        self.telemetry.pending_records().set(self.buffer.len() as f64);
    }

    /// Returns `true` if a flush is due.
    pub fn is_flush_due(&self) -> bool {
        if self.enqueued_since_attempt >= self.batch_size {
            return true;
        }

        match (self.max_batch_age, self.due_since) {
            (Some(max_age), Some(since)) => !self.buffer.is_empty() && since.elapsed() >= max_age,
            _ => false,
        }
    }

    /// Flushes the buffer if a flush is due.
    pub async fn maybe_flush(&mut self) -> FlushOutcome {
        if self.is_flush_due() {
            self.flush().await
        } else {
            FlushOutcome::Idle
        }
    }

    /// Attempts to commit every buffered record.
    pub async fn flush(&mut self) -> FlushOutcome {
        self.enqueued_since_attempt = 0;
        if self.buffer.is_empty() {
            self.due_since = None;
            return FlushOutcome::Idle;
        }

        match self.sink.append(&self.buffer).await {
            Ok(()) => {
                let records = self.buffer.len();
                self.buffer.clear();
                self.due_since = None;
                self.records_written += records as u64;

                self.telemetry.records_written().increment(records as u64);
                self.telemetry.pending_records().set(0.0);

                let elapsed = self.started.elapsed().as_secs_f64();
                let rate = if elapsed > 0.0 {
                    self.records_written as f64 / elapsed
                } else {
                    0.0
                };
                info!(
                    source_id = self.source_id,
                    records,
                    total = self.records_written,
                    "Committed batch. Averaging {:.2} records/sec.",
                    rate
                );

                if self.recovering {
                    self.recovering = false;
                    info!(source_id = self.source_id, "All caught up, {} records written.", records);
                }

                FlushOutcome::Committed { records }
            }
            Err(e) => {
                let pending = self.buffer.len();
                self.due_since = Some(Instant::now());
                self.commit_failures += 1;
                self.recovering = true;

                self.telemetry.batch_commit_failures().increment(1);
                error!(
                    source_id = self.source_id,
                    sink = self.sink.name(),
                    error = %e,
                    pending,
                    "Failed to write batch. Will retry {} records on next commit.",
                    pending
                );

                FlushOutcome::Failed { pending }
            }
        }
    }

    /// Performs a final flush, returning the number of records left uncommitted.
    pub async fn drain(&mut self) -> usize {
        match self.flush().await {
            FlushOutcome::Idle | FlushOutcome::Committed { .. } => 0,
            FlushOutcome::Failed { pending } => {
                debug!(source_id = self.source_id, pending, "Final flush failed.");
                pending
            }
        }
    }
}

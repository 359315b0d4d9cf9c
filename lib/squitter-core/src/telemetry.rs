//! Pipeline telemetry.

use metrics::{counter, gauge, Counter, Gauge};

use crate::parser::RejectReason;

#[derive(Clone)]
struct RejectedCounters {
    field_count: Counter,
    invalid_utf8: Counter,
    not_accepted: Counter,
    invalid_field: Counter,
    missing_field: Counter,
}

impl RejectedCounters {
    fn new(source_id: &str) -> Self {
        let register = |reason: RejectReason| {
            counter!(
                "squitter_records_rejected_total",
                "source_id" => source_id.to_string(),
                "reason" => reason.as_str()
            )
        };

        Self {
            field_count: register(RejectReason::FieldCount),
            invalid_utf8: register(RejectReason::InvalidUtf8),
            not_accepted: register(RejectReason::NotAccepted),
            invalid_field: register(RejectReason::InvalidField),
            missing_field: register(RejectReason::MissingField),
        }
    }

    fn noop() -> Self {
        Self {
            field_count: Counter::noop(),
            invalid_utf8: Counter::noop(),
            not_accepted: Counter::noop(),
            invalid_field: Counter::noop(),
            missing_field: Counter::noop(),
        }
    }

    fn for_reason(&self, reason: RejectReason) -> &Counter {
        match reason {
            RejectReason::FieldCount => &self.field_count,
            RejectReason::InvalidUtf8 => &self.invalid_utf8,
            RejectReason::NotAccepted => &self.not_accepted,
            RejectReason::InvalidField => &self.invalid_field,
            RejectReason::MissingField => &self.missing_field,
        }
    }
}

/// Metric handles for a single feed pipeline.
///
/// All metrics carry a `source_id` label. Handles are registered against whatever global recorder is installed when
/// the telemetry is created, and are no-ops if there is none.
#[derive(Clone)]
pub struct PipelineTelemetry {
    lines_received: Counter,
    fragments_discarded: Counter,
    records_rejected: RejectedCounters,
    records_throttled: Counter,
    records_filtered: Counter,
    records_enqueued: Counter,
    records_written: Counter,
    batch_commit_failures: Counter,
    reconnects: Counter,
    pending_records: Gauge,
}

impl PipelineTelemetry {
    /// Creates a new `PipelineTelemetry` for the feed with the given source ID.
    pub fn new(source_id: u16) -> Self {
        let source_id = source_id.to_string();
        Self {
            lines_received: counter!("squitter_lines_received_total", "source_id" => source_id.clone()),
            fragments_discarded: counter!("squitter_fragments_discarded_total", "source_id" => source_id.clone()),
            records_rejected: RejectedCounters::new(&source_id),
            records_throttled: counter!("squitter_records_throttled_total", "source_id" => source_id.clone()),
            records_filtered: counter!("squitter_records_filtered_total", "source_id" => source_id.clone()),
            records_enqueued: counter!("squitter_records_enqueued_total", "source_id" => source_id.clone()),
            records_written: counter!("squitter_records_written_total", "source_id" => source_id.clone()),
            batch_commit_failures: counter!("squitter_batch_commit_failures_total", "source_id" => source_id.clone()),
            reconnects: counter!("squitter_reconnects_total", "source_id" => source_id.clone()),
            pending_records: gauge!("squitter_pending_records", "source_id" => source_id),
        }
    }

    /// Creates a `PipelineTelemetry` whose handles discard every update.
    pub fn noop() -> Self {
        Self {
            lines_received: Counter::noop(),
            fragments_discarded: Counter::noop(),
            records_rejected: RejectedCounters::noop(),
            records_throttled: Counter::noop(),
            records_filtered: Counter::noop(),
            records_enqueued: Counter::noop(),
            records_written: Counter::noop(),
            batch_commit_failures: Counter::noop(),
            reconnects: Counter::noop(),
            pending_records: Gauge::noop(),
        }
    }

    pub(crate) fn lines_received(&self) -> &Counter {
        &self.lines_received
    }

    pub(crate) fn fragments_discarded(&self) -> &Counter {
        &self.fragments_discarded
    }

    pub(crate) fn records_rejected(&self, reason: RejectReason) -> &Counter {
        self.records_rejected.for_reason(reason)
    }

    pub(crate) fn records_throttled(&self) -> &Counter {
        &self.records_throttled
    }

    pub(crate) fn records_filtered(&self) -> &Counter {
        &self.records_filtered
    }

    pub(crate) fn records_enqueued(&self) -> &Counter {
        &self.records_enqueued
    }

    pub(crate) fn records_written(&self) -> &Counter {
        &self.records_written
    }

    pub(crate) fn batch_commit_failures(&self) -> &Counter {
        &self.batch_commit_failures
    }

    pub(crate) fn reconnects(&self) -> &Counter {
        &self.reconnects
    }

    pub(crate) fn pending_records(&self) -> &Gauge {
        &self.pending_records
    }
}

use std::{
    sync::{
        atomic::{AtomicU64, Ordering::Relaxed},
        Mutex,
    },
    time::{Duration, Instant},
};

use async_trait::async_trait;
use tracing::info;

use super::{Sink, SinkError};
use crate::record::Record;

const REPORT_INTERVAL: Duration = Duration::from_secs(1);

/// Blackhole sink.
///
/// Discards every record it receives, periodically logging how many it has seen. Useful for checking that a feed is
/// producing records without writing them anywhere.
pub struct BlackholeSink {
    received: AtomicU64,
    last_report: Mutex<Instant>,
}

impl BlackholeSink {
    /// Creates a new `BlackholeSink`.
    pub fn new() -> Self {
        Self {
            received: AtomicU64::new(0),
            last_report: Mutex::new(Instant::now()),
        }
    }

    /// Returns the number of records received so far.
    pub fn received(&self) -> u64 {
        self.received.load(Relaxed)
    }
}

#[async_trait]
impl Sink for BlackholeSink {
    fn name(&self) -> &str {
        "blackhole"
    }

    async fn append(&self, records: &[Record]) -> Result<(), SinkError> {
        let total = self.received.fetch_add(records.len() as u64, Relaxed) + records.len() as u64;

        if let Ok(mut last_report) = self.last_report.try_lock() {
            if last_report.elapsed() > REPORT_INTERVAL {
                info!("Received {} records.", total);
                *last_report = Instant::now();
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{record::TransmissionType, test_util::record};

    #[tokio::test]
    async fn counts_records() {
        let sink = BlackholeSink::new();
        sink.append(&[]).await.unwrap();
        assert_eq!(sink.received(), 0);

        let batch = vec![record(1, TransmissionType::AirbornePosition); 5];
        sink.append(&batch).await.unwrap();
        sink.append(&batch[..2]).await.unwrap();
        assert_eq!(sink.received(), 7);
    }
}

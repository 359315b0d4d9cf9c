use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use super::{Sink, SinkError};
use crate::record::Record;

/// In-memory sink.
///
/// Retains every committed batch, in commit order.
#[derive(Default)]
pub struct MemorySink {
    batches: Mutex<Vec<Vec<Record>>>,
}

impl MemorySink {
    /// Creates a new, empty `MemorySink`.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Vec<Record>>> {
        self.batches.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns a copy of every committed batch.
    pub fn batches(&self) -> Vec<Vec<Record>> {
        self.lock().clone()
    }

    /// Returns a copy of every committed record, flattened across batches.
    pub fn records(&self) -> Vec<Record> {
        self.lock().iter().flatten().cloned().collect()
    }

    /// Returns the number of committed records.
    pub fn len(&self) -> usize {
        self.lock().iter().map(Vec::len).sum()
    }

    /// Returns `true` if no records have been committed.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl Sink for MemorySink {
    fn name(&self) -> &str {
        "memory"
    }

    async fn append(&self, records: &[Record]) -> Result<(), SinkError> {
        if !records.is_empty() {
            self.lock().push(records.to_vec());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{record::TransmissionType, test_util::record};

    #[tokio::test]
    async fn retains_batches_in_order() {
        let sink = MemorySink::new();
        assert!(sink.is_empty());

        sink.append(&[record(1, TransmissionType::AirbornePosition), record(2, TransmissionType::AirborneVelocity)])
            .await
            .unwrap();
        sink.append(&[]).await.unwrap();
        sink.append(&[record(3, TransmissionType::SurveillanceId)]).await.unwrap();

        let batches = sink.batches();
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].len(), 2);
        assert_eq!(
            sink.records().iter().map(|r| r.icao_address).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
        assert_eq!(sink.len(), 3);
    }
}

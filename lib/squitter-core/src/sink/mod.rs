//! Record sinks.

use std::io;

use async_trait::async_trait;
use snafu::Snafu;

use crate::record::Record;

mod blackhole;
pub use self::blackhole::BlackholeSink;

mod jsonl;
pub use self::jsonl::JsonLinesSink;

mod memory;
pub use self::memory::MemorySink;

/// Sink error.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum SinkError {
    /// Writing to the underlying destination failed.
    #[snafu(display("failed to write batch: {}", source))]
    Io {
        /// Underlying I/O error.
        source: io::Error,
    },

    /// A record in the batch could not be encoded.
    #[snafu(display("failed to encode record: {}", source))]
    Encode {
        /// Underlying encoding error.
        source: serde_json::Error,
    },

    /// The sink is not currently able to accept records.
    #[snafu(display("sink unavailable: {}", reason))]
    Unavailable {
        /// Why the sink is unavailable.
        reason: String,
    },
}

/// A destination for batches of records.
///
/// Sinks are shared by every feed pipeline, so `append` may be called concurrently. A call either commits the whole
/// batch or returns an error; on error the caller retries the same records later, so a sink that partially commits a
/// batch before failing may see those records again.
#[async_trait]
pub trait Sink: Send + Sync {
    /// Returns the name of the sink, for logging.
    fn name(&self) -> &str;

    /// Appends a batch of records, in order.
    ///
    /// # Errors
    ///
    /// If the batch could not be committed, an error is returned.
    async fn append(&self, records: &[Record]) -> Result<(), SinkError>;
}

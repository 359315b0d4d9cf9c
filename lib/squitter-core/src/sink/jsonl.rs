use std::path::Path;

use async_trait::async_trait;
use snafu::ResultExt as _;
use tokio::{
    fs::OpenOptions,
    io::{self, AsyncWrite, AsyncWriteExt as _},
    sync::Mutex,
};

use super::{Encode, Io, Sink, SinkError};
use crate::record::Record;

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

struct WriterState {
    writer: BoxedWriter,

    // Set when a write failed after possibly writing part of a line.
    needs_delimiter: bool,
}

/// Newline-delimited JSON sink.
///
/// Each record is written as a single JSON object on its own line. A batch is encoded in full before anything is
/// written, so a record that fails to encode fails the whole batch without writing any of it.
///
/// A write that fails partway can leave a torn line behind. The next write starts with a newline to terminate it, so
/// a retried batch never shares a line with the torn fragment.
pub struct JsonLinesSink {
    name: String,
    state: Mutex<WriterState>,
}

impl JsonLinesSink {
    /// Creates a new `JsonLinesSink` that appends to the file at `path`, creating it if it does not exist.
    ///
    /// # Errors
    ///
    /// If the file cannot be opened for appending, an error is returned.
    pub async fn to_file<P: AsRef<Path>>(path: P) -> Result<Self, SinkError> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .context(Io)?;

        Ok(Self::from_writer(format!("jsonl:{}", path.display()), file))
    }

    /// Creates a new `JsonLinesSink` that writes to standard output.
    pub fn to_stdout() -> Self {
        Self::from_writer("jsonl:stdout", io::stdout())
    }

    /// Creates a new `JsonLinesSink` that writes to the given writer.
    pub fn from_writer<N, W>(name: N, writer: W) -> Self
    where
        N: Into<String>,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            name: name.into(),
            state: Mutex::new(WriterState {
                writer: Box::new(writer),
                needs_delimiter: false,
            }),
        }
    }
}

#[async_trait]
impl Sink for JsonLinesSink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn append(&self, records: &[Record]) -> Result<(), SinkError> {
        if records.is_empty() {
            return Ok(());
        }

        let mut buf = Vec::with_capacity(records.len() * 512 + 1);
        for record in records {
            serde_json::to_writer(&mut buf, record).context(Encode)?;
            buf.push(b'\n');
        }

        let mut state = self.state.lock().await;
        if state.needs_delimiter {
            buf.insert(0, b'\n');
        }

        state.needs_delimiter = true;
        state.writer.write_all(&buf).await.context(Io)?;
        state.writer.flush().await.context(Io)?;
        state.needs_delimiter = false;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::{
        pin::Pin,
        sync::{Arc, Mutex as StdMutex},
        task::{Context, Poll},
    };

    use serde_json::Value;

    use super::*;
    use crate::{record::TransmissionType, test_util::record};

    #[tokio::test]
    async fn appends_one_object_per_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("records.jsonl");

        let sink = JsonLinesSink::to_file(&path).await.unwrap();
        sink.append(&[record(0x4840D6, TransmissionType::AirbornePosition)]).await.unwrap();
        sink.append(&[]).await.unwrap();
        sink.append(&[record(0xA1B2C3, TransmissionType::AirborneVelocity), record(1, TransmissionType::SurveillanceId)])
            .await
            .unwrap();
        drop(sink);

        // Reopening appends rather than truncating.
        let sink = JsonLinesSink::to_file(&path).await.unwrap();
        sink.append(&[record(2, TransmissionType::AirToAir)]).await.unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines = contents.lines().map(|line| serde_json::from_str::<Value>(line).unwrap()).collect::<Vec<_>>();

        assert_eq!(lines.len(), 4);
        assert_eq!(lines[0]["icao_address"], 4_754_198);
        assert_eq!(lines[0]["transmission_type"], 3);
        assert_eq!(lines[0]["latitude"], 51.47123);
        assert_eq!(lines[0]["alert"], Value::Null);
        assert_eq!(lines[1]["icao_address"], 0xA1B2C3);
        assert_eq!(lines[3]["transmission_type"], 7);
        assert!(sink.name().starts_with("jsonl:"));
    }

    /// Accepts a fixed number of bytes, fails the next write once, then accepts everything.
    struct TearingWriter {
        output: Arc<StdMutex<Vec<u8>>>,
        fail_after: Option<usize>,
    }

    impl AsyncWrite for TearingWriter {
        fn poll_write(mut self: Pin<&mut Self>, _: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
            let accepted = match self.fail_after {
                Some(0) => {
                    self.fail_after = None;
                    return Poll::Ready(Err(io::Error::new(io::ErrorKind::Other, "disk full")));
                }
                Some(remaining) => {
                    let accepted = remaining.min(buf.len());
                    self.fail_after = Some(remaining - accepted);
                    accepted
                }
                None => buf.len(),
            };

            self.output.lock().unwrap().extend_from_slice(&buf[..accepted]);
            Poll::Ready(Ok(accepted))
        }

        fn poll_flush(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn retry_after_torn_write_starts_on_a_new_line() {
        let output = Arc::new(StdMutex::new(Vec::new()));
        let writer = TearingWriter {
            output: Arc::clone(&output),
            fail_after: Some(10),
        };
        let sink = JsonLinesSink::from_writer("tearing", writer);

        let batch = vec![
            record(1, TransmissionType::AirbornePosition),
            record(2, TransmissionType::AirbornePosition),
        ];
        assert!(matches!(sink.append(&batch).await, Err(SinkError::Io { .. })));
        sink.append(&batch).await.unwrap();
        sink.append(&[record(3, TransmissionType::SurveillanceId)]).await.unwrap();

        let contents = String::from_utf8(output.lock().unwrap().clone()).unwrap();
        let lines = contents.lines().collect::<Vec<_>>();
        assert_eq!(lines.len(), 4, "output: {}", contents);
        assert_eq!(lines[0].len(), 10);
        assert!(serde_json::from_str::<Value>(lines[0]).is_err());

        let addresses = lines[1..]
            .iter()
            .map(|line| serde_json::from_str::<Value>(line).unwrap()["icao_address"].as_u64().unwrap())
            .collect::<Vec<_>>();
        assert_eq!(addresses, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn writes_to_arbitrary_writer() {
        let (client, mut server) = tokio::io::duplex(64 * 1024);
        let sink = JsonLinesSink::from_writer("test", client);
        sink.append(&[record(7, TransmissionType::SurveillanceAltitude)]).await.unwrap();
        drop(sink);

        let mut output = String::new();
        tokio::io::AsyncReadExt::read_to_string(&mut server, &mut output).await.unwrap();
        assert_eq!(output.lines().count(), 1);
        assert!(output.ends_with('\n'));
    }
}

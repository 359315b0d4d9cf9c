//! Feed connections.

use std::{fmt, io, time::Duration};

use bytes::{BufMut as _, Bytes, BytesMut};
use snafu::Snafu;
use tokio::{
    io::{AsyncReadExt as _, AsyncWriteExt as _},
    net::TcpStream,
};
use tracing::{debug, info, warn};

use crate::shutdown::ShutdownSignal;

/// Default number of connection attempts before giving up.
pub const DEFAULT_CONNECT_ATTEMPT_LIMIT: usize = 10;

/// Default delay between connection attempts, and before reconnecting after a stall.
pub const DEFAULT_CONNECT_ATTEMPT_DELAY: Duration = Duration::from_secs(5);

/// Default read timeout. A read that sees no bytes for this long is treated as a dead connection.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(60);

/// Default maximum number of bytes requested per read.
pub const DEFAULT_READ_BUFFER_SIZE: usize = 100;

/// Connection error.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum ConnectError {
    /// Every connection attempt failed.
    #[snafu(display("failed to connect to {} after {} attempts: {}", address, attempts, source))]
    AttemptsExhausted {
        /// Address of the feed.
        address: String,

        /// Number of attempts made.
        attempts: usize,

        /// Error from the final attempt.
        source: io::Error,
    },

    /// Shutdown was triggered before a connection could be established.
    #[snafu(display("stopped while connecting to {}", address))]
    Stopped {
        /// Address of the feed.
        address: String,
    },
}

/// Outcome of a single read from a feed connection.
#[derive(Debug)]
pub enum ReadOutcome {
    /// Bytes were read.
    Data(Bytes),

    /// The peer closed the connection, or the connection failed in a way that means it is gone.
    Closed,

    /// No bytes arrived within the read timeout.
    TimedOut,

    /// The read failed with an error that does not imply the connection is gone.
    Interrupted(io::Error),
}

/// Connects to a BaseStation feed with a bounded retry policy.
#[derive(Clone, Debug)]
pub struct FeedConnector {
    host: String,
    port: u16,
    attempt_limit: usize,
    attempt_delay: Duration,
    read_timeout: Duration,
    read_buffer_size: usize,
}

impl FeedConnector {
    /// Creates a new `FeedConnector` for the given host and port, using the default retry policy.
    pub fn new<H: Into<String>>(host: H, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            attempt_limit: DEFAULT_CONNECT_ATTEMPT_LIMIT,
            attempt_delay: DEFAULT_CONNECT_ATTEMPT_DELAY,
            read_timeout: DEFAULT_READ_TIMEOUT,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
        }
    }

    /// Sets the number of connection attempts made before giving up.
    ///
    /// A limit of zero is treated as one.
    pub fn with_attempt_limit(mut self, attempt_limit: usize) -> Self {
        self.attempt_limit = attempt_limit.max(1);
        self
    }

    /// Sets the delay between connection attempts.
    pub fn with_attempt_delay(mut self, attempt_delay: Duration) -> Self {
        self.attempt_delay = attempt_delay;
        self
    }

    /// Sets the read timeout.
    ///
    /// The read timeout also bounds each individual connection attempt.
    pub fn with_read_timeout(mut self, read_timeout: Duration) -> Self {
        self.read_timeout = read_timeout;
        self
    }

    /// Sets the maximum number of bytes requested per read.
    ///
    /// A size of zero is treated as one.
    pub fn with_read_buffer_size(mut self, read_buffer_size: usize) -> Self {
        self.read_buffer_size = read_buffer_size.max(1);
        self
    }

    /// Returns the host of the feed.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Returns the port of the feed.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Returns the delay between connection attempts.
    pub fn attempt_delay(&self) -> Duration {
        self.attempt_delay
    }

    /// Returns the address of the feed, in `host:port` form.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Connects to the feed.
    ///
    /// Makes up to the configured number of attempts, sleeping the configured delay between them. The sleep is cut
    /// short if `shutdown` is triggered.
    ///
    /// # Errors
    ///
    /// If every attempt fails, an error is returned carrying the error from the final attempt. If shutdown is triggered
    /// while waiting to retry, `ConnectError::Stopped` is returned.
    pub async fn connect(&self, shutdown: &mut ShutdownSignal) -> Result<FeedConnection, ConnectError> {
        let address = self.address();
        let mut attempt = 0;

        loop {
            attempt += 1;
            info!(%address, attempt, limit = self.attempt_limit, "Connecting to feed.");

            let connect = TcpStream::connect((self.host.as_str(), self.port));
            let result = match tokio::time::timeout(self.read_timeout, connect).await {
                Ok(result) => result,
                Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "connection attempt timed out")),
            };

            let error = match result {
                Ok(stream) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!(%address, error = %e, "Failed to set TCP_NODELAY on feed connection.");
                    }

                    info!(%address, "Connected to feed.");
                    return Ok(FeedConnection {
                        stream,
                        address,
                        read_timeout: self.read_timeout,
                        read_buffer_size: self.read_buffer_size,
                    });
                }
                Err(e) => e,
            };

            if attempt >= self.attempt_limit {
                return Err(ConnectError::AttemptsExhausted {
                    address,
                    attempts: attempt,
                    source: error,
                });
            }

            warn!(
                %address,
                attempt,
                limit = self.attempt_limit,
                error = %error,
                "Failed to connect to feed. Retrying in {:?}.",
                self.attempt_delay
            );

            if shutdown.sleep(self.attempt_delay).await {
                return Err(ConnectError::Stopped { address });
            }
        }
    }
}

/// An established connection to a BaseStation feed.
pub struct FeedConnection {
    stream: TcpStream,
    address: String,
    read_timeout: Duration,
    read_buffer_size: usize,
}

impl FeedConnection {
    /// Returns the address of the feed, in `host:port` form.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Reads the next chunk of bytes from the feed.
    ///
    /// At most the configured read buffer size is requested. Errors that indicate the peer has gone away are reported
    /// as [`ReadOutcome::Closed`], the same as an orderly close.
    pub async fn read(&mut self) -> ReadOutcome {
        let mut buf = BytesMut::with_capacity(self.read_buffer_size);
        let mut limited = (&mut buf).limit(self.read_buffer_size);

        match tokio::time::timeout(self.read_timeout, self.stream.read_buf(&mut limited)).await {
            Err(_) => ReadOutcome::TimedOut,
            Ok(Ok(0)) => ReadOutcome::Closed,
            Ok(Ok(_)) => ReadOutcome::Data(buf.freeze()),
            Ok(Err(e)) if is_disconnect(&e) => {
                debug!(address = %self.address, error = %e, "Feed connection failed.");
                ReadOutcome::Closed
            }
            Ok(Err(e)) => ReadOutcome::Interrupted(e),
        }
    }

    /// Closes the connection.
    ///
    /// Errors during shutdown are ignored, as the connection is being discarded regardless.
    pub async fn close(mut self) {
        if let Err(e) = self.stream.shutdown().await {
            debug!(address = %self.address, error = %e, "Error while closing feed connection.");
        }
    }
}

impl fmt::Debug for FeedConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FeedConnection")
            .field("address", &self.address)
            .field("read_timeout", &self.read_timeout)
            .field("read_buffer_size", &self.read_buffer_size)
            .finish()
    }
}

fn is_disconnect(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::NotConnected
            | io::ErrorKind::UnexpectedEof
    )
}

#[cfg(test)]
mod tests {
    use tokio::{io::AsyncWriteExt as _, net::TcpListener};

    use super::*;

    async fn unused_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }

    #[tokio::test]
    async fn connects_and_reads_bounded_chunks() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            socket.write_all(b"0123456789abcdef").await.unwrap();
        });

        let (mut shutdown, _handle) = ShutdownSignal::paired();
        let connector = FeedConnector::new("127.0.0.1", port).with_read_buffer_size(4);
        let mut conn = connector.connect(&mut shutdown).await.unwrap();
        server.await.unwrap();

        let mut received = Vec::new();
        loop {
            match conn.read().await {
                ReadOutcome::Data(chunk) => {
                    assert!(chunk.len() <= 4);
                    received.extend_from_slice(&chunk);
                }
                ReadOutcome::Closed => break,
                other => panic!("unexpected read outcome: {:?}", other),
            }
        }

        assert_eq!(received, b"0123456789abcdef");
    }

    #[tokio::test]
    async fn exhausts_attempts_against_closed_port() {
        let port = unused_port().await;

        let (mut shutdown, _handle) = ShutdownSignal::paired();
        let connector = FeedConnector::new("127.0.0.1", port)
            .with_attempt_limit(3)
            .with_attempt_delay(Duration::from_millis(10));

        match connector.connect(&mut shutdown).await {
            Err(ConnectError::AttemptsExhausted { attempts, .. }) => assert_eq!(attempts, 3),
            other => panic!("expected attempts to be exhausted, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn shutdown_interrupts_retry_delay() {
        let port = unused_port().await;

        let (mut shutdown, handle) = ShutdownSignal::paired();
        let connector = FeedConnector::new("127.0.0.1", port)
            .with_attempt_limit(100)
            .with_attempt_delay(Duration::from_secs(3600));

        let attempt = tokio::spawn(async move { connector.connect(&mut shutdown).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.trigger();

        let result = tokio::time::timeout(Duration::from_secs(5), attempt).await.unwrap().unwrap();
        assert!(matches!(result, Err(ConnectError::Stopped { .. })));
    }

    #[tokio::test]
    async fn silent_feed_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_millis(500)).await;
            drop(socket);
        });

        let (mut shutdown, _handle) = ShutdownSignal::paired();
        let connector = FeedConnector::new("127.0.0.1", port).with_read_timeout(Duration::from_millis(50));
        let mut conn = connector.connect(&mut shutdown).await.unwrap();

        assert!(matches!(conn.read().await, ReadOutcome::TimedOut));
        conn.close().await;
        server.await.unwrap();
    }

    #[test]
    fn disconnect_classification() {
        assert!(is_disconnect(&io::Error::from(io::ErrorKind::ConnectionReset)));
        assert!(is_disconnect(&io::Error::from(io::ErrorKind::UnexpectedEof)));
        assert!(!is_disconnect(&io::Error::from(io::ErrorKind::Interrupted)));
        assert!(!is_disconnect(&io::Error::from(io::ErrorKind::WouldBlock)));
    }

    #[test]
    fn zero_limits_are_clamped() {
        let connector = FeedConnector::new("localhost", 30003)
            .with_attempt_limit(0)
            .with_read_buffer_size(0);
        assert_eq!(connector.attempt_limit, 1);
        assert_eq!(connector.read_buffer_size, 1);
        assert_eq!(connector.address(), "localhost:30003");
    }
}

//! Tracker connection with connect-time failover

use std::io;
use std::time::Duration;

use async_trait::async_trait;
use rand::seq::SliceRandom;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

use super::wire::{TrackerCommand, TrackerResponse, decode_response, encode_request};
use crate::MogileError;
use crate::config::{HostEndpoint, TrackerConfig};

/// Opens byte streams to tracker hosts.
///
/// Abstracted so that tests and embedders can supply in-memory or
/// pre-established transports instead of TCP.
#[async_trait]
pub trait TrackerConnector: Send + Sync {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send;

    /// Opens a stream to one tracker.
    ///
    /// # Errors
    ///
    /// - `io::Error` - If the host refuses or cannot be resolved
    async fn connect(&self, endpoint: &HostEndpoint) -> io::Result<Self::Stream>;
}

/// Plain TCP connector used against real trackers.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpConnector;

#[async_trait]
impl TrackerConnector for TcpConnector {
    type Stream = TcpStream;

    async fn connect(&self, endpoint: &HostEndpoint) -> io::Result<TcpStream> {
        let stream = TcpStream::connect((endpoint.host.as_str(), endpoint.port)).await?;
        stream.set_nodelay(true)?;
        Ok(stream)
    }
}

/// Exclusive connection to one tracker out of a candidate pool.
///
/// Starts disconnected and connects lazily. A failed request leaves the
/// connection in place; reconnecting is the caller's decision.
pub struct TrackerConnection<C: TrackerConnector = TcpConnector> {
    endpoints: Vec<HostEndpoint>,
    domain: Option<String>,
    connect_timeout: Duration,
    read_timeout: Duration,
    connector: C,
    stream: Option<BufReader<C::Stream>>,
    active_endpoint: Option<HostEndpoint>,
}

impl TrackerConnection<TcpConnector> {
    /// Creates a TCP connection pool over the configured trackers.
    pub fn new(config: &TrackerConfig) -> Self {
        Self::with_connector(config, TcpConnector)
    }
}

impl<C: TrackerConnector> TrackerConnection<C> {
    /// Creates a connection using a custom connector.
    ///
    /// The candidate order is shuffled once here, so every reconnect of
    /// this instance walks the same order.
    pub fn with_connector(config: &TrackerConfig, connector: C) -> Self {
        let mut endpoints = config.hosts.clone();
        endpoints.shuffle(&mut rand::rng());
        Self::with_ordered_endpoints(endpoints, config, connector)
    }

    /// Creates a connection that tries `endpoints` in exactly the given order.
    pub fn with_ordered_endpoints(
        endpoints: Vec<HostEndpoint>,
        config: &TrackerConfig,
        connector: C,
    ) -> Self {
        Self {
            endpoints,
            domain: config.domain.clone(),
            connect_timeout: config.connect_timeout,
            read_timeout: config.read_timeout,
            connector,
            stream: None,
            active_endpoint: None,
        }
    }

    pub fn domain(&self) -> Option<&str> {
        self.domain.as_deref()
    }

    pub fn endpoints(&self) -> &[HostEndpoint] {
        &self.endpoints
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    /// Tracker currently serving this connection, if connected.
    pub fn active_endpoint(&self) -> Option<&HostEndpoint> {
        self.active_endpoint.as_ref()
    }

    /// Connects to the first reachable tracker.
    ///
    /// No-op when already connected.
    ///
    /// # Errors
    ///
    /// - `MogileError::ConnectionFailed` - If every candidate failed; carries
    ///   the last candidate's error
    pub async fn connect(&mut self) -> Result<(), MogileError> {
        if self.stream.is_some() {
            return Ok(());
        }

        let mut last_error = None;

        for endpoint in &self.endpoints {
            tracing::debug!("Connecting to tracker {}", endpoint);

            let attempt =
                tokio::time::timeout(self.connect_timeout, self.connector.connect(endpoint)).await;

            match attempt {
                Ok(Ok(stream)) => {
                    tracing::debug!("Connected to tracker {}", endpoint);
                    self.stream = Some(BufReader::new(stream));
                    self.active_endpoint = Some(endpoint.clone());
                    return Ok(());
                }
                Ok(Err(e)) => {
                    tracing::warn!("Tracker {} failed: {}", endpoint, e);
                    last_error = Some(format!("{endpoint}: {e}"));
                }
                Err(_) => {
                    tracing::warn!(
                        "Tracker {} timed out after {:?}",
                        endpoint,
                        self.connect_timeout
                    );
                    last_error = Some(format!(
                        "{endpoint}: connect timed out after {} ms",
                        self.connect_timeout.as_millis()
                    ));
                }
            }
        }

        Err(MogileError::ConnectionFailed {
            reason: last_error.unwrap_or_else(|| "no tracker hosts configured".to_string()),
        })
    }

    /// Issues one command and waits for its reply line.
    ///
    /// Connects first when disconnected. If the read times out, any partial
    /// reply is discarded and the stream may be out of step; callers should
    /// reconnect before reusing it.
    ///
    /// # Errors
    ///
    /// - `MogileError::ConnectionFailed` - If a lazy connect failed
    /// - `MogileError::Write` - If the request could not be fully written
    /// - `MogileError::Timeout` - If no reply arrived within the read timeout
    /// - `MogileError::Read` - If the tracker closed the stream or the read failed
    /// - `MogileError::Protocol` / `MogileError::Remote` - From reply decoding
    pub async fn send(
        &mut self,
        command: TrackerCommand,
        args: &[(&str, &str)],
    ) -> Result<TrackerResponse, MogileError> {
        self.connect().await?;

        let request = encode_request(command, self.domain.as_deref(), args);
        let read_timeout = self.read_timeout;
        let stream = self.stream.as_mut().ok_or_else(|| MogileError::ConnectionFailed {
            reason: "connection not established".to_string(),
        })?;

        tracing::debug!("Tracker request: {}", request.trim_end());

        stream
            .write_all(request.as_bytes())
            .await
            .map_err(|e| MogileError::Write {
                reason: e.to_string(),
            })?;
        stream.flush().await.map_err(|e| MogileError::Write {
            reason: e.to_string(),
        })?;

        let mut reply = String::new();
        match tokio::time::timeout(read_timeout, stream.read_line(&mut reply)).await {
            Err(_) => {
                return Err(MogileError::Timeout {
                    timeout_ms: read_timeout.as_millis() as u64,
                });
            }
            Ok(Err(e)) => {
                return Err(MogileError::Read {
                    reason: e.to_string(),
                });
            }
            Ok(Ok(0)) => {
                return Err(MogileError::Read {
                    reason: "connection closed by tracker".to_string(),
                });
            }
            Ok(Ok(_)) if !reply.ends_with('\n') => {
                return Err(MogileError::Read {
                    reason: "connection closed mid-reply".to_string(),
                });
            }
            Ok(Ok(_)) => {}
        }

        tracing::debug!("Tracker reply: {}", reply.trim_end());
        decode_response(&reply)
    }

    /// Releases the transport. Safe to call repeatedly.
    pub async fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            if let Err(e) = stream.shutdown().await {
                tracing::debug!("Ignoring tracker shutdown error: {}", e);
            }
            tracing::debug!(
                "Closed tracker connection to {}",
                self.active_endpoint
                    .as_ref()
                    .map(ToString::to_string)
                    .unwrap_or_default()
            );
        }
        self.active_endpoint = None;
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::io::AsyncReadExt;

    use super::*;
    use crate::testing::QueueConnector;

    fn create_test_tracker_config() -> TrackerConfig {
        TrackerConfig {
            hosts: vec![HostEndpoint::new("t1", 7001), HostEndpoint::new("t2", 7001)],
            domain: Some("testdomain".to_string()),
            connect_timeout: Duration::from_millis(100),
            read_timeout: Duration::from_millis(500),
        }
    }

    fn refused() -> io::Error {
        io::Error::new(io::ErrorKind::ConnectionRefused, "connection refused")
    }

    #[tokio::test]
    async fn test_send_round_trip() {
        let mock = tokio_test::io::Builder::new()
            .write(b"GET_PATHS domain=testdomain&key=photo1\n")
            .read(b"OK paths=1&path1=http://10.0.0.1:7500/dev1/0/000/000/0000000001.fid\r\n")
            .build();
        let config = create_test_tracker_config();
        let connector = QueueConnector::new(vec![Ok(mock)]);
        let mut connection =
            TrackerConnection::with_ordered_endpoints(config.hosts.clone(), &config, connector);

        assert!(!connection.is_connected());
        let response = connection
            .send(TrackerCommand::GetPaths, &[("key", "photo1")])
            .await
            .unwrap();

        assert!(connection.is_connected());
        assert_eq!(response.get("paths"), Some("1"));
    }

    #[tokio::test]
    async fn test_connect_fails_over_to_next_host() {
        let config = create_test_tracker_config();
        let (client, _server) = tokio::io::duplex(64);
        let connector = QueueConnector::new(vec![Err(refused()), Ok(client)]);
        let mut connection =
            TrackerConnection::with_ordered_endpoints(config.hosts.clone(), &config, connector);

        connection.connect().await.unwrap();

        assert_eq!(
            connection.active_endpoint(),
            Some(&HostEndpoint::new("t2", 7001))
        );
    }

    #[tokio::test]
    async fn test_connect_reports_last_failure() {
        let config = create_test_tracker_config();
        let connector = QueueConnector::<tokio::io::DuplexStream>::new(vec![
            Err(io::Error::new(io::ErrorKind::Other, "first")),
            Err(io::Error::new(io::ErrorKind::Other, "second")),
        ]);
        let mut connection =
            TrackerConnection::with_ordered_endpoints(config.hosts.clone(), &config, connector);

        let result = connection.connect().await;

        assert!(matches!(
            result,
            Err(MogileError::ConnectionFailed { reason }) if reason == "t2:7001: second"
        ));
        assert!(!connection.is_connected());
    }

    #[tokio::test]
    async fn test_connect_without_hosts() {
        let mut config = create_test_tracker_config();
        config.hosts.clear();
        let mut connection = TrackerConnection::with_connector(
            &config,
            QueueConnector::<tokio::io::DuplexStream>::new(vec![]),
        );

        assert!(matches!(
            connection.connect().await,
            Err(MogileError::ConnectionFailed { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_timeout_is_distinguished() {
        let config = create_test_tracker_config();
        let (client, mut server) = tokio::io::duplex(1024);
        let connector = QueueConnector::new(vec![Ok(client)]);
        let mut connection =
            TrackerConnection::with_ordered_endpoints(config.hosts.clone(), &config, connector);

        let result = connection
            .send(TrackerCommand::GetDomains, &[])
            .await;

        assert!(matches!(result, Err(MogileError::Timeout { timeout_ms: 500 })));
        assert!(result.unwrap_err().is_retryable());
        // Failed request leaves the connection in place
        assert!(connection.is_connected());

        let mut received = vec![0u8; 64];
        let n = server.read(&mut received).await.unwrap();
        assert_eq!(&received[..n], b"GET_DOMAINS domain=testdomain\n");
    }

    #[tokio::test]
    async fn test_closed_connection_is_read_error() {
        let config = create_test_tracker_config();
        let (client, server) = tokio::io::duplex(1024);
        let connector = QueueConnector::new(vec![Ok(client)]);
        let mut connection =
            TrackerConnection::with_ordered_endpoints(config.hosts.clone(), &config, connector);
        connection.connect().await.unwrap();
        drop(server);

        let result = connection.send(TrackerCommand::Delete, &[("key", "a")]).await;

        assert!(matches!(
            result,
            Err(MogileError::Write { .. }) | Err(MogileError::Read { .. })
        ));
        assert!(!result.unwrap_err().is_retryable());
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let config = create_test_tracker_config();
        let (client, _server) = tokio::io::duplex(64);
        let connector = QueueConnector::new(vec![Ok(client)]);
        let mut connection =
            TrackerConnection::with_ordered_endpoints(config.hosts.clone(), &config, connector);
        connection.connect().await.unwrap();

        connection.close().await;
        connection.close().await;

        assert!(!connection.is_connected());
        assert!(connection.active_endpoint().is_none());
    }

    #[test]
    fn test_shuffle_keeps_all_endpoints() {
        let config = create_test_tracker_config();
        let connection = TrackerConnection::new(&config);
        assert_eq!(connection.endpoints().len(), 2);
        assert!(connection.endpoints().contains(&HostEndpoint::new("t1", 7001)));
        assert!(connection.endpoints().contains(&HostEndpoint::new("t2", 7001)));
        assert_eq!(connection.domain(), Some("testdomain"));
    }
}

//! In-memory stand-ins for trackers and storage nodes.
//!
//! Lets the full client stack run without sockets: tracker traffic goes
//! over `tokio::io::duplex` pipes and HTTP is served from a shared map.

mod cluster;
mod http;

use std::collections::VecDeque;
use std::io;

use async_trait::async_trait;
pub use cluster::{ClusterConnector, FakeCluster};
pub use http::MemoryHttp;
use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, DuplexStream};

use crate::config::{HostEndpoint, TrackerConfig};
use crate::tracker::{ObjectDirectory, TrackerConnection, TrackerConnector};

/// Connector handing out pre-built streams, one per connect attempt.
pub struct QueueConnector<S> {
    streams: Mutex<VecDeque<io::Result<S>>>,
}

impl<S> QueueConnector<S> {
    pub fn new(streams: Vec<io::Result<S>>) -> Self {
        Self {
            streams: Mutex::new(streams.into()),
        }
    }
}

#[async_trait]
impl<S> TrackerConnector for QueueConnector<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    type Stream = S;

    async fn connect(&self, _endpoint: &HostEndpoint) -> io::Result<S> {
        self.streams.lock().pop_front().unwrap_or_else(|| {
            Err(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                "no scripted stream left",
            ))
        })
    }
}

/// Spawns a tracker that expects `exchanges` in order.
///
/// Each exchange is the exact request line and the raw reply to send. An
/// unexpected request makes the tracker hang up, which the client sees as
/// a read failure.
///
/// # Panics
///
/// Must be called inside a tokio runtime.
pub fn spawn_scripted_tracker(exchanges: Vec<(&'static str, &'static str)>) -> DuplexStream {
    let (client, server) = tokio::io::duplex(64 * 1024);

    tokio::spawn(async move {
        let mut server = BufReader::new(server);
        for (expected, reply) in exchanges {
            let mut line = String::new();
            match server.read_line(&mut line).await {
                Ok(0) | Err(_) => return,
                Ok(_) => {}
            }
            if line != expected {
                tracing::error!("Scripted tracker expected {:?}, got {:?}", expected, line);
                return;
            }
            if server.write_all(reply.as_bytes()).await.is_err() {
                return;
            }
        }
    });

    client
}

/// Builds a directory wired to a scripted tracker.
pub fn scripted_directory(
    domain: Option<&str>,
    exchanges: Vec<(&'static str, &'static str)>,
) -> ObjectDirectory<QueueConnector<DuplexStream>> {
    let config = TrackerConfig {
        hosts: vec![HostEndpoint::new("scripted", 7001)],
        domain: domain.map(str::to_string),
        ..Default::default()
    };
    let connector = QueueConnector::new(vec![Ok(spawn_scripted_tracker(exchanges))]);
    ObjectDirectory::new(TrackerConnection::with_connector(&config, connector))
}

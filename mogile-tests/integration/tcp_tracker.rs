//! Tracker traffic over real TCP sockets.

use std::time::Duration;

use mogile_core::config::TrackerConfig;
use mogile_core::testing::FakeCluster;
use mogile_core::tracker::{ObjectDirectory, TcpConnector, TrackerConnection};
use mogile_core::{HostEndpoint, MogileError};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;

/// Serves `cluster`'s tracker on an ephemeral local port.
async fn spawn_tcp_tracker(cluster: FakeCluster) -> HostEndpoint {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            let cluster = cluster.clone();
            tokio::spawn(async move {
                let mut socket = BufReader::new(socket);
                let mut line = String::new();
                loop {
                    line.clear();
                    match socket.read_line(&mut line).await {
                        Ok(0) | Err(_) => break,
                        Ok(_) => {}
                    }
                    let reply = cluster.handle_line(&line);
                    if socket.write_all(reply.as_bytes()).await.is_err() {
                        break;
                    }
                }
            });
        }
    });

    HostEndpoint::new("127.0.0.1", port)
}

/// A local port with nothing listening on it.
async fn closed_port() -> HostEndpoint {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    HostEndpoint::new("127.0.0.1", port)
}

fn tracker_config(hosts: Vec<HostEndpoint>) -> TrackerConfig {
    TrackerConfig {
        hosts,
        domain: Some("testdomain".to_string()),
        connect_timeout: Duration::from_millis(500),
        read_timeout: Duration::from_secs(2),
    }
}

#[tokio::test]
async fn test_commands_over_tcp() {
    let cluster = FakeCluster::default();
    cluster.seed("doc", b"contents");
    let endpoint = spawn_tcp_tracker(cluster.clone()).await;
    let config = tracker_config(vec![endpoint.clone()]);
    let mut directory = ObjectDirectory::new(TrackerConnection::new(&config));

    let paths = directory.get_paths("doc").await.unwrap();
    let page = directory.list_keys("", None, 10).await.unwrap();

    assert_eq!(paths, cluster.replicas("doc"));
    assert_eq!(page.keys, vec!["doc"]);
    assert_eq!(directory.connection().active_endpoint(), Some(&endpoint));
}

#[tokio::test]
async fn test_failover_skips_dead_tracker() {
    let cluster = FakeCluster::default();
    let dead = closed_port().await;
    let live = spawn_tcp_tracker(cluster).await;
    let config = tracker_config(vec![dead.clone(), live.clone()]);
    let connection =
        TrackerConnection::with_ordered_endpoints(vec![dead, live.clone()], &config, TcpConnector);
    let mut directory = ObjectDirectory::new(connection);

    let domains = directory.list_domains().await.unwrap();

    assert!(domains.contains_key("testdomain"));
    assert_eq!(directory.connection().active_endpoint(), Some(&live));
}

#[tokio::test]
async fn test_all_trackers_dead() {
    let first = closed_port().await;
    let second = closed_port().await;
    let config = tracker_config(vec![first, second.clone()]);
    let connection =
        TrackerConnection::with_ordered_endpoints(config.hosts.clone(), &config, TcpConnector);
    let mut directory = ObjectDirectory::new(connection);

    let result = directory.get_paths("k").await;

    assert!(matches!(
        result,
        Err(MogileError::ConnectionFailed { reason }) if reason.starts_with(&second.to_string())
    ));
}

#[tokio::test]
async fn test_silent_tracker_times_out() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let endpoint = HostEndpoint::new("127.0.0.1", listener.local_addr().unwrap().port());
    // Accepts and then never answers
    let _server = tokio::spawn(async move {
        let (_socket, _) = listener.accept().await.unwrap();
        tokio::time::sleep(Duration::from_secs(30)).await;
    });
    let mut config = tracker_config(vec![endpoint]);
    config.read_timeout = Duration::from_millis(200);
    let mut directory = ObjectDirectory::new(TrackerConnection::new(&config));

    let result = directory.get_paths("k").await;

    assert!(matches!(result, Err(MogileError::Timeout { timeout_ms: 200 })));
}

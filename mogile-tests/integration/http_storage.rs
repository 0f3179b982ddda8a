//! reqwest transport against a minimal local storage node.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use mogile_core::MogileError;
use mogile_core::config::TransferConfig;
use mogile_core::transfer::{HttpTransport, ReqwestTransport, UploadBody, collect_stream};
use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;

/// What the storage node saw for one request.
#[derive(Debug, Clone)]
struct SeenRequest {
    method: String,
    path: String,
    headers: HashMap<String, String>,
}

#[derive(Clone, Default)]
struct StorageNode {
    objects: Arc<Mutex<HashMap<String, Bytes>>>,
    seen: Arc<Mutex<Vec<SeenRequest>>>,
}

impl StorageNode {
    /// Serves one request per connection on an ephemeral port.
    async fn spawn(&self) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let node = self.clone();

        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                let node = node.clone();
                tokio::spawn(async move {
                    let mut socket = BufReader::new(socket);
                    let _ = node.serve(&mut socket).await;
                });
            }
        });

        base
    }

    async fn serve(
        &self,
        socket: &mut BufReader<tokio::net::TcpStream>,
    ) -> std::io::Result<()> {
        let mut request_line = String::new();
        socket.read_line(&mut request_line).await?;
        let mut parts = request_line.split_whitespace();
        let method = parts.next().unwrap_or_default().to_string();
        let path = parts.next().unwrap_or_default().to_string();

        let mut headers = HashMap::new();
        loop {
            let mut line = String::new();
            socket.read_line(&mut line).await?;
            let line = line.trim_end();
            if line.is_empty() {
                break;
            }
            if let Some((name, value)) = line.split_once(':') {
                headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_string());
            }
        }

        let length: usize = headers
            .get("content-length")
            .and_then(|length| length.parse().ok())
            .unwrap_or(0);
        let mut body = vec![0u8; length];
        socket.read_exact(&mut body).await?;

        self.seen.lock().push(SeenRequest {
            method: method.clone(),
            path: path.clone(),
            headers,
        });

        let response = match method.as_str() {
            "PUT" => {
                self.objects.lock().insert(path, Bytes::from(body));
                b"HTTP/1.1 201 Created\r\nContent-Length: 0\r\nConnection: close\r\n\r\n".to_vec()
            }
            "GET" => match self.objects.lock().get(&path).cloned() {
                Some(data) => {
                    let mut response = format!(
                        "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                        data.len()
                    )
                    .into_bytes();
                    response.extend_from_slice(&data);
                    response
                }
                None => {
                    b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
                        .to_vec()
                }
            },
            _ => b"HTTP/1.1 405 Method Not Allowed\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
                .to_vec(),
        };

        let socket = socket.get_mut();
        socket.write_all(&response).await?;
        socket.shutdown().await
    }
}

fn transport() -> ReqwestTransport {
    ReqwestTransport::new(&TransferConfig {
        command_timeout: Duration::from_secs(5),
        ..Default::default()
    })
    .unwrap()
}

#[tokio::test]
async fn test_put_then_get_over_http() {
    let node = StorageNode::default();
    let base = node.spawn().await;
    let http = transport();
    let url = format!("{base}/dev1/0/000/000/0000000001.fid");

    http.put(&url, UploadBody::Bytes(Bytes::from_static(b"hello node")), 10)
        .await
        .unwrap();
    let body = collect_stream(http.get(&url).await.unwrap()).await.unwrap();

    assert_eq!(body.as_ref(), b"hello node");

    let seen = node.seen.lock().clone();
    assert_eq!(seen[0].method, "PUT");
    assert_eq!(seen[0].path, "/dev1/0/000/000/0000000001.fid");
    assert_eq!(seen[0].headers.get("content-length").map(String::as_str), Some("10"));
    assert_eq!(seen[0].headers.get("expect").map(String::as_str), Some(""));
    assert_eq!(seen[1].method, "GET");
}

#[tokio::test]
async fn test_put_streams_file_body() {
    let node = StorageNode::default();
    let base = node.spawn().await;
    let http = transport();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("upload.bin");
    let data: Vec<u8> = (0..70_000u32).map(|i| (i % 253) as u8).collect();
    tokio::fs::write(&path, &data).await.unwrap();
    let url = format!("{base}/dev2/5.fid");

    let file = tokio::fs::File::open(&path).await.unwrap();
    http.put(&url, UploadBody::File(file), data.len() as u64)
        .await
        .unwrap();

    assert_eq!(
        node.objects.lock().get("/dev2/5.fid").map(|body| body.len()),
        Some(data.len())
    );
}

#[tokio::test]
async fn test_missing_object_is_transfer_error() {
    let node = StorageNode::default();
    let base = node.spawn().await;
    let http = transport();

    let result = http.get(&format!("{base}/nothing.fid")).await;

    assert!(matches!(
        result,
        Err(MogileError::Transfer { reason, .. }) if reason.contains("404")
    ));
}

#[tokio::test]
async fn test_unreachable_node_is_transfer_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}/x.fid", listener.local_addr().unwrap());
    drop(listener);

    let result = transport().get(&url).await;

    assert!(matches!(result, Err(MogileError::Transfer { .. })));
}

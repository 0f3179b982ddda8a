//! HTTP transfer of object bytes to and from storage nodes
//!
//! The tracker only brokers locations; bytes move over plain HTTP PUT and
//! GET against the paths it returns. [`HttpTransport`] is the seam where
//! the HTTP stack plugs in.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use reqwest::header::{CONTENT_LENGTH, EXPECT, HeaderValue};

use crate::MogileError;
use crate::config::TransferConfig;

/// Finite, non-restartable stream of object bytes.
pub type ByteStream = BoxStream<'static, Result<Bytes, MogileError>>;

/// Payload of an HTTP PUT.
#[derive(Debug)]
pub enum UploadBody {
    Bytes(Bytes),
    File(tokio::fs::File),
}

/// HTTP capability consumed by [`ObjectTransfer`].
#[async_trait]
pub trait HttpTransport: Send + Sync {
    /// Uploads exactly `length` bytes to `url`.
    ///
    /// # Errors
    ///
    /// - `MogileError::Transfer` - If the request failed or returned non-2xx
    async fn put(&self, url: &str, body: UploadBody, length: u64) -> Result<(), MogileError>;

    /// Opens `url` for reading.
    ///
    /// # Errors
    ///
    /// - `MogileError::Transfer` - If the request failed or returned non-2xx
    async fn get(&self, url: &str) -> Result<ByteStream, MogileError>;
}

/// reqwest-backed transport.
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    /// Creates HTTP transport with the configured overall request timeout.
    ///
    /// # Errors
    ///
    /// - `MogileError::Configuration` - If the HTTP client cannot be built
    pub fn new(config: &TransferConfig) -> Result<Self, MogileError> {
        let client = reqwest::Client::builder()
            .timeout(config.command_timeout)
            .user_agent(config.user_agent)
            .build()
            .map_err(|e| MogileError::configuration(format!("HTTP client: {e}")))?;
        Ok(Self { client })
    }

    fn transfer_error(url: &str, error: &reqwest::Error) -> MogileError {
        let reason = if error.is_timeout() {
            format!("timed out: {error}")
        } else {
            error.to_string()
        };
        MogileError::Transfer {
            url: url.to_string(),
            reason,
        }
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn put(&self, url: &str, body: UploadBody, length: u64) -> Result<(), MogileError> {
        let body = match body {
            UploadBody::Bytes(bytes) => reqwest::Body::from(bytes),
            UploadBody::File(file) => reqwest::Body::from(file),
        };

        // Empty Expect suppresses the 100-continue round trip
        let response = self
            .client
            .put(url)
            .header(EXPECT, HeaderValue::from_static(""))
            .header(CONTENT_LENGTH, length)
            .body(body)
            .send()
            .await
            .map_err(|e| Self::transfer_error(url, &e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(MogileError::Transfer {
                url: url.to_string(),
                reason: format!("HTTP status {status}"),
            });
        }

        Ok(())
    }

    async fn get(&self, url: &str) -> Result<ByteStream, MogileError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| Self::transfer_error(url, &e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(MogileError::Transfer {
                url: url.to_string(),
                reason: format!("HTTP status {status}"),
            });
        }

        let url = url.to_string();
        Ok(response
            .bytes_stream()
            .map_err(move |e| Self::transfer_error(&url, &e))
            .boxed())
    }
}

/// Where a reproxy or passthru should read from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReproxyTarget {
    /// Resolve replica paths through the tracker
    ByKey(String),
    /// Use these replica paths as given
    ByPaths(Vec<String>),
}

impl From<&str> for ReproxyTarget {
    fn from(key: &str) -> Self {
        ReproxyTarget::ByKey(key.to_string())
    }
}

impl From<Vec<String>> for ReproxyTarget {
    fn from(paths: Vec<String>) -> Self {
        ReproxyTarget::ByPaths(paths)
    }
}

/// Candidate URLs handed to a front-end proxy instead of streaming bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReproxyUrls {
    urls: Vec<String>,
}

impl ReproxyUrls {
    /// Response header understood by reproxying front ends.
    pub const HEADER_NAME: &'static str = "X-Reproxy-URL";

    /// # Errors
    ///
    /// - `MogileError::Unavailable` - If there is no candidate URL
    pub fn new(urls: Vec<String>) -> Result<Self, MogileError> {
        if urls.is_empty() {
            return Err(MogileError::Unavailable { attempted: 0 });
        }
        Ok(Self { urls })
    }

    pub fn urls(&self) -> &[String] {
        &self.urls
    }

    /// Space separated URL list for the reproxy header.
    pub fn header_value(&self) -> String {
        self.urls.join(" ")
    }
}

/// Moves object bytes between the client and storage nodes.
pub struct ObjectTransfer<H: HttpTransport = ReqwestTransport> {
    http: H,
}

impl ObjectTransfer<ReqwestTransport> {
    /// # Errors
    ///
    /// - `MogileError::Configuration` - If the HTTP client cannot be built
    pub fn from_config(config: &TransferConfig) -> Result<Self, MogileError> {
        Ok(Self::new(ReqwestTransport::new(config)?))
    }
}

impl<H: HttpTransport> ObjectTransfer<H> {
    pub fn new(http: H) -> Self {
        Self { http }
    }

    pub fn http(&self) -> &H {
        &self.http
    }

    /// PUTs `body` to `path`, declaring `length` bytes.
    ///
    /// # Errors
    ///
    /// - `MogileError::Configuration` - If an in-memory body is not `length` bytes
    /// - `MogileError::Transfer` - If the upload failed
    pub async fn upload(&self, path: &str, body: UploadBody, length: u64) -> Result<(), MogileError> {
        if let UploadBody::Bytes(bytes) = &body
            && bytes.len() as u64 != length
        {
            return Err(MogileError::configuration(format!(
                "upload body is {} bytes, declared {length}",
                bytes.len()
            )));
        }

        tracing::debug!("Uploading {} bytes to {}", length, path);
        self.http.put(path, body, length).await
    }

    /// Opens `path` for streaming.
    ///
    /// # Errors
    ///
    /// - `MogileError::Transfer` - If the storage node could not be read
    pub async fn download(&self, path: &str) -> Result<ByteStream, MogileError> {
        tracing::debug!("Downloading {}", path);
        self.http.get(path).await
    }

    /// Opens the first replica that answers, in the given order.
    ///
    /// # Errors
    ///
    /// - `MogileError::Unavailable` - If no candidate could be opened
    pub async fn open_first(&self, paths: &[String]) -> Result<(String, ByteStream), MogileError> {
        for path in paths {
            match self.http.get(path).await {
                Ok(stream) => return Ok((path.clone(), stream)),
                Err(e) => tracing::warn!("Replica {} unreadable: {}", path, e),
            }
        }

        Err(MogileError::Unavailable {
            attempted: paths.len(),
        })
    }

    /// Reads the whole object from the first replica that answers.
    ///
    /// # Errors
    ///
    /// - `MogileError::Unavailable` - If no candidate could be opened
    /// - `MogileError::Transfer` - If the chosen replica failed mid-body
    pub async fn fetch_first(&self, paths: &[String]) -> Result<Bytes, MogileError> {
        let (_, stream) = self.open_first(paths).await?;
        collect_stream(stream).await
    }
}

/// Drains a byte stream into one buffer.
///
/// # Errors
///
/// - The first error yielded by the stream
pub async fn collect_stream(mut stream: ByteStream) -> Result<Bytes, MogileError> {
    let mut buffer = BytesMut::new();
    while let Some(chunk) = stream.next().await {
        buffer.extend_from_slice(&chunk?);
    }
    Ok(buffer.freeze())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemoryHttp;

    #[tokio::test]
    async fn test_upload_then_download() {
        let transfer = ObjectTransfer::new(MemoryHttp::default());
        let body = Bytes::from_static(b"hello storage node");

        transfer
            .upload("http://node1/dev1/1.fid", UploadBody::Bytes(body.clone()), 18)
            .await
            .unwrap();
        let stream = transfer.download("http://node1/dev1/1.fid").await.unwrap();

        assert_eq!(collect_stream(stream).await.unwrap(), body);
    }

    #[tokio::test]
    async fn test_upload_length_mismatch() {
        let transfer = ObjectTransfer::new(MemoryHttp::default());

        let result = transfer
            .upload("http://node1/x", UploadBody::Bytes(Bytes::from_static(b"abc")), 4)
            .await;

        assert!(matches!(result, Err(MogileError::Configuration { .. })));
        assert!(transfer.http().object("http://node1/x").is_none());
    }

    #[tokio::test]
    async fn test_open_first_skips_dead_replicas() {
        let http = MemoryHttp::default();
        http.insert("http://node2/1.fid", b"replica");
        let transfer = ObjectTransfer::new(http);
        let paths = vec![
            "http://node1/1.fid".to_string(),
            "http://node2/1.fid".to_string(),
        ];

        let (path, stream) = transfer.open_first(&paths).await.unwrap();

        assert_eq!(path, "http://node2/1.fid");
        assert_eq!(collect_stream(stream).await.unwrap().as_ref(), b"replica");
    }

    #[tokio::test]
    async fn test_open_first_all_dead() {
        let transfer = ObjectTransfer::new(MemoryHttp::default());
        let paths = vec!["http://a/1".to_string(), "http://b/1".to_string()];

        let result = transfer.fetch_first(&paths).await;

        assert!(matches!(result, Err(MogileError::Unavailable { attempted: 2 })));
    }

    #[tokio::test]
    async fn test_failed_read_mid_stream_is_surfaced() {
        let http = MemoryHttp::default();
        http.insert("http://node1/1.fid", b"partial body");
        http.fail_mid_stream("http://node1/1.fid");
        let transfer = ObjectTransfer::new(http);

        let stream = transfer.download("http://node1/1.fid").await.unwrap();

        assert!(matches!(
            collect_stream(stream).await,
            Err(MogileError::Transfer { .. })
        ));
    }

    #[test]
    fn test_reproxy_urls() {
        let urls = ReproxyUrls::new(vec!["http://a/1".to_string(), "http://b/1".to_string()])
            .unwrap();
        assert_eq!(ReproxyUrls::HEADER_NAME, "X-Reproxy-URL");
        assert_eq!(urls.header_value(), "http://a/1 http://b/1");
        assert!(ReproxyUrls::new(vec![]).is_err());
    }

    #[test]
    fn test_reproxy_target_conversions() {
        assert_eq!(
            ReproxyTarget::from("key"),
            ReproxyTarget::ByKey("key".to_string())
        );
        assert_eq!(
            ReproxyTarget::from(vec!["http://a".to_string()]),
            ReproxyTarget::ByPaths(vec!["http://a".to_string()])
        );
    }
}

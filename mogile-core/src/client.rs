//! Plain object store and fetch on top of tracker and storage nodes
//!
//! Every write is the three-step dance `CREATE_OPEN` → HTTP PUT →
//! `CREATE_CLOSE`; every read resolves replica paths through the tracker
//! and streams from the first storage node that answers.

use std::path::Path;

use bytes::Bytes;
use futures::StreamExt;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::MogileError;
use crate::config::MogileConfig;
use crate::tracker::{ObjectDirectory, TcpConnector, TrackerConnection, TrackerConnector};
use crate::transfer::{
    HttpTransport, ObjectTransfer, ReproxyTarget, ReproxyUrls, ReqwestTransport, UploadBody,
};

/// Client for one MogileFS domain.
///
/// Owns exactly one tracker connection, so operations take `&mut self`
/// and never overlap.
pub struct MogileClient<C: TrackerConnector = TcpConnector, H: HttpTransport = ReqwestTransport> {
    directory: ObjectDirectory<C>,
    transfer: ObjectTransfer<H>,
}

impl MogileClient<TcpConnector, ReqwestTransport> {
    /// Creates a TCP and HTTP backed client.
    ///
    /// Nothing is connected until the first request.
    ///
    /// # Errors
    ///
    /// - `MogileError::Configuration` - If the configuration is invalid
    pub fn new(config: &MogileConfig) -> Result<Self, MogileError> {
        config.validate()?;
        Ok(Self::from_parts(
            ObjectDirectory::new(TrackerConnection::new(&config.tracker)),
            ObjectTransfer::from_config(&config.transfer)?,
        ))
    }
}

impl<C: TrackerConnector, H: HttpTransport> MogileClient<C, H> {
    pub fn from_parts(directory: ObjectDirectory<C>, transfer: ObjectTransfer<H>) -> Self {
        Self {
            directory,
            transfer,
        }
    }

    pub fn directory(&self) -> &ObjectDirectory<C> {
        &self.directory
    }

    /// Tracker operations: paths, listing, rename, delete, domains.
    pub fn directory_mut(&mut self) -> &mut ObjectDirectory<C> {
        &mut self.directory
    }

    pub fn transfer(&self) -> &ObjectTransfer<H> {
        &self.transfer
    }

    /// Stores an in-memory payload under `key`.
    ///
    /// # Errors
    ///
    /// - `MogileError::Remote` - If the tracker refused to open or commit
    /// - `MogileError::Transfer` - If the storage node rejected the upload
    pub async fn store_data(
        &mut self,
        key: &str,
        class: &str,
        data: impl Into<Bytes>,
    ) -> Result<(), MogileError> {
        let data = data.into();
        let length = data.len() as u64;
        self.store_body(key, class, UploadBody::Bytes(data), length)
            .await
    }

    /// Streams a local file to storage under `key`.
    ///
    /// # Errors
    ///
    /// - `MogileError::Io` - If the file cannot be opened
    /// - Any error of [`MogileClient::store_data`]
    pub async fn store_file(
        &mut self,
        key: &str,
        class: &str,
        path: &Path,
    ) -> Result<(), MogileError> {
        let file = tokio::fs::File::open(path).await?;
        let length = file.metadata().await?.len();
        self.store_body(key, class, UploadBody::File(file), length)
            .await
    }

    async fn store_body(
        &mut self,
        key: &str,
        class: &str,
        body: UploadBody,
        length: u64,
    ) -> Result<(), MogileError> {
        let ticket = self.directory.create_open(key, class).await?;
        self.transfer.upload(&ticket.path, body, length).await?;
        self.directory.create_close(key, class, &ticket).await?;

        tracing::debug!("Stored {} ({} bytes) as fid {}", key, length, ticket.fid);
        Ok(())
    }

    /// Reads the whole object from the first readable replica.
    ///
    /// # Errors
    ///
    /// - `MogileError::Unavailable` - If the key has no readable replica
    /// - `MogileError::Transfer` - If the chosen replica failed mid-body
    pub async fn get_file_data(&mut self, key: &str) -> Result<Bytes, MogileError> {
        let paths = self.directory.get_paths(key).await?;
        self.transfer.fetch_first(&paths).await
    }

    /// Streams the object into `writer`, returning the byte count.
    ///
    /// Replicas are tried in order until one opens. Once bytes have been
    /// written no other replica is tried.
    ///
    /// # Errors
    ///
    /// - `MogileError::Unavailable` - If no replica could be opened
    /// - `MogileError::Transfer` - If the open replica failed mid-body
    /// - `MogileError::Io` - If writing to `writer` failed
    pub async fn passthru<W>(
        &mut self,
        target: ReproxyTarget,
        writer: &mut W,
    ) -> Result<u64, MogileError>
    where
        W: AsyncWrite + Unpin,
    {
        let paths = self.resolve_paths(target).await?;
        let (path, mut stream) = self.transfer.open_first(&paths).await?;

        let mut written = 0u64;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            writer.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        writer.flush().await?;

        tracing::debug!("Passed through {} bytes from {}", written, path);
        Ok(written)
    }

    /// [`MogileClient::passthru`] for a key.
    ///
    /// # Errors
    ///
    /// - Any error of [`MogileClient::passthru`]
    pub async fn passthru_file_data<W>(&mut self, key: &str, writer: &mut W) -> Result<u64, MogileError>
    where
        W: AsyncWrite + Unpin,
    {
        self.passthru(ReproxyTarget::ByKey(key.to_string()), writer)
            .await
    }

    /// Resolves the URLs a front end should serve the object from.
    ///
    /// # Errors
    ///
    /// - `MogileError::Unavailable` - If the target resolves to no URL
    pub async fn reproxy(&mut self, target: ReproxyTarget) -> Result<ReproxyUrls, MogileError> {
        ReproxyUrls::new(self.resolve_paths(target).await?)
    }

    async fn resolve_paths(&mut self, target: ReproxyTarget) -> Result<Vec<String>, MogileError> {
        match target {
            ReproxyTarget::ByKey(key) => self.directory.get_paths(&key).await,
            ReproxyTarget::ByPaths(paths) => Ok(paths),
        }
    }

    pub async fn close(&mut self) {
        self.directory.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeCluster;

    #[tokio::test]
    async fn test_store_and_fetch() {
        let cluster = FakeCluster::default();
        let mut client = cluster.client(&MogileConfig::for_testing());

        client
            .store_data("greeting", "default", &b"hello mogile"[..])
            .await
            .unwrap();

        assert_eq!(cluster.keys(), vec!["greeting"]);
        assert_eq!(
            client.get_file_data("greeting").await.unwrap().as_ref(),
            b"hello mogile"
        );
        assert_eq!(cluster.replicas("greeting").len(), 3);
    }

    #[tokio::test]
    async fn test_store_file() {
        let cluster = FakeCluster::default();
        let mut client = cluster.client(&MogileConfig::for_testing());
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.txt");
        tokio::fs::write(&path, b"quarterly numbers").await.unwrap();

        client.store_file("report", "default", &path).await.unwrap();

        assert_eq!(
            client.get_file_data("report").await.unwrap().as_ref(),
            b"quarterly numbers"
        );
    }

    #[tokio::test]
    async fn test_get_missing_key_is_unavailable() {
        let cluster = FakeCluster::default();
        let mut client = cluster.client(&MogileConfig::for_testing());

        let result = client.get_file_data("nothing").await;

        assert!(matches!(result, Err(MogileError::Unavailable { attempted: 0 })));
    }

    #[tokio::test]
    async fn test_fetch_fails_over_to_second_replica() {
        let cluster = FakeCluster::default();
        cluster.seed("doc", b"replicated");
        let replicas = cluster.replicas("doc");
        cluster.http().make_unreadable(&replicas[0]);
        let mut client = cluster.client(&MogileConfig::for_testing());

        assert_eq!(
            client.get_file_data("doc").await.unwrap().as_ref(),
            b"replicated"
        );
        assert_eq!(cluster.http().gets(), replicas[..2].to_vec());
    }

    #[tokio::test]
    async fn test_passthru_streams_into_writer() {
        let cluster = FakeCluster::default();
        cluster.seed("video", b"frame data");
        let mut client = cluster.client(&MogileConfig::for_testing());
        let mut sink = Vec::new();

        let written = client.passthru_file_data("video", &mut sink).await.unwrap();

        assert_eq!(written, 10);
        assert_eq!(sink, b"frame data");
    }

    #[tokio::test]
    async fn test_passthru_does_not_fall_back_mid_stream() {
        let cluster = FakeCluster::default();
        cluster.seed("video", b"0123456789");
        let replicas = cluster.replicas("video");
        cluster.http().fail_mid_stream(&replicas[0]);
        let mut client = cluster.client(&MogileConfig::for_testing());
        let mut sink = Vec::new();

        let result = client
            .passthru(ReproxyTarget::ByPaths(replicas.clone()), &mut sink)
            .await;

        assert!(matches!(result, Err(MogileError::Transfer { .. })));
        assert_eq!(sink, b"01234");
        assert_eq!(cluster.http().gets(), vec![replicas[0].clone()]);
    }

    #[tokio::test]
    async fn test_reproxy_by_key_and_paths() {
        let cluster = FakeCluster::default();
        cluster.seed("img", b"png");
        let mut client = cluster.client(&MogileConfig::for_testing());

        let by_key = client.reproxy(ReproxyTarget::from("img")).await.unwrap();
        assert_eq!(by_key.urls(), cluster.replicas("img").as_slice());
        // No bytes move for a reproxy
        assert!(cluster.http().gets().is_empty());

        let by_paths = client
            .reproxy(ReproxyTarget::ByPaths(vec!["http://x/1".to_string()]))
            .await
            .unwrap();
        assert_eq!(by_paths.header_value(), "http://x/1");

        let missing = client.reproxy(ReproxyTarget::from("ghost")).await;
        assert!(matches!(missing, Err(MogileError::Unavailable { attempted: 0 })));
    }

    #[tokio::test]
    async fn test_unreachable_tracker() {
        let cluster = FakeCluster::default();
        cluster.set_unreachable(true);
        let mut client = cluster.client(&MogileConfig::for_testing());

        let result = client.store_data("k", "default", Bytes::from_static(b"x")).await;

        assert!(matches!(result, Err(MogileError::ConnectionFailed { .. })));
        assert!(cluster.http().puts().is_empty());
    }

    #[test]
    fn test_new_rejects_empty_tracker_list() {
        let result = MogileClient::new(&MogileConfig::default());
        assert!(matches!(result, Err(MogileError::Configuration { .. })));
    }
}

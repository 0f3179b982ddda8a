//! Chunked store and reassembly of payloads above the big-file threshold

use std::path::{Path, PathBuf};

use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use rand::seq::SliceRandom;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use super::manifest::{
    BigFileManifest, ChunkChecksum, ChunkDescriptor, chunk_key, info_key, pre_key,
};
use crate::MogileError;
use crate::client::MogileClient;
use crate::config::BigFileConfig;
use crate::tracker::{TcpConnector, TrackerConnector};
use crate::transfer::{HttpTransport, ReqwestTransport};

/// Splits big payloads into chunk objects plus a manifest, and back.
pub struct BigFileCodec<C: TrackerConnector = TcpConnector, H: HttpTransport = ReqwestTransport> {
    client: MogileClient<C, H>,
    config: BigFileConfig,
}

impl<C: TrackerConnector, H: HttpTransport> BigFileCodec<C, H> {
    /// # Errors
    ///
    /// - `MogileError::Configuration` - If the chunking limits are inconsistent
    pub fn new(client: MogileClient<C, H>, config: BigFileConfig) -> Result<Self, MogileError> {
        config.validate()?;
        Ok(Self { client, config })
    }

    pub fn client(&self) -> &MogileClient<C, H> {
        &self.client
    }

    pub fn client_mut(&mut self) -> &mut MogileClient<C, H> {
        &mut self.client
    }

    pub fn into_client(self) -> MogileClient<C, H> {
        self.client
    }

    pub fn config(&self) -> &BigFileConfig {
        &self.config
    }

    /// Sets the size above which payloads count as big.
    ///
    /// # Errors
    ///
    /// - `MogileError::Configuration` - If below 64 MiB or below the chunk size
    pub fn set_big_threshold(&mut self, bytes: u64) -> Result<(), MogileError> {
        if bytes < BigFileConfig::MIN_BIG_THRESHOLD {
            return Err(MogileError::configuration(format!(
                "big threshold must be at least {} bytes",
                BigFileConfig::MIN_BIG_THRESHOLD
            )));
        }
        self.update(|config| config.big_threshold = bytes)
    }

    /// # Errors
    ///
    /// - `MogileError::Configuration` - If zero, above the big threshold or
    ///   above the maximum buffer size
    pub fn set_chunk_size(&mut self, bytes: u64) -> Result<(), MogileError> {
        self.update(|config| config.chunk_size = bytes)
    }

    pub fn set_replication_wait(&mut self, polls: u64) {
        self.config.replication_wait_secs = polls;
    }

    fn update(&mut self, change: impl FnOnce(&mut BigFileConfig)) -> Result<(), MogileError> {
        let mut candidate = self.config.clone();
        change(&mut candidate);
        candidate.validate()?;
        self.config = candidate;
        Ok(())
    }

    /// Stores `total_size` bytes from `source` as chunks of `key`.
    ///
    /// Writes the `_big_pre` marker, uploads every chunk, waits for each to
    /// replicate, stores the manifest and finally drops the marker. On any
    /// failure the chunks already written stay in place.
    ///
    /// # Errors
    ///
    /// - `MogileError::Configuration` - If the payload is not above the big
    ///   threshold or `source` does not hold exactly `total_size` bytes
    /// - `MogileError::ReplicationTimeout` - If a chunk stayed under-replicated
    /// - `MogileError::Cancelled` - If `cancel` fired while waiting
    /// - Any error of the plain store path
    pub async fn store<R>(
        &mut self,
        key: &str,
        class: &str,
        mut source: R,
        filename: &str,
        total_size: u64,
        cancel: &CancellationToken,
    ) -> Result<BigFileManifest, MogileError>
    where
        R: AsyncRead + Unpin,
    {
        if total_size <= self.config.big_threshold {
            return Err(MogileError::configuration(format!(
                "{total_size} bytes is not above the big threshold of {} bytes",
                self.config.big_threshold
            )));
        }
        self.config.validate()?;

        let started = chrono::Utc::now().timestamp();
        self.client
            .store_data(&pre_key(key), class, format!("starttime: {started}"))
            .await?;

        tracing::info!(
            "Storing {} ({} bytes) in chunks of {} bytes",
            key,
            total_size,
            self.config.chunk_size
        );

        let mut uploaded = Vec::new();
        let mut remaining = total_size;
        let mut index = 0u32;
        while remaining > 0 {
            index += 1;
            let want = remaining.min(self.config.chunk_size);

            let mut buffer = Vec::with_capacity(want as usize);
            (&mut source).take(want).read_to_end(&mut buffer).await?;
            if buffer.len() as u64 != want {
                return Err(MogileError::configuration(format!(
                    "source ended after {} of {total_size} bytes",
                    total_size - remaining + buffer.len() as u64
                )));
            }

            let checksum = ChunkChecksum::compute(&buffer);
            self.client
                .store_data(&chunk_key(key, index), class, Bytes::from(buffer))
                .await?;
            tracing::debug!("Uploaded chunk {} of {} ({} bytes)", index, key, want);

            uploaded.push((index, want, checksum));
            remaining -= want;
        }

        let mut probe = [0u8; 1];
        if source.read(&mut probe).await? != 0 {
            return Err(MogileError::configuration(format!(
                "source holds more than the declared {total_size} bytes"
            )));
        }

        let mut chunks = Vec::with_capacity(uploaded.len());
        for (index, byte_length, checksum) in uploaded {
            let paths = self.await_replication(key, index, cancel).await?;
            chunks.push(ChunkDescriptor {
                index,
                byte_length,
                checksum,
                paths,
            });
        }

        let manifest = BigFileManifest::new(filename, total_size, chunks);
        self.client
            .store_data(&info_key(key), class, manifest.render())
            .await?;
        self.client.directory_mut().delete(&pre_key(key)).await?;

        tracing::info!("Stored {} as {} chunks", key, manifest.chunk_count());
        Ok(manifest)
    }

    /// Stores a local file, taking size and name from the file itself.
    ///
    /// # Errors
    ///
    /// - `MogileError::Io` - If the file cannot be opened
    /// - Any error of [`BigFileCodec::store`]
    pub async fn store_file(
        &mut self,
        key: &str,
        class: &str,
        path: &Path,
        cancel: &CancellationToken,
    ) -> Result<BigFileManifest, MogileError> {
        let file = tokio::fs::File::open(path).await?;
        let total_size = file.metadata().await?.len();
        let filename = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .ok_or_else(|| {
                MogileError::configuration(format!("'{}' has no file name", path.display()))
            })?;

        self.store(key, class, file, &filename, total_size, cancel)
            .await
    }

    /// Polls until chunk `index` has enough distinct replicas.
    ///
    /// One poll per interval, at most `replication_wait_secs` polls.
    async fn await_replication(
        &mut self,
        key: &str,
        index: u32,
        cancel: &CancellationToken,
    ) -> Result<Vec<String>, MogileError> {
        let chunk = chunk_key(key, index);

        for _ in 0..self.config.replication_wait_secs {
            let mut distinct: Vec<String> = Vec::new();
            for path in self.client.directory_mut().get_paths(&chunk).await? {
                if !distinct.contains(&path) {
                    distinct.push(path);
                }
            }
            if distinct.len() >= self.config.replication_target {
                return Ok(distinct);
            }

            tracing::debug!(
                "Chunk {} has {} of {} replicas",
                chunk,
                distinct.len(),
                self.config.replication_target
            );
            tokio::select! {
                _ = cancel.cancelled() => return Err(MogileError::Cancelled),
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }

        tracing::warn!(
            "Chunk {} did not replicate within {} polls",
            chunk,
            self.config.replication_wait_secs
        );
        Err(MogileError::ReplicationTimeout {
            index,
            waited_secs: self.config.replication_wait_secs,
        })
    }

    /// Fetches and parses the manifest of `key` without touching chunks.
    ///
    /// # Errors
    ///
    /// - `MogileError::Unavailable` - If the manifest has no readable replica
    /// - `MogileError::Protocol` - If the manifest is malformed or incomplete
    pub async fn parse_manifest(&mut self, key: &str) -> Result<BigFileManifest, MogileError> {
        let data = self.client.get_file_data(&info_key(key)).await?;
        let text = std::str::from_utf8(&data)
            .map_err(|_| MogileError::protocol(format!("manifest of '{key}' is not UTF-8")))?;
        let manifest = BigFileManifest::parse(text)?;

        if manifest.compressed {
            return Err(MogileError::protocol(format!(
                "manifest of '{key}' describes compressed data"
            )));
        }
        if manifest.file_type != BigFileManifest::FILE_TYPE {
            return Err(MogileError::protocol(format!(
                "manifest of '{key}' has unsupported type '{}'",
                manifest.file_type
            )));
        }
        Ok(manifest)
    }

    /// Reassembles `key` into `destination`.
    ///
    /// The manifest is validated before any chunk is downloaded. Chunks are
    /// verified against their recorded length and MD5 before being written.
    ///
    /// # Errors
    ///
    /// - `MogileError::Protocol` - If the manifest is malformed
    /// - `MogileError::Integrity` - If a chunk does not match its record
    /// - `MogileError::Unavailable` - If no replica of a chunk could be opened
    /// - `MogileError::Io` - If writing to `destination` failed
    pub async fn retrieve<W>(
        &mut self,
        key: &str,
        destination: &mut W,
    ) -> Result<BigFileManifest, MogileError>
    where
        W: AsyncWrite + Unpin,
    {
        let manifest = self.parse_manifest(key).await?;
        self.reassemble(&manifest, destination).await?;
        Ok(manifest)
    }

    /// Reassembles `key` into `dir`, named after the stored file name.
    ///
    /// Chunks go to a hidden `.<name>.partial` sibling that is renamed over
    /// the target only once every chunk verified. On failure the sibling is
    /// removed and an existing file of the same name is left untouched.
    ///
    /// # Errors
    ///
    /// - `MogileError::Protocol` - If the stored file name has no final component
    /// - Any error of [`BigFileCodec::retrieve`]
    pub async fn retrieve_to_dir(&mut self, key: &str, dir: &Path) -> Result<PathBuf, MogileError> {
        let manifest = self.parse_manifest(key).await?;
        let filename = Path::new(&manifest.filename)
            .file_name()
            .ok_or_else(|| {
                MogileError::protocol(format!(
                    "stored file name '{}' is unusable",
                    manifest.filename
                ))
            })?;
        let target = dir.join(filename);
        let staging = dir.join(format!(".{}.partial", filename.to_string_lossy()));

        let mut file = tokio::fs::File::create(&staging).await?;
        let written = match self.reassemble(&manifest, &mut file).await {
            Ok(()) => file.sync_all().await.map_err(MogileError::from),
            Err(e) => Err(e),
        };
        drop(file);

        if let Err(e) = written {
            if let Err(remove_error) = tokio::fs::remove_file(&staging).await {
                tracing::warn!(
                    "Could not remove partial file {}: {}",
                    staging.display(),
                    remove_error
                );
            }
            return Err(e);
        }

        tokio::fs::rename(&staging, &target).await?;
        tracing::info!("Reassembled {} into {}", key, target.display());
        Ok(target)
    }

    async fn reassemble<W>(
        &self,
        manifest: &BigFileManifest,
        destination: &mut W,
    ) -> Result<(), MogileError>
    where
        W: AsyncWrite + Unpin,
    {
        for chunk in &manifest.chunks {
            if chunk.byte_length > self.config.max_buffer_size {
                return Err(MogileError::configuration(format!(
                    "chunk {} is {} bytes, above the buffer limit of {}",
                    chunk.index, chunk.byte_length, self.config.max_buffer_size
                )));
            }

            let data = self.fetch_chunk(chunk).await?;
            destination.write_all(&data).await?;
            tracing::debug!(
                "Wrote chunk {} of {} ({} bytes)",
                chunk.index,
                manifest.chunk_count(),
                data.len()
            );
        }

        destination.flush().await?;
        Ok(())
    }

    /// Downloads one chunk from a random replica and verifies it.
    async fn fetch_chunk(&self, chunk: &ChunkDescriptor) -> Result<Bytes, MogileError> {
        let mut candidates = chunk.paths.clone();
        candidates.shuffle(&mut rand::rng());

        let (path, mut stream) = self.client.transfer().open_first(&candidates).await?;

        let mut buffer = BytesMut::with_capacity(chunk.byte_length as usize);
        while let Some(piece) = stream.next().await {
            buffer.extend_from_slice(&piece?);
            if buffer.len() as u64 > chunk.byte_length {
                return Err(MogileError::Integrity {
                    index: chunk.index,
                    reason: format!("{path} returned more than {} bytes", chunk.byte_length),
                });
            }
        }

        if buffer.len() as u64 != chunk.byte_length {
            return Err(MogileError::Integrity {
                index: chunk.index,
                reason: format!(
                    "{path} returned {} bytes, expected {}",
                    buffer.len(),
                    chunk.byte_length
                ),
            });
        }

        let checksum = ChunkChecksum::compute(&buffer);
        if checksum != chunk.checksum {
            return Err(MogileError::Integrity {
                index: chunk.index,
                reason: format!("md5 {checksum} from {path}, expected {}", chunk.checksum),
            });
        }

        Ok(buffer.freeze())
    }
}

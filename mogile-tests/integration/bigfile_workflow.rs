//! Chunked big-file round trips through the fake cluster.

use mogile_core::bigfile::{chunk_key, info_key};
use mogile_core::testing::{ClusterConnector, FakeCluster, MemoryHttp};
use mogile_core::{BigFileCodec, BigFileManifest, MogileConfig, MogileError};
use tokio_util::sync::CancellationToken;

fn create_codec(cluster: &FakeCluster) -> BigFileCodec<ClusterConnector, MemoryHttp> {
    let config = MogileConfig::for_testing();
    BigFileCodec::new(cluster.client(&config), config.big_file).unwrap()
}

fn payload(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
        .collect()
}

#[tokio::test]
async fn test_chunk_count_follows_size() {
    let cluster = FakeCluster::default();
    let mut codec = create_codec(&cluster);
    let cancel = CancellationToken::new();

    for (n, total) in [1025usize, 2048, 2049, 4000].into_iter().enumerate() {
        let key = format!("file{n}");
        let data = payload(total, n as u8);

        let manifest = codec
            .store(&key, "default", &data[..], "blob.bin", total as u64, &cancel)
            .await
            .unwrap();

        assert_eq!(manifest.chunk_count() as usize, total.div_ceil(1024));
        let mut restored = Vec::new();
        codec.retrieve(&key, &mut restored).await.unwrap();
        assert_eq!(restored, data);
    }
}

#[tokio::test]
async fn test_retrieve_survives_dead_replica() {
    let cluster = FakeCluster::default();
    let mut codec = create_codec(&cluster);
    let data = payload(3000, 7);
    codec
        .store("vid", "default", &data[..], "vid.mp4", 3000, &CancellationToken::new())
        .await
        .unwrap();

    // One storage node loses every chunk replica it held
    for index in 1..=3 {
        let replicas = cluster.replicas(&chunk_key("vid", index));
        cluster.http().make_unreadable(&replicas[0]);
    }

    for _ in 0..4 {
        let mut restored = Vec::new();
        codec.retrieve("vid", &mut restored).await.unwrap();
        assert_eq!(restored, data);
    }
}

#[tokio::test]
async fn test_stored_manifest_text() {
    let cluster = FakeCluster::default();
    let mut codec = create_codec(&cluster);
    let data = payload(1500, 1);
    let manifest = codec
        .store("notes", "default", &data[..], "notes.txt", 1500, &CancellationToken::new())
        .await
        .unwrap();

    let stored = codec
        .client_mut()
        .get_file_data(&info_key("notes"))
        .await
        .unwrap();
    let text = String::from_utf8(stored.to_vec()).unwrap();

    assert!(text.starts_with(
        "des no description\ntype file\ncompressed 0\nfilename notes.txt\nchunks 2\nsize 1500\n\npart 1 bytes=1024 md5="
    ));
    assert_eq!(BigFileManifest::parse(&text).unwrap(), manifest);
}

#[tokio::test]
async fn test_corruption_on_every_replica_is_detected() {
    let cluster = FakeCluster::default();
    let mut codec = create_codec(&cluster);
    let data = payload(2500, 3);
    codec
        .store("db", "default", &data[..], "db.dump", 2500, &CancellationToken::new())
        .await
        .unwrap();
    for path in cluster.replicas(&chunk_key("db", 1)) {
        cluster.http().corrupt(&path, 1000);
    }

    let mut restored = Vec::new();
    let result = codec.retrieve("db", &mut restored).await;

    assert!(matches!(result, Err(MogileError::Integrity { index: 1, .. })));
    assert!(restored.is_empty());
}

#[tokio::test]
async fn test_missing_manifest_is_unavailable() {
    let cluster = FakeCluster::default();
    let mut codec = create_codec(&cluster);

    let result = codec.parse_manifest("never-stored").await;

    assert!(matches!(result, Err(MogileError::Unavailable { attempted: 0 })));
}

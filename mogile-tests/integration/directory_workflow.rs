//! Directory operations end to end: store, list, rename, delete.

use std::collections::BTreeSet;

use mogile_core::testing::FakeCluster;
use mogile_core::{MogileConfig, MogileError};
use proptest::prelude::*;

#[tokio::test]
async fn test_object_lifecycle() {
    let cluster = FakeCluster::default();
    let config = MogileConfig::for_testing();
    let mut client = cluster.client(&config);

    client
        .store_data("photos/cat.jpg", "default", &b"meow"[..])
        .await
        .unwrap();
    assert_eq!(
        client.directory_mut().get_paths("photos/cat.jpg").await.unwrap().len(),
        3
    );

    client
        .directory_mut()
        .rename("photos/cat.jpg", "photos/kitten.jpg")
        .await
        .unwrap();
    assert!(
        client
            .directory_mut()
            .get_paths("photos/cat.jpg")
            .await
            .unwrap()
            .is_empty()
    );
    assert_eq!(
        client.get_file_data("photos/kitten.jpg").await.unwrap().as_ref(),
        b"meow"
    );

    client.directory_mut().delete("photos/kitten.jpg").await.unwrap();
    assert!(cluster.keys().is_empty());

    let again = client.directory_mut().delete("photos/kitten.jpg").await;
    assert!(matches!(
        again,
        Err(MogileError::Remote { message }) if message.contains("unknown_key")
    ));

    // A refused request leaves the connection usable
    client.store_data("next", "default", &b"x"[..]).await.unwrap();
}

#[tokio::test]
async fn test_domains_from_cluster() {
    let cluster = FakeCluster::default();
    cluster.add_class("testdomain", "thumbs", 1);
    cluster.add_class("archive", "cold", 3);
    let mut client = cluster.client(&MogileConfig::for_testing());

    let domains = client.directory_mut().list_domains().await.unwrap();

    assert_eq!(domains.len(), 2);
    assert_eq!(domains["testdomain"]["default"], 2);
    assert_eq!(domains["testdomain"]["thumbs"], 1);
    assert_eq!(domains["archive"]["cold"], 3);
}

#[tokio::test]
async fn test_requests_carry_domain_first() {
    let cluster = FakeCluster::default();
    let mut client = cluster.client(&MogileConfig::for_testing());

    client.directory_mut().get_paths("a b").await.unwrap();

    assert_eq!(
        cluster.requests(),
        vec!["GET_PATHS domain=testdomain&key=a+b".to_string()]
    );
}

#[tokio::test]
async fn test_reconnect_after_tracker_outage() {
    let cluster = FakeCluster::default();
    let mut client = cluster.client(&MogileConfig::for_testing());
    cluster.set_unreachable(true);

    let result = client.directory_mut().get_paths("k").await;
    assert!(matches!(result, Err(MogileError::ConnectionFailed { .. })));

    cluster.set_unreachable(false);
    client.directory_mut().reconnect().await.unwrap();
    assert!(client.directory_mut().get_paths("k").await.unwrap().is_empty());
}

fn list_everything(keys: &BTreeSet<String>, prefix: &str, limit: u32) -> Vec<String> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();

    runtime.block_on(async {
        let cluster = FakeCluster::default();
        for key in keys {
            cluster.seed(key, b"");
        }
        let mut directory = cluster.directory(&MogileConfig::for_testing());
        directory.list_all_keys(prefix, limit).await.unwrap()
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn test_pagination_lists_every_key_once(
        keys in proptest::collection::btree_set("[ab][a-z0-9]{0,6}", 0..40),
        limit in 1u32..8,
    ) {
        let listed = list_everything(&keys, "a", limit);

        let expected: Vec<String> = keys.iter().filter(|key| key.starts_with('a')).cloned().collect();
        prop_assert_eq!(listed, expected);
    }
}

//! Cache policies driven by the shared instrumented loaders.

use rushline_core::keys::cache_lock_key;
use rushline_storage::{CachePolicy, CacheSource, CacheStore, InMemoryKvStore, KvStore};
use rushline_test_utils::assertions::assert_loader_error;
use rushline_test_utils::fixtures::test_config;
use rushline_test_utils::{CountingLoader, FailingLoader};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

const PREFIX: &str = "cache:shop:";
const TTL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Shop {
    id: u64,
    name: String,
}

fn shop(id: u64) -> Shop {
    Shop {
        id,
        name: format!("shop-{}", id),
    }
}

fn cache() -> (Arc<InMemoryKvStore>, CacheStore) {
    let store = Arc::new(InMemoryKvStore::new());
    let cache = CacheStore::new(store.clone(), test_config().cache);
    (store, cache)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_hundred_readers_one_slow_load() {
    let (_store, cache) = cache();
    let loader = Arc::new(
        CountingLoader::new([(1u64, shop(1))]).with_delay(Duration::from_millis(200)),
    );

    let mut readers = Vec::new();
    for _ in 0..100 {
        let cache = cache.clone();
        let loader = loader.clone();
        readers.push(tokio::spawn(async move {
            cache
                .query_cached::<u64, Shop, _>(PREFIX, &1, TTL, CachePolicy::Mutex, &loader)
                .await
        }));
    }
    for reader in readers {
        assert_eq!(reader.await.unwrap().unwrap(), Some(shop(1)));
    }
    assert_eq!(loader.calls(), 1);
}

#[tokio::test]
async fn test_missing_id_hits_loader_once_then_negative_cache() {
    let (_store, cache) = cache();
    let loader = Arc::new(CountingLoader::<Shop>::new([]));

    for _ in 0..10 {
        let read = cache
            .read::<u64, Shop, _>(PREFIX, &404, TTL, CachePolicy::Mutex, &loader)
            .await
            .unwrap();
        assert!(read.value().is_none());
    }
    assert_eq!(loader.calls(), 1);

    let read = cache
        .read::<u64, Shop, _>(PREFIX, &404, TTL, CachePolicy::PassThrough, &loader)
        .await
        .unwrap();
    assert_eq!(read.source(), CacheSource::NegativeCache);
    assert_eq!(loader.calls(), 1);
}

#[tokio::test]
async fn test_failed_mutex_load_releases_lock() {
    let (store, cache) = cache();
    let failing = Arc::new(FailingLoader::erroring());

    let result = cache
        .query_cached::<u64, Shop, _>(PREFIX, &5, TTL, CachePolicy::Mutex, &failing)
        .await;
    assert_loader_error(&result);
    assert_eq!(failing.calls(), 1);
    assert_eq!(
        store.get(&cache_lock_key(PREFIX, "5")).await.unwrap(),
        None
    );

    let loader = Arc::new(CountingLoader::new([(5u64, shop(5))]));
    let value = cache
        .query_cached::<u64, Shop, _>(PREFIX, &5, TTL, CachePolicy::Mutex, &loader)
        .await
        .unwrap();
    assert_eq!(value, Some(shop(5)));
}

#[tokio::test]
async fn test_panicking_pass_through_load_is_an_error() {
    let (_store, cache) = cache();
    let panicking = Arc::new(FailingLoader::panicking());

    let result = cache
        .query_cached::<u64, Shop, _>(PREFIX, &6, TTL, CachePolicy::PassThrough, &panicking)
        .await;
    assert_loader_error(&result);
}

#[tokio::test]
async fn test_update_then_invalidate_reloads_new_value() {
    let (_store, cache) = cache();
    let old = Arc::new(CountingLoader::new([(7u64, shop(7))]));
    cache
        .query_cached::<u64, Shop, _>(PREFIX, &7, TTL, CachePolicy::PassThrough, &old)
        .await
        .unwrap();

    let renamed = Shop {
        id: 7,
        name: "renamed".to_string(),
    };
    let new = Arc::new(CountingLoader::new([(7u64, renamed.clone())]));
    assert!(cache.invalidate(PREFIX, &7u64).await.unwrap());

    let value = cache
        .query_cached::<u64, Shop, _>(PREFIX, &7, TTL, CachePolicy::PassThrough, &new)
        .await
        .unwrap();
    assert_eq!(value, Some(renamed));
    assert_eq!(new.calls(), 1);
}

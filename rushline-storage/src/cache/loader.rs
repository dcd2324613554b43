//! Loader seam between the cache and durable storage.

use async_trait::async_trait;
use rushline_core::RushlineResult;
use serde::{de::DeserializeOwned, Serialize};
use std::fmt::Display;
use std::future::Future;

/// Marker trait for types that can be cached.
///
/// Blanket-implemented for anything JSON-serializable, cloneable and
/// thread-safe.
pub trait CacheableValue: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {}

impl<T> CacheableValue for T where T: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {}

/// Marker trait for cache ids.
pub trait CacheId: Display + Clone + Send + Sync + 'static {}

impl<K> CacheId for K where K: Display + Clone + Send + Sync + 'static {}

/// Resolves an id from durable storage. `Ok(None)` means the id does not exist.
#[async_trait]
pub trait Loader<K: CacheId, T: CacheableValue>: Send + Sync + 'static {
    async fn load(&self, id: &K) -> RushlineResult<Option<T>>;
}

/// Adapts an async closure into a [`Loader`].
pub struct FnLoader<F> {
    f: F,
}

impl<F> FnLoader<F> {
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<K, T, F, Fut> Loader<K, T> for FnLoader<F>
where
    K: CacheId,
    T: CacheableValue,
    F: Fn(K) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = RushlineResult<Option<T>>> + Send + 'static,
{
    async fn load(&self, id: &K) -> RushlineResult<Option<T>> {
        (self.f)(id.clone()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fn_loader_passes_id() {
        let loader = FnLoader::new(|id: u64| async move {
            Ok::<_, rushline_core::RushlineError>(if id == 1 {
                Some(format!("shop-{}", id))
            } else {
                None
            })
        });
        assert_eq!(loader.load(&1u64).await.unwrap().as_deref(), Some("shop-1"));
        assert_eq!(Loader::<u64, String>::load(&loader, &2).await.unwrap(), None);
    }
}

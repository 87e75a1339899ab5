//! Short-lived snapshot cache over object-storage listings.
//!
//! Listing tens of thousands of keys is the expensive call in the resolve
//! path, so snapshots are shared across requests under a single-flight rule
//! and served stale for a short window when a refresh fails.

use crate::singleflight::Singleflight;
use crate::storage::client::{ObjectRecord, StorageError};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::warn;

/// Listing capability, injectable so the cache is testable in isolation.
#[async_trait]
pub trait ObjectLister: Send + Sync {
    async fn list_prefix(
        &self,
        prefix: &str,
        max_keys: usize,
    ) -> Result<Vec<ObjectRecord>, StorageError>;
}

#[async_trait]
impl ObjectLister for super::StorageClient {
    async fn list_prefix(
        &self,
        prefix: &str,
        max_keys: usize,
    ) -> Result<Vec<ObjectRecord>, StorageError> {
        self.list_objects(prefix, max_keys).await
    }
}

#[derive(Clone)]
struct Snapshot {
    records: Arc<Vec<ObjectRecord>>,
    expires_at: Instant,
}

/// Extra lifetime granted to a stale snapshot when its refresh fails.
const STALE_EXTENSION: Duration = Duration::from_secs(15);

#[derive(Clone)]
pub struct StorageIndexCache {
    lister: Arc<dyn ObjectLister>,
    ttl: Duration,
    max_keys_per_prefix: usize,
    snapshots: Arc<Mutex<HashMap<String, Snapshot>>>,
    flight: Singleflight<String, Result<Arc<Vec<ObjectRecord>>, Arc<StorageError>>>,
}

impl StorageIndexCache {
    pub fn new(lister: Arc<dyn ObjectLister>, ttl: Duration, max_keys_per_prefix: usize) -> Self {
        Self {
            lister,
            ttl,
            max_keys_per_prefix,
            snapshots: Arc::new(Mutex::new(HashMap::new())),
            flight: Singleflight::new(),
        }
    }

    /// Keys under `prefixes` minus `exclude_prefixes`, at most `ttl` old
    /// unless the backing store is failing.
    pub async fn list_keys(
        &self,
        prefixes: &[String],
        exclude_prefixes: &[String],
    ) -> Result<Arc<Vec<ObjectRecord>>, Arc<StorageError>> {
        let cache_key = format!("{}|{}", prefixes.join(","), exclude_prefixes.join(","));

        if let Some(fresh) = self.fresh_snapshot(&cache_key).await {
            return Ok(fresh);
        }

        let lister = self.lister.clone();
        let snapshots = self.snapshots.clone();
        let ttl = self.ttl;
        let max_keys = self.max_keys_per_prefix;
        let prefixes = prefixes.to_vec();
        let excludes = exclude_prefixes.to_vec();
        let key_for_job = cache_key.clone();

        self.flight
            .run(cache_key, move || async move {
                // A joiner may land right after the leader refreshed.
                if let Some(fresh) = fresh_snapshot_in(&snapshots, &key_for_job).await {
                    return Ok(fresh);
                }
                match refresh(&*lister, &prefixes, &excludes, max_keys).await {
                    Ok(records) => {
                        let records = Arc::new(records);
                        let mut guard = snapshots.lock().await;
                        guard.insert(
                            key_for_job,
                            Snapshot {
                                records: records.clone(),
                                expires_at: Instant::now() + ttl,
                            },
                        );
                        Ok(records)
                    }
                    Err(err) => {
                        let mut guard = snapshots.lock().await;
                        if let Some(stale) = guard.get_mut(&key_for_job) {
                            warn!(
                                target = "vitrine.storage",
                                error = %err,
                                "index refresh failed, serving stale snapshot"
                            );
                            stale.expires_at = Instant::now() + STALE_EXTENSION;
                            return Ok(stale.records.clone());
                        }
                        Err(Arc::new(err))
                    }
                }
            })
            .await
    }

    /// Drops every snapshot; used between test runs and by operators after
    /// bulk uploads.
    pub async fn clear(&self) {
        self.snapshots.lock().await.clear();
    }

    async fn fresh_snapshot(&self, cache_key: &str) -> Option<Arc<Vec<ObjectRecord>>> {
        fresh_snapshot_in(&self.snapshots, cache_key).await
    }
}

async fn fresh_snapshot_in(
    snapshots: &Mutex<HashMap<String, Snapshot>>,
    cache_key: &str,
) -> Option<Arc<Vec<ObjectRecord>>> {
    let guard = snapshots.lock().await;
    guard
        .get(cache_key)
        .filter(|snap| snap.expires_at > Instant::now())
        .map(|snap| snap.records.clone())
}

async fn refresh(
    lister: &dyn ObjectLister,
    prefixes: &[String],
    excludes: &[String],
    max_keys: usize,
) -> Result<Vec<ObjectRecord>, StorageError> {
    let mut all = Vec::new();
    for prefix in prefixes {
        let records = lister.list_prefix(prefix, max_keys).await?;
        all.extend(
            records
                .into_iter()
                .filter(|rec| !excludes.iter().any(|ex| rec.key.starts_with(ex.as_str()))),
        );
    }
    Ok(all)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingLister {
        calls: AtomicUsize,
        fail: std::sync::atomic::AtomicBool,
    }

    impl CountingLister {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                fail: std::sync::atomic::AtomicBool::new(false),
            })
        }
    }

    #[async_trait]
    impl ObjectLister for CountingLister {
        async fn list_prefix(
            &self,
            prefix: &str,
            _max_keys: usize,
        ) -> Result<Vec<ObjectRecord>, StorageError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail.load(Ordering::SeqCst) {
                return Err(StorageError::Unavailable(503));
            }
            Ok(vec![
                ObjectRecord {
                    key: format!("{prefix}a.webp"),
                    size: 10,
                    last_modified: "2026-01-01T00:00:00Z".into(),
                },
                ObjectRecord {
                    key: "logo/brand.png".into(),
                    size: 5,
                    last_modified: "2026-01-01T00:00:00Z".into(),
                },
            ])
        }
    }

    fn cache_with(lister: Arc<CountingLister>, ttl: Duration) -> StorageIndexCache {
        StorageIndexCache::new(lister, ttl, 1000)
    }

    #[tokio::test]
    async fn snapshot_is_reused_within_ttl() {
        let lister = CountingLister::new();
        let cache = cache_with(lister.clone(), Duration::from_secs(60));
        let prefixes = vec!["imagens/".to_string()];

        let first = cache.list_keys(&prefixes, &[]).await.unwrap();
        let second = cache.list_keys(&prefixes, &[]).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(lister.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exclusion_prefixes_are_filtered() {
        let lister = CountingLister::new();
        let cache = cache_with(lister, Duration::from_secs(60));
        let records = cache
            .list_keys(&["imagens/".to_string()], &["logo/".to_string()])
            .await
            .unwrap();
        assert!(records.iter().all(|r| !r.key.starts_with("logo/")));
        assert_eq!(records.len(), 1);
    }

    #[tokio::test]
    async fn stale_snapshot_survives_refresh_failure() {
        let lister = CountingLister::new();
        let cache = cache_with(lister.clone(), Duration::from_millis(1));
        let prefixes = vec!["imagens/".to_string()];

        let first = cache.list_keys(&prefixes, &[]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        lister.fail.store(true, Ordering::SeqCst);

        let served = cache.list_keys(&prefixes, &[]).await.unwrap();
        assert_eq!(first, served);
    }

    #[tokio::test]
    async fn refresh_failure_without_snapshot_propagates() {
        let lister = CountingLister::new();
        lister.fail.store(true, Ordering::SeqCst);
        let cache = cache_with(lister, Duration::from_secs(60));
        let err = cache
            .list_keys(&["imagens/".to_string()], &[])
            .await
            .unwrap_err();
        assert!(matches!(*err, StorageError::Unavailable(_)));
    }

    #[tokio::test]
    async fn concurrent_misses_share_one_listing() {
        let lister = CountingLister::new();
        let cache = cache_with(lister.clone(), Duration::from_secs(60));
        let prefixes = vec!["imagens/".to_string()];

        let mut handles = Vec::new();
        for _ in 0..6 {
            let cache = cache.clone();
            let prefixes = prefixes.clone();
            handles.push(tokio::spawn(async move {
                cache.list_keys(&prefixes, &[]).await
            }));
        }
        for handle in handles {
            assert!(handle.await.unwrap().is_ok());
        }
        assert_eq!(lister.calls.load(Ordering::SeqCst), 1);
    }
}

//! Tiered resolution of a product description to a canonical image asset.
//!
//! Tier order: approved registry binding, search-term cache, fuzzy reuse of
//! an existing storage object, external candidate search. Earlier tiers are
//! cheaper and more trusted; the first hit wins and later tiers never run.
//! Side effects are additive only (cache/registry upserts), and expensive
//! fetch-and-upload work is coalesced per target storage key.

use crate::cutout::{CutoutError, CutoutPipeline, decode_image, encode_png};
use crate::http::build_media_client;
use crate::llm::{VisionError, VisionValidator, VisionVerdict};
use crate::matcher::{FuzzyKeyMatcher, is_processed_key};
use crate::metrics;
use crate::models::{BgPolicy, ResolveRequest, ResolveResponse, ResolveSource};
use crate::normalize::{
    build_expanded_candidates, build_identity_key, smart_asset_key, source_derived_key,
};
use crate::search::{CandidateImage, SearchClient, SearchError};
use crate::singleflight::Singleflight;
use crate::storage::config::{INDEX_EXCLUDE_PREFIXES, INDEX_PREFIXES};
use crate::storage::{StorageClient, StorageError, StorageIndexCache};
use crate::store::{CacheEntry, RegistryEntry, RegistryStatus, Store, StoreError};
use async_trait::async_trait;
use chrono::Utc;
use rand::Rng;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, info, warn};

const MAX_TERM_LEN: usize = 300;
const RETRY_ATTEMPTS: u32 = 3;
const PUBLISHED_CONTENT_TYPE: &str = "image/png";

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("rate limited by an upstream provider")]
    RateLimited { retry_after: Option<u64> },
    #[error("transient upstream failure: {0}")]
    Transient(String),
    #[error("background removal did not pass the quality gates")]
    QualityGate,
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<StorageError> for ResolveError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::RateLimited { retry_after } => Self::RateLimited { retry_after },
            other => Self::Transient(other.to_string()),
        }
    }
}

impl From<CutoutError> for ResolveError {
    fn from(err: CutoutError) -> Self {
        match err {
            CutoutError::QualityGate => Self::QualityGate,
            CutoutError::RateLimited => Self::RateLimited { retry_after: None },
            other => Self::Transient(other.to_string()),
        }
    }
}

impl From<SearchError> for ResolveError {
    fn from(err: SearchError) -> Self {
        match err {
            SearchError::RateLimited { retry_after } => Self::RateLimited { retry_after },
            other => Self::Transient(other.to_string()),
        }
    }
}

/// Storage operations the resolver needs, injectable for tests.
#[async_trait]
pub trait AssetStore: Send + Sync {
    fn public_url(&self, key: &str) -> String;
    async fn get_object(&self, key: &str) -> Result<Vec<u8>, StorageError>;
    async fn put_object(
        &self,
        key: &str,
        body: Vec<u8>,
        content_type: &str,
    ) -> Result<(), StorageError>;
    async fn head_object(&self, key: &str) -> Result<bool, StorageError>;
}

#[async_trait]
impl AssetStore for StorageClient {
    fn public_url(&self, key: &str) -> String {
        StorageClient::public_url(self, key)
    }

    async fn get_object(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        StorageClient::get_object(self, key).await
    }

    async fn put_object(
        &self,
        key: &str,
        body: Vec<u8>,
        content_type: &str,
    ) -> Result<(), StorageError> {
        StorageClient::put_object(self, key, body, content_type).await
    }

    async fn head_object(&self, key: &str) -> Result<bool, StorageError> {
        StorageClient::head_object(self, key).await
    }
}

#[async_trait]
pub trait CandidateSearch: Send + Sync {
    async fn search(
        &self,
        request: &ResolveRequest,
    ) -> Result<Vec<CandidateImage>, SearchError>;
}

#[async_trait]
impl CandidateSearch for SearchClient {
    async fn search(
        &self,
        request: &ResolveRequest,
    ) -> Result<Vec<CandidateImage>, SearchError> {
        SearchClient::search(self, request).await
    }
}

#[async_trait]
pub trait CandidateValidator: Send + Sync {
    async fn pick_best(
        &self,
        request: &ResolveRequest,
        candidates: &[CandidateImage],
    ) -> Result<Option<VisionVerdict>, VisionError>;
}

#[async_trait]
impl CandidateValidator for VisionValidator {
    async fn pick_best(
        &self,
        request: &ResolveRequest,
        candidates: &[CandidateImage],
    ) -> Result<Option<VisionVerdict>, VisionError> {
        VisionValidator::pick_best(self, request, candidates).await
    }
}

#[async_trait]
pub trait ImageFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, ResolveError>;
}

pub struct HttpImageFetcher {
    http: reqwest::Client,
}

impl Default for HttpImageFetcher {
    fn default() -> Self {
        Self {
            http: build_media_client(),
        }
    }
}

#[async_trait]
impl ImageFetcher for HttpImageFetcher {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, ResolveError> {
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|err| ResolveError::Transient(err.to_string()))?;
        if !response.status().is_success() {
            return Err(ResolveError::Transient(format!(
                "image download failed: HTTP {}",
                response.status()
            )));
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|err| ResolveError::Transient(err.to_string()))?;
        Ok(bytes.to_vec())
    }
}

type SharedJobResult = Result<String, Arc<ResolveError>>;

pub struct Resolver {
    store: Store,
    storage: Option<Arc<dyn AssetStore>>,
    index: Option<StorageIndexCache>,
    matcher: FuzzyKeyMatcher,
    search: Option<Arc<dyn CandidateSearch>>,
    vision: Option<Arc<dyn CandidateValidator>>,
    fetcher: Arc<dyn ImageFetcher>,
    cutout: Arc<CutoutPipeline>,
    jobs: Singleflight<String, SharedJobResult>,
}

impl Resolver {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Store,
        storage: Option<Arc<dyn AssetStore>>,
        index: Option<StorageIndexCache>,
        search: Option<Arc<dyn CandidateSearch>>,
        vision: Option<Arc<dyn CandidateValidator>>,
        fetcher: Arc<dyn ImageFetcher>,
        cutout: Arc<CutoutPipeline>,
    ) -> Self {
        Self {
            store,
            storage,
            index,
            matcher: FuzzyKeyMatcher::default(),
            search,
            vision,
            fetcher,
            cutout,
            jobs: Singleflight::new(),
        }
    }

    pub fn from_env(store: Store) -> Self {
        let client = StorageClient::from_env().map(Arc::new);
        let index = client.as_ref().map(|c| {
            StorageIndexCache::new(
                c.clone(),
                Duration::from_secs(crate::storage::config::index_ttl_secs()),
                crate::storage::config::list_max_keys_per_prefix(),
            )
        });
        let storage: Option<Arc<dyn AssetStore>> = client.map(|c| c as Arc<dyn AssetStore>);
        let search: Option<Arc<dyn CandidateSearch>> =
            SearchClient::from_env().map(|c| Arc::new(c) as Arc<dyn CandidateSearch>);
        let vision: Option<Arc<dyn CandidateValidator>> =
            VisionValidator::from_env().map(|v| Arc::new(v) as Arc<dyn CandidateValidator>);
        Self::new(
            store,
            storage,
            index,
            search,
            vision,
            Arc::new(HttpImageFetcher::default()),
            Arc::new(CutoutPipeline::from_env()),
        )
    }

    pub async fn resolve(
        &self,
        request: &ResolveRequest,
    ) -> Result<ResolveResponse, ResolveError> {
        let term = request.term.trim();
        if term.is_empty() {
            return Err(ResolveError::InvalidInput("empty term".into()));
        }
        if term.len() > MAX_TERM_LEN {
            return Err(ResolveError::InvalidInput(format!(
                "term exceeds {MAX_TERM_LEN} bytes"
            )));
        }

        let identity_key = build_identity_key(
            term,
            request.brand.as_deref(),
            request.flavor.as_deref(),
            request.weight.as_deref(),
            request.product_code.as_deref(),
        );
        let candidates = build_expanded_candidates(
            term,
            request.brand.as_deref(),
            request.flavor.as_deref(),
            request.weight.as_deref(),
        );
        let mut misses: Vec<&'static str> = Vec::new();

        if let Some(response) = self.registry_tier(&identity_key).await? {
            return Ok(response);
        }
        misses.push("no approved registry entry");

        if let Some(response) = self.cache_tier(&candidates).await? {
            return Ok(response);
        }
        misses.push("cache miss");

        match self.fuzzy_tier(request, &identity_key, &candidates).await {
            Ok(Some(response)) => return Ok(response),
            Ok(None) => misses.push("no reusable storage asset"),
            Err(err @ ResolveError::QualityGate) => return Err(err),
            Err(err @ ResolveError::RateLimited { .. }) => return Err(err),
            Err(err) => {
                warn!(target = "vitrine.resolver", error = %err, "fuzzy_tier_failed");
                misses.push("storage tier unavailable");
            }
        }

        match self
            .external_tier(request, &identity_key, &candidates)
            .await?
        {
            ExternalOutcome::Resolved(response) => Ok(response),
            ExternalOutcome::Miss(reason) => {
                misses.push(reason);
                Ok(ResolveResponse {
                    found: false,
                    url: None,
                    source: None,
                    review_pending: None,
                    reason: Some(misses.join("; ")),
                })
            }
        }
    }

    async fn registry_tier(
        &self,
        identity_key: &str,
    ) -> Result<Option<ResolveResponse>, ResolveError> {
        let started = Instant::now();
        let hit = self.store.registry_get_approved(identity_key).await?;
        metrics::tier_elapsed("registry", started.elapsed().as_millis());
        let Some(entry) = hit else {
            return Ok(None);
        };
        metrics::tier_hit("registry");
        info!(
            target = "vitrine.resolver",
            identity_key = %identity_key,
            storage_key = %entry.storage_key,
            "registry_hit"
        );
        Ok(Some(ResolveResponse {
            found: true,
            url: Some(self.asset_url(&entry.storage_key)),
            source: Some(ResolveSource::Registry),
            review_pending: None,
            reason: None,
        }))
    }

    async fn cache_tier(
        &self,
        candidates: &[String],
    ) -> Result<Option<ResolveResponse>, ResolveError> {
        let started = Instant::now();
        for variant in candidates {
            if let Some(entry) = self.store.cache_hit(variant).await? {
                metrics::tier_elapsed("cache", started.elapsed().as_millis());
                metrics::tier_hit("cache");
                debug!(
                    target = "vitrine.resolver",
                    variant = %variant,
                    usage = entry.usage_count,
                    "cache_hit"
                );
                return Ok(Some(ResolveResponse {
                    found: true,
                    url: Some(entry.image_url),
                    source: Some(ResolveSource::Cache),
                    review_pending: None,
                    reason: None,
                }));
            }
        }
        metrics::tier_elapsed("cache", started.elapsed().as_millis());
        Ok(None)
    }

    async fn fuzzy_tier(
        &self,
        request: &ResolveRequest,
        identity_key: &str,
        candidates: &[String],
    ) -> Result<Option<ResolveResponse>, ResolveError> {
        let (Some(index), Some(storage)) = (self.index.as_ref(), self.storage.as_ref()) else {
            return Ok(None);
        };
        let started = Instant::now();
        let records = index
            .list_keys(&INDEX_PREFIXES, &INDEX_EXCLUDE_PREFIXES)
            .await
            .map_err(|err| ResolveError::Transient(err.to_string()))?;
        let matched = self.matcher.find_best_match(candidates, &records);
        metrics::tier_elapsed("storage-fuzzy", started.elapsed().as_millis());
        let Some(matched) = matched else {
            return Ok(None);
        };
        metrics::tier_hit("storage-fuzzy");
        info!(
            target = "vitrine.resolver",
            matched = %matched,
            "storage_fuzzy_hit"
        );

        let needs_cutout =
            !is_processed_key(&matched) && request.bg_policy != BgPolicy::Never;
        let (final_key, url) = if needs_cutout {
            let target = smart_asset_key(&request.term, identity_key, 1, "png");
            let url = self
                .shared_asset_job(target.clone(), {
                    let storage = storage.clone();
                    let cutout = self.cutout.clone();
                    let source_key = matched.clone();
                    let target = target.clone();
                    let strict = request.bg_policy == BgPolicy::Always;
                    move || async move {
                        reprocess_stored_asset(storage, cutout, source_key, target, strict).await
                    }
                })
                .await?;
            (target, url)
        } else {
            (matched.clone(), self.asset_url(&matched))
        };

        let search_term = candidates.first().cloned().unwrap_or_default();
        self.store
            .cache_upsert(&CacheEntry {
                search_term,
                product_name: request.term.trim().to_string(),
                brand: request.brand.clone(),
                flavor: request.flavor.clone(),
                weight: request.weight.clone(),
                image_url: url.clone(),
                storage_key: final_key.clone(),
                source: "storage-fuzzy".into(),
                usage_count: 1,
            })
            .await?;
        self.store
            .registry_upsert(&RegistryEntry {
                identity_key: identity_key.to_string(),
                product_code: request.product_code.clone(),
                canonical_name: request.term.trim().to_string(),
                brand: request.brand.clone(),
                flavor: request.flavor.clone(),
                weight: request.weight.clone(),
                storage_key: final_key,
                source: "storage-fuzzy".into(),
                validation_level: "storage-fuzzy".into(),
                validated_at: None,
                validated_by: None,
                status: RegistryStatus::ReviewPending.as_str().to_string(),
                reason: Some("fuzzy storage match awaiting confirmation".into()),
            })
            .await?;

        Ok(Some(ResolveResponse {
            found: true,
            url: Some(url),
            source: Some(ResolveSource::StorageFuzzy),
            review_pending: Some(true),
            reason: None,
        }))
    }

    async fn external_tier(
        &self,
        request: &ResolveRequest,
        identity_key: &str,
        candidates: &[String],
    ) -> Result<ExternalOutcome, ResolveError> {
        let Some(search) = self.search.as_ref() else {
            return Ok(ExternalOutcome::Miss("no search provider configured"));
        };
        let started = Instant::now();
        let search_ref: &dyn CandidateSearch = &**search;
        let results = with_retries(
            RETRY_ATTEMPTS,
            || search_ref.search(request),
            SearchError::is_transient,
        )
        .await?;
        metrics::tier_elapsed("external", started.elapsed().as_millis());
        if results.is_empty() {
            return Ok(ExternalOutcome::Miss("no gate-passing search candidates"));
        }

        let (chosen, verdict) = if request.strict_mode {
            let Some(vision) = self.vision.as_ref() else {
                return Ok(ExternalOutcome::Miss(
                    "strict mode requires visual validation, none configured",
                ));
            };
            match vision.pick_best(request, &results).await {
                Ok(Some(verdict)) => {
                    let chosen = results
                        .get(verdict.best_index)
                        .cloned()
                        .ok_or_else(|| {
                            ResolveError::Transient("validator index out of range".into())
                        })?;
                    (chosen, Some(verdict))
                }
                Ok(None) => {
                    return Ok(ExternalOutcome::Miss("no candidate passed visual validation"));
                }
                Err(VisionError::RateLimited { retry_after }) => {
                    return Err(ResolveError::RateLimited { retry_after });
                }
                Err(err) => {
                    warn!(target = "vitrine.resolver", error = %err, "vision_unavailable");
                    return Ok(ExternalOutcome::Miss("visual validation unavailable"));
                }
            }
        } else {
            (results[0].clone(), None)
        };

        let (url, storage_key) = match self.storage.as_ref() {
            Some(storage) => {
                let target = source_derived_key(&chosen.url, "png");
                let url = self
                    .shared_asset_job(target.clone(), {
                        let storage = storage.clone();
                        let cutout = self.cutout.clone();
                        let fetcher = self.fetcher.clone();
                        let source_url = chosen.url.clone();
                        let target = target.clone();
                        let policy = request.bg_policy;
                        move || async move {
                            publish_external_asset(
                                storage, cutout, fetcher, source_url, target, policy,
                            )
                            .await
                        }
                    })
                    .await?;
                (url, target)
            }
            // Without object storage the candidate URL is served as-is.
            None => (chosen.url.clone(), String::new()),
        };
        metrics::tier_hit("external");

        let search_term = candidates.first().cloned().unwrap_or_default();
        self.store
            .cache_upsert(&CacheEntry {
                search_term,
                product_name: request.term.trim().to_string(),
                brand: request.brand.clone(),
                flavor: request.flavor.clone(),
                weight: request.weight.clone(),
                image_url: url.clone(),
                storage_key: storage_key.clone(),
                source: "external".into(),
                usage_count: 1,
            })
            .await?;

        let mut review_pending = None;
        if let Some(verdict) = verdict {
            let (status, reason) = if verdict.exact_match {
                (RegistryStatus::Approved, None)
            } else {
                review_pending = Some(true);
                let reason = if verdict.mismatch_reasons.is_empty() {
                    "visual match not exact".to_string()
                } else {
                    verdict.mismatch_reasons.join("; ")
                };
                (RegistryStatus::ReviewPending, Some(reason))
            };
            self.store
                .registry_upsert(&RegistryEntry {
                    identity_key: identity_key.to_string(),
                    product_code: request.product_code.clone(),
                    canonical_name: request.term.trim().to_string(),
                    brand: request.brand.clone(),
                    flavor: request.flavor.clone(),
                    weight: request.weight.clone(),
                    storage_key,
                    source: "external".into(),
                    validation_level: "ai-validated".into(),
                    validated_at: Some(Utc::now()),
                    validated_by: Some("ai-validator".into()),
                    status: status.as_str().to_string(),
                    reason,
                })
                .await?;
        }

        Ok(ExternalOutcome::Resolved(ResolveResponse {
            found: true,
            url: Some(url),
            source: Some(ResolveSource::External),
            review_pending,
            reason: None,
        }))
    }

    /// Runs `make` at most once per `target_key` across concurrent requests.
    async fn shared_asset_job<F, Fut>(
        &self,
        target_key: String,
        make: F,
    ) -> Result<String, ResolveError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<String, ResolveError>> + Send + 'static,
    {
        let job = {
            let fut = make();
            move || async move { fut.await.map_err(Arc::new) }
        };
        match self.jobs.run(target_key, job).await {
            Ok(url) => Ok(url),
            Err(shared) => Err(clone_resolve_error(&shared)),
        }
    }

    fn asset_url(&self, key: &str) -> String {
        match self.storage.as_ref() {
            Some(storage) => storage.public_url(key),
            None => format!(
                "{}/{}",
                crate::storage::config::S3_PUBLIC_BASE_URL.trim_end_matches('/'),
                key
            ),
        }
    }
}

enum ExternalOutcome {
    Resolved(ResolveResponse),
    Miss(&'static str),
}

/// Fetches a raw stored asset, runs the cascade and republishes it under a
/// processed key.
async fn reprocess_stored_asset(
    storage: Arc<dyn AssetStore>,
    cutout: Arc<CutoutPipeline>,
    source_key: String,
    target_key: String,
    strict: bool,
) -> Result<String, ResolveError> {
    if storage.head_object(&target_key).await.unwrap_or(false) {
        return Ok(storage.public_url(&target_key));
    }
    let raw = with_retries(
        RETRY_ATTEMPTS,
        || storage.get_object(&source_key),
        StorageError::is_transient,
    )
    .await?;
    let outcome = cutout.run(&raw, strict).await?;
    debug!(
        target = "vitrine.resolver",
        strategy = ?outcome.strategy,
        key = %target_key,
        "stored_asset_reprocessed"
    );
    let png = encode_png(&outcome.image)?;
    storage
        .put_object(&target_key, png, PUBLISHED_CONTENT_TYPE)
        .await?;
    Ok(storage.public_url(&target_key))
}

/// Downloads an external candidate, applies the background policy and
/// publishes the result.
async fn publish_external_asset(
    storage: Arc<dyn AssetStore>,
    cutout: Arc<CutoutPipeline>,
    fetcher: Arc<dyn ImageFetcher>,
    source_url: String,
    target_key: String,
    policy: BgPolicy,
) -> Result<String, ResolveError> {
    if storage.head_object(&target_key).await.unwrap_or(false) {
        return Ok(storage.public_url(&target_key));
    }
    let raw = fetcher.fetch(&source_url).await?;
    let png = match policy {
        BgPolicy::Never => encode_png(&decode_image(&raw)?)?,
        BgPolicy::Auto | BgPolicy::Always => {
            let outcome = cutout.run(&raw, policy == BgPolicy::Always).await?;
            debug!(
                target = "vitrine.resolver",
                strategy = ?outcome.strategy,
                key = %target_key,
                "external_asset_processed"
            );
            encode_png(&outcome.image)?
        }
    };
    storage
        .put_object(&target_key, png, PUBLISHED_CONTENT_TYPE)
        .await?;
    Ok(storage.public_url(&target_key))
}

fn clone_resolve_error(err: &ResolveError) -> ResolveError {
    match err {
        ResolveError::InvalidInput(msg) => ResolveError::InvalidInput(msg.clone()),
        ResolveError::RateLimited { retry_after } => ResolveError::RateLimited {
            retry_after: *retry_after,
        },
        ResolveError::Transient(msg) => ResolveError::Transient(msg.clone()),
        ResolveError::QualityGate => ResolveError::QualityGate,
        ResolveError::Store(inner) => ResolveError::Transient(inner.to_string()),
    }
}

/// Retries transient failures with exponential backoff and jitter.
async fn with_retries<T, E, Fut>(
    max_attempts: u32,
    make: impl Fn() -> Fut,
    transient: impl Fn(&E) -> bool,
) -> Result<T, E>
where
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempt = 0;
    loop {
        match make().await {
            Ok(value) => return Ok(value),
            Err(err) if attempt + 1 < max_attempts && transient(&err) => {
                attempt += 1;
                let base = 200u64 << attempt;
                let jitter = rand::rng().random_range(0..100u64);
                sleep(Duration::from_millis(base + jitter)).await;
            }
            Err(err) => return Err(err),
        }
    }
}

//! Cache and registry persistence.
//!
//! Two tables with independent unique keys: `image_cache` keyed by the
//! normalized search term (opportunistic reuse, no workflow) and
//! `image_registry` keyed by the identity key (validated bindings with an
//! approval workflow). All writes are parameterized upserts; nothing here
//! ever deletes a row.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct CacheEntry {
    pub search_term: String,
    pub product_name: String,
    pub brand: Option<String>,
    pub flavor: Option<String>,
    pub weight: Option<String>,
    pub image_url: String,
    pub storage_key: String,
    pub source: String,
    pub usage_count: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryStatus {
    Approved,
    ReviewPending,
    Rejected,
}

impl RegistryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Approved => "approved",
            Self::ReviewPending => "review_pending",
            Self::Rejected => "rejected",
        }
    }

    pub fn parse(input: &str) -> Option<Self> {
        match input {
            "approved" => Some(Self::Approved),
            "review_pending" => Some(Self::ReviewPending),
            "rejected" => Some(Self::Rejected),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct RegistryEntry {
    pub identity_key: String,
    pub product_code: Option<String>,
    pub canonical_name: String,
    pub brand: Option<String>,
    pub flavor: Option<String>,
    pub weight: Option<String>,
    pub storage_key: String,
    pub source: String,
    pub validation_level: String,
    pub validated_at: Option<DateTime<Utc>>,
    pub validated_by: Option<String>,
    pub status: String,
    pub reason: Option<String>,
}

impl RegistryEntry {
    pub fn is_approved(&self) -> bool {
        self.status == RegistryStatus::Approved.as_str()
    }
}

#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(url)
            .await?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// Private in-memory database, one connection so state is shared.
    pub async fn in_memory() -> Result<Self, StoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS image_cache (
                search_term  TEXT PRIMARY KEY,
                product_name TEXT NOT NULL,
                brand        TEXT,
                flavor       TEXT,
                weight       TEXT,
                image_url    TEXT NOT NULL,
                storage_key  TEXT NOT NULL,
                source       TEXT NOT NULL,
                usage_count  INTEGER NOT NULL DEFAULT 1
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS image_registry (
                identity_key     TEXT PRIMARY KEY,
                product_code     TEXT,
                canonical_name   TEXT NOT NULL,
                brand            TEXT,
                flavor           TEXT,
                weight           TEXT,
                storage_key      TEXT NOT NULL,
                source           TEXT NOT NULL,
                validation_level TEXT NOT NULL,
                validated_at     TEXT,
                validated_by     TEXT,
                status           TEXT NOT NULL,
                reason           TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn cache_get(&self, search_term: &str) -> Result<Option<CacheEntry>, StoreError> {
        let entry = sqlx::query_as::<_, CacheEntry>(
            "SELECT * FROM image_cache WHERE search_term = ?1",
        )
        .bind(search_term)
        .fetch_optional(&self.pool)
        .await?;
        Ok(entry)
    }

    /// Cache probe that also counts the hit.
    pub async fn cache_hit(&self, search_term: &str) -> Result<Option<CacheEntry>, StoreError> {
        let entry = sqlx::query_as::<_, CacheEntry>(
            r#"
            UPDATE image_cache SET usage_count = usage_count + 1
            WHERE search_term = ?1
            RETURNING *
            "#,
        )
        .bind(search_term)
        .fetch_optional(&self.pool)
        .await?;
        Ok(entry)
    }

    /// Idempotent on `search_term`; a conflicting write refreshes the
    /// binding and counts as usage instead of duplicating the row.
    pub async fn cache_upsert(&self, entry: &CacheEntry) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO image_cache
                (search_term, product_name, brand, flavor, weight,
                 image_url, storage_key, source, usage_count)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            ON CONFLICT(search_term) DO UPDATE SET
                product_name = excluded.product_name,
                brand        = excluded.brand,
                flavor       = excluded.flavor,
                weight       = excluded.weight,
                image_url    = excluded.image_url,
                storage_key  = excluded.storage_key,
                source       = excluded.source,
                usage_count  = image_cache.usage_count + 1
            "#,
        )
        .bind(&entry.search_term)
        .bind(&entry.product_name)
        .bind(&entry.brand)
        .bind(&entry.flavor)
        .bind(&entry.weight)
        .bind(&entry.image_url)
        .bind(&entry.storage_key)
        .bind(&entry.source)
        .bind(entry.usage_count.max(1))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn registry_get(
        &self,
        identity_key: &str,
    ) -> Result<Option<RegistryEntry>, StoreError> {
        let entry = sqlx::query_as::<_, RegistryEntry>(
            "SELECT * FROM image_registry WHERE identity_key = ?1",
        )
        .bind(identity_key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(entry)
    }

    pub async fn registry_get_approved(
        &self,
        identity_key: &str,
    ) -> Result<Option<RegistryEntry>, StoreError> {
        let entry = sqlx::query_as::<_, RegistryEntry>(
            "SELECT * FROM image_registry WHERE identity_key = ?1 AND status = 'approved'",
        )
        .bind(identity_key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(entry)
    }

    /// Idempotent on `identity_key`. An existing `approved` row keeps its
    /// approval when the incoming write carries a weaker status, so a
    /// heuristic tier can never silently widen or revoke approval.
    pub async fn registry_upsert(&self, entry: &RegistryEntry) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO image_registry
                (identity_key, product_code, canonical_name, brand, flavor, weight,
                 storage_key, source, validation_level, validated_at, validated_by,
                 status, reason)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
            ON CONFLICT(identity_key) DO UPDATE SET
                product_code     = excluded.product_code,
                canonical_name   = excluded.canonical_name,
                brand            = excluded.brand,
                flavor           = excluded.flavor,
                weight           = excluded.weight,
                storage_key      = CASE
                    WHEN image_registry.status = 'approved' AND excluded.status != 'approved'
                    THEN image_registry.storage_key ELSE excluded.storage_key END,
                source           = excluded.source,
                validation_level = CASE
                    WHEN image_registry.status = 'approved' AND excluded.status != 'approved'
                    THEN image_registry.validation_level ELSE excluded.validation_level END,
                validated_at     = excluded.validated_at,
                validated_by     = excluded.validated_by,
                status           = CASE
                    WHEN image_registry.status = 'approved' AND excluded.status != 'approved'
                    THEN image_registry.status ELSE excluded.status END,
                reason           = excluded.reason
            "#,
        )
        .bind(&entry.identity_key)
        .bind(&entry.product_code)
        .bind(&entry.canonical_name)
        .bind(&entry.brand)
        .bind(&entry.flavor)
        .bind(&entry.weight)
        .bind(&entry.storage_key)
        .bind(&entry.source)
        .bind(&entry.validation_level)
        .bind(entry.validated_at)
        .bind(&entry.validated_by)
        .bind(&entry.status)
        .bind(&entry.reason)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Manual promotion of a `review_pending` row to `approved`.
    pub async fn approve(
        &self,
        identity_key: &str,
        validated_by: &str,
    ) -> Result<Option<RegistryEntry>, StoreError> {
        let entry = sqlx::query_as::<_, RegistryEntry>(
            r#"
            UPDATE image_registry SET
                status           = 'approved',
                validation_level = 'manual',
                validated_at     = ?2,
                validated_by     = ?3,
                reason           = NULL
            WHERE identity_key = ?1
            RETURNING *
            "#,
        )
        .bind(identity_key)
        .bind(Utc::now())
        .bind(validated_by)
        .fetch_optional(&self.pool)
        .await?;
        Ok(entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache_entry(term: &str) -> CacheEntry {
        CacheEntry {
            search_term: term.to_string(),
            product_name: "Leite Parmalat 1L".into(),
            brand: Some("Parmalat".into()),
            flavor: None,
            weight: Some("1l".into()),
            image_url: "https://cdn.example.com/imagens/leite.webp".into(),
            storage_key: "imagens/smart-leite-parmalat-1l-ab12cd34-v1.webp".into(),
            source: "external".into(),
            usage_count: 1,
        }
    }

    fn registry_entry(key: &str, status: RegistryStatus) -> RegistryEntry {
        RegistryEntry {
            identity_key: key.to_string(),
            product_code: None,
            canonical_name: "Leite Parmalat 1L".into(),
            brand: Some("Parmalat".into()),
            flavor: None,
            weight: Some("1l".into()),
            storage_key: "imagens/smart-leite-parmalat-1l-ab12cd34-v1.webp".into(),
            source: "external".into(),
            validation_level: "ai-validated".into(),
            validated_at: Some(Utc::now()),
            validated_by: Some("validator".into()),
            status: status.as_str().to_string(),
            reason: None,
        }
    }

    #[tokio::test]
    async fn cache_upsert_is_idempotent_on_key() {
        let store = Store::in_memory().await.unwrap();
        let entry = cache_entry("1l leite parmalat");
        store.cache_upsert(&entry).await.unwrap();
        store.cache_upsert(&entry).await.unwrap();

        let row = store.cache_get("1l leite parmalat").await.unwrap().unwrap();
        // second upsert updated the existing row and counted usage
        assert_eq!(row.usage_count, 2);
    }

    #[tokio::test]
    async fn cache_hit_increments_usage() {
        let store = Store::in_memory().await.unwrap();
        store.cache_upsert(&cache_entry("1l leite")).await.unwrap();

        let hit = store.cache_hit("1l leite").await.unwrap().unwrap();
        assert_eq!(hit.usage_count, 2);
        assert!(store.cache_hit("nunca visto").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn registry_upsert_and_approved_lookup() {
        let store = Store::in_memory().await.unwrap();
        let pending = registry_entry("meta:aaaa", RegistryStatus::ReviewPending);
        store.registry_upsert(&pending).await.unwrap();

        assert!(store.registry_get_approved("meta:aaaa").await.unwrap().is_none());
        assert!(store.registry_get("meta:aaaa").await.unwrap().is_some());

        let approved = store.approve("meta:aaaa", "operador").await.unwrap().unwrap();
        assert!(approved.is_approved());
        assert_eq!(approved.validation_level, "manual");
        assert_eq!(approved.validated_by.as_deref(), Some("operador"));
        assert!(store.registry_get_approved("meta:aaaa").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn weaker_write_never_revokes_approval() {
        let store = Store::in_memory().await.unwrap();
        let approved = registry_entry("code:7891", RegistryStatus::Approved);
        store.registry_upsert(&approved).await.unwrap();

        let mut weaker = registry_entry("code:7891", RegistryStatus::ReviewPending);
        weaker.validation_level = "storage-fuzzy".into();
        weaker.storage_key = "imagens/other-candidate.webp".into();
        store.registry_upsert(&weaker).await.unwrap();

        let row = store.registry_get("code:7891").await.unwrap().unwrap();
        assert!(row.is_approved());
        assert_eq!(row.validation_level, "ai-validated");
        // approved binding keeps its asset
        assert_eq!(
            row.storage_key,
            "imagens/smart-leite-parmalat-1l-ab12cd34-v1.webp"
        );
    }

    #[tokio::test]
    async fn connect_creates_schema_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("test.db").display());
        let store = Store::connect(&url).await.unwrap();
        store.cache_upsert(&cache_entry("1l leite")).await.unwrap();
        assert!(store.cache_get("1l leite").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn approve_missing_key_is_none() {
        let store = Store::in_memory().await.unwrap();
        assert!(store.approve("meta:absent", "op").await.unwrap().is_none());
    }
}

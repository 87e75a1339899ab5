#![allow(dead_code)]

use once_cell::sync::Lazy;
use std::env;

pub static S3_ENDPOINT: Lazy<String> =
    Lazy::new(|| env::var("S3_ENDPOINT").unwrap_or_else(|_| "https://s3.amazonaws.com".into()));

pub static S3_REGION: Lazy<String> =
    Lazy::new(|| env::var("S3_REGION").unwrap_or_else(|_| "us-east-1".into()));

pub static S3_BUCKET: Lazy<String> = Lazy::new(|| env::var("S3_BUCKET").unwrap_or_default());

pub static S3_ACCESS_KEY_ID: Lazy<String> = Lazy::new(|| {
    env::var("S3_ACCESS_KEY_ID")
        .or_else(|_| env::var("AWS_ACCESS_KEY_ID"))
        .unwrap_or_default()
});

pub static S3_SECRET_ACCESS_KEY: Lazy<String> = Lazy::new(|| {
    env::var("S3_SECRET_ACCESS_KEY")
        .or_else(|_| env::var("AWS_SECRET_ACCESS_KEY"))
        .unwrap_or_default()
});

/// Base URL for published assets. Falls back to path-style bucket access.
pub static S3_PUBLIC_BASE_URL: Lazy<String> = Lazy::new(|| {
    env::var("S3_PUBLIC_BASE_URL")
        .unwrap_or_else(|_| format!("{}/{}", S3_ENDPOINT.trim_end_matches('/'), *S3_BUCKET))
});

/// Prefixes the index cache scans. `logo/` and `uploads/` live in the same
/// bucket but are out of scope for asset reuse.
pub static INDEX_PREFIXES: Lazy<Vec<String>> = Lazy::new(|| {
    csv_env("INDEX_PREFIXES").unwrap_or_else(|| vec!["imagens/".to_string()])
});

pub static INDEX_EXCLUDE_PREFIXES: Lazy<Vec<String>> = Lazy::new(|| {
    csv_env("INDEX_EXCLUDE_PREFIXES")
        .unwrap_or_else(|| vec!["logo/".to_string(), "uploads/".to_string()])
});

fn csv_env(key: &str) -> Option<Vec<String>> {
    env::var(key)
        .ok()
        .map(|raw| {
            raw.split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect::<Vec<_>>()
        })
        .filter(|v| !v.is_empty())
}

pub fn index_ttl_secs() -> u64 {
    env::var("INDEX_TTL_SECS")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(45)
}

/// Per-prefix listing budget; bounds worst-case latency on large buckets.
pub fn list_max_keys_per_prefix() -> usize {
    env::var("LIST_MAX_KEYS_PER_PREFIX")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(20_000)
}

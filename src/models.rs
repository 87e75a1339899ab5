use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Inbound resolve RPC payload. Immutable per request.
#[derive(Debug, Clone, Deserialize)]
pub struct ResolveRequest {
    pub term: String,
    #[serde(default)]
    pub brand: Option<String>,
    #[serde(default)]
    pub flavor: Option<String>,
    #[serde(default)]
    pub weight: Option<String>,
    #[serde(default)]
    pub product_code: Option<String>,
    #[serde(default)]
    pub bg_policy: BgPolicy,
    #[serde(default)]
    pub strict_mode: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BgPolicy {
    #[default]
    Auto,
    Never,
    Always,
}

/// Which tier produced the asset.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum ResolveSource {
    Registry,
    Cache,
    StorageFuzzy,
    External,
    Manual,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResolveResponse {
    pub found: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<ResolveSource>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub review_pending: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BatchResolveRequest {
    pub items: Vec<ResolveRequest>,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BatchItemStatus {
    Done,
    ReviewPending,
    Error,
}

/// Per-item outcome of a batch resolution. One bad product never fails the
/// batch; each item carries its own status and reason.
#[derive(Debug, Clone, Serialize)]
pub struct BatchItemReport {
    pub term: String,
    pub status: BatchItemStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<ResolveSource>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub elapsed_ms: u128,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct ApiError {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

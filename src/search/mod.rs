//! External image-candidate search.
//!
//! Talks to a SerpAPI-compatible image search endpoint and ranks the raw
//! results by metadata relevance. Ranking is heuristic; the hard metadata
//! gate is not: a candidate that fails the brand or flavor/weight rules is
//! dropped regardless of score.

use crate::http::build_client;
use crate::models::ResolveRequest;
use crate::normalize::{normalize, weight_tokens};
use once_cell::sync::Lazy;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::collections::HashSet;
use std::env;
use thiserror::Error;
use tracing::debug;

static SEARCH_API_URL: Lazy<String> = Lazy::new(|| {
    env::var("SEARCH_API_URL").unwrap_or_else(|_| "https://serpapi.com/search.json".into())
});

static SEARCH_API_KEY: Lazy<String> =
    Lazy::new(|| env::var("SEARCH_API_KEY").unwrap_or_default());

static SEARCH_LOCALE_GL: Lazy<String> =
    Lazy::new(|| env::var("SEARCH_LOCALE_GL").unwrap_or_else(|_| "br".into()));

static SEARCH_LOCALE_HL: Lazy<String> =
    Lazy::new(|| env::var("SEARCH_LOCALE_HL").unwrap_or_else(|_| "pt-br".into()));

fn result_cap() -> usize {
    env::var("SEARCH_RESULT_CAP")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(10)
}

#[derive(Debug, Error)]
pub enum SearchError {
    #[error("search api key is not configured")]
    MissingApiKey,
    #[error("request failed: {0}")]
    Request(String),
    #[error("rate limited by search provider")]
    RateLimited { retry_after: Option<u64> },
    #[error("search provider unavailable: HTTP {0}")]
    Unavailable(u16),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

impl SearchError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Request(_) | Self::Unavailable(_))
    }
}

#[derive(Debug, Clone)]
pub struct CandidateImage {
    pub url: String,
    pub thumbnail_url: Option<String>,
    pub title: String,
    pub source: String,
    pub score: f64,
}

/// Signals of generic artwork rather than product photography.
const GENERIC_SIGNALS: &[&str] = &[
    "vector",
    "vetor",
    "icon",
    "icone",
    "clipart",
    "banner",
    "logo",
    "desenho",
    "ilustracao",
    "template",
    "mockup",
    "png transparente",
];

/// Signals that the photo shows real packaging.
const PACKAGING_SIGNALS: &[&str] = &[
    "embalagem",
    "garrafa",
    "lata",
    "caixa",
    "pacote",
    "frasco",
    "rotulo",
    "produto",
    "pet",
];

const GENERIC_PENALTY: f64 = 0.4;
const PACKAGING_BOOST: f64 = 0.15;
const PACKAGING_BOOST_CAP: f64 = 0.3;

#[derive(Debug, Deserialize)]
struct ProviderResponse {
    #[serde(default)]
    images_results: Vec<ProviderImage>,
}

#[derive(Debug, Deserialize)]
struct ProviderImage {
    original: Option<String>,
    thumbnail: Option<String>,
    title: Option<String>,
    source: Option<String>,
}

#[derive(Clone)]
pub struct SearchClient {
    http: Client,
    api_url: String,
    api_key: String,
}

impl SearchClient {
    pub fn from_env() -> Option<Self> {
        if SEARCH_API_KEY.is_empty() {
            return None;
        }
        Some(Self {
            http: build_client(),
            api_url: SEARCH_API_URL.clone(),
            api_key: SEARCH_API_KEY.clone(),
        })
    }

    /// Searches the provider and returns gate-passing candidates, best first.
    pub async fn search(
        &self,
        request: &ResolveRequest,
    ) -> Result<Vec<CandidateImage>, SearchError> {
        if self.api_key.is_empty() {
            return Err(SearchError::MissingApiKey);
        }
        let query = compose_query(request);
        let response = self
            .http
            .get(&self.api_url)
            .query(&[
                ("engine", "google_images"),
                ("q", query.as_str()),
                ("gl", SEARCH_LOCALE_GL.as_str()),
                ("hl", SEARCH_LOCALE_HL.as_str()),
                ("api_key", self.api_key.as_str()),
            ])
            .send()
            .await
            .map_err(|err| SearchError::Request(err.to_string()))?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get("Retry-After")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok());
            return Err(SearchError::RateLimited { retry_after });
        }
        if status.is_server_error() {
            return Err(SearchError::Unavailable(status.as_u16()));
        }
        if !status.is_success() {
            return Err(SearchError::Request(format!("HTTP {status}")));
        }

        let payload: ProviderResponse = response
            .json()
            .await
            .map_err(|err| SearchError::InvalidResponse(err.to_string()))?;

        let raw: Vec<CandidateImage> = payload
            .images_results
            .into_iter()
            .filter_map(|item| {
                let url = item.original?;
                Some(CandidateImage {
                    url,
                    thumbnail_url: item.thumbnail,
                    title: item.title.unwrap_or_default(),
                    source: item.source.unwrap_or_default(),
                    score: 0.0,
                })
            })
            .collect();
        debug!(
            target = "vitrine.search",
            query = %query,
            raw = raw.len(),
            "provider_results"
        );
        Ok(rank_candidates(request, raw))
    }
}

fn compose_query(request: &ResolveRequest) -> String {
    let mut parts = vec![request.term.trim().to_string()];
    for extra in [&request.brand, &request.flavor, &request.weight] {
        if let Some(value) = extra {
            let value = value.trim();
            if !value.is_empty() && !parts.iter().any(|p| p.eq_ignore_ascii_case(value)) {
                parts.push(value.to_string());
            }
        }
    }
    parts.join(" ")
}

fn candidate_tokens(candidate: &CandidateImage) -> HashSet<String> {
    normalize(&format!("{} {}", candidate.title, candidate.source))
        .split(' ')
        .filter(|t| !t.is_empty())
        .map(|t| t.to_string())
        .collect()
}

/// Hard metadata gate. Brand mismatch is always fatal; when a flavor or a
/// weight is specified, at least one of the two must match.
pub fn metadata_gate_rejects(request: &ResolveRequest, candidate: &CandidateImage) -> bool {
    let tokens = candidate_tokens(candidate);

    if let Some(brand) = request.brand.as_deref().filter(|b| !b.trim().is_empty()) {
        let brand_tokens: Vec<String> = normalize(brand)
            .split(' ')
            .filter(|t| !t.is_empty())
            .map(|t| t.to_string())
            .collect();
        if !brand_tokens.is_empty() && !brand_tokens.iter().all(|t| tokens.contains(t)) {
            return true;
        }
    }

    let flavor = request.flavor.as_deref().filter(|f| !f.trim().is_empty());
    let weight = request.weight.as_deref().filter(|w| !w.trim().is_empty());
    if flavor.is_none() && weight.is_none() {
        return false;
    }

    let flavor_matches = flavor.is_some_and(|flavor| {
        let flavor_tokens: Vec<String> = normalize(flavor)
            .split(' ')
            .filter(|t| !t.is_empty())
            .map(|t| t.to_string())
            .collect();
        !flavor_tokens.is_empty() && flavor_tokens.iter().any(|t| tokens.contains(t))
    });
    let weight_matches = weight.is_some_and(|weight| {
        weight_tokens(&normalize(weight))
            .iter()
            .any(|t| tokens.contains(t))
    });
    !(flavor_matches || weight_matches)
}

/// Scores candidates by token overlap with the query, penalizing generic
/// artwork signals and boosting packaging signals, then applies the gate.
pub fn rank_candidates(
    request: &ResolveRequest,
    candidates: Vec<CandidateImage>,
) -> Vec<CandidateImage> {
    let query_text = compose_query(request);
    let query: HashSet<String> = normalize(&query_text)
        .split(' ')
        .filter(|t| !t.is_empty())
        .map(|t| t.to_string())
        .collect();

    let mut ranked: Vec<CandidateImage> = candidates
        .into_iter()
        .filter(|candidate| !metadata_gate_rejects(request, candidate))
        .map(|mut candidate| {
            let tokens = candidate_tokens(&candidate);
            let overlap = query.intersection(&tokens).count();
            let mut score = if query.is_empty() {
                0.0
            } else {
                overlap as f64 / query.len() as f64
            };

            let haystack = normalize(&format!("{} {}", candidate.title, candidate.source));
            if GENERIC_SIGNALS.iter().any(|sig| haystack.contains(sig)) {
                score -= GENERIC_PENALTY;
            }
            let boost = PACKAGING_SIGNALS
                .iter()
                .filter(|sig| haystack.contains(*sig))
                .count() as f64
                * PACKAGING_BOOST;
            score += boost.min(PACKAGING_BOOST_CAP);

            candidate.score = score;
            candidate
        })
        .collect();

    ranked.sort_by(|a, b| b.score.total_cmp(&a.score));
    ranked.truncate(result_cap());
    ranked
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::BgPolicy;

    fn request(term: &str, brand: Option<&str>, flavor: Option<&str>, weight: Option<&str>) -> ResolveRequest {
        ResolveRequest {
            term: term.to_string(),
            brand: brand.map(|s| s.to_string()),
            flavor: flavor.map(|s| s.to_string()),
            weight: weight.map(|s| s.to_string()),
            product_code: None,
            bg_policy: BgPolicy::Auto,
            strict_mode: false,
        }
    }

    fn candidate(title: &str, source: &str) -> CandidateImage {
        CandidateImage {
            url: "https://img.example.com/a.jpg".into(),
            thumbnail_url: None,
            title: title.to_string(),
            source: source.to_string(),
            score: 0.0,
        }
    }

    #[test]
    fn brand_mismatch_is_fatal() {
        let req = request("Leite 1L", Some("Parmalat"), None, None);
        let other = candidate("Leite Italac 1L embalagem", "italac.com.br");
        assert!(metadata_gate_rejects(&req, &other));

        let right = candidate("Leite Parmalat 1L embalagem", "parmalat.com.br");
        assert!(!metadata_gate_rejects(&req, &right));
    }

    #[test]
    fn flavor_or_weight_must_match_when_present() {
        let req = request("Refrigerante", None, Some("limão"), Some("2L"));
        let neither = candidate("Refrigerante sabor laranja lata 350ml", "loja.com");
        assert!(metadata_gate_rejects(&req, &neither));

        let by_flavor = candidate("Refrigerante sabor limao garrafa", "loja.com");
        assert!(!metadata_gate_rejects(&req, &by_flavor));

        let by_weight = candidate("Refrigerante garrafa 2l", "loja.com");
        assert!(!metadata_gate_rejects(&req, &by_weight));
    }

    #[test]
    fn gate_is_a_noop_without_metadata() {
        let req = request("Arroz branco", None, None, None);
        let anything = candidate("Arroz branco pacote", "mercado.com");
        assert!(!metadata_gate_rejects(&req, &anything));
    }

    #[test]
    fn ranking_prefers_packaging_over_generic_art() {
        let req = request("Arroz Tio João 5kg", Some("Tio João"), None, Some("5kg"));
        let ranked = rank_candidates(
            &req,
            vec![
                candidate("Arroz Tio João 5kg vector icon clipart", "freepik.com"),
                candidate("Arroz Tio João 5kg embalagem pacote", "tiojoao.com.br"),
            ],
        );
        assert_eq!(ranked.len(), 2);
        assert!(ranked[0].title.contains("embalagem"));
        assert!(ranked[0].score > ranked[1].score);
    }

    #[test]
    fn ranking_applies_gate() {
        let req = request("Leite 1L", Some("Parmalat"), None, None);
        let ranked = rank_candidates(
            &req,
            vec![candidate("Leite Italac 1L embalagem", "italac.com.br")],
        );
        assert!(ranked.is_empty());
    }
}

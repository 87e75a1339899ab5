//! Vision-model validation of search candidates.
//!
//! The validator sees a handful of low-resolution candidate thumbnails plus
//! the structured product description and must answer with a 1-based best
//! index (or none), a confidence score, an exact-match flag and structured
//! mismatch reasons. A "none" or unavailable answer is a miss for the
//! caller, never a default accept.

use crate::http::build_client;
use crate::models::ResolveRequest;
use crate::search::CandidateImage;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::{Value, json};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct VisionConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub model: String,
    pub max_candidates: usize,
}

impl VisionConfig {
    pub fn from_env() -> Self {
        Self {
            base_url: std::env::var("VISION_BASE_URL")
                .unwrap_or_else(|_| "https://api.openai.com/v1".into()),
            api_key: std::env::var("VISION_API_KEY").ok(),
            model: std::env::var("VISION_MODEL").unwrap_or_else(|_| "gpt-4o-mini".into()),
            max_candidates: std::env::var("VISION_MAX_CANDIDATES")
                .ok()
                .and_then(|v| v.parse::<usize>().ok())
                .filter(|v| *v > 0)
                .unwrap_or(4),
        }
    }
}

#[derive(Debug, Error)]
pub enum VisionError {
    #[error("vision api key is not configured")]
    MissingApiKey,
    #[error("request failed: {0}")]
    Http(String),
    #[error("rate limited by vision provider")]
    RateLimited { retry_after: Option<u64> },
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

/// Parsed validator answer with a valid (0-based) candidate index.
#[derive(Debug, Clone, PartialEq)]
pub struct VisionVerdict {
    pub best_index: usize,
    pub confidence: f64,
    pub exact_match: bool,
    pub mismatch_reasons: Vec<String>,
}

pub struct VisionValidator {
    http: Client,
    config: VisionConfig,
}

impl VisionValidator {
    pub fn new(config: VisionConfig) -> Self {
        Self {
            http: build_client(),
            config,
        }
    }

    pub fn from_env() -> Option<Self> {
        let config = VisionConfig::from_env();
        config.api_key.as_ref()?;
        Some(Self::new(config))
    }

    /// Asks the model to pick the candidate that best matches the product,
    /// or reject all. `Ok(None)` means no candidate qualified.
    pub async fn pick_best(
        &self,
        request: &ResolveRequest,
        candidates: &[CandidateImage],
    ) -> Result<Option<VisionVerdict>, VisionError> {
        let Some(api_key) = self.config.api_key.as_deref() else {
            return Err(VisionError::MissingApiKey);
        };
        if candidates.is_empty() {
            return Ok(None);
        }
        let shown = &candidates[..candidates.len().min(self.config.max_candidates)];

        let mut content = vec![json!({
            "type": "text",
            "text": describe_task(request, shown.len()),
        })];
        for candidate in shown {
            let url = candidate
                .thumbnail_url
                .as_deref()
                .unwrap_or(candidate.url.as_str());
            content.push(json!({
                "type": "image_url",
                "image_url": { "url": url, "detail": "low" },
            }));
        }

        let body = json!({
            "model": self.config.model,
            "response_format": { "type": "json_object" },
            "messages": [
                {
                    "role": "system",
                    "content": "You validate product images for a grocery catalog. \
                        Answer only with JSON: {\"best\": <1-based index or \"none\">, \
                        \"confidence\": <0..1>, \"exact_match\": <bool>, \
                        \"mismatch_reasons\": [<string>...]}.",
                },
                { "role": "user", "content": content },
            ],
        });

        let response = self
            .http
            .post(format!("{}/chat/completions", self.config.base_url))
            .bearer_auth(api_key)
            .json(&body)
            .send()
            .await
            .map_err(|err| VisionError::Http(err.to_string()))?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get("Retry-After")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok());
            return Err(VisionError::RateLimited { retry_after });
        }
        if !status.is_success() {
            return Err(VisionError::Http(format!("HTTP {status}")));
        }

        let payload: ChatResponse = response
            .json()
            .await
            .map_err(|err| VisionError::InvalidResponse(err.to_string()))?;
        let text = payload
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message.content)
            .ok_or_else(|| VisionError::InvalidResponse("empty choices".into()))?;

        debug!(target = "vitrine.llm", raw = %text, "vision_verdict_raw");
        Ok(parse_verdict(&text, shown.len()))
    }
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: String,
}

fn describe_task(request: &ResolveRequest, shown: usize) -> String {
    let mut description = format!("Product: {}", request.term.trim());
    if let Some(brand) = request.brand.as_deref() {
        description.push_str(&format!("\nBrand: {brand}"));
    }
    if let Some(flavor) = request.flavor.as_deref() {
        description.push_str(&format!("\nFlavor/variant: {flavor}"));
    }
    if let Some(weight) = request.weight.as_deref() {
        description.push_str(&format!("\nWeight/volume: {weight}"));
    }
    description.push_str(&format!(
        "\n\nThe {shown} images that follow are numbered 1..{shown} in order. \
         Pick the single image showing exactly this product (same brand, same \
         variant, same package size), or answer \"none\" if no image matches."
    ));
    description
}

/// Tolerant parse of the model's JSON. Any malformed or out-of-range answer
/// degrades to a miss.
fn parse_verdict(raw: &str, shown: usize) -> Option<VisionVerdict> {
    let value: Value = serde_json::from_str(raw.trim()).ok()?;
    let best = value.get("best")?;
    let index = match best {
        Value::Number(n) => n.as_u64()? as usize,
        Value::String(s) => {
            let s = s.trim().to_lowercase();
            if s == "none" {
                return None;
            }
            s.parse::<usize>().ok()?
        }
        _ => return None,
    };
    if index < 1 || index > shown {
        return None;
    }
    let confidence = value
        .get("confidence")
        .and_then(Value::as_f64)
        .unwrap_or(0.0)
        .clamp(0.0, 1.0);
    let exact_match = value
        .get("exact_match")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    let mismatch_reasons = value
        .get("mismatch_reasons")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(|s| s.to_string())
                .collect()
        })
        .unwrap_or_default();
    Some(VisionVerdict {
        best_index: index - 1,
        confidence,
        exact_match,
        mismatch_reasons,
    })
}

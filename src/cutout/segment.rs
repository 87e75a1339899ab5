//! Remote background-removal tiers: a segmentation sidecar at decreasing
//! model sizes, and a generative image-edit fallback.

use super::{CutoutError, CutoutStrategy, decode_image, encode_png};
use crate::http::build_media_client;
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use image::RgbaImage;
use once_cell::sync::Lazy;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use tracing::debug;

pub static SEGMENT_URL: Lazy<Option<String>> =
    Lazy::new(|| std::env::var("CUTOUT_SEGMENT_URL").ok());

/// Comma-separated model tiers to try, in order. Constrained deployments
/// set a single tier.
pub static SEGMENT_TIERS: Lazy<Vec<SegmentTier>> = Lazy::new(|| {
    let raw = std::env::var("CUTOUT_TIERS").unwrap_or_else(|_| "large,medium,small".into());
    let tiers: Vec<SegmentTier> = raw
        .split(',')
        .filter_map(|t| SegmentTier::parse(t.trim()))
        .collect();
    if tiers.is_empty() {
        vec![SegmentTier::Large, SegmentTier::Medium, SegmentTier::Small]
    } else {
        tiers
    }
});

static EDIT_BASE_URL: Lazy<String> = Lazy::new(|| {
    std::env::var("IMAGE_EDIT_BASE_URL").unwrap_or_else(|_| "https://api.openai.com/v1".into())
});
static EDIT_API_KEY: Lazy<Option<String>> =
    Lazy::new(|| std::env::var("IMAGE_EDIT_API_KEY").ok());
static EDIT_MODEL: Lazy<String> =
    Lazy::new(|| std::env::var("IMAGE_EDIT_MODEL").unwrap_or_else(|_| "gpt-image-1".into()));

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentTier {
    Large,
    Medium,
    Small,
}

impl SegmentTier {
    fn parse(raw: &str) -> Option<Self> {
        match raw.to_ascii_lowercase().as_str() {
            "large" => Some(Self::Large),
            "medium" => Some(Self::Medium),
            "small" => Some(Self::Small),
            _ => None,
        }
    }

    fn model(self) -> &'static str {
        match self {
            Self::Large => "isnet-general-use",
            Self::Medium => "u2net",
            Self::Small => "u2netp",
        }
    }

    pub fn strategy_name(self) -> &'static str {
        match self {
            Self::Large => "segment-large",
            Self::Medium => "segment-medium",
            Self::Small => "segment-small",
        }
    }
}

/// One tier of the rembg-style sidecar. The sidecar takes raw image bytes
/// and answers with an alpha-masked PNG.
pub struct SegmentationCutout {
    http: Client,
    base_url: String,
    tier: SegmentTier,
}

impl SegmentationCutout {
    pub fn new(base_url: String, tier: SegmentTier) -> Self {
        Self {
            http: build_media_client(),
            base_url,
            tier,
        }
    }
}

#[async_trait]
impl CutoutStrategy for SegmentationCutout {
    fn name(&self) -> &'static str {
        self.tier.strategy_name()
    }

    async fn apply(&self, input: &RgbaImage) -> Result<RgbaImage, CutoutError> {
        let body = encode_png(input)?;
        let url = format!(
            "{}/api/remove?model={}",
            self.base_url.trim_end_matches('/'),
            self.tier.model()
        );
        let response = self
            .http
            .post(&url)
            .header("Content-Type", "application/octet-stream")
            .body(body)
            .send()
            .await
            .map_err(|err| CutoutError::Provider(err.to_string()))?;
        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(CutoutError::RateLimited);
        }
        if !status.is_success() {
            return Err(CutoutError::Unavailable(status.as_u16()));
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|err| CutoutError::Provider(err.to_string()))?;
        debug!(
            target = "vitrine.cutout",
            tier = self.tier.strategy_name(),
            bytes = bytes.len(),
            "segmentation_response"
        );
        decode_image(&bytes)
    }
}

/// Generative fallback: asks an image-edit model to remove the background
/// while keeping the label untouched.
pub struct GenerativeEditCutout {
    http: Client,
    api_key: String,
}

impl GenerativeEditCutout {
    pub fn from_env() -> Option<Self> {
        EDIT_API_KEY.as_ref().map(|key| Self {
            http: build_media_client(),
            api_key: key.clone(),
        })
    }
}

#[derive(Debug, Deserialize)]
struct EditResponse {
    data: Vec<EditDatum>,
}

#[derive(Debug, Deserialize)]
struct EditDatum {
    b64_json: Option<String>,
}

const EDIT_PROMPT: &str = "Remove the background completely, leaving it fully \
    transparent. Keep the product, its label and its proportions exactly as \
    they are. Do not add shadows, reflections or new elements.";

#[async_trait]
impl CutoutStrategy for GenerativeEditCutout {
    fn name(&self) -> &'static str {
        "generative-edit"
    }

    async fn apply(&self, input: &RgbaImage) -> Result<RgbaImage, CutoutError> {
        let png = encode_png(input)?;
        let part = reqwest::multipart::Part::bytes(png)
            .file_name("product.png")
            .mime_str("image/png")
            .map_err(|err| CutoutError::Provider(err.to_string()))?;
        let form = reqwest::multipart::Form::new()
            .text("model", EDIT_MODEL.clone())
            .text("prompt", EDIT_PROMPT)
            .text("background", "transparent")
            .part("image", part);

        let response = self
            .http
            .post(format!("{}/images/edits", *EDIT_BASE_URL))
            .bearer_auth(&self.api_key)
            .multipart(form)
            .send()
            .await
            .map_err(|err| CutoutError::Provider(err.to_string()))?;
        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(CutoutError::RateLimited);
        }
        if !status.is_success() {
            return Err(CutoutError::Unavailable(status.as_u16()));
        }
        let payload: EditResponse = response
            .json()
            .await
            .map_err(|err| CutoutError::Provider(err.to_string()))?;
        let b64 = payload
            .data
            .into_iter()
            .next()
            .and_then(|d| d.b64_json)
            .ok_or_else(|| CutoutError::Provider("edit response carried no image".into()))?;
        let bytes = BASE64
            .decode(b64.as_bytes())
            .map_err(|err| CutoutError::Decode(err.to_string()))?;
        decode_image(&bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tier_parsing_is_case_insensitive() {
        assert_eq!(SegmentTier::parse("Large"), Some(SegmentTier::Large));
        assert_eq!(SegmentTier::parse("SMALL"), Some(SegmentTier::Small));
        assert_eq!(SegmentTier::parse("huge"), None);
    }

    #[test]
    fn tiers_map_to_distinct_models() {
        let models: Vec<&str> = [SegmentTier::Large, SegmentTier::Medium, SegmentTier::Small]
            .iter()
            .map(|t| t.model())
            .collect();
        assert_eq!(models, vec!["isnet-general-use", "u2net", "u2netp"]);
    }
}

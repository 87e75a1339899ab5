//! Background-removal cascade.
//!
//! An ordered list of strategies runs over the decoded image; the first
//! result that passes both pixel gates wins. Thresholds are plain data so
//! deployments can tune them without touching the cascade.

pub mod floodfill;
pub mod gates;
pub mod segment;

use async_trait::async_trait;
use image::codecs::png::PngEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, ExtendedColorType, ImageEncoder, RgbaImage};
use thiserror::Error;
use tracing::{debug, warn};

pub use floodfill::FloodFillCutout;
pub use segment::{GenerativeEditCutout, SegmentationCutout};

/// Largest edge kept when resizing inputs and best-effort passthroughs.
const MAX_DIMENSION: u32 = 1024;

#[derive(Debug, Error)]
pub enum CutoutError {
    #[error("image decode failed: {0}")]
    Decode(String),
    #[error("cutout provider error: {0}")]
    Provider(String),
    #[error("cutout provider rate limited")]
    RateLimited,
    #[error("cutout provider unavailable ({0})")]
    Unavailable(u16),
    #[error("no strategy produced an acceptable cutout")]
    QualityGate,
}

/// Gate thresholds, tuned for packshot-style product photos.
#[derive(Debug, Clone)]
pub struct CutoutThresholds {
    /// Alpha below this counts as transparent.
    pub alpha_threshold: u8,
    /// Alpha at or above this counts as solid subject.
    pub opaque_threshold: u8,
    /// Minimum transparent share of the whole frame.
    pub min_transparent_ratio: f64,
    /// Minimum opaque share of the whole frame.
    pub min_subject_ratio: f64,
    /// Minimum opaque fill inside the subject bounding box.
    pub min_bbox_fill: f64,
}

impl Default for CutoutThresholds {
    fn default() -> Self {
        Self {
            alpha_threshold: 16,
            opaque_threshold: 200,
            min_transparent_ratio: 0.018,
            min_subject_ratio: 0.03,
            min_bbox_fill: 0.25,
        }
    }
}

#[async_trait]
pub trait CutoutStrategy: Send + Sync {
    fn name(&self) -> &'static str;
    async fn apply(&self, input: &RgbaImage) -> Result<RgbaImage, CutoutError>;
}

#[async_trait]
impl CutoutStrategy for FloodFillCutout {
    fn name(&self) -> &'static str {
        "corner-flood-fill"
    }

    async fn apply(&self, input: &RgbaImage) -> Result<RgbaImage, CutoutError> {
        Ok(FloodFillCutout::apply(self, input))
    }
}

#[derive(Debug)]
pub struct CutoutOutcome {
    pub image: RgbaImage,
    /// Name of the strategy that passed the gates; `None` when the
    /// best-effort path fell back to the resized original.
    pub strategy: Option<&'static str>,
}

pub struct CutoutPipeline {
    strategies: Vec<Box<dyn CutoutStrategy>>,
    thresholds: CutoutThresholds,
}

impl CutoutPipeline {
    pub fn new(strategies: Vec<Box<dyn CutoutStrategy>>, thresholds: CutoutThresholds) -> Self {
        Self {
            strategies,
            thresholds,
        }
    }

    /// Assembles the cascade from the environment: segmentation tiers when
    /// a sidecar is configured, the generative edit when a key is present,
    /// and always the flood-fill floor.
    pub fn from_env() -> Self {
        let mut strategies: Vec<Box<dyn CutoutStrategy>> = Vec::new();
        if let Some(base_url) = segment::SEGMENT_URL.as_ref() {
            for tier in segment::SEGMENT_TIERS.iter() {
                strategies.push(Box::new(SegmentationCutout::new(base_url.clone(), *tier)));
            }
        }
        if let Some(edit) = GenerativeEditCutout::from_env() {
            strategies.push(Box::new(edit));
        }
        strategies.push(Box::new(FloodFillCutout::default()));
        Self::new(strategies, CutoutThresholds::default())
    }

    /// Runs the cascade over raw image bytes. In strict mode a full gate
    /// failure is an error; otherwise the resized original is returned
    /// untouched.
    pub async fn run(&self, raw: &[u8], strict: bool) -> Result<CutoutOutcome, CutoutError> {
        let original = resize_capped(decode_image(raw)?);

        for strategy in &self.strategies {
            match strategy.apply(&original).await {
                Ok(candidate) => {
                    if gates::passes_gates(&candidate, &self.thresholds) {
                        debug!(
                            target = "vitrine.cutout",
                            strategy = strategy.name(),
                            "cutout_accepted"
                        );
                        return Ok(CutoutOutcome {
                            image: candidate,
                            strategy: Some(strategy.name()),
                        });
                    }
                    debug!(
                        target = "vitrine.cutout",
                        strategy = strategy.name(),
                        "cutout_rejected_by_gates"
                    );
                }
                Err(err) => {
                    warn!(
                        target = "vitrine.cutout",
                        strategy = strategy.name(),
                        error = %err,
                        "cutout_strategy_failed"
                    );
                }
            }
        }

        if strict {
            return Err(CutoutError::QualityGate);
        }
        Ok(CutoutOutcome {
            image: original,
            strategy: None,
        })
    }
}

pub fn decode_image(raw: &[u8]) -> Result<RgbaImage, CutoutError> {
    image::load_from_memory(raw)
        .map(|img| img.to_rgba8())
        .map_err(|err| CutoutError::Decode(err.to_string()))
}

pub fn encode_png(img: &RgbaImage) -> Result<Vec<u8>, CutoutError> {
    let mut buf = Vec::new();
    PngEncoder::new(&mut buf)
        .write_image(
            img.as_raw(),
            img.width(),
            img.height(),
            ExtendedColorType::Rgba8,
        )
        .map_err(|err| CutoutError::Decode(err.to_string()))?;
    Ok(buf)
}

fn resize_capped(img: RgbaImage) -> RgbaImage {
    let (width, height) = img.dimensions();
    if width.max(height) <= MAX_DIMENSION {
        return img;
    }
    DynamicImage::ImageRgba8(img)
        .resize(MAX_DIMENSION, MAX_DIMENSION, FilterType::Lanczos3)
        .to_rgba8()
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgba;

    struct FixedStrategy {
        name: &'static str,
        output: Option<RgbaImage>,
    }

    #[async_trait]
    impl CutoutStrategy for FixedStrategy {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn apply(&self, _input: &RgbaImage) -> Result<RgbaImage, CutoutError> {
            self.output
                .clone()
                .ok_or_else(|| CutoutError::Provider("down".into()))
        }
    }

    fn opaque_input_bytes() -> Vec<u8> {
        let img = RgbaImage::from_pixel(32, 32, Rgba([250, 250, 250, 255]));
        encode_png(&img).unwrap()
    }

    fn good_cutout() -> RgbaImage {
        let mut img = RgbaImage::from_pixel(32, 32, Rgba([0, 0, 0, 0]));
        for y in 8..24 {
            for x in 8..24 {
                img.put_pixel(x, y, Rgba([180, 30, 30, 255]));
            }
        }
        img
    }

    #[tokio::test]
    async fn first_strategy_passing_gates_wins() {
        let pipeline = CutoutPipeline::new(
            vec![
                Box::new(FixedStrategy {
                    name: "passthrough",
                    output: Some(RgbaImage::from_pixel(32, 32, Rgba([250, 250, 250, 255]))),
                }),
                Box::new(FixedStrategy {
                    name: "good",
                    output: Some(good_cutout()),
                }),
            ],
            CutoutThresholds::default(),
        );
        let outcome = pipeline.run(&opaque_input_bytes(), true).await.unwrap();
        assert_eq!(outcome.strategy, Some("good"));
    }

    #[tokio::test]
    async fn strategy_errors_fall_through_to_later_tiers() {
        let pipeline = CutoutPipeline::new(
            vec![
                Box::new(FixedStrategy {
                    name: "down",
                    output: None,
                }),
                Box::new(FixedStrategy {
                    name: "good",
                    output: Some(good_cutout()),
                }),
            ],
            CutoutThresholds::default(),
        );
        let outcome = pipeline.run(&opaque_input_bytes(), true).await.unwrap();
        assert_eq!(outcome.strategy, Some("good"));
    }

    #[tokio::test]
    async fn strict_mode_fails_when_nothing_passes() {
        let pipeline = CutoutPipeline::new(
            vec![Box::new(FixedStrategy {
                name: "down",
                output: None,
            })],
            CutoutThresholds::default(),
        );
        let err = pipeline.run(&opaque_input_bytes(), true).await.unwrap_err();
        assert!(matches!(err, CutoutError::QualityGate));
    }

    #[tokio::test]
    async fn best_effort_returns_original_when_nothing_passes() {
        let pipeline = CutoutPipeline::new(
            vec![Box::new(FixedStrategy {
                name: "down",
                output: None,
            })],
            CutoutThresholds::default(),
        );
        let outcome = pipeline.run(&opaque_input_bytes(), false).await.unwrap();
        assert_eq!(outcome.strategy, None);
        assert!(outcome.image.pixels().all(|p| p.0[3] == 255));
    }

    #[tokio::test]
    async fn flood_fill_tier_closes_the_cascade() {
        let pipeline = CutoutPipeline::new(
            vec![Box::new(FloodFillCutout::default())],
            CutoutThresholds::default(),
        );
        let mut img = RgbaImage::from_pixel(32, 32, Rgba([250, 250, 250, 255]));
        for y in 8..24 {
            for x in 8..24 {
                img.put_pixel(x, y, Rgba([180, 30, 30, 255]));
            }
        }
        let raw = encode_png(&img).unwrap();
        let outcome = pipeline.run(&raw, true).await.unwrap();
        assert_eq!(outcome.strategy, Some("corner-flood-fill"));
    }
}

//! Pixel-level quality gates shared by every cascade strategy.

use super::CutoutThresholds;
use image::RgbaImage;

/// True when enough of the frame actually became transparent. A strategy
/// that returns the input untouched (or with a sliver of edge pixels
/// removed) fails here.
pub fn has_meaningful_transparency(img: &RgbaImage, thresholds: &CutoutThresholds) -> bool {
    let total = (img.width() as u64) * (img.height() as u64);
    if total == 0 {
        return false;
    }
    let transparent = img
        .pixels()
        .filter(|p| p.0[3] < thresholds.alpha_threshold)
        .count() as u64;
    (transparent as f64 / total as f64) >= thresholds.min_transparent_ratio
}

/// True when the remaining subject is substantial: a minimum opaque share
/// of the whole frame, and a minimum opaque fill inside the bounding box
/// of non-transparent pixels. Rejects near-empty results and "ghost"
/// cutouts where the mask kept a wide halo full of holes.
pub fn subject_preserved(img: &RgbaImage, thresholds: &CutoutThresholds) -> bool {
    let total = (img.width() as u64) * (img.height() as u64);
    if total == 0 {
        return false;
    }

    let mut opaque = 0u64;
    let mut bbox: Option<(u32, u32, u32, u32)> = None;
    for (x, y, pixel) in img.enumerate_pixels() {
        let alpha = pixel.0[3];
        if alpha >= thresholds.alpha_threshold {
            bbox = Some(match bbox {
                None => (x, y, x, y),
                Some((min_x, min_y, max_x, max_y)) => (
                    min_x.min(x),
                    min_y.min(y),
                    max_x.max(x),
                    max_y.max(y),
                ),
            });
        }
        if alpha >= thresholds.opaque_threshold {
            opaque += 1;
        }
    }

    let Some((min_x, min_y, max_x, max_y)) = bbox else {
        return false;
    };
    if (opaque as f64 / total as f64) < thresholds.min_subject_ratio {
        return false;
    }
    let bbox_area = ((max_x - min_x + 1) as u64) * ((max_y - min_y + 1) as u64);
    (opaque as f64 / bbox_area as f64) >= thresholds.min_bbox_fill
}

pub fn passes_gates(img: &RgbaImage, thresholds: &CutoutThresholds) -> bool {
    has_meaningful_transparency(img, thresholds) && subject_preserved(img, thresholds)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgba;

    fn thresholds() -> CutoutThresholds {
        CutoutThresholds::default()
    }

    fn solid(width: u32, height: u32, alpha: u8) -> RgbaImage {
        RgbaImage::from_pixel(width, height, Rgba([200, 40, 40, alpha]))
    }

    #[test]
    fn opaque_frame_has_no_meaningful_transparency() {
        let img = solid(32, 32, 255);
        assert!(!has_meaningful_transparency(&img, &thresholds()));
    }

    #[test]
    fn fully_transparent_frame_has_no_subject() {
        let img = solid(32, 32, 0);
        assert!(has_meaningful_transparency(&img, &thresholds()));
        assert!(!subject_preserved(&img, &thresholds()));
    }

    #[test]
    fn centered_subject_passes_both_gates() {
        let mut img = solid(32, 32, 0);
        for y in 8..24 {
            for x in 8..24 {
                img.put_pixel(x, y, Rgba([200, 40, 40, 255]));
            }
        }
        assert!(passes_gates(&img, &thresholds()));
    }

    #[test]
    fn ghost_cutout_fails_subject_gate() {
        // A few opaque specks spanning a large bounding box.
        let mut img = solid(64, 64, 0);
        for (x, y) in [(1u32, 1u32), (62, 1), (1, 62), (62, 62), (30, 30)] {
            img.put_pixel(x, y, Rgba([200, 40, 40, 255]));
        }
        assert!(has_meaningful_transparency(&img, &thresholds()));
        assert!(!subject_preserved(&img, &thresholds()));
    }

    #[test]
    fn thin_edge_trim_fails_transparency_gate() {
        let mut img = solid(64, 64, 255);
        for x in 0..64 {
            img.put_pixel(x, 0, Rgba([0, 0, 0, 0]));
        }
        assert!(!has_meaningful_transparency(&img, &thresholds()));
    }
}

//! Deterministic corner-seeded flood fill, the last cascade tier.
//!
//! Seeds from the four corners and clears only pixels reachable from a
//! corner whose color stays within tolerance of that corner's sampled
//! background. Bright product interiors survive because they are not
//! connected to a corner through in-tolerance pixels.

use image::{Rgba, RgbaImage};
use std::collections::VecDeque;

#[derive(Debug, Clone)]
pub struct FloodFillCutout {
    /// Euclidean RGB distance a pixel may sit from the corner sample and
    /// still count as background.
    pub color_tolerance: f64,
    /// Extra darkening allowed on bright backgrounds before a pixel stops
    /// counting as background, so shadows under the product are cleared
    /// but the label itself is not.
    pub brightness_slack: f64,
}

impl Default for FloodFillCutout {
    fn default() -> Self {
        Self {
            color_tolerance: 36.0,
            brightness_slack: 24.0,
        }
    }
}

impl FloodFillCutout {
    pub fn apply(&self, input: &RgbaImage) -> RgbaImage {
        let (width, height) = input.dimensions();
        let mut out = input.clone();
        if width < 2 || height < 2 {
            return out;
        }

        let corners = [
            (0u32, 0u32),
            (width - 1, 0),
            (0, height - 1),
            (width - 1, height - 1),
        ];
        let mut cleared = vec![false; (width as usize) * (height as usize)];

        for (cx, cy) in corners {
            let seed = *input.get_pixel(cx, cy);
            let mut queue = VecDeque::new();
            queue.push_back((cx, cy));
            while let Some((x, y)) = queue.pop_front() {
                let idx = (y as usize) * (width as usize) + x as usize;
                if cleared[idx] {
                    continue;
                }
                let pixel = *input.get_pixel(x, y);
                if !self.is_background(&pixel, &seed) {
                    continue;
                }
                cleared[idx] = true;
                if x > 0 {
                    queue.push_back((x - 1, y));
                }
                if x + 1 < width {
                    queue.push_back((x + 1, y));
                }
                if y > 0 {
                    queue.push_back((x, y - 1));
                }
                if y + 1 < height {
                    queue.push_back((x, y + 1));
                }
            }
        }

        for (x, y, pixel) in out.enumerate_pixels_mut() {
            let idx = (y as usize) * (width as usize) + x as usize;
            if cleared[idx] {
                *pixel = Rgba([pixel.0[0], pixel.0[1], pixel.0[2], 0]);
            }
        }
        out
    }

    fn is_background(&self, pixel: &Rgba<u8>, seed: &Rgba<u8>) -> bool {
        let distance = color_distance(pixel, seed);
        if distance <= self.color_tolerance {
            return true;
        }
        // A slightly darker shade of a bright background is still
        // background (soft shadows, vignetting).
        let seed_luma = luma(seed);
        let pixel_luma = luma(pixel);
        seed_luma > 200.0
            && pixel_luma < seed_luma
            && (seed_luma - pixel_luma) <= self.brightness_slack
            && chroma_distance(pixel, seed) <= self.color_tolerance
    }
}

fn color_distance(a: &Rgba<u8>, b: &Rgba<u8>) -> f64 {
    let dr = a.0[0] as f64 - b.0[0] as f64;
    let dg = a.0[1] as f64 - b.0[1] as f64;
    let db = a.0[2] as f64 - b.0[2] as f64;
    (dr * dr + dg * dg + db * db).sqrt()
}

/// Distance with the shared brightness component removed.
fn chroma_distance(a: &Rgba<u8>, b: &Rgba<u8>) -> f64 {
    let shift = luma(a) - luma(b);
    let dr = a.0[0] as f64 - b.0[0] as f64 - shift;
    let dg = a.0[1] as f64 - b.0[1] as f64 - shift;
    let db = a.0[2] as f64 - b.0[2] as f64 - shift;
    (dr * dr + dg * dg + db * db).sqrt()
}

fn luma(p: &Rgba<u8>) -> f64 {
    0.299 * p.0[0] as f64 + 0.587 * p.0[1] as f64 + 0.114 * p.0[2] as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn white_background_with_red_square() -> RgbaImage {
        let mut img = RgbaImage::from_pixel(32, 32, Rgba([250, 250, 250, 255]));
        for y in 10..22 {
            for x in 10..22 {
                img.put_pixel(x, y, Rgba([180, 30, 30, 255]));
            }
        }
        img
    }

    #[test]
    fn clears_corner_background_and_keeps_subject() {
        let cut = FloodFillCutout::default().apply(&white_background_with_red_square());
        assert_eq!(cut.get_pixel(0, 0).0[3], 0);
        assert_eq!(cut.get_pixel(31, 31).0[3], 0);
        assert_eq!(cut.get_pixel(15, 15).0[3], 255);
    }

    #[test]
    fn bright_interior_disconnected_from_corners_survives() {
        // White window inside the product, same color as the background.
        let mut img = white_background_with_red_square();
        for y in 13..19 {
            for x in 13..19 {
                img.put_pixel(x, y, Rgba([250, 250, 250, 255]));
            }
        }
        let cut = FloodFillCutout::default().apply(&img);
        assert_eq!(cut.get_pixel(15, 15).0[3], 255);
        assert_eq!(cut.get_pixel(0, 0).0[3], 0);
    }

    #[test]
    fn soft_shadow_on_bright_background_is_cleared() {
        let mut img = white_background_with_red_square();
        // Shadow band touching the bottom edge, slightly darker than the
        // background.
        for x in 0..32 {
            img.put_pixel(x, 31, Rgba([232, 232, 232, 255]));
        }
        let cut = FloodFillCutout::default().apply(&img);
        assert_eq!(cut.get_pixel(16, 31).0[3], 0);
    }

    #[test]
    fn dark_background_does_not_use_brightness_slack() {
        let mut img = RgbaImage::from_pixel(16, 16, Rgba([40, 40, 40, 255]));
        for y in 5..11 {
            for x in 5..11 {
                img.put_pixel(x, y, Rgba([70, 70, 70, 255]));
            }
        }
        let cut = FloodFillCutout::default().apply(&img);
        // Corner background is cleared, the lighter center block is not:
        // its distance exceeds the tolerance only via brightness, and the
        // slack applies to bright seeds alone.
        assert_eq!(cut.get_pixel(0, 0).0[3], 0);
        assert_eq!(cut.get_pixel(8, 8).0[3], 255);
    }
}

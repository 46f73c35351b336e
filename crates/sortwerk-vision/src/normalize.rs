// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Perspective normalizer. Warps a detected card to an upright rectangle and
// boosts it for the identification service.

use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use imageproc::geometric_transformations::{Interpolation, Projection, warp_into};
use sortwerk_core::error::{Result, SortwerkError};
use sortwerk_core::types::{CARD_ASPECT_RATIO, Quadrilateral};
use sortwerk_core::SorterConfig;
use tracing::{debug, instrument};

/// Default output width in pixels.
pub const DEFAULT_WIDTH: u32 = 745;

/// Linear boost applied after warping: `out = GAIN * in + BIAS`.
const GAIN: f32 = 1.15;
const BIAS: f32 = 20.0;

/// Produces canonical, upright card images.
#[derive(Debug, Clone)]
pub struct CardNormalizer {
    width: u32,
}

impl Default for CardNormalizer {
    fn default() -> Self {
        Self::new(DEFAULT_WIDTH)
    }
}

impl CardNormalizer {
    pub fn new(width: u32) -> Self {
        Self { width }
    }

    pub fn from_config(config: &SorterConfig) -> Self {
        Self::new(config.normalized_width)
    }

    /// Output size as `(width, height)`; height follows the card aspect ratio.
    pub fn output_size(&self) -> (u32, u32) {
        let height = (self.width as f32 / CARD_ASPECT_RATIO).round() as u32;
        (self.width, height)
    }

    /// Warp `quad` in `image` onto an upright card-sized rectangle.
    ///
    /// The caller must only pass a quad from a positive detection. A quad
    /// with no projective solution is reported as a `Vision` error.
    #[instrument(skip(self, image))]
    pub fn normalize(&self, image: &DynamicImage, quad: &Quadrilateral) -> Result<RgbImage> {
        let (out_w, out_h) = self.output_size();

        let src = quad.corners().map(|p| (p.x, p.y));
        let dest: [(f32, f32); 4] = [
            (0.0, 0.0),                   // top-left
            (out_w as f32, 0.0),          // top-right
            (out_w as f32, out_h as f32), // bottom-right
            (0.0, out_h as f32),          // bottom-left
        ];

        let projection = Projection::from_control_points(src, dest)
            .ok_or_else(|| SortwerkError::Vision("degenerate card quadrilateral".into()))?;

        let rgb_input = image.to_rgb8();
        let mut output = RgbImage::new(out_w, out_h);
        warp_into(
            &rgb_input,
            &projection,
            Interpolation::Bilinear,
            Rgb([0u8, 0, 0]),
            &mut output,
        );

        boost(&mut output);
        debug!(out_w, out_h, "card normalized");
        Ok(output)
    }

    /// Boost the whole frame without warping (used when no quad is known).
    pub fn enhance_raw(&self, image: &DynamicImage) -> RgbImage {
        let mut output = image.to_rgb8();
        boost(&mut output);
        output
    }

    /// Normalize (or just enhance, without a quad) and encode as PNG.
    pub fn prepare_for_identification(
        &self,
        image: &DynamicImage,
        quad: Option<&Quadrilateral>,
    ) -> Result<Vec<u8>> {
        let prepared = match quad {
            Some(quad) => self.normalize(image, quad)?,
            None => self.enhance_raw(image),
        };
        encode_png(&prepared)
    }
}

/// Apply the linear brightness/contrast boost in place, saturating at 255.
fn boost(image: &mut RgbImage) {
    for pixel in image.pixels_mut() {
        for channel in pixel.0.iter_mut() {
            *channel = (GAIN * *channel as f32 + BIAS).round().clamp(0.0, 255.0) as u8;
        }
    }
}

/// Encode an RGB image as PNG bytes.
pub fn encode_png(image: &RgbImage) -> Result<Vec<u8>> {
    let mut buffer = Vec::new();
    let mut cursor = std::io::Cursor::new(&mut buffer);
    image
        .write_to(&mut cursor, ImageFormat::Png)
        .map_err(|err| SortwerkError::Vision(format!("PNG encoding failed: {}", err)))?;
    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sortwerk_core::types::Point;

    fn axis_quad(x0: f32, y0: f32, x1: f32, y1: f32) -> Quadrilateral {
        Quadrilateral::from_points([
            Point::new(x0, y0),
            Point::new(x1, y0),
            Point::new(x1, y1),
            Point::new(x0, y1),
        ])
    }

    #[test]
    fn default_output_is_card_sized() {
        assert_eq!(CardNormalizer::default().output_size(), (745, 1043));
    }

    #[test]
    fn boost_is_linear_and_saturating() {
        let mut img = RgbImage::from_pixel(2, 1, Rgb([100, 0, 220]));
        boost(&mut img);
        assert_eq!(img.get_pixel(0, 0).0, [135, 20, 255]);
    }

    #[test]
    fn uniform_card_stays_uniform() {
        let img = DynamicImage::ImageRgb8(RgbImage::from_pixel(400, 500, Rgb([100, 100, 100])));
        let normalizer = CardNormalizer::new(100);
        let out = normalizer
            .normalize(&img, &axis_quad(50.0, 50.0, 300.0, 400.0))
            .expect("normalize");

        assert_eq!(out.dimensions(), (100, 140));
        // Sample away from the edges where bilinear sampling is exact.
        assert_eq!(out.get_pixel(50, 70).0, [135, 135, 135]);
    }

    #[test]
    fn warp_keeps_quadrants_in_place() {
        // Left half dark, right half bright; the card spans the split.
        let mut img = RgbImage::from_pixel(400, 400, Rgb([10, 10, 10]));
        for y in 0..400 {
            for x in 200..400 {
                img.put_pixel(x, y, Rgb([200, 200, 200]));
            }
        }
        let img = DynamicImage::ImageRgb8(img);
        let out = CardNormalizer::new(100)
            .normalize(&img, &axis_quad(100.0, 50.0, 300.0, 330.0))
            .expect("normalize");

        assert!(out.get_pixel(10, 70).0[0] < 60);
        assert!(out.get_pixel(90, 70).0[0] > 200);
    }

    #[test]
    fn raw_frame_is_boosted_without_resizing() {
        let img = DynamicImage::ImageRgb8(RgbImage::from_pixel(64, 48, Rgb([0, 0, 0])));
        let out = CardNormalizer::default().enhance_raw(&img);
        assert_eq!(out.dimensions(), (64, 48));
        assert_eq!(out.get_pixel(0, 0).0, [20, 20, 20]);
    }

    #[test]
    fn prepared_bytes_are_png() {
        let img = DynamicImage::ImageRgb8(RgbImage::from_pixel(300, 400, Rgb([90, 90, 90])));
        let bytes = CardNormalizer::new(50)
            .prepare_for_identification(&img, Some(&axis_quad(10.0, 10.0, 260.0, 360.0)))
            .expect("prepare");
        assert_eq!(&bytes[..8], b"\x89PNG\r\n\x1a\n");

        let decoded = image::load_from_memory(&bytes).expect("decode");
        assert_eq!((decoded.width(), decoded.height()), (50, 70));
    }
}

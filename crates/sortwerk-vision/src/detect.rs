// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Card detector: edge detection, external contour extraction, polygon
// approximation and card-likeness scoring.

use image::{DynamicImage, GrayImage};
use imageproc::contours::{BorderType, Contour, find_contours};
use imageproc::distance_transform::Norm;
use imageproc::edges::canny;
use imageproc::filter::gaussian_blur_f32;
use imageproc::geometry::{approximate_polygon_dp, arc_length};
use imageproc::morphology::dilate;
use imageproc::point::Point as PixelPoint;
use sortwerk_core::types::{CARD_ASPECT_RATIO, DetectionResult, Frame, Point, Quadrilateral};
use sortwerk_core::SorterConfig;
use tracing::{debug, instrument, trace};

/// Sigma matching a 5x5 Gaussian kernel (0.3 * ((5 - 1) * 0.5 - 1) + 0.8).
const BLUR_SIGMA: f32 = 1.1;

const CANNY_LOW: f32 = 50.0;
const CANNY_HIGH: f32 = 150.0;

/// Contours outside this share of the frame area are ignored.
const MIN_AREA_FRACTION: f32 = 0.05;
const MAX_AREA_FRACTION: f32 = 0.95;

/// Polygon approximation tolerance as a share of the contour perimeter.
const APPROX_EPSILON_FRACTION: f64 = 0.02;

const ASPECT_WEIGHT: f32 = 0.7;
const AREA_WEIGHT: f32 = 0.3;

/// Locates a single card-shaped quadrilateral in a frame.
///
/// Detection is a pure function of the frame: a miss is an ordinary result,
/// never an error.
#[derive(Debug, Clone)]
pub struct CardDetector {
    /// Score a candidate must exceed to be reported.
    min_confidence: f32,
}

impl Default for CardDetector {
    fn default() -> Self {
        Self {
            min_confidence: 0.3,
        }
    }
}

impl CardDetector {
    pub fn new(min_confidence: f32) -> Self {
        Self { min_confidence }
    }

    pub fn from_config(config: &SorterConfig) -> Self {
        Self::new(config.min_confidence)
    }

    /// Run detection on one camera frame.
    pub fn detect(&self, frame: &Frame) -> DetectionResult {
        self.detect_image(&frame.image)
    }

    /// Run detection on a decoded image.
    ///
    /// ## Pipeline
    ///
    /// 1. Grayscale, 5x5 Gaussian blur
    /// 2. Canny edges (50 / 150)
    /// 3. 3x3 dilation to close gaps in the card outline
    /// 4. External contours whose area is 5%..95% of the frame
    /// 5. Douglas-Peucker approximation at 2% of the perimeter; keep quads
    /// 6. Score every quad and keep the best one above `min_confidence`
    #[instrument(skip_all, fields(width = image.width(), height = image.height()))]
    pub fn detect_image(&self, image: &DynamicImage) -> DetectionResult {
        let frame_area = image.width() as f32 * image.height() as f32;
        if frame_area == 0.0 {
            return DetectionResult::miss();
        }

        let edges = edge_map(&image.to_luma8());
        let contours: Vec<Contour<i32>> = find_contours(&edges);

        let mut best: Option<(Quadrilateral, f32)> = None;
        let mut candidates = 0usize;

        for contour in contours.iter().filter(|c| is_external(c)) {
            let area = polygon_area(&contour.points);
            let fraction = area / frame_area;
            if !(MIN_AREA_FRACTION..=MAX_AREA_FRACTION).contains(&fraction) {
                continue;
            }

            let Some(corners) = approximate_quad(&contour.points) else {
                continue;
            };
            candidates += 1;

            let quad = Quadrilateral::from_points(corners);
            let score = score_candidate(&quad, area, frame_area);
            trace!(area, score, "quad candidate");

            if best.is_none_or(|(_, best_score)| score > best_score) {
                best = Some((quad, score));
            }
        }

        match best {
            Some((quad, score)) if score > self.min_confidence => {
                debug!(candidates, score, "card detected");
                DetectionResult::hit(quad, score)
            }
            _ => {
                trace!(candidates, "no card in frame");
                DetectionResult::miss()
            }
        }
    }
}

/// Card-likeness score in `0..=1`.
///
/// `0.7 * aspect_score + 0.3 * area_score`, where the aspect score falls off
/// linearly with distance from the 2.5:3.5 card ratio and the area score
/// saturates once the contour covers a fifth of the frame.
pub fn score_candidate(quad: &Quadrilateral, contour_area: f32, frame_area: f32) -> f32 {
    let ratio = quad.aspect_ratio();
    let aspect_score =
        (1.0 - (ratio - CARD_ASPECT_RATIO).abs() / CARD_ASPECT_RATIO).max(0.0);
    let area_score = if frame_area > 0.0 {
        (contour_area / frame_area * 5.0).min(1.0)
    } else {
        0.0
    };
    ASPECT_WEIGHT * aspect_score + AREA_WEIGHT * area_score
}

// -- Pipeline helpers ---------------------------------------------------------

/// Blur, Canny and dilate a grayscale frame into a closed edge map.
fn edge_map(gray: &GrayImage) -> GrayImage {
    let blurred = gaussian_blur_f32(gray, BLUR_SIGMA);
    let edges = canny(&blurred, CANNY_LOW, CANNY_HIGH);
    // L-infinity radius 1 is a 3x3 square structuring element.
    dilate(&edges, Norm::LInf, 1)
}

/// Outer borders with no enclosing border, i.e. external contours only.
fn is_external(contour: &Contour<i32>) -> bool {
    contour.border_type == BorderType::Outer && contour.parent.is_none()
}

/// Shoelace area of a closed pixel contour.
fn polygon_area(points: &[PixelPoint<i32>]) -> f32 {
    let n = points.len();
    if n < 3 {
        return 0.0;
    }
    let mut twice_area = 0i64;
    for i in 0..n {
        let j = (i + 1) % n;
        twice_area += points[i].x as i64 * points[j].y as i64;
        twice_area -= points[j].x as i64 * points[i].y as i64;
    }
    twice_area.abs() as f32 / 2.0
}

/// Approximate a closed contour and return its corners if it is a quad.
///
/// The contour is split at two far-apart points (both guaranteed polygon
/// vertices) and each open half is simplified separately, so the arbitrary
/// starting pixel of the contour never survives as a spurious vertex.
fn approximate_quad(points: &[PixelPoint<i32>]) -> Option<[Point; 4]> {
    if points.len() < 4 {
        return None;
    }
    let epsilon = arc_length(points, true) * APPROX_EPSILON_FRACTION;
    if epsilon <= 0.0 {
        return None;
    }

    let start = farthest_from(points, centroid(points));
    let rotated: Vec<PixelPoint<i32>> = points[start..]
        .iter()
        .chain(points[..start].iter())
        .copied()
        .collect();
    let anchor = rotated[0];
    let split = farthest_from(&rotated, (anchor.x as f64, anchor.y as f64));
    if split == 0 {
        return None;
    }

    let mut closing: Vec<PixelPoint<i32>> = rotated[split..].to_vec();
    closing.push(anchor);

    let first = approximate_polygon_dp(&rotated[..=split], epsilon, false);
    let second = approximate_polygon_dp(&closing, epsilon, false);

    // `first` ends at the split point and `second` ends back at the anchor.
    let mut vertices: Vec<PixelPoint<i32>> = first;
    vertices.extend(second.iter().skip(1).take(second.len().saturating_sub(2)));
    vertices.dedup();

    if vertices.len() != 4 {
        return None;
    }
    Some([
        to_point(vertices[0]),
        to_point(vertices[1]),
        to_point(vertices[2]),
        to_point(vertices[3]),
    ])
}

fn centroid(points: &[PixelPoint<i32>]) -> (f64, f64) {
    let n = points.len() as f64;
    let (sx, sy) = points
        .iter()
        .fold((0.0, 0.0), |(sx, sy), p| (sx + p.x as f64, sy + p.y as f64));
    (sx / n, sy / n)
}

/// Index of the point farthest from `origin`.
fn farthest_from(points: &[PixelPoint<i32>], origin: (f64, f64)) -> usize {
    let mut best = 0;
    let mut best_dist = f64::MIN;
    for (i, p) in points.iter().enumerate() {
        let dist = (p.x as f64 - origin.0).powi(2) + (p.y as f64 - origin.1).powi(2);
        if dist > best_dist {
            best = i;
            best_dist = dist;
        }
    }
    best
}

fn to_point(p: PixelPoint<i32>) -> Point {
    Point::new(p.x as f32, p.y as f32)
}

// -- Tests --------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GrayImage, Luma, Rgb, RgbImage};

    fn quad_with_ratio(ratio: f32, height: f32) -> Quadrilateral {
        let width = ratio * height;
        Quadrilateral::from_points([
            Point::new(10.0, 10.0),
            Point::new(10.0 + width, 10.0),
            Point::new(10.0 + width, 10.0 + height),
            Point::new(10.0, 10.0 + height),
        ])
    }

    /// Dark background with a bright, card-proportioned rectangle.
    fn synthetic_card_frame() -> DynamicImage {
        let (w, h) = (400u32, 500u32);
        let mut img = RgbImage::from_pixel(w, h, Rgb([25, 30, 35]));
        for y in 110..390 {
            for x in 100..300 {
                img.put_pixel(x, y, Rgb([235, 230, 220]));
            }
        }
        DynamicImage::ImageRgb8(img)
    }

    #[test]
    fn blank_frame_is_a_miss() {
        let img = DynamicImage::ImageLuma8(GrayImage::from_pixel(320, 240, Luma([128u8])));
        let result = CardDetector::default().detect_image(&img);
        assert_eq!(result, DetectionResult::miss());
    }

    #[test]
    fn empty_frame_is_a_miss() {
        let img = DynamicImage::ImageLuma8(GrayImage::new(0, 0));
        assert_eq!(CardDetector::default().detect_image(&img), DetectionResult::miss());
    }

    #[test]
    fn tiny_blob_is_filtered_by_area() {
        let mut img = GrayImage::from_pixel(400, 400, Luma([20u8]));
        // 20x28 is 0.35% of the frame, well below the 5% floor.
        for y in 100..128 {
            for x in 100..120 {
                img.put_pixel(x, y, Luma([240u8]));
            }
        }
        let result = CardDetector::default().detect_image(&DynamicImage::ImageLuma8(img));
        assert!(!result.detected());
        assert!(result.quad().is_none());
        assert_eq!(result.confidence(), 0.0);
    }

    #[test]
    fn synthetic_card_is_detected() {
        let result = CardDetector::default().detect_image(&synthetic_card_frame());
        assert!(result.detected(), "expected a detection");
        assert!(result.confidence() > 0.3);

        let quad = result.quad().expect("quad present");
        let close = |p: Point, x: f32, y: f32| (p.x - x).abs() < 8.0 && (p.y - y).abs() < 8.0;
        assert!(close(quad.top_left, 100.0, 110.0), "{:?}", quad.top_left);
        assert!(close(quad.top_right, 299.0, 110.0), "{:?}", quad.top_right);
        assert!(close(quad.bottom_right, 299.0, 389.0), "{:?}", quad.bottom_right);
        assert!(close(quad.bottom_left, 100.0, 389.0), "{:?}", quad.bottom_left);
    }

    #[test]
    fn card_shaped_candidate_outranks_elongated_one() {
        let frame_area = 1000.0 * 1000.0;
        let area = 0.40 * frame_area;

        let card = score_candidate(&quad_with_ratio(0.71, 700.0), area, frame_area);
        let strip = score_candidate(&quad_with_ratio(0.50, 700.0), area, frame_area);

        assert!(card > 0.3, "card score {card}");
        assert!(card > strip, "card {card} vs strip {strip}");
    }

    #[test]
    fn area_score_saturates_at_one_fifth() {
        let quad = quad_with_ratio(CARD_ASPECT_RATIO, 100.0);
        let at_fifth = score_candidate(&quad, 200.0, 1000.0);
        let at_half = score_candidate(&quad, 500.0, 1000.0);
        assert!((at_fifth - 1.0).abs() < 1e-4);
        assert!((at_half - 1.0).abs() < 1e-4);
    }

    #[test]
    fn square_scores_lower_than_card() {
        let frame_area = 1000.0;
        let card = score_candidate(&quad_with_ratio(CARD_ASPECT_RATIO, 10.0), 100.0, frame_area);
        let square = score_candidate(&quad_with_ratio(1.0, 10.0), 100.0, frame_area);
        assert!(card > square);
    }

    #[test]
    fn shoelace_area_of_pixel_square() {
        let points = vec![
            PixelPoint::new(0, 0),
            PixelPoint::new(10, 0),
            PixelPoint::new(10, 5),
            PixelPoint::new(0, 5),
        ];
        assert!((polygon_area(&points) - 50.0).abs() < 1e-3);
    }

    #[test]
    fn approximate_quad_rejects_triangle() {
        let mut points = Vec::new();
        for i in 0..100 {
            points.push(PixelPoint::new(i, 0));
        }
        for i in 0..100 {
            points.push(PixelPoint::new(100 - i, i));
        }
        assert!(approximate_quad(&points).is_none());
    }
}

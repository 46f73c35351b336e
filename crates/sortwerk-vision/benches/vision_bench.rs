// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Criterion benchmarks for the sortwerk-vision crate. Detection runs on every
// 100ms tick, so its cost on a camera-sized frame bounds the tick budget.

use criterion::{Criterion, black_box, criterion_group, criterion_main};
use image::{DynamicImage, Rgb, RgbImage};

use sortwerk_vision::{CardDetector, CardNormalizer};

// ---------------------------------------------------------------------------
// Benchmarks
// ---------------------------------------------------------------------------

/// A 640x480 dark frame with a bright card-proportioned rectangle.
fn synthetic_frame() -> DynamicImage {
    let mut img = RgbImage::from_pixel(640, 480, Rgb([20, 25, 30]));
    for y in 90..390 {
        for x in 213..427 {
            img.put_pixel(x, y, Rgb([230, 225, 215]));
        }
    }
    DynamicImage::ImageRgb8(img)
}

fn bench_detection(c: &mut Criterion) {
    let frame = synthetic_frame();
    let detector = CardDetector::default();

    c.bench_function("detect_card (640x480)", |b| {
        b.iter(|| black_box(detector.detect_image(black_box(&frame))));
    });
}

fn bench_normalization(c: &mut Criterion) {
    let frame = synthetic_frame();
    let Some(quad) = CardDetector::default().detect_image(&frame).quad().copied() else {
        return;
    };
    let normalizer = CardNormalizer::default();

    c.bench_function("normalize_card (745 wide)", |b| {
        b.iter(|| black_box(normalizer.normalize(black_box(&frame), &quad)));
    });
}

criterion_group!(benches, bench_detection, bench_normalization);
criterion_main!(benches);

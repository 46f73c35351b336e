// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// sortwerk-vision — Finding a trading card in a camera frame.
//
// Provides the contour-based card detector and the perspective normalizer
// that turns a detected card into an upright, contrast-boosted image for
// the identification service.

pub mod detect;
pub mod normalize;

pub use detect::{CardDetector, score_candidate};
pub use normalize::CardNormalizer;

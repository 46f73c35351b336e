// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Core domain types for the Sortwerk card scanner and sorter.

use chrono::{DateTime, Utc};
use image::DynamicImage;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Width / height of a standard trading card (2.5in x 3.5in).
pub const CARD_ASPECT_RATIO: f32 = 2.5 / 3.5;

/// Unique identifier for a scan session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Frames and geometry
// ---------------------------------------------------------------------------

/// A single camera frame.
#[derive(Debug, Clone)]
pub struct Frame {
    pub image: DynamicImage,
    pub captured_at: DateTime<Utc>,
}

impl Frame {
    /// Wrap an image captured right now.
    pub fn new(image: DynamicImage) -> Self {
        Self {
            image,
            captured_at: Utc::now(),
        }
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    /// Frame area in square pixels.
    pub fn area(&self) -> f32 {
        self.width() as f32 * self.height() as f32
    }
}

/// A point in image coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

impl Point {
    pub const fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    /// Euclidean distance to another point.
    pub fn distance(&self, other: &Point) -> f32 {
        ((self.x - other.x).powi(2) + (self.y - other.y).powi(2)).sqrt()
    }

    fn sum(&self) -> f32 {
        self.x + self.y
    }

    fn diff(&self) -> f32 {
        self.y - self.x
    }
}

/// Four card corners in canonical order.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Quadrilateral {
    pub top_left: Point,
    pub top_right: Point,
    pub bottom_right: Point,
    pub bottom_left: Point,
}

impl Quadrilateral {
    /// Assign four unordered points to named corners.
    ///
    /// top-left has the smallest `x + y`, bottom-right the largest; top-right
    /// has the smallest `y - x`, bottom-left the largest. The result does not
    /// depend on the order of `points`.
    pub fn from_points(points: [Point; 4]) -> Self {
        let by = |key: fn(&Point) -> f32, largest: bool| -> Point {
            let mut best = points[0];
            for p in &points[1..] {
                let better = if largest {
                    key(p) > key(&best)
                } else {
                    key(p) < key(&best)
                };
                if better {
                    best = *p;
                }
            }
            best
        };

        Self {
            top_left: by(Point::sum, false),
            bottom_right: by(Point::sum, true),
            top_right: by(Point::diff, false),
            bottom_left: by(Point::diff, true),
        }
    }

    /// Corners as `[top_left, top_right, bottom_right, bottom_left]`.
    pub fn corners(&self) -> [Point; 4] {
        [
            self.top_left,
            self.top_right,
            self.bottom_right,
            self.bottom_left,
        ]
    }

    /// Polygon area via the shoelace formula.
    pub fn area(&self) -> f32 {
        let corners = self.corners();
        let mut area = 0.0f32;
        for i in 0..4 {
            let j = (i + 1) % 4;
            area += corners[i].x * corners[j].y;
            area -= corners[j].x * corners[i].y;
        }
        area.abs() / 2.0
    }

    /// Short side over long side, using the mean length of opposite edges.
    ///
    /// Always in `0..=1`, so portrait and landscape cards score alike.
    pub fn aspect_ratio(&self) -> f32 {
        let width = (self.top_left.distance(&self.top_right)
            + self.bottom_left.distance(&self.bottom_right))
            / 2.0;
        let height = (self.top_left.distance(&self.bottom_left)
            + self.top_right.distance(&self.bottom_right))
            / 2.0;
        let (short, long) = if width < height {
            (width, height)
        } else {
            (height, width)
        };
        if long <= f32::EPSILON {
            0.0
        } else {
            short / long
        }
    }
}

/// Outcome of running the contour detector on one frame.
///
/// Fields are private so a miss can never carry a quad or a confidence.
/// Only constructed by [`miss`](Self::miss) and [`hit`](Self::hit), never
/// deserialized.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct DetectionResult {
    detected: bool,
    quad: Option<Quadrilateral>,
    confidence: f32,
}

impl DetectionResult {
    /// No card in frame.
    pub const fn miss() -> Self {
        Self {
            detected: false,
            quad: None,
            confidence: 0.0,
        }
    }

    /// A card was found with the given score (clamped to `0..=1`).
    pub fn hit(quad: Quadrilateral, confidence: f32) -> Self {
        Self {
            detected: true,
            quad: Some(quad),
            confidence: confidence.clamp(0.0, 1.0),
        }
    }

    pub fn detected(&self) -> bool {
        self.detected
    }

    pub fn quad(&self) -> Option<&Quadrilateral> {
        self.quad.as_ref()
    }

    pub fn confidence(&self) -> f32 {
        self.confidence
    }
}

impl Default for DetectionResult {
    fn default() -> Self {
        Self::miss()
    }
}

// ---------------------------------------------------------------------------
// Identification
// ---------------------------------------------------------------------------

/// A catalog match returned by the identification service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CardMatch {
    /// Catalog identity of the matched card.
    pub match_id: String,
    /// Embedding distance (lower is closer).
    pub distance: f32,
}

/// Lifecycle states of the scanner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ScanStatus {
    /// Scanner created, camera not yet requested.
    Initializing,
    /// Waiting for the frame source to open.
    RequestingCamera,
    /// Camera ready, detection suspended.
    Paused,
    /// Looking for a settled card.
    Scanning,
    /// Identification in flight.
    Searching,
    /// The card in frame was already accepted.
    Duplicate,
    /// The identification service found nothing.
    NoMatch,
    /// Camera or identification failure; retry required.
    Error,
}

impl ScanStatus {
    /// Short label for status indicators.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Initializing => "Initializing",
            Self::RequestingCamera => "Requesting camera",
            Self::Paused => "Paused",
            Self::Scanning => "Scanning",
            Self::Searching => "Searching",
            Self::Duplicate => "Duplicate",
            Self::NoMatch => "No match",
            Self::Error => "Error",
        }
    }

    /// Whether the scanner is actively processing frames.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            Self::Scanning | Self::Searching | Self::Duplicate | Self::NoMatch
        )
    }
}

impl std::fmt::Display for ScanStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

// ---------------------------------------------------------------------------
// Sorter
// ---------------------------------------------------------------------------

/// One physical output bin as configured by the operator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BinConfig {
    pub number: u8,
    pub name: String,
    /// Receives every card that matches no explicit rule.
    pub is_catch_all: bool,
}

/// Bin chosen for a card by the routing policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BinAssignment {
    pub bin_number: u8,
    pub is_catch_all: bool,
}

/// Named servo on a sorter module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServoKind {
    Pusher,
    Gate,
}

/// Persisted servo positions for one sorter module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModuleCalibration {
    pub module: u8,
    pub pusher_rest: u16,
    pub pusher_extended: u16,
    pub gate_open: u16,
    pub gate_closed: u16,
}

// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Collaborators the scanner depends on but does not implement.
//
// Camera drivers, the similarity-search backend, bin rules, and calibration
// persistence all live outside this crate; the scanner only sees them through
// these traits.

use std::future::Future;

use sortwerk_core::error::Result;
use sortwerk_core::types::{BinAssignment, BinConfig, CardMatch, Frame, ModuleCalibration};

/// A live camera stream.
pub trait FrameSource: Send + 'static {
    /// Acquire the camera.  Permission problems must be reported as
    /// `CameraPermissionDenied`, everything else as `CameraUnavailable`.
    fn open(&mut self) -> Result<()>;

    /// The most recent frame, or `None` if nothing new has arrived.
    fn latest_frame(&mut self) -> Option<Frame>;

    /// Release the camera.  Must be safe to call when not open.
    fn close(&mut self);
}

/// Resolves a normalized card image to a catalog identity.
pub trait IdentificationService: Send + Sync + 'static {
    /// Identify the PNG-encoded card image.  `Ok(None)` means the backend
    /// found no match.
    fn identify(
        &self,
        image_png: Vec<u8>,
    ) -> impl Future<Output = Result<Option<CardMatch>>> + Send;
}

/// Chooses the output bin for an identified card.
pub trait RoutingPolicy: Send + Sync + 'static {
    /// First matching rule wins; the catch-all bin is the fallback.
    fn route(&self, card: &CardMatch, bins: &[BinConfig]) -> Option<BinAssignment>;
}

/// Persisted servo calibration, replayed to the sorter on every connect.
pub trait CalibrationStore: Send + Sync + 'static {
    fn load_all(&self) -> Result<Vec<ModuleCalibration>>;
}

/// Routes every card to the catch-all bin.
///
/// Used when no rule evaluator is plugged in.
#[derive(Debug, Clone, Copy, Default)]
pub struct CatchAllRouting;

impl RoutingPolicy for CatchAllRouting {
    fn route(&self, _card: &CardMatch, bins: &[BinConfig]) -> Option<BinAssignment> {
        bins.iter().find(|b| b.is_catch_all).map(|b| BinAssignment {
            bin_number: b.number,
            is_catch_all: true,
        })
    }
}

/// A fixed calibration set held in memory.
#[derive(Debug, Clone, Default)]
pub struct StaticCalibration(pub Vec<ModuleCalibration>);

impl CalibrationStore for StaticCalibration {
    fn load_all(&self) -> Result<Vec<ModuleCalibration>> {
        Ok(self.0.clone())
    }
}

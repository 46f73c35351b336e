// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Sortwerk Scanner — the scan loop.  Watches the camera for a settled card,
// sends it for identification, tracks duplicates and operator overrides,
// and hands accepted cards to the sorter.

pub mod dispatch;
pub mod scanner;
pub mod services;
pub mod session;
pub mod stability;

pub use dispatch::{DispatchOutcome, Sorter};
pub use scanner::{ScanEvent, Scanner};
pub use services::{CalibrationStore, CatchAllRouting, FrameSource, IdentificationService, RoutingPolicy};
pub use session::{AcceptedCard, JamAlert, ScanSession, ScannerSnapshot};
pub use stability::{StabilityTracker, TickGate};

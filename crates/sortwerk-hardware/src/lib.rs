// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Sortwerk Hardware — the serial link to the sorter firmware.  Commands go
// out as one JSON object per line; replies come back one line each and are
// matched to commands strictly in order, since the firmware protocol carries
// no request identifiers.

pub mod calibration;
pub mod framing;
pub mod link;
pub mod protocol;
pub mod serial;

pub use calibration::replay_calibration;
pub use link::{HardwareLink, LinkEvent};
pub use protocol::{Command, DeviceMessage};

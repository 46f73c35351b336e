// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Replaying stored servo calibration to the sorter after it connects.

use sortwerk_core::error::{Result, SortwerkError};
use sortwerk_core::types::ModuleCalibration;
use tracing::{info, instrument, warn};

use crate::link::HardwareLink;
use crate::protocol::{Command, DeviceMessage};

/// What the sorter said about one module's calibration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplayOutcome {
    Acknowledged,
    Rejected(Option<String>),
    NoResponse,
    /// The command could not be sent or the reply was unreadable.
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplayReport {
    pub module: u8,
    pub outcome: ReplayOutcome,
}

impl ReplayReport {
    pub fn is_acknowledged(&self) -> bool {
        self.outcome == ReplayOutcome::Acknowledged
    }
}

/// Send one `setConfig` per module, in module order.
///
/// A module the sorter rejects or ignores does not stop the replay; its
/// outcome is recorded in the report.  Losing the link aborts the replay.
#[instrument(skip_all, fields(modules = calibrations.len()))]
pub async fn replay_calibration(
    link: &HardwareLink,
    calibrations: &[ModuleCalibration],
) -> Result<Vec<ReplayReport>> {
    let mut ordered = calibrations.to_vec();
    ordered.sort_by_key(|c| c.module);

    let mut reports = Vec::with_capacity(ordered.len());
    for calibration in ordered {
        let module = calibration.module;
        let outcome = match link.send(&Command::set_config(calibration)).await {
            Ok(Some(DeviceMessage::Ack { ok: true, .. })) => ReplayOutcome::Acknowledged,
            Ok(Some(DeviceMessage::Ack { ok: false, error })) => ReplayOutcome::Rejected(error),
            Ok(Some(other)) => ReplayOutcome::Failed(format!("unexpected reply: {other:?}")),
            Ok(None) => ReplayOutcome::NoResponse,
            Err(SortwerkError::NotConnected) => return Err(SortwerkError::NotConnected),
            Err(err) => ReplayOutcome::Failed(err.to_string()),
        };

        if outcome != ReplayOutcome::Acknowledged {
            warn!(module, ?outcome, "calibration not applied");
        }
        reports.push(ReplayReport { module, outcome });
    }

    let applied = reports.iter().filter(|r| r.is_acknowledged()).count();
    info!(applied, total = reports.len(), "calibration replayed");
    Ok(reports)
}

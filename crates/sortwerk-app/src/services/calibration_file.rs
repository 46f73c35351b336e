// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Servo calibration stored as a JSON array of module records.

use std::path::{Path, PathBuf};

use sortwerk_core::error::{Result, SortwerkError};
use sortwerk_core::types::ModuleCalibration;
use sortwerk_scanner::CalibrationStore;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct CalibrationFile {
    path: PathBuf,
}

impl CalibrationFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl CalibrationStore for CalibrationFile {
    fn load_all(&self) -> Result<Vec<ModuleCalibration>> {
        let raw = std::fs::read_to_string(&self.path)?;
        let modules: Vec<ModuleCalibration> = serde_json::from_str(&raw)?;

        let mut seen = std::collections::HashSet::new();
        if let Some(dup) = modules.iter().find(|m| !seen.insert(m.module)) {
            return Err(SortwerkError::Config(format!(
                "module {} is calibrated twice in {}",
                dup.module,
                self.path.display()
            )));
        }
        debug!(path = %self.path.display(), modules = modules.len(), "calibration loaded");
        Ok(modules)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TWO_MODULES: &str = r#"[
        {"module":2,"pusherRest":310,"pusherExtended":470,"gateOpen":190,"gateClosed":400},
        {"module":1,"pusherRest":300,"pusherExtended":480,"gateOpen":200,"gateClosed":410}
    ]"#;

    #[test]
    fn loads_camel_case_records() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("calibration.json");
        std::fs::write(&path, TWO_MODULES).expect("write");

        let modules = CalibrationFile::new(&path).load_all().expect("load");
        assert_eq!(modules.len(), 2);
        assert_eq!(modules[0].module, 2);
        assert_eq!(modules[1].pusher_extended, 480);
    }

    #[test]
    fn duplicate_module_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("calibration.json");
        let one = r#"{"module":1,"pusherRest":300,"pusherExtended":480,"gateOpen":200,"gateClosed":410}"#;
        std::fs::write(&path, format!("[{one},{one}]")).expect("write");

        assert!(matches!(
            CalibrationFile::new(&path).load_all(),
            Err(SortwerkError::Config(_))
        ));
    }

    #[test]
    fn malformed_file_is_a_serialization_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("calibration.json");
        std::fs::write(&path, "{not json").expect("write");

        assert!(matches!(
            CalibrationFile::new(&path).load_all(),
            Err(SortwerkError::Serialization(_))
        ));
    }
}

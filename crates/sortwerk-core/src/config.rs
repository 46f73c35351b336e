// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Sorter configuration.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Result, SortwerkError};

/// Persistent scanner and sorter settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SorterConfig {
    /// Minimum spacing between detection ticks.
    pub detection_interval_ms: u64,
    /// How often the scanner polls the frame source (display cadence).
    pub frame_poll_interval_ms: u64,
    /// Consecutive detections required before a card counts as settled.
    pub stable_frames: u32,
    /// Detector score a candidate must exceed to be accepted.
    pub min_confidence: f32,
    /// Width of the normalized card image sent for identification.
    pub normalized_width: u32,
    /// How long a sorter command waits for its reply.
    pub hardware_timeout_ms: u64,
    /// Serial device path (e.g. `/dev/ttyUSB0`).
    pub serial_port: Option<String>,
    /// Serial baud rate.
    pub baud_rate: u32,
}

impl Default for SorterConfig {
    fn default() -> Self {
        Self {
            detection_interval_ms: 100,
            frame_poll_interval_ms: 20,
            stable_frames: 5,
            min_confidence: 0.3,
            normalized_width: 745,
            hardware_timeout_ms: 3000,
            serial_port: None,
            baud_rate: 115_200,
        }
    }
}

impl SorterConfig {
    /// Load a JSON config file. Missing keys take their default values.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        info!(path = %path.as_ref().display(), "configuration loaded");
        Ok(config)
    }

    /// Write the config as pretty-printed JSON.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path.as_ref(), json)?;
        debug!(path = %path.as_ref().display(), "configuration saved");
        Ok(())
    }

    /// Reject values the scanner cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.detection_interval_ms == 0 || self.frame_poll_interval_ms == 0 {
            return Err(SortwerkError::Config("intervals must be non-zero".into()));
        }
        if self.stable_frames == 0 {
            return Err(SortwerkError::Config("stable_frames must be at least 1".into()));
        }
        if !(0.0..1.0).contains(&self.min_confidence) {
            return Err(SortwerkError::Config(format!(
                "min_confidence {} is outside 0..1",
                self.min_confidence
            )));
        }
        if self.normalized_width < 16 {
            return Err(SortwerkError::Config(format!(
                "normalized_width {} is too small",
                self.normalized_width
            )));
        }
        Ok(())
    }

    pub fn detection_interval(&self) -> Duration {
        Duration::from_millis(self.detection_interval_ms)
    }

    pub fn frame_poll_interval(&self) -> Duration {
        Duration::from_millis(self.frame_poll_interval_ms)
    }

    pub fn hardware_timeout(&self) -> Duration {
        Duration::from_millis(self.hardware_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn save_and_load() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.json");

        let config = SorterConfig {
            serial_port: Some("/dev/ttyACM0".into()),
            ..Default::default()
        };
        config.save(&path).expect("save");

        let loaded = SorterConfig::load(&path).expect("load");
        assert_eq!(loaded, config);
    }

    #[test]
    fn missing_keys_use_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{ "baud_rate": 9600 }"#).expect("write");

        let loaded = SorterConfig::load(&path).expect("load");
        assert_eq!(loaded.baud_rate, 9600);
        assert_eq!(loaded.stable_frames, 5);
        assert_eq!(loaded.hardware_timeout(), Duration::from_millis(3000));
    }

    #[test]
    fn zero_stable_frames_rejected() {
        let config = SorterConfig {
            stable_frames: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(SortwerkError::Config(_))));
    }
}

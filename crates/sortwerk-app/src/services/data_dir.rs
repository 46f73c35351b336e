// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Data directory resolution and config file loading.

use std::path::{Path, PathBuf};

use sortwerk_core::SorterConfig;
use sortwerk_core::error::Result;
use tracing::{debug, warn};

const CONFIG_FILE: &str = "config.json";
const CALIBRATION_FILE: &str = "calibration.json";

/// Return the application data directory, creating it if needed.
pub fn data_dir() -> PathBuf {
    let dir = dirs_fallback().join("sortwerk");
    if let Err(err) = std::fs::create_dir_all(&dir) {
        warn!(dir = %dir.display(), error = %err, "cannot create data directory");
    }
    dir
}

/// Default location of the stored servo calibration.
pub fn calibration_path(data_dir: &Path) -> PathBuf {
    data_dir.join(CALIBRATION_FILE)
}

/// Load the config: an explicit path must exist and parse; otherwise
/// `config.json` in the data directory is used if present, else defaults.
pub fn load_config(explicit: Option<&Path>, data_dir: &Path) -> Result<SorterConfig> {
    if let Some(path) = explicit {
        return SorterConfig::load(path);
    }
    let path = data_dir.join(CONFIG_FILE);
    if path.exists() {
        SorterConfig::load(&path)
    } else {
        debug!(path = %path.display(), "no config file, using defaults");
        Ok(SorterConfig::default())
    }
}

fn dirs_fallback() -> PathBuf {
    // XDG data dir, then ~/.local/share
    if let Ok(xdg) = std::env::var("XDG_DATA_HOME") {
        return PathBuf::from(xdg);
    }
    if let Ok(home) = std::env::var("HOME") {
        return PathBuf::from(home).join(".local").join("share");
    }
    std::env::temp_dir()
}

#[cfg(test)]
mod tests {
    use super::*;
    use sortwerk_core::SortwerkError;

    #[test]
    fn defaults_without_config_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = load_config(None, dir.path()).expect("load");
        assert_eq!(config, SorterConfig::default());
    }

    #[test]
    fn config_file_in_data_dir_is_used() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(
            dir.path().join(CONFIG_FILE),
            r#"{"serial_port":"/dev/ttyACM0","stable_frames":7}"#,
        )
        .expect("write");

        let config = load_config(None, dir.path()).expect("load");
        assert_eq!(config.serial_port.as_deref(), Some("/dev/ttyACM0"));
        assert_eq!(config.stable_frames, 7);
        assert_eq!(config.baud_rate, 115_200);
    }

    #[test]
    fn explicit_path_must_exist() {
        let dir = tempfile::tempdir().expect("tempdir");
        let missing = dir.path().join("nope.json");
        assert!(matches!(
            load_config(Some(&missing), dir.path()),
            Err(SortwerkError::Io(_))
        ));
    }
}

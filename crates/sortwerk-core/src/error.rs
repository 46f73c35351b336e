// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Unified error types for Sortwerk.

use thiserror::Error;

/// Top-level error type for all Sortwerk operations.
#[derive(Debug, Error)]
pub enum SortwerkError {
    // -- Camera errors --
    #[error("camera permission denied")]
    CameraPermissionDenied,

    #[error("camera unavailable: {0}")]
    CameraUnavailable(String),

    // -- Vision / identification --
    #[error("image processing failed: {0}")]
    Vision(String),

    #[error("card identification failed: {0}")]
    Identification(String),

    // -- Hardware link --
    #[error("sorter is not connected")]
    NotConnected,

    #[error("sorter disconnected: {0}")]
    HardwareDisconnected(String),

    #[error("unrecognised sorter message: {0}")]
    Protocol(String),

    // -- Configuration / persistence --
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("file I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, SortwerkError>;

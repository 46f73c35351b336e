// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Operator-facing error messages.
//
// Every technical error is mapped to plain English with a clear suggestion.
// The severity drives how the status indicator presents it.

use crate::error::SortwerkError;

/// Severity of an error from the operator's perspective.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Glitch that goes away on its own or with a retry.
    Transient,
    /// The operator must do something (grant access, plug in, clear a jam).
    ActionRequired,
    /// Retrying will not help without a configuration change.
    Permanent,
}

/// A readable error with an actionable suggestion.
#[derive(Debug, Clone)]
pub struct HumanError {
    /// Plain English summary (shown as a heading).
    pub message: String,
    /// What the operator should try (shown as body text).
    pub suggestion: String,
    /// Whether a retry button makes sense.
    pub retriable: bool,
    pub severity: Severity,
}

/// Convert a `SortwerkError` into a `HumanError`.
pub fn humanize_error(err: &SortwerkError) -> HumanError {
    match err {
        SortwerkError::CameraPermissionDenied => HumanError {
            message: "Camera access was denied.".into(),
            suggestion: "Allow camera access for Sortwerk in your system settings, then tap Retry.".into(),
            retriable: true,
            severity: Severity::ActionRequired,
        },

        SortwerkError::CameraUnavailable(detail) => HumanError {
            message: "The camera could not be started.".into(),
            suggestion: format!(
                "Check the camera is plugged in and not used by another program, then tap Retry. ({detail})"
            ),
            retriable: true,
            severity: Severity::ActionRequired,
        },

        SortwerkError::Vision(_) => HumanError {
            message: "The card image could not be processed.".into(),
            suggestion: "Straighten the card under the camera and try again.".into(),
            retriable: true,
            severity: Severity::Transient,
        },

        SortwerkError::Identification(detail) => humanize_identification_error(detail),

        SortwerkError::NotConnected => HumanError {
            message: "The sorter is not connected.".into(),
            suggestion: "Connect the sorter's USB cable and choose its port in Settings.".into(),
            retriable: true,
            severity: Severity::ActionRequired,
        },

        SortwerkError::HardwareDisconnected(_) => HumanError {
            message: "The sorter was disconnected.".into(),
            suggestion: "Check the USB cable and power supply, then reconnect.".into(),
            retriable: true,
            severity: Severity::ActionRequired,
        },

        SortwerkError::Protocol(_) => HumanError {
            message: "The sorter sent something we don't understand.".into(),
            suggestion: "The sorter firmware may be out of date. Try updating it.".into(),
            retriable: false,
            severity: Severity::Permanent,
        },

        SortwerkError::Config(detail) => HumanError {
            message: "A setting is invalid.".into(),
            suggestion: format!("Open Settings and correct it. ({detail})"),
            retriable: false,
            severity: Severity::Permanent,
        },

        SortwerkError::Io(io_err) => {
            if io_err.kind() == std::io::ErrorKind::PermissionDenied {
                HumanError {
                    message: "Sortwerk doesn't have permission to use that device or file.".into(),
                    suggestion: "On Linux, add your user to the `dialout` group for serial ports.".into(),
                    retriable: false,
                    severity: Severity::ActionRequired,
                }
            } else if io_err.kind() == std::io::ErrorKind::NotFound {
                HumanError {
                    message: "The device or file couldn't be found.".into(),
                    suggestion: "Check the serial port name or file path and try again.".into(),
                    retriable: false,
                    severity: Severity::ActionRequired,
                }
            } else {
                HumanError {
                    message: "There was a problem talking to a device.".into(),
                    suggestion: "Try again. If this keeps happening, reconnect the device.".into(),
                    retriable: true,
                    severity: Severity::Transient,
                }
            }
        }

        SortwerkError::Serialization(_) => HumanError {
            message: "Sortwerk had an internal data problem.".into(),
            suggestion: "Try again. If this keeps happening, please report it.".into(),
            retriable: true,
            severity: Severity::Transient,
        },
    }
}

/// Parse identification failure details into readable messages.
fn humanize_identification_error(detail: &str) -> HumanError {
    let lower = detail.to_ascii_lowercase();

    if lower.contains("timed out") || lower.contains("connection") {
        HumanError {
            message: "The card lookup service didn't respond.".into(),
            suggestion: "Check your network connection, then tap Retry.".into(),
            retriable: true,
            severity: Severity::Transient,
        }
    } else if lower.contains("decode") {
        HumanError {
            message: "The card lookup service sent a bad answer.".into(),
            suggestion: "Tap Retry. If it keeps happening, the service may be down.".into(),
            retriable: true,
            severity: Severity::Transient,
        }
    } else {
        HumanError {
            message: "The card couldn't be looked up.".into(),
            suggestion: format!("Tap Retry to scan again. (Detail: {detail})"),
            retriable: true,
            severity: Severity::Transient,
        }
    }
}

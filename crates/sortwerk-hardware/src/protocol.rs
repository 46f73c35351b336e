// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Sorter wire protocol.
//
// Outbound: one JSON object per line.
//
//   {"bin":3}
//   {"setConfig":{"module":1,"pusherRest":300,...}}
//   {"servo":"pusher","module":2,"value":307}
//
// Inbound: one JSON object or plain-text line per reply or notification.
//
//   {"ok":true}            {"ok":false,"error":"busy"}
//   {"event":"jam","module":2}    {"event":"ready"}
//   jam                    any other text
//
// JSON lines of any other shape are rejected with a `Protocol` error.

use serde::{Deserialize, Serialize};
use sortwerk_core::error::{Result, SortwerkError};
use sortwerk_core::types::{ModuleCalibration, ServoKind};

/// A command understood by the sorter firmware.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Command {
    /// Route the card on the belt into `bin`.
    Bin { bin: u8 },
    /// Push servo calibration for one module.
    SetConfig {
        #[serde(rename = "setConfig")]
        set_config: ModuleCalibration,
    },
    /// Move one servo to a raw position (used while calibrating).
    Servo {
        servo: ServoKind,
        module: u8,
        value: u16,
    },
}

impl Command {
    pub fn bin(bin: u8) -> Self {
        Self::Bin { bin }
    }

    pub fn set_config(calibration: ModuleCalibration) -> Self {
        Self::SetConfig {
            set_config: calibration,
        }
    }

    pub fn servo(servo: ServoKind, module: u8, value: u16) -> Self {
        Self::Servo {
            servo,
            module,
            value,
        }
    }

    /// Encode as a single newline-terminated JSON line.
    pub fn to_line(&self) -> Result<String> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }
}

/// A line received from the sorter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceMessage {
    /// Command acknowledgement.
    Ack { ok: bool, error: Option<String> },
    /// A card is stuck; the operator must clear it.
    Jam { module: Option<u8> },
    /// Firmware finished booting.
    Ready,
    /// Any other plain-text line (firmware banners, debug output).
    Text(String),
}

#[derive(Deserialize)]
#[serde(untagged)]
enum WireMessage {
    Ack(AckBody),
    Event(EventBody),
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct AckBody {
    ok: bool,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct EventBody {
    event: EventKind,
    #[serde(default)]
    module: Option<u8>,
}

#[derive(Deserialize)]
#[serde(rename_all = "lowercase")]
enum EventKind {
    Jam,
    Ready,
}

impl DeviceMessage {
    /// Parse one received line (without its terminator).
    pub fn parse(line: &str) -> Result<Self> {
        let trimmed = line.trim();

        if trimmed.starts_with('{') || trimmed.starts_with('[') {
            let wire: WireMessage = serde_json::from_str(trimmed)
                .map_err(|_| SortwerkError::Protocol(trimmed.to_string()))?;
            return Ok(match wire {
                WireMessage::Ack(AckBody { ok, error }) => Self::Ack { ok, error },
                WireMessage::Event(EventBody {
                    event: EventKind::Jam,
                    module,
                }) => Self::Jam { module },
                WireMessage::Event(EventBody {
                    event: EventKind::Ready,
                    ..
                }) => Self::Ready,
            });
        }

        if let Some(rest) = strip_prefix_ignore_case(trimmed, "jam") {
            let rest = rest.trim();
            if rest.is_empty() {
                return Ok(Self::Jam { module: None });
            }
            if let Ok(module) = rest.parse::<u8>() {
                return Ok(Self::Jam {
                    module: Some(module),
                });
            }
        }

        Ok(Self::Text(trimmed.to_string()))
    }

    pub fn is_jam(&self) -> bool {
        matches!(self, Self::Jam { .. })
    }

    /// Whether this is a positive acknowledgement.
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ack { ok: true, .. })
    }
}

fn strip_prefix_ignore_case<'a>(text: &'a str, prefix: &str) -> Option<&'a str> {
    let head = text.get(..prefix.len())?;
    head.eq_ignore_ascii_case(prefix)
        .then(|| &text[prefix.len()..])
}

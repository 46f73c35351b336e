// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Serial port access.

use sortwerk_core::error::{Result, SortwerkError};
use tokio_serial::{SerialPortBuilderExt, SerialPortType, SerialStream};
use tracing::{debug, info};

/// A serial port visible to the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortInfo {
    pub name: String,
    /// Human-readable description, when the OS reports one.
    pub description: Option<String>,
}

/// Open `path` at `baud_rate`, 8N1, as an async stream.
pub fn open_serial(path: &str, baud_rate: u32) -> Result<SerialStream> {
    let stream = tokio_serial::new(path, baud_rate)
        .open_native_async()
        .map_err(|err| {
            SortwerkError::HardwareDisconnected(format!("cannot open {path}: {err}"))
        })?;
    info!(path, baud_rate, "serial port opened");
    Ok(stream)
}

/// List the serial ports the OS knows about.
pub fn available_ports() -> Result<Vec<PortInfo>> {
    let ports = tokio_serial::available_ports()
        .map_err(|err| SortwerkError::HardwareDisconnected(err.to_string()))?;
    debug!(count = ports.len(), "serial ports enumerated");

    Ok(ports
        .into_iter()
        .map(|port| {
            let description = match port.port_type {
                SerialPortType::UsbPort(usb) => usb
                    .product
                    .or(usb.manufacturer)
                    .or_else(|| Some(format!("USB {:04x}:{:04x}", usb.vid, usb.pid))),
                SerialPortType::BluetoothPort => Some("Bluetooth".to_string()),
                SerialPortType::PciPort | SerialPortType::Unknown => None,
            };
            PortInfo {
                name: port.port_name,
                description,
            }
        })
        .collect())
}

//! Serial port handling
//!
//! Port enumeration, the auto-discovery allow-list and low-level port setup.

use serde::{Deserialize, Serialize};
use serialport::{SerialPort, SerialPortInfo, SerialPortType};
use std::collections::HashMap;
#[cfg(target_os = "linux")]
use std::fs;
use std::time::Duration;
use tracing::debug;

use super::{ProtocolError, DEFAULT_BAUD_RATE};

/// Information about an available serial port
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PortInfo {
    /// Port name (e.g., "/dev/ttyUSB0" or "COM3")
    pub name: String,

    /// USB vendor ID (if USB device)
    pub vid: Option<u16>,

    /// USB product ID (if USB device)
    pub pid: Option<u16>,

    /// Manufacturer name (if available)
    pub manufacturer: Option<String>,

    /// Product name (if available), e.g. "CP2102 USB to UART Bridge Controller"
    pub product: Option<String>,

    /// Serial number (if available)
    pub serial_number: Option<String>,
}

impl PortInfo {
    /// Port known only by name
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Human-readable description used for chipset matching
    pub fn description(&self) -> String {
        match (&self.manufacturer, &self.product) {
            (Some(m), Some(p)) => format!("{} {}", p, m),
            (None, Some(p)) => p.clone(),
            (Some(m), None) => m.clone(),
            (None, None) => String::new(),
        }
    }
}

impl From<SerialPortInfo> for PortInfo {
    fn from(info: SerialPortInfo) -> Self {
        let (vid, pid, manufacturer, product, serial_number) = match info.port_type {
            SerialPortType::UsbPort(usb_info) => (
                Some(usb_info.vid),
                Some(usb_info.pid),
                usb_info.manufacturer,
                usb_info.product,
                usb_info.serial_number,
            ),
            _ => (None, None, None, None, None),
        };

        Self {
            name: info.port_name,
            vid,
            pid,
            manufacturer,
            product,
            serial_number,
        }
    }
}

/// Allow-list applied when scanning all ports for a controller
///
/// A port qualifies if its path starts with one of `path_prefixes` or its
/// USB description contains one of `description_substrings` (the USB-UART
/// bridge chips used on the ESP32 boards).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PortFilter {
    /// Accepted device path prefixes
    pub path_prefixes: Vec<String>,
    /// Accepted fragments of the USB product or manufacturer string
    pub description_substrings: Vec<String>,
}

impl Default for PortFilter {
    fn default() -> Self {
        Self {
            path_prefixes: ["COM", "/dev/tt", "/dev/a", "/dev/cu.SLA", "/dev/cu.wchusb"]
                .into_iter()
                .map(String::from)
                .collect(),
            description_substrings: ["CH340", "CP2102"].into_iter().map(String::from).collect(),
        }
    }
}

impl PortFilter {
    /// Check whether `port` is a discovery candidate
    pub fn matches(&self, port: &PortInfo) -> bool {
        if self
            .path_prefixes
            .iter()
            .any(|prefix| port.name.starts_with(prefix.as_str()))
        {
            return true;
        }
        let description = port.description();
        self.description_substrings
            .iter()
            .any(|needle| description.contains(needle.as_str()))
    }
}

/// Helper used to sort port names so that:
///  - ttyACM* ports come first (sorted numerically by suffix)
///  - then ttyUSB* ports (sorted numerically)
///  - then other ports (sorted by name)
fn port_sort_key(name: &str) -> (u8, usize, String) {
    let basename = name.rsplit('/').next().unwrap_or(name);
    if let Some(rest) = basename.strip_prefix("ttyACM") {
        let num = rest.parse::<usize>().unwrap_or(usize::MAX);
        return (0, num, basename.to_string());
    }
    if let Some(rest) = basename.strip_prefix("ttyUSB") {
        let num = rest.parse::<usize>().unwrap_or(usize::MAX);
        return (1, num, basename.to_string());
    }
    (2, 0, basename.to_string())
}

/// List all available serial ports, with /dev fallbacks and deterministic ordering
pub fn list_ports() -> Vec<PortInfo> {
    let mut map: HashMap<String, PortInfo> = HashMap::new();
    for info in serialport::available_ports().unwrap_or_default() {
        let p = PortInfo::from(info);
        map.entry(p.name.clone()).or_insert(p);
    }

    // Linux-only: udev may not have tagged freshly plugged boards yet
    #[cfg(target_os = "linux")]
    if let Ok(entries) = fs::read_dir("/dev") {
        for entry in entries.flatten() {
            if let Some(fname) = entry.file_name().to_str() {
                if fname.starts_with("ttyACM") || fname.starts_with("ttyUSB") {
                    let full = format!("/dev/{}", fname);
                    map.entry(full.clone())
                        .or_insert_with(|| PortInfo::named(full));
                }
            }
        }
    }

    let mut v: Vec<PortInfo> = map.into_values().collect();
    v.sort_by_key(|p| port_sort_key(&p.name));
    v
}

/// Open a serial port for polling reads
pub fn open_port(name: &str, baud_rate: Option<u32>) -> Result<Box<dyn SerialPort>, ProtocolError> {
    let baud = baud_rate.unwrap_or(DEFAULT_BAUD_RATE);

    // Reads are only issued after bytes_to_read() reports data, so a short
    // timeout is enough
    serialport::new(name, baud)
        .timeout(Duration::from_millis(10))
        .open()
        .map_err(|e| match e.kind {
            serialport::ErrorKind::NoDevice
            | serialport::ErrorKind::Io(std::io::ErrorKind::NotFound) => {
                ProtocolError::PortNotFound(name.to_string())
            }
            _ => ProtocolError::SerialError(format!("{}: {}", name, e)),
        })
}

/// Configure a serial port for 8N1 without flow control
pub fn configure_port(port: &mut dyn SerialPort) -> Result<(), ProtocolError> {
    port.set_data_bits(serialport::DataBits::Eight)?;
    port.set_parity(serialport::Parity::None)?;
    port.set_stop_bits(serialport::StopBits::One)?;
    port.set_flow_control(serialport::FlowControl::None)?;

    // The ESP32 auto-reset circuit only fires when DTR and RTS differ;
    // hold both high so the board is neither reset nor put in the bootloader
    if let Err(e) = port.write_data_terminal_ready(true) {
        debug!(error = %e, "configure_port: failed to set DTR high (continuing)");
    }
    if let Err(e) = port.write_request_to_send(true) {
        debug!(error = %e, "configure_port: failed to set RTS high (continuing)");
    }

    Ok(())
}

//! Serial port discovery for building a hardware inventory.

#[cfg(feature = "native")]
use log::{debug, trace};

/// Known USB-to-UART bridge chips found on development boards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeKind {
    /// CH340/CH341.
    Ch340,
    /// Silicon Labs CP210x.
    Cp210x,
    /// FTDI FT232 family.
    Ftdi,
    /// Prolific PL2303.
    Prolific,
    /// Arm mbed / DAPLink interface firmware.
    DapLink,
    /// ST-LINK virtual COM port.
    StLink,
    /// Anything else.
    Unknown,
}

const KNOWN_BRIDGES: &[(u16, &[u16], BridgeKind)] = &[
    (0x1A86, &[0x7523, 0x7522, 0x5523, 0x55D4], BridgeKind::Ch340),
    (0x10C4, &[0xEA60, 0xEA70, 0xEA71], BridgeKind::Cp210x),
    (0x0403, &[0x6001, 0x6010, 0x6011, 0x6014, 0x6015], BridgeKind::Ftdi),
    (0x067B, &[0x2303, 0x23A3], BridgeKind::Prolific),
    (0x0D28, &[0x0204], BridgeKind::DapLink),
    (0x0483, &[], BridgeKind::StLink),
];

impl BridgeKind {
    /// Classify a USB VID/PID pair.
    pub fn from_vid_pid(vid: u16, pid: u16) -> Self {
        KNOWN_BRIDGES
            .iter()
            .find(|(known_vid, pids, _)| *known_vid == vid && (pids.is_empty() || pids.contains(&pid)))
            .map_or(Self::Unknown, |(_, _, kind)| *kind)
    }

    /// Human-readable name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Ch340 => "CH340/CH341",
            Self::Cp210x => "CP210x",
            Self::Ftdi => "FTDI",
            Self::Prolific => "PL2303",
            Self::DapLink => "DAPLink",
            Self::StLink => "ST-LINK",
            Self::Unknown => "Unknown",
        }
    }
}

/// A serial endpoint seen on the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetectedPort {
    /// Port path (e.g., "/dev/ttyACM0" or "COM3").
    pub name: String,
    /// Classified bridge chip.
    pub bridge: BridgeKind,
    /// USB vendor ID.
    pub vid: Option<u16>,
    /// USB product ID.
    pub pid: Option<u16>,
    /// Manufacturer string.
    pub manufacturer: Option<String>,
    /// Product string.
    pub product: Option<String>,
    /// USB serial number.
    pub serial: Option<String>,
}

impl DetectedPort {
    /// Stable identifier: the USB serial number, else the port path.
    pub fn resource_id(&self) -> String {
        self.serial.clone().unwrap_or_else(|| self.name.clone())
    }

    /// Platform guess for allocation: the product string, else the bridge name.
    pub fn platform(&self) -> String {
        self.product
            .clone()
            .unwrap_or_else(|| self.bridge.name().to_string())
    }
}

/// List serial ports with USB metadata.
#[cfg(feature = "native")]
pub fn detect_ports() -> Vec<DetectedPort> {
    let ports = match serialport::available_ports() {
        Ok(ports) => ports,
        Err(e) => {
            debug!("Failed to enumerate serial ports: {e}");
            return Vec::new();
        },
    };

    ports
        .into_iter()
        .map(|info| {
            let mut detected = DetectedPort {
                name: info.port_name.clone(),
                bridge: BridgeKind::Unknown,
                vid: None,
                pid: None,
                manufacturer: None,
                product: None,
                serial: None,
            };
            if let serialport::SerialPortType::UsbPort(usb) = info.port_type {
                trace!(
                    "Found USB port: {} ({:04X}:{:04X})",
                    info.port_name, usb.vid, usb.pid
                );
                detected.bridge = BridgeKind::from_vid_pid(usb.vid, usb.pid);
                detected.vid = Some(usb.vid);
                detected.pid = Some(usb.pid);
                detected.manufacturer = usb.manufacturer;
                detected.product = usb.product;
                detected.serial = usb.serial_number;
            }
            detected
        })
        .collect()
}

/// List serial ports (unavailable without the `native` feature).
#[cfg(not(feature = "native"))]
pub fn detect_ports() -> Vec<DetectedPort> {
    Vec::new()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn port(serial: Option<&str>, product: Option<&str>) -> DetectedPort {
        DetectedPort {
            name: "/dev/ttyACM0".to_string(),
            bridge: BridgeKind::DapLink,
            vid: Some(0x0D28),
            pid: Some(0x0204),
            manufacturer: None,
            product: product.map(str::to_string),
            serial: serial.map(str::to_string),
        }
    }

    #[test]
    fn test_bridge_from_vid_pid() {
        assert_eq!(BridgeKind::from_vid_pid(0x1A86, 0x7523), BridgeKind::Ch340);
        assert_eq!(BridgeKind::from_vid_pid(0x0D28, 0x0204), BridgeKind::DapLink);
        assert_eq!(BridgeKind::from_vid_pid(0x0483, 0x374B), BridgeKind::StLink);
        assert_eq!(BridgeKind::from_vid_pid(0x1234, 0x5678), BridgeKind::Unknown);
    }

    #[test]
    fn test_resource_id_prefers_serial_number() {
        assert_eq!(port(Some("0240000034"), None).resource_id(), "0240000034");
        assert_eq!(port(None, None).resource_id(), "/dev/ttyACM0");
    }

    #[test]
    fn test_platform_guess() {
        assert_eq!(port(None, Some("K64F")).platform(), "K64F");
        assert_eq!(port(None, None).platform(), "DAPLink");
    }
}

//! Device records and the path-based device classifier.

/// Coordinator hardware variants handled by this tool.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum DeviceKind {
    Unknown,
    RaspBee1,
    RaspBee2,
    ConBee1,
    ConBee2,
    Hive,
}

impl DeviceKind {
    /// RaspBee I and ConBee I expose the UART through an FTDI bridge,
    /// so a USB re-enumeration never signals their MCU reset.
    pub fn is_ftdi_bridge(self) -> bool {
        matches!(self, DeviceKind::RaspBee1 | DeviceKind::ConBee1)
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum Baudrate {
    #[default]
    Unknown,
    B38400,
    B115200,
}

impl Baudrate {
    pub fn bits_per_second(self) -> u32 {
        match self {
            Baudrate::B115200 => 115_200,
            // 38400 also serves as the fallback for unclassified paths
            _ => 38_400,
        }
    }
}

/// One enumerated serial device, as reported by the platform.
#[derive(Clone, Debug, Default)]
pub struct Device {
    pub name: String,
    pub serial: String,
    pub path: String,
    pub stable_path: String,
    pub baudrate: Baudrate,
}

const FW_VERSION_PLATFORM_MASK: u32 = 0x0000FF00;
const FW_VERSION_PLATFORM_R21: u32 = 0x00000700;

/// Infers the device variant and baud rate from the device path and the
/// firmware header. Pure: identical inputs give identical results.
pub fn classify(path: &str, file_type: u8, target_address: u32) -> (DeviceKind, Baudrate) {
    let mut kind = DeviceKind::Unknown;
    let mut baudrate = Baudrate::Unknown;

    const BY_PATH: &[(&str, DeviceKind, Baudrate)] = &[
        ("ttyACM", DeviceKind::ConBee2, Baudrate::B115200),
        ("ConBee_II", DeviceKind::ConBee2, Baudrate::B115200),
        ("cu.usbmodemDE", DeviceKind::ConBee2, Baudrate::B115200),
        ("ttyUSB", DeviceKind::ConBee1, Baudrate::B38400),
        ("usb-FTDI", DeviceKind::ConBee1, Baudrate::B38400),
        ("cu.usbserial", DeviceKind::ConBee1, Baudrate::B38400),
        ("ttyAMA", DeviceKind::RaspBee1, Baudrate::B38400),
        ("ttyAML", DeviceKind::RaspBee1, Baudrate::B38400), // Odroid
        ("ttyS", DeviceKind::RaspBee1, Baudrate::B38400),
        ("/serial", DeviceKind::RaspBee1, Baudrate::B38400),
    ];

    for &(needle, k, b) in BY_PATH {
        if path.contains(needle) {
            kind = k;
            baudrate = b;
            break;
        }
    }

    #[cfg(windows)]
    if kind == DeviceKind::Unknown && path.contains("COM") {
        if file_type == 1 && target_address == 0 {
            kind = DeviceKind::ConBee1;
            baudrate = Baudrate::B38400;
        } else if file_type < 30 && target_address == 0x5000 {
            kind = DeviceKind::ConBee2;
            baudrate = Baudrate::B115200;
        }
    }
    #[cfg(not(windows))]
    let _ = target_address;

    // refine with the firmware header
    if file_type == 60 {
        kind = DeviceKind::Hive;
        baudrate = Baudrate::B115200;
    } else if kind == DeviceKind::ConBee1 && file_type > 9 {
        // wrong firmware family for a ConBee I, don't guess
        kind = DeviceKind::Unknown;
        baudrate = Baudrate::B38400;
    } else if kind == DeviceKind::RaspBee2 && (30..=39).contains(&file_type) {
        baudrate = Baudrate::B38400;
    }

    (kind, baudrate)
}

/// A RaspBee path alone cannot distinguish the I from the II; the
/// firmware version platform byte and the target address can.
pub fn refine_raspbee(kind: DeviceKind, fw_version: u32, target_address: u32) -> DeviceKind {
    if kind == DeviceKind::RaspBee1
        && ((fw_version & FW_VERSION_PLATFORM_MASK) == FW_VERSION_PLATFORM_R21
            || target_address == 0x5000)
    {
        log::debug!("assume RaspBee II");
        return DeviceKind::RaspBee2;
    }
    kind
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_by_path() {
        assert_eq!(
            classify("/dev/ttyACM0", 30, 0x5000),
            (DeviceKind::ConBee2, Baudrate::B115200)
        );
        assert_eq!(
            classify("/dev/ttyUSB0", 5, 0),
            (DeviceKind::ConBee1, Baudrate::B38400)
        );
        assert_eq!(
            classify("/dev/ttyAMA0", 7, 0),
            (DeviceKind::RaspBee1, Baudrate::B38400)
        );
        assert_eq!(
            classify(
                "/dev/serial/by-id/usb-dresden_elektronik_ingenieurtechnik_GmbH_ConBee_II_DE1948474-if00",
                30,
                0x5000
            ),
            (DeviceKind::ConBee2, Baudrate::B115200)
        );
        assert_eq!(
            classify("/dev/nonsense", 7, 0),
            (DeviceKind::Unknown, Baudrate::Unknown)
        );
    }

    #[test]
    fn test_classify_is_pure() {
        for _ in 0..3 {
            assert_eq!(
                classify("/dev/ttyAMA0", 7, 0),
                (DeviceKind::RaspBee1, Baudrate::B38400)
            );
        }
    }

    #[test]
    fn test_hive_overrides_path() {
        assert_eq!(
            classify("/dev/ttyACM0", 60, 0),
            (DeviceKind::Hive, Baudrate::B115200)
        );
    }

    #[test]
    fn test_conbee1_rejects_foreign_firmware() {
        assert_eq!(
            classify("/dev/ttyUSB0", 30, 0x5000),
            (DeviceKind::Unknown, Baudrate::B38400)
        );
    }

    #[test]
    fn test_refine_raspbee() {
        // platform byte 0x07 marks the R21 based RaspBee II
        assert_eq!(
            refine_raspbee(DeviceKind::RaspBee1, 0x26780700, 0),
            DeviceKind::RaspBee2
        );
        assert_eq!(
            refine_raspbee(DeviceKind::RaspBee1, 0, 0x5000),
            DeviceKind::RaspBee2
        );
        assert_eq!(
            refine_raspbee(DeviceKind::RaspBee1, 0x26390500, 0),
            DeviceKind::RaspBee1
        );
        assert_eq!(
            refine_raspbee(DeviceKind::ConBee2, 0x26780700, 0x5000),
            DeviceKind::ConBee2
        );
    }
}

//! Classification of completed response lines.

/// Firmware identity reported by an `M115` reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareInfo {
    /// Firmware name, e.g. `Marlin 1.1.9`.
    pub firmware: String,
    /// Device UUID as reported; empty when the controller omits it.
    pub device_id: String,
}

/// Effects a response line has on the session.
///
/// The two effects are independent, not exclusive: any line containing the
/// `ok` token releases the flow-control gate, and a line starting with the
/// firmware marker additionally carries identification metadata. A line
/// with neither effect is unrecognized — ignored for control purposes and
/// only logged by the caller.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Response {
    pub acknowledged: bool,
    pub firmware: Option<FirmwareInfo>,
}

impl Response {
    pub fn parse(raw: &str) -> Self {
        let line = raw.trim().replace('\r', "");

        Self {
            acknowledged: line.contains("ok"),
            firmware: parse_firmware(&line),
        }
    }

    pub fn is_unrecognized(&self) -> bool {
        !self.acknowledged && self.firmware.is_none()
    }
}

fn parse_firmware(line: &str) -> Option<FirmwareInfo> {
    if !line.starts_with("FIRMWARE_NAME") {
        return None;
    }

    // Name runs up to the SOURCE_CODE_URL delimiter; the UUID key bounds
    // the device identifier.
    let name_part = line.split(" SOURCE_CODE_URL").next().unwrap_or(line);
    let firmware = name_part
        .strip_prefix("FIRMWARE_NAME:")
        .unwrap_or(name_part)
        .to_string();
    let device_id = line.split("UUID:").nth(1).unwrap_or("").to_string();

    Some(FirmwareInfo {
        firmware,
        device_id,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ok_acknowledges() {
        assert!(Response::parse("ok\r").acknowledged);
        assert!(Response::parse("ok T:210.0").acknowledged);
        assert!(!Response::parse("echo:busy processing").acknowledged);
    }

    #[test]
    fn test_firmware_line() {
        let response = Response::parse(
            "FIRMWARE_NAME:Marlin 1.1.9 SOURCE_CODE_URL:https://github.com/MarlinFirmware/Marlin \
             PROTOCOL_VERSION:1.0 MACHINE_TYPE:Prusa i3 MK3 EXTRUDER_COUNT:1 \
             UUID:cede2a2f-41a2-4748-9b12-c55c62f367ff",
        );

        let firmware = response.firmware.expect("firmware parsed");
        assert_eq!(firmware.firmware, "Marlin 1.1.9");
        assert_eq!(firmware.device_id, "cede2a2f-41a2-4748-9b12-c55c62f367ff");
    }

    #[test]
    fn test_firmware_without_uuid() {
        let response = Response::parse("FIRMWARE_NAME:Marlin SOURCE_CODE_URL:x");
        let firmware = response.firmware.expect("firmware parsed");
        assert_eq!(firmware.firmware, "Marlin");
        assert_eq!(firmware.device_id, "");
    }

    #[test]
    fn test_unrecognized_line() {
        let response = Response::parse("T:21.3 /0.0 B:22.1 /0.0");
        assert!(response.is_unrecognized());
    }
}

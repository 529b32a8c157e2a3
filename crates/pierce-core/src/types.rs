//! Shared public types.

use serde::Serialize;

/// Console generation selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConsoleKind {
    /// Fourth generation console
    Ps4,
    /// Fifth generation console
    Ps5,
}

impl ConsoleKind {
    /// The platform tag the server expects in request payloads.
    pub fn platform(self) -> &'static str {
        match self {
            ConsoleKind::Ps4 => "PS4",
            ConsoleKind::Ps5 => "PS5",
        }
    }
}

impl std::fmt::Display for ConsoleKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.platform())
    }
}

/// Which of the two remote-play flows a hole is punched for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortKind {
    /// Control flow
    Ctrl,
    /// Data flow
    Data,
}

impl std::fmt::Display for PortKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PortKind::Ctrl => write!(f, "control"),
            PortKind::Data => write!(f, "data"),
        }
    }
}

/// A remote-play capable device registered to the account.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceInfo {
    /// Opaque 32-byte device identifier
    #[serde(serialize_with = "serialize_uid")]
    pub device_uid: [u8; 32],
    /// Console generation
    pub console_kind: ConsoleKind,
    /// Human-readable device name
    pub name: String,
    /// Whether the device has remote play enabled
    pub remoteplay_enabled: bool,
}

fn serialize_uid<S: serde::Serializer>(uid: &[u8; 32], s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&hex::encode(uid))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn platform_tags() {
        assert_eq!(ConsoleKind::Ps4.platform(), "PS4");
        assert_eq!(ConsoleKind::Ps5.platform(), "PS5");
    }

    #[test]
    fn device_info_serializes_uid_as_hex() {
        let info = DeviceInfo {
            device_uid: [0xab; 32],
            console_kind: ConsoleKind::Ps5,
            name: "Living room".to_string(),
            remoteplay_enabled: true,
        };
        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json["device_uid"], "ab".repeat(32));
        assert_eq!(json["console_kind"], "Ps5");
    }
}

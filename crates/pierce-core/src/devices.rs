//! Device enumeration and client identity.

use crate::config::SessionConfig;
use crate::error::{PunchError, PunchResult};
use crate::types::{ConsoleKind, DeviceInfo};

/// Fixed prefix of client device UIDs.
const DUID_PREFIX: &str = "0000000700410080";

/// Generates a fresh client device UID: the fixed prefix followed by 16
/// random bytes, lowercase hex.
pub fn generate_client_device_uid() -> String {
    let random: [u8; 16] = rand::random();
    format!("{DUID_PREFIX}{}", hex::encode(random))
}

/// Lists the account's registered consoles of the given generation.
///
/// Independent of any session; uses its own connection.
pub async fn list_devices(
    token: &str,
    console_kind: ConsoleKind,
    config: &SessionConfig,
) -> PunchResult<Vec<DeviceInfo>> {
    let url = format!(
        "{}/api/cloudAssistedNavigation/v2/users/me/clients?platform={}&includeFields=device&limit=10&offset=0",
        config.web_api_base,
        console_kind.platform(),
    );

    let http = reqwest::Client::new();
    let response = http
        .get(&url)
        .header("Authorization", format!("Bearer {token}"))
        .header("Accept-Language", "jp")
        .send()
        .await
        .map_err(|e| {
            tracing::error!("list_devices: fetching {url} failed: {e}");
            PunchError::Network(e.to_string())
        })?;

    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    if status >= 400 {
        tracing::error!("list_devices: {url} failed with HTTP {status}");
        tracing::debug!("response body: {body}");
        return Err(PunchError::HttpStatus(status));
    }

    parse_device_list(&body, console_kind)
}

/// Parses the clients response into device infos.
fn parse_device_list(body: &str, console_kind: ConsoleKind) -> PunchResult<Vec<DeviceInfo>> {
    let json: serde_json::Value = serde_json::from_str(body).map_err(|e| {
        PunchError::InvalidSchema(format!("device list unparseable ({e}): {body}"))
    })?;
    let clients = json
        .get("clients")
        .and_then(|v| v.as_array())
        .ok_or_else(|| {
            PunchError::InvalidSchema(format!("device list has no clients array: {body}"))
        })?;

    let mut devices = Vec::with_capacity(clients.len());
    for client in clients {
        let duid = client
            .get("duid")
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                PunchError::InvalidSchema(format!("client has no duid string: {client}"))
            })?;
        let device_uid: [u8; 32] = hex::decode(duid)
            .ok()
            .and_then(|bytes| bytes.try_into().ok())
            .ok_or_else(|| {
                PunchError::InvalidSchema(format!("duid is not 32 hex bytes: '{duid}'"))
            })?;

        let device = client
            .get("device")
            .and_then(|v| v.as_object())
            .ok_or_else(|| {
                PunchError::InvalidSchema(format!("client has no device object: {client}"))
            })?;
        let name = device
            .get("name")
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                PunchError::InvalidSchema(format!("device has no name string: {client}"))
            })?
            .to_string();
        let enabled_features = device
            .get("enabledFeatures")
            .and_then(|v| v.as_array())
            .ok_or_else(|| {
                PunchError::InvalidSchema(format!("device has no enabledFeatures array: {client}"))
            })?;
        let remoteplay_enabled = enabled_features
            .iter()
            .any(|feature| feature.as_str() == Some("remotePlay"));

        devices.push(DeviceInfo {
            device_uid,
            console_kind,
            name,
            remoteplay_enabled,
        });
    }

    Ok(devices)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_uid_shape() {
        let uid = generate_client_device_uid();
        assert_eq!(uid.len(), 48);
        assert!(uid.starts_with(DUID_PREFIX));
        assert!(uid.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        assert_ne!(uid, generate_client_device_uid());
    }

    #[test]
    fn parses_device_list() {
        let body = format!(
            r#"{{"clients":[
                {{"duid":"{}","device":{{"name":"Bedroom PS5","enabledFeatures":["remotePlay","somethingElse"]}}}},
                {{"duid":"{}","device":{{"name":"Dusty PS5","enabledFeatures":[]}}}}
            ]}}"#,
            "ab".repeat(32),
            "cd".repeat(32),
        );
        let devices = parse_device_list(&body, ConsoleKind::Ps5).unwrap();
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[0].name, "Bedroom PS5");
        assert_eq!(devices[0].device_uid, [0xab; 32]);
        assert!(devices[0].remoteplay_enabled);
        assert_eq!(devices[1].name, "Dusty PS5");
        assert!(!devices[1].remoteplay_enabled);
    }

    #[test]
    fn rejects_bad_duid() {
        let body = r#"{"clients":[{"duid":"tooshort","device":{"name":"x","enabledFeatures":[]}}]}"#;
        assert!(matches!(
            parse_device_list(body, ConsoleKind::Ps4),
            Err(PunchError::InvalidSchema(_))
        ));
    }

    #[test]
    fn rejects_missing_clients() {
        assert!(parse_device_list("{}", ConsoleKind::Ps4).is_err());
        assert!(parse_device_list("not json", ConsoleKind::Ps4).is_err());
    }
}

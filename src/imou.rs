// MIT License - Copyright (c) 2026 Peter Wright

use async_trait::async_trait;
use chrono::Utc;
use md5::{Digest, Md5};
use rand::Rng;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::config::BridgeConfig;
use crate::constants::PRIVACY_SWITCH;
use crate::error::{BridgeError, Result};

/// An access token and when it stops being usable.
///
/// Owned by the dispatcher; the expiry carries a safety margin so a token
/// is refreshed slightly before the cloud would reject it.
#[derive(Debug, Clone)]
pub struct Credential {
    pub access_token: String,
    pub expires_at: Instant,
}

impl Credential {
    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

/// One camera registered under the account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CameraDevice {
    pub device_id: String,
    pub channel_id: String,
    pub name: String,
    /// Whether the cloud reports the device reachable right now.
    pub online: bool,
    /// Whether the device advertises the privacy switch at all.
    pub supports_privacy: bool,
}

/// The slice of the camera cloud the dispatcher needs.
///
/// Errors must arrive pre-classified: `Credential` for auth failures,
/// `TransientDispatch` for network/5xx/rate-limit conditions, and
/// `PermanentDispatch` for everything the retry loop must not touch.
#[async_trait]
pub trait CameraCloud: Send + Sync {
    async fn fetch_token(&self) -> Result<Credential>;
    async fn list_devices(&self, token: &str) -> Result<Vec<CameraDevice>>;
    async fn set_privacy(&self, token: &str, device: &CameraDevice, enabled: bool) -> Result<()>;
    async fn privacy_state(&self, token: &str, device: &CameraDevice) -> Result<bool>;
}

#[derive(Debug, Deserialize)]
struct ApiEnvelope {
    result: ApiResult,
}

#[derive(Debug, Deserialize)]
struct ApiResult {
    code: String,
    #[serde(default)]
    msg: Option<String>,
    #[serde(default)]
    data: Value,
}

/// Imou OpenAPI client.
///
/// Every call is a POST of `{system, id, params}` where `system` carries
/// an MD5 signature over time, nonce and the application secret. The
/// secret itself never leaves the process and never appears in logs.
pub struct ImouClient {
    http: reqwest::Client,
    app_id: String,
    app_secret: String,
    base_url: String,
}

impl ImouClient {
    pub fn new(config: &BridgeConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.api_timeout)
            .build()
            .map_err(|e| BridgeError::config(format!("cannot build HTTP client: {e}")))?;
        Ok(Self {
            http,
            app_id: config.app_id.clone(),
            app_secret: config.app_secret.clone(),
            base_url: config.api_base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn call(&self, method: &str, params: Value) -> Result<Value> {
        let time = Utc::now().timestamp();
        let nonce = format!("{:016x}", rand::rng().random::<u64>());
        let sign = md5_hex(&signature_input(time, &nonce, &self.app_secret));

        let body = json!({
            "system": {
                "ver": "1.0",
                "appId": self.app_id,
                "sign": sign,
                "time": time,
                "nonce": nonce,
            },
            "id": nonce,
            "params": params,
        });

        debug!(method, "calling camera cloud");
        let response = self
            .http
            .post(format!("{}/{}", self.base_url, method))
            .json(&body)
            .send()
            .await
            .map_err(|e| BridgeError::TransientDispatch {
                details: format!("{method}: {e}"),
            })?;

        let status = response.status();
        if status.as_u16() == 401 || status.as_u16() == 403 {
            return Err(BridgeError::Credential {
                details: format!("{method}: HTTP {status}"),
            });
        }
        if status.is_server_error() || status.as_u16() == 429 {
            return Err(BridgeError::TransientDispatch {
                details: format!("{method}: HTTP {status}"),
            });
        }
        if !status.is_success() {
            return Err(BridgeError::PermanentDispatch {
                details: format!("{method}: HTTP {status}"),
            });
        }

        let envelope: ApiEnvelope =
            response
                .json()
                .await
                .map_err(|e| BridgeError::PermanentDispatch {
                    details: format!("{method}: malformed response: {e}"),
                })?;

        classify_result(method, envelope.result)
    }
}

/// Turn an API result into data or a classified error. Token-family
/// result codes (`TK...`) become credential errors so the dispatcher can
/// refresh and retry.
fn classify_result(method: &str, result: ApiResult) -> Result<Value> {
    if result.code == "0" {
        return Ok(result.data);
    }
    let details = format!(
        "{method}: {} ({})",
        result.code,
        result.msg.as_deref().unwrap_or("no message")
    );
    if result.code.starts_with("TK") {
        Err(BridgeError::Credential { details })
    } else {
        Err(BridgeError::PermanentDispatch { details })
    }
}

fn signature_input(time: i64, nonce: &str, app_secret: &str) -> String {
    format!("time:{time},nonce:{nonce},appSecret:{app_secret}")
}

fn md5_hex(input: &str) -> String {
    let mut hasher = Md5::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
}

fn value_str(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn parse_credential(data: &Value) -> Result<Credential> {
    let token = data
        .get("accessToken")
        .and_then(Value::as_str)
        .ok_or_else(|| BridgeError::Credential {
            details: "token response missing accessToken".into(),
        })?;
    let expires_secs = data
        .get("expireTime")
        .and_then(Value::as_u64)
        .unwrap_or(3600);
    // Refresh a minute early rather than race the cloud's clock
    let margin = expires_secs.min(60);
    Ok(Credential {
        access_token: token.to_string(),
        expires_at: Instant::now() + Duration::from_secs(expires_secs - margin),
    })
}

fn parse_device_list(data: &Value) -> Vec<CameraDevice> {
    let Some(entries) = data.get("deviceList").and_then(Value::as_array) else {
        return Vec::new();
    };

    entries
        .iter()
        .filter_map(|entry| {
            let device_id = entry.get("deviceId").and_then(Value::as_str)?;
            let channel = entry
                .get("channels")
                .and_then(Value::as_array)
                .and_then(|c| c.first());
            let channel_id = channel
                .and_then(|c| c.get("channelId"))
                .map(value_str)
                .unwrap_or_else(|| "0".to_string());
            let name = channel
                .and_then(|c| c.get("channelName"))
                .and_then(Value::as_str)
                .unwrap_or("<unknown>")
                .to_string();
            // When the ability list is absent, assume the switch exists and
            // let the set call report otherwise.
            let supports_privacy = entry
                .get("ability")
                .and_then(Value::as_str)
                .map(|a| a.split(',').any(|cap| cap.eq_ignore_ascii_case(PRIVACY_SWITCH)))
                .unwrap_or(true);
            Some(CameraDevice {
                device_id: device_id.to_string(),
                channel_id,
                name,
                online: true,
                supports_privacy,
            })
        })
        .collect()
}

#[async_trait]
impl CameraCloud for ImouClient {
    async fn fetch_token(&self) -> Result<Credential> {
        let data = self.call("accessToken", json!({})).await?;
        parse_credential(&data)
    }

    async fn list_devices(&self, token: &str) -> Result<Vec<CameraDevice>> {
        let data = self
            .call(
                "deviceBaseList",
                json!({
                    "token": token,
                    "bindId": -1,
                    "limit": 50,
                    "type": "bindAndShare",
                    "needApInfo": false,
                }),
            )
            .await?;

        let mut devices = parse_device_list(&data);

        // The device list does not carry reachability; ask per device so
        // offline cameras can be skipped instead of failing the action.
        for device in &mut devices {
            match self
                .call(
                    "deviceOnline",
                    json!({"token": token, "deviceId": device.device_id}),
                )
                .await
            {
                Ok(online_data) => {
                    device.online = online_data
                        .get("onLine")
                        .map(|v| value_str(v) == "1")
                        .unwrap_or(true);
                }
                Err(e) => {
                    warn!(device = %device.device_id, error = %e, "online check failed, assuming reachable");
                }
            }
        }

        Ok(devices)
    }

    async fn set_privacy(&self, token: &str, device: &CameraDevice, enabled: bool) -> Result<()> {
        self.call(
            "setDeviceCameraStatus",
            json!({
                "token": token,
                "deviceId": device.device_id,
                "channelId": device.channel_id,
                "enableType": PRIVACY_SWITCH,
                "enable": enabled,
            }),
        )
        .await?;
        Ok(())
    }

    async fn privacy_state(&self, token: &str, device: &CameraDevice) -> Result<bool> {
        let data = self
            .call(
                "getDeviceCameraStatus",
                json!({
                    "token": token,
                    "deviceId": device.device_id,
                    "channelId": device.channel_id,
                    "enableType": PRIVACY_SWITCH,
                }),
            )
            .await?;
        Ok(data.get("status").map(|v| value_str(v) == "on").unwrap_or(false))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_md5_known_vectors() {
        assert_eq!(md5_hex(""), "d41d8cd98f00b204e9800998ecf8427e");
        assert_eq!(md5_hex("abc"), "900150983cd24fb0d6963f7d28e17f72");
    }

    #[test]
    fn test_signature_input_shape() {
        assert_eq!(
            signature_input(1738900000, "abcd", "s3cret"),
            "time:1738900000,nonce:abcd,appSecret:s3cret"
        );
    }

    #[test]
    fn test_parse_credential() {
        let data = json!({"accessToken": "At_1234", "expireTime": 86400});
        let credential = parse_credential(&data).unwrap();
        assert_eq!(credential.access_token, "At_1234");
        assert!(!credential.is_expired());
    }

    #[test]
    fn test_parse_credential_missing_token() {
        assert!(matches!(
            parse_credential(&json!({"expireTime": 60})),
            Err(BridgeError::Credential { .. })
        ));
    }

    #[test]
    fn test_parse_device_list() {
        let data = json!({
            "deviceList": [
                {
                    "deviceId": "ABC123",
                    "ability": "WLAN,CloseCamera,AudioTalk",
                    "channels": [{"channelId": "0", "channelName": "Front Door"}],
                },
                {
                    "deviceId": "DEF456",
                    "ability": "WLAN,AudioTalk",
                    "channels": [],
                },
            ]
        });
        let devices = parse_device_list(&data);
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[0].device_id, "ABC123");
        assert_eq!(devices[0].name, "Front Door");
        assert!(devices[0].supports_privacy);
        assert_eq!(devices[1].channel_id, "0");
        assert!(!devices[1].supports_privacy);
    }

    #[test]
    fn test_parse_device_list_empty() {
        assert!(parse_device_list(&json!({})).is_empty());
        assert!(parse_device_list(&json!({"deviceList": []})).is_empty());
    }

    #[test]
    fn test_classify_result() {
        assert!(classify_result("m", ApiResult { code: "0".into(), msg: None, data: json!(1) }).is_ok());
        assert!(matches!(
            classify_result("m", ApiResult { code: "TK1002".into(), msg: Some("token expired".into()), data: Value::Null }),
            Err(BridgeError::Credential { .. })
        ));
        assert!(matches!(
            classify_result("m", ApiResult { code: "OP1009".into(), msg: None, data: Value::Null }),
            Err(BridgeError::PermanentDispatch { .. })
        ));
    }
}

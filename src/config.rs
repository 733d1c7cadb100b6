// MIT License - Copyright (c) 2026 Peter Wright

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use crate::constants::{DEFAULT_PORT, IMOU_API_BASE, MAX_PORT};
use crate::crypto::SiaCrypt;
use crate::error::{BridgeError, Result};

/// Runtime configuration for the bridge.
///
/// The environment is the only configuration surface:
///
/// | Variable | Default | Meaning |
/// |---|---|---|
/// | `BIND_IP` | `0.0.0.0` | Address the receiver binds |
/// | `BIND_PORT` | `12128` | Port the receiver binds (1-49151) |
/// | `SIA_ACCOUNT` | `000` | Account identifier (3-16 hex chars) |
/// | `SIA_ENCRYPTION_KEY` | unset | AES key, 16 or 32 hex chars |
/// | `IMOU_APP_ID` | required | Imou cloud application id |
/// | `IMOU_APP_SECRET` | required | Imou cloud application secret |
/// | `LOG_LEVEL` | `info` | Default tracing filter |
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub bind_ip: IpAddr,
    pub bind_port: u16,
    /// Account identifier expected on every inbound frame.
    pub account: String,
    /// Optional AES key for encrypted frames (16 or 32 hex characters).
    pub encryption_key: Option<String>,
    pub app_id: String,
    pub app_secret: String,
    pub log_level: String,
    /// Read/write timeout applied to every protocol socket operation.
    pub socket_timeout: Duration,
    /// How long in-flight dispatches may finish during shutdown.
    pub drain_grace: Duration,
    /// Imou OpenAPI base URL (overridable for tests).
    pub api_base_url: String,
    /// Timeout for each outbound HTTPS call.
    pub api_timeout: Duration,
    /// Capacity of the connection→router event queue.
    pub event_queue: usize,
    /// Capacity of the router→dispatcher action queue.
    pub action_queue: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            bind_port: DEFAULT_PORT,
            account: "000".to_string(),
            encryption_key: None,
            app_id: String::new(),
            app_secret: String::new(),
            log_level: "info".to_string(),
            socket_timeout: Duration::from_secs(10),
            drain_grace: Duration::from_secs(10),
            api_base_url: IMOU_API_BASE.to_string(),
            api_timeout: Duration::from_secs(15),
            event_queue: 64,
            action_queue: 64,
        }
    }
}

impl BridgeConfig {
    /// Build the configuration from process environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the configuration from an arbitrary variable source.
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(ip) = get("BIND_IP") {
            config.bind_ip = ip
                .parse()
                .map_err(|_| BridgeError::config(format!("invalid BIND_IP {ip:?}")))?;
        }
        if let Some(port) = get("BIND_PORT") {
            config.bind_port = port
                .parse()
                .map_err(|_| BridgeError::config(format!("invalid BIND_PORT {port:?}")))?;
        }
        if let Some(account) = get("SIA_ACCOUNT") {
            config.account = account;
        }
        config.encryption_key = get("SIA_ENCRYPTION_KEY").filter(|k| !k.is_empty());
        config.app_id = get("IMOU_APP_ID").unwrap_or_default();
        config.app_secret = get("IMOU_APP_SECRET").unwrap_or_default();
        if let Some(level) = get("LOG_LEVEL") {
            config.log_level = level.to_lowercase();
        }

        config.validate()?;
        Ok(config)
    }

    /// Check invariants the rest of the bridge relies on. Fatal at startup.
    pub fn validate(&self) -> Result<()> {
        if self.bind_port == 0 || self.bind_port > MAX_PORT {
            return Err(BridgeError::config(format!(
                "BIND_PORT must be 1-{MAX_PORT}, got {}",
                self.bind_port
            )));
        }
        if !(3..=16).contains(&self.account.len())
            || !self.account.bytes().all(|b| b.is_ascii_hexdigit())
        {
            return Err(BridgeError::config(
                "SIA_ACCOUNT must be 3-16 hex characters",
            ));
        }
        // Key shape is enforced by the crypto engine
        SiaCrypt::new(self.encryption_key.as_deref())?;
        if self.app_id.is_empty() || self.app_secret.is_empty() {
            return Err(BridgeError::config(
                "IMOU_APP_ID and IMOU_APP_SECRET are required",
            ));
        }
        Ok(())
    }

    /// The socket address the receiver binds.
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_ip, self.bind_port)
    }

    /// Create a new config builder starting from defaults.
    pub fn builder() -> BridgeConfigBuilder {
        BridgeConfigBuilder::default()
    }
}

/// Builder for [`BridgeConfig`].
#[derive(Debug, Clone, Default)]
pub struct BridgeConfigBuilder {
    config: BridgeConfig,
}

impl BridgeConfigBuilder {
    pub fn bind_ip(mut self, ip: IpAddr) -> Self {
        self.config.bind_ip = ip;
        self
    }

    pub fn bind_port(mut self, port: u16) -> Self {
        self.config.bind_port = port;
        self
    }

    pub fn account(mut self, account: impl Into<String>) -> Self {
        self.config.account = account.into();
        self
    }

    pub fn encryption_key(mut self, key: impl Into<String>) -> Self {
        self.config.encryption_key = Some(key.into());
        self
    }

    pub fn app_id(mut self, app_id: impl Into<String>) -> Self {
        self.config.app_id = app_id.into();
        self
    }

    pub fn app_secret(mut self, app_secret: impl Into<String>) -> Self {
        self.config.app_secret = app_secret.into();
        self
    }

    pub fn socket_timeout(mut self, timeout: Duration) -> Self {
        self.config.socket_timeout = timeout;
        self
    }

    pub fn drain_grace(mut self, grace: Duration) -> Self {
        self.config.drain_grace = grace;
        self
    }

    pub fn api_base_url(mut self, url: impl Into<String>) -> Self {
        self.config.api_base_url = url.into();
        self
    }

    pub fn api_timeout(mut self, timeout: Duration) -> Self {
        self.config.api_timeout = timeout;
        self
    }

    pub fn build(self) -> BridgeConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn from_map(map: &HashMap<String, String>) -> Result<BridgeConfig> {
        BridgeConfig::from_lookup(|k| map.get(k).cloned())
    }

    #[test]
    fn test_minimal_env() {
        let config = from_map(&env(&[
            ("IMOU_APP_ID", "app"),
            ("IMOU_APP_SECRET", "secret"),
        ]))
        .unwrap();
        assert_eq!(config.bind_port, 12128);
        assert_eq!(config.account, "000");
        assert_eq!(config.encryption_key, None);
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn test_full_env() {
        let config = from_map(&env(&[
            ("BIND_IP", "127.0.0.1"),
            ("BIND_PORT", "9999"),
            ("SIA_ACCOUNT", "1ABC"),
            ("SIA_ENCRYPTION_KEY", "0123456789ABCDEF"),
            ("IMOU_APP_ID", "app"),
            ("IMOU_APP_SECRET", "secret"),
            ("LOG_LEVEL", "DEBUG"),
        ]))
        .unwrap();
        assert_eq!(config.bind_ip.to_string(), "127.0.0.1");
        assert_eq!(config.bind_port, 9999);
        assert_eq!(config.account, "1ABC");
        assert_eq!(config.encryption_key.as_deref(), Some("0123456789ABCDEF"));
        assert_eq!(config.log_level, "debug");
    }

    #[test]
    fn test_missing_cloud_credentials() {
        assert!(matches!(
            from_map(&env(&[])),
            Err(BridgeError::Config { .. })
        ));
        assert!(matches!(
            from_map(&env(&[("IMOU_APP_ID", "app")])),
            Err(BridgeError::Config { .. })
        ));
    }

    #[test]
    fn test_invalid_port() {
        for port in ["0", "49152", "65536", "nope"] {
            let result = from_map(&env(&[
                ("BIND_PORT", port),
                ("IMOU_APP_ID", "app"),
                ("IMOU_APP_SECRET", "secret"),
            ]));
            assert!(
                matches!(result, Err(BridgeError::Config { .. })),
                "port {port:?} should be refused"
            );
        }
    }

    #[test]
    fn test_invalid_account() {
        for account in ["ab", "xyz", "0123456789ABCDEF0"] {
            let result = from_map(&env(&[
                ("SIA_ACCOUNT", account),
                ("IMOU_APP_ID", "app"),
                ("IMOU_APP_SECRET", "secret"),
            ]));
            assert!(
                matches!(result, Err(BridgeError::Config { .. })),
                "account {account:?} should be refused"
            );
        }
    }

    #[test]
    fn test_invalid_key() {
        let result = from_map(&env(&[
            ("SIA_ENCRYPTION_KEY", "tooshort"),
            ("IMOU_APP_ID", "app"),
            ("IMOU_APP_SECRET", "secret"),
        ]));
        assert!(matches!(result, Err(BridgeError::Config { .. })));
    }

    #[test]
    fn test_builder() {
        let config = BridgeConfig::builder()
            .account("00AB")
            .bind_port(15000)
            .app_id("app")
            .app_secret("secret")
            .socket_timeout(Duration::from_secs(2))
            .build();
        assert_eq!(config.account, "00AB");
        assert_eq!(config.bind_port, 15000);
        assert!(config.validate().is_ok());
    }
}

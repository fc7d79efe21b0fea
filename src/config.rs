use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::connection::ConnectionConfig;

/// Top-level gateway config, loaded from TOML.
///
/// Every section is optional; a missing file or section means defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Listen address. `None` leaves the choice to the CLI default.
    pub bind: Option<SocketAddr>,
    pub auth: AuthConfig,
    pub websocket: ConnectionConfig,
    pub hub: HubConfig,
    pub tls: Option<TlsConfig>,
    pub pty: PtyConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// HMAC secret for signing and verifying tokens.
    pub secret: Option<String>,
    pub token_validity_hours: i64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            secret: None,
            token_validity_hours: 24,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    /// Upper bound on how long shutdown waits for the hub loop to exit.
    pub shutdown_timeout_ms: u64,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            shutdown_timeout_ms: 5_000,
        }
    }
}

/// PEM certificate chain and private key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsConfig {
    pub cert: PathBuf,
    pub key: PathBuf,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PtyConfig {
    /// Shell for new PTYs. Falls back to `$SHELL`.
    pub shell: Option<String>,
}

/// Errors that can occur when loading config.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config {}: {source}", .path.display())]
    ReadFailed {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config {}: {source}", .path.display())]
    ParseFailed {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("invalid config: {0}")]
    Invalid(String),
}

impl GatewayConfig {
    /// `<config_dir>/ptygate/config.toml`, if the platform has a config dir.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("ptygate").join("config.toml"))
    }

    /// Load config from a TOML file path. Returns None if file doesn't exist.
    ///
    /// The result is validated; a file carrying a secret is checked for
    /// world-readable permissions.
    pub fn load(path: &Path) -> Result<Option<Self>, ConfigError> {
        if !path.exists() {
            return Ok(None);
        }

        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadFailed {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = toml::from_str(&contents).map_err(|source| ConfigError::ParseFailed {
            path: path.to_path_buf(),
            source,
        })?;

        if config.auth.secret.is_some() {
            check_config_permissions(path);
        }
        config.validate()?;
        Ok(Some(config))
    }

    /// Like [`GatewayConfig::load`], but a missing file yields defaults.
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        Ok(Self::load(path)?.unwrap_or_default())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let ws = &self.websocket;
        if ws.write_wait_ms == 0 || ws.pong_wait_ms == 0 || ws.ping_period_ms == 0 {
            return Err(ConfigError::Invalid(
                "websocket timings must be greater than zero".into(),
            ));
        }
        if ws.ping_period_ms >= ws.pong_wait_ms {
            return Err(ConfigError::Invalid(format!(
                "ping_period_ms ({}) must be less than pong_wait_ms ({})",
                ws.ping_period_ms, ws.pong_wait_ms
            )));
        }
        if ws.max_message_size == 0 {
            return Err(ConfigError::Invalid("max_message_size must be greater than zero".into()));
        }
        if ws.outbound_capacity == 0 {
            return Err(ConfigError::Invalid("outbound_capacity must be greater than zero".into()));
        }
        if self.auth.token_validity_hours <= 0 {
            return Err(ConfigError::Invalid(format!(
                "token_validity_hours must be positive, got {}",
                self.auth.token_validity_hours
            )));
        }
        Ok(())
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.hub.shutdown_timeout_ms)
    }
}

/// Warn if a config file that holds a secret is world-readable.
#[cfg(unix)]
pub fn check_config_permissions(path: &Path) {
    use std::os::unix::fs::PermissionsExt;

    let Ok(metadata) = std::fs::metadata(path) else {
        return;
    };

    let mode = metadata.permissions().mode();
    if is_world_readable(mode) {
        tracing::warn!(
            "config file {} is world-readable (mode {:o}) and contains a token secret; \
             consider restricting permissions to 600",
            path.display(),
            mode & 0o7777,
        );
    }
}

#[cfg(not(unix))]
pub fn check_config_permissions(_path: &Path) {}

#[cfg(unix)]
pub fn is_world_readable(mode: u32) -> bool {
    mode & 0o004 != 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_empty_config() {
        let config: GatewayConfig = toml::from_str("").unwrap();
        assert!(config.bind.is_none());
        assert!(config.auth.secret.is_none());
        assert_eq!(config.auth.token_validity_hours, 24);
        assert_eq!(config.websocket, ConnectionConfig::default());
        assert_eq!(config.shutdown_timeout(), Duration::from_secs(5));
        assert!(config.tls.is_none());
        config.validate().unwrap();
    }

    #[test]
    fn parse_full_config() {
        let toml = r#"
            bind = "0.0.0.0:9443"

            [auth]
            secret = "hunter2"
            token_validity_hours = 8

            [websocket]
            write_wait_ms = 2000
            pong_wait_ms = 30000
            ping_period_ms = 25000
            max_message_size = 65536

            [hub]
            shutdown_timeout_ms = 1500

            [tls]
            cert = "/etc/ptygate/cert.pem"
            key = "/etc/ptygate/key.pem"

            [pty]
            shell = "/bin/bash"
        "#;
        let config: GatewayConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.bind, Some("0.0.0.0:9443".parse().unwrap()));
        assert_eq!(config.auth.secret.as_deref(), Some("hunter2"));
        assert_eq!(config.auth.token_validity_hours, 8);
        assert_eq!(config.websocket.write_wait_ms, 2000);
        assert_eq!(config.websocket.max_message_size, 65536);
        // Unset keys inside a present section keep their defaults.
        assert_eq!(config.websocket.outbound_capacity, 256);
        assert_eq!(config.hub.shutdown_timeout_ms, 1500);
        assert_eq!(
            config.tls.as_ref().unwrap().cert,
            PathBuf::from("/etc/ptygate/cert.pem")
        );
        assert_eq!(config.pty.shell.as_deref(), Some("/bin/bash"));
        config.validate().unwrap();
    }

    #[test]
    fn ping_period_must_be_shorter_than_pong_wait() {
        let mut config = GatewayConfig::default();
        config.websocket.ping_period_ms = config.websocket.pong_wait_ms;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn zero_capacity_is_invalid() {
        let mut config = GatewayConfig::default();
        config.websocket.outbound_capacity = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn non_positive_validity_is_invalid() {
        let mut config = GatewayConfig::default();
        config.auth.token_validity_hours = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn load_missing_file_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nope.toml");
        assert!(GatewayConfig::load(&path).unwrap().is_none());
        let config = GatewayConfig::load_or_default(&path).unwrap();
        assert!(config.auth.secret.is_none());
    }

    #[test]
    fn load_rejects_bad_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "bind = [").unwrap();
        assert!(matches!(
            GatewayConfig::load(&path),
            Err(ConfigError::ParseFailed { .. })
        ));
    }

    #[test]
    fn load_rejects_invalid_timings() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[websocket]\nping_period_ms = 70000\n").unwrap();
        assert!(matches!(
            GatewayConfig::load(&path),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn load_valid_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[auth]\nsecret = \"s3cret\"\n").unwrap();
        let config = GatewayConfig::load(&path).unwrap().unwrap();
        assert_eq!(config.auth.secret.as_deref(), Some("s3cret"));
    }

    #[test]
    fn default_path_ends_with_crate_dir() {
        if let Some(path) = GatewayConfig::default_path() {
            assert!(path.ends_with("ptygate/config.toml"));
        }
    }

    #[cfg(unix)]
    #[test]
    fn world_readable_bit() {
        assert!(is_world_readable(0o644));
        assert!(is_world_readable(0o604));
        assert!(!is_world_readable(0o600));
        assert!(!is_world_readable(0o640));
    }
}

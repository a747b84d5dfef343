//! Client profile
//!
//! A small TOML file pointing at an OpenVPN `.ovpn` profile, carrying the
//! credentials and the local overrides the `.ovpn` format has no room for.

use crate::error::{Result, VpnError};
use crate::options::{ConfigurationParser, ParsingResult};
use crate::protocol::seconds;
use crate::proxy::Credentials;
use log::debug;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Location of the OpenVPN profile
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileConfig {
    /// Path to the `.ovpn` file, relative to the TOML file when loaded from disk
    pub ovpn_path: String,
}

/// Credentials sent during key method 2 authentication
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthConfig {
    pub username: Option<String>,
    pub password: Option<String>,
}

/// Overrides applied on top of the `.ovpn` options
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Keep-alive interval in seconds (0 disables)
    pub keepalive_interval: Option<u64>,
    /// Seconds of inbound silence before reconnecting
    pub keepalive_timeout: Option<u64>,
    /// Renegotiation interval in seconds (0 disables)
    pub renegotiate_after: Option<u64>,
    /// Largest control fragment put on the link
    #[serde(default = "default_mtu")]
    pub mtu: usize,
    /// TCP connect timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            keepalive_interval: None,
            keepalive_timeout: None,
            renegotiate_after: None,
            mtu: default_mtu(),
            connect_timeout: default_connect_timeout(),
        }
    }
}

/// Retry policy of the client
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionLimitsConfig {
    /// Consecutive reconnects before giving up
    #[serde(default = "default_max_retries")]
    pub max_retry_attempts: u32,
    /// Delay between reconnects in seconds
    #[serde(default = "default_retry_delay")]
    pub retry_delay: u32,
}

impl Default for ConnectionLimitsConfig {
    fn default() -> Self {
        Self {
            max_retry_attempts: default_max_retries(),
            retry_delay: default_retry_delay(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientProfile {
    pub profile: ProfileConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub connection_limits: ConnectionLimitsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Directory of the TOML file, used to resolve `ovpn_path`
    #[serde(skip)]
    base_dir: Option<PathBuf>,
}

impl ClientProfile {
    /// Profile for an `.ovpn` file with default settings
    pub fn new(ovpn_path: impl Into<String>) -> Self {
        Self {
            profile: ProfileConfig {
                ovpn_path: ovpn_path.into(),
            },
            auth: AuthConfig::default(),
            session: SessionConfig::default(),
            connection_limits: ConnectionLimitsConfig::default(),
            logging: LoggingConfig::default(),
            base_dir: None,
        }
    }

    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .map_err(|e| VpnError::Config(format!("Failed to read config file: {e}")))?;

        let mut profile = <Self as FromStr>::from_str(&contents)?;
        profile.base_dir = path.parent().map(Path::to_path_buf);
        Ok(profile)
    }

    /// Convert configuration to TOML string
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| VpnError::Config(format!("Failed to serialize config: {e}")))
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.profile.ovpn_path.trim().is_empty() {
            return Err(VpnError::Config("ovpn_path cannot be empty".to_string()));
        }

        match (&self.auth.username, &self.auth.password) {
            (Some(username), Some(_)) if username.is_empty() => {
                return Err(VpnError::Config("Username cannot be empty".to_string()));
            }
            (Some(_), None) | (None, Some(_)) => {
                return Err(VpnError::Config(
                    "Username and password must be given together".to_string(),
                ));
            }
            _ => {}
        }

        if self.session.mtu < 100 || self.session.mtu > 9000 {
            return Err(VpnError::Config(
                "MTU must be between 100 and 9000".to_string(),
            ));
        }
        if self.session.connect_timeout == 0 {
            return Err(VpnError::Config(
                "Connect timeout cannot be zero".to_string(),
            ));
        }

        if !matches!(
            self.logging.level.to_ascii_lowercase().as_str(),
            "off" | "error" | "warn" | "info" | "debug" | "trace"
        ) {
            return Err(VpnError::Config(format!(
                "Unknown log level: {}",
                self.logging.level
            )));
        }

        Ok(())
    }

    /// Path of the `.ovpn` file
    pub fn ovpn_path(&self) -> PathBuf {
        let path = PathBuf::from(&self.profile.ovpn_path);
        match &self.base_dir {
            Some(base) if path.is_relative() => base.join(path),
            _ => path,
        }
    }

    pub fn credentials(&self) -> Option<Credentials> {
        match (&self.auth.username, &self.auth.password) {
            (Some(username), Some(password)) => Some(Credentials::new(username, password)),
            _ => None,
        }
    }

    /// Parse the `.ovpn` file and apply the `[session]` overrides
    pub fn load_session(&self) -> Result<ParsingResult> {
        let path = self.ovpn_path();
        debug!("Loading OpenVPN profile {}", path.display());
        let mut result = ConfigurationParser::parse_file(&path, false)?;
        self.apply_overrides(&mut result);
        Ok(result)
    }

    fn apply_overrides(&self, result: &mut ParsingResult) {
        let configuration = &mut result.configuration;
        if let Some(interval) = self.session.keepalive_interval {
            configuration.keep_alive_interval = seconds(interval);
        }
        if let Some(timeout) = self.session.keepalive_timeout {
            configuration.keep_alive_timeout = seconds(timeout);
        }
        if let Some(after) = self.session.renegotiate_after {
            configuration.renegotiates_after = seconds(after);
        }
    }
}

impl FromStr for ClientProfile {
    type Err = VpnError;

    fn from_str(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }
}

// Default value functions for serde
fn default_mtu() -> usize {
    1000
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay() -> u32 {
    5
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::time::Duration;

    const TOML: &str = r#"
[profile]
ovpn_path = "client.ovpn"

[auth]
username = "testuser"
password = "testpass"

[session]
keepalive_interval = 15
renegotiate_after = 0

[connection_limits]
max_retry_attempts = 5

[logging]
level = "debug"
"#;

    const OVPN: &str = "client\nremote vpn.example.com 1194\nping 10\nreneg-sec 3600\n<ca>\nCA\n</ca>\n";

    #[test]
    fn test_config_parsing() {
        let profile = TOML.parse::<ClientProfile>().expect("Failed to parse config");
        assert_eq!(profile.profile.ovpn_path, "client.ovpn");
        assert_eq!(profile.auth.username.as_deref(), Some("testuser"));
        assert_eq!(profile.session.keepalive_interval, Some(15));
        assert_eq!(profile.session.mtu, 1000);
        assert_eq!(profile.connection_limits.max_retry_attempts, 5);
        assert_eq!(profile.connection_limits.retry_delay, 5);
        assert_eq!(profile.logging.level, "debug");
        assert!(profile.validate().is_ok());

        let credentials = profile.credentials().unwrap();
        assert_eq!(credentials.username, "testuser");
        assert_eq!(credentials.password, "testpass");
    }

    #[test]
    fn test_minimal_profile_and_round_trip() {
        let profile = "[profile]\novpn_path = \"/etc/vpn.ovpn\"\n"
            .parse::<ClientProfile>()
            .unwrap();
        assert!(profile.credentials().is_none());
        assert_eq!(profile.ovpn_path(), PathBuf::from("/etc/vpn.ovpn"));

        let reparsed = profile.to_toml().unwrap().parse::<ClientProfile>().unwrap();
        assert_eq!(reparsed.profile.ovpn_path, "/etc/vpn.ovpn");
        assert_eq!(reparsed.session.connect_timeout, 10);
    }

    #[test]
    fn test_config_validation() {
        let mut profile = ClientProfile::new("client.ovpn");
        assert!(profile.validate().is_ok());

        profile.auth.username = Some("user".into());
        assert!(profile.validate().is_err());
        profile.auth.password = Some("pass".into());
        assert!(profile.validate().is_ok());

        profile.session.mtu = 50;
        assert!(profile.validate().is_err());
        profile.session.mtu = 1400;

        profile.logging.level = "loud".into();
        assert!(profile.validate().is_err());
        profile.logging.level = "warn".into();

        profile.profile.ovpn_path = " ".into();
        assert!(profile.validate().is_err());

        assert!(matches!(
            "[auth]\nusername = \"x\"".parse::<ClientProfile>(),
            Err(VpnError::Config(_))
        ));
    }

    #[test]
    fn test_load_session_with_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let mut ovpn = fs::File::create(dir.path().join("client.ovpn")).unwrap();
        ovpn.write_all(OVPN.as_bytes()).unwrap();
        let toml_path = dir.path().join("profile.toml");
        fs::write(&toml_path, TOML).unwrap();

        let profile = ClientProfile::from_file(&toml_path).unwrap();
        assert_eq!(profile.ovpn_path(), dir.path().join("client.ovpn"));

        let result = profile.load_session().unwrap();
        assert_eq!(result.hostname, "vpn.example.com");
        assert_eq!(
            result.configuration.keep_alive_interval,
            Some(Duration::from_secs(15))
        );
        assert_eq!(result.configuration.renegotiates_after, None);

        assert!(ClientProfile::new("/nonexistent.ovpn").load_session().is_err());
    }
}

// Local configuration for statesync clients.
//
// Global config: `~/.statesync/config.toml`

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::channel::{ReconnectPolicy, TransportKind};
use crate::poller::DEFAULT_POLL_INTERVAL;

/// Root directory for statesync global state: `~/.statesync/`.
pub fn global_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|h| h.join(".statesync"))
}

/// Path to the global config file: `~/.statesync/config.toml`.
pub fn global_config_path() -> Option<PathBuf> {
    global_dir().map(|d| d.join("config.toml"))
}

// ── Client config ──────────────────────────────────────────────────

/// Client configuration at `~/.statesync/config.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ClientConfig {
    /// Application server base URL (e.g. `https://app.example.com`).
    pub server_url: Option<String>,
    /// Push-channel transport.
    pub transport: TransportKind,
    /// Session cookie sent with the push channel and metadata requests.
    pub cookie: Option<String>,
    pub reconnect: ReconnectConfig,
    pub poller: PollerConfig,
}

impl ClientConfig {
    /// Load from `~/.statesync/config.toml`. Returns defaults if the file
    /// doesn't exist or can't be parsed.
    pub fn load() -> Self {
        global_config_path().and_then(|p| Self::load_from(&p).ok()).unwrap_or_default()
    }

    /// Load from a specific path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&contents)?)
    }

    /// Save to a specific path (creates parent directories). The file may hold
    /// a session cookie, so it is restricted to the owner.
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = toml::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        restrict_to_owner(path)?;
        Ok(())
    }
}

/// Backoff settings for the push channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ReconnectConfig {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        let policy = ReconnectPolicy::default();
        Self {
            base_delay_ms: policy.base_delay.as_millis() as u64,
            max_delay_ms: policy.max_delay.as_millis() as u64,
            max_attempts: policy.max_attempts,
        }
    }
}

impl ReconnectConfig {
    pub fn policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms.max(self.base_delay_ms)),
            max_attempts: self.max_attempts,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PollerConfig {
    pub interval_ms: u64,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self { interval_ms: DEFAULT_POLL_INTERVAL.as_millis() as u64 }
    }
}

impl PollerConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.max(1))
    }
}

#[cfg(unix)]
fn restrict_to_owner(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
}

#[cfg(not(unix))]
fn restrict_to_owner(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

// ── Errors ─────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("config parse error: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("config serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn defaults_match_reference_backoff() {
        let cfg = ClientConfig::default();
        assert!(cfg.server_url.is_none());
        assert_eq!(cfg.transport, TransportKind::Websocket);
        assert_eq!(cfg.reconnect.policy(), ReconnectPolicy::default());
        assert_eq!(cfg.poller.interval(), Duration::from_secs(5));
    }

    #[test]
    fn parse_from_toml() {
        let toml_str = r#"
server_url = "https://app.example.com"
transport = "sse"
cookie = "session=abc"

[reconnect]
base_delay_ms = 500
max_attempts = 5
"#;
        let cfg: ClientConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(cfg.server_url.as_deref(), Some("https://app.example.com"));
        assert_eq!(cfg.transport, TransportKind::Sse);
        assert_eq!(cfg.cookie.as_deref(), Some("session=abc"));

        let policy = cfg.reconnect.policy();
        assert_eq!(policy.base_delay, Duration::from_millis(500));
        assert_eq!(policy.max_delay, Duration::from_secs(30));
        assert_eq!(policy.max_attempts, 5);
    }

    #[test]
    fn empty_toml_uses_defaults() {
        let cfg: ClientConfig = toml::from_str("").unwrap();
        assert_eq!(cfg, ClientConfig::default());
    }

    #[test]
    fn unknown_transport_is_rejected() {
        assert!(toml::from_str::<ClientConfig>("transport = \"carrier_pigeon\"").is_err());
    }

    #[test]
    fn max_delay_never_below_base() {
        let cfg = ReconnectConfig { base_delay_ms: 5_000, max_delay_ms: 100, max_attempts: 1 };
        assert_eq!(cfg.policy().max_delay, Duration::from_secs(5));
    }

    #[test]
    fn save_and_load_roundtrip_creates_parents() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let cfg = ClientConfig {
            server_url: Some("https://app.example.com".into()),
            transport: TransportKind::Sse,
            cookie: Some("session=xyz".into()),
            reconnect: ReconnectConfig { base_delay_ms: 250, max_delay_ms: 10_000, max_attempts: 7 },
            poller: PollerConfig { interval_ms: 1_000 },
        };
        cfg.save_to(&path).unwrap();
        assert_eq!(ClientConfig::load_from(&path).unwrap(), cfg);
    }

    #[cfg(unix)]
    #[test]
    fn saved_config_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        ClientConfig::default().save_to(&path).unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);
    }

    #[test]
    fn load_missing_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(
            ClientConfig::load_from(&dir.path().join("missing.toml")),
            Err(ConfigError::Io(_))
        ));
    }

    #[test]
    fn global_config_path_is_under_home() {
        if let Some(path) = global_config_path() {
            assert!(path.ends_with(".statesync/config.toml"));
        }
    }
}

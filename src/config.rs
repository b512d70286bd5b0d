//! Configuration management
//!
//! Config file is stored next to the executable as `config.toml`,
//! falling back to `config/default.toml`.

use crate::constants::{
    CONNECT_TIMEOUT_MS, DEFAULT_HOST, DEFAULT_PORT, REQUEST_TIMEOUT_MS, SYNC_INTERVAL_MS,
    SYNC_MAX_IN_FLIGHT,
};
use crate::error::{Error, Result};
use crate::reconcile::ReconcileConfig;
use crate::session::{ConnectionTarget, ReconnectPolicy, SessionConfig};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

// =============================================================================
// Application Configuration
// =============================================================================

/// Application configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub connection: ConnectionConfig,
    pub reconnect: ReconnectPolicy,
    pub sync: SyncConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// obs-websocket host
    pub host: String,
    /// obs-websocket port
    pub port: u16,
    /// Server password (empty = no authentication)
    pub password: String,
    /// Bound on connect + handshake
    pub connect_timeout_ms: u64,
    /// Bound on a single request
    pub request_timeout_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Poll interval (clamped to >= 500 ms)
    pub interval_ms: u64,
    /// Concurrent requests per cycle
    pub max_in_flight: usize,
    /// Audio inputs whose volume and mute are tracked
    pub inputs: Vec<String>,
    /// Poll performance stats and derive the stream bitrate
    pub stats: bool,
    /// Also track every input that reports a volume
    pub discover_inputs: bool,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            password: String::new(),
            connect_timeout_ms: CONNECT_TIMEOUT_MS,
            request_timeout_ms: REQUEST_TIMEOUT_MS,
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval_ms: SYNC_INTERVAL_MS,
            max_in_flight: SYNC_MAX_IN_FLIGHT,
            inputs: Vec::new(),
            stats: true,
            discover_inputs: false,
        }
    }
}

impl Config {
    /// Reject values the session cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.connection.host.trim().is_empty() {
            return Err(Error::ConfigValidation {
                field: "connection.host",
                reason: "must not be empty".into(),
            });
        }
        if self.connection.port == 0 {
            return Err(Error::ConfigValidation {
                field: "connection.port",
                reason: "must not be 0".into(),
            });
        }
        if self.connection.connect_timeout_ms == 0 {
            return Err(Error::ConfigValidation {
                field: "connection.connect_timeout_ms",
                reason: "must be positive".into(),
            });
        }
        if self.connection.request_timeout_ms == 0 {
            return Err(Error::ConfigValidation {
                field: "connection.request_timeout_ms",
                reason: "must be positive".into(),
            });
        }
        if self.sync.max_in_flight == 0 {
            return Err(Error::ConfigValidation {
                field: "sync.max_in_flight",
                reason: "must be positive".into(),
            });
        }
        Ok(())
    }

    pub fn target(&self) -> ConnectionTarget {
        ConnectionTarget::new(
            self.connection.host.clone(),
            self.connection.port,
            self.connection.password.clone(),
        )
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            connect_timeout: Duration::from_millis(self.connection.connect_timeout_ms),
            request_timeout: Duration::from_millis(self.connection.request_timeout_ms),
            ..SessionConfig::default()
        }
    }

    pub fn reconcile_config(&self) -> ReconcileConfig {
        ReconcileConfig {
            interval: Duration::from_millis(self.sync.interval_ms),
            max_in_flight: self.sync.max_in_flight,
            inputs: self.sync.inputs.clone(),
            stats: self.sync.stats,
            discover_inputs: self.sync.discover_inputs,
        }
    }
}

// =============================================================================
// File location
// =============================================================================

/// Get the project root directory
///
/// Searches in order:
/// 1. Next to executable (production deployment)
/// 2. Up from target/release or target/debug (dev builds)
fn find_project_root() -> Result<PathBuf> {
    let exe = std::env::current_exe().map_err(|e| Error::Io {
        path: PathBuf::from("executable"),
        source: e,
    })?;
    let exe_dir = exe.parent().ok_or_else(|| Error::ConfigValidation {
        field: "exe_path",
        reason: "no parent directory".into(),
    })?;

    if exe_dir.join("config.toml").exists() || exe_dir.join("config").exists() {
        return Ok(exe_dir.to_path_buf());
    }

    // exe_dir = .../obs-remote/target/release, we want .../obs-remote
    if let Some(target_dir) = exe_dir.parent() {
        if target_dir
            .file_name()
            .map(|n| n == "target")
            .unwrap_or(false)
        {
            if let Some(project_root) = target_dir.parent() {
                if project_root.join("config").exists() {
                    return Ok(project_root.to_path_buf());
                }
            }
        }
    }

    Ok(exe_dir.to_path_buf())
}

/// Get the config file path
///
/// Looks for config.toml, falls back to config/default.toml
pub fn config_path() -> Result<PathBuf> {
    let root = find_project_root()?;

    let user_config = root.join("config.toml");
    if user_config.exists() {
        return Ok(user_config);
    }

    let default_config = root.join("config").join("default.toml");
    if default_config.exists() {
        return Ok(default_config);
    }

    // Created by load_from when missing
    Ok(user_config)
}

// =============================================================================
// Load / save
// =============================================================================

/// Load config from the default location, creating it if missing
pub fn load() -> Config {
    match config_path() {
        Ok(path) => load_from(&path),
        Err(e) => {
            warn!("Failed to determine config path: {}, using defaults", e);
            Config::default()
        }
    }
}

/// Load config from `path`, creating it with defaults if missing
///
/// Unreadable or invalid files fall back to defaults.
pub fn load_from(path: &Path) -> Config {
    if !path.exists() {
        let config = Config::default();
        if let Err(e) = save_to(&config, path) {
            warn!("Failed to create default config: {}", e);
        }
        return config;
    }

    match fs::read_to_string(path) {
        Ok(content) => match toml::from_str(&content) {
            Ok(config) => config,
            Err(e) => {
                warn!("Config parse error in {:?}: {}, using defaults", path, e);
                Config::default()
            }
        },
        Err(e) => {
            warn!("Failed to read config {:?}: {}, using defaults", path, e);
            Config::default()
        }
    }
}

/// Write `config` as TOML to `path`
pub fn save_to(config: &Config, path: &Path) -> Result<()> {
    let content =
        toml::to_string_pretty(config).map_err(|e| Error::ConfigSerialize { source: e })?;
    fs::write(path, content).map_err(|e| Error::Io {
        path: path.to_path_buf(),
        source: e,
    })
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_values() {
        let config = Config::default();

        assert_eq!(config.connection.host, "localhost");
        assert_eq!(config.connection.port, 4455);
        assert_eq!(config.connection.password, "");
        assert_eq!(config.connection.connect_timeout_ms, 10_000);

        assert!(config.reconnect.enabled);
        assert_eq!(config.reconnect.base_delay_ms, 2000);
        assert_eq!(config.reconnect.jitter_ms, 500);
        assert_eq!(config.reconnect.max_attempts, 5);

        assert_eq!(config.sync.interval_ms, 1000);
        assert!(config.sync.inputs.is_empty());
        assert!(config.sync.stats);
        assert!(!config.sync.discover_inputs);
    }

    #[test]
    fn test_config_empty_file() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_config_partial_sections() {
        let partial_toml = r#"
[connection]
host = "studio.local"

[reconnect]
enabled = false

[sync]
inputs = ["Mic/Aux", "Desktop Audio"]
discover_inputs = true
"#;

        let config: Config = toml::from_str(partial_toml).unwrap();

        assert_eq!(config.connection.host, "studio.local");
        assert_eq!(config.connection.port, 4455);
        assert!(!config.reconnect.enabled);
        assert_eq!(config.reconnect.max_attempts, 5);
        assert_eq!(config.sync.inputs, vec!["Mic/Aux", "Desktop Audio"]);
        assert_eq!(config.sync.interval_ms, 1000);
        assert!(config.sync.discover_inputs);
        assert!(config.reconcile_config().discover_inputs);
    }

    #[test]
    fn test_config_serialize_deserialize_roundtrip() {
        let mut config = Config::default();
        config.connection.password = "secret".into();
        config.reconnect.max_attempts = 9;
        config.sync.inputs = vec!["Mic".into()];

        let toml_str = toml::to_string_pretty(&config).unwrap();
        let restored: Config = toml::from_str(&toml_str).unwrap();
        assert_eq!(restored, config);
    }

    #[test]
    fn test_validate_rejects_empty_host() {
        let mut config = Config::default();
        config.connection.host = "  ".into();
        assert!(matches!(
            config.validate(),
            Err(Error::ConfigValidation {
                field: "connection.host",
                ..
            })
        ));
    }

    #[test]
    fn test_validate_rejects_zero_port() {
        let mut config = Config::default();
        config.connection.port = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_derived_settings() {
        let mut config = Config::default();
        config.connection.host = "10.0.0.5".into();
        config.connection.request_timeout_ms = 2500;
        config.sync.interval_ms = 750;

        assert_eq!(config.target().url(), "ws://10.0.0.5:4455");
        assert_eq!(
            config.session_config().request_timeout,
            Duration::from_millis(2500)
        );
        assert_eq!(
            config.reconcile_config().interval,
            Duration::from_millis(750)
        );
    }

    #[test]
    fn test_load_from_creates_missing_file() {
        let dir = std::env::temp_dir().join(format!("obs-remote-config-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.toml");
        let _ = fs::remove_file(&path);

        let config = load_from(&path);
        assert_eq!(config, Config::default());
        assert!(path.exists());

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_save_to_then_load_from() {
        let dir = std::env::temp_dir().join(format!("obs-remote-saved-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.toml");

        let mut config = Config::default();
        config.connection.port = 4460;
        config.sync.stats = false;
        save_to(&config, &path).unwrap();

        assert_eq!(load_from(&path), config);

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_load_from_invalid_file_uses_defaults() {
        let dir = std::env::temp_dir().join(format!("obs-remote-invalid-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.toml");
        fs::write(&path, "[connection\nport = ").unwrap();

        assert_eq!(load_from(&path), Config::default());

        let _ = fs::remove_dir_all(&dir);
    }
}

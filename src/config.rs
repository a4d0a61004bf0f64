use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

use crate::app::{
    APP_ID, BACKEND_LEGACY_NAME, BACKEND_PRIMARY_NAME, DEFAULT_FALLBACK_PORT,
    DEFAULT_PORT_RANGE_LEN, DEFAULT_PREFERRED_PORT,
};

pub const CONFIG_FILE_NAME: &str = "shell.config.json";

pub const ENV_BACKEND_PATH: &str = "XHS_DESKTOP_BACKEND_PATH";
pub const ENV_PORT: &str = "XHS_DESKTOP_PORT";
pub const ENV_LOG: &str = "XHS_DESKTOP_LOG";
pub const ENV_LOCALE: &str = "XHS_DESKTOP_LOCALE";

/// Shell configuration settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ShellConfig {
    /// How to find and launch the backend
    pub backend: BackendConfig,

    /// Port search ranges
    pub ports: PortConfig,

    /// Readiness polling
    pub health: HealthConfig,

    /// Output phrases that mean the port is taken
    pub port_conflict: PortConflictConfig,

    /// tracing max level: error, warn, info, debug, trace
    pub log_level: String,

    /// zh-CN or en-US; detected from the environment when unset
    pub locale: Option<String>,

    /// Open the backend UI in the system browser once ready
    pub open_browser: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Explicit executable, checked before any discovered location
    pub path: Option<PathBuf>,

    /// Executable names in priority order, without platform suffix
    pub executable_names: Vec<String>,

    pub headless_flag: String,
    pub port_flag: String,
    pub extra_args: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PortConfig {
    pub preferred_start: u16,
    pub fallback_start: u16,
    pub range_len: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub host: String,
    pub path: String,
    pub timeout_ms: u64,
    pub grace_ms: u64,
    pub retry_delay_ms: u64,
    pub max_attempts: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PortConflictConfig {
    /// Extra case-insensitive regular expressions
    pub extra_patterns: Vec<String>,

    /// Use only `extra_patterns`, dropping the built-in phrases
    pub replace_defaults: bool,
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self {
            backend: BackendConfig::default(),
            ports: PortConfig::default(),
            health: HealthConfig::default(),
            port_conflict: PortConflictConfig::default(),
            log_level: "info".to_string(),
            locale: None,
            open_browser: true,
        }
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            path: None,
            executable_names: vec![
                BACKEND_PRIMARY_NAME.to_string(),
                BACKEND_LEGACY_NAME.to_string(),
            ],
            headless_flag: "-no-browser".to_string(),
            port_flag: "-port".to_string(),
            extra_args: Vec::new(),
        }
    }
}

impl Default for PortConfig {
    fn default() -> Self {
        Self {
            preferred_start: DEFAULT_PREFERRED_PORT,
            fallback_start: DEFAULT_FALLBACK_PORT,
            range_len: DEFAULT_PORT_RANGE_LEN,
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            path: "/health".to_string(),
            timeout_ms: 5_000,
            grace_ms: 3_000,
            retry_delay_ms: 2_000,
            max_attempts: 5,
        }
    }
}

impl HealthConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn grace(&self) -> Duration {
        Duration::from_millis(self.grace_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

impl ShellConfig {
    /// Load configuration from file, then apply environment overrides
    pub fn load() -> Self {
        let mut config = Self::get_config_path()
            .map(|path| Self::load_from(&path))
            .unwrap_or_default();
        config.apply_overrides(|key| std::env::var(key).ok());
        config
    }

    /// Read one config file; missing or broken files give the defaults
    pub fn load_from(path: &Path) -> Self {
        if !path.exists() {
            return Self::default();
        }

        match std::fs::read_to_string(path) {
            Ok(contents) => match serde_json::from_str(&contents) {
                Ok(config) => {
                    info!("Loaded shell config from {:?}", path);
                    config
                }
                Err(e) => {
                    warn!("Invalid shell config {:?}, using defaults: {}", path, e);
                    Self::default()
                }
            },
            Err(e) => {
                warn!("Failed to read shell config {:?}: {}", path, e);
                Self::default()
            }
        }
    }

    /// Apply `XHS_DESKTOP_*` overrides. `lookup` is `std::env::var` outside tests.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(path) = lookup(ENV_BACKEND_PATH).filter(|v| !v.trim().is_empty()) {
            self.backend.path = Some(PathBuf::from(path.trim()));
        }

        if let Some(port) = lookup(ENV_PORT) {
            match port.trim().parse::<u16>() {
                Ok(port) if port > 0 => self.ports.preferred_start = port,
                _ => warn!("Ignoring invalid {}={:?}", ENV_PORT, port),
            }
        }

        if let Some(level) = lookup(ENV_LOG).filter(|v| !v.trim().is_empty()) {
            self.log_level = level.trim().to_string();
        }

        if let Some(locale) = lookup(ENV_LOCALE).filter(|v| !v.trim().is_empty()) {
            self.locale = Some(locale.trim().to_string());
        }
    }

    /// Get the configuration file path
    pub fn get_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join(APP_ID).join(CONFIG_FILE_NAME))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = ShellConfig::default();
        assert_eq!(config.ports.preferred_start, 18060);
        assert_eq!(config.ports.fallback_start, 8080);
        assert_eq!(config.ports.range_len, 100);
        assert_eq!(config.health.timeout(), Duration::from_secs(5));
        assert_eq!(config.health.grace(), Duration::from_secs(3));
        assert_eq!(config.health.retry_delay(), Duration::from_secs(2));
        assert_eq!(config.health.max_attempts, 5);
        assert_eq!(
            config.backend.executable_names,
            vec!["xiaohongshu-mcp-desktop", "xiaohongshu-mcp"]
        );
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        std::fs::write(
            &path,
            r#"{"ports":{"preferred_start":19000},"port_conflict":{"extra_patterns":["busy"]}}"#,
        )
        .unwrap();

        let config = ShellConfig::load_from(&path);
        assert_eq!(config.ports.preferred_start, 19000);
        assert_eq!(config.ports.fallback_start, 8080);
        assert_eq!(config.port_conflict.extra_patterns, vec!["busy"]);
        assert_eq!(config.health.path, "/health");
    }

    #[test]
    fn test_broken_or_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        assert_eq!(ShellConfig::load_from(&path).ports.preferred_start, 18060);

        std::fs::write(&path, "{ not json").unwrap();
        assert_eq!(ShellConfig::load_from(&path).ports.preferred_start, 18060);
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            (ENV_BACKEND_PATH, "/opt/backend/svc"),
            (ENV_PORT, "20000"),
            (ENV_LOG, "debug"),
            (ENV_LOCALE, "en-US"),
        ]
        .into_iter()
        .collect();

        let mut config = ShellConfig::default();
        config.apply_overrides(|key| env.get(key).map(|v| v.to_string()));

        assert_eq!(config.backend.path, Some(PathBuf::from("/opt/backend/svc")));
        assert_eq!(config.ports.preferred_start, 20000);
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.locale.as_deref(), Some("en-US"));
    }

    #[test]
    fn test_invalid_port_override_ignored() {
        let mut config = ShellConfig::default();
        config.apply_overrides(|key| (key == ENV_PORT).then(|| "not-a-port".to_string()));
        assert_eq!(config.ports.preferred_start, 18060);

        config.apply_overrides(|key| (key == ENV_PORT).then(|| "0".to_string()));
        assert_eq!(config.ports.preferred_start, 18060);
    }
}

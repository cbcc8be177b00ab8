//! Configuration management
//!
//! This module handles loading and parsing configuration for the taskoo web host.
//! Configuration can be loaded from:
//! - config.yml file
//! - Environment variables (override file settings)
//!
//! Missing optional values are filled with sensible defaults.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Environment variable naming an alternative config file
pub const CONFIG_PATH_ENV: &str = "TASKOO_WEB_CONFIG";

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,
    /// Guest module configuration
    #[serde(default)]
    pub guest: GuestConfig,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Host address to bind to
    #[serde(default = "default_host")]
    pub host: String,
    /// Port to listen on
    #[serde(default = "default_port")]
    pub port: u16,
    /// CORS allowed origin, `*` for any
    #[serde(default = "default_cors_origin")]
    pub cors_origin: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            cors_origin: default_cors_origin(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    7000
}

fn default_cors_origin() -> String {
    "*".to_string()
}

/// Guest module configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuestConfig {
    /// Path to the compiled core module
    #[serde(default = "default_module_path")]
    pub module_path: PathBuf,
    /// Home directory handed to the guest as `HOME`
    #[serde(default = "default_home")]
    pub home: PathBuf,
    /// Configuration root preopened for the guest (default: `$HOME/.config`)
    #[serde(default)]
    pub config_root: Option<PathBuf>,
    /// Application config directory preopened for the guest
    /// (default: `<config_root>/taskoo`)
    #[serde(default)]
    pub app_config_dir: Option<PathBuf>,
    /// Turn on the guest's debug logging
    #[serde(default)]
    pub debug: bool,
    /// Fuel budget per call; unlimited when absent
    #[serde(default)]
    pub fuel_limit: Option<u64>,
    /// Ceiling on guest linear memory, checked before every call
    #[serde(default = "default_memory_limit")]
    pub memory_limit_bytes: u64,
    /// Export names of the guest module
    #[serde(default)]
    pub exports: GuestExports,
}

impl Default for GuestConfig {
    fn default() -> Self {
        Self {
            module_path: default_module_path(),
            home: default_home(),
            config_root: None,
            app_config_dir: None,
            debug: false,
            fuel_limit: None,
            memory_limit_bytes: default_memory_limit(),
            exports: GuestExports::default(),
        }
    }
}

fn default_module_path() -> PathBuf {
    PathBuf::from("taskoo_core.wasm")
}

fn default_home() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
}

fn default_memory_limit() -> u64 {
    256 * 1024 * 1024 // 256MB
}

impl GuestConfig {
    /// Configuration root after defaulting
    pub fn resolved_config_root(&self) -> PathBuf {
        self.config_root
            .clone()
            .unwrap_or_else(|| self.home.join(".config"))
    }

    /// Application config directory after defaulting
    pub fn resolved_app_config_dir(&self) -> PathBuf {
        self.app_config_dir
            .clone()
            .unwrap_or_else(|| self.resolved_config_root().join("taskoo"))
    }
}

/// Names of the functions exported by the guest module.
///
/// The protocol exports (`allocate`, `output_len`, `free`, `initialize`) are
/// used by the bridge itself; the rest back one HTTP operation each.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GuestExports {
    pub allocate: String,
    pub output_len: String,
    pub free: String,
    pub initialize: String,
    pub today: String,
    pub list: String,
    pub agenda: String,
    pub add: String,
    pub delete: String,
    pub state_change: String,
    pub run: String,
}

impl Default for GuestExports {
    fn default() -> Self {
        Self {
            allocate: "allocate".to_string(),
            output_len: "print_hello_size".to_string(),
            free: "print_hello_free".to_string(),
            initialize: "_initialize".to_string(),
            today: "print_today_js".to_string(),
            list: "list".to_string(),
            agenda: "agenda".to_string(),
            add: "add".to_string(),
            delete: "delete".to_string(),
            state_change: "state_change".to_string(),
            run: "upper".to_string(),
        }
    }
}

/// Error type for configuration parsing
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    FileRead {
        path: String,
        source: std::io::Error,
    },
    #[error("Failed to parse config file '{path}': {message}")]
    ParseError {
        path: String,
        message: String,
    },
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

impl Config {
    /// Path of the config file: `$TASKOO_WEB_CONFIG` or `config.yml`
    pub fn default_path() -> PathBuf {
        std::env::var_os(CONFIG_PATH_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("config.yml"))
    }

    /// Load configuration from file
    ///
    /// If the file doesn't exist, returns default configuration.
    /// If the file exists but is invalid YAML, returns an error with details.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
            path: path.display().to_string(),
            source: e,
        })?;

        if content.trim().is_empty() {
            return Ok(Self::default());
        }

        let config: Config = serde_yaml::from_str(&content).map_err(|e| {
            ConfigError::ParseError {
                path: path.display().to_string(),
                message: format_yaml_error(&e),
            }
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from file with environment variable overrides
    ///
    /// Environment variables follow the pattern:
    /// - TASKOO_WEB_SERVER_HOST
    /// - TASKOO_WEB_SERVER_PORT
    /// - TASKOO_WEB_SERVER_CORS_ORIGIN
    /// - TASKOO_WEB_GUEST_MODULE_PATH
    /// - TASKOO_WEB_GUEST_HOME
    /// - TASKOO_WEB_GUEST_DEBUG
    pub fn load_with_env(path: &Path) -> anyhow::Result<Self> {
        let mut config = Self::load(path)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(host) = std::env::var("TASKOO_WEB_SERVER_HOST") {
            self.server.host = host;
        }
        if let Ok(port) = std::env::var("TASKOO_WEB_SERVER_PORT") {
            if let Ok(port) = port.parse::<u16>() {
                self.server.port = port;
            }
        }
        if let Ok(cors_origin) = std::env::var("TASKOO_WEB_SERVER_CORS_ORIGIN") {
            self.server.cors_origin = cors_origin;
        }

        if let Ok(path) = std::env::var("TASKOO_WEB_GUEST_MODULE_PATH") {
            self.guest.module_path = PathBuf::from(path);
        }
        if let Ok(home) = std::env::var("TASKOO_WEB_GUEST_HOME") {
            self.guest.home = PathBuf::from(home);
        }
        if let Ok(debug) = std::env::var("TASKOO_WEB_GUEST_DEBUG") {
            match debug.to_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => self.guest.debug = true,
                "0" | "false" | "no" | "off" => self.guest.debug = false,
                _ => {}
            }
        }
    }

    /// Check cross-field constraints that serde cannot express
    pub fn validate(&self) -> Result<(), ConfigError> {
        let root = self.guest.resolved_config_root();
        let app_dir = self.guest.resolved_app_config_dir();
        if !app_dir.starts_with(&root) {
            return Err(ConfigError::ValidationError(format!(
                "guest.app_config_dir '{}' is not inside guest.config_root '{}'",
                app_dir.display(),
                root.display()
            )));
        }
        if self.guest.fuel_limit == Some(0) {
            return Err(ConfigError::ValidationError(
                "guest.fuel_limit must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Format YAML parsing error with location and context
fn format_yaml_error(e: &serde_yaml::Error) -> String {
    if let Some(location) = e.location() {
        format!(
            "at line {}, column {}: {}",
            location.line(),
            location.column(),
            e
        )
    } else {
        e.to_string()
    }
}

// Shared mutex for config tests that modify environment variables.
#[cfg(test)]
static CONFIG_ENV_MUTEX: std::sync::Mutex<()> = std::sync::Mutex::new(());

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const ENV_VARS: &[&str] = &[
        "TASKOO_WEB_SERVER_HOST",
        "TASKOO_WEB_SERVER_PORT",
        "TASKOO_WEB_SERVER_CORS_ORIGIN",
        "TASKOO_WEB_GUEST_MODULE_PATH",
        "TASKOO_WEB_GUEST_HOME",
        "TASKOO_WEB_GUEST_DEBUG",
    ];

    fn lock_env() -> std::sync::MutexGuard<'static, ()> {
        super::CONFIG_ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn clear_env() {
        for var in ENV_VARS {
            std::env::remove_var(var);
        }
    }

    #[test]
    fn test_load_missing_file_returns_defaults() {
        let path = Path::new("nonexistent_config.yml");
        let config = Config::load(path).unwrap();

        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.server.port, 7000);
        assert_eq!(config.server.cors_origin, "*");
        assert_eq!(config.guest.module_path, PathBuf::from("taskoo_core.wasm"));
        assert!(!config.guest.debug);
        assert_eq!(config.guest.fuel_limit, None);
        assert_eq!(config.guest.exports, GuestExports::default());
    }

    #[test]
    fn test_load_empty_file_returns_defaults() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "").unwrap();

        let config = Config::load(file.path()).unwrap();

        assert_eq!(config.server.port, 7000);
        assert_eq!(config.guest.exports.output_len, "print_hello_size");
    }

    #[test]
    fn test_load_partial_exports_fills_defaults() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "guest:\n  exports:\n    list: list_tasks\n").unwrap();

        let config = Config::load(file.path()).unwrap();

        assert_eq!(config.guest.exports.list, "list_tasks");
        assert_eq!(config.guest.exports.agenda, "agenda");
        assert_eq!(config.guest.exports.free, "print_hello_free");
    }

    #[test]
    fn test_load_full_config() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, r#"
server:
  host: "127.0.0.1"
  port: 7001
  cors_origin: "http://localhost:8080"
guest:
  module_path: "/opt/taskoo/taskoo_core.wasm"
  home: "/home/taskoo"
  debug: true
  fuel_limit: 5000000
  memory_limit_bytes: 1048576
"#).unwrap();

        let config = Config::load(file.path()).unwrap();

        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 7001);
        assert_eq!(config.server.cors_origin, "http://localhost:8080");
        assert_eq!(config.guest.module_path, PathBuf::from("/opt/taskoo/taskoo_core.wasm"));
        assert!(config.guest.debug);
        assert_eq!(config.guest.fuel_limit, Some(5_000_000));
        assert_eq!(config.guest.memory_limit_bytes, 1_048_576);
        assert_eq!(config.guest.resolved_config_root(), PathBuf::from("/home/taskoo/.config"));
        assert_eq!(
            config.guest.resolved_app_config_dir(),
            PathBuf::from("/home/taskoo/.config/taskoo")
        );
    }

    #[test]
    fn test_load_invalid_yaml_returns_error() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "server:\n  port: not_a_number\n").unwrap();

        let err = Config::load(file.path()).unwrap_err();
        assert!(err.to_string().contains("parse"));
    }

    #[test]
    fn test_app_dir_outside_root_rejected() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "guest:\n  config_root: /etc/taskoo\n  app_config_dir: /tmp/elsewhere\n").unwrap();

        let err = Config::load(file.path()).unwrap_err();
        assert!(err.to_string().contains("not inside"));
    }

    #[test]
    fn test_zero_fuel_rejected() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "guest:\n  fuel_limit: 0\n").unwrap();

        assert!(Config::load(file.path()).is_err());
    }

    #[test]
    fn test_env_override_server_and_guest() {
        let _guard = lock_env();
        clear_env();

        let mut file = NamedTempFile::new().unwrap();
        write!(file, "server:\n  port: 7000\n").unwrap();

        std::env::set_var("TASKOO_WEB_SERVER_HOST", "127.0.0.1");
        std::env::set_var("TASKOO_WEB_SERVER_PORT", "7001");
        std::env::set_var("TASKOO_WEB_GUEST_MODULE_PATH", "core.wasm");
        std::env::set_var("TASKOO_WEB_GUEST_HOME", "/srv/taskoo");
        std::env::set_var("TASKOO_WEB_GUEST_DEBUG", "true");

        let config = Config::load_with_env(file.path()).unwrap();

        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 7001);
        assert_eq!(config.guest.module_path, PathBuf::from("core.wasm"));
        assert_eq!(config.guest.home, PathBuf::from("/srv/taskoo"));
        assert!(config.guest.debug);

        clear_env();
    }

    #[test]
    fn test_env_override_invalid_values_ignored() {
        let _guard = lock_env();
        clear_env();

        let mut file = NamedTempFile::new().unwrap();
        write!(file, "server:\n  port: 7002\nguest:\n  debug: true\n").unwrap();

        std::env::set_var("TASKOO_WEB_SERVER_PORT", "not_a_number");
        std::env::set_var("TASKOO_WEB_GUEST_DEBUG", "maybe");

        let config = Config::load_with_env(file.path()).unwrap();

        assert_eq!(config.server.port, 7002);
        assert!(config.guest.debug);

        clear_env();
    }
}

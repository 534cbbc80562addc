//! Configuration management for sshdaemon.
//!
//! This module provides TOML-based configuration file loading and saving.
//! The default configuration path is `~/.config/sshdaemon/config.toml`.
//! A [`ServerConfiguration`] is handed to [`crate::Daemon::new`] and never
//! changes afterwards.

use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use secrecy::{ExposeSecret, Secret, SecretString};
use serde::{Deserialize, Serialize, Serializer};
use thiserror::Error;

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("port must be greater than 0")]
    InvalidPort,

    #[error("bind_address is not a valid IP address: {0}")]
    InvalidBindAddress(String),

    #[error("drain_timeout_secs must be between 0 and 3600 seconds, got {0}")]
    InvalidDrainTimeout(u64),

    #[error("username must not be empty")]
    EmptyUsername,

    #[error("password must not be empty")]
    EmptyPassword,

    #[error("root_dir is not an existing directory: {0}")]
    InvalidRootDir(PathBuf),

    #[error("host key size must be between {min} and {max} bits, got {bits}")]
    InvalidKeySize { bits: usize, min: usize, max: usize },

    #[error("shell program does not exist: {0}")]
    InvalidShellPath(String),

    #[error("log level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Default SSH listening port.
pub const DEFAULT_PORT: u16 = 8022;

/// Main configuration structure for sshdaemon.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ServerConfiguration {
    /// Listener settings.
    pub server: ListenConfig,

    /// The single accepted credential pair.
    pub auth: AuthConfig,

    /// Served file tree.
    pub files: FilesConfig,

    /// Host key generation.
    pub host_key: HostKeyConfig,

    /// Interactive shell channel.
    pub shell: ShellConfig,

    /// Logging settings.
    pub logging: LoggingConfig,
}

/// Listener configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ListenConfig {
    /// Address to bind.
    pub bind_address: String,

    /// TCP port; use 0 to let the OS pick one.
    pub port: u16,

    /// Seconds in-flight sessions get to finish after shutdown starts.
    pub drain_timeout_secs: u64,
}

/// Credential configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub username: String,

    #[serde(serialize_with = "serialize_secret")]
    pub password: SecretString,
}

/// Served file tree configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FilesConfig {
    /// Root of the virtual filesystem; also holds the reserved `SSH_DAEMON/`.
    pub root_dir: PathBuf,

    /// Refuse every mutating SFTP operation.
    pub read_only: bool,
}

/// Host key configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HostKeyConfig {
    /// RSA modulus size used when a new key is generated.
    pub bits: usize,
}

/// Shell channel configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ShellConfig {
    /// Program spawned for `shell` requests.
    pub program: String,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Logging level (trace, debug, info, warn, error).
    pub level: String,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            drain_timeout_secs: 10,
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            username: "user".to_string(),
            password: Secret::new("pass".to_string()),
        }
    }
}

impl Default for FilesConfig {
    fn default() -> Self {
        Self {
            root_dir: dirs::home_dir().unwrap_or_else(|| PathBuf::from(".")),
            read_only: false,
        }
    }
}

impl Default for HostKeyConfig {
    fn default() -> Self {
        Self {
            bits: hostkey::DEFAULT_RSA_BITS,
        }
    }
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self {
            program: default_shell(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("sshdaemon")
        .join("config.toml")
}

/// Returns `$SHELL`, or `/bin/sh` when unset.
fn default_shell() -> String {
    std::env::var("SHELL")
        .ok()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "/bin/sh".to_string())
}

fn serialize_secret<S: Serializer>(secret: &SecretString, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(secret.expose_secret())
}

impl ServerConfiguration {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Empty values are ignored. Supported variables:
    /// - SSHDAEMON_PORT
    /// - SSHDAEMON_USERNAME
    /// - SSHDAEMON_PASSWORD
    /// - SSHDAEMON_ROOT_DIR
    /// - SSHDAEMON_READ_ONLY (true/false/1/0)
    /// - SSHDAEMON_LOG_LEVEL
    pub fn apply_env_overrides(&mut self) {
        if let Some(port) = env_value("SSHDAEMON_PORT") {
            match port.parse::<u16>() {
                Ok(port) => {
                    tracing::info!("Overriding port from environment: {}", port);
                    self.server.port = port;
                }
                Err(_) => tracing::warn!("Ignoring invalid SSHDAEMON_PORT: {}", port),
            }
        }

        if let Some(username) = env_value("SSHDAEMON_USERNAME") {
            tracing::info!("Overriding username from environment: {}", username);
            self.auth.username = username;
        }

        if let Some(password) = env_value("SSHDAEMON_PASSWORD") {
            tracing::info!("Overriding password from environment");
            self.auth.password = Secret::new(password);
        }

        if let Some(root) = env_value("SSHDAEMON_ROOT_DIR") {
            tracing::info!("Overriding root_dir from environment: {}", root);
            self.files.root_dir = PathBuf::from(root);
        }

        if let Some(flag) = env_value("SSHDAEMON_READ_ONLY") {
            match parse_bool(&flag) {
                Some(read_only) => {
                    tracing::info!("Overriding read_only from environment: {}", read_only);
                    self.files.read_only = read_only;
                }
                None => tracing::warn!("Ignoring invalid SSHDAEMON_READ_ONLY: {}", flag),
            }
        }

        if let Some(level) = env_value("SSHDAEMON_LOG_LEVEL") {
            tracing::info!("Overriding log level from environment: {}", level);
            self.logging.level = level;
        }
    }

    /// Validate the configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.port == 0 {
            return Err(ConfigError::InvalidPort);
        }

        self.validate_common()
    }

    /// Like [`validate`](Self::validate) but accepts port 0 (ephemeral).
    pub fn validate_allow_ephemeral(&self) -> Result<(), ConfigError> {
        self.validate_common()
    }

    fn validate_common(&self) -> Result<(), ConfigError> {
        if self
            .server
            .bind_address
            .parse::<std::net::IpAddr>()
            .is_err()
        {
            return Err(ConfigError::InvalidBindAddress(
                self.server.bind_address.clone(),
            ));
        }

        if self.server.drain_timeout_secs > 3600 {
            return Err(ConfigError::InvalidDrainTimeout(
                self.server.drain_timeout_secs,
            ));
        }

        if self.auth.username.is_empty() {
            return Err(ConfigError::EmptyUsername);
        }

        if self.auth.password.expose_secret().is_empty() {
            return Err(ConfigError::EmptyPassword);
        }

        if !self.files.root_dir.is_dir() {
            return Err(ConfigError::InvalidRootDir(self.files.root_dir.clone()));
        }

        let bits = self.host_key.bits;
        if !(hostkey::MIN_RSA_BITS..=hostkey::MAX_RSA_BITS).contains(&bits) {
            return Err(ConfigError::InvalidKeySize {
                bits,
                min: hostkey::MIN_RSA_BITS,
                max: hostkey::MAX_RSA_BITS,
            });
        }

        let shell_path = Path::new(&self.shell.program);
        let shell_found = if shell_path.is_absolute() {
            shell_path.exists()
        } else {
            which::which(&self.shell.program).is_ok()
        };
        if !shell_found {
            return Err(ConfigError::InvalidShellPath(self.shell.program.clone()));
        }

        let level = self.logging.level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.logging.level.clone()));
        }

        Ok(())
    }

    /// Socket address the listener binds to.
    pub fn listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        let ip = self
            .server
            .bind_address
            .parse::<std::net::IpAddr>()
            .map_err(|_| ConfigError::InvalidBindAddress(self.server.bind_address.clone()))?;
        Ok(SocketAddr::new(ip, self.server.port))
    }

    /// Upper bound on the shutdown drain.
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.server.drain_timeout_secs)
    }

    /// Load configuration from a file.
    ///
    /// If the file does not exist, returns the default configuration.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_toml(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str)
            .map_err(|e| anyhow::anyhow!("Invalid TOML configuration: {}", format_toml_error(&e)))
    }

    /// Save configuration to a file, creating parent directories.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let contents = self.to_toml()?;
        fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::debug!("Configuration saved to {:?}", path);
        Ok(())
    }

    /// Serialize configuration to a TOML string.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration to TOML")
    }
}

fn env_value(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Format a TOML deserialization error for user-friendly display.
fn format_toml_error(error: &toml::de::Error) -> String {
    let mut msg = error.message().to_string();

    if let Some(span) = error.span() {
        msg.push_str(&format!(" (at position {}..{})", span.start, span.end));
    }

    msg
}

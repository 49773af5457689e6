use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::broker::{BrokerSettings, TreeUpdatePolicy};
use crate::pty::SpawnCommand;

pub const DEFAULT_BIND: &str = "127.0.0.1:9000";
pub const MAX_DEBOUNCE_MS: u64 = 10_000;

/// Server configuration, loaded from TOML. Every field is optional in the
/// file; command-line flags are applied on top.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub bind: SocketAddr,
    /// Directory the shell runs in and clients may edit. Created if missing.
    pub workspace: PathBuf,
    /// Quiet period before a burst of filesystem events is reported.
    pub debounce_ms: u64,
    /// Messages queued per client before the oldest are dropped.
    pub outbound_buffer: usize,
    /// How long a client's own write is kept out of its change notifications.
    pub suppression_ms: u64,
    pub max_connections: usize,
    pub tree_updates: TreeUpdatePolicy,
    /// Allowed CORS origins. Empty disables CORS; `"*"` allows any origin.
    pub cors_origins: Vec<String>,
    pub shell: ShellConfig,
}

/// The shell subprocess.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ShellConfig {
    /// Program to run. Unset means `$SHELL`, then `/bin/sh`.
    pub program: Option<String>,
    pub args: Vec<String>,
    pub term: String,
    pub rows: u16,
    pub cols: u16,
    pub env: BTreeMap<String, String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 9000)),
            workspace: PathBuf::from("user"),
            debounce_ms: 150,
            outbound_buffer: 1024,
            suppression_ms: 2000,
            max_connections: 64,
            tree_updates: TreeUpdatePolicy::Notify,
            cors_origins: Vec::new(),
            shell: ShellConfig::default(),
        }
    }
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self {
            program: None,
            args: Vec::new(),
            term: "xterm-256color".to_string(),
            rows: 30,
            cols: 80,
            env: BTreeMap::new(),
        }
    }
}

impl ShellConfig {
    pub fn spawn_command(&self, cwd: &Path) -> SpawnCommand {
        SpawnCommand {
            program: self.program.clone(),
            args: self.args.clone(),
            cwd: Some(cwd.to_path_buf()),
            env: self.env.clone(),
            term: self.term.clone(),
        }
    }
}

impl Config {
    /// Load config from a TOML file path. Returns None if file doesn't exist.
    pub fn load(path: &Path) -> Result<Option<Self>, ConfigError> {
        if !path.exists() {
            return Ok(None);
        }

        check_config_permissions(path);

        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        let config: Self = toml::from_str(&contents)
            .map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))?;
        Ok(Some(config))
    }

    /// `$XDG_CONFIG_HOME/sandshell/config.toml` or the platform equivalent.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("sandshell").join("config.toml"))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.debounce_ms == 0 || self.debounce_ms > MAX_DEBOUNCE_MS {
            return Err(ConfigError::Invalid(format!(
                "debounce_ms must be between 1 and {MAX_DEBOUNCE_MS}, got {}",
                self.debounce_ms
            )));
        }
        if self.outbound_buffer == 0 {
            return Err(ConfigError::Invalid("outbound_buffer must be at least 1".into()));
        }
        if self.max_connections == 0 {
            return Err(ConfigError::Invalid("max_connections must be at least 1".into()));
        }
        if self.shell.rows == 0 || self.shell.cols == 0 {
            return Err(ConfigError::Invalid(format!(
                "shell size must be non-zero, got {}x{}",
                self.shell.rows, self.shell.cols
            )));
        }
        if self.shell.term.is_empty() {
            return Err(ConfigError::Invalid("shell.term must not be empty".into()));
        }
        Ok(())
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn broker_settings(&self) -> BrokerSettings {
        BrokerSettings {
            suppression_grace: Duration::from_millis(self.suppression_ms),
            tree_updates: self.tree_updates,
            outbound_capacity: self.outbound_buffer,
            ..BrokerSettings::default()
        }
    }
}

/// Errors that can occur when loading config.
#[derive(Debug)]
pub enum ConfigError {
    ReadFailed(PathBuf, std::io::Error),
    ParseFailed(PathBuf, toml::de::Error),
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ReadFailed(path, e) => {
                write!(f, "Failed to read config {}: {}", path.display(), e)
            }
            Self::ParseFailed(path, e) => {
                write!(f, "Failed to parse config {}: {}", path.display(), e)
            }
            Self::Invalid(reason) => write!(f, "Invalid config: {}", reason),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Warn when the config file is world-writable or world-readable. It
/// decides which program runs with the server's privileges.
#[cfg(unix)]
pub fn check_config_permissions(path: &Path) {
    use std::os::unix::fs::PermissionsExt;

    let Ok(metadata) = std::fs::metadata(path) else {
        return;
    };
    let mode = metadata.permissions().mode();
    if is_world_writable(mode) {
        tracing::warn!(
            "Config file {} is world-writable (mode {:o}); anyone can change the shell it launches.",
            path.display(),
            mode & 0o7777,
        );
    } else if is_world_readable(mode) {
        tracing::warn!(
            "Config file {} is world-readable (mode {:o}); consider restricting permissions to 600.",
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

#[cfg(unix)]
pub fn is_world_writable(mode: u32) -> bool {
    mode & 0o002 != 0
}

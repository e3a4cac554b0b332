//! Configuration management for quarantinefs

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default quiet window before a written file is handed to the inspector
pub const DEFAULT_QUIET_WINDOW_MS: u64 = 1000;

/// Default attribute validity reported to the kernel
pub const DEFAULT_ATTR_TTL_MS: u64 = 1000;

/// Default size limit of a file held in memory (4 GiB)
pub const DEFAULT_MAX_FILE_SIZE: u64 = 4 << 30;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Mount configuration
    pub mount: MountConfig,

    /// Overlay engine configuration
    pub overlay: OverlayConfig,

    /// Debounced notifier configuration
    pub notifier: NotifierConfig,

    /// Inspection hook configuration
    pub inspector: InspectorConfig,
}

/// Mount configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MountConfig {
    /// Filesystem name shown in the mount table
    pub fs_name: String,

    /// Allow other users to access the mount
    pub allow_other: bool,

    /// Pass `nonempty` to the mounter (only needed by fuse2 mount helpers)
    pub allow_non_empty: bool,

    /// Let the kernel enforce the reported permission bits
    pub default_permissions: bool,

    /// Name prefix of the temporary bind-mount directory
    pub bind_dir_prefix: String,
}

/// Overlay engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OverlayConfig {
    /// Attribute and entry validity window (ms)
    pub attr_ttl_ms: u64,

    /// Largest size a staged file may grow to (bytes)
    pub max_file_size: u64,
}

/// Debounced notifier configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifierConfig {
    /// Quiet window after the last write before notifying (ms)
    pub quiet_window_ms: u64,
}

/// Inspection hook configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct InspectorConfig {
    /// External inspection program; every file is approved when unset
    pub command: Option<PathBuf>,

    /// Extra arguments for the inspection program
    pub args: Vec<String>,
}

impl Default for MountConfig {
    fn default() -> Self {
        MountConfig {
            fs_name: "quarantinefs".to_string(),
            allow_other: true,
            allow_non_empty: false,
            default_permissions: true,
            bind_dir_prefix: "quarantinefs-".to_string(),
        }
    }
}

impl Default for OverlayConfig {
    fn default() -> Self {
        OverlayConfig {
            attr_ttl_ms: DEFAULT_ATTR_TTL_MS,
            max_file_size: DEFAULT_MAX_FILE_SIZE,
        }
    }
}

impl Default for NotifierConfig {
    fn default() -> Self {
        NotifierConfig {
            quiet_window_ms: DEFAULT_QUIET_WINDOW_MS,
        }
    }
}

impl OverlayConfig {
    pub fn attr_ttl(&self) -> Duration {
        Duration::from_millis(self.attr_ttl_ms)
    }
}

impl NotifierConfig {
    pub fn quiet_window(&self) -> Duration {
        Duration::from_millis(self.quiet_window_ms)
    }
}

impl Config {
    /// Load configuration from a file, with environment variable overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| Error::Config(format!("Failed to read config file: {}", e)))?;

        let mut config: Config = serde_json::from_str(&content)
            .map_err(|e| Error::Config(format!("Failed to parse config file: {}", e)))?;

        config.apply_env_overrides();

        config.validate()?;
        Ok(config)
    }

    /// Load the file if it exists, otherwise start from defaults
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self> {
        if path.as_ref().exists() {
            return Self::load(path);
        }

        let mut config = Config::default();
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Apply environment variable overrides to configuration
    pub fn apply_env_overrides(&mut self) {
        if let Ok(window) = std::env::var("QUARANTINEFS_QUIET_WINDOW_MS") {
            if let Ok(ms) = window.trim().parse::<u64>() {
                self.notifier.quiet_window_ms = ms;
            }
        }

        if let Ok(ttl) = std::env::var("QUARANTINEFS_ATTR_TTL_MS") {
            if let Ok(ms) = ttl.trim().parse::<u64>() {
                self.overlay.attr_ttl_ms = ms;
            }
        }

        if let Ok(command) = std::env::var("QUARANTINEFS_INSPECTOR") {
            let command = command.trim();
            if !command.is_empty() {
                self.inspector.command = Some(PathBuf::from(command));
            }
        }
    }

    /// Save configuration to a file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path.as_ref(), content)
            .map_err(|e| Error::Config(format!("Failed to write config file: {}", e)))?;

        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.notifier.quiet_window_ms == 0 {
            return Err(Error::InvalidConfig(
                "Notifier quiet window must be greater than 0".to_string(),
            ));
        }

        if self.overlay.max_file_size == 0 {
            return Err(Error::InvalidConfig(
                "Maximum file size must be greater than 0".to_string(),
            ));
        }

        if self.mount.fs_name.trim().is_empty() {
            return Err(Error::InvalidConfig(
                "Filesystem name must not be empty".to_string(),
            ));
        }

        if self.mount.bind_dir_prefix.contains('/') {
            return Err(Error::InvalidConfig(
                "Bind directory prefix must not contain '/'".to_string(),
            ));
        }

        Ok(())
    }
}

//! Daemon configuration

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use pivot_core::SlotCatalog;

use crate::error::{DaemonError, Result};

/// Which attached tokens the agent talks to
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceSelector {
    /// The first token that opens and reports a serial
    #[default]
    First,
    /// The token with this serial number
    Serial(u32),
    /// Every attached token
    All,
}

/// When to close sessions between operations
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReleasePolicy {
    /// Only when the token keeps its PIN cache after the session closes
    #[default]
    Auto,
    /// After every operation
    Always,
    /// Keep sessions open until hang-up or failure
    Never,
}

/// Daemon configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Agent socket path (named pipe name on Windows)
    pub socket_path: PathBuf,

    /// Slots exposed over the agent protocol
    pub slots: SlotCatalog,

    /// Token selection
    pub device: DeviceSelector,

    /// Delay before the touch notification is shown (milliseconds)
    pub touch_grace_ms: u64,

    /// Program speaking the pinentry protocol
    pub pinentry_program: String,

    /// Command used to show notifications, the message is appended
    pub notify_command: Option<Vec<String>>,

    /// Opportunistic session release
    pub release: ReleasePolicy,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            socket_path: Self::default_socket_path(),
            slots: SlotCatalog::default(),
            device: DeviceSelector::default(),
            touch_grace_ms: 3000,
            pinentry_program: "pinentry".to_string(),
            notify_command: Self::default_notify_command(),
            release: ReleasePolicy::default(),
        }
    }
}

impl DaemonConfig {
    /// Platform-appropriate default socket path
    #[cfg(unix)]
    fn default_socket_path() -> PathBuf {
        // Use XDG_RUNTIME_DIR if available, fallback to /tmp
        dirs::runtime_dir()
            .map(|dir| dir.join("pivot-agent.sock"))
            .unwrap_or_else(|| PathBuf::from("/tmp/pivot-agent.sock"))
    }

    #[cfg(windows)]
    fn default_socket_path() -> PathBuf {
        PathBuf::from(r"\\.\pipe\pivot-agent")
    }

    #[cfg(target_os = "linux")]
    fn default_notify_command() -> Option<Vec<String>> {
        Some(
            ["notify-send", "--wait", "-i", "dialog-password", "pivot-agent"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        )
    }

    #[cfg(not(target_os = "linux"))]
    fn default_notify_command() -> Option<Vec<String>> {
        None
    }

    /// Default location of the configuration file
    pub fn default_path() -> PathBuf {
        #[cfg(unix)]
        let fallback = PathBuf::from("/etc");
        #[cfg(windows)]
        let fallback = PathBuf::from(r"C:\ProgramData");

        dirs::config_dir()
            .unwrap_or(fallback)
            .join("pivot")
            .join("agent.json")
    }

    /// Grace period of the touch watchdog
    pub fn touch_grace(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.touch_grace_ms)
    }

    /// Load configuration from file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load the file at `path`, writing the defaults there first if it is missing
    pub fn load_or_create(path: &Path) -> Result<Self> {
        if path.exists() {
            return Self::load(path);
        }

        let config = Self::default();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        config.save(path)?;
        tracing::info!("Created default config at {:?}", path);
        Ok(config)
    }

    /// Save configuration to file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Reject values that cannot work at runtime
    pub fn validate(&self) -> Result<()> {
        if self.pinentry_program.trim().is_empty() {
            return Err(DaemonError::Config(
                "pinentry_program must not be empty".to_string(),
            ));
        }
        if let Some(argv) = &self.notify_command {
            if argv.is_empty() {
                return Err(DaemonError::Config(
                    "notify_command must name a program".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Create directories if they don't exist
    pub fn ensure_directories(&self) -> Result<()> {
        // Windows named pipes don't use filesystem paths
        #[cfg(unix)]
        {
            if let Some(parent) = self.socket_path.parent() {
                std::fs::create_dir_all(parent)?;
            }
        }

        Ok(())
    }
}

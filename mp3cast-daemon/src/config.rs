//! Configuration management

use anyhow::{Context, Result};
use mp3cast_server::{ServerConfig, StreamFormat};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Where the encoded stream comes from
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    /// MP3 file to stream; unset or "-" reads stdin
    pub input: Option<PathBuf>,

    /// Bytes per submitted buffer
    pub chunk_bytes: usize,

    /// Restart file input from the top at EOF
    pub loop_input: bool,

    /// Submit at the nominal bitrate instead of as fast as the backlog allows
    pub realtime: bool,

    /// Wait after an `Overflow` before retrying (ms)
    pub overflow_backoff_ms: u64,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            input: None,
            // ~256 ms at 128 kbit/s
            chunk_bytes: 4096,
            loop_input: false,
            realtime: true,
            overflow_backoff_ms: 20,
        }
    }
}

/// Unix control socket
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    pub enabled: bool,

    /// Socket path (None = $XDG_RUNTIME_DIR/mp3cast.sock)
    pub socket_path: Option<PathBuf>,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            socket_path: None,
        }
    }
}

/// Daemon configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Path to configuration file
    #[serde(skip)]
    pub config_path: PathBuf,

    /// Title announced in ICY metadata at startup
    pub stream_title: Option<String>,

    /// Listener, client and backlog settings
    pub server: ServerConfig,

    /// Audio parameters advertised to clients
    pub format: StreamFormat,

    pub source: SourceConfig,

    pub control: ControlConfig,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            config_path: Self::default_config_path(),
            stream_title: None,
            server: ServerConfig::default(),
            format: StreamFormat::default(),
            source: SourceConfig::default(),
            control: ControlConfig::default(),
        }
    }
}

impl DaemonConfig {
    /// Load configuration from the default location, or create it
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::default_config_path())
    }

    /// Load configuration from `config_path`, writing defaults there if the
    /// file does not exist yet
    pub fn load_from(config_path: &Path) -> Result<Self> {
        if config_path.exists() {
            let contents = std::fs::read_to_string(config_path)
                .context("Failed to read config file")?;

            let mut config: DaemonConfig =
                toml::from_str(&contents).context("Failed to parse config file")?;

            config.config_path = config_path.to_path_buf();
            Ok(config)
        } else {
            let config = Self {
                config_path: config_path.to_path_buf(),
                ..Self::default()
            };
            config.save().context("Failed to save default config")?;
            Ok(config)
        }
    }

    /// Save configuration to file
    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.config_path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create config directory")?;
        }

        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;

        std::fs::write(&self.config_path, contents).context("Failed to write config file")?;

        Ok(())
    }

    /// Check everything the processor and source will rely on
    pub fn validate(&self) -> Result<()> {
        self.server.validate().context("Invalid [server] section")?;
        if self.source.chunk_bytes == 0 {
            anyhow::bail!("source.chunk_bytes must be > 0");
        }
        if self.format.bitrate == 0 {
            anyhow::bail!("format.bitrate must be > 0");
        }
        Ok(())
    }

    /// Get default config path
    pub fn default_config_path() -> PathBuf {
        let config_dir = if cfg!(target_os = "macos") {
            dirs::config_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("com.mp3cast.daemon")
        } else {
            dirs::config_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("mp3cast")
        };

        config_dir.join("config.toml")
    }
}

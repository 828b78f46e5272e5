use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use super::platform;
use super::protocol::PlaybackContext;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub socket: SocketConfig,
    #[serde(default)]
    pub player: PlayerConfig,
    #[serde(default)]
    pub scrobble: ScrobbleConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    #[serde(default)]
    pub pid_file: PathBuf,
    #[serde(default)]
    pub state_file: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SocketConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayerConfig {
    #[serde(default = "default_volume")]
    pub default_volume: f32,
    /// Frame-update rate while audio is active, in Hz.
    #[serde(default = "default_refresh_rate_hz")]
    pub refresh_rate_hz: u32,
    /// Relative seek step for transport seek-forward/backward, in seconds.
    #[serde(default = "default_skip_time_secs")]
    pub skip_time_secs: f64,
    /// Execution surface outbound events are tagged with.
    #[serde(default)]
    pub context: PlaybackContext,
}

/// Last.fm-style audioscrobbler credentials.  Disabled until filled in.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScrobbleConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub api_secret: String,
    #[serde(default)]
    pub session_key: String,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            pid_file: default_pid_file(),
            state_file: default_state_file(),
        }
    }
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_port(),
        }
    }
}

impl Default for PlayerConfig {
    fn default() -> Self {
        Self {
            default_volume: default_volume(),
            refresh_rate_hz: default_refresh_rate_hz(),
            skip_time_secs: default_skip_time_secs(),
            context: PlaybackContext::default(),
        }
    }
}

fn default_pid_file() -> PathBuf {
    platform::data_dir().join("daemon.pid")
}

fn default_state_file() -> PathBuf {
    platform::data_dir().join("state.json")
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    platform::DAEMON_TCP_PORT
}

fn default_volume() -> f32 {
    0.5
}

fn default_refresh_rate_hz() -> u32 {
    10
}

fn default_skip_time_secs() -> f64 {
    15.0
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        let config_path = Self::config_path();

        if !config_path.exists() {
            let config = Self::default();
            config.save()?;
            return Ok(config);
        }

        let content = std::fs::read_to_string(&config_path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let config_path = Self::config_path();
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(&config_path, content)?;
        Ok(())
    }

    pub fn config_path() -> PathBuf {
        platform::config_dir().join("config.toml")
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            daemon: DaemonConfig::default(),
            socket: SocketConfig::default(),
            player: PlayerConfig::default(),
            scrobble: ScrobbleConfig::default(),
        }
    }
}

//! Configuration management

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use serde::Deserialize;

use crate::bus::ReconnectPolicy;
use crate::volume::VolumeCurve;

/// Directory name under the platform config root
const CONFIG_SUBDIR_NAME: &str = "audio-hub";

/// Prefix for environment overrides (AUDIO_HUB_PORT, AUDIO_HUB_VOLUME__MIN, ...)
const ENV_PREFIX: &str = "AUDIO_HUB";

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "default_port")]
    pub port: u16,

    /// Holds `switch-to-<id>.sh` and optional `stop-<id>.sh` scripts
    #[serde(default = "default_scripts_dir")]
    pub scripts_dir: String,

    #[serde(default = "default_true")]
    pub use_sudo: bool,

    /// Script-backed sources, in registration order
    #[serde(default = "default_sources")]
    pub sources: Vec<String>,

    #[serde(default)]
    pub timeouts: TimeoutConfig,

    #[serde(default)]
    pub broadcast: BroadcastConfig,

    #[serde(default)]
    pub reconnect: ReconnectConfig,

    #[serde(default)]
    pub bluetooth: BluetoothConfig,

    #[serde(default)]
    pub spotify: SpotifyConfig,

    #[serde(default)]
    pub snapcast: SnapcastConfig,

    #[serde(default)]
    pub volume: VolumeConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: default_port(),
            scripts_dir: default_scripts_dir(),
            use_sudo: true,
            sources: default_sources(),
            timeouts: TimeoutConfig::default(),
            broadcast: BroadcastConfig::default(),
            reconnect: ReconnectConfig::default(),
            bluetooth: BluetoothConfig::default(),
            spotify: SpotifyConfig::default(),
            snapcast: SnapcastConfig::default(),
            volume: VolumeConfig::default(),
        }
    }
}

impl Config {
    /// `scripts_dir` with a leading `~` expanded
    pub fn scripts_path(&self) -> PathBuf {
        expand_home(&self.scripts_dir)
    }
}

fn default_port() -> u16 {
    8000
}

fn default_true() -> bool {
    true
}

fn default_scripts_dir() -> String {
    "~/audio-hub/scripts".to_string()
}

fn default_sources() -> Vec<String> {
    ["spotify", "bluetooth", "macos", "snapcast"]
        .into_iter()
        .map(String::from)
        .collect()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Budget for one activate/deactivate script run
    pub activation_secs: u64,
    /// Budget for daemon status calls
    pub status_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            activation_secs: 30,
            status_secs: 5,
        }
    }
}

impl TimeoutConfig {
    pub fn activation(&self) -> Duration {
        Duration::from_secs(self.activation_secs)
    }

    pub fn status(&self) -> Duration {
        Duration::from_secs(self.status_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BroadcastConfig {
    pub liveness_interval_secs: u64,
    /// Outbound queue depth per connected client
    pub observer_buffer: usize,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            liveness_interval_secs: 30,
            observer_buffer: 64,
        }
    }
}

impl BroadcastConfig {
    pub fn liveness_interval(&self) -> Duration {
        Duration::from_secs(self.liveness_interval_secs.max(1))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub multiplier: f64,
    pub max_delay_ms: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            initial_delay_ms: 1000,
            multiplier: 1.5,
            max_delay_ms: 30_000,
        }
    }
}

impl ReconnectConfig {
    pub fn policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            max_attempts: self.max_attempts,
            initial_delay: Duration::from_millis(self.initial_delay_ms),
            multiplier: self.multiplier,
            max_delay: Duration::from_millis(self.max_delay_ms),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BluetoothConfig {
    pub enabled: bool,
    pub source_id: String,
    pub watch_interval_secs: u64,
}

impl Default for BluetoothConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            source_id: "bluetooth".to_string(),
            watch_interval_secs: 2,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SpotifyConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    pub poll_interval_secs: u64,
    pub source_id: String,
}

impl Default for SpotifyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: "localhost".to_string(),
            port: 3678,
            poll_interval_secs: 2,
            source_id: "spotify".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SnapcastConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
}

impl Default for SnapcastConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: "localhost".to_string(),
            port: 1780,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct VolumeConfig {
    /// Hardware level shown as display 0
    pub min: i32,
    /// Hardware level shown as display 100
    pub max: i32,
    /// Display units per adjust step
    pub step: i32,
    pub ramp_steps: u32,
    pub ramp_interval_ms: u64,
    pub mixer_control: String,
    /// Drive the ALSA mixer instead of the in-memory one
    pub hardware: bool,
}

impl Default for VolumeConfig {
    fn default() -> Self {
        Self {
            min: 40,
            max: 98,
            step: 5,
            ramp_steps: 3,
            ramp_interval_ms: 50,
            mixer_control: "Digital".to_string(),
            hardware: false,
        }
    }
}

impl VolumeConfig {
    pub fn curve(&self) -> VolumeCurve {
        VolumeCurve::new(self.min, self.max)
    }

    pub fn ramp_interval(&self) -> Duration {
        Duration::from_millis(self.ramp_interval_ms)
    }
}

/// Expand a leading `~/` using HOME
fn expand_home(path: &str) -> PathBuf {
    match (path.strip_prefix("~/"), std::env::var("HOME")) {
        (Some(rest), Ok(home)) => PathBuf::from(home).join(rest),
        _ => PathBuf::from(path),
    }
}

/// Get config directory (AUDIO_HUB_CONFIG_DIR, XDG_CONFIG_HOME or ~/.config)
pub fn get_config_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("AUDIO_HUB_CONFIG_DIR") {
        return PathBuf::from(dir);
    }
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join(CONFIG_SUBDIR_NAME);
    }
    if let Ok(home) = std::env::var("HOME") {
        return PathBuf::from(home).join(".config").join(CONFIG_SUBDIR_NAME);
    }

    // Fallback to current directory
    PathBuf::from(".")
}

pub fn load_config() -> Result<Config> {
    let config_dir = get_config_dir();

    let mut builder = ::config::Config::builder()
        // Load from config file if it exists (config.toml, config.json, ...)
        .add_source(
            ::config::File::with_name(&config_dir.join("config").to_string_lossy()).required(false),
        )
        // Override with environment variables (AUDIO_HUB_PORT, AUDIO_HUB_VOLUME__MIN, etc.)
        .add_source(
            ::config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("sources")
                .try_parsing(true),
        );

    // Explicit precedence for the port: AUDIO_HUB_PORT > PORT > config > default.
    // Unparsable values are ignored rather than failing startup.
    let port_var = std::env::var("AUDIO_HUB_PORT").or_else(|_| std::env::var("PORT"));
    if let Ok(port) = port_var {
        match port.parse::<u16>() {
            Ok(port_num) => builder = builder.set_override("port", port_num as i64)?,
            Err(_) => {
                tracing::warn!("Ignoring invalid port {:?}", port);
                builder = builder.set_override("port", default_port() as i64)?;
            }
        }
    }

    let config = builder.build()?;

    Ok(config.try_deserialize()?)
}

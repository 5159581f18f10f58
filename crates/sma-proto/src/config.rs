use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use super::platform;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub bus: BusConfig,
    #[serde(default)]
    pub channels: ChannelsConfig,
    #[serde(default)]
    pub compose: ComposeConfig,
    #[serde(default)]
    pub poll: PollConfig,
    #[serde(default)]
    pub dac: DacConfig,
    #[serde(default)]
    pub mixer: MixerConfig,
    #[serde(default)]
    pub backup: BackupConfig,
    #[serde(default)]
    pub calls: CallsConfig,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    #[serde(default = "default_discovery_prefix")]
    pub discovery_prefix: String,
    /// Overrides the MAC-derived node id.
    #[serde(default)]
    pub node_id: Option<String>,
    /// Automation hub birth topic; "online" there triggers a full republish.
    #[serde(default = "default_presence_topic")]
    pub presence_topic: String,
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,
    #[serde(default = "default_reconnect_backoff_secs")]
    pub reconnect_backoff_secs: u64,
    /// How long to wait for the broker to acknowledge a new connection.
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelsConfig {
    #[serde(default = "default_channel_count")]
    pub count: u8,
    /// Directory with the `squeeze<N>.name` files written by the players.
    #[serde(default = "default_name_dir")]
    pub name_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComposeConfig {
    /// The compose `.env` file, which doubles as the persisted settings store.
    #[serde(default = "default_env_file")]
    pub env_file: PathBuf,
    #[serde(default = "default_profile")]
    pub profile: String,
    #[serde(default = "default_watched_services")]
    pub watched_services: Vec<WatchedService>,
}

/// A service whose image version is tracked against its registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchedService {
    /// Name used in the update entity (`update_<logical>`).
    pub logical: String,
    /// Compose service the image is resolved from.
    pub service: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollConfig {
    #[serde(default = "default_container_state_secs")]
    pub container_state_secs: u64,
    #[serde(default = "default_player_name_secs")]
    pub player_name_secs: u64,
    #[serde(default = "default_registry_secs")]
    pub registry_secs: u64,
    #[serde(default = "default_dac_secs")]
    pub dac_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DacConfig {
    /// USB `vendor:product` of the DACs.
    #[serde(default = "default_dac_usb_id")]
    pub usb_id: String,
    #[serde(default = "default_dac_expected")]
    pub expected: usize,
    /// USB `vendor:product` of the hub the DACs hang off.
    #[serde(default = "default_hub_usb_id")]
    pub hub_usb_id: String,
    #[serde(default = "default_settle_secs")]
    pub settle_secs: u64,
    /// Used when `PSU_POWER_ON_DELAY` is not set.
    #[serde(default = "default_power_on_delay_secs")]
    pub power_on_delay_secs: u64,
}

/// ALSA naming; `{channel}` is replaced by the channel number.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MixerConfig {
    #[serde(default = "default_volume_card")]
    pub volume_card: String,
    #[serde(default = "default_volume_control")]
    pub volume_control: String,
    #[serde(default = "default_equalizer_device")]
    pub equalizer_device: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupConfig {
    #[serde(default = "default_backup_paths")]
    pub paths: Vec<PathBuf>,
    #[serde(default = "default_staging_dir")]
    pub staging_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallsConfig {
    /// Upper bound for every process invocation and HTTP call.
    #[serde(default = "default_call_timeout_secs")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LogConfig {
    /// Extra log file next to stdout.
    #[serde(default)]
    pub file: Option<PathBuf>,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            discovery_prefix: default_discovery_prefix(),
            node_id: None,
            presence_topic: default_presence_topic(),
            keep_alive_secs: default_keep_alive_secs(),
            reconnect_backoff_secs: default_reconnect_backoff_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

impl Default for ChannelsConfig {
    fn default() -> Self {
        Self {
            count: default_channel_count(),
            name_dir: default_name_dir(),
        }
    }
}

impl Default for ComposeConfig {
    fn default() -> Self {
        Self {
            env_file: default_env_file(),
            profile: default_profile(),
            watched_services: default_watched_services(),
        }
    }
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            container_state_secs: default_container_state_secs(),
            player_name_secs: default_player_name_secs(),
            registry_secs: default_registry_secs(),
            dac_secs: default_dac_secs(),
        }
    }
}

impl Default for DacConfig {
    fn default() -> Self {
        Self {
            usb_id: default_dac_usb_id(),
            expected: default_dac_expected(),
            hub_usb_id: default_hub_usb_id(),
            settle_secs: default_settle_secs(),
            power_on_delay_secs: default_power_on_delay_secs(),
        }
    }
}

impl Default for MixerConfig {
    fn default() -> Self {
        Self {
            volume_card: default_volume_card(),
            volume_control: default_volume_control(),
            equalizer_device: default_equalizer_device(),
        }
    }
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            paths: default_backup_paths(),
            staging_dir: default_staging_dir(),
        }
    }
}

impl Default for CallsConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_call_timeout_secs(),
        }
    }
}

fn default_discovery_prefix() -> String {
    "homeassistant".to_string()
}

fn default_presence_topic() -> String {
    "homeassistant/status".to_string()
}

fn default_keep_alive_secs() -> u64 {
    30
}

fn default_reconnect_backoff_secs() -> u64 {
    5
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_channel_count() -> u8 {
    8
}

fn default_name_dir() -> PathBuf {
    PathBuf::from("/etc/opt/squeezelite")
}

fn default_env_file() -> PathBuf {
    PathBuf::from("/etc/opt/compose/.env")
}

fn default_profile() -> String {
    "on".to_string()
}

fn default_watched_services() -> Vec<WatchedService> {
    vec![
        WatchedService {
            logical: "supervisor".to_string(),
            service: "supervisor".to_string(),
        },
        WatchedService {
            logical: "squeezelite".to_string(),
            service: "squeezelite_tpl".to_string(),
        },
    ]
}

fn default_container_state_secs() -> u64 {
    1
}

fn default_player_name_secs() -> u64 {
    1
}

fn default_registry_secs() -> u64 {
    6 * 60 * 60
}

fn default_dac_secs() -> u64 {
    60
}

fn default_dac_usb_id() -> String {
    "0d8c:0102".to_string()
}

fn default_dac_expected() -> usize {
    2
}

fn default_hub_usb_id() -> String {
    "1a40:0201".to_string()
}

fn default_settle_secs() -> u64 {
    5
}

fn default_power_on_delay_secs() -> u64 {
    2
}

fn default_volume_card() -> String {
    "ch{channel}".to_string()
}

fn default_volume_control() -> String {
    "PCM".to_string()
}

fn default_equalizer_device() -> String {
    "ch{channel}_equal".to_string()
}

fn default_backup_paths() -> Vec<PathBuf> {
    vec![
        PathBuf::from("/etc/opt/compose"),
        PathBuf::from("/etc/opt/squeezelite"),
        PathBuf::from("/var/lib/alsa"),
    ]
}

fn default_staging_dir() -> PathBuf {
    std::env::temp_dir()
}

fn default_call_timeout_secs() -> u64 {
    30
}

impl Config {
    /// Load from `path` (or the default location), writing defaults when
    /// the file does not exist yet.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let config_path = path
            .map(Path::to_path_buf)
            .unwrap_or_else(Self::config_path);

        if !config_path.exists() {
            let config = Self::default();
            config.save(&config_path)?;
            return Ok(config);
        }

        let content = std::fs::read_to_string(&config_path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn save(&self, config_path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(config_path, content)?;
        Ok(())
    }

    pub fn config_path() -> PathBuf {
        platform::config_dir().join("config.toml")
    }
}

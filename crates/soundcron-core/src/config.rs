use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 27;
pub const DEFAULT_LOOKAHEAD_SECS: u64 = 60;
pub const DEFAULT_OCCURRENCES_PER_REFRESH: usize = 5;
pub const DEFAULT_MAX_GUILD_STORAGE_BYTES: i64 = 10 * 1024 * 1024; // 10 MB per guild
pub const DEFAULT_PRELOAD_MARGIN_SECS: u64 = 5;
pub const DEFAULT_SEND_TIMEOUT_SECS: u64 = 60;
pub const DEFAULT_FRAME_BUFFER: usize = 64;
pub const DEFAULT_DRAIN_TIMEOUT_SECS: u64 = 30;
/// Long enough to outlive any occurrence already sitting in the work queue.
pub const DEFAULT_BLACKLIST_TTL_SECS: u64 = 24 * 60 * 60;

pub const DEFAULT_STREAM: &str = "soundcron_jobs";
pub const DEFAULT_GROUP: &str = "soundcron_streaming_group";

/// Top-level config (soundcron.toml + SOUNDCRON_* env overrides).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SoundCronConfig {
    #[serde(default)]
    pub discord: DiscordConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub redis: RedisConfig,
    #[serde(default)]
    pub blob: BlobConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub blacklist: BlacklistConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiscordConfig {
    /// Required by `bot` and `worker`; the dev CLI commands run without it.
    pub bot_token: Option<String>,
    /// Guild the bot was set up for. Informational only.
    pub guild_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    #[serde(default = "default_redis_url")]
    pub url: String,
    #[serde(default = "default_stream")]
    pub stream: String,
    #[serde(default = "default_group")]
    pub group: String,
    /// Max messages fetched per XREADGROUP call.
    #[serde(default = "default_read_count")]
    pub read_count: usize,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
            stream: default_stream(),
            group: default_group(),
            read_count: default_read_count(),
        }
    }
}

/// Where encoded audio lives. Payloads are fetched from `{base_url}/{soundcron_id}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlobConfig {
    #[serde(default = "default_blob_base_url")]
    pub base_url: String,
}

impl Default for BlobConfig {
    fn default() -> Self {
        Self {
            base_url: default_blob_base_url(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    /// How far ahead of "now" a poll cycle claims occurrences.
    #[serde(default = "default_lookahead_secs")]
    pub lookahead_secs: u64,
    /// Size of the occurrence batch inserted on save and on every refresh.
    #[serde(default = "default_occurrences_per_refresh")]
    pub occurrences_per_refresh: usize,
    #[serde(default = "default_max_guild_storage_bytes")]
    pub max_guild_storage_bytes: i64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: DEFAULT_POLL_INTERVAL_SECS,
            lookahead_secs: DEFAULT_LOOKAHEAD_SECS,
            occurrences_per_refresh: DEFAULT_OCCURRENCES_PER_REFRESH,
            max_guild_storage_bytes: DEFAULT_MAX_GUILD_STORAGE_BYTES,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Consumer name inside the consumer group. Defaults to the host name.
    pub consumer: Option<String>,
    #[serde(default = "default_preload_margin_secs")]
    pub preload_margin_secs: u64,
    /// Max wait for the voice transport to accept a single frame.
    #[serde(default = "default_send_timeout_secs")]
    pub send_timeout_secs: u64,
    /// Capacity of the outbound frame channel.
    #[serde(default = "default_frame_buffer")]
    pub frame_buffer: usize,
    /// Max wait for queued frames to finish playing before leaving the channel.
    #[serde(default = "default_drain_timeout_secs")]
    pub drain_timeout_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            consumer: None,
            preload_margin_secs: DEFAULT_PRELOAD_MARGIN_SECS,
            send_timeout_secs: DEFAULT_SEND_TIMEOUT_SECS,
            frame_buffer: DEFAULT_FRAME_BUFFER,
            drain_timeout_secs: DEFAULT_DRAIN_TIMEOUT_SECS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlacklistConfig {
    #[serde(default = "default_blacklist_ttl_secs")]
    pub ttl_secs: u64,
}

impl Default for BlacklistConfig {
    fn default() -> Self {
        Self {
            ttl_secs: DEFAULT_BLACKLIST_TTL_SECS,
        }
    }
}

fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.soundcron/soundcron.db", home)
}
fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}
fn default_stream() -> String {
    DEFAULT_STREAM.to_string()
}
fn default_group() -> String {
    DEFAULT_GROUP.to_string()
}
fn default_read_count() -> usize {
    100
}
fn default_blob_base_url() -> String {
    "http://127.0.0.1:9000/soundoff/sound-off/dca".to_string()
}
fn default_poll_interval_secs() -> u64 {
    DEFAULT_POLL_INTERVAL_SECS
}
fn default_lookahead_secs() -> u64 {
    DEFAULT_LOOKAHEAD_SECS
}
fn default_occurrences_per_refresh() -> usize {
    DEFAULT_OCCURRENCES_PER_REFRESH
}
fn default_max_guild_storage_bytes() -> i64 {
    DEFAULT_MAX_GUILD_STORAGE_BYTES
}
fn default_preload_margin_secs() -> u64 {
    DEFAULT_PRELOAD_MARGIN_SECS
}
fn default_send_timeout_secs() -> u64 {
    DEFAULT_SEND_TIMEOUT_SECS
}
fn default_frame_buffer() -> usize {
    DEFAULT_FRAME_BUFFER
}
fn default_drain_timeout_secs() -> u64 {
    DEFAULT_DRAIN_TIMEOUT_SECS
}
fn default_blacklist_ttl_secs() -> u64 {
    DEFAULT_BLACKLIST_TTL_SECS
}

impl SoundCronConfig {
    /// Load config from a TOML file with SOUNDCRON_* env var overrides.
    ///
    /// Checks in order:
    ///   1. Explicit path argument
    ///   2. ~/.soundcron/soundcron.toml
    ///
    /// Nested keys use a double underscore, e.g. `SOUNDCRON_DISCORD__BOT_TOKEN`.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        Self::from_figment(
            Figment::new()
                .merge(Toml::file(&path))
                .merge(Env::prefixed("SOUNDCRON_").split("__")),
        )
    }

    pub fn from_figment(figment: Figment) -> crate::error::Result<Self> {
        figment
            .extract()
            .map_err(|e| crate::error::CoreError::Config(e.to_string()))
    }

    /// The bot token, or a config error naming the missing key.
    pub fn require_bot_token(&self) -> crate::error::Result<&str> {
        self.discord.bot_token.as_deref().ok_or_else(|| {
            crate::error::CoreError::Config(
                "discord.bot_token is required (SOUNDCRON_DISCORD__BOT_TOKEN)".to_string(),
            )
        })
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.soundcron/soundcron.toml", home)
}

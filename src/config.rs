use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KillfeedConfig {
    /// Id of the guild whose kill/death events are tracked.
    pub guild_id: String,

    /// Display name used in log lines and report footers.
    #[serde(default)]
    pub guild_name: String,

    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,

    #[serde(default = "default_render_base_url")]
    pub render_base_url: String,

    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,

    /// Events older than this are acknowledged but never rendered.
    #[serde(default = "default_max_event_age_secs")]
    pub max_event_age_secs: i64,

    #[serde(default = "default_guild_page_limit")]
    pub guild_page_limit: u32,

    #[serde(default = "default_member_feed_limit")]
    pub member_feed_limit: u32,

    #[serde(default = "default_member_refresh_secs")]
    pub member_refresh_secs: u64,

    /// Static member-id list. When set, the remote member listing is never queried.
    #[serde(default)]
    pub static_members: Option<Vec<String>>,

    #[serde(default = "default_feed_workers")]
    pub feed_workers: usize,

    #[serde(default = "default_icon_workers")]
    pub icon_workers: usize,

    #[serde(default = "default_icon_memory_capacity")]
    pub icon_memory_capacity: usize,

    #[serde(default = "default_seen_capacity")]
    pub seen_capacity: usize,

    #[serde(default = "default_retry_max_attempts")]
    pub retry_max_attempts: u32,

    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,

    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,

    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    #[serde(default = "default_state_path")]
    pub state_path: String,

    #[serde(default = "default_icon_cache_dir")]
    pub icon_cache_dir: String,

    #[serde(default = "default_output_dir")]
    pub output_dir: String,

    #[serde(default = "default_log_dir")]
    pub log_dir: String,

    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default = "default_icon_size")]
    pub icon_size: u32,

    #[serde(default = "default_top_contributors")]
    pub top_contributors: usize,
}

fn default_api_base_url() -> String {
    "https://gameinfo.albiononline.com/api/gameinfo".to_string()
}

fn default_render_base_url() -> String {
    "https://render.albiononline.com".to_string()
}

fn default_poll_interval_secs() -> u64 {
    60
}

fn default_max_event_age_secs() -> i64 {
    3600
}

fn default_guild_page_limit() -> u32 {
    51
}

fn default_member_feed_limit() -> u32 {
    10
}

fn default_member_refresh_secs() -> u64 {
    1800
}

fn default_feed_workers() -> usize {
    5
}

fn default_icon_workers() -> usize {
    8
}

fn default_icon_memory_capacity() -> usize {
    256
}

fn default_seen_capacity() -> usize {
    600
}

fn default_retry_max_attempts() -> u32 {
    3
}

fn default_retry_base_delay_ms() -> u64 {
    500
}

fn default_retry_max_delay_ms() -> u64 {
    8000
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_state_path() -> String {
    "data/killfeed_state.json".to_string()
}

fn default_icon_cache_dir() -> String {
    "data/icon_cache".to_string()
}

fn default_output_dir() -> String {
    "data/outbox".to_string()
}

fn default_log_dir() -> String {
    "logs".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_icon_size() -> u32 {
    80
}

fn default_top_contributors() -> usize {
    5
}

impl Default for KillfeedConfig {
    fn default() -> Self {
        Self {
            guild_id: String::new(),
            guild_name: String::new(),
            api_base_url: default_api_base_url(),
            render_base_url: default_render_base_url(),
            poll_interval_secs: default_poll_interval_secs(),
            max_event_age_secs: default_max_event_age_secs(),
            guild_page_limit: default_guild_page_limit(),
            member_feed_limit: default_member_feed_limit(),
            member_refresh_secs: default_member_refresh_secs(),
            static_members: None,
            feed_workers: default_feed_workers(),
            icon_workers: default_icon_workers(),
            icon_memory_capacity: default_icon_memory_capacity(),
            seen_capacity: default_seen_capacity(),
            retry_max_attempts: default_retry_max_attempts(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
            request_timeout_secs: default_request_timeout_secs(),
            state_path: default_state_path(),
            icon_cache_dir: default_icon_cache_dir(),
            output_dir: default_output_dir(),
            log_dir: default_log_dir(),
            log_level: default_log_level(),
            icon_size: default_icon_size(),
            top_contributors: default_top_contributors(),
        }
    }
}

impl KillfeedConfig {
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: KillfeedConfig = toml::from_str(&content)?;
        Ok(config)
    }
}

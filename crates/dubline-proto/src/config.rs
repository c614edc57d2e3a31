use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::platform;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub player: PlayerConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub defaults: DefaultsConfig,
}

/// Timing and sizing knobs for the hydration engine.  These are fixed
/// constants at runtime; nothing here backs off or jitters.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EngineConfig {
    /// Maximum number of processed time updates per second.
    #[serde(default = "default_tick_rate_hz")]
    pub tick_rate_hz: u32,
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
    /// Upper bound on cached buckets; oldest-inserted is evicted first.
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: usize,
    /// Total span of one fetched window, in whole seconds.
    #[serde(default = "default_window_secs")]
    pub window_secs: u32,
    /// How much of the window lies before the playback position.
    #[serde(default = "default_lookback_secs")]
    pub lookback_secs: u32,
    /// Gap tolerance for showing the next line early.
    #[serde(default = "default_lookahead_secs")]
    pub lookahead_secs: f64,
    #[serde(default = "default_attach_attempts")]
    pub attach_attempts: u32,
    #[serde(default = "default_attach_interval_ms")]
    pub attach_interval_ms: u64,
    /// Delay before an Error session is reactivated on its own.
    #[serde(default = "default_recovery_delay_ms")]
    pub recovery_delay_ms: u64,
    /// Upper bound on one fetch-then-translate round trip.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

impl EngineConfig {
    pub fn min_tick_interval(&self) -> Duration {
        Duration::from_millis(1000 / u64::from(self.tick_rate_hz.max(1)))
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn lookforward_secs(&self) -> u32 {
        self.window_secs.saturating_sub(self.lookback_secs)
    }

    pub fn attach_interval(&self) -> Duration {
        Duration::from_millis(self.attach_interval_ms)
    }

    pub fn recovery_delay(&self) -> Duration {
        Duration::from_millis(self.recovery_delay_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tick_rate_hz: default_tick_rate_hz(),
            cache_ttl_secs: default_cache_ttl_secs(),
            cache_capacity: default_cache_capacity(),
            window_secs: default_window_secs(),
            lookback_secs: default_lookback_secs(),
            lookahead_secs: default_lookahead_secs(),
            attach_attempts: default_attach_attempts(),
            attach_interval_ms: default_attach_interval_ms(),
            recovery_delay_ms: default_recovery_delay_ms(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    #[serde(default = "default_backend_url")]
    pub base_url: String,
    /// Sent as a bearer token when present.
    #[serde(default)]
    pub api_key: Option<String>,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: default_backend_url(),
            api_key: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayerConfig {
    /// mpv `--input-ipc-server` path (named pipe name on Windows).
    #[serde(default = "default_mpv_socket")]
    pub mpv_socket: String,
    /// How long a caption stays on the OSD if nothing replaces it.
    #[serde(default = "default_osd_duration_ms")]
    pub osd_duration_ms: u64,
}

impl Default for PlayerConfig {
    fn default() -> Self {
        Self {
            mpv_socket: default_mpv_socket(),
            osd_duration_ms: default_osd_duration_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_http_enabled")]
    pub enabled: bool,
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            enabled: default_http_enabled(),
            bind_address: default_bind_address(),
            port: default_port(),
        }
    }
}

/// Settings applied when the daemon starts, before any client speaks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultsConfig {
    #[serde(default = "default_language")]
    pub language: String,
    #[serde(default)]
    pub hint: String,
    #[serde(default)]
    pub enable_on_start: bool,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            language: default_language(),
            hint: String::new(),
            enable_on_start: false,
        }
    }
}

fn default_tick_rate_hz() -> u32 {
    4
}

fn default_cache_ttl_secs() -> u64 {
    120
}

fn default_cache_capacity() -> usize {
    120
}

fn default_window_secs() -> u32 {
    6
}

fn default_lookback_secs() -> u32 {
    2
}

fn default_lookahead_secs() -> f64 {
    2.0
}

fn default_attach_attempts() -> u32 {
    20
}

fn default_attach_interval_ms() -> u64 {
    150
}

fn default_recovery_delay_ms() -> u64 {
    3000
}

fn default_request_timeout_ms() -> u64 {
    10_000
}

fn default_backend_url() -> String {
    "http://127.0.0.1:8790".to_string()
}

fn default_mpv_socket() -> String {
    platform::mpv_socket_name()
}

fn default_osd_duration_ms() -> u64 {
    5000
}

fn default_http_enabled() -> bool {
    true
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8991
}

fn default_language() -> String {
    "en".to_string()
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        let config_path = Self::config_path();

        if !config_path.exists() {
            let config = Self::default();
            config.save_to(&config_path)?;
            return Ok(config);
        }

        Self::load_from(&config_path)
    }

    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        self.save_to(&Self::config_path())
    }

    pub fn save_to(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn config_path() -> PathBuf {
        platform::config_dir().join("config.toml")
    }
}

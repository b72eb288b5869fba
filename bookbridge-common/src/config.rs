//! Configuration loading and data folder resolution
//!
//! Settings are bootstrapped from environment variables, then overridden by
//! values stored in the `settings` table at startup so that changes made
//! through the admin API survive restarts.

use crate::{Error, Result};
use std::path::PathBuf;
use std::time::Duration;

/// Poll mode for clients that support a dedicated poll worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollMode {
    /// Covered by the global sync tick
    Global,
    /// Dedicated poll worker at `poll_seconds` interval
    Custom,
}

impl PollMode {
    fn from_env(key: &str) -> Self {
        match std::env::var(key).unwrap_or_default().to_lowercase().as_str() {
            "custom" => PollMode::Custom,
            _ => PollMode::Global,
        }
    }
}

/// Runtime settings for the whole bridge
#[derive(Debug, Clone)]
pub struct Settings {
    pub data_dir: PathBuf,
    pub books_dir: PathBuf,
    pub primary_port: u16,
    pub kosync_port: u16,

    // Audiobook server
    pub abs_server_url: String,
    pub abs_key: String,
    pub abs_event_debounce: Duration,
    pub abs_progress_offset_seconds: f64,

    // Ebook position clients
    pub storyteller_url: String,
    pub storyteller_user: String,
    pub storyteller_password: String,
    pub storyteller_poll_mode: PollMode,
    pub storyteller_poll_seconds: u64,
    pub booklore_url: String,
    pub booklore_token: String,
    pub booklore_poll_mode: PollMode,
    pub booklore_poll_seconds: u64,
    pub hardcover_token: String,

    // Sync engine tuning
    pub sync_period: Duration,
    pub sync_workers: usize,
    pub delta_between_clients: f64,
    pub delta_abs_seconds: f64,
    pub delta_kosync_percent: f64,
    pub delta_kosync_words: u64,
    pub write_suppress_ttl: Duration,
    pub client_timeout: Duration,
    pub cycle_timeout: Duration,

    // Text matching
    pub fuzzy_threshold: u32,
    pub ebook_cache_size: usize,
    pub kosync_hash_method: String,
    /// Reject KoSync pushes that move a document backwards
    pub kosync_furthest_wins: bool,

    // Transcription jobs
    pub job_max_retries: u32,
    pub job_retry_delay: Duration,
    pub whisper_url: String,
    pub whisper_model: String,

    pub suggestions_enabled: bool,
}

fn env_str(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(v) => v.trim().parse().unwrap_or_else(|_| {
            tracing::warn!(key, value = %v, "Invalid value, using default");
            default
        }),
        Err(_) => default,
    }
}

impl Settings {
    /// Bootstrap settings from environment variables
    pub fn from_env(data_dir: PathBuf) -> Self {
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);

        Settings {
            books_dir: PathBuf::from(env_str("BOOKS_DIR", "/books")),
            primary_port: env_parse("PRIMARY_PORT", 8585),
            kosync_port: env_parse("KOSYNC_PORT", 8586),

            abs_server_url: env_str("ABS_SERVER_URL", "")
                .trim_end_matches('/')
                .to_string(),
            abs_key: env_str("ABS_KEY", ""),
            abs_event_debounce: Duration::from_secs(env_parse("ABS_EVENT_DEBOUNCE_SECONDS", 30)),
            abs_progress_offset_seconds: env_parse("ABS_PROGRESS_OFFSET_SECONDS", 0.0),

            storyteller_url: env_str("STORYTELLER_URL", "")
                .trim_end_matches('/')
                .to_string(),
            storyteller_user: env_str("STORYTELLER_USER", ""),
            storyteller_password: env_str("STORYTELLER_PASSWORD", ""),
            storyteller_poll_mode: PollMode::from_env("STORYTELLER_POLL_MODE"),
            storyteller_poll_seconds: env_parse("STORYTELLER_POLL_SECONDS", 300),
            booklore_url: env_str("BOOKLORE_URL", "").trim_end_matches('/').to_string(),
            booklore_token: env_str("BOOKLORE_TOKEN", ""),
            booklore_poll_mode: PollMode::from_env("BOOKLORE_POLL_MODE"),
            booklore_poll_seconds: env_parse("BOOKLORE_POLL_SECONDS", 300),
            hardcover_token: env_str("HARDCOVER_TOKEN", ""),

            sync_period: Duration::from_secs(env_parse("SYNC_PERIOD_MINS", 5u64) * 60),
            sync_workers: env_parse("SYNC_WORKERS", cores),
            delta_between_clients: env_parse("SYNC_DELTA_BETWEEN_CLIENTS_PERCENT", 0.5) / 100.0,
            delta_abs_seconds: env_parse("SYNC_DELTA_ABS_SECONDS", 60.0),
            delta_kosync_percent: env_parse("SYNC_DELTA_KOSYNC_PERCENT", 1.0) / 100.0,
            delta_kosync_words: env_parse("SYNC_DELTA_KOSYNC_WORDS", 400),
            write_suppress_ttl: Duration::from_secs(env_parse("WRITE_SUPPRESS_TTL_SECONDS", 60)),
            client_timeout: Duration::from_secs(env_parse("CLIENT_TIMEOUT_SECONDS", 20)),
            cycle_timeout: Duration::from_secs(env_parse("CYCLE_TIMEOUT_SECONDS", 120)),

            fuzzy_threshold: env_parse("FUZZY_MATCH_THRESHOLD", 80),
            ebook_cache_size: env_parse("EBOOK_CACHE_SIZE", 3),
            kosync_hash_method: env_str("KOSYNC_HASH_METHOD", "content").to_lowercase(),
            kosync_furthest_wins: env_str("KOSYNC_FURTHEST_WINS", "true").to_lowercase() == "true",

            job_max_retries: env_parse("JOB_MAX_RETRIES", 5),
            job_retry_delay: Duration::from_secs(env_parse("JOB_RETRY_DELAY_MINS", 15u64) * 60),
            whisper_url: env_str("WHISPER_URL", "").trim_end_matches('/').to_string(),
            whisper_model: env_str("WHISPER_MODEL", "base"),

            suggestions_enabled: env_str("SUGGESTIONS_ENABLED", "true").to_lowercase() == "true",

            data_dir,
        }
    }

    /// Override-read tunables from the settings table.
    ///
    /// Only keys the admin API can change are consulted; connection
    /// credentials stay environment-only.
    pub async fn apply_store_overrides(&mut self, db: &sqlx::SqlitePool) -> Result<()> {
        let rows = sqlx::query_as::<_, (String, String)>("SELECT key, value FROM settings")
            .fetch_all(db)
            .await?;

        for (key, value) in rows {
            match key.as_str() {
                "sync_period_mins" => {
                    if let Ok(mins) = value.parse::<u64>() {
                        self.sync_period = Duration::from_secs(mins * 60);
                    }
                }
                "sync_delta_between_clients_percent" => {
                    if let Ok(pct) = value.parse::<f64>() {
                        self.delta_between_clients = pct / 100.0;
                    }
                }
                "fuzzy_match_threshold" => {
                    if let Ok(t) = value.parse() {
                        self.fuzzy_threshold = t;
                    }
                }
                "write_suppress_ttl_seconds" => {
                    if let Ok(secs) = value.parse() {
                        self.write_suppress_ttl = Duration::from_secs(secs);
                    }
                }
                "suggestions_enabled" => {
                    self.suggestions_enabled = value.to_lowercase() == "true";
                }
                _ => {}
            }
        }

        Ok(())
    }

    pub fn transcripts_dir(&self) -> PathBuf {
        self.data_dir.join("transcripts")
    }

    pub fn alignments_dir(&self) -> PathBuf {
        self.data_dir.join("alignments")
    }

    pub fn audio_cache_dir(&self) -> PathBuf {
        self.data_dir.join("audio_cache")
    }

    pub fn epub_cache_dir(&self) -> PathBuf {
        self.data_dir.join("epub_cache")
    }
}

/// Data folder resolution priority order:
/// 1. Command-line argument (highest priority)
/// 2. Environment variable
/// 3. TOML config file
/// 4. OS-dependent compiled default (fallback)
pub fn resolve_data_dir(cli_arg: Option<&str>, config_file: Option<&PathBuf>) -> Result<PathBuf> {
    if let Some(path) = cli_arg {
        return Ok(PathBuf::from(path));
    }

    if let Ok(path) = std::env::var("DATA_DIR") {
        return Ok(PathBuf::from(path));
    }

    if let Some(config_path) = config_file.cloned().or_else(default_config_file) {
        if let Ok(toml_content) = std::fs::read_to_string(&config_path) {
            let config: toml::Value = toml::from_str(&toml_content)
                .map_err(|e| Error::Config(format!("Bad config file {config_path:?}: {e}")))?;
            if let Some(data_dir) = config.get("data_dir").and_then(|v| v.as_str()) {
                return Ok(PathBuf::from(data_dir));
            }
        }
    }

    Ok(default_data_dir())
}

/// Default configuration file path for the platform
fn default_config_file() -> Option<PathBuf> {
    let user_config = dirs::config_dir().map(|d| d.join("bookbridge").join("config.toml"));
    if let Some(ref path) = user_config {
        if path.exists() {
            return user_config;
        }
    }
    let system_config = PathBuf::from("/etc/bookbridge/config.toml");
    if system_config.exists() {
        return Some(system_config);
    }
    None
}

/// OS-dependent default data folder
fn default_data_dir() -> PathBuf {
    if cfg!(target_os = "linux") {
        dirs::data_local_dir()
            .map(|d| d.join("bookbridge"))
            .unwrap_or_else(|| PathBuf::from("/var/lib/bookbridge"))
    } else {
        dirs::data_dir()
            .map(|d| d.join("bookbridge"))
            .unwrap_or_else(|| PathBuf::from("./bookbridge_data"))
    }
}

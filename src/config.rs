// Server configuration from environment variables (BUDGETLY_*)

use std::path::PathBuf;
use std::time::Duration;

/// Runtime configuration, read once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    /// Listen address for the HTTP server
    pub bind_addr: String,

    /// SQLite database path
    pub db_path: PathBuf,

    /// Root directory for stored uploads (outside any web-served path)
    pub storage_root: PathBuf,

    /// Maximum accepted upload size in bytes
    pub max_upload_bytes: u64,

    /// Chat-completions endpoint of the vision inference API
    pub vision_endpoint: String,

    /// Model name sent with each extraction request
    pub vision_model: String,

    /// Timeout for one outbound extraction call
    pub vision_timeout: Duration,

    /// Retry attempts for transient upstream failures
    pub retry_attempts: u32,

    /// Base delay for exponential backoff between retries
    pub retry_base_delay: Duration,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            bind_addr: env_or("BUDGETLY_BIND", "0.0.0.0:3000"),
            db_path: PathBuf::from(env_or("BUDGETLY_DB", "data/budgetly.db")),
            storage_root: PathBuf::from(env_or("BUDGETLY_STORAGE", "data/uploads")),
            max_upload_bytes: env_parse("BUDGETLY_MAX_UPLOAD_BYTES", 10 * 1024 * 1024),
            vision_endpoint: env_or(
                "BUDGETLY_VISION_ENDPOINT",
                "https://api.openai.com/v1/chat/completions",
            ),
            vision_model: env_or("BUDGETLY_VISION_MODEL", "gpt-4o-mini"),
            vision_timeout: Duration::from_secs(env_parse("BUDGETLY_VISION_TIMEOUT_SECS", 60)),
            retry_attempts: env_parse("BUDGETLY_RETRY_ATTEMPTS", 3),
            retry_base_delay: Duration::from_millis(env_parse("BUDGETLY_RETRY_BASE_MS", 500)),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::from_env()
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

//! Environment-backed runtime configuration.
//!
//! Every knob has a default suitable for local use; unset variables fall back
//! silently, while values that fail to parse fall back with a warning so a
//! typo in a deployment manifest does not go unnoticed.

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

/// Runtime configuration for the relay.
///
/// Loaded from the environment via [`Config::load`]. Field-by-field variable
/// names are documented on the accessors below; durations are stored in the
/// units the environment uses (seconds or milliseconds) and exposed as
/// [`Duration`] through helper methods.
#[derive(Debug, Clone)]
pub struct Config {
    /// Listen host (`HOST`).
    pub host: String,
    /// Listen port (`PORT`).
    pub port: u16,
    /// SQLite database path (`DB_PATH`).
    pub db_path: PathBuf,
    /// Directory for ephemeral screenshot artifacts (`SCREENSHOT_PATH`).
    pub screenshot_dir: PathBuf,
    /// Log level filter (`LOG_LEVEL`): trace, debug, info, warn, error.
    pub log_level: String,
    /// Default requests-per-minute limit for new tokens and for tokens whose
    /// stored limit is zero (`RATE_LIMIT_DEFAULT`).
    pub default_rate_limit: u32,
    /// Screenshot time-to-live in seconds (`SCREENSHOT_TTL`).
    pub screenshot_ttl_secs: u64,
    /// Default command timeout in milliseconds (`COMMAND_TIMEOUT`), used when
    /// a request does not carry its own.
    pub command_timeout_ms: u64,
    /// Interval between liveness pings in seconds (`WS_PING_INTERVAL`).
    pub ws_ping_interval_secs: u64,
    /// Grace period after a ping before the peer is considered dead, in
    /// seconds (`WS_PONG_TIMEOUT`).
    pub ws_pong_timeout_secs: u64,
    /// Per-write socket deadline in seconds (`WS_WRITE_TIMEOUT`).
    pub ws_write_timeout_secs: u64,
    /// Maximum inbound frame size in bytes (`WS_MAX_FRAME_BYTES`).
    pub ws_max_frame_bytes: usize,
    /// Depth of the per-session outbound queue (`WS_SEND_QUEUE_DEPTH`).
    pub outbound_queue_depth: usize,
    /// Maximum screenshot size in megabytes (`MAX_SCREENSHOT_SIZE`).
    pub max_screenshot_mb: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            db_path: PathBuf::from("./data/tabrelay.db"),
            screenshot_dir: PathBuf::from("./data/screenshots"),
            log_level: "info".to_string(),
            default_rate_limit: 100,
            screenshot_ttl_secs: 30,
            command_timeout_ms: 30_000,
            ws_ping_interval_secs: 30,
            ws_pong_timeout_secs: 10,
            ws_write_timeout_secs: 10,
            ws_max_frame_bytes: 512 * 1024,
            outbound_queue_depth: 256,
            max_screenshot_mb: 10,
        }
    }
}

impl Config {
    /// Reads configuration from the environment, falling back to defaults for
    /// unset or unparseable values.
    #[must_use]
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            host: env_string("HOST", d.host),
            port: env_parse("PORT", d.port),
            db_path: PathBuf::from(env_string(
                "DB_PATH",
                d.db_path.to_string_lossy().into_owned(),
            )),
            screenshot_dir: PathBuf::from(env_string(
                "SCREENSHOT_PATH",
                d.screenshot_dir.to_string_lossy().into_owned(),
            )),
            log_level: env_string("LOG_LEVEL", d.log_level),
            default_rate_limit: env_parse("RATE_LIMIT_DEFAULT", d.default_rate_limit),
            screenshot_ttl_secs: env_parse("SCREENSHOT_TTL", d.screenshot_ttl_secs),
            command_timeout_ms: env_parse("COMMAND_TIMEOUT", d.command_timeout_ms),
            ws_ping_interval_secs: env_parse("WS_PING_INTERVAL", d.ws_ping_interval_secs),
            ws_pong_timeout_secs: env_parse("WS_PONG_TIMEOUT", d.ws_pong_timeout_secs),
            ws_write_timeout_secs: env_parse("WS_WRITE_TIMEOUT", d.ws_write_timeout_secs),
            ws_max_frame_bytes: env_parse("WS_MAX_FRAME_BYTES", d.ws_max_frame_bytes),
            outbound_queue_depth: env_parse("WS_SEND_QUEUE_DEPTH", d.outbound_queue_depth),
            max_screenshot_mb: env_parse("MAX_SCREENSHOT_SIZE", d.max_screenshot_mb),
        }
    }

    /// Loads configuration from the environment and creates the database and
    /// screenshot directories.
    ///
    /// # Errors
    ///
    /// Returns an error if a required directory cannot be created.
    pub fn load() -> std::io::Result<Self> {
        let cfg = Self::from_env();
        if let Some(parent) = cfg.db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::create_dir_all(&cfg.screenshot_dir)?;
        Ok(cfg)
    }

    /// Default timeout applied to commands that do not carry their own.
    #[must_use]
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    /// Interval between outbound liveness pings.
    #[must_use]
    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ws_ping_interval_secs)
    }

    /// Per-write socket deadline.
    #[must_use]
    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.ws_write_timeout_secs)
    }

    /// Read deadline for the socket: one ping interval plus the pong grace
    /// period. Refreshed only by heartbeats.
    #[must_use]
    pub fn read_deadline(&self) -> Duration {
        Duration::from_secs(self.ws_ping_interval_secs + self.ws_pong_timeout_secs)
    }

    /// How long screenshot artifacts live on disk.
    #[must_use]
    pub fn screenshot_ttl(&self) -> Duration {
        Duration::from_secs(self.screenshot_ttl_secs)
    }

    /// Maximum decoded screenshot size in bytes.
    #[must_use]
    pub fn max_screenshot_bytes(&self) -> usize {
        self.max_screenshot_mb * 1024 * 1024
    }
}

fn env_string(key: &str, default: String) -> String {
    env::var(key).unwrap_or(default)
}

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    match env::var(key) {
        Ok(raw) => match raw.parse() {
            Ok(value) => value,
            Err(_) => {
                warn!(key, value = %raw, "unparseable configuration value, using default");
                default
            }
        },
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = Config::default();
        assert_eq!(cfg.port, 3000);
        assert_eq!(cfg.command_timeout(), Duration::from_millis(30_000));
        assert_eq!(cfg.read_deadline(), Duration::from_secs(40));
        assert_eq!(cfg.ws_max_frame_bytes, 512 * 1024);
        assert_eq!(cfg.max_screenshot_bytes(), 10 * 1024 * 1024);
    }

    #[test]
    fn env_overrides_and_bad_values() {
        env::set_var("PORT", "8080");
        env::set_var("COMMAND_TIMEOUT", "not-a-number");
        env::set_var("WS_SEND_QUEUE_DEPTH", "64");

        let cfg = Config::from_env();
        assert_eq!(cfg.port, 8080);
        // Bad value falls back to the default
        assert_eq!(cfg.command_timeout_ms, 30_000);
        assert_eq!(cfg.outbound_queue_depth, 64);

        env::remove_var("PORT");
        env::remove_var("COMMAND_TIMEOUT");
        env::remove_var("WS_SEND_QUEUE_DEPTH");
    }
}

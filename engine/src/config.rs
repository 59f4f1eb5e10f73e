use std::{fs, path::PathBuf, time::Duration};

use anyhow::{Context, Result};
use serde::Deserialize;

/// Runtime configuration for the engine resolved from defaults, an
/// optional TOML file and environment variables. The embedding UI may
/// mutate the resolved struct before handing it to the engine.
#[derive(Clone, Debug)]
pub struct Config {
    /// Directory holding the fallback database.
    pub data_dir: PathBuf,
    /// Lower bound of the adaptive poll interval.
    pub poll_min: Duration,
    /// Upper bound of the adaptive poll interval.
    pub poll_max: Duration,
    /// Geometric backoff factor applied per empty poll.
    pub poll_growth: f64,
    /// Window within which an identical inbound message counts as the
    /// client's own echo.
    pub echo_window: Duration,
    /// Validity window of a persisted session.
    pub session_ttl: Duration,
    /// Reconnection attempts before a room degrades to polling for good.
    pub reconnect_max_attempts: u32,
    /// First retry delay; grows linearly with the attempt number.
    pub reconnect_base_delay: Duration,
    /// Push silence tolerated before a liveness probe.
    pub heartbeat_timeout: Duration,
    /// Maximum message text length.
    pub message_max_len: usize,
    /// Age after which delivery-state entries are swept.
    pub delivery_ttl: Duration,
    /// Period of the delivery-state sweep task.
    pub cleanup_every: Duration,
    /// Expiry horizon stamped on rooms created by this client.
    pub default_room_ttl: Duration,
    /// Whether room expiry is enforced on join/restore.
    pub enforce_expiry: bool,
}

#[derive(Deserialize, Default)]
struct FileConfig {
    #[serde(default)]
    storage: FileStorage,
    #[serde(default)]
    polling: FilePolling,
    #[serde(default)]
    reconnect: FileReconnect,
    #[serde(default)]
    messages: FileMessages,
    #[serde(default)]
    delivery: FileDelivery,
    #[serde(default)]
    rooms: FileRooms,
    #[serde(default)]
    session: FileSession,
}

#[derive(Deserialize, Default)]
struct FileStorage {
    data_dir: Option<PathBuf>,
}

#[derive(Deserialize)]
struct FilePolling {
    #[serde(default = "default_poll_min_ms")]
    min_ms: u64,
    #[serde(default = "default_poll_max_ms")]
    max_ms: u64,
    #[serde(default = "default_poll_growth")]
    growth: f64,
}

#[derive(Deserialize)]
struct FileReconnect {
    #[serde(default = "default_reconnect_attempts")]
    max_attempts: u32,
    #[serde(default = "default_reconnect_base_ms")]
    base_delay_ms: u64,
    #[serde(default = "default_heartbeat_ms")]
    heartbeat_timeout_ms: u64,
}

#[derive(Deserialize)]
struct FileMessages {
    #[serde(default = "default_message_max_len")]
    max_len: usize,
    #[serde(default = "default_echo_window_ms")]
    echo_window_ms: u64,
}

#[derive(Deserialize)]
struct FileDelivery {
    #[serde(default = "default_delivery_ttl_ms")]
    ttl_ms: u64,
    #[serde(default = "default_cleanup_every_ms")]
    cleanup_every_ms: u64,
}

#[derive(Deserialize)]
struct FileRooms {
    #[serde(default = "default_room_ttl_ms")]
    default_ttl_ms: u64,
    #[serde(default)]
    enforce_expiry: bool,
}

#[derive(Deserialize)]
struct FileSession {
    #[serde(default = "default_session_ttl_ms")]
    ttl_ms: u64,
}

fn default_poll_min_ms() -> u64 {
    2_000
}

fn default_poll_max_ms() -> u64 {
    30_000
}

fn default_poll_growth() -> f64 {
    1.5
}

fn default_reconnect_attempts() -> u32 {
    5
}

fn default_reconnect_base_ms() -> u64 {
    2_000
}

fn default_heartbeat_ms() -> u64 {
    45_000
}

fn default_message_max_len() -> usize {
    280
}

fn default_echo_window_ms() -> u64 {
    1_000
}

fn default_delivery_ttl_ms() -> u64 {
    60_000
}

fn default_cleanup_every_ms() -> u64 {
    30_000
}

fn default_room_ttl_ms() -> u64 {
    3_600_000
}

fn default_session_ttl_ms() -> u64 {
    86_400_000
}

impl Default for FilePolling {
    fn default() -> Self {
        Self {
            min_ms: default_poll_min_ms(),
            max_ms: default_poll_max_ms(),
            growth: default_poll_growth(),
        }
    }
}

impl Default for FileReconnect {
    fn default() -> Self {
        Self {
            max_attempts: default_reconnect_attempts(),
            base_delay_ms: default_reconnect_base_ms(),
            heartbeat_timeout_ms: default_heartbeat_ms(),
        }
    }
}

impl Default for FileMessages {
    fn default() -> Self {
        Self {
            max_len: default_message_max_len(),
            echo_window_ms: default_echo_window_ms(),
        }
    }
}

impl Default for FileDelivery {
    fn default() -> Self {
        Self {
            ttl_ms: default_delivery_ttl_ms(),
            cleanup_every_ms: default_cleanup_every_ms(),
        }
    }
}

impl Default for FileRooms {
    fn default() -> Self {
        Self {
            default_ttl_ms: default_room_ttl_ms(),
            enforce_expiry: false,
        }
    }
}

impl Default for FileSession {
    fn default() -> Self {
        Self {
            ttl_ms: default_session_ttl_ms(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            poll_min: Duration::from_millis(default_poll_min_ms()),
            poll_max: Duration::from_millis(default_poll_max_ms()),
            poll_growth: default_poll_growth(),
            echo_window: Duration::from_millis(default_echo_window_ms()),
            session_ttl: Duration::from_millis(default_session_ttl_ms()),
            reconnect_max_attempts: default_reconnect_attempts(),
            reconnect_base_delay: Duration::from_millis(default_reconnect_base_ms()),
            heartbeat_timeout: Duration::from_millis(default_heartbeat_ms()),
            message_max_len: default_message_max_len(),
            delivery_ttl: Duration::from_millis(default_delivery_ttl_ms()),
            cleanup_every: Duration::from_millis(default_cleanup_every_ms()),
            default_room_ttl: Duration::from_millis(default_room_ttl_ms()),
            enforce_expiry: false,
        }
    }
}

impl Config {
    /// Resolve configuration from file, environment variables and defaults.
    pub fn load() -> Result<Self> {
        let mut cfg = Config::default();

        // config file path precedence: ENV -> default location
        let config_path = std::env::var("SYNC_ENGINE_CONFIG")
            .ok()
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("config/sync_engine.toml"));

        if let Ok(bytes) = fs::read(&config_path) {
            let contents = String::from_utf8_lossy(&bytes);
            let file_cfg: FileConfig = toml::from_str(&contents).context("invalid config file")?;
            if let Some(dir) = file_cfg.storage.data_dir {
                cfg.data_dir = dir;
            }
            cfg.poll_min = Duration::from_millis(file_cfg.polling.min_ms);
            cfg.poll_max = Duration::from_millis(file_cfg.polling.max_ms);
            cfg.poll_growth = file_cfg.polling.growth;
            cfg.reconnect_max_attempts = file_cfg.reconnect.max_attempts;
            cfg.reconnect_base_delay = Duration::from_millis(file_cfg.reconnect.base_delay_ms);
            cfg.heartbeat_timeout = Duration::from_millis(file_cfg.reconnect.heartbeat_timeout_ms);
            cfg.message_max_len = file_cfg.messages.max_len;
            cfg.echo_window = Duration::from_millis(file_cfg.messages.echo_window_ms);
            cfg.delivery_ttl = Duration::from_millis(file_cfg.delivery.ttl_ms);
            cfg.cleanup_every = Duration::from_millis(file_cfg.delivery.cleanup_every_ms);
            cfg.default_room_ttl = Duration::from_millis(file_cfg.rooms.default_ttl_ms);
            cfg.enforce_expiry = file_cfg.rooms.enforce_expiry;
            cfg.session_ttl = Duration::from_millis(file_cfg.session.ttl_ms);
        }

        // environment overrides
        if let Ok(dir) = std::env::var("SYNC_ENGINE_DATA_DIR") {
            cfg.data_dir = PathBuf::from(dir);
        }
        if let Ok(v) = std::env::var("SYNC_ENGINE_POLL_MIN_MS") {
            if let Ok(ms) = v.parse::<u64>() {
                cfg.poll_min = Duration::from_millis(ms);
            }
        }
        if let Ok(v) = std::env::var("SYNC_ENGINE_POLL_MAX_MS") {
            if let Ok(ms) = v.parse::<u64>() {
                cfg.poll_max = Duration::from_millis(ms);
            }
        }
        if let Ok(v) = std::env::var("SYNC_ENGINE_ENFORCE_EXPIRY") {
            if let Ok(b) = v.parse::<bool>() {
                cfg.enforce_expiry = b;
            }
        }

        cfg.validate()?;
        Ok(cfg)
    }

    /// Reject bounds that would wedge the scheduler.
    pub fn validate(&self) -> Result<()> {
        if self.poll_min.is_zero() || self.poll_min > self.poll_max {
            anyhow::bail!("invalid_poll_bounds");
        }
        if self.poll_growth < 1.0 {
            anyhow::bail!("invalid_poll_growth");
        }
        if self.reconnect_max_attempts == 0 {
            anyhow::bail!("invalid_reconnect_cap");
        }
        if self.message_max_len == 0 {
            anyhow::bail!("invalid_message_len");
        }
        Ok(())
    }
}

/// Determine the default data directory for the engine.
pub fn default_data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("SYNC_ENGINE_DATA_DIR") {
        PathBuf::from(dir)
    } else if let Ok(home) = std::env::var("HOME") {
        let mut p = PathBuf::from(home);
        p.push(".local/share/sync_engine");
        p
    } else {
        PathBuf::from("./sync_engine_data")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::fs;

    fn clear_env() {
        std::env::remove_var("SYNC_ENGINE_CONFIG");
        std::env::remove_var("SYNC_ENGINE_DATA_DIR");
        std::env::remove_var("SYNC_ENGINE_POLL_MIN_MS");
        std::env::remove_var("SYNC_ENGINE_POLL_MAX_MS");
        std::env::remove_var("SYNC_ENGINE_ENFORCE_EXPIRY");
    }

    #[test]
    #[serial]
    fn valid_config_parses() {
        clear_env();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cfg.toml");
        fs::write(
            &path,
            "[polling]\nmin_ms=500\nmax_ms=5000\n[rooms]\nenforce_expiry=true\n",
        )
        .unwrap();
        std::env::set_var("SYNC_ENGINE_CONFIG", &path);
        let cfg = Config::load().unwrap();
        assert_eq!(cfg.poll_min, Duration::from_millis(500));
        assert_eq!(cfg.poll_max, Duration::from_millis(5000));
        assert!(cfg.enforce_expiry);
        clear_env();
    }

    #[test]
    #[serial]
    fn missing_keys_default() {
        clear_env();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cfg.toml");
        fs::write(&path, "").unwrap();
        std::env::set_var("SYNC_ENGINE_CONFIG", &path);
        let cfg = Config::load().unwrap();
        assert_eq!(cfg.poll_min, Duration::from_millis(2_000));
        assert_eq!(cfg.message_max_len, 280);
        assert!(!cfg.enforce_expiry);
        clear_env();
    }

    #[test]
    #[serial]
    fn inverted_poll_bounds_fail() {
        clear_env();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cfg.toml");
        fs::write(&path, "[polling]\nmin_ms=5000\nmax_ms=100\n").unwrap();
        std::env::set_var("SYNC_ENGINE_CONFIG", &path);
        assert!(Config::load().is_err());
        clear_env();
    }

    #[test]
    #[serial]
    fn env_overrides_file() {
        clear_env();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cfg.toml");
        fs::write(&path, "[polling]\nmin_ms=500\n").unwrap();
        std::env::set_var("SYNC_ENGINE_CONFIG", &path);
        std::env::set_var("SYNC_ENGINE_POLL_MIN_MS", "750");
        let cfg = Config::load().unwrap();
        assert_eq!(cfg.poll_min, Duration::from_millis(750));
        clear_env();
    }
}

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

pub const DEFAULT_TIMEZONE: &str = "UTC";
pub const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000; // wait this long for a contended write lock
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 5; // change-ledger poll cadence

/// Top-level config (beatstore.toml + BEATSTORE_* env overrides).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BeatstoreConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub watcher: WatcherConfig,
    #[serde(default)]
    pub schedule: ScheduleConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
    /// How long a connection waits on SQLITE_BUSY before giving up.
    /// Override with env var: BEATSTORE_DATABASE__BUSY_TIMEOUT_MS=10000
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            busy_timeout_ms: DEFAULT_BUSY_TIMEOUT_MS,
        }
    }
}

impl DatabaseConfig {
    /// Create the directory holding the database file if it does not exist.
    pub fn ensure_parent_dir(&self) -> crate::error::Result<()> {
        if let Some(parent) = std::path::Path::new(&self.path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        Ok(())
    }

    pub fn busy_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.busy_timeout_ms)
    }
}

/// Change watcher settings for the consuming scheduler process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatcherConfig {
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: DEFAULT_POLL_INTERVAL_SECS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    /// Zone applied to crontab definitions that do not name one.
    #[serde(default = "default_timezone")]
    pub default_timezone: String,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            default_timezone: default_timezone(),
        }
    }
}

fn default_busy_timeout_ms() -> u64 {
    DEFAULT_BUSY_TIMEOUT_MS
}
fn default_poll_interval_secs() -> u64 {
    DEFAULT_POLL_INTERVAL_SECS
}
fn default_timezone() -> String {
    DEFAULT_TIMEZONE.to_string()
}
fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.beatstore/beatstore.db", home)
}

impl BeatstoreConfig {
    /// Load config from a TOML file with BEATSTORE_* env var overrides.
    ///
    /// Checks in order:
    ///   1. Explicit path argument
    ///   2. $BEATSTORE_CONFIG
    ///   3. ~/.beatstore/beatstore.toml
    ///
    /// A missing file is not an error; defaults fill every section. Nested
    /// keys in env vars are separated by `__`, e.g.
    /// `BEATSTORE_DATABASE__PATH=/var/lib/beat.db`.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .or_else(|| std::env::var("BEATSTORE_CONFIG").ok())
            .unwrap_or_else(default_config_path);

        Self::figment(&path)
            .extract()
            .map_err(|e| crate::error::CoreError::Config(e.to_string()))
    }

    fn figment(path: &str) -> Figment {
        Figment::from(Serialized::defaults(BeatstoreConfig::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed("BEATSTORE_").ignore(&["CONFIG"]).split("__"))
    }

    pub fn poll_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.watcher.poll_interval_secs.max(1))
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.beatstore/beatstore.toml", home)
}

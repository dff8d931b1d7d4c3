use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::metadata::SqliteConfig;

#[derive(Clone, Deserialize)]
pub struct Config {
    #[serde(default = "default_listen_address")]
    pub listen_address: String,
    pub backend: StorageBackend,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub cleanup: CleanupConfig,
}

#[derive(Clone, Deserialize)]
#[serde(tag = "type")]
pub enum StorageBackend {
    Sqlite(SqliteConfig),
    Memory,
}

fn default_listen_address() -> String {
    "0.0.0.0:13030".to_string()
}

/// HTTP Basic credentials guarding the `/v2/*` and `/api/*` surfaces.
/// Disabled unless configured.
#[derive(Clone, Default, Deserialize)]
pub struct AuthConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

#[derive(Clone, Deserialize)]
pub struct CleanupConfig {
    /// How often the cleanup task fires.
    #[serde(default = "default_interval_minutes")]
    pub interval_minutes: u64,
    /// Sessions idle longer than this are reclaimed.
    #[serde(default = "default_max_session_age_hours")]
    pub max_session_age_hours: u64,
    /// Below this free-space percentage on the storage volume, stale
    /// sessions are reclaimed regardless of age.
    #[serde(default = "default_min_free_disk_percent")]
    pub min_free_disk_percent: f64,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            interval_minutes: default_interval_minutes(),
            max_session_age_hours: default_max_session_age_hours(),
            min_free_disk_percent: default_min_free_disk_percent(),
        }
    }
}

impl CleanupConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_minutes * 60)
    }

    pub fn max_session_age(&self) -> chrono::Duration {
        chrono::Duration::hours(self.max_session_age_hours as i64)
    }
}

fn default_interval_minutes() -> u64 {
    30
}

fn default_max_session_age_hours() -> u64 {
    24
}

fn default_min_free_disk_percent() -> f64 {
    10.0
}

/// Where chunk bodies are spooled while streaming. Also the volume whose
/// free space the cleanup task watches when the sqlite backend is in use.
pub fn default_spool_dir() -> PathBuf {
    std::env::temp_dir()
}

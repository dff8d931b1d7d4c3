use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::config::CleanupConfig;
use crate::errors::Result;

use super::events::RegistryEvent;
use super::Registry;

#[derive(Clone, Copy, Debug, Default, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CleanupReport {
    pub blobs_removed: u64,
    pub bytes_freed: u64,
    pub sessions_removed: u64,
}

impl Registry {
    /// Reclaim chunk rows of stale sessions: sessions idle beyond the
    /// configured age, sessions the tracker does not know (pre-restart
    /// leftovers), or — with `force` — every session with chunk rows.
    pub async fn cleanup_stale(&self, force: bool) -> Result<CleanupReport> {
        let now = Utc::now();
        let max_age = self.cleanup_config().max_session_age();
        let mut report = CleanupReport::default();

        for session in self.intercept(self.store().chunk_sessions().await).await? {
            let stale = match self.sessions().get(&session) {
                Some(state) => force || now - state.last_active > max_age,
                None => true,
            };
            if !stale {
                continue;
            }

            let totals = self
                .intercept(self.store().delete_session_chunks(&session).await)
                .await?;
            self.sessions().remove(&session);
            report.blobs_removed += totals.rows;
            report.bytes_freed += totals.bytes;
            report.sessions_removed += 1;
        }

        if report.sessions_removed > 0 {
            self.emit(&RegistryEvent::SessionsExpired(report));
        }
        Ok(report)
    }
}

/// Periodic expiry of stale upload sessions, with a disk-pressure override
/// that reclaims regardless of age when the storage volume runs low.
pub struct CleanupScheduler {
    registry: Registry,
    config: CleanupConfig,
    /// Volume to watch for disk pressure; None for the in-memory backend.
    volume: Option<PathBuf>,
}

impl CleanupScheduler {
    pub fn new(registry: Registry, config: CleanupConfig, volume: Option<PathBuf>) -> Self {
        Self {
            registry,
            config,
            volume,
        }
    }

    /// Errors are logged; the task continues at its next tick.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.interval());
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // interval fires immediately; skip the startup tick
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = self.run_once().await {
                    tracing::warn!("cleanup pass failed: {e}");
                }
            }
        })
    }

    async fn run_once(&self) -> Result<()> {
        let force = match &self.volume {
            Some(path) => match free_space_percent(path) {
                Ok(percent) if percent < self.config.min_free_disk_percent => {
                    tracing::warn!(
                        "free space on {} at {percent:.1}%, below the {:.1}% floor; \
                         expiring sessions regardless of age",
                        path.display(),
                        self.config.min_free_disk_percent
                    );
                    true
                }
                Ok(_) => false,
                Err(e) => {
                    tracing::debug!("disk pressure check failed for {}: {e}", path.display());
                    false
                }
            },
            None => false,
        };

        let report = self.registry.cleanup_stale(force).await?;
        if report.sessions_removed > 0 {
            tracing::info!(
                "cleanup removed {} sessions, {} chunk rows, {} bytes",
                report.sessions_removed,
                report.blobs_removed,
                report.bytes_freed
            );
        }
        Ok(())
    }
}

/// Free space on the filesystem containing `path`, as a percentage of its
/// total capacity.
pub fn free_space_percent(path: &Path) -> Result<f64> {
    let stat = nix::sys::statvfs::statvfs(path)?;
    if stat.blocks() == 0 {
        return Ok(100.0);
    }
    Ok(stat.blocks_available() as f64 * 100.0 / stat.blocks() as f64)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn free_space_percent_is_sane() {
        let percent = free_space_percent(Path::new("/")).unwrap();
        assert!((0.0..=100.0).contains(&percent));
    }
}

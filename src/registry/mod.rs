//! The registry engine: upload state machine, manifest operations, garbage
//! collection and cleanup, composed over a [`RegistryStore`].
//!
//! The engine owns no durable state of its own; everything that must
//! survive a restart lives in the store. The pieces it does keep in memory
//! (the session tracker, the observer list, the corruption-recovery guard)
//! are injected or constructed here rather than reached through globals.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use serde::Serialize;
use uuid::Uuid;

use crate::config::CleanupConfig;
use crate::errors::{Error, Result};
use crate::metadata::{BlobBody, BlobRecord, RegistryStore, StoreStats, StoredRow};
use crate::oci_digest::OciDigest;

pub mod cleanup;
pub mod events;
mod gc;
mod manifests;
mod uploads;
mod sessions;

pub use cleanup::{CleanupReport, CleanupScheduler};
pub use events::{LogObserver, RegistryEvent, RegistryObserver};
pub use manifests::ManifestPut;
pub use sessions::{SessionState, SessionTracker};
pub use uploads::{ChunkAppended, FinalizedUpload, StartUpload};

#[derive(Default)]
struct RecoveryState {
    attempted: AtomicBool,
    refusing_writes: AtomicBool,
}

#[derive(Clone)]
pub struct Registry {
    store: Arc<dyn RegistryStore>,
    sessions: SessionTracker,
    cleanup: CleanupConfig,
    observers: Arc<RwLock<Vec<Arc<dyn RegistryObserver>>>>,
    recovery: Arc<RecoveryState>,
}

impl Registry {
    pub fn new(store: Arc<dyn RegistryStore>, cleanup: CleanupConfig) -> Self {
        Self {
            store,
            sessions: SessionTracker::new(),
            cleanup,
            observers: Arc::new(RwLock::new(Vec::new())),
            recovery: Arc::new(RecoveryState::default()),
        }
    }

    /// Register a synchronous observer; it is notified on the mutating
    /// task as events commit.
    pub fn subscribe(&self, observer: Arc<dyn RegistryObserver>) {
        self.observers
            .write()
            .expect("observer list lock poisoned")
            .push(observer);
    }

    pub(crate) fn emit(&self, event: &RegistryEvent) {
        for observer in self
            .observers
            .read()
            .expect("observer list lock poisoned")
            .iter()
        {
            observer.notify(event);
        }
    }

    pub(crate) fn store(&self) -> &Arc<dyn RegistryStore> {
        &self.store
    }

    pub(crate) fn sessions(&self) -> &SessionTracker {
        &self.sessions
    }

    pub(crate) fn cleanup_config(&self) -> &CleanupConfig {
        &self.cleanup
    }

    // ------ blobs ------

    pub async fn blob_exists(&self, digest: &OciDigest) -> Result<bool> {
        self.intercept(self.store.blob_exists(digest).await).await
    }

    pub async fn get_blob(&self, digest: &OciDigest) -> Result<Option<(BlobRecord, BlobBody)>> {
        self.intercept(self.store.get_blob(digest).await).await
    }

    pub async fn delete_blob(&self, digest: &OciDigest) -> Result<bool> {
        self.guard_write()?;
        self.intercept(self.store.delete_blob(digest).await).await
    }

    // ------ admin / observability ------

    pub async fn scan_blobs(&self) -> Result<Vec<StoredRow>> {
        self.intercept(self.store.scan().await).await
    }

    pub async fn state(&self) -> Result<RegistryState> {
        let stats = self.intercept(self.store.stats().await).await?;
        Ok(RegistryState {
            stats,
            active_sessions: self.sessions.snapshot().len() as u64,
        })
    }

    pub async fn health(&self) -> Result<HealthReport> {
        let writable = !self.recovery.refusing_writes.load(Ordering::SeqCst);
        // a cheap read doubles as a storage liveness probe
        let stats = self.intercept(self.store.stats().await).await;
        Ok(HealthReport {
            status: if writable && stats.is_ok() {
                "ok"
            } else {
                "degraded"
            },
            storage_writable: writable,
            recovery_attempted: self.recovery.attempted.load(Ordering::SeqCst),
        })
    }

    pub fn sessions_snapshot(&self) -> Vec<(Uuid, SessionState)> {
        self.sessions.snapshot()
    }

    // ------ corruption recovery ------

    /// Writes fail fast once corruption has been reported and the single
    /// automatic recovery attempt did not succeed.
    pub(crate) fn guard_write(&self) -> Result<()> {
        if self.recovery.refusing_writes.load(Ordering::SeqCst) {
            return Err(Error::Corruption(
                "storage engine offline pending manual recovery".to_string(),
            ));
        }
        Ok(())
    }

    /// Pass storage results through the corruption guard: the first
    /// corruption report triggers one automatic recovery attempt; if that
    /// fails, subsequent writes are refused until [`Self::reset_recovery`].
    pub(crate) async fn intercept<T>(&self, result: Result<T>) -> Result<T> {
        if let Err(Error::Corruption(msg)) = &result {
            self.corruption_reported(msg).await;
        }
        result
    }

    async fn corruption_reported(&self, msg: &str) {
        if self.recovery.attempted.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::error!("storage corruption reported: {msg}; attempting recovery");
        match self.store.attempt_recovery().await {
            Ok(true) => tracing::info!("storage recovery succeeded"),
            Ok(false) => {
                self.recovery.refusing_writes.store(true, Ordering::SeqCst);
                tracing::error!("storage recovery failed; refusing further writes");
            }
            Err(e) => {
                self.recovery.refusing_writes.store(true, Ordering::SeqCst);
                tracing::error!("storage recovery errored: {e}; refusing further writes");
            }
        }
    }

    /// Manual admin hook: allow another automatic recovery attempt and
    /// re-enable writes.
    pub fn reset_recovery(&self) {
        self.recovery.attempted.store(false, Ordering::SeqCst);
        self.recovery.refusing_writes.store(false, Ordering::SeqCst);
        tracing::info!("corruption recovery state reset");
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryState {
    #[serde(flatten)]
    pub stats: StoreStats,
    pub active_sessions: u64,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub status: &'static str,
    pub storage_writable: bool,
    pub recovery_attempted: bool,
}

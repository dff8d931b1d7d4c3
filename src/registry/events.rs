use crate::metadata::GcReport;

use super::cleanup::CleanupReport;

/// Events the engine emits synchronously as state changes commit. How an
/// observer runs (channel fan-out, SSE broadcast, rate sampling) is its own
/// concern; notification happens on the mutating task.
#[derive(Clone, Debug)]
pub enum RegistryEvent {
    BlobFinalized { digest: String, size: u64 },
    RepositoryMutated { name: String },
    ManifestDeleted { name: String, tag: String },
    RepositoryDeleted { name: String, manifests: u64 },
    GarbageCollected(GcReport),
    SessionsExpired(CleanupReport),
}

pub trait RegistryObserver: Send + Sync {
    fn notify(&self, event: &RegistryEvent);
}

/// Default observer: one structured log line per event.
pub struct LogObserver;

impl RegistryObserver for LogObserver {
    fn notify(&self, event: &RegistryEvent) {
        match event {
            RegistryEvent::BlobFinalized { digest, size } => {
                tracing::info!(digest = %digest, size = *size, "blob finalized")
            }
            RegistryEvent::RepositoryMutated { name } => {
                tracing::info!(name = %name, "repository mutated")
            }
            RegistryEvent::ManifestDeleted { name, tag } => {
                tracing::info!(name = %name, tag = %tag, "manifest deleted")
            }
            RegistryEvent::RepositoryDeleted { name, manifests } => {
                tracing::info!(name = %name, manifests = *manifests, "repository deleted")
            }
            RegistryEvent::GarbageCollected(report) => tracing::info!(
                blobs_removed = report.blobs_removed,
                bytes_freed = report.bytes_freed,
                manifests_removed = report.manifests_removed,
                "garbage collection completed"
            ),
            RegistryEvent::SessionsExpired(report) => tracing::info!(
                blobs_removed = report.blobs_removed,
                bytes_freed = report.bytes_freed,
                sessions_removed = report.sessions_removed,
                "stale sessions expired"
            ),
        }
    }
}

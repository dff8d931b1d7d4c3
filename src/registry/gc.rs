use chrono::Utc;
use uuid::Uuid;

use crate::errors::Result;
use crate::metadata::{GcReport, GcStats};

use super::events::RegistryEvent;
use super::Registry;

impl Registry {
    /// Sessions whose chunks the collector may sweep: tracked sessions
    /// idle beyond the configured age, plus any chunk session the tracker
    /// does not know (sessions do not survive restarts).
    pub(crate) async fn expired_sessions(&self) -> Result<Vec<Uuid>> {
        let now = Utc::now();
        let mut expired = self
            .sessions()
            .idle_since(self.cleanup_config().max_session_age(), now);

        for session in self.intercept(self.store().chunk_sessions().await).await? {
            if !self.sessions().contains(&session) && !expired.contains(&session) {
                expired.push(session);
            }
        }
        Ok(expired)
    }

    pub async fn run_gc(&self) -> Result<GcReport> {
        self.guard_write()?;

        let expired = self.expired_sessions().await?;
        let report = self
            .intercept(self.store().collect_garbage(&expired).await)
            .await?;
        for session in &expired {
            self.sessions().remove(session);
        }

        self.emit(&RegistryEvent::GarbageCollected(report));
        Ok(report)
    }

    pub async fn gc_stats(&self) -> Result<GcStats> {
        self.intercept(self.store().gc_stats().await).await
    }
}

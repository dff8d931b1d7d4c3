use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

/// Per-session upload state.
///
/// Sessions live only in memory: in-flight uploads do not survive a process
/// restart, and the cleanup task treats chunk rows whose session is unknown
/// here as abandoned.
#[derive(Clone, Debug)]
pub struct SessionState {
    /// Repository the upload was initiated against; used to build the
    /// canonical blob location on finalize.
    pub repository: String,
    pub created_at: DateTime<Utc>,
    pub last_active: DateTime<Utc>,
    pub chunks: i64,
    pub bytes_received: u64,
}

#[derive(Clone, Default)]
pub struct SessionTracker {
    inner: Arc<Mutex<HashMap<Uuid, SessionState>>>,
}

impl SessionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mint(&self, repository: &str) -> Uuid {
        let uuid = Uuid::new_v4();
        let now = Utc::now();
        self.lock().insert(
            uuid,
            SessionState {
                repository: repository.to_string(),
                created_at: now,
                last_active: now,
                chunks: 0,
                bytes_received: 0,
            },
        );
        uuid
    }

    pub fn get(&self, session: &Uuid) -> Option<SessionState> {
        self.lock().get(session).cloned()
    }

    /// Record an appended chunk, returning the session's running byte
    /// total. None if the session is unknown.
    pub fn record_chunk(&self, session: &Uuid, bytes: u64) -> Option<u64> {
        let mut sessions = self.lock();
        let state = sessions.get_mut(session)?;
        state.chunks += 1;
        state.bytes_received += bytes;
        state.last_active = Utc::now();
        Some(state.bytes_received)
    }

    pub fn remove(&self, session: &Uuid) -> Option<SessionState> {
        self.lock().remove(session)
    }

    pub fn snapshot(&self) -> Vec<(Uuid, SessionState)> {
        self.lock().iter().map(|(k, v)| (*k, v.clone())).collect()
    }

    /// Sessions idle for longer than `age` as of `now`.
    pub fn idle_since(&self, age: Duration, now: DateTime<Utc>) -> Vec<Uuid> {
        self.lock()
            .iter()
            .filter(|(_, state)| now - state.last_active > age)
            .map(|(uuid, _)| *uuid)
            .collect()
    }

    pub fn contains(&self, session: &Uuid) -> bool {
        self.lock().contains_key(session)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, SessionState>> {
        self.inner.lock().expect("session tracker mutex poisoned")
    }
}

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use hyper::body::Body;
use uuid::Uuid;

use crate::errors::{Error, Result};
use crate::oci_digest::{referenced_digests, OciDigest};

use super::{
    BlobBody, BlobRecord, ChunkStats, FinalizeOutcome, GcReport, GcStats, ManifestRecord,
    ManifestRef, RegistryStore, StoreStats, StoredRow, SweepTotals,
};

struct ChunkRow {
    session: Uuid,
    index: i64,
    bytes: Vec<u8>,
}

struct ManifestRow {
    name: String,
    tag: String,
    digest: String,
    bytes: Vec<u8>,
}

#[derive(Default)]
struct Inner {
    chunks: Vec<ChunkRow>,
    blobs: HashMap<String, Vec<u8>>,
    manifests: Vec<ManifestRow>,
}

/// In-memory implementation of [`RegistryStore`] with the same observable
/// semantics as the sqlite backend. Backs the test suite; bodies are
/// buffered rather than spooled.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("memory store mutex poisoned")
    }
}

#[async_trait]
impl RegistryStore for MemoryStore {
    async fn blob_exists(&self, digest: &OciDigest) -> Result<bool> {
        Ok(self.lock().blobs.contains_key(&String::from(digest)))
    }

    async fn get_blob(&self, digest: &OciDigest) -> Result<Option<(BlobRecord, BlobBody)>> {
        let inner = self.lock();
        match inner.blobs.get(&String::from(digest)) {
            Some(bytes) => {
                let record = BlobRecord {
                    digest: digest.clone(),
                    size: bytes.len() as i64,
                };
                let frames: Vec<super::TryBytes> = vec![Ok(Bytes::from(bytes.clone()))];
                Ok(Some((record, futures::stream::iter(frames).boxed())))
            }
            None => Ok(None),
        }
    }

    async fn delete_blob(&self, digest: &OciDigest) -> Result<bool> {
        Ok(self.lock().blobs.remove(&String::from(digest)).is_some())
    }

    async fn put_chunk(&self, session: &Uuid, index: i64, mut body: Body) -> Result<u64> {
        let mut bytes = Vec::new();
        while let Some(frame) = body.next().await {
            bytes.extend_from_slice(&frame?);
        }
        let written = bytes.len() as u64;
        self.lock().chunks.push(ChunkRow {
            session: *session,
            index,
            bytes,
        });
        Ok(written)
    }

    async fn chunk_count(&self, session: &Uuid) -> Result<i64> {
        Ok(self.chunk_stats(session).await?.count)
    }

    async fn chunk_stats(&self, session: &Uuid) -> Result<ChunkStats> {
        let inner = self.lock();
        let mut stats = ChunkStats::default();
        for chunk in inner.chunks.iter().filter(|c| c.session == *session) {
            stats.count += 1;
            stats.bytes += chunk.bytes.len() as u64;
        }
        Ok(stats)
    }

    async fn chunk_sessions(&self) -> Result<Vec<Uuid>> {
        let inner = self.lock();
        let mut seen = HashSet::new();
        Ok(inner
            .chunks
            .iter()
            .filter(|c| seen.insert(c.session))
            .map(|c| c.session)
            .collect())
    }

    async fn delete_session_chunks(&self, session: &Uuid) -> Result<SweepTotals> {
        let mut inner = self.lock();
        let mut totals = SweepTotals::default();
        inner.chunks.retain(|c| {
            if c.session == *session {
                totals.rows += 1;
                totals.bytes += c.bytes.len() as u64;
                false
            } else {
                true
            }
        });
        Ok(totals)
    }

    async fn finalize_upload(
        &self,
        session: &Uuid,
        digest: &OciDigest,
    ) -> Result<FinalizeOutcome> {
        let mut inner = self.lock();

        let mut indices: Vec<i64> = inner
            .chunks
            .iter()
            .filter(|c| c.session == *session)
            .map(|c| c.index)
            .collect();
        indices.sort_unstable();
        if indices.is_empty() {
            return Err(Error::ChunkGap(*session));
        }
        for (i, index) in indices.iter().enumerate() {
            if *index != i as i64 {
                return Err(Error::ChunkGap(*session));
            }
        }

        let mut ordered: Vec<&ChunkRow> = inner
            .chunks
            .iter()
            .filter(|c| c.session == *session)
            .collect();
        ordered.sort_unstable_by_key(|c| c.index);

        let mut digester = OciDigest::digester();
        let mut contents = Vec::new();
        for chunk in ordered {
            digester.update(&chunk.bytes);
            contents.extend_from_slice(&chunk.bytes);
        }
        let computed = digester.finalize();
        if computed != *digest {
            return Err(Error::DigestMismatch {
                declared: String::from(digest),
                computed: String::from(&computed),
            });
        }

        let size = contents.len() as u64;
        let key = String::from(digest);
        let outcome = if inner.blobs.contains_key(&key) {
            FinalizeOutcome::AlreadyExists
        } else {
            inner.blobs.insert(key, contents);
            FinalizeOutcome::Created { size }
        };
        inner.chunks.retain(|c| c.session != *session);
        Ok(outcome)
    }

    async fn put_manifest(
        &self,
        name: &str,
        tag: &str,
        digest: &OciDigest,
        bytes: &[u8],
    ) -> Result<()> {
        let mut inner = self.lock();
        inner.manifests.retain(|m| m.name != name || m.tag != tag);
        inner.manifests.push(ManifestRow {
            name: name.to_string(),
            tag: tag.to_string(),
            digest: String::from(digest),
            bytes: bytes.to_vec(),
        });
        Ok(())
    }

    async fn get_manifest(
        &self,
        name: &str,
        reference: &ManifestRef,
    ) -> Result<Option<ManifestRecord>> {
        let inner = self.lock();
        let row = match reference {
            ManifestRef::Tag(tag) => inner
                .manifests
                .iter()
                .find(|m| m.name == name && m.tag == *tag),
            ManifestRef::Digest(digest) => {
                let digest = String::from(digest);
                inner
                    .manifests
                    .iter()
                    .find(|m| m.name == name && m.digest == digest)
            }
        };
        match row {
            Some(m) => Ok(Some(ManifestRecord {
                name: m.name.clone(),
                tag: m.tag.clone(),
                digest: OciDigest::try_from(m.digest.as_str())?,
                bytes: Bytes::from(m.bytes.clone()),
            })),
            None => Ok(None),
        }
    }

    async fn manifest_exists(&self, name: &str, tag: &str) -> Result<bool> {
        Ok(self
            .lock()
            .manifests
            .iter()
            .any(|m| m.name == name && (m.tag == tag || m.digest == tag)))
    }

    async fn digest_for(&self, name: &str, tag: &str) -> Result<Option<OciDigest>> {
        let inner = self.lock();
        match inner
            .manifests
            .iter()
            .find(|m| m.name == name && (m.tag == tag || m.digest == tag))
        {
            Some(m) => Ok(Some(OciDigest::try_from(m.digest.as_str())?)),
            None => Ok(None),
        }
    }

    async fn delete_manifest(&self, name: &str, tag: &str) -> Result<bool> {
        let mut inner = self.lock();
        let before = inner.manifests.len();
        inner.manifests.retain(|m| m.name != name || m.tag != tag);
        Ok(inner.manifests.len() < before)
    }

    async fn delete_repository(&self, name: &str) -> Result<u64> {
        let mut inner = self.lock();
        let before = inner.manifests.len();
        inner.manifests.retain(|m| m.name != name);
        Ok((before - inner.manifests.len()) as u64)
    }

    async fn list_repositories(&self) -> Result<Vec<String>> {
        let inner = self.lock();
        let mut names: Vec<String> = inner
            .manifests
            .iter()
            .map(|m| m.name.clone())
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        names.sort();
        Ok(names)
    }

    async fn list_tags(&self, name: &str) -> Result<Vec<String>> {
        let inner = self.lock();
        let mut tags: Vec<String> = inner
            .manifests
            .iter()
            .filter(|m| m.name == name)
            .map(|m| m.tag.clone())
            .collect();
        tags.sort();
        Ok(tags)
    }

    async fn scan(&self) -> Result<Vec<StoredRow>> {
        let inner = self.lock();
        let mut rows: Vec<StoredRow> = inner
            .chunks
            .iter()
            .map(|c| StoredRow {
                session_id: Some(c.session),
                chunk_index: Some(c.index),
                digest: None,
                size: c.bytes.len() as i64,
            })
            .collect();
        rows.extend(inner.blobs.iter().map(|(digest, bytes)| StoredRow {
            session_id: None,
            chunk_index: None,
            digest: Some(digest.clone()),
            size: bytes.len() as i64,
        }));
        Ok(rows)
    }

    async fn stats(&self) -> Result<StoreStats> {
        let inner = self.lock();
        let repositories = inner
            .manifests
            .iter()
            .map(|m| m.name.as_str())
            .collect::<HashSet<_>>()
            .len() as u64;
        let total_bytes = inner.chunks.iter().map(|c| c.bytes.len() as u64).sum::<u64>()
            + inner.blobs.values().map(|b| b.len() as u64).sum::<u64>();
        Ok(StoreStats {
            repositories,
            manifests: inner.manifests.len() as u64,
            blobs: inner.blobs.len() as u64,
            chunks: inner.chunks.len() as u64,
            total_bytes,
        })
    }

    async fn collect_garbage(&self, expired_sessions: &[Uuid]) -> Result<GcReport> {
        let mut inner = self.lock();
        let mut report = GcReport::default();

        // phase 1: chunk sweep
        let expired: HashSet<&Uuid> = expired_sessions.iter().collect();
        inner.chunks.retain(|c| {
            if expired.contains(&c.session) {
                report.blobs_removed += 1;
                report.bytes_freed += c.bytes.len() as u64;
                false
            } else {
                true
            }
        });

        // phase 2: reference set
        let manifest_refs: Vec<Vec<String>> = inner
            .manifests
            .iter()
            .map(|m| referenced_digests(&m.bytes))
            .collect();
        let referenced: HashSet<String> =
            manifest_refs.iter().flatten().cloned().collect();

        // phase 3: orphan blob sweep
        let mut removed: HashSet<String> = HashSet::new();
        inner.blobs.retain(|digest, bytes| {
            if referenced.contains(digest) {
                true
            } else {
                removed.insert(digest.clone());
                report.blobs_removed += 1;
                report.bytes_freed += bytes.len() as u64;
                false
            }
        });

        // phase 4: orphan manifest sweep; must evaluate after phase 3 so
        // "just freed" is distinguishable from "never stored"
        let present: HashSet<String> = inner.blobs.keys().cloned().collect();
        let mut keep = manifest_refs.iter().map(|refs| {
            !refs
                .iter()
                .any(|d| !present.contains(d) && !removed.contains(d))
        });
        inner.manifests.retain(|_| {
            if keep.next().unwrap_or(true) {
                true
            } else {
                report.manifests_removed += 1;
                false
            }
        });

        Ok(report)
    }

    async fn gc_stats(&self) -> Result<GcStats> {
        let inner = self.lock();
        let referenced: HashSet<String> = inner
            .manifests
            .iter()
            .flat_map(|m| referenced_digests(&m.bytes))
            .collect();

        let mut stats = GcStats {
            chunks: inner.chunks.len() as u64,
            manifests: inner.manifests.len() as u64,
            ..GcStats::default()
        };
        for chunk in &inner.chunks {
            stats.total_bytes += chunk.bytes.len() as u64;
        }
        for (digest, bytes) in &inner.blobs {
            stats.blobs += 1;
            stats.total_bytes += bytes.len() as u64;
            if !referenced.contains(digest) {
                stats.unreferenced_blobs += 1;
                stats.unreferenced_bytes += bytes.len() as u64;
            }
        }
        Ok(stats)
    }

    async fn attempt_recovery(&self) -> Result<bool> {
        Ok(true)
    }
}

//! Storage interface for the registry engine.
//!
//! All durable state lives behind [`RegistryStore`]: the content-addressed
//! blob table (chunk rows and finalized rows) and the manifest index. The
//! production implementation is [`SqliteStore`]; [`MemoryStore`] implements
//! the same contract on hash maps and backs the test suite.
//!
//! Every method is one transaction from the caller's point of view.
//! Multi-statement sequences that must be atomic (finalize-stitch, manifest
//! upsert, delete-if-exists, the garbage collection phases) happen inside a
//! single storage transaction so no intermediate state is observable.

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use hyper::body::Body;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::{DistributionErrorCode, Error, Result};
use crate::oci_digest::OciDigest;

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::{SqliteConfig, SqliteStore};

type TryBytes = std::result::Result<Bytes, Box<dyn std::error::Error + Send + Sync>>;

/// Streamed blob contents; the stream's lifetime is bounded by the caller.
pub type BlobBody = BoxStream<'static, TryBytes>;

/// A finalized, digest-addressed blob.
#[derive(Clone, Debug)]
pub struct BlobRecord {
    pub digest: OciDigest,
    pub size: i64,
}

/// A stored manifest document. Bytes are kept verbatim; the media type is
/// inferred from the document on the way out.
#[derive(Clone, Debug)]
pub struct ManifestRecord {
    pub name: String,
    pub tag: String,
    pub digest: OciDigest,
    pub bytes: Bytes,
}

pub const DOCKER_MANIFEST_V2: &str = "application/vnd.docker.distribution.manifest.v2+json";
pub const OCI_MANIFEST_V1: &str = "application/vnd.oci.image.manifest.v1+json";

#[derive(Deserialize)]
struct MediaTypeProbe {
    #[serde(rename = "mediaType")]
    media_type: Option<String>,
}

impl ManifestRecord {
    pub fn size(&self) -> i64 {
        self.bytes.len() as i64
    }

    /// Media type as declared by the document's `mediaType` field, falling
    /// back to the Docker v2 schema 2 type.
    pub fn media_type(&self) -> String {
        serde_json::from_slice::<MediaTypeProbe>(&self.bytes)
            .ok()
            .and_then(|p| p.media_type)
            .unwrap_or_else(|| DOCKER_MANIFEST_V2.to_string())
    }
}

/// Reference to a manifest: the `<reference>` portion of
/// `/v2/<name>/manifests/<reference>`, either a digest or a tag matching
/// `[a-zA-Z0-9_][a-zA-Z0-9._-]{0,127}`.
#[derive(Clone, Debug)]
pub enum ManifestRef {
    Digest(OciDigest),
    Tag(String),
}

impl std::str::FromStr for ManifestRef {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        if let Ok(dgst) = OciDigest::try_from(s) {
            return Ok(Self::Digest(dgst));
        }
        static RE: Lazy<Regex> =
            Lazy::new(|| Regex::new(r"^[a-zA-Z0-9_][a-zA-Z0-9._-]{0,127}$").unwrap());

        if RE.is_match(s) {
            return Ok(Self::Tag(String::from(s)));
        }

        Err(Error::DistributionSpecError(
            DistributionErrorCode::ManifestInvalid,
        ))
    }
}

impl ManifestRef {
    /// The string stored in (or matched against) the manifest table's tag
    /// column. Digest references are keyed by their canonical encoding.
    pub fn key(&self) -> String {
        match self {
            ManifestRef::Digest(d) => String::from(d),
            ManifestRef::Tag(t) => t.clone(),
        }
    }
}

/// One row of the blob table, as reported by [`RegistryStore::scan`].
/// Chunk rows carry a session and index; finalized rows carry a digest.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredRow {
    pub session_id: Option<Uuid>,
    pub chunk_index: Option<i64>,
    pub digest: Option<String>,
    pub size: i64,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct ChunkStats {
    pub count: i64,
    pub bytes: u64,
}

/// Rows and bytes removed by a chunk sweep.
#[derive(Clone, Copy, Debug, Default)]
pub struct SweepTotals {
    pub rows: u64,
    pub bytes: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FinalizeOutcome {
    /// A new finalized row was inserted.
    Created { size: u64 },
    /// The digest was already finalized (by this or a racing session).
    /// The session's chunks have been discarded; callers treat this as
    /// success.
    AlreadyExists,
}

#[derive(Clone, Copy, Debug, Default, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct GcReport {
    pub blobs_removed: u64,
    pub bytes_freed: u64,
    pub manifests_removed: u64,
}

#[derive(Clone, Copy, Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GcStats {
    pub blobs: u64,
    pub chunks: u64,
    pub manifests: u64,
    pub total_bytes: u64,
    pub unreferenced_blobs: u64,
    pub unreferenced_bytes: u64,
}

#[derive(Clone, Copy, Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreStats {
    pub repositories: u64,
    pub manifests: u64,
    pub blobs: u64,
    pub chunks: u64,
    pub total_bytes: u64,
}

/// Durable, transactional storage for blobs, chunks and manifests.
#[async_trait]
pub trait RegistryStore: Send + Sync + 'static {
    /// True iff a finalized row with this digest exists.
    async fn blob_exists(&self, digest: &OciDigest) -> Result<bool>;

    /// Open a streamed read of a finalized blob.
    async fn get_blob(&self, digest: &OciDigest) -> Result<Option<(BlobRecord, BlobBody)>>;

    /// Remove a finalized blob. Idempotent; reports whether a row existed.
    async fn delete_blob(&self, digest: &OciDigest) -> Result<bool>;

    /// Stream a chunk body to durable storage and record it as
    /// `(session, index, bytes, size, digest = NULL)`. Returns the number
    /// of bytes written. Bodies are spooled to a bounded temp region, never
    /// accumulated in memory.
    async fn put_chunk(&self, session: &Uuid, index: i64, body: Body) -> Result<u64>;

    /// Number of chunk rows (digest = NULL only) for the session.
    async fn chunk_count(&self, session: &Uuid) -> Result<i64>;

    /// Chunk row count and byte total for the session.
    async fn chunk_stats(&self, session: &Uuid) -> Result<ChunkStats>;

    /// Distinct session ids that still own chunk rows.
    async fn chunk_sessions(&self) -> Result<Vec<Uuid>>;

    /// Drop all chunk rows for a session.
    async fn delete_session_chunks(&self, session: &Uuid) -> Result<SweepTotals>;

    /// Stitch a session's chunks into a finalized blob: verify the indices
    /// form a dense prefix, hash while concatenating, compare against the
    /// declared digest, insert the finalized row and delete the chunk rows,
    /// all in one transaction. On `ChunkGap`/`DigestMismatch` the chunks
    /// are left intact for retry.
    async fn finalize_upload(&self, session: &Uuid, digest: &OciDigest)
        -> Result<FinalizeOutcome>;

    /// Transactional upsert of `(name, tag)`.
    async fn put_manifest(
        &self,
        name: &str,
        tag: &str,
        digest: &OciDigest,
        bytes: &[u8],
    ) -> Result<()>;

    /// Look up by tag or digest.
    async fn get_manifest(&self, name: &str, reference: &ManifestRef)
        -> Result<Option<ManifestRecord>>;

    /// True iff a manifest row matches the key. The document bytes are not
    /// read. The key matches the tag column or the digest column; tags
    /// cannot collide with digest strings because reference parsing
    /// prefers digests.
    async fn manifest_exists(&self, name: &str, tag: &str) -> Result<bool>;

    /// Resolve a key (tag or digest string) to the stored manifest digest
    /// without reading the document bytes.
    async fn digest_for(&self, name: &str, tag: &str) -> Result<Option<OciDigest>>;

    /// Atomic delete-if-exists; reports whether a row was removed.
    async fn delete_manifest(&self, name: &str, tag: &str) -> Result<bool>;

    /// Delete every manifest under the name; returns the count removed.
    async fn delete_repository(&self, name: &str) -> Result<u64>;

    /// Distinct repository names present in the manifest index.
    async fn list_repositories(&self) -> Result<Vec<String>>;

    async fn list_tags(&self, name: &str) -> Result<Vec<String>>;

    /// Every row of the blob table, chunk and finalized alike.
    async fn scan(&self) -> Result<Vec<StoredRow>>;

    async fn stats(&self) -> Result<StoreStats>;

    /// Garbage collection. One transaction covering: (1) chunk sweep for
    /// the given expired sessions, (2) reference-set extraction from every
    /// manifest's bytes, (3) set-difference delete of unreferenced
    /// finalized blobs, then (4) removal of manifests referencing digests
    /// that were never stored. Phase 3 runs before phase 4 so "just freed
    /// by this run" is distinguishable from "never present".
    async fn collect_garbage(&self, expired_sessions: &[Uuid]) -> Result<GcReport>;

    /// Non-mutating totals and unreferenced counts.
    async fn gc_stats(&self) -> Result<GcStats>;

    /// Run the engine's integrity verification after reported corruption.
    /// Returns whether the store considers itself healthy again.
    async fn attempt_recovery(&self) -> Result<bool>;
}

use hyper::body::Body;
use uuid::Uuid;

use crate::errors::{Error, Result};
use crate::metadata::FinalizeOutcome;
use crate::oci_digest::OciDigest;

use super::events::RegistryEvent;
use super::Registry;

/// Outcome of an upload initiation.
pub enum StartUpload {
    /// A new session was minted; the client PATCHes chunks at `location`.
    Started { session: Uuid, location: String },
    /// The declared digest is already finalized; no session was created
    /// and `location` is the canonical blob URL.
    AlreadyExists { location: String },
}

#[derive(Debug)]
pub struct ChunkAppended {
    pub session: Uuid,
    /// Where the next PATCH goes: the session path with the next index.
    pub location: String,
    /// Total bytes received for the session so far.
    pub total_bytes: u64,
}

#[derive(Debug)]
pub struct FinalizedUpload {
    pub digest: OciDigest,
    pub location: String,
}

// POST-initiate -> PATCH-chunks -> PUT-finalize. Sessions move through the
// store's chunk rows; the tracker carries the in-memory protocol state
// (repository, activity times, byte totals).
impl Registry {
    pub async fn start_upload(&self, name: &str, digest: Option<&str>) -> Result<StartUpload> {
        self.guard_write()?;

        if let Some(digest) = digest {
            let oci: OciDigest = digest.try_into()?;
            if self.intercept(self.store().blob_exists(&oci).await).await? {
                return Ok(StartUpload::AlreadyExists {
                    location: format!("/v2/{name}/blobs/{oci}"),
                });
            }
        }

        let session = self.sessions().mint(name);
        tracing::debug!("minted upload session {session} for {name}");
        Ok(StartUpload::Started {
            session,
            location: format!("/v2/uploads/{session}/0"),
        })
    }

    pub async fn append_chunk(
        &self,
        session: &Uuid,
        index: i64,
        body: Body,
    ) -> Result<ChunkAppended> {
        self.guard_write()?;

        if !self.sessions().contains(session) {
            return Err(Error::SessionUnknown(*session));
        }

        // the URL index must equal the current chunk count, which keeps
        // PATCHes serialized per session
        let expected = self.intercept(self.store().chunk_count(session).await).await?;
        if index != expected {
            return Err(Error::ChunkIndexMismatch {
                session: *session,
                expected,
                got: index,
            });
        }

        let written = self
            .intercept(self.store().put_chunk(session, index, body).await)
            .await?;
        let total_bytes = self
            .sessions()
            .record_chunk(session, written)
            .unwrap_or(written);

        Ok(ChunkAppended {
            session: *session,
            location: format!("/v2/uploads/{}/{}", session, index + 1),
            total_bytes,
        })
    }

    pub async fn finalize_upload(&self, session: &Uuid, digest: &str) -> Result<FinalizedUpload> {
        self.guard_write()?;

        let oci: OciDigest = digest.try_into()?;
        let state = self
            .sessions()
            .get(session)
            .ok_or(Error::SessionUnknown(*session))?;

        // ChunkGap and DigestMismatch leave the session (and its chunks)
        // intact so the client can retry the PUT
        let outcome = self
            .intercept(self.store().finalize_upload(session, &oci).await)
            .await?;
        self.sessions().remove(session);

        match outcome {
            FinalizeOutcome::Created { size } => {
                self.emit(&RegistryEvent::BlobFinalized {
                    digest: String::from(&oci),
                    size,
                });
            }
            FinalizeOutcome::AlreadyExists => {
                tracing::debug!("digest {oci} already finalized; session {session} discarded");
            }
        }

        Ok(FinalizedUpload {
            digest: oci,
            location: format!("/v2/{}/blobs/{}", state.repository, digest),
        })
    }
}

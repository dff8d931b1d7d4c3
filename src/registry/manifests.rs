use bytes::Bytes;

use crate::errors::{DistributionErrorCode, Error, Result};
use crate::metadata::{ManifestRecord, ManifestRef, DOCKER_MANIFEST_V2, OCI_MANIFEST_V1};
use crate::oci_digest::{referenced_digests, OciDigest};

use super::events::RegistryEvent;
use super::Registry;

const SUPPORTED_MANIFEST_TYPES: [&str; 2] = [DOCKER_MANIFEST_V2, OCI_MANIFEST_V1];

pub struct ManifestPut {
    pub digest: OciDigest,
    /// Digests the manifest references that are not (yet) finalized blobs.
    /// Not an error: clients may push manifest and layers in any order.
    pub missing_blobs: Vec<String>,
}

impl Registry {
    pub async fn put_manifest(
        &self,
        name: &str,
        reference: &ManifestRef,
        content_type: &str,
        bytes: Bytes,
    ) -> Result<ManifestPut> {
        self.guard_write()?;

        if !SUPPORTED_MANIFEST_TYPES.contains(&content_type) {
            return Err(Error::UnsupportedManifestType(content_type.to_string()));
        }

        // the digest of the exact request bytes is the manifest's identity
        let digest = OciDigest::from_content(&bytes);
        if let ManifestRef::Digest(declared) = reference {
            if *declared != digest {
                return Err(Error::DistributionSpecError(
                    DistributionErrorCode::DigestInvalid,
                ));
            }
        }

        self.intercept(
            self.store()
                .put_manifest(name, &reference.key(), &digest, &bytes)
                .await,
        )
        .await?;

        let mut missing_blobs = Vec::new();
        for referenced in referenced_digests(&bytes) {
            let present = match OciDigest::try_from(referenced.as_str()) {
                Ok(d) => self.intercept(self.store().blob_exists(&d).await).await?,
                Err(_) => false,
            };
            if !present {
                missing_blobs.push(referenced);
            }
        }
        if !missing_blobs.is_empty() {
            tracing::warn!(
                "manifest {name}:{} references blobs not yet stored: {}",
                reference.key(),
                missing_blobs.join(", ")
            );
        }

        self.emit(&RegistryEvent::RepositoryMutated {
            name: name.to_string(),
        });

        Ok(ManifestPut {
            digest,
            missing_blobs,
        })
    }

    pub async fn get_manifest(
        &self,
        name: &str,
        reference: &ManifestRef,
    ) -> Result<Option<ManifestRecord>> {
        self.intercept(self.store().get_manifest(name, reference).await)
            .await
    }

    /// Existence check without reading the stored document.
    pub async fn manifest_exists(&self, name: &str, reference: &ManifestRef) -> Result<bool> {
        self.intercept(self.store().manifest_exists(name, &reference.key()).await)
            .await
    }

    /// Resolve a reference to its stored digest without reading the
    /// stored document.
    pub async fn manifest_digest(
        &self,
        name: &str,
        reference: &ManifestRef,
    ) -> Result<Option<OciDigest>> {
        self.intercept(self.store().digest_for(name, &reference.key()).await)
            .await
    }

    /// Delete-if-exists; reports whether a manifest was removed (202 vs
    /// 404 at the API surface).
    pub async fn delete_manifest(&self, name: &str, reference: &ManifestRef) -> Result<bool> {
        self.guard_write()?;

        let tag = match reference {
            ManifestRef::Tag(tag) => tag.clone(),
            // digest references resolve to the stored row's key first
            ManifestRef::Digest(_) => match self.get_manifest(name, reference).await? {
                Some(record) => record.tag,
                None => return Ok(false),
            },
        };

        let deleted = self
            .intercept(self.store().delete_manifest(name, &tag).await)
            .await?;
        if deleted {
            self.emit(&RegistryEvent::ManifestDeleted {
                name: name.to_string(),
                tag,
            });
        }
        Ok(deleted)
    }

    /// Delete every manifest under the name and reclaim whatever that
    /// orphaned.
    pub async fn delete_repository(&self, name: &str) -> Result<u64> {
        self.guard_write()?;

        let deleted = self
            .intercept(self.store().delete_repository(name).await)
            .await?;
        if deleted > 0 {
            self.emit(&RegistryEvent::RepositoryDeleted {
                name: name.to_string(),
                manifests: deleted,
            });
            self.run_gc().await?;
        }
        Ok(deleted)
    }

    pub async fn list_repositories(&self) -> Result<Vec<String>> {
        self.intercept(self.store().list_repositories().await).await
    }

    pub async fn list_tags(&self, name: &str) -> Result<Vec<String>> {
        self.intercept(self.store().list_tags(name).await).await
    }
}

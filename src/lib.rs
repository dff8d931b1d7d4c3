mod config;
pub use config::{AuthConfig, CleanupConfig, Config, StorageBackend};

mod errors;
pub use errors::{DistributionErrorCode, Error, Result};

mod oci_digest;
pub use oci_digest::{referenced_digests, Digester, OciDigest};

pub mod http;
pub mod metadata;
pub mod registry;

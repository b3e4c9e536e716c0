//! OCI image metadata for the kiln build engine.
//!
//! Models the slices of the OCI and Docker image specs that the engine
//! actually reads and writes, plus the registry transport seam:
//!
//! ```text
//! kiln-oci
//!  ├── config    — image config JSON: history, rootfs.diff_ids, platform
//!  ├── index     — image index (manifest list) with per-instance platforms
//!  ├── reference — store-level image references (id / tag / digest)
//!  └── transport — Transport trait + oci-client-backed adapter
//! ```

#![allow(clippy::missing_docs_in_private_items)]

mod config;
mod index;
mod reference;
pub mod transport;

use std::fmt;

pub use config::{HealthcheckConfig, HistoryEntry, ImageConfig, Platform, RootFs, RuntimeConfig};
pub use index::{Descriptor, ImageIndex};
pub use reference::ImageRef;
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};

/// Result type for kiln-oci operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors from image-metadata and registry operations.
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The image reference string could not be parsed.
    #[error("invalid image reference: {0}")]
    InvalidReference(String),

    /// An image, blob, or manifest was not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// OCI registry protocol error.
    #[error("registry: {0}")]
    Registry(String),

    /// The operation was cancelled.
    #[error("operation cancelled")]
    Cancelled,

    /// Filesystem I/O error.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// JSON parsing error.
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// OCI image manifest media type.
pub const OCI_MANIFEST_TYPE: &str = "application/vnd.oci.image.manifest.v1+json";
/// Docker schema-2 image manifest media type.
pub const DOCKER_MANIFEST_TYPE: &str = "application/vnd.docker.distribution.manifest.v2+json";
/// OCI image index media type.
pub const OCI_INDEX_TYPE: &str = "application/vnd.oci.image.index.v1+json";
/// Docker manifest list media type.
pub const DOCKER_LIST_TYPE: &str = "application/vnd.docker.distribution.manifest.list.v2+json";
/// OCI image config media type.
pub const OCI_CONFIG_TYPE: &str = "application/vnd.oci.image.config.v1+json";

/// Store big-data key for a manifest-list's instance map.
pub const INSTANCES_DATA_KEY: &str = "instances.json";
/// Store big-data key for a manifest-list's artifact metadata.
pub const ARTIFACTS_DATA_KEY: &str = "artifacts.json";
/// Store big-data key for an image's manifest digest.
pub const MANIFEST_DIGEST_KEY: &str = "digest-manifest";

/// A content digest in `algorithm:hex` form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Digest(String);

impl Digest {
    /// Wraps a pre-formed `algorithm:hex` string.
    pub fn new(s: impl Into<String>) -> Result<Self> {
        let s = s.into();
        match s.split_once(':') {
            Some((algo, hex))
                if !algo.is_empty() && !hex.is_empty() && hex.bytes().all(|b| b.is_ascii_hexdigit()) =>
            {
                Ok(Self(s))
            }
            _ => Err(Error::InvalidReference(s)),
        }
    }

    /// SHA-256 digest of a byte slice.
    pub fn sha256_of(data: &[u8]) -> Self {
        Self(format!("sha256:{:x}", Sha256::digest(data)))
    }

    /// The digest algorithm (`sha256`).
    pub fn algorithm(&self) -> &str {
        self.0.split_once(':').map_or("", |(a, _)| a)
    }

    /// The hex-encoded digest value, without the algorithm prefix.
    pub fn hex(&self) -> &str {
        self.0.split_once(':').map_or(self.0.as_str(), |(_, h)| h)
    }

    /// The full `algorithm:hex` string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_roundtrip() {
        let d = Digest::sha256_of(b"abc");
        assert_eq!(d.algorithm(), "sha256");
        assert_eq!(d.hex().len(), 64);
        assert!(Digest::new(d.as_str()).is_ok());
    }

    #[test]
    fn digest_rejects_garbage() {
        assert!(Digest::new("not a digest").is_err());
        assert!(Digest::new("sha256:").is_err());
        assert!(Digest::new("sha256:zz").is_err());
    }
}

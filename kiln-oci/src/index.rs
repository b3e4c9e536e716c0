//! Image index (manifest list) model.
//!
//! Multi-platform builds produce one image per platform plus an index whose
//! manifests are annotated with their platform triple. The engine persists
//! the index through the store's big-data keys (`instances.json`).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{Digest, OCI_INDEX_TYPE, Platform, Result};

/// A reference to one manifest inside an index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Descriptor {
    /// Media type of the referenced manifest.
    #[serde(rename = "mediaType")]
    pub media_type: String,
    /// Content digest of the referenced manifest.
    pub digest: Digest,
    /// Size of the referenced manifest, in bytes.
    pub size: u64,
    /// Platform of the referenced image.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<Platform>,
    /// Free-form annotations.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,
}

/// An OCI image index / Docker manifest list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageIndex {
    /// Always 2.
    #[serde(rename = "schemaVersion")]
    pub schema_version: u32,
    /// Index media type.
    #[serde(rename = "mediaType", default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    /// The per-platform manifests.
    #[serde(default)]
    pub manifests: Vec<Descriptor>,
    /// Free-form annotations on the index itself.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,
}

impl Default for ImageIndex {
    fn default() -> Self {
        Self {
            schema_version: 2,
            media_type: Some(OCI_INDEX_TYPE.to_owned()),
            manifests: Vec::new(),
            annotations: None,
        }
    }
}

impl ImageIndex {
    /// Parses an index blob.
    pub fn from_json(data: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(data)?)
    }

    /// Serializes the index.
    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Adds (or replaces) the instance for a platform.
    ///
    /// An existing descriptor for the same platform is replaced rather than
    /// duplicated, so re-running a per-platform sub-build is idempotent.
    pub fn set_instance(&mut self, descriptor: Descriptor) {
        if let Some(existing) = self
            .manifests
            .iter_mut()
            .find(|d| d.platform == descriptor.platform)
        {
            *existing = descriptor;
        } else {
            self.manifests.push(descriptor);
        }
    }

    /// Looks up the instance digest for a platform.
    pub fn instance_for(&self, platform: &Platform) -> Option<&Descriptor> {
        self.manifests
            .iter()
            .find(|d| d.platform.as_ref() == Some(platform))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(os: &str, arch: &str, seed: &[u8]) -> Descriptor {
        Descriptor {
            media_type: crate::OCI_MANIFEST_TYPE.to_owned(),
            digest: Digest::sha256_of(seed),
            size: seed.len() as u64,
            platform: Platform::parse(&format!("{os}/{arch}")),
            annotations: None,
        }
    }

    #[test]
    fn set_instance_replaces_same_platform() {
        let mut index = ImageIndex::default();
        index.set_instance(descriptor("linux", "amd64", b"one"));
        index.set_instance(descriptor("linux", "arm64", b"two"));
        index.set_instance(descriptor("linux", "amd64", b"three"));
        assert_eq!(index.manifests.len(), 2);

        let amd = index
            .instance_for(&Platform::parse("linux/amd64").unwrap())
            .unwrap();
        assert_eq!(amd.digest, Digest::sha256_of(b"three"));
    }

    #[test]
    fn json_roundtrip() {
        let mut index = ImageIndex::default();
        index.set_instance(descriptor("linux", "arm64", b"x"));
        let data = index.to_json().unwrap();
        assert_eq!(ImageIndex::from_json(&data).unwrap(), index);
    }
}

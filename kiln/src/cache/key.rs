//! Remote cache-key derivation.
//!
//! When `--cache-from`/`--cache-to` are configured, each step gets a
//! SHA-256 key streamed over everything that determines its output: the
//! parent layer chain, whether the step adds a layer, the step's
//! `created_by`, the output manifest type, and the full base history.
//! The key doubles as the remote cache image tag.

use kiln_oci::{Digest, HistoryEntry};
use sha2::{Digest as _, Sha256};
use time::format_description::well_known::Rfc3339;

/// Everything that feeds one step's cache key.
#[derive(Debug, Clone, Copy)]
pub struct CacheKeyInput<'a> {
    /// Diff IDs of the base image's layers, bottom-most first.
    pub parent_diff_ids: &'a [Digest],
    /// Whether this step commits a filesystem layer.
    pub build_adds_layer: bool,
    /// The step's `created_by` string.
    pub created_by: &'a str,
    /// Manifest media type of the output image.
    pub manifest_type: &'a str,
    /// History of the base image, oldest first.
    pub base_history: &'a [HistoryEntry],
}

/// Computes the hex cache key for one step.
pub fn cache_key(input: &CacheKeyInput<'_>) -> String {
    let mut hasher = Sha256::new();

    for diff_id in input.parent_diff_ids {
        hasher.update(diff_id.hex().as_bytes());
        hasher.update(b"\n");
    }
    hasher.update(if input.build_adds_layer {
        b"true" as &[u8]
    } else {
        b"false"
    });
    hasher.update(input.created_by.as_bytes());
    hasher.update(b"\n");
    hasher.update(input.manifest_type.as_bytes());
    hasher.update(b"\n");

    for entry in input.base_history {
        for field in [
            entry.created_by.clone().unwrap_or_default(),
            entry.author.clone().unwrap_or_default(),
            entry.comment.clone().unwrap_or_default(),
            entry
                .created
                .and_then(|at| at.format(&Rfc3339).ok())
                .unwrap_or_default(),
            entry.empty_layer.to_string(),
        ] {
            hasher.update(field.as_bytes());
            hasher.update(b"\n");
        }
        hasher.update(b"\n");
    }

    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_input<'a>(
        diff_ids: &'a [Digest],
        history: &'a [HistoryEntry],
    ) -> CacheKeyInput<'a> {
        CacheKeyInput {
            parent_diff_ids: diff_ids,
            build_adds_layer: true,
            created_by: "|0 /bin/sh -c true",
            manifest_type: kiln_oci::OCI_MANIFEST_TYPE,
            base_history: history,
        }
    }

    #[test]
    fn stable_for_identical_inputs() {
        let diff_ids = vec![Digest::sha256_of(b"layer0")];
        let history = vec![HistoryEntry {
            created_by: Some("/bin/sh -c #(nop) ENV A=1".into()),
            empty_layer: true,
            ..HistoryEntry::default()
        }];
        let a = cache_key(&base_input(&diff_ids, &history));
        let b = cache_key(&base_input(&diff_ids, &history));
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn every_field_participates() {
        let diff_ids = vec![Digest::sha256_of(b"layer0")];
        let history = vec![HistoryEntry::default()];
        let base = cache_key(&base_input(&diff_ids, &history));

        let mut other = base_input(&diff_ids, &history);
        other.build_adds_layer = false;
        assert_ne!(base, cache_key(&other));

        let mut other = base_input(&diff_ids, &history);
        other.created_by = "|0 /bin/sh -c false";
        assert_ne!(base, cache_key(&other));

        let mut other = base_input(&diff_ids, &history);
        other.manifest_type = kiln_oci::DOCKER_MANIFEST_TYPE;
        assert_ne!(base, cache_key(&other));

        let more_layers = vec![Digest::sha256_of(b"layer0"), Digest::sha256_of(b"layer1")];
        let other = base_input(&more_layers, &history);
        assert_ne!(base, cache_key(&other));

        let deeper = vec![HistoryEntry::default(), HistoryEntry::default()];
        let other = base_input(&diff_ids, &deeper);
        assert_ne!(base, cache_key(&other));
    }
}

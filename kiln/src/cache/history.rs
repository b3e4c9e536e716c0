//! Local cache probing: can a stored image substitute for running a step?
//!
//! A candidate matches when its layer parentage, manifest type, platform,
//! history, and diff IDs all line up with what executing the step on the
//! current working container would produce, and its newest history entry's
//! `created_by` equals the step's. Among matches the youngest wins.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use kiln_oci::{Digest, HistoryEntry, Platform};
use time::OffsetDateTime;
use tokio::sync::Mutex;

use crate::driver::Store;
use crate::Result;

/// Parsed per-image facts, cached to avoid re-reading OCI configs during
/// every probe.
#[derive(Debug, Clone)]
pub struct ImageInfo {
    /// Image platform.
    pub platform: Platform,
    /// Manifest media type.
    pub manifest_type: String,
    /// Full history, oldest first.
    pub history: Vec<HistoryEntry>,
    /// Layer diff IDs, bottom-most first.
    pub diff_ids: Vec<Digest>,
}

/// Cache of [`ImageInfo`] keyed by image ID; guarded by its own lock so
/// probes do not contend with the stage-state mutex.
#[derive(Debug, Default)]
pub struct ImageInfoCache {
    entries: Mutex<HashMap<String, Arc<ImageInfo>>>,
}

impl ImageInfoCache {
    /// An empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads (or recalls) the parsed facts for an image.
    pub async fn get(&self, store: &dyn Store, id: &str) -> Result<Arc<ImageInfo>> {
        if let Some(info) = self.entries.lock().await.get(id) {
            return Ok(Arc::clone(info));
        }
        // Config parse happens outside the lock; a racing duplicate parse
        // is cheaper than serializing every probe.
        let config = store.image_config(id).await?;
        let manifest_type = store.image_manifest_type(id).await?;
        let info = Arc::new(ImageInfo {
            platform: config.platform(),
            manifest_type,
            history: config.history,
            diff_ids: config.rootfs.diff_ids,
        });
        self.entries
            .lock()
            .await
            .insert(id.to_owned(), Arc::clone(&info));
        Ok(info)
    }
}

/// What the prober compares candidates against.
#[derive(Debug, Clone, Copy)]
pub struct CacheQuery<'a> {
    /// The working container's topmost layer ID.
    pub parent_layer: Option<&'a str>,
    /// Whether the step being probed commits a filesystem layer.
    pub build_adds_layer: bool,
    /// Manifest media type the build produces.
    pub manifest_type: &'a str,
    /// Target platform, when the build is platform-pinned.
    pub platform: Option<&'a Platform>,
    /// History of the base the step would run on, oldest first.
    pub base_history: &'a [HistoryEntry],
    /// Diff IDs of that base.
    pub base_diff_ids: &'a [Digest],
    /// The step's `created_by`.
    pub created_by: &'a str,
    /// Discard candidates older than this.
    pub ttl: Option<Duration>,
}

/// Finds the newest stored image that can substitute for executing the
/// step, or `None` when the step must run.
pub async fn find_cache_candidate(
    store: &dyn Store,
    info_cache: &ImageInfoCache,
    query: &CacheQuery<'_>,
) -> Result<Option<String>> {
    // A base whose non-empty history disagrees with its diff-ID count is
    // not something we can reason about; no candidate can match.
    let base_diff_entries = query
        .base_history
        .iter()
        .filter(|entry| !entry.empty_layer)
        .count();
    if base_diff_entries != query.base_diff_ids.len() {
        return Ok(None);
    }

    let now = OffsetDateTime::now_utc();
    let mut best: Option<(String, Option<OffsetDateTime>)> = None;

    for candidate in store.images().await? {
        if let Some(ttl) = query.ttl {
            let ttl = time::Duration::try_from(ttl).unwrap_or(time::Duration::MAX);
            let fresh = candidate
                .created
                .is_some_and(|created| now - created <= ttl);
            if !fresh {
                continue;
            }
        }

        if !top_layer_matches(store, &candidate.top_layer, query).await? {
            continue;
        }

        let info = match info_cache.get(store, &candidate.id).await {
            Ok(info) => info,
            // An image without a readable config cannot match; skip it.
            Err(_) => continue,
        };

        if info.manifest_type != query.manifest_type {
            continue;
        }
        if let Some(platform) = query.platform {
            if info.platform.os != platform.os
                || info.platform.architecture != platform.architecture
            {
                continue;
            }
        }
        if info.history.len() != query.base_history.len() + 1 {
            continue;
        }
        if info.history[..query.base_history.len()] != *query.base_history {
            continue;
        }

        let expected_diff_ids =
            base_diff_entries + usize::from(query.build_adds_layer);
        if info.diff_ids.len() != expected_diff_ids {
            continue;
        }
        if info.diff_ids[..query.base_diff_ids.len()] != *query.base_diff_ids {
            continue;
        }

        if info.history[query.base_history.len()]
            .created_by
            .as_deref()
            != Some(query.created_by)
        {
            continue;
        }

        let newer = match (&best, candidate.created) {
            (None, _) => true,
            (Some((_, None)), Some(_)) => true,
            (Some((_, Some(current))), Some(challenger)) => challenger > *current,
            _ => false,
        };
        if newer {
            best = Some((candidate.id, candidate.created));
        }
    }

    Ok(best.map(|(id, _)| id))
}

/// Clause 1: the candidate's layer parentage lines up with the working
/// container. A layer-adding step matches when the candidate's top layer
/// is a child of the container's top layer; a metadata-only step matches
/// when the top layers are the same.
async fn top_layer_matches(
    store: &dyn Store,
    candidate_top: &Option<String>,
    query: &CacheQuery<'_>,
) -> Result<bool> {
    if query.build_adds_layer {
        let Some(top) = candidate_top else {
            return Ok(false);
        };
        let parent = match store.layer(top).await? {
            Some(layer) => layer.parent,
            None => return Ok(false),
        };
        Ok(parent.as_deref() == query.parent_layer)
    } else {
        Ok(candidate_top.as_deref() == query.parent_layer)
    }
}

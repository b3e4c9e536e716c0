//! Resolution of `FROM` / `--from=` / `--mount=from=` targets.
//!
//! All three accept the same namespace, with the same precedence:
//! additional build contexts override stages, numeric indices rewrite to
//! the stage at that position, and anything else is a stored image. Every
//! component dispatches on the resulting sum type instead of re-probing
//! strings.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::options::AdditionalContext;

/// Where a `from`-style reference resolves to.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum FromSource {
    /// An earlier stage of this build, by position.
    Stage(usize),
    /// An additional build context naming an image.
    ContextImage(String),
    /// An additional build context naming a local directory.
    ContextPath(PathBuf),
    /// An additional build context naming a URL, with its download memo.
    ContextUrl {
        /// The URL to download.
        url: String,
        /// Memoized extraction directory, filled on first download.
        cache: Arc<Mutex<Option<PathBuf>>>,
    },
    /// A stored (or pullable) image reference.
    Image(String),
}

impl FromSource {
    /// Resolves a reference against the build's namespaces.
    ///
    /// `stage_position` maps stage names (aliases or stringified indices)
    /// to positions; `current_stage` bounds numeric rewriting so a stage
    /// can only reach stages declared before it.
    pub fn resolve(
        name: &str,
        current_stage: usize,
        stage_position: &dyn Fn(&str) -> Option<usize>,
        contexts: &HashMap<String, AdditionalContext>,
    ) -> Self {
        if let Some(context) = contexts.get(name) {
            if context.is_image {
                let value = context
                    .value
                    .strip_prefix("docker://")
                    .unwrap_or(&context.value);
                return Self::ContextImage(value.to_owned());
            }
            if context.is_url {
                return Self::ContextUrl {
                    url: context.value.clone(),
                    cache: Arc::clone(&context.downloaded_cache),
                };
            }
            return Self::ContextPath(PathBuf::from(&context.value));
        }

        if let Ok(index) = name.parse::<usize>() {
            if index < current_stage {
                return Self::Stage(index);
            }
            return Self::Image(name.to_owned());
        }

        match stage_position(name) {
            Some(position) if position < current_stage => Self::Stage(position),
            _ => Self::Image(name.to_owned()),
        }
    }

    /// The stage position, when this source is a stage.
    pub fn stage(&self) -> Option<usize> {
        match self {
            Self::Stage(position) => Some(*position),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn positions(name: &str) -> Option<usize> {
        match name {
            "builder" => Some(0),
            "late" => Some(5),
            _ => None,
        }
    }

    #[test]
    fn contexts_override_stages() {
        let mut contexts = HashMap::new();
        contexts.insert(
            "builder".to_owned(),
            AdditionalContext::image("docker://alpine:3.20"),
        );
        let source = FromSource::resolve("builder", 2, &positions, &contexts);
        assert!(matches!(source, FromSource::ContextImage(ref v) if v == "alpine:3.20"));
    }

    #[test]
    fn numeric_rewrites_only_earlier_stages() {
        let contexts = HashMap::new();
        assert_eq!(
            FromSource::resolve("0", 2, &positions, &contexts).stage(),
            Some(0)
        );
        assert!(matches!(
            FromSource::resolve("2", 2, &positions, &contexts),
            FromSource::Image(_)
        ));
    }

    #[test]
    fn names_resolve_to_stage_or_image() {
        let contexts = HashMap::new();
        assert_eq!(
            FromSource::resolve("builder", 1, &positions, &contexts).stage(),
            Some(0)
        );
        // A stage declared later is not reachable; treat as an image.
        assert!(matches!(
            FromSource::resolve("late", 1, &positions, &contexts),
            FromSource::Image(_)
        ));
        assert!(matches!(
            FromSource::resolve("debian:12", 1, &positions, &contexts),
            FromSource::Image(_)
        ));
    }

    #[test]
    fn url_context_shares_download_memo() {
        let mut contexts = HashMap::new();
        contexts.insert("tarball".to_owned(), AdditionalContext::url("https://x/y.tar"));
        let a = FromSource::resolve("tarball", 1, &positions, &contexts);
        let FromSource::ContextUrl { cache, .. } = a else {
            panic!("expected URL context");
        };
        // Same Arc as the option map's memo.
        assert!(Arc::ptr_eq(
            &cache,
            &contexts.get("tarball").unwrap().downloaded_cache
        ));
    }
}

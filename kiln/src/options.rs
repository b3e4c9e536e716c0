//! The recognized build-configuration surface.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use kiln_oci::{OCI_MANIFEST_TYPE, Platform};
use tokio::sync::Mutex;

use crate::{Error, Result};

/// Base-image pull behavior.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[non_exhaustive]
pub enum PullPolicy {
    /// Always pull, even when present locally.
    Always,
    /// Pull only when the image is missing locally.
    #[default]
    IfMissing,
    /// Pull when the registry copy is newer than the local one.
    IfNewer,
    /// Never pull; missing images are an error.
    Never,
}

/// Network mode for RUN instructions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[non_exhaustive]
pub enum NetworkMode {
    /// The runner's default network namespace handling.
    #[default]
    Default,
    /// Share the host network.
    Host,
    /// A fresh network namespace with no interfaces configured.
    None,
    /// Networking disabled entirely.
    Disabled,
}

/// A `{true, false, unset}` option; `unset` defers to a per-call default.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Tristate {
    /// Explicitly enabled.
    True,
    /// Explicitly disabled.
    False,
    /// Not specified.
    #[default]
    Unset,
}

impl Tristate {
    /// Resolves against the default used when unset.
    pub fn unwrap_or(self, default: bool) -> bool {
        match self {
            Self::True => true,
            Self::False => false,
            Self::Unset => default,
        }
    }

    /// Whether the value was explicitly set to `false`.
    pub fn is_false(self) -> bool {
        self == Self::False
    }
}

/// A named alternate source usable wherever a stage reference is accepted.
#[derive(Debug, Clone)]
pub struct AdditionalContext {
    /// Image reference, URL, or local path, depending on the flags below.
    pub value: String,
    /// The value names an image.
    pub is_image: bool,
    /// The value is a URL to download.
    pub is_url: bool,
    /// Memoized download location for URL contexts; filled on first use.
    pub downloaded_cache: Arc<Mutex<Option<PathBuf>>>,
}

impl AdditionalContext {
    /// An image-backed context.
    pub fn image(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            is_image: true,
            is_url: false,
            downloaded_cache: Arc::new(Mutex::new(None)),
        }
    }

    /// A URL-backed context, downloaded (once) on first use.
    pub fn url(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            is_image: false,
            is_url: true,
            downloaded_cache: Arc::new(Mutex::new(None)),
        }
    }

    /// A local-directory context.
    pub fn path(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            is_image: false,
            is_url: false,
            downloaded_cache: Arc::new(Mutex::new(None)),
        }
    }
}

/// Build-arg names accepted without a matching ARG declaration.
///
/// Injected as immutable configuration; proxy variables are additionally
/// excluded from RUN cache keys unless re-declared by the script.
pub const BUILTIN_ALLOWED_ARGS: [&str; 14] = [
    "HTTP_PROXY",
    "HTTPS_PROXY",
    "FTP_PROXY",
    "NO_PROXY",
    "http_proxy",
    "https_proxy",
    "ftp_proxy",
    "no_proxy",
    "TARGETOS",
    "TARGETARCH",
    "TARGETVARIANT",
    "TARGETPLATFORM",
    "SOURCE_DATE_EPOCH",
    "BUILDPLATFORM",
];

/// Whether an arg name is in the built-in allowlist.
pub fn is_builtin_allowed_arg(name: &str) -> bool {
    BUILTIN_ALLOWED_ARGS.contains(&name)
}

/// Everything a caller can configure about one build.
#[derive(Debug, Clone)]
pub struct BuildOptions {
    /// The build context directory ADD/COPY sources resolve against.
    pub context_dir: PathBuf,
    /// Maximum concurrently-executing stages; `0` means 1.
    pub jobs: u32,
    /// Commit one layer per instruction instead of once per stage.
    pub layers: bool,
    /// Probe the layer cache before executing steps.
    pub use_cache: bool,
    /// Remote cache sources, tried in order.
    pub cache_from: Vec<String>,
    /// Remote cache sinks; every cache-keyed commit is pushed to each.
    pub cache_to: Vec<String>,
    /// Ignore cache candidates older than this.
    pub cache_ttl: Option<Duration>,
    /// Base-image pull behavior.
    pub pull_policy: PullPolicy,
    /// Platforms to build for; more than one fans out sub-builds.
    pub platforms: Vec<Platform>,
    /// Named alternate sources for `FROM` / `--from=` / `--mount=from=`.
    pub additional_contexts: HashMap<String, AdditionalContext>,
    /// Build-arg values supplied by the caller.
    pub args: HashMap<String, String>,
    /// Squash the final image into a single layer at commit.
    pub squash: bool,
    /// Remove intermediate working containers after a successful build.
    pub remove_intermediate_containers: bool,
    /// Remove intermediate containers even after a failed build.
    pub force_rm_intermediate_containers: bool,
    /// Final image name/reference.
    pub output: Option<String>,
    /// Extra names applied to the final image.
    pub additional_tags: Vec<String>,
    /// Write the final image ID to this file instead of the build log.
    pub iidfile: Option<PathBuf>,
    /// Force every timestamp to this epoch second.
    pub timestamp: Option<i64>,
    /// Clamp timestamps newer than this epoch second.
    pub source_date_epoch: Option<i64>,
    /// Rewrite layer mtimes to honor `source_date_epoch`.
    pub rewrite_timestamp: bool,
    /// Inherit labels from the base image.
    pub inherit_labels: Tristate,
    /// Inherit annotations from the base image.
    pub inherit_annotations: Tristate,
    /// Label keys to unset at commit.
    pub unset_labels: Vec<String>,
    /// Annotation keys to unset on the final image.
    pub unset_annotations: Vec<String>,
    /// `key=value` annotations applied to the final image.
    pub annotations: Vec<String>,
    /// `key=value` labels appended as a synthetic trailing LABEL step.
    pub labels: Vec<String>,
    /// `key=value` variables prepended as a synthetic leading ENV step.
    pub envs: Vec<String>,
    /// Stop after this named stage.
    pub target: Option<String>,
    /// Replace the first FROM's image reference.
    pub from_override: Option<String>,
    /// Emit resource-usage samples between steps.
    pub log_rusage: bool,
    /// Write rusage samples here instead of the build log.
    pub rusage_log_file: Option<PathBuf>,
    /// Skip stages not needed by the target (default on).
    pub skip_unused_stages: Tristate,
    /// Discard RUN-time changes under declared VOLUME paths.
    pub compat_volumes: Tristate,
    /// Add the builder identity label to committed images.
    pub identity_label: Tristate,
    /// Manifest media type of produced images.
    pub output_format: String,
    /// Manifest-list name collecting per-platform images.
    pub manifest: Option<String>,
    /// Network mode for RUN instructions.
    pub network: NetworkMode,
    /// Secret specs (`id=name[,src=path]`) offered to RUN mounts.
    pub secrets: Vec<String>,
    /// SSH agent sources offered to RUN mounts.
    pub ssh_sources: Vec<String>,
    /// Host volumes (`host:container[:options]`) bound into every RUN.
    pub volumes: Vec<String>,
    /// Registry retry attempts for pull/push.
    pub max_pull_push_retries: u32,
    /// Delay before the first registry retry.
    pub retry_delay: Duration,
    /// Mirror build-log output into this file.
    pub log_file: Option<PathBuf>,
    /// Suppress step banners.
    pub quiet: bool,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            context_dir: PathBuf::from("."),
            jobs: 1,
            layers: true,
            use_cache: true,
            cache_from: Vec::new(),
            cache_to: Vec::new(),
            cache_ttl: None,
            pull_policy: PullPolicy::default(),
            platforms: Vec::new(),
            additional_contexts: HashMap::new(),
            args: HashMap::new(),
            squash: false,
            remove_intermediate_containers: true,
            force_rm_intermediate_containers: false,
            output: None,
            additional_tags: Vec::new(),
            iidfile: None,
            timestamp: None,
            source_date_epoch: None,
            rewrite_timestamp: false,
            inherit_labels: Tristate::Unset,
            inherit_annotations: Tristate::Unset,
            unset_labels: Vec::new(),
            unset_annotations: Vec::new(),
            annotations: Vec::new(),
            labels: Vec::new(),
            envs: Vec::new(),
            target: None,
            from_override: None,
            log_rusage: false,
            rusage_log_file: None,
            skip_unused_stages: Tristate::Unset,
            compat_volumes: Tristate::Unset,
            identity_label: Tristate::Unset,
            output_format: OCI_MANIFEST_TYPE.to_owned(),
            manifest: None,
            network: NetworkMode::default(),
            secrets: Vec::new(),
            ssh_sources: Vec::new(),
            volumes: Vec::new(),
            max_pull_push_retries: 3,
            retry_delay: Duration::from_secs(2),
            log_file: None,
            quiet: false,
        }
    }
}

impl BuildOptions {
    /// The effective semaphore capacity (`jobs`, floored at 1).
    pub fn effective_jobs(&self) -> usize {
        self.jobs.max(1) as usize
    }

    /// Rejects conflicting option combinations before any work starts.
    pub fn validate(&self) -> Result<()> {
        if self.timestamp.is_some() && self.source_date_epoch.is_some() {
            return Err(Error::Options(
                "timestamp and source-date-epoch may not both be set".into(),
            ));
        }
        if self.platforms.len() > 1 && self.iidfile.is_some() {
            return Err(Error::Options(
                "a single image-ID file cannot record multiple platform builds".into(),
            ));
        }
        if self.platforms.len() > 1 && self.manifest.is_none() && self.output.is_some() {
            return Err(Error::Options(
                "building multiple platforms under one output name requires a manifest list".into(),
            ));
        }
        for annotation in &self.annotations {
            if !annotation.contains('=') {
                return Err(Error::Options(format!(
                    "annotation {annotation:?} is not in key=value form"
                )));
            }
        }
        if let Some(ttl) = self.cache_ttl {
            if ttl.is_zero() {
                return Err(Error::Options("cache TTL must be non-zero".into()));
            }
        }
        for secret in &self.secrets {
            if !secret.split(',').any(|part| part.starts_with("id=")) {
                return Err(Error::Options(format!(
                    "secret {secret:?} is missing an id= field"
                )));
            }
        }
        for volume in &self.volumes {
            if volume.splitn(3, ':').count() < 2 {
                return Err(Error::Options(format!(
                    "volume {volume:?} is not in host:container form"
                )));
            }
        }
        Ok(())
    }

    /// The timestamp-policy token mixed into cache metadata, if any.
    pub(crate) fn layer_mtime_token(&self) -> Option<String> {
        if let Some(at) = self.timestamp {
            return Some(format!("|force-mtime={at}"));
        }
        if self.rewrite_timestamp {
            if let Some(at) = self.source_date_epoch {
                return Some(format!("|clamp-mtime={at}"));
            }
        }
        None
    }
}

//! Collaborator contracts: the container runtime and the image store.
//!
//! The engine orchestrates; these traits do the privileged work. Both are
//! taken as `Arc<dyn …>` so tests can substitute in-memory fakes and
//! deployments can plug in whatever runtime and storage they carry.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use kiln_oci::{Digest, ImageConfig, Platform, RuntimeConfig};
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;

use crate::cache::ContentDigester;
use crate::options::{NetworkMode, PullPolicy};
use crate::Result;

/// Options for creating a working container from a base reference.
#[derive(Debug, Clone, Default)]
#[non_exhaustive]
pub struct BuilderOptions {
    /// Pull behavior for the base image.
    pub pull_policy: PullPolicy,
    /// Target platform constraint, if the build is platform-pinned.
    pub platform: Option<Platform>,
    /// Registry retry attempts for the base pull.
    pub max_pull_retries: u32,
    /// SELinux process/mount labels shared across the build's stages, as
    /// recorded by the first stage.
    pub labels: Vec<String>,
}

/// One mount added to a RUN invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunMount {
    /// Mount driver keyword (`bind`, `overlay`, `tmpfs`).
    pub kind: String,
    /// Host-side source path.
    pub source: PathBuf,
    /// Mount point inside the container.
    pub destination: String,
    /// Raw mount options (`ro`, `upperdir=…`).
    pub options: Vec<String>,
}

/// A stage (or image) rootfs bind-mounted into a RUN via `--mount=from=`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageMount {
    /// Mounted rootfs root on the host.
    pub source: PathBuf,
    /// Mount point inside the container.
    pub destination: String,
    /// Whether the mount is writable.
    pub writable: bool,
}

/// Options accepted by [`Container::run`].
#[derive(Debug, Clone, Default)]
#[non_exhaustive]
pub struct RunOptions {
    /// Environment as `KEY=value` strings.
    pub env: Vec<String>,
    /// Working directory.
    pub cwd: Option<String>,
    /// User (and optional group) to run as.
    pub user: Option<String>,
    /// Entry mounts (volume overlays, cache mounts).
    pub mounts: Vec<RunMount>,
    /// Secret specs made available to the step.
    pub secrets: Vec<String>,
    /// SSH agent sources made available to the step.
    pub ssh_sources: Vec<String>,
    /// Rootfs mounts of other stages/images for `--mount=from=`.
    pub stage_mounts: Vec<StageMount>,
    /// Network mode for the step.
    pub network: NetworkMode,
    /// Attach a terminal to the step.
    pub terminal: bool,
}

/// Options accepted by [`Container::commit`].
#[derive(Debug, Clone, Default)]
#[non_exhaustive]
pub struct CommitOptions {
    /// History `created_by` for the new entry.
    pub created_by: String,
    /// History author.
    pub author: Option<String>,
    /// The step produced no filesystem diff.
    pub empty_layer: bool,
    /// Name to apply to the committed image, if any.
    pub output_name: Option<String>,
    /// Squash all layers into one.
    pub squash: bool,
    /// Manifest media type to produce.
    pub format: String,
    /// The image's runtime configuration, as maintained by the stage.
    pub runtime_config: RuntimeConfig,
    /// Creation timestamp override (timestamp policy already applied).
    pub created: Option<OffsetDateTime>,
    /// Rewrite layer mtimes to the creation timestamp.
    pub rewrite_timestamp: bool,
    /// Inherit labels from the base image.
    pub inherit_labels: bool,
    /// Label keys to drop at commit.
    pub unset_labels: Vec<String>,
    /// Inherit annotations from the base image.
    pub inherit_annotations: bool,
    /// `(key, value)` annotations to set.
    pub annotations: Vec<(String, String)>,
    /// Annotation keys to drop.
    pub unset_annotations: Vec<String>,
    /// Add the builder identity label.
    pub identity_label: bool,
}

/// A source handed to [`Container::add`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CopySource {
    /// A file or directory on the host (already context-resolved).
    Path(PathBuf),
    /// A remote URL (ADD only).
    Url(String),
}

/// Options accepted by [`Container::add`].
#[derive(Debug, Clone, Default)]
#[non_exhaustive]
pub struct AddOptions {
    /// `--chown=` spec.
    pub chown: Option<String>,
    /// `--chmod=` spec.
    pub chmod: Option<String>,
    /// Expected content digest (`ADD --checksum=`).
    pub checksum: Option<String>,
    /// Hard-link the copied content into the layer.
    pub link: bool,
    /// Exclusion patterns (from `--exclude=` and ignore files).
    pub excludes: Vec<String>,
    /// Keep source ownership instead of root-squashing.
    pub preserve_ownership: bool,
    /// Clear setuid/setgid bits on copied files.
    pub strip_setid_bits: bool,
    /// The context root the sources were resolved against.
    pub context_dir: PathBuf,
    /// Content digester fed with the canonical tar stream of everything
    /// this Add writes; drives ADD/COPY cache keys.
    pub digester: Option<Arc<ContentDigester>>,
}

/// A working container: one stage's mutable rootfs plus metadata.
///
/// Single-owner. Created by [`Runner::new_builder`], used by exactly one
/// stage executor, deleted during cleanup.
#[async_trait]
pub trait Container: Send + Sync {
    /// The container's store ID.
    fn id(&self) -> &str;

    /// Image ID the container was created from, if any.
    fn from_image_id(&self) -> Option<&str>;

    /// Manifest digest of the image the container was created from.
    fn from_image_digest(&self) -> Option<&Digest>;

    /// The container's topmost layer ID; `None` on scratch.
    fn top_layer(&self) -> Option<&str>;

    /// SELinux process/mount labels assigned to this container, so later
    /// stages can share them for cross-stage bind mounts.
    fn security_labels(&self) -> Vec<String> {
        Vec::new()
    }

    /// Executes one command inside the container's rootfs.
    async fn run(&self, argv: &[String], options: &RunOptions) -> Result<()>;

    /// Mounts the rootfs, returning the host-side mount point.
    async fn mount(&self, label: &str) -> Result<PathBuf>;

    /// Copies files/URLs into the rootfs at `dest`.
    async fn add(
        &self,
        dest: &str,
        download: bool,
        options: &AddOptions,
        sources: &[CopySource],
    ) -> Result<()>;

    /// Commits the container as a new image.
    ///
    /// Returns the new image ID and, when a name was applied, the canonical
    /// manifest digest.
    async fn commit(
        &self,
        cancel: &CancellationToken,
        options: &CommitOptions,
    ) -> Result<(String, Option<Digest>)>;

    /// Deletes the working container and its rootfs.
    async fn delete(&self) -> Result<()>;
}

/// The container runtime seam: turns a base reference into a working
/// container the engine can run instructions in.
#[async_trait]
pub trait Runner: Send + Sync {
    /// Creates a working container from `base` (an image reference or
    /// `scratch`), honoring the pull policy in `options`.
    async fn new_builder(
        &self,
        cancel: &CancellationToken,
        base: &str,
        options: &BuilderOptions,
    ) -> Result<Box<dyn Container>>;
}

/// Summary record for a stored image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRecord {
    /// Image ID (config digest hex).
    pub id: String,
    /// Names attached to the image.
    pub names: Vec<String>,
    /// Creation time, if recorded.
    pub created: Option<OffsetDateTime>,
    /// Topmost layer ID; `None` for empty images.
    pub top_layer: Option<String>,
}

/// Summary record for a stored layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerRecord {
    /// Layer ID.
    pub id: String,
    /// Parent layer ID; `None` at the bottom of a chain.
    pub parent: Option<String>,
}

/// The image store seam: layer-addressed storage, image records, names,
/// and attached big-data blobs.
#[async_trait]
pub trait Store: Send + Sync {
    /// All stored images.
    async fn images(&self) -> Result<Vec<ImageRecord>>;

    /// Looks up an image by ID or name.
    async fn image(&self, id_or_name: &str) -> Result<Option<ImageRecord>>;

    /// The parsed config blob of a stored image.
    async fn image_config(&self, id: &str) -> Result<ImageConfig>;

    /// The manifest media type of a stored image.
    async fn image_manifest_type(&self, id: &str) -> Result<String>;

    /// Reads an attached big-data blob (`digest-manifest`, `instances.json`).
    async fn image_big_data(&self, id: &str, key: &str) -> Result<Vec<u8>>;

    /// Writes an attached big-data blob.
    async fn set_image_big_data(&self, id: &str, key: &str, data: &[u8]) -> Result<()>;

    /// Adds a name to an image, stealing it from any image that holds it.
    async fn add_image_name(&self, id: &str, name: &str) -> Result<()>;

    /// Removes a name from an image.
    async fn remove_image_name(&self, id: &str, name: &str) -> Result<()>;

    /// Creates an empty image record (used for manifest lists).
    async fn create_image(&self, names: &[String]) -> Result<ImageRecord>;

    /// Looks up a layer by ID.
    async fn layer(&self, id: &str) -> Result<Option<LayerRecord>>;

    /// Deletes an image; `commit` forces removal even when names remain.
    async fn delete_image(&self, id: &str, commit: bool) -> Result<()>;

    /// Deletes a container record the engine created out-of-band.
    async fn delete_container(&self, id: &str) -> Result<()>;

    /// Per-container scratch directory (volume caches live here).
    async fn container_directory(&self, id: &str) -> Result<PathBuf>;

    /// The storage graph driver (`overlay`, `vfs`, …); selects the volume
    /// save strategy.
    fn graph_driver_name(&self) -> String;
}

//! Registry transport seam.
//!
//! The engine never speaks the registry wire protocol itself; it goes
//! through the [`Transport`] trait. [`OciTransport`] is the production
//! adapter, backed by [`oci_client`] and a local OCI blob layout that the
//! image store imports from / exports to. Tests substitute their own
//! implementation.

use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use oci_client::Reference;
use oci_client::client::ClientConfig;
use oci_client::manifest::{OciImageManifest, OciManifest};
use oci_client::secrets::RegistryAuth;
use tokio_util::sync::CancellationToken;

use crate::{Digest, Error, Result};

/// A transport scheme, mirroring the reference prefixes the engine accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum Scheme {
    /// `docker://` — a registry.
    Docker,
    /// `containers-storage:` — the local image store.
    ContainersStorage,
    /// `dir:` — a plain directory of blobs.
    Dir,
    /// `oci:` — an OCI layout directory.
    Oci,
    /// `oci-archive:` — an OCI layout tarball.
    OciArchive,
    /// `docker-archive:` — a `docker save` tarball.
    DockerArchive,
    /// `docker-daemon:` — a running Docker daemon.
    DockerDaemon,
}

impl Scheme {
    fn prefix(self) -> &'static str {
        match self {
            Self::Docker => "docker://",
            Self::ContainersStorage => "containers-storage:",
            Self::Dir => "dir:",
            Self::Oci => "oci:",
            Self::OciArchive => "oci-archive:",
            Self::DockerArchive => "docker-archive:",
            Self::DockerDaemon => "docker-daemon:",
        }
    }
}

/// A parsed transport reference: a scheme plus the scheme-local name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportRef {
    /// The transport scheme; bare references default to [`Scheme::Docker`].
    pub scheme: Scheme,
    /// The reference body after the scheme prefix.
    pub name: String,
}

impl TransportRef {
    /// Parses a reference string across the supported schemes.
    pub fn parse(spec: &str) -> Result<Self> {
        if spec.is_empty() {
            return Err(Error::InvalidReference(spec.into()));
        }
        // Longer prefixes first so `oci-archive:` is not eaten by `oci:`.
        const SCHEMES: [Scheme; 7] = [
            Scheme::Docker,
            Scheme::ContainersStorage,
            Scheme::OciArchive,
            Scheme::DockerArchive,
            Scheme::DockerDaemon,
            Scheme::Oci,
            Scheme::Dir,
        ];
        for scheme in SCHEMES {
            if let Some(name) = spec.strip_prefix(scheme.prefix()) {
                if name.is_empty() {
                    return Err(Error::InvalidReference(spec.into()));
                }
                return Ok(Self {
                    scheme,
                    name: name.to_owned(),
                });
            }
        }
        Ok(Self {
            scheme: Scheme::Docker,
            name: spec.to_owned(),
        })
    }
}

impl fmt::Display for TransportRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.scheme.prefix(), self.name)
    }
}

/// Bounded-retry policy for registry I/O.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub attempts: u32,
    /// Delay before the first retry; doubles per subsequent retry.
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            delay: Duration::from_secs(2),
        }
    }
}

/// Options for [`Transport::pull`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[non_exhaustive]
pub struct PullOptions {
    /// Suppress per-blob progress reporting.
    pub quiet: bool,
}

/// Options for [`Transport::push`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[non_exhaustive]
pub struct PushOptions {
    /// Force a manifest media type on push, when set.
    pub manifest_type: Option<String>,
}

/// Narrow registry-transport contract required by the build engine.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Parses a reference string across the supported schemes.
    fn parse_image_name(&self, spec: &str) -> Result<TransportRef> {
        TransportRef::parse(spec)
    }

    /// Pulls an image, returning its store-level image ID.
    async fn pull(
        &self,
        cancel: &CancellationToken,
        reference: &TransportRef,
        options: &PullOptions,
    ) -> Result<String>;

    /// Pushes a stored image, returning the canonical destination reference
    /// and the pushed manifest digest.
    async fn push(
        &self,
        cancel: &CancellationToken,
        src_image_id: &str,
        dest: &TransportRef,
        options: &PushOptions,
    ) -> Result<(String, Digest)>;
}

/// Runs a fallible async operation under a [`RetryPolicy`].
///
/// The delay doubles after each failed attempt; cancellation wins over both
/// the operation and the sleep.
pub async fn with_retry<T, F, Fut>(
    retry: RetryPolicy,
    cancel: &CancellationToken,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut delay = retry.delay;
    let mut attempt = 1u32;
    loop {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if attempt < retry.attempts.max(1) => {
                tracing::warn!(attempt, error = %err, "registry operation failed, retrying");
                tokio::select! {
                    () = cancel.cancelled() => return Err(Error::Cancelled),
                    () = tokio::time::sleep(delay) => {}
                }
                delay = delay.saturating_mul(2);
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Production transport adapter backed by `oci-client`.
///
/// Pulled blobs land in a local OCI layout directory (`blobs/sha256/…`)
/// that the image store ingests; pushes read the same layout back. The
/// image ID is the config digest's hex, matching store convention.
pub struct OciTransport {
    client: oci_client::Client,
    auth: RegistryAuth,
    layout_dir: PathBuf,
}

impl fmt::Debug for OciTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OciTransport")
            .field("layout_dir", &self.layout_dir)
            .finish_non_exhaustive()
    }
}

impl OciTransport {
    /// Creates an anonymous-auth transport writing into `layout_dir`.
    pub fn new(layout_dir: impl AsRef<Path>) -> Self {
        Self::with_auth(layout_dir, RegistryAuth::Anonymous)
    }

    /// Creates a transport with explicit registry credentials.
    pub fn with_auth(layout_dir: impl AsRef<Path>, auth: RegistryAuth) -> Self {
        Self {
            client: oci_client::Client::new(ClientConfig::default()),
            auth,
            layout_dir: layout_dir.as_ref().to_path_buf(),
        }
    }

    fn blob_path(&self, digest: &str) -> PathBuf {
        let name = digest.replace(':', "-");
        self.layout_dir.join("blobs").join(name)
    }

    fn ref_path(&self, image_id: &str) -> PathBuf {
        self.layout_dir.join("refs").join(image_id)
    }

    fn registry_reference(reference: &TransportRef) -> Result<Reference> {
        if reference.scheme != Scheme::Docker {
            return Err(Error::Registry(format!(
                "unsupported transport for registry I/O: {reference}"
            )));
        }
        reference
            .name
            .parse()
            .map_err(|e: oci_client::ParseError| Error::InvalidReference(e.to_string()))
    }
}

#[async_trait]
impl Transport for OciTransport {
    async fn pull(
        &self,
        cancel: &CancellationToken,
        reference: &TransportRef,
        _options: &PullOptions,
    ) -> Result<String> {
        let registry_ref = Self::registry_reference(reference)?;

        // Manifest + config are small; pull them in memory.
        let (manifest, manifest_digest, config_json) = tokio::select! {
            () = cancel.cancelled() => return Err(Error::Cancelled),
            result = self.client.pull_manifest_and_config(&registry_ref, &self.auth) => {
                result.map_err(|e| Error::Registry(e.to_string()))?
            }
        };

        std::fs::create_dir_all(self.layout_dir.join("blobs"))?;
        std::fs::create_dir_all(self.layout_dir.join("refs"))?;

        let config_digest = Digest::sha256_of(config_json.as_bytes());
        std::fs::write(self.blob_path(config_digest.as_str()), &config_json)?;
        let manifest_json = serde_json::to_vec(&manifest)?;
        std::fs::write(self.blob_path(&manifest_digest), &manifest_json)?;

        // Stream each layer straight to disk.
        for layer in &manifest.layers {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let path = self.blob_path(&layer.digest);
            if path.exists() {
                continue;
            }
            let staging = path.with_extension("tmp");
            let mut file = tokio::fs::File::create(&staging).await?;
            self.client
                .pull_blob(&registry_ref, layer, &mut file)
                .await
                .map_err(|e| Error::Registry(e.to_string()))?;
            std::fs::rename(&staging, &path)?;
        }

        // Remember which manifest produced this image ID, for push.
        let image_id = config_digest.hex().to_owned();
        std::fs::write(self.ref_path(&image_id), &manifest_digest)?;
        Ok(image_id)
    }

    async fn push(
        &self,
        cancel: &CancellationToken,
        src_image_id: &str,
        dest: &TransportRef,
        options: &PushOptions,
    ) -> Result<(String, Digest)> {
        let registry_ref = Self::registry_reference(dest)?;
        let manifest_digest = std::fs::read_to_string(self.ref_path(src_image_id))
            .map_err(|_| Error::NotFound(format!("image {src_image_id} has no staged manifest")))?;
        let manifest_json = std::fs::read(self.blob_path(manifest_digest.trim()))?;
        let mut manifest: OciImageManifest = serde_json::from_slice(&manifest_json)?;
        if let Some(forced) = &options.manifest_type {
            manifest.media_type = Some(forced.clone());
        }

        self.client
            .auth(&registry_ref, &self.auth, oci_client::RegistryOperation::Push)
            .await
            .map_err(|e| Error::Registry(e.to_string()))?;

        // Config first, then layers, then the manifest that references them.
        let config_blob = std::fs::read(self.blob_path(&manifest.config.digest))?;
        self.client
            .push_blob(&registry_ref, config_blob, &manifest.config.digest)
            .await
            .map_err(|e| Error::Registry(e.to_string()))?;

        for layer in &manifest.layers {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let data = std::fs::read(self.blob_path(&layer.digest))?;
            self.client
                .push_blob(&registry_ref, data, &layer.digest)
                .await
                .map_err(|e| Error::Registry(e.to_string()))?;
        }

        self.client
            .push_manifest(&registry_ref, &OciManifest::Image(manifest))
            .await
            .map_err(|e| Error::Registry(e.to_string()))?;

        let digest = Digest::sha256_of(&manifest_json);
        let canonical = format!("{dest}@{digest}");
        Ok((canonical, digest))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn parses_schemes_longest_first() {
        let r = TransportRef::parse("oci-archive:/tmp/x.tar").unwrap();
        assert_eq!(r.scheme, Scheme::OciArchive);
        assert_eq!(r.name, "/tmp/x.tar");

        let r = TransportRef::parse("oci:/tmp/layout:latest").unwrap();
        assert_eq!(r.scheme, Scheme::Oci);

        let r = TransportRef::parse("docker://quay.io/app:1").unwrap();
        assert_eq!(r.scheme, Scheme::Docker);
        assert_eq!(r.name, "quay.io/app:1");

        let r = TransportRef::parse("quay.io/app:1").unwrap();
        assert_eq!(r.scheme, Scheme::Docker);
        assert_eq!(r.to_string(), "docker://quay.io/app:1");
    }

    #[test]
    fn rejects_empty_references() {
        assert!(TransportRef::parse("").is_err());
        assert!(TransportRef::parse("docker://").is_err());
    }

    #[tokio::test]
    async fn retry_succeeds_after_failures() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy {
            attempts: 3,
            delay: Duration::from_millis(1),
        };
        let cancel = CancellationToken::new();
        let result = with_retry(policy, &cancel, || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(Error::Registry("transient".into()))
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retry_gives_up_after_budget() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy {
            attempts: 2,
            delay: Duration::from_millis(1),
        };
        let cancel = CancellationToken::new();
        let result: Result<()> = with_retry(policy, &cancel, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(Error::Registry("permanent".into())) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn retry_respects_cancellation() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result: Result<()> =
            with_retry(RetryPolicy::default(), &cancel, || async { Ok(()) }).await;
        assert!(matches!(result, Err(Error::Cancelled)));
    }
}

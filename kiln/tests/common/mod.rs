//! In-memory Runner/Store/Transport fakes for driving the engine
//! end-to-end without a container runtime.
//!
//! Images are modeled as file maps plus real OCI configs; containers get
//! real temp-dir rootfs trees so the volume manager and content digester
//! operate on actual files. `run` interprets a tiny shell subset (`echo x
//! > f`, `touch`, `sleep`, `exit`), which is all the scenarios need.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use kiln::driver::{
    AddOptions, BuilderOptions, CommitOptions, Container, CopySource, ImageRecord, LayerRecord,
    Runner, RunOptions, Store,
};
use kiln::{Error, Result};
use kiln_oci::transport::{PullOptions, PushOptions, Transport, TransportRef};
use kiln_oci::{Digest, HistoryEntry, ImageConfig, Platform, RuntimeConfig};
use kiln_script::{Heredoc, Node, Script};
use sha2::{Digest as _, Sha256};
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;

/// One stored image: metadata plus its full (virtual) rootfs contents.
#[derive(Clone)]
pub struct StoredImage {
    pub record: ImageRecord,
    pub config: ImageConfig,
    pub manifest_type: String,
    pub files: BTreeMap<String, Vec<u8>>,
    /// Parent of the top layer at commit time; travels with the image so
    /// a pull into a fresh store reconstructs layer parentage.
    pub top_parent: Option<String>,
}

#[derive(Default)]
struct StoreInner {
    images: HashMap<String, StoredImage>,
    names: HashMap<String, String>,
    layers: HashMap<String, LayerRecord>,
    big_data: HashMap<(String, String), Vec<u8>>,
    commits: u64,
    live_containers: u64,
}

/// In-memory image store.
pub struct MemStore {
    inner: Mutex<StoreInner>,
    scratch_root: PathBuf,
    graph_driver: String,
}

impl MemStore {
    pub fn new(scratch_root: &Path) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(StoreInner::default()),
            scratch_root: scratch_root.to_path_buf(),
            graph_driver: "vfs".into(),
        })
    }

    /// Seeds a pullable base image with one layer holding `files`.
    pub fn seed_base(self: &Arc<Self>, name: &str, files: &[(&str, &str)]) -> String {
        let files: BTreeMap<String, Vec<u8>> = files
            .iter()
            .map(|(path, data)| ((*path).to_owned(), data.as_bytes().to_vec()))
            .collect();
        let diff = layer_digest(&files);
        let layer_id = format!("layer-{}", &diff.hex()[..12]);
        let config = ImageConfig {
            created: Some(OffsetDateTime::UNIX_EPOCH),
            architecture: "amd64".into(),
            os: "linux".into(),
            config: RuntimeConfig::default(),
            rootfs: kiln_oci::RootFs {
                kind: "layers".into(),
                diff_ids: vec![diff],
            },
            history: vec![HistoryEntry {
                created: Some(OffsetDateTime::UNIX_EPOCH),
                created_by: Some("/bin/sh -c #(nop) ADD file:seed in / ".into()),
                ..HistoryEntry::default()
            }],
            ..ImageConfig::default()
        };
        let id = hex_of(name.as_bytes());
        let image = StoredImage {
            record: ImageRecord {
                id: id.clone(),
                names: vec![name.to_owned()],
                created: Some(OffsetDateTime::UNIX_EPOCH),
                top_layer: Some(layer_id.clone()),
            },
            config,
            manifest_type: kiln_oci::OCI_MANIFEST_TYPE.into(),
            files,
            top_parent: None,
        };
        let mut inner = self.inner.lock().unwrap();
        inner.layers.insert(
            layer_id.clone(),
            LayerRecord {
                id: layer_id,
                parent: None,
            },
        );
        inner.names.insert(name.to_owned(), id.clone());
        inner.images.insert(id.clone(), image);
        id
    }

    pub fn commit_count(&self) -> u64 {
        self.inner.lock().unwrap().commits
    }

    pub fn live_containers(&self) -> u64 {
        self.inner.lock().unwrap().live_containers
    }

    pub fn image_ids(&self) -> Vec<String> {
        self.inner.lock().unwrap().images.keys().cloned().collect()
    }

    pub fn lookup(&self, id_or_name: &str) -> Option<StoredImage> {
        let inner = self.inner.lock().unwrap();
        let id = inner
            .names
            .get(id_or_name)
            .cloned()
            .unwrap_or_else(|| id_or_name.to_owned());
        inner.images.get(&id).cloned()
    }

    pub fn has_name(&self, name: &str) -> bool {
        self.inner.lock().unwrap().names.contains_key(name)
    }

    fn install(&self, image: StoredImage) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(top) = &image.record.top_layer {
            let parent = image.top_parent.clone();
            inner.layers.entry(top.clone()).or_insert_with(|| LayerRecord {
                id: top.clone(),
                parent,
            });
        }
        for name in &image.record.names {
            inner.names.insert(name.clone(), image.record.id.clone());
        }
        inner.images.insert(image.record.id.clone(), image);
    }
}

#[async_trait]
impl Store for MemStore {
    async fn images(&self) -> Result<Vec<ImageRecord>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.images.values().map(|i| i.record.clone()).collect())
    }

    async fn image(&self, id_or_name: &str) -> Result<Option<ImageRecord>> {
        Ok(self.lookup(id_or_name).map(|i| i.record))
    }

    async fn image_config(&self, id: &str) -> Result<ImageConfig> {
        self.lookup(id)
            .map(|i| i.config)
            .ok_or_else(|| Error::Driver(format!("no such image: {id}")))
    }

    async fn image_manifest_type(&self, id: &str) -> Result<String> {
        self.lookup(id)
            .map(|i| i.manifest_type)
            .ok_or_else(|| Error::Driver(format!("no such image: {id}")))
    }

    async fn image_big_data(&self, id: &str, key: &str) -> Result<Vec<u8>> {
        let inner = self.inner.lock().unwrap();
        inner
            .big_data
            .get(&(id.to_owned(), key.to_owned()))
            .cloned()
            .ok_or_else(|| Error::Driver(format!("no big data {key} on {id}")))
    }

    async fn set_image_big_data(&self, id: &str, key: &str, data: &[u8]) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner
            .big_data
            .insert((id.to_owned(), key.to_owned()), data.to_vec());
        Ok(())
    }

    async fn add_image_name(&self, id: &str, name: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(previous) = inner.names.insert(name.to_owned(), id.to_owned()) {
            if let Some(image) = inner.images.get_mut(&previous) {
                image.record.names.retain(|n| n != name);
            }
        }
        if let Some(image) = inner.images.get_mut(id) {
            if !image.record.names.iter().any(|n| n == name) {
                image.record.names.push(name.to_owned());
            }
        }
        Ok(())
    }

    async fn remove_image_name(&self, id: &str, name: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.names.remove(name);
        if let Some(image) = inner.images.get_mut(id) {
            image.record.names.retain(|n| n != name);
        }
        Ok(())
    }

    async fn create_image(&self, names: &[String]) -> Result<ImageRecord> {
        let id = hex_of(format!("list:{}", names.join(",")).as_bytes());
        let record = ImageRecord {
            id: id.clone(),
            names: names.to_vec(),
            created: Some(OffsetDateTime::now_utc()),
            top_layer: None,
        };
        let image = StoredImage {
            record: record.clone(),
            config: ImageConfig::default(),
            manifest_type: kiln_oci::OCI_INDEX_TYPE.into(),
            files: BTreeMap::new(),
            top_parent: None,
        };
        self.install(image);
        Ok(record)
    }

    async fn layer(&self, id: &str) -> Result<Option<LayerRecord>> {
        Ok(self.inner.lock().unwrap().layers.get(id).cloned())
    }

    async fn delete_image(&self, id: &str, _commit: bool) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(image) = inner.images.remove(id) {
            for name in image.record.names {
                inner.names.remove(&name);
            }
        }
        Ok(())
    }

    async fn delete_container(&self, _id: &str) -> Result<()> {
        Ok(())
    }

    async fn container_directory(&self, id: &str) -> Result<PathBuf> {
        let dir = self.scratch_root.join("containers").join(id);
        std::fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    fn graph_driver_name(&self) -> String {
        self.graph_driver.clone()
    }
}

/// In-memory container runtime over real temp-dir rootfs trees.
pub struct MemRunner {
    store: Arc<MemStore>,
    rootfs_root: PathBuf,
    counter: AtomicU64,
    builders: AtomicU64,
    running: Arc<AtomicU64>,
    max_running: Arc<AtomicU64>,
}

impl MemRunner {
    pub fn new(store: Arc<MemStore>, rootfs_root: &Path) -> Arc<Self> {
        Arc::new(Self {
            store,
            rootfs_root: rootfs_root.to_path_buf(),
            counter: AtomicU64::new(0),
            builders: AtomicU64::new(0),
            running: Arc::new(AtomicU64::new(0)),
            max_running: Arc::new(AtomicU64::new(0)),
        })
    }

    pub fn builders_created(&self) -> u64 {
        self.builders.load(Ordering::SeqCst)
    }

    pub fn max_concurrent_runs(&self) -> u64 {
        self.max_running.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Runner for MemRunner {
    async fn new_builder(
        &self,
        _cancel: &CancellationToken,
        base: &str,
        options: &BuilderOptions,
    ) -> Result<Box<dyn Container>> {
        self.builders.fetch_add(1, Ordering::SeqCst);
        let id = format!("ctr-{}", self.counter.fetch_add(1, Ordering::SeqCst));
        let rootfs = self.rootfs_root.join(&id);
        std::fs::create_dir_all(&rootfs)?;

        let source = if base == "scratch" {
            None
        } else {
            let image = self.store.lookup(base).ok_or_else(|| {
                Error::Driver(format!("image not known to store: {base}"))
            })?;
            for (path, data) in &image.files {
                let target = rootfs.join(path.trim_start_matches('/'));
                if let Some(parent) = target.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::write(target, data)?;
            }
            Some(image)
        };

        self.store.inner.lock().unwrap().live_containers += 1;
        Ok(Box::new(MemContainer {
            id,
            rootfs,
            store: Arc::clone(&self.store),
            running: Arc::clone(&self.running),
            max_running: Arc::clone(&self.max_running),
            base: source,
            platform: options.platform.clone(),
        }))
    }
}

pub struct MemContainer {
    id: String,
    rootfs: PathBuf,
    store: Arc<MemStore>,
    running: Arc<AtomicU64>,
    max_running: Arc<AtomicU64>,
    base: Option<StoredImage>,
    platform: Option<Platform>,
}

impl MemContainer {
    fn snapshot_files(&self) -> Result<BTreeMap<String, Vec<u8>>> {
        let mut files = BTreeMap::new();
        collect_files(&self.rootfs, &self.rootfs, &mut files)?;
        Ok(files)
    }
}

#[async_trait]
impl Container for MemContainer {
    fn id(&self) -> &str {
        &self.id
    }

    fn from_image_id(&self) -> Option<&str> {
        self.base.as_ref().map(|image| image.record.id.as_str())
    }

    fn from_image_digest(&self) -> Option<&Digest> {
        None
    }

    fn top_layer(&self) -> Option<&str> {
        self.base
            .as_ref()
            .and_then(|image| image.record.top_layer.as_deref())
    }

    async fn run(&self, argv: &[String], _options: &RunOptions) -> Result<()> {
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_running.fetch_max(now, Ordering::SeqCst);
        let result = interpret_script(&self.rootfs, argv).await;
        self.running.fetch_sub(1, Ordering::SeqCst);
        result
    }

    async fn mount(&self, _label: &str) -> Result<PathBuf> {
        Ok(self.rootfs.clone())
    }

    async fn add(
        &self,
        dest: &str,
        _download: bool,
        options: &AddOptions,
        sources: &[CopySource],
    ) -> Result<()> {
        let dest_is_dir = dest.ends_with('/') || sources.len() > 1;
        for source in sources {
            match source {
                CopySource::Path(path) => {
                    let name = path
                        .file_name()
                        .map(|n| n.to_string_lossy().into_owned())
                        .unwrap_or_else(|| "file".into());
                    if let Some(digester) = &options.digester {
                        digester.append_path(path, &name)?;
                    }
                    let target = if dest_is_dir {
                        self.rootfs.join(dest.trim_start_matches('/')).join(&name)
                    } else {
                        self.rootfs.join(dest.trim_start_matches('/'))
                    };
                    if let Some(parent) = target.parent() {
                        std::fs::create_dir_all(parent)?;
                    }
                    if path.is_dir() {
                        copy_tree(path, &target)?;
                    } else {
                        std::fs::copy(path, &target)?;
                    }
                }
                CopySource::Url(url) => {
                    if let Some(digester) = &options.digester {
                        digester.write_bytes(url.as_bytes());
                    }
                    let target = self.rootfs.join(dest.trim_start_matches('/'));
                    if let Some(parent) = target.parent() {
                        std::fs::create_dir_all(parent)?;
                    }
                    std::fs::write(target, url.as_bytes())?;
                }
            }
        }
        Ok(())
    }

    async fn commit(
        &self,
        _cancel: &CancellationToken,
        options: &CommitOptions,
    ) -> Result<(String, Option<Digest>)> {
        let files = self.snapshot_files()?;
        let (base_files, base_history, base_diff_ids, base_top) = match &self.base {
            Some(image) => (
                image.files.clone(),
                image.config.history.clone(),
                image.config.rootfs.diff_ids.clone(),
                image.record.top_layer.clone(),
            ),
            None => (BTreeMap::new(), Vec::new(), Vec::new(), None),
        };

        let created = options.created.unwrap_or_else(OffsetDateTime::now_utc);
        let mut history = base_history;
        history.push(HistoryEntry {
            created: Some(created),
            created_by: Some(options.created_by.clone()),
            author: options.author.clone(),
            comment: None,
            empty_layer: options.empty_layer,
        });

        let mut diff_ids = base_diff_ids;
        let mut top_layer = base_top.clone();
        if !options.empty_layer {
            let diff = layer_digest(&files);
            let layer_id = format!("layer-{}", &diff.hex()[..12]);
            diff_ids.push(diff);
            top_layer = Some(layer_id);
        }
        if options.squash {
            let diff = layer_digest(&files);
            let layer_id = format!("layer-{}", &diff.hex()[..12]);
            diff_ids = vec![diff];
            top_layer = Some(layer_id);
            history = vec![history.pop().unwrap_or_default()];
        }

        let mut runtime_config = options.runtime_config.clone();
        if let Some(labels) = &mut runtime_config.labels {
            for key in &options.unset_labels {
                labels.remove(key);
            }
        }
        if options.identity_label {
            runtime_config
                .labels
                .get_or_insert_with(Default::default)
                .insert("io.kiln.version".into(), env!("CARGO_PKG_VERSION").into());
        }

        let platform = self.platform.clone().unwrap_or_else(|| {
            self.base
                .as_ref()
                .map(|image| image.config.platform())
                .unwrap_or_else(|| Platform::parse("linux/amd64").unwrap())
        });

        let config = ImageConfig {
            created: Some(created),
            author: options.author.clone(),
            architecture: platform.architecture.clone(),
            variant: platform.variant.clone(),
            os: platform.os.clone(),
            config: runtime_config,
            rootfs: kiln_oci::RootFs {
                kind: "layers".into(),
                diff_ids,
            },
            history,
        };

        let config_json = serde_json::to_vec(&config)?;
        let id = hex_of(&config_json);
        let digest = Digest::sha256_of(&config_json);

        let mut names = Vec::new();
        if let Some(output) = &options.output_name {
            names.push(output.clone());
        }
        let image = StoredImage {
            record: ImageRecord {
                id: id.clone(),
                names: names.clone(),
                created: Some(created),
                top_layer: top_layer.clone(),
            },
            config,
            manifest_type: options.format.clone(),
            files,
            top_parent: if options.squash { None } else { base_top },
        };
        self.store.install(image);
        for name in names {
            self.store.add_image_name(&id, &name).await?;
        }
        self.store
            .set_image_big_data(&id, kiln_oci::MANIFEST_DIGEST_KEY, digest.as_str().as_bytes())
            .await?;
        self.store.inner.lock().unwrap().commits += 1;
        Ok((id, Some(digest)))
    }

    async fn delete(&self) -> Result<()> {
        if self.rootfs.exists() {
            std::fs::remove_dir_all(&self.rootfs)?;
        }
        self.store.inner.lock().unwrap().live_containers -= 1;
        Ok(())
    }
}

/// Interprets the tiny shell subset the scenarios use.
async fn interpret_script(rootfs: &Path, argv: &[String]) -> Result<()> {
    let script = if argv.len() >= 3 && argv[1] == "-c" {
        argv[2].clone()
    } else {
        argv.join(" ")
    };
    for command in script.split("&&").map(str::trim) {
        let words: Vec<&str> = command.split_whitespace().collect();
        match words.as_slice() {
            [] | ["true"] => {}
            ["sleep"] => tokio::time::sleep(std::time::Duration::from_millis(30)).await,
            ["exit", code] if *code != "0" => {
                return Err(Error::Driver(format!("exit status {code}")));
            }
            ["touch", paths @ ..] => {
                for path in paths {
                    let target = rootfs.join(path.trim_start_matches('/'));
                    if let Some(parent) = target.parent() {
                        std::fs::create_dir_all(parent)?;
                    }
                    std::fs::write(target, b"")?;
                }
            }
            ["echo", rest @ ..] => {
                if let Some(at) = rest.iter().position(|w| *w == ">") {
                    let content = rest[..at].join(" ");
                    let path = rest
                        .get(at + 1)
                        .ok_or_else(|| Error::Driver("echo: missing target".into()))?;
                    let target = rootfs.join(path.trim_start_matches('/'));
                    if let Some(parent) = target.parent() {
                        std::fs::create_dir_all(parent)?;
                    }
                    std::fs::write(target, format!("{content}\n"))?;
                }
            }
            _ => {}
        }
    }
    Ok(())
}

/// In-memory registry shared between transports (and across "machines").
#[derive(Default)]
pub struct MemRegistry {
    images: Mutex<HashMap<String, StoredImage>>,
}

impl MemRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn image_count(&self) -> usize {
        self.images.lock().unwrap().len()
    }
}

/// Transport fake wiring a store to the shared registry.
pub struct MemTransport {
    store: Arc<MemStore>,
    registry: Arc<MemRegistry>,
    pulls: AtomicU64,
    pushes: AtomicU64,
}

impl MemTransport {
    pub fn new(store: Arc<MemStore>, registry: Arc<MemRegistry>) -> Arc<Self> {
        Arc::new(Self {
            store,
            registry,
            pulls: AtomicU64::new(0),
            pushes: AtomicU64::new(0),
        })
    }

    pub fn pull_count(&self) -> u64 {
        self.pulls.load(Ordering::SeqCst)
    }

    pub fn push_count(&self) -> u64 {
        self.pushes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for MemTransport {
    async fn pull(
        &self,
        _cancel: &CancellationToken,
        reference: &TransportRef,
        _options: &PullOptions,
    ) -> kiln_oci::Result<String> {
        let image = {
            let images = self.registry.images.lock().unwrap();
            images.get(&reference.name).cloned()
        };
        let image =
            image.ok_or_else(|| kiln_oci::Error::NotFound(reference.name.clone()))?;
        self.pulls.fetch_add(1, Ordering::SeqCst);
        let id = image.record.id.clone();
        // Imported images keep their layer parentage via `top_parent`.
        self.store.install(image);
        Ok(id)
    }

    async fn push(
        &self,
        _cancel: &CancellationToken,
        src_image_id: &str,
        dest: &TransportRef,
        _options: &PushOptions,
    ) -> kiln_oci::Result<(String, Digest)> {
        let image = self
            .store
            .lookup(src_image_id)
            .ok_or_else(|| kiln_oci::Error::NotFound(src_image_id.to_owned()))?;
        self.pushes.fetch_add(1, Ordering::SeqCst);
        let digest = Digest::sha256_of(image.record.id.as_bytes());
        self.registry
            .images
            .lock()
            .unwrap()
            .insert(dest.name.clone(), image);
        Ok((format!("{dest}@{digest}"), digest))
    }
}

// ----- script + misc helpers -----------------------------------------

/// Minimal line parser turning test scripts into the parser-contract tree.
///
/// Supports flags, heredocs (`<<EOF` … `EOF`), comments, and blank lines —
/// enough to express every scenario without dragging in a real parser.
pub fn script(source: &str) -> Script {
    let mut nodes = Vec::new();
    let mut lines = source.lines().peekable();
    while let Some(line) = lines.next() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut words = line.split_whitespace();
        let value = words.next().unwrap_or_default().to_owned();
        let mut flags = Vec::new();
        let mut children = Vec::new();
        let mut heredocs = Vec::new();
        for word in words {
            if word.starts_with("--") && children.is_empty() {
                flags.push(word.to_owned());
            } else if let Some(marker) = word.strip_prefix("<<") {
                let mut content = String::new();
                for body_line in lines.by_ref() {
                    if body_line.trim() == marker {
                        break;
                    }
                    content.push_str(body_line);
                    content.push('\n');
                }
                heredocs.push(Heredoc {
                    name: marker.to_owned(),
                    content,
                });
                children.push(format!("<<{marker}"));
            } else {
                children.push(word.to_owned());
            }
        }
        nodes.push(Node {
            value,
            original: line.to_owned(),
            flags,
            children,
            heredocs,
        });
    }
    Script::new(nodes)
}

fn collect_files(
    root: &Path,
    dir: &Path,
    files: &mut BTreeMap<String, Vec<u8>>,
) -> Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            collect_files(root, &path, files)?;
        } else {
            let name = format!(
                "/{}",
                path.strip_prefix(root)
                    .unwrap_or(&path)
                    .to_string_lossy()
                    .replace('\\', "/")
            );
            files.insert(name, std::fs::read(&path)?);
        }
    }
    Ok(())
}

fn copy_tree(from: &Path, to: &Path) -> Result<()> {
    std::fs::create_dir_all(to)?;
    for entry in std::fs::read_dir(from)? {
        let entry = entry?;
        let target = to.join(entry.file_name());
        if entry.path().is_dir() {
            copy_tree(&entry.path(), &target)?;
        } else {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

fn layer_digest(files: &BTreeMap<String, Vec<u8>>) -> Digest {
    let mut hasher = Sha256::new();
    for (path, data) in files {
        hasher.update(path.as_bytes());
        hasher.update([0]);
        hasher.update(data);
        hasher.update([0]);
    }
    Digest::new(format!("sha256:{:x}", hasher.finalize())).unwrap()
}

fn hex_of(data: &[u8]) -> String {
    format!("{:x}", Sha256::digest(data))
}

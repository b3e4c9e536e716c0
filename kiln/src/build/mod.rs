//! The top-level build executor.
//!
//! Owns the stage set and everything above a single stage: dependency
//! resolution, the bounded-concurrency scheduler, multi-platform fan-out,
//! manifest-list assembly, final tagging, the image-ID file, and global
//! cleanup.

pub(crate) mod state;

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use kiln_oci::{
    Descriptor, Digest, ImageIndex, INSTANCES_DATA_KEY, ARTIFACTS_DATA_KEY,
    MANIFEST_DIGEST_KEY, Platform, transport::{RetryPolicy, Transport},
};
use kiln_script::{Instruction, Node, Script, Stages};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::dag::{self, DependencyMap};
use crate::driver::{Runner, Store};
use crate::log::BuildLog;
use crate::options::BuildOptions;
use crate::stage::StageExecutor;
use crate::{Error, Result};

use state::ExecutorState;

/// The outcome of a completed build.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct BuildResult {
    /// Final image ID (or manifest-list ID for multi-platform builds).
    pub image_id: String,
    /// Canonical reference, when an output name carried a digest.
    pub canonical_ref: Option<String>,
    /// Manifest (or manifest-list) digest, when known.
    pub manifest_digest: Option<Digest>,
}

/// Everything one (script, platform) sub-build shares across its stages.
pub(crate) struct BuildCtx {
    pub runner: Arc<dyn Runner>,
    pub store: Arc<dyn Store>,
    pub transport: Arc<dyn Transport>,
    pub options: BuildOptions,
    pub log: Arc<BuildLog>,
    pub rusage_log: Option<Arc<BuildLog>>,
    pub stages: Stages,
    pub deps: DependencyMap,
    pub state: ExecutorState,
    pub target_index: usize,
    pub target_platform: Option<Platform>,
    /// Caller args plus the built-in platform args for this sub-build.
    pub args: HashMap<String, String>,
}

impl BuildCtx {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: self.options.max_pull_push_retries.max(1),
            delay: self.options.retry_delay,
        }
    }
}

/// Drives a whole build: one sub-build per requested platform, then the
/// shared finishing work.
pub struct BuildExecutor {
    runner: Arc<dyn Runner>,
    store: Arc<dyn Store>,
    transport: Arc<dyn Transport>,
    options: BuildOptions,
    log: Arc<BuildLog>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for BuildExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BuildExecutor")
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl BuildExecutor {
    /// Validates options and assembles an executor.
    pub fn new(
        runner: Arc<dyn Runner>,
        store: Arc<dyn Store>,
        transport: Arc<dyn Transport>,
        options: BuildOptions,
    ) -> Result<Self> {
        options.validate()?;
        Ok(Self {
            runner,
            store,
            transport,
            options,
            log: Arc::new(BuildLog::new()),
            cancel: CancellationToken::new(),
        })
    }

    /// Replaces the build log (default: silent).
    pub fn with_log(mut self, log: BuildLog) -> Self {
        self.log = Arc::new(log);
        self
    }

    /// Token cancelling this executor's builds.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Runs the build to completion.
    pub async fn build(&self, script: Script) -> Result<BuildResult> {
        let instructions = Instruction::from_script(&script)?;
        let stages = Stages::split(instructions)?;

        let platforms: Vec<Option<Platform>> = if self.options.platforms.is_empty() {
            vec![None]
        } else {
            self.options.platforms.iter().cloned().map(Some).collect()
        };

        let mut results: Vec<(Option<Platform>, String, Option<Digest>)> = Vec::new();
        if platforms.len() == 1 {
            let platform = platforms.into_iter().next().flatten();
            let (image_id, digest) = self
                .build_platform(stages, platform.clone(), Arc::clone(&self.log))
                .await?;
            results.push((platform, image_id, digest));
        } else {
            // One sub-build per platform, in parallel; each gets its own
            // executor state and (optionally) its own log file.
            let mut join = JoinSet::new();
            for platform in platforms.into_iter().flatten() {
                let stages = stages.clone();
                let log = self.platform_log(&platform)?;
                let this = self.clone_for_subbuild();
                join.spawn(async move {
                    let outcome = this
                        .build_platform(stages, Some(platform.clone()), log)
                        .await;
                    (platform, outcome)
                });
            }
            let mut first_error: Option<Error> = None;
            while let Some(joined) = join.join_next().await {
                let (platform, outcome) = joined
                    .map_err(|e| Error::Driver(format!("platform build task: {e}")))?;
                match outcome {
                    Ok((image_id, digest)) => results.push((Some(platform), image_id, digest)),
                    Err(err) => {
                        self.cancel.cancel();
                        if first_error.as_ref().is_none_or(Error::is_cancelled) {
                            first_error = Some(err);
                        }
                    }
                }
            }
            if let Some(err) = first_error {
                return Err(err);
            }
            results.sort_by_key(|(platform, _, _)| {
                platform.as_ref().map(Platform::to_spec).unwrap_or_default()
            });
        }

        let result = match &self.options.manifest {
            Some(list_name) => self.assemble_manifest_list(list_name, &results).await?,
            None => {
                let (_, image_id, digest) = results
                    .first()
                    .cloned()
                    .ok_or_else(|| Error::Driver("build produced no image".into()))?;
                BuildResult {
                    canonical_ref: self
                        .options
                        .output
                        .as_ref()
                        .zip(digest.as_ref())
                        .map(|(name, digest)| format!("{name}@{digest}")),
                    image_id,
                    manifest_digest: digest,
                }
            }
        };

        self.write_iidfile(&result.image_id)?;
        Ok(result)
    }

    /// Builds the stage set for one platform.
    async fn build_platform(
        &self,
        mut stages: Stages,
        platform: Option<Platform>,
        log: Arc<BuildLog>,
    ) -> Result<(String, Option<Digest>)> {
        inject_synthetic_instructions(&mut stages, &self.options)?;
        if let Some(base_override) = &self.options.from_override {
            stages.stages[0].base.clone_from(base_override);
        }

        let args = self.platform_args(platform.as_ref());
        let target_index = stages
            .target_index(self.options.target.as_deref())
            .map_err(|target| Error::Options(format!("target stage {target:?} not found")))?;

        let deps = dag::resolve(&stages, target_index, &args, &self.options.additional_contexts)?;
        if !deps.unused_args.is_empty() {
            tracing::warn!(args = ?deps.unused_args, "build args were never consumed");
            log.info(format_args!(
                "WARNING: one or more build args were not consumed: {:?}",
                deps.unused_args
            ));
        }

        let rusage_log = match &self.options.rusage_log_file {
            Some(path) if self.options.log_rusage => {
                let rusage = BuildLog::new();
                rusage.add_file(path)?;
                Some(Arc::new(rusage))
            }
            _ => None,
        };

        let state = ExecutorState::new(
            &stages,
            self.options.effective_jobs(),
            self.cancel.child_token(),
        );
        populate_reference_maps(&state, &stages, &args, &self.options.additional_contexts).await?;

        let ctx = Arc::new(BuildCtx {
            runner: Arc::clone(&self.runner),
            store: Arc::clone(&self.store),
            transport: Arc::clone(&self.transport),
            options: self.options.clone(),
            log,
            rusage_log,
            stages,
            deps,
            state,
            target_index,
            target_platform: platform,
            args,
        });

        let build_result = self.run_stages(&ctx).await;
        let final_image = build_result.as_ref().ok().map(|(id, _)| id.clone());
        let cleanup_error = self
            .cleanup(&ctx, final_image.as_deref(), build_result.is_err())
            .await;

        match (build_result, cleanup_error) {
            (Ok(result), None) => Ok(result),
            (Ok(_), Some(cleanup)) => Err(cleanup),
            (Err(err), Some(cleanup)) => {
                tracing::warn!(error = %cleanup, "cleanup failed after build error");
                Err(err)
            }
            (Err(err), None) => Err(err),
        }
    }

    /// Fans stages out to workers and collects their results.
    async fn run_stages(&self, ctx: &Arc<BuildCtx>) -> Result<(String, Option<Digest>)> {
        let total = ctx.stages.stages.len();
        let (tx, mut rx) = mpsc::channel(total);
        let mut workers = JoinSet::new();

        for position in 0..total {
            // Acquiring the permit before spawning pins worker start order
            // to stage declaration order.
            let permit = match ctx.state.acquire_permit().await {
                Ok(permit) => permit,
                Err(err) => {
                    workers.shutdown().await;
                    return Err(err);
                }
            };
            let ctx = Arc::clone(ctx);
            let tx = tx.clone();
            workers.spawn(async move {
                let skip = !ctx.deps.is_needed(position)
                    && ctx.options.skip_unused_stages.unwrap_or(true);
                let aborted = ctx.state.last_error().await.is_some();
                let result = if skip || aborted {
                    drop(permit);
                    Ok(None)
                } else {
                    StageExecutor::new(Arc::clone(&ctx), position, permit)
                        .execute()
                        .await
                        .map(Some)
                };
                let _ = tx.send((position, result)).await;
            });
        }
        drop(tx);

        let mut target_outcome = None;
        let mut first_error: Option<Error> = None;
        while let Some((position, result)) = rx.recv().await {
            let stage_name = ctx.stages.stages[position].name.clone();
            match result {
                Ok(outcome) => {
                    let image_id = outcome.as_ref().and_then(|o| o.image_id.clone());
                    ctx.state
                        .record_stage_done(&stage_name, position, image_id, None)
                        .await;
                    if position == ctx.target_index {
                        target_outcome = outcome;
                    }
                }
                Err(err) => {
                    let message = err.to_string();
                    ctx.state
                        .record_stage_done(&stage_name, position, None, Some(message.clone()))
                        .await;
                    ctx.state.record_fatal(message).await;
                    // The first real failure beats cancellation fallout.
                    let replace = match &first_error {
                        None => true,
                        Some(held) => held.is_cancelled() && !err.is_cancelled(),
                    };
                    if replace {
                        first_error = Some(err);
                    }
                }
            }
        }
        while workers.join_next().await.is_some() {}

        if let Some(err) = first_error {
            return Err(err);
        }

        let outcome = target_outcome
            .ok_or_else(|| Error::Driver("target stage produced no image".into()))?;
        let image_id = outcome
            .image_id
            .ok_or_else(|| Error::Driver("target stage produced no image".into()))?;

        self.apply_tags(ctx, &image_id).await?;
        Ok((image_id, outcome.canonical_digest))
    }

    /// Applies the output name's extra tags and logs each applied name.
    async fn apply_tags(&self, ctx: &Arc<BuildCtx>, image_id: &str) -> Result<()> {
        if let Some(output) = &self.options.output {
            ctx.log
                .info(format_args!("Successfully tagged {output}"));
        }
        for tag in &self.options.additional_tags {
            self.store.add_image_name(image_id, tag).await?;
            ctx.log.info(format_args!("Successfully tagged {tag}"));
        }
        Ok(())
    }

    /// Deferred cleanup; runs on every exit from a platform build.
    ///
    /// Returns the first cleanup failure. Working containers are removed
    /// per the intermediate-container policy; intermediate images are
    /// removed unless they are the final image.
    async fn cleanup(
        &self,
        ctx: &Arc<BuildCtx>,
        final_image: Option<&str>,
        build_failed: bool,
    ) -> Option<Error> {
        let remove_containers = if build_failed {
            self.options.force_rm_intermediate_containers
        } else {
            self.options.remove_intermediate_containers
        };

        let (containers, helpers, images) = {
            let mut inner = ctx.state.inner.lock().await;
            (
                std::mem::take(&mut inner.cleanup_containers),
                std::mem::take(&mut inner.container_map),
                std::mem::take(&mut inner.intermediate_images),
            )
        };

        let mut first_error: Option<Error> = None;
        let mut record = |result: Result<()>| {
            if let Err(err) = result {
                tracing::warn!(error = %err, "cleanup step failed");
                if first_error.is_none() {
                    first_error = Some(Error::Cleanup {
                        message: err.to_string(),
                        primary: None,
                    });
                }
            }
        };

        if remove_containers {
            for container in containers {
                record(container.delete().await);
            }
            for (_, helper) in helpers {
                record(helper.container.delete().await);
            }
        }

        for image_id in images {
            if Some(image_id.as_str()) == final_image {
                continue;
            }
            record(self.store.delete_image(&image_id, false).await);
        }

        first_error
    }

    /// Writes the image ID file atomically, or logs the ID when no file
    /// was configured.
    fn write_iidfile(&self, image_id: &str) -> Result<()> {
        match &self.options.iidfile {
            Some(path) => atomic_write(path, format!("sha256:{image_id}\n").as_bytes()),
            None => {
                self.log.info(format_args!("{image_id}"));
                Ok(())
            }
        }
    }

    /// Creates or refreshes the manifest list and records every
    /// per-platform image as an instance.
    async fn assemble_manifest_list(
        &self,
        list_name: &str,
        results: &[(Option<Platform>, String, Option<Digest>)],
    ) -> Result<BuildResult> {
        let record = match self.store.image(list_name).await? {
            Some(existing) => existing,
            None => self.store.create_image(&[list_name.to_owned()]).await?,
        };

        let mut index = match self.store.image_big_data(&record.id, INSTANCES_DATA_KEY).await {
            Ok(data) => ImageIndex::from_json(&data)?,
            Err(_) => ImageIndex::default(),
        };

        for (platform, image_id, digest) in results {
            let digest = match digest {
                Some(digest) => digest.clone(),
                None => {
                    let data = self
                        .store
                        .image_big_data(image_id, MANIFEST_DIGEST_KEY)
                        .await?;
                    Digest::new(String::from_utf8_lossy(&data).trim().to_owned())?
                }
            };
            let mut annotations = std::collections::BTreeMap::new();
            if let Some(platform) = platform {
                annotations.insert("com.kiln.build.platform".to_owned(), platform.to_spec());
            }
            index.set_instance(Descriptor {
                media_type: self.options.output_format.clone(),
                digest,
                size: 0,
                platform: platform.clone(),
                annotations: Some(annotations),
            });
        }

        let data = index.to_json()?;
        let list_digest = Digest::sha256_of(&data);
        self.store
            .set_image_big_data(&record.id, INSTANCES_DATA_KEY, &data)
            .await?;
        self.store
            .set_image_big_data(&record.id, ARTIFACTS_DATA_KEY, b"{}")
            .await?;
        self.store
            .set_image_big_data(&record.id, MANIFEST_DIGEST_KEY, list_digest.as_str().as_bytes())
            .await?;

        Ok(BuildResult {
            image_id: record.id,
            canonical_ref: Some(format!("{list_name}@{list_digest}")),
            manifest_digest: Some(list_digest),
        })
    }

    /// The caller's args plus the built-in platform args.
    fn platform_args(&self, platform: Option<&Platform>) -> HashMap<String, String> {
        let mut args = self.options.args.clone();
        let host = host_platform();
        args.entry("BUILDPLATFORM".to_owned())
            .or_insert_with(|| host.to_spec());
        if let Some(platform) = platform {
            args.insert("TARGETPLATFORM".to_owned(), platform.to_spec());
            args.insert("TARGETOS".to_owned(), platform.os.clone());
            args.insert("TARGETARCH".to_owned(), platform.architecture.clone());
            args.insert(
                "TARGETVARIANT".to_owned(),
                platform.variant.clone().unwrap_or_default(),
            );
        }
        args
    }

    /// A per-platform log: the shared sinks plus a suffixed log file.
    fn platform_log(&self, platform: &Platform) -> Result<Arc<BuildLog>> {
        match &self.options.log_file {
            Some(base) => {
                let log = BuildLog::new();
                let suffixed = format!(
                    "{}_{}_{}",
                    base.display(),
                    platform.os,
                    platform.architecture
                );
                log.add_file(Path::new(&suffixed))?;
                Ok(Arc::new(log))
            }
            None => Ok(Arc::clone(&self.log)),
        }
    }

    /// A handle sharing this executor's collaborators for a sub-build task.
    fn clone_for_subbuild(&self) -> Self {
        Self {
            runner: Arc::clone(&self.runner),
            store: Arc::clone(&self.store),
            transport: Arc::clone(&self.transport),
            options: self.options.clone(),
            log: Arc::clone(&self.log),
            cancel: self.cancel.clone(),
        }
    }
}

/// Injects caller labels as a trailing LABEL step of the last stage and
/// caller envs as the first post-FROM ENV of every stage, so caching sees
/// them as ordinary instructions.
fn inject_synthetic_instructions(stages: &mut Stages, options: &BuildOptions) -> Result<()> {
    if !options.envs.is_empty() {
        let node = Node {
            value: "ENV".into(),
            original: format!("ENV {}", options.envs.join(" ")),
            flags: Vec::new(),
            children: options.envs.clone(),
            heredocs: Vec::new(),
        };
        let instruction = Instruction::from_node(&node)?;
        for stage in &mut stages.stages {
            stage.instructions.insert(1, instruction.clone());
        }
    }
    if !options.labels.is_empty() {
        let node = Node {
            value: "LABEL".into(),
            original: format!("LABEL {}", options.labels.join(" ")),
            flags: Vec::new(),
            children: options.labels.clone(),
            heredocs: Vec::new(),
        };
        let instruction = Instruction::from_node(&node)?;
        if let Some(last) = stages.stages.last_mut() {
            last.instructions.push(instruction);
        }
    }
    Ok(())
}

/// Seeds `base_map` / `rootfs_map`: which stages later stages consume as
/// a FROM base vs. as a rootfs source. Applies the same arg expansion FROM
/// resolution uses, for the `--from=` edges too.
async fn populate_reference_maps(
    state: &ExecutorState,
    stages: &Stages,
    args: &HashMap<String, String>,
    contexts: &HashMap<String, crate::options::AdditionalContext>,
) -> Result<()> {
    let lookup = |name: &str| -> Option<String> {
        args.get(name)
            .cloned()
            .or_else(|| stages.global_args.get(name).cloned().flatten())
    };
    let resolve_stage = |name: &str, current: usize| -> Option<String> {
        if contexts.contains_key(name) {
            return None;
        }
        if let Ok(index) = name.parse::<usize>() {
            if index < current {
                return stages.stages.get(index).map(|stage| stage.name.clone());
            }
            return None;
        }
        stages
            .by_name(name)
            .filter(|stage| stage.index < current)
            .map(|stage| stage.name.clone())
    };

    let mut inner = state.inner.lock().await;
    for stage in &stages.stages {
        let base = kiln_script::expand(&stage.base, &lookup)?;
        if let Some(name) = resolve_stage(&base, stage.index) {
            inner.base_map.insert(name);
        }
        for instruction in &stage.instructions {
            match instruction {
                Instruction::Copy(file_copy) | Instruction::Add(file_copy) => {
                    if let Some(from) = &file_copy.from {
                        let from = kiln_script::expand(from, &lookup)?;
                        if let Some(name) = resolve_stage(&from, stage.index) {
                            inner.rootfs_map.insert(name);
                        }
                    }
                }
                Instruction::Run(run) => {
                    for mount in &run.mounts {
                        if let Some(from) = &mount.from {
                            let from = kiln_script::expand(from, &lookup)?;
                            if let Some(name) = resolve_stage(&from, stage.index) {
                                inner.rootfs_map.insert(name);
                            }
                        }
                    }
                }
                _ => {}
            }
        }
    }
    Ok(())
}

/// The platform this process runs on, in OCI naming.
fn host_platform() -> Platform {
    Platform::parse(&format!(
        "{}/{}",
        std::env::consts::OS,
        std::env::consts::ARCH
    ))
    .unwrap_or_else(|| Platform {
        os: std::env::consts::OS.to_owned(),
        architecture: std::env::consts::ARCH.to_owned(),
        variant: None,
    })
}

/// Writes a file atomically (write to .tmp, then rename).
fn atomic_write(path: &Path, data: &[u8]) -> Result<()> {
    use std::io::Write;
    let tmp = path.with_extension("tmp");
    let mut file = std::fs::File::create(&tmp)?;
    file.write_all(data)?;
    file.sync_all()?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_platform_is_normalized() {
        let platform = host_platform();
        assert!(!platform.os.is_empty());
        assert_ne!(platform.architecture, "x86_64");
    }

    #[test]
    fn iid_atomic_write() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("iid");
        atomic_write(&path, b"sha256:abc\n").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "sha256:abc\n");
    }

    #[test]
    fn synthetic_env_and_label_injection() {
        let script = Script::new(vec![
            Node {
                value: "FROM".into(),
                original: "FROM a AS one".into(),
                flags: vec![],
                children: vec!["a".into(), "AS".into(), "one".into()],
                heredocs: vec![],
            },
            Node {
                value: "RUN".into(),
                original: "RUN true".into(),
                flags: vec![],
                children: vec!["true".into()],
                heredocs: vec![],
            },
            Node {
                value: "FROM".into(),
                original: "FROM one".into(),
                flags: vec![],
                children: vec!["one".into()],
                heredocs: vec![],
            },
        ]);
        let mut stages =
            Stages::split(Instruction::from_script(&script).unwrap()).unwrap();
        let options = BuildOptions {
            envs: vec!["A=1".into()],
            labels: vec!["built.by=kiln".into()],
            ..BuildOptions::default()
        };
        inject_synthetic_instructions(&mut stages, &options).unwrap();

        // ENV lands right after every FROM; LABEL only ends the last stage.
        assert!(matches!(
            stages.stages[0].instructions[1],
            Instruction::Env { .. }
        ));
        assert!(matches!(
            stages.stages[1].instructions[1],
            Instruction::Env { .. }
        ));
        assert!(matches!(
            stages.stages[1].instructions.last(),
            Some(Instruction::Label { .. })
        ));
        assert_eq!(stages.stages[0].instructions.len(), 3);
    }
}

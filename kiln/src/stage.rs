//! Execution of a single build stage.
//!
//! One `StageExecutor` owns one working container at a time and walks the
//! stage's instructions in order: metadata instructions mutate the pending
//! image config, RUN/ADD/COPY mutate the rootfs, and in layered mode every
//! step either commits a new image or is satisfied from the layer cache.

use std::path::PathBuf;
use std::sync::Arc;

use indexmap::IndexMap;
use kiln_oci::{
    Digest, HealthcheckConfig, HistoryEntry, MANIFEST_DIGEST_KEY, RuntimeConfig,
};
use kiln_script::{FileCopy, Heredoc, Instruction, MountKind, Run, ShellOrExec, Stage, expand};
use time::OffsetDateTime;
use tokio::sync::OwnedSemaphorePermit;

use crate::build::BuildCtx;
use crate::cache::{
    CacheKeyInput, CacheQuery, ContentDigester, cache_key, created_by, find_cache_candidate,
    remote, tar_digest_of_path,
};
use crate::copy::{CopyRequest, CopyVerb, ResolvedContext, load_ignore_patterns};
use crate::driver::{
    BuilderOptions, CommitOptions, Container, RunMount, RunOptions, StageMount,
};
use crate::options::{NetworkMode, PullPolicy, Tristate};
use crate::rusage::Rusage;
use crate::source::FromSource;
use crate::volume::VolumeManager;
use crate::{Error, Result, copy};

/// What one stage produced.
#[derive(Debug, Clone, Default)]
pub struct StageOutcome {
    /// The stage's image ID; `None` when the stage produced no image
    /// (single-layer mode, unreferenced intermediate stage).
    pub image_id: Option<String>,
    /// Manifest digest, when the commit applied a name.
    pub canonical_digest: Option<Digest>,
    /// The stage re-used its base image without committing anything.
    pub only_base_image: bool,
}

/// Executes the ordered instruction sequence of one stage.
pub(crate) struct StageExecutor {
    ctx: Arc<BuildCtx>,
    stage: Stage,
    name: String,
    position: usize,
    /// Whether this stage is the build's target.
    target_stage: bool,
    /// Name to apply to this stage's final image, target stages only.
    output: Option<String>,

    container: Option<Arc<dyn Container>>,
    mount_point: PathBuf,
    scratch_dir: PathBuf,
    volumes: Option<VolumeManager>,
    config: RuntimeConfig,
    base_history: Vec<HistoryEntry>,
    base_diff_ids: Vec<Digest>,

    /// ARG names declared so far in this stage, in declaration order.
    arg_names_seen: Vec<String>,
    /// Resolved values of in-scope args.
    args_in_scope: IndexMap<String, Option<String>>,
    /// Whether cache probing is still live for this stage.
    check_for_layers: bool,
    /// The base is another stage's image; keep its annotations at commit.
    preserve_base_annotations: bool,
    /// Semaphore permit, surrendered while waiting on other stages.
    permit: Option<OwnedSemaphorePermit>,
}

impl StageExecutor {
    /// Builds an executor for the stage at `position`.
    pub fn new(ctx: Arc<BuildCtx>, position: usize, permit: OwnedSemaphorePermit) -> Self {
        let stage = ctx.stages.stages[position].clone();
        let target_stage = position == ctx.target_index;
        let output = if target_stage {
            ctx.options.output.clone()
        } else {
            None
        };
        Self {
            name: stage.name.clone(),
            stage,
            position,
            target_stage,
            output,
            container: None,
            mount_point: PathBuf::new(),
            scratch_dir: PathBuf::new(),
            volumes: None,
            config: RuntimeConfig::default(),
            base_history: Vec::new(),
            base_diff_ids: Vec::new(),
            arg_names_seen: Vec::new(),
            args_in_scope: IndexMap::new(),
            check_for_layers: true,
            preserve_base_annotations: false,
            permit: Some(permit),
            ctx,
        }
    }

    /// Runs the stage to completion.
    pub async fn execute(mut self) -> Result<StageOutcome> {
        let total = self.stage.instructions.len();
        self.ctx
            .log
            .step(1, total, self.stage.instructions[0].original());

        let base = self.resolve_base().await?;
        self.prepare(&base.reference, base.pull_policy, true).await?;

        if self.stage.is_base_only() {
            return self.finish_base_only_stage().await;
        }

        let mut outcome = StageOutcome::default();
        let mut last_created_by = created_by::for_from();
        let mut executed_any_layer_step = false;

        for index in 1..total {
            let instruction = self.stage.instructions[index].clone();
            let last_instruction = index + 1 == total;
            self.ctx.log.step(index + 1, total, instruction.original());

            let before = self.sample_rusage();
            let step = self
                .run_step(&instruction, last_instruction, &mut outcome)
                .await
                .map_err(|err| Error::in_stage(self.name.clone(), err))?;
            self.log_rusage(instruction.original(), before);

            last_created_by = step.created_by;
            executed_any_layer_step |= instruction.requires_layer() && !step.cached;
        }

        // Single-layer mode commits exactly once, at the end of the stage,
        // unless nothing downstream consumes this stage's image. These
        // intermediate stage images are throwaways, unlike layered per-step
        // images which stay behind as the local cache.
        if !self.ctx.options.layers {
            if self.target_stage || self.referenced_later().await {
                let squash = self.ctx.options.squash && self.target_stage;
                let (image_id, digest) = self
                    .commit(last_created_by, !executed_any_layer_step, true, squash)
                    .await
                    .map_err(|err| Error::in_stage(self.name.clone(), err))?;
                self.ctx.log.result(&image_id);
                if !self.target_stage {
                    self.ctx.state.defer_image_cleanup(image_id.clone()).await;
                }
                outcome.image_id = Some(image_id);
                outcome.canonical_digest = digest;
            }
        }

        self.finish_stage_rootfs().await?;
        Ok(outcome)
    }

    /// Executes one instruction, including its cache choreography.
    async fn run_step(
        &mut self,
        instruction: &Instruction,
        last_instruction: bool,
        outcome: &mut StageOutcome,
    ) -> Result<StepResult> {
        let options = &self.ctx.options;
        let layered = options.layers;
        let squash_last = options.squash && last_instruction && self.target_stage;
        let suffix =
            created_by::metadata_suffix(options, last_instruction && self.target_stage);

        // ARG only adjusts scope; it can never be satisfied from cache.
        if let Instruction::Arg(arg) = instruction {
            for (name, default) in &arg.pairs {
                let value = self
                    .ctx
                    .args
                    .get(name)
                    .cloned()
                    .or_else(|| default.clone())
                    .or_else(|| self.ctx.stages.global_args.get(name).cloned().flatten());
                self.args_in_scope.insert(name.clone(), value);
                self.arg_names_seen.push(name.clone());
            }
            let text = created_by::for_arg(&self.arg_names_seen, &suffix);
            return self
                .conclude_step(text, true, last_instruction, squash_last, false, outcome)
                .await;
        }

        let avoid_cache = self.references_executed_stage(instruction).await;
        let check = self.check_for_layers
            && layered
            && options.use_cache
            && !squash_last
            && !avoid_cache;

        match instruction {
            Instruction::Add(file_copy) | Instruction::Copy(file_copy) => {
                let verb = match instruction {
                    Instruction::Add(_) => CopyVerb::Add,
                    _ => CopyVerb::Copy,
                };
                // The content digest exists only after the copy runs, so
                // cache matching happens post-execution.
                let text = self.execute_copy(verb, file_copy, &suffix).await?;
                if check {
                    if let Some(cached) = self.probe_with_remote(&text, true).await? {
                        self.ctx.log.info(format_args!("Using cache {cached}"));
                        return self
                            .adopt_cached(cached, last_instruction, outcome)
                            .await;
                    }
                }
                self.conclude_step(text, false, last_instruction, squash_last, check, outcome)
                    .await
            }
            Instruction::Run(run) => {
                let text = self.run_created_by(run, &suffix).await?;
                if check {
                    if let Some(cached) = self.probe_with_remote(&text, true).await? {
                        self.ctx.log.info(format_args!("Using cache {cached}"));
                        return self
                            .adopt_cached(cached, last_instruction, outcome)
                            .await;
                    }
                }
                self.execute_run(run).await?;
                self.conclude_step(text, false, last_instruction, squash_last, check, outcome)
                    .await
            }
            _ => {
                // Metadata-only instruction.
                let text = created_by::for_metadata(instruction.original(), &suffix);
                if check {
                    if let Some(cached) = self.probe_with_remote(&text, false).await? {
                        self.ctx.log.info(format_args!("Using cache {cached}"));
                        return self
                            .adopt_cached(cached, last_instruction, outcome)
                            .await;
                    }
                }
                self.apply_config(instruction)?;
                self.conclude_step(text, true, last_instruction, squash_last, check, outcome)
                    .await
            }
        }
    }

    /// Commits (in layered mode) and re-prepares for the next step.
    #[allow(clippy::fn_params_excessive_bools)]
    async fn conclude_step(
        &mut self,
        text: String,
        empty_layer: bool,
        last_instruction: bool,
        squash: bool,
        was_cache_lane: bool,
        outcome: &mut StageOutcome,
    ) -> Result<StepResult> {
        // Single-layer mode: the one commit happens at stage end.
        if !self.ctx.options.layers {
            return Ok(StepResult {
                created_by: text,
                cached: false,
            });
        }

        let (image_id, digest) = self
            .commit(text.clone(), empty_layer, last_instruction, squash)
            .await?;
        self.ctx.log.result(&image_id);

        // A miss-commit leaves the cache lane: the parent chain diverged,
        // so later steps in this stage cannot hit anymore.
        if was_cache_lane {
            self.check_for_layers = false;
        }

        if !self.ctx.options.cache_to.is_empty() {
            let key = self.step_cache_key(&text, !empty_layer);
            remote::push(
                self.ctx.transport.as_ref(),
                self.ctx.state.cancel_token(),
                &self.ctx.options.cache_to,
                &image_id,
                &key,
                self.ctx.retry_policy(),
            )
            .await?;
        }

        if last_instruction {
            outcome.image_id = Some(image_id.clone());
            outcome.canonical_digest = digest;
        } else {
            self.reprepare(&image_id).await?;
        }
        if last_instruction && self.rootfs_used_later().await {
            self.reprepare(&image_id).await?;
        }

        Ok(StepResult {
            created_by: text,
            cached: false,
        })
    }

    /// Adopts a cache-hit image in place of the step's own commit.
    async fn adopt_cached(
        &mut self,
        cached: String,
        last_instruction: bool,
        outcome: &mut StageOutcome,
    ) -> Result<StepResult> {
        if last_instruction {
            if let Some(output) = self.output.clone() {
                self.ctx.store.add_image_name(&cached, &output).await?;
            }
            self.ctx.log.result(&cached);
            outcome.image_id = Some(cached.clone());
            if self.rootfs_used_later().await {
                self.reprepare(&cached).await?;
            }
        } else {
            self.reprepare(&cached).await?;
        }
        Ok(StepResult {
            created_by: String::new(),
            cached: true,
        })
    }

    /// Probes the local cache, falling back to a remote pull + re-probe.
    async fn probe_with_remote(
        &self,
        text: &str,
        adds_layer: bool,
    ) -> Result<Option<String>> {
        if let Some(hit) = self.probe_cache(text, adds_layer).await? {
            return Ok(Some(hit));
        }
        if self.ctx.options.cache_from.is_empty() {
            return Ok(None);
        }
        let key = self.step_cache_key(text, adds_layer);
        let pulled = remote::pull(
            self.ctx.transport.as_ref(),
            self.ctx.state.cancel_token(),
            &self.ctx.options.cache_from,
            &key,
            self.ctx.retry_policy(),
        )
        .await?;
        if pulled.is_none() {
            return Ok(None);
        }
        self.ctx
            .log
            .info(format_args!("Cache pulled from remote: {key}"));
        self.probe_cache(text, adds_layer).await
    }

    async fn probe_cache(&self, text: &str, adds_layer: bool) -> Result<Option<String>> {
        let container = self.container()?;
        let query = CacheQuery {
            parent_layer: container.top_layer(),
            build_adds_layer: adds_layer,
            manifest_type: &self.ctx.options.output_format,
            platform: self.ctx.target_platform.as_ref(),
            base_history: &self.base_history,
            base_diff_ids: &self.base_diff_ids,
            created_by: text,
            ttl: self.ctx.options.cache_ttl,
        };
        find_cache_candidate(self.ctx.store.as_ref(), &self.ctx.state.info_cache, &query).await
    }

    fn step_cache_key(&self, text: &str, adds_layer: bool) -> String {
        cache_key(&CacheKeyInput {
            parent_diff_ids: &self.base_diff_ids,
            build_adds_layer: adds_layer,
            created_by: text,
            manifest_type: &self.ctx.options.output_format,
            base_history: &self.base_history,
        })
    }

    /// Whether any `--mount=from=` on this instruction names a stage that
    /// ran in this build; such steps never consult the cache.
    async fn references_executed_stage(&self, instruction: &Instruction) -> bool {
        let Instruction::Run(run) = instruction else {
            return false;
        };
        for mount in &run.mounts {
            if let Some(from) = &mount.from {
                let expanded = self.expand_args(from).unwrap_or_else(|_| from.clone());
                if self.resolve_source(&expanded).stage().is_some() {
                    return true;
                }
            }
        }
        false
    }

    // ----- execution -------------------------------------------------

    /// Applies a metadata instruction to the pending image config.
    fn apply_config(&mut self, instruction: &Instruction) -> Result<()> {
        match instruction {
            Instruction::Env { pairs, .. } => {
                for (key, value) in pairs {
                    let value = self.expand_args(value)?;
                    upsert_env(&mut self.config.env, key, &value);
                }
            }
            Instruction::Label { pairs, .. } => {
                let labels = self.config.labels.get_or_insert_with(Default::default);
                for (key, value) in pairs {
                    labels.insert(key.clone(), value.clone());
                }
            }
            Instruction::User { user, .. } => {
                self.config.user = Some(self.expand_args(user)?);
            }
            Instruction::Workdir { dir, .. } => {
                let dir = self.expand_args(dir)?;
                let next = match (&self.config.working_dir, dir.starts_with('/')) {
                    (Some(current), false) => format!("{}/{dir}", current.trim_end_matches('/')),
                    _ => dir,
                };
                self.config.working_dir = Some(next);
            }
            Instruction::Volume { paths, .. } => {
                let mut expanded = Vec::with_capacity(paths.len());
                for path in paths {
                    let path = self.expand_args(path)?;
                    if let Some(manager) = self.volumes.as_mut() {
                        manager.preserve(&path)?;
                    }
                    expanded.push(path);
                }
                let volumes = self.config.volumes.get_or_insert_with(Default::default);
                for path in expanded {
                    volumes.insert(path, serde_json::Value::Object(Default::default()));
                }
            }
            Instruction::Expose { ports, .. } => {
                let mut expanded = Vec::with_capacity(ports.len());
                for port in ports {
                    let port = self.expand_args(port)?;
                    let key = if port.contains('/') { port } else { format!("{port}/tcp") };
                    expanded.push(key);
                }
                let exposed = self.config.exposed_ports.get_or_insert_with(Default::default);
                for key in expanded {
                    exposed.insert(key, serde_json::Value::Object(Default::default()));
                }
            }
            Instruction::Healthcheck(healthcheck) => {
                self.config.healthcheck = Some(build_healthcheck(healthcheck));
            }
            Instruction::StopSignal { signal, .. } => {
                self.config.stop_signal = Some(self.expand_args(signal)?);
            }
            Instruction::Shell { shell, .. } => {
                self.config.shell = Some(shell.clone());
            }
            Instruction::Onbuild { trigger, .. } => {
                self.config
                    .onbuild
                    .get_or_insert_with(Vec::new)
                    .push(trigger.clone());
            }
            Instruction::Cmd { command, .. } => {
                self.config.cmd = Some(command.to_argv(&self.shell()));
            }
            Instruction::Entrypoint { command, .. } => {
                self.config.entrypoint = Some(command.to_argv(&self.shell()));
            }
            other => {
                return Err(Error::execution(
                    other.original(),
                    "instruction does not apply to image configuration",
                ));
            }
        }
        Ok(())
    }

    /// Runs one RUN instruction, with volume protection when requested.
    async fn execute_run(&mut self, run: &Run) -> Result<()> {
        let argv = run_argv(run, &self.shell());

        let mut env = self.config.env.clone();
        for (name, value) in &self.args_in_scope {
            if let Some(value) = value {
                if !env_contains(&env, name) {
                    env.push(format!("{name}={value}"));
                }
            }
        }

        let compat_volumes = self
            .ctx
            .options
            .compat_volumes
            .unwrap_or(false);
        let mut mounts: Vec<RunMount> = Vec::new();
        if compat_volumes {
            if let Some(manager) = self.volumes.as_mut() {
                mounts = manager.save()?;
            }
        }

        let mut stage_mounts: Vec<StageMount> = Vec::new();
        for mount in &run.mounts {
            if mount.kind != MountKind::Bind {
                continue;
            }
            let Some(from) = &mount.from else { continue };
            let from = self.expand_args(from)?;
            let context = self.resolve_rootfs_context("RUN --mount", &from).await?;
            let source = match &mount.source {
                Some(sub) => context.join(sub.trim_start_matches('/')),
                None => context,
            };
            let destination = mount
                .target
                .clone()
                .ok_or_else(|| Error::execution(&run.original, "mount requires a target"))?;
            stage_mounts.push(StageMount {
                source,
                destination,
                writable: false,
            });
        }

        for volume in &self.ctx.options.volumes {
            let mut parts = volume.splitn(3, ':');
            let (Some(host), Some(container)) = (parts.next(), parts.next()) else {
                continue;
            };
            mounts.push(RunMount {
                kind: "bind".into(),
                source: PathBuf::from(host),
                destination: container.to_owned(),
                options: parts.next().map(str::to_owned).into_iter().collect(),
            });
        }

        let run_options = RunOptions {
            env,
            cwd: self.config.working_dir.clone(),
            user: self.config.user.clone(),
            mounts,
            secrets: self.ctx.options.secrets.clone(),
            ssh_sources: self.ctx.options.ssh_sources.clone(),
            stage_mounts,
            network: match run.network.as_deref() {
                Some("host") => NetworkMode::Host,
                Some("none") => NetworkMode::None,
                _ => self.ctx.options.network,
            },
            terminal: false,
        };

        let result = self
            .container()?
            .run(&argv, &run_options)
            .await
            .map_err(|err| Error::execution(&run.original, err));

        if compat_volumes {
            if let Some(manager) = self.volumes.as_mut() {
                manager.restore()?;
            }
        }
        result
    }

    /// Runs one ADD/COPY and returns its `created_by`.
    async fn execute_copy(
        &mut self,
        verb: CopyVerb,
        step: &FileCopy,
        suffix: &str,
    ) -> Result<String> {
        copy::validate(verb, step)?;

        if let Some(manager) = self.volumes.as_mut() {
            manager.invalidate(&step.dest);
        }

        let context = match &step.from {
            Some(from) => {
                let from = self.expand_args(from)?;
                let dir = self.resolve_rootfs_or_dir_context(verb.as_str(), &from).await?;
                dir
            }
            None => ResolvedContext::Build(self.ctx.options.context_dir.clone()),
        };

        let ignore_patterns = match &context {
            ResolvedContext::Build(dir) => load_ignore_patterns(dir)?,
            _ => Vec::new(),
        };

        // Restarted per copy block: the digest identifies exactly this
        // step's content.
        let digester = Arc::new(ContentDigester::new());
        let request = CopyRequest {
            verb,
            step,
            context,
            scratch_dir: self.scratch_dir.join("copy"),
            ignore_patterns,
            digester: Arc::clone(&digester),
        };
        let summary = copy::execute(self.container()?.as_ref(), &request).await?;

        let content_summary = format!("{}:{}", summary.kind, digester.hex());
        Ok(created_by::for_copy(
            verb.as_str(),
            step.link,
            self.ctx.options.layers,
            &content_summary,
            &step.dest,
            suffix,
        ))
    }

    /// Builds the RUN `created_by`, including mount checksums.
    async fn run_created_by(&mut self, run: &Run, suffix: &str) -> Result<String> {
        let build_args = self.run_build_args();
        let command_text = match &run.command {
            ShellOrExec::Shell(line) => line.clone(),
            ShellOrExec::Exec(argv) => argv.join(" "),
        };
        let checksums = self.mount_checksums(run).await?;
        Ok(created_by::for_run(
            &build_args,
            &command_text,
            &run.heredocs,
            &checksums,
            suffix,
        ))
    }

    /// In-scope, non-env-overridden build args, sorted by name. Proxy
    /// variables only participate when the script re-declared them.
    fn run_build_args(&self) -> Vec<(String, String)> {
        let mut args: Vec<(String, String)> = self
            .args_in_scope
            .iter()
            .filter_map(|(name, value)| {
                let value = value.as_ref()?;
                if env_contains(&self.config.env, name) {
                    return None;
                }
                Some((name.clone(), value.clone()))
            })
            .collect();
        args.sort_unstable_by(|a, b| a.0.cmp(&b.0));
        args
    }

    /// One checksum per `--mount=type=bind` with a source.
    async fn mount_checksums(&mut self, run: &Run) -> Result<Vec<String>> {
        let mut checksums = Vec::new();
        for mount in &run.mounts {
            if mount.kind != MountKind::Bind {
                continue;
            }
            match &mount.from {
                Some(from) => {
                    let from = self.expand_args(from)?;
                    checksums.push(self.source_checksum(&from).await?);
                }
                None => {
                    let source = mount.source.clone().unwrap_or_default();
                    let path = self
                        .ctx
                        .options
                        .context_dir
                        .join(source.trim_start_matches('/'));
                    checksums.push(tar_digest_of_path(&path)?);
                }
            }
        }
        Ok(checksums)
    }

    /// The cache identity of a `--mount=from=` source: an image's manifest
    /// digest, a stage's recorded base digest, or a host tree digest.
    async fn source_checksum(&mut self, from: &str) -> Result<String> {
        match self.resolve_source(from) {
            FromSource::Stage(position) => {
                let stage_name = self.ctx.stages.stages[position].name.clone();
                self.wait_for(&stage_name, "RUN --mount").await?;
                let inner = self.ctx.state.inner.lock().await;
                Ok(inner
                    .stage_digests
                    .get(&stage_name)
                    .cloned()
                    .unwrap_or(stage_name))
            }
            FromSource::Image(reference) | FromSource::ContextImage(reference) => {
                let record = self
                    .ctx
                    .store
                    .image(&reference)
                    .await?
                    .ok_or_else(|| Error::Lookup {
                        verb: "RUN --mount".into(),
                        name: reference.clone(),
                    })?;
                let digest = self
                    .ctx
                    .store
                    .image_big_data(&record.id, MANIFEST_DIGEST_KEY)
                    .await
                    .ok()
                    .and_then(|data| String::from_utf8(data).ok())
                    .unwrap_or(record.id);
                Ok(digest)
            }
            FromSource::ContextPath(path) => tar_digest_of_path(&path),
            FromSource::ContextUrl { url, .. } => Ok(Digest::sha256_of(url.as_bytes()).hex().to_owned()),
        }
    }

    // ----- from-source plumbing --------------------------------------

    fn resolve_source(&self, name: &str) -> FromSource {
        let stages = &self.ctx.stages;
        FromSource::resolve(
            name,
            self.position,
            &|stage_name| stages.by_name(stage_name).map(|stage| stage.index),
            &self.ctx.options.additional_contexts,
        )
    }

    /// Resolves a `--from=` into a copy context (rootfs or directory).
    async fn resolve_rootfs_or_dir_context(
        &mut self,
        verb: &str,
        from: &str,
    ) -> Result<ResolvedContext> {
        match self.resolve_source(from) {
            FromSource::ContextPath(path) => Ok(ResolvedContext::Directory(path)),
            FromSource::ContextUrl { url, cache } => {
                let dir = copy::download_url_context(
                    &url,
                    &cache,
                    &self.scratch_dir.join("contexts"),
                )
                .await?;
                Ok(ResolvedContext::Directory(dir))
            }
            _ => Ok(ResolvedContext::Rootfs(
                self.resolve_rootfs_context(verb, from).await?,
            )),
        }
    }

    /// Resolves a stage or image reference to a mounted rootfs.
    async fn resolve_rootfs_context(&mut self, verb: &str, from: &str) -> Result<PathBuf> {
        match self.resolve_source(from) {
            FromSource::Stage(position) => {
                let stage_name = self.ctx.stages.stages[position].name.clone();
                self.wait_for(&stage_name, verb).await?;
                let inner = self.ctx.state.inner.lock().await;
                inner
                    .stage_rootfs
                    .get(&stage_name)
                    .cloned()
                    .ok_or_else(|| Error::Lookup {
                        verb: verb.to_owned(),
                        name: stage_name,
                    })
            }
            FromSource::ContextImage(reference) | FromSource::Image(reference) => {
                self.image_rootfs(&reference).await
            }
            FromSource::ContextPath(path) => Ok(path),
            FromSource::ContextUrl { url, cache } => copy::download_url_context(
                &url,
                &cache,
                &self.scratch_dir.join("contexts"),
            )
            .await,
        }
    }

    /// Mounts (and memoizes) the rootfs of a non-stage image.
    async fn image_rootfs(&self, reference: &str) -> Result<PathBuf> {
        {
            let inner = self.ctx.state.inner.lock().await;
            if let Some(mounted) = inner.container_map.get(reference) {
                return Ok(mounted.mount_point.clone());
            }
        }

        // Created outside the lock; a racing duplicate just becomes one
        // more container for cleanup.
        let options = BuilderOptions {
            pull_policy: self.ctx.options.pull_policy,
            platform: self.ctx.target_platform.clone(),
            max_pull_retries: self.ctx.options.max_pull_push_retries,
            labels: Vec::new(),
        };
        let container: Arc<dyn Container> = Arc::from(
            self.ctx
                .runner
                .new_builder(self.ctx.state.cancel_token(), reference, &options)
                .await?,
        );
        let mount_point = container.mount("").await?;

        let mut inner = self.ctx.state.inner.lock().await;
        if let Some(existing) = inner.container_map.get(reference) {
            let mount = existing.mount_point.clone();
            inner.cleanup_containers.push(container);
            return Ok(mount);
        }
        inner.container_map.insert(
            reference.to_owned(),
            crate::build::state::MountedRootfs {
                container,
                mount_point: mount_point.clone(),
            },
        );
        Ok(mount_point)
    }

    /// Waits for another stage, surrendering this stage's permit.
    async fn wait_for(&mut self, stage_name: &str, verb: &str) -> Result<()> {
        let (found, result) = self
            .ctx
            .state
            .wait_for_stage(stage_name, &mut self.permit)
            .await;
        if !found {
            return Err(Error::Lookup {
                verb: verb.to_owned(),
                name: stage_name.to_owned(),
            });
        }
        result
    }

    // ----- preparation and commit ------------------------------------

    /// Resolves this stage's FROM target to a concrete base reference.
    async fn resolve_base(&mut self) -> Result<ResolvedBase> {
        let base = self.expand_args(&self.stage.base.clone())?;

        if let Some(context) = self.ctx.options.additional_contexts.get(&base) {
            if context.is_image {
                let value = context
                    .value
                    .strip_prefix("docker://")
                    .unwrap_or(&context.value);
                return Ok(ResolvedBase {
                    reference: value.to_owned(),
                    pull_policy: self.ctx.options.pull_policy,
                });
            }
        }

        let is_stage = self
            .ctx
            .stages
            .by_name(&base)
            .is_some_and(|stage| stage.index < self.position);
        if is_stage {
            let stage_name = self
                .ctx
                .stages
                .by_name(&base)
                .map(|stage| stage.name.clone())
                .unwrap_or(base.clone());
            self.wait_for(&stage_name, "FROM").await?;
            let image = self
                .ctx
                .state
                .stage_image(&stage_name)
                .await
                .ok_or_else(|| Error::Lookup {
                    verb: "FROM".into(),
                    name: stage_name,
                })?;
            self.preserve_base_annotations = true;
            return Ok(ResolvedBase {
                reference: image,
                pull_policy: PullPolicy::Never,
            });
        }

        Ok(ResolvedBase {
            reference: base,
            pull_policy: self.ctx.options.pull_policy,
        })
    }

    /// Creates (or re-creates) the working container from `base`.
    async fn prepare(&mut self, base: &str, pull_policy: PullPolicy, initial: bool) -> Result<()> {
        let security_labels = {
            let inner = self.ctx.state.inner.lock().await;
            inner.security_labels.clone()
        };
        let options = BuilderOptions {
            pull_policy,
            platform: self.ctx.target_platform.clone(),
            max_pull_retries: self.ctx.options.max_pull_push_retries,
            labels: security_labels,
        };
        let container: Arc<dyn Container> = Arc::from(
            self.ctx
                .runner
                .new_builder(self.ctx.state.cancel_token(), base, &options)
                .await?,
        );
        self.mount_point = container.mount("").await?;
        self.scratch_dir = self.ctx.store.container_directory(container.id()).await?;

        // Seed config + cache inputs from the base image.
        if let Some(image_id) = container.from_image_id() {
            let config = self.ctx.store.image_config(image_id).await?;
            self.base_history = config.history.clone();
            self.base_diff_ids = config.rootfs.diff_ids.clone();
            self.config = config.config;
        } else {
            self.base_history = Vec::new();
            self.base_diff_ids = Vec::new();
            self.config = RuntimeConfig::default();
        }
        if initial && self.ctx.options.inherit_labels.is_false() {
            self.config.labels = None;
        }

        let mut volumes = VolumeManager::new(
            &self.mount_point,
            &self.scratch_dir,
            self.ctx.store.graph_driver_name(),
        );
        if let Some(declared) = &self.config.volumes {
            for path in declared.keys() {
                volumes.preserve(path)?;
            }
        }
        self.volumes = Some(volumes);

        if initial {
            let mut inner = self.ctx.state.inner.lock().await;
            if let Some(digest) = container.from_image_digest() {
                inner
                    .stage_digests
                    .insert(self.name.clone(), digest.to_string());
            }
            if self.position == 0 && inner.security_labels.is_empty() {
                inner.security_labels = container.security_labels();
            }
        }

        if let Some(previous) = self.container.replace(container) {
            self.ctx.state.defer_container_cleanup(previous).await;
        }
        Ok(())
    }

    /// Re-prepares from a just-committed (or cache) image.
    async fn reprepare(&mut self, image_id: &str) -> Result<()> {
        self.prepare(image_id, PullPolicy::Never, false).await
    }

    /// Commits the working container.
    async fn commit(
        &mut self,
        text: String,
        empty_layer: bool,
        final_commit: bool,
        squash: bool,
    ) -> Result<(String, Option<Digest>)> {
        let options = &self.ctx.options;
        let final_of_build = final_commit && self.target_stage;
        let annotations = if final_of_build {
            options
                .annotations
                .iter()
                .filter_map(|pair| {
                    pair.split_once('=')
                        .map(|(k, v)| (k.to_owned(), v.to_owned()))
                })
                .collect()
        } else {
            Vec::new()
        };

        let commit_options = CommitOptions {
            created_by: text,
            author: None,
            empty_layer,
            output_name: if final_commit { self.output.clone() } else { None },
            squash,
            format: options.output_format.clone(),
            runtime_config: self.config.clone(),
            created: self.commit_created(),
            rewrite_timestamp: options.rewrite_timestamp,
            inherit_labels: options.inherit_labels.unwrap_or(true),
            unset_labels: options.unset_labels.clone(),
            inherit_annotations: self.preserve_base_annotations
                || !options.inherit_annotations.is_false(),
            annotations,
            unset_annotations: if final_of_build {
                options.unset_annotations.clone()
            } else {
                Vec::new()
            },
            identity_label: options.identity_label.unwrap_or(false),
        };

        self.container()?
            .commit(self.ctx.state.cancel_token(), &commit_options)
            .await
    }

    fn commit_created(&self) -> Option<OffsetDateTime> {
        let options = &self.ctx.options;
        options
            .timestamp
            .or(options.source_date_epoch)
            .and_then(|seconds| OffsetDateTime::from_unix_timestamp(seconds).ok())
    }

    /// Handles a stage that is nothing but its FROM line.
    async fn finish_base_only_stage(mut self) -> Result<StageOutcome> {
        let container = self.container()?;
        let base_image = container.from_image_id().map(str::to_owned);

        let needs_commit = self.modifications_require_commit();
        if needs_commit {
            let suffix = created_by::metadata_suffix(&self.ctx.options, self.target_stage);
            let text = created_by::for_metadata("FROM", &suffix);
            let squash = self.ctx.options.squash && self.target_stage;
            let (image_id, digest) = self
                .commit(text, true, true, squash)
                .await
                .map_err(|err| Error::in_stage(self.name.clone(), err))?;
            self.ctx.log.result(&image_id);
            self.finish_stage_rootfs().await?;
            return Ok(StageOutcome {
                image_id: Some(image_id),
                canonical_digest: digest,
                only_base_image: false,
            });
        }

        // Nothing to change: the base image is the stage's image.
        if let (Some(image), Some(output)) = (&base_image, &self.output) {
            self.ctx.store.add_image_name(image, output).await?;
        }
        self.finish_stage_rootfs().await?;
        Ok(StageOutcome {
            image_id: base_image,
            canonical_digest: None,
            only_base_image: true,
        })
    }

    /// Whether config-affecting options force a commit of a bare FROM.
    fn modifications_require_commit(&self) -> bool {
        let options = &self.ctx.options;
        options.squash
            || options.inherit_labels == Tristate::False
            || !options.unset_labels.is_empty()
            || (self.target_stage
                && (!options.annotations.is_empty()
                    || !options.unset_annotations.is_empty()
                    || options.inherit_annotations == Tristate::False))
    }

    /// Records this stage's rootfs for later stages that consume it.
    async fn finish_stage_rootfs(&mut self) -> Result<()> {
        let keep = self.rootfs_used_later().await;
        let mut inner = self.ctx.state.inner.lock().await;
        if keep {
            inner
                .stage_rootfs
                .insert(self.name.clone(), self.mount_point.clone());
        }
        if let Some(container) = self.container.take() {
            inner.cleanup_containers.push(container);
        }
        Ok(())
    }

    async fn rootfs_used_later(&self) -> bool {
        let inner = self.ctx.state.inner.lock().await;
        inner.rootfs_map.contains(&self.name)
    }

    async fn referenced_later(&self) -> bool {
        let inner = self.ctx.state.inner.lock().await;
        inner.base_map.contains(&self.name) || inner.rootfs_map.contains(&self.name)
    }

    // ----- small helpers ---------------------------------------------

    fn container(&self) -> Result<&Arc<dyn Container>> {
        self.container
            .as_ref()
            .ok_or_else(|| Error::Driver("stage has no working container".into()))
    }

    fn shell(&self) -> Vec<String> {
        self.config
            .shell
            .clone()
            .unwrap_or_else(|| vec!["/bin/sh".to_owned(), "-c".to_owned()])
    }

    /// Expands `$VAR` against the image env and in-scope args.
    fn expand_args(&self, input: &str) -> Result<String> {
        let env = &self.config.env;
        let args = &self.args_in_scope;
        let globals = &self.ctx.stages.global_args;
        let user = &self.ctx.args;
        Ok(expand(input, &|name| {
            if let Some(value) = env_value(env, name) {
                return Some(value);
            }
            if let Some(value) = args.get(name) {
                return value.clone();
            }
            if let Some(value) = user.get(name) {
                return Some(value.clone());
            }
            globals.get(name).cloned().flatten()
        })?)
    }

    fn sample_rusage(&self) -> Option<Rusage> {
        if self.ctx.options.log_rusage {
            Rusage::sample().ok()
        } else {
            None
        }
    }

    fn log_rusage(&self, step: &str, before: Option<Rusage>) {
        let Some(before) = before else { return };
        let Ok(after) = Rusage::sample() else { return };
        let delta = after.since(&before);
        match &self.ctx.rusage_log {
            Some(log) => log.info(format_args!("{step} {}", delta.display())),
            None => self.ctx.log.info(format_args!("{step} {}", delta.display())),
        }
    }
}

/// The concrete base a stage prepares from.
struct ResolvedBase {
    reference: String,
    pull_policy: PullPolicy,
}

/// Per-step result fed back to the stage loop.
struct StepResult {
    created_by: String,
    cached: bool,
}

/// Builds the argv a RUN executes, folding heredoc bodies into the script.
fn run_argv(run: &Run, shell: &[String]) -> Vec<String> {
    match &run.command {
        ShellOrExec::Exec(argv) => argv.clone(),
        ShellOrExec::Shell(line) => {
            let mut argv = shell.to_vec();
            if run.heredocs.is_empty() {
                argv.push(line.clone());
            } else {
                argv.push(heredoc_script(&run.heredocs));
            }
            argv
        }
    }
}

fn heredoc_script(heredocs: &[Heredoc]) -> String {
    heredocs
        .iter()
        .map(|heredoc| heredoc.content.as_str())
        .collect::<Vec<_>>()
        .join("\n")
}

fn env_contains(env: &[String], name: &str) -> bool {
    env_value(env, name).is_some()
}

fn env_value(env: &[String], name: &str) -> Option<String> {
    env.iter().find_map(|entry| {
        entry
            .split_once('=')
            .filter(|(key, _)| *key == name)
            .map(|(_, value)| value.to_owned())
    })
}

fn upsert_env(env: &mut Vec<String>, key: &str, value: &str) {
    let entry = format!("{key}={value}");
    match env.iter_mut().find(|existing| {
        existing
            .split_once('=')
            .is_some_and(|(existing_key, _)| existing_key == key)
    }) {
        Some(existing) => *existing = entry,
        None => env.push(entry),
    }
}

/// Translates a HEALTHCHECK instruction into config form.
fn build_healthcheck(healthcheck: &kiln_script::Healthcheck) -> HealthcheckConfig {
    if healthcheck.none {
        return HealthcheckConfig {
            test: vec!["NONE".to_owned()],
            ..HealthcheckConfig::default()
        };
    }
    let test = match &healthcheck.command {
        Some(ShellOrExec::Shell(line)) => vec!["CMD-SHELL".to_owned(), line.clone()],
        Some(ShellOrExec::Exec(argv)) => {
            let mut test = vec!["CMD".to_owned()];
            test.extend(argv.iter().skip(1).cloned());
            test
        }
        None => Vec::new(),
    };
    let mut config = HealthcheckConfig {
        test,
        ..HealthcheckConfig::default()
    };
    for option in &healthcheck.options {
        let Some((key, value)) = option.trim_start_matches("--").split_once('=') else {
            continue;
        };
        match key {
            "interval" => config.interval = parse_duration_nanos(value),
            "timeout" => config.timeout = parse_duration_nanos(value),
            "start-period" => config.start_period = parse_duration_nanos(value),
            "retries" => config.retries = value.parse().ok(),
            _ => {}
        }
    }
    config
}

/// `30s` / `5m` / `1h` / bare-seconds → nanoseconds.
fn parse_duration_nanos(value: &str) -> Option<i64> {
    let (digits, unit) = match value.find(|c: char| !c.is_ascii_digit()) {
        Some(at) => value.split_at(at),
        None => (value, "s"),
    };
    let amount: i64 = digits.parse().ok()?;
    let seconds = match unit {
        "s" | "" => amount,
        "m" => amount * 60,
        "h" => amount * 3600,
        "ms" => return Some(amount * 1_000_000),
        _ => return None,
    };
    Some(seconds * 1_000_000_000)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_upsert_replaces_existing_keys() {
        let mut env = vec!["PATH=/bin".to_owned()];
        upsert_env(&mut env, "PATH", "/usr/bin");
        upsert_env(&mut env, "HOME", "/root");
        assert_eq!(env, vec!["PATH=/usr/bin".to_owned(), "HOME=/root".to_owned()]);
    }

    #[test]
    fn durations_parse() {
        assert_eq!(parse_duration_nanos("30s"), Some(30_000_000_000));
        assert_eq!(parse_duration_nanos("5m"), Some(300_000_000_000));
        assert_eq!(parse_duration_nanos("2"), Some(2_000_000_000));
        assert_eq!(parse_duration_nanos("250ms"), Some(250_000_000));
        assert_eq!(parse_duration_nanos("bad"), None);
    }

    #[test]
    fn heredoc_run_becomes_script() {
        let run = Run {
            command: ShellOrExec::Shell("<<EOF".into()),
            mounts: Vec::new(),
            network: None,
            heredocs: vec![Heredoc {
                name: "EOF".into(),
                content: "apt-get update\napt-get install -y curl".into(),
            }],
            original: "RUN <<EOF".into(),
        };
        let argv = run_argv(&run, &["/bin/sh".to_owned(), "-c".to_owned()]);
        assert_eq!(argv.len(), 3);
        assert!(argv[2].contains("apt-get update"));
    }
}

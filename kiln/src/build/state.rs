//! Shared per-build state mutated by concurrent stage workers.
//!
//! One mutex guards all the cross-stage maps; the image-info cache keeps
//! its own lock so cache probes do not contend with stage bookkeeping.
//! Stage completion is broadcast through one `Notify` per stage (shared
//! between a stage's name and its numeric alias), so waiters never poll.
//! A waiter always releases its semaphore permit before blocking and
//! re-acquires it after waking; with fewer permits than stages this is
//! what keeps the pool from deadlocking.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use kiln_script::Stages;
use tokio::sync::{Mutex, Notify, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::cache::ImageInfoCache;
use crate::driver::Container;
use crate::{Error, Result};

/// A helper container mounted to expose an image's rootfs for
/// `COPY --from=<image>` / `RUN --mount=from=<image>`.
pub(crate) struct MountedRootfs {
    /// The helper container.
    pub container: Arc<dyn Container>,
    /// Its mounted rootfs.
    pub mount_point: PathBuf,
}

impl std::fmt::Debug for MountedRootfs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MountedRootfs")
            .field("mount_point", &self.mount_point)
            .finish_non_exhaustive()
    }
}

/// Everything under the single stage-state lock.
#[derive(Default)]
pub(crate) struct StateInner {
    /// Stage name (and numeric alias) → committed image ID.
    pub image_map: HashMap<String, String>,
    /// Stage names referenced as a FROM base by later stages.
    pub base_map: HashSet<String>,
    /// Stage names whose rootfs later stages consume.
    pub rootfs_map: HashSet<String>,
    /// Mount point of a finished stage's kept-alive rootfs.
    pub stage_rootfs: HashMap<String, PathBuf>,
    /// Base-image manifest digest recorded by each stage's builder.
    pub stage_digests: HashMap<String, String>,
    /// Image name → helper container exposing that image's rootfs.
    pub container_map: HashMap<String, MountedRootfs>,
    /// Stage name (and numeric alias) → terminal error, `None` on success.
    pub terminated: HashMap<String, Option<String>>,
    /// Working containers awaiting deferred deletion.
    pub cleanup_containers: Vec<Arc<dyn Container>>,
    /// Intermediate image IDs accumulated during the build.
    pub intermediate_images: Vec<String>,
    /// First fatal error observed; stages abort once set.
    pub last_error: Option<String>,
    /// SELinux process/mount labels recorded by the first stage.
    pub security_labels: Vec<String>,
}

/// Shared state for one (script, platform) build.
pub(crate) struct ExecutorState {
    /// The global job budget; the only concurrency gate between stages.
    semaphore: Arc<Semaphore>,
    /// Build-scoped cancellation; tripped on the first stage failure.
    cancel: CancellationToken,
    /// Parsed-config cache for cache probes; has its own lock.
    pub info_cache: ImageInfoCache,
    /// The cross-stage maps, under one lock.
    pub inner: Mutex<StateInner>,
    /// Completion broadcast per stage; name and numeric alias share one.
    notifies: HashMap<String, Arc<Notify>>,
}

impl ExecutorState {
    /// Initializes state for a stage set with a `jobs`-wide semaphore.
    pub fn new(stages: &Stages, jobs: usize, cancel: CancellationToken) -> Self {
        let mut notifies = HashMap::new();
        for stage in &stages.stages {
            let notify = Arc::new(Notify::new());
            notifies.insert(stage.name.clone(), Arc::clone(&notify));
            notifies.insert(stage.index.to_string(), notify);
        }
        Self {
            semaphore: Arc::new(Semaphore::new(jobs)),
            cancel,
            info_cache: ImageInfoCache::new(),
            inner: Mutex::new(StateInner::default()),
            notifies,
        }
    }

    /// The build's cancellation token.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Acquires one stage permit, honoring cancellation.
    pub async fn acquire_permit(&self) -> Result<OwnedSemaphorePermit> {
        tokio::select! {
            () = self.cancel.cancelled() => Err(Error::Cancelled),
            permit = Arc::clone(&self.semaphore).acquire_owned() => {
                permit.map_err(|_| Error::Cancelled)
            }
        }
    }

    /// Blocks until the named stage terminates.
    ///
    /// Returns `(false, Ok(()))` when no such stage exists. While waiting,
    /// the caller's permit is released so the waiter cannot starve the
    /// pool, and re-acquired before returning.
    pub async fn wait_for_stage(
        &self,
        name: &str,
        permit: &mut Option<OwnedSemaphorePermit>,
    ) -> (bool, Result<()>) {
        let Some(notify) = self.notifies.get(name) else {
            return (false, Ok(()));
        };

        loop {
            // Register for the wakeup before re-checking state, so a
            // completion between the check and the await is not lost.
            let notified = notify.notified();
            {
                let inner = self.inner.lock().await;
                if let Some(result) = inner.terminated.get(name) {
                    let outcome = match result {
                        None => Ok(()),
                        Some(message) => Err(Error::StageDependency {
                            stage: name.to_owned(),
                            message: message.clone(),
                        }),
                    };
                    return (true, outcome);
                }
                if let Some(message) = &inner.last_error {
                    return (
                        true,
                        Err(Error::StageDependency {
                            stage: name.to_owned(),
                            message: message.clone(),
                        }),
                    );
                }
            }

            drop(permit.take());
            tokio::select! {
                () = self.cancel.cancelled() => return (true, Err(Error::Cancelled)),
                () = notified => {}
            }
            match self.acquire_permit().await {
                Ok(reacquired) => *permit = Some(reacquired),
                Err(err) => return (true, Err(err)),
            }
        }
    }

    /// Records a stage's terminal state under the lock, then wakes waiters.
    ///
    /// Writes to `image_map` happen in the same critical section, so any
    /// waiter observing the termination also observes the image.
    pub async fn record_stage_done(
        &self,
        name: &str,
        position: usize,
        image_id: Option<String>,
        error: Option<String>,
    ) {
        let alias = position.to_string();
        {
            let mut inner = self.inner.lock().await;
            if let Some(image_id) = image_id {
                inner.image_map.insert(name.to_owned(), image_id.clone());
                inner.image_map.insert(alias.clone(), image_id);
            }
            if error.is_some() && inner.last_error.is_none() {
                inner.last_error.clone_from(&error);
            }
            inner.terminated.insert(name.to_owned(), error.clone());
            inner.terminated.insert(alias.clone(), error);
        }
        if let Some(notify) = self.notifies.get(name) {
            notify.notify_waiters();
        }
        if let Some(notify) = self.notifies.get(&alias) {
            notify.notify_waiters();
        }
    }

    /// Records the first fatal error (first writer wins) and cancels the
    /// build so idle stages abort without running.
    pub async fn record_fatal(&self, message: String) {
        {
            let mut inner = self.inner.lock().await;
            if inner.last_error.is_none() {
                inner.last_error = Some(message);
            }
        }
        self.cancel.cancel();
        for notify in self.notifies.values() {
            notify.notify_waiters();
        }
    }

    /// The first fatal error, if any.
    pub async fn last_error(&self) -> Option<String> {
        self.inner.lock().await.last_error.clone()
    }

    /// The committed image of a finished stage.
    pub async fn stage_image(&self, name: &str) -> Option<String> {
        self.inner.lock().await.image_map.get(name).cloned()
    }

    /// Registers a container for deferred deletion at build cleanup.
    pub async fn defer_container_cleanup(&self, container: Arc<dyn Container>) {
        self.inner.lock().await.cleanup_containers.push(container);
    }

    /// Registers an intermediate image for deletion at build cleanup.
    pub async fn defer_image_cleanup(&self, image_id: String) {
        self.inner.lock().await.intermediate_images.push(image_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_script::{Instruction, Node, Script};

    fn two_stages() -> Stages {
        let script = Script::new(vec![
            Node {
                value: "FROM".into(),
                original: "FROM a AS first".into(),
                flags: vec![],
                children: vec!["a".into(), "AS".into(), "first".into()],
                heredocs: vec![],
            },
            Node {
                value: "FROM".into(),
                original: "FROM b".into(),
                flags: vec![],
                children: vec!["b".into()],
                heredocs: vec![],
            },
        ]);
        Stages::split(Instruction::from_script(&script).unwrap()).unwrap()
    }

    #[tokio::test]
    async fn unknown_stage_is_not_found() {
        let state = ExecutorState::new(&two_stages(), 1, CancellationToken::new());
        let mut permit = Some(state.acquire_permit().await.unwrap());
        let (found, result) = state.wait_for_stage("missing", &mut permit).await;
        assert!(!found);
        assert!(result.is_ok());
        assert!(permit.is_some());
    }

    #[tokio::test]
    async fn waiter_sees_image_written_before_termination() {
        let state = Arc::new(ExecutorState::new(&two_stages(), 1, CancellationToken::new()));

        let waiter = {
            let state = Arc::clone(&state);
            tokio::spawn(async move {
                let mut permit = Some(state.acquire_permit().await.unwrap());
                let (found, result) = state.wait_for_stage("first", &mut permit).await;
                assert!(found);
                result.unwrap();
                state.stage_image("first").await
            })
        };

        // The single permit is held by the waiter until it blocks; this
        // write path takes no permit, mirroring the collector.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        state
            .record_stage_done("first", 0, Some("img-1".into()), None)
            .await;

        assert_eq!(waiter.await.unwrap().as_deref(), Some("img-1"));
    }

    #[tokio::test]
    async fn waiting_on_failed_stage_propagates_error() {
        let state = ExecutorState::new(&two_stages(), 1, CancellationToken::new());
        state
            .record_stage_done("first", 0, None, Some("exit status 1".into()))
            .await;
        let mut permit = None;
        // The numeric alias observes the same termination.
        let (found, result) = state.wait_for_stage("0", &mut permit).await;
        assert!(found);
        assert!(matches!(result, Err(Error::StageDependency { .. })));
    }

    #[tokio::test]
    async fn fatal_error_wakes_waiters() {
        let state = Arc::new(ExecutorState::new(&two_stages(), 1, CancellationToken::new()));
        let waiter = {
            let state = Arc::clone(&state);
            tokio::spawn(async move {
                let mut permit = None;
                state.wait_for_stage("first", &mut permit).await
            })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        state.record_fatal("boom".into()).await;
        let (found, result) = waiter.await.unwrap();
        assert!(found);
        assert!(result.is_err());
    }
}

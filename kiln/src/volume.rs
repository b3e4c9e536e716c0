//! Preservation of declared `VOLUME` paths across RUN instructions.
//!
//! Docker-compatible behavior: once a path is declared a volume, changes a
//! RUN makes under it are discarded. On the overlay graph driver each RUN
//! gets a throwaway upper layer over the volume; on any other driver the
//! tree is archived once and restored after the RUN.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use indexmap::IndexSet;

use crate::driver::RunMount;
use crate::{Error, Result};

/// Recorded ownership/permission/mtime of a preserved volume root.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct VolumeStat {
    mode: u32,
    uid: u32,
    gid: u32,
    mtime_secs: i64,
}

impl VolumeStat {
    fn capture(path: &Path) -> Result<Self> {
        let metadata = fs::metadata(path)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::MetadataExt;
            Ok(Self {
                mode: metadata.mode(),
                uid: metadata.uid(),
                gid: metadata.gid(),
                mtime_secs: metadata.mtime(),
            })
        }
        #[cfg(not(unix))]
        {
            let _ = metadata;
            Ok(Self::default())
        }
    }

    #[cfg(unix)]
    fn restore(&self, path: &Path) -> Result<()> {
        use std::os::unix::fs::PermissionsExt;

        use nix::sys::stat::utimes;
        use nix::sys::time::TimeVal;
        use nix::unistd::{Gid, Uid, chown};

        fs::set_permissions(path, fs::Permissions::from_mode(self.mode))?;
        chown(
            path,
            Some(Uid::from_raw(self.uid)),
            Some(Gid::from_raw(self.gid)),
        )
        .map_err(|e| Error::Driver(format!("chown {}: {e}", path.display())))?;
        let at = TimeVal::new(self.mtime_secs, 0);
        utimes(path, &at, &at)
            .map_err(|e| Error::Driver(format!("utimes {}: {e}", path.display())))?;
        Ok(())
    }

    #[cfg(not(unix))]
    fn restore(&self, _path: &Path) -> Result<()> {
        Ok(())
    }
}

/// Manages the volume set of one working container.
#[derive(Debug)]
pub struct VolumeManager {
    /// The container's mounted rootfs.
    mount_point: PathBuf,
    /// Container-scoped scratch directory for cache archives and overlays.
    scratch_dir: PathBuf,
    /// The store's graph driver; selects the save strategy.
    graph_driver: String,
    /// Preserved volume paths, in declaration order.
    volumes: IndexSet<String>,
    /// Assigned cache archive per volume path.
    cache_files: HashMap<String, PathBuf>,
    /// Captured stat per volume path.
    stats: HashMap<String, VolumeStat>,
    /// Overlay upper/work directories of the current RUN, discarded on
    /// restore.
    overlay_dirs: Vec<PathBuf>,
    /// Monotonic counter naming cache files.
    next_cache_id: u64,
}

impl VolumeManager {
    /// A manager for a container mounted at `mount_point`, caching under
    /// `scratch_dir`.
    pub fn new(
        mount_point: impl Into<PathBuf>,
        scratch_dir: impl Into<PathBuf>,
        graph_driver: impl Into<String>,
    ) -> Self {
        Self {
            mount_point: mount_point.into(),
            scratch_dir: scratch_dir.into(),
            graph_driver: graph_driver.into(),
            volumes: IndexSet::new(),
            cache_files: HashMap::new(),
            stats: HashMap::new(),
            overlay_dirs: Vec::new(),
            next_cache_id: 0,
        }
    }

    /// The preserved paths, in declaration order.
    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.volumes.iter().map(String::as_str)
    }

    /// Records `path` as a volume to preserve.
    ///
    /// Creates the directory (0755) when absent. A path covered by an
    /// already-preserved ancestor only refreshes its stat; a path covering
    /// existing volumes subsumes them and drops their cache archives.
    pub fn preserve(&mut self, path: &str) -> Result<()> {
        let normalized = normalize_volume_path(path);
        let host_path = self.resolve_in_mount(&normalized)?;

        if !host_path.exists() {
            fs::create_dir_all(&host_path)?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                fs::set_permissions(&host_path, fs::Permissions::from_mode(0o755))?;
            }
            // The parent's archive, if any, predates this directory.
            self.invalidate_covering(&normalized);
        }

        if self.covered_by_existing(&normalized) {
            self.stats
                .insert(normalized.clone(), VolumeStat::capture(&host_path)?);
            return Ok(());
        }

        // Subsume any previously-preserved descendants.
        let descendants: Vec<String> = self
            .volumes
            .iter()
            .filter(|existing| covers(&normalized, existing))
            .cloned()
            .collect();
        for descendant in descendants {
            self.volumes.shift_remove(&descendant);
            self.stats.remove(&descendant);
            if let Some(cache) = self.cache_files.remove(&descendant) {
                let _ = fs::remove_file(cache);
            }
        }

        let cache_file = self
            .scratch_dir
            .join(format!("volume-cache-{}.tar", self.next_cache_id));
        self.next_cache_id += 1;
        self.volumes.insert(normalized.clone());
        self.cache_files.insert(normalized.clone(), cache_file);
        self.stats
            .insert(normalized, VolumeStat::capture(&host_path)?);
        Ok(())
    }

    /// Drops the cache archive of any volume covering `dest`, so the next
    /// save re-captures post-copy contents.
    pub fn invalidate(&mut self, dest: &str) {
        let normalized = normalize_volume_path(dest);
        let stale: Vec<PathBuf> = self
            .volumes
            .iter()
            .filter(|volume| covers(volume, &normalized) || covers(&normalized, volume))
            .filter_map(|volume| self.cache_files.get(volume.as_str()).cloned())
            .collect();
        for cache in stale {
            let _ = fs::remove_file(cache);
        }
    }

    /// Prepares mounts protecting every preserved volume for one RUN.
    pub fn save(&mut self) -> Result<Vec<RunMount>> {
        let mut mounts = Vec::with_capacity(self.volumes.len());
        if self.graph_driver == "overlay" {
            for volume in &self.volumes {
                let id = self.overlay_dirs.len();
                let upper = self.scratch_dir.join(format!("volume-upper-{id}"));
                let work = self.scratch_dir.join(format!("volume-work-{id}"));
                fs::create_dir_all(&upper)?;
                fs::create_dir_all(&work)?;
                let lower = self.resolve_in_mount(volume)?;
                mounts.push(RunMount {
                    kind: "overlay".into(),
                    source: lower,
                    destination: volume.clone(),
                    options: vec![
                        format!("upperdir={}", upper.display()),
                        format!("workdir={}", work.display()),
                    ],
                });
                self.overlay_dirs.push(upper);
                self.overlay_dirs.push(work);
            }
            return Ok(mounts);
        }

        for volume in &self.volumes {
            let host_path = self.resolve_in_mount(volume)?;
            let cache = self
                .cache_files
                .get(volume.as_str())
                .cloned()
                .ok_or_else(|| Error::Driver(format!("volume {volume} has no cache file")))?;
            if !cache.exists() {
                archive_tree(&host_path, &cache)?;
            }
            mounts.push(RunMount {
                kind: "bind".into(),
                source: host_path,
                destination: volume.clone(),
                options: vec!["ro".into()],
            });
        }
        Ok(mounts)
    }

    /// Undoes whatever the RUN did beneath preserved volumes.
    pub fn restore(&mut self) -> Result<()> {
        if self.graph_driver == "overlay" {
            // Upper layers are throwaway; removing them discards the writes.
            for dir in self.overlay_dirs.drain(..) {
                let _ = fs::remove_dir_all(dir);
            }
            return Ok(());
        }

        for volume in &self.volumes {
            let host_path = self.resolve_in_mount(volume)?;
            let cache = self
                .cache_files
                .get(volume.as_str())
                .ok_or_else(|| Error::Driver(format!("volume {volume} has no cache file")))?;
            if !cache.exists() {
                continue;
            }
            if host_path.exists() {
                fs::remove_dir_all(&host_path)?;
            }
            fs::create_dir_all(&host_path)?;
            let mut archive = tar::Archive::new(fs::File::open(cache)?);
            archive.set_preserve_permissions(true);
            archive.unpack(&host_path)?;
            if let Some(stat) = self.stats.get(volume.as_str()) {
                stat.restore(&host_path)?;
            }
        }
        Ok(())
    }

    fn covered_by_existing(&self, path: &str) -> bool {
        self.volumes.iter().any(|existing| covers(existing, path))
    }

    /// Invalidates the archive of any existing volume that contains `path`.
    fn invalidate_covering(&mut self, path: &str) {
        let covering: Vec<PathBuf> = self
            .volumes
            .iter()
            .filter(|existing| covers(existing, path))
            .filter_map(|existing| self.cache_files.get(existing.as_str()).cloned())
            .collect();
        for cache in covering {
            let _ = fs::remove_file(cache);
        }
    }

    /// Maps a container-absolute volume path onto the mounted rootfs,
    /// resolving symlinks and rejecting escapes.
    fn resolve_in_mount(&self, path: &str) -> Result<PathBuf> {
        let relative = path.trim_start_matches('/');
        let joined = self.mount_point.join(relative);
        if joined
            .components()
            .any(|c| matches!(c, std::path::Component::ParentDir))
        {
            return Err(Error::Driver(format!("volume path {path} escapes the rootfs")));
        }
        if joined.exists() {
            let canonical = fs::canonicalize(&joined)?;
            let mount_canonical = fs::canonicalize(&self.mount_point)?;
            if !canonical.starts_with(&mount_canonical) {
                return Err(Error::Driver(format!(
                    "volume path {path} resolves outside the rootfs"
                )));
            }
            return Ok(canonical);
        }
        Ok(joined)
    }
}

/// Collapses a volume spec to a canonical absolute path string.
fn normalize_volume_path(path: &str) -> String {
    let trimmed = path.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_owned()
    } else if trimmed.starts_with('/') {
        trimmed.to_owned()
    } else {
        format!("/{trimmed}")
    }
}

/// Whether volume path `outer` contains `inner` (or is the same path).
fn covers(outer: &str, inner: &str) -> bool {
    inner == outer || inner.starts_with(&format!("{outer}/"))
}

/// Tars a directory tree into `cache`.
fn archive_tree(tree: &Path, cache: &Path) -> Result<()> {
    let file = fs::File::create(cache)?;
    let mut builder = tar::Builder::new(file);
    builder.follow_symlinks(false);
    builder
        .append_dir_all(".", tree)
        .map_err(|e| Error::Driver(format!("archiving {}: {e}", tree.display())))?;
    builder
        .into_inner()
        .map_err(|e| Error::Driver(format!("archiving {}: {e}", tree.display())))?
        .sync_all()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(driver: &str) -> (tempfile::TempDir, tempfile::TempDir, VolumeManager) {
        let mount = tempfile::tempdir().unwrap();
        let scratch = tempfile::tempdir().unwrap();
        let vm = VolumeManager::new(mount.path(), scratch.path(), driver);
        (mount, scratch, vm)
    }

    #[test]
    fn preserve_creates_missing_directories() {
        let (mount, _scratch, mut vm) = manager("vfs");
        vm.preserve("/data/sub").unwrap();
        assert!(mount.path().join("data/sub").is_dir());
        assert_eq!(vm.paths().collect::<Vec<_>>(), vec!["/data/sub"]);
    }

    #[test]
    fn ancestor_subsumes_descendants() {
        let (_mount, _scratch, mut vm) = manager("vfs");
        vm.preserve("/data/a").unwrap();
        vm.preserve("/data/b").unwrap();
        vm.preserve("/data").unwrap();
        assert_eq!(vm.paths().collect::<Vec<_>>(), vec!["/data"]);

        // A descendant of a preserved volume is only a stat refresh.
        vm.preserve("/data/a").unwrap();
        assert_eq!(vm.paths().collect::<Vec<_>>(), vec!["/data"]);
    }

    #[test]
    fn save_and_restore_discard_run_writes() {
        let (mount, _scratch, mut vm) = manager("vfs");
        fs::create_dir_all(mount.path().join("v")).unwrap();
        fs::write(mount.path().join("v/keep"), b"original").unwrap();
        vm.preserve("/v").unwrap();

        let mounts = vm.save().unwrap();
        assert_eq!(mounts.len(), 1);
        assert_eq!(mounts[0].kind, "bind");

        // Simulate a RUN scribbling inside the volume.
        fs::write(mount.path().join("v/marker"), b"scribble").unwrap();
        fs::write(mount.path().join("v/keep"), b"clobbered").unwrap();

        vm.restore().unwrap();
        assert!(!mount.path().join("v/marker").exists());
        assert_eq!(fs::read(mount.path().join("v/keep")).unwrap(), b"original");
    }

    #[test]
    fn invalidate_drops_cache_for_copy_under_volume() {
        let (mount, _scratch, mut vm) = manager("vfs");
        fs::create_dir_all(mount.path().join("v")).unwrap();
        vm.preserve("/v").unwrap();
        vm.save().unwrap();
        let cache = vm.cache_files.get("/v").unwrap().clone();
        assert!(cache.exists());

        vm.invalidate("/v/new-file");
        assert!(!cache.exists());
    }

    #[test]
    fn overlay_driver_emits_overlay_mounts() {
        let (mount, _scratch, mut vm) = manager("overlay");
        fs::create_dir_all(mount.path().join("v")).unwrap();
        vm.preserve("/v").unwrap();
        let mounts = vm.save().unwrap();
        assert_eq!(mounts.len(), 1);
        assert_eq!(mounts[0].kind, "overlay");
        assert!(mounts[0].options.iter().any(|o| o.starts_with("upperdir=")));
        vm.restore().unwrap();
        assert!(vm.overlay_dirs.is_empty());
    }

    #[test]
    fn rejects_escaping_paths() {
        let (_mount, _scratch, mut vm) = manager("vfs");
        assert!(vm.preserve("/../outside").is_err());
    }
}

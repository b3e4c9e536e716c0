//! ADD/COPY mechanics.
//!
//! The stage executor resolves `--from=` targets (waiting on stages,
//! mounting image rootfs) and then hands this module a fully-resolved
//! request; this module owns flag validation, heredoc materialization,
//! ignore-file loading, URL handling, `--parents` destination pivoting,
//! and the delegation to [`Container::add`] that feeds the content
//! digester.

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use kiln_script::FileCopy;
use tokio::sync::Mutex;

use crate::cache::ContentDigester;
use crate::driver::{AddOptions, Container, CopySource};
use crate::{Error, Result};

/// Which instruction drives the copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyVerb {
    /// `ADD` — URLs allowed, archives may be auto-extracted by the runner.
    Add,
    /// `COPY` — local/context sources only.
    Copy,
}

impl CopyVerb {
    /// The uppercase keyword.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Add => "ADD",
            Self::Copy => "COPY",
        }
    }
}

/// Where the copy's sources come from, after `--from=` resolution.
#[derive(Debug, Clone)]
pub enum ResolvedContext {
    /// The build context; honors ignore files, strips setid bits.
    Build(PathBuf),
    /// A mounted rootfs (stage or context image); ownership preserved,
    /// setid bits kept.
    Rootfs(PathBuf),
    /// A plain directory (path/URL additional context); ownership
    /// preserved.
    Directory(PathBuf),
}

impl ResolvedContext {
    fn dir(&self) -> &Path {
        match self {
            Self::Build(dir) | Self::Rootfs(dir) | Self::Directory(dir) => dir,
        }
    }
}

/// A fully-resolved copy, ready to execute.
#[derive(Debug)]
pub struct CopyRequest<'a> {
    /// ADD or COPY.
    pub verb: CopyVerb,
    /// The parsed instruction.
    pub step: &'a FileCopy,
    /// Source context after `--from=` resolution.
    pub context: ResolvedContext,
    /// Scratch directory for heredoc materialization.
    pub scratch_dir: PathBuf,
    /// Ignore patterns from `.containerignore`, for build-context copies.
    pub ignore_patterns: Vec<String>,
    /// Digester accumulating this copy's content identity.
    pub digester: Arc<ContentDigester>,
}

/// What a copy contributed, for cache-key construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CopySummary {
    /// `file`, `dir`, or `multi` — the shape of the copied content.
    pub kind: &'static str,
}

/// Rejects flag combinations the verb does not support.
pub fn validate(verb: CopyVerb, step: &FileCopy) -> Result<()> {
    let reject = |flag: &str| {
        Err(Error::execution(
            &step.original,
            format!("{} does not support {flag}", verb.as_str()),
        ))
    };
    match verb {
        CopyVerb::Add => {
            if step.from.is_some() {
                return reject("--from");
            }
            if step.parents {
                return reject("--parents");
            }
        }
        CopyVerb::Copy => {
            if step.checksum.is_some() {
                return reject("--checksum");
            }
            for source in &step.sources {
                if is_url(source) {
                    return Err(Error::execution(
                        &step.original,
                        "URL sources are only supported by ADD",
                    ));
                }
            }
        }
    }
    Ok(())
}

/// Loads `.containerignore` (or `.dockerignore`) patterns from a context.
pub fn load_ignore_patterns(context_dir: &Path) -> Result<Vec<String>> {
    for name in [".containerignore", ".dockerignore"] {
        let path = context_dir.join(name);
        if !path.exists() {
            continue;
        }
        let text = fs::read_to_string(&path)?;
        return Ok(text
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .map(str::to_owned)
            .collect());
    }
    Ok(Vec::new())
}

/// Downloads a URL-backed additional context, memoizing the result.
///
/// Tar payloads are unpacked; anything else lands as a single file named
/// after the last URL path segment.
pub async fn download_url_context(
    url: &str,
    memo: &Arc<Mutex<Option<PathBuf>>>,
    scratch_dir: &Path,
) -> Result<PathBuf> {
    let mut cached = memo.lock().await;
    if let Some(dir) = cached.as_ref() {
        return Ok(dir.clone());
    }

    let target = scratch_dir.join("url-context");
    let url_owned = url.to_owned();
    let dir = tokio::task::spawn_blocking(move || fetch_and_unpack(&url_owned, &target))
        .await
        .map_err(|e| Error::Driver(format!("download task: {e}")))??;
    *cached = Some(dir.clone());
    Ok(dir)
}

/// Blocking half of the URL-context download.
fn fetch_and_unpack(url: &str, target: &Path) -> Result<PathBuf> {
    fs::create_dir_all(target)?;
    let mut response = ureq::get(url)
        .call()
        .map_err(|e| Error::Driver(format!("GET {url}: {e}")))?;
    let mut body = Vec::new();
    response
        .body_mut()
        .as_reader()
        .read_to_end(&mut body)
        .map_err(|e| Error::Driver(format!("reading {url}: {e}")))?;

    let mut archive = tar::Archive::new(body.as_slice());
    if archive.unpack(target).is_ok() {
        return Ok(target.to_path_buf());
    }
    // Not a tarball; keep it as a single file.
    let name = url
        .rsplit('/')
        .next()
        .filter(|segment| !segment.is_empty())
        .unwrap_or("download");
    fs::write(target.join(name), &body)?;
    Ok(target.to_path_buf())
}

/// Executes one resolved ADD/COPY against a working container.
pub async fn execute(container: &dyn Container, request: &CopyRequest<'_>) -> Result<CopySummary> {
    let step = request.step;
    validate(request.verb, step)?;

    // Heredoc copies read from a materialized scratch subtree and never
    // honor ignore files.
    let (context_dir, sources, use_ignores) = if step.heredocs.is_empty() {
        (
            request.context.dir().to_path_buf(),
            step.sources.clone(),
            matches!(request.context, ResolvedContext::Build(_)),
        )
    } else {
        let dir = materialize_heredocs(step, &request.scratch_dir)?;
        let names = step.heredocs.iter().map(|h| h.name.clone()).collect();
        (dir, names, false)
    };

    let mut excludes: Vec<String> = step.excludes.clone();
    if use_ignores {
        excludes.extend(request.ignore_patterns.iter().cloned());
    }

    let preserve_ownership = !matches!(request.context, ResolvedContext::Build(_));
    let options = AddOptions {
        chown: step.chown.clone(),
        chmod: step.chmod.clone(),
        checksum: step.checksum.clone(),
        link: step.link,
        excludes,
        preserve_ownership,
        strip_setid_bits: !preserve_ownership,
        context_dir: context_dir.clone(),
        digester: Some(Arc::clone(&request.digester)),
    };

    let resolved = resolve_sources(request.verb, &context_dir, &sources, &step.original)?;
    let summary = summarize(&resolved);

    if step.parents {
        // Each /./ pivot source keeps its relative subtree under dest.
        for (source, raw) in resolved.iter().zip(&sources) {
            let dest = parents_destination(&step.dest, raw);
            container
                .add(&dest, request.verb == CopyVerb::Add, &options, std::slice::from_ref(source))
                .await?;
        }
    } else {
        container
            .add(&step.dest, request.verb == CopyVerb::Add, &options, &resolved)
            .await?;
    }
    Ok(summary)
}

/// Materializes heredoc bodies as 0644 files in a fresh scratch subtree.
fn materialize_heredocs(step: &FileCopy, scratch_dir: &Path) -> Result<PathBuf> {
    let dir = scratch_dir.join("heredocs");
    if dir.exists() {
        fs::remove_dir_all(&dir)?;
    }
    fs::create_dir_all(&dir)?;
    for heredoc in &step.heredocs {
        let name = heredoc.name.trim_start_matches('/');
        let path = dir.join(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, heredoc.content.as_bytes())?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&path, fs::Permissions::from_mode(0o644))?;
        }
    }
    Ok(dir)
}

/// Maps raw source specs to host paths / URLs.
fn resolve_sources(
    verb: CopyVerb,
    context_dir: &Path,
    sources: &[String],
    original: &str,
) -> Result<Vec<CopySource>> {
    let mut resolved = Vec::with_capacity(sources.len());
    for source in sources {
        if is_url(source) {
            if verb != CopyVerb::Add {
                return Err(Error::execution(original, "URL sources are only supported by ADD"));
            }
            resolved.push(CopySource::Url(source.clone()));
            continue;
        }
        let relative = source.trim_start_matches('/');
        resolved.push(CopySource::Path(context_dir.join(relative)));
    }
    Ok(resolved)
}

/// `file:` / `dir:` / `multi:` classification for the cache summary.
fn summarize(sources: &[CopySource]) -> CopySummary {
    if sources.len() != 1 {
        return CopySummary { kind: "multi" };
    }
    match &sources[0] {
        CopySource::Path(path) if path.is_dir() => CopySummary { kind: "dir" },
        _ => CopySummary { kind: "file" },
    }
}

/// `--parents`: a source `a/b/./c/d` keeps `c/d` under the destination.
fn parents_destination(dest: &str, raw_source: &str) -> String {
    match raw_source.split_once("/./") {
        Some((_, kept)) => {
            let base = dest.trim_end_matches('/');
            match kept.rsplit_once('/') {
                Some((subtree, _file)) => format!("{base}/{subtree}/"),
                None => format!("{base}/"),
            }
        }
        None => dest.to_owned(),
    }
}

fn is_url(source: &str) -> bool {
    source.starts_with("http://") || source.starts_with("https://")
}

//! User-facing build output.
//!
//! Step banners and cache/tag notices go through [`BuildLog`]; diagnostics
//! go through `tracing`. A log can fan out to several sinks (the caller's
//! writer plus a per-platform log file).

use std::fmt::Arguments;
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;

use crate::Result;

/// Sink-fanning build log. Cheap to share behind an `Arc`.
pub struct BuildLog {
    sinks: Mutex<Vec<Box<dyn Write + Send>>>,
    quiet: bool,
}

impl std::fmt::Debug for BuildLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BuildLog")
            .field("quiet", &self.quiet)
            .finish_non_exhaustive()
    }
}

impl Default for BuildLog {
    fn default() -> Self {
        Self::new()
    }
}

impl BuildLog {
    /// A log with no sinks; output is discarded.
    pub fn new() -> Self {
        Self {
            sinks: Mutex::new(Vec::new()),
            quiet: false,
        }
    }

    /// A log writing to standard output.
    pub fn to_stdout() -> Self {
        let log = Self::new();
        log.add_writer(Box::new(std::io::stdout()));
        log
    }

    /// Suppresses step banners (notices still print).
    pub fn quiet(mut self, quiet: bool) -> Self {
        self.quiet = quiet;
        self
    }

    /// Adds a sink.
    pub fn add_writer(&self, writer: Box<dyn Write + Send>) {
        if let Ok(mut sinks) = self.sinks.lock() {
            sinks.push(writer);
        }
    }

    /// Adds a file sink, creating (or truncating) the file.
    pub fn add_file(&self, path: &Path) -> Result<()> {
        let file = std::fs::File::create(path)?;
        self.add_writer(Box::new(file));
        Ok(())
    }

    /// `STEP n/m: <original instruction text>`.
    pub fn step(&self, index: usize, total: usize, text: &str) {
        if !self.quiet {
            self.line(format_args!("STEP {index}/{total}: {text}"));
        }
    }

    /// `--> <short image id>` after a commit or cache hit.
    pub fn result(&self, image_id: &str) {
        if !self.quiet {
            let short = image_id.get(..12).unwrap_or(image_id);
            self.line(format_args!("--> {short}"));
        }
    }

    /// A free-form notice (`Using cache …`, `Successfully tagged …`).
    pub fn info(&self, args: Arguments<'_>) {
        self.line(args);
    }

    fn line(&self, args: Arguments<'_>) {
        if let Ok(mut sinks) = self.sinks.lock() {
            for sink in sinks.iter_mut() {
                // Build output is best-effort; a dead sink never fails a build.
                let _ = writeln!(sink, "{args}");
                let _ = sink.flush();
            }
        }
    }
}

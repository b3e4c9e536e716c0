//! Content digesting for ADD/COPY cache identity.
//!
//! The digest is a SHA-256 over a canonical tar stream of everything one
//! ADD/COPY writes: header timestamps cleared, directories with zero-length
//! bodies, symlinks contributing their targets, entries visited in sorted
//! order. Byte-identical inputs therefore digest identically regardless of
//! checkout time or directory-listing order.

use std::fs;
use std::io::{self, Read, Write};
use std::path::Path;
use std::sync::Mutex;

use sha2::{Digest as _, Sha256};

use crate::{Error, Result};

/// Accumulating content digester, restarted before each ADD/COPY block.
///
/// Interior-mutable so one instance can be shared with the runner's `add`
/// implementation behind an `Arc`.
pub struct ContentDigester {
    hasher: Mutex<Sha256>,
}

impl std::fmt::Debug for ContentDigester {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContentDigester").finish_non_exhaustive()
    }
}

impl Default for ContentDigester {
    fn default() -> Self {
        Self::new()
    }
}

impl ContentDigester {
    /// A fresh digester.
    pub fn new() -> Self {
        Self {
            hasher: Mutex::new(Sha256::new()),
        }
    }

    /// Discards accumulated state; the next digest starts from scratch.
    pub fn restart(&self) {
        if let Ok(mut hasher) = self.hasher.lock() {
            *hasher = Sha256::new();
        }
    }

    /// Feeds raw bytes into the digest.
    pub fn write_bytes(&self, data: &[u8]) {
        if let Ok(mut hasher) = self.hasher.lock() {
            hasher.update(data);
        }
    }

    /// Hex form of the digest accumulated so far.
    pub fn hex(&self) -> String {
        match self.hasher.lock() {
            Ok(hasher) => format!("{:x}", hasher.clone().finalize()),
            Err(_) => String::new(),
        }
    }

    /// Appends one filesystem tree (or single file) in canonical tar form.
    ///
    /// `name` is the entry name recorded in tar headers, letting callers
    /// digest a source under its destination-relative name.
    pub fn append_path(&self, path: &Path, name: &str) -> Result<()> {
        let mut builder = tar::Builder::new(HashWriter(self));
        builder.follow_symlinks(false);
        append_entry(&mut builder, path, name)?;
        builder
            .into_inner()
            .map_err(|e| Error::Driver(format!("digest tar: {e}")))?;
        Ok(())
    }
}

/// `io::Write` adapter feeding a digester.
struct HashWriter<'a>(&'a ContentDigester);

impl Write for HashWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write_bytes(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Recursively appends `path` as `name`, children in sorted order.
fn append_entry<W: Write>(builder: &mut tar::Builder<W>, path: &Path, name: &str) -> Result<()> {
    let metadata = fs::symlink_metadata(path)?;
    let file_type = metadata.file_type();

    let mut header = tar::Header::new_gnu();
    header.set_mtime(0);
    header.set_uid(0);
    header.set_gid(0);

    if file_type.is_symlink() {
        let target = fs::read_link(path)?;
        header.set_entry_type(tar::EntryType::Symlink);
        header.set_size(0);
        builder
            .append_link(&mut header, name, &target)
            .map_err(|e| Error::Driver(format!("digest tar: {e}")))?;
        return Ok(());
    }

    if file_type.is_dir() {
        header.set_entry_type(tar::EntryType::Directory);
        header.set_size(0);
        header.set_mode(0o755);
        builder
            .append_data(&mut header, format!("{name}/"), io::empty())
            .map_err(|e| Error::Driver(format!("digest tar: {e}")))?;

        let mut children: Vec<_> = fs::read_dir(path)?
            .collect::<io::Result<Vec<_>>>()?
            .into_iter()
            .map(|entry| entry.file_name())
            .collect();
        children.sort();
        for child in children {
            let child_name = format!("{name}/{}", child.to_string_lossy());
            append_entry(builder, &path.join(&child), &child_name)?;
        }
        return Ok(());
    }

    // Regular file (or anything else with readable content).
    header.set_entry_type(tar::EntryType::Regular);
    header.set_size(metadata.len());
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        header.set_mode(metadata.permissions().mode());
    }
    let file = fs::File::open(path)?;
    builder
        .append_data(&mut header, name, LimitedReader(file, metadata.len()))
        .map_err(|e| Error::Driver(format!("digest tar: {e}")))?;
    Ok(())
}

/// Caps a reader at the length recorded in the header, so a file growing
/// mid-digest cannot corrupt the tar stream.
struct LimitedReader(fs::File, u64);

impl Read for LimitedReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.1 == 0 {
            return Ok(0);
        }
        let max = buf.len().min(self.1 as usize);
        let n = self.0.read(&mut buf[..max])?;
        self.1 -= n as u64;
        Ok(n)
    }
}

/// One-shot canonical-tar digest of a host path.
///
/// Used for `--mount=type=bind` source checksums in RUN cache keys.
pub fn tar_digest_of_path(path: &Path) -> Result<String> {
    let digester = ContentDigester::new();
    digester.append_path(path, ".")?;
    Ok(digester.hex())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn identical_trees_digest_identically() {
        let a = tempfile::tempdir().unwrap();
        let b = tempfile::tempdir().unwrap();
        for dir in [a.path(), b.path()] {
            fs::create_dir(dir.join("sub")).unwrap();
            fs::write(dir.join("sub/file.txt"), b"content").unwrap();
            fs::write(dir.join("top"), b"x").unwrap();
        }
        let da = tar_digest_of_path(a.path()).unwrap();
        let db = tar_digest_of_path(b.path()).unwrap();
        assert_eq!(da, db);
        assert_eq!(da.len(), 64);
    }

    #[test]
    fn content_change_changes_digest() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("f"), b"one").unwrap();
        let before = tar_digest_of_path(dir.path()).unwrap();
        fs::write(dir.path().join("f"), b"two").unwrap();
        let after = tar_digest_of_path(dir.path()).unwrap();
        assert_ne!(before, after);
    }

    #[test]
    fn mtime_does_not_affect_digest() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("f");
        fs::write(&file, b"data").unwrap();
        let before = tar_digest_of_path(dir.path()).unwrap();
        // Any later mtime must not show up in the canonical stream.
        let newer = std::time::SystemTime::now() + std::time::Duration::from_secs(3600);
        let file_handle = fs::File::options().write(true).open(&file).unwrap();
        file_handle.set_modified(newer).unwrap();
        drop(file_handle);
        let after = tar_digest_of_path(dir.path()).unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn restart_resets_state() {
        let digester = ContentDigester::new();
        digester.write_bytes(b"abc");
        let first = digester.hex();
        digester.restart();
        digester.write_bytes(b"abc");
        assert_eq!(first, digester.hex());
        digester.restart();
        digester.write_bytes(b"xyz");
        assert_ne!(first, digester.hex());
    }
}

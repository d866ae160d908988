//! Transactional file writes
//!
//! Strategy:
//! - Create a temp directory next to the destination (same filesystem)
//! - Write and fsync the bytes into a file inside it
//! - Rename that file over the destination (atomic on POSIX filesystems)
//! - Best-effort fsync the parent directory, then remove the temp directory
//!
//! The destination is only ever touched by the rename, so a failure before
//! it leaves whatever was there (or its absence) intact.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use log::warn;
use tempfile::TempDir;

/// Replace-or-create a file in one step.
pub trait TransactionalWriter: Send + Sync {
    fn write(&self, destination: &Path, bytes: &[u8]) -> io::Result<()>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct AtomicFileWriter;

impl AtomicFileWriter {
    pub fn new() -> Self {
        Self
    }

    /// Write `bytes` to a staging file beside `destination` without touching
    /// the destination itself.
    pub fn stage(&self, destination: &Path, bytes: &[u8]) -> io::Result<StagedFile> {
        let parent = destination
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let file_name = destination.file_name().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("no file name in {}", destination.display()),
            )
        })?;

        fs::create_dir_all(parent)?;
        let dir = tempfile::Builder::new()
            .prefix(".staging-")
            .tempdir_in(parent)?;
        let staged = dir.path().join(file_name);

        let mut file = File::create(&staged)?;
        file.write_all(bytes)?;
        file.flush()?;
        file.sync_all()?;

        Ok(StagedFile {
            dir,
            staged,
            destination: destination.to_path_buf(),
        })
    }
}

impl TransactionalWriter for AtomicFileWriter {
    fn write(&self, destination: &Path, bytes: &[u8]) -> io::Result<()> {
        self.stage(destination, bytes)?.commit()
    }
}

/// A fully written file waiting to replace its destination.
/// Dropping it without `commit` removes the staging directory.
#[derive(Debug)]
pub struct StagedFile {
    dir: TempDir,
    staged: PathBuf,
    destination: PathBuf,
}

impl StagedFile {
    pub fn path(&self) -> &Path {
        &self.staged
    }

    pub fn commit(self) -> io::Result<()> {
        fs::rename(&self.staged, &self.destination)?;

        if let Some(parent) = self.destination.parent() {
            if let Ok(dir) = File::open(parent) {
                let _ = dir.sync_all();
            }
        }

        // The new content is already in place; a leftover staging directory
        // is only litter.
        if let Err(e) = self.dir.close() {
            warn!("failed to remove staging directory: {}", e);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entries(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn test_write_creates_file_and_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("nested").join("out.bin");

        AtomicFileWriter::new().write(&dest, b"hello").unwrap();

        assert_eq!(fs::read(&dest).unwrap(), b"hello");
        assert_eq!(entries(dest.parent().unwrap()), vec!["out.bin"]);
    }

    #[test]
    fn test_write_replaces_existing() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("out.bin");
        fs::write(&dest, b"old").unwrap();

        AtomicFileWriter::new().write(&dest, b"new content").unwrap();
        assert_eq!(fs::read(&dest).unwrap(), b"new content");
    }

    #[test]
    fn test_uncommitted_stage_leaves_destination_alone() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("out.bin");
        fs::write(&dest, b"original").unwrap();

        let staged = AtomicFileWriter::new().stage(&dest, b"replacement").unwrap();
        assert_eq!(fs::read(staged.path()).unwrap(), b"replacement");
        assert_eq!(fs::read(&dest).unwrap(), b"original");
        drop(staged);

        assert_eq!(fs::read(&dest).unwrap(), b"original");
        assert_eq!(entries(dir.path()), vec!["out.bin"]);
    }

    #[test]
    fn test_uncommitted_stage_leaves_absence_alone() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("never.bin");
        drop(AtomicFileWriter::new().stage(&dest, b"data").unwrap());
        assert!(!dest.exists());
        assert!(entries(dir.path()).is_empty());
    }

    #[test]
    fn test_failed_rename_keeps_old_content() {
        let dir = tempfile::tempdir().unwrap();
        // A non-empty directory at the destination makes the rename fail.
        let dest = dir.path().join("occupied");
        fs::create_dir(&dest).unwrap();
        fs::write(dest.join("keep.txt"), b"still here").unwrap();

        assert!(AtomicFileWriter::new().write(&dest, b"bytes").is_err());
        assert_eq!(fs::read(dest.join("keep.txt")).unwrap(), b"still here");
        assert_eq!(entries(dir.path()), vec!["occupied"]);
    }
}

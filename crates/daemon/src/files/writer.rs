//! Atomic file replacement.
//!
//! Content is written to `<target>.tmp`, the temp file's size is checked
//! against the number of bytes we meant to write, and only then is it renamed
//! over the target. A reader of the target sees either the old content or the
//! new, never a prefix.
//!
//! The temp name is derived from the target, so two concurrent writes to the
//! same path share a temp file. The last rename wins.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use super::error::FileError;

/// Suffix appended to the target path for the in-flight temp file.
pub const TEMP_SUFFIX: &str = ".tmp";

/// Permission bits for files the manager creates.
pub const FILE_MODE: u32 = 0o644;

/// Temp file path for `target`.
pub fn temp_path_for(target: &Path) -> PathBuf {
    let mut name = target.as_os_str().to_owned();
    name.push(TEMP_SUFFIX);
    PathBuf::from(name)
}

/// Open a new file with the manager's permission bits.
pub(crate) fn open_for_write(path: &Path, exclusive: bool) -> std::io::Result<File> {
    let mut options = OpenOptions::new();
    options.write(true);
    if exclusive {
        options.create_new(true);
    } else {
        options.create(true).truncate(true);
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(FILE_MODE);
    }
    options.open(path)
}

/// An in-flight write to a temp file that has not yet replaced its target.
///
/// Dropping a transaction without committing leaves the temp file in place.
#[derive(Debug)]
pub struct WriteTransaction {
    target: PathBuf,
    temp: PathBuf,
    file: Option<File>,
    written: u64,
}

impl WriteTransaction {
    /// Create (or truncate) the temp file for `target`.
    pub fn begin(target: &Path) -> Result<Self, FileError> {
        let temp = temp_path_for(target);
        let file = open_for_write(&temp, false).map_err(|e| FileError::io("create", &temp, e))?;
        debug!(target = ?target, temp = ?temp, "write transaction started");
        Ok(Self {
            target: target.to_path_buf(),
            temp,
            file: Some(file),
            written: 0,
        })
    }

    /// Final destination.
    pub fn target(&self) -> &Path {
        &self.target
    }

    /// Temp file location.
    pub fn temp_path(&self) -> &Path {
        &self.temp
    }

    /// Bytes written so far.
    pub fn written(&self) -> u64 {
        self.written
    }

    /// Append `data` to the temp file.
    pub fn write(&mut self, data: &[u8]) -> Result<(), FileError> {
        let file = self.file.as_mut().ok_or_else(|| FileError::Io {
            op: "write",
            path: self.temp.clone(),
            source: std::io::Error::other("temp file already closed"),
        })?;
        file.write_all(data)
            .map_err(|e| FileError::io("write", &self.temp, e))?;
        self.written += data.len() as u64;
        Ok(())
    }

    /// Check the temp file holds exactly `expected` bytes, then rename it over
    /// the target.
    ///
    /// On a size mismatch the target is untouched and the temp file is left
    /// behind for inspection.
    pub fn commit(mut self, expected: u64) -> Result<PathBuf, FileError> {
        if let Some(file) = self.file.take() {
            file.sync_all()
                .map_err(|e| FileError::io("sync", &self.temp, e))?;
        }

        let actual = fs::metadata(&self.temp)
            .map_err(|e| FileError::io("stat", &self.temp, e))?
            .len();
        if actual != expected {
            warn!(
                path = ?self.target,
                expected,
                actual,
                "temp file size mismatch, target left unchanged"
            );
            return Err(FileError::WriteIntegrity {
                path: self.target.clone(),
                expected,
                actual,
            });
        }

        fs::rename(&self.temp, &self.target)
            .map_err(|e| FileError::io("rename", &self.target, e))?;
        debug!(path = ?self.target, bytes = actual, "write committed");
        Ok(self.target)
    }

    /// Discard the temp file.
    pub fn abort(mut self) {
        drop(self.file.take());
        if let Err(e) = fs::remove_file(&self.temp) {
            warn!(path = ?self.temp, error = %e, "Failed to cleanup temp file");
        }
    }
}

/// Saves edited text with all-or-nothing replacement.
pub struct AtomicWriter;

impl AtomicWriter {
    /// Replace `target` with `content`.
    ///
    /// Empty content is refused before anything touches the filesystem.
    pub fn save_text(target: &Path, content: &str) -> Result<(), FileError> {
        if content.is_empty() {
            return Err(FileError::EmptyContent);
        }

        let mut tx = WriteTransaction::begin(target)?;
        if let Err(e) = tx.write(content.as_bytes()) {
            tx.abort();
            return Err(e);
        }
        let expected = content.len() as u64;
        tx.commit(expected)?;
        Ok(())
    }
}

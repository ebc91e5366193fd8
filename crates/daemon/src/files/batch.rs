//! Multi-file move and delete.
//!
//! Items are processed strictly in submission order. The first failure stops
//! the batch: items already applied stay applied, nothing is rolled back, and
//! the caller learns exactly which item failed and which were never tried.

use std::fs;
use std::io;

use thiserror::Error;
use tracing::{info, warn};

use super::error::FileError;
use super::guard::{anchor_path, FileTarget, SandboxPolicy};

/// A batch move or delete request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchRequest {
    /// Directory the names are relative to.
    pub dir: String,
    /// Selected names, in submission order.
    pub names: Vec<String>,
    /// Audit identity of the caller.
    pub actor: String,
}

impl BatchRequest {
    pub fn new(dir: impl Into<String>, names: Vec<String>, actor: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            names,
            actor: actor.into(),
        }
    }
}

/// Result of a batch that ran to completion.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    /// Base names applied, in order.
    pub applied: Vec<String>,
}

impl BatchOutcome {
    /// The last applied name, used to highlight the listing after a redirect.
    pub fn last(&self) -> Option<&str> {
        self.applied.last().map(String::as_str)
    }
}

/// A batch that stopped part way through.
#[derive(Debug, Error)]
#[error("{op} stopped at {failed:?} after {} applied: {source}", .applied.len())]
pub struct BatchFailure {
    /// `move` or `delete`.
    pub op: &'static str,
    /// Names applied before the failure. Not rolled back.
    pub applied: Vec<String>,
    /// The name that failed.
    pub failed: String,
    /// Names never attempted.
    pub remaining: Vec<String>,
    /// Why `failed` failed.
    #[source]
    pub source: FileError,
}

/// Errors from a batch operation.
#[derive(Debug, Error)]
pub enum BatchError {
    /// The request was refused before any item was touched.
    #[error("batch refused: {0}")]
    Refused(#[source] FileError),

    /// Some items may have been applied before an item failed.
    #[error(transparent)]
    Stopped(#[from] BatchFailure),
}

impl BatchError {
    /// The underlying file error.
    pub fn file_error(&self) -> &FileError {
        match self {
            BatchError::Refused(e) => e,
            BatchError::Stopped(f) => &f.source,
        }
    }
}

/// Sequential move/delete over a list of names.
pub struct BatchOperator<'a> {
    policy: &'a SandboxPolicy,
}

impl<'a> BatchOperator<'a> {
    pub fn new(policy: &'a SandboxPolicy) -> Self {
        Self { policy }
    }

    /// Move each name from `request.dir` into `dest`.
    ///
    /// An existing entry at the destination stops the batch; nothing is
    /// overwritten. Moves across filesystems are refused.
    pub fn move_all(&self, request: &BatchRequest, dest: &str) -> Result<BatchOutcome, BatchError> {
        let src_dir = anchor_path(&request.dir);
        let dst_dir = anchor_path(dest);
        self.policy.check(&src_dir).map_err(BatchError::Refused)?;
        self.policy.check(&dst_dir).map_err(BatchError::Refused)?;

        self.run("move", request, |name| {
            let from = FileTarget::resolve(&src_dir, name)?;
            let to = FileTarget::resolve(&dst_dir, name)?;
            self.policy.check(from.as_str())?;
            self.policy.check(to.as_str())?;

            if fs::symlink_metadata(to.path()).is_ok() {
                return Err(FileError::AlreadyExists(to.to_path_buf()));
            }

            fs::rename(from.path(), to.path()).map_err(|e| {
                if e.kind() == io::ErrorKind::CrossesDevices {
                    FileError::CrossDevice {
                        from: from.to_path_buf(),
                        to: to.to_path_buf(),
                    }
                } else {
                    FileError::io("rename", from.to_path_buf(), e)
                }
            })?;

            info!(user = %request.actor, from = %from.as_str(), to = %to.as_str(), "moved");
            Ok(from.name().to_string())
        })
    }

    /// Delete each name in `request.dir`. Directories are removed recursively.
    pub fn delete_all(&self, request: &BatchRequest) -> Result<BatchOutcome, BatchError> {
        let dir = anchor_path(&request.dir);
        self.policy.check(&dir).map_err(BatchError::Refused)?;

        self.run("delete", request, |name| {
            let target = FileTarget::resolve(&dir, name)?;
            self.policy.check(target.as_str())?;

            let meta = fs::symlink_metadata(target.path())
                .map_err(|e| FileError::io("stat", target.to_path_buf(), e))?;
            let removed = if meta.is_dir() {
                fs::remove_dir_all(target.path())
            } else {
                fs::remove_file(target.path())
            };
            removed.map_err(|e| FileError::io("remove", target.to_path_buf(), e))?;

            info!(user = %request.actor, path = %target.as_str(), "deleted");
            Ok(target.name().to_string())
        })
    }

    fn run<F>(
        &self,
        op: &'static str,
        request: &BatchRequest,
        mut apply: F,
    ) -> Result<BatchOutcome, BatchError>
    where
        F: FnMut(&str) -> Result<String, FileError>,
    {
        let mut applied = Vec::with_capacity(request.names.len());

        for (index, name) in request.names.iter().enumerate() {
            match apply(name) {
                Ok(base) => applied.push(base),
                Err(source) => {
                    warn!(
                        user = %request.actor,
                        op,
                        name = %name,
                        applied = applied.len(),
                        error = %source,
                        "batch stopped"
                    );
                    return Err(BatchFailure {
                        op,
                        applied,
                        failed: name.clone(),
                        remaining: request.names[index + 1..].to_vec(),
                        source,
                    }
                    .into());
                }
            }
        }

        Ok(BatchOutcome { applied })
    }
}

//! Path confinement.
//!
//! Every filesystem entry point asks the [`SandboxPolicy`] first. The policy
//! is a list of denied prefixes compared against the *cleaned* form of the
//! candidate path: `.` and `..` segments and repeated separators are resolved
//! lexically before the prefix test, so `/pub/../secret` is treated exactly
//! like `/secret`.
//!
//! The comparison is a plain string prefix test. Denying `/secret` also
//! denies `/secret/sub` and, because it is a string prefix, `/secretive`.
//! The check is lexical: it does not follow symlinks. The chroot boundary is
//! what keeps a symlink from escaping the served tree.

use std::path::{Path, PathBuf};

use super::error::FileError;
use crate::config::Config;

/// Lexically clean a slash-separated path.
///
/// Collapses repeated separators, drops `.` segments and resolves `..`
/// against the preceding segment. A `..` at the root of an absolute path is
/// dropped; leading `..` segments of a relative path are kept. The empty
/// path cleans to `.`.
pub fn clean_path(path: &str) -> String {
    if path.is_empty() {
        return ".".to_string();
    }

    let rooted = path.starts_with('/');
    let mut parts: Vec<&str> = Vec::new();

    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                if parts.last().is_some_and(|p| *p != "..") {
                    parts.pop();
                } else if !rooted {
                    parts.push("..");
                }
            }
            other => parts.push(other),
        }
    }

    let joined = parts.join("/");
    if rooted {
        format!("/{joined}")
    } else if joined.is_empty() {
        ".".to_string()
    } else {
        joined
    }
}

/// Clean a caller-supplied path and anchor it at the filesystem root.
///
/// Empty and `.` become `/`; relative paths are treated as relative to `/`.
pub fn anchor_path(path: &str) -> String {
    let cleaned = clean_path(path);
    if cleaned.starts_with('/') {
        cleaned
    } else if cleaned == "." {
        "/".to_string()
    } else {
        clean_path(&format!("/{cleaned}"))
    }
}

/// Last element of a path, after dropping trailing separators.
///
/// The empty string yields `.` and a path made only of separators yields `/`.
pub fn base_name(name: &str) -> &str {
    if name.is_empty() {
        return ".";
    }
    let trimmed = name.trim_end_matches('/');
    if trimmed.is_empty() {
        return "/";
    }
    match trimmed.rfind('/') {
        Some(i) => &trimmed[i + 1..],
        None => trimmed,
    }
}

/// Parent directory of an anchored path.
pub fn parent_path(path: &str) -> String {
    anchor_path(&format!("{}/..", anchor_path(path)))
}

/// Immutable set of denied path prefixes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SandboxPolicy {
    denied: Vec<String>,
}

impl SandboxPolicy {
    /// Build a policy from prefixes, cleaning each one. Empty entries are ignored.
    pub fn new<I, S>(prefixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let denied = prefixes
            .into_iter()
            .map(|p| p.as_ref().trim().to_string())
            .filter(|p| !p.is_empty())
            .map(|p| clean_path(&p))
            .collect();
        Self { denied }
    }

    /// Policy from the configured deny list plus the ACME cache directory.
    pub fn from_config(config: &Config) -> Self {
        Self::new(config.effective_deny_prefixes())
    }

    /// A policy that denies nothing.
    pub fn allow_all() -> Self {
        Self::default()
    }

    /// The cleaned denied prefixes, in configuration order.
    pub fn denied_prefixes(&self) -> &[String] {
        &self.denied
    }

    /// Whether `path`, once cleaned, starts with any denied prefix.
    pub fn is_denied(&self, path: &str) -> bool {
        let cleaned = clean_path(path);
        self.denied.iter().any(|prefix| cleaned.starts_with(prefix.as_str()))
    }

    /// Fail with [`FileError::AccessDenied`] if `path` is denied.
    pub fn check(&self, path: &str) -> Result<(), FileError> {
        if self.is_denied(path) {
            tracing::warn!(path = %path, "denied by sandbox policy");
            return Err(FileError::AccessDenied(path.to_string()));
        }
        Ok(())
    }
}

/// A resolved, cleaned absolute path plus its base name.
///
/// Derived per request from the `dir` and name fields; never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileTarget {
    path: String,
    name: String,
}

impl FileTarget {
    /// Resolve `name` inside `dir`.
    ///
    /// The name is reduced to its base component first, so a caller cannot
    /// smuggle a different directory through it.
    pub fn resolve(dir: &str, name: &str) -> Result<Self, FileError> {
        let base = base_name(name);
        if matches!(base, "." | ".." | "/") || base.contains('\0') {
            return Err(FileError::InvalidName(name.to_string()));
        }
        let path = clean_path(&format!("{}/{}", anchor_path(dir), base));
        Ok(Self {
            path,
            name: base.to_string(),
        })
    }

    /// Resolve a full path (the `fp` field).
    pub fn from_full_path(full_path: &str) -> Result<Self, FileError> {
        let path = anchor_path(full_path);
        if path == "/" {
            return Err(FileError::InvalidName(full_path.to_string()));
        }
        let name = base_name(&path).to_string();
        Ok(Self { path, name })
    }

    /// The cleaned absolute path as a string, for policy checks.
    pub fn as_str(&self) -> &str {
        &self.path
    }

    /// The cleaned absolute path.
    pub fn path(&self) -> &Path {
        Path::new(&self.path)
    }

    /// Owned path buffer.
    pub fn to_path_buf(&self) -> PathBuf {
        PathBuf::from(&self.path)
    }

    /// The base name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The directory containing this target.
    pub fn dir(&self) -> String {
        parent_path(&self.path)
    }
}

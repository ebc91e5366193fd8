//! Archive and disk image listing.
//!
//! Listing the members of a container is delegated to external programs so
//! that the daemon does not link a decoder for every format. Which program
//! handles which container is configuration; the defaults assume `unzip`,
//! `7z` and `bsdtar` are on the `PATH` (inside the chroot, if one is used).

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::process::Command;

use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use crate::config::ArchiveConfig;

/// Container families, grouped by which tool lists them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerKind {
    /// `.zip`
    Zip,
    /// `.7z`
    #[serde(rename = "7z")]
    SevenZip,
    /// Tarballs, compressed streams and `.rar`.
    Archive,
    /// `.iso` disk images.
    Iso,
}

impl ContainerKind {
    /// Match a lower-cased file extension.
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext {
            "zip" => Some(Self::Zip),
            "7z" => Some(Self::SevenZip),
            "tar" | "rar" | "gz" | "bz2" | "xz" | "tgz" | "tbz2" | "txz" => Some(Self::Archive),
            "iso" => Some(Self::Iso),
            _ => None,
        }
    }

    /// Parse a configuration key.
    pub fn from_key(key: &str) -> Option<Self> {
        [Self::Zip, Self::SevenZip, Self::Archive, Self::Iso]
            .into_iter()
            .find(|k| k.as_str() == key)
    }

    /// Configuration key.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Zip => "zip",
            Self::SevenZip => "7z",
            Self::Archive => "archive",
            Self::Iso => "iso",
        }
    }
}

impl fmt::Display for ContainerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors from listing a container.
#[derive(Debug, Error)]
pub enum ListError {
    #[error("no lister configured for {0} containers")]
    Unsupported(ContainerKind),

    #[error("failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} exited with {status}: {stderr}")]
    Failed {
        program: String,
        status: String,
        stderr: String,
    },
}

/// Lists the members of a container file as text.
pub trait ArchiveLister: Send + Sync {
    fn list(&self, path: &Path, kind: ContainerKind) -> Result<String, ListError>;
}

/// Default command lines, keyed by container kind. The path is appended.
pub fn default_commands() -> BTreeMap<ContainerKind, Vec<String>> {
    let cmd = |parts: &[&str]| parts.iter().map(|s| s.to_string()).collect::<Vec<_>>();
    BTreeMap::from([
        (ContainerKind::Zip, cmd(&["unzip", "-l"])),
        (ContainerKind::SevenZip, cmd(&["7z", "l"])),
        (ContainerKind::Archive, cmd(&["bsdtar", "-tvf"])),
        (ContainerKind::Iso, cmd(&["bsdtar", "-tvf"])),
    ])
}

/// Runs an external program per container kind and returns its stdout.
#[derive(Debug, Clone)]
pub struct CommandLister {
    commands: BTreeMap<ContainerKind, Vec<String>>,
}

impl CommandLister {
    pub fn new(commands: BTreeMap<ContainerKind, Vec<String>>) -> Self {
        Self { commands }
    }

    pub fn from_config(config: &ArchiveConfig) -> Self {
        Self::new(config.by_kind())
    }
}

impl Default for CommandLister {
    fn default() -> Self {
        Self::new(default_commands())
    }
}

impl ArchiveLister for CommandLister {
    fn list(&self, path: &Path, kind: ContainerKind) -> Result<String, ListError> {
        let (program, args) = self
            .commands
            .get(&kind)
            .and_then(|c| c.split_first())
            .ok_or(ListError::Unsupported(kind))?;

        debug!(program = %program, path = ?path, "listing container");
        let output = Command::new(program)
            .args(args)
            .arg(path)
            .output()
            .map_err(|source| ListError::Spawn {
                program: program.clone(),
                source,
            })?;

        if !output.status.success() {
            return Err(ListError::Failed {
                program: program.clone(),
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extension_groups() {
        assert_eq!(ContainerKind::from_extension("zip"), Some(ContainerKind::Zip));
        assert_eq!(ContainerKind::from_extension("7z"), Some(ContainerKind::SevenZip));
        for ext in ["tar", "rar", "gz", "bz2", "xz", "tgz", "tbz2", "txz"] {
            assert_eq!(
                ContainerKind::from_extension(ext),
                Some(ContainerKind::Archive),
                "{ext}"
            );
        }
        assert_eq!(ContainerKind::from_extension("iso"), Some(ContainerKind::Iso));
        assert_eq!(ContainerKind::from_extension("txt"), None);
    }

    #[test]
    fn test_config_keys() {
        assert_eq!(ContainerKind::from_key("7z"), Some(ContainerKind::SevenZip));
        assert_eq!(ContainerKind::from_key("archive"), Some(ContainerKind::Archive));
        assert_eq!(ContainerKind::from_key("tar"), None);
    }

    #[test]
    fn test_unconfigured_kind() {
        let lister = CommandLister::new(BTreeMap::new());
        let result = lister.list(Path::new("/x.zip"), ContainerKind::Zip);
        assert!(matches!(result, Err(ListError::Unsupported(ContainerKind::Zip))));
    }

    #[test]
    fn test_missing_program() {
        let lister = CommandLister::new(BTreeMap::from([(
            ContainerKind::Zip,
            vec!["wfm-no-such-lister-program".to_string()],
        )]));
        let result = lister.list(Path::new("/x.zip"), ContainerKind::Zip);
        assert!(matches!(result, Err(ListError::Spawn { .. })));
    }

    #[cfg(unix)]
    #[test]
    fn test_runs_command_with_path() {
        let lister = CommandLister::new(BTreeMap::from([(
            ContainerKind::Iso,
            vec!["echo".to_string(), "listing".to_string()],
        )]));
        let out = lister.list(Path::new("/data/disk.iso"), ContainerKind::Iso).unwrap();
        assert_eq!(out.trim(), "listing /data/disk.iso");
    }

    #[cfg(unix)]
    #[test]
    fn test_failing_command() {
        let lister = CommandLister::new(BTreeMap::from([(
            ContainerKind::Zip,
            vec!["false".to_string()],
        )]));
        let result = lister.list(Path::new("/x.zip"), ContainerKind::Zip);
        assert!(matches!(result, Err(ListError::Failed { .. })));
    }
}

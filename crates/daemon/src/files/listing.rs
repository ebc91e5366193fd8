//! Directory listing.
//!
//! Lists one directory with per-entry metadata. Hidden entries and entries
//! under a denied prefix are left out. Directories always sort before
//! files; within each group the order is the requested sort key.

use std::cmp::Ordering;
use std::fs;
use std::time::SystemTime;

use serde::Serialize;

use super::error::FileError;
use super::guard::{anchor_path, clean_path, parent_path, SandboxPolicy};

/// Kind of a directory entry. Symlinks are reported as what they point to
/// when the target can be read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    Directory,
    File,
    Symlink,
    Other,
}

/// One listed entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ListEntry {
    pub name: String,
    pub kind: EntryKind,
    /// Size in bytes, 0 for directories.
    pub size: u64,
    /// Modification time, seconds since the epoch.
    pub modified: u64,
    pub symlink: bool,
}

/// Sort key for a listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SortKey {
    Name,
    Size,
    Time,
}

/// Requested ordering: key plus direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SortOrder {
    pub key: SortKey,
    pub reverse: bool,
}

impl SortOrder {
    /// Parse the `sort` field. A leading `-` reverses; anything unknown
    /// sorts by name.
    pub fn parse(raw: &str) -> Self {
        let (reverse, key) = match raw.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, raw),
        };
        let key = match key {
            "size" => SortKey::Size,
            "time" => SortKey::Time,
            _ => SortKey::Name,
        };
        Self { key, reverse }
    }

    fn compare(&self, a: &ListEntry, b: &ListEntry) -> Ordering {
        let ord = match self.key {
            SortKey::Name => a.name.to_lowercase().cmp(&b.name.to_lowercase()),
            SortKey::Size => a.size.cmp(&b.size),
            SortKey::Time => a.modified.cmp(&b.modified),
        }
        .then_with(|| a.name.cmp(&b.name));
        if self.reverse {
            ord.reverse()
        } else {
            ord
        }
    }
}

impl Default for SortOrder {
    fn default() -> Self {
        Self {
            key: SortKey::Name,
            reverse: false,
        }
    }
}

/// A listed directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Listing {
    pub dir: String,
    pub parent: String,
    pub sort: SortOrder,
    pub entries: Vec<ListEntry>,
}

/// List `dir` under `policy`.
pub fn list_directory(
    policy: &SandboxPolicy,
    dir: &str,
    sort: SortOrder,
    show_dot: bool,
) -> Result<Listing, FileError> {
    let dir = anchor_path(dir);
    policy.check(&dir)?;

    let meta = fs::metadata(&dir).map_err(|e| FileError::io("stat", &dir, e))?;
    if !meta.is_dir() {
        return Err(FileError::NotADirectory(dir.into()));
    }

    let mut entries = Vec::new();
    for entry in fs::read_dir(&dir).map_err(|e| FileError::io("read_dir", &dir, e))? {
        // Entries can vanish between readdir and stat.
        let Ok(entry) = entry else { continue };
        let name = entry.file_name().to_string_lossy().into_owned();

        if !show_dot && name.starts_with('.') {
            continue;
        }
        if policy.is_denied(&clean_path(&format!("{dir}/{name}"))) {
            continue;
        }

        let Ok(link_meta) = entry.metadata() else { continue };
        let symlink = link_meta.file_type().is_symlink();
        // Follow the link for kind and size; a dangling link stays a symlink.
        let meta = if symlink {
            fs::metadata(entry.path()).unwrap_or(link_meta)
        } else {
            link_meta
        };

        let kind = if meta.is_dir() {
            EntryKind::Directory
        } else if meta.is_file() {
            EntryKind::File
        } else if meta.file_type().is_symlink() {
            EntryKind::Symlink
        } else {
            EntryKind::Other
        };

        let modified = meta
            .modified()
            .unwrap_or(SystemTime::UNIX_EPOCH)
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);

        entries.push(ListEntry {
            name,
            kind,
            size: if meta.is_file() { meta.len() } else { 0 },
            modified,
            symlink,
        });
    }

    entries.sort_by(|a, b| {
        let a_dir = a.kind == EntryKind::Directory;
        let b_dir = b.kind == EntryKind::Directory;
        match (a_dir, b_dir) {
            (true, false) => Ordering::Less,
            (false, true) => Ordering::Greater,
            _ => sort.compare(a, b),
        }
    });

    Ok(Listing {
        parent: parent_path(&dir),
        dir,
        sort,
        entries,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn names(listing: &Listing) -> Vec<&str> {
        listing.entries.iter().map(|e| e.name.as_str()).collect()
    }

    fn fixture() -> TempDir {
        let temp_dir = TempDir::new().unwrap();
        let p = temp_dir.path();
        fs::write(p.join("b.txt"), "bbbbbbbbbb").unwrap();
        fs::write(p.join("A.txt"), "a").unwrap();
        fs::write(p.join("c.txt"), "ccccc").unwrap();
        fs::write(p.join(".hidden"), "").unwrap();
        fs::create_dir(p.join("zdir")).unwrap();
        fs::create_dir(p.join("private")).unwrap();
        temp_dir
    }

    #[test]
    fn test_sort_order_parse() {
        assert_eq!(SortOrder::parse(""), SortOrder::default());
        assert_eq!(
            SortOrder::parse("-size"),
            SortOrder {
                key: SortKey::Size,
                reverse: true
            }
        );
        assert_eq!(SortOrder::parse("time").key, SortKey::Time);
        assert_eq!(SortOrder::parse("bogus").key, SortKey::Name);
    }

    #[test]
    fn test_directories_first_then_name() {
        let temp_dir = fixture();
        let dir = temp_dir.path().to_string_lossy().into_owned();
        let listing =
            list_directory(&SandboxPolicy::allow_all(), &dir, SortOrder::default(), false)
                .unwrap();

        assert_eq!(names(&listing), vec!["private", "zdir", "A.txt", "b.txt", "c.txt"]);
        assert_eq!(listing.entries[0].kind, EntryKind::Directory);
    }

    #[test]
    fn test_size_descending() {
        let temp_dir = fixture();
        let dir = temp_dir.path().to_string_lossy().into_owned();
        let listing = list_directory(
            &SandboxPolicy::allow_all(),
            &dir,
            SortOrder::parse("-size"),
            false,
        )
        .unwrap();

        let files: Vec<&str> = listing
            .entries
            .iter()
            .filter(|e| e.kind == EntryKind::File)
            .map(|e| e.name.as_str())
            .collect();
        assert_eq!(files, vec!["b.txt", "c.txt", "A.txt"]);
    }

    #[test]
    fn test_show_dot() {
        let temp_dir = fixture();
        let dir = temp_dir.path().to_string_lossy().into_owned();
        let listing =
            list_directory(&SandboxPolicy::allow_all(), &dir, SortOrder::default(), true)
                .unwrap();
        assert!(names(&listing).contains(&".hidden"));
    }

    #[test]
    fn test_denied_entries_hidden() {
        let temp_dir = fixture();
        let dir = temp_dir.path().to_string_lossy().into_owned();
        let policy = SandboxPolicy::new([format!("{dir}/private")]);
        let listing = list_directory(&policy, &dir, SortOrder::default(), false).unwrap();
        assert!(!names(&listing).contains(&"private"));
    }

    #[test]
    fn test_denied_directory_refused() {
        let temp_dir = fixture();
        let dir = temp_dir.path().to_string_lossy().into_owned();
        let policy = SandboxPolicy::new([dir.clone()]);
        let result = list_directory(&policy, &dir, SortOrder::default(), false);
        assert!(matches!(result, Err(FileError::AccessDenied(_))));
    }

    #[test]
    fn test_not_a_directory() {
        let temp_dir = fixture();
        let file = temp_dir.path().join("b.txt").to_string_lossy().into_owned();
        let result =
            list_directory(&SandboxPolicy::allow_all(), &file, SortOrder::default(), false);
        assert!(matches!(result, Err(FileError::NotADirectory(_))));
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_reports_target_kind() {
        let temp_dir = fixture();
        let p = temp_dir.path();
        std::os::unix::fs::symlink(p.join("zdir"), p.join("link")).unwrap();
        std::os::unix::fs::symlink(p.join("gone"), p.join("dangling")).unwrap();

        let dir = p.to_string_lossy().into_owned();
        let listing =
            list_directory(&SandboxPolicy::allow_all(), &dir, SortOrder::default(), false)
                .unwrap();

        let link = listing.entries.iter().find(|e| e.name == "link").unwrap();
        assert_eq!(link.kind, EntryKind::Directory);
        assert!(link.symlink);
        let dangling = listing.entries.iter().find(|e| e.name == "dangling").unwrap();
        assert_eq!(dangling.kind, EntryKind::Symlink);
    }
}

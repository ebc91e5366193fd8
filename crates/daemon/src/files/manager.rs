//! File manager facade.
//!
//! One entry point per user-visible operation. Every operation follows the
//! same order: refuse read-only callers for writes, resolve the target from
//! the submitted fields, consult the sandbox policy, then touch the
//! filesystem. All methods block; callers on an async runtime should run
//! them on the blocking pool.

use std::fs::{self, DirBuilder};
use std::io::{Read, Write};
use std::path::Path;
use std::sync::Arc;

use serde::Serialize;
use tracing::info;
use wfm_protocol::{encode_internet_shortcut, ProtocolError};

use super::batch::{BatchError, BatchOperator, BatchOutcome, BatchRequest};
use super::content::{ContentDispatcher, ContentPlan, ServeMode};
use super::error::FileError;
use super::guard::{anchor_path, FileTarget, SandboxPolicy};
use super::lister::ArchiveLister;
use super::listing::{list_directory, Listing, SortOrder};
use super::writer::{open_for_write, AtomicWriter, WriteTransaction};
use crate::auth::Caller;
use crate::config::Config;

/// Permission bits for directories the manager creates.
pub const DIR_MODE: u32 = 0o755;

/// Limits and display switches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ManagerSettings {
    pub show_dot: bool,
    pub upload_limit: u64,
    pub edit_limit: u64,
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self {
            show_dot: false,
            upload_limit: 1 << 30,
            edit_limit: 1 << 20,
        }
    }
}

impl ManagerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            show_dot: config.sandbox.show_dot,
            upload_limit: config.server.upload_limit,
            edit_limit: config.server.edit_limit,
        }
    }
}

/// A text file loaded for editing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TextDocument {
    pub path: String,
    pub dir: String,
    pub text: String,
}

pub struct FileManager {
    policy: Arc<SandboxPolicy>,
    dispatcher: ContentDispatcher,
    settings: ManagerSettings,
}

impl FileManager {
    pub fn new(
        policy: Arc<SandboxPolicy>,
        lister: Arc<dyn ArchiveLister>,
        settings: ManagerSettings,
    ) -> Self {
        Self {
            policy,
            dispatcher: ContentDispatcher::new(lister),
            settings,
        }
    }

    pub fn policy(&self) -> &SandboxPolicy {
        &self.policy
    }

    pub fn settings(&self) -> &ManagerSettings {
        &self.settings
    }

    pub fn list(&self, dir: &str, sort: &str) -> Result<Listing, FileError> {
        list_directory(
            &self.policy,
            dir,
            SortOrder::parse(sort),
            self.settings.show_dot,
        )
    }

    /// Plan how to return the file at `full_path`.
    pub fn plan_content(&self, full_path: &str, mode: ServeMode) -> Result<ContentPlan, FileError> {
        let target = self.guarded_path(full_path)?;
        self.dispatcher.plan(&target, mode)
    }

    /// Load a text file for the edit dialog.
    pub fn read_text(&self, full_path: &str) -> Result<TextDocument, FileError> {
        let target = self.guarded_path(full_path)?;
        let meta = fs::metadata(target.path())
            .map_err(|e| FileError::io("stat", target.to_path_buf(), e))?;
        if meta.is_dir() {
            return Err(FileError::IsADirectory(target.to_path_buf()));
        }
        if meta.len() > self.settings.edit_limit {
            return Err(FileError::TooLarge {
                size: meta.len(),
                limit: self.settings.edit_limit,
            });
        }

        let mut raw = Vec::with_capacity(meta.len() as usize);
        fs::File::open(target.path())
            .and_then(|f| f.take(self.settings.edit_limit).read_to_end(&mut raw))
            .map_err(|e| FileError::io("read", target.to_path_buf(), e))?;

        Ok(TextDocument {
            path: target.as_str().to_string(),
            dir: target.dir(),
            text: String::from_utf8_lossy(&raw).into_owned(),
        })
    }

    /// Replace a file's content with edited text.
    pub fn save_text(
        &self,
        caller: &Caller,
        full_path: &str,
        text: &str,
    ) -> Result<FileTarget, FileError> {
        caller.require_write()?;
        let target = self.guarded_path(full_path)?;
        AtomicWriter::save_text(target.path(), text)?;
        info!(user = %caller, path = %target.as_str(), bytes = text.len(), "saved");
        Ok(target)
    }

    pub fn mkdir(&self, caller: &Caller, dir: &str, name: &str) -> Result<FileTarget, FileError> {
        caller.require_write()?;
        let target = self.guarded_target(dir, name)?;

        let mut builder = DirBuilder::new();
        #[cfg(unix)]
        {
            use std::os::unix::fs::DirBuilderExt;
            builder.mode(DIR_MODE);
        }
        builder
            .create(target.path())
            .map_err(|e| FileError::io("mkdir", target.to_path_buf(), e))?;

        info!(user = %caller, path = %target.as_str(), "created directory");
        Ok(target)
    }

    /// Create an empty file. Fails if anything exists at the path.
    pub fn mkfile(&self, caller: &Caller, dir: &str, name: &str) -> Result<FileTarget, FileError> {
        caller.require_write()?;
        let target = self.guarded_target(dir, name)?;
        open_for_write(target.path(), true)
            .map_err(|e| FileError::io("create", target.to_path_buf(), e))?;
        info!(user = %caller, path = %target.as_str(), "created file");
        Ok(target)
    }

    /// Create a `.url` shortcut pointing at `url`.
    pub fn mkurl(
        &self,
        caller: &Caller,
        dir: &str,
        name: &str,
        url: &str,
    ) -> Result<FileTarget, FileError> {
        caller.require_write()?;
        if url.trim().is_empty() {
            return Err(ProtocolError::MissingUrl.into());
        }

        let suffix = format!(".{}", wfm_protocol::shortcut::SHORTCUT_EXTENSION);
        let name = if name.ends_with(&suffix) {
            name.to_string()
        } else {
            format!("{name}{suffix}")
        };
        let target = self.guarded_target(dir, &name)?;

        let mut file = open_for_write(target.path(), true)
            .map_err(|e| FileError::io("create", target.to_path_buf(), e))?;
        file.write_all(encode_internet_shortcut(url.trim()).as_bytes())
            .map_err(|e| FileError::io("write", target.to_path_buf(), e))?;

        info!(user = %caller, path = %target.as_str(), url = %url, "created shortcut");
        Ok(target)
    }

    /// Rename an entry within `dir`. Never replaces an existing entry.
    pub fn rename(
        &self,
        caller: &Caller,
        dir: &str,
        name: &str,
        new_name: &str,
    ) -> Result<FileTarget, FileError> {
        caller.require_write()?;
        let from = self.guarded_target(dir, name)?;
        let to = self.guarded_target(dir, new_name)?;

        if fs::symlink_metadata(to.path()).is_ok() {
            return Err(FileError::AlreadyExists(to.to_path_buf()));
        }
        fs::rename(from.path(), to.path())
            .map_err(|e| FileError::io("rename", from.to_path_buf(), e))?;

        info!(user = %caller, from = %from.as_str(), to = %to.as_str(), "renamed");
        Ok(to)
    }

    /// Start receiving an uploaded file into `dir`.
    pub fn begin_upload(
        &self,
        caller: &Caller,
        dir: &str,
        filename: &str,
    ) -> Result<UploadSession, FileError> {
        caller.require_write()?;
        let target = self.guarded_target(dir, filename)?;
        let tx = WriteTransaction::begin(target.path())?;
        Ok(UploadSession {
            target,
            tx,
            limit: self.settings.upload_limit,
            actor: caller.to_string(),
        })
    }

    pub fn move_batch(
        &self,
        caller: &Caller,
        dir: &str,
        names: Vec<String>,
        dest: &str,
    ) -> Result<BatchOutcome, BatchError> {
        caller.require_write().map_err(BatchError::Refused)?;
        let request = BatchRequest::new(dir, names, caller.to_string());
        BatchOperator::new(&self.policy).move_all(&request, dest)
    }

    pub fn delete_batch(
        &self,
        caller: &Caller,
        dir: &str,
        names: Vec<String>,
    ) -> Result<BatchOutcome, BatchError> {
        caller.require_write().map_err(BatchError::Refused)?;
        let request = BatchRequest::new(dir, names, caller.to_string());
        BatchOperator::new(&self.policy).delete_all(&request)
    }

    fn guarded_target(&self, dir: &str, name: &str) -> Result<FileTarget, FileError> {
        self.policy.check(&anchor_path(dir))?;
        let target = FileTarget::resolve(dir, name)?;
        self.policy.check(target.as_str())?;
        Ok(target)
    }

    fn guarded_path(&self, full_path: &str) -> Result<FileTarget, FileError> {
        let target = FileTarget::from_full_path(full_path)?;
        self.policy.check(target.as_str())?;
        Ok(target)
    }
}

/// An upload being streamed to its temp file.
#[derive(Debug)]
pub struct UploadSession {
    target: FileTarget,
    tx: WriteTransaction,
    limit: u64,
    actor: String,
}

impl UploadSession {
    pub fn target(&self) -> &FileTarget {
        &self.target
    }

    pub fn temp_path(&self) -> &Path {
        self.tx.temp_path()
    }

    /// Append a chunk, enforcing the upload limit.
    pub fn write(&mut self, chunk: &[u8]) -> Result<(), FileError> {
        let size = self.tx.written() + chunk.len() as u64;
        if size > self.limit {
            return Err(FileError::TooLarge {
                size,
                limit: self.limit,
            });
        }
        self.tx.write(chunk)
    }

    /// Verify the received byte count and move the file into place.
    pub fn finish(self) -> Result<FileTarget, FileError> {
        let received = self.tx.written();
        self.tx.commit(received)?;
        info!(user = %self.actor, path = %self.target.as_str(), bytes = received, "uploaded");
        Ok(self.target)
    }

    /// Drop the partial upload.
    pub fn abort(self) {
        self.tx.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::AccessLevel;
    use crate::files::lister::CommandLister;
    use tempfile::TempDir;

    fn writer() -> Caller {
        Caller::new("tester", None, AccessLevel::ReadWrite)
    }

    fn reader() -> Caller {
        Caller::new("viewer", None, AccessLevel::ReadOnly)
    }

    fn manager(policy: SandboxPolicy) -> FileManager {
        FileManager::new(
            Arc::new(policy),
            Arc::new(CommandLister::default()),
            ManagerSettings {
                upload_limit: 16,
                edit_limit: 32,
                ..ManagerSettings::default()
            },
        )
    }

    fn dir_of(temp_dir: &TempDir) -> String {
        temp_dir.path().to_string_lossy().into_owned()
    }

    #[test]
    fn test_read_only_caller_refused_before_io() {
        let temp_dir = TempDir::new().unwrap();
        let dir = dir_of(&temp_dir);
        let fm = manager(SandboxPolicy::allow_all());

        assert!(matches!(fm.mkdir(&reader(), &dir, "d"), Err(FileError::ReadOnly)));
        assert!(matches!(fm.mkfile(&reader(), &dir, "f"), Err(FileError::ReadOnly)));
        assert!(matches!(
            fm.save_text(&reader(), &format!("{dir}/f"), "x"),
            Err(FileError::ReadOnly)
        ));
        assert!(matches!(
            fm.delete_batch(&reader(), &dir, vec!["f".into()]),
            Err(BatchError::Refused(FileError::ReadOnly))
        ));
        assert!(!temp_dir.path().join("d").exists());
        assert!(!temp_dir.path().join("f").exists());
    }

    #[test]
    fn test_mkdir_and_mkfile() {
        let temp_dir = TempDir::new().unwrap();
        let dir = dir_of(&temp_dir);
        let fm = manager(SandboxPolicy::allow_all());

        let d = fm.mkdir(&writer(), &dir, "../sub").unwrap();
        assert_eq!(d.name(), "sub");
        assert!(temp_dir.path().join("sub").is_dir());

        fm.mkfile(&writer(), &dir, "empty.txt").unwrap();
        assert_eq!(fs::read(temp_dir.path().join("empty.txt")).unwrap().len(), 0);

        assert!(matches!(
            fm.mkfile(&writer(), &dir, "empty.txt"),
            Err(FileError::AlreadyExists(_))
        ));
        assert!(matches!(
            fm.mkdir(&writer(), &dir, "sub"),
            Err(FileError::AlreadyExists(_))
        ));
    }

    #[test]
    fn test_mkurl_appends_extension() {
        let temp_dir = TempDir::new().unwrap();
        let dir = dir_of(&temp_dir);
        let fm = manager(SandboxPolicy::allow_all());

        let target = fm
            .mkurl(&writer(), &dir, "docs", "https://example.com/")
            .unwrap();
        assert_eq!(target.name(), "docs.url");
        assert_eq!(
            fs::read_to_string(temp_dir.path().join("docs.url")).unwrap(),
            "[InternetShortcut]\r\nURL=https://example.com/\r\n"
        );

        let again = fm.mkurl(&writer(), &dir, "more.url", "http://x/").unwrap();
        assert_eq!(again.name(), "more.url");

        assert!(matches!(
            fm.mkurl(&writer(), &dir, "blank", " "),
            Err(FileError::Shortcut(ProtocolError::MissingUrl))
        ));
    }

    #[test]
    fn test_rename_refuses_overwrite() {
        let temp_dir = TempDir::new().unwrap();
        let dir = dir_of(&temp_dir);
        fs::write(temp_dir.path().join("a"), "a").unwrap();
        fs::write(temp_dir.path().join("b"), "b").unwrap();
        let fm = manager(SandboxPolicy::allow_all());

        assert!(matches!(
            fm.rename(&writer(), &dir, "a", "b"),
            Err(FileError::AlreadyExists(_))
        ));
        fm.rename(&writer(), &dir, "a", "c").unwrap();
        assert!(temp_dir.path().join("c").exists());
        assert_eq!(fs::read_to_string(temp_dir.path().join("b")).unwrap(), "b");
    }

    #[test]
    fn test_denied_target_refused() {
        let temp_dir = TempDir::new().unwrap();
        let dir = dir_of(&temp_dir);
        let fm = manager(SandboxPolicy::new([format!("{dir}/private")]));

        assert!(matches!(
            fm.mkdir(&writer(), &dir, "private"),
            Err(FileError::AccessDenied(_))
        ));
        assert!(matches!(
            fm.read_text(&format!("{dir}/sub/../private/key")),
            Err(FileError::AccessDenied(_))
        ));
        assert!(!temp_dir.path().join("private").exists());
    }

    #[test]
    fn test_read_text_limits() {
        let temp_dir = TempDir::new().unwrap();
        let dir = dir_of(&temp_dir);
        fs::write(temp_dir.path().join("small.txt"), "hello").unwrap();
        fs::write(temp_dir.path().join("big.txt"), vec![b'x'; 64]).unwrap();
        let fm = manager(SandboxPolicy::allow_all());

        let doc = fm.read_text(&format!("{dir}/small.txt")).unwrap();
        assert_eq!(doc.text, "hello");
        assert_eq!(doc.dir, dir);

        assert!(matches!(
            fm.read_text(&format!("{dir}/big.txt")),
            Err(FileError::TooLarge { size: 64, limit: 32 })
        ));
        assert!(matches!(
            fm.read_text(&dir),
            Err(FileError::IsADirectory(_))
        ));
    }

    #[test]
    fn test_save_then_read_back() {
        let temp_dir = TempDir::new().unwrap();
        let dir = dir_of(&temp_dir);
        let fm = manager(SandboxPolicy::allow_all());
        let path = format!("{dir}/notes.txt");

        fm.save_text(&writer(), &path, "first").unwrap();
        fm.save_text(&writer(), &path, "second").unwrap();
        assert_eq!(fm.read_text(&path).unwrap().text, "second");
        assert!(matches!(
            fm.save_text(&writer(), &path, ""),
            Err(FileError::EmptyContent)
        ));
    }

    #[test]
    fn test_upload_session() {
        let temp_dir = TempDir::new().unwrap();
        let dir = dir_of(&temp_dir);
        let fm = manager(SandboxPolicy::allow_all());

        let mut session = fm.begin_upload(&writer(), &dir, "C:/fake/up.bin").unwrap();
        assert_eq!(session.target().name(), "up.bin");
        session.write(b"0123").unwrap();
        session.write(b"4567").unwrap();
        session.finish().unwrap();

        assert_eq!(
            fs::read(temp_dir.path().join("up.bin")).unwrap(),
            b"01234567"
        );
        assert!(!temp_dir.path().join("up.bin.tmp").exists());
    }

    #[test]
    fn test_upload_over_limit() {
        let temp_dir = TempDir::new().unwrap();
        let dir = dir_of(&temp_dir);
        let fm = manager(SandboxPolicy::allow_all());

        let mut session = fm.begin_upload(&writer(), &dir, "big.bin").unwrap();
        session.write(&[0u8; 10]).unwrap();
        let err = session.write(&[0u8; 10]).unwrap_err();
        assert!(matches!(err, FileError::TooLarge { size: 20, limit: 16 }));
        let temp = session.temp_path().to_path_buf();
        session.abort();

        assert!(!temp.exists());
        assert!(!temp_dir.path().join("big.bin").exists());
    }
}

//! Content dispatch.
//!
//! Decides how a file is handed back to the browser, from its extension:
//! shortcut files become redirects, archives and disk images become member
//! listings, and everything else is streamed with a sniffed media type.
//! Downloads skip the extension table entirely.

use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::debug;
use wfm_protocol::{extract_url, ShortcutFormat};

use super::error::FileError;
use super::guard::FileTarget;
use super::lister::{ArchiveLister, ContainerKind};

/// Chunk size for streaming file bodies.
pub const STREAM_CHUNK_SIZE: usize = 1 << 20;

/// Bytes read from the head of a file for media type sniffing.
pub const SNIFF_LEN: usize = 8192;

/// Media type for forced downloads and unrecognized binary content.
pub const OCTET_STREAM: &str = "application/octet-stream";

/// Media type for content that decodes as UTF-8 text.
pub const TEXT_PLAIN: &str = "text/plain; charset=utf-8";

/// Largest shortcut file we will parse.
const SHORTCUT_READ_LIMIT: u64 = 64 * 1024;

/// How the caller asked for the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServeMode {
    /// Show in the browser (extension dispatch applies).
    Inline,
    /// Save to disk.
    Download,
}

/// Handling class selected by extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentKind {
    Shortcut(ShortcutFormat),
    Container(ContainerKind),
    Plain,
}

/// Classify a path by the lower-cased text after the last `.` of its name.
///
/// Dot-files count too: `.zip` is a zip archive.
pub fn classify(path: &Path) -> ContentKind {
    let Some(ext) = path
        .file_name()
        .and_then(|n| n.to_str())
        .and_then(|n| n.rsplit_once('.'))
        .map(|(_, ext)| ext.to_ascii_lowercase())
    else {
        return ContentKind::Plain;
    };

    if let Some(format) = ShortcutFormat::from_extension(&ext) {
        ContentKind::Shortcut(format)
    } else if let Some(kind) = ContainerKind::from_extension(&ext) {
        ContentKind::Container(kind)
    } else {
        ContentKind::Plain
    }
}

/// A file body to stream back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamPlan {
    pub path: PathBuf,
    pub mime: String,
    pub len: u64,
    /// Present for downloads: the file name to suggest.
    pub attachment: Option<String>,
}

/// What the request layer should send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContentPlan {
    Redirect { location: String },
    Listing { kind: ContainerKind, text: String },
    Stream(StreamPlan),
}

/// Guess a media type from the first bytes of a file.
///
/// Known binary signatures win. Otherwise valid UTF-8 without NUL bytes is
/// text (an incomplete character cut off at the end of the buffer is
/// allowed); anything else is `application/octet-stream`.
pub fn sniff_mime(head: &[u8]) -> String {
    if let Some(kind) = infer::get(head) {
        return kind.mime_type().to_string();
    }
    if looks_like_text(head) {
        TEXT_PLAIN.to_string()
    } else {
        OCTET_STREAM.to_string()
    }
}

fn looks_like_text(head: &[u8]) -> bool {
    if head.contains(&0) {
        return false;
    }
    match std::str::from_utf8(head) {
        Ok(_) => true,
        Err(e) => e.error_len().is_none(),
    }
}

/// Chooses the handling for a guarded file target.
pub struct ContentDispatcher {
    lister: Arc<dyn ArchiveLister>,
}

impl ContentDispatcher {
    pub fn new(lister: Arc<dyn ArchiveLister>) -> Self {
        Self { lister }
    }

    /// Plan the response for `target`.
    ///
    /// The target must already have passed the sandbox check.
    pub fn plan(&self, target: &FileTarget, mode: ServeMode) -> Result<ContentPlan, FileError> {
        let len = regular_file_len(target)?;

        if mode == ServeMode::Download {
            return Ok(ContentPlan::Stream(StreamPlan {
                path: target.to_path_buf(),
                mime: OCTET_STREAM.to_string(),
                len,
                attachment: Some(target.name().to_string()),
            }));
        }

        let kind = classify(target.path());
        debug!(path = %target.as_str(), kind = ?kind, "dispatching content");

        match kind {
            ContentKind::Shortcut(format) => {
                if len > SHORTCUT_READ_LIMIT {
                    return Err(FileError::TooLarge {
                        size: len,
                        limit: SHORTCUT_READ_LIMIT,
                    });
                }
                let raw = fs::read(target.path())
                    .map_err(|e| FileError::io("read", target.to_path_buf(), e))?;
                let location = extract_url(format, &String::from_utf8_lossy(&raw))?;
                Ok(ContentPlan::Redirect { location })
            }
            ContentKind::Container(kind) => {
                let text = self
                    .lister
                    .list(target.path(), kind)
                    .map_err(|e| FileError::Listing(e.to_string()))?;
                Ok(ContentPlan::Listing { kind, text })
            }
            ContentKind::Plain => {
                let head = read_head(target)?;
                Ok(ContentPlan::Stream(StreamPlan {
                    path: target.to_path_buf(),
                    mime: sniff_mime(&head),
                    len,
                    attachment: None,
                }))
            }
        }
    }
}

fn regular_file_len(target: &FileTarget) -> Result<u64, FileError> {
    let meta =
        fs::metadata(target.path()).map_err(|e| FileError::io("stat", target.to_path_buf(), e))?;
    if meta.is_dir() {
        return Err(FileError::IsADirectory(target.to_path_buf()));
    }
    Ok(meta.len())
}

fn read_head(target: &FileTarget) -> Result<Vec<u8>, FileError> {
    let file =
        File::open(target.path()).map_err(|e| FileError::io("open", target.to_path_buf(), e))?;
    let mut head = Vec::with_capacity(SNIFF_LEN);
    file.take(SNIFF_LEN as u64)
        .read_to_end(&mut head)
        .map_err(|e| FileError::io("read", target.to_path_buf(), e))?;
    Ok(head)
}

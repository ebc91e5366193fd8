//! Form field parsing.
//!
//! Every request to the file manager is a form submission: a query string on
//! GET, an urlencoded body on POST, or a multipart body for uploads. This
//! module turns the submitted fields into a typed [`FormRequest`].
//!
//! Values are kept exactly as submitted. Path cleaning and base-name
//! reduction are the engine's job, not the parser's.

use serde::Serialize;

/// Directory being browsed or operated on.
pub const FIELD_DIR: &str = "dir";
/// Single base file name.
pub const FIELD_FILE: &str = "file";
/// Full file path.
pub const FIELD_FULL_PATH: &str = "fp";
/// Destination directory (move) or new name (rename).
pub const FIELD_DEST: &str = "dst";
/// Multi-valued selection for batch operations.
pub const FIELD_MULTI: &str = "mulf";
/// Requested function.
pub const FIELD_FN: &str = "fn";
/// URL for new shortcut files.
pub const FIELD_URL: &str = "url";
/// Text content for saves.
pub const FIELD_TEXT: &str = "text";
/// Listing sort order.
pub const FIELD_SORT: &str = "sort";
/// Name to highlight in a listing.
pub const FIELD_HIGHLIGHT: &str = "hi";
/// Multipart field carrying an uploaded file.
pub const FIELD_UPLOAD_FILE: &str = "filename";

/// Ordered multimap of submitted form fields.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FormFields {
    pairs: Vec<(String, String)>,
}

impl FormFields {
    /// Create an empty field set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse `application/x-www-form-urlencoded` bytes (also valid for query strings).
    pub fn parse(input: &[u8]) -> Self {
        Self {
            pairs: url::form_urlencoded::parse(input).into_owned().collect(),
        }
    }

    /// Build from already-decoded pairs.
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            pairs: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    /// Append a field, keeping any earlier values for the same key.
    pub fn push(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.pairs.push((key.into(), value.into()));
    }

    /// Merge another field set after this one.
    pub fn extend(&mut self, other: FormFields) {
        self.pairs.extend(other.pairs);
    }

    /// First value for `key`, or the empty string when absent.
    pub fn value(&self, key: &str) -> &str {
        self.pairs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
            .unwrap_or("")
    }

    /// True when `key` was submitted with a non-empty value.
    pub fn is_set(&self, key: &str) -> bool {
        !self.value(key).is_empty()
    }

    /// All values for `key`, in submission order.
    pub fn values(&self, key: &str) -> Vec<String> {
        self.pairs
            .iter()
            .filter(|(k, _)| k == key)
            .map(|(_, v)| v.clone())
            .collect()
    }

    /// Number of submitted pairs.
    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    /// Whether no fields were submitted.
    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    /// Field names and values with the free-text `text` field elided, for logging.
    pub fn redacted(&self) -> Vec<(&str, &str)> {
        self.pairs
            .iter()
            .filter(|(k, _)| k != FIELD_TEXT)
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect()
    }
}

/// Which directory a listing should show.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ListTarget {
    /// The submitted `dir`.
    Current,
    /// The filesystem root.
    Home,
    /// The parent of the submitted `dir`.
    Parent,
}

/// A decoded file manager action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Show a directory listing.
    List {
        target: ListTarget,
        highlight: Option<String>,
    },
    /// Display a file inline (or its redirect / archive listing).
    Display { path: String },
    /// Force a file download.
    Download { path: String },
    /// Load a text file for editing.
    Edit { path: String },
    /// Save edited text.
    Save { path: String, text: String },
    /// Upload a file; the content arrives in the multipart body.
    Upload,
    /// Create a directory.
    Mkdir { name: String },
    /// Create an empty file.
    Mkfile { name: String },
    /// Create a URL shortcut file.
    Mkurl { name: String, url: String },
    /// Rename an entry within the directory.
    Rename { name: String, new_name: String },
    /// Move one or more entries to another directory.
    Move { names: Vec<String>, dest: String },
    /// Delete one or more entries.
    Delete { names: Vec<String> },
    /// Drop credentials.
    Logout,
}

impl Action {
    /// Whether this action mutates the filesystem.
    pub fn is_write(&self) -> bool {
        matches!(
            self,
            Action::Save { .. }
                | Action::Upload
                | Action::Mkdir { .. }
                | Action::Mkfile { .. }
                | Action::Mkurl { .. }
                | Action::Rename { .. }
                | Action::Move { .. }
                | Action::Delete { .. }
        )
    }

    /// Short name used in audit log lines.
    pub fn name(&self) -> &'static str {
        match self {
            Action::List { .. } => "list",
            Action::Display { .. } => "disp",
            Action::Download { .. } => "down",
            Action::Edit { .. } => "edit",
            Action::Save { .. } => "save",
            Action::Upload => "upload",
            Action::Mkdir { .. } => "mkdir",
            Action::Mkfile { .. } => "mkfile",
            Action::Mkurl { .. } => "mkurl",
            Action::Rename { .. } => "rename",
            Action::Move { .. } => "move",
            Action::Delete { .. } => "delete",
            Action::Logout => "logout",
        }
    }
}

/// A complete decoded request: the directory context plus the action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormRequest {
    /// Raw `dir` field.
    pub dir: String,
    /// Raw `sort` field, echoed back on redirects.
    pub sort: String,
    /// What to do.
    pub action: Action,
}

impl FormRequest {
    /// Decode the action from submitted fields.
    ///
    /// Buttons take precedence over the `fn` field, mirroring how a browser
    /// submits the clicked button alongside the hidden `fn` value. Dialog
    /// prompt buttons fall back to a listing since dialogs are rendered
    /// client side.
    pub fn from_fields(fields: &FormFields) -> Self {
        let dir = fields.value(FIELD_DIR).to_string();
        let sort = fields.value(FIELD_SORT).to_string();
        let highlight = non_empty(fields.value(FIELD_HIGHLIGHT));
        let list = |target| Action::List {
            target,
            highlight: highlight.clone(),
        };

        let action = if fields.is_set("upload") {
            Action::Upload
        } else if fields.is_set("save") {
            Action::Save {
                path: fields.value(FIELD_FULL_PATH).to_string(),
                text: fields.value(FIELD_TEXT).to_string(),
            }
        } else if fields.is_set("home") {
            list(ListTarget::Home)
        } else if fields.is_set("up") {
            list(ListTarget::Parent)
        } else if fields.is_set("cancel") {
            list(ListTarget::Current)
        } else {
            let file = fields.value(FIELD_FILE).to_string();
            let full_path = fields.value(FIELD_FULL_PATH).to_string();
            match fields.value(FIELD_FN) {
                "disp" => Action::Display { path: full_path },
                "down" => Action::Download { path: full_path },
                "edit" => Action::Edit { path: full_path },
                "mkdir" => Action::Mkdir { name: file },
                "mkfile" => Action::Mkfile { name: file },
                "mkurl" => Action::Mkurl {
                    name: file,
                    url: fields.value(FIELD_URL).to_string(),
                },
                "rename" => Action::Rename {
                    name: file,
                    new_name: fields.value(FIELD_DEST).to_string(),
                },
                "move" => Action::Move {
                    names: vec![file],
                    dest: fields.value(FIELD_DEST).to_string(),
                },
                "delete" => Action::Delete { names: vec![file] },
                "multi_move" => Action::Move {
                    names: fields.values(FIELD_MULTI),
                    dest: fields.value(FIELD_DEST).to_string(),
                },
                "multi_delete" => Action::Delete {
                    names: fields.values(FIELD_MULTI),
                },
                "logout" => Action::Logout,
                _ => list(ListTarget::Current),
            }
        };

        Self { dir, sort, action }
    }
}

fn non_empty(value: &str) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode(query: &str) -> FormRequest {
        FormRequest::from_fields(&FormFields::parse(query.as_bytes()))
    }

    #[test]
    fn test_empty_form_lists_current_dir() {
        let req = decode("");
        assert_eq!(req.dir, "");
        assert_eq!(
            req.action,
            Action::List {
                target: ListTarget::Current,
                highlight: None
            }
        );
    }

    #[test]
    fn test_multi_valued_selection_keeps_order() {
        let req = decode("dir=%2Ftmp&fn=multi_delete&mulf=c&mulf=a&mulf=b");
        assert_eq!(req.dir, "/tmp");
        assert_eq!(
            req.action,
            Action::Delete {
                names: vec!["c".into(), "a".into(), "b".into()]
            }
        );
    }

    #[test]
    fn test_multi_move_uses_dst() {
        let req = decode("dir=/a&fn=multi_move&mulf=x&mulf=y&dst=/b");
        assert_eq!(
            req.action,
            Action::Move {
                names: vec!["x".into(), "y".into()],
                dest: "/b".into()
            }
        );
    }

    #[test]
    fn test_single_delete_uses_file_field() {
        let req = decode("dir=/a&fn=delete&file=report.txt");
        assert_eq!(
            req.action,
            Action::Delete {
                names: vec!["report.txt".into()]
            }
        );
    }

    #[test]
    fn test_rename_takes_new_name_from_dst() {
        let req = decode("dir=/a&fn=rename&file=old.txt&dst=new.txt");
        assert_eq!(
            req.action,
            Action::Rename {
                name: "old.txt".into(),
                new_name: "new.txt".into()
            }
        );
    }

    #[test]
    fn test_save_button_wins_over_fn() {
        let req = decode("save=Save&fn=delete&fp=/a/b.txt&text=hello+world");
        assert_eq!(
            req.action,
            Action::Save {
                path: "/a/b.txt".into(),
                text: "hello world".into()
            }
        );
        assert!(req.action.is_write());
    }

    #[test]
    fn test_up_and_home_buttons() {
        assert_eq!(
            decode("dir=/a/b&up=1").action,
            Action::List {
                target: ListTarget::Parent,
                highlight: None
            }
        );
        assert_eq!(
            decode("dir=/a/b&home=1&hi=x").action,
            Action::List {
                target: ListTarget::Home,
                highlight: Some("x".into())
            }
        );
    }

    #[test]
    fn test_unknown_fn_falls_back_to_listing() {
        let req = decode("fn=renp&dir=/x");
        assert!(matches!(req.action, Action::List { .. }));
        assert!(!req.action.is_write());
    }

    #[test]
    fn test_redacted_drops_text() {
        let fields = FormFields::parse(b"fp=/a&text=secret");
        assert_eq!(fields.redacted(), vec![("fp", "/a")]);
    }

    #[test]
    fn test_value_defaults_to_empty() {
        let fields = FormFields::from_pairs([("a", "1")]);
        assert_eq!(fields.value("missing"), "");
        assert!(!fields.is_set("missing"));
        assert_eq!(fields.len(), 1);
    }
}

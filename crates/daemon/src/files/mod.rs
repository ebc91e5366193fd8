//! File-operation engine.
//!
//! This module provides the sandboxed operations behind every request:
//! - Deny-prefix path confinement after lexical cleaning
//! - Atomic text saves and uploads through a size-checked temp file
//! - Stop-on-first-failure batch move and delete
//! - Extension-based content dispatch with media type sniffing
//! - Directory listings
//!
//! # Security
//!
//! Every path a caller submits is cleaned and checked against the
//! [`SandboxPolicy`] before the filesystem is touched. Names submitted for
//! creation, rename, move and delete are reduced to their base component, so
//! they can only address entries inside the directory being operated on.

pub mod batch;
pub mod content;
pub mod error;
pub mod guard;
pub mod lister;
pub mod listing;
pub mod manager;
pub mod writer;

pub use batch::{BatchError, BatchFailure, BatchOperator, BatchOutcome, BatchRequest};
pub use content::{sniff_mime, ContentDispatcher, ContentPlan, ServeMode, StreamPlan};
pub use error::FileError;
pub use guard::{base_name, clean_path, FileTarget, SandboxPolicy};
pub use lister::{ArchiveLister, CommandLister, ContainerKind, ListError};
pub use listing::{EntryKind, ListEntry, Listing, SortOrder};
pub use manager::{FileManager, ManagerSettings, TextDocument, UploadSession};
pub use writer::{AtomicWriter, WriteTransaction};

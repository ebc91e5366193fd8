//! # WFM Protocol Library
//!
//! Request vocabulary for the WFM web file manager.
//!
//! ## Overview
//!
//! The file manager speaks plain HTML forms. This crate is the boundary
//! between those forms and the file-operation engine:
//!
//! - **Form Fields**: multi-valued field parsing and typed [`Action`] decoding
//! - **Shortcut Records**: the `[InternetShortcut]` / `.desktop` / `.webloc` layouts
//! - **Error Codes**: the signals the engine reports back to callers
//!
//! ## Example Usage
//!
//! ```rust
//! use wfm_protocol::{Action, FormFields, FormRequest};
//!
//! let fields = FormFields::parse(b"dir=/srv&fn=multi_delete&mulf=a&mulf=b");
//! let request = FormRequest::from_fields(&fields);
//!
//! assert_eq!(request.dir, "/srv");
//! assert!(matches!(request.action, Action::Delete { ref names } if names.len() == 2));
//! ```
//!
//! ## Modules
//!
//! - [`form`]: Form field parsing and action decoding
//! - [`shortcut`]: URL shortcut record codec
//! - [`error`]: Error types and codes

pub mod error;
pub mod form;
pub mod shortcut;

pub use error::{ErrorCode, ProtocolError, Result};
pub use form::{Action, FormFields, FormRequest, ListTarget};
pub use shortcut::{encode_internet_shortcut, extract_url, ShortcutFormat};

//! # WFM Daemon Library
//!
//! A web file manager confined to a directory tree.
//!
//! ## Overview
//!
//! The daemon serves one HTML-form endpoint that lists, displays, edits,
//! uploads, moves and deletes files. It provides:
//!
//! - **Path Confinement**: every path is cleaned and checked against deny prefixes
//! - **Atomic Writes**: saves and uploads land through a size-checked temp file
//! - **Batch Operations**: multi-entry move and delete that stop at the first failure
//! - **Content Dispatch**: shortcut redirects, archive listings, sniffed streaming
//! - **Privileged Startup**: ACME certificates, chroot and privilege drop before serving
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                         Bootstrap                            │
//! │  resolve user → ACME → chroot → bind → setgid/setuid → check │
//! ├──────────────────────────────────────────────────────────────┤
//! │                     HTTP server (axum)                       │
//! │           auth → form decoding → blocking file work          │
//! ├──────────────────────────────────────────────────────────────┤
//! │  ┌──────────────┐ ┌──────────────┐ ┌──────────────────────┐  │
//! │  │ SandboxPolicy│ │ AtomicWriter │ │   BatchOperator      │  │
//! │  └──────────────┘ └──────────────┘ └──────────────────────┘  │
//! │  ┌──────────────────────────────────────────────────────┐    │
//! │  │      ContentDispatcher (+ external archive listers)  │    │
//! │  └──────────────────────────────────────────────────────┘    │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use wfm::bootstrap::{Bootstrap, BootstrapPlan, LetsEncrypt, UnixSystem};
//! use wfm::config::Config;
//! use wfm::server::{self, AppState};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load_default()?;
//!     config.validate()?;
//!
//!     let state = AppState::from_config(&config)?;
//!     let outcome = Bootstrap::new(UnixSystem)
//!         .run(&BootstrapPlan::from_config(&config), &LetsEncrypt)?;
//!
//!     server::serve(outcome, state, async {
//!         let _ = tokio::signal::ctrl_c().await;
//!     })
//!     .await
//! }
//! ```
//!
//! ## Modules
//!
//! - [`auth`]: Basic authentication and access levels
//! - [`bootstrap`]: Ordered privileged startup
//! - [`config`]: TOML configuration
//! - [`files`]: Sandboxed file operations
//! - [`logging`]: Tracing subscriber setup
//! - [`server`]: HTTP routing and responses

pub mod auth;
pub mod bootstrap;
pub mod config;
pub mod files;
pub mod logging;
pub mod server;

pub use auth::{AccessLevel, Authenticator, Caller};
pub use bootstrap::{Bootstrap, BootstrapError, BootstrapOutcome, BootstrapPlan};
pub use config::Config;
pub use files::{FileError, FileManager, SandboxPolicy};
pub use server::AppState;

//! Configuration management for the WFM daemon.
//!
//! This module provides TOML-based configuration file loading and saving.
//! The default configuration path is `~/.config/wfm/config.toml`.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::files::lister::{default_commands, ContainerKind};

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("proto must be one of: tcp, tcp4, tcp6; got {0}")]
    InvalidProto(String),

    #[error("{field} must be host:port, got {value:?}")]
    InvalidAddr { field: &'static str, value: String },

    #[error("prefix must start with '/', got {0:?}")]
    InvalidPrefix(String),

    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),

    #[error("{field} must be greater than 0")]
    InvalidLimit { field: &'static str },

    #[error("acme.hosts must not be empty when acme.cache_dir is set")]
    MissingAcmeHosts,

    #[error("sandbox.chroot must be an absolute path, got {}", .0.display())]
    RelativeChroot(PathBuf),

    #[error("unknown archive kind {0:?}; expected zip, 7z, archive or iso")]
    UnknownArchiveKind(String),

    #[error("archive command for {0} is empty")]
    EmptyArchiveCommand(String),

    #[error("auth user {0:?} needs a name and a 64 character sha256 hex digest")]
    InvalidUser(String),

    #[error("doc_srv must be dir:/prefix with a prefix other than /, got {0:?}")]
    InvalidDocServe(String),

    #[error("{field} must start with '/' and not collide with another route, got {value:?}")]
    RouteConflict { field: &'static str, value: String },
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Valid bind protocols.
const VALID_PROTOS: &[&str] = &["tcp", "tcp4", "tcp6"];

/// Main configuration structure for the WFM daemon.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// Listener, logging and request limits.
    pub server: ServerConfig,

    /// Path confinement.
    pub sandbox: SandboxConfig,

    /// Startup identity handling.
    pub privilege: PrivilegeConfig,

    /// Automatic certificates. HTTPS is served when this is configured.
    pub acme: AcmeConfig,

    /// Caller authentication.
    pub auth: AuthConfig,

    /// Container listing commands.
    pub archive: ArchiveConfig,
}

/// Listener, logging and request limits.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// Address family filter: tcp, tcp4 or tcp6.
    pub proto: String,

    /// Main listen address. `:port` listens on all interfaces.
    pub addr: String,

    /// Optional second listener, always plain HTTP.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extra_addr: Option<String>,

    /// URL path the file manager is served under.
    pub prefix: String,

    /// `Cache-Control` value for file bodies.
    pub cache_control: String,

    /// Logging level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Append logs to this file instead of stderr.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_file: Option<PathBuf>,

    /// Largest accepted upload in bytes.
    pub upload_limit: u64,

    /// Largest file loaded into the editor, in bytes.
    pub edit_limit: u64,

    /// Plain static files as `dir:prefix`, e.g. `/var/www:/docs`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub doc_srv: Option<String>,
}

/// A static file tree served outside the file manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocServe {
    pub dir: PathBuf,
    /// URL prefix without a trailing slash.
    pub prefix: String,
}

impl DocServe {
    /// Parse `dir:prefix`.
    pub fn parse(value: &str) -> Result<Self, ConfigError> {
        let invalid = || ConfigError::InvalidDocServe(value.to_string());
        let (dir, prefix) = value.split_once(':').ok_or_else(invalid)?;
        let prefix = prefix.trim_end_matches('/');
        if dir.is_empty() || !prefix.starts_with('/') {
            return Err(invalid());
        }
        Ok(Self {
            dir: PathBuf::from(dir),
            prefix: prefix.to_string(),
        })
    }
}

/// Path confinement.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct SandboxConfig {
    /// Paths (and everything under them) never exposed or modified.
    pub deny_prefixes: Vec<String>,

    /// Change root to this directory before binding.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chroot: Option<PathBuf>,

    /// List dot-files.
    pub show_dot: bool,

    /// Expose the ACME cache directory. Denied by default.
    pub allow_acme_dir: bool,
}

/// Startup identity handling.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct PrivilegeConfig {
    /// Drop to this user after binding.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub setuid: Option<String>,

    /// Permit serving while still running as root.
    pub allow_root: bool,
}

/// Automatic certificate management.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AcmeConfig {
    /// Certificate cache. Setting this enables HTTPS.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_dir: Option<PathBuf>,

    /// Listen address for the HTTP-01 challenge responder.
    pub http_addr: String,

    /// Host names to request certificates for.
    pub hosts: Vec<String>,

    /// Contact addresses passed to the CA.
    pub contact: Vec<String>,

    /// Use the production directory instead of staging.
    pub production: bool,
}

/// Caller authentication.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct AuthConfig {
    /// Anonymous callers may write when no users are configured.
    pub anonymous_rw: bool,

    /// Known users. Empty disables authentication.
    pub users: Vec<UserConfig>,

    /// Failed-login lockout.
    pub ban: BanConfig,
}

/// Failed-login lockout, keyed by client IP.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BanConfig {
    pub enabled: bool,

    /// Failed logins before an address is locked out.
    pub max_failures: u32,

    /// Lockout length in seconds, counted from the last failure.
    pub ban_secs: u64,

    /// Serve the ban table as text at this path.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dump_path: Option<String>,
}

/// One user entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct UserConfig {
    pub name: String,

    /// Hex SHA-256 of the password (see `wfm hash-password`).
    pub password_sha256: String,

    /// Read-write access.
    pub rw: bool,
}

/// Container listing commands, keyed by zip, 7z, archive or iso. The file
/// path is appended to the command.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ArchiveConfig {
    pub commands: BTreeMap<String, Vec<String>>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            proto: "tcp".to_string(),
            addr: "127.0.0.1:8080".to_string(),
            extra_addr: None,
            prefix: "/".to_string(),
            cache_control: "no-cache".to_string(),
            log_level: "info".to_string(),
            log_file: None,
            upload_limit: 1024 * 1024 * 1024, // 1GB
            edit_limit: 1024 * 1024,          // 1MB
            doc_srv: None,
        }
    }
}

impl Default for BanConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_failures: 3,
            ban_secs: 3600,
            dump_path: None,
        }
    }
}

impl Default for AcmeConfig {
    fn default() -> Self {
        Self {
            cache_dir: None,
            http_addr: ":80".to_string(),
            hosts: Vec::new(),
            contact: Vec::new(),
            production: true,
        }
    }
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            commands: default_commands()
                .into_iter()
                .map(|(kind, cmd)| (kind.as_str().to_string(), cmd))
                .collect(),
        }
    }
}

impl AcmeConfig {
    /// Whether certificates should be obtained and HTTPS served.
    pub fn enabled(&self) -> bool {
        self.cache_dir.is_some()
    }
}

impl ArchiveConfig {
    /// Commands keyed by container kind. Unknown keys are skipped; validation
    /// reports them.
    pub fn by_kind(&self) -> BTreeMap<ContainerKind, Vec<String>> {
        self.commands
            .iter()
            .filter_map(|(key, cmd)| ContainerKind::from_key(key).map(|k| (k, cmd.clone())))
            .collect()
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("wfm")
        .join("config.toml")
}

fn valid_addr(addr: &str) -> bool {
    addr.rsplit_once(':')
        .is_some_and(|(_, port)| port.parse::<u16>().is_ok())
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Supported variables:
    /// - WFM_ADDR: Override the main listen address
    /// - WFM_LOG_LEVEL: Override log level (trace, debug, info, warn, error)
    /// - WFM_CHROOT: Override the chroot directory
    pub fn apply_env_overrides(&mut self) {
        if let Ok(addr) = std::env::var("WFM_ADDR") {
            if !addr.is_empty() {
                tracing::info!("Overriding addr from environment: {}", addr);
                self.server.addr = addr;
            }
        }

        if let Ok(level) = std::env::var("WFM_LOG_LEVEL") {
            if !level.is_empty() {
                tracing::info!("Overriding log_level from environment: {}", level);
                self.server.log_level = level;
            }
        }

        if let Ok(dir) = std::env::var("WFM_CHROOT") {
            if !dir.is_empty() {
                tracing::info!("Overriding chroot from environment: {}", dir);
                self.sandbox.chroot = Some(PathBuf::from(dir));
            }
        }
    }

    /// Validate the configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let server = &self.server;

        if !VALID_PROTOS.contains(&server.proto.as_str()) {
            return Err(ConfigError::InvalidProto(server.proto.clone()));
        }

        if !valid_addr(&server.addr) {
            return Err(ConfigError::InvalidAddr {
                field: "server.addr",
                value: server.addr.clone(),
            });
        }

        if let Some(extra) = &server.extra_addr {
            if !valid_addr(extra) {
                return Err(ConfigError::InvalidAddr {
                    field: "server.extra_addr",
                    value: extra.clone(),
                });
            }
        }

        if !server.prefix.starts_with('/') {
            return Err(ConfigError::InvalidPrefix(server.prefix.clone()));
        }

        let level = server.log_level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(server.log_level.clone()));
        }

        if server.upload_limit == 0 {
            return Err(ConfigError::InvalidLimit {
                field: "server.upload_limit",
            });
        }
        if server.edit_limit == 0 {
            return Err(ConfigError::InvalidLimit {
                field: "server.edit_limit",
            });
        }

        if let Some(chroot) = &self.sandbox.chroot {
            if !chroot.is_absolute() {
                return Err(ConfigError::RelativeChroot(chroot.clone()));
            }
        }

        if self.acme.enabled() {
            if self.acme.hosts.is_empty() {
                return Err(ConfigError::MissingAcmeHosts);
            }
            if !valid_addr(&self.acme.http_addr) {
                return Err(ConfigError::InvalidAddr {
                    field: "acme.http_addr",
                    value: self.acme.http_addr.clone(),
                });
            }
        }

        for user in &self.auth.users {
            let digest_ok = user.password_sha256.len() == 64
                && user.password_sha256.chars().all(|c| c.is_ascii_hexdigit());
            if user.name.is_empty() || user.name.contains(':') || !digest_ok {
                return Err(ConfigError::InvalidUser(user.name.clone()));
            }
        }

        let ban = &self.auth.ban;
        if ban.enabled {
            if ban.max_failures == 0 {
                return Err(ConfigError::InvalidLimit {
                    field: "auth.ban.max_failures",
                });
            }
            if ban.ban_secs == 0 {
                return Err(ConfigError::InvalidLimit {
                    field: "auth.ban.ban_secs",
                });
            }
        }

        let docs = self.doc_serve()?;
        if let Some(docs) = &docs {
            if docs.prefix == server.prefix.trim_end_matches('/') {
                return Err(ConfigError::RouteConflict {
                    field: "server.doc_srv",
                    value: docs.prefix.clone(),
                });
            }
        }

        if let Some(path) = &ban.dump_path {
            let under_docs = docs.as_ref().is_some_and(|d| {
                path == &d.prefix || path.starts_with(&format!("{}/", d.prefix))
            });
            if !path.starts_with('/') || path == &server.prefix || under_docs {
                return Err(ConfigError::RouteConflict {
                    field: "auth.ban.dump_path",
                    value: path.clone(),
                });
            }
        }

        for (key, cmd) in &self.archive.commands {
            if ContainerKind::from_key(key).is_none() {
                return Err(ConfigError::UnknownArchiveKind(key.clone()));
            }
            if cmd.is_empty() {
                return Err(ConfigError::EmptyArchiveCommand(key.clone()));
            }
        }

        Ok(())
    }

    /// The static file tree, when `server.doc_srv` is set.
    pub fn doc_serve(&self) -> Result<Option<DocServe>, ConfigError> {
        self.server.doc_srv.as_deref().map(DocServe::parse).transpose()
    }

    /// Deny prefixes in effect, including the ACME cache unless exposed.
    pub fn effective_deny_prefixes(&self) -> Vec<String> {
        let mut prefixes = self.sandbox.deny_prefixes.clone();
        if let Some(cache) = &self.acme.cache_dir {
            if !self.sandbox.allow_acme_dir {
                prefixes.push(cache.to_string_lossy().into_owned());
            }
        }
        prefixes
    }

    /// Load configuration from a file.
    ///
    /// If the file does not exist, returns the default configuration.
    /// If the file exists but is invalid TOML, returns an error with
    /// a helpful message.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_toml(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Load configuration from the default path.
    pub fn load_default() -> Result<Self> {
        Self::load(default_config_path())
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str)
            .map_err(|e| anyhow::anyhow!("Invalid TOML configuration: {}", format_toml_error(&e)))
    }

    /// Serialize configuration to a TOML string.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration to TOML")
    }
}

/// Format a TOML deserialization error for user-friendly display.
fn format_toml_error(error: &toml::de::Error) -> String {
    let mut msg = error.message().to_string();

    if let Some(span) = error.span() {
        msg.push_str(&format!(" (at position {}..{})", span.start, span.end));
    }

    msg
}

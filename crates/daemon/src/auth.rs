//! Caller identity.
//!
//! HTTP Basic credentials are checked against the configured users. Stored
//! passwords are SHA-256 hex digests; comparison runs over the full digest
//! regardless of where the first mismatch is.

use std::fmt;
use std::fmt::Write as _;
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

use base64::Engine;
use dashmap::DashMap;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::config::{AuthConfig, BanConfig};
use crate::files::FileError;

/// Name given to callers when no users are configured.
pub const ANONYMOUS: &str = "anonymous";

/// Realm sent in `WWW-Authenticate` challenges.
pub const REALM: &str = "wfm";

/// What a caller may do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessLevel {
    ReadOnly,
    ReadWrite,
}

/// An authenticated (or anonymous) caller, derived per request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller {
    pub name: String,
    pub addr: Option<SocketAddr>,
    pub access: AccessLevel,
}

impl Caller {
    pub fn new(name: impl Into<String>, addr: Option<SocketAddr>, access: AccessLevel) -> Self {
        Self {
            name: name.into(),
            addr,
            access,
        }
    }

    pub fn can_write(&self) -> bool {
        self.access == AccessLevel::ReadWrite
    }

    /// Fail with [`FileError::ReadOnly`] unless the caller may write.
    pub fn require_write(&self) -> Result<(), FileError> {
        if self.can_write() {
            Ok(())
        } else {
            Err(FileError::ReadOnly)
        }
    }
}

impl fmt::Display for Caller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.addr {
            Some(addr) => write!(f, "{}@{}", self.name, addr.ip()),
            None => f.write_str(&self.name),
        }
    }
}

/// Authentication failures. All of them answer 401.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("credentials required")]
    MissingCredentials,

    #[error("malformed authorization header")]
    Malformed,

    #[error("invalid credentials for {0}")]
    InvalidCredentials(String),

    #[error("{0} is banned after repeated login failures")]
    Banned(IpAddr),
}

impl AuthError {
    /// Whether the browser should be asked for credentials again.
    pub fn wants_challenge(&self) -> bool {
        !matches!(self, AuthError::Banned(_))
    }
}

/// SHA-256 hex digest of a password, the stored form in `[[auth.users]]`.
pub fn hash_password(password: &str) -> String {
    hex::encode(Sha256::digest(password.as_bytes()))
}

fn digests_match(a: &str, b: &str) -> bool {
    let (a, b) = (a.as_bytes(), b.as_bytes());
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[derive(Debug, Clone, Copy)]
struct BanEntry {
    failures: u32,
    last_failure: Instant,
}

/// One row of the ban table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BanRecord {
    pub ip: IpAddr,
    pub failures: u32,
    /// Time left on the lockout, `None` while under the threshold.
    pub remaining: Option<Duration>,
}

/// Failed-login counts per client IP.
///
/// An address is locked out once it reaches `max_failures`. The lockout
/// and the count both expire `ban` after the most recent failure. A
/// successful login clears the count.
#[derive(Debug)]
pub struct BanList {
    max_failures: u32,
    ban: Duration,
    entries: DashMap<IpAddr, BanEntry>,
}

impl BanList {
    pub fn new(max_failures: u32, ban: Duration) -> Self {
        Self {
            max_failures,
            ban,
            entries: DashMap::new(),
        }
    }

    /// `None` when banning is disabled.
    pub fn from_config(config: &BanConfig) -> Option<Self> {
        config
            .enabled
            .then(|| Self::new(config.max_failures, Duration::from_secs(config.ban_secs)))
    }

    /// Fail with [`AuthError::Banned`] while `ip` is locked out.
    pub fn check(&self, ip: IpAddr) -> Result<(), AuthError> {
        self.check_at(ip, Instant::now())
    }

    /// Count a failed login. Returns true when this failure starts a ban.
    pub fn record_failure(&self, ip: IpAddr) -> bool {
        self.record_failure_at(ip, Instant::now())
    }

    pub fn record_success(&self, ip: IpAddr) {
        self.entries.remove(&ip);
    }

    /// Current rows, ordered by address. Expired rows are dropped.
    pub fn snapshot(&self) -> Vec<BanRecord> {
        self.snapshot_at(Instant::now())
    }

    /// The table as text, one `ip failures remaining_secs` line per row.
    pub fn dump(&self) -> String {
        let mut out = String::new();
        for record in self.snapshot() {
            let remaining = record
                .remaining
                .map_or_else(|| "-".to_string(), |r| r.as_secs().to_string());
            let _ = writeln!(out, "{} {} {}", record.ip, record.failures, remaining);
        }
        out
    }

    fn expired(&self, entry: &BanEntry, now: Instant) -> bool {
        now.saturating_duration_since(entry.last_failure) >= self.ban
    }

    fn check_at(&self, ip: IpAddr, now: Instant) -> Result<(), AuthError> {
        // Drops a stale entry; the guard must not outlive this statement.
        self.entries.remove_if(&ip, |_, e| self.expired(e, now));
        match self.entries.get(&ip) {
            Some(entry) if entry.failures >= self.max_failures => Err(AuthError::Banned(ip)),
            _ => Ok(()),
        }
    }

    fn record_failure_at(&self, ip: IpAddr, now: Instant) -> bool {
        let mut entry = self.entries.entry(ip).or_insert(BanEntry {
            failures: 0,
            last_failure: now,
        });
        if self.expired(&entry, now) {
            entry.failures = 0;
        }
        entry.failures += 1;
        entry.last_failure = now;
        entry.failures == self.max_failures
    }

    fn snapshot_at(&self, now: Instant) -> Vec<BanRecord> {
        self.entries.retain(|_, e| !self.expired(e, now));
        let mut records: Vec<BanRecord> = self
            .entries
            .iter()
            .map(|item| {
                let entry = item.value();
                let remaining = (entry.failures >= self.max_failures)
                    .then(|| self.ban.saturating_sub(now.saturating_duration_since(entry.last_failure)));
                BanRecord {
                    ip: *item.key(),
                    failures: entry.failures,
                    remaining,
                }
            })
            .collect();
        records.sort_by_key(|r| r.ip);
        records
    }
}

#[derive(Debug, Clone)]
struct UserEntry {
    name: String,
    digest: String,
    access: AccessLevel,
}

/// Resolves request credentials to a [`Caller`].
#[derive(Debug)]
pub struct Authenticator {
    users: Vec<UserEntry>,
    anonymous: AccessLevel,
    bans: Option<BanList>,
}

impl Authenticator {
    pub fn from_config(config: &AuthConfig) -> Self {
        let users = config
            .users
            .iter()
            .map(|u| UserEntry {
                name: u.name.clone(),
                digest: u.password_sha256.to_ascii_lowercase(),
                access: if u.rw {
                    AccessLevel::ReadWrite
                } else {
                    AccessLevel::ReadOnly
                },
            })
            .collect();
        let anonymous = if config.anonymous_rw {
            AccessLevel::ReadWrite
        } else {
            AccessLevel::ReadOnly
        };
        Self {
            users,
            anonymous,
            bans: BanList::from_config(&config.ban),
        }
    }

    /// The failed-login table, when banning is enabled.
    pub fn bans(&self) -> Option<&BanList> {
        self.bans.as_ref()
    }

    /// Whether credentials are required at all.
    pub fn requires_credentials(&self) -> bool {
        !self.users.is_empty()
    }

    /// Authenticate from the raw `Authorization` header value.
    pub fn authenticate(
        &self,
        authorization: Option<&str>,
        addr: Option<SocketAddr>,
    ) -> Result<Caller, AuthError> {
        if !self.requires_credentials() {
            return Ok(Caller::new(ANONYMOUS, addr, self.anonymous));
        }

        let ip = addr.map(|a| a.ip());
        let bans = self.bans.as_ref().zip(ip);
        if let Some((bans, ip)) = bans {
            bans.check(ip)?;
        }

        let header = authorization.ok_or(AuthError::MissingCredentials)?;
        let (user, password) = parse_basic(header)?;
        let digest = hash_password(&password);

        // Check every entry so timing does not reveal which names exist.
        let mut matched = None;
        for entry in &self.users {
            let ok = digests_match(&entry.digest, &digest);
            if ok && entry.name == user && matched.is_none() {
                matched = Some(entry);
            }
        }

        match matched {
            Some(entry) => {
                if let Some((bans, ip)) = bans {
                    bans.record_success(ip);
                }
                Ok(Caller::new(entry.name.clone(), addr, entry.access))
            }
            None => {
                tracing::warn!(user = %user, addr = ?addr, "authentication failed");
                if let Some((bans, ip)) = bans {
                    if bans.record_failure(ip) {
                        tracing::warn!(ip = %ip, "address banned");
                    }
                }
                Err(AuthError::InvalidCredentials(user))
            }
        }
    }
}

fn parse_basic(header: &str) -> Result<(String, String), AuthError> {
    let (scheme, encoded) = header.trim().split_once(' ').ok_or(AuthError::Malformed)?;
    if !scheme.eq_ignore_ascii_case("basic") {
        return Err(AuthError::Malformed);
    }
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(encoded.trim())
        .map_err(|_| AuthError::Malformed)?;
    let decoded = String::from_utf8(decoded).map_err(|_| AuthError::Malformed)?;
    let (user, password) = decoded.split_once(':').ok_or(AuthError::Malformed)?;
    Ok((user.to_string(), password.to_string()))
}

//! Startup stage ordering.
//!
//! The stages run in a fixed order and each one runs exactly once. The
//! tracker refuses any transition other than to the next stage, so a
//! reordering bug surfaces as an error instead of as a process that, say,
//! binds after dropping privileges.

use std::fmt;

use super::BootstrapError;

/// Startup stages, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    /// Nothing has run yet.
    Init,
    /// Resolve the target user's uid and gid.
    ResolveUser,
    /// Start certificate management and bind its challenge responder.
    StartAcme,
    /// Change the root directory.
    Chroot,
    /// Bind the main and extra listeners.
    Bind,
    /// Set gid, then uid.
    DropPrivileges,
    /// Refuse to continue as root unless allowed.
    RootCheck,
    /// Ready to serve.
    Serve,
}

impl Stage {
    /// All stages after `Init`, in order.
    pub const SEQUENCE: [Stage; 7] = [
        Stage::ResolveUser,
        Stage::StartAcme,
        Stage::Chroot,
        Stage::Bind,
        Stage::DropPrivileges,
        Stage::RootCheck,
        Stage::Serve,
    ];

    /// The stage allowed to follow this one.
    pub fn next(self) -> Option<Stage> {
        match self {
            Stage::Init => Some(Stage::ResolveUser),
            Stage::ResolveUser => Some(Stage::StartAcme),
            Stage::StartAcme => Some(Stage::Chroot),
            Stage::Chroot => Some(Stage::Bind),
            Stage::Bind => Some(Stage::DropPrivileges),
            Stage::DropPrivileges => Some(Stage::RootCheck),
            Stage::RootCheck => Some(Stage::Serve),
            Stage::Serve => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Init => "init",
            Stage::ResolveUser => "resolve-user",
            Stage::StartAcme => "start-acme",
            Stage::Chroot => "chroot",
            Stage::Bind => "bind",
            Stage::DropPrivileges => "drop-privileges",
            Stage::RootCheck => "root-check",
            Stage::Serve => "serve",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a stage ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageStatus {
    Completed,
    /// Not configured; nothing was done.
    Skipped,
}

/// One entry in the startup history.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageRecord {
    pub stage: Stage,
    pub status: StageStatus,
}

/// Enforces stage order and records what happened.
#[derive(Debug, Clone)]
pub struct StageTracker {
    current: Stage,
    history: Vec<StageRecord>,
}

impl Default for StageTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl StageTracker {
    pub fn new() -> Self {
        Self {
            current: Stage::Init,
            history: Vec::with_capacity(Stage::SEQUENCE.len()),
        }
    }

    /// The stage most recently entered.
    pub fn current(&self) -> Stage {
        self.current
    }

    /// Enter `stage`. Fails unless it directly follows the current stage.
    pub fn advance(&mut self, stage: Stage) -> Result<(), BootstrapError> {
        if self.current.next() != Some(stage) {
            return Err(BootstrapError::OutOfOrder {
                from: self.current,
                to: stage,
            });
        }
        tracing::debug!(stage = %stage, "entering startup stage");
        self.current = stage;
        Ok(())
    }

    /// Record how the current stage ended.
    pub fn finish(&mut self, status: StageStatus) {
        self.history.push(StageRecord {
            stage: self.current,
            status,
        });
    }

    pub fn history(&self) -> &[StageRecord] {
        &self.history
    }
}

//! Privileged startup.
//!
//! The daemon is typically started as root so it can bind low ports and
//! confine itself with `chroot`. Startup then runs these stages in order:
//!
//! 1. Resolve the target user (the user database is still reachable)
//! 2. Start certificate management and bind its challenge responder
//! 3. Change the root directory
//! 4. Bind the main and extra listeners
//! 5. Set gid, then uid
//! 6. Refuse to continue as root unless explicitly allowed
//! 7. Hand the listeners to the server
//!
//! Any failure is fatal. Unconfigured stages are recorded as skipped.

pub mod acme;
pub mod stage;
pub mod system;

use std::io;
use std::net::TcpListener;
use std::path::PathBuf;

use thiserror::Error;
use tracing::{info, warn};

pub use acme::{AcmeError, AcmeSettings, AcmeStarter, LetsEncrypt, TlsSource};
pub use stage::{Stage, StageRecord, StageStatus, StageTracker};
pub use system::{BindProto, BindSpec, SystemOps, UnixSystem, UserIds};

use crate::config::Config;

/// Startup failures. All of them abort the process.
#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("unknown user {0:?}")]
    UnknownUser(String),

    #[error("failed to look up user {name:?}: {source}")]
    UserLookup {
        name: String,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Acme(#[from] AcmeError),

    #[error("failed to chroot to {}: {source}", .dir.display())]
    Chroot {
        dir: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to bind {role} listener on {spec}: {source}")]
    Bind {
        role: &'static str,
        spec: BindSpec,
        #[source]
        source: io::Error,
    },

    #[error("failed to switch to uid {uid} gid {gid}: {source}")]
    DropPrivileges {
        uid: u32,
        gid: u32,
        #[source]
        source: io::Error,
    },

    #[error("refusing to serve as root; set privilege.setuid or privilege.allow_root")]
    RunningAsRoot,

    #[error("startup stage {to} cannot follow {from}")]
    OutOfOrder { from: Stage, to: Stage },
}

/// Everything startup needs, derived from configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootstrapPlan {
    pub setuid: Option<String>,
    pub acme: Option<AcmeSettings>,
    pub chroot: Option<PathBuf>,
    pub bind: BindSpec,
    pub extra_bind: Option<BindSpec>,
    pub allow_root: bool,
}

impl BootstrapPlan {
    pub fn from_config(config: &Config) -> Self {
        let proto = BindProto::parse(&config.server.proto).unwrap_or(BindProto::Tcp);
        Self {
            setuid: config.privilege.setuid.clone().filter(|u| !u.is_empty()),
            acme: AcmeSettings::from_config(config),
            chroot: config.sandbox.chroot.clone(),
            bind: BindSpec::new(proto, config.server.addr.clone()),
            extra_bind: config
                .server
                .extra_addr
                .as_ref()
                .map(|addr| BindSpec::new(proto, addr.clone())),
            allow_root: config.privilege.allow_root,
        }
    }
}

/// Whether the main listener speaks TLS.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Http,
    Https,
}

/// Listeners and TLS material ready to serve.
#[derive(Debug)]
pub struct BootstrapOutcome {
    pub listener: TcpListener,
    pub extra_listener: Option<TcpListener>,
    pub tls: Option<TlsSource>,
    pub history: Vec<StageRecord>,
}

impl BootstrapOutcome {
    pub fn transport(&self) -> Transport {
        if self.tls.is_some() {
            Transport::Https
        } else {
            Transport::Http
        }
    }
}

/// Runs the startup stages against a [`SystemOps`] implementation.
pub struct Bootstrap<S: SystemOps> {
    system: S,
    tracker: StageTracker,
}

impl<S: SystemOps> Bootstrap<S> {
    pub fn new(system: S) -> Self {
        Self {
            system,
            tracker: StageTracker::new(),
        }
    }

    pub fn system(&self) -> &S {
        &self.system
    }

    pub fn system_mut(&mut self) -> &mut S {
        &mut self.system
    }

    pub fn tracker(&self) -> &StageTracker {
        &self.tracker
    }

    /// Run every stage in order.
    pub fn run(
        &mut self,
        plan: &BootstrapPlan,
        acme: &dyn AcmeStarter,
    ) -> Result<BootstrapOutcome, BootstrapError> {
        let ids = self.stage(Stage::ResolveUser, |system| {
            let Some(name) = &plan.setuid else {
                return Ok(None);
            };
            let ids = system
                .lookup_user(name)
                .map_err(|source| BootstrapError::UserLookup {
                    name: name.clone(),
                    source,
                })?
                .ok_or_else(|| BootstrapError::UnknownUser(name.clone()))?;
            info!(user = %name, uid = ids.uid, gid = ids.gid, "Resolved target user");
            Ok(Some(ids))
        })?;

        let tls = self.stage(Stage::StartAcme, |system| {
            let Some(settings) = &plan.acme else {
                return Ok(None);
            };
            let responder = system
                .bind(&settings.http)
                .map_err(|source| BootstrapError::Bind {
                    role: "ACME challenge",
                    spec: settings.http.clone(),
                    source,
                })?;
            let tls = acme.start(settings, responder)?;
            info!(hosts = ?settings.hosts, "Certificate management started");
            Ok(Some(tls))
        })?;

        self.stage(Stage::Chroot, |system| {
            let Some(dir) = &plan.chroot else {
                return Ok(None);
            };
            system
                .chroot(dir)
                .map_err(|source| BootstrapError::Chroot {
                    dir: dir.clone(),
                    source,
                })?;
            info!(dir = %dir.display(), "Changed root directory");
            Ok(Some(()))
        })?;

        self.tracker.advance(Stage::Bind)?;
        let listener = bind(&mut self.system, "main", &plan.bind)?;
        let extra_listener = plan
            .extra_bind
            .as_ref()
            .map(|spec| bind(&mut self.system, "extra", spec))
            .transpose()?;
        self.tracker.finish(StageStatus::Completed);

        self.stage(Stage::DropPrivileges, |system| match ids {
            Some(UserIds { uid, gid }) if uid != 0 && gid != 0 => {
                let dropped = system.set_gid(gid).and_then(|()| system.set_uid(uid));
                dropped.map_err(|source| BootstrapError::DropPrivileges { uid, gid, source })?;
                info!(uid, gid, "Dropped privileges");
                Ok(Some(()))
            }
            Some(_) => {
                warn!("Target user has uid or gid 0; not changing identity");
                Ok(None)
            }
            None => Ok(None),
        })?;

        self.stage(Stage::RootCheck, |system| {
            if system.effective_uid() == 0 && !plan.allow_root {
                return Err(BootstrapError::RunningAsRoot);
            }
            Ok(Some(()))
        })?;

        self.stage(Stage::Serve, |_| Ok(Some(())))?;

        Ok(BootstrapOutcome {
            listener,
            extra_listener,
            tls,
            history: self.tracker.history().to_vec(),
        })
    }

    /// Enter `stage`, run it, and record whether it did anything.
    fn stage<T>(
        &mut self,
        stage: Stage,
        run: impl FnOnce(&mut S) -> Result<Option<T>, BootstrapError>,
    ) -> Result<Option<T>, BootstrapError> {
        self.tracker.advance(stage)?;
        let out = run(&mut self.system)?;
        self.tracker.finish(if out.is_some() {
            StageStatus::Completed
        } else {
            StageStatus::Skipped
        });
        Ok(out)
    }
}

fn bind<S: SystemOps>(
    system: &mut S,
    role: &'static str,
    spec: &BindSpec,
) -> Result<TcpListener, BootstrapError> {
    let listener = system
        .bind(spec)
        .map_err(|source| BootstrapError::Bind {
            role,
            spec: spec.clone(),
            source,
        })?;
    if let Ok(addr) = listener.local_addr() {
        info!(role, addr = %addr, "Listening");
    }
    Ok(listener)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plan_from_default_config() {
        let plan = BootstrapPlan::from_config(&Config::default());
        assert_eq!(plan.setuid, None);
        assert_eq!(plan.acme, None);
        assert_eq!(plan.chroot, None);
        assert_eq!(plan.bind, BindSpec::new(BindProto::Tcp, "127.0.0.1:8080"));
        assert_eq!(plan.extra_bind, None);
        assert!(!plan.allow_root);
    }

    #[test]
    fn test_plan_extra_bind_uses_proto() {
        let mut config = Config::default();
        config.server.proto = "tcp6".into();
        config.server.extra_addr = Some("[::1]:9090".into());
        config.privilege.setuid = Some(String::new());

        let plan = BootstrapPlan::from_config(&config);
        assert_eq!(plan.extra_bind, Some(BindSpec::new(BindProto::Tcp6, "[::1]:9090")));
        assert_eq!(plan.setuid, None);
    }
}

//! Startup ordering tests.
//!
//! These run the real bootstrap sequence against a fake system that models
//! the kernel rules that matter here: only root may chroot, change identity
//! or bind ports below 1024.

use std::io;
use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use wfm::bootstrap::{
    AcmeError, AcmeSettings, AcmeStarter, BindProto, BindSpec, Bootstrap, BootstrapError,
    BootstrapPlan, Stage, StageStatus, SystemOps, TlsSource, Transport, UserIds,
};

type CallLog = Arc<Mutex<Vec<String>>>;

struct FakeSystem {
    euid: u32,
    users: Vec<(String, UserIds)>,
    calls: CallLog,
}

impl FakeSystem {
    fn as_root(calls: &CallLog) -> Self {
        Self {
            euid: 0,
            users: vec![
                ("www".to_string(), UserIds { uid: 1000, gid: 1000 }),
                ("root".to_string(), UserIds { uid: 0, gid: 0 }),
            ],
            calls: calls.clone(),
        }
    }

    fn as_user(calls: &CallLog, uid: u32) -> Self {
        Self {
            euid: uid,
            ..Self::as_root(calls)
        }
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }

    fn require_root(&self) -> io::Result<()> {
        if self.euid != 0 {
            return Err(io::Error::from(io::ErrorKind::PermissionDenied));
        }
        Ok(())
    }
}

impl SystemOps for FakeSystem {
    fn lookup_user(&mut self, name: &str) -> io::Result<Option<UserIds>> {
        self.record(format!("lookup:{name}"));
        Ok(self
            .users
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, ids)| *ids))
    }

    fn chroot(&mut self, dir: &Path) -> io::Result<()> {
        self.require_root()?;
        self.record(format!("chroot:{}", dir.display()));
        Ok(())
    }

    fn bind(&mut self, spec: &BindSpec) -> io::Result<TcpListener> {
        if spec.port().is_some_and(|p| p > 0 && p < 1024) {
            self.require_root()?;
        }
        self.record(format!("bind:{}", spec.addr));
        let listener = TcpListener::bind("127.0.0.1:0")?;
        listener.set_nonblocking(true)?;
        Ok(listener)
    }

    fn set_gid(&mut self, gid: u32) -> io::Result<()> {
        self.require_root()?;
        self.record(format!("setgid:{gid}"));
        Ok(())
    }

    fn set_uid(&mut self, uid: u32) -> io::Result<()> {
        self.require_root()?;
        self.record(format!("setuid:{uid}"));
        self.euid = uid;
        Ok(())
    }

    fn effective_uid(&self) -> u32 {
        self.euid
    }
}

#[derive(Debug)]
struct NoCertificate;

impl ResolvesServerCert for NoCertificate {
    fn resolve(&self, _hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        None
    }
}

struct FakeAcme {
    calls: CallLog,
    fail: bool,
}

impl AcmeStarter for FakeAcme {
    fn start(&self, settings: &AcmeSettings, _responder: TcpListener) -> Result<TlsSource, AcmeError> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("acme:{}", settings.hosts.join(",")));
        if self.fail {
            return Err(AcmeError::Responder(io::Error::other("directory unreachable")));
        }
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let config = rustls::ServerConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .unwrap()
            .with_no_client_auth()
            .with_cert_resolver(Arc::new(NoCertificate));
        Ok(TlsSource {
            server_config: Arc::new(config),
        })
    }
}

fn no_acme(calls: &CallLog) -> FakeAcme {
    FakeAcme {
        calls: calls.clone(),
        fail: false,
    }
}

fn plan(addr: &str) -> BootstrapPlan {
    BootstrapPlan {
        setuid: None,
        acme: None,
        chroot: None,
        bind: BindSpec::new(BindProto::Tcp4, addr),
        extra_bind: None,
        allow_root: false,
    }
}

fn acme_settings() -> AcmeSettings {
    AcmeSettings {
        cache_dir: PathBuf::from("/var/cache/wfm"),
        hosts: vec!["files.example.org".to_string()],
        contact: Vec::new(),
        production: false,
        http: BindSpec::new(BindProto::Tcp4, ":80"),
    }
}

fn calls(log: &CallLog) -> Vec<String> {
    log.lock().unwrap().clone()
}

fn status_of(history: &[wfm::bootstrap::StageRecord], stage: Stage) -> StageStatus {
    history
        .iter()
        .find(|r| r.stage == stage)
        .map(|r| r.status)
        .unwrap()
}

// =============================================================================
// Ordering
// =============================================================================

#[test]
fn test_privileged_bind_happens_before_drop() {
    let log = CallLog::default();
    let plan = BootstrapPlan {
        setuid: Some("www".to_string()),
        chroot: Some(PathBuf::from("/srv/files")),
        ..plan(":443")
    };

    let mut bootstrap = Bootstrap::new(FakeSystem::as_root(&log));
    let outcome = bootstrap.run(&plan, &no_acme(&log)).unwrap();

    assert_eq!(
        calls(&log),
        vec![
            "lookup:www",
            "chroot:/srv/files",
            "bind::443",
            "setgid:1000",
            "setuid:1000",
        ]
    );
    assert_eq!(bootstrap.system().effective_uid(), 1000);
    assert_eq!(outcome.transport(), Transport::Http);

    // Once dropped, the same bind is refused.
    let err = bootstrap
        .system_mut()
        .bind(&BindSpec::new(BindProto::Tcp4, ":443"))
        .unwrap_err();
    assert_eq!(err.kind(), io::ErrorKind::PermissionDenied);
}

#[test]
fn test_history_records_every_stage() {
    let log = CallLog::default();
    let plan = BootstrapPlan {
        setuid: Some("www".to_string()),
        ..plan("127.0.0.1:8080")
    };

    let mut bootstrap = Bootstrap::new(FakeSystem::as_root(&log));
    let outcome = bootstrap.run(&plan, &no_acme(&log)).unwrap();

    let stages: Vec<Stage> = outcome.history.iter().map(|r| r.stage).collect();
    assert_eq!(stages, Stage::SEQUENCE.to_vec());
    assert_eq!(status_of(&outcome.history, Stage::ResolveUser), StageStatus::Completed);
    assert_eq!(status_of(&outcome.history, Stage::StartAcme), StageStatus::Skipped);
    assert_eq!(status_of(&outcome.history, Stage::Chroot), StageStatus::Skipped);
    assert_eq!(status_of(&outcome.history, Stage::DropPrivileges), StageStatus::Completed);
    assert_eq!(bootstrap.tracker().current(), Stage::Serve);
}

#[test]
fn test_acme_responder_bound_before_chroot() {
    let log = CallLog::default();
    let plan = BootstrapPlan {
        setuid: Some("www".to_string()),
        chroot: Some(PathBuf::from("/srv/files")),
        acme: Some(acme_settings()),
        ..plan(":443")
    };

    let mut bootstrap = Bootstrap::new(FakeSystem::as_root(&log));
    let outcome = bootstrap.run(&plan, &no_acme(&log)).unwrap();

    assert_eq!(
        calls(&log),
        vec![
            "lookup:www",
            "bind::80",
            "acme:files.example.org",
            "chroot:/srv/files",
            "bind::443",
            "setgid:1000",
            "setuid:1000",
        ]
    );
    assert_eq!(outcome.transport(), Transport::Https);
}

#[test]
fn test_extra_listener_bound_with_main() {
    let log = CallLog::default();
    let plan = BootstrapPlan {
        extra_bind: Some(BindSpec::new(BindProto::Tcp4, ":80")),
        allow_root: true,
        ..plan(":443")
    };

    let mut bootstrap = Bootstrap::new(FakeSystem::as_root(&log));
    let outcome = bootstrap.run(&plan, &no_acme(&log)).unwrap();

    assert!(outcome.extra_listener.is_some());
    assert_eq!(calls(&log), vec!["bind::443", "bind::80"]);
}

// =============================================================================
// Failures
// =============================================================================

#[test]
fn test_root_refused_without_target_user() {
    let log = CallLog::default();
    let mut bootstrap = Bootstrap::new(FakeSystem::as_root(&log));

    let err = bootstrap
        .run(&plan("127.0.0.1:8080"), &no_acme(&log))
        .unwrap_err();

    assert!(matches!(err, BootstrapError::RunningAsRoot));
    assert_eq!(bootstrap.tracker().current(), Stage::RootCheck);
    assert_eq!(
        status_of(bootstrap.tracker().history(), Stage::DropPrivileges),
        StageStatus::Skipped
    );
}

#[test]
fn test_root_allowed_when_configured() {
    let log = CallLog::default();
    let plan = BootstrapPlan {
        allow_root: true,
        ..plan("127.0.0.1:8080")
    };
    let mut bootstrap = Bootstrap::new(FakeSystem::as_root(&log));

    let outcome = bootstrap.run(&plan, &no_acme(&log)).unwrap();
    assert_eq!(outcome.history.last().unwrap().stage, Stage::Serve);
}

#[test]
fn test_root_target_user_does_not_drop() {
    let log = CallLog::default();
    let plan = BootstrapPlan {
        setuid: Some("root".to_string()),
        ..plan("127.0.0.1:8080")
    };
    let mut bootstrap = Bootstrap::new(FakeSystem::as_root(&log));

    let err = bootstrap.run(&plan, &no_acme(&log)).unwrap_err();

    assert!(matches!(err, BootstrapError::RunningAsRoot));
    assert_eq!(calls(&log), vec!["lookup:root", "bind:127.0.0.1:8080"]);
}

#[test]
fn test_unknown_user_aborts_before_anything_else() {
    let log = CallLog::default();
    let plan = BootstrapPlan {
        setuid: Some("ghost".to_string()),
        ..plan(":443")
    };
    let mut bootstrap = Bootstrap::new(FakeSystem::as_root(&log));

    let err = bootstrap.run(&plan, &no_acme(&log)).unwrap_err();

    assert!(matches!(err, BootstrapError::UnknownUser(ref name) if name == "ghost"));
    assert_eq!(calls(&log), vec!["lookup:ghost"]);
}

#[test]
fn test_unprivileged_process_cannot_bind_low_port() {
    let log = CallLog::default();
    let mut bootstrap = Bootstrap::new(FakeSystem::as_user(&log, 1000));

    let err = bootstrap.run(&plan(":80"), &no_acme(&log)).unwrap_err();

    match err {
        BootstrapError::Bind { role, source, .. } => {
            assert_eq!(role, "main");
            assert_eq!(source.kind(), io::ErrorKind::PermissionDenied);
        }
        other => panic!("Expected Bind error, got {other:?}"),
    }
}

#[test]
fn test_unprivileged_process_serves_high_port() {
    let log = CallLog::default();
    let mut bootstrap = Bootstrap::new(FakeSystem::as_user(&log, 1000));

    let outcome = bootstrap.run(&plan("127.0.0.1:8080"), &no_acme(&log)).unwrap();
    assert_eq!(
        status_of(&outcome.history, Stage::DropPrivileges),
        StageStatus::Skipped
    );
}

#[test]
fn test_chroot_failure_is_fatal() {
    let log = CallLog::default();
    let plan = BootstrapPlan {
        chroot: Some(PathBuf::from("/srv/files")),
        ..plan("127.0.0.1:8080")
    };
    let mut bootstrap = Bootstrap::new(FakeSystem::as_user(&log, 1000));

    let err = bootstrap.run(&plan, &no_acme(&log)).unwrap_err();

    assert!(matches!(err, BootstrapError::Chroot { ref dir, .. } if dir == Path::new("/srv/files")));
    assert!(calls(&log).is_empty());
}

#[test]
fn test_acme_failure_is_fatal() {
    let log = CallLog::default();
    let plan = BootstrapPlan {
        chroot: Some(PathBuf::from("/srv/files")),
        acme: Some(acme_settings()),
        allow_root: true,
        ..plan(":443")
    };
    let acme = FakeAcme {
        calls: log.clone(),
        fail: true,
    };
    let mut bootstrap = Bootstrap::new(FakeSystem::as_root(&log));

    let err = bootstrap.run(&plan, &acme).unwrap_err();

    assert!(matches!(err, BootstrapError::Acme(AcmeError::Responder(_))));
    assert_eq!(calls(&log), vec!["bind::80", "acme:files.example.org"]);
}

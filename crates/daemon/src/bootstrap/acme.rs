//! Automatic certificates via ACME.
//!
//! Certificates are obtained from Let's Encrypt with the HTTP-01 challenge.
//! The challenge responder listener is bound by the startup sequence while
//! it still holds privileges; this module only serves on it.

use std::io;
use std::net::TcpListener;
use std::path::PathBuf;
use std::sync::Arc;

use futures_util::StreamExt;
use rustls_acme::caches::DirCache;
use rustls_acme::UseChallenge;
use thiserror::Error;
use tracing::{error, info};

use super::system::{BindProto, BindSpec};
use crate::config::Config;

/// Errors starting certificate management.
#[derive(Debug, Error)]
pub enum AcmeError {
    #[error("certificate management needs a running async runtime")]
    NoRuntime,

    #[error("challenge responder: {0}")]
    Responder(#[source] io::Error),
}

/// What certificate management needs to start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcmeSettings {
    /// Certificate cache. Resolved after the root change.
    pub cache_dir: PathBuf,
    pub hosts: Vec<String>,
    pub contact: Vec<String>,
    /// Production directory, or the staging one when false.
    pub production: bool,
    /// Where the HTTP-01 responder listens.
    pub http: BindSpec,
}

impl AcmeSettings {
    /// `None` when no cache directory is configured.
    pub fn from_config(config: &Config) -> Option<Self> {
        let cache_dir = config.acme.cache_dir.clone()?;
        let proto = BindProto::parse(&config.server.proto).unwrap_or(BindProto::Tcp);
        Some(Self {
            cache_dir,
            hosts: config.acme.hosts.clone(),
            contact: config.acme.contact.iter().map(|c| mailto(c)).collect(),
            production: config.acme.production,
            http: BindSpec::new(proto, config.acme.http_addr.clone()),
        })
    }
}

fn mailto(contact: &str) -> String {
    if contact.starts_with("mailto:") {
        contact.to_string()
    } else {
        format!("mailto:{contact}")
    }
}

/// TLS material for the HTTPS listener.
#[derive(Debug, Clone)]
pub struct TlsSource {
    pub server_config: Arc<rustls::ServerConfig>,
}

/// Starts certificate management on an already-bound responder listener.
pub trait AcmeStarter {
    fn start(&self, settings: &AcmeSettings, responder: TcpListener)
        -> Result<TlsSource, AcmeError>;
}

/// Let's Encrypt with an on-disk certificate cache.
///
/// Must be called from inside a Tokio runtime; the responder and the
/// renewal loop run as background tasks.
#[derive(Debug, Default, Clone, Copy)]
pub struct LetsEncrypt;

impl AcmeStarter for LetsEncrypt {
    fn start(
        &self,
        settings: &AcmeSettings,
        responder: TcpListener,
    ) -> Result<TlsSource, AcmeError> {
        tokio::runtime::Handle::try_current().map_err(|_| AcmeError::NoRuntime)?;
        let _ = rustls::crypto::ring::default_provider().install_default();

        let listener = tokio::net::TcpListener::from_std(responder).map_err(AcmeError::Responder)?;

        let mut state = rustls_acme::AcmeConfig::new(settings.hosts.clone())
            .contact(settings.contact.clone())
            .cache(DirCache::new(settings.cache_dir.clone()))
            .directory_lets_encrypt(settings.production)
            .challenge_type(UseChallenge::Http01)
            .state();

        let server_config = state.default_rustls_config();
        let challenge = axum::Router::new().fallback_service(state.http01_challenge_tower_service());

        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, challenge).await {
                error!(error = %e, "ACME challenge responder stopped");
            }
        });

        tokio::spawn(async move {
            while let Some(event) = state.next().await {
                match event {
                    Ok(ok) => info!(event = ?ok, "ACME event"),
                    Err(err) => error!(error = ?err, "ACME error"),
                }
            }
        });

        Ok(TlsSource { server_config })
    }
}

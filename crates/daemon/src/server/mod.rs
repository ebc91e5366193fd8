//! HTTP front end.
//!
//! One route at the configured prefix serves every action. Requests are
//! authenticated, decoded into an [`Action`](wfm_protocol::Action) and run
//! against the [`FileManager`] on the blocking pool.
//!
//! Two optional routes sit beside it: a static file tree (`server.doc_srv`)
//! and the failed-login table (`auth.ban.dump_path`).

pub mod error;
pub mod handlers;
pub mod tls;

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::DefaultBodyLimit;
use axum::http::HeaderValue;
use axum::routing::get;
use axum::Router;
use tokio_util::sync::CancellationToken;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

pub use error::HttpError;

use crate::auth::Authenticator;
use crate::bootstrap::BootstrapOutcome;
use crate::config::{Config, DocServe};
use crate::files::{CommandLister, FileManager, ManagerSettings, SandboxPolicy};

/// Multipart framing allowed on top of the upload limit.
const MULTIPART_OVERHEAD: u64 = 1024 * 1024;

/// Shared request state.
#[derive(Clone)]
pub struct AppState {
    pub files: Arc<FileManager>,
    pub auth: Arc<Authenticator>,
    pub prefix: Arc<str>,
    pub cache_control: HeaderValue,
    /// Static file tree served beside the file manager.
    pub docs: Option<DocServe>,
    /// Where the ban table is published.
    pub ban_dump: Option<Arc<str>>,
}

impl AppState {
    pub fn new(files: FileManager, auth: Authenticator, config: &Config) -> Result<Self> {
        let cache_control = HeaderValue::from_str(&config.server.cache_control)
            .context("server.cache_control is not a valid header value")?;
        Ok(Self {
            files: Arc::new(files),
            auth: Arc::new(auth),
            prefix: Arc::from(config.server.prefix.as_str()),
            cache_control,
            docs: config.doc_serve()?,
            ban_dump: config.auth.ban.dump_path.as_deref().map(Arc::from),
        })
    }

    /// Build the full state from configuration.
    pub fn from_config(config: &Config) -> Result<Self> {
        let policy = Arc::new(SandboxPolicy::from_config(config));
        let lister = Arc::new(CommandLister::from_config(&config.archive));
        let files = FileManager::new(policy, lister, ManagerSettings::from_config(config));
        let auth = Authenticator::from_config(&config.auth);
        Self::new(files, auth, config)
    }
}

pub fn router(state: AppState) -> Router {
    let limit = state
        .files
        .settings()
        .upload_limit
        .saturating_add(MULTIPART_OVERHEAD);
    let limit = usize::try_from(limit).unwrap_or(usize::MAX);

    let mut app = Router::new().route(&state.prefix, get(handlers::handle).post(handlers::handle));

    if let (Some(path), Some(_)) = (&state.ban_dump, state.auth.bans()) {
        app = app.route(path, get(handlers::dump_bans));
    }
    // Not subject to the sandbox policy or authentication.
    if let Some(docs) = &state.docs {
        info!(dir = %docs.dir.display(), prefix = %docs.prefix, "Serving static files");
        app = app.nest_service(&docs.prefix, ServeDir::new(&docs.dir));
    }

    app.layer(DefaultBodyLimit::max(limit))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn serve_plain(
    listener: std::net::TcpListener,
    app: Router,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::from_std(listener)?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
}

/// Serve until `shutdown` resolves.
pub async fn serve(
    outcome: BootstrapOutcome,
    state: AppState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let app = router(state);
    let token = CancellationToken::new();

    let trigger = token.clone();
    tokio::spawn(async move {
        shutdown.await;
        info!("Shutting down");
        trigger.cancel();
    });

    if let Some(extra) = outcome.extra_listener {
        let app = app.clone();
        let stop = token.clone().cancelled_owned();
        tokio::spawn(async move {
            if let Err(e) = serve_plain(extra, app, stop).await {
                error!(error = %e, "extra listener failed");
            }
        });
    }

    match outcome.tls {
        Some(tls) => tls::serve_tls(outcome.listener, tls.server_config, app, token)
            .await
            .context("HTTPS listener failed"),
        None => serve_plain(outcome.listener, app, token.cancelled_owned())
            .await
            .context("HTTP listener failed"),
    }
}

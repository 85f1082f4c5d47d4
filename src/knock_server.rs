mod access_logger;

use crate::knock_protocol::{KnockHandler, KnockOutcome, KnockParams};
use crate::knock_server::access_logger::{AccessLogger, LogEntryKind};
use crate::settings::ServerSettings;
use anyhow::Context;
use axum::extract::rejection::QueryRejection;
use axum::extract::{ConnectInfo, Query, State};
use axum::http::{header, HeaderName, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use std::future::Future;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::services::ServeDir;

/// Tokens and grants must never be served from a cache
const NO_CACHE: [(HeaderName, &str); 3] = [
    (header::CACHE_CONTROL, "no-cache, no-store, must-revalidate"),
    (header::PRAGMA, "no-cache"),
    (header::EXPIRES, "0"),
];

struct ServerState {
    handler: Arc<KnockHandler>,
    access_logger: AccessLogger,
}

pub struct KnockServer {
    listener: TcpListener,
    router: Router,
}

impl KnockServer {
    pub async fn new(settings: &ServerSettings, handler: Arc<KnockHandler>) -> anyhow::Result<Self> {
        let bind_socket_addr = SocketAddr::new(settings.listen_addr, settings.port);
        let listener = TcpListener::bind(bind_socket_addr)
            .await
            .with_context(|| format!("Failed to bind HTTP server socket at {}", bind_socket_addr))?;

        if let Some(docroot) = &settings.docroot {
            if !docroot.is_dir() {
                log::warn!(
                    "Document root '{}' is not a directory, only the API will be served",
                    docroot.display()
                );
            }
        }

        let state = Arc::new(ServerState {
            handler,
            access_logger: AccessLogger {},
        });

        Ok(Self {
            listener,
            router: router(&settings.endpoint, settings.docroot.as_deref(), state),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Serves until `shutdown` completes, then lets in-flight requests finish
    pub async fn run(self, shutdown: impl Future<Output = ()> + Send + 'static) -> anyhow::Result<()> {
        let local_addr = self.local_addr()?;
        log::info!("Listening on http://{}", local_addr);

        axum::serve(
            self.listener,
            self.router
                .into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown)
        .await
        .context("HTTP server failed")
    }
}

fn router(endpoint: &str, docroot: Option<&Path>, state: Arc<ServerState>) -> Router {
    let api = Router::new()
        .route("/sync", get(sync).post(sync))
        .route("/knock", get(knock).post(knock))
        .with_state(state);

    let router = Router::new().nest(endpoint, api);
    match docroot {
        Some(docroot) => router.fallback_service(ServeDir::new(docroot)),
        None => router.fallback(not_found),
    }
}

async fn not_found() -> Response {
    (StatusCode::NOT_FOUND, NO_CACHE, "Not Found").into_response()
}

async fn sync(
    State(state): State<Arc<ServerState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
) -> Response {
    let response = state.handler.sync(chrono::Utc::now().timestamp());

    state.access_logger.log(
        peer.ip().to_canonical(),
        LogEntryKind::Synced,
        format_args!("sync {}", response.timestamp),
    );

    (NO_CACHE, Json(response)).into_response()
}

async fn knock(
    State(state): State<Arc<ServerState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    query: Result<Query<KnockParams>, QueryRejection>,
) -> Response {
    // An unparseable query is answered like any other failed knock
    let params = query.map(|Query(params)| params).unwrap_or_default();
    let peer = peer.ip().to_canonical();

    let outcome = state
        .handler
        .knock(&params, peer, chrono::Utc::now().timestamp())
        .await;

    let key = params.key.as_deref().unwrap_or("-");
    match &outcome {
        KnockOutcome::Granted => {
            state
                .access_logger
                .log(peer, LogEntryKind::Granted, format_args!("[{}] granted", key));
        }
        KnockOutcome::AlreadyGranted => {
            state.access_logger.log(
                peer,
                LogEntryKind::AlreadyGranted,
                format_args!("[{}] already granted", key),
            );
        }
        KnockOutcome::Failed(reason) => {
            state
                .access_logger
                .log(peer, LogEntryKind::Failed, format_args!("[{}] {}", key, reason));
        }
        KnockOutcome::Expired { age } => {
            state.access_logger.log(
                peer,
                LogEntryKind::Expired,
                format_args!("[{}] token expired {} seconds ago", key, age),
            );
        }
        KnockOutcome::FirewallFailure(e) => {
            log::error!("Failed to grant access to {}: {}", peer, e);
            state.access_logger.log(
                peer,
                LogEntryKind::FirewallError,
                format_args!("[{}] firewall error", key),
            );
        }
    }

    (NO_CACHE, Json(state.handler.response(&outcome))).into_response()
}

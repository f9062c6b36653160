mod config;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Router,
    extract::{Query, State, WebSocketUpgrade, ws::rejection::WebSocketUpgradeRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use serde::Deserialize;
use tower_http::cors::CorsLayer;
use tower_http::services::{ServeDir, ServeFile};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use bellatrix_api::storage::Storage;
use bellatrix_api::{AppState, AppStateInner};
use bellatrix_db::Database;
use bellatrix_gateway::{Dispatcher, GatewayContext, connection};

use crate::config::Config;

#[derive(Clone)]
struct ServerState {
    gateway: GatewayContext,
    jwt_secret: String,
}

#[derive(Debug, Deserialize)]
struct GatewayQuery {
    token: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Init logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "bellatrix_server=debug,bellatrix_api=debug,bellatrix_gateway=debug,bellatrix_db=info,tower_http=debug"
                    .into()
            }),
        )
        .init();

    let config = Config::from_env()?;
    if config.has_placeholder_secret() {
        warn!("BELLATRIX_JWT_SECRET is unset or still a placeholder; set a real secret outside development");
    }

    let db = Arc::new(Database::open(&config.db_path, config.db_readers)?);
    info!("Database: {} ({} readers)", config.db_path.display(), config.db_readers);

    let app = build_app(&config, db).await?;

    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    info!("Bellatrix listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

/// HTTP API, gateway upgrade, uploads and the static front-end in one router.
async fn build_app(config: &Config, db: Arc<Database>) -> anyhow::Result<Router> {
    let storage = Storage::new(config.upload_dir.clone()).await?;
    let upload_dir = storage.dir().to_path_buf();

    let app_state: AppState = Arc::new(AppStateInner {
        db: db.clone(),
        storage,
        jwt_secret: config.jwt_secret.clone(),
        max_upload_bytes: config.max_upload_bytes,
    });

    let state = ServerState {
        gateway: GatewayContext {
            db,
            dispatcher: Dispatcher::new(),
        },
        jwt_secret: config.jwt_secret.clone(),
    };

    let ws_route = Router::new()
        .route("/gateway", get(ws_upgrade))
        .with_state(state);

    let static_dir = &config.static_dir;

    Ok(Router::new()
        .merge(bellatrix_api::router(app_state))
        .merge(ws_route)
        .route("/health", get(health))
        .nest_service("/uploads", ServeDir::new(upload_dir))
        .route_service("/", ServeFile::new(static_dir.join("login.html")))
        .fallback_service(ServeDir::new(static_dir))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http().make_span_with(request_span)))
}

/// Path only: the gateway token rides in the query string.
fn request_span<B>(request: &axum::http::Request<B>) -> tracing::Span {
    tracing::debug_span!(
        "request",
        method = %request.method(),
        path = %request.uri().path(),
    )
}

async fn health() -> &'static str {
    "ok"
}

/// The login token travels in the query string; browsers can't set headers
/// on a websocket handshake.
async fn ws_upgrade(
    State(state): State<ServerState>,
    Query(query): Query<GatewayQuery>,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let Some(token) = query.token else {
        return (StatusCode::UNAUTHORIZED, "missing token").into_response();
    };

    let claims = match bellatrix_api::auth::decode_token(&state.jwt_secret, &token) {
        Ok(claims) => claims,
        Err(e) => {
            warn!("Gateway upgrade with invalid token: {}", e);
            return (StatusCode::UNAUTHORIZED, "invalid token").into_response();
        }
    };

    // The account may be gone even though the token is still valid
    let db = state.gateway.db.clone();
    let user = match tokio::task::spawn_blocking(move || db.get_user_by_id(claims.sub)).await {
        Ok(Ok(Some(user))) => user,
        Ok(Ok(None)) => return (StatusCode::UNAUTHORIZED, "unknown user").into_response(),
        Ok(Err(e)) => {
            error!("Gateway user lookup failed: {:#}", e);
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
        Err(e) => {
            error!("Gateway user lookup panicked: {}", e);
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => return rejection.into_response(),
    };

    ws.on_upgrade(move |socket| {
        connection::handle_connection(socket, state.gateway, user.id, user.username, user.couple_id)
    })
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => info!("Received Ctrl+C, shutting down..."),
                    _ = sigterm.recv() => info!("Received SIGTERM, shutting down..."),
                }
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                ctrl_c.await.ok();
                info!("Received Ctrl+C, shutting down...");
            }
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("Received Ctrl+C, shutting down...");
    }
}

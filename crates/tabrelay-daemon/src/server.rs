//! HTTP server assembly and the WebSocket upgrade endpoint.
//!
//! One axum router carries the whole surface: the unauthenticated liveness
//! and artifact routes, the authenticated `/api/v1` subtree, and the `/ws`
//! upgrade the extension connects through. The upgrade authenticates before
//! upgrading: a bad credential is rejected with the same `connect_error`
//! shape the socket would use, without ever becoming a session.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::{DefaultBodyLimit, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{middleware, Json, Router};
use serde::Deserialize;
use tabrelay_core::config::Config;
use tabrelay_core::protocol::{ConnectErrorCode, ServerMessage};
use tabrelay_core::ratelimit::RateLimiter;
use tabrelay_core::token::{hash_token, TokenStore, TOKEN_PREFIX};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::hub::{connection, Hub};
use crate::screenshots::ScreenshotStore;
use crate::{auth, handlers};

/// Request bodies are small JSON; anything bigger is abuse.
const MAX_BODY_BYTES: usize = 1024 * 1024;

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    /// Runtime configuration.
    pub config: Arc<Config>,
    /// The relay hub.
    pub hub: Arc<Hub>,
    /// Token persistence.
    pub tokens: TokenStore,
    /// Per-token request budgeting.
    pub limiter: Arc<RateLimiter>,
    /// Ephemeral screenshot artifacts.
    pub screenshots: Arc<ScreenshotStore>,
    /// Process start, for `/health` uptime.
    pub started_at: std::time::Instant,
    /// Version string reported in handshakes and `/health`.
    pub version: String,
}

/// Builds the full router.
pub fn router(state: AppState) -> Router {
    let api = Router::new()
        .route("/status", get(handlers::status))
        .route("/tabs", get(handlers::tabs))
        .route("/command", post(handlers::command))
        .route("/screenshot", post(handlers::screenshot))
        .route("/snapshot", post(handlers::snapshot))
        // Layers run outermost-last: auth first, then rate limiting.
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth::enforce_rate_limit,
        ))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_auth,
        ));

    Router::new()
        .route("/health", get(handlers::health))
        .route("/screenshots/{name}", get(handlers::serve_screenshot))
        .route("/ws", get(ws_upgrade))
        .nest("/api/v1", api)
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(tower_http::cors::CorsLayer::permissive())
        .layer(middleware::from_fn(log_requests))
        .with_state(state)
}

/// Logs one line per request with method, path, and status.
async fn log_requests(req: axum::extract::Request, next: middleware::Next) -> Response {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let start = std::time::Instant::now();

    let response = next.run(req).await;

    info!(
        method = %method,
        path = %path,
        status = response.status().as_u16(),
        elapsed_ms = start.elapsed().as_millis() as u64,
        "request"
    );
    response
}

/// Binds the configured listener and serves until `shutdown` resolves,
/// draining the hub as part of the graceful stop.
///
/// # Errors
///
/// Returns an error if the listener cannot bind or the server fails.
pub async fn serve<F>(state: AppState, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = format!("{}:{}", state.config.host, state.config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    info!(addr = %addr, version = %state.version, "relay listening");

    // Once the shutdown signal fires, axum stops accepting while the hub
    // drains concurrently. The drain closes every extension socket, which is
    // what lets the upgraded connections (and so the server) finish.
    let hub = Arc::clone(&state.hub);
    let shutdown = async move {
        shutdown.await;
        tokio::spawn(async move {
            hub.shutdown(Duration::from_secs(5)).await;
        });
    };

    axum::serve(listener, router(state).into_make_service())
        .with_graceful_shutdown(shutdown)
        .await
        .context("server error")?;

    Ok(())
}

/// Spawns the background task that prunes elapsed rate-limit windows.
pub fn spawn_rate_sweeper(limiter: Arc<RateLimiter>, stop: CancellationToken) {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(Duration::from_secs(60));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                () = stop.cancelled() => break,
                _ = tick.tick() => {
                    let evicted = limiter.sweep();
                    if evicted > 0 {
                        tracing::debug!(evicted, "swept rate limiter windows");
                    }
                }
            }
        }
    });
}

#[derive(Debug, Deserialize)]
struct WsQuery {
    /// Credential for the upgrade; the bearer header is the fallback.
    token: Option<String>,
    /// Extension version, advisory.
    version: Option<String>,
}

/// `GET /ws`: authenticate, upgrade, and run the session pumps.
async fn ws_upgrade(
    ws: WebSocketUpgrade,
    Query(query): Query<WsQuery>,
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Response {
    let token = query.token.or_else(|| auth::bearer_token(&headers));
    let Some(token) = token else {
        return connect_reject(
            StatusCode::UNAUTHORIZED,
            ConnectErrorCode::InvalidToken,
            "missing or invalid token",
        );
    };
    if !token.starts_with(TOKEN_PREFIX) {
        return connect_reject(
            StatusCode::UNAUTHORIZED,
            ConnectErrorCode::InvalidToken,
            "missing or invalid token",
        );
    }

    let record = match state.tokens.validate(&token) {
        Ok(Some(record)) => record,
        Ok(None) => {
            return connect_reject(
                StatusCode::UNAUTHORIZED,
                ConnectErrorCode::InvalidToken,
                "invalid or revoked token",
            );
        }
        Err(err) => {
            warn!(error = %err, "token validation failed during upgrade");
            return connect_reject(
                StatusCode::INTERNAL_SERVER_ERROR,
                ConnectErrorCode::ServerError,
                "token validation failed",
            );
        }
    };

    let digest = hash_token(&token);
    let name = record.name;
    let extension_version = query.version;
    let max_frame = state.config.ws_max_frame_bytes;

    ws.max_message_size(max_frame)
        .on_upgrade(move |socket| handle_socket(state, socket, digest, name, extension_version))
}

async fn handle_socket(
    state: AppState,
    socket: WebSocket,
    digest: String,
    token_name: String,
    extension_version: Option<String>,
) {
    let (outbound_tx, outbound_rx) = mpsc::channel(state.config.outbound_queue_depth);
    let session = state
        .hub
        .register(&digest, &token_name, extension_version, outbound_tx);
    connection::run(Arc::clone(&state.hub), session, socket, outbound_rx).await;
}

/// Pre-upgrade rejection in the socket's own error shape.
fn connect_reject(status: StatusCode, code: ConnectErrorCode, message: &str) -> Response {
    (
        status,
        Json(ServerMessage::ConnectError {
            code,
            message: message.to_string(),
        }),
    )
        .into_response()
}

//! REST handlers: the thin adapter that translates authenticated HTTP calls
//! into hub dispatches.
//!
//! Every error leaves this layer as the same JSON shape,
//! `{"error":{"code","message","retryAfter?"}}`, with the status code
//! determined by the error class. Rate-limit and auth failures short-circuit
//! in middleware before any handler runs.

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use serde::{Deserialize, Serialize};
use tabrelay_core::protocol::{CommandAction, CommandError, ImageFormat, Tab};
use thiserror::Error;
use tracing::{debug, error};

use crate::auth::AuthContext;
use crate::hub::HubError;
use crate::screenshots::ScreenshotError;
use crate::server::AppState;

/// Default DOM depth for snapshots when the caller does not choose one.
const DEFAULT_SNAPSHOT_MAX_DEPTH: u32 = 10;

/// Default serialized-length cap for snapshots.
const DEFAULT_SNAPSHOT_MAX_LENGTH: u32 = 100 * 1024;

/// API-surface errors, serialized as `{"error":{...}}`.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Missing, malformed, unknown, or revoked credential. One message for
    /// all of them, to deny probing.
    #[error("invalid or missing token")]
    Unauthorized,

    /// The request body or parameters failed validation.
    #[error("{0}")]
    InvalidRequest(String),

    /// The per-token request budget is exhausted.
    #[error("too many requests")]
    RateLimited {
        /// Seconds until the window rolls over.
        retry_after_secs: u64,
    },

    /// A hub dispatch failed.
    #[error(transparent)]
    Hub(#[from] HubError),

    /// The extension reported an action-level failure.
    #[error("{message}")]
    Command {
        /// Extension-reported code, passed through.
        code: String,
        /// Extension-reported message.
        message: String,
    },

    /// A screenshot payload exceeded the configured size cap.
    #[error("screenshot exceeds maximum size limit")]
    FileTooLarge,

    /// Anything else.
    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    /// HTTP status for this error.
    #[must_use]
    pub const fn status_code(&self) -> StatusCode {
        match self {
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::InvalidRequest(_) | Self::Command { .. } | Self::FileTooLarge => {
                StatusCode::BAD_REQUEST
            }
            Self::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::Hub(HubError::Offline | HubError::Backpressured) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            Self::Hub(HubError::Timeout) => StatusCode::GATEWAY_TIMEOUT,
            Self::Hub(HubError::Internal(_)) | Self::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Machine-readable error code.
    #[must_use]
    pub fn code(&self) -> &str {
        match self {
            Self::Unauthorized => "UNAUTHORIZED",
            Self::InvalidRequest(_) => "INVALID_REQUEST",
            Self::RateLimited { .. } => "RATE_LIMITED",
            Self::Hub(HubError::Offline | HubError::Backpressured) => "EXTENSION_OFFLINE",
            Self::Hub(HubError::Timeout) => "TIMEOUT",
            Self::Hub(HubError::Internal(_)) | Self::Internal(_) => "INTERNAL_ERROR",
            Self::Command { code, .. } => code,
            Self::FileTooLarge => "FILE_TOO_LARGE",
        }
    }

    /// Retry hint in seconds, for capacity errors.
    #[must_use]
    pub const fn retry_after_secs(&self) -> Option<u64> {
        match self {
            Self::RateLimited { retry_after_secs } => Some(*retry_after_secs),
            Self::Hub(HubError::Backpressured) => Some(1),
            _ => None,
        }
    }
}

impl From<ScreenshotError> for ApiError {
    fn from(err: ScreenshotError) -> Self {
        match err {
            ScreenshotError::TooLarge => Self::FileTooLarge,
            // A payload the extension produced but we cannot decode or write
            // is the relay's problem, not the caller's.
            ScreenshotError::Decode(err) => Self::Internal(format!("bad screenshot payload: {err}")),
            ScreenshotError::Io(err) => Self::Internal(format!("failed to save screenshot: {err}")),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let retry_after = self.retry_after_secs();

        if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!(error = %self, "request failed");
        }

        let mut body = serde_json::json!({
            "error": {
                "code": self.code(),
                "message": self.to_string(),
            }
        });
        if let Some(secs) = retry_after {
            body["error"]["retryAfter"] = secs.into();
        }

        let mut response = (status, Json(body)).into_response();
        if let Some(secs) = retry_after {
            if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}

/// `GET /health` response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// Always `"ok"` when the process answers.
    pub status: &'static str,
    /// Relay version.
    pub version: String,
    /// Seconds since startup.
    pub uptime: u64,
}

/// `GET /api/v1/status` response.
#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    /// Whether an extension session is live for this token.
    pub connected: bool,
    /// Last heartbeat, RFC 3339.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<String>,
    /// Extension version, when it reported one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extension_version: Option<String>,
    /// Number of attached tabs.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tab_count: Option<usize>,
}

/// `GET /api/v1/tabs` response.
#[derive(Debug, Serialize)]
pub struct TabsResponse {
    /// Attached tabs for this token's session.
    pub tabs: Vec<Tab>,
}

/// `POST /api/v1/command` request body.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandRequest {
    /// Target tab.
    #[serde(default)]
    pub tab_id: String,
    /// The action to perform. Unknown kinds fail deserialization.
    pub action: CommandAction,
    /// Per-call timeout in milliseconds; the configured default when absent
    /// or zero.
    #[serde(default)]
    pub timeout: Option<u64>,
}

/// `POST /api/v1/command` response body.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandApiResponse {
    /// Whether the action succeeded.
    pub success: bool,
    /// Action-specific result payload.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    /// Action-level failure detail.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<CommandError>,
    /// Relay-side timing.
    pub timing: Timing,
}

/// Relay-side request timing.
#[derive(Debug, Serialize)]
pub struct Timing {
    /// Total milliseconds spent in the relay, dispatch to response.
    pub total: u64,
}

/// `POST /api/v1/screenshot` request body.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScreenshotRequest {
    /// Target tab.
    #[serde(default)]
    pub tab_id: String,
    /// Capture the full page instead of the viewport.
    #[serde(default)]
    pub full_page: bool,
    /// Output encoding, PNG when absent.
    #[serde(default)]
    pub format: Option<ImageFormat>,
    /// JPEG quality, 0-100.
    #[serde(default)]
    pub quality: Option<u8>,
}

/// `POST /api/v1/screenshot` response body.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScreenshotResponse {
    /// Ephemeral URL the artifact is served from until it expires.
    pub url: String,
    /// Image width in pixels.
    pub width: u32,
    /// Image height in pixels.
    pub height: u32,
    /// Artifact size in bytes.
    pub size: usize,
    /// Expiry timestamp, RFC 3339.
    pub expires_at: String,
}

/// `POST /api/v1/snapshot` request body.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotRequest {
    /// Target tab.
    #[serde(default)]
    pub tab_id: String,
    /// Maximum DOM depth to serialize.
    #[serde(default)]
    pub max_depth: Option<u32>,
    /// Maximum serialized length in bytes.
    #[serde(default)]
    pub max_length: Option<u32>,
}

/// `POST /api/v1/snapshot` response body.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotResponse {
    /// Serialized DOM.
    pub html: String,
    /// Tab URL at capture time.
    pub url: String,
    /// Tab title at capture time.
    pub title: String,
    /// Whether the snapshot hit the length cap.
    pub truncated: bool,
}

/// Shape of the extension's screenshot result payload.
#[derive(Debug, Deserialize)]
struct ScreenshotResult {
    data: String,
    #[serde(default)]
    width: f64,
    #[serde(default)]
    height: f64,
}

/// Shape of the extension's snapshot result payload.
#[derive(Debug, Default, Deserialize)]
struct SnapshotResult {
    #[serde(default)]
    html: String,
    #[serde(default)]
    url: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    truncated: bool,
}

/// `GET /health`: liveness, version, uptime. Unauthenticated.
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: state.version.clone(),
        uptime: state.started_at.elapsed().as_secs(),
    })
}

/// `GET /api/v1/status`: connection status for the caller's token.
pub async fn status(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
) -> Json<StatusResponse> {
    match state.hub.session(&auth.digest) {
        Some(session) => Json(StatusResponse {
            connected: true,
            last_seen: Some(session.last_heartbeat().to_rfc3339()),
            extension_version: session.extension_version.clone(),
            tab_count: Some(session.tab_count()),
        }),
        None => Json(StatusResponse::default()),
    }
}

/// `GET /api/v1/tabs`: tabs attached to the caller's session.
pub async fn tabs(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
) -> Result<Json<TabsResponse>, ApiError> {
    let session = state.hub.session(&auth.digest).ok_or(HubError::Offline)?;
    Ok(Json(TabsResponse {
        tabs: session.tabs_snapshot(),
    }))
}

/// `POST /api/v1/command`: dispatch an action to one tab and wait for its
/// result.
pub async fn command(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    body: Bytes,
) -> Result<Json<CommandApiResponse>, ApiError> {
    let req: CommandRequest = parse_body(&body)?;
    if req.tab_id.is_empty() {
        return Err(ApiError::InvalidRequest("tabId is required".into()));
    }

    let start = std::time::Instant::now();
    let resp = state
        .hub
        .send_command(&auth.digest, req.tab_id, req.action, req.timeout)
        .await?;

    Ok(Json(CommandApiResponse {
        success: resp.success,
        result: resp.result,
        error: resp.error,
        timing: Timing {
            total: start.elapsed().as_millis() as u64,
        },
    }))
}

/// `POST /api/v1/screenshot`: capture, materialize on disk, return an
/// ephemeral URL.
pub async fn screenshot(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    body: Bytes,
) -> Result<Json<ScreenshotResponse>, ApiError> {
    let req: ScreenshotRequest = parse_body(&body)?;
    if req.tab_id.is_empty() {
        return Err(ApiError::InvalidRequest("tabId is required".into()));
    }

    let format = req.format.unwrap_or_default();
    let action = CommandAction::Screenshot {
        full_page: req.full_page,
        clip: None,
        quality: req.quality,
        format,
    };

    let resp = state
        .hub
        .send_command(&auth.digest, req.tab_id, action, None)
        .await?;
    let resp = require_success(resp)?;

    let result: ScreenshotResult = resp
        .result
        .ok_or_else(|| ApiError::Internal("screenshot result missing".into()))
        .and_then(|value| {
            serde_json::from_value(value)
                .map_err(|err| ApiError::Internal(format!("malformed screenshot result: {err}")))
        })?;

    let saved = state.screenshots.save(&result.data, format).await?;

    Ok(Json(ScreenshotResponse {
        url: format!("/screenshots/{}", saved.name),
        width: result.width as u32,
        height: result.height as u32,
        size: saved.size,
        expires_at: saved.expires_at.to_rfc3339(),
    }))
}

/// `POST /api/v1/snapshot`: capture a DOM snapshot.
pub async fn snapshot(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    body: Bytes,
) -> Result<Json<SnapshotResponse>, ApiError> {
    let req: SnapshotRequest = parse_body(&body)?;
    if req.tab_id.is_empty() {
        return Err(ApiError::InvalidRequest("tabId is required".into()));
    }

    let action = CommandAction::Snapshot {
        max_depth: Some(
            req.max_depth
                .filter(|d| *d > 0)
                .unwrap_or(DEFAULT_SNAPSHOT_MAX_DEPTH),
        ),
        max_length: Some(
            req.max_length
                .filter(|l| *l > 0)
                .unwrap_or(DEFAULT_SNAPSHOT_MAX_LENGTH),
        ),
        include_styles: false,
    };

    let resp = state
        .hub
        .send_command(&auth.digest, req.tab_id, action, None)
        .await?;
    let resp = require_success(resp)?;

    let result: SnapshotResult = resp
        .result
        .and_then(|value| serde_json::from_value(value).ok())
        .unwrap_or_default();

    Ok(Json(SnapshotResponse {
        html: result.html,
        url: result.url,
        title: result.title,
        truncated: result.truncated,
    }))
}

/// `GET /screenshots/{name}`: serve an ephemeral artifact. Unauthenticated;
/// the random filename is the capability. 404 once expired.
pub async fn serve_screenshot(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Response {
    // The random name never contains path syntax; anything that does is a
    // traversal attempt.
    if name.contains('/') || name.contains('\\') || name.contains("..") {
        return StatusCode::NOT_FOUND.into_response();
    }

    let path = state.screenshots.dir().join(&name);
    match tokio::fs::read(&path).await {
        Ok(bytes) => {
            let content_type = content_type_for(&name);
            ([(header::CONTENT_TYPE, content_type)], bytes).into_response()
        }
        Err(err) => {
            debug!(name = %name, error = %err, "screenshot not found");
            StatusCode::NOT_FOUND.into_response()
        }
    }
}

fn parse_body<'a, T: Deserialize<'a>>(body: &'a Bytes) -> Result<T, ApiError> {
    serde_json::from_slice(body)
        .map_err(|err| ApiError::InvalidRequest(format!("invalid request body: {err}")))
}

/// Converts an action-level failure into the 400-class error the original
/// surface returns, passing the extension's code through.
fn require_success(
    resp: tabrelay_core::protocol::CommandResponse,
) -> Result<tabrelay_core::protocol::CommandResponse, ApiError> {
    if resp.success {
        return Ok(resp);
    }
    let err = resp.error.unwrap_or(CommandError {
        code: "COMMAND_FAILED".into(),
        message: "the extension reported a failure".into(),
    });
    Err(ApiError::Command {
        code: err.code,
        message: err.message,
    })
}

fn content_type_for(name: &str) -> &'static str {
    match name.rsplit_once('.').map(|(_, ext)| ext) {
        Some("png") => "image/png",
        Some("jpg" | "jpeg") => "image/jpeg",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use chrono::Utc;
    use tabrelay_core::config::Config;
    use tabrelay_core::ratelimit::RateLimiter;
    use tabrelay_core::token::{Token, TokenStore};

    use super::*;
    use crate::hub::Hub;
    use crate::screenshots::ScreenshotStore;

    fn test_state() -> AppState {
        let config = Arc::new(Config {
            command_timeout_ms: 200,
            ..Config::default()
        });
        AppState {
            hub: Arc::new(Hub::new((*config).clone(), "test")),
            tokens: TokenStore::open_in_memory().unwrap(),
            limiter: Arc::new(RateLimiter::new()),
            screenshots: Arc::new(ScreenshotStore::new(
                std::env::temp_dir(),
                Duration::from_secs(30),
                1024,
            )),
            config,
            started_at: std::time::Instant::now(),
            version: "test".to_string(),
        }
    }

    fn test_auth() -> AuthContext {
        AuthContext {
            token: Token {
                id: 1,
                digest: String::new(),
                name: "agent".into(),
                rate_limit: 100,
                created_at: Utc::now(),
                last_used_at: None,
                revoked_at: None,
            },
            digest: "digest".into(),
        }
    }

    #[tokio::test]
    async fn health_reports_ok() {
        let state = test_state();
        let Json(resp) = health(State(state)).await;
        assert_eq!(resp.status, "ok");
        assert_eq!(resp.version, "test");
    }

    #[tokio::test]
    async fn status_without_session_is_disconnected() {
        let state = test_state();
        let Json(resp) = status(State(state), Extension(test_auth())).await;
        assert!(!resp.connected);
        assert!(resp.last_seen.is_none());
        assert!(resp.tab_count.is_none());
    }

    #[tokio::test]
    async fn tabs_without_session_is_offline() {
        let state = test_state();
        let err = tabs(State(state), Extension(test_auth()))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "EXTENSION_OFFLINE");
        assert_eq!(err.status_code(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn command_rejects_bad_json() {
        let state = test_state();
        let err = command(
            State(state),
            Extension(test_auth()),
            Bytes::from_static(b"not json"),
        )
        .await
        .unwrap_err();
        assert_eq!(err.code(), "INVALID_REQUEST");
    }

    #[tokio::test]
    async fn command_requires_tab_id() {
        let state = test_state();
        let body = br##"{"action":{"kind":"click","selector":"#go"}}"##;
        let err = command(
            State(state),
            Extension(test_auth()),
            Bytes::from_static(body),
        )
        .await
        .unwrap_err();
        assert_eq!(err.code(), "INVALID_REQUEST");
    }

    #[tokio::test]
    async fn command_rejects_unknown_action_kind() {
        let state = test_state();
        let body = br#"{"tabId":"t1","action":{"kind":"evaluate","script":"1"}}"#;
        let err = command(
            State(state),
            Extension(test_auth()),
            Bytes::from_static(body),
        )
        .await
        .unwrap_err();
        assert_eq!(err.code(), "INVALID_REQUEST");
    }

    #[tokio::test]
    async fn screenshot_requires_tab_id() {
        let state = test_state();
        let err = screenshot(
            State(state),
            Extension(test_auth()),
            Bytes::from_static(b"{}"),
        )
        .await
        .unwrap_err();
        assert_eq!(err.code(), "INVALID_REQUEST");
    }

    #[test]
    fn error_statuses_and_codes() {
        assert_eq!(
            ApiError::Unauthorized.status_code(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            ApiError::Hub(HubError::Offline).status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            ApiError::Hub(HubError::Backpressured).status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            ApiError::Hub(HubError::Timeout).status_code(),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(ApiError::Hub(HubError::Timeout).code(), "TIMEOUT");
        assert_eq!(
            ApiError::FileTooLarge.status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::Internal("boom".into()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        let command = ApiError::Command {
            code: "ELEMENT_NOT_FOUND".into(),
            message: "no".into(),
        };
        assert_eq!(command.code(), "ELEMENT_NOT_FOUND");
        assert_eq!(command.status_code(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn rate_limited_response_carries_retry_after_header() {
        let response = ApiError::RateLimited {
            retry_after_secs: 7,
        }
        .into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            response.headers().get(header::RETRY_AFTER).unwrap(),
            &HeaderValue::from_static("7")
        );
    }

    #[test]
    fn backpressure_maps_to_retryable_offline() {
        let err = ApiError::Hub(HubError::Backpressured);
        assert_eq!(err.code(), "EXTENSION_OFFLINE");
        assert_eq!(err.retry_after_secs(), Some(1));
    }

    #[tokio::test]
    async fn screenshot_serving_rejects_traversal() {
        let state = test_state();
        let response = serve_screenshot(
            State(state),
            Path("../../etc/passwd".to_string()),
        )
        .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn content_types_by_extension() {
        assert_eq!(content_type_for("a.png"), "image/png");
        assert_eq!(content_type_for("a.jpeg"), "image/jpeg");
        assert_eq!(content_type_for("weird"), "application/octet-stream");
    }
}

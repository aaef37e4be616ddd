//! Bearer-token authentication and per-token rate limiting.
//!
//! Both run as axum middleware on the `/api/v1` subtree, auth first. Every
//! authentication failure, from a missing header through a revoked token to
//! a store fault, surfaces as the same 401 body so callers cannot probe
//! which stage rejected them; the logs distinguish.

use axum::extract::{Request, State};
use axum::http::{header, HeaderMap};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use tabrelay_core::ratelimit::Decision;
use tabrelay_core::token::{hash_token, Token, TOKEN_PREFIX};
use tracing::{debug, warn};

use crate::handlers::ApiError;
use crate::server::AppState;

/// The authenticated token, attached to request extensions by
/// [`require_auth`].
#[derive(Debug, Clone)]
pub struct AuthContext {
    /// The validated token row.
    pub token: Token,
    /// Digest of the presented plaintext, the hub session key.
    pub digest: String,
}

/// Extracts a bearer credential from the `Authorization` header.
#[must_use]
pub fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let raw = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, value) = raw.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    Some(value.to_string())
}

/// Authentication middleware for the REST surface.
pub async fn require_auth(State(state): State<AppState>, mut req: Request, next: Next) -> Response {
    let Some(plaintext) = bearer_token(req.headers()) else {
        debug!("missing or malformed authorization header");
        return ApiError::Unauthorized.into_response();
    };

    // Malformed prefixes never touch the store.
    if !plaintext.starts_with(TOKEN_PREFIX) {
        debug!("bearer credential without token prefix");
        return ApiError::Unauthorized.into_response();
    }

    match state.tokens.validate(&plaintext) {
        Ok(Some(token)) => {
            let digest = hash_token(&plaintext);

            // Last-used stamping is best-effort and happens off the request
            // path.
            let store = state.tokens.clone();
            let id = token.id;
            tokio::spawn(async move {
                if let Err(err) = store.touch_last_used(id) {
                    debug!(id, error = %err, "failed to stamp last-used");
                }
            });

            req.extensions_mut().insert(AuthContext { token, digest });
            next.run(req).await
        }
        Ok(None) => {
            debug!("unknown or revoked token");
            ApiError::Unauthorized.into_response()
        }
        Err(err) => {
            warn!(error = %err, "token validation failed");
            ApiError::Unauthorized.into_response()
        }
    }
}

/// Rate-limit middleware. Runs after [`require_auth`], keyed by token id.
pub async fn enforce_rate_limit(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Response {
    let Some(auth) = req.extensions().get::<AuthContext>() else {
        // No auth context means require_auth already rejected or this route
        // is misconfigured; either way there is nothing to meter.
        return next.run(req).await;
    };

    let limit = if auth.token.rate_limit > 0 {
        auth.token.rate_limit
    } else {
        state.config.default_rate_limit
    };

    match state.limiter.check(auth.token.id, limit) {
        Decision::Allowed => next.run(req).await,
        Decision::Denied { retry_after_secs } => {
            warn!(
                token_id = auth.token.id,
                limit, retry_after_secs, "rate limit exceeded"
            );
            ApiError::RateLimited { retry_after_secs }.into_response()
        }
    }
}

//! Admin HTTP API.
//!
//! Bearer-authenticated JSON endpoints over the core's read and preference
//! surfaces: 401 on bad credentials, 404 on absent resources, 409 on write
//! conflicts, 429 with retry-after past the rate limit.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use sha2::{Digest, Sha256};

use fabula_store::{collections, StoreError};
use fabula_users::{UserState, UserView};

use crate::app::Core;

/// Requests allowed per minute across the admin API.
const API_RATE_LIMIT: u32 = 60;

/// Fixed-window limiter; coarse but sufficient for an internal API.
pub struct ApiRateLimit {
    window: Mutex<(Instant, u32)>,
}

impl ApiRateLimit {
    pub fn new() -> Self {
        Self {
            window: Mutex::new((Instant::now(), 0)),
        }
    }

    /// None when allowed, otherwise seconds to wait.
    fn check(&self) -> Option<u64> {
        let mut guard = self.window.lock().unwrap();
        let (start, count) = *guard;
        if start.elapsed() >= Duration::from_secs(60) {
            *guard = (Instant::now(), 1);
            return None;
        }
        if count < API_RATE_LIMIT {
            guard.1 = count + 1;
            return None;
        }
        Some(60u64.saturating_sub(start.elapsed().as_secs()).max(1))
    }
}

impl Default for ApiRateLimit {
    fn default() -> Self {
        Self::new()
    }
}

pub enum ApiError {
    Unauthorized,
    NotFound,
    Conflict,
    RateLimited(u64),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                Json(json!({"error": "unauthorized"})),
            )
                .into_response(),
            ApiError::NotFound => {
                (StatusCode::NOT_FOUND, Json(json!({"error": "not_found"}))).into_response()
            }
            ApiError::Conflict => {
                (StatusCode::CONFLICT, Json(json!({"error": "conflict"}))).into_response()
            }
            ApiError::RateLimited(retry_after) => (
                StatusCode::TOO_MANY_REQUESTS,
                [("retry-after", retry_after.to_string())],
                Json(json!({"error": "rate_limited"})),
            )
                .into_response(),
            ApiError::Internal(detail) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": "internal", "detail": detail})),
            )
                .into_response(),
        }
    }
}

/// Constant-time bearer check: compares SHA-256 digests so the comparison
/// length never depends on the secret.
fn authorize(core: &Core, headers: &HeaderMap) -> Result<(), ApiError> {
    let secret = &core.config.api.jwt_secret;
    if secret.is_empty() {
        return Err(ApiError::Unauthorized);
    }
    let presented = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or(ApiError::Unauthorized)?;

    let a = Sha256::digest(presented.as_bytes());
    let b = Sha256::digest(secret.as_bytes());
    if a == b {
        Ok(())
    } else {
        Err(ApiError::Unauthorized)
    }
}

fn gate(core: &Core, headers: &HeaderMap) -> Result<(), ApiError> {
    if let Some(retry) = core.api_limiter.check() {
        return Err(ApiError::RateLimited(retry));
    }
    authorize(core, headers)
}

/// GET /health (no auth; consumed by orchestration probes).
pub async fn health(State(core): State<Arc<Core>>) -> impl IntoResponse {
    let stores = core.stores.health();
    let snapshot = core.health.snapshot();
    let healthy = stores.document && stores.relational;
    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(json!({
            "status": if healthy { "ok" } else { "degraded" },
            "stores": stores,
            "dependencies": snapshot,
            "bus": {
                "breaker": core.bus.breaker().state().as_str(),
                "queued": core.bus.queued_len(),
                "counters": core.bus.counters.snapshot(),
            },
        })),
    )
}

/// GET /api/v1/user/{id}/state
pub async fn user_state(
    State(core): State<Arc<Core>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    gate(&core, &headers)?;
    match core.registry.get(&id) {
        Ok(UserView::Complete(user)) => Ok(Json(json!({
            "profile": user.profile,
            "state": user.state,
            "partial": false,
        }))
        .into_response()),
        Ok(UserView::Partial { profile, state }) => {
            if profile.is_none() && state.is_none() {
                Err(ApiError::NotFound)
            } else {
                // One store is missing its half; report what exists rather
                // than pretending the user is gone.
                Ok(Json(json!({
                    "profile": profile,
                    "state": state,
                    "partial": true,
                }))
                .into_response())
            }
        }
        Err(e) => Err(ApiError::Internal(e.to_string())),
    }
}

/// PUT /api/v1/user/{id}/preferences
///
/// Accepts `language`, `menu_context`, and `worthiness` (the analysis
/// module's write path). One optimistic attempt; a concurrent writer yields
/// 409 and the caller retries with fresh state.
pub async fn put_preferences(
    State(core): State<Arc<Core>>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<serde_json::Value>,
) -> Result<Response, ApiError> {
    gate(&core, &headers)?;

    let doc = core
        .docs
        .get(collections::USERS, &id)
        .map_err(|e| ApiError::Internal(e.to_string()))?
        .ok_or(ApiError::NotFound)?;
    let mut state: UserState =
        serde_json::from_value(doc.body).map_err(|e| ApiError::Internal(e.to_string()))?;

    if let Some(context) = body.get("menu_context").and_then(|v| v.as_str()) {
        state.menu_context = Some(context.to_string());
    }
    if let Some(worthiness) = body.get("worthiness").and_then(|v| v.as_f64()) {
        state.worthiness = worthiness.clamp(0.0, 1.0);
    }
    if let Some(language) = body.get("language").and_then(|v| v.as_str()) {
        // Language lives on the profile; delegate so both stores agree.
        core.registry
            .set_language(&id, language)
            .map_err(|e| ApiError::Internal(e.to_string()))?;
    }

    let value = serde_json::to_value(&state).map_err(|e| ApiError::Internal(e.to_string()))?;
    match core
        .docs
        .compare_and_put(collections::USERS, &id, doc.version, &value)
    {
        Ok(_) => Ok(Json(json!({"ok": true})).into_response()),
        Err(StoreError::VersionConflict { .. }) => Err(ApiError::Conflict),
        Err(e) => Err(ApiError::Internal(e.to_string())),
    }
}

/// GET /api/v1/user/{id}/subscription
pub async fn user_subscription(
    State(core): State<Arc<Core>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    gate(&core, &headers)?;
    match core.subscriptions.active(&id) {
        Ok(Some(subscription)) => Ok(Json(json!(subscription)).into_response()),
        Ok(None) => Err(ApiError::NotFound),
        Err(e) => Err(ApiError::Internal(e.to_string())),
    }
}

/// GET /api/v1/narrative/{fragment_id}
pub async fn fragment(
    State(core): State<Arc<Core>>,
    Path(fragment_id): Path<String>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    gate(&core, &headers)?;
    match core.engine.fragment(&fragment_id) {
        Ok(fragment) => Ok(Json(json!(fragment)).into_response()),
        Err(e) if e.code() == "NOT_FOUND" => Err(ApiError::NotFound),
        Err(e) => Err(ApiError::Internal(e.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limit_window_allows_then_blocks() {
        let limiter = ApiRateLimit::new();
        for _ in 0..API_RATE_LIMIT {
            assert!(limiter.check().is_none());
        }
        let wait = limiter.check().expect("over the limit");
        assert!(wait >= 1);
    }
}

//! HTTP request surface and the real-time event transport.

pub mod handlers;
pub mod ws;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use axum::extract::{Request, State};
use axum::http::{HeaderMap, Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};
use serde_json::json;
use tower_http::trace::TraceLayer;

use crate::config::AppConfig;
use crate::credentials::{CredentialError, CryptoError, SharedCredentialStore};
use crate::events::SharedEventHub;
use crate::orchestrator::{OrchestratorError, SharedOrchestrator};
use crate::state::{SharedSessionStore, StoreError};

/// Header carrying the authenticated caller identity, populated by the
/// out-of-scope auth layer in front of this service.
pub const USER_HEADER: &str = "x-user-email";

/// Shared application state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub store: SharedSessionStore,
    pub credentials: SharedCredentialStore,
    pub orchestrator: SharedOrchestrator,
    pub hub: SharedEventHub,
    pub config: Arc<AppConfig>,
    pub limiter: Arc<RateLimiter>,
}

/// Build the full application router.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(handlers::healthz))
        .route("/session", post(handlers::create_session))
        .route("/sessions", get(handlers::list_sessions))
        .route("/session/{id}", get(handlers::get_session))
        .route("/session/{id}", delete(handlers::delete_session))
        .route("/session/{id}/start", post(handlers::start_session))
        .route("/session/{id}/step", post(handlers::step_session))
        .route("/session/{id}/stop", post(handlers::stop_session))
        .route(
            "/session/{id}/reset-memory/{persona_id}",
            post(handlers::reset_memory),
        )
        .route("/session/{id}/messages", get(handlers::list_messages))
        .route(
            "/session/{id}/feedback-rounds",
            get(handlers::list_feedback_rounds),
        )
        .route("/session/{id}/feedback", post(handlers::attach_feedback))
        .route(
            "/session/{id}/iterate-with-feedback",
            post(handlers::iterate_with_feedback),
        )
        .route("/models", get(handlers::list_models))
        .route("/models", post(handlers::create_model))
        .route("/models/{id}", put(handlers::update_model))
        .route("/models/{id}", delete(handlers::delete_model))
        .route("/ws", get(ws::ws_handler))
        .layer(middleware::from_fn_with_state(state.clone(), rate_limit))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Read the authenticated user identity from request headers.
pub fn user_from_headers(headers: &HeaderMap) -> Result<String, ApiError> {
    headers
        .get(USER_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.trim().is_empty())
        .map(String::from)
        .ok_or_else(|| ApiError::bad_request(format!("missing {} header", USER_HEADER)))
}

// =============================================================================
// Error mapping
// =============================================================================

/// API-facing error: a status code plus a `{"error": ...}` body.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        let status = match &e {
            StoreError::NotFound(_) => StatusCode::NOT_FOUND,
            StoreError::Conflict(_) => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            message: e.to_string(),
        }
    }
}

impl From<CryptoError> for ApiError {
    fn from(e: CryptoError) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: e.to_string(),
        }
    }
}

impl From<CredentialError> for ApiError {
    fn from(e: CredentialError) -> Self {
        match e {
            CredentialError::Store(e) => e.into(),
            CredentialError::Crypto(e) => e.into(),
        }
    }
}

impl From<OrchestratorError> for ApiError {
    fn from(e: OrchestratorError) -> Self {
        match e {
            OrchestratorError::Store(e) => e.into(),
            OrchestratorError::Credential(e) => e.into(),
            OrchestratorError::MissingKeys(_) => Self::bad_request(e.to_string()),
            OrchestratorError::Validation(_) => Self::bad_request(e.to_string()),
            OrchestratorError::InvalidState(_) => Self {
                status: StatusCode::CONFLICT,
                message: e.to_string(),
            },
        }
    }
}

// =============================================================================
// Rate limiting
// =============================================================================

/// Fixed-window rate limiter keyed by caller identity.
pub struct RateLimiter {
    permit_limit: u32,
    window: Duration,
    windows: Mutex<HashMap<String, (Instant, u32)>>,
}

impl RateLimiter {
    pub fn new(permit_limit: u32, window: Duration) -> Self {
        Self {
            permit_limit,
            window,
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// Take one permit for `key`; false when the window is exhausted.
    pub fn check(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut windows = self.windows.lock().expect("rate limiter lock poisoned");
        let entry = windows.entry(key.to_string()).or_insert((now, 0));
        if now.duration_since(entry.0) >= self.window {
            *entry = (now, 0);
        }
        if entry.1 >= self.permit_limit {
            return false;
        }
        entry.1 += 1;
        true
    }
}

/// Middleware applying the fixed-window limit to mutating requests.
async fn rate_limit(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let mutating = !matches!(*request.method(), Method::GET | Method::HEAD);
    if mutating {
        let key = request
            .headers()
            .get(USER_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("anonymous")
            .to_string();
        if !state.limiter.check(&key) {
            return ApiError {
                status: StatusCode::TOO_MANY_REQUESTS,
                message: "rate limit exceeded".to_string(),
            }
            .into_response();
        }
    }
    next.run(request).await
}

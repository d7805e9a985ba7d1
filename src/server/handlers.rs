//! JSON request handlers.

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::credentials::ModelRegistration;
use crate::orchestrator::ReiterateRequest;
use crate::state::{
    ConfiguredModel, FeedbackRound, Message, PersonaConfig, Provider, ReviewerConfig, RunMode,
    Session,
};

use super::{user_from_headers, ApiError, AppState};

/// Liveness probe.
pub async fn healthz() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

// =============================================================================
// Sessions
// =============================================================================

/// Body for `POST /session`. Unset options fall back to server defaults.
#[derive(Debug, Deserialize)]
pub struct CreateSessionRequest {
    pub name: String,
    #[serde(default)]
    pub topic: String,
    pub max_iterations: Option<u32>,
    pub stop_marker: Option<String>,
    pub stop_on_reviewer_approved: Option<bool>,
    pub run_mode: Option<RunMode>,
    pub creator: PersonaConfig,
    pub reviewers: Vec<ReviewerConfig>,
}

pub async fn create_session(
    State(state): State<AppState>,
    Json(request): Json<CreateSessionRequest>,
) -> Result<(StatusCode, Json<Session>), ApiError> {
    let defaults = &state.config.orchestration;
    let session = Session::new(
        request.name,
        request.topic,
        request
            .max_iterations
            .unwrap_or(defaults.default_max_iterations),
        request
            .stop_marker
            .unwrap_or_else(|| defaults.default_stop_marker.clone()),
        request
            .stop_on_reviewer_approved
            .unwrap_or(defaults.stop_on_reviewer_approved),
        request.run_mode.unwrap_or(RunMode::Auto),
        request.creator,
        request.reviewers,
    );
    session.validate().map_err(ApiError::bad_request)?;
    state.store.create_session(&session)?;
    Ok((StatusCode::CREATED, Json(session)))
}

pub async fn get_session(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Session>, ApiError> {
    Ok(Json(state.store.get_session(id)?))
}

pub async fn list_sessions(
    State(state): State<AppState>,
) -> Result<Json<Vec<Session>>, ApiError> {
    Ok(Json(state.store.list_sessions()?))
}

pub async fn start_session(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let user = user_from_headers(&headers)?;
    state.orchestrator.start(&user, id, RunMode::Auto).await?;
    Ok((StatusCode::ACCEPTED, Json(json!({ "status": "running" }))))
}

pub async fn step_session(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let user = user_from_headers(&headers)?;
    state.orchestrator.start(&user, id, RunMode::Step).await?;
    Ok((StatusCode::ACCEPTED, Json(json!({ "status": "stepping" }))))
}

pub async fn stop_session(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Value>, ApiError> {
    state.orchestrator.stop(id)?;
    Ok(Json(json!({ "status": "stopping" })))
}

pub async fn delete_session(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    state.orchestrator.delete(id)?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn reset_memory(
    State(state): State<AppState>,
    Path((id, persona_id)): Path<(Uuid, String)>,
) -> Result<Json<Value>, ApiError> {
    state.orchestrator.reset_memory(id, &persona_id)?;
    Ok(Json(json!({ "status": "reset" })))
}

pub async fn list_messages(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<Message>>, ApiError> {
    // Existence check so unknown sessions 404 instead of returning [].
    state.store.get_session(id)?;
    Ok(Json(state.store.list_messages(id)?))
}

// =============================================================================
// Feedback
// =============================================================================

pub async fn list_feedback_rounds(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<FeedbackRound>>, ApiError> {
    state.store.get_session(id)?;
    Ok(Json(state.store.list_feedback_rounds(id)?))
}

/// Body for `POST /session/{id}/feedback`.
#[derive(Debug, Deserialize)]
pub struct AttachFeedbackRequest {
    pub iteration: u32,
    pub feedback: String,
}

pub async fn attach_feedback(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(request): Json<AttachFeedbackRequest>,
) -> Result<Json<Value>, ApiError> {
    if request.feedback.trim().is_empty() {
        return Err(ApiError::bad_request("feedback must not be empty"));
    }
    state
        .store
        .set_user_feedback(id, request.iteration, &request.feedback)?;
    Ok(Json(json!({ "status": "recorded" })))
}

pub async fn iterate_with_feedback(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
    Json(request): Json<ReiterateRequest>,
) -> Result<(StatusCode, Json<Session>), ApiError> {
    let user = user_from_headers(&headers)?;
    let session = state
        .orchestrator
        .iterate_with_feedback(&user, id, request)
        .await?;
    Ok((StatusCode::ACCEPTED, Json(session)))
}

// =============================================================================
// Model roster
// =============================================================================

/// Model registration as echoed to clients. Keys are write-only: only their
/// presence is reported.
#[derive(Debug, Serialize)]
pub struct ModelView {
    pub id: Uuid,
    pub model_name: String,
    pub display_name: Option<String>,
    pub endpoint: String,
    pub provider: Provider,
    pub has_key: bool,
}

impl From<ConfiguredModel> for ModelView {
    fn from(model: ConfiguredModel) -> Self {
        Self {
            id: model.id,
            model_name: model.model_name,
            display_name: model.display_name,
            endpoint: model.endpoint,
            provider: model.provider,
            has_key: model.encrypted_key.is_some(),
        }
    }
}

/// Body for model create/update.
#[derive(Deserialize)]
pub struct ModelRequest {
    pub model_name: String,
    pub display_name: Option<String>,
    pub endpoint: String,
    pub provider: Provider,
    /// Plaintext key; never echoed back. On update, `None` keeps the
    /// stored key.
    pub api_key: Option<String>,
}

impl ModelRequest {
    fn validate(&self, state: &AppState) -> Result<ModelRegistration, ApiError> {
        if self.model_name.trim().is_empty() {
            return Err(ApiError::bad_request("model_name must not be empty"));
        }
        // A blank endpoint falls back to the deployment's preset for this
        // model, when one is configured.
        let endpoint = if self.endpoint.trim().is_empty() {
            state
                .config
                .preset_for(&self.model_name)
                .map(|preset| preset.endpoint.clone())
                .unwrap_or_default()
        } else {
            self.endpoint.clone()
        };
        Ok(ModelRegistration {
            model_name: self.model_name.clone(),
            display_name: self.display_name.clone(),
            endpoint,
            provider: self.provider,
            api_key: self.api_key.clone(),
        })
    }
}

pub async fn list_models(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Vec<ModelView>>, ApiError> {
    let user = user_from_headers(&headers)?;
    let models = state.credentials.list(&user)?;
    Ok(Json(models.into_iter().map(ModelView::from).collect()))
}

pub async fn create_model(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<ModelRequest>,
) -> Result<(StatusCode, Json<ModelView>), ApiError> {
    let user = user_from_headers(&headers)?;
    let registration = request.validate(&state)?;
    let model = state.credentials.add(&user, registration)?;
    Ok((StatusCode::CREATED, Json(model.into())))
}

pub async fn update_model(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
    Json(request): Json<ModelRequest>,
) -> Result<Json<ModelView>, ApiError> {
    let user = user_from_headers(&headers)?;
    let registration = request.validate(&state)?;
    let model = state.credentials.update(&user, id, registration)?;
    Ok(Json(model.into()))
}

pub async fn delete_model(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
) -> Result<StatusCode, ApiError> {
    let user = user_from_headers(&headers)?;
    state.credentials.delete(&user, id)?;
    Ok(StatusCode::NO_CONTENT)
}

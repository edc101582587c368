//! Control API route handlers.
//!
//! All endpoints return JSON. Handlers are thin: they call straight into
//! the scheduler, governor, orchestrator or store.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::engine::executor::CancelOutcome;
use crate::engine::scheduler::BotScheduler;
use crate::types::{BotState, CycleSummary, EngineError, ExecutionRecord, UserTradingConfig};

/// Shared state accessible by all route handlers.
pub struct ApiState {
    pub scheduler: Arc<BotScheduler>,
}

pub type AppState = Arc<ApiState>;

const DEFAULT_HISTORY: usize = 50;
const MAX_HISTORY: usize = 500;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

/// An error with the HTTP status it maps to.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        let status = match &e {
            EngineError::ConfigMissing { .. } => StatusCode::NOT_FOUND,
            EngineError::CycleInProgress { .. } => StatusCode::CONFLICT,
            EngineError::InvalidConfig(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, e.to_string())
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(e: anyhow::Error) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, format!("{e:#}"))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            warn!(status = %self.status, error = %self.message, "API request failed");
        }
        (self.status, Json(ErrorBody { error: self.message })).into_response()
    }
}

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct CancelResponse {
    pub execution_id: Uuid,
    pub outcome: &'static str,
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub limit: Option<usize>,
}

// ---------------------------------------------------------------------------
// Route handlers
// ---------------------------------------------------------------------------

/// GET /health
pub async fn health() -> StatusCode {
    StatusCode::OK
}

/// POST /api/users/:id/cycle
pub async fn run_cycle(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Result<Json<CycleSummary>, ApiError> {
    info!(user_id = %user_id, "Manual cycle requested");
    let summary = state.scheduler.run_cycle(&user_id).await?;
    Ok(Json(summary))
}

/// GET /api/users/:id/state
pub async fn get_state(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Result<Json<BotState>, ApiError> {
    if state.scheduler.store().user_config(&user_id).await?.is_none() {
        return Err(EngineError::ConfigMissing { user_id }.into());
    }
    let bot = state.scheduler.governor().bot_state(&user_id, Utc::now()).await?;
    Ok(Json(bot))
}

/// GET /api/users/:id/executions?limit=N
pub async fn get_executions(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Vec<ExecutionRecord>>, ApiError> {
    let limit = query.limit.unwrap_or(DEFAULT_HISTORY).min(MAX_HISTORY);
    let records = state.scheduler.store().executions_for_user(&user_id, limit).await?;
    Ok(Json(records))
}

/// PUT /api/users/:id/config
///
/// The path id wins over any `user_id` in the body.
pub async fn put_config(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    Json(mut config): Json<UserTradingConfig>,
) -> Result<Json<UserTradingConfig>, ApiError> {
    config.user_id = user_id;
    config.validate()?;
    state.scheduler.store().save_user_config(&config).await?;
    info!(user_id = %config.user_id, enabled = config.is_enabled, symbols = config.symbols.len(), "User config updated");
    Ok(Json(config))
}

/// POST /api/executions/:id/cancel
pub async fn cancel_execution(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<(StatusCode, Json<CancelResponse>), ApiError> {
    let respond = |status: StatusCode, outcome: &'static str| -> Result<(StatusCode, Json<CancelResponse>), ApiError> {
        Ok((
            status,
            Json(CancelResponse {
                execution_id: id,
                outcome,
            }),
        ))
    };

    match state.scheduler.orchestrator().cancel(id) {
        CancelOutcome::Requested => respond(StatusCode::ACCEPTED, "requested"),
        CancelOutcome::TooLate => respond(StatusCode::CONFLICT, "too_late"),
        CancelOutcome::NotRunning => match state.scheduler.store().execution(id).await? {
            Some(record) if record.is_terminal() => respond(StatusCode::CONFLICT, "already_finished"),
            Some(_) => respond(StatusCode::CONFLICT, "not_running"),
            None => Err(ApiError::new(StatusCode::NOT_FOUND, format!("execution {id} not found"))),
        },
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

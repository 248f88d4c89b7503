//! Error kinds shared across the orchestration core (§7).
//!
//! Component errors (`StoreError`, `DecomposeError`, ...) are `thiserror`
//! enums carrying structured fields. `ApiError` is the HTTP-facing wrapper
//! that maps any of them to the `{detail: {error, ...}}` response shape.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use serde_json::json;

use crate::decompose::DecomposeError;
use crate::evaluate::EvaluatorError;
use crate::executor::ExecutorError;
use crate::scheduler::SchedulerError;
use crate::store::StoreError;

/// Top-level error used at the HTTP boundary. Wraps every component error
/// kind and knows how to render itself as the §6 error shape.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Decompose(#[from] DecomposeError),
    #[error(transparent)]
    Evaluator(#[from] EvaluatorError),
    #[error(transparent)]
    Executor(#[from] ExecutorError),
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
    #[error("validation error: {0}")]
    Validation(String),
}

#[derive(Serialize)]
struct ErrorBody {
    detail: serde_json::Value,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, detail) = match &self {
            ApiError::Validation(msg) => {
                (StatusCode::BAD_REQUEST, json!({"error": "validation", "message": msg}))
            }
            ApiError::Store(StoreError::NotFound(what)) => {
                (StatusCode::NOT_FOUND, json!({"error": "not_found", "what": what}))
            }
            ApiError::Store(StoreError::Conflict(msg)) => {
                (StatusCode::CONFLICT, json!({"error": "conflict", "message": msg}))
            }
            ApiError::Store(StoreError::Unavailable(msg)) => {
                (StatusCode::INTERNAL_SERVER_ERROR, json!({"error": "store_unavailable", "message": msg}))
            }
            ApiError::Scheduler(SchedulerError::CycleDetected { nodes, edges, names }) => (
                StatusCode::CONFLICT,
                json!({
                    "error": "cycle_detected",
                    "nodes": nodes,
                    "edges": edges,
                    "names": names,
                }),
            ),
            ApiError::Decompose(DecomposeError::Refused(msg)) => {
                (StatusCode::CONFLICT, json!({"error": "decomposition_refused", "message": msg}))
            }
            ApiError::Decompose(DecomposeError::BackendUnavailable(msg)) => {
                (StatusCode::INTERNAL_SERVER_ERROR, json!({"error": "backend_unavailable", "message": msg}))
            }
            ApiError::Evaluator(e) => {
                (StatusCode::INTERNAL_SERVER_ERROR, json!({"error": "evaluator_backend_error", "message": e.to_string()}))
            }
            ApiError::Executor(e) => {
                (StatusCode::INTERNAL_SERVER_ERROR, json!({"error": "executor_error", "message": e.to_string()}))
            }
        };
        (status, Json(ErrorBody { detail })).into_response()
    }
}

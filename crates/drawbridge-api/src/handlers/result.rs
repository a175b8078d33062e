use crate::error::ApiError;
use crate::state::AppState;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use drawbridge_core::models::TaskStatus;
use uuid::Uuid;

/// `GET /result/{id}`: 200 when done, 500 body when failed, 202 while the
/// task is still moving, 404 for unknown ids.
pub async fn result(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let Ok(id) = id.parse::<Uuid>() else {
        return ApiError::not_found("task not found").into_response();
    };

    match state.service.status(id).await {
        Ok(Some(status)) => {
            let code = match status.status {
                TaskStatus::Done => StatusCode::OK,
                TaskStatus::Failed => StatusCode::INTERNAL_SERVER_ERROR,
                _ => StatusCode::ACCEPTED,
            };
            (code, Json(status)).into_response()
        }
        Ok(None) => ApiError::not_found("task not found").into_response(),
        Err(e) => {
            tracing::error!(task_id = %id, error = %e, "status lookup failed");
            ApiError::internal("").into_response()
        }
    }
}

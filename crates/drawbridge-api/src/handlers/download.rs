use crate::error::ApiError;
use crate::service::DownloadError;
use crate::state::AppState;
use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use drawbridge_core::models::{StatusResponse, TaskStatus};
use drawbridge_core::TaskError;
use tokio_util::io::ReaderStream;
use uuid::Uuid;

/// `GET /download/{id}`: streams the produced PDF. 404 for unknown tasks,
/// 409 when the task failed, 425 while the result is not ready.
pub async fn download(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let Ok(id) = id.parse::<Uuid>() else {
        return ApiError::not_found("task not found").into_response();
    };

    let download = match state.service.download(id).await {
        Ok(download) => download,
        Err(DownloadError::Task(TaskError::NotFound)) => {
            return ApiError::not_found("task not found").into_response();
        }
        Err(DownloadError::Task(TaskError::Failed)) => {
            return (
                StatusCode::CONFLICT,
                Json(StatusResponse {
                    id,
                    status: TaskStatus::Failed,
                    download_url: None,
                    file_name: None,
                    error: Some("task failed".to_string()),
                }),
            )
                .into_response();
        }
        Err(DownloadError::Task(TaskError::NotReady)) => {
            return (
                StatusCode::TOO_EARLY,
                Json(StatusResponse {
                    id,
                    status: TaskStatus::Processing,
                    download_url: None,
                    file_name: None,
                    error: Some("result is not ready yet".to_string()),
                }),
            )
                .into_response();
        }
        Err(e) => {
            tracing::error!(task_id = %id, error = %e, "download failed");
            return ApiError::internal("cannot get result file").into_response();
        }
    };

    let body = Body::from_stream(ReaderStream::new(download.content));
    match Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/pdf")
        .header(header::CONTENT_LENGTH, download.size)
        .header(
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{}\"", download.file_name),
        )
        .body(body)
    {
        Ok(response) => response,
        Err(e) => {
            tracing::error!(task_id = %id, error = %e, "failed to build download response");
            ApiError::internal("cannot get result file").into_response()
        }
    }
}

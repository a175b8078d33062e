use crate::error::ApiError;
use crate::state::AppState;
use axum::extract::{Multipart, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use bytes::Bytes;
use drawbridge_core::models::ConvertAccepted;

const IDEMPOTENCY_KEY_HEADER: &str = "Idempotency-Key";

/// `POST /convert`: multipart form with a `file` field. Returns 202 with
/// the task id.
pub async fn convert(
    State(state): State<AppState>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Result<impl IntoResponse, ApiError> {
    let idempotency_key = headers
        .get(IDEMPOTENCY_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .filter(|key| !key.is_empty());

    let mut upload: Option<(String, Bytes)> = None;
    while let Some(field) = multipart.next_field().await.map_err(|e| {
        tracing::warn!(error = %e, "multipart parse failed");
        ApiError::bad_request("unable to parse multipart form")
    })? {
        if field.name() != Some("file") {
            continue;
        }
        let filename = field.file_name().unwrap_or_default().to_string();
        let data = field.bytes().await.map_err(|e| {
            tracing::warn!(error = %e, "multipart read failed");
            ApiError::bad_request("unable to parse multipart form")
        })?;
        upload = Some((filename, data));
        break;
    }

    let Some((filename, data)) = upload else {
        return Err(ApiError::bad_request("field `file` is required"));
    };

    tracing::debug!(
        file_name = %filename,
        size = data.len(),
        idempotency_key = idempotency_key.as_deref().unwrap_or_default(),
        "upload received"
    );

    let id = state.service.convert(data, &filename, idempotency_key).await?;

    Ok((StatusCode::ACCEPTED, Json(ConvertAccepted { id })))
}

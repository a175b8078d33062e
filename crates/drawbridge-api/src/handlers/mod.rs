mod convert;
mod download;
mod result;

use crate::state::AppState;
use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::Router;

pub fn router(state: AppState, max_upload_bytes: usize) -> Router {
    Router::new()
        .route("/convert", post(convert::convert))
        .route("/result/{id}", get(result::result))
        .route("/download/{id}", get(download::download))
        .layer(DefaultBodyLimit::max(max_upload_bytes))
        .with_state(state)
}

//! API routes for the photolab server

pub mod batch;
pub mod remove;
pub mod results;

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use bytes::Bytes;

use crate::config::ImageConfig;
use crate::error::{Error, Result};
use crate::imaging::{ImagePreparer, PreparedImage};
use crate::server::state::AppState;

/// Multipart framing allowance on top of the image bytes
const FORM_OVERHEAD_BYTES: usize = 1024 * 1024;

/// Build all API routes
pub fn api_routes(images: &ImageConfig) -> Router<AppState> {
    let single_upload_limit = images.max_upload_bytes.saturating_add(FORM_OVERHEAD_BYTES);

    Router::new()
        // Synchronous single image removal
        .route(
            "/remove-bg",
            post(remove::remove_background).layer(DefaultBodyLimit::max(single_upload_limit)),
        )
        // Async batch submission and polling
        .route(
            "/batch",
            post(batch::submit_batch).layer(DefaultBodyLimit::max(images.max_request_bytes())),
        )
        .route("/batch/:id", get(batch::get_batch_status))
        .route("/jobs", get(batch::queue_stats))
        // Signed downloads from the local object store
        .route("/results/*key", get(results::download_result))
        .route("/info", get(info))
}

/// Run image preparation off the async executor
pub(crate) async fn prepare_image(preparer: &ImagePreparer, data: Bytes) -> Result<PreparedImage> {
    let preparer = preparer.clone();
    tokio::task::spawn_blocking(move || preparer.prepare(&data))
        .await
        .map_err(|e| Error::internal(format!("Image preparation task failed: {}", e)))?
}

/// API info endpoint
async fn info() -> axum::Json<serde_json::Value> {
    axum::Json(serde_json::json!({
        "name": "photolab",
        "version": env!("CARGO_PKG_VERSION"),
        "description": "Background removal with synchronous and batch processing",
        "endpoints": {
            "POST /api/remove-bg": "Remove the background of one image (multipart 'image', optional 'mode')",
            "POST /api/batch": "Queue a batch (multipart 'files', optional 'mode' and 'timeout_secs')",
            "GET /api/batch/:id": "Poll batch state, progress and results",
            "GET /api/jobs": "Queue statistics",
            "GET /api/results/*key": "Download a stored result through a signed link"
        },
        "modes": ["quality", "fast"]
    }))
}

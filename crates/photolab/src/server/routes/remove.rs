//! Synchronous background removal endpoint

use axum::{
    extract::{Multipart, State},
    http::header,
    response::{IntoResponse, Response},
};
use std::time::Instant;

use crate::error::{Error, Result};
use crate::server::state::AppState;
use crate::types::Mode;

use super::prepare_image;

/// POST /api/remove-bg - Remove the background of one image and return the PNG
pub async fn remove_background(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Response> {
    let start = Instant::now();
    let mut upload = None;
    let mut mode = Mode::default();

    while let Some(field) = multipart.next_field().await? {
        let name = field.name().unwrap_or("").to_string();

        match name.as_str() {
            "mode" => mode = field.text().await?.parse()?,
            "image" | "file" => {
                let filename = field
                    .file_name()
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| "image.png".to_string());
                upload = Some((filename, field.bytes().await?));
            }
            other => tracing::debug!("Ignoring multipart field '{}'", other),
        }
    }

    let (filename, data) = upload.ok_or_else(|| Error::Multipart("missing 'image' field".to_string()))?;
    tracing::info!("Processing {} ({} bytes, mode {})", filename, data.len(), mode);

    let prepared = prepare_image(state.preparer(), data).await?;
    let output = state.providers().remove(&prepared.bytes, mode).await?;

    tracing::info!(
        "[{}] Background removed in {}ms",
        filename,
        start.elapsed().as_millis()
    );

    let stem = std::path::Path::new(&filename)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("image");
    let disposition = format!("inline; filename=\"{}_nobg.png\"", stem.replace('"', ""));

    Ok((
        [
            (header::CONTENT_TYPE, "image/png".to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        output,
    )
        .into_response())
}

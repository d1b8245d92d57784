//! Batch submission and job status endpoints

use axum::{
    extract::{Multipart, Path, State},
    http::StatusCode,
    Json,
};
use serde::Serialize;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::processing::QueueStats;
use crate::server::state::AppState;
use crate::types::{JobItem, JobState, JobStatusView, Mode};

use super::prepare_image;

/// Response from batch submission
#[derive(Debug, Serialize)]
pub struct BatchAccepted {
    pub job_id: Uuid,
    pub state: JobState,
    pub items: usize,
}

/// POST /api/batch - Queue a batch of images
///
/// Every image is prepared before anything is queued, so one bad upload
/// rejects the whole submission and no job is created.
pub async fn submit_batch(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<BatchAccepted>)> {
    let limit = state.config().images.max_batch_items;
    let mut uploads = Vec::new();
    let mut mode = Mode::default();
    let mut timeout_secs = None;

    while let Some(field) = multipart.next_field().await? {
        let name = field.name().unwrap_or("").to_string();

        match name.as_str() {
            "mode" => mode = field.text().await?.parse()?,
            "timeout_secs" => {
                let text = field.text().await?;
                let secs = text.trim().parse::<u64>().map_err(|_| {
                    Error::Multipart(format!("timeout_secs must be a number of seconds, got '{}'", text))
                })?;
                timeout_secs = Some(secs);
            }
            "files" | "files[]" => {
                if uploads.len() == limit {
                    return Err(Error::BatchTooLarge {
                        count: uploads.len() + 1,
                        limit,
                    });
                }
                let filename = field
                    .file_name()
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| format!("image_{}.png", uploads.len() + 1));
                let data = field.bytes().await?;
                uploads.push((filename, data));
            }
            other => tracing::debug!("Ignoring multipart field '{}'", other),
        }
    }

    if uploads.is_empty() {
        return Err(Error::EmptyBatch);
    }

    let mut items = Vec::with_capacity(uploads.len());
    for (filename, data) in uploads {
        let prepared = prepare_image(state.preparer(), data).await.map_err(|e| {
            tracing::warn!("Rejected batch upload {}: {}", filename, e);
            e
        })?;
        items.push(JobItem::new(filename, prepared.bytes));
    }

    let count = items.len();
    let timeout = state.config().queue.job_timeout(timeout_secs);
    let job_id = state.queue().enqueue(items, mode, timeout)?;

    Ok((
        StatusCode::ACCEPTED,
        Json(BatchAccepted {
            job_id,
            state: JobState::Queued,
            items: count,
        }),
    ))
}

/// GET /api/batch/:id - Get job state, progress and results
pub async fn get_batch_status(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Json<JobStatusView>> {
    let id = Uuid::parse_str(&job_id).map_err(|_| Error::JobNotFound(job_id.clone()))?;
    let job = state.queue().fetch(id)?;
    Ok(Json(job.into()))
}

/// GET /api/jobs - Queue statistics
pub async fn queue_stats(State(state): State<AppState>) -> Result<Json<QueueStats>> {
    Ok(Json(state.queue().stats()?))
}

//! Signed downloads from the local object store

use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
};
use serde::Deserialize;

use crate::error::Result;
use crate::providers::{LocalObjectStore, ObjectStore};
use crate::server::state::AppState;

/// Query parameters of a temporary link
#[derive(Debug, Deserialize)]
pub struct LinkParams {
    pub expires: i64,
    pub signature: String,
}

/// GET /api/results/*key - Serve a stored result while its link is valid
pub async fn download_result(
    State(state): State<AppState>,
    Path(key): Path<String>,
    Query(params): Query<LinkParams>,
) -> Result<Response> {
    let Some(store) = state.object_store() else {
        return Ok(StatusCode::NOT_FOUND.into_response());
    };
    let key = key.trim_start_matches('/');

    store.verify_link(key, params.expires, &params.signature)?;

    match store.get(key).await {
        Ok(bytes) => Ok((
            [(header::CONTENT_TYPE, LocalObjectStore::content_type(key))],
            bytes,
        )
            .into_response()),
        Err(e) => {
            tracing::warn!("Result {} unavailable: {}", key, e);
            Ok(StatusCode::NOT_FOUND.into_response())
        }
    }
}

//! Error types for the photolab service

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Result type alias for photolab operations
pub type Result<T> = std::result::Result<T, Error>;

/// Photolab errors
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Upload exceeds the configured byte ceiling
    #[error("Image is {size} bytes, limit is {limit} bytes")]
    PayloadTooLarge { size: usize, limit: usize },

    /// Request body cut off by the route's body limit
    #[error("Request body exceeds the upload limit")]
    BodyTooLarge,

    /// Input could not be decoded as an image, or the provider rejected it
    #[error("Invalid image: {0}")]
    InvalidImage(String),

    /// Batch submission without any image
    #[error("Batch contains no images")]
    EmptyBatch,

    /// Batch submission with more images than allowed
    #[error("Batch contains {count} images, limit is {limit}")]
    BatchTooLarge { count: usize, limit: usize },

    /// Unknown mode selector
    #[error("Unknown mode '{0}', expected 'quality' or 'fast'")]
    InvalidMode(String),

    /// Malformed multipart request
    #[error("Malformed upload: {0}")]
    Multipart(String),

    /// Unknown or expired job identifier
    #[error("Job not found: {0}")]
    JobNotFound(String),

    /// Removal provider could not be reached or answered with an error
    #[error("Removal provider unavailable: {0}")]
    ProviderUnavailable(String),

    /// Removal provider did not answer within its time budget
    #[error("Removal provider timed out after {0}s")]
    ProviderTimeout(u64),

    /// Removal provider answered without an image
    #[error("Removal provider returned an empty result")]
    EmptyResult,

    /// Object storage failure
    #[error("Storage error: {0}")]
    Storage(String),

    /// Temporary link is past its expiry
    #[error("Link expired")]
    LinkExpired,

    /// Temporary link signature does not match
    #[error("Invalid link signature")]
    InvalidSignature,

    /// Queue database error
    #[error("Queue database error: {0}")]
    Database(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP request error
    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    /// Image codec error
    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a database error
    pub fn database(message: impl Into<String>) -> Self {
        Self::Database(message.into())
    }

    /// Create a provider-unavailable error
    pub fn provider(message: impl Into<String>) -> Self {
        Self::ProviderUnavailable(message.into())
    }

    /// Create a storage error
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage(message.into())
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Whether the error was caused by the caller's input
    pub fn is_client_error(&self) -> bool {
        self.status_code().is_client_error()
    }

    fn status_code(&self) -> StatusCode {
        match self {
            Error::PayloadTooLarge { .. } | Error::BodyTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            Error::InvalidImage(_)
            | Error::EmptyBatch
            | Error::BatchTooLarge { .. }
            | Error::InvalidMode(_)
            | Error::Multipart(_)
            | Error::Json(_) => StatusCode::BAD_REQUEST,
            Error::JobNotFound(_) => StatusCode::NOT_FOUND,
            Error::LinkExpired | Error::InvalidSignature => StatusCode::FORBIDDEN,
            Error::ProviderUnavailable(_) | Error::EmptyResult | Error::Http(_) => {
                StatusCode::BAD_GATEWAY
            }
            Error::ProviderTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Error::Config(_)
            | Error::Storage(_)
            | Error::Database(_)
            | Error::Io(_)
            | Error::Image(_)
            | Error::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_type(&self) -> &'static str {
        match self {
            Error::Config(_) => "config_error",
            Error::PayloadTooLarge { .. } | Error::BodyTooLarge => "payload_too_large",
            Error::InvalidImage(_) => "invalid_image",
            Error::EmptyBatch => "empty_batch",
            Error::BatchTooLarge { .. } => "batch_too_large",
            Error::InvalidMode(_) => "invalid_mode",
            Error::Multipart(_) => "multipart_error",
            Error::JobNotFound(_) => "not_found",
            Error::ProviderUnavailable(_) => "provider_unavailable",
            Error::ProviderTimeout(_) => "provider_timeout",
            Error::EmptyResult => "empty_result",
            Error::Storage(_) => "storage_error",
            Error::LinkExpired => "link_expired",
            Error::InvalidSignature => "invalid_signature",
            Error::Database(_) => "queue_error",
            Error::Io(_) => "io_error",
            Error::Json(_) => "json_error",
            Error::Http(_) => "http_error",
            Error::Image(_) => "image_error",
            Error::Internal(_) => "internal_error",
        }
    }
}

impl From<axum::extract::multipart::MultipartError> for Error {
    fn from(err: axum::extract::multipart::MultipartError) -> Self {
        if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
            Error::BodyTooLarge
        } else {
            Error::Multipart(err.body_text())
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!("Request failed: {}", self);
        }

        let body = Json(json!({
            "error": {
                "type": self.error_type(),
                "message": self.to_string(),
            }
        }));

        (status, body).into_response()
    }
}

//! Error types shared by the pipeline, the stores and the HTTP layer.

use std::sync::OnceLock;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use regex::Regex;
use serde_json::json;
use thiserror::Error;
use tracing::error;

use crate::schema::StatusKind;

/// Failure reported by the generative model provider.
///
/// `status` is the HTTP status when the provider answered at all; transport
/// failures carry none.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct ProviderError {
    pub status: Option<u16>,
    pub message: String,
}

impl ProviderError {
    pub fn http(status: u16, message: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            message: message.into(),
        }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self {
            status: None,
            message: message.into(),
        }
    }

    /// Rate-limit class failures: HTTP 429, or a message saying the quota is
    /// exhausted. Everything else is fatal on first occurrence.
    pub fn is_rate_limited(&self) -> bool {
        if self.status == Some(429) {
            return true;
        }
        let message = self.message.to_lowercase().replace('_', " ");
        status_code_429().is_match(&message)
            || message.contains("resource exhausted")
            || message.contains("too many requests")
    }
}

fn status_code_429() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\b429\b").expect("429 pattern"))
}

/// Failure to pull a structured payload out of model output.
#[derive(Debug, Error)]
pub enum SanitizeError {
    #[error("no JSON object found in model response")]
    NoJsonObject,
    #[error("model response is not valid JSON: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Persistence failures, independent of the backing store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },
    #[error("invalid status transition from {from} to {to}")]
    InvalidTransition { from: StatusKind, to: StatusKind },
    #[error("documents can only be added while uploading (comparison is {status})")]
    NotUploading { status: StatusKind },
    #[error("storage backend error: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity,
            id: id.into(),
        }
    }
}

/// Every way a quote-processing run can fail. Each one is fatal to the run.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("GEMINI_API_KEY not configured")]
    MissingCredential,
    #[error("At least 2 documents are required for comparison (found {found})")]
    InsufficientDocuments { found: usize },
    #[error("Could not get URL for file: {file_name}")]
    StorageResolution { file_name: String },
    #[error("Failed to download {file_name}: {message}")]
    Download { file_name: String, message: String },
    #[error("model provider error: {0}")]
    Provider(#[from] ProviderError),
    #[error("Failed to extract data from {file_name}")]
    ExtractionFormat { file_name: String },
    #[error("Failed to generate comparison")]
    SynthesisFormat,
    #[error("model response is not valid JSON: {0}")]
    Parse(#[source] serde_json::Error),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Errors returned by HTTP handlers, rendered as `{ "error": message }`.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Not authenticated")]
    Unauthorized,
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    Conflict(String),
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Store(err) => store_status(err),
            Self::Pipeline(err) => match err {
                PipelineError::MissingCredential => StatusCode::SERVICE_UNAVAILABLE,
                PipelineError::InsufficientDocuments { .. } => StatusCode::BAD_REQUEST,
                PipelineError::Store(err) => store_status(err),
                PipelineError::StorageResolution { .. }
                | PipelineError::Download { .. }
                | PipelineError::Provider(_)
                | PipelineError::ExtractionFormat { .. }
                | PipelineError::SynthesisFormat
                | PipelineError::Parse(_) => StatusCode::BAD_GATEWAY,
            },
        }
    }
}

fn store_status(err: &StoreError) -> StatusCode {
    match err {
        StoreError::NotFound { .. } => StatusCode::NOT_FOUND,
        StoreError::InvalidTransition { .. } | StoreError::NotUploading { .. } => {
            StatusCode::CONFLICT
        }
        StoreError::Backend(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!("Request failed: {}", self);
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

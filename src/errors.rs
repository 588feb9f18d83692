//! Error types shared by the offers, the distribution layer and the
//! synchronization service, plus the HTTP wrapper used by the probe handlers.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::{fmt, io};
use thiserror::Error;

/// Coarse classification a caller uses to decide what to do with a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed or missing input. Fix the request, never retry it.
    InvalidArgument,
    /// Something required is absent.
    NotFound,
    /// A write-once object already holds other content, or a job is already running.
    Conflict,
    /// I/O, timeout, digest disagreement or backend failure. Retryable.
    Technical,
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("strategy `{0}` not found")]
    StrategyNotFound(String),
    #[error("offer `{0}` not found")]
    OfferNotFound(String),
    #[error("strategy `{0}` has no enabled offer")]
    NoOffer(String),
    #[error("object `{object_id}` not found in container `{container}`")]
    ObjectNotFound { container: String, object_id: String },
    #[error("staging object `{path}` not found in workspace container `{container}`")]
    StagingNotFound { container: String, path: String },
    #[error("object `{object_id}` already exists in container `{container}` with a different digest")]
    AlreadyExists { container: String, object_id: String },
    #[error("digest of `{object_id}` is not {expected}, refusing to delete it")]
    LiveDigestMismatch { object_id: String, expected: String },
    #[error("a synchronization is already running")]
    SynchronizationRunning,
    #[error("digest mismatch on `{object_id}`: expected {expected}, computed {actual}")]
    DigestMismatch {
        object_id: String,
        expected: String,
        actual: String,
    },
    #[error("size mismatch on `{object_id}`: declared {declared} bytes, received {actual}")]
    SizeMismatch {
        object_id: String,
        declared: u64,
        actual: u64,
    },
    #[error("offers disagree on the digest of `{object_id}`: {details}")]
    OffersDisagree { object_id: String, details: String },
    #[error("operation timed out after {timeout_ms} ms")]
    Timeout { timeout_ms: u64 },
    #[error("offer `{offer_id}`: {source}")]
    OfferFailed {
        offer_id: String,
        source: Box<StorageError>,
    },
    #[error("{0}")]
    Internal(String),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type StorageResult<T> = Result<T, StorageError>;

impl StorageError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    pub fn object_not_found(container: &str, object_id: &str) -> Self {
        Self::ObjectNotFound {
            container: container.to_string(),
            object_id: object_id.to_string(),
        }
    }

    /// Attribute this error to the offer that produced it.
    pub fn for_offer(self, offer_id: &str) -> Self {
        match self {
            already @ StorageError::OfferFailed { .. } => already,
            other => StorageError::OfferFailed {
                offer_id: offer_id.to_string(),
                source: Box::new(other),
            },
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            StorageError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            StorageError::StrategyNotFound(_)
            | StorageError::OfferNotFound(_)
            | StorageError::NoOffer(_)
            | StorageError::ObjectNotFound { .. }
            | StorageError::StagingNotFound { .. } => ErrorKind::NotFound,
            StorageError::AlreadyExists { .. }
            | StorageError::LiveDigestMismatch { .. }
            | StorageError::SynchronizationRunning => ErrorKind::Conflict,
            StorageError::OfferFailed { source, .. } => source.kind(),
            StorageError::DigestMismatch { .. }
            | StorageError::SizeMismatch { .. }
            | StorageError::OffersDisagree { .. }
            | StorageError::Timeout { .. }
            | StorageError::Internal(_)
            | StorageError::Sqlx(_)
            | StorageError::Io(_) => ErrorKind::Technical,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Technical
    }

    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }
}

/// A lightweight wrapper for errors returned by HTTP handlers.
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
}

impl AppError {
    /// Create a new AppError with a specific status and message.
    pub fn new(status: StatusCode, msg: impl Into<String>) -> Self {
        Self {
            status,
            message: msg.into(),
        }
    }

    /// Shortcut for 404 Not Found
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, msg)
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": self.message,
            "status": self.status.as_u16()
        }));

        (self.status, body).into_response()
    }
}

impl From<StorageError> for AppError {
    fn from(err: StorageError) -> Self {
        let status = match err.kind() {
            ErrorKind::InvalidArgument => StatusCode::BAD_REQUEST,
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::Conflict => StatusCode::CONFLICT,
            ErrorKind::Technical => StatusCode::INTERNAL_SERVER_ERROR,
        };
        AppError::new(status, err.to_string())
    }
}

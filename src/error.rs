//! Error types for the content server, the Crane front end and the client.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;
use tracing::warn;

/// Result type alias for server operations.
pub type Result<T> = std::result::Result<T, ServerError>;

/// Errors that can occur while managing, syncing or publishing repositories.
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Repository not found: {0}")]
    RepositoryNotFound(String),

    #[error("Repository already exists: {0}")]
    RepositoryExists(String),

    #[error("Distributor {distributor} not found on repository {repository}")]
    DistributorNotFound {
        repository: String,
        distributor: String,
    },

    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Upstream error: {0}")]
    Upstream(String),

    #[error("Digest mismatch: expected {expected}, computed {actual}")]
    DigestMismatch { expected: String, actual: String },
}

impl ServerError {
    pub fn status(&self) -> StatusCode {
        match self {
            ServerError::RepositoryNotFound(_)
            | ServerError::DistributorNotFound { .. }
            | ServerError::TaskNotFound(_) => StatusCode::NOT_FOUND,
            ServerError::RepositoryExists(_) => StatusCode::CONFLICT,
            ServerError::InvalidInput(_) | ServerError::Json(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            ServerError::RepositoryNotFound(_)
            | ServerError::DistributorNotFound { .. }
            | ServerError::TaskNotFound(_) => "PLP0009",
            ServerError::RepositoryExists(_) => "PLP0018",
            ServerError::InvalidInput(_) | ServerError::Json(_) => "PLP1008",
            ServerError::Upstream(_) | ServerError::Http(_) => "DKR1006",
            ServerError::DigestMismatch { .. } => "DKR1008",
            ServerError::Io(_) => "PLP0000",
        }
    }

    /// The `{code, description}` pair carried by failed task reports.
    pub fn to_report(&self) -> serde_json::Value {
        json!({
            "code": self.code(),
            "description": self.to_string(),
        })
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            warn!("{}", self);
        }
        let body = json!({
            "http_status": status.as_u16(),
            "error_message": self.to_string(),
            "error": self.to_report(),
        });
        (status, Json(body)).into_response()
    }
}

/// Errors served by the registry endpoints, rendered as Docker registry
/// error bodies.
#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("repository name not known to registry: {0}")]
    NameUnknown(String),

    #[error("manifest unknown: {0}")]
    ManifestUnknown(String),

    #[error("blob unknown to registry: {0}")]
    BlobUnknown(String),

    #[error(transparent)]
    Internal(#[from] ServerError),
}

impl RegistryError {
    fn code(&self) -> &'static str {
        match self {
            RegistryError::NameUnknown(_) => "NAME_UNKNOWN",
            RegistryError::ManifestUnknown(_) => "MANIFEST_UNKNOWN",
            RegistryError::BlobUnknown(_) => "BLOB_UNKNOWN",
            RegistryError::Internal(_) => "UNKNOWN",
        }
    }
}

impl IntoResponse for RegistryError {
    fn into_response(self) -> Response {
        let status = match self {
            RegistryError::Internal(ref e) => {
                warn!("{}", e);
                StatusCode::INTERNAL_SERVER_ERROR
            }
            _ => StatusCode::NOT_FOUND,
        };
        let body = json!({
            "errors": [{
                "code": self.code(),
                "message": self.to_string(),
            }]
        });
        (status, Json(body)).into_response()
    }
}

/// Errors returned by [`crate::client::ApiClient`] and
/// [`crate::client::CraneClient`].
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unexpected status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("task {task_id} failed: {error}")]
    TaskFailed {
        task_id: String,
        error: serde_json::Value,
    },

    #[error("task {task_id} did not finish after {attempts} polls")]
    TaskTimeout { task_id: String, attempts: u32 },
}

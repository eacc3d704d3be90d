use std::path::PathBuf;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Raw failure reported by the remote upload service before classification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFailure {
    /// HTTP-like status code, `None` when the request never got a response.
    pub status: Option<u16>,
    pub reason: String,
}

impl RemoteFailure {
    pub fn new(status: u16, reason: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            reason: reason.into(),
        }
    }

    pub fn connection(reason: impl Into<String>) -> Self {
        Self {
            status: None,
            reason: reason.into(),
        }
    }
}

impl std::fmt::Display for RemoteFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.status {
            Some(status) => write!(f, "status {}: {}", status, self.reason),
            None => write!(f, "connection failure: {}", self.reason),
        }
    }
}

#[derive(Error, Debug)]
pub enum UploadError {
    #[error("Authentication error: {0}")]
    Authentication(String),

    #[error("Quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("Transient service error: {0}")]
    TransientService(String),

    #[error("Permanent request error: {0}")]
    PermanentRequest(String),

    #[error("File operation '{operation}' failed for {}: {source}", path.display())]
    FileOperation {
        path: PathBuf,
        operation: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("Validation error ({field}): {message}")]
    Validation {
        field: String,
        message: String,
    },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Fieldless classification of [`UploadError`], used by retry policies and
/// recorded on failed items.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Authentication,
    QuotaExceeded,
    TransientService,
    PermanentRequest,
    FileOperation,
    Validation,
    Cancelled,
    Internal,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorKind::Authentication => "authentication",
            ErrorKind::QuotaExceeded => "quota_exceeded",
            ErrorKind::TransientService => "transient_service",
            ErrorKind::PermanentRequest => "permanent_request",
            ErrorKind::FileOperation => "file_operation",
            ErrorKind::Validation => "validation",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Internal => "internal",
        };
        f.write_str(name)
    }
}

impl UploadError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            UploadError::Authentication(_) => ErrorKind::Authentication,
            UploadError::QuotaExceeded(_) => ErrorKind::QuotaExceeded,
            UploadError::TransientService(_) => ErrorKind::TransientService,
            UploadError::PermanentRequest(_) => ErrorKind::PermanentRequest,
            UploadError::FileOperation { .. } => ErrorKind::FileOperation,
            UploadError::Validation { .. } => ErrorKind::Validation,
            UploadError::Cancelled => ErrorKind::Cancelled,
            UploadError::Internal(_) => ErrorKind::Internal,
        }
    }

    pub fn file_op(path: impl Into<PathBuf>, operation: &'static str, source: std::io::Error) -> Self {
        Self::FileOperation {
            path: path.into(),
            operation,
            source,
        }
    }

    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn auth(message: impl Into<String>) -> Self {
        Self::Authentication(message.into())
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Classifies a raw remote failure.
    ///
    /// Quota/rate-limit reasons win over the status code, so a `403` with a
    /// `quotaExceeded` reason is never retried as a transient fault.
    pub fn from_remote(failure: RemoteFailure) -> Self {
        let reason = failure.reason.to_lowercase();
        if reason.contains("quota") || reason.contains("ratelimitexceeded") {
            return UploadError::QuotaExceeded(failure.to_string());
        }

        match failure.status {
            None => UploadError::TransientService(failure.to_string()),
            Some(401) => UploadError::Authentication(failure.to_string()),
            Some(408) | Some(429) => UploadError::TransientService(failure.to_string()),
            Some(status) if status >= 500 => UploadError::TransientService(failure.to_string()),
            Some(_) => UploadError::PermanentRequest(failure.to_string()),
        }
    }
}

impl From<RemoteFailure> for UploadError {
    fn from(failure: RemoteFailure) -> Self {
        UploadError::from_remote(failure)
    }
}

impl From<reqwest::Error> for UploadError {
    fn from(err: reqwest::Error) -> Self {
        let failure = match err.status() {
            Some(status) => RemoteFailure::new(status.as_u16(), err.to_string()),
            None => RemoteFailure::connection(err.to_string()),
        };
        UploadError::from_remote(failure)
    }
}

impl From<serde_json::Error> for UploadError {
    fn from(err: serde_json::Error) -> Self {
        UploadError::Internal(format!("JSON error: {}", err))
    }
}

pub type Result<T, E = UploadError> = std::result::Result<T, E>;

use std::error::Error as StdError;
use std::fmt::{Display, Formatter, Result as FmtResult};

use thiserror::Error;

/// Common Result type for the crate with StorageError as the standard error.
pub type Result<T> = std::result::Result<T, StorageError>;

/// Error categories shared by every component.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// A syntactically malformed file id was passed to a driver operation
    InvalidId,
    /// A well-formed id has no corresponding object
    NotFound,
    /// The underlying store cannot be reached
    BackendUnavailable,
    /// The payload is a character string instead of bytes or a stream
    UnsupportedPayload,
    /// Invalid registry or driver configuration
    Configuration,
    /// Mutation attempted on an attachment that has already been persisted
    FrozenMutation,
    /// An HTTP conditional header failed to parse
    MalformedRequest,
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            ErrorKind::InvalidId => write!(f, "Invalid File Id"),
            ErrorKind::NotFound => write!(f, "Not Found"),
            ErrorKind::BackendUnavailable => write!(f, "Backend Unavailable"),
            ErrorKind::UnsupportedPayload => write!(f, "Unsupported Payload"),
            ErrorKind::Configuration => write!(f, "Configuration Error"),
            ErrorKind::FrozenMutation => write!(f, "Frozen Mutation"),
            ErrorKind::MalformedRequest => write!(f, "Malformed Request"),
        }
    }
}

/// Base error type carrying the failing store and file id when known.
#[derive(Error, Debug)]
#[error("{kind}: {message}")]
pub struct StorageError {
    /// Error category
    pub kind: ErrorKind,
    /// Name of the store the operation was issued against, if any
    pub store: Option<String>,
    /// File id involved in the operation, if any
    pub file_id: Option<String>,
    /// Descriptive message
    pub message: String,
    /// Source error
    #[source]
    pub source: Option<Box<dyn StdError + Send + Sync>>,
}

impl StorageError {
    pub fn new<S: Into<String>>(kind: ErrorKind, message: S) -> Self {
        Self {
            kind,
            store: None,
            file_id: None,
            message: message.into(),
            source: None,
        }
    }

    pub fn invalid_id<S: Into<String>>(file_id: S) -> Self {
        let id = file_id.into();
        Self {
            kind: ErrorKind::InvalidId,
            store: None,
            file_id: Some(id.clone()),
            message: format!("Invalid file id {}", id),
            source: None,
        }
    }

    pub fn not_found<S: Into<String>>(file_id: S) -> Self {
        let id = file_id.into();
        Self {
            kind: ErrorKind::NotFound,
            store: None,
            file_id: Some(id.clone()),
            message: format!("File {} not existing", id),
            source: None,
        }
    }

    pub fn backend<S: Into<String>>(message: S) -> Self {
        Self::new(ErrorKind::BackendUnavailable, message)
    }

    pub fn unsupported_payload() -> Self {
        Self::new(
            ErrorKind::UnsupportedPayload,
            "Only bytes or streams can be stored, not character strings",
        )
    }

    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::new(ErrorKind::Configuration, message)
    }

    pub fn frozen_mutation() -> Self {
        Self::new(ErrorKind::FrozenMutation, "Already saved files are immutable")
    }

    pub fn malformed_request<S: Into<String>>(message: S) -> Self {
        Self::new(ErrorKind::MalformedRequest, message)
    }

    /// Attaches the store name the operation was issued against.
    pub fn with_store<S: Into<String>>(mut self, store: S) -> Self {
        self.store = Some(store.into());
        self
    }

    /// Attaches the source error.
    pub fn with_source<E: StdError + Send + Sync + 'static>(mut self, source: E) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    /// HTTP status the serving layer answers with for this error.
    pub fn status_code(&self) -> axum::http::StatusCode {
        use axum::http::StatusCode;
        match self.kind {
            ErrorKind::InvalidId | ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::MalformedRequest => StatusCode::BAD_REQUEST,
            ErrorKind::BackendUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            ErrorKind::UnsupportedPayload
            | ErrorKind::Configuration
            | ErrorKind::FrozenMutation => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Error response body returned by the serving layer.
#[derive(serde::Serialize)]
pub struct ErrorResponse {
    pub status: String,
    pub message: String,
    pub error_type: String,
}

impl axum::response::IntoResponse for StorageError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status_code();
        let body = axum::Json(ErrorResponse {
            status: status.to_string(),
            message: self.message,
            error_type: self.kind.to_string(),
        });
        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;

    #[test]
    fn test_not_found_carries_file_id() {
        let err = StorageError::not_found("abc").with_store("default");
        assert_eq!(err.kind, ErrorKind::NotFound);
        assert_eq!(err.file_id.as_deref(), Some("abc"));
        assert_eq!(err.store.as_deref(), Some("default"));
    }

    #[test]
    fn test_http_mapping() {
        assert_eq!(
            StorageError::invalid_id("x").status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            StorageError::not_found("x").status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            StorageError::malformed_request("bad date").status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            StorageError::backend("down").status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }
}

use hyper::{Body, Response, StatusCode};
use serde::Serialize;
use thiserror::Error;

/// Unified relay error type.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Ingest not found: {name}")]
    IngestNotFound { name: String },

    #[error("Ingest with name {name} already exists")]
    IngestExists { name: String },

    #[error("Authentication failed")]
    AuthenticationFailed,

    #[error("Protocol error: {message}")]
    ProtocolError { message: String },

    #[error("Storage error: {source}")]
    StorageError {
        #[from]
        source: std::io::Error,
    },

    #[error("Configuration error: {message}")]
    ConfigError { message: String },

    #[error("Network error: {message}")]
    NetworkError { message: String },

    #[error("Codec error: {message}")]
    CodecError { message: String },

    #[error("Invalid request: {message}")]
    InvalidRequest { message: String },

    #[error("Service unavailable: {message}")]
    ServiceUnavailable { message: String },

    #[error("Internal server error: {message}")]
    InternalError { message: String },
}

impl From<config::ConfigError> for RelayError {
    fn from(err: config::ConfigError) -> Self {
        RelayError::ConfigError {
            message: err.to_string(),
        }
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for RelayError {
    fn from(err: tokio::sync::mpsc::error::SendError<T>) -> Self {
        RelayError::InternalError {
            message: format!("Channel send error: {}", err),
        }
    }
}

impl RelayError {
    pub fn error_code(&self) -> &'static str {
        match self {
            RelayError::IngestNotFound { .. } => "INGEST_NOT_FOUND",
            RelayError::IngestExists { .. } => "INGEST_EXISTS",
            RelayError::AuthenticationFailed => "AUTH_FAILED",
            RelayError::ProtocolError { .. } => "PROTOCOL_ERROR",
            RelayError::StorageError { .. } => "STORAGE_ERROR",
            RelayError::ConfigError { .. } => "CONFIG_ERROR",
            RelayError::NetworkError { .. } => "NETWORK_ERROR",
            RelayError::CodecError { .. } => "CODEC_ERROR",
            RelayError::InvalidRequest { .. } => "INVALID_REQUEST",
            RelayError::ServiceUnavailable { .. } => "SERVICE_UNAVAILABLE",
            RelayError::InternalError { .. } => "INTERNAL_ERROR",
        }
    }

    pub fn http_status(&self) -> StatusCode {
        match self {
            RelayError::IngestNotFound { .. } => StatusCode::NOT_FOUND,
            RelayError::IngestExists { .. } => StatusCode::CONFLICT,
            RelayError::AuthenticationFailed => StatusCode::UNAUTHORIZED,
            RelayError::ProtocolError { .. } => StatusCode::BAD_REQUEST,
            RelayError::StorageError { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            RelayError::ConfigError { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            RelayError::NetworkError { .. } => StatusCode::BAD_GATEWAY,
            RelayError::CodecError { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            RelayError::InvalidRequest { .. } => StatusCode::BAD_REQUEST,
            RelayError::ServiceUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            RelayError::InternalError { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn should_log_error(&self) -> bool {
        !matches!(
            self,
            RelayError::IngestNotFound { .. }
                | RelayError::IngestExists { .. }
                | RelayError::AuthenticationFailed
                | RelayError::InvalidRequest { .. }
        )
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
    pub message: String,
    pub timestamp: String,
}

impl ErrorResponse {
    pub fn from_error(error: &RelayError) -> Self {
        Self {
            error: "RelayError".to_string(),
            code: error.error_code().to_string(),
            message: error.to_string(),
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }
}

/// Turns errors and payloads into HTTP responses.
pub struct ErrorHandler;

impl ErrorHandler {
    pub fn handle_error(error: &RelayError) -> Response<Body> {
        if error.should_log_error() {
            log::error!("Relay error: {}", error);
        } else {
            log::warn!("Client error: {}", error);
        }

        let error_response = ErrorResponse::from_error(error);
        let status = error.http_status();

        let mut response = Response::builder()
            .status(status)
            .header("Content-Type", "application/json")
            .header("Access-Control-Allow-Origin", "*")
            .header("Access-Control-Allow-Methods", "GET, POST, PUT, OPTIONS")
            .header("Access-Control-Allow-Headers", "Content-Type, Authorization");

        if matches!(error, RelayError::AuthenticationFailed) {
            response = response.header("WWW-Authenticate", "Basic realm=\"Restricted\"");
        }

        let body = match serde_json::to_string(&error_response) {
            Ok(json) => Body::from(json),
            Err(_) => Body::from(
                r#"{"error":"InternalError","message":"Failed to serialize error response"}"#,
            ),
        };

        response.body(body).unwrap_or_else(|_| {
            Response::builder()
                .status(StatusCode::INTERNAL_SERVER_ERROR)
                .body(Body::from("Failed to build error response"))
                .unwrap()
        })
    }

    pub fn handle_success<T: Serialize>(data: T) -> Response<Body> {
        let response = match serde_json::to_string(&data) {
            Ok(json) => Response::builder()
                .status(StatusCode::OK)
                .header("Content-Type", "application/json")
                .header("Access-Control-Allow-Origin", "*")
                .body(Body::from(json)),
            Err(e) => {
                log::error!("Failed to serialize success response: {}", e);
                let error = RelayError::InternalError {
                    message: "Failed to serialize response".to_string(),
                };
                return Self::handle_error(&error);
            }
        };

        response.unwrap_or_else(|_| {
            let error = RelayError::InternalError {
                message: "Failed to build success response".to_string(),
            };
            Self::handle_error(&error)
        })
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, RelayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        let error = RelayError::IngestNotFound {
            name: "test".to_string(),
        };
        assert_eq!(error.error_code(), "INGEST_NOT_FOUND");
        assert_eq!(error.http_status(), StatusCode::NOT_FOUND);
        assert!(!error.should_log_error());
    }

    #[test]
    fn test_conflict_status() {
        let error = RelayError::IngestExists {
            name: "live".to_string(),
        };
        assert_eq!(error.http_status(), StatusCode::CONFLICT);
    }

    #[test]
    fn test_error_response_serialization() {
        let error = RelayError::InvalidRequest {
            message: "bad output url".to_string(),
        };
        let response = ErrorResponse::from_error(&error);
        assert_eq!(response.code, "INVALID_REQUEST");
        assert!(response.message.contains("bad output url"));
    }
}

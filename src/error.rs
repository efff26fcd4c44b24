//! Error kinds shared by the registry, the engine supervisor and the management API

use hyper::StatusCode;
use serde::Serialize;

/// Errors surfaced by inbound management and engine restarts
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Referenced record does not exist
    #[error("{0} not found")]
    NotFound(String),

    /// Duplicate port, tag or username
    #[error("conflict: {0}")]
    Conflict(String),

    /// Malformed or inconsistent engine configuration
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Another restart holds the restart permit
    #[error("engine restart already in progress")]
    RestartInProgress,

    /// Engine refused to start, exited during startup, or a phase timed out
    #[error("engine failed: {0}")]
    EngineStartFailed(String),

    /// Underlying storage I/O failure
    #[error("storage failure: {0}")]
    StorageFailure(String),

    /// Missing or invalid credentials
    #[error("unauthorized")]
    Unauthorized,

    /// Authenticated but not allowed
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// Request could not be parsed
    #[error("bad request: {0}")]
    BadRequest(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::NotFound(_) => ErrorCode::NotFound,
            Error::Conflict(_) => ErrorCode::Conflict,
            Error::InvalidConfig(_) => ErrorCode::InvalidConfig,
            Error::RestartInProgress => ErrorCode::RestartInProgress,
            Error::EngineStartFailed(_) => ErrorCode::EngineStartFailed,
            Error::StorageFailure(_) => ErrorCode::StorageFailure,
            Error::Unauthorized => ErrorCode::Unauthorized,
            Error::Forbidden(_) => ErrorCode::Forbidden,
            Error::BadRequest(_) => ErrorCode::BadRequest,
        }
    }
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        match e {
            rusqlite::Error::SqliteFailure(ref inner, ref msg)
                if inner.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Error::Conflict(msg.clone().unwrap_or_else(|| inner.to_string()))
            }
            other => Error::StorageFailure(other.to_string()),
        }
    }
}

/// Machine-readable error codes for JSON error bodies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    NotFound,
    Conflict,
    InvalidConfig,
    RestartInProgress,
    EngineStartFailed,
    StorageFailure,
    Unauthorized,
    Forbidden,
    BadRequest,
}

impl ErrorCode {
    /// HTTP status returned by the management API for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ErrorCode::NotFound => StatusCode::NOT_FOUND,
            ErrorCode::Conflict => StatusCode::CONFLICT,
            ErrorCode::InvalidConfig => StatusCode::UNPROCESSABLE_ENTITY,
            ErrorCode::RestartInProgress => StatusCode::SERVICE_UNAVAILABLE,
            ErrorCode::EngineStartFailed => StatusCode::BAD_GATEWAY,
            ErrorCode::StorageFailure => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorCode::Unauthorized => StatusCode::UNAUTHORIZED,
            ErrorCode::Forbidden => StatusCode::FORBIDDEN,
            ErrorCode::BadRequest => StatusCode::BAD_REQUEST,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::Conflict => "CONFLICT",
            ErrorCode::InvalidConfig => "INVALID_CONFIG",
            ErrorCode::RestartInProgress => "RESTART_IN_PROGRESS",
            ErrorCode::EngineStartFailed => "ENGINE_START_FAILED",
            ErrorCode::StorageFailure => "STORAGE_FAILURE",
            ErrorCode::Unauthorized => "UNAUTHORIZED",
            ErrorCode::Forbidden => "FORBIDDEN",
            ErrorCode::BadRequest => "BAD_REQUEST",
        }
    }
}

/// JSON body returned for failed management calls
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub msg: String,
    pub code: ErrorCode,
}

impl ErrorResponse {
    /// Build a failure envelope for `action` ("add inbound", "delete", ...)
    pub fn new(action: &str, error: &Error) -> Self {
        Self {
            success: false,
            msg: format!("{} failed: {}", action, error),
            code: error.code(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"success":false,"msg":"{}","code":"{}"}}"#,
                self.msg.replace('\"', "\\\""),
                self.code.as_str()
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_status_codes() {
        assert_eq!(ErrorCode::NotFound.status_code(), StatusCode::NOT_FOUND);
        assert_eq!(ErrorCode::Conflict.status_code(), StatusCode::CONFLICT);
        assert_eq!(
            ErrorCode::RestartInProgress.status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(ErrorCode::Unauthorized.status_code(), StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn test_error_response_json() {
        let error = Error::Conflict("port 443 already in use".to_string());
        let json = ErrorResponse::new("add inbound", &error).to_json();

        assert!(json.contains("\"success\":false"));
        assert!(json.contains("\"code\":\"CONFLICT\""));
        assert!(json.contains("add inbound failed: conflict: port 443 already in use"));
    }

    #[test]
    fn test_constraint_violation_maps_to_conflict() {
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE t (port INTEGER UNIQUE); INSERT INTO t VALUES (1);")
            .unwrap();
        let err: Error = conn
            .execute("INSERT INTO t VALUES (1)", [])
            .unwrap_err()
            .into();
        assert_eq!(err.code(), ErrorCode::Conflict);
    }

    #[test]
    fn test_other_sqlite_errors_map_to_storage_failure() {
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        let err: Error = conn
            .execute("INSERT INTO missing_table VALUES (1)", [])
            .unwrap_err()
            .into();
        assert_eq!(err.code(), ErrorCode::StorageFailure);
    }

    #[test]
    fn test_error_code_header_values() {
        assert_eq!(ErrorCode::InvalidConfig.as_str(), "INVALID_CONFIG");
        assert_eq!(ErrorCode::EngineStartFailed.as_str(), "ENGINE_START_FAILED");
    }
}

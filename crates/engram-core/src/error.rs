//! Core error type with stable wire codes.
//!
//! Every failure that crosses the tool boundary carries an [`ErrorCode`] so
//! callers can branch without string matching. Internal detail (paths, SQL)
//! is kept out of the external view; `sanitized_message` is what goes over
//! the wire.

use thiserror::Error;

/// Stable error codes exposed at the tool boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum ErrorCode {
    #[serde(rename = "E1000")]
    MissingRequiredField,
    #[serde(rename = "E1001")]
    InvalidScopeType,
    #[serde(rename = "E1002")]
    InvalidAction,
    #[serde(rename = "E1003")]
    InvalidFilePath,
    #[serde(rename = "E1004")]
    InvalidParameter,
    #[serde(rename = "E2000")]
    NotFound,
    #[serde(rename = "E2001")]
    AlreadyExists,
    #[serde(rename = "E2002")]
    Conflict,
    #[serde(rename = "E3000")]
    FileLocked,
    #[serde(rename = "E3001")]
    LockNotFound,
    #[serde(rename = "E3002")]
    LockExpired,
    #[serde(rename = "E4000")]
    DatabaseError,
    #[serde(rename = "E4001")]
    MigrationError,
    #[serde(rename = "E5000")]
    UnknownError,
    #[serde(rename = "E5001")]
    InternalError,
    #[serde(rename = "E6000")]
    PermissionDenied,
    #[serde(rename = "E7000")]
    ExtractionUnavailable,
    #[serde(rename = "E7001")]
    ExtractionFailed,
    #[serde(rename = "E7002")]
    ExtractionParseError,
    #[serde(rename = "E7003")]
    ExtractionTimeout,
}

impl ErrorCode {
    /// Wire form, e.g. `"E2000"`.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MissingRequiredField => "E1000",
            Self::InvalidScopeType => "E1001",
            Self::InvalidAction => "E1002",
            Self::InvalidFilePath => "E1003",
            Self::InvalidParameter => "E1004",
            Self::NotFound => "E2000",
            Self::AlreadyExists => "E2001",
            Self::Conflict => "E2002",
            Self::FileLocked => "E3000",
            Self::LockNotFound => "E3001",
            Self::LockExpired => "E3002",
            Self::DatabaseError => "E4000",
            Self::MigrationError => "E4001",
            Self::UnknownError => "E5000",
            Self::InternalError => "E5001",
            Self::PermissionDenied => "E6000",
            Self::ExtractionUnavailable => "E7000",
            Self::ExtractionFailed => "E7001",
            Self::ExtractionParseError => "E7002",
            Self::ExtractionTimeout => "E7003",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result alias used throughout the core.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors raised by the memory core.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("missing required field: {0}")]
    MissingField(String),

    #[error("invalid scope type: {0}")]
    InvalidScopeType(String),

    #[error("invalid action: {0}")]
    InvalidAction(String),

    #[error("invalid file path: {0}")]
    InvalidFilePath(String),

    #[error("invalid parameter {name}: {reason}")]
    InvalidParameter { name: String, reason: String },

    #[error("{kind} not found: {id}")]
    NotFound { kind: String, id: String },

    #[error("{kind} already exists: {name}")]
    AlreadyExists { kind: String, name: String },

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("file is locked by {owner}: {path}")]
    FileLocked { path: String, owner: String },

    #[error("no lock held on {0}")]
    LockNotFound(String),

    #[error("lock on {0} has expired")]
    LockExpired(String),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("database busy after {attempts} attempts")]
    DatabaseBusy { attempts: u32 },

    #[error("migration error: {0}")]
    Migration(String),

    #[error("embedder unavailable: {0}")]
    EmbedderUnavailable(String),

    #[error("deadline exceeded during {0}")]
    DeadlineExceeded(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl CoreError {
    /// Stable code for the tool boundary.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::MissingField(_) => ErrorCode::MissingRequiredField,
            Self::InvalidScopeType(_) => ErrorCode::InvalidScopeType,
            Self::InvalidAction(_) => ErrorCode::InvalidAction,
            Self::InvalidFilePath(_) => ErrorCode::InvalidFilePath,
            Self::InvalidParameter { .. } => ErrorCode::InvalidParameter,
            Self::NotFound { .. } => ErrorCode::NotFound,
            Self::AlreadyExists { .. } => ErrorCode::AlreadyExists,
            Self::Conflict(_) => ErrorCode::Conflict,
            Self::FileLocked { .. } => ErrorCode::FileLocked,
            Self::LockNotFound(_) => ErrorCode::LockNotFound,
            Self::LockExpired(_) => ErrorCode::LockExpired,
            Self::Database(_) | Self::DatabaseBusy { .. } => ErrorCode::DatabaseError,
            Self::Migration(_) => ErrorCode::MigrationError,
            Self::EmbedderUnavailable(_) => ErrorCode::ExtractionUnavailable,
            Self::DeadlineExceeded(_) => ErrorCode::InternalError,
            Self::PermissionDenied(_) => ErrorCode::PermissionDenied,
            Self::Serialization(_) => ErrorCode::InvalidParameter,
            Self::Internal(_) => ErrorCode::InternalError,
        }
    }

    /// True for transient database failures worth retrying with backoff.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Database(rusqlite::Error::SqliteFailure(e, _)) => matches!(
                e.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }

    /// Message safe to return across the external boundary. Database and
    /// internal errors are collapsed so no paths or SQL leak out.
    pub fn sanitized_message(&self) -> String {
        match self {
            Self::Database(_) | Self::DatabaseBusy { .. } => "database error".to_string(),
            Self::Internal(_) => "internal error".to_string(),
            other => other.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_mapping() {
        assert_eq!(
            CoreError::MissingField("name".into()).code().as_str(),
            "E1000"
        );
        assert_eq!(
            CoreError::NotFound {
                kind: "guideline".into(),
                id: "x".into()
            }
            .code()
            .as_str(),
            "E2000"
        );
        assert_eq!(
            CoreError::FileLocked {
                path: "/a".into(),
                owner: "b".into()
            }
            .code()
            .as_str(),
            "E3000"
        );
        assert_eq!(CoreError::Migration("m".into()).code().as_str(), "E4001");
    }

    #[test]
    fn test_sanitized_message_hides_database_detail() {
        let err = CoreError::Internal("stack trace with /home/user/secret".into());
        assert_eq!(err.sanitized_message(), "internal error");
        let err = CoreError::DatabaseBusy { attempts: 5 };
        assert_eq!(err.sanitized_message(), "database error");
    }

    #[test]
    fn test_busy_is_retryable() {
        let ffi = rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY);
        let err = CoreError::Database(rusqlite::Error::SqliteFailure(ffi, None));
        assert!(err.is_retryable());
        assert!(!CoreError::Conflict("x".into()).is_retryable());
    }
}

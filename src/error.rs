//! Fetchkit Domain Errors
//!
//! Typed error definitions for all engine domains, with the retry
//! classification the queue uses to decide between mirror fallover and
//! terminal failure.

use std::path::PathBuf;
use thiserror::Error;

/// Main engine error type
#[derive(Debug, Clone, Error)]
pub enum FetchError {
    // Queue errors
    #[error("no processor available for downloadable {0}")]
    NoProcessorAvailable(String),
    #[error("queue is inactive")]
    QueueInactive,
    #[error("invalid downloadable: {0}")]
    InvalidDownloadable(String),
    #[error("all mirrors exhausted for resource {0}")]
    MirrorsExhausted(String),

    // Processor errors
    #[error("processor cannot handle {0}")]
    CannotProcess(String),
    #[error("processor is inactive")]
    ProcessorInactive,
    #[error("invalid transfer parameters: {0}")]
    InvalidParameters(String),
    #[error("download failed: {0}")]
    DownloadFailed(String),
    #[error("unsupported resource type: {0}")]
    UnsupportedType(String),

    // Cache errors
    #[error("file already exists at {0}")]
    FileAlreadyExists(PathBuf),
    #[error("cannot generate a unique local path for resource {0}")]
    CannotGenerateLocalPath(String),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("database error: {0}")]
    Database(String),
    #[error("file not found: {0}")]
    FileNotFound(PathBuf),
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    // Mirror policy errors
    #[error("resource {0} has no usable mirrors")]
    NoMirrors(String),
    #[error("retry budget exhausted for every mirror of resource {0}")]
    AllMirrorsExhausted(String),
    #[error("cannot materialize a downloadable for mirror {0}")]
    CannotGenerateDownloadable(String),
    #[error("invalid mirror configuration: {0}")]
    InvalidConfiguration(String),

    // Network errors
    #[error("connection failed: {0}")]
    ConnectionFailed(String),
    #[error("network timeout")]
    Timeout,
    #[error("invalid URL: {0}")]
    InvalidUrl(String),
    #[error("server returned {code}: {message}")]
    Server { code: u16, message: String },
    #[error("download cancelled")]
    Cancelled,
    #[error("no network connection")]
    NoNetwork,

    // Filesystem errors
    #[error("cannot create directory {0}")]
    CannotCreateDirectory(PathBuf),
    #[error("cannot move file {from} -> {to}: {reason}")]
    CannotMoveFile {
        from: PathBuf,
        to: PathBuf,
        reason: String,
    },
    #[error("cannot delete {0}")]
    CannotDelete(PathBuf),
    #[error("insufficient space on device")]
    InsufficientSpace,
    #[error("file corrupted: {0}")]
    Corrupted(String),
    #[error("access denied: {0}")]
    AccessDenied(String),

    // Cloud asset errors
    #[error("record {0} carries no asset data")]
    NoAssetData(String),
    #[error("record {0} does not exist")]
    NoRecord(String),
    #[error("invalid cloud record id: {0}")]
    InvalidRecordId(String),
    #[error("cloud service unavailable: {0}")]
    CloudUnavailable(String),
    #[error("cloud quota exceeded")]
    QuotaExceeded,
    #[error("cloud asset not found: {0}")]
    CloudNotFound(String),
}

impl FetchError {
    /// Whether the queue should attempt the next mirror after this failure.
    ///
    /// Transport-level problems and transient store failures are recovered via
    /// the mirror policy; everything else surfaces to the task as terminal.
    pub fn is_retryable(&self) -> bool {
        match self {
            // Terminal by contract
            FetchError::Cancelled
            | FetchError::MirrorsExhausted(_)
            | FetchError::AllMirrorsExhausted(_)
            | FetchError::NoMirrors(_)
            | FetchError::CannotGenerateDownloadable(_)
            | FetchError::NoProcessorAvailable(_)
            | FetchError::QueueInactive
            | FetchError::InvalidDownloadable(_)
            | FetchError::InvalidParameters(_)
            | FetchError::UnsupportedType(_)
            | FetchError::InvalidConfiguration(_)
            | FetchError::InvalidUrl(_)
            | FetchError::InvalidRecordId(_)
            | FetchError::AccessDenied(_)
            | FetchError::PermissionDenied(_)
            | FetchError::InsufficientSpace
            | FetchError::QuotaExceeded => false,

            // A different mirror may still serve the resource
            FetchError::ConnectionFailed(_)
            | FetchError::Timeout
            | FetchError::NoNetwork
            | FetchError::DownloadFailed(_)
            | FetchError::CannotProcess(_)
            | FetchError::ProcessorInactive
            | FetchError::CloudUnavailable(_)
            | FetchError::NoAssetData(_)
            | FetchError::NoRecord(_)
            | FetchError::CloudNotFound(_)
            | FetchError::Corrupted(_) => true,

            // Store failures after a successful transfer are recoverable by
            // retrying the transfer against a fresh target path
            FetchError::FileAlreadyExists(_)
            | FetchError::CannotGenerateLocalPath(_)
            | FetchError::Storage(_)
            | FetchError::Database(_)
            | FetchError::FileNotFound(_)
            | FetchError::CannotCreateDirectory(_)
            | FetchError::CannotMoveFile { .. }
            | FetchError::CannotDelete(_) => true,

            FetchError::Server { code, .. } => !matches!(code, 400 | 401 | 402 | 403 | 451),
        }
    }

    /// Build a server error from an HTTP status code.
    pub fn from_status(code: u16, message: impl Into<String>) -> Self {
        FetchError::Server {
            code,
            message: message.into(),
        }
    }
}

impl From<std::io::Error> for FetchError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::PermissionDenied => FetchError::AccessDenied(err.to_string()),
            ErrorKind::NotFound => FetchError::FileNotFound(PathBuf::new()),
            _ => {
                // ENOSPC has no stable ErrorKind across platforms
                if err.raw_os_error() == Some(28) {
                    FetchError::InsufficientSpace
                } else {
                    FetchError::Storage(err.to_string())
                }
            }
        }
    }
}

impl From<rusqlite::Error> for FetchError {
    fn from(err: rusqlite::Error) -> Self {
        FetchError::Database(err.to_string())
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            FetchError::Timeout
        } else if err.is_connect() {
            FetchError::ConnectionFailed(err.to_string())
        } else if let Some(status) = err.status() {
            FetchError::from_status(status.as_u16(), err.to_string())
        } else {
            FetchError::DownloadFailed(err.to_string())
        }
    }
}

/// Result type alias for engine operations
pub type FetchResult<T> = Result<T, FetchError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_errors_are_retryable() {
        assert!(FetchError::Timeout.is_retryable());
        assert!(FetchError::ConnectionFailed("reset".into()).is_retryable());
        assert!(FetchError::from_status(500, "internal").is_retryable());
        assert!(FetchError::from_status(503, "busy").is_retryable());
    }

    #[test]
    fn test_terminal_errors_are_not_retryable() {
        assert!(!FetchError::Cancelled.is_retryable());
        assert!(!FetchError::InsufficientSpace.is_retryable());
        assert!(!FetchError::AccessDenied("ro mount".into()).is_retryable());
        assert!(!FetchError::MirrorsExhausted("r1".into()).is_retryable());
    }

    #[test]
    fn test_client_errors_are_terminal() {
        assert!(!FetchError::from_status(403, "forbidden").is_retryable());
        assert!(!FetchError::from_status(401, "auth").is_retryable());
        // 404 may still succeed on another mirror
        assert!(FetchError::from_status(404, "missing").is_retryable());
    }

    #[test]
    fn test_store_failures_are_retryable() {
        assert!(FetchError::FileAlreadyExists(PathBuf::from("/x")).is_retryable());
        assert!(FetchError::CannotGenerateLocalPath("r1".into()).is_retryable());
        assert!(FetchError::Database("locked".into()).is_retryable());
    }

    #[test]
    fn test_io_error_mapping() {
        let err = std::io::Error::from_raw_os_error(28);
        assert!(matches!(FetchError::from(err), FetchError::InsufficientSpace));

        let err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        assert!(matches!(FetchError::from(err), FetchError::AccessDenied(_)));
    }
}

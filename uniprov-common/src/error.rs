//! Error taxonomy shared by every backend and orchestrator.
//!
//! Backends translate native failures (HTTP status codes, transport errors,
//! filesystem errors) into exactly one of these variants before returning.
//! Callers branch on [`ProviderError::kind`], never on the message.

use std::fmt;

pub type Result<T> = std::result::Result<T, ProviderError>;

#[derive(Debug, Clone, thiserror::Error)]
pub enum ProviderError {
    // =========================================================================
    // Session / configuration
    // =========================================================================
    /// Session could not be established. Fatal for the backend handle.
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// Registry miss.
    #[error("unknown backend: {0}")]
    UnknownBackend(String),

    /// Caller-supplied value the backend cannot use (size string, flavor).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    // =========================================================================
    // Build / publish
    // =========================================================================
    #[error("image build failed: {0}")]
    BuildFailed(String),

    #[error("package not found: {0}")]
    PackageNotFound(String),

    #[error("staging failed: {0}")]
    StageFailed(String),

    #[error("publish failed: {0}")]
    PublishFailed(String),

    // =========================================================================
    // Backend-reported state conflicts
    // =========================================================================
    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("image in use: {0}")]
    ImageInUse(String),

    #[error("image not found: {0}")]
    ImageNotFound(String),

    #[error("instance not found: {0}")]
    InstanceNotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("logs not yet available: {0}")]
    LogsNotYetAvailable(String),

    // =========================================================================
    // Capability / transport
    // =========================================================================
    /// The backend lacks the capability. Not a usage error.
    #[error("operation not supported: {0}")]
    UnsupportedOperation(String),

    /// Transient network condition. Safe to retry with backoff.
    #[error("backend unreachable: {0}")]
    BackendUnreachable(String),

    /// The backend answered and refused the request. Retrying the same
    /// request gets the same answer.
    #[error("backend rejected request: {0}")]
    BackendRejected(String),

    /// Local filesystem or process failure.
    #[error("i/o error: {0}")]
    Io(String),
}

/// Fieldless mirror of [`ProviderError`] for kind checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Authentication,
    UnknownBackend,
    InvalidArgument,
    BuildFailed,
    PackageNotFound,
    StageFailed,
    PublishFailed,
    QuotaExceeded,
    ImageInUse,
    ImageNotFound,
    InstanceNotFound,
    AlreadyExists,
    InvalidState,
    LogsNotYetAvailable,
    UnsupportedOperation,
    BackendUnreachable,
    BackendRejected,
    Io,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl ProviderError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ProviderError::Authentication(_) => ErrorKind::Authentication,
            ProviderError::UnknownBackend(_) => ErrorKind::UnknownBackend,
            ProviderError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            ProviderError::BuildFailed(_) => ErrorKind::BuildFailed,
            ProviderError::PackageNotFound(_) => ErrorKind::PackageNotFound,
            ProviderError::StageFailed(_) => ErrorKind::StageFailed,
            ProviderError::PublishFailed(_) => ErrorKind::PublishFailed,
            ProviderError::QuotaExceeded(_) => ErrorKind::QuotaExceeded,
            ProviderError::ImageInUse(_) => ErrorKind::ImageInUse,
            ProviderError::ImageNotFound(_) => ErrorKind::ImageNotFound,
            ProviderError::InstanceNotFound(_) => ErrorKind::InstanceNotFound,
            ProviderError::AlreadyExists(_) => ErrorKind::AlreadyExists,
            ProviderError::InvalidState(_) => ErrorKind::InvalidState,
            ProviderError::LogsNotYetAvailable(_) => ErrorKind::LogsNotYetAvailable,
            ProviderError::UnsupportedOperation(_) => ErrorKind::UnsupportedOperation,
            ProviderError::BackendUnreachable(_) => ErrorKind::BackendUnreachable,
            ProviderError::BackendRejected(_) => ErrorKind::BackendRejected,
            ProviderError::Io(_) => ErrorKind::Io,
        }
    }

    /// Only transient network conditions are worth retrying.
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::BackendUnreachable
    }

    pub fn is_capability_gap(&self) -> bool {
        self.kind() == ErrorKind::UnsupportedOperation
    }

    pub fn unsupported(backend: &str, operation: &str) -> Self {
        ProviderError::UnsupportedOperation(format!("{} on backend '{}'", operation, backend))
    }

    pub fn not_initialized(backend: &str) -> Self {
        ProviderError::Authentication(format!("backend '{}' is not initialized", backend))
    }
}

impl From<std::io::Error> for ProviderError {
    fn from(e: std::io::Error) -> Self {
        ProviderError::Io(e.to_string())
    }
}

impl From<serde_json::Error> for ProviderError {
    fn from(e: serde_json::Error) -> Self {
        ProviderError::Io(format!("invalid json: {}", e))
    }
}

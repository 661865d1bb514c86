//! Error types for cirrus-formation.

/// Result type alias using [`FormationError`].
pub type FormationResult<T> = Result<T, FormationError>;

/// Errors that can occur while provisioning experiment environments.
#[derive(Debug, thiserror::Error)]
pub enum FormationError {
    /// The remote control plane could not be reached.
    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    /// The remote control plane refused the request.
    #[error("backend rejected request: {0}")]
    BackendRejected(String),

    /// Deferred scheduler error.
    #[error("scheduler error: {0}")]
    Scheduler(String),

    /// Database error.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Experiment not found.
    #[error("experiment not found: {0}")]
    ExperimentNotFound(String),

    /// The request was rejected before anything was scheduled.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Serialisation error.
    #[error("serialisation error: {0}")]
    Serialisation(String),

    /// Internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl FormationError {
    /// Create a backend-unavailable error.
    #[must_use]
    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::BackendUnavailable(msg.into())
    }

    /// Create a backend-rejected error.
    #[must_use]
    pub fn rejected(msg: impl Into<String>) -> Self {
        Self::BackendRejected(msg.into())
    }

    /// Create a scheduler error.
    #[must_use]
    pub fn scheduler(msg: impl Into<String>) -> Self {
        Self::Scheduler(msg.into())
    }

    /// Create an invalid-request error.
    #[must_use]
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidRequest(msg.into())
    }

    /// Create an internal error.
    #[must_use]
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Whether this error came from a backend adapter.
    #[must_use]
    pub const fn is_backend(&self) -> bool {
        matches!(self, Self::BackendUnavailable(_) | Self::BackendRejected(_))
    }
}

use thiserror::Error;

/// Error kinds shared across the control plane.
///
/// Components convert these into HTTP statuses at the API boundary and into
/// structured result values (UpdateResult, DeploymentResult) inside the
/// executors. The event bus never propagates them to emitters.
#[derive(Error, Debug)]
pub enum DmError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid regex: {0}")]
    ValidationRegex(String),

    #[error("Payload too large: {0}")]
    ValidationSize(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Unauthorized: {0}")]
    Auth(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Agent unavailable: {0}")]
    AgentUnavailable(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Engine error: {message}")]
    Engine {
        /// HTTP status of the upstream engine response, when known.
        status: Option<u16>,
        message: String,
    },

    #[error("Database error: {0}")]
    Database(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl DmError {
    pub fn engine(status: Option<u16>, message: impl Into<String>) -> Self {
        Self::Engine {
            status,
            message: message.into(),
        }
    }

    /// True for kinds a caller may retry (transient transport conditions).
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::AgentUnavailable(_) | Self::Timeout(_))
    }
}

impl From<serde_json::Error> for DmError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

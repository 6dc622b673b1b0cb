use thiserror::Error;

/// A convenience `Result` alias using [`VigilError`].
pub type VigilResult<T> = Result<T, VigilError>;

/// Error taxonomy shared by every Vigil component.
///
/// None of these are retried inside the engine. `TransientStore` is the only
/// variant a caller should consider retrying, with its own backoff.
#[derive(Error, Debug)]
pub enum VigilError {
    /// Malformed scope or payload, illegal state transition, duplicate result write.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Unknown task, agent, workflow or message.
    #[error("Not found: {0}")]
    NotFound(String),

    /// The shared store could not be reached or rejected the command.
    #[error("Store unavailable: {0}")]
    TransientStore(String),

    /// A reply did not arrive in time.
    #[error("Timed out: {0}")]
    Timeout(String),

    /// Configuration could not be loaded or is inconsistent.
    #[error("Config error: {0}")]
    Config(String),

    /// A record in the store could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl VigilError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn store(msg: impl std::fmt::Display) -> Self {
        Self::TransientStore(msg.to_string())
    }

    /// Short machine-readable name of the variant, used in API error bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::NotFound(_) => "not_found",
            Self::TransientStore(_) => "transient_store",
            Self::Timeout(_) => "timeout",
            Self::Config(_) => "config",
            Self::Json(_) => "serialization",
            Self::Io(_) => "io",
        }
    }
}

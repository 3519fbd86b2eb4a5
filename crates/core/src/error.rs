use thiserror::Error;

pub type CadenceResult<T> = Result<T, CadenceError>;

#[derive(Error, Debug)]
pub enum CadenceError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Datastore error: {0}")]
    Store(String),

    #[error("Mail transport error: {0}")]
    Transport(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Invalid step definition: {0}")]
    InvalidStep(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl CadenceError {
    /// Errors caused by the datastore being unreachable rather than by the
    /// data itself. A tick that hits one of these is abandoned.
    pub fn is_store_unavailable(&self) -> bool {
        matches!(self, CadenceError::Store(_))
    }
}

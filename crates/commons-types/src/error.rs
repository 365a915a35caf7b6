use thiserror::Error;

/// Failures surfaced by messaging operations. Every variant is raised before
/// any write is committed, except `Storage`, which aborts the enclosing
/// transaction.
#[derive(Debug, Error)]
pub enum MessagingError {
    /// The acting identity is not allowed to act on the target.
    #[error("not authorized for this conversation")]
    Authorization,

    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("invalid request: {0}")]
    Validation(String),

    #[error("storage failure: {0}")]
    Storage(#[from] anyhow::Error),
}

impl MessagingError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }
}

pub type MessagingResult<T> = Result<T, MessagingError>;

//! Error taxonomy for coordinator operations.
//!
//! Each variant maps onto a stable wire code so clients can branch on it.
//! Observer delivery failures never show up here; the broadcast hub recovers
//! from them internally.

use penlab_protocol::{
    ErrorInfo, ERROR_INVALID_PARAMS, ERROR_IO, ERROR_NOT_FOUND, ERROR_STATE_CONFLICT,
};

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("{0}")]
    Validation(String),

    #[error("File not found: {0}")]
    NotFound(String),

    #[error("{0}")]
    StateConflict(String),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

impl CoreError {
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        CoreError::Io {
            context: context.into(),
            source,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            CoreError::Validation(_) => ERROR_INVALID_PARAMS,
            CoreError::NotFound(_) => ERROR_NOT_FOUND,
            CoreError::StateConflict(_) => ERROR_STATE_CONFLICT,
            CoreError::Io { .. } => ERROR_IO,
        }
    }
}

impl From<CoreError> for ErrorInfo {
    fn from(err: CoreError) -> Self {
        ErrorInfo::new(err.code(), err.to_string())
    }
}

pub type CoreResult<T> = Result<T, CoreError>;

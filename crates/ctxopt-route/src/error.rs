use thiserror::Error;

use ctxopt_core::model::RouteState;

#[derive(Error, Debug)]
pub enum RouteError {
    #[error("Core error: {0}")]
    Core(#[from] ctxopt_core::CoreError),

    #[error("Illegal route transition {from:?} -> {to:?}")]
    IllegalTransition { from: RouteState, to: RouteState },

    #[error("Invalid domain table: {0}")]
    Vocabulary(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl RouteError {
    /// Only corrupted persistent state should stop the caller.
    pub fn is_fatal(&self) -> bool {
        matches!(self, RouteError::Core(e) if e.is_fatal())
    }
}

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Git operation failed: {0}")]
    Git(#[from] git2::Error),

    #[error("Manifest not found: {id}")]
    NotFound { id: String },

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("Workspace not initialized for ctxopt (run `ctxopt init`)")]
    NotInitialized,

    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A persisted table could not be parsed. Routing against a corrupt
    /// store would be systematically wrong, so this is never swallowed.
    #[error("Store corrupted ({store}): {detail}")]
    StoreCorruption { store: String, detail: String },

    #[error("Invalid manifest ID: {0}")]
    InvalidId(String),
}

impl CoreError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, CoreError::StoreCorruption { .. })
    }
}

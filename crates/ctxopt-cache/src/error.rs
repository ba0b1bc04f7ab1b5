use thiserror::Error;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Core error: {0}")]
    Core(#[from] ctxopt_core::CoreError),

    #[error("Generation failed: {0}")]
    Generate(#[from] GenerateError),

    #[error("Invalid source path: {0}")]
    InvalidPath(String),
}

#[derive(Error, Debug)]
pub enum GenerateError {
    #[error("No generator knows manifest '{0}'")]
    Unknown(String),

    #[error("Generator failed: {0}")]
    Failed(String),

    #[error("Generator timed out after {0:?}")]
    TimedOut(std::time::Duration),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Generator output is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

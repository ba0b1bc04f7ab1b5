pub mod settings;

pub use settings::{EngineConfig, FailurePolicy, FeedbackMode};

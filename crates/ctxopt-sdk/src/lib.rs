//! Rust SDK for embedding the context optimization engine in a host.
//!
//! # Example
//! ```no_run
//! use ctxopt_sdk::{ContextEngine, UsageRecord};
//!
//! # async fn run() -> Result<(), ctxopt_sdk::EngineError> {
//! let engine = ContextEngine::discover()?;
//! let package = engine
//!     .route("Create a responsive course card component", "frontend")
//!     .await?;
//! for entry in &package.entries {
//!     println!("{} ({}, {} bytes)", entry.manifest_id, entry.layer, entry.size_bytes);
//! }
//!
//! // After the agent finishes, report what it actually referenced
//! let used = package.manifest_ids().into_iter().take(1).collect();
//! engine.record_outcome(UsageRecord::new(
//!     "Create a responsive course card component",
//!     "frontend",
//!     package.manifest_ids(),
//!     used,
//!     true,
//! ))?;
//!
//! // Called by a file watcher
//! engine.invalidate("src/components/CourseCard.tsx")?;
//! # Ok(())
//! # }
//! ```

mod engine;

pub use engine::{ContextEngine, EngineBuilder, EngineError};

// Re-export the types SDK users handle directly
pub use ctxopt_cache::{GeneratedManifest, ManifestGenerator};
pub use ctxopt_core::config::EngineConfig;
pub use ctxopt_core::model::{
    AgentProfile, ContextPackage, Layer, ManifestId, ManifestMeta, PackageEntry, UsageRecord,
};
pub use ctxopt_core::storage::Workspace;
pub use ctxopt_route::{DistanceHint, FeedbackSummary, IntentAnalyzer, PathDistance, RoutedPackage};

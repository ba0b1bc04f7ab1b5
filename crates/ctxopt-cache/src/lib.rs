//! Manifest cache: content-hash staleness, idempotent invalidation and
//! timeout-bounded regeneration through a pluggable [`ManifestGenerator`].

pub mod cache;
pub mod error;
pub mod generator;
pub mod hasher;

pub use cache::{CachedManifest, CommitOutcome, ManifestCache, REGEN_GRACE};
pub use error::{CacheError, GenerateError};
pub use generator::{CommandGenerator, GeneratedManifest, ManifestGenerator, NullGenerator};

//! Data model, configuration and persistence for ctxopt.
//!
//! Everything the engine remembers between requests lives here: manifest
//! metadata, per-agent-type profiles with their learned weights, and the
//! append-only usage log.

pub mod config;
pub mod error;
pub mod model;
pub mod storage;

pub use error::CoreError;

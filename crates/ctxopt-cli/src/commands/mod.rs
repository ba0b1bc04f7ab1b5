pub mod init;
pub mod invalidate;
pub mod log;
pub mod manifest;
pub mod mcp;
pub mod outcome;
pub mod profile;
pub mod route;
pub mod stats;
pub mod verify;

use anyhow::{Context, Result};
use clap::Subcommand;
use ctxopt_sdk::{ContextEngine, EngineBuilder, ManifestId, Workspace};

#[derive(Subcommand)]
pub enum Commands {
    /// Initialize ctxopt in the current Git repository
    Init(init::InitArgs),
    /// Build the context package for a task
    Route(route::RouteArgs),
    /// Report which delivered manifests an agent actually used
    Outcome(outcome::OutcomeArgs),
    /// Mark manifests built from changed files as stale
    Invalidate(invalidate::InvalidateArgs),
    /// Inspect or edit agent profiles
    #[command(subcommand)]
    Profile(profile::ProfileCommand),
    /// Register or list manifests
    #[command(subcommand)]
    Manifest(manifest::ManifestCommand),
    /// Re-hash manifest sources and report the stale ones
    Verify(verify::VerifyArgs),
    /// Show usage statistics per agent type
    Stats,
    /// Show recent routing decisions and outcomes
    Log(log::LogArgs),
    /// Serve the engine over MCP on stdio
    Mcp,
}

/// Locate the workspace for the current directory, refusing uninitialized repos.
pub fn workspace() -> Result<Workspace> {
    let ws = Workspace::discover().context("Not inside a Git repository")?;
    if !ws.is_initialized() {
        anyhow::bail!("ctxopt is not initialized. Run `ctxopt init` first.");
    }
    Ok(ws)
}

pub fn open_engine() -> Result<ContextEngine> {
    let ws = workspace()?;
    EngineBuilder::new()
        .open(ws)
        .context("Failed to open context engine")
}

pub fn parse_ids(ids: &[String]) -> Result<Vec<ManifestId>> {
    ids.iter()
        .map(|s| ManifestId::parse(s.as_str()).with_context(|| format!("Invalid manifest id '{s}'")))
        .collect()
}

/// A runtime for the commands that drive the async router.
pub fn runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Runtime::new().context("Failed to create async runtime")
}

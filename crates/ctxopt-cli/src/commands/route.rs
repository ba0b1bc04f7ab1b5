use anyhow::{Context, Result};
use clap::Args;

use crate::output::format::format_package;
use crate::output::OutputFormat;

#[derive(Args)]
pub struct RouteArgs {
    /// Natural-language task description
    pub task: String,

    /// Agent type the package is for
    #[arg(short, long)]
    pub agent: String,

    /// Also print the content of every delivered manifest
    #[arg(long)]
    pub content: bool,
}

pub fn run(args: &RouteArgs, format: OutputFormat) -> Result<()> {
    let engine = super::open_engine()?;
    let rt = super::runtime()?;
    let routed = rt
        .block_on(engine.route_with_content(&args.task, &args.agent))
        .context("Routing failed")?;
    let package = &routed.package;
    tracing::debug!(
        agent_type = %package.agent_type,
        total_bytes = package.total_bytes,
        entries = package.entries.len(),
        "Routed task"
    );

    print!("{}", format_package(package, format));

    if args.content {
        for entry in &package.entries {
            let Some(manifest) = routed.manifests.get(&entry.manifest_id) else {
                continue;
            };
            let body = serde_json::to_string_pretty(&manifest.content)
                .context("Failed to encode manifest content")?;
            println!("\n--- {} ---\n{body}", entry.manifest_id);
        }
    }
    Ok(())
}

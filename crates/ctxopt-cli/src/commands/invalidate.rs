use anyhow::{Context, Result};
use clap::Args;

use crate::output::OutputFormat;

#[derive(Args)]
pub struct InvalidateArgs {
    /// Changed files, relative to the repository root or absolute
    #[arg(required = true)]
    pub paths: Vec<String>,
}

pub fn run(args: &InvalidateArgs, format: OutputFormat) -> Result<()> {
    let engine = super::open_engine()?;

    let mut stale = Vec::new();
    for path in &args.paths {
        let ids = engine
            .invalidate(path)
            .with_context(|| format!("Failed to invalidate {path}"))?;
        for id in ids {
            if !stale.contains(&id) {
                stale.push(id);
            }
        }
    }

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&stale)?),
        OutputFormat::Text if stale.is_empty() => println!("No manifest depends on these files."),
        OutputFormat::Text => {
            for id in &stale {
                println!("stale: {id}");
            }
        }
    }
    Ok(())
}

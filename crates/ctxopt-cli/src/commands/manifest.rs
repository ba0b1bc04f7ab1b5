use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use ctxopt_sdk::{GeneratedManifest, ManifestId};

use crate::output::format::format_manifest_list;
use crate::output::OutputFormat;

#[derive(Subcommand)]
pub enum ManifestCommand {
    /// Register manifest content, replacing any previous version
    Add(AddArgs),
    /// List known manifests with size and freshness
    List,
}

#[derive(Args)]
pub struct AddArgs {
    pub id: String,

    /// File holding the content; JSON is stored as-is, anything else as a string
    #[arg(long)]
    pub content: PathBuf,

    /// Domain tag (repeatable)
    #[arg(long = "tag")]
    pub tags: Vec<String>,

    /// Source file the content was derived from (repeatable)
    #[arg(long = "source")]
    pub sources: Vec<String>,
}

pub fn run(cmd: &ManifestCommand, format: OutputFormat) -> Result<()> {
    let engine = super::open_engine()?;

    match cmd {
        ManifestCommand::Add(args) => {
            let id = ManifestId::parse(args.id.as_str())
                .with_context(|| format!("Invalid manifest id '{}'", args.id))?;
            let text = fs::read_to_string(&args.content)
                .with_context(|| format!("Failed to read {}", args.content.display()))?;
            let content = serde_json::from_str(&text).unwrap_or(serde_json::Value::String(text));

            let manifest = engine
                .insert_manifest(
                    id,
                    GeneratedManifest {
                        content,
                        source_files: args.sources.iter().cloned().collect(),
                        domain_tags: args.tags.iter().map(|t| t.to_lowercase()).collect(),
                    },
                )
                .context("Failed to store manifest")?;
            match format {
                OutputFormat::Json => {
                    println!("{}", serde_json::to_string_pretty(&manifest.metadata())?)
                }
                OutputFormat::Text => {
                    println!("Stored {} ({} bytes)", manifest.id, manifest.size_bytes)
                }
            }
        }
        ManifestCommand::List => {
            print!("{}", format_manifest_list(&engine.manifests(), format));
        }
    }
    Ok(())
}

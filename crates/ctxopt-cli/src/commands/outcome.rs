use anyhow::{Context, Result};
use clap::Args;
use ctxopt_sdk::UsageRecord;

use crate::output::OutputFormat;

#[derive(Args)]
pub struct OutcomeArgs {
    /// Task description the package was routed for
    #[arg(long)]
    pub task: String,

    /// Agent type that ran the task
    #[arg(short, long)]
    pub agent: String,

    /// Manifest ids that were delivered (comma-separated)
    #[arg(long, value_delimiter = ',', required = true)]
    pub loaded: Vec<String>,

    /// Manifest ids the agent referenced (comma-separated)
    #[arg(long, value_delimiter = ',')]
    pub used: Vec<String>,

    /// The task failed
    #[arg(long)]
    pub failed: bool,
}

pub fn run(args: &OutcomeArgs, format: OutputFormat) -> Result<()> {
    let engine = super::open_engine()?;
    let record = UsageRecord::new(
        &args.task,
        &args.agent,
        super::parse_ids(&args.loaded)?,
        super::parse_ids(&args.used)?,
        !args.failed,
    );
    let summary = engine
        .record_outcome(record)
        .context("Failed to record outcome")?;

    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        OutputFormat::Text => {
            if summary.deferred {
                println!("Outcome queued for the next batch.");
                return Ok(());
            }
            for (id, weight) in &summary.updated {
                println!("  {id}: {weight:.4}");
            }
            if !summary.ignored.is_empty() {
                let ignored: Vec<String> = summary.ignored.iter().map(ToString::to_string).collect();
                println!("Ignored (not loaded): {}", ignored.join(", "));
            }
            println!("Updated {} weight(s) for {}.", summary.updated.len(), args.agent);
        }
    }
    Ok(())
}

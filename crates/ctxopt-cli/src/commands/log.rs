use anyhow::{Context, Result};
use clap::Args;

use crate::output::format::format_log_entries;
use crate::output::OutputFormat;

#[derive(Args)]
pub struct LogArgs {
    /// Maximum number of entries
    #[arg(short = 'n', long, default_value = "20")]
    pub limit: usize,

    /// Filter by agent type
    #[arg(long)]
    pub agent: Option<String>,
}

pub fn run(args: &LogArgs, format: OutputFormat) -> Result<()> {
    let engine = super::open_engine()?;
    let log = engine.usage_log();

    let entries = match &args.agent {
        None => log.tail(args.limit).context("Failed to read usage log")?,
        Some(agent) => {
            let mut matching: Vec<_> = log
                .load()
                .context("Failed to read usage log")?
                .into_iter()
                .filter(|e| e.agent_type() == agent.as_str())
                .collect();
            let skip = matching.len().saturating_sub(args.limit);
            matching.split_off(skip)
        }
    };

    print!("{}", format_log_entries(&entries, format));
    Ok(())
}

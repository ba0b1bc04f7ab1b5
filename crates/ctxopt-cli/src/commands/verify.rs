use anyhow::Result;
use clap::Args;

use crate::output::OutputFormat;

#[derive(Args)]
pub struct VerifyArgs {
    /// Exit with an error if any manifest is stale
    #[arg(long)]
    pub strict: bool,
}

pub fn run(args: &VerifyArgs, format: OutputFormat) -> Result<()> {
    let engine = super::open_engine()?;
    let drifted = engine.reconcile();
    let manifests = engine.manifests();
    let stale: Vec<_> = manifests.iter().filter(|m| m.stale).map(|m| &m.id).collect();

    match format {
        OutputFormat::Json => {
            let report = serde_json::json!({
                "manifests": manifests.len(),
                "drifted": drifted,
                "stale": stale,
            });
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        OutputFormat::Text => {
            for id in &stale {
                println!("stale: {id}");
            }
            println!(
                "{} of {} manifest(s) fresh.",
                manifests.len() - stale.len(),
                manifests.len()
            );
        }
    }

    if args.strict && !stale.is_empty() {
        anyhow::bail!("{} manifest(s) are behind their sources", stale.len());
    }
    Ok(())
}

use anyhow::{Context, Result};
use clap::{Args, Subcommand};

use crate::output::format::format_profile;
use crate::output::OutputFormat;

#[derive(Subcommand)]
pub enum ProfileCommand {
    /// Show one agent type's profile (defaults if it has none yet)
    Show { agent: String },
    /// Replace parts of an agent type's profile
    Set(SetArgs),
    /// List agent types that have a stored profile
    List,
}

#[derive(Args)]
pub struct SetArgs {
    pub agent: String,

    /// Manifest ids always delivered (comma-separated, replaces the set)
    #[arg(long, value_delimiter = ',')]
    pub essential: Option<Vec<String>>,

    /// Manifest ids scored per task (comma-separated, replaces the set)
    #[arg(long, value_delimiter = ',')]
    pub optional: Option<Vec<String>>,

    /// Manifest ids never delivered (comma-separated, replaces the set)
    #[arg(long, value_delimiter = ',')]
    pub exclude: Option<Vec<String>>,

    /// Byte budget per package
    #[arg(long)]
    pub budget: Option<u64>,
}

pub fn run(cmd: &ProfileCommand, format: OutputFormat) -> Result<()> {
    let engine = super::open_engine()?;

    match cmd {
        ProfileCommand::Show { agent } => {
            let profile = engine.get_profile(agent).context("Failed to load profile")?;
            print!("{}", format_profile(&profile, format));
        }
        ProfileCommand::Set(args) => {
            let mut profile = engine
                .get_profile(&args.agent)
                .context("Failed to load profile")?;
            if let Some(ids) = &args.essential {
                profile.essential_ids = super::parse_ids(ids)?.into_iter().collect();
            }
            if let Some(ids) = &args.optional {
                profile.optional_ids = super::parse_ids(ids)?.into_iter().collect();
            }
            if let Some(ids) = &args.exclude {
                profile.excluded_ids = super::parse_ids(ids)?.into_iter().collect();
            }
            if let Some(budget) = args.budget {
                if budget == 0 {
                    anyhow::bail!("Budget must be positive");
                }
                profile.budget_bytes = budget;
            }
            engine
                .put_profile(profile.clone())
                .context("Failed to save profile")?;
            print!("{}", format_profile(&profile, format));
        }
        ProfileCommand::List => {
            let agents = engine
                .list_agent_types()
                .context("Failed to list profiles")?;
            match format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&agents)?),
                OutputFormat::Text if agents.is_empty() => println!("No profiles stored yet."),
                OutputFormat::Text => {
                    for agent in &agents {
                        println!("{agent}");
                    }
                }
            }
        }
    }
    Ok(())
}

use anyhow::{Context, Result};
use clap::Args;
use ctxopt_sdk::{EngineConfig, Workspace};

#[derive(Args)]
pub struct InitArgs {
    /// Force re-initialization (rewrites config, keeps learned profiles)
    #[arg(long)]
    pub force: bool,

    /// Default byte budget for agent types without a profile
    #[arg(long)]
    pub budget: Option<u64>,

    /// Comma-separated manifest ids every new profile starts with as essential
    #[arg(long, value_delimiter = ',')]
    pub essentials: Option<Vec<String>>,

    /// Command that generates manifest content (called with the manifest id)
    #[arg(long)]
    pub generator: Option<String>,
}

pub fn run(args: &InitArgs) -> Result<()> {
    let ws =
        Workspace::discover().context("Not inside a Git repository. Run `git init` first.")?;

    if ws.is_initialized() && !args.force {
        println!("ctxopt is already initialized in this repository.");
        println!("Use --force to re-initialize.");
        return Ok(());
    }

    let mut config = EngineConfig::default_init();
    if let Some(budget) = args.budget {
        config.default_budget = budget;
    }
    if let Some(essentials) = &args.essentials {
        config.default_essentials = essentials.clone();
    }
    config.generator = args.generator.clone();

    ws.init_with(&config)
        .context("Failed to initialize ctxopt")?;

    println!("ctxopt initialized. State lives in {}", ws.state_dir().display());
    println!();
    println!("Next steps:");
    println!("  ctxopt manifest add <id> --content <file>   Register a manifest");
    println!("  ctxopt route \"<task>\" --agent <type>        Build a context package");
    println!("  ctxopt mcp                                  Serve agents over MCP");
    Ok(())
}

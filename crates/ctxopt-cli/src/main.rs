use anyhow::Result;
use clap::Parser;
use tracing_subscriber::{fmt, EnvFilter};

mod commands;
mod output;

#[derive(Parser)]
#[command(
    name = "ctxopt",
    version,
    about = "Route budgeted, task-relevant context packages to coding agents"
)]
struct Cli {
    /// Increase verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Output format
    #[arg(long, global = true, default_value = "text")]
    format: output::OutputFormat,

    #[command(subcommand)]
    command: commands::Commands,
}

fn init_tracing(verbose: u8) {
    let filter = match verbose {
        0 => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        1 => EnvFilter::new("info"),
        2 => EnvFilter::new("debug"),
        _ => EnvFilter::new("trace"),
    };
    fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match &cli.command {
        commands::Commands::Init(args) => commands::init::run(args),
        commands::Commands::Route(args) => commands::route::run(args, cli.format),
        commands::Commands::Outcome(args) => commands::outcome::run(args, cli.format),
        commands::Commands::Invalidate(args) => commands::invalidate::run(args, cli.format),
        commands::Commands::Profile(cmd) => commands::profile::run(cmd, cli.format),
        commands::Commands::Manifest(cmd) => commands::manifest::run(cmd, cli.format),
        commands::Commands::Verify(args) => commands::verify::run(args, cli.format),
        commands::Commands::Stats => commands::stats::run(cli.format),
        commands::Commands::Log(args) => commands::log::run(args, cli.format),
        commands::Commands::Mcp => commands::mcp::run(),
    }
}

use anyhow::Result;
use clap::Parser;

use crewgen::agents::{run_agents_list, run_agents_show};
use crewgen::cli::{
    AgentCommands, Cli, Commands, MemoryCommands, ProviderCommands, TelemetryCommands,
    command_label,
};
use crewgen::config::{load_agent_catalog, load_profiles, resolve_runtime_config};
use crewgen::crew::{run_goal, run_plan};
use crewgen::doctor::run_doctor;
use crewgen::error::{categorize_error, format_cli_error};
use crewgen::memory::commands::{run_memory_add, run_memory_search, run_memory_seed};
use crewgen::providers::{run_providers_discover, run_providers_list};
use crewgen::telemetry::{TelemetrySink, run_telemetry_report};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let show_sensitive = cli.show_sensitive_config;
    if let Err(err) = run_cli(cli).await {
        eprintln!("{}", format_cli_error(&err, show_sensitive));
        tracing::error!(category = %categorize_error(&err).code(), error = %err, "command failed");
        std::process::exit(1);
    }

    Ok(())
}

async fn run_cli(cli: Cli) -> Result<()> {
    init_tracing(&cli.log_filter)?;
    let profiles = load_profiles(&cli.config_path)?;
    let cfg = resolve_runtime_config(&cli, &profiles)?;
    let telemetry = TelemetrySink::new(&cfg, command_label(&cli.command));

    match cli.command {
        Commands::Run { goal } => run_goal(&cfg, &goal.join(" "), &telemetry).await?,
        Commands::Plan { goal } => run_plan(&cfg, &goal.join(" "), &telemetry).await?,
        Commands::Doctor => run_doctor(&cfg).await?,
        Commands::Agents { command } => {
            let catalog = load_agent_catalog(&cfg.agents_path)?;
            match command {
                AgentCommands::List => run_agents_list(&catalog, &cfg.agents_path)?,
                AgentCommands::Show { name } => run_agents_show(&catalog, &name)?,
            }
        }
        Commands::Providers { command } => match command {
            ProviderCommands::List => run_providers_list(&cfg)?,
            ProviderCommands::Discover { provider } => {
                run_providers_discover(&cfg, provider).await?
            }
        },
        Commands::Memory { command } => match command {
            MemoryCommands::Seed { file } => run_memory_seed(&cfg, &file).await?,
            MemoryCommands::Search { subject, query } => {
                run_memory_search(&cfg, &subject, &query.join(" ")).await?
            }
            MemoryCommands::Add { subject, text } => {
                run_memory_add(&cfg, &subject, &text.join(" ")).await?
            }
        },
        Commands::Telemetry { command } => match command {
            TelemetryCommands::Report { path, limit } => run_telemetry_report(&cfg, path, limit)?,
        },
    }

    Ok(())
}

fn init_tracing(log_filter: &str) -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(log_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to initialize tracing subscriber: {e}"))
}

use clap::{Parser, Subcommand, ValueEnum};
use serde::Deserialize;

use crate::strategy::ExecutionStrategy;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Auto,
    Openai,
    Anthropic,
    Deepseek,
    Groq,
    Ollama,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryBackend {
    Disabled,
    Local,
    Mem0,
}

#[derive(Debug, Subcommand)]
pub enum AgentCommands {
    #[command(about = "List worker archetypes from the agent catalog")]
    List,
    #[command(about = "Show one worker archetype with its parsed capability tokens")]
    Show {
        #[arg(long)]
        name: String,
    },
}

#[derive(Debug, Subcommand)]
pub enum ProviderCommands {
    #[command(about = "List capability providers from the provider configuration")]
    List,
    #[command(about = "Start providers (or a specific one) and list the tools they expose")]
    Discover {
        #[arg(long)]
        provider: Option<String>,
    },
}

#[derive(Debug, Subcommand)]
pub enum MemoryCommands {
    #[command(about = "Preload per-worker guidance from a YAML seed file")]
    Seed {
        #[arg(long)]
        file: String,
    },
    #[command(about = "Search stored guidance for a worker")]
    Search {
        #[arg(long)]
        subject: String,
        #[arg(required = true)]
        query: Vec<String>,
    },
    #[command(about = "Store one piece of guidance for a worker")]
    Add {
        #[arg(long)]
        subject: String,
        #[arg(required = true)]
        text: Vec<String>,
    },
}

#[derive(Debug, Subcommand)]
pub enum TelemetryCommands {
    #[command(about = "Summarize telemetry events from a JSONL stream")]
    Report {
        #[arg(long)]
        path: Option<String>,
        #[arg(long, default_value_t = 5000)]
        limit: usize,
    },
}

const CLI_EXAMPLES: &str = "Examples:\n\
  crewgen run \"Research the EU battery regulation and write a briefing\"\n\
  crewgen --strategy hierarchical run \"Plan a product launch\"\n\
  crewgen --provider openai --model gpt-4.1 plan \"Compare three vector databases\"\n\
  crewgen agents list\n\
  crewgen agents show --name researcher\n\
  crewgen providers list\n\
  crewgen providers discover --provider browser\n\
  crewgen memory seed --file config/knowledge.yaml\n\
  crewgen memory search --subject writer \"summary style\"\n\
  crewgen telemetry report --limit 2000\n\
\n\
Configuration:\n\
  - Worker archetypes come from --agents-path (YAML).\n\
  - MCP capability providers come from --providers-path (JSON, mcpServers).\n\
  - Profile defaults come from --config-path (TOML), overridden by flags.";

#[derive(Debug, Parser)]
#[command(name = "crewgen")]
#[command(about = "Compile a goal into a crew of LLM workers and run it")]
#[command(after_long_help = CLI_EXAMPLES)]
pub struct Cli {
    #[arg(long, env = "CREWGEN_PROVIDER", value_enum, default_value_t = Provider::Auto)]
    pub provider: Provider,

    #[arg(long, env = "CREWGEN_MODEL")]
    pub model: Option<String>,

    #[arg(long, env = "CREWGEN_MANAGER_MODEL")]
    pub manager_model: Option<String>,

    #[arg(long, env = "CREWGEN_PROFILE", default_value = "default")]
    pub profile: String,

    #[arg(long, env = "CREWGEN_CONFIG", default_value = ".crewgen/config.toml")]
    pub config_path: String,

    #[arg(long, env = "CREWGEN_AGENTS_PATH")]
    pub agents_path: Option<String>,

    #[arg(long, env = "CREWGEN_PROVIDERS_PATH")]
    pub providers_path: Option<String>,

    #[arg(long, env = "CREWGEN_STRATEGY", value_enum)]
    pub strategy: Option<ExecutionStrategy>,

    #[arg(long, env = "CREWGEN_LOCALE")]
    pub locale: Option<String>,

    #[arg(long, env = "CREWGEN_WORKDIR")]
    pub workdir: Option<String>,

    #[arg(long, env = "CREWGEN_MEMORY_BACKEND", value_enum)]
    pub memory_backend: Option<MemoryBackend>,

    #[arg(long, env = "CREWGEN_MEMORY_PATH")]
    pub memory_path: Option<String>,

    #[arg(long, env = "CREWGEN_MEMORY_TIMEOUT_SECS")]
    pub memory_timeout_secs: Option<u64>,

    #[arg(long, env = "CREWGEN_MODEL_TIMEOUT_SECS")]
    pub model_timeout_secs: Option<u64>,

    #[arg(long, env = "CREWGEN_PROVIDER_START_TIMEOUT_SECS")]
    pub provider_start_timeout_secs: Option<u64>,

    #[arg(long, env = "CREWGEN_KNOWLEDGE_TASKS", action = clap::ArgAction::Set)]
    pub knowledge_tasks: Option<bool>,

    #[arg(long, env = "CREWGEN_RECORD_OUTCOMES", action = clap::ArgAction::Set)]
    pub record_outcomes: Option<bool>,

    #[arg(long, env = "CREWGEN_TELEMETRY_ENABLED", action = clap::ArgAction::Set)]
    pub telemetry_enabled: Option<bool>,

    #[arg(long, env = "CREWGEN_TELEMETRY_PATH")]
    pub telemetry_path: Option<String>,

    #[arg(long, env = "CREWGEN_SHOW_SENSITIVE_CONFIG", default_value_t = false)]
    pub show_sensitive_config: bool,

    #[arg(long, env = "RUST_LOG", default_value = "warn")]
    pub log_filter: String,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    #[command(about = "Compile a goal into a crew, augment it from memory, and execute it")]
    Run {
        #[arg(required = true)]
        goal: Vec<String>,
    },
    #[command(about = "Compile a goal and print the bound graph without executing it")]
    Plan {
        #[arg(required = true)]
        goal: Vec<String>,
    },
    #[command(about = "Validate model credentials, catalogs, and memory configuration")]
    Doctor,
    #[command(about = "Inspect worker archetypes")]
    Agents {
        #[command(subcommand)]
        command: AgentCommands,
    },
    #[command(about = "Inspect and discover MCP capability providers")]
    Providers {
        #[command(subcommand)]
        command: ProviderCommands,
    },
    #[command(about = "Seed, search, and add worker guidance in the memory store")]
    Memory {
        #[command(subcommand)]
        command: MemoryCommands,
    },
    #[command(about = "Telemetry utilities and reporting")]
    Telemetry {
        #[command(subcommand)]
        command: TelemetryCommands,
    },
}

pub fn command_label(command: &Commands) -> String {
    match command {
        Commands::Run { .. } => "run".to_string(),
        Commands::Plan { .. } => "plan".to_string(),
        Commands::Doctor => "doctor".to_string(),
        Commands::Agents { command } => match command {
            AgentCommands::List => "agents.list".to_string(),
            AgentCommands::Show { .. } => "agents.show".to_string(),
        },
        Commands::Providers { command } => match command {
            ProviderCommands::List => "providers.list".to_string(),
            ProviderCommands::Discover { .. } => "providers.discover".to_string(),
        },
        Commands::Memory { command } => match command {
            MemoryCommands::Seed { .. } => "memory.seed".to_string(),
            MemoryCommands::Search { .. } => "memory.search".to_string(),
            MemoryCommands::Add { .. } => "memory.add".to_string(),
        },
        Commands::Telemetry { command } => match command {
            TelemetryCommands::Report { .. } => "telemetry.report".to_string(),
        },
    }
}

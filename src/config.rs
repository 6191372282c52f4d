use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::capability::CapabilityToken;
use crate::cli::*;
use crate::error::CrewError;
use crate::strategy::ExecutionStrategy;

pub const DEFAULT_AGENTS_PATH: &str = "config/agents.yaml";
pub const DEFAULT_PROVIDERS_PATH: &str = "config/mcp.json";

/// Every setting a compilation reads, merged once from flags, profile, and defaults.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub profile: String,
    pub config_path: String,
    pub provider: Provider,
    pub model: Option<String>,
    pub manager_model: Option<String>,
    pub agents_path: String,
    pub providers_path: String,
    pub strategy: ExecutionStrategy,
    pub locale: String,
    pub workdir: PathBuf,
    pub memory_backend: MemoryBackend,
    pub memory_path: String,
    pub memory_timeout_secs: u64,
    pub model_timeout_secs: u64,
    pub provider_start_timeout_secs: u64,
    pub knowledge_tasks: bool,
    pub knowledge_task_path: Option<String>,
    pub record_outcomes: bool,
    pub telemetry_enabled: bool,
    pub telemetry_path: String,
    pub show_sensitive_config: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProfilesFile {
    #[serde(default)]
    pub profiles: HashMap<String, ProfileConfig>,
}

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProfileConfig {
    pub provider: Option<Provider>,
    pub model: Option<String>,
    pub manager_model: Option<String>,
    pub agents_path: Option<String>,
    pub providers_path: Option<String>,
    pub strategy: Option<ExecutionStrategy>,
    pub locale: Option<String>,
    pub workdir: Option<String>,
    pub memory_backend: Option<MemoryBackend>,
    pub memory_path: Option<String>,
    pub memory_timeout_secs: Option<u64>,
    pub model_timeout_secs: Option<u64>,
    pub provider_start_timeout_secs: Option<u64>,
    pub knowledge_tasks: Option<bool>,
    pub knowledge_task_path: Option<String>,
    pub record_outcomes: Option<bool>,
    pub telemetry_enabled: Option<bool>,
    pub telemetry_path: Option<String>,
}

pub fn load_profiles(config_path: &str) -> Result<ProfilesFile> {
    let path = Path::new(config_path);
    if !path.exists() {
        return Ok(ProfilesFile::default());
    }

    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read profile config file at '{}'", path.display()))?;
    toml::from_str::<ProfilesFile>(&content).with_context(|| {
        format!(
            "invalid profile configuration in '{}'. Check provider/strategy values and field names.",
            path.display()
        )
    })
}

pub fn resolve_runtime_config(cli: &Cli, profiles: &ProfilesFile) -> Result<RuntimeConfig> {
    let selected = cli.profile.trim();
    if selected.is_empty() {
        return Err(anyhow::anyhow!(
            "profile name cannot be empty. Set --profile <name>."
        ));
    }

    let profile = if selected == "default" && !profiles.profiles.contains_key("default") {
        ProfileConfig::default()
    } else {
        profiles.profiles.get(selected).cloned().ok_or_else(|| {
            let mut names = profiles.profiles.keys().cloned().collect::<Vec<String>>();
            names.sort();
            if names.is_empty() {
                anyhow::anyhow!(
                    "profile '{}' not found in '{}'. No profiles are defined yet.",
                    selected,
                    cli.config_path
                )
            } else {
                anyhow::anyhow!(
                    "profile '{}' not found in '{}'. Available profiles: {}",
                    selected,
                    cli.config_path,
                    names.join(", ")
                )
            }
        })?
    };

    let provider = if cli.provider != Provider::Auto {
        cli.provider
    } else {
        profile.provider.unwrap_or(Provider::Auto)
    };

    Ok(RuntimeConfig {
        profile: selected.to_string(),
        config_path: cli.config_path.clone(),
        provider,
        model: cli.model.clone().or(profile.model),
        manager_model: cli.manager_model.clone().or(profile.manager_model),
        agents_path: cli
            .agents_path
            .clone()
            .or(profile.agents_path)
            .unwrap_or_else(|| DEFAULT_AGENTS_PATH.to_string()),
        providers_path: cli
            .providers_path
            .clone()
            .or(profile.providers_path)
            .unwrap_or_else(|| DEFAULT_PROVIDERS_PATH.to_string()),
        strategy: cli
            .strategy
            .or(profile.strategy)
            .unwrap_or(ExecutionStrategy::Sequential),
        locale: cli
            .locale
            .clone()
            .or(profile.locale)
            .map(|locale| locale.trim().to_string())
            .filter(|locale| !locale.is_empty())
            .unwrap_or_else(|| "English".to_string()),
        workdir: PathBuf::from(
            cli.workdir
                .clone()
                .or(profile.workdir)
                .unwrap_or_else(|| ".".to_string()),
        ),
        memory_backend: cli
            .memory_backend
            .or(profile.memory_backend)
            .unwrap_or(MemoryBackend::Local),
        memory_path: cli
            .memory_path
            .clone()
            .or(profile.memory_path)
            .unwrap_or_else(|| ".crewgen/memory.json".to_string()),
        memory_timeout_secs: cli
            .memory_timeout_secs
            .or(profile.memory_timeout_secs)
            .unwrap_or(10)
            .max(1),
        model_timeout_secs: cli
            .model_timeout_secs
            .or(profile.model_timeout_secs)
            .unwrap_or(120)
            .max(1),
        provider_start_timeout_secs: cli
            .provider_start_timeout_secs
            .or(profile.provider_start_timeout_secs)
            .unwrap_or(30)
            .max(1),
        knowledge_tasks: cli
            .knowledge_tasks
            .or(profile.knowledge_tasks)
            .unwrap_or(false),
        knowledge_task_path: profile.knowledge_task_path,
        record_outcomes: cli
            .record_outcomes
            .or(profile.record_outcomes)
            .unwrap_or(false),
        telemetry_enabled: cli
            .telemetry_enabled
            .or(profile.telemetry_enabled)
            .unwrap_or(true),
        telemetry_path: cli
            .telemetry_path
            .clone()
            .or(profile.telemetry_path)
            .unwrap_or_else(|| ".crewgen/telemetry/events.jsonl".to_string()),
        show_sensitive_config: cli.show_sensitive_config,
    })
}

/// A named, reusable role from the worker catalog.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkerArchetype {
    pub name: String,
    pub role: Option<String>,
    pub goal: String,
    pub backstory: String,
    pub tools: Vec<String>,
    pub params: BTreeMap<String, Value>,
}

impl WorkerArchetype {
    pub fn allow_delegation(&self) -> bool {
        self.params
            .get("allow_delegation")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    pub fn verbose(&self) -> bool {
        self.params
            .get("verbose")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    pub fn capability_tokens(&self) -> Vec<CapabilityToken> {
        self.tools
            .iter()
            .filter_map(|raw| CapabilityToken::parse(raw))
            .collect()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum ToolList {
    Csv(String),
    List(Vec<String>),
}

impl Default for ToolList {
    fn default() -> Self {
        ToolList::List(Vec::new())
    }
}

impl ToolList {
    fn into_tokens(self) -> Vec<String> {
        let raw = match self {
            ToolList::Csv(value) => value.split(',').map(str::to_string).collect(),
            ToolList::List(values) => values,
        };
        raw.into_iter()
            .map(|token| token.trim().to_string())
            .filter(|token| !token.is_empty())
            .collect()
    }
}

#[derive(Debug, Deserialize)]
struct ArchetypeFile {
    role: Option<String>,
    goal: String,
    #[serde(default)]
    backstory: String,
    #[serde(default)]
    tools: ToolList,
    #[serde(flatten)]
    params: BTreeMap<String, Value>,
}

/// Worker archetypes in catalog order.
#[derive(Debug, Clone, Default)]
pub struct AgentCatalog {
    archetypes: Vec<WorkerArchetype>,
}

impl AgentCatalog {
    pub fn new(archetypes: Vec<WorkerArchetype>) -> Self {
        Self { archetypes }
    }

    pub fn get(&self, name: &str) -> Option<&WorkerArchetype> {
        self.archetypes.iter().find(|archetype| archetype.name == name)
    }

    pub fn names(&self) -> Vec<String> {
        self.archetypes
            .iter()
            .map(|archetype| archetype.name.clone())
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &WorkerArchetype> {
        self.archetypes.iter()
    }

    pub fn len(&self) -> usize {
        self.archetypes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.archetypes.is_empty()
    }
}

pub fn load_agent_catalog(path: &str) -> Result<AgentCatalog, CrewError> {
    let content = std::fs::read_to_string(path).map_err(|err| CrewError::ConfigLoad {
        path: path.to_string(),
        message: format!("failed to read worker catalog: {err}"),
    })?;
    parse_agent_catalog(&content, path)
}

pub fn parse_agent_catalog(content: &str, path: &str) -> Result<AgentCatalog, CrewError> {
    let config_error = |message: String| CrewError::ConfigLoad {
        path: path.to_string(),
        message,
    };

    let document = serde_yaml::from_str::<serde_yaml::Mapping>(content)
        .map_err(|err| config_error(format!("worker catalog must be a mapping: {err}")))?;

    let mut archetypes = Vec::<WorkerArchetype>::with_capacity(document.len());
    for (key, value) in document {
        let name = key
            .as_str()
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .ok_or_else(|| config_error("worker names must be non-empty strings".to_string()))?
            .to_string();
        let parsed = serde_yaml::from_value::<ArchetypeFile>(value)
            .map_err(|err| config_error(format!("invalid worker '{name}': {err}")))?;
        archetypes.push(WorkerArchetype {
            name,
            role: parsed.role,
            goal: parsed.goal,
            backstory: parsed.backstory,
            tools: parsed.tools.into_tokens(),
            params: parsed.params,
        });
    }

    if archetypes.is_empty() {
        return Err(config_error("worker catalog defines no workers".to_string()));
    }

    Ok(AgentCatalog::new(archetypes))
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct McpServerConfig {
    #[serde(skip)]
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    pub enabled: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
struct ProviderConfigFile {
    #[serde(rename = "mcpServers", default)]
    mcp_servers: BTreeMap<String, McpServerConfig>,
}

/// Reads the provider document. Absent or malformed documents mean no providers.
pub fn load_provider_config(path: &str) -> Vec<McpServerConfig> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(err) => {
            tracing::warn!(
                path = %path,
                error = %err,
                "provider configuration unavailable; continuing with local capabilities only"
            );
            return Vec::new();
        }
    };

    match parse_provider_config(&content) {
        Ok(servers) => servers,
        Err(err) => {
            tracing::warn!(
                path = %path,
                error = %err,
                "provider configuration is malformed; continuing with local capabilities only"
            );
            Vec::new()
        }
    }
}

pub fn parse_provider_config(content: &str) -> Result<Vec<McpServerConfig>> {
    let parsed = serde_json::from_str::<ProviderConfigFile>(content)
        .context("provider configuration must be a JSON object with an 'mcpServers' map")?;
    Ok(parsed
        .mcp_servers
        .into_iter()
        .map(|(name, mut server)| {
            server.name = name;
            server
        })
        .collect())
}

pub fn enabled_servers(servers: &[McpServerConfig]) -> Vec<McpServerConfig> {
    servers
        .iter()
        .filter(|server| server.enabled.unwrap_or(true))
        .cloned()
        .collect()
}

/// Follow-up instruction appended after each worker's last task.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct KnowledgeTaskTemplate {
    pub description: String,
    pub expected_output: Option<String>,
}

impl Default for KnowledgeTaskTemplate {
    fn default() -> Self {
        Self {
            description: "As {agent_name}, review the work you just completed. Extract the \
                          reusable lessons, pitfalls, and checklists that would help the next \
                          {agent_name} on a similar goal, and store them with the memory \
                          capability using mode 'add'."
                .to_string(),
            expected_output: Some(
                "A short list of the lessons that were stored for {agent_name}.".to_string(),
            ),
        }
    }
}

impl KnowledgeTaskTemplate {
    pub fn render_description(&self, agent_name: &str) -> String {
        self.description.replace("{agent_name}", agent_name)
    }

    pub fn render_expected_output(&self, agent_name: &str) -> Option<String> {
        self.expected_output
            .as_ref()
            .map(|text| text.replace("{agent_name}", agent_name))
    }
}

#[derive(Debug, Deserialize)]
struct KnowledgeTaskFile {
    task_config: KnowledgeTaskTemplate,
}

pub fn load_knowledge_task_template(path: Option<&str>) -> Result<KnowledgeTaskTemplate> {
    let Some(path) = path else {
        return Ok(KnowledgeTaskTemplate::default());
    };
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read knowledge task template '{}'", path))?;
    let parsed = serde_yaml::from_str::<KnowledgeTaskFile>(&content).with_context(|| {
        format!(
            "invalid knowledge task template in '{}'. Expected a 'task_config' mapping.",
            path
        )
    })?;
    Ok(parsed.task_config)
}

#[cfg(test)]
mod tests {
    use super::*;

    const CATALOG: &str = r#"
writer:
  goal: Write clear summaries
  backstory: Former newspaper editor
  tools: "write_file, memory"
  allow_delegation: false
researcher:
  role: Research lead
  goal: Find facts
  backstory: Librarian
  tools:
    - search_internet
    - browser_navigate(browser)
    - "*(fetch)"
  verbose: true
  max_iter: 5
"#;

    #[test]
    fn catalog_keeps_document_order() {
        let catalog = parse_agent_catalog(CATALOG, "agents.yaml").unwrap();
        assert_eq!(catalog.names(), vec!["writer", "researcher"]);
    }

    #[test]
    fn catalog_accepts_csv_and_list_tools() {
        let catalog = parse_agent_catalog(CATALOG, "agents.yaml").unwrap();
        assert_eq!(catalog.get("writer").unwrap().tools, vec!["write_file", "memory"]);
        assert_eq!(
            catalog.get("researcher").unwrap().tools,
            vec!["search_internet", "browser_navigate(browser)", "*(fetch)"]
        );
    }

    #[test]
    fn catalog_keeps_free_form_params() {
        let catalog = parse_agent_catalog(CATALOG, "agents.yaml").unwrap();
        let researcher = catalog.get("researcher").unwrap();
        assert!(researcher.verbose());
        assert!(!researcher.allow_delegation());
        assert_eq!(researcher.params.get("max_iter"), Some(&serde_json::json!(5)));
        assert!(!researcher.params.contains_key("goal"));
        assert_eq!(researcher.role.as_deref(), Some("Research lead"));
    }

    #[test]
    fn catalog_missing_goal_is_config_error() {
        let err = parse_agent_catalog("writer:\n  backstory: x\n", "agents.yaml").unwrap_err();
        assert!(matches!(err, CrewError::ConfigLoad { .. }));
        assert!(err.to_string().contains("writer"));
    }

    #[test]
    fn catalog_missing_file_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.yaml");
        let err = load_agent_catalog(path.to_str().unwrap()).unwrap_err();
        assert!(matches!(err, CrewError::ConfigLoad { .. }));
    }

    #[test]
    fn provider_config_parses_mcp_servers() {
        let servers = parse_provider_config(
            r#"{"mcpServers": {"browser": {"command": "npx", "args": ["@playwright/mcp@latest"], "env": {"DEBUG": "1"}}}}"#,
        )
        .unwrap();
        assert_eq!(servers.len(), 1);
        assert_eq!(servers[0].name, "browser");
        assert_eq!(servers[0].command, "npx");
        assert_eq!(servers[0].env.get("DEBUG").map(String::as_str), Some("1"));
    }

    #[test]
    fn malformed_or_missing_provider_config_degrades_to_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mcp.json");
        assert!(load_provider_config(path.to_str().unwrap()).is_empty());

        std::fs::write(&path, "{not json").unwrap();
        assert!(load_provider_config(path.to_str().unwrap()).is_empty());
    }

    #[test]
    fn disabled_servers_are_filtered() {
        let servers = parse_provider_config(
            r#"{"mcpServers": {"a": {"command": "a"}, "b": {"command": "b", "enabled": false}}}"#,
        )
        .unwrap();
        let enabled = enabled_servers(&servers);
        assert_eq!(enabled.len(), 1);
        assert_eq!(enabled[0].name, "a");
    }

    #[test]
    fn knowledge_template_substitutes_agent_name() {
        let template = KnowledgeTaskTemplate {
            description: "Record what {agent_name} learned".to_string(),
            expected_output: None,
        };
        assert_eq!(template.render_description("writer"), "Record what writer learned");
        assert_eq!(template.render_expected_output("writer"), None);
    }

    #[test]
    fn knowledge_template_loads_task_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("knol_task.yaml");
        std::fs::write(
            &path,
            "task_config:\n  description: \"Store lessons for {agent_name}\"\n  expected_output: done\n",
        )
        .unwrap();
        let template = load_knowledge_task_template(path.to_str()).unwrap();
        assert_eq!(template.render_description("qa"), "Store lessons for qa");
    }
}

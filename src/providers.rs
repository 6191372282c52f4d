//! MCP capability providers launched as stdio subprocesses.

use std::borrow::Cow;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use rmcp::ServiceExt;
use rmcp::model::{CallToolRequestParam, Content, RawContent};
use rmcp::service::{Peer, RoleClient, RunningService};
use rmcp::transport::child_process::TokioChildProcess;
use serde_json::{Value, json};
use tokio::process::Command;

use crate::capability::{Capability, CapabilityHandle, CapabilityRegistry, ProviderProcess};
use crate::config::{McpServerConfig, RuntimeConfig, enabled_servers, load_provider_config};
use crate::error::CrewError;

/// One tool exposed by a running MCP provider.
pub struct McpCapability {
    provider: String,
    name: String,
    description: String,
    peer: Peer<RoleClient>,
}

fn extract_text(content: &[Content]) -> String {
    content
        .iter()
        .filter_map(|c| match &c.raw {
            RawContent::Text(text) => Some(text.text.clone()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("")
}

#[async_trait]
impl Capability for McpCapability {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn provider(&self) -> Option<&str> {
        Some(&self.provider)
    }

    async fn invoke(&self, args: Value) -> Result<Value> {
        tracing::debug!(provider = %self.provider, tool = %self.name, "Calling MCP tool");
        let arguments = match args {
            Value::Object(map) => Some(map),
            Value::Null => None,
            other => {
                return Ok(json!({
                    "error": format!("arguments for '{}' must be a JSON object, got {other}", self.name)
                }));
            }
        };

        let result = self
            .peer
            .call_tool(CallToolRequestParam {
                name: Cow::Owned(self.name.clone()),
                arguments,
            })
            .await
            .map_err(|err| CrewError::ProviderProcess {
                provider: self.provider.clone(),
                message: format!("tool call '{}' failed: {err}", self.name),
            })?;

        let text = extract_text(&result.content);
        if result.is_error.unwrap_or(false) {
            return Ok(json!({ "error": text }));
        }
        Ok(json!({ "output": text }))
    }
}

/// Owns the MCP client session; dropping it cancels the session and kills the child.
pub struct McpProcess {
    provider: String,
    running: RunningService<RoleClient, ()>,
}

#[async_trait]
impl ProviderProcess for McpProcess {
    fn provider(&self) -> &str {
        &self.provider
    }

    async fn stop(self: Box<Self>) -> Result<()> {
        let provider = self.provider.clone();
        self.running
            .cancel()
            .await
            .map(|reason| tracing::debug!(provider = %provider, reason = ?reason, "MCP session closed"))
            .map_err(|err| anyhow::anyhow!("provider '{}' did not shut down: {err}", provider))
    }
}

pub struct StartedProvider {
    pub name: String,
    pub handles: Vec<CapabilityHandle>,
    pub process: McpProcess,
}

fn tool_description(tool: &impl serde::Serialize) -> Option<String> {
    serde_json::to_value(tool)
        .ok()?
        .get("description")?
        .as_str()
        .map(str::to_string)
        .filter(|text| !text.trim().is_empty())
}

pub fn provider_command(server: &McpServerConfig) -> Command {
    let mut cmd = Command::new(&server.command);
    cmd.args(&server.args)
        .envs(&server.env)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .kill_on_drop(true);
    cmd
}

/// Spawns one provider, completes the handshake, and wraps its tools.
pub async fn start_provider(server: &McpServerConfig) -> Result<StartedProvider, CrewError> {
    let provider_error = |message: String| CrewError::ProviderProcess {
        provider: server.name.clone(),
        message,
    };

    tracing::info!(provider = %server.name, command = %server.command, "Starting MCP provider");
    let mut cmd = provider_command(server);
    let transport = TokioChildProcess::new(&mut cmd)
        .map_err(|err| provider_error(format!("failed to spawn '{}': {err}", server.command)))?;

    let running = ()
        .serve(transport)
        .await
        .map_err(|err| provider_error(format!("MCP handshake failed: {err}")))?;

    let peer = running.peer().clone();
    let tools = match peer.list_all_tools().await {
        Ok(tools) => tools,
        Err(err) => {
            let _ = running.cancel().await;
            return Err(provider_error(format!("failed to list tools: {err}")));
        }
    };

    let handles = tools
        .iter()
        .map(|tool| {
            let name = tool.name.to_string();
            let description = tool_description(tool).unwrap_or_else(|| {
                format!("Tool '{}' from capability provider '{}'", name, server.name)
            });
            Arc::new(McpCapability {
                provider: server.name.clone(),
                name,
                description,
                peer: peer.clone(),
            }) as CapabilityHandle
        })
        .collect::<Vec<CapabilityHandle>>();

    Ok(StartedProvider {
        name: server.name.clone(),
        handles,
        process: McpProcess {
            provider: server.name.clone(),
            running,
        },
    })
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DiscoveryReport {
    pub started: Vec<(String, usize)>,
    pub failed: Vec<(String, String)>,
}

/// Starts every server concurrently and registers what came up.
///
/// Failures are logged and the provider is marked unavailable; discovery itself never fails.
pub async fn discover_into(
    registry: &mut CapabilityRegistry,
    servers: &[McpServerConfig],
    start_timeout: Duration,
) -> DiscoveryReport {
    let attempts = servers.iter().map(|server| async move {
        let outcome = match tokio::time::timeout(start_timeout, start_provider(server)).await {
            Ok(result) => result,
            Err(_) => Err(CrewError::ProviderProcess {
                provider: server.name.clone(),
                message: format!("start-up exceeded {}s", start_timeout.as_secs()),
            }),
        };
        (server.name.clone(), outcome)
    });

    let mut report = DiscoveryReport::default();
    for (name, outcome) in futures::future::join_all(attempts).await {
        match outcome {
            Ok(started) => {
                tracing::info!(
                    provider = %started.name,
                    tools = started.handles.len(),
                    "MCP tools discovered"
                );
                report.started.push((started.name.clone(), started.handles.len()));
                registry.register_provider(started.name, started.handles);
                registry.attach_process(Box::new(started.process));
            }
            Err(err) => {
                tracing::warn!(
                    provider = %name,
                    error = %err,
                    "MCP provider unavailable; continuing without its tools"
                );
                registry.mark_unavailable(name.clone());
                report.failed.push((name, err.to_string()));
            }
        }
    }
    report
}

pub fn select_servers(cfg: &RuntimeConfig, provider: Option<&str>) -> Result<Vec<McpServerConfig>> {
    let active = enabled_servers(&load_provider_config(&cfg.providers_path));
    if let Some(name) = provider {
        let server = active
            .into_iter()
            .find(|server| server.name == name)
            .ok_or_else(|| anyhow::anyhow!("MCP provider '{}' not found or not enabled", name))?;
        return Ok(vec![server]);
    }
    Ok(active)
}

pub fn run_providers_list(cfg: &RuntimeConfig) -> Result<()> {
    let servers = load_provider_config(&cfg.providers_path);
    if servers.is_empty() {
        println!("No capability providers configured in '{}'.", cfg.providers_path);
        return Ok(());
    }

    println!("Capability providers in '{}':", cfg.providers_path);
    for server in servers {
        let state = if server.enabled.unwrap_or(true) {
            "enabled"
        } else {
            "disabled"
        };
        println!(
            "- {} ({}) command='{} {}' env_keys={}",
            server.name,
            state,
            server.command,
            server.args.join(" "),
            server.env.len()
        );
    }
    Ok(())
}

pub async fn run_providers_discover(cfg: &RuntimeConfig, provider: Option<String>) -> Result<()> {
    let servers = select_servers(cfg, provider.as_deref())?;
    if servers.is_empty() {
        println!("No enabled capability providers to discover.");
        return Ok(());
    }

    let mut registry = CapabilityRegistry::new();
    let report = discover_into(
        &mut registry,
        &servers,
        Duration::from_secs(cfg.provider_start_timeout_secs),
    )
    .await;

    for (name, _) in &report.started {
        println!("Provider '{}':", name);
        for handle in registry.provider_tools(name) {
            println!("- {}: {}", handle.name(), handle.description());
        }
    }
    for (name, error) in &report.failed {
        println!("Provider '{}' unavailable: {}", name, error);
    }

    registry.shutdown().await;
    Ok(())
}

//! Capability registry: maps symbolic tool tokens to callable handles.
//!
//! Handles come from three places: local built-ins registered at start-up, tools
//! discovered from MCP provider processes, and the memory capability that every
//! worker receives whether or not its archetype asks for it. The registry also
//! owns the provider processes and stops them exactly once in [`CapabilityRegistry::shutdown`].

pub mod builtin;
pub mod memory_tool;

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;

use crate::error::CrewError;

pub const MEMORY_CAPABILITY: &str = "memory";

const ALL_TOOLS_MARKER: &str = "*";

/// An invocable action a worker may use.
#[async_trait]
pub trait Capability: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// Provider that exposed this capability, `None` for local built-ins.
    fn provider(&self) -> Option<&str> {
        None
    }

    async fn invoke(&self, args: Value) -> Result<Value>;
}

pub type CapabilityHandle = Arc<dyn Capability>;

/// A parsed capability reference from a worker archetype.
///
/// `name` is local, `name(provider)` is provider-qualified, and `*(provider)`
/// selects every tool the provider exposes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CapabilityToken {
    Local(String),
    Provider { provider: String, name: String },
    ProviderAll(String),
}

impl CapabilityToken {
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return None;
        }

        if let Some(body) = raw.strip_suffix(')')
            && let Some(open) = body.rfind('(')
        {
            let name = body[..open].trim();
            let provider = body[open + 1..].trim();
            if !provider.is_empty() && !name.is_empty() {
                if name == ALL_TOOLS_MARKER {
                    return Some(CapabilityToken::ProviderAll(provider.to_string()));
                }
                return Some(CapabilityToken::Provider {
                    provider: provider.to_string(),
                    name: name.to_string(),
                });
            }
        }

        Some(CapabilityToken::Local(raw.to_string()))
    }

    pub fn provider(&self) -> Option<&str> {
        match self {
            CapabilityToken::Local(_) => None,
            CapabilityToken::Provider { provider, .. } | CapabilityToken::ProviderAll(provider) => {
                Some(provider)
            }
        }
    }
}

impl fmt::Display for CapabilityToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CapabilityToken::Local(name) => write!(f, "{name}"),
            CapabilityToken::Provider { provider, name } => write!(f, "{name}({provider})"),
            CapabilityToken::ProviderAll(provider) => write!(f, "{ALL_TOOLS_MARKER}({provider})"),
        }
    }
}

/// A running capability provider that must be stopped when the run ends.
#[async_trait]
pub trait ProviderProcess: Send {
    fn provider(&self) -> &str;

    async fn stop(self: Box<Self>) -> Result<()>;
}

#[derive(Default)]
pub struct CapabilityRegistry {
    local: BTreeMap<String, CapabilityHandle>,
    providers: BTreeMap<String, Vec<CapabilityHandle>>,
    unavailable: BTreeSet<String>,
    processes: Vec<Box<dyn ProviderProcess>>,
    shut_down: bool,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_local(&mut self, handle: CapabilityHandle) {
        let name = handle.name().to_string();
        self.register_local_as(name, handle);
    }

    pub fn register_local_as(&mut self, name: impl Into<String>, handle: CapabilityHandle) {
        let name = name.into();
        if self.local.insert(name.clone(), handle).is_some() {
            tracing::debug!(capability = %name, "replaced local capability");
        }
    }

    pub fn register_provider(&mut self, provider: impl Into<String>, handles: Vec<CapabilityHandle>) {
        let provider = provider.into();
        self.unavailable.remove(&provider);
        tracing::info!(provider = %provider, tools = handles.len(), "registered provider capabilities");
        self.providers.insert(provider, handles);
    }

    /// Records a provider that is configured but failed to start.
    pub fn mark_unavailable(&mut self, provider: impl Into<String>) {
        let provider = provider.into();
        self.providers.remove(&provider);
        self.unavailable.insert(provider);
    }

    pub fn attach_process(&mut self, process: Box<dyn ProviderProcess>) {
        self.processes.push(process);
    }

    pub fn local_names(&self) -> Vec<String> {
        self.local.keys().cloned().collect()
    }

    pub fn unavailable_providers(&self) -> Vec<String> {
        self.unavailable.iter().cloned().collect()
    }

    pub fn provider_tools(&self, provider: &str) -> &[CapabilityHandle] {
        self.providers
            .get(provider)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn running_processes(&self) -> usize {
        self.processes.len()
    }

    /// Resolves one token. Single-tool tokens yield exactly one handle.
    pub fn resolve(&self, token: &CapabilityToken) -> Result<Vec<CapabilityHandle>, CrewError> {
        self.resolve_for(token, "unassigned")
    }

    pub fn resolve_str(&self, raw: &str) -> Result<Vec<CapabilityHandle>, CrewError> {
        let token = CapabilityToken::parse(raw).ok_or_else(|| CrewError::CapabilityNotFound {
            token: raw.to_string(),
            worker: "unassigned".to_string(),
        })?;
        self.resolve(&token)
    }

    fn resolve_for(
        &self,
        token: &CapabilityToken,
        worker: &str,
    ) -> Result<Vec<CapabilityHandle>, CrewError> {
        let not_found = || CrewError::CapabilityNotFound {
            token: token.to_string(),
            worker: worker.to_string(),
        };

        if let Some(provider) = token.provider()
            && self.unavailable.contains(provider)
        {
            tracing::warn!(
                provider = %provider,
                token = %token,
                worker = %worker,
                "provider unavailable; skipping its capabilities"
            );
            return Ok(Vec::new());
        }

        match token {
            CapabilityToken::Local(name) => self
                .local
                .get(name)
                .map(|handle| vec![handle.clone()])
                .ok_or_else(not_found),
            CapabilityToken::Provider { provider, name } => self
                .providers
                .get(provider)
                .and_then(|handles| handles.iter().find(|handle| handle.name() == name))
                .map(|handle| vec![handle.clone()])
                .ok_or_else(not_found),
            CapabilityToken::ProviderAll(provider) => self
                .providers
                .get(provider)
                .cloned()
                .ok_or_else(not_found),
        }
    }

    /// Resolves a worker's tokens and appends the mandatory memory capability.
    ///
    /// The local memory handle is always the one injected; a provider tool that
    /// shares its name is dropped, as is any later tool whose name is already taken.
    pub fn resolve_for_worker(
        &self,
        worker: &str,
        tokens: &[CapabilityToken],
    ) -> Result<Vec<CapabilityHandle>, CrewError> {
        let memory = self
            .local
            .get(MEMORY_CAPABILITY)
            .cloned()
            .ok_or_else(|| CrewError::CapabilityNotFound {
                token: MEMORY_CAPABILITY.to_string(),
                worker: worker.to_string(),
            })?;

        let mut resolved = Vec::<CapabilityHandle>::new();
        for token in tokens {
            for handle in self.resolve_for(token, worker)? {
                if Arc::ptr_eq(&handle, &memory)
                    || resolved.iter().any(|kept| Arc::ptr_eq(kept, &handle))
                {
                    continue;
                }
                if handle.name() == MEMORY_CAPABILITY {
                    tracing::warn!(
                        worker = %worker,
                        token = %token,
                        provider = handle.provider().unwrap_or("local"),
                        "capability name collides with the memory capability; dropped"
                    );
                    continue;
                }
                if let Some(kept) = resolved.iter().find(|kept| kept.name() == handle.name()) {
                    tracing::warn!(
                        worker = %worker,
                        capability = %handle.name(),
                        kept = kept.provider().unwrap_or("local"),
                        dropped = handle.provider().unwrap_or("local"),
                        "capability name collision; keeping the first binding"
                    );
                    continue;
                }
                resolved.push(handle);
            }
        }

        resolved.push(memory);
        Ok(resolved)
    }

    /// Stops every attached provider process. Later calls are no-ops.
    pub async fn shutdown(&mut self) -> usize {
        if self.shut_down {
            tracing::debug!("capability registry already shut down");
            return 0;
        }
        self.shut_down = true;

        let processes = std::mem::take(&mut self.processes);
        let count = processes.len();
        for process in processes {
            let provider = process.provider().to_string();
            match process.stop().await {
                Ok(()) => tracing::info!(provider = %provider, "provider process stopped"),
                Err(err) => tracing::warn!(
                    provider = %provider,
                    error = %err,
                    "provider process did not stop cleanly"
                ),
            }
        }
        count
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down
    }
}

impl Drop for CapabilityRegistry {
    fn drop(&mut self) {
        if !self.processes.is_empty() {
            tracing::warn!(
                processes = self.processes.len(),
                "capability registry dropped before shutdown; provider processes are killed on drop"
            );
        }
    }
}

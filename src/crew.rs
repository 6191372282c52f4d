//! The compile-and-run pipeline behind `crewgen run` and `crewgen plan`.
//!
//! Order is fixed: synthesize the plan, bind it into a graph, augment tasks
//! from memory, then hand the graph to an execution engine. Provider
//! processes started for a compilation are always stopped before the command
//! returns, whether the run succeeded, failed, or was interrupted.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde_json::json;

use crate::augment::{AugmentPolicy, augment};
use crate::capability::builtin::{
    ScrapeWebsiteCapability, SearchInternetCapability, WriteFileCapability,
};
use crate::capability::memory_tool::MemoryCapability;
use crate::capability::CapabilityRegistry;
use crate::config::{
    AgentCatalog, RuntimeConfig, enabled_servers, load_agent_catalog, load_knowledge_task_template,
    load_provider_config,
};
use crate::engine::{ExecutionEngine, ExecutionReport, LlmExecutionEngine};
use crate::error::CrewError;
use crate::graph::{BuildOptions, Graph, GraphBuilder};
use crate::llm::{ChatModel, resolve_models};
use crate::memory::{MemoryService, build_memory_service};
use crate::planner::{Plan, synthesize};
use crate::providers::discover_into;
use crate::strategy::{ExecutionStrategy, select};
use crate::telemetry::{TelemetrySink, preview};

/// Registry holding the built-in capabilities and the memory capability.
pub fn base_registry(workdir: &Path, memory: Arc<dyn MemoryService>) -> CapabilityRegistry {
    let mut registry = CapabilityRegistry::new();
    registry.register_local(Arc::new(WriteFileCapability::new(workdir)));
    registry.register_local(Arc::new(SearchInternetCapability::default()));
    registry.register_local(Arc::new(ScrapeWebsiteCapability::default()));
    registry.register_local(Arc::new(MemoryCapability::new(memory)));
    registry
}

#[derive(Debug, Clone)]
pub struct CompiledCrew {
    pub plan: Plan,
    pub graph: Graph,
}

#[derive(Debug, Clone)]
pub struct CrewRun {
    pub compiled: CompiledCrew,
    pub report: ExecutionReport,
}

/// Everything a compilation needs besides the capability registry.
pub struct CrewContext {
    pub catalog: AgentCatalog,
    pub planner: Arc<dyn ChatModel>,
    pub memory: Arc<dyn MemoryService>,
    pub locale: String,
    pub strategy: ExecutionStrategy,
    pub build_options: BuildOptions,
    pub augment_policy: AugmentPolicy,
    pub telemetry: TelemetrySink,
}

impl CrewContext {
    pub async fn compile(
        &self,
        registry: &CapabilityRegistry,
        goal: &str,
    ) -> Result<CompiledCrew, CrewError> {
        self.telemetry.emit(
            "compile.started",
            json!({"goal": preview(goal, 150), "strategy": self.strategy}),
        );

        let plan = synthesize(
            self.planner.as_ref(),
            goal,
            &self.catalog.names(),
            &self.locale,
        )
        .await?;
        self.telemetry.emit(
            "plan.synthesized",
            json!({"workers": plan.workers.len(), "tasks": plan.tasks.len()}),
        );

        let graph = GraphBuilder::new(&self.catalog, registry).build(
            goal,
            &plan,
            self.strategy,
            &self.build_options,
        )?;
        self.telemetry.emit(
            "graph.built",
            json!({
                "strategy": graph.strategy,
                "workers": graph.workers.len(),
                "tasks": graph.tasks.len(),
            }),
        );

        let graph = augment(graph, self.memory.as_ref(), &self.augment_policy).await;
        for (index, task) in graph.tasks.iter().enumerate() {
            if let Some(guidance) = task.recalled_guidance.as_ref() {
                self.telemetry.emit(
                    "task.augmented",
                    json!({
                        "task": index + 1,
                        "worker": graph.worker_for(task).name,
                        "score": guidance.score,
                    }),
                );
            }
        }

        Ok(CompiledCrew { plan, graph })
    }

    async fn compile_and_execute(
        &self,
        registry: &CapabilityRegistry,
        goal: &str,
        engine: &dyn ExecutionEngine,
    ) -> Result<CrewRun, CrewError> {
        let compiled = self.compile(registry, goal).await?;
        let report = engine.run(&compiled.graph).await?;
        Ok(CrewRun { compiled, report })
    }

    /// Compiles and executes `goal`, then stops the registry's provider processes.
    ///
    /// Ctrl-C abandons the run with an execution error; shutdown still happens.
    pub async fn run(
        &self,
        registry: &mut CapabilityRegistry,
        goal: &str,
        engine: &dyn ExecutionEngine,
    ) -> Result<CrewRun, CrewError> {
        let outcome = {
            let work = self.compile_and_execute(registry, goal, engine);
            tokio::select! {
                result = work => result,
                _ = tokio::signal::ctrl_c() => Err(CrewError::Execution {
                    message: "interrupted".to_string(),
                }),
            }
        };

        let stopped = registry.shutdown().await;
        tracing::debug!(stopped, "provider processes stopped");

        match &outcome {
            Ok(run) => self.telemetry.emit(
                "run.completed",
                json!({
                    "strategy": run.report.strategy,
                    "tasks": run.report.task_outputs.len(),
                    "providers_stopped": stopped,
                }),
            ),
            Err(err) => self.telemetry.emit(
                "run.failed",
                json!({
                    "category": err.category().code(),
                    "error": preview(&err.to_string(), 300),
                    "providers_stopped": stopped,
                }),
            ),
        }
        outcome
    }

    /// Like [`CrewContext::run`] without the engine.
    pub async fn plan_only(
        &self,
        registry: &mut CapabilityRegistry,
        goal: &str,
    ) -> Result<CompiledCrew, CrewError> {
        let outcome = {
            let work = self.compile(registry, goal);
            tokio::select! {
                result = work => result,
                _ = tokio::signal::ctrl_c() => Err(CrewError::Execution {
                    message: "interrupted".to_string(),
                }),
            }
        };
        registry.shutdown().await;
        outcome
    }
}

/// Loads config-driven collaborators, starts providers, and returns the context and registry.
async fn prepare(
    cfg: &RuntimeConfig,
    telemetry: &TelemetrySink,
) -> Result<(CrewContext, CapabilityRegistry, Arc<dyn ChatModel>)> {
    let catalog = load_agent_catalog(&cfg.agents_path)?;
    let memory = build_memory_service(cfg)?;
    let (worker_model, manager_model) = resolve_models(cfg)?;

    let build_options = BuildOptions {
        knowledge_follow_up: if cfg.knowledge_tasks {
            Some(load_knowledge_task_template(cfg.knowledge_task_path.as_deref())?)
        } else {
            None
        },
    };

    let mut registry = base_registry(&cfg.workdir, memory.clone());
    let servers = enabled_servers(&load_provider_config(&cfg.providers_path));
    if !servers.is_empty() {
        let report = discover_into(
            &mut registry,
            &servers,
            Duration::from_secs(cfg.provider_start_timeout_secs),
        )
        .await;
        for (name, tools) in &report.started {
            telemetry.emit("provider.started", json!({"provider": name, "tools": tools}));
        }
        for (name, error) in &report.failed {
            telemetry.emit(
                "provider.failed",
                json!({"provider": name, "error": preview(error, 300)}),
            );
        }
    }

    let context = CrewContext {
        catalog,
        planner: manager_model.clone(),
        memory,
        locale: cfg.locale.clone(),
        strategy: select(cfg),
        build_options,
        augment_policy: AugmentPolicy {
            enabled: true,
            timeout: Duration::from_secs(cfg.memory_timeout_secs),
        },
        telemetry: telemetry.clone(),
    };
    Ok((context, registry, worker_model))
}

fn require_goal(goal: &str) -> Result<&str> {
    let goal = goal.trim();
    if goal.is_empty() {
        anyhow::bail!("goal cannot be empty. Pass the mission as arguments, e.g. crewgen run \"...\"");
    }
    Ok(goal)
}

pub async fn run_goal(cfg: &RuntimeConfig, goal: &str, telemetry: &TelemetrySink) -> Result<()> {
    let goal = require_goal(goal)?;
    let (context, mut registry, worker_model) = prepare(cfg, telemetry).await?;
    let engine = LlmExecutionEngine::new(worker_model, context.planner.clone())
        .with_outcome_recording(cfg.record_outcomes)
        .with_telemetry(telemetry.clone());

    let run = context.run(&mut registry, goal, &engine).await?;
    println!("{}", run.report.final_output);
    Ok(())
}

pub async fn run_plan(cfg: &RuntimeConfig, goal: &str, telemetry: &TelemetrySink) -> Result<()> {
    let goal = require_goal(goal)?;
    let (context, mut registry, _) = prepare(cfg, telemetry).await?;
    let compiled = context.plan_only(&mut registry, goal).await?;
    let rendered = json!({
        "plan": compiled.plan,
        "graph": compiled.graph.summary(),
    });
    println!("{}", serde_json::to_string_pretty(&rendered)?);
    Ok(())
}

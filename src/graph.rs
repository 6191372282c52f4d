//! Binds a plan to concrete workers and tasks.

use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::Value;

use crate::capability::{CapabilityHandle, CapabilityRegistry};
use crate::config::{AgentCatalog, KnowledgeTaskTemplate, WorkerArchetype};
use crate::error::CrewError;
use crate::planner::Plan;
use crate::strategy::ExecutionStrategy;

pub const GUIDANCE_MARKER: &str = "### Prior guidance";

/// An archetype with its capabilities resolved for one compilation.
#[derive(Clone)]
pub struct ResolvedWorker {
    pub name: String,
    pub goal: String,
    pub backstory: String,
    pub allow_delegation: bool,
    pub params: BTreeMap<String, Value>,
    pub capabilities: Vec<CapabilityHandle>,
}

impl ResolvedWorker {
    pub fn capability_names(&self) -> Vec<String> {
        self.capabilities
            .iter()
            .map(|handle| handle.name().to_string())
            .collect()
    }

    pub fn capability(&self, name: &str) -> Option<&CapabilityHandle> {
        self.capabilities.iter().find(|handle| handle.name() == name)
    }
}

impl std::fmt::Debug for ResolvedWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolvedWorker")
            .field("name", &self.name)
            .field("goal", &self.goal)
            .field("allow_delegation", &self.allow_delegation)
            .field("capabilities", &self.capability_names())
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecalledGuidance {
    pub text: String,
    pub score: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Planned,
    KnowledgeFollowUp,
    Delegated,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BoundTask {
    pub description: String,
    pub expected_output: Option<String>,
    /// Index into [`Graph::workers`].
    pub worker: usize,
    pub kind: TaskKind,
    pub recalled_guidance: Option<RecalledGuidance>,
}

impl BoundTask {
    /// Description as handed to the engine: the original text, then any recalled guidance.
    pub fn render_description(&self) -> String {
        match &self.recalled_guidance {
            Some(guidance) => format!(
                "{}\n\n{}\n{}",
                self.description, GUIDANCE_MARKER, guidance.text
            ),
            None => self.description.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Graph {
    pub goal: String,
    pub strategy: ExecutionStrategy,
    pub workers: Vec<ResolvedWorker>,
    pub tasks: Vec<BoundTask>,
    /// Worker index that plans and delegates under the hierarchical strategy.
    pub manager: Option<usize>,
}

impl Graph {
    pub fn worker_for(&self, task: &BoundTask) -> &ResolvedWorker {
        &self.workers[task.worker]
    }

    pub fn worker_index(&self, name: &str) -> Option<usize> {
        self.workers.iter().position(|worker| worker.name == name)
    }

    /// JSON view used by `crewgen plan` and telemetry.
    pub fn summary(&self) -> Value {
        let workers = self
            .workers
            .iter()
            .map(|worker| {
                serde_json::json!({
                    "name": worker.name,
                    "goal": worker.goal,
                    "allow_delegation": worker.allow_delegation,
                    "capabilities": worker.capability_names(),
                })
            })
            .collect::<Vec<Value>>();
        let tasks = self
            .tasks
            .iter()
            .map(|task| {
                serde_json::json!({
                    "agent": self.workers[task.worker].name,
                    "kind": task.kind,
                    "description": task.description,
                    "expected_output": task.expected_output,
                    "recalled_guidance": task.recalled_guidance,
                })
            })
            .collect::<Vec<Value>>();
        serde_json::json!({
            "goal": self.goal,
            "strategy": self.strategy,
            "manager": self.manager.map(|index| self.workers[index].name.clone()),
            "agents": workers,
            "tasks": tasks,
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct BuildOptions {
    /// Appended after each worker's last planned task in sequential mode.
    pub knowledge_follow_up: Option<KnowledgeTaskTemplate>,
}

pub struct GraphBuilder<'a> {
    catalog: &'a AgentCatalog,
    registry: &'a CapabilityRegistry,
}

impl<'a> GraphBuilder<'a> {
    pub fn new(catalog: &'a AgentCatalog, registry: &'a CapabilityRegistry) -> Self {
        Self { catalog, registry }
    }

    fn archetype(&self, name: &str, context: &str) -> Result<&'a WorkerArchetype, CrewError> {
        self.catalog
            .get(name)
            .ok_or_else(|| CrewError::UnknownWorker {
                name: name.to_string(),
                context: context.to_string(),
            })
    }

    fn resolve_worker(
        &self,
        archetype: &WorkerArchetype,
        goal_override: Option<&str>,
        force_delegation: bool,
    ) -> Result<ResolvedWorker, CrewError> {
        let capabilities = self
            .registry
            .resolve_for_worker(&archetype.name, &archetype.capability_tokens())?;
        let goal = goal_override
            .map(str::trim)
            .filter(|goal| !goal.is_empty())
            .unwrap_or(&archetype.goal)
            .to_string();

        let mut params = archetype.params.clone();
        params.remove("allow_delegation");

        Ok(ResolvedWorker {
            name: archetype.name.clone(),
            goal,
            backstory: archetype.backstory.clone(),
            allow_delegation: force_delegation || archetype.allow_delegation(),
            params,
            capabilities,
        })
    }

    pub fn build(
        &self,
        goal: &str,
        plan: &Plan,
        strategy: ExecutionStrategy,
        options: &BuildOptions,
    ) -> Result<Graph, CrewError> {
        let graph = match strategy {
            ExecutionStrategy::Sequential => self.build_sequential(goal, plan, options)?,
            ExecutionStrategy::Hierarchical => self.build_hierarchical(goal, plan)?,
        };
        tracing::info!(
            strategy = %strategy,
            workers = graph.workers.len(),
            tasks = graph.tasks.len(),
            "Graph built"
        );
        Ok(graph)
    }

    fn build_sequential(
        &self,
        goal: &str,
        plan: &Plan,
        options: &BuildOptions,
    ) -> Result<Graph, CrewError> {
        let mut workers = Vec::<ResolvedWorker>::with_capacity(plan.workers.len());
        for planned in &plan.workers {
            if workers.iter().any(|worker| worker.name == planned.name) {
                tracing::debug!(worker = %planned.name, "duplicate plan worker ignored");
                continue;
            }
            let archetype = self.archetype(&planned.name, "the plan's agents list")?;
            workers.push(self.resolve_worker(archetype, planned.goal.as_deref(), false)?);
        }

        let mut tasks = Vec::<BoundTask>::with_capacity(plan.tasks.len());
        for (position, planned) in plan.tasks.iter().enumerate() {
            let worker = workers
                .iter()
                .position(|worker| worker.name == planned.worker)
                .ok_or_else(|| CrewError::UnknownWorker {
                    name: planned.worker.clone(),
                    context: format!("task {}", position + 1),
                })?;
            tasks.push(BoundTask {
                description: planned.description.clone(),
                expected_output: planned.expected_output.clone(),
                worker,
                kind: TaskKind::Planned,
                recalled_guidance: None,
            });
        }

        if let Some(template) = options.knowledge_follow_up.as_ref() {
            tasks = append_knowledge_follow_ups(tasks, &workers, template);
        }

        Ok(Graph {
            goal: goal.to_string(),
            strategy: ExecutionStrategy::Sequential,
            workers,
            tasks,
            manager: None,
        })
    }

    fn build_hierarchical(&self, goal: &str, plan: &Plan) -> Result<Graph, CrewError> {
        for planned in &plan.workers {
            self.archetype(&planned.name, "the plan's agents list")?;
        }
        for (position, planned) in plan.tasks.iter().enumerate() {
            self.archetype(&planned.worker, &format!("task {}", position + 1))?;
        }

        let mut workers = Vec::<ResolvedWorker>::with_capacity(self.catalog.len());
        for archetype in self.catalog.iter() {
            let goal_override = plan
                .workers
                .iter()
                .find(|planned| planned.name == archetype.name)
                .and_then(|planned| planned.goal.as_deref());
            workers.push(self.resolve_worker(archetype, goal_override, true)?);
        }
        if workers.is_empty() {
            return Err(CrewError::UnknownWorker {
                name: "<manager>".to_string(),
                context: "an empty worker catalog".to_string(),
            });
        }

        let task = BoundTask {
            description: top_level_instruction(goal, plan),
            expected_output: Some(format!("A complete deliverable that achieves: {goal}")),
            worker: 0,
            kind: TaskKind::Delegated,
            recalled_guidance: None,
        };

        Ok(Graph {
            goal: goal.to_string(),
            strategy: ExecutionStrategy::Hierarchical,
            workers,
            tasks: vec![task],
            manager: Some(0),
        })
    }
}

fn top_level_instruction(goal: &str, plan: &Plan) -> String {
    let mut out = format!(
        "Plan and deliver the following goal with your team. Break it into sub-tasks, \
         delegate each to the most suitable coworker, review their results, and combine \
         them into the final answer.\n\nGoal: {goal}"
    );
    if !plan.tasks.is_empty() {
        out.push_str("\n\nSuggested outline (advisory, re-plan as needed):");
        for (index, task) in plan.tasks.iter().enumerate() {
            out.push_str(&format!("\n{}. [{}] {}", index + 1, task.worker, task.description));
        }
    }
    out
}

fn append_knowledge_follow_ups(
    tasks: Vec<BoundTask>,
    workers: &[ResolvedWorker],
    template: &KnowledgeTaskTemplate,
) -> Vec<BoundTask> {
    let mut last_task_of = vec![None::<usize>; workers.len()];
    for (position, task) in tasks.iter().enumerate() {
        last_task_of[task.worker] = Some(position);
    }

    let mut out = Vec::<BoundTask>::with_capacity(tasks.len() + workers.len());
    for (position, task) in tasks.into_iter().enumerate() {
        let worker = task.worker;
        out.push(task);
        if last_task_of[worker] == Some(position) {
            let name = &workers[worker].name;
            out.push(BoundTask {
                description: template.render_description(name),
                expected_output: template.render_expected_output(name),
                worker,
                kind: TaskKind::KnowledgeFollowUp,
                recalled_guidance: None,
            });
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::{Capability, MEMORY_CAPABILITY};
    use crate::config::parse_agent_catalog;
    use crate::planner::parse_plan;
    use async_trait::async_trait;
    use std::sync::Arc;

    struct Stub(&'static str);

    #[async_trait]
    impl Capability for Stub {
        fn name(&self) -> &str {
            self.0
        }

        fn description(&self) -> &str {
            "stub"
        }

        async fn invoke(&self, args: Value) -> anyhow::Result<Value> {
            Ok(args)
        }
    }

    const CATALOG: &str = r#"
researcher:
  goal: Find facts
  backstory: Librarian
  tools: search_internet
writer:
  goal: Write clear summaries
  backstory: Editor
  tools: write_file
  allow_delegation: true
reviewer:
  goal: Review drafts
  backstory: QA lead
"#;

    const PLAN: &str = r#"{"agents":[{"name":"researcher"},{"name":"writer"}],
        "tasks":[{"description":"find facts about X","agent":"researcher","expected_output":"a fact list"},
                 {"description":"write summary","agent":"writer"}]}"#;

    fn registry() -> CapabilityRegistry {
        let mut registry = CapabilityRegistry::new();
        registry.register_local(Arc::new(Stub("search_internet")));
        registry.register_local(Arc::new(Stub("write_file")));
        registry.register_local(Arc::new(Stub(MEMORY_CAPABILITY)));
        registry
    }

    fn catalog() -> AgentCatalog {
        parse_agent_catalog(CATALOG, "agents.yaml").unwrap()
    }

    #[test]
    fn sequential_binds_tasks_in_plan_order() {
        let (catalog, registry) = (catalog(), registry());
        let plan = parse_plan("X", PLAN).unwrap();
        let graph = GraphBuilder::new(&catalog, &registry)
            .build("X", &plan, ExecutionStrategy::Sequential, &BuildOptions::default())
            .unwrap();

        assert_eq!(graph.tasks.len(), 2);
        assert_eq!(graph.worker_for(&graph.tasks[0]).name, "researcher");
        assert_eq!(graph.tasks[0].description, "find facts about X");
        assert_eq!(graph.tasks[0].expected_output.as_deref(), Some("a fact list"));
        assert_eq!(graph.worker_for(&graph.tasks[1]).name, "writer");
        assert_eq!(graph.tasks[1].render_description(), "write summary");
        assert_eq!(graph.manager, None);
        assert_eq!(graph.workers.len(), 2);
    }

    #[test]
    fn workers_carry_resolved_capabilities_and_memory() {
        let (catalog, registry) = (catalog(), registry());
        let plan = parse_plan("X", PLAN).unwrap();
        let graph = GraphBuilder::new(&catalog, &registry)
            .build("X", &plan, ExecutionStrategy::Sequential, &BuildOptions::default())
            .unwrap();

        assert_eq!(
            graph.workers[0].capability_names(),
            vec!["search_internet", MEMORY_CAPABILITY]
        );
        assert!(graph.workers[1].allow_delegation);
        assert!(!graph.workers[1].params.contains_key("allow_delegation"));
    }

    #[test]
    fn plan_goal_overrides_archetype_goal() {
        let (catalog, registry) = (catalog(), registry());
        let plan = parse_plan(
            "X",
            r#"{"agents":[{"name":"writer","goal":"Write for executives"},{"name":"researcher","goal":"  "}],
                "tasks":[{"description":"d","agent":"writer"}]}"#,
        )
        .unwrap();
        let graph = GraphBuilder::new(&catalog, &registry)
            .build("X", &plan, ExecutionStrategy::Sequential, &BuildOptions::default())
            .unwrap();
        assert_eq!(graph.workers[0].goal, "Write for executives");
        assert_eq!(graph.workers[1].goal, "Find facts");
    }

    #[test]
    fn unknown_plan_worker_fails_build() {
        let (catalog, registry) = (catalog(), registry());
        let plan = parse_plan(
            "X",
            r#"{"agents":[{"name":"ghost"}],"tasks":[]}"#,
        )
        .unwrap();
        let err = GraphBuilder::new(&catalog, &registry)
            .build("X", &plan, ExecutionStrategy::Sequential, &BuildOptions::default())
            .unwrap_err();
        assert!(matches!(err, CrewError::UnknownWorker { ref name, .. } if name == "ghost"));
    }

    #[test]
    fn task_for_unlisted_worker_fails_instead_of_dropping() {
        let (catalog, registry) = (catalog(), registry());
        // reviewer exists in the catalog but is not in the plan's agents list.
        for agent in ["reviewer", "nobody"] {
            let plan = parse_plan(
                "X",
                &format!(
                    r#"{{"agents":[{{"name":"writer"}}],
                        "tasks":[{{"description":"a","agent":"writer"}},{{"description":"b","agent":"{agent}"}}]}}"#
                ),
            )
            .unwrap();
            let err = GraphBuilder::new(&catalog, &registry)
                .build("X", &plan, ExecutionStrategy::Sequential, &BuildOptions::default())
                .unwrap_err();
            match err {
                CrewError::UnknownWorker { name, context } => {
                    assert_eq!(name, agent);
                    assert_eq!(context, "task 2");
                }
                other => panic!("unexpected error: {other}"),
            }
        }
    }

    #[test]
    fn missing_capability_propagates() {
        let catalog = parse_agent_catalog(
            "scout:\n  goal: g\n  tools: search_internet, teleport\n",
            "agents.yaml",
        )
        .unwrap();
        let registry = registry();
        let plan = parse_plan(
            "X",
            r#"{"agents":[{"name":"scout"}],"tasks":[{"description":"d","agent":"scout"}]}"#,
        )
        .unwrap();
        let err = GraphBuilder::new(&catalog, &registry)
            .build("X", &plan, ExecutionStrategy::Sequential, &BuildOptions::default())
            .unwrap_err();
        assert!(matches!(
            err,
            CrewError::CapabilityNotFound { ref token, ref worker } if token == "teleport" && worker == "scout"
        ));
    }

    #[test]
    fn hierarchical_builds_single_task_for_first_archetype() {
        let (catalog, registry) = (catalog(), registry());
        let plan = parse_plan("launch", PLAN).unwrap();
        let graph = GraphBuilder::new(&catalog, &registry)
            .build(
                "launch",
                &plan,
                ExecutionStrategy::Hierarchical,
                &BuildOptions::default(),
            )
            .unwrap();

        assert_eq!(graph.tasks.len(), 1);
        assert_eq!(graph.tasks[0].kind, TaskKind::Delegated);
        assert_eq!(graph.worker_for(&graph.tasks[0]).name, "researcher");
        assert_eq!(graph.manager, Some(0));
        assert_eq!(graph.workers.len(), 3);
        assert!(graph.workers.iter().all(|worker| worker.allow_delegation));
        assert!(graph.tasks[0].description.contains("Goal: launch"));
        assert!(graph.tasks[0].description.contains("[writer] write summary"));
    }

    #[test]
    fn hierarchical_still_rejects_unknown_workers() {
        let (catalog, registry) = (catalog(), registry());
        let plan = parse_plan(
            "X",
            r#"{"agents":[{"name":"writer"}],"tasks":[{"description":"b","agent":"ghost"}]}"#,
        )
        .unwrap();
        let err = GraphBuilder::new(&catalog, &registry)
            .build("X", &plan, ExecutionStrategy::Hierarchical, &BuildOptions::default())
            .unwrap_err();
        assert!(matches!(err, CrewError::UnknownWorker { .. }));
    }

    #[test]
    fn knowledge_follow_up_lands_after_each_workers_last_task() {
        let (catalog, registry) = (catalog(), registry());
        let plan = parse_plan(
            "X",
            r#"{"agents":[{"name":"researcher"},{"name":"writer"}],
                "tasks":[{"description":"r1","agent":"researcher"},
                         {"description":"w1","agent":"writer"},
                         {"description":"r2","agent":"researcher"}]}"#,
        )
        .unwrap();
        let options = BuildOptions {
            knowledge_follow_up: Some(KnowledgeTaskTemplate {
                description: "Record lessons for {agent_name}".to_string(),
                expected_output: None,
            }),
        };
        let graph = GraphBuilder::new(&catalog, &registry)
            .build("X", &plan, ExecutionStrategy::Sequential, &options)
            .unwrap();

        let rendered = graph
            .tasks
            .iter()
            .map(|task| task.description.as_str())
            .collect::<Vec<_>>();
        assert_eq!(
            rendered,
            vec![
                "r1",
                "w1",
                "Record lessons for writer",
                "r2",
                "Record lessons for researcher"
            ]
        );
        assert_eq!(graph.tasks[2].kind, TaskKind::KnowledgeFollowUp);
    }

    #[test]
    fn guidance_renders_after_original_description() {
        let task = BoundTask {
            description: "write summary".to_string(),
            expected_output: Some("one page".to_string()),
            worker: 0,
            kind: TaskKind::Planned,
            recalled_guidance: Some(RecalledGuidance {
                text: "Lead with the conclusion".to_string(),
                score: 0.8,
            }),
        };
        let rendered = task.render_description();
        assert!(rendered.starts_with("write summary"));
        assert!(rendered.contains(GUIDANCE_MARKER));
        assert!(rendered.ends_with("Lead with the conclusion"));
        assert_eq!(task.expected_output.as_deref(), Some("one page"));
    }
}

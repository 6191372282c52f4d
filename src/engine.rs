//! Execution engines consume a compiled graph and return the crew's result.
//!
//! [`LlmExecutionEngine`] is the reference engine: every worker turn is a chat
//! completion that may call one capability per step by replying with
//! `{"tool": "<name>", "args": {...}}`. Any other reply is the worker's answer.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Value, json};

use crate::capability::MEMORY_CAPABILITY;
use crate::error::CrewError;
use crate::graph::{Graph, ResolvedWorker, TaskKind};
use crate::llm::ChatModel;
use crate::strategy::ExecutionStrategy;
use crate::telemetry::{TelemetrySink, preview};

const DEFAULT_MAX_STEPS: usize = 6;
const MANAGER_MAX_STEPS: usize = 10;
const OBSERVATION_MAX_CHARS: usize = 4_000;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskOutput {
    pub worker: String,
    pub description: String,
    pub output: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionReport {
    pub strategy: ExecutionStrategy,
    pub final_output: String,
    pub task_outputs: Vec<TaskOutput>,
}

#[async_trait]
pub trait ExecutionEngine: Send + Sync {
    async fn run(&self, graph: &Graph) -> Result<ExecutionReport, CrewError>;
}

#[derive(Debug, Clone, PartialEq)]
enum WorkerReply {
    Tool { name: String, args: Value },
    Delegate { worker: String, task: String },
    Answer(String),
}

fn parse_reply(reply: &str) -> WorkerReply {
    let trimmed = reply.trim();
    let body = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|rest| rest.strip_suffix("```"))
        .map(str::trim)
        .unwrap_or(trimmed);

    if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(body) {
        if let Some(name) = map.get("tool").and_then(Value::as_str) {
            return WorkerReply::Tool {
                name: name.to_string(),
                args: map.get("args").cloned().unwrap_or(Value::Null),
            };
        }
        if let (Some(worker), Some(task)) = (
            map.get("delegate").and_then(Value::as_str),
            map.get("task").and_then(Value::as_str),
        ) {
            return WorkerReply::Delegate {
                worker: worker.to_string(),
                task: task.to_string(),
            };
        }
        if let Some(answer) = map.get("final_answer").and_then(Value::as_str) {
            return WorkerReply::Answer(answer.to_string());
        }
    }
    WorkerReply::Answer(trimmed.to_string())
}

fn clip(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut out = text.chars().take(max_chars).collect::<String>();
    out.push_str("...");
    out
}

fn persona(worker: &ResolvedWorker) -> String {
    let mut out = format!("You are {}.\nYour goal: {}\n", worker.name, worker.goal);
    if !worker.backstory.trim().is_empty() {
        out.push_str(&format!("Background: {}\n", worker.backstory.trim()));
    }
    out
}

fn capability_section(worker: &ResolvedWorker) -> String {
    let mut out = String::from("Capabilities you may call (one per reply):\n");
    for handle in &worker.capabilities {
        out.push_str(&format!("- {}: {}\n", handle.name(), handle.description()));
    }
    out.push_str(&format!(
        "To call one, reply with only {{\"tool\": \"<name>\", \"args\": {{...}}}}. \
         When calling '{MEMORY_CAPABILITY}', use \"agent_name\": \"{}\".\n\
         When you are done, reply with your final answer as plain text.\n",
        worker.name
    ));
    out
}

pub struct LlmExecutionEngine {
    worker_model: Arc<dyn ChatModel>,
    manager_model: Arc<dyn ChatModel>,
    record_outcomes: bool,
    telemetry: Option<TelemetrySink>,
}

impl LlmExecutionEngine {
    pub fn new(worker_model: Arc<dyn ChatModel>, manager_model: Arc<dyn ChatModel>) -> Self {
        Self {
            worker_model,
            manager_model,
            record_outcomes: false,
            telemetry: None,
        }
    }

    pub fn with_outcome_recording(mut self, enabled: bool) -> Self {
        self.record_outcomes = enabled;
        self
    }

    pub fn with_telemetry(mut self, sink: TelemetrySink) -> Self {
        self.telemetry = Some(sink);
        self
    }

    fn emit(&self, event: &str, payload: Value) {
        if let Some(sink) = self.telemetry.as_ref() {
            sink.emit(event, payload);
        }
    }

    fn max_steps(worker: &ResolvedWorker) -> usize {
        worker
            .params
            .get("max_iter")
            .and_then(Value::as_u64)
            .map(|value| value.clamp(1, 50) as usize)
            .unwrap_or(DEFAULT_MAX_STEPS)
    }

    async fn call_capability(&self, worker: &ResolvedWorker, name: &str, args: Value) -> String {
        let Some(handle) = worker.capability(name) else {
            return format!(
                "Capability '{}' is not available. Choose one of: {}",
                name,
                worker.capability_names().join(", ")
            );
        };
        self.emit(
            "capability.invoked",
            json!({"worker": worker.name, "capability": name}),
        );
        match handle.invoke(args).await {
            Ok(value) => clip(&value.to_string(), OBSERVATION_MAX_CHARS),
            Err(err) => {
                tracing::warn!(worker = %worker.name, capability = %name, error = %err, "capability failed");
                format!("Capability '{name}' failed: {err:#}")
            }
        }
    }

    /// One worker's tool loop for a single instruction.
    async fn run_worker(
        &self,
        worker: &ResolvedWorker,
        instruction: &str,
        expected_output: Option<&str>,
        upstream: &[TaskOutput],
    ) -> Result<String, CrewError> {
        let mut transcript = persona(worker);
        transcript.push('\n');
        transcript.push_str(&capability_section(worker));
        if !upstream.is_empty() {
            transcript.push_str("\nContext from earlier tasks:\n");
            for output in upstream {
                transcript.push_str(&format!(
                    "[{}] {}\n{}\n\n",
                    output.worker, output.description, output.output
                ));
            }
        }
        transcript.push_str(&format!("\nTask:\n{instruction}\n"));
        if let Some(expected) = expected_output {
            transcript.push_str(&format!("\nExpected output:\n{expected}\n"));
        }

        let max_steps = Self::max_steps(worker);
        for step in 1..=max_steps {
            let reply = self.worker_model.complete(&transcript).await?;
            self.emit(
                "worker.step",
                json!({"worker": worker.name, "step": step, "output": preview(&reply, 150)}),
            );
            match parse_reply(&reply) {
                WorkerReply::Tool { name, args } => {
                    let observation = self.call_capability(worker, &name, args).await;
                    transcript.push_str(&format!(
                        "\nYou called {name}. Result:\n{observation}\n\nContinue.\n"
                    ));
                }
                WorkerReply::Delegate { .. } => {
                    transcript.push_str(
                        "\nDelegation is not available for this task. Continue on your own.\n",
                    );
                }
                WorkerReply::Answer(answer) => return Ok(answer),
            }
        }

        Err(CrewError::Execution {
            message: format!(
                "worker '{}' did not produce an answer within {} steps",
                worker.name, max_steps
            ),
        })
    }

    async fn run_sequential(&self, graph: &Graph) -> Result<ExecutionReport, CrewError> {
        let mut outputs = Vec::<TaskOutput>::with_capacity(graph.tasks.len());
        for (index, task) in graph.tasks.iter().enumerate() {
            let worker = graph.worker_for(task);
            tracing::info!(task = index + 1, worker = %worker.name, "Running task");
            let output = self
                .run_worker(
                    worker,
                    &task.render_description(),
                    task.expected_output.as_deref(),
                    &outputs,
                )
                .await?;
            self.emit(
                "task.completed",
                json!({
                    "task": index + 1,
                    "worker": worker.name,
                    "description": preview(&task.description, 150),
                    "output": preview(&output, 150),
                }),
            );
            outputs.push(TaskOutput {
                worker: worker.name.clone(),
                description: task.description.clone(),
                output,
            });
        }

        if self.record_outcomes {
            self.record(graph, &outputs).await;
        }

        let final_output = outputs
            .last()
            .map(|output| output.output.clone())
            .unwrap_or_default();
        Ok(ExecutionReport {
            strategy: ExecutionStrategy::Sequential,
            final_output,
            task_outputs: outputs,
        })
    }

    async fn record(&self, graph: &Graph, outputs: &[TaskOutput]) {
        for (task, output) in graph.tasks.iter().zip(outputs) {
            if task.kind != TaskKind::Planned {
                continue;
            }
            let worker = graph.worker_for(task);
            let Some(memory) = worker.capability(MEMORY_CAPABILITY) else {
                continue;
            };
            let args = json!({
                "agent_name": worker.name,
                "mode": "add",
                "content": format!("Task: {}\nOutcome: {}", task.description, clip(&output.output, 1_000)),
            });
            if let Err(err) = memory.invoke(args).await {
                tracing::warn!(worker = %worker.name, error = %err, "failed to record task outcome");
            }
        }
    }

    fn roster(graph: &Graph, manager: usize) -> String {
        let mut out = String::from("Your coworkers:\n");
        for (index, worker) in graph.workers.iter().enumerate() {
            if index == manager {
                continue;
            }
            out.push_str(&format!(
                "- {}: {} (capabilities: {})\n",
                worker.name,
                worker.goal,
                worker.capability_names().join(", ")
            ));
        }
        out
    }

    async fn run_hierarchical(&self, graph: &Graph) -> Result<ExecutionReport, CrewError> {
        let top = graph.tasks.first().ok_or_else(|| CrewError::Execution {
            message: "hierarchical graph has no top-level task".to_string(),
        })?;
        let manager_index = graph.manager.unwrap_or(top.worker);
        let manager = &graph.workers[manager_index];

        let mut transcript = persona(manager);
        transcript.push('\n');
        transcript.push_str(&Self::roster(graph, manager_index));
        transcript.push_str(
            "To hand a sub-task to a coworker, reply with only \
             {\"delegate\": \"<coworker name>\", \"task\": \"<instruction>\"}.\n",
        );
        transcript.push_str(&capability_section(manager));
        transcript.push_str(&format!("\nTask:\n{}\n", top.render_description()));
        if let Some(expected) = top.expected_output.as_deref() {
            transcript.push_str(&format!("\nExpected output:\n{expected}\n"));
        }

        let mut outputs = Vec::<TaskOutput>::new();
        for step in 1..=MANAGER_MAX_STEPS {
            let reply = self.manager_model.complete(&transcript).await?;
            self.emit(
                "manager.step",
                json!({"worker": manager.name, "step": step, "output": preview(&reply, 150)}),
            );
            match parse_reply(&reply) {
                WorkerReply::Delegate { worker, task } => {
                    let observation = match graph.worker_index(&worker) {
                        Some(index) if index != manager_index => {
                            let delegate = &graph.workers[index];
                            let output = self.run_worker(delegate, &task, None, &[]).await?;
                            self.emit(
                                "task.completed",
                                json!({
                                    "worker": delegate.name,
                                    "description": preview(&task, 150),
                                    "output": preview(&output, 150),
                                }),
                            );
                            outputs.push(TaskOutput {
                                worker: delegate.name.clone(),
                                description: task.clone(),
                                output: output.clone(),
                            });
                            clip(&output, OBSERVATION_MAX_CHARS)
                        }
                        _ => format!("'{worker}' is not one of your coworkers."),
                    };
                    transcript.push_str(&format!(
                        "\n{worker} answered:\n{observation}\n\nContinue.\n"
                    ));
                }
                WorkerReply::Tool { name, args } => {
                    let observation = self.call_capability(manager, &name, args).await;
                    transcript.push_str(&format!(
                        "\nYou called {name}. Result:\n{observation}\n\nContinue.\n"
                    ));
                }
                WorkerReply::Answer(answer) => {
                    return Ok(ExecutionReport {
                        strategy: ExecutionStrategy::Hierarchical,
                        final_output: answer,
                        task_outputs: outputs,
                    });
                }
            }
        }

        Err(CrewError::Execution {
            message: format!(
                "manager '{}' did not finish within {} steps",
                manager.name, MANAGER_MAX_STEPS
            ),
        })
    }
}

#[async_trait]
impl ExecutionEngine for LlmExecutionEngine {
    async fn run(&self, graph: &Graph) -> Result<ExecutionReport, CrewError> {
        match graph.strategy {
            ExecutionStrategy::Sequential => self.run_sequential(graph).await,
            ExecutionStrategy::Hierarchical => self.run_hierarchical(graph).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::{Capability, CapabilityRegistry};
    use crate::config::parse_agent_catalog;
    use crate::graph::{BuildOptions, GraphBuilder};
    use crate::planner::parse_plan;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Replay {
        replies: Mutex<VecDeque<String>>,
        prompts: Mutex<Vec<String>>,
    }

    impl Replay {
        fn new(replies: &[&str]) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.iter().map(|r| r.to_string()).collect()),
                prompts: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl ChatModel for Replay {
        fn name(&self) -> &str {
            "replay"
        }

        async fn complete(&self, prompt: &str) -> Result<String, CrewError> {
            self.prompts.lock().unwrap().push(prompt.to_string());
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| CrewError::Model {
                    message: "no scripted reply left".to_string(),
                })
        }
    }

    struct Counting {
        name: &'static str,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Capability for Counting {
        fn name(&self) -> &str {
            self.name
        }

        fn description(&self) -> &str {
            "counts calls"
        }

        async fn invoke(&self, args: Value) -> anyhow::Result<Value> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(json!({"echo": args}))
        }
    }

    fn graph(strategy: ExecutionStrategy, memory: Arc<Counting>) -> Graph {
        let catalog = parse_agent_catalog(
            "researcher:\n  goal: Find facts\n  tools: search_internet\nwriter:\n  goal: Write\n",
            "agents.yaml",
        )
        .unwrap();
        let mut registry = CapabilityRegistry::new();
        registry.register_local(Arc::new(Counting {
            name: "search_internet",
            calls: AtomicUsize::new(0),
        }));
        registry.register_local(memory);
        let plan = parse_plan(
            "X",
            r#"{"agents":[{"name":"researcher"},{"name":"writer"}],
                "tasks":[{"description":"find facts about X","agent":"researcher"},
                         {"description":"write summary","agent":"writer"}]}"#,
        )
        .unwrap();
        GraphBuilder::new(&catalog, &registry)
            .build("X", &plan, strategy, &BuildOptions::default())
            .unwrap()
    }

    fn memory() -> Arc<Counting> {
        Arc::new(Counting {
            name: MEMORY_CAPABILITY,
            calls: AtomicUsize::new(0),
        })
    }

    #[test]
    fn reply_parsing_recognizes_actions() {
        assert_eq!(
            parse_reply(r#"{"tool": "search_internet", "args": {"query": "x"}}"#),
            WorkerReply::Tool {
                name: "search_internet".to_string(),
                args: json!({"query": "x"})
            }
        );
        assert_eq!(
            parse_reply("```json\n{\"delegate\": \"writer\", \"task\": \"draft\"}\n```"),
            WorkerReply::Delegate {
                worker: "writer".to_string(),
                task: "draft".to_string()
            }
        );
        assert_eq!(
            parse_reply(r#"{"final_answer": "done"}"#),
            WorkerReply::Answer("done".to_string())
        );
        assert_eq!(
            parse_reply("  plain answer \n"),
            WorkerReply::Answer("plain answer".to_string())
        );
    }

    #[tokio::test]
    async fn sequential_chains_outputs_and_calls_tools() {
        let model = Replay::new(&[
            r#"{"tool": "search_internet", "args": {"query": "X"}}"#,
            "fact one; fact two",
            "Summary of X",
        ]);
        let engine = LlmExecutionEngine::new(model.clone(), model.clone());
        let report = engine
            .run(&graph(ExecutionStrategy::Sequential, memory()))
            .await
            .unwrap();

        assert_eq!(report.final_output, "Summary of X");
        assert_eq!(report.task_outputs.len(), 2);
        assert_eq!(report.task_outputs[0].output, "fact one; fact two");

        let prompts = model.prompts.lock().unwrap();
        assert!(prompts[1].contains("You called search_internet"));
        assert!(prompts[2].contains("Context from earlier tasks"));
        assert!(prompts[2].contains("fact one; fact two"));
    }

    #[tokio::test]
    async fn unknown_capability_is_reported_back_to_worker() {
        let model = Replay::new(&[
            r#"{"tool": "teleport", "args": {}}"#,
            "gave up",
            "written",
        ]);
        let engine = LlmExecutionEngine::new(model.clone(), model.clone());
        engine
            .run(&graph(ExecutionStrategy::Sequential, memory()))
            .await
            .unwrap();
        let prompts = model.prompts.lock().unwrap();
        assert!(prompts[1].contains("Capability 'teleport' is not available"));
    }

    #[tokio::test]
    async fn outcomes_are_recorded_through_memory_capability() {
        let memory = memory();
        let model = Replay::new(&["facts", "summary"]);
        let engine =
            LlmExecutionEngine::new(model.clone(), model.clone()).with_outcome_recording(true);
        engine
            .run(&graph(ExecutionStrategy::Sequential, memory.clone()))
            .await
            .unwrap();
        assert_eq!(memory.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn hierarchical_manager_delegates_then_answers() {
        let manager = Replay::new(&[
            r#"{"delegate": "writer", "task": "draft the summary"}"#,
            "Final deliverable",
        ]);
        let workers = Replay::new(&["draft text"]);
        let engine = LlmExecutionEngine::new(workers.clone(), manager.clone());
        let report = engine
            .run(&graph(ExecutionStrategy::Hierarchical, memory()))
            .await
            .unwrap();

        assert_eq!(report.strategy, ExecutionStrategy::Hierarchical);
        assert_eq!(report.final_output, "Final deliverable");
        assert_eq!(report.task_outputs.len(), 1);
        assert_eq!(report.task_outputs[0].worker, "writer");
        let manager_prompts = manager.prompts.lock().unwrap();
        assert!(manager_prompts[0].contains("- writer: Write"));
        assert!(manager_prompts[1].contains("draft text"));
    }

    #[tokio::test]
    async fn model_failure_surfaces_as_error() {
        let model = Replay::new(&[]);
        let engine = LlmExecutionEngine::new(model.clone(), model);
        let err = engine
            .run(&graph(ExecutionStrategy::Sequential, memory()))
            .await
            .unwrap_err();
        assert!(matches!(err, CrewError::Model { .. }));
    }
}

//! Attaches worker-scoped guidance recalled from memory to each task.

use std::time::Duration;

use futures::future::join_all;

use crate::graph::{Graph, RecalledGuidance};
use crate::memory::{MemoryService, rank_hits};

pub const RECALL_INSTRUCTION: &str =
    "Recall checkpoints, lessons, and guidance that apply to the following task: ";

#[derive(Debug, Clone)]
pub struct AugmentPolicy {
    pub enabled: bool,
    pub timeout: Duration,
}

impl Default for AugmentPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            timeout: Duration::from_secs(10),
        }
    }
}

pub fn recall_query(description: &str) -> String {
    format!("{RECALL_INSTRUCTION}{description}")
}

/// Runs one search per task concurrently and attaches the top hit, if any.
///
/// Search errors, timeouts, and empty results all leave the task unaugmented.
pub async fn augment(mut graph: Graph, memory: &dyn MemoryService, policy: &AugmentPolicy) -> Graph {
    if !policy.enabled {
        return graph;
    }

    let searches = graph.tasks.iter().enumerate().map(|(index, task)| {
        let subject = graph.workers[task.worker].name.clone();
        let query = recall_query(&task.description);
        async move {
            let outcome = tokio::time::timeout(policy.timeout, memory.search(&query, &subject)).await;
            let guidance = match outcome {
                Ok(Ok(hits)) => rank_hits(hits).into_iter().next().map(|hit| RecalledGuidance {
                    text: hit.text,
                    score: hit.score,
                }),
                Ok(Err(err)) => {
                    tracing::warn!(
                        task = index,
                        subject = %subject,
                        error = %err,
                        "memory search failed; task proceeds without guidance"
                    );
                    None
                }
                Err(_) => {
                    tracing::warn!(
                        task = index,
                        subject = %subject,
                        timeout_secs = policy.timeout.as_secs(),
                        "memory search timed out; task proceeds without guidance"
                    );
                    None
                }
            };
            (index, guidance)
        }
    });

    let results = join_all(searches).await;
    for (index, guidance) in results {
        if let Some(guidance) = guidance {
            tracing::info!(
                task = index,
                score = guidance.score,
                "attached recalled guidance"
            );
            graph.tasks[index].recalled_guidance = Some(guidance);
        }
    }
    graph
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::{Capability, CapabilityRegistry, MEMORY_CAPABILITY};
    use crate::config::parse_agent_catalog;
    use crate::error::CrewError;
    use crate::graph::{BuildOptions, GraphBuilder};
    use crate::memory::{MemoryHit, MemoryMessage};
    use crate::planner::parse_plan;
    use crate::strategy::ExecutionStrategy;
    use async_trait::async_trait;
    use serde_json::Value;
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    struct Stub;

    #[async_trait]
    impl Capability for Stub {
        fn name(&self) -> &str {
            MEMORY_CAPABILITY
        }

        fn description(&self) -> &str {
            "stub"
        }

        async fn invoke(&self, args: Value) -> anyhow::Result<Value> {
            Ok(args)
        }
    }

    #[derive(Default)]
    struct ScriptedMemory {
        hits: HashMap<String, Vec<MemoryHit>>,
        failing: Vec<String>,
        slow: Vec<String>,
        queries: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl MemoryService for ScriptedMemory {
        fn backend_name(&self) -> &'static str {
            "scripted"
        }

        async fn add(&self, _messages: &[MemoryMessage], _subject: &str) -> Result<(), CrewError> {
            Ok(())
        }

        async fn search(&self, query: &str, subject: &str) -> Result<Vec<MemoryHit>, CrewError> {
            self.queries
                .lock()
                .unwrap()
                .push((query.to_string(), subject.to_string()));
            if self.slow.iter().any(|name| name == subject) {
                tokio::time::sleep(Duration::from_secs(60)).await;
            }
            if self.failing.iter().any(|name| name == subject) {
                return Err(CrewError::Memory {
                    message: "connection reset".to_string(),
                });
            }
            Ok(self.hits.get(subject).cloned().unwrap_or_default())
        }
    }

    fn graph() -> Graph {
        let catalog = parse_agent_catalog(
            "researcher:\n  goal: Find facts\nwriter:\n  goal: Write\n",
            "agents.yaml",
        )
        .unwrap();
        let mut registry = CapabilityRegistry::new();
        registry.register_local(Arc::new(Stub));
        let plan = parse_plan(
            "X",
            r#"{"agents":[{"name":"researcher"},{"name":"writer"}],
                "tasks":[{"description":"find facts about X","agent":"researcher","expected_output":"a fact list"},
                         {"description":"write summary","agent":"writer"}]}"#,
        )
        .unwrap();
        GraphBuilder::new(&catalog, &registry)
            .build("X", &plan, ExecutionStrategy::Sequential, &BuildOptions::default())
            .unwrap()
    }

    fn hit(text: &str, score: f64) -> MemoryHit {
        MemoryHit {
            text: text.to_string(),
            score,
        }
    }

    #[tokio::test]
    async fn no_hits_leaves_descriptions_byte_identical() {
        let before = graph();
        let memory = ScriptedMemory::default();
        let after = augment(before.clone(), &memory, &AugmentPolicy::default()).await;

        for (old, new) in before.tasks.iter().zip(after.tasks.iter()) {
            assert_eq!(old.render_description(), new.render_description());
            assert_eq!(new.recalled_guidance, None);
        }
    }

    #[tokio::test]
    async fn queries_are_scoped_by_worker_name() {
        let memory = ScriptedMemory::default();
        augment(graph(), &memory, &AugmentPolicy::default()).await;

        let mut queries = memory.queries.lock().unwrap().clone();
        queries.sort_by(|a, b| a.1.cmp(&b.1));
        assert_eq!(
            queries,
            vec![
                (recall_query("find facts about X"), "researcher".to_string()),
                (recall_query("write summary"), "writer".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn top_ranked_hit_is_attached_and_original_kept() {
        let mut memory = ScriptedMemory::default();
        memory.hits.insert(
            "writer".to_string(),
            vec![hit("use short sentences", 0.3), hit("lead with the conclusion", 0.9)],
        );
        let augmented = augment(graph(), &memory, &AugmentPolicy::default()).await;

        let writer_task = &augmented.tasks[1];
        assert_eq!(writer_task.description, "write summary");
        assert_eq!(writer_task.expected_output, None);
        let rendered = writer_task.render_description();
        assert!(rendered.starts_with("write summary"));
        assert!(rendered.contains("lead with the conclusion"));
        assert!(!rendered.contains("use short sentences"));
        assert_eq!(augmented.tasks[0].recalled_guidance, None);
        assert_eq!(
            augmented.tasks[0].expected_output.as_deref(),
            Some("a fact list")
        );
    }

    #[tokio::test]
    async fn failures_are_treated_as_no_guidance() {
        let mut memory = ScriptedMemory::default();
        memory.failing.push("researcher".to_string());
        memory
            .hits
            .insert("writer".to_string(), vec![hit("keep it brief", 0.5)]);
        let augmented = augment(graph(), &memory, &AugmentPolicy::default()).await;

        assert_eq!(augmented.tasks[0].recalled_guidance, None);
        assert!(augmented.tasks[1].recalled_guidance.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn slow_searches_time_out_without_blocking_others() {
        let mut memory = ScriptedMemory::default();
        memory.slow.push("researcher".to_string());
        memory
            .hits
            .insert("writer".to_string(), vec![hit("keep it brief", 0.5)]);
        let policy = AugmentPolicy {
            enabled: true,
            timeout: Duration::from_secs(1),
        };
        let augmented = augment(graph(), &memory, &policy).await;

        assert_eq!(augmented.tasks[0].recalled_guidance, None);
        assert!(augmented.tasks[1].recalled_guidance.is_some());
    }

    #[tokio::test]
    async fn disabled_policy_skips_memory() {
        let memory = ScriptedMemory::default();
        let policy = AugmentPolicy {
            enabled: false,
            ..AugmentPolicy::default()
        };
        augment(graph(), &memory, &policy).await;
        assert!(memory.queries.lock().unwrap().is_empty());
    }
}

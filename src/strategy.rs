use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::config::RuntimeConfig;

/// How the execution engine walks a compiled graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStrategy {
    /// Tasks run in graph order and each output feeds the next task.
    Sequential,
    /// One top-level task; a manager re-plans and delegates at run time.
    Hierarchical,
}

impl ExecutionStrategy {
    pub fn label(self) -> &'static str {
        match self {
            ExecutionStrategy::Sequential => "sequential",
            ExecutionStrategy::Hierarchical => "hierarchical",
        }
    }
}

impl std::fmt::Display for ExecutionStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Picks the strategy once per compilation from static configuration.
pub fn select(cfg: &RuntimeConfig) -> ExecutionStrategy {
    cfg.strategy
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn labels_round_trip_through_value_enum() {
        for strategy in [ExecutionStrategy::Sequential, ExecutionStrategy::Hierarchical] {
            let parsed = ExecutionStrategy::from_str(strategy.label(), true).unwrap();
            assert_eq!(parsed, strategy);
        }
    }
}

//! Long-term memory services keyed by subject (always a worker name).

pub mod commands;
pub mod local;
pub mod remote;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::cli::MemoryBackend;
use crate::config::RuntimeConfig;
use crate::error::CrewError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryMessage {
    pub role: String,
    pub content: String,
}

impl MemoryMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryHit {
    pub text: String,
    pub score: f64,
}

#[async_trait]
pub trait MemoryService: Send + Sync {
    fn backend_name(&self) -> &'static str;

    async fn add(&self, messages: &[MemoryMessage], subject: &str) -> Result<(), CrewError>;

    /// Hits ranked by descending score.
    async fn search(&self, query: &str, subject: &str) -> Result<Vec<MemoryHit>, CrewError>;
}

pub struct DisabledMemoryService;

#[async_trait]
impl MemoryService for DisabledMemoryService {
    fn backend_name(&self) -> &'static str {
        "disabled"
    }

    async fn add(&self, _messages: &[MemoryMessage], subject: &str) -> Result<(), CrewError> {
        tracing::debug!(subject = %subject, "memory disabled; dropping add");
        Ok(())
    }

    async fn search(&self, _query: &str, _subject: &str) -> Result<Vec<MemoryHit>, CrewError> {
        Ok(Vec::new())
    }
}

pub fn build_memory_service(cfg: &RuntimeConfig) -> anyhow::Result<Arc<dyn MemoryService>> {
    match cfg.memory_backend {
        MemoryBackend::Disabled => Ok(Arc::new(DisabledMemoryService)),
        MemoryBackend::Local => Ok(Arc::new(local::LocalMemoryService::open(&cfg.memory_path)?)),
        MemoryBackend::Mem0 => Ok(Arc::new(remote::Mem0MemoryService::from_env(
            cfg.memory_timeout_secs,
        )?)),
    }
}

/// Sorts hits by descending score, keeping insertion order among ties.
/// Hits with a non-finite score are dropped.
pub fn rank_hits(mut hits: Vec<MemoryHit>) -> Vec<MemoryHit> {
    hits.retain(|hit| hit.score.is_finite());
    hits.sort_by(|a, b| b.score.total_cmp(&a.score));
    hits
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rank_hits_orders_descending_and_is_stable() {
        let ranked = rank_hits(vec![
            MemoryHit {
                text: "low".to_string(),
                score: 0.1,
            },
            MemoryHit {
                text: "high-a".to_string(),
                score: 0.9,
            },
            MemoryHit {
                text: "high-b".to_string(),
                score: 0.9,
            },
        ]);
        let texts = ranked.iter().map(|hit| hit.text.as_str()).collect::<Vec<_>>();
        assert_eq!(texts, vec!["high-a", "high-b", "low"]);
    }

    #[test]
    fn rank_hits_drops_non_finite_scores() {
        let ranked = rank_hits(vec![
            MemoryHit {
                text: "nan".to_string(),
                score: f64::NAN,
            },
            MemoryHit {
                text: "relevant".to_string(),
                score: 0.4,
            },
            MemoryHit {
                text: "inf".to_string(),
                score: f64::INFINITY,
            },
        ]);
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].text, "relevant");
    }

    #[tokio::test]
    async fn disabled_service_never_finds_anything() {
        let service = DisabledMemoryService;
        service
            .add(&[MemoryMessage::user("x")], "writer")
            .await
            .unwrap();
        assert!(service.search("x", "writer").await.unwrap().is_empty());
    }
}

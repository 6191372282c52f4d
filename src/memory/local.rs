//! File-backed memory store, one bucket of entries per subject.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{MemoryHit, MemoryMessage, MemoryService, rank_hits};
use crate::augment::RECALL_INSTRUCTION;
use crate::error::CrewError;

const STOP_WORDS: &[&str] = &[
    "about", "after", "and", "any", "are", "but", "can", "each", "for", "from", "has", "have",
    "how", "into", "its", "not", "our", "should", "that", "the", "their", "them", "then", "there",
    "these", "this", "those", "was", "were", "what", "when", "which", "while", "who", "will",
    "with", "you", "your",
];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryEntry {
    pub text: String,
    pub created_at: DateTime<Utc>,
}

type Store = BTreeMap<String, BTreeMap<String, MemoryEntry>>;

pub struct LocalMemoryService {
    store: Mutex<Store>,
    storage_path: PathBuf,
}

/// Distinct content words of a query. The recall instruction prefix, short
/// tokens, and stop words never contribute to a score.
pub fn query_terms(query: &str) -> BTreeSet<String> {
    let query = query.strip_prefix(RECALL_INSTRUCTION).unwrap_or(query);
    query
        .split_whitespace()
        .map(|token| token.trim_matches(|c: char| !c.is_alphanumeric()))
        .map(str::to_lowercase)
        .filter(|token| token.chars().count() > 2)
        .filter(|token| !STOP_WORDS.contains(&token.as_str()))
        .collect()
}

/// Fraction of distinct query terms that occur in `text`.
pub fn term_overlap_score(terms: &BTreeSet<String>, text: &str) -> f64 {
    if terms.is_empty() {
        return 0.0;
    }
    let body = text.to_lowercase();
    let hits = terms.iter().filter(|term| body.contains(term.as_str())).count();
    hits as f64 / terms.len() as f64
}

impl LocalMemoryService {
    /// Create or load the store from disk.
    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let storage_path = path.as_ref().to_path_buf();
        let store = if storage_path.exists() {
            let content = std::fs::read_to_string(&storage_path).with_context(|| {
                format!("failed to read memory storage '{}'", storage_path.display())
            })?;
            serde_json::from_str(&content).with_context(|| {
                format!("memory storage '{}' is corrupt", storage_path.display())
            })?
        } else {
            Store::new()
        };

        Ok(Self {
            store: Mutex::new(store),
            storage_path,
        })
    }

    pub fn subjects(&self) -> Vec<String> {
        let store = self.store.lock().unwrap_or_else(|e| e.into_inner());
        store.keys().cloned().collect()
    }

    pub fn entry_count(&self, subject: &str) -> usize {
        let store = self.store.lock().unwrap_or_else(|e| e.into_inner());
        store.get(subject).map(BTreeMap::len).unwrap_or(0)
    }

    fn persist(&self, store: &Store) -> anyhow::Result<()> {
        if let Some(parent) = self.storage_path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).context("failed to create memory directory")?;
        }
        let json = serde_json::to_string_pretty(store).context("failed to serialize memory")?;
        std::fs::write(&self.storage_path, json).context("failed to write memory storage")?;
        Ok(())
    }
}

#[async_trait]
impl MemoryService for LocalMemoryService {
    fn backend_name(&self) -> &'static str {
        "local"
    }

    async fn add(&self, messages: &[MemoryMessage], subject: &str) -> Result<(), CrewError> {
        let text = messages
            .iter()
            .map(|message| message.content.trim())
            .filter(|content| !content.is_empty())
            .collect::<Vec<&str>>()
            .join("\n");
        if text.is_empty() {
            return Ok(());
        }

        let key = format!("{:x}", md5::compute(&text));
        let mut store = self.store.lock().unwrap_or_else(|e| e.into_inner());
        store.entry(subject.to_string()).or_default().insert(
            key,
            MemoryEntry {
                text,
                created_at: Utc::now(),
            },
        );
        self.persist(&store).map_err(|err| CrewError::Memory {
            message: format!("{err:#}"),
        })
    }

    async fn search(&self, query: &str, subject: &str) -> Result<Vec<MemoryHit>, CrewError> {
        let terms = query_terms(query);
        let store = self.store.lock().unwrap_or_else(|e| e.into_inner());
        let Some(entries) = store.get(subject) else {
            return Ok(Vec::new());
        };

        let mut ordered = entries.values().collect::<Vec<&MemoryEntry>>();
        ordered.sort_by_key(|entry| std::cmp::Reverse(entry.created_at));

        let hits = ordered
            .into_iter()
            .filter_map(|entry| {
                let score = term_overlap_score(&terms, &entry.text);
                (score > 0.0).then(|| MemoryHit {
                    text: entry.text.clone(),
                    score,
                })
            })
            .collect::<Vec<MemoryHit>>();
        Ok(rank_hits(hits))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::augment::recall_query;
    use tempfile::tempdir;

    #[tokio::test]
    async fn add_then_search_is_scoped_by_subject() {
        let dir = tempdir().unwrap();
        let service = LocalMemoryService::open(dir.path().join("memory.json")).unwrap();

        service
            .add(
                &[
                    MemoryMessage::user("How should summaries be structured?"),
                    MemoryMessage::assistant("Lead with the conclusion, then three bullet facts."),
                ],
                "writer",
            )
            .await
            .unwrap();

        let hits = service.search("structure the summary", "writer").await.unwrap();
        assert_eq!(hits.len(), 1);
        assert!(hits[0].text.contains("Lead with the conclusion"));

        assert!(service.search("structure the summary", "researcher").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn store_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested/memory.json");
        {
            let service = LocalMemoryService::open(&path).unwrap();
            service
                .add(&[MemoryMessage::user("Cite primary sources")], "researcher")
                .await
                .unwrap();
        }
        let reopened = LocalMemoryService::open(&path).unwrap();
        assert_eq!(reopened.subjects(), vec!["researcher"]);
        assert_eq!(reopened.entry_count("researcher"), 1);
    }

    #[tokio::test]
    async fn duplicate_text_is_stored_once() {
        let dir = tempdir().unwrap();
        let service = LocalMemoryService::open(dir.path().join("memory.json")).unwrap();
        for _ in 0..2 {
            service
                .add(&[MemoryMessage::user("Same lesson")], "qa")
                .await
                .unwrap();
        }
        assert_eq!(service.entry_count("qa"), 1);
    }

    #[tokio::test]
    async fn better_overlap_ranks_first() {
        let dir = tempdir().unwrap();
        let service = LocalMemoryService::open(dir.path().join("memory.json")).unwrap();
        service
            .add(&[MemoryMessage::user("battery regulation notes")], "researcher")
            .await
            .unwrap();
        service
            .add(&[MemoryMessage::user("battery chemistry")], "researcher")
            .await
            .unwrap();

        let hits = service
            .search("battery regulation", "researcher")
            .await
            .unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].text, "battery regulation notes");
        assert!(hits[0].score > hits[1].score);
    }

    #[test]
    fn term_overlap_ignores_short_and_stop_words() {
        let terms = query_terms("a to the API with retries");
        assert_eq!(terms.into_iter().collect::<Vec<_>>(), vec!["api", "retries"]);
    }

    #[test]
    fn recall_instruction_words_are_not_query_terms() {
        let terms = query_terms(&recall_query("upgrade kubernetes cluster"));
        assert_eq!(
            terms.into_iter().collect::<Vec<_>>(),
            vec!["cluster", "kubernetes", "upgrade"]
        );
    }

    #[tokio::test]
    async fn task_relevant_entry_beats_generic_guidance() {
        let dir = tempdir().unwrap();
        let service = LocalMemoryService::open(dir.path().join("memory.json")).unwrap();
        service
            .add(
                &[MemoryMessage::assistant("Apply the guidance and lessons that the task needs")],
                "writer",
            )
            .await
            .unwrap();
        service
            .add(
                &[MemoryMessage::assistant("Kubernetes cluster upgrades: drain nodes first")],
                "writer",
            )
            .await
            .unwrap();

        let hits = service
            .search(&recall_query("upgrade kubernetes cluster"), "writer")
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert!(hits[0].text.starts_with("Kubernetes cluster upgrades"));
    }
}

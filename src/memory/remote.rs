//! mem0-compatible HTTP memory client.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{MemoryHit, MemoryMessage, MemoryService, rank_hits};
use crate::error::CrewError;

const DEFAULT_BASE_URL: &str = "https://api.mem0.ai";

#[derive(Serialize)]
struct AddRequest<'a> {
    messages: &'a [MemoryMessage],
    agent_id: &'a str,
}

#[derive(Serialize)]
struct SearchRequest<'a> {
    query: &'a str,
    agent_id: &'a str,
}

#[derive(Debug, Deserialize)]
struct Mem0Hit {
    #[serde(default)]
    memory: String,
    #[serde(default)]
    score: Option<f64>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum SearchResponse {
    List(Vec<Mem0Hit>),
    Wrapped { results: Vec<Mem0Hit> },
}

impl SearchResponse {
    fn into_hits(self) -> Vec<MemoryHit> {
        let raw = match self {
            SearchResponse::List(hits) => hits,
            SearchResponse::Wrapped { results } => results,
        };
        raw.into_iter()
            .filter(|hit| !hit.memory.trim().is_empty())
            .map(|hit| MemoryHit {
                text: hit.memory,
                score: hit.score.unwrap_or(0.0),
            })
            .collect()
    }
}

pub struct Mem0MemoryService {
    base_url: String,
    api_key: String,
    http_client: reqwest::Client,
}

impl Mem0MemoryService {
    pub fn new(base_url: String, api_key: String, timeout_secs: u64) -> anyhow::Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs.max(1)))
            .build()
            .context("failed to build mem0 HTTP client")?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            http_client,
        })
    }

    /// Reads `MEM0_API_KEY` and optional `MEM0_BASE_URL`.
    pub fn from_env(timeout_secs: u64) -> anyhow::Result<Self> {
        let api_key = std::env::var("MEM0_API_KEY")
            .context("MEM0_API_KEY is required for the mem0 memory backend")?;
        let base_url =
            std::env::var("MEM0_BASE_URL").unwrap_or_else(|_| DEFAULT_BASE_URL.to_string());
        Self::new(base_url, api_key, timeout_secs)
    }

    fn memory_error(context: &str, err: impl std::fmt::Display) -> CrewError {
        CrewError::Memory {
            message: format!("{context}: {err}"),
        }
    }
}

#[async_trait]
impl MemoryService for Mem0MemoryService {
    fn backend_name(&self) -> &'static str {
        "mem0"
    }

    async fn add(&self, messages: &[MemoryMessage], subject: &str) -> Result<(), CrewError> {
        let url = format!("{}/v1/memories/", self.base_url);
        let response = self
            .http_client
            .post(&url)
            .header("Authorization", format!("Token {}", self.api_key))
            .json(&AddRequest {
                messages,
                agent_id: subject,
            })
            .send()
            .await
            .map_err(|err| Self::memory_error("mem0 add request failed", err))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Self::memory_error(
                "mem0 add rejected",
                format!("{status}: {body}"),
            ));
        }
        Ok(())
    }

    async fn search(&self, query: &str, subject: &str) -> Result<Vec<MemoryHit>, CrewError> {
        let url = format!("{}/v1/memories/search/", self.base_url);
        let response = self
            .http_client
            .post(&url)
            .header("Authorization", format!("Token {}", self.api_key))
            .json(&SearchRequest {
                query,
                agent_id: subject,
            })
            .send()
            .await
            .map_err(|err| Self::memory_error("mem0 search request failed", err))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Self::memory_error(
                "mem0 search rejected",
                format!("{status}: {body}"),
            ));
        }

        let parsed = response
            .json::<SearchResponse>()
            .await
            .map_err(|err| Self::memory_error("mem0 search returned an unexpected body", err))?;
        Ok(rank_hits(parsed.into_hits()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn search_response_accepts_bare_and_wrapped_lists() {
        let bare: SearchResponse =
            serde_json::from_str(r#"[{"memory": "cite sources", "score": 0.4}]"#).unwrap();
        assert_eq!(bare.into_hits()[0].text, "cite sources");

        let wrapped: SearchResponse = serde_json::from_str(
            r#"{"results": [{"memory": "", "score": 0.9}, {"memory": "be brief"}]}"#,
        )
        .unwrap();
        let hits = wrapped.into_hits();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].score, 0.0);
    }

    #[test]
    fn base_url_is_normalized() {
        let service =
            Mem0MemoryService::new("http://localhost:8000/".to_string(), "k".to_string(), 5)
                .unwrap();
        assert_eq!(service.base_url, "http://localhost:8000");
    }
}

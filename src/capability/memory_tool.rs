//! The memory capability injected into every worker.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{Value, json};

use super::{Capability, MEMORY_CAPABILITY};
use crate::memory::{MemoryMessage, MemoryService};

pub struct MemoryCapability {
    service: Arc<dyn MemoryService>,
}

impl MemoryCapability {
    pub fn new(service: Arc<dyn MemoryService>) -> Self {
        Self { service }
    }
}

fn required_str<'a>(args: &'a Value, key: &str) -> Option<&'a str> {
    args.get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

#[async_trait]
impl Capability for MemoryCapability {
    fn name(&self) -> &str {
        MEMORY_CAPABILITY
    }

    fn description(&self) -> &str {
        "Store or retrieve knowledge for a worker. \
         Args: {\"agent_name\": \"<worker>\", \"mode\": \"add\" | \"retrieve\", \
         \"content\": \"<text for add>\", \"feedback\": \"<optional, add>\", \
         \"query\": \"<text for retrieve>\"}"
    }

    async fn invoke(&self, args: Value) -> Result<Value> {
        let Some(agent_name) = required_str(&args, "agent_name") else {
            return Ok(json!({"error": "'agent_name' is required"}));
        };
        let mode = required_str(&args, "mode").unwrap_or("retrieve");

        match mode {
            "add" => {
                let Some(content) = required_str(&args, "content") else {
                    return Ok(json!({"error": "'content' is required when mode is 'add'"}));
                };
                let mut messages = vec![MemoryMessage::user(content)];
                if let Some(feedback) = required_str(&args, "feedback") {
                    messages.push(MemoryMessage::assistant(feedback));
                }
                match self.service.add(&messages, agent_name).await {
                    Ok(()) => Ok(json!({"status": "stored", "agent_name": agent_name})),
                    Err(err) => Ok(json!({"error": err.to_string()})),
                }
            }
            "retrieve" => {
                let Some(query) = required_str(&args, "query") else {
                    return Ok(json!({"error": "'query' is required when mode is 'retrieve'"}));
                };
                match self.service.search(query, agent_name).await {
                    Ok(hits) if hits.is_empty() => Ok(json!({"results": "", "count": 0})),
                    Ok(hits) => {
                        let rendered = hits
                            .iter()
                            .map(|hit| format!("[score: {:.2}]\n{}", hit.score, hit.text))
                            .collect::<Vec<String>>()
                            .join("\n\n---\n\n");
                        Ok(json!({"results": rendered, "count": hits.len()}))
                    }
                    Err(err) => Ok(json!({"error": err.to_string()})),
                }
            }
            _ => Ok(json!({"error": "Unknown mode. Use 'add' or 'retrieve'"})),
        }
    }
}

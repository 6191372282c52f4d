//! `crewgen memory ...` subcommands.

use std::collections::BTreeMap;

use anyhow::{Context, Result};

use super::{MemoryMessage, MemoryService, build_memory_service, rank_hits};
use crate::augment::recall_query;
use crate::config::RuntimeConfig;

/// Seed file layout: worker name mapped to the messages stored under it.
pub type SeedFile = BTreeMap<String, Vec<MemoryMessage>>;

pub fn parse_seed_file(content: &str, path: &str) -> Result<SeedFile> {
    serde_yaml::from_str::<SeedFile>(content).with_context(|| {
        format!(
            "invalid memory seed file '{}'. Expected worker names mapped to lists of {{role, content}}.",
            path
        )
    })
}

/// Stores every seeded message. Returns how many messages were written.
pub async fn seed(service: &dyn MemoryService, seeds: &SeedFile) -> Result<usize> {
    let mut stored = 0;
    for (subject, messages) in seeds {
        for message in messages {
            service
                .add(std::slice::from_ref(message), subject)
                .await
                .with_context(|| format!("failed to seed memory for '{}'", subject))?;
            stored += 1;
        }
        tracing::info!(subject = %subject, messages = messages.len(), "memory seeded");
    }
    Ok(stored)
}

pub async fn run_memory_seed(cfg: &RuntimeConfig, file: &str) -> Result<()> {
    let content = std::fs::read_to_string(file)
        .with_context(|| format!("failed to read memory seed file '{}'", file))?;
    let seeds = parse_seed_file(&content, file)?;
    let service = build_memory_service(cfg)?;
    let stored = seed(service.as_ref(), &seeds).await?;
    println!(
        "Seeded {} messages for {} workers into the {} memory backend.",
        stored,
        seeds.len(),
        service.backend_name()
    );
    Ok(())
}

pub async fn run_memory_search(cfg: &RuntimeConfig, subject: &str, query: &str) -> Result<()> {
    let service = build_memory_service(cfg)?;
    let hits = rank_hits(service.search(&recall_query(query), subject).await?);
    if hits.is_empty() {
        println!("No guidance stored for '{}' matches the query.", subject);
        return Ok(());
    }
    for hit in hits {
        println!("[score: {:.2}] {}", hit.score, hit.text);
    }
    Ok(())
}

pub async fn run_memory_add(cfg: &RuntimeConfig, subject: &str, text: &str) -> Result<()> {
    let service = build_memory_service(cfg)?;
    service
        .add(&[MemoryMessage::assistant(text)], subject)
        .await?;
    println!(
        "Stored guidance for '{}' in the {} memory backend.",
        subject,
        service.backend_name()
    );
    Ok(())
}

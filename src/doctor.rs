use anyhow::Result;

use crate::cli::MemoryBackend;
use crate::config::{RuntimeConfig, enabled_servers, load_agent_catalog, load_provider_config};
use crate::llm::{detect_provider, env_present};
use crate::memory::build_memory_service;

pub async fn run_doctor(cfg: &RuntimeConfig) -> Result<()> {
    println!(
        "Active profile: '{}' (config: {})",
        cfg.profile, cfg.config_path
    );

    let checks = [
        ("OPENAI_API_KEY", env_present("OPENAI_API_KEY")),
        ("ANTHROPIC_API_KEY", env_present("ANTHROPIC_API_KEY")),
        ("DEEPSEEK_API_KEY", env_present("DEEPSEEK_API_KEY")),
        ("GROQ_API_KEY", env_present("GROQ_API_KEY")),
        ("OLLAMA_HOST", env_present("OLLAMA_HOST")),
        ("SERPER_API_KEY", env_present("SERPER_API_KEY")),
        ("MEM0_API_KEY", env_present("MEM0_API_KEY")),
    ];

    println!("Environment check:");
    for (key, ok) in checks {
        let status = if ok { "set" } else { "missing" };
        println!("- {key}: {status}");
    }

    match detect_provider() {
        Some(provider) => println!("Auto provider resolution: {:?}", provider),
        None => {
            println!("Auto provider resolution: none");
            println!("Tip: export one provider key or run with --provider ollama");
        }
    }
    println!(
        "Models: worker={} manager={}",
        cfg.model.as_deref().unwrap_or("<provider-default>"),
        cfg.manager_model.as_deref().unwrap_or("<same as worker>")
    );
    println!("Strategy: {} (locale: {})", cfg.strategy, cfg.locale);

    match load_agent_catalog(&cfg.agents_path) {
        Ok(catalog) => println!(
            "Agent catalog: ok ({} archetypes in {})",
            catalog.len(),
            cfg.agents_path
        ),
        Err(err) => println!("Agent catalog: error ({err})"),
    }

    let servers = load_provider_config(&cfg.providers_path);
    println!(
        "Capability providers: configured={}, enabled={} ({})",
        servers.len(),
        enabled_servers(&servers).len(),
        cfg.providers_path
    );

    match build_memory_service(cfg) {
        Ok(service) => println!(
            "Memory: backend={} timeout_secs={}",
            service.backend_name(),
            cfg.memory_timeout_secs
        ),
        Err(err) => println!("Memory: error ({err:#})"),
    }
    if matches!(cfg.memory_backend, MemoryBackend::Local) {
        println!("Memory store path: {}", cfg.memory_path);
    }
    println!(
        "Knowledge follow-ups: {} (template: {}) record_outcomes={}",
        cfg.knowledge_tasks,
        cfg.knowledge_task_path.as_deref().unwrap_or("<built-in>"),
        cfg.record_outcomes
    );
    println!(
        "Workdir: {} (exists={})",
        cfg.workdir.display(),
        cfg.workdir.is_dir()
    );
    println!(
        "Telemetry: enabled={} path={}",
        cfg.telemetry_enabled, cfg.telemetry_path
    );

    Ok(())
}

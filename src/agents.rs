use anyhow::Result;

use crate::capability::CapabilityToken;
use crate::config::{AgentCatalog, WorkerArchetype};

fn describe_token(token: &CapabilityToken) -> String {
    match token {
        CapabilityToken::Local(name) => format!("{name} (built-in)"),
        CapabilityToken::Provider { provider, name } => {
            format!("{name} (provider '{provider}')")
        }
        CapabilityToken::ProviderAll(provider) => format!("all tools of provider '{provider}'"),
    }
}

pub fn run_agents_list(catalog: &AgentCatalog, path: &str) -> Result<()> {
    if catalog.is_empty() {
        println!("No worker archetypes in '{}'.", path);
        return Ok(());
    }

    println!("Worker archetypes in '{}':", path);
    for archetype in catalog.iter() {
        let delegation = if archetype.allow_delegation() {
            " delegation"
        } else {
            ""
        };
        println!(
            "- {} tools={}{}: {}",
            archetype.name,
            archetype.tools.len(),
            delegation,
            archetype.goal
        );
    }
    Ok(())
}

pub fn render_archetype(archetype: &WorkerArchetype) -> Vec<String> {
    let mut lines = vec![
        format!("Agent: {}", archetype.name),
        format!("Role: {}", archetype.role.as_deref().unwrap_or("<none>")),
        format!("Goal: {}", archetype.goal),
        format!(
            "Backstory: {}",
            if archetype.backstory.trim().is_empty() {
                "<none>"
            } else {
                archetype.backstory.trim()
            }
        ),
        format!("Allow delegation: {}", archetype.allow_delegation()),
        format!("Verbose: {}", archetype.verbose()),
    ];

    let tokens = archetype.capability_tokens();
    if tokens.is_empty() {
        lines.push("Capabilities: memory only".to_string());
    } else {
        lines.push("Capabilities (memory is always added):".to_string());
        lines.extend(tokens.iter().map(|token| format!("- {}", describe_token(token))));
    }

    let extra = archetype
        .params
        .iter()
        .filter(|(key, _)| !matches!(key.as_str(), "allow_delegation" | "verbose"))
        .map(|(key, value)| format!("{key}={value}"))
        .collect::<Vec<String>>();
    if !extra.is_empty() {
        lines.push(format!("Parameters: {}", extra.join(", ")));
    }
    lines
}

pub fn run_agents_show(catalog: &AgentCatalog, name: &str) -> Result<()> {
    let archetype = catalog.get(name).ok_or_else(|| {
        anyhow::anyhow!(
            "agent '{}' not found. Available agents: {}",
            name,
            catalog.names().join(", ")
        )
    })?;
    for line in render_archetype(archetype) {
        println!("{line}");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_agent_catalog;

    #[test]
    fn render_lists_parsed_tokens_and_extra_params() {
        let catalog = parse_agent_catalog(
            "browser_user:\n  role: Web operator\n  goal: Browse\n  tools: search_internet, navigate(browser), *(files)\n  allow_delegation: true\n  max_iter: 3\n",
            "agents.yaml",
        )
        .unwrap();
        let lines = render_archetype(catalog.get("browser_user").unwrap());

        assert!(lines.contains(&"Role: Web operator".to_string()));
        assert!(lines.contains(&"Allow delegation: true".to_string()));
        assert!(lines.contains(&"- search_internet (built-in)".to_string()));
        assert!(lines.contains(&"- navigate (provider 'browser')".to_string()));
        assert!(lines.contains(&"- all tools of provider 'files'".to_string()));
        assert!(lines.contains(&"Parameters: max_iter=3".to_string()));
    }

    #[test]
    fn show_unknown_agent_lists_available_names() {
        let catalog = parse_agent_catalog("writer:\n  goal: Write\n", "agents.yaml").unwrap();
        let err = run_agents_show(&catalog, "ghost").unwrap_err();
        assert!(err.to_string().contains("Available agents: writer"));
    }
}

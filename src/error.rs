use thiserror::Error;

/// Typed failures raised while compiling a goal into a crew graph.
#[derive(Debug, Error)]
pub enum CrewError {
    #[error("failed to load configuration '{path}': {message}")]
    ConfigLoad { path: String, message: String },

    #[error("model reply for goal '{goal}' is not a valid plan: {message}")]
    PlanParse { goal: String, message: String },

    #[error("unknown worker '{name}' referenced by {context}")]
    UnknownWorker { name: String, context: String },

    #[error("capability '{token}' requested by worker '{worker}' is not registered")]
    CapabilityNotFound { token: String, worker: String },

    #[error("capability provider '{provider}' failed: {message}")]
    ProviderProcess { provider: String, message: String },

    #[error("chat model call failed: {message}")]
    Model { message: String },

    #[error("memory service failed: {message}")]
    Memory { message: String },

    #[error("execution engine failed: {message}")]
    Execution { message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Config,
    Provider,
    Plan,
    Graph,
    Tooling,
    Memory,
    Input,
    Internal,
}

impl ErrorCategory {
    pub fn code(self) -> &'static str {
        match self {
            ErrorCategory::Config => "CONFIG",
            ErrorCategory::Provider => "PROVIDER",
            ErrorCategory::Plan => "PLAN",
            ErrorCategory::Graph => "GRAPH",
            ErrorCategory::Tooling => "TOOLING",
            ErrorCategory::Memory => "MEMORY",
            ErrorCategory::Input => "INPUT",
            ErrorCategory::Internal => "INTERNAL",
        }
    }

    pub fn hint(self) -> &'static str {
        match self {
            ErrorCategory::Config => {
                "Check --agents-path/--providers-path/--config and the field names in those files."
            }
            ErrorCategory::Provider => {
                "Set model credentials (for example OPENAI_API_KEY) or run with --provider ollama."
            }
            ErrorCategory::Plan => {
                "The model did not return a usable plan. Retry, or switch --model to a stronger model."
            }
            ErrorCategory::Graph => {
                "Run crewgen agents list and make sure every planned worker and tool token exists."
            }
            ErrorCategory::Tooling => {
                "Review capability configuration and retry with RUST_LOG=info for detailed tool logs."
            }
            ErrorCategory::Memory => {
                "Check --memory-backend and MEM0_API_KEY, or use --memory-backend local."
            }
            ErrorCategory::Input => "Run crewgen --help and correct command arguments.",
            ErrorCategory::Internal => {
                "Retry with RUST_LOG=debug. If it persists, capture logs and open an issue."
            }
        }
    }
}

impl CrewError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            CrewError::ConfigLoad { .. } => ErrorCategory::Config,
            CrewError::PlanParse { .. } => ErrorCategory::Plan,
            CrewError::UnknownWorker { .. } | CrewError::CapabilityNotFound { .. } => {
                ErrorCategory::Graph
            }
            CrewError::ProviderProcess { .. } => ErrorCategory::Tooling,
            CrewError::Model { .. } => ErrorCategory::Provider,
            CrewError::Memory { .. } => ErrorCategory::Memory,
            CrewError::Execution { .. } => ErrorCategory::Internal,
        }
    }
}

pub fn categorize_error(err: &anyhow::Error) -> ErrorCategory {
    if let Some(crew) = err.chain().find_map(|cause| cause.downcast_ref::<CrewError>()) {
        return crew.category();
    }

    let msg = format!("{err:#}").to_ascii_lowercase();

    if msg.contains("api_key")
        || msg.contains("no provider could be auto-detected")
        || msg.contains("provider")
    {
        return ErrorCategory::Provider;
    }

    if msg.contains("invalid value")
        || msg.contains("unknown argument")
        || msg.contains("failed to read input")
        || msg.contains("goal cannot be empty")
        || msg.contains("profile")
    {
        return ErrorCategory::Input;
    }

    if msg.contains("memory") || msg.contains("mem0") {
        return ErrorCategory::Memory;
    }

    if msg.contains("tool") || msg.contains("mcp") || msg.contains("capability") {
        return ErrorCategory::Tooling;
    }

    ErrorCategory::Internal
}

pub fn format_cli_error(err: &anyhow::Error, show_sensitive_config: bool) -> String {
    let category = categorize_error(err);
    let rendered_error = render_error_message(err, show_sensitive_config);
    format!(
        "[{}] {}\nHint: {}",
        category.code(),
        rendered_error,
        category.hint()
    )
}

pub fn render_error_message(err: &anyhow::Error, show_sensitive_config: bool) -> String {
    let rendered = format!("{err:#}");
    if show_sensitive_config {
        rendered
    } else {
        redact_sensitive_text(&rendered)
    }
}

const SECRET_MARKERS: [&str; 3] = ["sk-", "Token ", "Bearer "];

/// Masks API keys that leak into error text from HTTP clients.
pub fn redact_sensitive_text(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut cursor = 0usize;

    while let Some((offset, marker)) = SECRET_MARKERS
        .iter()
        .filter_map(|marker| text[cursor..].find(marker).map(|offset| (offset, *marker)))
        .min_by_key(|(offset, _)| *offset)
    {
        let start = cursor + offset;
        out.push_str(&text[cursor..start]);
        out.push_str(marker);

        let value_start = start + marker.len();
        let remainder = &text[value_start..];
        let end = remainder
            .find(|ch: char| {
                ch.is_whitespace() || matches!(ch, '"' | '\'' | ',' | ';' | ')' | ']' | '}')
            })
            .unwrap_or(remainder.len());
        if end > 0 {
            out.push_str("[REDACTED]");
        }
        cursor = value_start + end;
    }

    out.push_str(&text[cursor..]);
    out
}

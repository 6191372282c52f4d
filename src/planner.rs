//! Plan synthesis: ask the chat model which workers take part and what each does.

use serde::{Deserialize, Serialize};

use crate::error::CrewError;
use crate::llm::ChatModel;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannedWorker {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub goal: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannedTask {
    pub description: String,
    #[serde(rename = "agent")]
    pub worker: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_output: Option<String>,
}

/// Model-authored plan. Task order is execution order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    #[serde(rename = "agents")]
    pub workers: Vec<PlannedWorker>,
    pub tasks: Vec<PlannedTask>,
}

pub fn build_plan_prompt(goal: &str, known_workers: &[String], locale: &str) -> String {
    let names = known_workers
        .iter()
        .map(|name| format!("\"{name}\""))
        .collect::<Vec<String>>()
        .join(", ");

    format!(
        "You configure a crew of cooperating AI workers.\n\
         \n\
         To reach the mission below, split the required expertise across at least two of the \
         available workers when that is feasible. Divide the work into tasks so that each worker \
         handles the part that matches its expertise and hands its result to the next task.\n\
         Tasks run sequentially, so list them in execution order.\n\
         Write every description and expected output in {locale}.\n\
         \n\
         Available workers: [{names}]\n\
         \n\
         Reply with VALID JSON only, using double quotes around every key and string value, \
         in exactly this shape:\n\
         {{\n\
         \x20 \"agents\": [\n\
         \x20   {{\"name\": \"one of the available workers\", \"goal\": \"optional goal for this mission\"}}\n\
         \x20 ],\n\
         \x20 \"tasks\": [\n\
         \x20   {{\"description\": \"what to do\", \"agent\": \"worker assigned to the task\", \"expected_output\": \"what the task must produce\"}}\n\
         \x20 ]\n\
         }}\n\
         \n\
         Mission: {goal}\n"
    )
}

/// Unwraps a reply that is exactly one fenced code block; other text is returned trimmed.
fn strip_code_fence(reply: &str) -> &str {
    let trimmed = reply.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let Some(body) = rest.strip_suffix("```") else {
        return trimmed;
    };
    if body.contains("```") {
        return trimmed;
    }
    match body.split_once('\n') {
        Some((info, content)) if !info.trim().contains(char::is_whitespace) => content.trim(),
        _ => body.trim(),
    }
}

/// Parses the model reply as a plan. No partial recovery.
pub fn parse_plan(goal: &str, reply: &str) -> Result<Plan, CrewError> {
    serde_json::from_str::<Plan>(strip_code_fence(reply)).map_err(|err| CrewError::PlanParse {
        goal: goal.to_string(),
        message: err.to_string(),
    })
}

pub async fn synthesize(
    model: &dyn ChatModel,
    goal: &str,
    known_workers: &[String],
    locale: &str,
) -> Result<Plan, CrewError> {
    let prompt = build_plan_prompt(goal, known_workers, locale);
    tracing::info!(model = %model.name(), workers = known_workers.len(), "Synthesizing plan");
    let reply = model.complete(&prompt).await?;
    let plan = parse_plan(goal, &reply)?;
    tracing::info!(
        workers = plan.workers.len(),
        tasks = plan.tasks.len(),
        "Plan synthesized"
    );
    Ok(plan)
}

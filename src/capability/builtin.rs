//! Local capabilities every registry starts with.

use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};

use super::Capability;

const SERPER_ENDPOINT: &str = "https://google.serper.dev/search";
const SCRAPE_MAX_CHARS: usize = 8_000;
const HTTP_TIMEOUT_SECS: u64 = 30;

fn error_payload(code: &str, message: impl Into<String>) -> Value {
    json!({
        "status": "error",
        "code": code,
        "error": message.into(),
    })
}

fn http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(HTTP_TIMEOUT_SECS))
        .build()
        .unwrap_or_default()
}

/// Writes a file inside the configured working directory.
pub struct WriteFileCapability {
    workdir: PathBuf,
}

impl WriteFileCapability {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteFileRequest {
    pub path: String,
    pub content: String,
}

/// Accepts `{"path", "content"}` or the legacy `{"data": "path|content"}` form.
pub fn parse_write_file_request(args: &Value) -> Result<WriteFileRequest, Value> {
    if let Some(data) = args.get("data").and_then(Value::as_str) {
        let Some((path, content)) = data.split_once('|') else {
            return Err(error_payload(
                "invalid_args",
                "'data' must be '<path>|<content>'",
            ));
        };
        let path = path
            .chars()
            .filter(|ch| !ch.is_whitespace() && *ch != '`')
            .collect::<String>();
        return Ok(WriteFileRequest {
            path,
            content: content.to_string(),
        });
    }

    let path = args
        .get("path")
        .and_then(Value::as_str)
        .map(str::trim)
        .unwrap_or_default()
        .to_string();
    if path.is_empty() {
        return Err(error_payload("invalid_args", "'path' is required for write_file"));
    }
    let content = args
        .get("content")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    Ok(WriteFileRequest { path, content })
}

/// Resolves `requested` under `workdir`, rejecting absolute paths and parent traversal.
pub fn confine_to_workdir(requested: &str, workdir: &Path) -> Result<PathBuf, Value> {
    let relative = Path::new(requested);
    for component in relative.components() {
        match component {
            Component::Normal(_) | Component::CurDir => {}
            _ => {
                return Err(error_payload(
                    "denied_path",
                    format!(
                        "write_file denied path '{}': outside working directory '{}'",
                        requested,
                        workdir.display()
                    ),
                ));
            }
        }
    }
    Ok(workdir.join(relative))
}

#[async_trait]
impl Capability for WriteFileCapability {
    fn name(&self) -> &str {
        "write_file"
    }

    fn description(&self) -> &str {
        "Write text content to a file inside the working directory. \
         Args: {\"path\": \"<relative path>\", \"content\": \"<text>\"}"
    }

    async fn invoke(&self, args: Value) -> Result<Value> {
        let request = match parse_write_file_request(&args) {
            Ok(request) => request,
            Err(payload) => return Ok(payload),
        };
        let target = match confine_to_workdir(&request.path, &self.workdir) {
            Ok(target) => target,
            Err(payload) => return Ok(payload),
        };

        if let Some(parent) = target.parent()
            && let Err(err) = tokio::fs::create_dir_all(parent).await
        {
            return Ok(error_payload(
                "io_error",
                format!("failed to create '{}': {err}", parent.display()),
            ));
        }
        if let Err(err) = tokio::fs::write(&target, request.content.as_bytes()).await {
            return Ok(error_payload(
                "io_error",
                format!("failed to write '{}': {err}", target.display()),
            ));
        }

        tracing::info!(path = %target.display(), bytes = request.content.len(), "write_file completed");
        Ok(json!({
            "status": "ok",
            "path": target.display().to_string(),
            "bytes": request.content.len(),
        }))
    }
}

/// Web search through the Serper API (`SERPER_API_KEY`).
pub struct SearchInternetCapability {
    client: reqwest::Client,
}

impl Default for SearchInternetCapability {
    fn default() -> Self {
        Self {
            client: http_client(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct SerperResponse {
    #[serde(default)]
    organic: Vec<SerperResult>,
}

#[derive(Debug, Deserialize)]
struct SerperResult {
    #[serde(default)]
    title: String,
    #[serde(default)]
    link: String,
    #[serde(default)]
    snippet: String,
}

#[async_trait]
impl Capability for SearchInternetCapability {
    fn name(&self) -> &str {
        "search_internet"
    }

    fn description(&self) -> &str {
        "Search the internet about a topic and return titles, links, and snippets. \
         Args: {\"query\": \"<text>\"}"
    }

    async fn invoke(&self, args: Value) -> Result<Value> {
        let query = args
            .get("query")
            .and_then(Value::as_str)
            .map(str::trim)
            .unwrap_or_default();
        if query.is_empty() {
            return Ok(error_payload("invalid_args", "'query' is required"));
        }
        let Ok(api_key) = std::env::var("SERPER_API_KEY") else {
            return Ok(error_payload(
                "missing_credentials",
                "SERPER_API_KEY is not set",
            ));
        };

        let response = match self
            .client
            .post(SERPER_ENDPOINT)
            .header("X-API-KEY", api_key)
            .json(&json!({ "q": query }))
            .send()
            .await
        {
            Ok(response) => response,
            Err(err) => return Ok(error_payload("request_failed", err.to_string())),
        };
        if !response.status().is_success() {
            return Ok(error_payload(
                "request_failed",
                format!("search API returned {}", response.status()),
            ));
        }
        let parsed = match response.json::<SerperResponse>().await {
            Ok(parsed) => parsed,
            Err(err) => return Ok(error_payload("invalid_response", err.to_string())),
        };

        let results = parsed
            .organic
            .iter()
            .map(|result| {
                format!(
                    "Title: {}\nLink: {}\nSnippet: {}\n-----------------",
                    result.title, result.link, result.snippet
                )
            })
            .collect::<Vec<String>>()
            .join("\n");
        Ok(json!({ "status": "ok", "results": results }))
    }
}

/// Fetches a page and returns its visible text.
pub struct ScrapeWebsiteCapability {
    client: reqwest::Client,
}

impl Default for ScrapeWebsiteCapability {
    fn default() -> Self {
        Self {
            client: http_client(),
        }
    }
}

/// Converts a fetched page to markdown-flavoured text, skipping scripts and styles.
pub fn page_to_text(html: &str) -> std::io::Result<String> {
    htmd::HtmlToMarkdown::builder()
        .skip_tags(vec!["script", "style", "noscript"])
        .build()
        .convert(html)
}

#[async_trait]
impl Capability for ScrapeWebsiteCapability {
    fn name(&self) -> &str {
        "scrape_website"
    }

    fn description(&self) -> &str {
        "Fetch a web page and return its readable text. Args: {\"url\": \"https://...\"}"
    }

    async fn invoke(&self, args: Value) -> Result<Value> {
        let url = args
            .get("url")
            .and_then(Value::as_str)
            .map(str::trim)
            .unwrap_or_default();
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Ok(error_payload("invalid_args", "'url' must be an http(s) URL"));
        }

        let body = match self.client.get(url).send().await {
            Ok(response) if response.status().is_success() => match response.text().await {
                Ok(body) => body,
                Err(err) => return Ok(error_payload("invalid_response", err.to_string())),
            },
            Ok(response) => {
                return Ok(error_payload(
                    "request_failed",
                    format!("'{}' returned {}", url, response.status()),
                ));
            }
            Err(err) => return Ok(error_payload("request_failed", err.to_string())),
        };

        let mut text = match page_to_text(&body) {
            Ok(text) => text.trim().to_string(),
            Err(err) => return Ok(error_payload("invalid_response", err.to_string())),
        };
        let truncated = text.chars().count() > SCRAPE_MAX_CHARS;
        if truncated {
            text = text.chars().take(SCRAPE_MAX_CHARS).collect();
        }
        Ok(json!({ "status": "ok", "url": url, "text": text, "truncated": truncated }))
    }
}

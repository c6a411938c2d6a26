//! Run a target's prompt through an OpenAI-compatible chat endpoint.
//!
//! The prompt is fetched with [`ConnectionManager::get_prompt`], so the
//! usual connection checks and counters apply. Failures that happen after
//! that are reported as `execution_error` with `details.errorType` set to
//! `llm_config_error` or `llm_request_error`.

use std::time::Duration;

use once_cell::sync::Lazy;
use probe_mcp::{
    ConnectionManager, ErrorDescriptor, ErrorKind, OperationResult, PromptRendering, Stopwatch,
};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use thiserror::Error;
use tracing::{error, info};

pub const LLM_URL_ENV: &str = "LLM_URL";
pub const LLM_MODEL_ENV: &str = "LLM_MODEL_NAME";
pub const LLM_API_KEY_ENV: &str = "LLM_API_KEY";

const DEFAULT_MAX_TOKENS: u32 = 1000;
const DEFAULT_TEMPERATURE: f64 = 0.7;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
const MAX_ERROR_BODY_CHARS: usize = 500;

static FENCED_JSON: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)```json\s*(.*?)\s*```").unwrap());

/// Per-call overrides; anything unset falls back to the environment.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LlmConfigOverrides {
    pub url: Option<String>,
    pub model: Option<String>,
    pub api_key: Option<String>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f64>,
}

/// Resolved endpoint settings.
#[derive(Clone, PartialEq)]
pub struct LlmSettings {
    pub url: String,
    pub model: String,
    api_key: String,
    pub max_tokens: u32,
    pub temperature: f64,
}

impl std::fmt::Debug for LlmSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LlmSettings")
            .field("url", &self.url)
            .field("model", &self.model)
            .field("api_key", &"****")
            .field("max_tokens", &self.max_tokens)
            .field("temperature", &self.temperature)
            .finish()
    }
}

impl LlmSettings {
    pub fn resolve(overrides: &LlmConfigOverrides) -> Result<Self, LlmError> {
        let pick = |value: &Option<String>, env: &str| {
            value
                .clone()
                .or_else(|| std::env::var(env).ok())
                .filter(|v| !v.trim().is_empty())
        };
        let url = pick(&overrides.url, LLM_URL_ENV);
        let model = pick(&overrides.model, LLM_MODEL_ENV);
        let api_key = pick(&overrides.api_key, LLM_API_KEY_ENV);

        match (url, model, api_key) {
            (Some(url), Some(model), Some(api_key)) => Ok(Self {
                url,
                model,
                api_key,
                max_tokens: overrides.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
                temperature: overrides.temperature.unwrap_or(DEFAULT_TEMPERATURE),
            }),
            (url, model, api_key) => Err(LlmError::MissingConfig {
                has_url: url.is_some(),
                has_model: model.is_some(),
                has_api_key: api_key.is_some(),
            }),
        }
    }

    pub fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.url.trim_end_matches('/'))
    }
}

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("Missing LLM configuration. Provide llm_config or set LLM_URL, LLM_MODEL_NAME, and LLM_API_KEY")]
    MissingConfig {
        has_url: bool,
        has_model: bool,
        has_api_key: bool,
    },

    #[error("LLM request failed with status {status}")]
    Status { status: u16, body: String },

    #[error("LLM request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("LLM response was malformed: {0}")]
    Malformed(String),
}

impl LlmError {
    pub fn error_type(&self) -> &'static str {
        match self {
            LlmError::MissingConfig { .. } => "llm_config_error",
            LlmError::Status { .. } | LlmError::Http(_) | LlmError::Malformed(_) => {
                "llm_request_error"
            }
        }
    }

    fn to_descriptor(&self) -> ErrorDescriptor {
        let descriptor = ErrorDescriptor::new(ErrorKind::ExecutionError, self.to_string())
            .with_detail("errorType", self.error_type());
        let (mut descriptor, suggestion) = match self {
            LlmError::MissingConfig {
                has_url,
                has_model,
                has_api_key,
            } => (
                descriptor
                    .with_detail("hasUrl", *has_url)
                    .with_detail("hasModel", *has_model)
                    .with_detail("hasApiKey", *has_api_key),
                "Set LLM_URL, LLM_MODEL_NAME, and LLM_API_KEY in your .env file",
            ),
            LlmError::Status { status, body } => (
                descriptor
                    .with_detail("statusCode", *status)
                    .with_detail("responseText", body.as_str()),
                "Check LLM endpoint configuration and API key",
            ),
            LlmError::Http(_) | LlmError::Malformed(_) => (
                descriptor,
                "Check that the LLM endpoint is reachable and OpenAI-compatible",
            ),
        };
        descriptor.suggestion = Some(suggestion.to_string());
        descriptor
    }
}

/// Arguments of `execute_prompt_with_llm`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PromptExecution {
    pub prompt_name: String,
    #[serde(default)]
    pub prompt_arguments: Map<String, Value>,
    #[serde(default)]
    pub fill_variables: Option<Map<String, Value>>,
    #[serde(default)]
    pub llm_config: Option<LlmConfigOverrides>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptSummary {
    pub name: String,
    pub arguments: Map<String, Value>,
    pub message_count: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LlmReply {
    pub text: String,
    pub usage: Value,
    pub model: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LlmOutcome {
    pub prompt: PromptSummary,
    /// The body sent to the endpoint (credentials are never part of it).
    pub llm_request: Value,
    pub llm_response: LlmReply,
    pub parsed_response: Option<Value>,
    pub metadata: Map<String, Value>,
}

pub async fn execute_prompt_with_llm(
    manager: &ConnectionManager,
    http: &reqwest::Client,
    request: PromptExecution,
) -> OperationResult<LlmOutcome> {
    let stopwatch = Stopwatch::start();
    info!(
        prompt = %request.prompt_name,
        has_fill_variables = request.fill_variables.is_some(),
        "Executing prompt with LLM"
    );

    let prompt = manager
        .get_prompt(&request.prompt_name, request.prompt_arguments.clone())
        .await;
    let session = prompt.session.clone();
    let prompt_ms = prompt.timing.duration_ms;
    let rendering = match prompt.into_result() {
        Ok(rendering) => rendering,
        Err(descriptor) => return OperationResult::failed(descriptor, session, &stopwatch),
    };

    let mut messages = flatten_messages(&rendering);
    if let Some(variables) = &request.fill_variables {
        fill_variables(&mut messages, variables);
    }

    let overrides = request.llm_config.clone().unwrap_or_default();
    let settings = match LlmSettings::resolve(&overrides) {
        Ok(settings) => settings,
        Err(err) => {
            error!(prompt = %request.prompt_name, error = %err, "LLM not configured");
            return OperationResult::failed(err.to_descriptor(), session, &stopwatch);
        }
    };

    let body = json!({
        "model": settings.model,
        "messages": messages,
        "max_tokens": settings.max_tokens,
        "temperature": settings.temperature,
    });

    let llm_watch = Stopwatch::start();
    let reply = match complete(http, &settings, &body).await {
        Ok(reply) => reply,
        Err(err) => {
            error!(prompt = %request.prompt_name, error = %err, "LLM request failed");
            return OperationResult::failed(err.to_descriptor(), session, &stopwatch);
        }
    };
    let llm_ms = llm_watch.stop().duration_ms;

    let parsed_response = extract_json(&reply.text);
    let mut metadata = Map::new();
    metadata.insert("promptRetrievalMs".into(), json!(prompt_ms));
    metadata.insert("llmExecutionMs".into(), json!(llm_ms));
    metadata.insert("llmEndpoint".into(), json!(settings.url));
    metadata.insert("llmModel".into(), json!(settings.model));

    info!(
        prompt = %request.prompt_name,
        prompt_ms,
        llm_ms,
        "Prompt executed with LLM"
    );

    let outcome = LlmOutcome {
        prompt: PromptSummary {
            name: rendering.name,
            arguments: rendering.arguments,
            message_count: messages.len(),
        },
        llm_request: body,
        llm_response: reply,
        parsed_response,
        metadata,
    };
    OperationResult::ok(outcome, session, &stopwatch)
}

/// POST the chat request and pull out the first choice.
pub async fn complete(
    http: &reqwest::Client,
    settings: &LlmSettings,
    body: &Value,
) -> Result<LlmReply, LlmError> {
    let response = http
        .post(settings.endpoint())
        .bearer_auth(&settings.api_key)
        .timeout(REQUEST_TIMEOUT)
        .json(body)
        .send()
        .await?;

    let status = response.status();
    if !status.is_success() {
        let text = response.text().await.unwrap_or_default();
        return Err(LlmError::Status {
            status: status.as_u16(),
            body: truncate_chars(&text, MAX_ERROR_BODY_CHARS),
        });
    }

    let payload: Value = response.json().await?;
    let text = payload
        .pointer("/choices/0/message/content")
        .and_then(Value::as_str)
        .ok_or_else(|| LlmError::Malformed("missing choices[0].message.content".to_string()))?
        .to_string();

    Ok(LlmReply {
        text,
        usage: payload.get("usage").cloned().unwrap_or_else(|| json!({})),
        model: payload
            .get("model")
            .and_then(Value::as_str)
            .map(str::to_string),
    })
}

/// Reduce prompt messages to `{role, content}` text pairs.
pub fn flatten_messages(rendering: &PromptRendering) -> Vec<ChatMessage> {
    let Ok(Value::Array(messages)) = serde_json::to_value(&rendering.messages) else {
        return Vec::new();
    };

    messages
        .iter()
        .map(|message| {
            let role = message
                .get("role")
                .and_then(Value::as_str)
                .unwrap_or("user")
                .to_string();
            let content = match message.get("content") {
                Some(content) => match content.get("text").and_then(Value::as_str) {
                    Some(text) => text.to_string(),
                    None => content.to_string(),
                },
                None => String::new(),
            };
            ChatMessage { role, content }
        })
        .collect()
}

/// Replace `{name}` placeholders. Non-string values are inserted as pretty JSON.
pub fn fill_variables(messages: &mut [ChatMessage], variables: &Map<String, Value>) {
    for message in messages.iter_mut() {
        for (name, value) in variables {
            let placeholder = format!("{{{}}}", name);
            if !message.content.contains(&placeholder) {
                continue;
            }
            let replacement = match value {
                Value::String(s) => s.clone(),
                other => serde_json::to_string_pretty(other).unwrap_or_else(|_| other.to_string()),
            };
            message.content = message.content.replace(&placeholder, &replacement);
        }
    }
}

/// Best-effort JSON from a reply: a fenced json block, else a body that
/// starts with `{`.
pub fn extract_json(text: &str) -> Option<Value> {
    if let Some(captures) = FENCED_JSON.captures(text) {
        return captures
            .get(1)
            .and_then(|m| serde_json::from_str(m.as_str()).ok());
    }
    let trimmed = text.trim();
    if trimmed.starts_with('{') {
        return serde_json::from_str(trimmed).ok();
    }
    None
}

fn truncate_chars(text: &str, max: usize) -> String {
    text.chars().take(max).collect()
}

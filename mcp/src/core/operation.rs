//! Proxied operations and their payloads.
//!
//! [`Operation`] is the closed set of requests the probe relays to a target.
//! [`Reply`] is what the protocol client hands back, untouched. The payload
//! structs wrap a reply for the caller without dropping or rewriting any of
//! the target's data.

use rmcp::model::{
    CallToolResult, GetPromptResult, Prompt, PromptMessage, ReadResourceResult, Resource,
    ResourceContents, Tool,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::session::{PreviousSessionSummary, SessionInfo, SessionStatus};
use crate::error::{ClientError, ErrorKind};

/// Operation category; each has its own counter and not-found kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationCategory {
    ToolList,
    ToolCall,
    ResourceList,
    ResourceRead,
    PromptList,
    PromptGet,
}

impl OperationCategory {
    /// Public operation name, as exposed to callers.
    pub fn label(&self) -> &'static str {
        match self {
            OperationCategory::ToolList => "list_tools",
            OperationCategory::ToolCall => "call_tool",
            OperationCategory::ResourceList => "list_resources",
            OperationCategory::ResourceRead => "read_resource",
            OperationCategory::PromptList => "list_prompts",
            OperationCategory::PromptGet => "get_prompt",
        }
    }

    pub fn noun(&self) -> &'static str {
        match self {
            OperationCategory::ToolList | OperationCategory::ToolCall => "tool",
            OperationCategory::ResourceList | OperationCategory::ResourceRead => "resource",
            OperationCategory::PromptList | OperationCategory::PromptGet => "prompt",
        }
    }

    /// Not-found kind for operations that address a single item.
    pub fn not_found_kind(&self) -> Option<ErrorKind> {
        match self {
            OperationCategory::ToolCall => Some(ErrorKind::ToolNotFound),
            OperationCategory::ResourceRead => Some(ErrorKind::ResourceNotFound),
            OperationCategory::PromptGet => Some(ErrorKind::PromptNotFound),
            _ => None,
        }
    }

    pub fn takes_arguments(&self) -> bool {
        matches!(
            self,
            OperationCategory::ToolCall | OperationCategory::PromptGet
        )
    }
}

/// A request relayed to the target.
#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    ListTools,
    CallTool {
        name: String,
        arguments: Map<String, Value>,
    },
    ListResources,
    ReadResource {
        uri: String,
    },
    ListPrompts,
    GetPrompt {
        name: String,
        arguments: Map<String, Value>,
    },
}

impl Operation {
    pub fn category(&self) -> OperationCategory {
        match self {
            Operation::ListTools => OperationCategory::ToolList,
            Operation::CallTool { .. } => OperationCategory::ToolCall,
            Operation::ListResources => OperationCategory::ResourceList,
            Operation::ReadResource { .. } => OperationCategory::ResourceRead,
            Operation::ListPrompts => OperationCategory::PromptList,
            Operation::GetPrompt { .. } => OperationCategory::PromptGet,
        }
    }

    /// Fields identifying the request, copied into error details.
    pub fn context_details(&self) -> Map<String, Value> {
        let mut details = Map::new();
        match self {
            Operation::CallTool { name, arguments } => {
                details.insert("toolName".into(), Value::String(name.clone()));
                details.insert("arguments".into(), Value::Object(arguments.clone()));
            }
            Operation::ReadResource { uri } => {
                details.insert("uri".into(), Value::String(uri.clone()));
            }
            Operation::GetPrompt { name, arguments } => {
                details.insert("promptName".into(), Value::String(name.clone()));
                details.insert("arguments".into(), Value::Object(arguments.clone()));
            }
            Operation::ListTools | Operation::ListResources | Operation::ListPrompts => {}
        }
        details
    }
}

/// Raw reply from the protocol client.
#[derive(Debug, Clone)]
pub enum Reply {
    Tools(Vec<Tool>),
    ToolCall(CallToolResult),
    Resources(Vec<Resource>),
    ResourceContents(ReadResourceResult),
    Prompts(Vec<Prompt>),
    Prompt(GetPromptResult),
}

impl Reply {
    fn variant(&self) -> &'static str {
        match self {
            Reply::Tools(_) => "tool list",
            Reply::ToolCall(_) => "tool call result",
            Reply::Resources(_) => "resource list",
            Reply::ResourceContents(_) => "resource contents",
            Reply::Prompts(_) => "prompt list",
            Reply::Prompt(_) => "prompt",
        }
    }

    fn mismatch(&self, expected: &str) -> ClientError {
        ClientError::Unexpected(format!("expected {}, got {}", expected, self.variant()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolList {
    pub tools: Vec<Tool>,
    pub count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallOutcome {
    pub tool_name: String,
    pub arguments: Map<String, Value>,
    /// Primary value: first text item, else structured content, else all content.
    pub result: Value,
    /// The target's complete reply.
    pub call_result: CallToolResult,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceList {
    pub resources: Vec<Resource>,
    pub count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceContent {
    pub uri: String,
    pub contents: Vec<ResourceContents>,
    pub count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptList {
    pub prompts: Vec<Prompt>,
    pub count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptRendering {
    pub name: String,
    pub arguments: Map<String, Value>,
    pub description: Option<String>,
    pub messages: Vec<PromptMessage>,
    pub count: usize,
}

impl ToolList {
    pub fn from_reply(reply: Reply) -> Result<Self, ClientError> {
        match reply {
            Reply::Tools(tools) => Ok(Self {
                count: tools.len(),
                tools,
            }),
            other => Err(other.mismatch("tool list")),
        }
    }

    pub fn names(&self) -> Vec<String> {
        self.tools.iter().map(|t| t.name.to_string()).collect()
    }
}

impl ToolCallOutcome {
    /// Build the outcome, turning an `isError` result into a failure.
    pub fn from_reply(
        reply: Reply,
        tool_name: &str,
        arguments: &Map<String, Value>,
    ) -> Result<Self, ClientError> {
        let call_result = match reply {
            Reply::ToolCall(result) => result,
            other => return Err(other.mismatch("tool call result")),
        };
        let raw = serde_json::to_value(&call_result)
            .map_err(|e| ClientError::Unexpected(format!("serialize tool result: {}", e)))?;

        if call_result.is_error == Some(true) {
            let message = first_text(&raw).unwrap_or_else(|| "tool reported an error".to_string());
            return Err(ClientError::ToolFailed {
                message,
                result: raw,
            });
        }

        Ok(Self {
            tool_name: tool_name.to_string(),
            arguments: arguments.clone(),
            result: primary_value(&raw),
            call_result,
        })
    }
}

impl ResourceList {
    pub fn from_reply(reply: Reply) -> Result<Self, ClientError> {
        match reply {
            Reply::Resources(resources) => Ok(Self {
                count: resources.len(),
                resources,
            }),
            other => Err(other.mismatch("resource list")),
        }
    }
}

impl ResourceContent {
    pub fn from_reply(reply: Reply, uri: &str) -> Result<Self, ClientError> {
        match reply {
            Reply::ResourceContents(result) => Ok(Self {
                uri: uri.to_string(),
                count: result.contents.len(),
                contents: result.contents,
            }),
            other => Err(other.mismatch("resource contents")),
        }
    }
}

impl PromptList {
    pub fn from_reply(reply: Reply) -> Result<Self, ClientError> {
        match reply {
            Reply::Prompts(prompts) => Ok(Self {
                count: prompts.len(),
                prompts,
            }),
            other => Err(other.mismatch("prompt list")),
        }
    }
}

impl PromptRendering {
    pub fn from_reply(
        reply: Reply,
        name: &str,
        arguments: &Map<String, Value>,
    ) -> Result<Self, ClientError> {
        match reply {
            Reply::Prompt(result) => Ok(Self {
                name: name.to_string(),
                arguments: arguments.clone(),
                description: result.description,
                count: result.messages.len(),
                messages: result.messages,
            }),
            other => Err(other.mismatch("prompt")),
        }
    }
}

fn first_text(raw: &Value) -> Option<String> {
    raw.get("content")?
        .as_array()?
        .iter()
        .find(|item| item.get("type").and_then(Value::as_str) == Some("text"))
        .and_then(|item| item.get("text"))
        .and_then(Value::as_str)
        .map(str::to_string)
}

fn primary_value(raw: &Value) -> Value {
    if let Some(text) = first_text(raw) {
        return Value::String(text);
    }
    if let Some(structured) = raw.get("structuredContent").filter(|v| !v.is_null()) {
        return structured.clone();
    }
    raw.get("content").cloned().unwrap_or(Value::Null)
}

/// Every payload the probe can return.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Payload {
    Session(SessionInfo),
    Disconnected(PreviousSessionSummary),
    Status(SessionStatus),
    ToolList(ToolList),
    ToolCall(ToolCallOutcome),
    ResourceList(ResourceList),
    ResourceContent(ResourceContent),
    PromptList(PromptList),
    PromptRendering(PromptRendering),
}

macro_rules! impl_into_payload {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for Payload {
                fn from(value: $ty) -> Self {
                    Payload::$variant(value)
                }
            }
        )*
    };
}

impl_into_payload!(
    SessionInfo => Session,
    PreviousSessionSummary => Disconnected,
    SessionStatus => Status,
    ToolList => ToolList,
    ToolCallOutcome => ToolCall,
    ResourceList => ResourceList,
    ResourceContent => ResourceContent,
    PromptList => PromptList,
    PromptRendering => PromptRendering,
);

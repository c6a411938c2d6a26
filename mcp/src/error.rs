//! Probe error types.
//!
//! [`ClientError`] is the raw failure produced by the protocol client seam.
//! [`ErrorDescriptor`] is what callers see: a closed [`ErrorKind`], a message,
//! structured details and a suggestion derived from the kind. [`normalize`]
//! is the only place that maps one to the other.

use std::{borrow::Cow, fmt, time::Duration};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::core::operation::OperationCategory;

pub type ClientResult<T> = Result<T, ClientError>;

/// JSON-RPC codes the normalizer understands.
const INVALID_PARAMS: i32 = -32602;
const RESOURCE_NOT_FOUND: i32 = -32002;

/// Raw failure reported by the protocol client.
#[derive(Debug, Clone, Error)]
pub enum ClientError {
    /// The target answered with a JSON-RPC error object.
    #[error("{message} (code {code})")]
    Rejected {
        code: i32,
        message: String,
        data: Option<Value>,
    },

    /// The target ran the tool and flagged the result with `isError`.
    #[error("{message}")]
    ToolFailed { message: String, result: Value },

    #[error("Transport closed: {0}")]
    TransportClosed(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Request cancelled: {0}")]
    Cancelled(String),

    /// The session could not be opened (spawn, handshake, bad target).
    #[error("{0}")]
    Open(String),

    #[error("Unexpected response: {0}")]
    Unexpected(String),

    /// The client adapter panicked while serving the request.
    #[error("Protocol client panicked: {0}")]
    Panic(String),
}

impl From<rmcp::ServiceError> for ClientError {
    fn from(err: rmcp::ServiceError) -> Self {
        match err {
            rmcp::ServiceError::McpError(data) => ClientError::Rejected {
                code: data.code.0,
                message: data.message.to_string(),
                data: data.data,
            },
            rmcp::ServiceError::TransportClosed => {
                ClientError::TransportClosed("connection to target closed".to_string())
            }
            rmcp::ServiceError::Timeout { timeout } => ClientError::Timeout(timeout),
            rmcp::ServiceError::Cancelled { reason } => {
                ClientError::Cancelled(reason.unwrap_or_else(|| "no reason given".to_string()))
            }
            rmcp::ServiceError::UnexpectedResponse => {
                ClientError::Unexpected("response type did not match request".to_string())
            }
            other => ClientError::Transport(other.to_string()),
        }
    }
}

/// Closed error taxonomy. Callers branch on this, never on message text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotConnected,
    ConnectionFailed,
    ToolNotFound,
    ResourceNotFound,
    PromptNotFound,
    InvalidArguments,
    ExecutionError,
    Timeout,
    TransportError,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::NotConnected => "not_connected",
            ErrorKind::ConnectionFailed => "connection_failed",
            ErrorKind::ToolNotFound => "tool_not_found",
            ErrorKind::ResourceNotFound => "resource_not_found",
            ErrorKind::PromptNotFound => "prompt_not_found",
            ErrorKind::InvalidArguments => "invalid_arguments",
            ErrorKind::ExecutionError => "execution_error",
            ErrorKind::Timeout => "timeout",
            ErrorKind::TransportError => "transport_error",
        }
    }

    /// Next step for an automated caller. Depends on the kind alone.
    pub fn suggestion(&self) -> &'static str {
        match self {
            ErrorKind::NotConnected => "Connect to a target first with connect_to_server",
            ErrorKind::ConnectionFailed => {
                "Check that the target URL or command is correct and that the server is running"
            }
            ErrorKind::ToolNotFound => "Call list_tools to see the available tool names",
            ErrorKind::ResourceNotFound => "Call list_resources to see the available resource URIs",
            ErrorKind::PromptNotFound => "Call list_prompts to see the available prompt names",
            ErrorKind::InvalidArguments => {
                "Compare the arguments with the input schema reported by list_tools or list_prompts"
            }
            ErrorKind::ExecutionError => {
                "The target ran the operation and it failed; inspect details.error for the target's message"
            }
            ErrorKind::Timeout => {
                "The target did not answer in time; retry or raise MCP_PROBE_OPERATION_TIMEOUT / MCP_PROBE_CONNECT_TIMEOUT"
            }
            ErrorKind::TransportError => {
                "The connection to the target was lost; reconnect with connect_to_server"
            }
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured, self-contained error returned to callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorDescriptor {
    pub kind: ErrorKind,
    pub message: String,
    pub details: Map<String, Value>,
    pub suggestion: Option<String>,
}

impl ErrorDescriptor {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            details: Map::new(),
            suggestion: Some(kind.suggestion().to_string()),
        }
    }

    #[must_use]
    pub fn with_detail(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.details.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_details(mut self, details: Map<String, Value>) -> Self {
        self.details.extend(details);
        self
    }

    pub fn not_connected() -> Self {
        Self::new(ErrorKind::NotConnected, "Not connected to any MCP server")
    }
}

impl fmt::Display for ErrorDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// Where a failure happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Connect,
    Operation(OperationCategory),
}

/// Everything that can go wrong before the normalizer sees it.
#[derive(Debug, Clone)]
pub enum Failure {
    NoSession,
    /// The probe's own deadline fired; the channel itself may be fine.
    DeadlineExceeded(Duration),
    Client(ClientError),
}

impl From<ClientError> for Failure {
    fn from(err: ClientError) -> Self {
        Failure::Client(err)
    }
}

/// Context fields attached to the descriptor (target, tool name, ...).
#[derive(Debug, Clone)]
pub struct FailureContext {
    pub stage: Stage,
    pub details: Map<String, Value>,
}

impl FailureContext {
    pub fn new(stage: Stage) -> Self {
        Self {
            stage,
            details: Map::new(),
        }
    }

    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.details.insert(key.into(), value.into());
        self
    }
}

/// Map a failure to its descriptor. Pure and deterministic.
pub fn normalize(context: &FailureContext, failure: &Failure) -> ErrorDescriptor {
    let descriptor = match failure {
        Failure::NoSession => ErrorDescriptor::not_connected(),
        Failure::DeadlineExceeded(limit) => timeout_descriptor(context.stage, *limit),
        Failure::Client(err) => match context.stage {
            Stage::Connect => connect_failure(err),
            Stage::Operation(category) => operation_failure(category, err),
        },
    };
    descriptor.with_details(context.details.clone())
}

fn timeout_descriptor(stage: Stage, limit: Duration) -> ErrorDescriptor {
    let message = match stage {
        Stage::Connect => format!("Connection timed out after {:.1}s", limit.as_secs_f64()),
        Stage::Operation(category) => format!(
            "{} timed out after {:.1}s",
            category.label(),
            limit.as_secs_f64()
        ),
    };
    ErrorDescriptor::new(ErrorKind::Timeout, message).with_detail("timeoutSecs", limit.as_secs_f64())
}

fn connect_failure(err: &ClientError) -> ErrorDescriptor {
    if let ClientError::Timeout(limit) = err {
        return timeout_descriptor(Stage::Connect, *limit);
    }
    ErrorDescriptor::new(
        ErrorKind::ConnectionFailed,
        format!("Failed to connect: {}", err),
    )
    .with_detail("error", err.to_string())
}

fn operation_failure(category: OperationCategory, err: &ClientError) -> ErrorDescriptor {
    let kind = match err {
        ClientError::Timeout(limit) => {
            return timeout_descriptor(Stage::Operation(category), *limit)
                .with_detail("error", err.to_string());
        }
        ClientError::TransportClosed(_)
        | ClientError::Transport(_)
        | ClientError::Cancelled(_)
        | ClientError::Open(_) => ErrorKind::TransportError,
        ClientError::Rejected { code, message, .. } => classify_rejection(category, *code, message),
        ClientError::ToolFailed { message, .. } => classify_rejection(category, 0, message),
        ClientError::Unexpected(_) | ClientError::Panic(_) => ErrorKind::ExecutionError,
    };

    let mut descriptor = ErrorDescriptor::new(
        kind,
        format!("{} failed: {}", category.label(), err),
    )
    .with_detail("error", err.to_string());

    match err {
        ClientError::Rejected { code, data, .. } => {
            descriptor = descriptor.with_detail("errorCode", *code);
            if let Some(data) = data {
                descriptor = descriptor.with_detail("errorData", data.clone());
            }
        }
        ClientError::ToolFailed { result, .. } => {
            descriptor = descriptor.with_detail("targetResult", result.clone());
        }
        _ => {}
    }
    descriptor
}

fn classify_rejection(category: OperationCategory, code: i32, message: &str) -> ErrorKind {
    let text = message.to_lowercase();

    if let Some(not_found) = category.not_found_kind() {
        let noun = category.noun();
        let says_missing = text.contains("not found")
            || text.contains("does not exist")
            || text.contains(&format!("unknown {}", noun))
            || text.contains(&format!("no {}", noun));
        if says_missing || (code == RESOURCE_NOT_FOUND && category == OperationCategory::ResourceRead)
        {
            return not_found;
        }
    }

    if category.takes_arguments()
        && (code == INVALID_PARAMS
            || ["argument", "parameter", "validation"]
                .iter()
                .any(|word| text.contains(word)))
    {
        return ErrorKind::InvalidArguments;
    }

    ErrorKind::ExecutionError
}

/// Text of a panic payload, for [`ClientError::Panic`].
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> Cow<'static, str> {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        Cow::Borrowed(s)
    } else if let Some(s) = payload.downcast_ref::<String>() {
        Cow::Owned(s.clone())
    } else {
        Cow::Borrowed("unknown panic payload")
    }
}

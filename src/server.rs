//! MCP server surface of the probe.
//!
//! Every probe tool returns the operation envelope serialized as JSON text.
//! A failed operation still produces a tool result, with `isError` set, so
//! the caller always gets the full descriptor. Only problems with the call
//! to the probe itself (unknown tool, malformed arguments) are protocol
//! errors.

use std::sync::Arc;

use probe_mcp::{ConnectionManager, OperationResult};
use rmcp::{
    model::{
        CallToolRequestParam, CallToolResult, Content, JsonObject, ListToolsResult,
        PaginatedRequestParam, ServerCapabilities, ServerInfo, Tool,
    },
    service::RequestContext,
    ErrorData as McpError, RoleServer, ServerHandler,
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::{
    config::ServerTransport,
    llm::{self, PromptExecution},
};

pub const SERVER_NAME: &str = "mcp-probe";

const INSTRUCTIONS: &str = "Connects to one MCP server at a time and exercises it. \
Call connect_to_server first, then list and call the target's tools, resources and prompts. \
Every response is an envelope with success, payload or error, session and timing.";

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConnectArgs {
    url: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct CallToolArgs {
    name: String,
    #[serde(default)]
    arguments: Map<String, Value>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ReadResourceArgs {
    uri: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct GetPromptArgs {
    name: String,
    #[serde(default)]
    arguments: Map<String, Value>,
}

/// The probe as seen by the orchestrating caller.
#[derive(Clone)]
pub struct ProbeServer {
    manager: Arc<ConnectionManager>,
    http: reqwest::Client,
    transport: ServerTransport,
}

impl ProbeServer {
    pub fn new(manager: Arc<ConnectionManager>, transport: ServerTransport) -> Self {
        Self {
            manager,
            http: reqwest::Client::new(),
            transport,
        }
    }

    pub fn manager(&self) -> &Arc<ConnectionManager> {
        &self.manager
    }

    /// [`dispatch`](Self::dispatch), abandoned as soon as `ct` fires.
    ///
    /// The in-flight operation is dropped, so it is never counted.
    pub async fn dispatch_cancellable(
        &self,
        name: &str,
        arguments: Option<JsonObject>,
        ct: CancellationToken,
    ) -> Result<CallToolResult, McpError> {
        tokio::select! {
            result = self.dispatch(name, arguments) => result,
            _ = ct.cancelled() => {
                info!(tool = %name, "Tool call cancelled by caller");
                Err(McpError::internal_error(
                    format!("{} cancelled by caller", name),
                    None,
                ))
            }
        }
    }

    /// Route one probe tool call.
    pub async fn dispatch(
        &self,
        name: &str,
        arguments: Option<JsonObject>,
    ) -> Result<CallToolResult, McpError> {
        let arguments = arguments.unwrap_or_default();
        info!(tool = %name, "Probe tool called");
        debug!(tool = %name, arguments = %redacted(&arguments), "Probe tool arguments");

        let manager = &self.manager;
        match name {
            "connect_to_server" => {
                let args: ConnectArgs = parse_args(name, arguments)?;
                render(&manager.connect(&args.url).await.into_untyped())
            }
            "disconnect" => {
                no_args(name, &arguments)?;
                render(&manager.disconnect().await.into_untyped())
            }
            "get_connection_status" => {
                no_args(name, &arguments)?;
                render(&manager.status().await.into_untyped())
            }
            "list_tools" => {
                no_args(name, &arguments)?;
                render(&manager.list_tools().await.into_untyped())
            }
            "call_tool" => {
                let args: CallToolArgs = parse_args(name, arguments)?;
                render(
                    &manager
                        .call_tool(&args.name, args.arguments)
                        .await
                        .into_untyped(),
                )
            }
            "list_resources" => {
                no_args(name, &arguments)?;
                render(&manager.list_resources().await.into_untyped())
            }
            "read_resource" => {
                let args: ReadResourceArgs = parse_args(name, arguments)?;
                render(&manager.read_resource(&args.uri).await.into_untyped())
            }
            "list_prompts" => {
                no_args(name, &arguments)?;
                render(&manager.list_prompts().await.into_untyped())
            }
            "get_prompt" => {
                let args: GetPromptArgs = parse_args(name, arguments)?;
                render(
                    &manager
                        .get_prompt(&args.name, args.arguments)
                        .await
                        .into_untyped(),
                )
            }
            "execute_prompt_with_llm" => {
                let request: PromptExecution = parse_args(name, arguments)?;
                render(&llm::execute_prompt_with_llm(manager, &self.http, request).await)
            }
            "health_check" => Ok(CallToolResult::success(vec![Content::text(
                json!({
                    "status": "healthy",
                    "server": SERVER_NAME,
                    "version": env!("CARGO_PKG_VERSION"),
                    "transport": self.transport.to_string(),
                })
                .to_string(),
            )])),
            "ping" => Ok(CallToolResult::success(vec![Content::text("pong")])),
            other => Err(McpError::invalid_params(
                format!("Unknown tool: {}", other),
                None,
            )),
        }
    }
}

impl ServerHandler for ProbeServer {
    fn get_info(&self) -> ServerInfo {
        let mut info = ServerInfo::default();
        info.capabilities = ServerCapabilities::builder().enable_tools().build();
        info.server_info.name = SERVER_NAME.to_string();
        info.server_info.version = env!("CARGO_PKG_VERSION").to_string();
        info.instructions = Some(INSTRUCTIONS.to_string());
        info
    }

    async fn list_tools(
        &self,
        _request: Option<PaginatedRequestParam>,
        _context: RequestContext<RoleServer>,
    ) -> Result<ListToolsResult, McpError> {
        Ok(ListToolsResult::with_all_items(catalogue()))
    }

    async fn call_tool(
        &self,
        request: CallToolRequestParam,
        context: RequestContext<RoleServer>,
    ) -> Result<CallToolResult, McpError> {
        self.dispatch_cancellable(&request.name, request.arguments, context.ct)
            .await
    }
}

fn parse_args<T: DeserializeOwned>(tool: &str, arguments: JsonObject) -> Result<T, McpError> {
    serde_json::from_value(Value::Object(arguments)).map_err(|e| {
        McpError::invalid_params(format!("Invalid arguments for {}: {}", tool, e), None)
    })
}

fn no_args(tool: &str, arguments: &JsonObject) -> Result<(), McpError> {
    if arguments.is_empty() {
        return Ok(());
    }
    let unexpected: Vec<&String> = arguments.keys().collect();
    Err(McpError::invalid_params(
        format!("{} takes no arguments", tool),
        Some(json!({ "unexpected": unexpected })),
    ))
}

/// Arguments for logging, with any LLM API key masked.
fn redacted(arguments: &JsonObject) -> Value {
    let mut value = Value::Object(arguments.clone());
    if let Some(key) = value.pointer_mut("/llm_config/api_key") {
        *key = Value::String("****".to_string());
    }
    value
}

fn render<T: Serialize>(result: &OperationResult<T>) -> Result<CallToolResult, McpError> {
    let text = serde_json::to_string_pretty(result).map_err(|e| {
        McpError::internal_error(format!("Failed to serialize response: {}", e), None)
    })?;
    let content = vec![Content::text(text)];
    Ok(if result.success {
        CallToolResult::success(content)
    } else {
        CallToolResult::error(content)
    })
}

fn schema(value: Value) -> Arc<JsonObject> {
    match value {
        Value::Object(map) => Arc::new(map),
        _ => Arc::new(JsonObject::new()),
    }
}

fn no_params() -> Arc<JsonObject> {
    schema(json!({"type": "object", "properties": {}, "additionalProperties": false}))
}

/// Tools the probe exposes to its caller.
pub fn catalogue() -> Vec<Tool> {
    vec![
        Tool::new(
            "connect_to_server",
            "Connect to a target MCP server. Accepts an http(s) URL (a path ending in /sse uses \
             the legacy SSE transport) or a command line for a local stdio server. Replaces any \
             existing connection.",
            schema(json!({
                "type": "object",
                "properties": {
                    "url": {
                        "type": "string",
                        "description": "Server URL (http://..., https://...) or command line for stdio transport"
                    }
                },
                "required": ["url"],
                "additionalProperties": false
            })),
        ),
        Tool::new(
            "disconnect",
            "Close the current connection, if any, and report its statistics. Always succeeds.",
            no_params(),
        ),
        Tool::new(
            "get_connection_status",
            "Report whether a target is connected, its identity, and per-session counters.",
            no_params(),
        ),
        Tool::new(
            "list_tools",
            "List the connected target's tools with their complete input schemas.",
            no_params(),
        ),
        Tool::new(
            "call_tool",
            "Call one tool on the connected target and return its complete result.",
            schema(json!({
                "type": "object",
                "properties": {
                    "name": {"type": "string", "description": "Tool name on the target"},
                    "arguments": {"type": "object", "description": "Tool arguments", "default": {}}
                },
                "required": ["name"],
                "additionalProperties": false
            })),
        ),
        Tool::new(
            "list_resources",
            "List the connected target's resources.",
            no_params(),
        ),
        Tool::new(
            "read_resource",
            "Read one resource from the connected target by URI.",
            schema(json!({
                "type": "object",
                "properties": {
                    "uri": {"type": "string", "description": "Resource URI"}
                },
                "required": ["uri"],
                "additionalProperties": false
            })),
        ),
        Tool::new(
            "list_prompts",
            "List the connected target's prompts and their arguments.",
            no_params(),
        ),
        Tool::new(
            "get_prompt",
            "Render one prompt from the connected target.",
            schema(json!({
                "type": "object",
                "properties": {
                    "name": {"type": "string", "description": "Prompt name on the target"},
                    "arguments": {"type": "object", "description": "Prompt arguments", "default": {}}
                },
                "required": ["name"],
                "additionalProperties": false
            })),
        ),
        Tool::new(
            "execute_prompt_with_llm",
            "Render a prompt from the connected target, optionally fill {placeholders}, send it \
             to an OpenAI-compatible chat endpoint and return the reply. Endpoint settings come \
             from llm_config or LLM_URL, LLM_MODEL_NAME and LLM_API_KEY.",
            schema(json!({
                "type": "object",
                "properties": {
                    "prompt_name": {"type": "string"},
                    "prompt_arguments": {"type": "object", "default": {}},
                    "fill_variables": {"type": "object"},
                    "llm_config": {
                        "type": "object",
                        "properties": {
                            "url": {"type": "string"},
                            "model": {"type": "string"},
                            "api_key": {"type": "string"},
                            "max_tokens": {"type": "integer", "default": 1000},
                            "temperature": {"type": "number", "default": 0.7}
                        }
                    }
                },
                "required": ["prompt_name"]
            })),
        ),
        Tool::new(
            "health_check",
            "Report that the probe itself is running.",
            no_params(),
        ),
        Tool::new("ping", "Respond with 'pong'.", no_params()),
    ]
}

#[cfg(test)]
mod tests {
    use std::{
        collections::HashSet,
        sync::atomic::{AtomicBool, Ordering},
        time::Duration,
    };

    use async_trait::async_trait;
    use axum::{routing::post, Json, Router};
    use probe_mcp::{
        ClientError, ClientResult, Connector, Operation, PeerDetails, ProbeConfig, Reply, Target,
        TargetSession, ToolNameCache,
    };

    use super::*;

    /// Target with a single `review` prompt and one tool, `slow`, which
    /// answers after 500ms and flags `completed`.
    #[derive(Default)]
    struct PromptTarget {
        completed: Arc<AtomicBool>,
    }

    #[async_trait]
    impl Connector for PromptTarget {
        async fn open(
            &self,
            _target: &Target,
            _tool_names: ToolNameCache,
        ) -> ClientResult<Box<dyn TargetSession>> {
            Ok(Box::new(PromptSession {
                completed: Arc::clone(&self.completed),
            }))
        }
    }

    struct PromptSession {
        completed: Arc<AtomicBool>,
    }

    #[async_trait]
    impl TargetSession for PromptSession {
        fn peer_details(&self) -> PeerDetails {
            PeerDetails::default()
        }

        fn is_closed(&self) -> bool {
            false
        }

        async fn invoke(&self, operation: &Operation) -> ClientResult<Reply> {
            match operation {
                Operation::ListTools => Ok(Reply::Tools(Vec::new())),
                Operation::CallTool { name, .. } if name == "slow" => {
                    tokio::time::sleep(Duration::from_millis(500)).await;
                    self.completed.store(true, Ordering::SeqCst);
                    Ok(Reply::ToolCall(CallToolResult::success(vec![Content::text(
                        "done",
                    )])))
                }
                Operation::GetPrompt { name, .. } if name == "review" => {
                    Ok(Reply::Prompt(
                        serde_json::from_value(json!({
                            "messages": [
                                {"role": "user", "content": {"type": "text", "text": "Review {code}"}}
                            ]
                        }))
                        .unwrap(),
                    ))
                }
                _ => Err(ClientError::Rejected {
                    code: -32602,
                    message: "Unknown tool: nope".to_string(),
                    data: None,
                }),
            }
        }

        async fn close(&self) -> ClientResult<()> {
            Ok(())
        }
    }

    fn server_with(target: PromptTarget) -> ProbeServer {
        let manager = ConnectionManager::new(ProbeConfig::default(), Arc::new(target));
        ProbeServer::new(Arc::new(manager), ServerTransport::Stdio)
    }

    fn server() -> ProbeServer {
        server_with(PromptTarget::default())
    }

    fn args(value: Value) -> Option<JsonObject> {
        value.as_object().cloned()
    }

    fn envelope(result: &CallToolResult) -> Value {
        let raw = serde_json::to_value(result).unwrap();
        serde_json::from_str(raw["content"][0]["text"].as_str().unwrap()).unwrap()
    }

    #[test]
    fn test_catalogue() {
        let tools = catalogue();
        let names: HashSet<_> = tools.iter().map(|t| t.name.to_string()).collect();

        assert_eq!(names.len(), tools.len());
        for expected in [
            "connect_to_server",
            "disconnect",
            "get_connection_status",
            "list_tools",
            "call_tool",
            "list_resources",
            "read_resource",
            "list_prompts",
            "get_prompt",
            "execute_prompt_with_llm",
            "health_check",
            "ping",
        ] {
            assert!(names.contains(expected), "missing {}", expected);
        }
        for tool in &tools {
            assert_eq!(tool.input_schema["type"], "object");
        }
    }

    #[test]
    fn test_redacted_arguments() {
        let arguments = args(json!({
            "prompt_name": "review",
            "llm_config": {"url": "http://llm", "api_key": "sk-secret"}
        }))
        .unwrap();
        let logged = redacted(&arguments).to_string();
        assert!(!logged.contains("sk-secret"));
        assert!(logged.contains("http://llm"));
    }

    #[tokio::test]
    async fn test_unknown_tool_and_bad_arguments() {
        let server = server();

        let err = server.dispatch("format_disk", None).await.unwrap_err();
        assert_eq!(err.code.0, -32602);

        let err = server
            .dispatch("connect_to_server", args(json!({"uri": "x"})))
            .await
            .unwrap_err();
        assert!(err.message.contains("connect_to_server"));

        let err = server
            .dispatch("disconnect", args(json!({"force": true})))
            .await
            .unwrap_err();
        assert_eq!(err.code.0, -32602);
    }

    #[tokio::test]
    async fn test_status_envelope() {
        let server = server();
        let result = server.dispatch("get_connection_status", None).await.unwrap();

        assert_eq!(result.is_error, Some(false));
        let body = envelope(&result);
        assert_eq!(body["success"], true);
        assert_eq!(body["payload"]["type"], "status");
        assert_eq!(body["payload"]["connected"], false);
        assert_eq!(body.get("sessionSnapshot"), Some(&Value::Null));
        assert!(body["timing"]["durationMs"].is_number());
    }

    #[tokio::test]
    async fn test_failed_operation_sets_is_error() {
        let server = server();
        let result = server.dispatch("list_tools", None).await.unwrap();

        assert_eq!(result.is_error, Some(true));
        let body = envelope(&result);
        assert_eq!(body["success"], false);
        assert_eq!(body["error"]["kind"], "not_connected");
        assert!(body["error"]["suggestion"].is_string());
    }

    #[tokio::test]
    async fn test_connect_and_call_through_server() {
        let server = server();

        let result = server
            .dispatch("connect_to_server", args(json!({"url": "prompt-target"})))
            .await
            .unwrap();
        let body = envelope(&result);
        assert_eq!(body["success"], true);
        assert_eq!(body["payload"]["target"], "prompt-target");
        assert_eq!(body["sessionSnapshot"]["transportKind"], "local_process");

        let result = server
            .dispatch("call_tool", args(json!({"name": "nope"})))
            .await
            .unwrap();
        assert_eq!(result.is_error, Some(true));
        assert_eq!(envelope(&result)["error"]["kind"], "tool_not_found");

        let result = server.dispatch("disconnect", None).await.unwrap();
        assert_eq!(envelope(&result)["payload"]["wasConnected"], true);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_call_is_dropped_uncounted() {
        let target = PromptTarget::default();
        let completed = Arc::clone(&target.completed);
        let server = server_with(target);
        server
            .dispatch("connect_to_server", args(json!({"url": "prompt-target"})))
            .await
            .unwrap();

        let ct = CancellationToken::new();
        let call = {
            let server = server.clone();
            let ct = ct.clone();
            tokio::spawn(async move {
                server
                    .dispatch_cancellable("call_tool", args(json!({"name": "slow"})), ct)
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        ct.cancel();
        assert!(call.await.unwrap().is_err());

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(!completed.load(Ordering::SeqCst));

        let status = server.manager().status().await.payload.unwrap();
        assert!(status.connected);
        assert!(status.counters.is_zero());
    }

    #[tokio::test(start_paused = true)]
    async fn test_uncancelled_call_completes() {
        let server = server();
        server
            .dispatch("connect_to_server", args(json!({"url": "prompt-target"})))
            .await
            .unwrap();

        let result = server
            .dispatch_cancellable(
                "call_tool",
                args(json!({"name": "slow"})),
                CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(result.is_error, Some(false));
        assert_eq!(
            server.manager().counters().await.unwrap().tool_calls,
            1
        );
    }

    #[tokio::test]
    async fn test_diagnostics() {
        let server = server();

        let pong = server.dispatch("ping", None).await.unwrap();
        assert_eq!(
            serde_json::to_value(&pong).unwrap()["content"][0]["text"],
            "pong"
        );

        let health = server.dispatch("health_check", None).await.unwrap();
        let body = envelope(&health);
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["transport"], "stdio");
    }

    #[tokio::test]
    async fn test_execute_prompt_with_llm() {
        let router = Router::new().route(
            "/chat/completions",
            post(|Json(body): Json<Value>| async move {
                let prompt = body["messages"][0]["content"].as_str().unwrap_or_default();
                Json(json!({
                    "model": "mock",
                    "choices": [{"message": {"content": format!("{{\"echo\": {:?}}}", prompt)}}],
                    "usage": {"prompt_tokens": 3}
                }))
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        tokio::spawn(async move {
            let _ = axum::serve(listener, router).await;
        });

        let server = server();
        server
            .dispatch("connect_to_server", args(json!({"url": "prompt-target"})))
            .await
            .unwrap();

        let result = server
            .dispatch(
                "execute_prompt_with_llm",
                args(json!({
                    "prompt_name": "review",
                    "fill_variables": {"code": "x = 1"},
                    "llm_config": {"url": url, "model": "mock", "api_key": "sk-secret"}
                })),
            )
            .await
            .unwrap();

        let raw = serde_json::to_string(&result).unwrap();
        assert!(!raw.contains("sk-secret"));

        let body = envelope(&result);
        assert_eq!(body["success"], true, "{}", body);
        let payload = &body["payload"];
        assert_eq!(payload["prompt"]["messageCount"], 1);
        assert_eq!(payload["llmResponse"]["model"], "mock");
        assert_eq!(payload["parsedResponse"]["echo"], "Review x = 1");
        assert_eq!(payload["llmRequest"]["max_tokens"], 1000);

        let status = server.manager().status().await.payload.unwrap();
        assert_eq!(status.counters.prompts_retrieved, 1);
    }
}

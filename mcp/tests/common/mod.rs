//! Scripted in-memory target for driving `ConnectionManager` in tests.

#![allow(dead_code)]

use std::{
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use parking_lot::Mutex;
use probe_mcp::{
    error::ClientResult, ClientError, ConnectionManager, Connector, Operation, PeerCapabilities,
    PeerDetails, PeerIdentity, ProbeConfig, Reply, Target, TargetSession, ToolNameCache,
};
use serde_json::{json, Map, Value};

/// Counts shared by a connector and every session it opens.
#[derive(Debug, Default)]
pub struct Calls {
    pub opens: AtomicUsize,
    pub invocations: AtomicUsize,
    pub closes: AtomicUsize,
    pub targets: Mutex<Vec<String>>,
}

impl Calls {
    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn invocations(&self) -> usize {
        self.invocations.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

/// Opens [`ScriptedSession`]s. Targets named `hang`, `broken` and `panic`
/// misbehave during the handshake; anything else succeeds.
#[derive(Debug, Default, Clone)]
pub struct ScriptedConnector {
    pub calls: Arc<Calls>,
    /// Most recently handed-out tool cache, for simulating notifications.
    pub last_cache: Arc<Mutex<Option<ToolNameCache>>>,
}

#[async_trait]
impl Connector for ScriptedConnector {
    async fn open(
        &self,
        target: &Target,
        tool_names: ToolNameCache,
    ) -> ClientResult<Box<dyn TargetSession>> {
        self.calls.opens.fetch_add(1, Ordering::SeqCst);
        self.calls.targets.lock().push(target.as_str().to_string());

        match target.as_str() {
            "hang" => std::future::pending().await,
            "broken" => Err(ClientError::Open("spawn failed: no such file".to_string())),
            "panic" => panic!("handshake exploded"),
            _ => {
                *self.last_cache.lock() = Some(tool_names);
                Ok(Box::new(ScriptedSession {
                    calls: Arc::clone(&self.calls),
                    closed: AtomicBool::new(false),
                }))
            }
        }
    }
}

/// An echo-style target with a fixed catalogue.
///
/// Tools: `echo`, `slow` (never answers), `fail` (isError result),
/// `crash` (panics), `drop` (channel dies mid-call), `vanish` (succeeds,
/// then the channel is gone), `stall` (channel dies, call never answers).
#[derive(Debug)]
pub struct ScriptedSession {
    calls: Arc<Calls>,
    closed: AtomicBool,
}

#[async_trait]
impl TargetSession for ScriptedSession {
    fn peer_details(&self) -> PeerDetails {
        PeerDetails {
            identity: Some(PeerIdentity {
                name: "scripted-echo".to_string(),
                version: "0.1.0".to_string(),
            }),
            capabilities: PeerCapabilities {
                tools: true,
                resources: true,
                prompts: true,
            },
            protocol_version: Some("2025-03-26".to_string()),
            instructions: None,
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn invoke(&self, operation: &Operation) -> ClientResult<Reply> {
        self.calls.invocations.fetch_add(1, Ordering::SeqCst);

        match operation {
            Operation::ListTools => Ok(Reply::Tools(tools())),
            Operation::CallTool { name, arguments } => self.call(name, arguments).await,
            Operation::ListResources => Ok(Reply::Resources(from_json(json!([
                {"uri": "file:///greeting.txt", "name": "greeting", "mimeType": "text/plain"}
            ])))),
            Operation::ReadResource { uri } if uri == "file:///greeting.txt" => {
                Ok(Reply::ResourceContents(from_json(json!({
                    "contents": [
                        {"uri": "file:///greeting.txt", "mimeType": "text/plain", "text": "hello"}
                    ]
                }))))
            }
            Operation::ReadResource { uri } => Err(ClientError::Rejected {
                code: -32002,
                message: format!("Resource {} not found", uri),
                data: None,
            }),
            Operation::ListPrompts => Ok(Reply::Prompts(from_json(json!([
                {
                    "name": "greet",
                    "description": "Greet someone",
                    "arguments": [{"name": "name", "required": true}]
                }
            ])))),
            Operation::GetPrompt { name, arguments } if name == "greet" => {
                let Some(who) = arguments.get("name").and_then(Value::as_str) else {
                    return Err(ClientError::Rejected {
                        code: -32602,
                        message: "Missing required argument: name".to_string(),
                        data: None,
                    });
                };
                Ok(Reply::Prompt(from_json(json!({
                    "description": "Greet someone",
                    "messages": [
                        {"role": "user", "content": {"type": "text", "text": format!("Say hello to {}", who)}}
                    ]
                }))))
            }
            Operation::GetPrompt { name, .. } => Err(ClientError::Rejected {
                code: -32602,
                message: format!("Prompt '{}' not found", name),
                data: None,
            }),
        }
    }

    async fn close(&self) -> ClientResult<()> {
        self.calls.closes.fetch_add(1, Ordering::SeqCst);
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

impl ScriptedSession {
    async fn call(&self, name: &str, arguments: &Map<String, Value>) -> ClientResult<Reply> {
        match name {
            "echo" => {
                let message = arguments
                    .get("message")
                    .and_then(Value::as_str)
                    .ok_or_else(|| ClientError::Rejected {
                        code: -32602,
                        message: "Invalid arguments: 'message' is required".to_string(),
                        data: None,
                    })?;
                Ok(text_result(message, false))
            }
            "slow" => std::future::pending().await,
            "fail" => Ok(text_result("division by zero", true)),
            "crash" => panic!("tool handler bug"),
            "drop" => {
                self.closed.store(true, Ordering::SeqCst);
                Err(ClientError::TransportClosed("connection reset".to_string()))
            }
            "stall" => {
                self.closed.store(true, Ordering::SeqCst);
                std::future::pending().await
            }
            "vanish" => {
                self.closed.store(true, Ordering::SeqCst);
                Ok(text_result("bye", false))
            }
            other => Err(ClientError::Rejected {
                code: -32602,
                message: format!("Unknown tool: {}", other),
                data: None,
            }),
        }
    }
}

pub fn tools() -> Vec<rmcp::model::Tool> {
    from_json(json!([
        {
            "name": "echo",
            "description": "Echo a message back",
            "inputSchema": {
                "type": "object",
                "properties": {"message": {"type": "string"}},
                "required": ["message"]
            }
        },
        {
            "name": "slow",
            "description": "Never finishes",
            "inputSchema": {"type": "object"}
        }
    ]))
}

fn text_result(text: &str, is_error: bool) -> Reply {
    Reply::ToolCall(from_json(json!({
        "content": [{"type": "text", "text": text}],
        "isError": is_error
    })))
}

fn from_json<T: serde::de::DeserializeOwned>(value: Value) -> T {
    serde_json::from_value(value).unwrap()
}

pub fn args(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        other => panic!("expected object, got {}", other),
    }
}

pub fn manager_with(config: ProbeConfig) -> (ConnectionManager, ScriptedConnector) {
    let connector = ScriptedConnector::default();
    let manager = ConnectionManager::new(config, Arc::new(connector.clone()));
    (manager, connector)
}

pub fn manager() -> (ConnectionManager, ScriptedConnector) {
    manager_with(ProbeConfig::default().with_connect_timeout(Duration::from_secs(5)))
}

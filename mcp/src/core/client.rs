//! Protocol client seam.
//!
//! The manager only talks to a target through [`Connector`] and
//! [`TargetSession`]. [`RmcpConnector`] is the production implementation;
//! tests substitute scripted ones.

use std::{borrow::Cow, time::Duration};

use async_trait::async_trait;
use rmcp::{
    model::{
        CallToolRequestParam, GetPromptRequestParam, ReadResourceRequestParam, ServerInfo,
    },
    service::RunningService,
    transport::{
        sse_client::SseClientConfig, streamable_http_client::StreamableHttpClientTransportConfig,
        ConfigureCommandExt, SseClientTransport, StreamableHttpClientTransport, TokioChildProcess,
    },
    Peer, RoleClient, ServiceExt,
};
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::{
    config::{Endpoint, Target, TransportKind},
    handler::ProbeClientHandler,
    operation::{Operation, Reply},
    session::{PeerCapabilities, PeerIdentity, ToolNameCache},
};
use crate::error::{ClientError, ClientResult};

/// What the target told us about itself during the handshake.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerDetails {
    pub identity: Option<PeerIdentity>,
    pub capabilities: PeerCapabilities,
    pub protocol_version: Option<String>,
    pub instructions: Option<String>,
}

impl PeerDetails {
    pub fn from_server_info(info: &ServerInfo) -> Self {
        let name = info.server_info.name.trim();
        let identity = (!name.is_empty()).then(|| PeerIdentity {
            name: name.to_string(),
            version: info.server_info.version.clone(),
        });
        let protocol_version = serde_json::to_value(&info.protocol_version)
            .ok()
            .and_then(|v| v.as_str().map(str::to_string));

        Self {
            identity,
            capabilities: PeerCapabilities {
                tools: info.capabilities.tools.is_some(),
                resources: info.capabilities.resources.is_some(),
                prompts: info.capabilities.prompts.is_some(),
            },
            protocol_version,
            instructions: info.instructions.clone(),
        }
    }
}

/// Opens sessions to targets.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a session and complete the handshake.
    ///
    /// `tool_names` is handed to whatever receives target notifications so a
    /// tool-list change can invalidate it.
    async fn open(
        &self,
        target: &Target,
        tool_names: ToolNameCache,
    ) -> ClientResult<Box<dyn TargetSession>>;
}

/// One open session to a target.
#[async_trait]
pub trait TargetSession: Send + Sync {
    fn peer_details(&self) -> PeerDetails;

    /// True once the underlying channel is known to be gone.
    fn is_closed(&self) -> bool;

    /// Perform exactly one request. Never retries.
    async fn invoke(&self, operation: &Operation) -> ClientResult<Reply>;

    /// Release the session. Calling it again is a no-op.
    async fn close(&self) -> ClientResult<()>;
}

type ProbeClient = RunningService<RoleClient, ProbeClientHandler>;

/// Connector backed by `rmcp`.
#[derive(Debug, Clone)]
pub struct RmcpConnector {
    http_connect_timeout: Duration,
}

impl Default for RmcpConnector {
    fn default() -> Self {
        Self {
            http_connect_timeout: Duration::from_secs(10),
        }
    }
}

impl RmcpConnector {
    pub fn new() -> Self {
        Self::default()
    }

    fn http_client(&self) -> ClientResult<reqwest::Client> {
        reqwest::Client::builder()
            .connect_timeout(self.http_connect_timeout)
            .build()
            .map_err(|e| ClientError::Open(format!("build HTTP client: {}", e)))
    }

    async fn serve(&self, target: &Target, handler: ProbeClientHandler) -> ClientResult<ProbeClient> {
        match target.endpoint() {
            Endpoint::Process { command, args } => {
                let transport = TokioChildProcess::new(
                    tokio::process::Command::new(command).configure(|cmd| {
                        cmd.args(args).stderr(std::process::Stdio::inherit());
                    }),
                )
                .map_err(|e| ClientError::Open(format!("spawn '{}': {}", command, e)))?;

                handler
                    .serve(transport)
                    .await
                    .map_err(|e| ClientError::Open(format!("initialize stdio client: {}", e)))
            }

            Endpoint::Url(url) if target.kind() == TransportKind::RemoteSse => {
                let sse_config = SseClientConfig {
                    sse_endpoint: url.as_str().to_string().into(),
                    ..Default::default()
                };
                let transport =
                    SseClientTransport::start_with_client(self.http_client()?, sse_config)
                        .await
                        .map_err(|e| ClientError::Open(format!("create SSE transport: {}", e)))?;

                handler
                    .serve(transport)
                    .await
                    .map_err(|e| ClientError::Open(format!("initialize SSE client: {}", e)))
            }

            Endpoint::Url(url) => {
                let cfg = StreamableHttpClientTransportConfig::with_uri(url.as_str());
                let transport = StreamableHttpClientTransport::with_client(self.http_client()?, cfg);

                handler
                    .serve(transport)
                    .await
                    .map_err(|e| ClientError::Open(format!("initialize streamable client: {}", e)))
            }
        }
    }
}

#[async_trait]
impl Connector for RmcpConnector {
    async fn open(
        &self,
        target: &Target,
        tool_names: ToolNameCache,
    ) -> ClientResult<Box<dyn TargetSession>> {
        let handler = ProbeClientHandler::new(target.as_str(), tool_names);
        let client = self.serve(target, handler).await?;

        let details = client
            .peer_info()
            .map(PeerDetails::from_server_info)
            .unwrap_or_default();
        info!(
            target_server = %target,
            transport = %target.kind(),
            peer = ?details.identity,
            "Connected to target"
        );

        Ok(Box::new(RmcpSession {
            peer: client.peer().clone(),
            details,
            service: Mutex::new(Some(client)),
        }))
    }
}

struct RmcpSession {
    peer: Peer<RoleClient>,
    details: PeerDetails,
    service: Mutex<Option<ProbeClient>>,
}

#[async_trait]
impl TargetSession for RmcpSession {
    fn peer_details(&self) -> PeerDetails {
        self.details.clone()
    }

    fn is_closed(&self) -> bool {
        self.peer.is_transport_closed()
    }

    async fn invoke(&self, operation: &Operation) -> ClientResult<Reply> {
        let reply = match operation {
            Operation::ListTools => Reply::Tools(self.peer.list_all_tools().await?),
            Operation::CallTool { name, arguments } => {
                let request = CallToolRequestParam {
                    name: Cow::Owned(name.clone()),
                    arguments: Some(arguments.clone()),
                };
                Reply::ToolCall(self.peer.call_tool(request).await?)
            }
            Operation::ListResources => Reply::Resources(self.peer.list_all_resources().await?),
            Operation::ReadResource { uri } => {
                let request = ReadResourceRequestParam { uri: uri.clone() };
                Reply::ResourceContents(self.peer.read_resource(request).await?)
            }
            Operation::ListPrompts => Reply::Prompts(self.peer.list_all_prompts().await?),
            Operation::GetPrompt { name, arguments } => {
                let request = GetPromptRequestParam {
                    name: name.clone(),
                    arguments: Some(arguments.clone()),
                };
                Reply::Prompt(self.peer.get_prompt(request).await?)
            }
        };
        Ok(reply)
    }

    async fn close(&self) -> ClientResult<()> {
        let Some(service) = self.service.lock().await.take() else {
            return Ok(());
        };
        match service.cancel().await {
            Ok(reason) => {
                debug!(reason = ?reason, "Target session closed");
                Ok(())
            }
            Err(e) => Err(ClientError::Transport(format!("close session: {}", e))),
        }
    }
}

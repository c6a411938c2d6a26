//! Client handler for target sessions.
//!
//! Implements RMCP's `ClientHandler` trait to handle:
//! - Client identity sent during the handshake
//! - Tool/resource/prompt list change notifications
//! - Progress and logging notifications

use std::sync::Arc;

use rmcp::{
    model::{
        CancelledNotificationParam, ClientInfo, LoggingLevel, LoggingMessageNotificationParam,
        ProgressNotificationParam, ResourceUpdatedNotificationParam,
    },
    service::NotificationContext,
    ClientHandler, RoleClient,
};
use tracing::{debug, error, info, warn};

use super::session::ToolNameCache;

pub const CLIENT_NAME: &str = "mcp-probe";

#[derive(Clone)]
pub struct ProbeClientHandler {
    target: Arc<str>,
    tool_names: ToolNameCache,
    client_info: ClientInfo,
}

impl ProbeClientHandler {
    pub fn new(target: impl AsRef<str>, tool_names: ToolNameCache) -> Self {
        let mut client_info = ClientInfo::default();
        client_info.client_info.name = CLIENT_NAME.to_string();
        client_info.client_info.version = env!("CARGO_PKG_VERSION").to_string();

        Self {
            target: Arc::from(target.as_ref()),
            tool_names,
            client_info,
        }
    }

    pub fn target(&self) -> &str {
        &self.target
    }
}

impl ClientHandler for ProbeClientHandler {
    async fn on_cancelled(
        &self,
        params: CancelledNotificationParam,
        _context: NotificationContext<RoleClient>,
    ) {
        info!(
            target_server = %self.target,
            request_id = %params.request_id,
            reason = ?params.reason,
            "Target cancelled request"
        );
    }

    async fn on_progress(
        &self,
        params: ProgressNotificationParam,
        _context: NotificationContext<RoleClient>,
    ) {
        debug!(
            target_server = %self.target,
            token = ?params.progress_token,
            progress = %params.progress,
            total = ?params.total,
            message = ?params.message,
            "Target progress"
        );
    }

    async fn on_resource_updated(
        &self,
        params: ResourceUpdatedNotificationParam,
        _context: NotificationContext<RoleClient>,
    ) {
        info!(target_server = %self.target, uri = %params.uri, "Target resource updated");
    }

    async fn on_resource_list_changed(&self, _context: NotificationContext<RoleClient>) {
        info!(target_server = %self.target, "Target resource list changed");
    }

    async fn on_tool_list_changed(&self, _context: NotificationContext<RoleClient>) {
        info!(target_server = %self.target, "Target tool list changed");
        self.tool_names.invalidate();
    }

    async fn on_prompt_list_changed(&self, _context: NotificationContext<RoleClient>) {
        info!(target_server = %self.target, "Target prompt list changed");
    }

    fn get_info(&self) -> ClientInfo {
        self.client_info.clone()
    }

    async fn on_logging_message(
        &self,
        params: LoggingMessageNotificationParam,
        _context: NotificationContext<RoleClient>,
    ) {
        let logger = params.logger.as_deref().unwrap_or("mcp");

        match params.level {
            LoggingLevel::Emergency | LoggingLevel::Alert | LoggingLevel::Critical => {
                error!(
                    target_server = %self.target,
                    logger = %logger,
                    level = ?params.level,
                    "Target: {}",
                    params.data
                );
            }
            LoggingLevel::Error => {
                error!(target_server = %self.target, logger = %logger, "Target: {}", params.data);
            }
            LoggingLevel::Warning => {
                warn!(target_server = %self.target, logger = %logger, "Target: {}", params.data);
            }
            LoggingLevel::Notice | LoggingLevel::Info => {
                info!(target_server = %self.target, logger = %logger, "Target: {}", params.data);
            }
            LoggingLevel::Debug => {
                debug!(target_server = %self.target, logger = %logger, "Target: {}", params.data);
            }
        }
    }
}

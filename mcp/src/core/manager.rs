//! Connection lifecycle and operation proxy.
//!
//! [`ConnectionManager`] owns the single session slot. `connect` and
//! `disconnect` hold the slot exclusively for their whole duration, protocol
//! call included. Proxied operations only read the slot to pick up the
//! session, run the request without holding the lock, then take it
//! exclusively again to record the outcome against that same session.

use std::{
    ops::{Deref, DerefMut},
    panic::AssertUnwindSafe,
    sync::Arc,
};

use futures::FutureExt;
use serde_json::{Map, Value};
use tokio::sync::{RwLock, RwLockWriteGuard};
use tracing::{debug, info, warn};

use super::{
    client::{Connector, RmcpConnector, TargetSession},
    config::{ProbeConfig, Target},
    metrics::CounterSnapshot,
    operation::{
        Operation, OperationCategory, PromptList, PromptRendering, Reply, ResourceContent,
        ResourceList, ToolCallOutcome, ToolList,
    },
    session::{
        LifecycleState, PreviousSessionSummary, Session, SessionInfo, SessionStatus,
        ToolNameCache,
    },
};
use crate::{
    envelope::{OperationResult, Stopwatch},
    error::{
        normalize, panic_message, ClientError, ClientResult, ErrorKind, Failure, FailureContext,
        Stage,
    },
};

#[derive(Debug, Default)]
struct Slot {
    state: LifecycleState,
    session: Option<Arc<Session>>,
}

/// Exclusive access to the slot.
///
/// If the holder is dropped midway through a transition, the slot falls
/// back to `Idle` unless a session is installed.
struct SlotGuard<'a>(RwLockWriteGuard<'a, Slot>);

impl Deref for SlotGuard<'_> {
    type Target = Slot;

    fn deref(&self) -> &Slot {
        &self.0
    }
}

impl DerefMut for SlotGuard<'_> {
    fn deref_mut(&mut self) -> &mut Slot {
        &mut self.0
    }
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        if self.0.session.is_none() {
            self.0.state = LifecycleState::Idle;
        }
    }
}

pub struct ConnectionManager {
    connector: Arc<dyn Connector>,
    config: ProbeConfig,
    slot: RwLock<Slot>,
}

impl ConnectionManager {
    pub fn new(config: ProbeConfig, connector: Arc<dyn Connector>) -> Self {
        Self {
            connector,
            config,
            slot: RwLock::new(Slot::default()),
        }
    }

    /// Manager that reaches targets through `rmcp`.
    pub fn with_rmcp(config: ProbeConfig) -> Self {
        Self::new(config, Arc::new(RmcpConnector::new()))
    }

    pub fn config(&self) -> &ProbeConfig {
        &self.config
    }

    async fn lock_exclusive(&self) -> SlotGuard<'_> {
        SlotGuard(self.slot.write().await)
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Connect to `target`, first tearing down any live session.
    pub async fn connect(&self, target: &str) -> OperationResult<SessionInfo> {
        let stopwatch = Stopwatch::start();
        let mut slot = self.lock_exclusive().await;

        let replaced = if slot.session.is_some() {
            let summary = self.teardown(&mut slot, "superseded by connect").await;
            Some(summary)
        } else {
            None
        };

        let mut context = FailureContext::new(Stage::Connect).with("target", target.trim());
        if let Some(summary) = &replaced {
            if let Ok(value) = serde_json::to_value(summary) {
                context = context.with("previousSessionTeardown", value);
            }
        }

        let parsed = match Target::parse(target) {
            Ok(parsed) => parsed,
            Err(err) => {
                let descriptor = normalize(&context, &Failure::Client(err));
                warn!(target_server = %target, error = %descriptor, "Rejected target");
                return OperationResult::failed(descriptor, None, &stopwatch);
            }
        };
        context = context.with("transportKind", parsed.kind().to_string());

        slot.state = LifecycleState::Connecting;
        info!(
            target_server = %parsed,
            transport = %parsed.kind(),
            timeout_secs = self.config.connect_timeout.as_secs_f64(),
            "Connecting to target"
        );

        let tool_names = ToolNameCache::new();
        let open = AssertUnwindSafe(self.connector.open(&parsed, tool_names.clone())).catch_unwind();
        let failure = match tokio::time::timeout(self.config.connect_timeout, open).await {
            Ok(Ok(Ok(client))) => {
                let session = Arc::new(Session::new(
                    parsed.as_str().to_string(),
                    parsed.kind(),
                    Arc::from(client),
                    tool_names,
                ));
                let snapshot = session.snapshot();
                let mut info = session.info();
                info.replaced_session = replaced;

                slot.session = Some(session);
                slot.state = LifecycleState::Connected;
                info!(
                    target_server = %parsed,
                    session_id = %info.session_id,
                    duration_ms = stopwatch.stop().duration_ms,
                    "Target session established"
                );
                return OperationResult::ok(info, Some(snapshot), &stopwatch);
            }
            Ok(Ok(Err(err))) => Failure::Client(err),
            Ok(Err(panic)) => Failure::Client(ClientError::Panic(panic_message(&*panic).into_owned())),
            Err(_) => Failure::DeadlineExceeded(self.config.connect_timeout),
        };

        slot.state = LifecycleState::Idle;
        let descriptor = normalize(&context, &failure);
        warn!(target_server = %parsed, error = %descriptor, "Failed to connect to target");
        OperationResult::failed(descriptor, None, &stopwatch)
    }

    /// Release the live session. Succeeds with `wasConnected: false` when idle.
    pub async fn disconnect(&self) -> OperationResult<PreviousSessionSummary> {
        let stopwatch = Stopwatch::start();
        let mut slot = self.lock_exclusive().await;

        let Some(snapshot) = slot.session.as_ref().map(|s| s.snapshot()) else {
            debug!("Disconnect requested with no live session");
            return OperationResult::ok(PreviousSessionSummary::not_connected(), None, &stopwatch);
        };

        let summary = self.teardown(&mut slot, "disconnect requested").await;
        OperationResult::ok(summary, Some(snapshot), &stopwatch)
    }

    /// Current lifecycle state, session identity and counters. Read-only.
    pub async fn status(&self) -> OperationResult<SessionStatus> {
        let stopwatch = Stopwatch::start();
        let slot = self.slot.read().await;

        let session = slot.session.as_ref();
        let status = SessionStatus {
            connected: slot.state == LifecycleState::Connected && session.is_some(),
            lifecycle: slot.state,
            session: session.map(|s| s.info()),
            counters: session
                .map(|s| s.counters().snapshot())
                .unwrap_or_default(),
            connected_for_secs: session.map(|s| s.connected_for_secs()),
        };
        OperationResult::ok(status, session.map(|s| s.snapshot()), &stopwatch)
    }

    /// Convenience accessor for the live session's counters.
    pub async fn counters(&self) -> Option<CounterSnapshot> {
        let slot = self.slot.read().await;
        slot.session.as_ref().map(|s| s.counters().snapshot())
    }

    /// Tear down the installed session. The caller holds the slot.
    async fn teardown(&self, slot: &mut SlotGuard<'_>, reason: &str) -> PreviousSessionSummary {
        let Some(session) = slot.session.take() else {
            return PreviousSessionSummary::not_connected();
        };
        slot.state = LifecycleState::Disconnecting;
        info!(
            target_server = %session.target(),
            session_id = %session.id(),
            reason = %reason,
            "Closing target session"
        );

        // Close on its own task; an abandoned caller must not cancel it.
        let client = session.client();
        let close = tokio::spawn(async move { client.close().await });
        let teardown_error = match tokio::time::timeout(self.config.connect_timeout, close).await {
            Ok(Ok(Ok(()))) => None,
            Ok(Ok(Err(err))) => Some(err.to_string()),
            Ok(Err(join_err)) if join_err.is_panic() => Some(format!(
                "close panicked: {}",
                panic_message(&*join_err.into_panic())
            )),
            Ok(Err(join_err)) => Some(format!("close aborted: {}", join_err)),
            Err(_) => Some(format!(
                "close timed out after {:.1}s",
                self.config.connect_timeout.as_secs_f64()
            )),
        };
        if let Some(err) = &teardown_error {
            warn!(target_server = %session.target(), error = %err, "Target session teardown failed");
        }

        slot.state = LifecycleState::Idle;
        session.summary(teardown_error)
    }

    // ========================================================================
    // Proxied operations
    // ========================================================================

    pub async fn list_tools(&self) -> OperationResult<ToolList> {
        self.execute(Operation::ListTools, |reply, session| {
            let list = ToolList::from_reply(reply)?;
            session.tool_names().remember(list.names());
            Ok(list)
        })
        .await
    }

    pub async fn call_tool(
        &self,
        name: &str,
        arguments: Map<String, Value>,
    ) -> OperationResult<ToolCallOutcome> {
        let operation = Operation::CallTool {
            name: name.to_string(),
            arguments: arguments.clone(),
        };
        self.execute(operation, |reply, _| {
            ToolCallOutcome::from_reply(reply, name, &arguments)
        })
        .await
    }

    pub async fn list_resources(&self) -> OperationResult<ResourceList> {
        self.execute(Operation::ListResources, |reply, _| {
            ResourceList::from_reply(reply)
        })
        .await
    }

    pub async fn read_resource(&self, uri: &str) -> OperationResult<ResourceContent> {
        let operation = Operation::ReadResource {
            uri: uri.to_string(),
        };
        self.execute(operation, |reply, _| ResourceContent::from_reply(reply, uri))
            .await
    }

    pub async fn list_prompts(&self) -> OperationResult<PromptList> {
        self.execute(Operation::ListPrompts, |reply, _| PromptList::from_reply(reply))
            .await
    }

    pub async fn get_prompt(
        &self,
        name: &str,
        arguments: Map<String, Value>,
    ) -> OperationResult<PromptRendering> {
        let operation = Operation::GetPrompt {
            name: name.to_string(),
            arguments: arguments.clone(),
        };
        self.execute(operation, |reply, _| {
            PromptRendering::from_reply(reply, name, &arguments)
        })
        .await
    }

    /// Shared template for the six proxied operations.
    async fn execute<T, F>(&self, operation: Operation, build: F) -> OperationResult<T>
    where
        F: FnOnce(Reply, &Session) -> ClientResult<T>,
    {
        let stopwatch = Stopwatch::start();
        let category = operation.category();
        let context = FailureContext {
            stage: Stage::Operation(category),
            details: operation.context_details(),
        };

        let session = {
            let slot = self.slot.read().await;
            match (slot.state, &slot.session) {
                (LifecycleState::Connected, Some(session)) => Some(Arc::clone(session)),
                _ => None,
            }
        };
        let Some(session) = session else {
            debug!(operation = category.label(), "Rejected: not connected");
            return OperationResult::failed(
                normalize(&context, &Failure::NoSession),
                None,
                &stopwatch,
            );
        };
        let snapshot = session.snapshot();
        let client = session.client();

        let result = if client.is_closed() {
            Err(Failure::Client(ClientError::TransportClosed(
                "connection to target was lost".to_string(),
            )))
        } else {
            self.invoke(client.as_ref(), &operation)
                .await
                .and_then(|reply| build(reply, &session).map_err(Failure::from))
        };

        let channel_lost = match &result {
            Err(Failure::Client(ClientError::TransportClosed(_) | ClientError::Transport(_))) => {
                true
            }
            Err(_) => client.is_closed(),
            Ok(_) => false,
        };
        // A deadline that reveals a dead channel is a transport failure.
        let result = match result {
            Err(Failure::DeadlineExceeded(_)) if channel_lost => Err(Failure::Client(
                ClientError::TransportClosed("connection to target was lost".to_string()),
            )),
            other => other,
        };

        self.settle(&session, category, result.is_ok(), channel_lost)
            .await;

        match result {
            Ok(payload) => {
                debug!(
                    operation = category.label(),
                    duration_ms = stopwatch.stop().duration_ms,
                    "Operation succeeded"
                );
                OperationResult::ok(payload, Some(snapshot), &stopwatch)
            }
            Err(failure) => {
                let mut descriptor = normalize(&context, &failure);
                if descriptor.kind == ErrorKind::ToolNotFound {
                    if let Some(names) = session.tool_names().known() {
                        descriptor = descriptor.with_detail("availableHint", names);
                    }
                }
                warn!(
                    operation = category.label(),
                    kind = %descriptor.kind,
                    error = %descriptor.message,
                    "Operation failed"
                );
                OperationResult::failed(descriptor, Some(snapshot), &stopwatch)
            }
        }
    }

    /// One bounded attempt. Panics in the client become failures.
    async fn invoke(
        &self,
        client: &dyn TargetSession,
        operation: &Operation,
    ) -> Result<Reply, Failure> {
        let call = AssertUnwindSafe(client.invoke(operation)).catch_unwind();
        match tokio::time::timeout(self.config.operation_timeout, call).await {
            Ok(Ok(Ok(reply))) => Ok(reply),
            Ok(Ok(Err(err))) => Err(Failure::Client(err)),
            Ok(Err(panic)) => Err(Failure::Client(ClientError::Panic(
                panic_message(&*panic).into_owned(),
            ))),
            Err(_) => Err(Failure::DeadlineExceeded(self.config.operation_timeout)),
        }
    }

    /// Record a completed operation against the session it ran on.
    ///
    /// Nothing is recorded if that session has since been replaced or closed.
    async fn settle(
        &self,
        session: &Arc<Session>,
        category: OperationCategory,
        success: bool,
        channel_lost: bool,
    ) {
        let mut slot = self.lock_exclusive().await;
        let current = slot
            .session
            .as_ref()
            .is_some_and(|live| live.id() == session.id());
        if !current {
            debug!(
                operation = category.label(),
                session_id = %session.id(),
                "Session ended while operation was in flight"
            );
            return;
        }

        session.counters().record(category, success);
        if channel_lost {
            warn!(target_server = %session.target(), "Connection to target lost");
            self.teardown(&mut slot, "transport failure").await;
        }
    }
}

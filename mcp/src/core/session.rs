//! Session state and the read-only views handed to callers.
//!
//! [`Session`] is the single live connection owned by the
//! [`ConnectionManager`](super::manager::ConnectionManager). Everything else in
//! this module is a serializable copy taken from it at some instant.

use std::{collections::BTreeSet, fmt, sync::Arc};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{
    client::{PeerDetails, TargetSession},
    config::TransportKind,
    metrics::{CounterSnapshot, SessionCounters},
};

/// Lifecycle of the session slot.
///
/// `Idle -> Connecting -> Connected -> Disconnecting -> Idle`, plus
/// `Connecting -> Idle` on failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    #[default]
    Idle,
    Connecting,
    Connected,
    Disconnecting,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LifecycleState::Idle => "idle",
            LifecycleState::Connecting => "connecting",
            LifecycleState::Connected => "connected",
            LifecycleState::Disconnecting => "disconnecting",
        };
        f.write_str(s)
    }
}

/// Name and version the target reported during the handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerIdentity {
    pub name: String,
    pub version: String,
}

/// Which capability groups the target advertised.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerCapabilities {
    pub tools: bool,
    pub resources: bool,
    pub prompts: bool,
}

/// Identity fields of a session, copied at the start of an operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub session_id: Uuid,
    pub target: String,
    pub transport_kind: TransportKind,
    pub established_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub peer: Option<PeerIdentity>,
}

/// Returned by a successful connect.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub session_id: Uuid,
    pub target: String,
    pub transport_kind: TransportKind,
    pub established_at: DateTime<Utc>,
    pub peer: Option<PeerIdentity>,
    pub capabilities: PeerCapabilities,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub protocol_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
    /// Summary of the session this connect superseded, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replaced_session: Option<PreviousSessionSummary>,
}

/// Returned by `status()`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatus {
    pub connected: bool,
    pub lifecycle: LifecycleState,
    pub session: Option<SessionInfo>,
    pub counters: CounterSnapshot,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connected_for_secs: Option<f64>,
}

/// Returned by `disconnect()`; also recorded when a connect supersedes a session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreviousSessionSummary {
    pub was_connected: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transport_kind: Option<TransportKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_secs: Option<f64>,
    pub counters: CounterSnapshot,
    /// Set when releasing the target failed; the session is gone regardless.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub teardown_error: Option<String>,
}

impl PreviousSessionSummary {
    pub fn not_connected() -> Self {
        Self::default()
    }
}

/// The live connection.
///
/// Identity fields never change after construction; only the counters and
/// the tool-name cache do.
pub struct Session {
    id: Uuid,
    target: String,
    transport_kind: TransportKind,
    established_at: DateTime<Utc>,
    peer: PeerDetails,
    client: Arc<dyn TargetSession>,
    counters: SessionCounters,
    tool_names: ToolNameCache,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("target", &self.target)
            .field("transport_kind", &self.transport_kind)
            .field("established_at", &self.established_at)
            .finish_non_exhaustive()
    }
}

impl Session {
    pub(crate) fn new(
        target: String,
        transport_kind: TransportKind,
        client: Arc<dyn TargetSession>,
        tool_names: ToolNameCache,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            peer: client.peer_details(),
            target,
            transport_kind,
            established_at: Utc::now(),
            client,
            counters: SessionCounters::new(),
            tool_names,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub(crate) fn client(&self) -> Arc<dyn TargetSession> {
        Arc::clone(&self.client)
    }

    pub(crate) fn counters(&self) -> &SessionCounters {
        &self.counters
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            session_id: self.id,
            target: self.target.clone(),
            transport_kind: self.transport_kind,
            established_at: self.established_at,
            peer: self.peer.identity.clone(),
        }
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            session_id: self.id,
            target: self.target.clone(),
            transport_kind: self.transport_kind,
            established_at: self.established_at,
            peer: self.peer.identity.clone(),
            capabilities: self.peer.capabilities,
            protocol_version: self.peer.protocol_version.clone(),
            instructions: self.peer.instructions.clone(),
            replaced_session: None,
        }
    }

    pub fn connected_for_secs(&self) -> f64 {
        let elapsed = Utc::now() - self.established_at;
        elapsed.num_milliseconds().max(0) as f64 / 1000.0
    }

    /// Final summary, taken just before the session is released.
    pub(crate) fn summary(&self, teardown_error: Option<String>) -> PreviousSessionSummary {
        PreviousSessionSummary {
            was_connected: true,
            target: Some(self.target.clone()),
            transport_kind: Some(self.transport_kind),
            duration_secs: Some(self.connected_for_secs()),
            counters: self.counters.snapshot(),
            teardown_error,
        }
    }

    pub(crate) fn tool_names(&self) -> &ToolNameCache {
        &self.tool_names
    }
}

/// Tool names from the last successful listing.
///
/// Shared with the client handler so a `tools/list_changed` notification
/// can drop it.
#[derive(Debug, Clone, Default)]
pub struct ToolNameCache {
    names: Arc<RwLock<Option<BTreeSet<String>>>>,
}

impl ToolNameCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn remember(&self, names: impl IntoIterator<Item = String>) {
        *self.names.write() = Some(names.into_iter().collect());
    }

    pub fn invalidate(&self) {
        *self.names.write() = None;
    }

    /// Sorted names, or `None` if nothing is cached.
    pub fn known(&self) -> Option<Vec<String>> {
        self.names
            .read()
            .as_ref()
            .map(|names| names.iter().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_lifecycle_default_is_idle() {
        assert_eq!(LifecycleState::default(), LifecycleState::Idle);
        assert_eq!(LifecycleState::Disconnecting.to_string(), "disconnecting");
        assert_eq!(
            serde_json::to_value(LifecycleState::Connected).unwrap(),
            json!("connected")
        );
    }

    #[test]
    fn test_not_connected_summary() {
        let summary = PreviousSessionSummary::not_connected();
        let value = serde_json::to_value(&summary).unwrap();
        assert_eq!(value["wasConnected"], false);
        assert!(value.get("target").is_none());
        assert_eq!(value["counters"]["toolCalls"], 0);
    }

    #[test]
    fn test_tool_name_cache() {
        let cache = ToolNameCache::new();
        assert!(cache.known().is_none());

        cache.remember(vec!["echo".to_string(), "add".to_string()]);
        let shared = cache.clone();
        assert_eq!(shared.known().unwrap(), vec!["add", "echo"]);

        shared.invalidate();
        assert!(cache.known().is_none());
    }

    #[test]
    fn test_snapshot_omits_unknown_peer() {
        let snapshot = SessionSnapshot {
            session_id: Uuid::nil(),
            target: "python server.py".into(),
            transport_kind: TransportKind::LocalProcess,
            established_at: Utc::now(),
            peer: None,
        };
        let value = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(value["transportKind"], "local_process");
        assert!(value.get("peer").is_none());
    }
}

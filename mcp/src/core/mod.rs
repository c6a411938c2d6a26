//! Core probe infrastructure.

pub mod client;
pub mod config;
pub mod handler;
pub mod manager;
pub mod metrics;
pub mod operation;
pub mod session;

pub use client::{Connector, PeerDetails, RmcpConnector, TargetSession};
pub use config::{Endpoint, ProbeConfig, Target, TransportKind};
pub use handler::ProbeClientHandler;
pub use manager::ConnectionManager;
pub use metrics::{CounterSnapshot, SessionCounters};
pub use operation::{
    Operation, OperationCategory, Payload, PromptList, PromptRendering, Reply, ResourceContent,
    ResourceList, ToolCallOutcome, ToolList,
};
pub use session::{
    LifecycleState, PeerCapabilities, PeerIdentity, PreviousSessionSummary, SessionInfo,
    SessionSnapshot, SessionStatus, ToolNameCache,
};

//! Single-session MCP client used to verify other MCP servers.
//!
//! ## Modules
//!
//! - [`core`]: connection lifecycle, operation proxy, protocol client seam
//! - [`error`]: error taxonomy and the failure normalizer
//! - [`envelope`]: the response envelope every operation returns
//!
//! Every public operation on [`ConnectionManager`] returns an
//! [`OperationResult`]; none of them return `Err` or panic.

pub mod core;
pub mod envelope;
pub mod error;

// Backward-compatible module paths
pub use core::{config, manager};
// Re-export from core
pub use core::{
    ConnectionManager, Connector, CounterSnapshot, LifecycleState, Operation, OperationCategory,
    Payload, PeerCapabilities, PeerDetails, PeerIdentity, PreviousSessionSummary, ProbeConfig,
    PromptList, PromptRendering, Reply, ResourceContent, ResourceList, RmcpConnector, SessionInfo,
    SessionSnapshot, SessionStatus, Target, TargetSession, ToolCallOutcome, ToolList,
    ToolNameCache, TransportKind,
};
pub use envelope::{OperationResult, Stopwatch, Timing};
pub use error::{ClientError, ClientResult, ErrorDescriptor, ErrorKind};

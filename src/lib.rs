//! `mcp-probe`: an MCP server that connects to other MCP servers and
//! exercises them on behalf of its caller.
//!
//! The session handling lives in the `probe-mcp` crate; this crate adds the
//! server surface, the LLM prompt helper and process setup.

pub mod config;
pub mod llm;
pub mod logging;
pub mod server;

pub use config::{Cli, ServerConfig, ServerTransport};
pub use server::ProbeServer;

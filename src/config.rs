//! Server configuration.
//!
//! Precedence is CLI flag, then environment variable, then default. The
//! probe's own timeouts come from [`ProbeConfig::from_env`].

use std::fmt;

use clap::{Parser, ValueEnum};
use probe_mcp::ProbeConfig;
use tracing::warn;

use crate::logging::LogFormat;

pub const PORT_ENV: &str = "MCP_PROBE_PORT";
pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 8000;

/// Transport the probe itself is served over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum ServerTransport {
    /// Standard input/output, for desktop and CLI clients
    #[default]
    Stdio,
    /// Streamable HTTP, mounted at `/mcp`
    StreamableHttp,
}

impl fmt::Display for ServerTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerTransport::Stdio => f.write_str("stdio"),
            ServerTransport::StreamableHttp => f.write_str("streamable-http"),
        }
    }
}

/// MCP server that connects to, inspects, and exercises other MCP servers
#[derive(Debug, Parser)]
#[command(name = "mcp-probe", version, about, long_about = None)]
pub struct Cli {
    /// Transport protocol to serve on
    #[arg(short, long, env = "MCP_PROBE_TRANSPORT", value_enum, default_value_t = ServerTransport::Stdio)]
    pub transport: ServerTransport,

    /// Host to bind for HTTP transports
    #[arg(short = 'H', long, env = "MCP_PROBE_HOST", default_value = DEFAULT_HOST)]
    pub host: String,

    /// Port to bind for HTTP transports [env: MCP_PROBE_PORT] [default: 8000]
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Log filter, e.g. `debug` or `probe_mcp=trace` (overrides RUST_LOG)
    #[arg(long, env = "MCP_PROBE_LOG_LEVEL")]
    pub log_level: Option<String>,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Json)]
    pub log_format: LogFormat,
}

/// Fully resolved runtime configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerConfig {
    pub transport: ServerTransport,
    pub host: String,
    pub port: u16,
    pub probe: ProbeConfig,
}

impl ServerConfig {
    pub fn resolve(cli: &Cli) -> Self {
        Self {
            transport: cli.transport,
            host: cli.host.clone(),
            port: resolve_port(cli.port),
            probe: ProbeConfig::from_env(),
        }
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// CLI port, else `MCP_PROBE_PORT`, else the default. A bad env value is
/// logged and ignored.
pub fn resolve_port(cli: Option<u16>) -> u16 {
    if let Some(port) = cli {
        return port;
    }
    match std::env::var(PORT_ENV) {
        Ok(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!(
                var = PORT_ENV,
                value = %raw,
                default = DEFAULT_PORT,
                "Invalid port, using default"
            );
            DEFAULT_PORT
        }),
        Err(_) => DEFAULT_PORT,
    }
}

//! Probe configuration and target parsing.
//!
//! [`ProbeConfig`] carries the two timeouts the core honors. [`Target`] turns
//! the caller's opaque target string into something the connector can open.

use std::{fmt, time::Duration};

use serde::{Deserialize, Serialize};
use tracing::warn;
use url::Url;

use crate::error::{ClientError, ClientResult};

pub const CONNECT_TIMEOUT_ENV: &str = "MCP_PROBE_CONNECT_TIMEOUT";
pub const OPERATION_TIMEOUT_ENV: &str = "MCP_PROBE_OPERATION_TIMEOUT";

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(60);

/// Timeouts applied by the connection manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeConfig {
    /// Bound on opening a session, handshake included.
    pub connect_timeout: Duration,
    /// Bound on each proxied operation.
    pub operation_timeout: Duration,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            operation_timeout: DEFAULT_OPERATION_TIMEOUT,
        }
    }
}

impl ProbeConfig {
    /// Read both timeouts from the environment (seconds, fractional allowed).
    ///
    /// Missing values use the defaults; invalid ones are logged and ignored.
    pub fn from_env() -> Self {
        Self {
            connect_timeout: timeout_from_env(CONNECT_TIMEOUT_ENV, DEFAULT_CONNECT_TIMEOUT),
            operation_timeout: timeout_from_env(OPERATION_TIMEOUT_ENV, DEFAULT_OPERATION_TIMEOUT),
        }
    }

    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }
}

fn timeout_from_env(var: &str, default: Duration) -> Duration {
    let Ok(raw) = std::env::var(var) else {
        return default;
    };
    match parse_secs(&raw) {
        Some(timeout) => timeout,
        None => {
            warn!(
                var = %var,
                value = %raw,
                default_secs = default.as_secs_f64(),
                "Invalid timeout, using default"
            );
            default
        }
    }
}

fn parse_secs(raw: &str) -> Option<Duration> {
    let secs: f64 = raw.trim().parse().ok()?;
    if !secs.is_finite() || secs <= 0.0 {
        return None;
    }
    Duration::try_from_secs_f64(secs).ok()
}

/// How the probe reaches a target, inferred from the target string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// Streamable HTTP endpoint.
    RemoteStreaming,
    /// Legacy server-sent-events endpoint (URL path ends in `/sse`).
    RemoteSse,
    /// Child process speaking over stdio.
    LocalProcess,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TransportKind::RemoteStreaming => "remote_streaming",
            TransportKind::RemoteSse => "remote_sse",
            TransportKind::LocalProcess => "local_process",
        };
        f.write_str(s)
    }
}

/// Where the connector should go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Url(Url),
    Process { command: String, args: Vec<String> },
}

/// A parsed target string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    raw: String,
    kind: TransportKind,
    endpoint: Endpoint,
}

impl Target {
    pub fn parse(raw: &str) -> ClientResult<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(ClientError::Open("target is empty".to_string()));
        }

        let lower = trimmed.to_ascii_lowercase();
        if lower.starts_with("http://") || lower.starts_with("https://") {
            let url = Url::parse(trimmed)
                .map_err(|e| ClientError::Open(format!("invalid target URL '{}': {}", trimmed, e)))?;
            let kind = if url.path().trim_end_matches('/').ends_with("/sse") {
                TransportKind::RemoteSse
            } else {
                TransportKind::RemoteStreaming
            };
            return Ok(Self {
                raw: trimmed.to_string(),
                kind,
                endpoint: Endpoint::Url(url),
            });
        }

        let mut words = split_command(trimmed)?;
        if words.first().map_or(true, |w| w.is_empty()) {
            return Err(ClientError::Open(format!("no command in target '{}'", trimmed)));
        }
        let first = words.remove(0);
        let (command, args) = match interpreter_for(&first) {
            Some(interpreter) => {
                words.insert(0, first);
                (interpreter.to_string(), words)
            }
            None => (first, words),
        };

        Ok(Self {
            raw: trimmed.to_string(),
            kind: TransportKind::LocalProcess,
            endpoint: Endpoint::Process { command, args },
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

fn interpreter_for(program: &str) -> Option<&'static str> {
    let lower = program.to_ascii_lowercase();
    if lower.ends_with(".py") {
        Some("python")
    } else if lower.ends_with(".js") || lower.ends_with(".mjs") {
        Some("node")
    } else {
        None
    }
}

/// Split a command line into words, honoring single and double quotes and
/// backslash escapes outside single quotes.
fn split_command(input: &str) -> ClientResult<Vec<String>> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut quote: Option<char> = None;
    let mut chars = input.chars();

    while let Some(c) = chars.next() {
        match (quote, c) {
            (Some('\''), '\'') | (Some('"'), '"') => quote = None,
            (Some('"'), '\\') | (None, '\\') => {
                if let Some(next) = chars.next() {
                    current.push(next);
                }
                in_word = true;
            }
            (Some(_), c) => current.push(c),
            (None, '\'' | '"') => {
                quote = Some(c);
                in_word = true;
            }
            (None, c) if c.is_whitespace() => {
                if in_word {
                    words.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            (None, c) => {
                current.push(c);
                in_word = true;
            }
        }
    }

    if quote.is_some() {
        return Err(ClientError::Open(format!(
            "unterminated quote in target '{}'",
            input
        )));
    }
    if in_word {
        words.push(current);
    }
    Ok(words)
}

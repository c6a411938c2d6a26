use std::sync::Arc;

use anyhow::Context as _;
use axum::Router;
use clap::Parser;
use mcp_probe::{logging, Cli, ProbeServer, ServerConfig, ServerTransport};
use probe_mcp::ConnectionManager;
use rmcp::{
    transport::{
        stdio,
        streamable_http_server::{session::local::LocalSessionManager, StreamableHttpService},
    },
    ServiceExt,
};
use tracing::{debug, info};

const MCP_PATH: &str = "/mcp";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Before parsing so `.env` values can feed clap's env fallbacks.
    let dotenv = dotenvy::dotenv().ok();
    let cli = Cli::parse();
    logging::init(cli.log_level.as_deref(), cli.log_format)?;
    if let Some(path) = dotenv {
        debug!(path = %path.display(), "Loaded .env file");
    }

    let config = ServerConfig::resolve(&cli);
    info!(
        transport = %config.transport,
        connect_timeout_secs = config.probe.connect_timeout.as_secs_f64(),
        operation_timeout_secs = config.probe.operation_timeout.as_secs_f64(),
        version = env!("CARGO_PKG_VERSION"),
        "Starting mcp-probe"
    );

    let manager = Arc::new(ConnectionManager::with_rmcp(config.probe));
    let server = ProbeServer::new(Arc::clone(&manager), config.transport);

    let served = match config.transport {
        ServerTransport::Stdio => serve_stdio(server).await,
        ServerTransport::StreamableHttp => serve_http(&config, server).await,
    };

    if let Some(summary) = manager.disconnect().await.payload {
        if summary.was_connected {
            info!(
                target_server = summary.target.as_deref().unwrap_or_default(),
                duration_secs = summary.duration_secs.unwrap_or_default(),
                "Closed target session on shutdown"
            );
        }
    }
    info!("mcp-probe stopped");
    served
}

async fn serve_stdio(server: ProbeServer) -> anyhow::Result<()> {
    info!("Serving MCP over stdio");
    let service = server
        .serve(stdio())
        .await
        .context("start stdio transport")?;

    tokio::select! {
        quit = service.waiting() => {
            let reason = quit.context("stdio transport")?;
            info!(reason = ?reason, "Client closed stdio transport");
        }
        _ = shutdown_signal() => {}
    }
    Ok(())
}

async fn serve_http(config: &ServerConfig, server: ProbeServer) -> anyhow::Result<()> {
    let service = StreamableHttpService::new(
        move || Ok(server.clone()),
        LocalSessionManager::default().into(),
        Default::default(),
    );
    let app = Router::new().nest_service(MCP_PATH, service);

    let addr = config.bind_addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("bind {}", addr))?;
    info!(addr = %addr, path = MCP_PATH, "Serving MCP over streamable HTTP");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serve http")?;
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("Shutdown signal received");
}

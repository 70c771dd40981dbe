//! TaskRelay Server.
//!
//! Serves the task lifecycle as MCP tools over Streamable HTTP, together
//! with `/health` and `/metrics`.

mod config;
mod executor;
mod http;
mod mcp;

use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use taskrelay_engine::{spawn_sweeper, InMemoryMetrics, TaskEngine};

use config::Args;
use executor::CommandExecutor;
use http::HttpState;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("taskrelay=info".parse()?))
        .with_target(true)
        .init();

    let http_addr: SocketAddr = args.http_addr.parse()?;
    let config = args.engine_config();

    info!(
        failure_threshold = config.breaker.failure_threshold,
        reset_timeout_ms = config.breaker.reset_timeout.as_millis() as u64,
        execution_timeout_ms = config.coalescer.timeout.as_millis() as u64,
        max_delegation_depth = config.max_delegation_depth,
        "Starting TaskRelay server"
    );

    let executor = CommandExecutor::new(args.engine_commands());
    for (engine, command) in args.engine_commands() {
        info!(engine = %engine, program = %command.program, "Engine command override");
    }

    let counters = Arc::new(InMemoryMetrics::new());
    let engine = Arc::new(TaskEngine::with_metrics(
        config,
        Arc::new(executor),
        counters.clone(),
    ));

    let sweeper = spawn_sweeper(engine.clone(), args.sweep_interval());

    let ct = CancellationToken::new();
    let router = http::create_router(HttpState {
        engine: engine.clone(),
        counters,
    })
    .merge(mcp::create_mcp_router(engine, ct.clone()));

    let listener = TcpListener::bind(http_addr).await?;
    info!("HTTP server listening on {} (MCP at /mcp)", http_addr);

    let shutdown = ct.clone();
    let result = axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => info!("Shutdown signal received"),
                _ = shutdown.cancelled() => {}
            }
        })
        .await;

    ct.cancel();
    sweeper.abort();

    if let Err(e) = result {
        error!(error = %e, "HTTP server error");
        return Err(e.into());
    }

    info!("TaskRelay server stopped");
    Ok(())
}

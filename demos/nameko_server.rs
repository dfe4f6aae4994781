//! Nameko-compatible service over RabbitMQ.
//!
//! Serves the `articles` service; Nameko clients (or `nameko_client`) can
//! call `articles.health_check`, `articles.get_foo` and
//! `articles.get_article`.
//!
//! Run with: cargo run --example nameko_server
//!
//! Requires: RabbitMQ on localhost:5672, or `AMQP_URI` / `RABBIT_*` set.
//!
//! Note: For Docker/production deployments, also handle SIGTERM:
//! ```ignore
//! use tokio::signal::unix::{signal, SignalKind};
//! signal(SignalKind::terminate()).unwrap().recv().await;
//! ```
mod common;

use nameko_rpc::{RpcConfig, RpcServer};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = RpcConfig::from_env("articles")?;
    let server = RpcServer::connect(&config).await?;

    // Setup signal handling for graceful shutdown
    let server_clone = server.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to listen for Ctrl+C");
        println!("Received Ctrl+C, shutting down...");
        server_clone.shutdown().await.expect("shutdown failed");
    });

    // Blocks until shutdown() is called and running handlers finish
    server.serve(common::base_service()).await?;

    Ok(())
}

//! Client and server in one process on the in-memory broker.
//!
//! Run with: cargo run --example nameko_memory
mod common;

use std::time::Instant;

use nameko_rpc::{RequestEnvelope, Result, RpcClient, RpcConfig, RpcServer};

#[tokio::main]
async fn main() -> Result<()> {
    // ---
    tracing_subscriber::fmt::init();

    let server = RpcServer::connect(&RpcConfig::memory("articles")).await?;
    let running = server.clone();
    let serving = tokio::spawn(async move { running.serve(common::base_service()).await });

    let client = RpcClient::connect(&RpcConfig::memory("web")).await?;

    let started = Instant::now();
    let mut calls = Vec::new();
    for id in 0..10u64 {
        let client = client.clone();
        calls.push(tokio::spawn(async move {
            client
                .call(
                    "articles",
                    "get_article",
                    RequestEnvelope::new().with_arg(id),
                )
                .await
        }));
    }
    for call in calls {
        match call.await {
            Ok(result) => println!("{}", result?),
            Err(err) => eprintln!("caller failed: {err}"),
        }
    }
    println!("10 calls in {:?}", started.elapsed());

    client.close().await?;
    server.shutdown().await?;
    match serving.await {
        Ok(result) => result,
        Err(err) => {
            eprintln!("server task failed: {err}");
            Ok(())
        }
    }
}

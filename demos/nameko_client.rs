//! Calls the `articles` service over RabbitMQ.
//!
//! Works against `nameko_server` or a Python Nameko service of the same
//! name.
//!
//! Run with: cargo run --example nameko_client
//!
//! Requires: RabbitMQ on localhost:5672, or `AMQP_URI` / `RABBIT_*` set.

use std::time::Duration;

use anyhow::Result;
use nameko_rpc::{json, RequestEnvelope, RpcClient, RpcConfig, RpcError};

#[tokio::main]
async fn main() -> Result<()> {
    // ---
    tracing_subscriber::fmt::init();

    let config = RpcConfig::from_env("web")?.with_request_timeout(Duration::from_secs(5));
    let client = RpcClient::connect(&config).await?;

    let health = client
        .call("articles", "health_check", RequestEnvelope::new())
        .await?;
    println!("health_check -> {health}");

    let foo = client
        .call(
            "articles",
            "get_foo",
            RequestEnvelope::new().with_arg("abc123"),
        )
        .await?;
    println!("get_foo -> {foo}");

    let article = client
        .call(
            "articles",
            "get_article",
            RequestEnvelope::new().with_kwarg("id", 7),
        )
        .await?;
    println!("get_article(id=7) -> {article}");

    // Remote failures come back as structured errors.
    match client
        .call("articles", "get_article", RequestEnvelope::new())
        .await
    {
        Err(RpcError::Remote(err)) => println!("get_article() -> {err}"),
        other => println!("get_article() -> unexpected {other:?}"),
    }

    assert_eq!(foo, json!("foo"));
    client.close().await?;
    Ok(())
}
